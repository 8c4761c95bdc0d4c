//! Connection and resource lifecycle against the stub broker.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{StubBroker, StubConnector};
use openwire_cms::codec::WireFormatOptions;
use openwire_cms::commands::{Destination, Message};
use openwire_cms::config::ConnectionOptions;
use openwire_cms::connection::Connection;
use openwire_cms::error::CmsError;
use openwire_cms::factory::ConnectionFactory;
use openwire_cms::session::AckMode;

async fn connect(broker: &Arc<StubBroker>) -> Connection {
    let factory = ConnectionFactory::new(
        "loopback://stub",
        ConnectionOptions::default(),
        StubConnector::new(broker.clone()),
    )
    .expect("factory");
    let connection = factory.create_connection().await.expect("connect");
    connection.start().expect("start");
    connection
}

#[tokio::test]
async fn close_is_idempotent_and_poisons_further_use() {
    let broker = StubBroker::new(WireFormatOptions::default());
    let connection = connect(&broker).await;
    let session = connection.create_session(AckMode::Auto).await.unwrap();

    connection.close().await.unwrap();
    connection.close().await.unwrap();

    assert!(matches!(
        connection.start(),
        Err(CmsError::AlreadyClosed { .. })
    ));
    assert!(matches!(
        connection.create_session(AckMode::Auto).await,
        Err(CmsError::AlreadyClosed { .. })
    ));
    assert!(matches!(
        session.create_producer(None).await,
        Err(CmsError::AlreadyClosed { .. })
    ));
}

#[tokio::test]
async fn destroying_a_destination_with_consumers_is_refused() {
    let broker = StubBroker::new(WireFormatOptions::default());
    let connection = connect(&broker).await;
    let session = connection.create_session(AckMode::Auto).await.unwrap();

    let queue = Destination::queue("doomed.queue");
    let consumer = session.create_consumer(&queue).await.unwrap();

    let refused = connection.destroy_destination(&queue).await;
    assert!(matches!(refused, Err(CmsError::DestinationInUse { .. })));

    consumer.close().await.unwrap();
    connection.destroy_destination(&queue).await.unwrap();

    connection.close().await.unwrap();
}

#[tokio::test]
async fn temporary_destinations_are_connection_scoped() {
    let broker = StubBroker::new(WireFormatOptions::default());
    let connection = connect(&broker).await;
    let session = connection.create_session(AckMode::Auto).await.unwrap();

    let temp_queue = session.create_temporary_queue().await.unwrap();
    assert!(temp_queue.is_temporary());
    assert!(
        temp_queue
            .physical_name()
            .starts_with(connection.connection_id().value()),
        "temporary names are scoped to their connection"
    );

    let temp_topic = session.create_temporary_topic().await.unwrap();
    assert!(temp_topic.is_topic() && temp_topic.is_temporary());
    assert_ne!(temp_queue.physical_name(), temp_topic.physical_name());

    // Usable like any other destination.
    let producer = session.create_producer(Some(&temp_queue)).await.unwrap();
    let consumer = session.create_consumer(&temp_queue).await.unwrap();
    producer.send(Message::text("scratch")).await.unwrap();
    let received = consumer
        .receive_timeout(Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(
        received.and_then(|m| m.body_text().map(String::from)),
        Some("scratch".to_string())
    );

    connection.close().await.unwrap();
}

#[tokio::test]
async fn broker_info_is_surfaced_after_connect() {
    let broker = StubBroker::new(WireFormatOptions::default());
    let connection = connect(&broker).await;

    // The stub does not announce itself; absence is a valid state.
    assert!(connection.broker_info().is_none());
    connection.close().await.unwrap();
}

#[tokio::test]
async fn closed_consumers_report_no_message() {
    let broker = StubBroker::new(WireFormatOptions::default());
    let connection = connect(&broker).await;
    let session = connection.create_session(AckMode::Auto).await.unwrap();

    let queue = Destination::queue("closing.queue");
    let consumer = session.create_consumer(&queue).await.unwrap();

    let waiting = {
        let consumer = consumer.clone();
        tokio::spawn(async move { consumer.receive().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    consumer.close().await.unwrap();
    let outcome = tokio::time::timeout(Duration::from_secs(1), waiting)
        .await
        .expect("blocked receiver must wake on close")
        .unwrap();
    assert!(matches!(outcome, Ok(None)));

    // Receives after close report closure.
    assert!(matches!(
        consumer.receive_no_wait().await,
        Err(CmsError::AlreadyClosed { .. })
    ));

    connection.close().await.unwrap();
}

#[tokio::test]
async fn listener_errors_reach_the_exception_listener() {
    let broker = StubBroker::new(WireFormatOptions::default());
    let connection = connect(&broker).await;

    let failures: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = failures.clone();
    connection.set_exception_listener(Arc::new(move |err| {
        sink.lock().unwrap().push(err.to_string());
    }));

    let session = connection.create_session(AckMode::Auto).await.unwrap();
    let queue = Destination::queue("faulty.queue");
    let consumer = session.create_consumer(&queue).await.unwrap();
    consumer
        .set_message_listener(Some(Arc::new(
            |_message: Message| -> openwire_cms::error::CmsResult<()> {
                Err(CmsError::illegal_state("listener exploded"))
            },
        )))
        .await
        .unwrap();

    let producer = session.create_producer(Some(&queue)).await.unwrap();
    producer.send(Message::text("boom")).await.unwrap();
    producer.send(Message::text("still flowing")).await.unwrap();

    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if failures.lock().unwrap().len() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("listener failures are forwarded and dispatch continues");

    connection.close().await.unwrap();
}

#[tokio::test]
async fn durable_subscriptions_can_be_dropped() {
    let broker = StubBroker::new(WireFormatOptions::default());
    let connection = connect(&broker).await;
    let session = connection.create_session(AckMode::Auto).await.unwrap();

    let topic = Destination::topic("audit.events");
    let durable = session
        .create_durable_consumer(&topic, "audit-feed", None, false)
        .await
        .unwrap();
    durable.close().await.unwrap();
    session.unsubscribe("audit-feed").await.unwrap();

    // Durable subscriptions are topic-only.
    let queue = Destination::queue("not.a.topic");
    assert!(matches!(
        session
            .create_durable_consumer(&queue, "nope", None, false)
            .await,
        Err(CmsError::InvalidArgument { .. })
    ));

    connection.close().await.unwrap();
}
