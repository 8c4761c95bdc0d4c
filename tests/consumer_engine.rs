//! Consumer engine scenarios against the stub broker.

mod common;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use common::{StubBroker, StubConnector};
use openwire_cms::codec::WireFormatOptions;
use openwire_cms::commands::{AckType, Destination, Message};
use openwire_cms::config::ConnectionOptions;
use openwire_cms::connection::Connection;
use openwire_cms::error::CmsResult;
use openwire_cms::factory::ConnectionFactory;
use openwire_cms::policy::RedeliveryPolicy;
use openwire_cms::producer::SendOptions;
use openwire_cms::session::AckMode;

async fn connect(broker: &Arc<StubBroker>, options: ConnectionOptions) -> Connection {
    let factory = ConnectionFactory::new(
        "loopback://stub",
        options,
        StubConnector::new(broker.clone()),
    )
    .expect("factory");
    let connection = factory.create_connection().await.expect("connect");
    connection.start().expect("start");
    connection
}

fn broker() -> Arc<StubBroker> {
    StubBroker::new(WireFormatOptions::default())
}

#[test_log::test(tokio::test)]
async fn zero_prefetch_consumer_pulls_one_message_at_a_time() {
    let broker = broker();
    let connection = connect(&broker, ConnectionOptions::default()).await;
    let session = connection.create_session(AckMode::Auto).await.unwrap();

    let queue = Destination::queue("pull.queue?consumer.prefetchSize=0");
    let consumer = session.create_consumer(&queue).await.unwrap();

    let producer = session
        .create_producer(Some(&Destination::queue("pull.queue")))
        .await
        .unwrap();
    producer.send(Message::text("hello")).await.unwrap();

    let received = consumer
        .receive_timeout(Duration::from_millis(1_000))
        .await
        .unwrap();
    assert_eq!(received.and_then(|m| m.body_text().map(String::from)), Some("hello".to_string()));

    // Nothing else queued: the timed pull comes back empty at the deadline.
    let start = Instant::now();
    let nothing = consumer
        .receive_timeout(Duration::from_millis(300))
        .await
        .unwrap();
    assert!(nothing.is_none());
    assert!(start.elapsed() >= Duration::from_millis(250));

    connection.close().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn client_ack_mode_coalesces_into_one_consumed_ack() {
    let broker = broker();
    let connection = connect(&broker, ConnectionOptions::default()).await;
    let session = connection.create_session(AckMode::Client).await.unwrap();

    let queue = Destination::queue("coalesce.queue?consumer.prefetchSize=10");
    let consumer = session.create_consumer(&queue).await.unwrap();
    let producer = session
        .create_producer(Some(&Destination::queue("coalesce.queue")))
        .await
        .unwrap();

    for i in 0..10 {
        producer.send(Message::text(format!("m{i}"))).await.unwrap();
    }
    let mut received = Vec::new();
    for _ in 0..10 {
        let message = consumer
            .receive_timeout(Duration::from_secs(2))
            .await
            .unwrap()
            .expect("message within window");
        received.push(message);
    }

    session.acknowledge().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let consumed: Vec<_> = broker
        .recorded_acks()
        .into_iter()
        .filter(|ack| ack.ack_type == AckType::Consumed)
        .collect();
    assert_eq!(consumed.len(), 1, "exactly one coalesced CONSUMED ack");
    let ack = &consumed[0];
    assert_eq!(ack.message_count, 10);
    assert_eq!(
        ack.first_message_id.as_ref(),
        received[0].message_id.as_ref()
    );
    assert_eq!(
        ack.last_message_id.as_ref(),
        received[9].message_id.as_ref()
    );

    connection.close().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn redelivery_cap_poisons_the_message() {
    let broker = broker();
    let options = ConnectionOptions {
        redelivery_policy: RedeliveryPolicy {
            maximum_redeliveries: 2,
            initial_redelivery_delay: 0,
            ..RedeliveryPolicy::default()
        },
        ..ConnectionOptions::default()
    };
    let connection = connect(&broker, options).await;

    let queue = Destination::queue("poison.queue");
    let send_session = connection.create_session(AckMode::Auto).await.unwrap();
    let producer = send_session.create_producer(Some(&queue)).await.unwrap();
    producer.send(Message::text("X")).await.unwrap();

    let session = connection.create_session(AckMode::Transacted).await.unwrap();
    let consumer = session.create_consumer(&queue).await.unwrap();

    for attempt in 0..3 {
        let message = consumer
            .receive_timeout(Duration::from_secs(2))
            .await
            .unwrap()
            .unwrap_or_else(|| panic!("attempt {attempt}: message should redeliver"));
        assert_eq!(message.body_text(), Some("X"));
        assert_eq!(message.redelivery_counter, attempt);
        session.rollback().await.unwrap();
    }

    // The cap was two redeliveries; the third rollback poisons the range.
    let nothing = consumer
        .receive_timeout(Duration::from_millis(300))
        .await
        .unwrap();
    assert!(nothing.is_none(), "poisoned message must not re-enqueue");

    let acks = broker.recorded_acks();
    let poisons: Vec<_> = acks
        .iter()
        .filter(|ack| ack.ack_type == AckType::Poison)
        .collect();
    assert_eq!(poisons.len(), 1);
    assert_eq!(poisons[0].message_count, 1);
    assert!(
        acks.iter().any(|ack| ack.ack_type == AckType::Redelivered),
        "rollbacks after the first redelivery send a REDELIVERED ack"
    );

    connection.close().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn expired_messages_are_skipped_and_settled() {
    let broker = broker();
    let connection = connect(&broker, ConnectionOptions::default()).await;
    let session = connection.create_session(AckMode::Auto).await.unwrap();

    let queue = Destination::queue("expiry.queue");
    let producer = session.create_producer(Some(&queue)).await.unwrap();
    producer
        .send_with(
            &queue,
            Message::text("E"),
            SendOptions {
                time_to_live_ms: 1,
                ..SendOptions::default()
            },
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;

    let consumer = session.create_consumer(&queue).await.unwrap();
    let nothing = consumer
        .receive_timeout(Duration::from_millis(300))
        .await
        .unwrap();
    assert!(nothing.is_none(), "expired messages never reach the user");

    let acks = broker.recorded_acks();
    let delivered = acks.iter().any(|ack| ack.ack_type == AckType::Delivered);
    let consumed = acks.iter().any(|ack| ack.ack_type == AckType::Consumed);
    assert!(
        delivered && consumed,
        "an expired message settles with a DELIVERED+CONSUMED pair, saw {acks:?}"
    );

    connection.close().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn listener_observes_messages_in_broker_order() {
    let broker = broker();
    let connection = connect(&broker, ConnectionOptions::default()).await;
    let session = connection.create_session(AckMode::Auto).await.unwrap();

    let queue = Destination::queue("listener.queue");
    let consumer = session.create_consumer(&queue).await.unwrap();

    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    consumer
        .set_message_listener(Some(Arc::new(move |message: Message| -> CmsResult<()> {
            if let Some(text) = message.body_text() {
                sink.lock().unwrap().push(text.to_string());
            }
            Ok(())
        })))
        .await
        .unwrap();

    let producer = session.create_producer(Some(&queue)).await.unwrap();
    for i in 0..5 {
        producer.send(Message::text(format!("m{i}"))).await.unwrap();
    }

    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if seen.lock().unwrap().len() == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("listener should observe all five messages");

    assert_eq!(
        *seen.lock().unwrap(),
        vec!["m0", "m1", "m2", "m3", "m4"],
        "callbacks observe broker-assigned order"
    );

    connection.close().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn stopped_connections_queue_without_delivering() {
    let broker = broker();
    let connection = connect(&broker, ConnectionOptions::default()).await;
    let session = connection.create_session(AckMode::Auto).await.unwrap();

    let queue = Destination::queue("gated.queue");
    let consumer = session.create_consumer(&queue).await.unwrap();
    let producer = session.create_producer(Some(&queue)).await.unwrap();

    connection.stop().unwrap();
    producer.send(Message::text("held")).await.unwrap();

    let nothing = consumer
        .receive_timeout(Duration::from_millis(200))
        .await
        .unwrap();
    assert!(nothing.is_none(), "stopped connections do not deliver");

    connection.start().unwrap();
    let message = consumer
        .receive_timeout(Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(
        message.and_then(|m| m.body_text().map(String::from)),
        Some("held".to_string())
    );

    connection.close().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn listener_with_zero_prefetch_is_rejected() {
    let broker = broker();
    let connection = connect(&broker, ConnectionOptions::default()).await;
    let session = connection.create_session(AckMode::Auto).await.unwrap();

    let queue = Destination::queue("strict.queue?consumer.prefetchSize=0");
    let consumer = session.create_consumer(&queue).await.unwrap();

    let result = consumer
        .set_message_listener(Some(Arc::new(|_message: Message| -> CmsResult<()> {
            Ok(())
        })))
        .await;
    assert!(matches!(
        result,
        Err(openwire_cms::error::CmsError::IllegalState { .. })
    ));

    connection.close().await.unwrap();
}
