//! Transacted session behavior against the stub broker.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{StubBroker, StubConnector};
use openwire_cms::codec::WireFormatOptions;
use openwire_cms::commands::{AckType, Command, Destination, Message, TransactionType};
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
async fn rolled_back_sends_never_reach_the_queue() {
    let broker = StubBroker::new(WireFormatOptions::default());
    let connection = connect(&broker).await;

    let queue = Destination::queue("txn.queue");
    let session = connection.create_session(AckMode::Transacted).await.unwrap();
    let producer = session.create_producer(Some(&queue)).await.unwrap();

    producer.send(Message::text("A")).await.unwrap();
    session.commit().await.unwrap();

    producer.send(Message::text("B")).await.unwrap();
    session.rollback().await.unwrap();

    producer.send(Message::text("C")).await.unwrap();
    session.commit().await.unwrap();

    // An independent transacted session consumes what survived.
    let consume_session = connection.create_session(AckMode::Transacted).await.unwrap();
    let consumer = consume_session.create_consumer(&queue).await.unwrap();

    let first = consumer
        .receive_timeout(Duration::from_secs(2))
        .await
        .unwrap()
        .expect("first committed message");
    consume_session.commit().await.unwrap();
    assert_eq!(first.body_text(), Some("A"));

    let second = consumer
        .receive_timeout(Duration::from_secs(2))
        .await
        .unwrap()
        .expect("second committed message");
    consume_session.commit().await.unwrap();
    assert_eq!(second.body_text(), Some("C"));

    let nothing = consumer
        .receive_timeout(Duration::from_millis(300))
        .await
        .unwrap();
    assert!(nothing.is_none(), "B was rolled back and must never arrive");

    connection.close().await.unwrap();
}

#[tokio::test]
async fn consumed_acks_stay_inside_the_transaction() {
    let broker = StubBroker::new(WireFormatOptions::default());
    let connection = connect(&broker).await;

    let queue = Destination::queue("txn.window.queue");
    let send_session = connection.create_session(AckMode::Auto).await.unwrap();
    let producer = send_session.create_producer(Some(&queue)).await.unwrap();
    producer.send(Message::text("inside")).await.unwrap();

    let session = connection.create_session(AckMode::Transacted).await.unwrap();
    let consumer = session.create_consumer(&queue).await.unwrap();
    let message = consumer
        .receive_timeout(Duration::from_secs(2))
        .await
        .unwrap()
        .expect("message");
    assert_eq!(message.body_text(), Some("inside"));

    tokio::time::sleep(Duration::from_millis(50)).await;
    let before_commit = broker.recorded_acks();
    assert!(
        !before_commit
            .iter()
            .any(|ack| ack.ack_type == AckType::Consumed),
        "no CONSUMED ack may leave the client before commit"
    );

    session.commit().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let after_commit = broker.recorded_acks();
    let consumed: Vec<_> = after_commit
        .iter()
        .filter(|ack| ack.ack_type == AckType::Consumed)
        .collect();
    assert_eq!(consumed.len(), 1);
    assert!(
        consumed[0].transaction_id.is_some(),
        "the commit-time ack carries the transaction id"
    );

    connection.close().await.unwrap();
}

#[tokio::test]
async fn empty_commit_is_a_quiet_no_op() {
    let broker = StubBroker::new(WireFormatOptions::default());
    let connection = connect(&broker).await;
    let session = connection.create_session(AckMode::Transacted).await.unwrap();

    session.commit().await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    let commits = broker
        .recorded()
        .into_iter()
        .filter(|command| {
            matches!(
                command,
                Command::TransactionInfo(info)
                    if info.transaction_type == TransactionType::CommitOnePhase
            )
        })
        .count();
    assert_eq!(commits, 0, "nothing was in the transaction, nothing is sent");

    // The transaction id still advances: the next transaction is fresh.
    let queue = Destination::queue("txn.fresh.queue");
    let producer = session.create_producer(Some(&queue)).await.unwrap();
    producer.send(Message::text("after")).await.unwrap();
    session.commit().await.unwrap();
    assert_eq!(broker.queue_depth("txn.fresh.queue"), 1);

    connection.close().await.unwrap();
}

#[tokio::test]
async fn commit_and_rollback_require_a_transacted_session() {
    let broker = StubBroker::new(WireFormatOptions::default());
    let connection = connect(&broker).await;
    let session = connection.create_session(AckMode::Auto).await.unwrap();

    assert!(matches!(
        session.commit().await,
        Err(CmsError::IllegalState { .. })
    ));
    assert!(matches!(
        session.rollback().await,
        Err(CmsError::IllegalState { .. })
    ));

    connection.close().await.unwrap();
}

#[tokio::test]
async fn recover_is_illegal_on_a_transacted_session() {
    let broker = StubBroker::new(WireFormatOptions::default());
    let connection = connect(&broker).await;
    let session = connection.create_session(AckMode::Transacted).await.unwrap();

    assert!(matches!(
        session.recover().await,
        Err(CmsError::IllegalState { .. })
    ));

    connection.close().await.unwrap();
}

#[tokio::test]
async fn recover_redelivers_with_the_redelivered_flag() {
    let broker = StubBroker::new(WireFormatOptions::default());
    let connection = connect(&broker).await;
    let session = connection.create_session(AckMode::Client).await.unwrap();

    let queue = Destination::queue("recover.queue");
    let producer = session.create_producer(Some(&queue)).await.unwrap();
    producer.send(Message::text("again")).await.unwrap();

    let consumer = session.create_consumer(&queue).await.unwrap();
    let first = consumer
        .receive_timeout(Duration::from_secs(2))
        .await
        .unwrap()
        .expect("first delivery");
    assert!(!first.redelivered);

    session.recover().await.unwrap();

    let second = consumer
        .receive_timeout(Duration::from_secs(2))
        .await
        .unwrap()
        .expect("redelivery");
    assert_eq!(second.body_text(), Some("again"));
    assert!(second.redelivered, "recovered messages are marked redelivered");

    connection.close().await.unwrap();
}
