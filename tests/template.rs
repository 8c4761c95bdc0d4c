//! CmsTemplate operations against the stub broker.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{StubBroker, StubConnector};
use openwire_cms::codec::WireFormatOptions;
use openwire_cms::commands::{Message, PrimitiveValue};
use openwire_cms::config::ConnectionOptions;
use openwire_cms::factory::ConnectionFactory;
use openwire_cms::producer::SendOptions;
use openwire_cms::session::Session;
use openwire_cms::template::CmsTemplate;
use openwire_cms::error::CmsResult;

fn template_for(broker: &Arc<StubBroker>) -> CmsTemplate {
    let factory = Arc::new(
        ConnectionFactory::new(
            "loopback://stub",
            ConnectionOptions::default(),
            StubConnector::new(broker.clone()),
        )
        .expect("factory"),
    );
    CmsTemplate::new(factory).with_receive_timeout(Duration::from_millis(500))
}

#[tokio::test]
async fn send_then_receive_across_borrowed_connections() {
    let broker = StubBroker::new(WireFormatOptions::default());
    let template = template_for(&broker).with_default_destination_name("template.queue");

    let creator = |_session: &Session| -> CmsResult<Message> {
        let mut message = Message::text("templated");
        message.set_property("origin", PrimitiveValue::String("cms-template".into()));
        Ok(message)
    };
    template.send(&creator).await.unwrap();

    // The send borrowed and closed its own connection; the message is on
    // the broker, not in any client state.
    assert_eq!(broker.queue_depth("template.queue"), 1);

    let received = template.receive().await.unwrap().expect("queued message");
    assert_eq!(received.body_text(), Some("templated"));
    assert_eq!(
        received.property("origin"),
        Some(&PrimitiveValue::String("cms-template".into()))
    );
    assert_eq!(broker.queue_depth("template.queue"), 0);
}

#[tokio::test]
async fn receive_times_out_empty_handed() {
    let broker = StubBroker::new(WireFormatOptions::default());
    let template = template_for(&broker).with_default_destination_name("template.empty");

    let nothing = template.receive().await.unwrap();
    assert!(nothing.is_none());
}

#[tokio::test]
async fn named_destinations_override_the_default() {
    let broker = StubBroker::new(WireFormatOptions::default());
    let template = template_for(&broker).with_default_destination_name("template.default");

    let creator = |_session: &Session| -> CmsResult<Message> { Ok(Message::text("elsewhere")) };
    template.send_to_name("template.other", &creator).await.unwrap();

    assert_eq!(broker.queue_depth("template.default"), 0);
    assert_eq!(broker.queue_depth("template.other"), 1);

    let received = template
        .receive_from_name("template.other")
        .await
        .unwrap()
        .expect("message on the named queue");
    assert_eq!(received.body_text(), Some("elsewhere"));
}

#[tokio::test]
async fn explicit_qos_controls_the_sent_headers() {
    let broker = StubBroker::new(WireFormatOptions::default());
    let template = template_for(&broker)
        .with_default_destination_name("template.qos")
        .with_explicit_qos(SendOptions {
            persistent: false,
            priority: 9,
            time_to_live_ms: 60_000,
        });

    let creator = |_session: &Session| -> CmsResult<Message> { Ok(Message::text("urgent")) };
    template.send(&creator).await.unwrap();

    let received = template.receive().await.unwrap().expect("message");
    assert!(!received.persistent);
    assert_eq!(received.priority, 9);
    assert!(received.expiration > 0, "a positive ttl sets the expiration");
}

#[tokio::test]
async fn selected_receive_uses_the_given_selector() {
    let broker = StubBroker::new(WireFormatOptions::default());
    let template = template_for(&broker).with_default_destination_name("template.selected");

    let creator = |_session: &Session| -> CmsResult<Message> {
        let mut message = Message::text("selected");
        message.set_property("kind", PrimitiveValue::String("alert".into()));
        Ok(message)
    };
    template.send(&creator).await.unwrap();

    // The stub broker does not evaluate selector grammar; this exercises the
    // registration path end to end.
    let received = template
        .receive_selected("kind = 'alert'")
        .await
        .unwrap()
        .expect("message");
    assert_eq!(received.body_text(), Some("selected"));
}
