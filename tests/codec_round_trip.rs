//! Codec round-trip coverage across versions, encodings, and flag sets.

use std::collections::BTreeMap;

use proptest::prelude::*;

use openwire_cms::codec::{OpenWireFormat, WireFormatOptions};
use openwire_cms::commands::{
    AckType, BrokerError, BrokerInfo, Command, ConnectionError, ConnectionId, ConnectionInfo,
    ConsumerId, ConsumerInfo, Destination, DestinationInfo, DestinationOperation,
    ExceptionResponse, KeepAliveInfo, LocalTransactionId, Message, MessageAck, MessageBody,
    MessageDispatch, MessageId, MessagePull, PrimitiveValue, ProducerId, ProducerInfo, RemoveInfo,
    RemoveSubscriptionInfo, RemovedObject, Response, SessionId, SessionInfo, ShutdownInfo,
    TransactionInfo, TransactionType, WireFormatInfo,
};

fn codec(version: u32, tight: bool, cache: bool, size_prefix_disabled: bool) -> OpenWireFormat {
    let options = WireFormatOptions {
        version,
        tight_encoding_enabled: tight,
        cache_enabled: cache,
        size_prefix_disabled,
        ..WireFormatOptions::default()
    };
    let mut wf = OpenWireFormat::new(&options).expect("codec");
    wf.renegotiate(&options.to_info()).expect("negotiation");
    wf
}

fn connection_id() -> ConnectionId {
    ConnectionId::from_value("ID:client-7f3a-1")
}

fn consumer_id() -> ConsumerId {
    ConsumerId {
        connection_id: connection_id(),
        session_id: 2,
        value: 5,
    }
}

fn producer_id() -> ProducerId {
    ProducerId {
        connection_id: connection_id(),
        session_id: 2,
        value: 3,
    }
}

fn message_id(sequence: i64) -> MessageId {
    MessageId {
        producer_id: producer_id(),
        producer_sequence_id: sequence,
        broker_sequence_id: sequence + 1_000,
    }
}

fn sample_message() -> Message {
    let mut message = Message::text("a payload worth shipping");
    message.message_id = Some(message_id(42));
    message.destination = Some(Destination::queue("orders.inbound"));
    message.correlation_id = Some("corr-9".to_string());
    message.reply_to = Some(Destination::temporary_queue("ID:client-7f3a-1:1"));
    message.persistent = true;
    message.priority = 6;
    message.timestamp = 1_722_470_400_000;
    message.expiration = 1_722_470_460_000;
    message.properties.insert(
        "region".to_string(),
        PrimitiveValue::String("eu-west".to_string()),
    );
    message
        .properties
        .insert("attempt".to_string(), PrimitiveValue::Int(2));
    message
}

/// Commands whose fields survive every supported version.
fn version_neutral_commands() -> Vec<Command> {
    vec![
        Command::BrokerInfo(BrokerInfo {
            command_id: 0,
            response_required: false,
            broker_id: Some("ID:broker-1".to_string()),
            broker_url: Some("tcp://broker:61616".to_string()),
            broker_name: Some("primary".to_string()),
        }),
        Command::ConnectionInfo(ConnectionInfo {
            command_id: 1,
            response_required: true,
            connection_id: connection_id(),
            client_id: Some("client-7".to_string()),
            user_name: Some("guest".to_string()),
            password: None,
        }),
        Command::SessionInfo(SessionInfo {
            command_id: 2,
            response_required: false,
            session_id: SessionId {
                connection_id: connection_id(),
                value: 2,
            },
        }),
        Command::ConsumerInfo(ConsumerInfo {
            command_id: 3,
            response_required: false,
            selector: Some("region = 'eu-west'".to_string()),
            prefetch_size: 500,
            maximum_pending_message_limit: 10,
            no_local: true,
            dispatch_async: false,
            priority: 3,
            ..ConsumerInfo::new(consumer_id(), Destination::topic("prices"))
        }),
        Command::ProducerInfo(ProducerInfo {
            command_id: 4,
            response_required: false,
            producer_id: producer_id(),
            destination: Some(Destination::queue("orders.inbound")),
        }),
        Command::MessageDispatch(Box::new(MessageDispatch {
            command_id: 5,
            response_required: false,
            consumer_id: consumer_id(),
            destination: Some(Destination::queue("orders.inbound")),
            message: Some(Box::new(sample_message())),
            redelivery_counter: 1,
        })),
        Command::MessageAck(MessageAck {
            command_id: 6,
            response_required: false,
            ack_type: AckType::Consumed,
            consumer_id: consumer_id(),
            destination: Some(Destination::queue("orders.inbound")),
            transaction_id: Some(LocalTransactionId {
                connection_id: connection_id(),
                value: 9,
            }),
            first_message_id: Some(message_id(1)),
            last_message_id: Some(message_id(10)),
            message_count: 10,
        }),
        Command::MessagePull(MessagePull {
            command_id: 7,
            response_required: false,
            consumer_id: consumer_id(),
            destination: Some(Destination::queue("orders.inbound")),
            timeout: -1,
        }),
        Command::TransactionInfo(TransactionInfo {
            command_id: 8,
            response_required: true,
            connection_id: connection_id(),
            transaction_id: Some(LocalTransactionId {
                connection_id: connection_id(),
                value: 4,
            }),
            transaction_type: TransactionType::CommitOnePhase,
        }),
        Command::RemoveSubscriptionInfo(RemoveSubscriptionInfo {
            command_id: 9,
            response_required: false,
            connection_id: connection_id(),
            client_id: Some("client-7".to_string()),
            subscription_name: "audit-feed".to_string(),
        }),
        Command::DestinationInfo(DestinationInfo {
            command_id: 10,
            response_required: true,
            connection_id: connection_id(),
            destination: Destination::temporary_topic("ID:client-7f3a-1:2"),
            operation: DestinationOperation::Add,
            timeout: 250,
        }),
        Command::ShutdownInfo(ShutdownInfo {
            command_id: 11,
            response_required: false,
        }),
        Command::KeepAliveInfo(KeepAliveInfo {
            command_id: 12,
            response_required: true,
        }),
        Command::Response(Response {
            command_id: 13,
            response_required: false,
            correlation_id: 8,
        }),
        Command::ExceptionResponse(ExceptionResponse {
            command_id: 14,
            response_required: false,
            correlation_id: 3,
            exception: BrokerError {
                exception_class: "javax.jms.InvalidSelectorException".to_string(),
                message: "bad selector".to_string(),
                stack_trace: vec!["at SelectorParser.parse".to_string()],
                cause: None,
            },
        }),
        Command::ConnectionError(ConnectionError {
            command_id: 15,
            response_required: false,
            connection_id: Some(connection_id()),
            exception: BrokerError {
                exception_class: "java.lang.SecurityException".to_string(),
                message: "not authorized".to_string(),
                stack_trace: vec![],
                cause: Some(Box::new(BrokerError {
                    exception_class: "java.io.IOException".to_string(),
                    message: "token expired".to_string(),
                    stack_trace: vec![],
                    cause: None,
                })),
            },
        }),
        Command::Message(Box::new(sample_message())),
    ]
}

#[test]
fn every_command_round_trips_under_every_flag_combination() {
    for version in 1..=3u32 {
        for tight in [false, true] {
            for cache in [false, true] {
                for size_prefix_disabled in [false, true] {
                    let mut wf = codec(version, tight, cache, size_prefix_disabled);
                    for command in version_neutral_commands() {
                        let frame = wf.marshal(&command).unwrap_or_else(|err| {
                            panic!("marshal {} failed at v{version}: {err}", command.name())
                        });
                        let decoded = wf.unmarshal(&frame).unwrap_or_else(|err| {
                            panic!("unmarshal {} failed at v{version}: {err}", command.name())
                        });
                        assert_eq!(
                            decoded.as_ref(),
                            Some(&command),
                            "v{version} tight={tight} cache={cache} prefix_off={size_prefix_disabled}"
                        );
                    }
                }
            }
        }
    }
}

#[test]
fn version_gated_fields_survive_at_version_three() {
    let mut wf = codec(3, true, true, false);

    let mut message = sample_message();
    message.message_type = Some("OrderPlaced".to_string());
    let command = Command::Message(Box::new(message));
    let frame = wf.marshal(&command).unwrap();
    assert_eq!(wf.unmarshal(&frame).unwrap(), Some(command));

    let remove = Command::RemoveInfo(RemoveInfo {
        command_id: 20,
        response_required: false,
        object_id: RemovedObject::Consumer(consumer_id()),
        last_delivered_sequence_id: 88,
    });
    let frame = wf.marshal(&remove).unwrap();
    assert_eq!(wf.unmarshal(&frame).unwrap(), Some(remove));
}

#[test]
fn version_one_drops_late_fields_symmetrically() {
    let mut wf = codec(1, true, false, false);
    let mut message = sample_message();
    message.message_type = Some("dropped at v1".to_string());
    let frame = wf.marshal(&Command::Message(Box::new(message.clone()))).unwrap();
    let decoded = wf.unmarshal(&frame).unwrap();
    let Some(Command::Message(decoded)) = decoded else {
        panic!("expected a message");
    };
    assert_eq!(decoded.message_type, None);
    assert_eq!(decoded.body, message.body);
}

/// Seed scenario: a kilobyte of UTF-8, sixteen mixed-type headers, a nested
/// destination, under both encodings at version three.
#[test]
fn large_message_round_trips_tight_and_loose() {
    let payload: String = "déjà-vu ".repeat(128);
    assert!(payload.len() >= 1024);

    let mut message = Message::text(payload);
    message.message_id = Some(message_id(77));
    message.destination = Some(Destination::queue("bulk.transfer"));
    message.reply_to = Some(Destination::topic("bulk.replies"));
    for i in 0..4 {
        message
            .properties
            .insert(format!("int-{i}"), PrimitiveValue::Int(i));
        message
            .properties
            .insert(format!("long-{i}"), PrimitiveValue::Long(i64::from(i) << 40));
        message
            .properties
            .insert(format!("flag-{i}"), PrimitiveValue::Bool(i % 2 == 0));
        message
            .properties
            .insert(format!("name-{i}"), PrimitiveValue::String(format!("v{i}")));
    }
    assert_eq!(message.properties.len(), 16);
    let command = Command::Message(Box::new(message));

    for tight in [true, false] {
        let mut wf = codec(3, tight, false, false);
        let frame = wf.marshal(&command).unwrap();
        let decoded = wf.unmarshal(&frame).unwrap();
        assert_eq!(decoded, Some(command.clone()), "tight={tight}");
    }
}

#[test]
fn tight_encoding_is_smaller_for_sparse_commands() {
    let command = Command::MessageAck(MessageAck {
        command_id: 1,
        response_required: false,
        ack_type: AckType::Delivered,
        consumer_id: consumer_id(),
        destination: None,
        transaction_id: None,
        first_message_id: None,
        last_message_id: None,
        message_count: 1,
    });
    let mut tight = codec(3, true, false, false);
    let mut loose = codec(3, false, false, false);
    let tight_frame = tight.marshal(&command).unwrap();
    let loose_frame = loose.marshal(&command).unwrap();
    assert!(tight_frame.len() < loose_frame.len());
}

#[test]
fn repeated_destinations_shrink_with_the_cache() {
    let ack = |n: i32| {
        Command::MessageAck(MessageAck {
            command_id: n,
            response_required: false,
            ack_type: AckType::Consumed,
            consumer_id: consumer_id(),
            destination: Some(Destination::queue("a.rather.long.destination.name")),
            transaction_id: None,
            first_message_id: None,
            last_message_id: None,
            message_count: 1,
        })
    };
    let mut wf = codec(3, true, true, false);
    let first = wf.marshal(&ack(1)).unwrap();
    let second = wf.marshal(&ack(2)).unwrap();
    assert!(second.len() < first.len());

    // A mirrored decoder learns the assignment from the first frame.
    let mut peer = codec(3, true, true, false);
    let sent_first = peer.unmarshal(&first).unwrap();
    let sent_second = peer.unmarshal(&second).unwrap();
    assert_eq!(sent_first, Some(ack(1)));
    assert_eq!(sent_second, Some(ack(2)));
}

#[test]
fn pre_marshalled_message_bodies_survive_dispatch() {
    let mut wf = codec(3, true, false, false);

    let message = sample_message();
    let form = wf.to_marshalled_form(&message).unwrap();
    let mut carried = message.clone();
    carried.marshalled_form = Some(form);

    let dispatch = Command::MessageDispatch(Box::new(MessageDispatch {
        command_id: 30,
        response_required: false,
        consumer_id: consumer_id(),
        destination: Some(Destination::queue("orders.inbound")),
        message: Some(Box::new(carried)),
        redelivery_counter: 0,
    }));
    let frame = wf.marshal(&dispatch).unwrap();
    let decoded = wf.unmarshal(&frame).unwrap();

    let Some(Command::MessageDispatch(decoded)) = decoded else {
        panic!("expected a dispatch");
    };
    assert_eq!(decoded.message.as_deref(), Some(&message));
}

#[test]
fn negotiation_is_monotone() {
    let ours = WireFormatOptions {
        version: 3,
        tight_encoding_enabled: true,
        cache_enabled: true,
        cache_size: 1024,
        max_inactivity_duration: 30_000,
        ..WireFormatOptions::default()
    };
    let theirs = WireFormatInfo {
        version: 2,
        tight_encoding_enabled: true,
        cache_enabled: false,
        cache_size: 2048,
        max_inactivity_duration: 45_000,
        ..WireFormatInfo::default()
    };
    let mut wf = OpenWireFormat::new(&ours).unwrap();
    wf.renegotiate(&theirs).unwrap();

    assert!(wf.version() <= ours.version);
    assert!(wf.version() <= theirs.version);
    assert!(wf.is_tight_encoding_enabled() <= ours.tight_encoding_enabled);
    assert!(wf.is_tight_encoding_enabled() <= theirs.tight_encoding_enabled);
    assert_eq!(
        wf.max_inactivity_duration(),
        ours.max_inactivity_duration.min(theirs.max_inactivity_duration)
    );
}

fn arbitrary_primitive() -> impl Strategy<Value = PrimitiveValue> {
    prop_oneof![
        any::<bool>().prop_map(PrimitiveValue::Bool),
        any::<i8>().prop_map(PrimitiveValue::Byte),
        any::<i16>().prop_map(PrimitiveValue::Short),
        any::<i32>().prop_map(PrimitiveValue::Int),
        any::<i64>().prop_map(PrimitiveValue::Long),
        "[a-zA-Z0-9 ]{0,40}".prop_map(PrimitiveValue::String),
        proptest::collection::vec(any::<u8>(), 0..64).prop_map(PrimitiveValue::Bytes),
    ]
}

fn arbitrary_body() -> impl Strategy<Value = MessageBody> {
    prop_oneof![
        Just(MessageBody::Empty),
        "[a-zA-Z0-9 äöüéèç]{0,200}".prop_map(MessageBody::Text),
        proptest::collection::vec(any::<u8>(), 0..256).prop_map(MessageBody::Bytes),
        proptest::collection::btree_map("[a-z]{1,12}", arbitrary_primitive(), 0..8)
            .prop_map(MessageBody::Map),
        proptest::collection::vec(arbitrary_primitive(), 0..8).prop_map(MessageBody::Stream),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn arbitrary_messages_round_trip(
        body in arbitrary_body(),
        properties in proptest::collection::btree_map("[a-z]{1,10}", arbitrary_primitive(), 0..6),
        priority in 0u8..=9,
        timestamp in 0i64..=2_000_000_000_000,
        expiration in 0i64..=2_000_000_000_000,
        persistent in any::<bool>(),
        sequence in 1i64..=1_000_000,
        tight in any::<bool>(),
    ) {
        let message = Message {
            message_id: Some(message_id(sequence)),
            destination: Some(Destination::queue("prop.queue")),
            body,
            properties: BTreeMap::from_iter(properties),
            priority,
            timestamp,
            expiration,
            persistent,
            ..Message::default()
        };
        let command = Command::Message(Box::new(message));
        let mut wf = codec(3, tight, false, false);
        let frame = wf.marshal(&command).unwrap();
        prop_assert_eq!(wf.unmarshal(&frame).unwrap(), Some(command));
    }

    #[test]
    fn arbitrary_acks_round_trip(
        ack_type in prop_oneof![
            Just(AckType::Delivered),
            Just(AckType::Poison),
            Just(AckType::Consumed),
            Just(AckType::Redelivered),
            Just(AckType::Individual),
        ],
        count in 0i32..=10_000,
        first in 1i64..=1_000,
        span in 0i64..=1_000,
        tight in any::<bool>(),
        cache in any::<bool>(),
    ) {
        let command = Command::MessageAck(MessageAck {
            command_id: 1,
            response_required: false,
            ack_type,
            consumer_id: consumer_id(),
            destination: Some(Destination::queue("prop.queue")),
            transaction_id: None,
            first_message_id: Some(message_id(first)),
            last_message_id: Some(message_id(first + span)),
            message_count: count,
        });
        let mut wf = codec(3, tight, cache, false);
        let frame = wf.marshal(&command).unwrap();
        prop_assert_eq!(wf.unmarshal(&frame).unwrap(), Some(command));
    }
}
