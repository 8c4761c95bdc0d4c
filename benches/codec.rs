//! # OpenWire Codec Benchmarks
//!
//! Measures marshal/unmarshal throughput for representative commands under
//! both wire encodings.

use std::hint::black_box;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};

use openwire_cms::codec::{OpenWireFormat, WireFormatOptions};
use openwire_cms::commands::{
    AckType, Command, ConnectionId, ConsumerId, Destination, Message, MessageAck, MessageDispatch,
    MessageId, PrimitiveValue, ProducerId,
};

fn codec(tight: bool) -> OpenWireFormat {
    let options = WireFormatOptions {
        tight_encoding_enabled: tight,
        cache_enabled: false,
        ..WireFormatOptions::default()
    };
    let mut wf = OpenWireFormat::new(&options).expect("codec");
    wf.renegotiate(&options.to_info()).expect("negotiation");
    wf
}

fn sample_dispatch(payload_size: usize) -> Command {
    let connection_id = ConnectionId::from_value("ID:bench-1");
    let producer_id = ProducerId {
        connection_id: connection_id.clone(),
        session_id: 1,
        value: 1,
    };
    let mut message = Message::text("x".repeat(payload_size));
    message.message_id = Some(MessageId {
        producer_id,
        producer_sequence_id: 42,
        broker_sequence_id: 1_042,
    });
    message.destination = Some(Destination::queue("bench.queue"));
    message.timestamp = 1_722_470_400_000;
    message
        .properties
        .insert("hop".to_string(), PrimitiveValue::Int(3));

    Command::MessageDispatch(Box::new(MessageDispatch {
        command_id: 7,
        response_required: false,
        consumer_id: ConsumerId {
            connection_id,
            session_id: 1,
            value: 2,
        },
        destination: Some(Destination::queue("bench.queue")),
        message: Some(Box::new(message)),
        redelivery_counter: 0,
    }))
}

fn sample_ack() -> Command {
    let connection_id = ConnectionId::from_value("ID:bench-1");
    Command::MessageAck(MessageAck {
        command_id: 9,
        response_required: false,
        ack_type: AckType::Consumed,
        consumer_id: ConsumerId {
            connection_id,
            session_id: 1,
            value: 2,
        },
        destination: Some(Destination::queue("bench.queue")),
        transaction_id: None,
        first_message_id: None,
        last_message_id: None,
        message_count: 10,
    })
}

fn bench_marshal(c: &mut Criterion) {
    let mut group = c.benchmark_group("marshal_dispatch");
    for payload_size in [64usize, 512, 4096, 32_768] {
        group.throughput(Throughput::Bytes(payload_size as u64));
        for tight in [true, false] {
            let label = if tight { "tight" } else { "loose" };
            group.bench_with_input(
                BenchmarkId::new(label, payload_size),
                &payload_size,
                |b, &payload_size| {
                    let mut wf = codec(tight);
                    let command = sample_dispatch(payload_size);
                    b.iter(|| black_box(wf.marshal(&command).expect("marshal")));
                },
            );
        }
    }
    group.finish();
}

fn bench_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("round_trip");
    for (name, command) in [("dispatch", sample_dispatch(512)), ("ack", sample_ack())] {
        for tight in [true, false] {
            let label = if tight { "tight" } else { "loose" };
            group.bench_function(BenchmarkId::new(name, label), |b| {
                let mut wf = codec(tight);
                b.iter(|| {
                    let frame = wf.marshal(&command).expect("marshal");
                    black_box(wf.unmarshal(&frame).expect("unmarshal"))
                });
            });
        }
    }
    group.finish();
}

criterion_group!(benches, bench_marshal, bench_round_trip);
criterion_main!(benches);
