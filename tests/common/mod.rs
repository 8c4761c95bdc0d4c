//! In-process stub broker used by the integration tests.
//!
//! Speaks real OpenWire frames over the loopback transport: it negotiates
//! the wire format, registers consumers, stores queue messages, respects
//! prefetch windows and pull requests, stages transacted sends, and records
//! every inbound command so tests can assert on the ack traffic.

// Not every test binary exercises every helper.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use openwire_cms::codec::{OpenWireFormat, WireFormatOptions};
use openwire_cms::commands::{
    AckType, Command, ConsumerId, ConsumerInfo, Destination, DestinationOperation,
    ExceptionResponse, LocalTransactionId, Message, MessageDispatch, Response, TransactionType,
};
use openwire_cms::error::TransportError;
use openwire_cms::factory::TransportConnector;
use openwire_cms::transport::loopback::{LoopbackTransport, loopback_pair};
use openwire_cms::transport::{Transport, TransportEvent};

/// One broker-side connection endpoint.
struct BrokerConnection {
    transport: LoopbackTransport,
    wire_format: Mutex<OpenWireFormat>,
}

impl BrokerConnection {
    async fn send(&self, command: &Command) {
        let frame = {
            let mut wf = self.wire_format.lock().unwrap();
            wf.marshal(command)
        };
        if let Ok(frame) = frame {
            let _ = self.transport.oneway(frame).await;
        }
    }
}

struct ConsumerReg {
    info: ConsumerInfo,
    connection: Arc<BrokerConnection>,
    outstanding: i32,
    pending_pull: bool,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, VecDeque<Message>>,
    consumers: Vec<ConsumerReg>,
    staged_sends: HashMap<LocalTransactionId, Vec<Message>>,
}

/// The shared broker core behind every accepted connection.
pub struct StubBroker {
    options: WireFormatOptions,
    state: Mutex<BrokerState>,
    recorded: Mutex<Vec<Command>>,
    broker_sequence: AtomicI64,
}

impl StubBroker {
    /// A broker preferring the given wire format options.
    pub fn new(options: WireFormatOptions) -> Arc<Self> {
        Arc::new(Self {
            options,
            state: Mutex::new(BrokerState::default()),
            recorded: Mutex::new(Vec::new()),
            broker_sequence: AtomicI64::new(1),
        })
    }

    /// Every command the broker has received, in arrival order.
    pub fn recorded(&self) -> Vec<Command> {
        self.recorded.lock().unwrap().clone()
    }

    /// The recorded `MessageAck` commands, in arrival order.
    pub fn recorded_acks(&self) -> Vec<openwire_cms::commands::MessageAck> {
        self.recorded()
            .into_iter()
            .filter_map(|command| match command {
                Command::MessageAck(ack) => Some(ack),
                _ => None,
            })
            .collect()
    }

    /// Messages currently stored on a queue.
    pub fn queue_depth(&self, name: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .queues
            .get(name)
            .map_or(0, VecDeque::len)
    }

    /// Accepts one client; returns the client-side transport.
    pub fn accept(self: &Arc<Self>) -> Box<dyn Transport> {
        let (client_side, broker_side) = loopback_pair(64);
        let events = broker_side.take_events().expect("fresh transport");
        let connection = Arc::new(BrokerConnection {
            transport: broker_side,
            wire_format: Mutex::new(OpenWireFormat::new(&self.options).expect("codec")),
        });
        let broker = self.clone();
        tokio::spawn(async move {
            broker.run_connection(connection, events).await;
        });
        Box::new(client_side)
    }

    async fn run_connection(
        self: Arc<Self>,
        connection: Arc<BrokerConnection>,
        mut events: mpsc::Receiver<TransportEvent>,
    ) {
        // Brokers advertise their wire format as soon as the link is up.
        let preferred = {
            let wf = connection.wire_format.lock().unwrap();
            wf.preferred_info()
        };
        connection
            .send(&Command::WireFormatInfo(preferred))
            .await;

        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::Frame(frame) => {
                    let decoded = {
                        let mut wf = connection.wire_format.lock().unwrap();
                        wf.unmarshal(&frame)
                    };
                    match decoded {
                        Ok(Some(command)) => {
                            self.recorded.lock().unwrap().push(command.clone());
                            self.handle_command(&connection, command).await;
                        }
                        Ok(None) => {}
                        Err(err) => {
                            eprintln!("stub broker codec failure: {err}");
                            break;
                        }
                    }
                }
                TransportEvent::Broken(_) => break,
                TransportEvent::Interrupted | TransportEvent::Resumed => {}
            }
        }
    }

    async fn handle_command(self: &Arc<Self>, connection: &Arc<BrokerConnection>, command: Command) {
        match command {
            Command::WireFormatInfo(info) => {
                let _ = connection.wire_format.lock().unwrap().renegotiate(&info);
            }
            Command::KeepAliveInfo(info) => {
                if info.response_required {
                    connection
                        .send(&Command::KeepAliveInfo(Default::default()))
                        .await;
                }
            }
            Command::ConnectionInfo(ref info) => {
                self.respond_if_required(connection, info.command_id, info.response_required)
                    .await;
            }
            Command::SessionInfo(ref info) => {
                self.respond_if_required(connection, info.command_id, info.response_required)
                    .await;
            }
            Command::ProducerInfo(ref info) => {
                self.respond_if_required(connection, info.command_id, info.response_required)
                    .await;
            }
            Command::ConsumerInfo(info) => {
                let response_required = info.response_required;
                let command_id = info.command_id;
                {
                    let mut state = self.state.lock().unwrap();
                    state.consumers.push(ConsumerReg {
                        info,
                        connection: connection.clone(),
                        outstanding: 0,
                        pending_pull: false,
                    });
                }
                self.respond_if_required(connection, command_id, response_required)
                    .await;
                self.try_dispatch().await;
            }
            Command::RemoveInfo(info) => {
                if let openwire_cms::commands::RemovedObject::Consumer(consumer_id) =
                    &info.object_id
                {
                    let mut state = self.state.lock().unwrap();
                    state
                        .consumers
                        .retain(|reg| reg.info.consumer_id != *consumer_id);
                }
                self.respond_if_required(connection, info.command_id, info.response_required)
                    .await;
            }
            Command::Message(mut message) => {
                if let Some(id) = message.message_id.as_mut() {
                    id.broker_sequence_id = self.broker_sequence.fetch_add(1, Ordering::SeqCst);
                }
                match message.transaction_id.clone() {
                    Some(transaction_id) => {
                        let mut state = self.state.lock().unwrap();
                        state
                            .staged_sends
                            .entry(transaction_id)
                            .or_default()
                            .push(*message);
                    }
                    None => {
                        self.publish(*message);
                        self.try_dispatch().await;
                    }
                }
            }
            Command::MessageAck(ack) => {
                self.apply_ack(&ack);
                self.try_dispatch().await;
            }
            Command::MessagePull(pull) => {
                self.handle_pull(pull).await;
            }
            Command::TransactionInfo(info) => {
                match info.transaction_type {
                    TransactionType::Begin => {
                        if let Some(id) = info.transaction_id.clone() {
                            self.state.lock().unwrap().staged_sends.entry(id).or_default();
                        }
                    }
                    TransactionType::CommitOnePhase => {
                        let staged = info.transaction_id.clone().and_then(|id| {
                            self.state.lock().unwrap().staged_sends.remove(&id)
                        });
                        for message in staged.into_iter().flatten() {
                            self.publish(message);
                        }
                        self.try_dispatch().await;
                    }
                    TransactionType::Rollback => {
                        if let Some(id) = &info.transaction_id {
                            self.state.lock().unwrap().staged_sends.remove(id);
                        }
                    }
                }
                self.respond_if_required(connection, info.command_id, info.response_required)
                    .await;
            }
            Command::DestinationInfo(info) => {
                match info.operation {
                    DestinationOperation::Add => {
                        {
                            let mut state = self.state.lock().unwrap();
                            state
                                .queues
                                .entry(info.destination.base_name().to_string())
                                .or_default();
                        }
                        self.respond_if_required(connection, info.command_id, info.response_required)
                            .await;
                    }
                    DestinationOperation::Remove => {
                        let in_use = {
                            let state = self.state.lock().unwrap();
                            state.consumers.iter().any(|reg| {
                                reg.info.destination.base_name() == info.destination.base_name()
                            })
                        };
                        if in_use && info.response_required {
                            connection
                                .send(&Command::ExceptionResponse(ExceptionResponse {
                                    command_id: 0,
                                    response_required: false,
                                    correlation_id: info.command_id,
                                    exception: openwire_cms::commands::BrokerError {
                                        exception_class: "DestinationInUseException".to_string(),
                                        message: format!(
                                            "{} has attached consumers",
                                            info.destination
                                        ),
                                        stack_trace: vec![],
                                        cause: None,
                                    },
                                }))
                                .await;
                        } else {
                            self.state
                                .lock()
                                .unwrap()
                                .queues
                                .remove(info.destination.base_name());
                            self.respond_if_required(
                                connection,
                                info.command_id,
                                info.response_required,
                            )
                            .await;
                        }
                    }
                }
            }
            Command::ShutdownInfo(_) | Command::RemoveSubscriptionInfo(_) => {}
            _ => {}
        }
    }

    async fn respond_if_required(
        &self,
        connection: &Arc<BrokerConnection>,
        command_id: i32,
        response_required: bool,
    ) {
        if response_required {
            connection
                .send(&Command::Response(Response {
                    command_id: 0,
                    response_required: false,
                    correlation_id: command_id,
                }))
                .await;
        }
    }

    fn publish(&self, message: Message) {
        let Some(destination) = message.destination.clone() else {
            return;
        };
        // Queues and topics share one store here; the tests only need
        // subscription-time delivery, not retained topic history.
        let mut state = self.state.lock().unwrap();
        state
            .queues
            .entry(destination.base_name().to_string())
            .or_default()
            .push_back(message);
    }

    fn apply_ack(&self, ack: &openwire_cms::commands::MessageAck) {
        let mut state = self.state.lock().unwrap();
        if let Some(reg) = state
            .consumers
            .iter_mut()
            .find(|reg| reg.info.consumer_id == ack.consumer_id)
        {
            match ack.ack_type {
                AckType::Consumed | AckType::Poison | AckType::Individual => {
                    reg.outstanding = (reg.outstanding - ack.message_count).max(0);
                }
                AckType::Delivered | AckType::Redelivered => {}
            }
        }
    }

    /// Pushes stored messages into every open prefetch window.
    async fn try_dispatch(self: &Arc<Self>) {
        loop {
            let next = {
                let mut state = self.state.lock().unwrap();
                let mut found = None;
                let BrokerState {
                    queues, consumers, ..
                } = &mut *state;
                for reg in consumers.iter_mut() {
                    let window_open = if reg.info.prefetch_size == 0 {
                        reg.pending_pull
                    } else {
                        reg.outstanding < reg.info.prefetch_size
                    };
                    if !window_open {
                        continue;
                    }
                    let queue = queues.get_mut(reg.info.destination.base_name());
                    if let Some(message) = queue.and_then(VecDeque::pop_front) {
                        reg.outstanding += 1;
                        reg.pending_pull = false;
                        found = Some((
                            reg.connection.clone(),
                            dispatch_for(&reg.info.consumer_id, &reg.info.destination, message),
                        ));
                        break;
                    }
                }
                found
            };
            match next {
                Some((connection, dispatch)) => {
                    connection
                        .send(&Command::MessageDispatch(Box::new(dispatch)))
                        .await;
                }
                None => break,
            }
        }
    }

    async fn handle_pull(self: &Arc<Self>, pull: openwire_cms::commands::MessagePull) {
        let immediate = {
            let mut state = self.state.lock().unwrap();
            let BrokerState {
                queues, consumers, ..
            } = &mut *state;
            let Some(reg) = consumers
                .iter_mut()
                .find(|reg| reg.info.consumer_id == pull.consumer_id)
            else {
                return;
            };
            let queue = queues.get_mut(reg.info.destination.base_name());
            match queue.and_then(VecDeque::pop_front) {
                Some(message) => {
                    reg.outstanding += 1;
                    Some((
                        reg.connection.clone(),
                        Some(dispatch_for(
                            &reg.info.consumer_id,
                            &reg.info.destination,
                            message,
                        )),
                    ))
                }
                None if pull.timeout < 0 => {
                    // No-wait pull with nothing queued: answer with a null
                    // payload dispatch right away.
                    Some((
                        reg.connection.clone(),
                        Some(null_dispatch(&reg.info.consumer_id, &reg.info.destination)),
                    ))
                }
                None => {
                    reg.pending_pull = true;
                    None
                }
            }
        };

        match immediate {
            Some((connection, Some(dispatch))) => {
                connection
                    .send(&Command::MessageDispatch(Box::new(dispatch)))
                    .await;
            }
            Some((_, None)) => {}
            None if pull.timeout > 0 => {
                // Timed pull: answer with a null dispatch at the deadline if
                // nothing arrived for this consumer in the meantime.
                let broker = self.clone();
                let consumer_id = pull.consumer_id.clone();
                let timeout = pull.timeout as u64;
                tokio::spawn(async move {
                    tokio::time::sleep(std::time::Duration::from_millis(timeout)).await;
                    let expired = {
                        let mut state = broker.state.lock().unwrap();
                        state
                            .consumers
                            .iter_mut()
                            .find(|reg| reg.info.consumer_id == consumer_id)
                            .filter(|reg| reg.pending_pull)
                            .map(|reg| {
                                reg.pending_pull = false;
                                (
                                    reg.connection.clone(),
                                    null_dispatch(&reg.info.consumer_id, &reg.info.destination),
                                )
                            })
                    };
                    if let Some((connection, dispatch)) = expired {
                        connection
                            .send(&Command::MessageDispatch(Box::new(dispatch)))
                            .await;
                    }
                });
            }
            None => {}
        }
    }
}

fn dispatch_for(
    consumer_id: &ConsumerId,
    destination: &Destination,
    message: Message,
) -> MessageDispatch {
    let redelivery_counter = message.redelivery_counter;
    MessageDispatch {
        command_id: 0,
        response_required: false,
        consumer_id: consumer_id.clone(),
        destination: Some(destination.clone()),
        message: Some(Box::new(message)),
        redelivery_counter,
    }
}

fn null_dispatch(consumer_id: &ConsumerId, destination: &Destination) -> MessageDispatch {
    MessageDispatch {
        command_id: 0,
        response_required: false,
        consumer_id: consumer_id.clone(),
        destination: Some(destination.clone()),
        message: None,
        redelivery_counter: 0,
    }
}

/// A connector that accepts every dial against one shared stub broker.
pub struct StubConnector {
    broker: Arc<StubBroker>,
}

impl StubConnector {
    pub fn new(broker: Arc<StubBroker>) -> Arc<Self> {
        Arc::new(Self { broker })
    }
}

#[async_trait]
impl TransportConnector for StubConnector {
    async fn connect(&self, _url: &str) -> Result<Box<dyn Transport>, TransportError> {
        Ok(self.broker.accept())
    }
}
