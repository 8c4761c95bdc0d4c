//! The OpenWire command model.
//!
//! A closed set of protocol commands, each with a stable numeric wire tag.
//! Commands that take part in request/response correlation carry a command
//! id and a `response_required` flag; responses point back through
//! `correlation_id`.

pub mod destination;
pub mod ids;
pub mod message;

pub use destination::{Destination, DestinationKind, DestinationOptions};
pub use ids::{
    ConnectionId, ConsumerId, LocalTransactionId, MessageId, ProducerId, SequenceGenerator,
    SessionId,
};
pub use message::{Message, MessageBody, PrimitiveValue, unix_millis_now};

use serde::{Deserialize, Serialize};

/// Wire tags for every data structure the codec understands.
///
/// Values follow the OpenWire numbering; tag zero is the explicit null
/// payload and never maps to a marshaller.
pub mod types {
    pub const NULL: u8 = 0;
    pub const WIREFORMAT_INFO: u8 = 1;
    pub const BROKER_INFO: u8 = 2;
    pub const CONNECTION_INFO: u8 = 3;
    pub const SESSION_INFO: u8 = 4;
    pub const CONSUMER_INFO: u8 = 5;
    pub const PRODUCER_INFO: u8 = 6;
    pub const TRANSACTION_INFO: u8 = 7;
    pub const DESTINATION_INFO: u8 = 8;
    pub const REMOVE_SUBSCRIPTION_INFO: u8 = 9;
    pub const KEEP_ALIVE_INFO: u8 = 10;
    pub const SHUTDOWN_INFO: u8 = 11;
    pub const REMOVE_INFO: u8 = 12;
    pub const CONNECTION_ERROR: u8 = 16;
    pub const MESSAGE_PULL: u8 = 20;
    pub const MESSAGE_DISPATCH: u8 = 21;
    pub const MESSAGE_ACK: u8 = 22;
    pub const MESSAGE: u8 = 23;
    pub const BYTES_MESSAGE: u8 = 24;
    pub const MAP_MESSAGE: u8 = 25;
    pub const OBJECT_MESSAGE: u8 = 26;
    pub const STREAM_MESSAGE: u8 = 27;
    pub const TEXT_MESSAGE: u8 = 28;
    pub const RESPONSE: u8 = 30;
    pub const EXCEPTION_RESPONSE: u8 = 31;
    pub const QUEUE: u8 = 100;
    pub const TOPIC: u8 = 101;
    pub const TEMP_QUEUE: u8 = 102;
    pub const TEMP_TOPIC: u8 = 103;
    pub const MESSAGE_ID: u8 = 110;
    pub const LOCAL_TRANSACTION_ID: u8 = 111;
    pub const CONNECTION_ID: u8 = 120;
    pub const SESSION_ID: u8 = 121;
    pub const CONSUMER_ID: u8 = 122;
    pub const PRODUCER_ID: u8 = 123;
}

/// Acknowledgement kinds carried by [`MessageAck`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum AckType {
    /// Flow-control only: the client saw the message, the window may move.
    Delivered = 0,
    /// The redelivery cap was exceeded; route the range to the DLQ.
    Poison = 1,
    /// The message range is consumed and may be discarded broker-side.
    Consumed = 2,
    /// A rollback happened; window accounting only.
    Redelivered = 3,
    /// A single message consumed in individual-acknowledge mode.
    Individual = 4,
}

impl AckType {
    /// Decodes a wire value.
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(AckType::Delivered),
            1 => Some(AckType::Poison),
            2 => Some(AckType::Consumed),
            3 => Some(AckType::Redelivered),
            4 => Some(AckType::Individual),
            _ => None,
        }
    }
}

/// Transaction operations carried by [`TransactionInfo`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum TransactionType {
    Begin = 0,
    CommitOnePhase = 2,
    Rollback = 4,
}

impl TransactionType {
    /// Decodes a wire value.
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(TransactionType::Begin),
            2 => Some(TransactionType::CommitOnePhase),
            4 => Some(TransactionType::Rollback),
            _ => None,
        }
    }
}

/// Add/remove flag on [`DestinationInfo`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum DestinationOperation {
    Add = 0,
    Remove = 1,
}

/// A broker-side exception carried by error responses.
///
/// The stack trace and cause chain only cross the wire when
/// `stack_trace_enabled` was negotiated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BrokerError {
    pub exception_class: String,
    pub message: String,
    pub stack_trace: Vec<String>,
    pub cause: Option<Box<BrokerError>>,
}

/// The id of the object a [`RemoveInfo`] tears down.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemovedObject {
    Connection(ConnectionId),
    Session(SessionId),
    Consumer(ConsumerId),
    Producer(ProducerId),
}

/// Handshake command carrying one peer's preferred feature set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireFormatInfo {
    pub command_id: i32,
    pub response_required: bool,
    pub version: u32,
    pub stack_trace_enabled: bool,
    pub tcp_no_delay_enabled: bool,
    pub cache_enabled: bool,
    pub tight_encoding_enabled: bool,
    pub size_prefix_disabled: bool,
    pub cache_size: u16,
    pub max_inactivity_duration: i64,
    pub max_inactivity_duration_initial_delay: i64,
}

impl Default for WireFormatInfo {
    fn default() -> Self {
        Self {
            command_id: 0,
            response_required: false,
            version: 1,
            stack_trace_enabled: true,
            tcp_no_delay_enabled: true,
            cache_enabled: true,
            tight_encoding_enabled: false,
            size_prefix_disabled: false,
            cache_size: 1024,
            max_inactivity_duration: 30_000,
            max_inactivity_duration_initial_delay: 10_000,
        }
    }
}

/// Broker self-identification sent after the handshake.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BrokerInfo {
    pub command_id: i32,
    pub response_required: bool,
    pub broker_id: Option<String>,
    pub broker_url: Option<String>,
    pub broker_name: Option<String>,
}

/// Announces a new connection to the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub command_id: i32,
    pub response_required: bool,
    pub connection_id: ConnectionId,
    pub client_id: Option<String>,
    pub user_name: Option<String>,
    pub password: Option<String>,
}

/// Announces a new session under a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub command_id: i32,
    pub response_required: bool,
    pub session_id: SessionId,
}

/// Registers a consumer subscription with the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumerInfo {
    pub command_id: i32,
    pub response_required: bool,
    pub consumer_id: ConsumerId,
    pub destination: Destination,
    pub selector: Option<String>,
    /// Names a durable topic subscription; `None` for ordinary consumers.
    pub subscription_name: Option<String>,
    pub prefetch_size: i32,
    pub maximum_pending_message_limit: i32,
    pub no_local: bool,
    pub browser: bool,
    pub dispatch_async: bool,
    pub exclusive: bool,
    pub retroactive: bool,
    pub priority: u8,
    pub network_subscription: bool,
}

impl ConsumerInfo {
    /// A consumer registration with protocol defaults.
    pub fn new(consumer_id: ConsumerId, destination: Destination) -> Self {
        Self {
            command_id: 0,
            response_required: false,
            consumer_id,
            destination,
            selector: None,
            subscription_name: None,
            prefetch_size: 1000,
            maximum_pending_message_limit: 0,
            no_local: false,
            browser: false,
            dispatch_async: true,
            exclusive: false,
            retroactive: false,
            priority: 0,
            network_subscription: false,
        }
    }

    /// Applies `consumer.*` overrides parsed from the destination name.
    pub fn apply_destination_options(&mut self, options: &DestinationOptions) {
        if let Some(prefetch) = options.prefetch_size {
            self.prefetch_size = prefetch;
        }
        if let Some(limit) = options.maximum_pending_message_limit {
            self.maximum_pending_message_limit = limit;
        }
        if let Some(no_local) = options.no_local {
            self.no_local = no_local;
        }
        if let Some(dispatch_async) = options.dispatch_async {
            self.dispatch_async = dispatch_async;
        }
        if let Some(exclusive) = options.exclusive {
            self.exclusive = exclusive;
        }
        if let Some(retroactive) = options.retroactive {
            self.retroactive = retroactive;
        }
        if let Some(priority) = options.priority {
            self.priority = priority;
        }
        if let Some(selector) = &options.selector {
            self.selector = Some(selector.clone());
        }
        if let Some(network) = options.network_subscription {
            self.network_subscription = network;
        }
    }
}

/// Registers a producer with the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProducerInfo {
    pub command_id: i32,
    pub response_required: bool,
    pub producer_id: ProducerId,
    /// Fixed destination, or `None` for an anonymous producer.
    pub destination: Option<Destination>,
}

/// Tears down a previously announced object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoveInfo {
    pub command_id: i32,
    pub response_required: bool,
    pub object_id: RemovedObject,
    /// Lets the broker settle deliveries that were in flight at close.
    pub last_delivered_sequence_id: i64,
}

/// Drops a named durable subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoveSubscriptionInfo {
    pub command_id: i32,
    pub response_required: bool,
    pub connection_id: ConnectionId,
    pub client_id: Option<String>,
    pub subscription_name: String,
}

/// Creates or destroys a destination broker-side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DestinationInfo {
    pub command_id: i32,
    pub response_required: bool,
    pub connection_id: ConnectionId,
    pub destination: Destination,
    pub operation: DestinationOperation,
    pub timeout: i64,
}

/// Broker-to-client delivery of one message to one consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageDispatch {
    pub command_id: i32,
    pub response_required: bool,
    pub consumer_id: ConsumerId,
    pub destination: Option<Destination>,
    /// `None` signals a pull timeout: no message was available.
    pub message: Option<Box<Message>>,
    pub redelivery_counter: i32,
}

/// Client-to-broker acknowledgement of a contiguous message range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageAck {
    pub command_id: i32,
    pub response_required: bool,
    pub ack_type: AckType,
    pub consumer_id: ConsumerId,
    pub destination: Option<Destination>,
    pub transaction_id: Option<LocalTransactionId>,
    pub first_message_id: Option<MessageId>,
    pub last_message_id: Option<MessageId>,
    pub message_count: i32,
}

/// Asks the broker for one message when prefetch is zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePull {
    pub command_id: i32,
    pub response_required: bool,
    pub consumer_id: ConsumerId,
    pub destination: Option<Destination>,
    /// Milliseconds to wait broker-side; `-1` means only if already queued.
    pub timeout: i64,
}

/// Begin/commit/rollback of a client-local transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionInfo {
    pub command_id: i32,
    pub response_required: bool,
    pub connection_id: ConnectionId,
    pub transaction_id: Option<LocalTransactionId>,
    pub transaction_type: TransactionType,
}

/// Orderly shutdown notice.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShutdownInfo {
    pub command_id: i32,
    pub response_required: bool,
}

/// Liveness probe; answered in kind when a response is required.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeepAliveInfo {
    pub command_id: i32,
    pub response_required: bool,
}

/// Successful completion of a correlated request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub command_id: i32,
    pub response_required: bool,
    pub correlation_id: i32,
}

/// Failed completion of a correlated request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExceptionResponse {
    pub command_id: i32,
    pub response_required: bool,
    pub correlation_id: i32,
    pub exception: BrokerError,
}

/// An asynchronous connection-level failure reported by the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionError {
    pub command_id: i32,
    pub response_required: bool,
    pub connection_id: Option<ConnectionId>,
    pub exception: BrokerError,
}

/// The closed union of protocol commands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[allow(clippy::large_enum_variant)]
pub enum Command {
    WireFormatInfo(WireFormatInfo),
    BrokerInfo(BrokerInfo),
    ConnectionInfo(ConnectionInfo),
    SessionInfo(SessionInfo),
    ConsumerInfo(ConsumerInfo),
    ProducerInfo(ProducerInfo),
    RemoveInfo(RemoveInfo),
    RemoveSubscriptionInfo(RemoveSubscriptionInfo),
    DestinationInfo(DestinationInfo),
    Message(Box<Message>),
    MessageDispatch(Box<MessageDispatch>),
    MessageAck(MessageAck),
    MessagePull(MessagePull),
    TransactionInfo(TransactionInfo),
    ShutdownInfo(ShutdownInfo),
    KeepAliveInfo(KeepAliveInfo),
    Response(Response),
    ExceptionResponse(ExceptionResponse),
    ConnectionError(ConnectionError),
}

impl Command {
    /// The wire tag this command marshals under.
    pub fn data_structure_type(&self) -> u8 {
        match self {
            Command::WireFormatInfo(_) => types::WIREFORMAT_INFO,
            Command::BrokerInfo(_) => types::BROKER_INFO,
            Command::ConnectionInfo(_) => types::CONNECTION_INFO,
            Command::SessionInfo(_) => types::SESSION_INFO,
            Command::ConsumerInfo(_) => types::CONSUMER_INFO,
            Command::ProducerInfo(_) => types::PRODUCER_INFO,
            Command::RemoveInfo(_) => types::REMOVE_INFO,
            Command::RemoveSubscriptionInfo(_) => types::REMOVE_SUBSCRIPTION_INFO,
            Command::DestinationInfo(_) => types::DESTINATION_INFO,
            Command::Message(message) => match message.body {
                MessageBody::Empty => types::MESSAGE,
                MessageBody::Text(_) => types::TEXT_MESSAGE,
                MessageBody::Bytes(_) => types::BYTES_MESSAGE,
                MessageBody::Map(_) => types::MAP_MESSAGE,
                MessageBody::Stream(_) => types::STREAM_MESSAGE,
                MessageBody::Object(_) => types::OBJECT_MESSAGE,
            },
            Command::MessageDispatch(_) => types::MESSAGE_DISPATCH,
            Command::MessageAck(_) => types::MESSAGE_ACK,
            Command::MessagePull(_) => types::MESSAGE_PULL,
            Command::TransactionInfo(_) => types::TRANSACTION_INFO,
            Command::ShutdownInfo(_) => types::SHUTDOWN_INFO,
            Command::KeepAliveInfo(_) => types::KEEP_ALIVE_INFO,
            Command::Response(_) => types::RESPONSE,
            Command::ExceptionResponse(_) => types::EXCEPTION_RESPONSE,
            Command::ConnectionError(_) => types::CONNECTION_ERROR,
        }
    }

    /// The correlation command id.
    pub fn command_id(&self) -> i32 {
        match self {
            Command::WireFormatInfo(c) => c.command_id,
            Command::BrokerInfo(c) => c.command_id,
            Command::ConnectionInfo(c) => c.command_id,
            Command::SessionInfo(c) => c.command_id,
            Command::ConsumerInfo(c) => c.command_id,
            Command::ProducerInfo(c) => c.command_id,
            Command::RemoveInfo(c) => c.command_id,
            Command::RemoveSubscriptionInfo(c) => c.command_id,
            Command::DestinationInfo(c) => c.command_id,
            Command::Message(_) => 0,
            Command::MessageDispatch(c) => c.command_id,
            Command::MessageAck(c) => c.command_id,
            Command::MessagePull(c) => c.command_id,
            Command::TransactionInfo(c) => c.command_id,
            Command::ShutdownInfo(c) => c.command_id,
            Command::KeepAliveInfo(c) => c.command_id,
            Command::Response(c) => c.command_id,
            Command::ExceptionResponse(c) => c.command_id,
            Command::ConnectionError(c) => c.command_id,
        }
    }

    /// Stamps the correlation command id before a request goes out.
    pub fn set_command_id(&mut self, id: i32) {
        match self {
            Command::WireFormatInfo(c) => c.command_id = id,
            Command::BrokerInfo(c) => c.command_id = id,
            Command::ConnectionInfo(c) => c.command_id = id,
            Command::SessionInfo(c) => c.command_id = id,
            Command::ConsumerInfo(c) => c.command_id = id,
            Command::ProducerInfo(c) => c.command_id = id,
            Command::RemoveInfo(c) => c.command_id = id,
            Command::RemoveSubscriptionInfo(c) => c.command_id = id,
            Command::DestinationInfo(c) => c.command_id = id,
            Command::Message(_) => {}
            Command::MessageDispatch(c) => c.command_id = id,
            Command::MessageAck(c) => c.command_id = id,
            Command::MessagePull(c) => c.command_id = id,
            Command::TransactionInfo(c) => c.command_id = id,
            Command::ShutdownInfo(c) => c.command_id = id,
            Command::KeepAliveInfo(c) => c.command_id = id,
            Command::Response(c) => c.command_id = id,
            Command::ExceptionResponse(c) => c.command_id = id,
            Command::ConnectionError(c) => c.command_id = id,
        }
    }

    /// Flags the command as expecting a correlated response.
    pub fn set_response_required(&mut self, required: bool) {
        match self {
            Command::WireFormatInfo(c) => c.response_required = required,
            Command::BrokerInfo(c) => c.response_required = required,
            Command::ConnectionInfo(c) => c.response_required = required,
            Command::SessionInfo(c) => c.response_required = required,
            Command::ConsumerInfo(c) => c.response_required = required,
            Command::ProducerInfo(c) => c.response_required = required,
            Command::RemoveInfo(c) => c.response_required = required,
            Command::RemoveSubscriptionInfo(c) => c.response_required = required,
            Command::DestinationInfo(c) => c.response_required = required,
            Command::Message(_) => {}
            Command::MessageDispatch(c) => c.response_required = required,
            Command::MessageAck(c) => c.response_required = required,
            Command::MessagePull(c) => c.response_required = required,
            Command::TransactionInfo(c) => c.response_required = required,
            Command::ShutdownInfo(c) => c.response_required = required,
            Command::KeepAliveInfo(c) => c.response_required = required,
            Command::Response(c) => c.response_required = required,
            Command::ExceptionResponse(c) => c.response_required = required,
            Command::ConnectionError(c) => c.response_required = required,
        }
    }

    /// True for `Response` and `ExceptionResponse`.
    pub fn is_response(&self) -> bool {
        matches!(self, Command::Response(_) | Command::ExceptionResponse(_))
    }

    /// A short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Command::WireFormatInfo(_) => "WireFormatInfo",
            Command::BrokerInfo(_) => "BrokerInfo",
            Command::ConnectionInfo(_) => "ConnectionInfo",
            Command::SessionInfo(_) => "SessionInfo",
            Command::ConsumerInfo(_) => "ConsumerInfo",
            Command::ProducerInfo(_) => "ProducerInfo",
            Command::RemoveInfo(_) => "RemoveInfo",
            Command::RemoveSubscriptionInfo(_) => "RemoveSubscriptionInfo",
            Command::DestinationInfo(_) => "DestinationInfo",
            Command::Message(_) => "Message",
            Command::MessageDispatch(_) => "MessageDispatch",
            Command::MessageAck(_) => "MessageAck",
            Command::MessagePull(_) => "MessagePull",
            Command::TransactionInfo(_) => "TransactionInfo",
            Command::ShutdownInfo(_) => "ShutdownInfo",
            Command::KeepAliveInfo(_) => "KeepAliveInfo",
            Command::Response(_) => "Response",
            Command::ExceptionResponse(_) => "ExceptionResponse",
            Command::ConnectionError(_) => "ConnectionError",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_tag_tracks_body_kind() {
        assert_eq!(
            Command::Message(Box::new(Message::text("t"))).data_structure_type(),
            types::TEXT_MESSAGE
        );
        assert_eq!(
            Command::Message(Box::new(Message::bytes(vec![1]))).data_structure_type(),
            types::BYTES_MESSAGE
        );
        assert_eq!(
            Command::Message(Box::new(Message::default())).data_structure_type(),
            types::MESSAGE
        );
    }

    #[test]
    fn command_id_round_trips_through_setter() {
        let mut cmd = Command::KeepAliveInfo(KeepAliveInfo::default());
        cmd.set_command_id(42);
        assert_eq!(cmd.command_id(), 42);
    }

    #[test]
    fn responses_are_recognised() {
        assert!(Command::Response(Response::default()).is_response());
        assert!(Command::ExceptionResponse(ExceptionResponse::default()).is_response());
        assert!(!Command::KeepAliveInfo(KeepAliveInfo::default()).is_response());
    }

    #[test]
    fn ack_types_round_trip_wire_values() {
        for ack in [
            AckType::Delivered,
            AckType::Poison,
            AckType::Consumed,
            AckType::Redelivered,
            AckType::Individual,
        ] {
            assert_eq!(AckType::from_wire(ack as u8), Some(ack));
        }
        assert_eq!(AckType::from_wire(9), None);
    }
}
