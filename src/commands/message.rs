//! The message model: common headers plus a body variant per JMS type.
//!
//! The five JMS message classes collapse into one struct whose body is a
//! tagged variant; marshallers pick the wire tag from the body kind. Header
//! fields shared by every kind live on the struct itself.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::commands::destination::Destination;
use crate::commands::ids::{LocalTransactionId, MessageId};

/// A typed header or map-body value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PrimitiveValue {
    Bool(bool),
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    String(String),
    Bytes(Vec<u8>),
}

/// The body variant; selects the wire tag the message marshals under.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MessageBody {
    /// No payload; a bare header-only message.
    Empty,
    /// UTF-8 text.
    Text(String),
    /// Opaque bytes.
    Bytes(Vec<u8>),
    /// Ordered name/value pairs.
    Map(BTreeMap<String, PrimitiveValue>),
    /// A sequence of typed values read back in write order.
    Stream(Vec<PrimitiveValue>),
    /// A serialized object blob the client never interprets.
    Object(Vec<u8>),
}

/// Milliseconds since the Unix epoch, the protocol's clock domain.
pub fn unix_millis_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// A protocol message: shared headers, typed properties, one body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Message {
    pub message_id: Option<MessageId>,
    pub destination: Option<Destination>,
    pub transaction_id: Option<LocalTransactionId>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<Destination>,
    /// True for PERSISTENT delivery mode.
    pub persistent: bool,
    /// JMS priority, 0..=9.
    pub priority: u8,
    /// Send timestamp in epoch millis; zero when stamping is disabled.
    pub timestamp: i64,
    /// Absolute expiration in epoch millis; zero means never expires.
    pub expiration: i64,
    pub redelivered: bool,
    pub redelivery_counter: i32,
    /// Application-set JMS type name.
    pub message_type: Option<String>,
    pub properties: BTreeMap<String, PrimitiveValue>,
    pub body: MessageBody,
    /// Cached wire form for bodies serialized once and re-sent.
    ///
    /// Not part of message identity; equality ignores it.
    #[serde(skip)]
    pub marshalled_form: Option<Vec<u8>>,
}

impl Default for MessageBody {
    fn default() -> Self {
        MessageBody::Empty
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.message_id == other.message_id
            && self.destination == other.destination
            && self.transaction_id == other.transaction_id
            && self.correlation_id == other.correlation_id
            && self.reply_to == other.reply_to
            && self.persistent == other.persistent
            && self.priority == other.priority
            && self.timestamp == other.timestamp
            && self.expiration == other.expiration
            && self.redelivered == other.redelivered
            && self.redelivery_counter == other.redelivery_counter
            && self.message_type == other.message_type
            && self.properties == other.properties
            && self.body == other.body
    }
}

impl Message {
    /// A text message with default headers.
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            body: MessageBody::Text(body.into()),
            priority: 4,
            ..Self::default()
        }
    }

    /// A bytes message with default headers.
    pub fn bytes(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: MessageBody::Bytes(body.into()),
            priority: 4,
            ..Self::default()
        }
    }

    /// A map message with default headers.
    pub fn map(entries: BTreeMap<String, PrimitiveValue>) -> Self {
        Self {
            body: MessageBody::Map(entries),
            priority: 4,
            ..Self::default()
        }
    }

    /// The text payload, if this is a text message.
    pub fn body_text(&self) -> Option<&str> {
        match &self.body {
            MessageBody::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Sets a typed property, replacing any previous value.
    pub fn set_property(&mut self, name: impl Into<String>, value: PrimitiveValue) {
        self.properties.insert(name.into(), value);
    }

    /// Reads a property by name.
    pub fn property(&self, name: &str) -> Option<&PrimitiveValue> {
        self.properties.get(name)
    }

    /// Whether the message has outlived its expiration at `now` (epoch ms).
    pub fn is_expired_at(&self, now: i64) -> bool {
        self.expiration > 0 && now > self.expiration
    }

    /// Whether the message has outlived its expiration right now.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(unix_millis_now())
    }
}
