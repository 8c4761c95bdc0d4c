//! Protocol identifiers and their generation rules.
//!
//! Every id is scoped by its parent: sessions number themselves within a
//! connection, consumers and producers within a session, messages within a
//! producer. Sequences only move forward, so an id is never reused for the
//! lifetime of its parent.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque identifier minted once per connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId {
    value: String,
}

impl ConnectionId {
    /// Mints a fresh connection id.
    pub fn generate() -> Self {
        Self {
            value: format!("ID:{}", Uuid::new_v4()),
        }
    }

    /// Wraps an existing identifier (used when decoding).
    pub fn from_value(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
        }
    }

    /// The wire representation.
    pub fn value(&self) -> &str {
        &self.value
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

/// Identifies a session within its connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId {
    pub connection_id: ConnectionId,
    pub value: i64,
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.connection_id, self.value)
    }
}

/// Identifies a consumer within its session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConsumerId {
    pub connection_id: ConnectionId,
    pub session_id: i64,
    pub value: i64,
}

impl ConsumerId {
    /// Builds the next consumer id under a session.
    pub fn new(session: &SessionId, value: i64) -> Self {
        Self {
            connection_id: session.connection_id.clone(),
            session_id: session.value,
            value,
        }
    }
}

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.connection_id, self.session_id, self.value)
    }
}

/// Identifies a producer within its session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProducerId {
    pub connection_id: ConnectionId,
    pub session_id: i64,
    pub value: i64,
}

impl ProducerId {
    /// Builds the next producer id under a session.
    pub fn new(session: &SessionId, value: i64) -> Self {
        Self {
            connection_id: session.connection_id.clone(),
            session_id: session.value,
            value,
        }
    }
}

impl fmt::Display for ProducerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.connection_id, self.session_id, self.value)
    }
}

/// Identifies a message: the producer that sent it plus two sequences.
///
/// The producer sequence is client-assigned at send time; the broker
/// sequence is stamped broker-side and totally orders deliveries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId {
    pub producer_id: ProducerId,
    pub producer_sequence_id: i64,
    pub broker_sequence_id: i64,
}

impl MessageId {
    /// A client-assigned id; the broker sequence is filled in later.
    pub fn new(producer_id: ProducerId, producer_sequence_id: i64) -> Self {
        Self {
            producer_id,
            producer_sequence_id,
            broker_sequence_id: 0,
        }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.producer_id, self.producer_sequence_id)
    }
}

/// Identifies a client-local transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LocalTransactionId {
    pub connection_id: ConnectionId,
    pub value: i64,
}

impl fmt::Display for LocalTransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TX:{}:{}", self.connection_id, self.value)
    }
}

/// Monotonic sequence shared by the id factories on a parent object.
#[derive(Debug, Default)]
pub struct SequenceGenerator {
    next: AtomicI64,
}

impl SequenceGenerator {
    /// Starts the sequence at one.
    pub fn new() -> Self {
        Self {
            next: AtomicI64::new(1),
        }
    }

    /// Hands out the next value; values are never reissued.
    pub fn next(&self) -> i64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_connection_ids_are_unique() {
        let a = ConnectionId::generate();
        let b = ConnectionId::generate();
        assert_ne!(a, b);
        assert!(a.value().starts_with("ID:"));
    }

    #[test]
    fn sequences_never_repeat() {
        let seq = SequenceGenerator::new();
        let first = seq.next();
        let second = seq.next();
        assert_eq!(first, 1);
        assert_eq!(second, 2);
    }

    #[test]
    fn child_ids_carry_parent_scope() {
        let conn = ConnectionId::from_value("ID:test-1");
        let session = SessionId {
            connection_id: conn.clone(),
            value: 2,
        };
        let consumer = ConsumerId::new(&session, 7);
        assert_eq!(consumer.to_string(), "ID:test-1:2:7");
    }
}
