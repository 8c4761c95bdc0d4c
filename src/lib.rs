//! # openwire-cms - JMS-style broker client over OpenWire
//!
//! A client-side runtime for messaging against an OpenWire broker: the
//! binary wire-format codec (tight and loose encodings, versioned
//! marshallers, negotiated feature flags), the connection/session/consumer/
//! producer object graph with JMS session semantics, the consumer dispatch
//! and acknowledgement engine (prefetch window, four ack modes, pending-ack
//! coalescing, redelivery and poison handling), and a pooled [`CmsTemplate`]
//! send/receive façade.
//!
//! The broker itself, transport framing, TLS, and reconnection are external
//! collaborators reached through the [`transport::Transport`] and
//! [`factory::TransportConnector`] seams.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use openwire_cms::{AckMode, ConnectionFactory, ConnectionOptions, Destination, Message};
//! # use openwire_cms::factory::TransportConnector;
//!
//! # async fn example(connector: Arc<dyn TransportConnector>) -> openwire_cms::CmsResult<()> {
//! let factory = ConnectionFactory::new(
//!     "tcp://broker:61616?connection.useAsyncSend=true",
//!     ConnectionOptions::default(),
//!     connector,
//! )?;
//! let connection = factory.create_connection().await?;
//! connection.start()?;
//!
//! let session = connection.create_session(AckMode::Auto).await?;
//! let queue = Destination::queue("orders");
//! let producer = session.create_producer(Some(&queue)).await?;
//! producer.send(Message::text("hello")).await?;
//!
//! let consumer = session.create_consumer(&queue).await?;
//! let received = consumer.receive_timeout(std::time::Duration::from_secs(1)).await?;
//! assert!(received.is_some());
//!
//! connection.close().await?;
//! # Ok(())
//! # }
//! ```

// Core modules
pub mod codec;
pub mod commands;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod dispatch;
pub mod error;
pub mod factory;
pub mod policy;
pub mod producer;
pub mod session;
pub mod template;
pub mod transport;

// Re-export the client-facing surface
pub use crate::codec::{OpenWireFormat, WireFormatOptions};
pub use crate::commands::{
    AckType, Command, ConnectionId, ConsumerId, Destination, DestinationKind, Message, MessageBody,
    MessageId, PrimitiveValue, ProducerId, SessionId,
};
pub use crate::config::{ConnectionOptions, PrefetchPolicy, PrefetchSize, SendTimeoutMs};
pub use crate::connection::{Connection, ExceptionListener};
pub use crate::consumer::{MessageConsumer, MessageListener};
pub use crate::error::{CmsError, CmsResult, CodecError, TransportError};
pub use crate::factory::{CmsRuntime, ConnectionFactory};
pub use crate::policy::{RedeliveryDelayPolicy, RedeliveryPolicy};
pub use crate::producer::{MessageProducer, SendOptions};
pub use crate::session::{AckMode, Session};
pub use crate::template::{CmsTemplate, MessageCreator};
