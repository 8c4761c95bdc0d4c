//! `CmsTemplate`: a pooled send/receive façade.
//!
//! The template owns configuration, never connections. Every operation
//! borrows a connection from the factory, opens a session, resolves the
//! destination, performs exactly one send or receive, and closes everything
//! in reverse order. Resolved destinations are cached behind a read-write
//! lock; the default destination is fixed at configuration time.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::commands::{Destination, Message};
use crate::connection::Connection;
use crate::consumer::MessageConsumer;
use crate::error::{CmsError, CmsResult};
use crate::factory::ConnectionFactory;
use crate::producer::SendOptions;
use crate::session::{AckMode, Session};

/// Builds a message inside an open session on the template's behalf.
pub trait MessageCreator: Send + Sync {
    /// Produces the message to send.
    fn create_message(&self, session: &Session) -> CmsResult<Message>;
}

impl<F> MessageCreator for F
where
    F: Fn(&Session) -> CmsResult<Message> + Send + Sync,
{
    fn create_message(&self, session: &Session) -> CmsResult<Message> {
        self(session)
    }
}

/// Reusable send/receive operations bound to one connection factory.
pub struct CmsTemplate {
    factory: Arc<ConnectionFactory>,
    default_destination_name: Option<String>,
    /// Topics when true, queues when false.
    pub_sub_domain: bool,
    default_selector: Option<String>,
    /// Zero blocks indefinitely.
    receive_timeout: Duration,
    /// When false, sends use the producer defaults instead of the
    /// template's QoS settings.
    explicit_qos_enabled: bool,
    qos: SendOptions,
    resolved: RwLock<HashMap<String, Destination>>,
}

impl CmsTemplate {
    /// A template with JMS-style defaults: queues, indefinite receives,
    /// persistent delivery.
    pub fn new(factory: Arc<ConnectionFactory>) -> Self {
        Self {
            factory,
            default_destination_name: None,
            pub_sub_domain: false,
            default_selector: None,
            receive_timeout: Duration::ZERO,
            explicit_qos_enabled: false,
            qos: SendOptions::default(),
            resolved: RwLock::new(HashMap::new()),
        }
    }

    /// Names the destination used when an operation omits one.
    pub fn with_default_destination_name(mut self, name: impl Into<String>) -> Self {
        self.default_destination_name = Some(name.into());
        self
    }

    /// Selects topics rather than queues for name resolution.
    pub fn with_pub_sub_domain(mut self, pub_sub: bool) -> Self {
        self.pub_sub_domain = pub_sub;
        self
    }

    /// Sets the default selector applied by `receive`.
    pub fn with_default_selector(mut self, selector: impl Into<String>) -> Self {
        self.default_selector = Some(selector.into());
        self
    }

    /// Bounds every receive; zero waits indefinitely.
    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }

    /// Enables the template's explicit QoS on sends.
    pub fn with_explicit_qos(mut self, qos: SendOptions) -> Self {
        self.explicit_qos_enabled = true;
        self.qos = qos;
        self
    }

    /// Sends a creator-built message to the default destination.
    pub async fn send(&self, creator: &dyn MessageCreator) -> CmsResult<()> {
        let name = self.default_destination_name.clone().ok_or_else(|| {
            CmsError::illegal_state("no default destination configured on this template")
        })?;
        self.send_to_name(&name, creator).await
    }

    /// Sends a creator-built message to a named destination.
    pub async fn send_to_name(&self, name: &str, creator: &dyn MessageCreator) -> CmsResult<()> {
        let destination = self.resolve_destination_name(name);
        self.send_to(&destination, creator).await
    }

    /// Sends a creator-built message to an explicit destination.
    pub async fn send_to(
        &self,
        destination: &Destination,
        creator: &dyn MessageCreator,
    ) -> CmsResult<()> {
        self.execute(|_connection, session| async move {
            let producer = session.create_producer(Some(destination)).await?;
            let message = creator.create_message(&session)?;
            let result = if self.explicit_qos_enabled {
                producer.send_with(destination, message, self.qos).await
            } else {
                producer.send(message).await
            };
            producer.close().await?;
            result
        })
        .await
    }

    /// Receives one message from the default destination.
    pub async fn receive(&self) -> CmsResult<Option<Message>> {
        let name = self.default_destination_name.clone().ok_or_else(|| {
            CmsError::illegal_state("no default destination configured on this template")
        })?;
        self.receive_from_name(&name).await
    }

    /// Receives one message from a named destination.
    pub async fn receive_from_name(&self, name: &str) -> CmsResult<Option<Message>> {
        let destination = self.resolve_destination_name(name);
        self.receive_from(&destination).await
    }

    /// Receives one message from an explicit destination.
    pub async fn receive_from(&self, destination: &Destination) -> CmsResult<Option<Message>> {
        self.receive_selected_from(destination, self.default_selector.as_deref())
            .await
    }

    /// Receives one message matching a selector from the default
    /// destination.
    pub async fn receive_selected(&self, selector: &str) -> CmsResult<Option<Message>> {
        let name = self.default_destination_name.clone().ok_or_else(|| {
            CmsError::illegal_state("no default destination configured on this template")
        })?;
        let destination = self.resolve_destination_name(&name);
        self.receive_selected_from(&destination, Some(selector))
            .await
    }

    async fn receive_selected_from(
        &self,
        destination: &Destination,
        selector: Option<&str>,
    ) -> CmsResult<Option<Message>> {
        let timeout = self.receive_timeout;
        self.execute(|_connection, session| async move {
            let consumer = session
                .create_consumer_with(destination, selector, false)
                .await?;
            let message = Self::receive_with_timeout(&consumer, timeout).await;
            consumer.close().await?;
            message
        })
        .await
    }

    async fn receive_with_timeout(
        consumer: &MessageConsumer,
        timeout: Duration,
    ) -> CmsResult<Option<Message>> {
        if timeout.is_zero() {
            consumer.receive().await
        } else {
            consumer.receive_timeout(timeout).await
        }
    }

    /// Borrows a connection and session for one operation, closing both in
    /// reverse order whatever the outcome.
    async fn execute<'a, F, Fut, T>(&'a self, operation: F) -> CmsResult<T>
    where
        F: FnOnce(Connection, Session) -> Fut,
        Fut: Future<Output = CmsResult<T>> + 'a,
    {
        let connection = self.factory.create_connection().await?;
        connection.start()?;
        let session = match connection.create_session(AckMode::Auto).await {
            Ok(session) => session,
            Err(err) => {
                let _ = connection.close().await;
                return Err(err);
            }
        };

        let result = operation(connection.clone(), session.clone()).await;

        let _ = session.close().await;
        let _ = connection.close().await;
        result
    }

    /// Resolves a destination name within the configured domain, caching
    /// the result.
    fn resolve_destination_name(&self, name: &str) -> Destination {
        if let Ok(resolved) = self.resolved.read() {
            if let Some(destination) = resolved.get(name) {
                return destination.clone();
            }
        }
        let destination = if self.pub_sub_domain {
            Destination::topic(name)
        } else {
            Destination::queue(name)
        };
        if let Ok(mut resolved) = self.resolved.write() {
            resolved.insert(name.to_string(), destination.clone());
        }
        destination
    }
}
