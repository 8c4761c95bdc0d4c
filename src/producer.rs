//! The message producer: send-time QoS and header stamping.

use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crate::commands::{Destination, Message, MessageId, ProducerId, ProducerInfo, unix_millis_now};
use crate::connection::lock;
use crate::error::{CmsError, CmsResult};
use crate::session::SessionInner;

/// Per-send quality-of-service knobs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SendOptions {
    /// PERSISTENT delivery when true.
    pub persistent: bool,
    /// JMS priority, 0..=9.
    pub priority: u8,
    /// Milliseconds until expiry; zero never expires.
    pub time_to_live_ms: u64,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            persistent: true,
            priority: 4,
            time_to_live_ms: 0,
        }
    }
}

/// Publishes messages through its owning session.
#[derive(Clone)]
pub struct MessageProducer {
    inner: Arc<ProducerInner>,
}

pub(crate) struct ProducerInner {
    info: ProducerInfo,
    session: Weak<SessionInner>,
    message_ids: crate::commands::SequenceGenerator,
    defaults: StdMutex<SendOptions>,
    disable_message_id: AtomicBool,
    disable_message_timestamp: AtomicBool,
    closed: AtomicBool,
}

impl MessageProducer {
    pub(crate) fn from_inner(inner: Arc<ProducerInner>) -> Self {
        Self { inner }
    }

    /// This producer's id.
    pub fn producer_id(&self) -> &ProducerId {
        &self.inner.info.producer_id
    }

    /// Replaces the default QoS used by [`MessageProducer::send`].
    pub fn set_defaults(&self, defaults: SendOptions) -> CmsResult<()> {
        if defaults.priority > 9 {
            return Err(CmsError::invalid_argument(format!(
                "priority out of range: {}",
                defaults.priority
            )));
        }
        *lock(&self.inner.defaults) = defaults;
        Ok(())
    }

    /// The current default QoS.
    pub fn defaults(&self) -> SendOptions {
        *lock(&self.inner.defaults)
    }

    /// Skips message-id stamping on future sends.
    pub fn set_disable_message_id(&self, disable: bool) {
        self.inner.disable_message_id.store(disable, Ordering::SeqCst);
    }

    /// Skips timestamp stamping on future sends.
    pub fn set_disable_message_timestamp(&self, disable: bool) {
        self.inner
            .disable_message_timestamp
            .store(disable, Ordering::SeqCst);
    }

    /// Sends to this producer's fixed destination with default QoS.
    pub async fn send(&self, message: Message) -> CmsResult<()> {
        let destination = self.inner.info.destination.clone().ok_or_else(|| {
            CmsError::illegal_state("producer has no destination; use send_to")
        })?;
        let defaults = self.defaults();
        self.inner.send_with(&destination, message, defaults).await
    }

    /// Sends to an explicit destination with default QoS.
    pub async fn send_to(&self, destination: &Destination, message: Message) -> CmsResult<()> {
        let defaults = self.defaults();
        self.inner.send_with(destination, message, defaults).await
    }

    /// Sends with explicit QoS.
    pub async fn send_with(
        &self,
        destination: &Destination,
        message: Message,
        options: SendOptions,
    ) -> CmsResult<()> {
        self.inner.send_with(destination, message, options).await
    }

    /// Closes the producer. Idempotent.
    pub async fn close(&self) -> CmsResult<()> {
        self.inner.do_close().await;
        Ok(())
    }
}

impl ProducerInner {
    pub(crate) fn create(info: ProducerInfo, session: Weak<SessionInner>) -> Arc<Self> {
        Arc::new(Self {
            info,
            session,
            message_ids: crate::commands::SequenceGenerator::new(),
            defaults: StdMutex::new(SendOptions::default()),
            disable_message_id: AtomicBool::new(false),
            disable_message_timestamp: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    pub(crate) fn info(&self) -> &ProducerInfo {
        &self.info
    }

    async fn send_with(
        &self,
        destination: &Destination,
        mut message: Message,
        options: SendOptions,
    ) -> CmsResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CmsError::AlreadyClosed {
                resource: "producer",
            });
        }
        if options.priority > 9 {
            return Err(CmsError::invalid_argument(format!(
                "priority out of range: {}",
                options.priority
            )));
        }
        let session = self.session.upgrade().ok_or(CmsError::AlreadyClosed {
            resource: "session",
        })?;

        message.destination = Some(destination.clone());
        message.persistent = options.persistent;
        message.priority = options.priority;

        if !self.disable_message_id.load(Ordering::SeqCst) {
            message.message_id = Some(MessageId::new(
                self.info.producer_id.clone(),
                self.message_ids.next(),
            ));
        }
        let now = unix_millis_now();
        if !self.disable_message_timestamp.load(Ordering::SeqCst) {
            message.timestamp = now;
        }
        message.expiration = if options.time_to_live_ms > 0 {
            now + options.time_to_live_ms as i64
        } else {
            0
        };

        session.send_message(message).await
    }

    pub(crate) async fn do_close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(session) = self.session.upgrade() {
            session.remove_producer(&self.info.producer_id).await;
        }
    }
}
