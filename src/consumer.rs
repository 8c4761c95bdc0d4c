//! The consumer engine: prefetch window, ack modes, redelivery.
//!
//! Inbound dispatches land in the unconsumed channel (or go straight to a
//! registered listener). The dispatched log tracks messages handed to the
//! user but not yet settled; the pending-ack buffer coalesces acks until
//! half the prefetch window is outstanding. Rollback pushes the dispatched
//! log back to the front of the unconsumed channel so order survives, and
//! poisons the range once the redelivery policy is exhausted.

use std::collections::VecDeque;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::commands::{
    AckType, Command, ConsumerId, ConsumerInfo, Message, MessageAck, MessageDispatch, MessageId,
    MessagePull,
};
use crate::connection::lock;
use crate::dispatch::DispatchChannel;
use crate::error::{CmsError, CmsResult};
use crate::policy::{RedeliveryDelayPolicy, RedeliveryPolicy};
use crate::session::{SessionInner, TransactionSynchronization};

/// Callback invoked for each delivered message in listener mode.
///
/// Errors are forwarded to the connection's exception listener; dispatch
/// continues with the next message.
pub trait MessageListener: Send + Sync {
    /// Handles one delivered message.
    fn on_message(&self, message: Message) -> CmsResult<()>;
}

impl<F> MessageListener for F
where
    F: Fn(Message) -> CmsResult<()> + Send + Sync,
{
    fn on_message(&self, message: Message) -> CmsResult<()> {
        self(message)
    }
}

/// Coalescing state guarded by one mutex.
#[derive(Default)]
struct AckState {
    pending_ack: Option<MessageAck>,
    delivered_counter: i32,
    additional_window: i32,
}

/// A message consumer bound to one destination.
#[derive(Clone)]
pub struct MessageConsumer {
    inner: Arc<ConsumerInner>,
}

pub(crate) struct ConsumerInner {
    info: ConsumerInfo,
    session: Weak<SessionInner>,
    unconsumed: DispatchChannel<MessageDispatch>,
    /// Front is the most recently dispatched message.
    dispatched: StdMutex<VecDeque<MessageDispatch>>,
    ack_state: StdMutex<AckState>,
    delivering_acks: AtomicBool,
    listener: StdMutex<Option<Arc<dyn MessageListener>>>,
    last_delivered_sequence_id: AtomicI64,
    redelivery_delay: AtomicU64,
    redelivery_policy: RedeliveryPolicy,
    delay_policy: RedeliveryDelayPolicy,
    synchronization_registered: AtomicBool,
    in_progress_clear_required: AtomicBool,
    closed: AtomicBool,
}

impl MessageConsumer {
    pub(crate) fn from_inner(inner: Arc<ConsumerInner>) -> Self {
        Self { inner }
    }

    /// This consumer's id.
    pub fn consumer_id(&self) -> &ConsumerId {
        &self.inner.info.consumer_id
    }

    /// The selector this consumer registered, if any.
    pub fn message_selector(&self) -> Option<&str> {
        self.inner.info.selector.as_deref()
    }

    /// Messages queued locally and not yet handed to the user.
    pub fn available_count(&self) -> usize {
        self.inner.unconsumed.len()
    }

    /// Blocks until a message arrives or the consumer closes.
    ///
    /// In pull mode (prefetch zero) an open-ended pull request goes out
    /// first. Returns `Ok(None)` only on closure.
    pub async fn receive(&self) -> CmsResult<Option<Message>> {
        self.inner.check_closed()?;
        self.inner.send_pull(0).await?;
        self.inner.consume_one(None).await
    }

    /// As [`MessageConsumer::receive`] with an absolute deadline.
    ///
    /// Expired messages popped along the way are skipped; the wait keeps
    /// going until the same deadline.
    pub async fn receive_timeout(&self, timeout: Duration) -> CmsResult<Option<Message>> {
        self.inner.check_closed()?;
        self.inner.send_pull(timeout.as_millis() as i64).await?;
        self.inner.consume_one(Some(timeout)).await
    }

    /// Returns immediately with a message or nothing.
    pub async fn receive_no_wait(&self) -> CmsResult<Option<Message>> {
        self.inner.check_closed()?;
        self.inner.send_pull(-1).await?;
        self.inner.consume_one(Some(Duration::ZERO)).await
    }

    /// Installs or clears the asynchronous listener.
    ///
    /// Installing redispatches the queued backlog through the session
    /// executor so the listener observes every message in order.
    pub async fn set_message_listener(
        &self,
        listener: Option<Arc<dyn MessageListener>>,
    ) -> CmsResult<()> {
        self.inner.check_closed()?;
        if listener.is_some() && self.inner.info.prefetch_size == 0 {
            return Err(CmsError::illegal_state(
                "cannot deliver asynchronously when prefetch is zero",
            ));
        }
        match listener {
            Some(listener) => {
                let session = self.inner.session()?;
                let was_started = session.is_started();
                if was_started {
                    session.stop();
                }
                *lock(&self.inner.listener) = Some(listener);
                session.redispatch(&self.inner.unconsumed);
                if was_started {
                    session.start();
                }
            }
            None => {
                *lock(&self.inner.listener) = None;
            }
        }
        Ok(())
    }

    /// Individually acknowledges one received message.
    ///
    /// Only legal in individual-acknowledge mode; sends a CONSUMED ack
    /// covering exactly that message.
    pub async fn acknowledge_message(&self, message: &Message) -> CmsResult<()> {
        self.inner.check_closed()?;
        let session = self.inner.session()?;
        if session.ack_mode != crate::session::AckMode::Individual {
            return Err(CmsError::illegal_state(
                "session is not in individual-acknowledge mode",
            ));
        }
        let Some(message_id) = message.message_id.clone() else {
            return Err(CmsError::invalid_argument("message has no id"));
        };

        {
            let mut dispatched = lock(&self.inner.dispatched);
            if let Some(index) = dispatched.iter().position(|d| {
                d.message
                    .as_deref()
                    .and_then(|m| m.message_id.as_ref())
                    .is_some_and(|id| *id == message_id)
            }) {
                dispatched.remove(index);
            }
        }

        let ack = MessageAck {
            command_id: 0,
            response_required: false,
            ack_type: AckType::Consumed,
            consumer_id: self.inner.info.consumer_id.clone(),
            destination: Some(self.inner.info.destination.clone()),
            transaction_id: None,
            first_message_id: Some(message_id.clone()),
            last_message_id: Some(message_id),
            message_count: 1,
        };
        self.inner.oneway_ack(ack).await
    }

    /// Closes the consumer.
    ///
    /// Inside an open transaction the close defers to a synchronization and
    /// completes when the transaction ends; otherwise it happens now.
    /// Idempotent.
    pub async fn close(&self) -> CmsResult<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(session) = self.inner.session.upgrade() {
            if let Some(transaction) = session.transaction() {
                if transaction.is_in_transaction() {
                    transaction.add_synchronization(TransactionSynchronization::ConsumerClose(
                        self.inner.info.consumer_id.clone(),
                    ));
                    self.inner.stop();
                    return Ok(());
                }
            }
        }
        self.inner.do_close().await;
        Ok(())
    }
}

impl ConsumerInner {
    pub(crate) fn create(
        info: ConsumerInfo,
        session: Weak<SessionInner>,
        redelivery_policy: RedeliveryPolicy,
        delay_policy: RedeliveryDelayPolicy,
    ) -> Arc<Self> {
        Arc::new(Self {
            info,
            session,
            unconsumed: DispatchChannel::new(),
            dispatched: StdMutex::new(VecDeque::new()),
            ack_state: StdMutex::new(AckState::default()),
            delivering_acks: AtomicBool::new(false),
            listener: StdMutex::new(None),
            last_delivered_sequence_id: AtomicI64::new(-1),
            redelivery_delay: AtomicU64::new(0),
            redelivery_policy,
            delay_policy,
            synchronization_registered: AtomicBool::new(false),
            in_progress_clear_required: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    pub(crate) fn info(&self) -> &ConsumerInfo {
        &self.info
    }

    pub(crate) fn unconsumed(&self) -> &DispatchChannel<MessageDispatch> {
        &self.unconsumed
    }

    pub(crate) fn has_listener(&self) -> bool {
        lock(&self.listener).is_some()
    }

    pub(crate) fn clear_synchronization_registered(&self) {
        self.synchronization_registered.store(false, Ordering::SeqCst);
    }

    fn check_closed(&self) -> CmsResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CmsError::AlreadyClosed {
                resource: "consumer",
            });
        }
        Ok(())
    }

    fn session(&self) -> CmsResult<Arc<SessionInner>> {
        self.session.upgrade().ok_or(CmsError::AlreadyClosed {
            resource: "session",
        })
    }

    pub(crate) fn start(&self) {
        if self.unconsumed.is_closed() {
            return;
        }
        self.unconsumed.start();
    }

    pub(crate) fn stop(&self) {
        self.unconsumed.stop();
    }

    /// Marks that the transport dropped with messages in flight; the next
    /// dispatch clears the local queue before resuming.
    pub(crate) fn in_progress_clear_required(&self) {
        self.in_progress_clear_required.store(true, Ordering::SeqCst);
    }

    fn clear_messages_in_progress(&self) {
        if self.in_progress_clear_required.swap(false, Ordering::SeqCst) {
            let dropped = self.unconsumed.clear().len();
            debug!(
                consumer_id = %self.info.consumer_id,
                dropped, "cleared in-flight messages after transport interruption"
            );
            if let Some(session) = self.session.upgrade() {
                if let Ok(connection) = session.connection() {
                    connection.transport_interruption_processing_complete();
                }
            }
        }
    }

    /// Entry point from the session executor.
    pub(crate) async fn dispatch(&self, dispatch: MessageDispatch) {
        self.clear_messages_in_progress();
        if self.unconsumed.is_closed() {
            return;
        }

        if let Some(message) = dispatch.message.as_deref() {
            // Expired on arrival: settle it, never queue it.
            if message.is_expired() {
                self.settle_expired(&dispatch).await;
                return;
            }

            let listener = lock(&self.listener).clone();
            if let Some(listener) = listener {
                if self.unconsumed.is_running() {
                    if let Err(err) = self.before_message_is_consumed(&dispatch).await {
                        self.forward_error(err);
                    }
                    if let Some(message) = dispatch.message.as_deref() {
                        if let Err(err) = listener.on_message(message.clone()) {
                            self.forward_error(err);
                        }
                    }
                    if let Err(err) = self.after_message_is_consumed(&dispatch, false).await {
                        self.forward_error(err);
                    }
                    return;
                }
            }
        }

        self.unconsumed.enqueue(dispatch);
    }

    fn forward_error(&self, err: CmsError) {
        if let Some(session) = self.session.upgrade() {
            session.fire(&err);
        }
    }

    /// Pops the next live dispatch and runs the consume bookkeeping.
    async fn consume_one(&self, timeout: Option<Duration>) -> CmsResult<Option<Message>> {
        let Some(dispatch) = self.dequeue(timeout).await? else {
            return Ok(None);
        };
        self.before_message_is_consumed(&dispatch).await?;
        let message = dispatch.message.as_deref().cloned();
        self.after_message_is_consumed(&dispatch, false).await?;
        Ok(message)
    }

    /// Waits for a non-expired dispatch until the optional deadline.
    ///
    /// A dispatch with no message is the broker saying a pull timed out.
    /// Expired messages are settled with a DELIVERED+CONSUMED pair without
    /// consuming any of the caller's wait time beyond what passed.
    async fn dequeue(&self, timeout: Option<Duration>) -> CmsResult<Option<MessageDispatch>> {
        self.check_closed()?;
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let dispatch = self.unconsumed.dequeue(deadline).await;
            match dispatch {
                None => return Ok(None),
                Some(dispatch) => {
                    let Some(message) = dispatch.message.as_deref() else {
                        return Ok(None);
                    };
                    if message.is_expired() {
                        self.settle_expired(&dispatch).await;
                        continue;
                    }
                    return Ok(Some(dispatch));
                }
            }
        }
    }

    /// Settles an expired message: a DELIVERED then CONSUMED ack pair, no
    /// user delivery.
    async fn settle_expired(&self, dispatch: &MessageDispatch) {
        let Some(message_id) = dispatch
            .message
            .as_deref()
            .and_then(|m| m.message_id.clone())
        else {
            return;
        };
        for ack_type in [AckType::Delivered, AckType::Consumed] {
            let ack = MessageAck {
                command_id: 0,
                response_required: false,
                ack_type,
                consumer_id: self.info.consumer_id.clone(),
                destination: dispatch.destination.clone(),
                transaction_id: None,
                first_message_id: Some(message_id.clone()),
                last_message_id: Some(message_id.clone()),
                message_count: 1,
            };
            if let Err(err) = self.oneway_ack(ack).await {
                debug!(error = %err, "expired-message ack not delivered");
                return;
            }
        }
    }

    /// Issues a pull when the prefetch window is zero and nothing is queued.
    async fn send_pull(&self, timeout: i64) -> CmsResult<()> {
        if self.info.prefetch_size != 0 || !self.unconsumed.is_empty() {
            return Ok(());
        }
        let session = self.session()?;
        let connection = session.connection()?;
        let pull = MessagePull {
            command_id: 0,
            response_required: false,
            consumer_id: self.info.consumer_id.clone(),
            destination: Some(self.info.destination.clone()),
            timeout,
        };
        connection.oneway(Command::MessagePull(pull)).await
    }

    fn is_auto_ack_each(&self, session: &SessionInner) -> bool {
        session.ack_mode == crate::session::AckMode::Auto
            || (session.ack_mode == crate::session::AckMode::DupsOk
                && self.info.destination.is_queue())
    }

    fn is_auto_ack_batch(&self, session: &SessionInner) -> bool {
        session.ack_mode == crate::session::AckMode::DupsOk && !self.info.destination.is_queue()
    }

    /// Pre-hand-off bookkeeping: track the broker sequence, log the
    /// dispatch, and open the transaction window when transacted.
    async fn before_message_is_consumed(&self, dispatch: &MessageDispatch) -> CmsResult<()> {
        if let Some(message_id) = dispatch
            .message
            .as_deref()
            .and_then(|m| m.message_id.as_ref())
        {
            self.last_delivered_sequence_id
                .store(message_id.broker_sequence_id, Ordering::SeqCst);
        }

        let session = self.session()?;
        if !self.is_auto_ack_batch(&session) {
            lock(&self.dispatched).push_front(dispatch.clone());
            if session.is_transacted() {
                self.ack_later(dispatch, AckType::Delivered).await?;
            }
        }
        Ok(())
    }

    /// Post-hand-off bookkeeping per ack mode.
    async fn after_message_is_consumed(
        &self,
        dispatch: &MessageDispatch,
        message_expired: bool,
    ) -> CmsResult<()> {
        if self.unconsumed.is_closed() {
            return Ok(());
        }
        if message_expired {
            return self.ack_later(dispatch, AckType::Delivered).await;
        }

        let session = self.session()?;
        if session.is_transacted() {
            return Ok(());
        }
        if self.is_auto_ack_each(&session) {
            if self
                .delivering_acks
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                let ack = {
                    let mut dispatched = lock(&self.dispatched);
                    let ack = self.make_ack_locked(&dispatched, AckType::Consumed);
                    if ack.is_some() {
                        dispatched.clear();
                    }
                    ack
                };
                if let Some(ack) = ack {
                    let result = self.oneway_ack(ack).await;
                    self.delivering_acks.store(false, Ordering::SeqCst);
                    result?;
                } else {
                    self.delivering_acks.store(false, Ordering::SeqCst);
                }
            }
            Ok(())
        } else if self.is_auto_ack_batch(&session) {
            self.ack_later(dispatch, AckType::Consumed).await
        } else if matches!(
            session.ack_mode,
            crate::session::AckMode::Client | crate::session::AckMode::Individual
        ) {
            self.ack_later(dispatch, AckType::Delivered).await
        } else {
            Err(CmsError::illegal_state("invalid session ack state"))
        }
    }

    /// Builds one ack covering everything in the dispatched log.
    ///
    /// Front of the log is the newest dispatch, so it supplies the last
    /// message id and the back supplies the first.
    fn make_ack_locked(
        &self,
        dispatched: &VecDeque<MessageDispatch>,
        ack_type: AckType,
    ) -> Option<MessageAck> {
        let newest = dispatched.front()?;
        let oldest = dispatched.back()?;
        Some(MessageAck {
            command_id: 0,
            response_required: false,
            ack_type,
            consumer_id: self.info.consumer_id.clone(),
            destination: newest.destination.clone(),
            transaction_id: None,
            first_message_id: oldest
                .message
                .as_deref()
                .and_then(|m| m.message_id.clone()),
            last_message_id: newest
                .message
                .as_deref()
                .and_then(|m| m.message_id.clone()),
            message_count: dispatched.len() as i32,
        })
    }

    /// The pending-ack coalescer.
    ///
    /// Same type extends the pending range; a different type flushes the
    /// pending ack first unless it was only a DELIVERED flow-control ack,
    /// which is superseded. Flushes to the broker once half the prefetch
    /// window is outstanding.
    async fn ack_later(&self, dispatch: &MessageDispatch, ack_type: AckType) -> CmsResult<()> {
        let session = self.session()?;
        let transaction_id = if session.is_transacted() {
            let Some(transaction) = session.transaction() else {
                return Err(CmsError::illegal_state("transacted session without context"));
            };
            let id = transaction.begin_if_needed().await?;
            if !self.synchronization_registered.swap(true, Ordering::SeqCst) {
                transaction.add_synchronization(TransactionSynchronization::ConsumerTransaction(
                    self.info.consumer_id.clone(),
                ));
            }
            Some(id)
        } else {
            None
        };

        let message_id: Option<MessageId> = dispatch
            .message
            .as_deref()
            .and_then(|m| m.message_id.clone());

        let mut to_send = Vec::new();
        {
            let mut state = lock(&self.ack_state);
            state.delivered_counter += 1;

            let mut ack = MessageAck {
                command_id: 0,
                response_required: false,
                ack_type,
                consumer_id: self.info.consumer_id.clone(),
                destination: dispatch.destination.clone(),
                transaction_id,
                first_message_id: None,
                last_message_id: message_id.clone(),
                message_count: state.delivered_counter,
            };

            match state.pending_ack.take() {
                None => ack.first_message_id = ack.last_message_id.clone(),
                Some(pending) if pending.ack_type == ack.ack_type => {
                    ack.first_message_id = pending.first_message_id.clone();
                }
                Some(pending) => {
                    // A pure flow-control ack is superseded; anything else
                    // matters and must go out before we replace it.
                    if pending.ack_type != AckType::Delivered {
                        to_send.push(pending);
                    }
                    ack.first_message_id = ack.last_message_id.clone();
                }
            }
            state.pending_ack = Some(ack);

            let outstanding = state.delivered_counter - state.additional_window;
            if 0.5 * f64::from(self.info.prefetch_size) <= f64::from(outstanding) {
                if let Some(pending) = state.pending_ack.take() {
                    to_send.push(pending);
                }
                state.delivered_counter = 0;
                state.additional_window = 0;
            }
        }

        for ack in to_send {
            self.oneway_ack(ack).await?;
        }
        Ok(())
    }

    /// One coalesced CONSUMED ack for everything dispatched so far.
    pub(crate) async fn acknowledge_all(&self) -> CmsResult<()> {
        let session = self.session()?;
        let (ack, count) = {
            let dispatched = lock(&self.dispatched);
            (
                self.make_ack_locked(&dispatched, AckType::Consumed),
                dispatched.len() as i32,
            )
        };
        let Some(mut ack) = ack else {
            return Ok(());
        };
        if session.is_transacted() {
            let Some(transaction) = session.transaction() else {
                return Err(CmsError::illegal_state("transacted session without context"));
            };
            ack.transaction_id = Some(transaction.begin_if_needed().await?);
        }

        self.oneway_ack(ack).await?;

        {
            let mut state = lock(&self.ack_state);
            state.pending_ack = None;
            state.delivered_counter = (state.delivered_counter - count).max(0);
            state.additional_window = (state.additional_window - count).max(0);
        }
        if !session.is_transacted() {
            lock(&self.dispatched).clear();
        }
        Ok(())
    }

    /// Transaction committed: the dispatched range is settled.
    pub(crate) fn commit(&self) {
        lock(&self.dispatched).clear();
        self.redelivery_delay.store(0, Ordering::SeqCst);
    }

    /// Transaction rolled back: redeliver or poison the dispatched range.
    pub(crate) async fn rollback(&self) {
        let log: Vec<MessageDispatch> = {
            let mut dispatched = lock(&self.dispatched);
            dispatched.drain(..).collect()
        };
        if log.is_empty() {
            return;
        }

        // Front of the log is the newest dispatch.
        let previous_redeliveries = log[0]
            .message
            .as_deref()
            .map_or(0, |m| m.redelivery_counter);
        let mut delay = self.redelivery_delay.load(Ordering::SeqCst);
        if previous_redeliveries > 0 {
            delay = self.redelivery_policy.redelivery_delay(delay);
            self.redelivery_delay.store(delay, Ordering::SeqCst);
        }

        let mut log = log;
        for dispatch in &mut log {
            if let Some(message) = dispatch.message.as_deref_mut() {
                message.redelivery_counter += 1;
                message.redelivered = true;
            }
        }

        let newest_counter = log[0]
            .message
            .as_deref()
            .map_or(0, |m| m.redelivery_counter);
        let first_message_id = log
            .last()
            .and_then(|d| d.message.as_deref())
            .and_then(|m| m.message_id.clone());
        let last_message_id = log[0]
            .message
            .as_deref()
            .and_then(|m| m.message_id.clone());
        let count = log.len() as i32;

        if self.redelivery_policy.is_exhausted(newest_counter) {
            // Over the cap: the whole range goes to the DLQ.
            let ack = MessageAck {
                command_id: 0,
                response_required: false,
                ack_type: AckType::Poison,
                consumer_id: self.info.consumer_id.clone(),
                destination: log[0].destination.clone(),
                transaction_id: None,
                first_message_id,
                last_message_id,
                message_count: count,
            };
            if let Err(err) = self.oneway_ack(ack).await {
                warn!(error = %err, "poison ack not delivered");
            }
            {
                let mut state = lock(&self.ack_state);
                state.additional_window = (state.additional_window - count).max(0);
                state.delivered_counter -= count;
            }
            self.redelivery_delay.store(0, Ordering::SeqCst);
        } else {
            if previous_redeliveries > 0 {
                // Window accounting only; the broker does not resend.
                let ack = MessageAck {
                    command_id: 0,
                    response_required: false,
                    ack_type: AckType::Redelivered,
                    consumer_id: self.info.consumer_id.clone(),
                    destination: log[0].destination.clone(),
                    transaction_id: None,
                    first_message_id,
                    last_message_id,
                    message_count: count,
                };
                if let Err(err) = self.oneway_ack(ack).await {
                    warn!(error = %err, "redelivered ack not delivered");
                }
            }

            self.unconsumed.stop();
            // Newest first, so the oldest ends up at the very front.
            for dispatch in log {
                self.unconsumed.enqueue_first(dispatch);
            }

            if delay > 0 && !self.unconsumed.is_closed() {
                match self.delay_policy {
                    RedeliveryDelayPolicy::GateDeliveries => {
                        self.unconsumed
                            .gate_until(Instant::now() + Duration::from_millis(delay));
                        self.start();
                    }
                    RedeliveryDelayPolicy::HoldDispatch => {
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                        self.start();
                    }
                }
            } else {
                self.start();
            }

            let mut state = lock(&self.ack_state);
            state.delivered_counter -= count;
        }

        if self.has_listener() {
            if let Some(session) = self.session.upgrade() {
                session.redispatch(&self.unconsumed);
            }
        }
    }

    /// Session recover: every dispatched-but-unacked message goes back to
    /// the front of the queue, marked redelivered.
    pub(crate) fn recover(&self) {
        let mut count = 0;
        {
            let mut dispatched = lock(&self.dispatched);
            // Newest first, so the oldest ends up at the very front.
            for mut dispatch in dispatched.drain(..) {
                if let Some(message) = dispatch.message.as_deref_mut() {
                    message.redelivered = true;
                    message.redelivery_counter += 1;
                }
                self.unconsumed.enqueue_first(dispatch);
                count += 1;
            }
        }
        let mut state = lock(&self.ack_state);
        state.delivered_counter -= count;
    }

    /// Flushes what must not be lost at close: the auto-mode consumed range
    /// or a pending CONSUMED ack. Failures are logged and swallowed.
    async fn deliver_acks(&self) {
        if self
            .delivering_acks
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let ack = {
            let session = self.session.upgrade();
            match session {
                Some(session) if self.is_auto_ack_each(&session) => {
                    let mut dispatched = lock(&self.dispatched);
                    match self.make_ack_locked(&dispatched, AckType::Consumed) {
                        Some(ack) => {
                            dispatched.clear();
                            Some(ack)
                        }
                        None => lock(&self.ack_state).pending_ack.take(),
                    }
                }
                _ => {
                    let mut state = lock(&self.ack_state);
                    if state
                        .pending_ack
                        .as_ref()
                        .is_some_and(|pending| pending.ack_type == AckType::Consumed)
                    {
                        state.pending_ack.take()
                    } else {
                        None
                    }
                }
            }
        };
        if let Some(ack) = ack {
            if let Err(err) = self.oneway_ack(ack).await {
                debug!(error = %err, "ack flush at close failed");
            }
        }
        self.delivering_acks.store(false, Ordering::SeqCst);
    }

    /// Tears the consumer down locally and tells the broker. Idempotent;
    /// always succeeds locally.
    pub(crate) async fn do_close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let session = self.session.upgrade();
        if let Some(session) = &session {
            if !session.is_transacted() {
                self.deliver_acks().await;
            }
        }
        self.unconsumed.clear();
        self.unconsumed.close();
        lock(&self.dispatched).clear();

        if let Some(session) = session {
            session
                .remove_consumer(
                    &self.info.consumer_id,
                    self.last_delivered_sequence_id.load(Ordering::SeqCst),
                )
                .await;
        }
    }

    async fn oneway_ack(&self, ack: MessageAck) -> CmsResult<()> {
        let session = self.session()?;
        let connection = session.connection()?;
        connection.oneway(Command::MessageAck(ack)).await
    }
}
