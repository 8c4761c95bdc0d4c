//! Sessions: the single-threaded dispatch domain of the client.
//!
//! Every consumer belonging to a session has its callbacks serialized by
//! that session's executor, a dedicated task draining one work queue.
//! Transacted sessions keep a [`TransactionContext`] whose synchronizations
//! hold consumer ids and a weak session handle, never object references, so
//! the graph stays cycle-free.

use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::commands::{
    Command, ConsumerId, ConsumerInfo, Destination, DestinationInfo, DestinationOperation,
    DestinationOptions, LocalTransactionId, Message, MessageDispatch, ProducerId, ProducerInfo,
    RemoveInfo, RemoveSubscriptionInfo, RemovedObject, SequenceGenerator, SessionId, SessionInfo,
    TransactionInfo, TransactionType,
};
use crate::connection::{ConnectionInner, lock};
use crate::consumer::{ConsumerInner, MessageConsumer};
use crate::dispatch::DispatchChannel;
use crate::error::{CmsError, CmsResult};
use crate::producer::{MessageProducer, ProducerInner};

/// JMS-style acknowledgement policy for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    /// Acknowledge each message as the user accepts it.
    Auto,
    /// The user acknowledges explicitly via `Session::acknowledge`.
    Client,
    /// Lazily acknowledged duplicates-permitted delivery.
    DupsOk,
    /// Acknowledge one message at a time via the consumer.
    Individual,
    /// All consumption is scoped to the session transaction.
    Transacted,
}

impl AckMode {
    /// Whether this mode runs under a session transaction.
    pub fn is_transacted(&self) -> bool {
        matches!(self, AckMode::Transacted)
    }
}

/// A session: consumer/producer factory and dispatch serializer.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

pub(crate) struct SessionInner {
    pub(crate) session_id: SessionId,
    pub(crate) ack_mode: AckMode,
    pub(crate) connection: Weak<ConnectionInner>,
    executor: SessionExecutor,
    pub(crate) consumers: DashMap<ConsumerId, Arc<ConsumerInner>>,
    producers: DashMap<ProducerId, Arc<ProducerInner>>,
    consumer_ids: SequenceGenerator,
    producer_ids: SequenceGenerator,
    transaction: Option<TransactionContext>,
    async_sender: StdMutex<Option<AsyncSender>>,
    closed: AtomicBool,
}

struct AsyncSender {
    queue: mpsc::Sender<Command>,
    worker: JoinHandle<()>,
}

impl Session {
    pub(crate) fn create(
        connection: Arc<ConnectionInner>,
        session_id: SessionId,
        ack_mode: AckMode,
    ) -> Self {
        let dispatch_async = connection.options.dispatch_async;
        let use_async_send = connection.options.use_async_send;

        let inner = Arc::new_cyclic(|weak: &Weak<SessionInner>| {
            let transaction = ack_mode
                .is_transacted()
                .then(|| TransactionContext::new(Arc::downgrade(&connection)));
            SessionInner {
                session_id,
                ack_mode,
                connection: Arc::downgrade(&connection),
                executor: SessionExecutor::new(weak.clone(), dispatch_async),
                consumers: DashMap::new(),
                producers: DashMap::new(),
                consumer_ids: SequenceGenerator::new(),
                producer_ids: SequenceGenerator::new(),
                transaction,
                async_sender: StdMutex::new(None),
                closed: AtomicBool::new(false),
            }
        });

        if use_async_send {
            inner.start_async_sender();
        }
        Self { inner }
    }

    pub(crate) fn inner(&self) -> &Arc<SessionInner> {
        &self.inner
    }

    /// This session's id.
    pub fn session_id(&self) -> &SessionId {
        &self.inner.session_id
    }

    /// The acknowledgement mode fixed at creation.
    pub fn ack_mode(&self) -> AckMode {
        self.inner.ack_mode
    }

    /// Whether this session is transacted.
    pub fn is_transacted(&self) -> bool {
        self.inner.ack_mode.is_transacted()
    }

    pub(crate) fn session_info(&self) -> SessionInfo {
        self.inner.session_info()
    }

    /// Creates a consumer with default options.
    pub async fn create_consumer(&self, destination: &Destination) -> CmsResult<MessageConsumer> {
        self.create_consumer_with(destination, None, false).await
    }

    /// Creates a consumer with a selector and no-local flag.
    pub async fn create_consumer_with(
        &self,
        destination: &Destination,
        selector: Option<&str>,
        no_local: bool,
    ) -> CmsResult<MessageConsumer> {
        self.inner
            .build_consumer(destination, selector, no_local, None, false)
            .await
    }

    /// Creates a named durable topic subscription.
    pub async fn create_durable_consumer(
        &self,
        topic: &Destination,
        subscription_name: &str,
        selector: Option<&str>,
        no_local: bool,
    ) -> CmsResult<MessageConsumer> {
        if !topic.is_topic() {
            return Err(CmsError::invalid_argument(
                "durable subscriptions require a topic destination",
            ));
        }
        self.inner
            .build_consumer(topic, selector, no_local, Some(subscription_name), false)
            .await
    }

    /// Creates a read-only queue browser subscription.
    pub async fn create_browser(&self, queue: &Destination) -> CmsResult<MessageConsumer> {
        if !queue.is_queue() {
            return Err(CmsError::invalid_argument("browsing requires a queue"));
        }
        self.inner
            .build_consumer(queue, None, false, None, true)
            .await
    }

    /// Creates a producer, optionally pinned to one destination.
    pub async fn create_producer(
        &self,
        destination: Option<&Destination>,
    ) -> CmsResult<MessageProducer> {
        self.inner.check_closed()?;
        let connection = self.inner.connection()?;
        let producer_id = ProducerId::new(&self.inner.session_id, self.inner.producer_ids.next());
        let info = ProducerInfo {
            command_id: 0,
            response_required: false,
            producer_id: producer_id.clone(),
            destination: destination.cloned(),
        };

        let producer = ProducerInner::create(info.clone(), Arc::downgrade(&self.inner));
        self.inner.producers.insert(producer_id.clone(), producer.clone());

        if let Err(err) = connection.oneway(Command::ProducerInfo(info)).await {
            self.inner.producers.remove(&producer_id);
            return Err(err);
        }
        Ok(MessageProducer::from_inner(producer))
    }

    /// Creates a connection-scoped temporary queue.
    pub async fn create_temporary_queue(&self) -> CmsResult<Destination> {
        self.create_temporary(true).await
    }

    /// Creates a connection-scoped temporary topic.
    pub async fn create_temporary_topic(&self) -> CmsResult<Destination> {
        self.create_temporary(false).await
    }

    async fn create_temporary(&self, queue: bool) -> CmsResult<Destination> {
        self.inner.check_closed()?;
        let connection = self.inner.connection()?;
        let name = format!(
            "{}:{}",
            connection.connection_id,
            connection.temp_destination_ids.next()
        );
        let destination = if queue {
            Destination::temporary_queue(name)
        } else {
            Destination::temporary_topic(name)
        };
        let info = DestinationInfo {
            command_id: 0,
            response_required: false,
            connection_id: connection.connection_id.clone(),
            destination: destination.clone(),
            operation: DestinationOperation::Add,
            timeout: 0,
        };
        connection.oneway(Command::DestinationInfo(info)).await?;
        Ok(destination)
    }

    /// Drops a named durable subscription at the broker.
    pub async fn unsubscribe(&self, subscription_name: &str) -> CmsResult<()> {
        self.inner.check_closed()?;
        let connection = self.inner.connection()?;
        let info = RemoveSubscriptionInfo {
            command_id: 0,
            response_required: false,
            connection_id: connection.connection_id.clone(),
            client_id: connection.options.client_id.clone(),
            subscription_name: subscription_name.to_string(),
        };
        connection
            .oneway(Command::RemoveSubscriptionInfo(info))
            .await
    }

    /// Commits the session transaction.
    ///
    /// Consumed messages are acknowledged in one coalesced CONSUMED ack per
    /// consumer before the commit command goes out.
    pub async fn commit(&self) -> CmsResult<()> {
        self.inner.check_closed()?;
        let Some(transaction) = &self.inner.transaction else {
            return Err(CmsError::illegal_state("commit on a non-transacted session"));
        };
        transaction.commit(&self.inner).await
    }

    /// Rolls the session transaction back and redelivers per policy.
    pub async fn rollback(&self) -> CmsResult<()> {
        self.inner.check_closed()?;
        let Some(transaction) = &self.inner.transaction else {
            return Err(CmsError::illegal_state(
                "rollback on a non-transacted session",
            ));
        };
        transaction.rollback(&self.inner).await
    }

    /// Redelivers every dispatched-but-unacked message, marked redelivered.
    pub async fn recover(&self) -> CmsResult<()> {
        self.inner.check_closed()?;
        if self.is_transacted() {
            return Err(CmsError::illegal_state("recover on a transacted session"));
        }
        self.inner.stop();
        for entry in &self.inner.consumers {
            entry.value().recover();
        }
        self.inner.start();
        for entry in &self.inner.consumers {
            let consumer = entry.value();
            if consumer.has_listener() {
                self.inner.redispatch(consumer.unconsumed());
            }
        }
        Ok(())
    }

    /// Client-acknowledge: one coalesced CONSUMED ack per consumer covering
    /// everything dispatched so far.
    pub async fn acknowledge(&self) -> CmsResult<()> {
        self.inner.check_closed()?;
        let consumers: Vec<Arc<ConsumerInner>> = self
            .inner
            .consumers
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for consumer in consumers {
            consumer.acknowledge_all().await?;
        }
        Ok(())
    }

    /// Closes the session and everything it owns. Idempotent.
    pub async fn close(&self) -> CmsResult<()> {
        self.inner.shutdown().await;
        if let Some(connection) = self.inner.connection.upgrade() {
            connection.remove_session(&self.inner.session_id);
            let remove = RemoveInfo {
                command_id: 0,
                response_required: false,
                object_id: RemovedObject::Session(self.inner.session_id.clone()),
                last_delivered_sequence_id: 0,
            };
            let _ = connection.oneway(Command::RemoveInfo(remove)).await;
        }
        Ok(())
    }
}

impl SessionInner {
    pub(crate) fn check_closed(&self) -> CmsResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CmsError::AlreadyClosed {
                resource: "session",
            });
        }
        Ok(())
    }

    pub(crate) fn connection(&self) -> CmsResult<Arc<ConnectionInner>> {
        self.connection.upgrade().ok_or(CmsError::AlreadyClosed {
            resource: "connection",
        })
    }

    pub(crate) fn session_info(&self) -> SessionInfo {
        SessionInfo {
            command_id: 0,
            response_required: false,
            session_id: self.session_id.clone(),
        }
    }

    pub(crate) fn is_transacted(&self) -> bool {
        self.ack_mode.is_transacted()
    }

    pub(crate) fn transaction(&self) -> Option<&TransactionContext> {
        self.transaction.as_ref()
    }

    pub(crate) fn is_started(&self) -> bool {
        self.executor.queue.is_running()
    }

    /// Wakes dispatch for every consumer in this session.
    pub(crate) fn start(&self) {
        self.executor.start();
        for entry in &self.consumers {
            entry.value().start();
        }
    }

    /// Parks dispatch; inbound messages keep queueing.
    pub(crate) fn stop(&self) {
        self.executor.stop();
        for entry in &self.consumers {
            entry.value().stop();
        }
    }

    /// Entry point from the connection's inbound demux.
    pub(crate) async fn dispatch(&self, dispatch: MessageDispatch) {
        self.executor.execute(dispatch).await;
    }

    /// Re-queues a consumer's unconsumed backlog at the executor's front,
    /// preserving original delivery order.
    pub(crate) fn redispatch(&self, unconsumed: &DispatchChannel<MessageDispatch>) {
        let backlog = unconsumed.clear();
        for dispatch in backlog.into_iter().rev() {
            self.executor.execute_first(dispatch);
        }
    }

    pub(crate) async fn dispatch_to_consumer(&self, dispatch: MessageDispatch) {
        let consumer = self
            .consumers
            .get(&dispatch.consumer_id)
            .map(|entry| entry.value().clone());
        if let Some(consumer) = consumer {
            consumer.dispatch(dispatch).await;
        } else {
            debug!(consumer_id = %dispatch.consumer_id, "dispatch for consumer no longer in session");
        }
    }

    async fn build_consumer(
        self: &Arc<Self>,
        destination: &Destination,
        selector: Option<&str>,
        no_local: bool,
        subscription_name: Option<&str>,
        browser: bool,
    ) -> CmsResult<MessageConsumer> {
        self.check_closed()?;
        if destination.base_name().is_empty() {
            return Err(CmsError::invalid_argument(
                "destination has no physical name",
            ));
        }
        let connection = self.connection()?;

        let consumer_id = ConsumerId::new(&self.session_id, self.consumer_ids.next());
        let mut info = ConsumerInfo::new(consumer_id.clone(), destination.clone());
        info.selector = selector.map(str::to_string);
        info.no_local = no_local;
        info.browser = browser;
        info.subscription_name = subscription_name.map(str::to_string);
        info.prefetch_size = {
            let policy = &connection.options.prefetch_policy;
            if subscription_name.is_some() {
                policy.durable_topic_prefetch.as_i32()
            } else if destination.is_topic() {
                policy.topic_prefetch.as_i32()
            } else {
                policy.queue_prefetch.as_i32()
            }
        };
        info.apply_destination_options(&DestinationOptions::parse(destination)?);

        let consumer = ConsumerInner::create(
            info.clone(),
            Arc::downgrade(self),
            connection.options.redelivery_policy.clone(),
            connection.options.redelivery_delay_policy,
        );
        self.consumers.insert(consumer_id.clone(), consumer.clone());
        connection.add_dispatcher(consumer_id.clone(), self.clone());

        if let Err(err) = connection.oneway(Command::ConsumerInfo(info)).await {
            connection.remove_dispatcher(&consumer_id);
            self.consumers.remove(&consumer_id);
            return Err(err);
        }

        if self.is_started() {
            consumer.start();
        }
        Ok(MessageConsumer::from_inner(consumer))
    }

    /// Detaches a consumer locally and tells the broker, with the last
    /// delivered sequence so the broker can settle in-flight messages.
    pub(crate) async fn remove_consumer(
        &self,
        consumer_id: &ConsumerId,
        last_delivered_sequence_id: i64,
    ) {
        self.consumers.remove(consumer_id);
        if let Some(connection) = self.connection.upgrade() {
            connection.remove_dispatcher(consumer_id);
            let remove = RemoveInfo {
                command_id: 0,
                response_required: false,
                object_id: RemovedObject::Consumer(consumer_id.clone()),
                last_delivered_sequence_id,
            };
            if let Err(err) = connection.oneway(Command::RemoveInfo(remove)).await {
                warn!(error = %err, consumer_id = %consumer_id, "consumer removal not delivered");
            }
        }
    }

    pub(crate) async fn remove_producer(&self, producer_id: &ProducerId) {
        self.producers.remove(producer_id);
        if let Some(connection) = self.connection.upgrade() {
            let remove = RemoveInfo {
                command_id: 0,
                response_required: false,
                object_id: RemovedObject::Producer(producer_id.clone()),
                last_delivered_sequence_id: 0,
            };
            if let Err(err) = connection.oneway(Command::RemoveInfo(remove)).await {
                warn!(error = %err, producer_id = %producer_id, "producer removal not delivered");
            }
        }
    }

    /// Sends one stamped message, routing through the transaction and the
    /// async-send queue when configured. Per-producer order is preserved.
    pub(crate) async fn send_message(&self, mut message: Message) -> CmsResult<()> {
        self.check_closed()?;
        let connection = self.connection()?;

        if let Some(transaction) = &self.transaction {
            let transaction_id = transaction.begin_if_needed().await?;
            message.transaction_id = Some(transaction_id);
        }

        let command = Command::Message(Box::new(message));
        let use_async = {
            let sender = lock(&self.async_sender);
            sender.as_ref().map(|s| s.queue.clone())
        };
        match use_async {
            Some(queue) => queue
                .send(command)
                .await
                .map_err(|_| CmsError::illegal_state("async send queue closed")),
            None if connection.options.always_sync_send
                || connection.options.send_timeout.as_u64() > 0 =>
            {
                connection
                    .sync_request(command, connection.request_timeout())
                    .await
                    .map(|_| ())
            }
            None => connection.oneway(command).await,
        }
    }

    fn start_async_sender(self: &Arc<Self>) {
        let (tx, mut rx) = mpsc::channel::<Command>(1024);
        let session = Arc::downgrade(self);
        let worker = tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                let Some(session) = session.upgrade() else {
                    break;
                };
                let Ok(connection) = session.connection() else {
                    break;
                };
                if let Err(err) = connection.oneway(command).await {
                    connection.fire(&err);
                }
            }
        });
        *lock(&self.async_sender) = Some(AsyncSender { queue: tx, worker });
    }

    pub(crate) fn signal_transport_interrupted(&self) {
        for entry in &self.consumers {
            entry.value().in_progress_clear_required();
        }
    }

    pub(crate) fn consumer_infos(&self) -> Vec<ConsumerInfo> {
        self.consumers
            .iter()
            .map(|entry| entry.value().info().clone())
            .collect()
    }

    pub(crate) fn producer_infos(&self) -> Vec<ProducerInfo> {
        self.producers
            .iter()
            .map(|entry| entry.value().info().clone())
            .collect()
    }

    pub(crate) fn fire(&self, err: &CmsError) {
        if let Some(connection) = self.connection.upgrade() {
            connection.fire(err);
        }
    }

    /// Closes every owned resource; used by both `Session::close` and the
    /// connection's teardown. Idempotent.
    pub(crate) async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.executor.stop();

        let consumers: Vec<Arc<ConsumerInner>> = self
            .consumers
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for consumer in consumers {
            consumer.do_close().await;
        }
        let producers: Vec<Arc<ProducerInner>> = self
            .producers
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for producer in producers {
            producer.do_close().await;
        }

        self.executor.close();
        if let Some(sender) = lock(&self.async_sender).take() {
            drop(sender.queue);
            sender.worker.abort();
        }
    }
}

/// The per-session dispatch worker.
///
/// Async mode owns a task draining the queue; sync mode dispatches on the
/// caller (the transport's inbound path). `execute_first` exists for
/// rollback redispatch.
pub(crate) struct SessionExecutor {
    queue: Arc<DispatchChannel<MessageDispatch>>,
    session: Weak<SessionInner>,
    dispatch_async: bool,
    task: StdMutex<Option<JoinHandle<()>>>,
}

impl SessionExecutor {
    fn new(session: Weak<SessionInner>, dispatch_async: bool) -> Self {
        Self {
            queue: Arc::new(DispatchChannel::new()),
            session,
            dispatch_async,
            task: StdMutex::new(None),
        }
    }

    async fn execute(&self, dispatch: MessageDispatch) {
        if !self.dispatch_async {
            if let Some(session) = self.session.upgrade() {
                session.dispatch_to_consumer(dispatch).await;
            }
            return;
        }
        self.queue.enqueue(dispatch);
    }

    fn execute_first(&self, dispatch: MessageDispatch) {
        self.queue.enqueue_first(dispatch);
    }

    fn start(&self) {
        self.queue.start();
        if !self.dispatch_async {
            return;
        }
        let mut task = lock(&self.task);
        if task.is_none() {
            let queue = self.queue.clone();
            let session = self.session.clone();
            *task = Some(tokio::spawn(async move {
                while let Some(dispatch) = queue.dequeue(None).await {
                    let Some(session) = session.upgrade() else {
                        break;
                    };
                    session.dispatch_to_consumer(dispatch).await;
                }
            }));
        }
    }

    fn stop(&self) {
        self.queue.stop();
    }

    fn close(&self) {
        self.queue.close();
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
    }
}

/// What a transaction synchronization does at commit/rollback time.
///
/// Synchronizations carry only consumer ids; the session resolves them at
/// callback time so no back-pointers are needed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TransactionSynchronization {
    /// Acknowledge-and-settle hook for a consuming transaction member.
    ConsumerTransaction(ConsumerId),
    /// Finish a close that was deferred until the transaction ended.
    ConsumerClose(ConsumerId),
}

/// Tracks the active transaction id and its synchronizations.
pub(crate) struct TransactionContext {
    connection: Weak<ConnectionInner>,
    transaction_id: StdMutex<Option<LocalTransactionId>>,
    synchronizations: StdMutex<Vec<TransactionSynchronization>>,
}

impl TransactionContext {
    fn new(connection: Weak<ConnectionInner>) -> Self {
        Self {
            connection,
            transaction_id: StdMutex::new(None),
            synchronizations: StdMutex::new(Vec::new()),
        }
    }

    pub(crate) fn is_in_transaction(&self) -> bool {
        lock(&self.transaction_id).is_some()
    }

    pub(crate) fn add_synchronization(&self, synchronization: TransactionSynchronization) {
        let mut synchronizations = lock(&self.synchronizations);
        if !synchronizations.contains(&synchronization) {
            synchronizations.push(synchronization);
        }
    }

    /// Opens the transaction lazily on first consume or send.
    pub(crate) async fn begin_if_needed(&self) -> CmsResult<LocalTransactionId> {
        if let Some(id) = lock(&self.transaction_id).clone() {
            return Ok(id);
        }
        let connection = self.connection.upgrade().ok_or(CmsError::AlreadyClosed {
            resource: "connection",
        })?;
        let id = LocalTransactionId {
            connection_id: connection.connection_id.clone(),
            value: connection.transaction_ids.next(),
        };
        {
            let mut current = lock(&self.transaction_id);
            if let Some(existing) = current.clone() {
                return Ok(existing);
            }
            *current = Some(id.clone());
        }
        let begin = TransactionInfo {
            command_id: 0,
            response_required: false,
            connection_id: connection.connection_id.clone(),
            transaction_id: Some(id.clone()),
            transaction_type: TransactionType::Begin,
        };
        connection.oneway(Command::TransactionInfo(begin)).await?;
        debug!(transaction_id = %id, "transaction started");
        Ok(id)
    }

    /// Commit: before-end synchronizations, the commit command, after-commit
    /// synchronizations. Committing with no open transaction is a no-op.
    pub(crate) async fn commit(&self, session: &Arc<SessionInner>) -> CmsResult<()> {
        let synchronizations = lock(&self.synchronizations).clone();

        // Before-end: flush each member consumer's CONSUMED ack inside the
        // transaction.
        for synchronization in &synchronizations {
            if let TransactionSynchronization::ConsumerTransaction(consumer_id) = synchronization {
                if let Some(consumer) = session.consumers.get(consumer_id).map(|e| e.value().clone())
                {
                    consumer.acknowledge_all().await?;
                    consumer.clear_synchronization_registered();
                }
            }
        }

        let transaction_id = lock(&self.transaction_id).take();
        if let Some(transaction_id) = transaction_id {
            let connection = self.connection.upgrade().ok_or(CmsError::AlreadyClosed {
                resource: "connection",
            })?;
            let commit = TransactionInfo {
                command_id: 0,
                response_required: false,
                connection_id: connection.connection_id.clone(),
                transaction_id: Some(transaction_id.clone()),
                transaction_type: TransactionType::CommitOnePhase,
            };
            connection
                .sync_request(Command::TransactionInfo(commit), connection.request_timeout())
                .await?;
            debug!(transaction_id = %transaction_id, "transaction committed");
        }

        lock(&self.synchronizations).clear();
        for synchronization in &synchronizations {
            match synchronization {
                TransactionSynchronization::ConsumerTransaction(consumer_id) => {
                    if let Some(consumer) =
                        session.consumers.get(consumer_id).map(|e| e.value().clone())
                    {
                        consumer.commit();
                    }
                }
                TransactionSynchronization::ConsumerClose(consumer_id) => {
                    if let Some(consumer) =
                        session.consumers.get(consumer_id).map(|e| e.value().clone())
                    {
                        consumer.do_close().await;
                    }
                }
            }
        }
        Ok(())
    }

    /// Rollback: the rollback command, then after-rollback synchronizations
    /// drive consumer-side redelivery.
    pub(crate) async fn rollback(&self, session: &Arc<SessionInner>) -> CmsResult<()> {
        let transaction_id = lock(&self.transaction_id).take();
        if let Some(transaction_id) = &transaction_id {
            let connection = self.connection.upgrade().ok_or(CmsError::AlreadyClosed {
                resource: "connection",
            })?;
            let rollback = TransactionInfo {
                command_id: 0,
                response_required: false,
                connection_id: connection.connection_id.clone(),
                transaction_id: Some(transaction_id.clone()),
                transaction_type: TransactionType::Rollback,
            };
            connection
                .sync_request(
                    Command::TransactionInfo(rollback),
                    connection.request_timeout(),
                )
                .await?;
            debug!(transaction_id = %transaction_id, "transaction rolled back");
        }

        let synchronizations = {
            let mut guard = lock(&self.synchronizations);
            std::mem::take(&mut *guard)
        };
        for synchronization in &synchronizations {
            match synchronization {
                TransactionSynchronization::ConsumerTransaction(consumer_id) => {
                    if let Some(consumer) =
                        session.consumers.get(consumer_id).map(|e| e.value().clone())
                    {
                        consumer.clear_synchronization_registered();
                        consumer.rollback().await;
                    }
                }
                TransactionSynchronization::ConsumerClose(consumer_id) => {
                    if let Some(consumer) =
                        session.consumers.get(consumer_id).map(|e| e.value().clone())
                    {
                        consumer.do_close().await;
                    }
                }
            }
        }
        Ok(())
    }
}
