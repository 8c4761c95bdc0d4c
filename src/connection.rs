//! The connection: transport owner, inbound demultiplexer, request broker.
//!
//! One reader task drains the transport's event stream. Correlated
//! responses complete their registered waiters; message dispatches route
//! through the consumer-id table to the owning session; control commands
//! are handled here. All outbound marshalling happens under one mutex so
//! frames never interleave.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::codec::OpenWireFormat;
use crate::commands::{
    AckType, BrokerInfo, Command, ConnectionId, ConnectionInfo, ConsumerId, Destination,
    DestinationInfo, DestinationOperation, KeepAliveInfo, MessageAck, MessageDispatch, RemoveInfo,
    RemovedObject, Response, SequenceGenerator, SessionId, ShutdownInfo,
};
use crate::config::ConnectionOptions;
use crate::error::{CmsError, CmsResult};
use crate::session::{AckMode, Session, SessionInner};
use crate::transport::{Transport, TransportEvent};

/// Callback invoked with asynchronous connection-level failures.
pub type ExceptionListener = Arc<dyn Fn(&CmsError) + Send + Sync>;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// A client connection to one broker.
///
/// Cheap to clone; all clones share the same underlying state.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

pub(crate) struct ConnectionInner {
    pub(crate) connection_id: ConnectionId,
    pub(crate) options: ConnectionOptions,
    transport: Box<dyn Transport>,
    wire_format: StdMutex<OpenWireFormat>,
    started: AtomicBool,
    closed: AtomicBool,
    transport_failed: AtomicBool,
    command_ids: SequenceGenerator,
    pub(crate) session_ids: SequenceGenerator,
    pub(crate) temp_destination_ids: SequenceGenerator,
    pub(crate) transaction_ids: SequenceGenerator,
    sessions: DashMap<i64, Arc<SessionInner>>,
    dispatchers: DashMap<ConsumerId, Arc<SessionInner>>,
    waiters: DashMap<i32, oneshot::Sender<CmsResult<Response>>>,
    exception_listener: StdMutex<Option<ExceptionListener>>,
    broker_info: StdMutex<Option<BrokerInfo>>,
    negotiated_tx: watch::Sender<bool>,
    reader: StdMutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Opens a connection over an already-established transport.
    ///
    /// Sends our `WireFormatInfo`, waits for the peer's counterpart so the
    /// codec can switch to the negotiated feature set, then announces the
    /// `ConnectionInfo` and waits for the broker to accept it.
    pub async fn connect(
        transport: Box<dyn Transport>,
        options: ConnectionOptions,
    ) -> CmsResult<Self> {
        options.validate()?;
        let wire_format = OpenWireFormat::new(&options.wire_format)?;
        let events = transport
            .take_events()
            .ok_or_else(|| CmsError::illegal_state("transport event stream already taken"))?;

        let (negotiated_tx, mut negotiated_rx) = watch::channel(false);
        let inner = Arc::new(ConnectionInner {
            connection_id: ConnectionId::generate(),
            options,
            transport,
            wire_format: StdMutex::new(wire_format),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            transport_failed: AtomicBool::new(false),
            command_ids: SequenceGenerator::new(),
            session_ids: SequenceGenerator::new(),
            temp_destination_ids: SequenceGenerator::new(),
            transaction_ids: SequenceGenerator::new(),
            sessions: DashMap::new(),
            dispatchers: DashMap::new(),
            waiters: DashMap::new(),
            exception_listener: StdMutex::new(None),
            broker_info: StdMutex::new(None),
            negotiated_tx,
            reader: StdMutex::new(None),
        });

        let reader = tokio::spawn(run_reader(inner.clone(), events));
        *lock(&inner.reader) = Some(reader);

        // Handshake: negotiation frames stay encoding-agnostic.
        let preferred = lock(&inner.wire_format).preferred_info();
        if let Err(err) = inner.oneway(Command::WireFormatInfo(preferred)).await {
            inner.shutdown_transport().await;
            return Err(err);
        }

        let negotiated = tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
            while !*negotiated_rx.borrow_and_update() {
                if negotiated_rx.changed().await.is_err() {
                    return false;
                }
            }
            true
        })
        .await
        .unwrap_or(false);
        if !negotiated {
            inner.shutdown_transport().await;
            return Err(CmsError::Timeout {
                timeout_ms: HANDSHAKE_TIMEOUT.as_millis() as u64,
            });
        }

        let info = ConnectionInfo {
            command_id: 0,
            response_required: false,
            connection_id: inner.connection_id.clone(),
            client_id: inner.options.client_id.clone(),
            user_name: inner.options.user_name.clone(),
            password: inner.options.password.clone(),
        };
        if let Err(err) = inner
            .sync_request(Command::ConnectionInfo(info), DEFAULT_REQUEST_TIMEOUT)
            .await
        {
            inner.shutdown_transport().await;
            return Err(err);
        }

        info!(connection_id = %inner.connection_id, "connection established");
        Ok(Self { inner })
    }

    /// This connection's id.
    pub fn connection_id(&self) -> &ConnectionId {
        &self.inner.connection_id
    }

    /// Registers the asynchronous failure callback.
    pub fn set_exception_listener(&self, listener: ExceptionListener) {
        *lock(&self.inner.exception_listener) = Some(listener);
    }

    /// The broker's self-identification, once received.
    pub fn broker_info(&self) -> Option<BrokerInfo> {
        lock(&self.inner.broker_info).clone()
    }

    /// Opens the dispatch gate: sessions begin delivering to user code.
    ///
    /// Messages received while stopped are queued, not lost.
    pub fn start(&self) -> CmsResult<()> {
        self.inner.check_closed()?;
        self.inner.started.store(true, Ordering::SeqCst);
        for session in &self.inner.sessions {
            session.value().start();
        }
        Ok(())
    }

    /// Closes the dispatch gate without tearing anything down.
    pub fn stop(&self) -> CmsResult<()> {
        self.inner.check_closed()?;
        self.inner.started.store(false, Ordering::SeqCst);
        for session in &self.inner.sessions {
            session.value().stop();
        }
        Ok(())
    }

    /// Whether `start` has been called and `stop`/`close` has not.
    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }

    /// Creates a session; its `SessionInfo` goes to the broker oneway.
    pub async fn create_session(&self, ack_mode: AckMode) -> CmsResult<Session> {
        self.inner.check_closed()?;
        let session_id = SessionId {
            connection_id: self.inner.connection_id.clone(),
            value: self.inner.session_ids.next(),
        };
        let session = Session::create(self.inner.clone(), session_id.clone(), ack_mode);
        self.inner
            .sessions
            .insert(session_id.value, session.inner().clone());

        self.inner
            .oneway(Command::SessionInfo(session.session_info()))
            .await?;

        if self.is_started() {
            session.inner().start();
        }
        Ok(session)
    }

    /// Destroys a destination broker-side.
    ///
    /// The broker refuses while consumers are attached; that refusal maps
    /// to [`CmsError::DestinationInUse`].
    pub async fn destroy_destination(&self, destination: &Destination) -> CmsResult<()> {
        self.inner.check_closed()?;
        let info = DestinationInfo {
            command_id: 0,
            response_required: false,
            connection_id: self.inner.connection_id.clone(),
            destination: destination.clone(),
            operation: DestinationOperation::Remove,
            timeout: 0,
        };
        match self
            .inner
            .sync_request(Command::DestinationInfo(info), DEFAULT_REQUEST_TIMEOUT)
            .await
        {
            Err(CmsError::Broker {
                exception_class, ..
            }) if exception_class.contains("DestinationInUse") => {
                Err(CmsError::DestinationInUse {
                    destination: destination.clone(),
                })
            }
            other => other.map(|_| ()),
        }
    }

    /// Closes the connection and everything under it. Idempotent.
    pub async fn close(&self) -> CmsResult<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.started.store(false, Ordering::SeqCst);

        let sessions: Vec<Arc<SessionInner>> = self
            .inner
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for session in sessions {
            session.shutdown().await;
        }
        self.inner.sessions.clear();
        self.inner.dispatchers.clear();

        // Best effort; the broker may already be gone.
        let remove = RemoveInfo {
            command_id: 0,
            response_required: false,
            object_id: RemovedObject::Connection(self.inner.connection_id.clone()),
            last_delivered_sequence_id: 0,
        };
        let _ = self.inner.send_raw(Command::RemoveInfo(remove)).await;
        let _ = self
            .inner
            .send_raw(Command::ShutdownInfo(ShutdownInfo::default()))
            .await;

        self.inner.shutdown_transport().await;
        info!(connection_id = %self.inner.connection_id, "connection closed");
        Ok(())
    }

    pub(crate) fn inner(&self) -> &Arc<ConnectionInner> {
        &self.inner
    }
}

impl ConnectionInner {
    pub(crate) fn check_closed(&self) -> CmsResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CmsError::AlreadyClosed {
                resource: "connection",
            });
        }
        Ok(())
    }

    pub(crate) fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Routes consumer dispatches for `consumer_id` to `session`.
    pub(crate) fn add_dispatcher(&self, consumer_id: ConsumerId, session: Arc<SessionInner>) {
        self.dispatchers.insert(consumer_id, session);
    }

    pub(crate) fn remove_dispatcher(&self, consumer_id: &ConsumerId) {
        self.dispatchers.remove(consumer_id);
    }

    pub(crate) fn remove_session(&self, session_id: &SessionId) {
        self.sessions.remove(&session_id.value);
    }

    /// Fire-and-forget send with a fresh command id.
    pub(crate) async fn oneway(&self, command: Command) -> CmsResult<()> {
        self.check_closed()?;
        self.send_raw(command).await
    }

    async fn send_raw(&self, mut command: Command) -> CmsResult<()> {
        if self.transport_failed.load(Ordering::SeqCst) {
            return Err(CmsError::TransportBroken {
                reason: "transport failed".to_string(),
            });
        }
        command.set_command_id(self.command_ids.next() as i32);
        let frame = lock(&self.wire_format).marshal(&command)?;
        self.transport.oneway(frame).await?;
        Ok(())
    }

    /// Correlated request: sends, then blocks until the matching response
    /// or the timeout.
    pub(crate) async fn sync_request(
        &self,
        mut command: Command,
        timeout: Duration,
    ) -> CmsResult<Response> {
        self.check_closed()?;
        if self.transport_failed.load(Ordering::SeqCst) {
            return Err(CmsError::TransportBroken {
                reason: "transport failed".to_string(),
            });
        }

        let command_id = self.command_ids.next() as i32;
        command.set_command_id(command_id);
        command.set_response_required(true);

        let (tx, rx) = oneshot::channel();
        self.waiters.insert(command_id, tx);

        let frame = match lock(&self.wire_format).marshal(&command) {
            Ok(frame) => frame,
            Err(err) => {
                self.waiters.remove(&command_id);
                return Err(err.into());
            }
        };
        if let Err(err) = self.transport.oneway(frame).await {
            self.waiters.remove(&command_id);
            return Err(err.into());
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CmsError::TransportBroken {
                reason: "response channel dropped".to_string(),
            }),
            Err(_) => {
                self.waiters.remove(&command_id);
                Err(CmsError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// The per-request timeout derived from connection options.
    pub(crate) fn request_timeout(&self) -> Duration {
        match self.options.send_timeout.as_u64() {
            0 => DEFAULT_REQUEST_TIMEOUT,
            millis => Duration::from_millis(millis),
        }
    }

    /// Fans a failure out to the registered exception listener.
    pub(crate) fn fire(&self, err: &CmsError) {
        if let Some(listener) = lock(&self.exception_listener).clone() {
            listener(err);
        } else {
            warn!(error = %err, "connection exception with no listener registered");
        }
    }

    async fn shutdown_transport(&self) {
        if let Some(reader) = lock(&self.reader).take() {
            reader.abort();
        }
        let _ = self.transport.close().await;
    }

    fn fail_all_waiters(&self, reason: &str) {
        let ids: Vec<i32> = self.waiters.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, waiter)) = self.waiters.remove(&id) {
                let _ = waiter.send(Err(CmsError::TransportBroken {
                    reason: reason.to_string(),
                }));
            }
        }
    }

    async fn on_command(self: &Arc<Self>, command: Command) {
        match command {
            Command::WireFormatInfo(info) => {
                let result = lock(&self.wire_format).renegotiate(&info);
                match result {
                    Ok(()) => {
                        let _ = self.negotiated_tx.send(true);
                    }
                    Err(err) => {
                        let err = CmsError::from(err);
                        error!(error = %err, "wire format renegotiation failed");
                        self.transport_failed.store(true, Ordering::SeqCst);
                        self.fail_all_waiters("wire format renegotiation failed");
                        self.fire(&err);
                    }
                }
            }
            Command::Response(response) => {
                if let Some((_, waiter)) = self.waiters.remove(&response.correlation_id) {
                    let _ = waiter.send(Ok(response));
                } else {
                    debug!(correlation_id = response.correlation_id, "orphan response");
                }
            }
            Command::ExceptionResponse(response) => {
                if let Some((_, waiter)) = self.waiters.remove(&response.correlation_id) {
                    let _ = waiter.send(Err(CmsError::Broker {
                        exception_class: response.exception.exception_class,
                        message: response.exception.message,
                    }));
                } else {
                    debug!(
                        correlation_id = response.correlation_id,
                        "orphan exception response"
                    );
                }
            }
            Command::MessageDispatch(dispatch) => {
                let session = self
                    .dispatchers
                    .get(&dispatch.consumer_id)
                    .map(|entry| entry.value().clone());
                match session {
                    Some(session) => session.dispatch(*dispatch).await,
                    None => self.acknowledge_orphan_dispatch(*dispatch).await,
                }
            }
            Command::ConnectionError(error) => {
                let err = CmsError::Broker {
                    exception_class: error.exception.exception_class,
                    message: error.exception.message,
                };
                self.fire(&err);
            }
            Command::BrokerInfo(info) => {
                debug!(broker = ?info.broker_name, "broker info received");
                *lock(&self.broker_info) = Some(info);
            }
            Command::KeepAliveInfo(info) => {
                if info.response_required {
                    let _ = self
                        .send_raw(Command::KeepAliveInfo(KeepAliveInfo::default()))
                        .await;
                }
            }
            Command::ShutdownInfo(_) => {
                self.on_transport_broken("broker shut down");
            }
            other => {
                debug!(command = other.name(), "ignoring inbound command");
            }
        }
    }

    /// Flow-credit repair for a dispatch whose consumer is already gone.
    async fn acknowledge_orphan_dispatch(&self, dispatch: MessageDispatch) {
        let Some(message) = dispatch.message.as_deref() else {
            return;
        };
        debug!(consumer_id = %dispatch.consumer_id, "dispatch for unknown consumer, repairing window");
        let ack = MessageAck {
            command_id: 0,
            response_required: false,
            ack_type: AckType::Delivered,
            consumer_id: dispatch.consumer_id.clone(),
            destination: dispatch.destination.clone(),
            transaction_id: None,
            first_message_id: message.message_id.clone(),
            last_message_id: message.message_id.clone(),
            message_count: 1,
        };
        let _ = self.send_raw(Command::MessageAck(ack)).await;
    }

    fn on_transport_interrupted(&self) {
        warn!(connection_id = %self.connection_id, "transport interrupted");
        for session in &self.sessions {
            session.value().signal_transport_interrupted();
        }
    }

    /// Called by a consumer once it finished clearing in-flight messages.
    pub(crate) fn transport_interruption_processing_complete(&self) {
        debug!(connection_id = %self.connection_id, "interruption processing complete");
        self.transport.interruption_processing_complete();
    }

    async fn on_transport_resumed(self: &Arc<Self>) {
        info!(connection_id = %self.connection_id, "transport resumed, re-announcing state");
        let info = ConnectionInfo {
            command_id: 0,
            response_required: false,
            connection_id: self.connection_id.clone(),
            client_id: self.options.client_id.clone(),
            user_name: self.options.user_name.clone(),
            password: self.options.password.clone(),
        };
        let _ = self.send_raw(Command::ConnectionInfo(info)).await;
        for session in &self.sessions {
            let session = session.value();
            let _ = self
                .send_raw(Command::SessionInfo(session.session_info()))
                .await;
            for consumer_info in session.consumer_infos() {
                let _ = self.send_raw(Command::ConsumerInfo(consumer_info)).await;
            }
            for producer_info in session.producer_infos() {
                let _ = self.send_raw(Command::ProducerInfo(producer_info)).await;
            }
        }
    }

    fn on_transport_broken(&self, reason: &str) {
        if self.transport_failed.swap(true, Ordering::SeqCst) {
            return;
        }
        error!(connection_id = %self.connection_id, reason, "transport broken");
        self.fail_all_waiters(reason);
        self.fire(&CmsError::TransportBroken {
            reason: reason.to_string(),
        });
    }
}

async fn run_reader(
    inner: Arc<ConnectionInner>,
    mut events: tokio::sync::mpsc::Receiver<TransportEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Frame(frame) => {
                let decoded = lock(&inner.wire_format).unmarshal(&frame);
                match decoded {
                    Ok(Some(command)) => inner.on_command(command).await,
                    Ok(None) => {}
                    Err(err) => {
                        // The codec never recovers; tear the connection down.
                        let err = CmsError::from(err);
                        error!(error = %err, "inbound frame violated the wire format");
                        inner.transport_failed.store(true, Ordering::SeqCst);
                        inner.fail_all_waiters("wire format violation");
                        inner.fire(&err);
                        break;
                    }
                }
            }
            TransportEvent::Interrupted => inner.on_transport_interrupted(),
            TransportEvent::Resumed => inner.on_transport_resumed().await,
            TransportEvent::Broken(reason) => {
                inner.on_transport_broken(&reason);
                break;
            }
        }
        if inner.closed.load(Ordering::SeqCst) {
            break;
        }
    }
}

/// Lock helper: none of these mutexes are held across await points, and no
/// panic path runs under them, so poisoning is unreachable.
pub(crate) fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
