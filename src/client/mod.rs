//! Long-lived realtime client: supervisor loop plus the public command API.
//!
//! One [`PrizrakClient`] owns one session. The supervisor walks
//! authenticate → connect → run → backoff forever until [`PrizrakClient::stop`]
//! is called; every connection runs its read loop, writer, keepalive, both
//! watchdogs and the delayed directory query, and tears all of them down
//! before the next attempt starts.

use crate::config::ClientConfig;
use crate::control::{ControlClient, ControlError, DeleteOutcome};
use crate::dispatch::{run_read_loop, DeviceStateSink, Disconnect, DispatchContext, Dispatcher};
use crate::model::{Device, DeviceCommand, DeviceId, DeviceState};
use crate::passport::{AuthGrant, PassportClient, PassportError, TokenSource};
use crate::pending::{InvocationOutcome, PendingInvocations, CONNECTION_LOST};
use crate::protocol::{self, Invocation};
use crate::session::{ConnectRecovery, Session};
use crate::transport::{
    open_socket, run_keepalive, run_writer, ConnectError, SocketEndpoint, TransportHandle, WsError,
    OUTBOUND_BUFFER,
};
use crate::watchdog::{run_watchdog, WatchdogKind};
use futures_util::{Sink, Stream, StreamExt};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct ClientTimings {
    pub http_timeout: Duration,
    pub delete_timeout: Duration,
    pub token_validity: Duration,
    pub reconnect_delay: Duration,
    pub backoff_cap: Duration,
    pub backoff_max_exponent: u32,
    pub reauth_retry: Duration,
    pub conflict_retry: Duration,
    pub ping_interval: Duration,
    pub watchdog_interval: Duration,
    pub message_timeout: Duration,
    pub event_timeout: Duration,
    pub handshake_grace: Duration,
    pub command_timeout: Duration,
    pub send_timeout: Duration,
    pub ready_timeout: Duration,
}

impl Default for ClientTimings {
    fn default() -> Self {
        Self::from(&ClientConfig::default())
    }
}

impl From<&ClientConfig> for ClientTimings {
    fn from(c: &ClientConfig) -> Self {
        Self {
            http_timeout: Duration::from_secs(c.http_timeout_secs),
            delete_timeout: Duration::from_secs(c.delete_timeout_secs),
            token_validity: Duration::from_secs(c.token_validity_hours * 3600),
            reconnect_delay: Duration::from_secs(c.reconnect_delay_secs),
            backoff_cap: Duration::from_secs(c.backoff_cap_secs),
            backoff_max_exponent: c.backoff_max_exponent,
            reauth_retry: Duration::from_secs(c.reauth_retry_secs),
            conflict_retry: Duration::from_secs(c.conflict_retry_secs),
            ping_interval: Duration::from_secs(c.ping_interval_secs),
            watchdog_interval: Duration::from_secs(c.watchdog_interval_secs),
            message_timeout: Duration::from_secs(c.message_timeout_secs),
            event_timeout: Duration::from_secs(c.event_timeout_secs),
            handshake_grace: Duration::from_millis(c.handshake_grace_ms),
            command_timeout: Duration::from_secs(c.command_timeout_secs),
            send_timeout: Duration::from_secs(c.send_timeout_secs),
            ready_timeout: Duration::from_secs(c.ready_timeout_secs),
        }
    }
}

/// `min(base * 2^min(attempts, max_exponent), cap)`; attempts grow without bound.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    max_exponent: u32,
    attempts: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration, max_exponent: u32) -> Self {
        Self {
            base,
            cap,
            max_exponent,
            attempts: 0,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let exponent = self.attempts.min(self.max_exponent);
        let factor = 2u32.saturating_pow(exponent);
        self.attempts = self.attempts.saturating_add(1);
        self.base.saturating_mul(factor).min(self.cap)
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("not connected")]
    NotConnected,
    #[error("command send timed out")]
    SendTimeout,
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("server rejected command: {0}")]
    Rejected(String),
    #[error("{0}")]
    ConnectionLost(String),
    #[error("failed to encode command: {0}")]
    Encode(#[from] protocol::FrameError),
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientStatus {
    pub running: bool,
    pub connected: bool,
    pub devices_ready: bool,
    pub device_count: usize,
    pub pending_commands: usize,
    pub token_source: Option<TokenSource>,
}

pub type SocketSink = Pin<Box<dyn Sink<Message, Error = WsError> + Send>>;
pub type SocketStream = Pin<Box<dyn Stream<Item = Result<Message, WsError>> + Send>>;

/// Network calls the supervisor makes outside an open socket.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn authenticate(&self) -> Result<AuthGrant, PassportError>;

    async fn negotiate(&self, token: &str) -> Result<String, ControlError>;

    async fn delete(&self, connection_id: &str, token: &str) -> DeleteOutcome;

    async fn open(
        &self,
        connection_id: &str,
        token: &str,
    ) -> Result<(SocketSink, SocketStream), ConnectError>;
}

/// Passport, hub control endpoints and the websocket itself.
pub struct ServiceConnector {
    passport: PassportClient,
    control: ControlClient,
    endpoint: SocketEndpoint,
    connect_timeout: Duration,
}

impl ServiceConnector {
    pub fn new(
        passport: PassportClient,
        control: ControlClient,
        endpoint: SocketEndpoint,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            passport,
            control,
            endpoint,
            connect_timeout,
        }
    }
}

#[async_trait]
impl Connector for ServiceConnector {
    async fn authenticate(&self) -> Result<AuthGrant, PassportError> {
        self.passport.authenticate().await
    }

    async fn negotiate(&self, token: &str) -> Result<String, ControlError> {
        self.control.negotiate(token).await
    }

    async fn delete(&self, connection_id: &str, token: &str) -> DeleteOutcome {
        self.control.delete(connection_id, token).await
    }

    async fn open(
        &self,
        connection_id: &str,
        token: &str,
    ) -> Result<(SocketSink, SocketStream), ConnectError> {
        let envelope = self
            .control
            .envelope_json(token)
            .map_err(|err| ConnectError::Other(format!("auth envelope: {err}")))?;
        let url = self.endpoint.url(connection_id, &envelope);
        let socket = open_socket(&url, &self.endpoint.origin, self.connect_timeout).await?;
        let (sink, stream) = socket.split();
        let sink: SocketSink = Box::pin(sink);
        let stream: SocketStream = Box::pin(stream);
        Ok((sink, stream))
    }
}

struct Shared {
    ctx: Arc<DispatchContext>,
    session: Mutex<Session>,
    transport: Mutex<Option<TransportHandle>>,
    connector: Arc<dyn Connector>,
    timings: ClientTimings,
}

impl Shared {
    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn current_transport(&self) -> Option<TransportHandle> {
        self.transport
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .filter(|handle| !handle.is_closed())
    }

    fn publish_transport(&self, handle: Option<TransportHandle>) {
        *self
            .transport
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = handle;
    }
}

pub struct PrizrakClient {
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PrizrakClient {
    pub fn new(
        passport: PassportClient,
        control: ControlClient,
        endpoint: SocketEndpoint,
        timings: ClientTimings,
        sink: Arc<dyn DeviceStateSink>,
    ) -> Self {
        let connector = ServiceConnector::new(passport, control, endpoint, timings.http_timeout);
        Self::with_connector(Arc::new(connector), timings, sink)
    }

    pub fn with_connector(
        connector: Arc<dyn Connector>,
        timings: ClientTimings,
        sink: Arc<dyn DeviceStateSink>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                ctx: Arc::new(DispatchContext::new(sink)),
                session: Mutex::new(Session::new()),
                transport: Mutex::new(None),
                connector,
                timings,
            }),
            shutdown,
            task: Mutex::new(None),
        }
    }

    /// Spawns the supervisor. Returns `false` if it is already running.
    pub fn start(&self) -> bool {
        let mut task = self.task_slot();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return false;
        }
        self.shutdown.send_replace(false);
        let shared = self.shared.clone();
        let shutdown = self.shutdown.subscribe();
        *task = Some(tokio::spawn(supervise(shared, shutdown)));
        true
    }

    /// Cancels the supervisor and waits for every connection task to finish.
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);
        let task = self.task_slot().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                tracing::warn!(error = %err, "supervisor task ended abnormally");
            }
        }
        self.shared.ctx.pending.cancel_all(CONNECTION_LOST);
        tracing::info!("client stopped");
    }

    /// Force-closes the current transport; the supervisor reconnects.
    pub fn reconnect(&self) -> bool {
        match self.shared.current_transport() {
            Some(handle) => {
                tracing::info!("reconnect requested");
                handle.close()
            }
            None => false,
        }
    }

    pub async fn wait_until_ready(&self, timeout: Duration) -> bool {
        self.shared.ctx.ready.wait(timeout).await
    }

    pub fn is_ready(&self) -> bool {
        self.shared.ctx.ready.is_set()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.current_transport().is_some()
    }

    pub fn devices(&self) -> Vec<Device> {
        self.shared.ctx.directory.list()
    }

    pub fn device(&self, device_id: DeviceId) -> Option<Device> {
        self.shared.ctx.directory.get(device_id)
    }

    pub fn device_state(&self, device_id: DeviceId) -> Option<DeviceState> {
        self.shared.ctx.store.snapshot(device_id)
    }

    pub fn device_states(&self) -> Vec<DeviceState> {
        self.shared.ctx.store.snapshots()
    }

    pub fn pending_commands(&self) -> usize {
        self.shared.ctx.pending.len()
    }

    pub fn timings(&self) -> &ClientTimings {
        &self.shared.timings
    }

    pub fn status(&self) -> ClientStatus {
        ClientStatus {
            running: self.task_slot().as_ref().is_some_and(|t| !t.is_finished()),
            connected: self.is_connected(),
            devices_ready: self.is_ready(),
            device_count: self.shared.ctx.directory.list().len(),
            pending_commands: self.pending_commands(),
            token_source: self.shared.session().token_source(),
        }
    }

    /// Sends `command` to `device_id` and waits up to `timeout` for the
    /// server's completion.
    pub async fn send_command(
        &self,
        device_id: DeviceId,
        command: DeviceCommand,
        timeout: Duration,
    ) -> Result<Option<Value>, CommandError> {
        let transport = self.shared.current_transport().ok_or(CommandError::NotConnected)?;
        if self.shared.session().connection_id().is_none() {
            return Err(CommandError::NotConnected);
        }

        let ctx = &self.shared.ctx;
        let invocation_id = ctx.ids.next();
        let frame = protocol::encode_invocation(&Invocation::device_command(
            invocation_id.clone(),
            device_id,
            command,
        ))?;
        let waiter = ctx.pending.register(invocation_id.clone());
        let _slot = SlotGuard {
            pending: &ctx.pending,
            invocation_id: &invocation_id,
        };

        match tokio::time::timeout(self.shared.timings.send_timeout, transport.send_text(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => return Err(CommandError::NotConnected),
            Err(_) => {
                tracing::error!(%command, device_id, invocation_id = %invocation_id, "command send timed out");
                return Err(CommandError::SendTimeout);
            }
        }
        tracing::info!(%command, device_id, invocation_id = %invocation_id, "command sent");

        let outcome = match tokio::time::timeout(timeout, waiter).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => InvocationOutcome::Cancelled(CONNECTION_LOST.to_string()),
            Err(_) => {
                tracing::error!(%command, device_id, invocation_id = %invocation_id, "command timed out");
                return Err(CommandError::Timeout(timeout));
            }
        };
        match outcome {
            InvocationOutcome::Success(result) => {
                tracing::info!(%command, device_id, invocation_id = %invocation_id, "command confirmed");
                Ok(result)
            }
            InvocationOutcome::Failed(message) => {
                tracing::error!(
                    %command,
                    device_id,
                    invocation_id = %invocation_id,
                    error = %message,
                    "command failed"
                );
                Err(CommandError::Rejected(message))
            }
            InvocationOutcome::Cancelled(reason) => {
                tracing::warn!(
                    %command,
                    device_id,
                    invocation_id = %invocation_id,
                    reason = %reason,
                    "command cancelled"
                );
                Err(CommandError::ConnectionLost(reason))
            }
        }
    }

    /// Boolean form of [`send_command`](Self::send_command) using the
    /// configured command timeout.
    pub async fn send_command_ok(&self, device_id: DeviceId, command: DeviceCommand) -> bool {
        self.send_command(device_id, command, self.shared.timings.command_timeout)
            .await
            .is_ok()
    }

    fn task_slot(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.task.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Removes a correlation slot when the caller stops waiting, whatever the reason.
struct SlotGuard<'a> {
    pending: &'a PendingInvocations,
    invocation_id: &'a str,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(self.invocation_id);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Authenticate,
    Connect,
    Backoff(Duration),
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ConnectionEnd {
    Shutdown,
    Disconnected(Disconnect),
}

async fn supervise(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let t = &shared.timings;
    let mut backoff = Backoff::new(t.reconnect_delay, t.backoff_cap, t.backoff_max_exponent);
    let mut phase = Phase::Authenticate;
    tracing::info!("client started");

    loop {
        if *shutdown.borrow() {
            phase = Phase::Stopped;
        }
        phase = match phase {
            Phase::Authenticate => authenticate_phase(&shared, &mut shutdown).await,
            Phase::Connect => connect_phase(&shared, &mut backoff, &mut shutdown).await,
            Phase::Backoff(delay) => {
                if sleep_or_shutdown(delay, &mut shutdown).await {
                    Phase::Authenticate
                } else {
                    Phase::Stopped
                }
            }
            Phase::Stopped => break,
        };
    }

    shared.publish_transport(None);
    tracing::info!("supervisor stopped");
}

async fn authenticate_phase(shared: &Arc<Shared>, shutdown: &mut watch::Receiver<bool>) -> Phase {
    let valid = shared
        .session()
        .is_token_valid(Instant::now(), shared.timings.token_validity);
    if valid {
        return Phase::Connect;
    }
    if shared.session().token().is_some() {
        tracing::info!("access token expired, re-authenticating");
    }

    let connector = shared.connector.clone();
    let mut call = tokio::spawn(async move { connector.authenticate().await });
    let joined = tokio::select! {
        joined = &mut call => Some(joined),
        _ = wait_for_shutdown(shutdown) => None,
    };
    let Some(joined) = joined else {
        call.abort();
        return Phase::Stopped;
    };
    match joined {
        Ok(Ok(grant)) => {
            shared.session().set_token(grant);
            Phase::Connect
        }
        Ok(Err(err)) => {
            tracing::error!(
                error = %err,
                retry_secs = shared.timings.reauth_retry.as_secs(),
                "authentication failed"
            );
            Phase::Backoff(shared.timings.reauth_retry)
        }
        Err(err) => {
            tracing::error!(error = %err, "authentication task failed");
            Phase::Backoff(shared.timings.reauth_retry)
        }
    }
}

async fn connect_phase(
    shared: &Arc<Shared>,
    backoff: &mut Backoff,
    shutdown: &mut watch::Receiver<bool>,
) -> Phase {
    shared.ctx.pending.cancel_all(CONNECTION_LOST);

    let Some(token) = shared.session().token().map(str::to_string) else {
        return Phase::Authenticate;
    };

    let existing = shared.session().connection_id().map(str::to_string);
    let connection_id = match existing {
        Some(id) => id,
        None => {
            let connector = shared.connector.clone();
            let call_token = token.clone();
            let mut call = tokio::spawn(async move { connector.negotiate(&call_token).await });
            let joined = tokio::select! {
                joined = &mut call => Some(joined),
                _ = wait_for_shutdown(shutdown) => None,
            };
            let Some(joined) = joined else {
                call.abort();
                return Phase::Stopped;
            };
            match joined {
                Ok(Ok(id)) => {
                    tracing::info!("connection negotiated");
                    shared.session().set_connection_id(id.clone());
                    id
                }
                Ok(Err(err)) => {
                    tracing::error!(error = %err, "negotiation failed");
                    return connect_failed(backoff);
                }
                Err(err) => {
                    tracing::error!(error = %err, "negotiation task failed");
                    return connect_failed(backoff);
                }
            }
        }
    };

    tracing::info!("connecting socket");
    let opened = tokio::select! {
        opened = shared.connector.open(&connection_id, &token) => opened,
        _ = wait_for_shutdown(shutdown) => return Phase::Stopped,
    };
    let (sink, stream) = match opened {
        Ok(socket) => socket,
        Err(err) => {
            handle_connect_failure(shared, &err, &token, shutdown).await;
            if *shutdown.borrow() {
                return Phase::Stopped;
            }
            return connect_failed(backoff);
        }
    };

    tracing::info!("socket connected");
    backoff.reset();
    match run_connection(shared.clone(), sink, stream, shutdown).await {
        ConnectionEnd::Shutdown => Phase::Stopped,
        ConnectionEnd::Disconnected(reason) => {
            tracing::warn!(
                ?reason,
                retry_secs = shared.timings.reconnect_delay.as_secs(),
                "connection lost, reconnecting"
            );
            shared.session().clear_connection_id();
            Phase::Backoff(shared.timings.reconnect_delay)
        }
    }
}

fn connect_failed(backoff: &mut Backoff) -> Phase {
    let delay = backoff.next_delay();
    tracing::warn!(
        retry_secs = delay.as_secs(),
        attempt = backoff.attempts(),
        "connection failed, retrying"
    );
    Phase::Backoff(delay)
}

async fn handle_connect_failure(
    shared: &Arc<Shared>,
    err: &ConnectError,
    token: &str,
    shutdown: &mut watch::Receiver<bool>,
) {
    let recovery = shared.session().apply_connect_failure(err);
    match (err, recovery) {
        (ConnectError::NotFound | ConnectError::Unauthorized, _) => {
            tracing::warn!(error = %err, "socket rejected, forcing re-authentication");
        }
        (_, ConnectRecovery::DeleteStale(stale)) => {
            tracing::warn!(error = %err, "connection id in use, deleting it");
            let connector = shared.connector.clone();
            let token = token.to_string();
            tokio::spawn(async move {
                connector.delete(&stale, &token).await;
            });
            sleep_or_shutdown(shared.timings.conflict_retry, shutdown).await;
        }
        (ConnectError::Conflict, ConnectRecovery::Retry) => {
            tracing::warn!(error = %err, "connection id in use, renegotiating");
        }
        _ => tracing::error!(error = %err, "socket connect failed"),
    }
}

/// Drives one open socket until it ends or shutdown is requested, then
/// tears down every task that belonged to it.
async fn run_connection<S, St>(
    shared: Arc<Shared>,
    sink: S,
    stream: St,
    shutdown: &mut watch::Receiver<bool>,
) -> ConnectionEnd
where
    S: Sink<Message, Error = WsError> + Unpin + Send + 'static,
    St: Stream<Item = Result<Message, WsError>> + Unpin,
{
    let t = shared.timings.clone();
    shared.ctx.clocks.reset();

    let (handle, outbound) = TransportHandle::new(OUTBOUND_BUFFER);
    let mut writer = tokio::spawn(run_writer(sink, outbound, handle.clone()));

    if let Err(err) = handle.send_handshake().await {
        tracing::warn!(error = %err, "handshake not sent");
    } else {
        tracing::info!("handshake sent");
    }
    shared.publish_transport(Some(handle.clone()));

    let clocks = shared.ctx.clocks.clone();
    let watchdog = |kind: WatchdogKind, timeout: Duration| {
        let (clocks, handle) = (clocks.clone(), handle.clone());
        let interval = t.watchdog_interval;
        tokio::spawn(async move {
            run_watchdog(kind, clocks, timeout, interval, handle).await;
        })
    };
    let tasks = vec![
        tokio::spawn(run_keepalive(handle.clone(), t.ping_interval)),
        watchdog(WatchdogKind::Message, t.message_timeout),
        watchdog(WatchdogKind::Event, t.event_timeout),
        tokio::spawn(request_directory(shared.clone(), handle.clone(), t.handshake_grace)),
    ];

    let mut dispatcher = Dispatcher::new(shared.ctx.clone(), handle.clone());
    let end = tokio::select! {
        reason = run_read_loop(stream, &mut dispatcher) => ConnectionEnd::Disconnected(reason),
        _ = wait_for_shutdown(shutdown) => ConnectionEnd::Shutdown,
    };

    shared.publish_transport(None);
    handle.close();
    for task in &tasks {
        task.abort();
    }
    for task in tasks {
        let _ = task.await;
    }
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
        writer.abort();
    }
    shared.ctx.pending.cancel_all(CONNECTION_LOST);
    end
}

async fn request_directory(shared: Arc<Shared>, handle: TransportHandle, grace: Duration) {
    tokio::time::sleep(grace).await;
    let request = Invocation::get_devices(shared.ctx.ids.next());
    match protocol::encode_invocation(&request) {
        Ok(frame) => match handle.send_text(frame).await {
            Ok(()) => tracing::info!("device directory requested"),
            Err(err) => tracing::warn!(error = %err, "directory request not sent"),
        },
        Err(err) => tracing::error!(error = %err, "failed to encode directory request"),
    }
}

/// Returns `true` if the full delay elapsed, `false` on shutdown.
async fn sleep_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = wait_for_shutdown(shutdown) => false,
    }
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
