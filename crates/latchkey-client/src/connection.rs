//! One TCP connection to a lock server, with session handshake and reconnect
//!
//! A supervisor task owns the connect/handshake/read/teardown cycle. Each
//! successful handshake produces a fresh [`Session`] holding the write half
//! and the pending table; teardown drains that table with
//! [`ClientError::ConnectionClosed`] and the supervisor reconnects after a
//! fixed interval until [`Connection::close`] is called.

use crate::error::{ClientError, Result};
use crate::pending::{Pending, PendingTable};
use crate::scheduler::{Callback, Scheduler};
use latchkey_protocol::{
    codes, CommandResult, Frame, IdGenerator, Ident, InitCommand, PingCommand, RequestCommand,
    FRAME_SIZE,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{lookup_host, TcpSocket};
use tokio::sync::{oneshot, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lifecycle of a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Handshaking,
    Live,
    /// Closed by the owner; no further reconnects
    Closed,
}

/// Told when a connection goes live or loses its session.
pub trait LivenessListener: Send + Sync {
    fn on_live(&self, index: usize, init_type: u8);
    fn on_closed(&self, index: usize);
}

/// Timing knobs for one connection.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub reconnect_interval: Duration,
    pub response_grace: Duration,
}

impl From<&crate::ClientConfig> for ConnectionSettings {
    fn from(config: &crate::ClientConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            handshake_timeout: config.handshake_timeout(),
            reconnect_interval: config.reconnect_interval(),
            response_grace: config.response_grace(),
        }
    }
}

/// Per-client state every connection of that client shares.
#[derive(Clone)]
pub(crate) struct ConnectionContext {
    pub(crate) client_id: Ident,
    pub(crate) ids: Arc<IdGenerator>,
    pub(crate) scheduler: Arc<Scheduler>,
    pub(crate) settings: ConnectionSettings,
}

/// One handshaken socket. Replaced wholesale on reconnect.
struct Session {
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    pending: Arc<PendingTable>,
    teardown: CancellationToken,
    torn_down: AtomicBool,
    init_type: u8,
}

struct Inner {
    index: usize,
    address: String,
    context: ConnectionContext,
    runtime: tokio::runtime::Handle,
    state: Mutex<ConnectionState>,
    state_changed: Notify,
    session: Mutex<Option<Arc<Session>>>,
    listener: Option<Weak<dyn LivenessListener>>,
    shutdown: CancellationToken,
}

/// A self-healing connection to one lock server.
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Connects and handshakes before returning; failures surface here.
    pub(crate) async fn connect(
        index: usize,
        address: String,
        context: ConnectionContext,
        listener: Option<Weak<dyn LivenessListener>>,
    ) -> Result<Self> {
        let inner = Inner::new(index, address, context, listener);
        let established = inner.establish().await.map_err(|e| {
            inner.set_state(ConnectionState::Disconnected);
            e
        })?;
        inner.go_live(&established.0);
        tokio::spawn(supervise(inner.clone(), Some(established)));
        Ok(Self { inner })
    }

    /// Starts connecting in the background.
    pub(crate) fn spawn(
        index: usize,
        address: String,
        context: ConnectionContext,
        listener: Option<Weak<dyn LivenessListener>>,
    ) -> Self {
        let inner = Inner::new(index, address, context, listener);
        tokio::spawn(supervise(inner.clone(), None));
        Self { inner }
    }

    /// Position in the configured host list.
    pub fn index(&self) -> usize {
        self.inner.index
    }

    pub fn address(&self) -> &str {
        &self.inner.address
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock()
    }

    pub fn is_live(&self) -> bool {
        self.live_session().is_some()
    }

    /// Waits until a handshaken session is up.
    pub async fn wait_for_live(&self, timeout: Duration) -> Result<()> {
        tokio::time::timeout(timeout, async {
            loop {
                let changed = self.inner.state_changed.notified();
                if self.is_live() {
                    return;
                }
                changed.await;
            }
        })
        .await
        .map_err(|_| ClientError::Unconnected)
    }

    /// Init type of the current session, if live.
    pub fn init_type(&self) -> Option<u8> {
        self.live_session().map(|session| session.init_type)
    }

    /// Number of requests waiting on the current session.
    pub fn pending_count(&self) -> usize {
        self.live_session()
            .map(|session| session.pending.len())
            .unwrap_or(0)
    }

    fn live_session(&self) -> Option<Arc<Session>> {
        self.inner
            .session
            .lock()
            .as_ref()
            .filter(|session| !session.torn_down.load(Ordering::Acquire))
            .cloned()
    }

    /// Sends a request and waits for its result.
    ///
    /// The wait is bounded by the command's own server-side timeout plus the
    /// configured grace period. Expiry leaves the server untouched.
    pub async fn send(&self, command: RequestCommand) -> Result<CommandResult> {
        let session = self.live_session().ok_or(ClientError::Unconnected)?;
        let request_id = command.request_id();
        let (tx, rx) = oneshot::channel();
        if session
            .pending
            .register(request_id, Pending::Waiter(tx))
            .is_err()
        {
            return Err(ClientError::ConnectionClosed);
        }
        self.spawn_write(session.clone(), command);

        let bound = command.wait_duration() + self.inner.context.settings.response_grace;
        match tokio::time::timeout(bound, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(ClientError::ConnectionClosed),
            Err(_) => {
                session.pending.take(&request_id);
                Err(ClientError::Timeout(bound))
            }
        }
    }

    /// Sends a request; `callback` runs exactly once on the worker pool.
    pub fn send_with_callback(&self, command: RequestCommand, callback: Callback) {
        let scheduler = self.inner.context.scheduler.clone();
        let Some(session) = self.live_session() else {
            scheduler.dispatch(callback, Err(ClientError::Unconnected));
            return;
        };

        let request_id = command.request_id();
        let wait = command.wait_duration() + self.inner.context.settings.response_grace;
        let deferred = scheduler.defer(request_id, wait, &session.pending, callback);
        if let Err(pending) = session
            .pending
            .register(request_id, Pending::Deferred(deferred))
        {
            pending.resolve(Err(ClientError::ConnectionClosed));
            return;
        }
        self.spawn_write(session, command);
    }

    /// Writes the frame from its own task, so a caller dropped mid-write
    /// never leaves a partial frame on the stream. A failed write fails the
    /// request and tears the session down.
    fn spawn_write(&self, session: Arc<Session>, command: RequestCommand) {
        let inner = self.inner.clone();
        self.inner.runtime.spawn(async move {
            let request_id = command.request_id();
            let mut writer = session.writer.lock().await;
            if let Err(e) = writer.write_all(&command.encode()).await {
                drop(writer);
                inner.fail_session(&session, &e);
                if let Some(pending) = session.pending.take(&request_id) {
                    pending.resolve(Err(ClientError::Write(e)));
                }
            }
        });
    }

    pub async fn ping(&self) -> Result<()> {
        let command = RequestCommand::Ping(PingCommand {
            request_id: self.inner.context.ids.next_id(),
        });
        match self.send(command).await? {
            CommandResult::Ping(result) if result.result == codes::SUCCESS => Ok(()),
            CommandResult::Ping(result) => Err(ClientError::UnexpectedResponse(format!(
                "ping answered with code {}",
                result.result
            ))),
            other => Err(ClientError::UnexpectedResponse(format!(
                "ping answered with {:?}",
                other
            ))),
        }
    }

    /// Stops reconnecting and fails everything pending.
    pub fn close(&self) {
        self.inner.shutdown.cancel();
        let current = self.inner.session.lock().take();
        if let Some(session) = current {
            self.inner.teardown(&session);
        }
        self.inner.set_state(ConnectionState::Closed);
    }

    /// Drops the current session as if the socket had failed.
    pub fn disconnect(&self) {
        let current = self.inner.session.lock().clone();
        if let Some(session) = current {
            session.teardown.cancel();
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

impl Inner {
    fn new(
        index: usize,
        address: String,
        context: ConnectionContext,
        listener: Option<Weak<dyn LivenessListener>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            index,
            address,
            context,
            runtime: tokio::runtime::Handle::current(),
            state: Mutex::new(ConnectionState::Disconnected),
            state_changed: Notify::new(),
            session: Mutex::new(None),
            listener,
            shutdown: CancellationToken::new(),
        })
    }

    fn set_state(&self, next: ConnectionState) {
        {
            let mut state = self.state.lock();
            if *state != ConnectionState::Closed {
                *state = next;
            }
        }
        self.state_changed.notify_waiters();
    }

    fn listener(&self) -> Option<Arc<dyn LivenessListener>> {
        self.listener.as_ref().and_then(Weak::upgrade)
    }

    async fn establish(&self) -> Result<(Arc<Session>, OwnedReadHalf)> {
        self.set_state(ConnectionState::Connecting);
        let settings = self.context.settings;

        let address = lookup_host(self.address.as_str()).await?.next().ok_or_else(|| {
            ClientError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} did not resolve", self.address),
            ))
        })?;
        let socket = if address.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_keepalive(true)?;
        let stream = tokio::time::timeout(settings.connect_timeout, socket.connect(address))
            .await
            .map_err(|_| {
                ClientError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connect to {} timed out", self.address),
                ))
            })??;
        stream.set_nodelay(true)?;

        self.set_state(ConnectionState::Handshaking);
        let (mut reader, mut writer) = stream.into_split();
        let init = InitCommand {
            request_id: self.context.ids.next_id(),
            client_id: self.context.client_id,
        };
        let init_type = tokio::time::timeout(
            settings.handshake_timeout,
            handshake(&mut reader, &mut writer, &init),
        )
        .await
        .map_err(|_| ClientError::Handshake("no init result before timeout".to_string()))??;

        let session = Arc::new(Session {
            writer: tokio::sync::Mutex::new(writer),
            pending: Arc::new(PendingTable::new()),
            teardown: self.shutdown.child_token(),
            torn_down: AtomicBool::new(false),
            init_type,
        });
        Ok((session, reader))
    }

    fn go_live(&self, session: &Arc<Session>) {
        *self.session.lock() = Some(session.clone());
        self.set_state(ConnectionState::Live);
        info!(
            address = %self.address,
            init_type = session.init_type,
            "lock server connection live"
        );
        if let Some(listener) = self.listener() {
            listener.on_live(self.index, session.init_type);
        }
    }

    async fn read_loop(&self, session: &Session, mut reader: OwnedReadHalf) {
        let mut frame = [0u8; FRAME_SIZE];
        loop {
            tokio::select! {
                _ = session.teardown.cancelled() => return,
                read = reader.read_exact(&mut frame) => {
                    if let Err(e) = read {
                        debug!(address = %self.address, "read failed: {}", e);
                        return;
                    }
                }
            }

            match CommandResult::decode(&frame) {
                Ok(result) => match session.pending.take(&result.request_id()) {
                    Some(pending) => pending.resolve(Ok(result)),
                    None => debug!(
                        request_id = %result.request_id(),
                        "dropping response for unknown request"
                    ),
                },
                Err(e) => warn!(address = %self.address, "dropping malformed frame: {}", e),
            }
        }
    }

    /// Cancels the session after a write failure; the supervisor tears down.
    fn fail_session(&self, session: &Session, error: &std::io::Error) {
        warn!(address = %self.address, "write failed: {}", error);
        session.teardown.cancel();
    }

    /// Fails every pending request once and reports the loss. Idempotent.
    fn teardown(&self, session: &Arc<Session>) {
        if session.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        session.teardown.cancel();
        {
            let mut current = self.session.lock();
            if current.as_ref().is_some_and(|s| Arc::ptr_eq(s, session)) {
                *current = None;
            }
        }
        self.set_state(ConnectionState::Disconnected);

        let pending = session.pending.drain();
        info!(
            address = %self.address,
            failed = pending.len(),
            "lock server connection closed"
        );
        for entry in pending {
            entry.resolve(Err(ClientError::ConnectionClosed));
        }
        if let Some(listener) = self.listener() {
            listener.on_closed(self.index);
        }
    }
}

async fn handshake(
    reader: &mut OwnedReadHalf,
    writer: &mut OwnedWriteHalf,
    init: &InitCommand,
) -> Result<u8> {
    writer.write_all(&init.encode()).await?;
    let mut frame = [0u8; FRAME_SIZE];
    reader.read_exact(&mut frame).await?;
    match CommandResult::decode(&frame)? {
        CommandResult::Init(result) if result.request_id != init.request_id => Err(
            ClientError::Handshake("init result for another request".to_string()),
        ),
        CommandResult::Init(result) if result.result != codes::SUCCESS => Err(
            ClientError::Handshake(format!("server refused session with code {}", result.result)),
        ),
        CommandResult::Init(result) => Ok(result.init_type),
        other => Err(ClientError::Handshake(format!(
            "expected init result, got {:?}",
            other
        ))),
    }
}

/// Drives the connection until close. `live` is a session that
/// [`Connection::connect`] already brought up.
async fn supervise(inner: Arc<Inner>, mut live: Option<(Arc<Session>, OwnedReadHalf)>) {
    loop {
        let next = match live.take() {
            Some(ready) => Ok(ready),
            None => {
                let attempt = tokio::select! {
                    _ = inner.shutdown.cancelled() => break,
                    attempt = inner.establish() => attempt,
                };
                attempt.map(|(session, reader)| {
                    inner.go_live(&session);
                    (session, reader)
                })
            }
        };

        match next {
            Ok((session, reader)) => {
                if inner.shutdown.is_cancelled() {
                    inner.teardown(&session);
                    break;
                }
                inner.read_loop(&session, reader).await;
                inner.teardown(&session);
            }
            Err(e) => {
                warn!(address = %inner.address, "connect failed: {}", e);
                inner.set_state(ConnectionState::Disconnected);
            }
        }

        debug!(
            address = %inner.address,
            delay_ms = inner.context.settings.reconnect_interval.as_millis() as u64,
            "scheduling reconnect"
        );
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = tokio::time::sleep(inner.context.settings.reconnect_interval) => {}
        }
    }
    inner.set_state(ConnectionState::Closed);
}
