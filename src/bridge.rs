//! Per-child bridge orchestration.
//!
//! A [`Bridge`] owns one supervised child and one listener and binds their
//! lifecycles: child exit tears down the listener's ability to dispatch, and
//! stopping the bridge terminates the child. All mutable shared state - the
//! session registry, the router's correlation maps, the connection table,
//! and the child's stdin handle - lives behind a single mutex per bridge;
//! network sends happen after the guard is released.
//!
//! ```text
//! Stopped -> (start) -> Starting -> Running
//! Starting -> (spawn fails | bind fails | restricted port) -> Error
//! Running -> (child exits | listener error | stop) -> Stopped
//! ```

use std::collections::HashMap;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::process::{ChildStderr, ChildStdin, ChildStdout};
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;

use crate::config::{ChildConfig, ToolInfo};
use crate::discovery;
use crate::error::BridgeError;
use crate::events::{BridgeStatus, EventSender, LogStream};
use crate::framing::LineFramer;
use crate::http::server;
use crate::http::StreamFormat;
use crate::jsonrpc;
use crate::router::{EgressRoute, IngressOrigin, RouterState};
use crate::session::{ActiveClient, ConnectionId, SessionRegistry};
use crate::supervisor::{self, ChildHandle};

/// Shared cadence for session sweeping; stream keepalives tick at the same
/// rate inside each connection task.
const SWEEP_INTERVAL: Duration = Duration::from_secs(15);

/// Message delivered to a connection task's inbox.
#[derive(Debug)]
pub(crate) enum ConnectionMessage {
    /// A JSON-RPC line routed to this connection; the task frames it
    /// according to its own mode.
    Deliver(String),
}

/// What a connection is currently doing, mirrored into the shared table so
/// the router can pick dispatch targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnMode {
    /// Parsing requests; nothing routable yet.
    Request,
    /// Upgraded to a long-lived stream.
    Stream(StreamFormat),
    /// Sync POST waiting for its single response.
    SyncPending,
}

#[derive(Debug)]
pub(crate) struct ConnectionEntry {
    pub sender: mpsc::UnboundedSender<ConnectionMessage>,
    pub mode: ConnMode,
    pub session: Option<String>,
}

/// Everything behind the bridge's single state mutex.
#[derive(Debug, Default)]
pub(crate) struct BridgeState {
    pub router: RouterState,
    pub sessions: SessionRegistry,
    pub connections: HashMap<ConnectionId, ConnectionEntry>,
    pub child_stdin: Option<ChildStdin>,
    pub tools: Vec<ToolInfo>,
}

impl BridgeState {
    fn clear(&mut self) {
        self.router.clear();
        self.sessions.clear();
        self.connections.clear();
        self.child_stdin = None;
    }
}

/// State shared between the bridge's tasks.
pub(crate) struct BridgeShared {
    pub config: ChildConfig,
    pub events: EventSender,
    pub actual_port: AtomicU16,
    pub state: Mutex<BridgeState>,
}

impl BridgeShared {
    pub fn port(&self) -> u16 {
        self.actual_port.load(Ordering::SeqCst)
    }

    /// Write one line to the child's stdin: the payload plus exactly one
    /// trailing newline, as a single `write_all` under the state lock so
    /// bodies from different connections never interleave mid-line.
    pub(crate) async fn write_child_line(&self, payload: &[u8]) -> bool {
        let mut state = self.state.lock().await;
        let Some(stdin) = state.child_stdin.as_mut() else {
            self.events
                .log(LogStream::System, "dropping message: child stdin is closed");
            return false;
        };
        let mut line = Vec::with_capacity(payload.len() + 1);
        line.extend_from_slice(payload);
        if !line.ends_with(b"\n") {
            line.push(b'\n');
        }
        match stdin.write_all(&line).await {
            Ok(()) => {
                if let Err(e) = stdin.flush().await {
                    tracing::warn!(bridge_id = %self.config.id, error = %e, "stdin flush failed");
                }
                true
            }
            Err(e) => {
                self.events.log(
                    LogStream::System,
                    format!("stdin write failed, message dropped: {e}"),
                );
                false
            }
        }
    }

    /// Ingress hook: record the body's id against its origin, sniff
    /// `initialize` for the session name, and forward to the child.
    pub(crate) async fn forward_to_child(&self, origin: IngressOrigin, body: &[u8]) {
        let now = Instant::now();
        {
            let mut state = self.state.lock().await;
            let session_id = match &origin {
                IngressOrigin::Session(session) => Some(session.clone()),
                IngressOrigin::Stream { session, .. } => Some(session.clone()),
                _ => None,
            };
            if let Some(session) = session_id {
                if let Some(name) = jsonrpc::extract_initialize_client_name(body) {
                    state.sessions.record_initialize(&session, &name, now);
                    self.emit_active_clients(&state);
                }
            }
            state.router.record_ingress(&origin, body);
        }
        self.write_child_line(body).await;
    }

    /// Egress hook: route one child stdout line to exactly one destination
    /// (or broadcast). The state lock is released before any send.
    pub(crate) async fn route_child_line(&self, line: &str) {
        let mut sends: Vec<(mpsc::UnboundedSender<ConnectionMessage>, String)> = Vec::new();
        {
            let mut state = self.state.lock().await;
            match state.router.take_egress(line) {
                EgressRoute::LogOnly => {
                    self.events.log(LogStream::Stdout, line);
                    return;
                }
                EgressRoute::Discovery(tx, value) => {
                    let _ = tx.send(value);
                    return;
                }
                EgressRoute::Connection(conn) => match state.connections.get(&conn) {
                    Some(entry) => sends.push((entry.sender.clone(), line.to_string())),
                    None => {
                        tracing::debug!(%conn, "response target connection is gone, dropping");
                    }
                },
                EgressRoute::Session(session) => {
                    let entry = state
                        .sessions
                        .stream_conn(&session)
                        .and_then(|conn| state.connections.get(&conn));
                    match entry {
                        Some(entry) => sends.push((entry.sender.clone(), line.to_string())),
                        None => {
                            tracing::debug!(session, "no live stream for session, dropping");
                        }
                    }
                }
                EgressRoute::Broadcast => {
                    for entry in state.connections.values() {
                        if matches!(entry.mode, ConnMode::Stream(_)) {
                            sends.push((entry.sender.clone(), line.to_string()));
                        }
                    }
                }
            }
        }
        for (tx, payload) in sends {
            let _ = tx.send(ConnectionMessage::Deliver(payload));
        }
    }

    /// Remove a closed connection: unbind its session, orphan its pending
    /// ids, sweep, and refresh the active-clients view.
    pub(crate) async fn deregister_connection(&self, conn: ConnectionId) {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        let entry = state.connections.remove(&conn);
        state.router.drop_connection(conn);
        if let Some(session) = entry.and_then(|e| e.session) {
            state.sessions.unbind_stream(&session, conn, now);
        }
        state.sessions.sweep(now);
        self.emit_active_clients(&state);
    }

    pub(crate) fn emit_active_clients(&self, state: &BridgeState) {
        self.events
            .active_clients(state.sessions.active_clients(Instant::now()));
    }
}

/// One configured child: supervised process + HTTP listener + router state.
pub struct Bridge {
    shared: Arc<BridgeShared>,
    status_tx: watch::Sender<BridgeStatus>,
    cancel: std::sync::Mutex<Option<CancellationToken>>,
}

impl Bridge {
    pub fn new(config: ChildConfig, events: EventSender) -> Self {
        let (status_tx, _) = watch::channel(BridgeStatus::Stopped);
        Self {
            shared: Arc::new(BridgeShared {
                config,
                events,
                actual_port: AtomicU16::new(0),
                state: Mutex::new(BridgeState::default()),
            }),
            status_tx,
            cancel: std::sync::Mutex::new(None),
        }
    }

    pub fn status(&self) -> BridgeStatus {
        *self.status_tx.borrow()
    }

    /// The bound listener port; 0 unless the bridge is Running.
    pub fn actual_port(&self) -> u16 {
        self.shared.port()
    }

    pub fn config(&self) -> &ChildConfig {
        &self.shared.config
    }

    /// Current active-clients projection.
    pub async fn active_clients(&self) -> Vec<ActiveClient> {
        let state = self.shared.state.lock().await;
        state.sessions.active_clients(Instant::now())
    }

    /// Tools cached from config or captured by discovery.
    pub async fn tools(&self) -> Vec<ToolInfo> {
        self.shared.state.lock().await.tools.clone()
    }

    fn publish_status(&self, status: BridgeStatus) {
        publish_status(&self.status_tx, &self.shared.events, status);
    }

    fn fail(&self, error: &BridgeError) {
        self.shared
            .events
            .log(LogStream::System, format!("start failed: {error}"));
        self.publish_status(BridgeStatus::Error);
    }

    /// Spawn the child, bind the listener, and wire the pumps.
    ///
    /// Port resolution is a single atomic bind: port 0 requests an ephemeral
    /// port and the bound port is read back from the listener, so there is
    /// no probe/bind race. Ports below 1024 are rejected before any bind.
    pub async fn start(&self) -> Result<u16, BridgeError> {
        match self.status() {
            BridgeStatus::Stopped | BridgeStatus::Error => {}
            status => {
                return Err(BridgeError::InvalidState {
                    id: self.shared.config.id.clone(),
                    status: status.to_string(),
                    operation: "start",
                })
            }
        }
        self.publish_status(BridgeStatus::Starting);

        if let Err(e) = self.shared.config.validate() {
            self.fail(&e);
            return Err(e);
        }

        let mut child = match supervisor::spawn(&self.shared.config) {
            Ok(child) => child,
            Err(e) => {
                self.fail(&e);
                return Err(e);
            }
        };

        let addr = format!("{}:{}", self.shared.config.host, self.shared.config.port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(listener) => listener,
            Err(e) => {
                let error = if e.kind() == ErrorKind::AddrInUse {
                    BridgeError::PortInUse {
                        port: self.shared.config.port,
                    }
                } else {
                    BridgeError::BindFailed { addr, source: e }
                };
                child.terminate_and_wait().await;
                self.fail(&error);
                return Err(error);
            }
        };
        let actual_port = match listener.local_addr() {
            Ok(addr) => addr.port(),
            Err(e) => {
                let error = BridgeError::Io(e);
                child.terminate_and_wait().await;
                self.fail(&error);
                return Err(error);
            }
        };

        let (stdin, stdout, stderr) = match (
            child.take_stdin(),
            child.take_stdout(),
            child.take_stderr(),
        ) {
            (Some(i), Some(o), Some(e)) => (i, o, e),
            _ => {
                let error = BridgeError::SpawnFailed {
                    command: self.shared.config.command.clone(),
                    source: std::io::Error::other("child pipes were not captured"),
                };
                child.terminate_and_wait().await;
                self.fail(&error);
                return Err(error);
            }
        };

        {
            let mut state = self.shared.state.lock().await;
            state.clear();
            state.child_stdin = Some(stdin);
            state.tools = self.shared.config.tools.clone();
        }
        self.shared.actual_port.store(actual_port, Ordering::SeqCst);

        let cancel = CancellationToken::new();
        *self.cancel.lock().expect("cancel lock poisoned") = Some(cancel.clone());

        tokio::spawn(server::accept_loop(
            self.shared.clone(),
            listener,
            cancel.clone(),
        ));
        tokio::spawn(stdout_pump(self.shared.clone(), stdout, cancel.clone()));
        tokio::spawn(stderr_pump(self.shared.clone(), stderr, cancel.clone()));
        tokio::spawn(sweep_loop(self.shared.clone(), cancel.clone()));
        tokio::spawn(discovery::run_startup_discovery(
            self.shared.clone(),
            cancel.clone(),
        ));
        tokio::spawn(supervise_child(
            self.shared.clone(),
            child,
            self.status_tx.clone(),
            cancel,
        ));

        self.publish_status(BridgeStatus::Running);
        self.shared.events.log(
            LogStream::System,
            format!(
                "listening on {}:{actual_port}",
                self.shared.config.host
            ),
        );
        Ok(actual_port)
    }

    /// Stop the listener and the child, clear state, and wait for Stopped.
    pub async fn stop(&self) {
        let cancel = self.cancel.lock().expect("cancel lock poisoned").take();
        let Some(cancel) = cancel else {
            return;
        };
        cancel.cancel();

        let mut status_rx = self.status_tx.subscribe();
        loop {
            if matches!(*status_rx.borrow(), BridgeStatus::Stopped | BridgeStatus::Error) {
                return;
            }
            if status_rx.changed().await.is_err() {
                return;
            }
        }
    }
}

fn publish_status(
    status_tx: &watch::Sender<BridgeStatus>,
    events: &EventSender,
    status: BridgeStatus,
) {
    if *status_tx.borrow() != status {
        let _ = status_tx.send(status);
        events.status(status);
    }
}

/// Owns the child handle: reaps it on exit, terminates it on cancellation,
/// and performs the common teardown either way.
async fn supervise_child(
    shared: Arc<BridgeShared>,
    mut child: ChildHandle,
    status_tx: watch::Sender<BridgeStatus>,
    cancel: CancellationToken,
) {
    let exited = tokio::select! {
        _ = cancel.cancelled() => None,
        status = child.wait() => Some(status),
    };
    match exited {
        Some(Ok(status)) => {
            let error = BridgeError::ChildExited {
                status: status.to_string(),
            };
            shared.events.log(LogStream::System, error.to_string());
            cancel.cancel();
        }
        Some(Err(e)) => {
            shared
                .events
                .log(LogStream::System, format!("failed to reap child: {e}"));
            cancel.cancel();
        }
        None => {
            shared.events.log(LogStream::System, "stopping child process");
            if let Some(status) = child.terminate_and_wait().await {
                shared
                    .events
                    .log(LogStream::System, format!("child exited: {status}"));
            }
        }
    }

    {
        let mut state = shared.state.lock().await;
        state.clear();
        shared.emit_active_clients(&state);
    }
    shared.actual_port.store(0, Ordering::SeqCst);
    publish_status(&status_tx, &shared.events, BridgeStatus::Stopped);
}

/// Pump child stdout through the line framer into the router.
///
/// EOF means the child closed its pipe (usually because it exited); the
/// bridge stops rather than serving clients it can no longer dispatch to.
async fn stdout_pump(
    shared: Arc<BridgeShared>,
    mut stdout: ChildStdout,
    cancel: CancellationToken,
) {
    let mut framer = LineFramer::new();
    let mut chunk = [0u8; 8192];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            read = stdout.read(&mut chunk) => match read {
                Ok(0) => break,
                Ok(n) => {
                    for line in framer.push(&chunk[..n]) {
                        shared.route_child_line(&line).await;
                    }
                }
                Err(e) => {
                    tracing::warn!(bridge_id = %shared.config.id, error = %e, "stdout read failed");
                    break;
                }
            }
        }
    }
    shared
        .events
        .log(LogStream::System, "child stdout closed");
    cancel.cancel();
}

/// Surface child stderr as log entries, decoded best-effort.
async fn stderr_pump(
    shared: Arc<BridgeShared>,
    mut stderr: ChildStderr,
    cancel: CancellationToken,
) {
    let mut pending = String::new();
    let mut chunk = [0u8; 8192];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            read = stderr.read(&mut chunk) => match read {
                Ok(0) => return,
                Ok(n) => {
                    pending.push_str(&String::from_utf8_lossy(&chunk[..n]));
                    while let Some(pos) = pending.find('\n') {
                        let line: String = pending.drain(..=pos).collect();
                        let line = line.trim();
                        if !line.is_empty() {
                            shared.events.log(LogStream::Stderr, line);
                        }
                    }
                }
                Err(_) => return,
            }
        }
    }
}

/// Periodic registry sweep; refreshes the active-clients view when an idle
/// session ages out.
async fn sweep_loop(shared: Arc<BridgeShared>, cancel: CancellationToken) {
    let mut tick = tokio::time::interval_at(
        tokio::time::Instant::now() + SWEEP_INTERVAL,
        SWEEP_INTERVAL,
    );
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tick.tick() => {
                let mut state = shared.state.lock().await;
                if state.sessions.sweep(Instant::now()) {
                    shared.emit_active_clients(&state);
                }
            }
        }
    }
}
