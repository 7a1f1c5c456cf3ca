//! Observability hooks for the external UI collaborator.
//!
//! The bridge reports four kinds of change: log lines, status transitions,
//! the active-clients view, and discovered tools. Events travel over an
//! unbounded channel so the bridge never blocks on a slow (or absent)
//! observer; dropping the receiver silently discards events.

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::config::ToolInfo;
use crate::session::ActiveClient;

/// Bridge lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeStatus {
    /// Not running; the initial and terminal state.
    Stopped,
    /// Start requested; child/listener not yet up.
    Starting,
    /// Child running and listener accepting.
    Running,
    /// Start failed; not retried automatically.
    Error,
}

impl std::fmt::Display for BridgeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Origin of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    /// A non-JSON line from the child's stdout.
    Stdout,
    /// A line from the child's stderr.
    Stderr,
    /// Produced by the bridge itself.
    System,
}

impl std::fmt::Display for LogStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stdout => write!(f, "stdout"),
            Self::Stderr => write!(f, "stderr"),
            Self::System => write!(f, "system"),
        }
    }
}

/// One appended log line.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub bridge_id: String,
    pub stream: LogStream,
    pub message: String,
}

/// A change reported by a bridge.
#[derive(Debug, Clone)]
pub enum BridgeEvent {
    Log(LogEntry),
    Status {
        bridge_id: String,
        status: BridgeStatus,
    },
    ActiveClients {
        bridge_id: String,
        clients: Vec<ActiveClient>,
    },
    Tools {
        bridge_id: String,
        tools: Vec<ToolInfo>,
    },
}

/// Sending half of the event bus, cloned into every bridge task.
#[derive(Debug, Clone)]
pub struct EventSender {
    bridge_id: String,
    tx: mpsc::UnboundedSender<BridgeEvent>,
}

impl EventSender {
    /// Create a bus for one bridge, returning the sender and the observer's
    /// receiving half.
    pub fn channel(bridge_id: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<BridgeEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                bridge_id: bridge_id.into(),
                tx,
            },
            rx,
        )
    }

    /// A sender whose events go nowhere, for embedding without an observer.
    pub fn disconnected(bridge_id: impl Into<String>) -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self {
            bridge_id: bridge_id.into(),
            tx,
        }
    }

    pub fn log(&self, stream: LogStream, message: impl Into<String>) {
        let message = message.into();
        tracing::debug!(bridge_id = %self.bridge_id, %stream, message = %message, "bridge log");
        let _ = self.tx.send(BridgeEvent::Log(LogEntry {
            timestamp: Utc::now(),
            bridge_id: self.bridge_id.clone(),
            stream,
            message,
        }));
    }

    pub fn status(&self, status: BridgeStatus) {
        tracing::info!(bridge_id = %self.bridge_id, %status, "bridge status changed");
        let _ = self.tx.send(BridgeEvent::Status {
            bridge_id: self.bridge_id.clone(),
            status,
        });
    }

    pub fn active_clients(&self, clients: Vec<ActiveClient>) {
        let _ = self.tx.send(BridgeEvent::ActiveClients {
            bridge_id: self.bridge_id.clone(),
            clients,
        });
    }

    pub fn tools(&self, tools: Vec<ToolInfo>) {
        tracing::info!(bridge_id = %self.bridge_id, count = tools.len(), "tools discovered");
        let _ = self.tx.send(BridgeEvent::Tools {
            bridge_id: self.bridge_id.clone(),
            tools,
        });
    }
}
