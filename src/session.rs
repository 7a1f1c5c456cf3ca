//! Logical sessions: one client identity across reconnecting TCP connections.
//!
//! A session is keyed by a lowercase UUID string, minted from the connection
//! id when a GET upgrades to a stream or supplied by the client in the
//! `sessionId` query parameter. Sessions outlive their connections for a
//! grace period so a reconnecting client keeps its identity and display
//! name.
//!
//! Naming precedence: `clientInfo.name` from an MCP `initialize` body is
//! sticky for the session; otherwise the cleaned User-Agent is used and may
//! be refreshed by later requests.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::Serialize;
use uuid::Uuid;

/// How long a disconnected session stays visible in the active-clients view.
const GRACE_UNINITIALIZED: Duration = Duration::from_secs(5);
const GRACE_INITIALIZED: Duration = Duration::from_secs(60 * 60);

/// How long a disconnected session survives in the registry before the
/// sweep evicts it.
const EVICT_UNINITIALIZED: Duration = Duration::from_secs(30);
const EVICT_INITIALIZED: Duration = Duration::from_secs(60 * 60);

/// Identity of one TCP connection. Doubles as the source of minted session
/// ids: a stream opened without a `sessionId` adopts its connection's UUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The lowercase UUID string used when this connection mints a session.
    pub fn as_session_id(&self) -> String {
        self.0.to_string()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One entry in the active-clients projection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveClient {
    pub session_id: String,
    pub name: String,
    /// True for an initialized session whose connections are all closed.
    pub idle: bool,
}

impl ActiveClient {
    pub fn display_name(&self) -> String {
        if self.idle {
            format!("{} (Idle)", self.name)
        } else {
            self.name.clone()
        }
    }
}

#[derive(Debug)]
struct LogicalSession {
    name: Option<String>,
    /// Set when the name came from `initialize.clientInfo.name`; such a name
    /// is never overwritten by User-Agent observations.
    name_sticky: bool,
    initialized: bool,
    last_seen: Instant,
    stream_conn: Option<ConnectionId>,
}

impl LogicalSession {
    fn new(now: Instant) -> Self {
        Self {
            name: None,
            name_sticky: false,
            initialized: false,
            last_seen: now,
            stream_conn: None,
        }
    }

    fn offer_user_agent(&mut self, user_agent: &str) {
        if self.name_sticky {
            return;
        }
        let cleaned = clean_client_name(user_agent);
        let keep_current = matches!(&self.name, Some(current)
            if !is_generic_name(current) && is_generic_name(&cleaned));
        if !keep_current {
            self.name = Some(cleaned);
        }
    }
}

/// Registry of logical sessions for one bridge. Holds connection ids, never
/// connection handles; the connection table is owned by the server.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<String, LogicalSession>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Observe a session at stream-upgrade time, binding it to `conn`.
    ///
    /// At most one stream connection is bound per session; a reconnect
    /// replaces the previous binding.
    pub fn bind_stream(
        &mut self,
        session_id: &str,
        conn: ConnectionId,
        user_agent: Option<&str>,
        now: Instant,
    ) {
        let session = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| LogicalSession::new(now));
        session.last_seen = now;
        session.stream_conn = Some(conn);
        if let Some(ua) = user_agent {
            session.offer_user_agent(ua);
        }
    }

    /// Observe a session on a POST carrying its id. Returns true when this
    /// created the session (the active-clients view changed).
    pub fn touch(&mut self, session_id: &str, user_agent: Option<&str>, now: Instant) -> bool {
        let created = !self.sessions.contains_key(session_id);
        let session = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| LogicalSession::new(now));
        session.last_seen = now;
        if let Some(ua) = user_agent {
            session.offer_user_agent(ua);
        }
        created
    }

    /// Record `clientInfo.name` from an `initialize` request. The name is
    /// sticky and the session is considered initialized from here on.
    pub fn record_initialize(&mut self, session_id: &str, client_name: &str, now: Instant) {
        let session = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| LogicalSession::new(now));
        session.last_seen = now;
        session.initialized = true;
        session.name = Some(client_name.to_string());
        session.name_sticky = true;
    }

    /// The stream connection currently bound to a session, if any.
    pub fn stream_conn(&self, session_id: &str) -> Option<ConnectionId> {
        self.sessions.get(session_id)?.stream_conn
    }

    /// Unbind a closing connection from its session. A newer connection that
    /// already rebound the session is left alone.
    pub fn unbind_stream(&mut self, session_id: &str, conn: ConnectionId, now: Instant) {
        if let Some(session) = self.sessions.get_mut(session_id) {
            if session.stream_conn == Some(conn) {
                session.stream_conn = None;
                session.last_seen = now;
            }
        }
    }

    /// Evict disconnected sessions past their retention window. Returns true
    /// if anything was removed.
    pub fn sweep(&mut self, now: Instant) -> bool {
        let before = self.sessions.len();
        self.sessions.retain(|_, session| {
            if session.stream_conn.is_some() {
                return true;
            }
            let limit = if session.initialized {
                EVICT_INITIALIZED
            } else {
                EVICT_UNINITIALIZED
            };
            now.duration_since(session.last_seen) <= limit
        });
        before != self.sessions.len()
    }

    /// Project the registry into the active-clients view: one entry per
    /// session, disconnected sessions only within their grace window,
    /// initialized disconnected sessions tagged idle. Sorted by name for a
    /// stable presentation.
    pub fn active_clients(&self, now: Instant) -> Vec<ActiveClient> {
        let mut clients: Vec<ActiveClient> = self
            .sessions
            .iter()
            .filter_map(|(id, session)| {
                let connected = session.stream_conn.is_some();
                if !connected {
                    let grace = if session.initialized {
                        GRACE_INITIALIZED
                    } else {
                        GRACE_UNINITIALIZED
                    };
                    if now.duration_since(session.last_seen) > grace {
                        return None;
                    }
                }
                Some(ActiveClient {
                    session_id: id.clone(),
                    name: session.name.clone().unwrap_or_else(|| "Unknown".to_string()),
                    idle: session.initialized && !connected,
                })
            })
            .collect();
        clients.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.session_id.cmp(&b.session_id)));
        clients
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn clear(&mut self) {
        self.sessions.clear();
    }
}

fn is_generic_name(name: &str) -> bool {
    name == "Browser" || name == "Unknown"
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

/// Reduce a raw User-Agent (or client name) to a short display name.
///
/// Known brands win outright; Mozilla UAs map to their browser; `A/B`-style
/// product tokens keep the head; reverse-DNS identifiers keep their last
/// segment, capitalized.
pub fn clean_client_name(raw: &str) -> String {
    let raw = raw.trim();
    let lower = raw.to_ascii_lowercase();

    if lower.contains("chatwise") {
        return "ChatWise".to_string();
    }
    if lower.contains("flowdown") {
        return "FlowDown".to_string();
    }
    if lower.contains("claude") {
        return "Claude".to_string();
    }

    if lower.contains("mozilla") {
        if lower.contains("chrome") {
            return "Chrome".to_string();
        }
        if lower.contains("firefox") {
            return "Firefox".to_string();
        }
        if lower.contains("safari") {
            return "Safari".to_string();
        }
        return "Browser".to_string();
    }

    let head = raw.split('/').next().unwrap_or(raw).trim();
    if head.is_empty() {
        return "Unknown".to_string();
    }

    // Reverse-DNS identifiers (com.example.app) keep the last segment.
    if head.matches('.').count() >= 2 && !head.contains(' ') {
        if let Some(last) = head.rsplit('.').next() {
            if !last.is_empty() {
                return capitalize(last);
            }
        }
    }

    head.to_string()
}
