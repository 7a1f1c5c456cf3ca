//! Request/response correlation between network clients and the child.
//!
//! Every forwarded POST body with a JSON-RPC id is recorded against its
//! origin; every line the child emits is routed back by looking that id up
//! again. Exactly one destination receives a routed line: the recording is
//! removed on first match, so a duplicate response from the child falls
//! through to broadcast. Duplicate ingress ids overwrite (latest wins).
//!
//! The discovery handshake reserves integer ids while it is in flight;
//! colliding network ids are forwarded to the child but shadowed here, so a
//! child response for a reserved id always reaches discovery.

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::oneshot;

use crate::jsonrpc::{self, JsonRpcId};
use crate::session::ConnectionId;

/// Where a forwarded body came from, which decides how its response routes
/// back.
#[derive(Debug, Clone)]
pub enum IngressOrigin {
    /// POST carrying a `sessionId` query; the response goes to whichever
    /// stream the session is bound to when it arrives.
    Session(String),
    /// Sync POST; the response goes back on this very connection.
    Connection(ConnectionId),
    /// Streamable POST; the connection has become the session's stream.
    Stream {
        conn: ConnectionId,
        session: String,
    },
    /// Notification or unparseable body; nothing to route back.
    Untracked,
}

/// Destination for one child stdout line. Routes carrying a payload own the
/// line so dispatch happens after the state lock is released.
#[derive(Debug)]
pub enum EgressRoute {
    /// A reserved discovery id; deliver to the waiting handshake.
    Discovery(oneshot::Sender<Value>, Value),
    /// Matched a pending request on a specific connection.
    Connection(ConnectionId),
    /// Matched a session-recorded id; deliver to the session's stream.
    Session(String),
    /// Notification (or unmatched id); deliver to every stream connection.
    Broadcast,
    /// Not JSON; cannot be routed, surface as a stdout log only.
    LogOnly,
}

/// Correlation state for one bridge. Lives behind the bridge's state mutex.
#[derive(Debug, Default)]
pub struct RouterState {
    pending_by_id: HashMap<JsonRpcId, ConnectionId>,
    id_to_session: HashMap<JsonRpcId, String>,
    discovery: HashMap<i64, oneshot::Sender<Value>>,
}

impl RouterState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a forwarded body against its origin. Returns the extracted id,
    /// if the body carried a routable one.
    pub fn record_ingress(&mut self, origin: &IngressOrigin, body: &[u8]) -> Option<JsonRpcId> {
        let id = jsonrpc::extract_id(body)?;
        if self.is_reserved(&id) {
            tracing::debug!(%id, "ingress id collides with discovery handshake, shadowed");
            return None;
        }
        match origin {
            IngressOrigin::Session(session) => {
                self.id_to_session.insert(id.clone(), session.clone());
            }
            IngressOrigin::Connection(conn) => {
                self.pending_by_id.insert(id.clone(), *conn);
            }
            IngressOrigin::Stream { conn, session } => {
                self.pending_by_id.insert(id.clone(), *conn);
                self.id_to_session.insert(id.clone(), session.clone());
            }
            IngressOrigin::Untracked => {}
        }
        Some(id)
    }

    /// Resolve the destination for a child stdout line, consuming whatever
    /// mapping it matches.
    pub fn take_egress(&mut self, line: &str) -> EgressRoute {
        let Ok(value) = serde_json::from_str::<Value>(line) else {
            return EgressRoute::LogOnly;
        };
        let Some(id) = value.get("id").and_then(jsonrpc::from_value) else {
            return EgressRoute::Broadcast;
        };

        if let JsonRpcId::Int(n) = &id {
            if let Some(tx) = self.discovery.remove(n) {
                return EgressRoute::Discovery(tx, value);
            }
        }
        if let Some(conn) = self.pending_by_id.remove(&id) {
            self.id_to_session.remove(&id);
            return EgressRoute::Connection(conn);
        }
        if let Some(session) = self.id_to_session.remove(&id) {
            return EgressRoute::Session(session);
        }
        EgressRoute::Broadcast
    }

    /// Drop every pending id bound to a closed connection; later responses
    /// for those ids fall through to broadcast.
    pub fn drop_connection(&mut self, conn: ConnectionId) {
        let orphaned: Vec<JsonRpcId> = self
            .pending_by_id
            .iter()
            .filter(|(_, c)| **c == conn)
            .map(|(id, _)| id.clone())
            .collect();
        for id in orphaned {
            self.pending_by_id.remove(&id);
            self.id_to_session.remove(&id);
        }
    }

    /// Reserve an integer id for the discovery handshake.
    pub fn reserve_discovery_id(&mut self, id: i64) -> oneshot::Receiver<Value> {
        let (tx, rx) = oneshot::channel();
        self.discovery.insert(id, tx);
        rx
    }

    /// Release any discovery reservations (handshake done or abandoned).
    pub fn clear_discovery(&mut self) {
        self.discovery.clear();
    }

    fn is_reserved(&self, id: &JsonRpcId) -> bool {
        matches!(id, JsonRpcId::Int(n) if self.discovery.contains_key(n))
    }

    pub fn pending_count(&self) -> usize {
        self.pending_by_id.len()
    }

    pub fn clear(&mut self) {
        self.pending_by_id.clear();
        self.id_to_session.clear();
        self.discovery.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> ConnectionId {
        ConnectionId::new()
    }

    #[test]
    fn test_sync_response_routes_once_then_broadcasts() {
        let mut router = RouterState::new();
        let c = conn();
        let origin = IngressOrigin::Connection(c);
        router.record_ingress(&origin, br#"{"jsonrpc":"2.0","id":"x","method":"ping"}"#);

        match router.take_egress(r#"{"jsonrpc":"2.0","id":"x","result":{}}"#) {
            EgressRoute::Connection(routed) => assert_eq!(routed, c),
            other => panic!("expected connection route, got {other:?}"),
        }
        // The mapping is consumed: a second response with the same id
        // broadcasts.
        assert!(matches!(
            router.take_egress(r#"{"jsonrpc":"2.0","id":"x","result":{}}"#),
            EgressRoute::Broadcast
        ));
    }

    #[test]
    fn test_session_post_routes_to_session() {
        let mut router = RouterState::new();
        let origin = IngressOrigin::Session("s1".to_string());
        router.record_ingress(&origin, br#"{"jsonrpc":"2.0","id":7,"method":"tools/list"}"#);

        match router.take_egress(r#"{"jsonrpc":"2.0","id":7,"result":{"tools":[]}}"#) {
            EgressRoute::Session(sid) => assert_eq!(sid, "s1"),
            other => panic!("expected session route, got {other:?}"),
        }
    }

    #[test]
    fn test_notification_broadcasts() {
        let mut router = RouterState::new();
        assert!(matches!(
            router.take_egress(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#),
            EgressRoute::Broadcast
        ));
    }

    #[test]
    fn test_non_json_is_log_only() {
        let mut router = RouterState::new();
        assert!(matches!(
            router.take_egress("Server listening on stdio"),
            EgressRoute::LogOnly
        ));
    }

    #[test]
    fn test_duplicate_ingress_latest_wins() {
        let mut router = RouterState::new();
        let first = conn();
        let second = conn();
        let body = br#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#;
        router.record_ingress(&IngressOrigin::Connection(first), body);
        router.record_ingress(&IngressOrigin::Connection(second), body);

        match router.take_egress(r#"{"jsonrpc":"2.0","id":1,"result":{}}"#) {
            EgressRoute::Connection(routed) => assert_eq!(routed, second),
            other => panic!("expected connection route, got {other:?}"),
        }
    }

    #[test]
    fn test_id_types_do_not_collide() {
        let mut router = RouterState::new();
        let int_conn = conn();
        let str_conn = conn();
        router.record_ingress(
            &IngressOrigin::Connection(int_conn),
            br#"{"jsonrpc":"2.0","id":1,"method":"a"}"#,
        );
        router.record_ingress(
            &IngressOrigin::Connection(str_conn),
            br#"{"jsonrpc":"2.0","id":"1","method":"b"}"#,
        );

        match router.take_egress(r#"{"jsonrpc":"2.0","id":"1","result":{}}"#) {
            EgressRoute::Connection(routed) => assert_eq!(routed, str_conn),
            other => panic!("expected string-id route, got {other:?}"),
        }
        match router.take_egress(r#"{"jsonrpc":"2.0","id":1,"result":{}}"#) {
            EgressRoute::Connection(routed) => assert_eq!(routed, int_conn),
            other => panic!("expected int-id route, got {other:?}"),
        }
    }

    #[test]
    fn test_discovery_reservation_shadows_and_routes() {
        let mut router = RouterState::new();
        let mut rx = router.reserve_discovery_id(1);

        // A colliding network request is not recorded.
        let recorded = router.record_ingress(
            &IngressOrigin::Connection(conn()),
            br#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#,
        );
        assert!(recorded.is_none());

        match router.take_egress(r#"{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05"}}"#)
        {
            EgressRoute::Discovery(tx, value) => {
                tx.send(value).unwrap();
            }
            other => panic!("expected discovery route, got {other:?}"),
        }
        let value = rx.try_recv().unwrap();
        assert!(value["result"]["protocolVersion"].is_string());

        // Reservation is consumed; the id routes normally afterwards.
        assert!(matches!(
            router.take_egress(r#"{"jsonrpc":"2.0","id":1,"result":{}}"#),
            EgressRoute::Broadcast
        ));
    }

    #[test]
    fn test_drop_connection_orphans_ids() {
        let mut router = RouterState::new();
        let c = conn();
        router.record_ingress(
            &IngressOrigin::Stream {
                conn: c,
                session: "s1".to_string(),
            },
            br#"{"jsonrpc":"2.0","id":9,"method":"ping"}"#,
        );
        router.drop_connection(c);
        assert_eq!(router.pending_count(), 0);
        // With both maps cleared the response falls through to broadcast,
        // not to the dead session binding.
        assert!(matches!(
            router.take_egress(r#"{"jsonrpc":"2.0","id":9,"result":{}}"#),
            EgressRoute::Broadcast
        ));
    }

    #[test]
    fn test_malformed_body_records_nothing() {
        let mut router = RouterState::new();
        let recorded =
            router.record_ingress(&IngressOrigin::Connection(conn()), b"this is not json");
        assert!(recorded.is_none());
        assert_eq!(router.pending_count(), 0);
    }
}
