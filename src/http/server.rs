//! Accept loop, per-connection tasks, and transport classification.
//!
//! Each accepted socket gets one task that owns it end to end: it reads into
//! a growing buffer, parses requests, classifies them, writes responses, and
//! - once upgraded to a stream or awaiting a sync response - delivers
//! messages routed to it by the bridge. Single-task ownership is what
//! serializes writes to a connection; no per-connection write lock exists.
//!
//! Transport decision table (first matching row wins):
//!
//! | Method  | Condition                                   | Action            |
//! |---------|---------------------------------------------|-------------------|
//! | OPTIONS | any                                         | CORS preflight    |
//! | GET     | `/` `/sse` `/events`, SSE Accept            | SSE stream        |
//! | GET     | `/` `/sse` `/events`, no SSE Accept         | NDJSON stream     |
//! | POST    | `sessionId` query, body                     | 202 + forward     |
//! | POST    | SSE Accept, body                            | streamable upgrade|
//! | POST    | body with JSON-RPC id                       | sync, close after |
//! | POST    | body without id                             | 202 notification  |
//! | any     | otherwise                                   | 404               |

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::bridge::{BridgeShared, ConnMode, ConnectionEntry, ConnectionMessage};
use crate::http::parser::{self, ParseError, ParsedRequest, MAX_BUFFER_BYTES};
use crate::http::response::{self, StreamFormat};
use crate::jsonrpc;
use crate::router::IngressOrigin;
use crate::session::ConnectionId;

/// Liveness frame cadence on stream connections.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Paths that upgrade a GET into a stream.
const STREAM_PATHS: [&str; 3] = ["/", "/sse", "/events"];

/// Classified transport for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Transport {
    Preflight,
    StreamUpgrade(StreamFormat),
    SessionPost { session: String },
    StreamablePost,
    SyncPost,
    NotificationPost,
    NotFound,
}

fn classify(req: &ParsedRequest) -> Transport {
    match req.method.as_str() {
        "OPTIONS" => Transport::Preflight,
        "GET" => {
            if STREAM_PATHS.contains(&req.path.as_str()) {
                let format = if req.accepts_event_stream() {
                    StreamFormat::Sse
                } else {
                    StreamFormat::Ndjson
                };
                Transport::StreamUpgrade(format)
            } else {
                Transport::NotFound
            }
        }
        "POST" => {
            if req.body.is_empty() {
                return Transport::NotFound;
            }
            if let Some(session) = req.query_param("sessionId") {
                return Transport::SessionPost {
                    session: session.to_string(),
                };
            }
            if req.accepts_event_stream() {
                return Transport::StreamablePost;
            }
            if jsonrpc::extract_id(&req.body).is_some() {
                Transport::SyncPost
            } else {
                Transport::NotificationPost
            }
        }
        _ => Transport::NotFound,
    }
}

/// Accept connections until cancelled; each gets its own task.
pub(crate) async fn accept_loop(
    shared: Arc<BridgeShared>,
    listener: TcpListener,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let shared = shared.clone();
                    let conn_cancel = cancel.child_token();
                    tokio::spawn(connection_task(shared, stream, peer, conn_cancel));
                }
                Err(e) => {
                    tracing::warn!(bridge_id = %shared.config.id, error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

enum Flow {
    Continue,
    Close,
}

async fn connection_task(
    shared: Arc<BridgeShared>,
    stream: TcpStream,
    peer: SocketAddr,
    cancel: CancellationToken,
) {
    let conn_id = ConnectionId::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    {
        let mut state = shared.state.lock().await;
        state.connections.insert(
            conn_id,
            ConnectionEntry {
                sender: tx,
                mode: ConnMode::Request,
                session: None,
            },
        );
    }
    tracing::debug!(%conn_id, %peer, "connection accepted");

    let (mut read_half, mut write_half) = stream.into_split();
    let mut buf = BytesMut::with_capacity(8 * 1024);
    let mut mode = ConnMode::Request;
    let mut keepalive = tokio::time::interval_at(
        tokio::time::Instant::now() + KEEPALIVE_INTERVAL,
        KEEPALIVE_INTERVAL,
    );

    'conn: loop {
        tokio::select! {
            _ = cancel.cancelled() => break 'conn,

            _ = keepalive.tick() => {
                if let ConnMode::Stream(format) = mode {
                    let frame = response::chunk(format.keepalive().as_bytes());
                    if write_half.write_all(&frame).await.is_err() {
                        break 'conn;
                    }
                }
            }

            msg = rx.recv() => {
                let Some(ConnectionMessage::Deliver(line)) = msg else {
                    break 'conn;
                };
                match mode {
                    ConnMode::Stream(format) => {
                        let framed = format.frame_message(&line);
                        if write_half.write_all(&response::chunk(framed.as_bytes())).await.is_err() {
                            break 'conn;
                        }
                    }
                    ConnMode::SyncPending => {
                        // Exactly one response, then FIN.
                        let _ = write_half
                            .write_all(&response::short(200, "application/json", line.as_bytes(), true))
                            .await;
                        break 'conn;
                    }
                    ConnMode::Request => {
                        tracing::debug!(%conn_id, "dropping message for connection with no transport");
                    }
                }
            }

            read = read_half.read_buf(&mut buf) => {
                match read {
                    Ok(0) => break 'conn,
                    Ok(_) => {}
                    Err(_) => break 'conn,
                }
                if buf.len() > MAX_BUFFER_BYTES {
                    tracing::warn!(%conn_id, len = buf.len(), "inbound buffer over limit, closing");
                    break 'conn;
                }
                if mode != ConnMode::Request {
                    // Streams and pending syncs take no further requests.
                    buf.clear();
                    continue;
                }
                loop {
                    match parser::try_parse(&buf) {
                        Ok(Some((req, consumed))) => {
                            let _ = buf.split_to(consumed);
                            match handle_request(&shared, conn_id, &req, &mut mode, &mut write_half).await {
                                Flow::Continue => {}
                                Flow::Close => break 'conn,
                            }
                            if mode != ConnMode::Request {
                                buf.clear();
                                break;
                            }
                        }
                        Ok(None) => break,
                        Err(ParseError::TlsHandshake) => {
                            tracing::debug!(%conn_id, %peer, "TLS handshake on plaintext port, closing");
                            break 'conn;
                        }
                        Err(e) => {
                            tracing::debug!(%conn_id, error = %e, "unparseable request, closing");
                            let _ = write_half
                                .write_all(&response::short(400, "text/plain", b"bad request", true))
                                .await;
                            break 'conn;
                        }
                    }
                }
            }
        }
    }

    shared.deregister_connection(conn_id).await;
    tracing::debug!(%conn_id, "connection closed");
}

async fn handle_request(
    shared: &Arc<BridgeShared>,
    conn_id: ConnectionId,
    req: &ParsedRequest,
    mode: &mut ConnMode,
    write_half: &mut OwnedWriteHalf,
) -> Flow {
    // Optional bearer token gate; preflights stay open for browsers.
    if let Some(token) = &shared.config.bearer_token {
        if req.method != "OPTIONS" {
            let expected = format!("Bearer {token}");
            if req.header("authorization") != Some(expected.as_str()) {
                let _ = write_half
                    .write_all(&response::short(401, "text/plain", b"unauthorized", true))
                    .await;
                return Flow::Close;
            }
        }
    }

    let user_agent = req.header("user-agent").map(str::to_string);
    let now = Instant::now();

    match classify(req) {
        Transport::Preflight => {
            if write_half.write_all(&response::preflight()).await.is_err() {
                return Flow::Close;
            }
            Flow::Continue
        }

        Transport::StreamUpgrade(format) => {
            let session = req
                .query_param("sessionId")
                .map(str::to_string)
                .unwrap_or_else(|| conn_id.as_session_id());
            {
                let mut state = shared.state.lock().await;
                state
                    .sessions
                    .bind_stream(&session, conn_id, user_agent.as_deref(), now);
                if let Some(entry) = state.connections.get_mut(&conn_id) {
                    entry.mode = ConnMode::Stream(format);
                    entry.session = Some(session.clone());
                }
                shared.emit_active_clients(&state);
            }
            *mode = ConnMode::Stream(format);

            if write_half
                .write_all(&response::stream_prelude(format, &session))
                .await
                .is_err()
            {
                return Flow::Close;
            }
            if format == StreamFormat::Sse {
                let event =
                    response::endpoint_event(&shared.config.host, shared.port(), &session);
                if write_half
                    .write_all(&response::chunk(event.as_bytes()))
                    .await
                    .is_err()
                {
                    return Flow::Close;
                }
            }
            Flow::Continue
        }

        Transport::SessionPost { session } => {
            {
                let mut state = shared.state.lock().await;
                if state.sessions.touch(&session, user_agent.as_deref(), now) {
                    shared.emit_active_clients(&state);
                }
            }
            shared
                .forward_to_child(IngressOrigin::Session(session), &req.body)
                .await;
            if write_half.write_all(&response::accepted()).await.is_err() {
                return Flow::Close;
            }
            Flow::Continue
        }

        Transport::StreamablePost => {
            let session = conn_id.as_session_id();
            {
                let mut state = shared.state.lock().await;
                state
                    .sessions
                    .bind_stream(&session, conn_id, user_agent.as_deref(), now);
                if let Some(entry) = state.connections.get_mut(&conn_id) {
                    entry.mode = ConnMode::Stream(StreamFormat::Sse);
                    entry.session = Some(session.clone());
                }
                shared.emit_active_clients(&state);
            }
            *mode = ConnMode::Stream(StreamFormat::Sse);

            if write_half
                .write_all(&response::stream_prelude(StreamFormat::Sse, &session))
                .await
                .is_err()
            {
                return Flow::Close;
            }
            shared
                .forward_to_child(
                    IngressOrigin::Stream {
                        conn: conn_id,
                        session,
                    },
                    &req.body,
                )
                .await;
            Flow::Continue
        }

        Transport::SyncPost => {
            {
                let mut state = shared.state.lock().await;
                if let Some(entry) = state.connections.get_mut(&conn_id) {
                    entry.mode = ConnMode::SyncPending;
                }
            }
            *mode = ConnMode::SyncPending;
            shared
                .forward_to_child(IngressOrigin::Connection(conn_id), &req.body)
                .await;
            // The 200 is written when the matching child line arrives.
            Flow::Continue
        }

        Transport::NotificationPost => {
            shared
                .forward_to_child(IngressOrigin::Untracked, &req.body)
                .await;
            if write_half.write_all(&response::accepted()).await.is_err() {
                return Flow::Close;
            }
            Flow::Continue
        }

        Transport::NotFound => {
            let _ = write_half
                .write_all(&response::short(404, "text/plain", b"not found", true))
                .await;
            Flow::Close
        }
    }
}
