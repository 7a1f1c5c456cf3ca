//! MCProxy - bridge stdio MCP servers to HTTP, SSE, and streamable HTTP.
//!
//! Each configured child process speaks line-delimited JSON-RPC (the Model
//! Context Protocol) over stdin/stdout. MCProxy spawns the child, keeps the
//! pipe alive, and exposes an HTTP endpoint that multiplexes three network
//! transports onto it:
//!
//! - **SSE**: `GET /sse` opens a long-lived `text/event-stream`; requests are
//!   POSTed to `/message?sessionId=...` and responses come back on the stream.
//! - **Streamable HTTP**: a `POST` with `Accept: text/event-stream` delivers a
//!   request and turns its own response channel into an SSE stream.
//! - **Sync HTTP**: a plain `POST` carrying a JSON-RPC `id` receives exactly
//!   one `200 OK` when the matching child response arrives, then closes.
//!
//! Responses are correlated to requests by JSON-RPC id. A logical session
//! (opaque lowercase UUID) identifies one client across reconnecting TCP
//! connections and survives disconnects for a grace period.

pub mod bridge;
pub mod config;
pub mod discovery;
pub mod error;
pub mod events;
pub mod framing;
pub mod http;
pub mod jsonrpc;
pub mod router;
pub mod session;
pub mod supervisor;
