//! HTTP response emission: short responses, stream preludes, chunk framing.
//!
//! Three response shapes exist. Short responses carry a fixed Content-Length
//! and may close the connection. Stream preludes switch the connection to
//! chunked transfer with either SSE or NDJSON framing; every subsequent
//! message is one HTTP chunk. Preflight responses answer CORS OPTIONS.

/// Framing of a long-lived stream connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamFormat {
    /// `text/event-stream`: `event: message\ndata: <line>\n\n` records.
    Sse,
    /// `application/x-ndjson`: one JSON line per message.
    Ndjson,
}

impl StreamFormat {
    pub fn content_type(self) -> &'static str {
        match self {
            Self::Sse => "text/event-stream",
            Self::Ndjson => "application/x-ndjson",
        }
    }

    /// Frame one JSON-RPC line for this stream.
    pub fn frame_message(self, line: &str) -> String {
        match self {
            Self::Sse => format!("event: message\ndata: {line}\n\n"),
            Self::Ndjson => format!("{line}\n"),
        }
    }

    /// Periodic liveness frame: an SSE comment, or a bare newline for NDJSON.
    pub fn keepalive(self) -> &'static str {
        match self {
            Self::Sse => ": keepalive\n\n",
            Self::Ndjson => "\n",
        }
    }
}

const CORS_HEADERS: &str = "Access-Control-Allow-Origin: *\r\n\
    Access-Control-Allow-Methods: GET, POST, OPTIONS\r\n\
    Access-Control-Allow-Headers: *\r\n";

fn reason(code: u16) -> &'static str {
    match code {
        200 => "OK",
        202 => "Accepted",
        204 => "No Content",
        400 => "Bad Request",
        401 => "Unauthorized",
        404 => "Not Found",
        _ => "",
    }
}

/// A fixed-length response. `close` adds `Connection: close`; responses that
/// leave the connection open rely on HTTP/1.1 default keep-alive.
pub fn short(code: u16, content_type: &str, body: &[u8], close: bool) -> Vec<u8> {
    let mut out = format!(
        "HTTP/1.1 {code} {}\r\n{CORS_HEADERS}Content-Type: {content_type}\r\nContent-Length: {}\r\n",
        reason(code),
        body.len()
    );
    if close {
        out.push_str("Connection: close\r\n");
    }
    out.push_str("\r\n");
    let mut bytes = out.into_bytes();
    bytes.extend_from_slice(body);
    bytes
}

/// `204 No Content` answer to a CORS preflight.
pub fn preflight() -> Vec<u8> {
    format!("HTTP/1.1 204 No Content\r\n{CORS_HEADERS}Content-Length: 0\r\n\r\n").into_bytes()
}

/// Headers switching the connection into a long-lived chunked stream.
///
/// Carries the session id so reconnecting clients can resume, and exposes it
/// through CORS for browser clients.
pub fn stream_prelude(format: StreamFormat, session_id: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 200 OK\r\n\
         Content-Type: {}\r\n\
         Transfer-Encoding: chunked\r\n\
         Connection: keep-alive\r\n\
         Cache-Control: no-cache\r\n\
         X-Mcp-Session-Id: {session_id}\r\n\
         {CORS_HEADERS}\
         Access-Control-Expose-Headers: X-Mcp-Session-Id\r\n\
         \r\n",
        format.content_type()
    )
    .into_bytes()
}

/// Frame a payload as one HTTP chunk: hex length, CRLF, payload, CRLF.
pub fn chunk(payload: &[u8]) -> Vec<u8> {
    let mut out = format!("{:X}\r\n", payload.len()).into_bytes();
    out.extend_from_slice(payload);
    out.extend_from_slice(b"\r\n");
    out
}

/// The first SSE event on a fresh stream: where to POST requests.
pub fn endpoint_event(host: &str, port: u16, session_id: &str) -> String {
    format!("event: endpoint\ndata: http://{host}:{port}/message?sessionId={session_id}\n\n")
}

/// `202 {"status":"accepted"}` for bodies that were forwarded to the child.
pub fn accepted() -> Vec<u8> {
    short(202, "application/json", br#"{"status":"accepted"}"#, false)
}
