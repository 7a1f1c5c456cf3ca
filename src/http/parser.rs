//! Incremental HTTP/1.1 request parsing over a growing byte buffer.
//!
//! The connection task appends received bytes to one buffer and calls
//! [`try_parse`] after every read. A complete request is returned together
//! with the number of bytes it consumed; the caller drains exactly that many
//! and re-parses, which is all the keep-alive machinery there is. Parsing is
//! deterministic in the byte sequence alone, so any fragmentation of the
//! same bytes produces the same requests.

use std::collections::HashMap;

/// Inbound buffer cap per connection. A connection whose buffer would exceed
/// this is closed.
pub const MAX_BUFFER_BYTES: usize = 10 * 1024 * 1024;

/// A fully received request, ready for transport classification.
#[derive(Debug, Clone)]
pub struct ParsedRequest {
    pub method: String,
    pub path: String,
    pub query: HashMap<String, String>,
    /// Header names lowercased; last occurrence wins.
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl ParsedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(|s| s.as_str())
    }

    /// True if the Accept header opts into `text/event-stream`.
    pub fn accepts_event_stream(&self) -> bool {
        self.header("accept")
            .is_some_and(|accept| accept.contains("text/event-stream"))
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(|s| s.as_str())
    }
}

/// Unrecoverable garbage on a connection; the caller closes it.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    /// The first bytes look like a TLS ClientHello - a mis-dialed HTTPS
    /// client on a plaintext port.
    #[error("TLS handshake bytes on plaintext port")]
    TlsHandshake,

    /// The request head is not valid UTF-8.
    #[error("request head is not valid UTF-8")]
    HeadNotUtf8,

    /// The request line does not have the `METHOD PATH VERSION` shape.
    #[error("malformed request line: {line:?}")]
    BadRequestLine { line: String },

    /// Content-Length is present but unparseable.
    #[error("malformed Content-Length: {value:?}")]
    BadContentLength { value: String },

    /// The declared body alone exceeds the connection buffer cap.
    #[error("declared body of {length} bytes exceeds limit")]
    BodyTooLarge { length: usize },
}

/// Try to parse one complete request from the front of `buf`.
///
/// Returns `Ok(None)` while more bytes are needed, or the parsed request and
/// the exact number of bytes (head plus body) the caller must consume before
/// re-parsing the remainder.
pub fn try_parse(buf: &[u8]) -> Result<Option<(ParsedRequest, usize)>, ParseError> {
    // TLS ClientHello sniff: 0x16 0x03 ?? at a request boundary.
    if buf.len() >= 3 && buf[0] == 0x16 && buf[1] == 0x03 {
        return Err(ParseError::TlsHandshake);
    }
    if buf.len() < 3 && buf.starts_with(&[0x16]) {
        return Ok(None);
    }

    let Some((head_end, sep_len)) = find_head_end(buf) else {
        return Ok(None);
    };

    let head = std::str::from_utf8(&buf[..head_end]).map_err(|_| ParseError::HeadNotUtf8)?;
    let mut lines = head.split('\n').map(|line| line.trim_end_matches('\r'));

    let request_line = lines.next().unwrap_or("");
    let mut parts = request_line.split_whitespace();
    let (method, target, version) = match (parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(t), Some(v)) if v.starts_with("HTTP/") => (m, t, v),
        _ => {
            return Err(ParseError::BadRequestLine {
                line: request_line.to_string(),
            })
        }
    };
    let _ = version;

    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(
                name.trim().to_ascii_lowercase(),
                value.trim().to_string(),
            );
        }
    }

    let content_length = match headers.get("content-length") {
        Some(value) => value
            .parse::<usize>()
            .map_err(|_| ParseError::BadContentLength {
                value: value.clone(),
            })?,
        None => 0,
    };
    if content_length > MAX_BUFFER_BYTES {
        return Err(ParseError::BodyTooLarge {
            length: content_length,
        });
    }

    let total = head_end + sep_len + content_length;
    if buf.len() < total {
        return Ok(None);
    }

    let (path, query) = split_target(target);
    let body = buf[head_end + sep_len..total].to_vec();

    Ok(Some((
        ParsedRequest {
            method: method.to_ascii_uppercase(),
            path,
            query,
            headers,
            body,
        },
        total,
    )))
}

/// Locate the end of headers: `\r\n\r\n` or bare `\n\n`, whichever comes
/// first. Returns (offset of the separator, separator length).
fn find_head_end(buf: &[u8]) -> Option<(usize, usize)> {
    let crlf = buf.windows(4).position(|w| w == b"\r\n\r\n");
    let lf = buf.windows(2).position(|w| w == b"\n\n");
    match (crlf, lf) {
        (Some(c), Some(l)) if l < c => Some((l, 2)),
        (Some(c), _) => Some((c, 4)),
        (None, Some(l)) => Some((l, 2)),
        (None, None) => None,
    }
}

/// Split a request target into path and query parameters.
///
/// Query values are taken verbatim (session ids are plain UUIDs, nothing
/// here needs percent-decoding).
fn split_target(target: &str) -> (String, HashMap<String, String>) {
    let Some((path, raw_query)) = target.split_once('?') else {
        return (target.to_string(), HashMap::new());
    };
    let mut query = HashMap::new();
    for pair in raw_query.split('&') {
        if pair.is_empty() {
            continue;
        }
        match pair.split_once('=') {
            Some((k, v)) => query.insert(k.to_string(), v.to_string()),
            None => query.insert(pair.to_string(), String::new()),
        };
    }
    (path.to_string(), query)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(buf: &[u8]) -> Vec<ParsedRequest> {
        let mut buf = buf.to_vec();
        let mut out = Vec::new();
        while let Ok(Some((req, consumed))) = try_parse(&buf) {
            buf.drain(..consumed);
            out.push(req);
        }
        out
    }

    #[test]
    fn test_get_without_body() {
        let raw = b"GET /sse?sessionId=abc HTTP/1.1\r\nHost: x\r\nAccept: text/event-stream\r\n\r\n";
        let (req, consumed) = try_parse(raw).unwrap().unwrap();
        assert_eq!(consumed, raw.len());
        assert_eq!(req.method, "GET");
        assert_eq!(req.path, "/sse");
        assert_eq!(req.query_param("sessionId"), Some("abc"));
        assert!(req.accepts_event_stream());
        assert!(req.body.is_empty());
    }

    #[test]
    fn test_post_with_body() {
        let raw = b"POST /x HTTP/1.1\r\nContent-Length: 3\r\n\r\nabc";
        let (req, consumed) = try_parse(raw).unwrap().unwrap();
        assert_eq!(consumed, raw.len());
        assert_eq!(req.body, b"abc");
    }

    #[test]
    fn test_incomplete_body_waits() {
        let raw = b"POST /x HTTP/1.1\r\nContent-Length: 5\r\n\r\nab";
        assert!(try_parse(raw).unwrap().is_none());
    }

    #[test]
    fn test_incomplete_head_waits() {
        assert!(try_parse(b"POST /x HTTP/1.1\r\nContent-Le").unwrap().is_none());
    }

    #[test]
    fn test_bare_lf_separator() {
        let raw = b"POST /x HTTP/1.1\nContent-Length: 2\n\nhi";
        let (req, consumed) = try_parse(raw).unwrap().unwrap();
        assert_eq!(consumed, raw.len());
        assert_eq!(req.body, b"hi");
    }

    #[test]
    fn test_headers_case_insensitive() {
        let raw = b"POST / HTTP/1.1\r\ncOnTeNt-LeNgTh: 0\r\nAuthorization: Bearer t\r\n\r\n";
        let (req, _) = try_parse(raw).unwrap().unwrap();
        assert_eq!(req.header("AUTHORIZATION"), Some("Bearer t"));
        assert_eq!(req.header("content-length"), Some("0"));
    }

    #[test]
    fn test_tls_client_hello_rejected() {
        let raw = [0x16, 0x03, 0x01, 0x02, 0x00];
        assert!(matches!(try_parse(&raw), Err(ParseError::TlsHandshake)));
    }

    #[test]
    fn test_tls_prefix_waits_for_third_byte() {
        assert!(try_parse(&[0x16]).unwrap().is_none());
        assert!(try_parse(&[0x16, 0x03]).unwrap().is_none());
    }

    #[test]
    fn test_bad_request_line() {
        let raw = b"NONSENSE\r\n\r\n";
        assert!(matches!(
            try_parse(raw),
            Err(ParseError::BadRequestLine { .. })
        ));
    }

    #[test]
    fn test_bad_content_length() {
        let raw = b"POST / HTTP/1.1\r\nContent-Length: banana\r\n\r\n";
        assert!(matches!(
            try_parse(raw),
            Err(ParseError::BadContentLength { .. })
        ));
    }

    #[test]
    fn test_declared_body_over_cap() {
        let raw = b"POST / HTTP/1.1\r\nContent-Length: 99999999999\r\n\r\n";
        assert!(matches!(try_parse(raw), Err(ParseError::BodyTooLarge { .. })));
    }

    #[test]
    fn test_pipelined_requests_consume_exactly() {
        let raw =
            b"POST /a HTTP/1.1\r\nContent-Length: 1\r\n\r\nXGET / HTTP/1.1\r\nAccept: text/event-stream\r\n\r\n";
        let reqs = parse_all(raw);
        assert_eq!(reqs.len(), 2);
        assert_eq!(reqs[0].path, "/a");
        assert_eq!(reqs[0].body, b"X");
        assert_eq!(reqs[1].method, "GET");
    }

    #[test]
    fn test_fragmentation_equivalence() {
        // Delivering the bytes at every possible split point produces the
        // same request as delivering them at once.
        let raw = b"POST /x?a=1&b=2 HTTP/1.1\r\nContent-Length: 3\r\nX-K: v\r\n\r\nabc".to_vec();
        let (whole, _) = try_parse(&raw).unwrap().unwrap();

        for split in 1..raw.len() {
            let mut buf = Vec::new();
            buf.extend_from_slice(&raw[..split]);
            assert!(
                try_parse(&buf).unwrap().is_none(),
                "premature completion at split {split}"
            );
            buf.extend_from_slice(&raw[split..]);
            let (req, consumed) = try_parse(&buf).unwrap().unwrap();
            assert_eq!(consumed, raw.len());
            assert_eq!(req.method, whole.method);
            assert_eq!(req.path, whole.path);
            assert_eq!(req.query, whole.query);
            assert_eq!(req.headers, whole.headers);
            assert_eq!(req.body, whole.body);
        }
    }
}
