//! Incremental line framing for the child's stdout byte stream.
//!
//! The child writes one JSON-RPC message per `\n`-terminated line, but the
//! pipe delivers arbitrary byte chunks. The framer accumulates chunks and
//! yields complete lines; the trailing partial segment stays buffered until
//! its newline arrives. Framing is a pure function of the byte sequence, so
//! any chunking of the same bytes yields the same lines.

/// Splits a pushed byte stream into complete, trimmed UTF-8 lines.
///
/// Lines are trimmed of surrounding whitespace (including the `\r` of CRLF
/// endings), empty lines are skipped, and lines that are not valid UTF-8 are
/// dropped with a warning. There is no per-line size cap; the child side of
/// the pipe is trusted.
#[derive(Debug, Default)]
pub struct LineFramer {
    partial: Vec<u8>,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes, returning every line completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        let mut rest = chunk;

        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            self.partial.extend_from_slice(&rest[..pos]);
            rest = &rest[pos + 1..];

            let raw = std::mem::take(&mut self.partial);
            match String::from_utf8(raw) {
                Ok(line) => {
                    let line = line.trim();
                    if !line.is_empty() {
                        lines.push(line.to_string());
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        len = e.as_bytes().len(),
                        "dropping non-UTF-8 line from child stdout"
                    );
                }
            }
        }

        self.partial.extend_from_slice(rest);
        lines
    }

    /// Bytes currently buffered awaiting a newline.
    pub fn pending(&self) -> &[u8] {
        &self.partial
    }
}
