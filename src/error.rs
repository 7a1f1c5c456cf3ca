//! Error types for the per-child bridge lifecycle.
//!
//! `BridgeError` covers command resolution, spawn, port validation, listener
//! binding, child exit, configuration, and the standalone validate
//! handshake. Connection-level garbage has its own taxonomy in
//! `http::parser::ParseError` and never reaches this one: it closes the
//! offending connection and leaves the bridge untouched.
//!
//! None of these escape as panics; every public operation returns a typed
//! error and the caller decides disposition (status transition, log entry,
//! or connection close).

use std::path::PathBuf;

/// Errors raised by bridge lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// No executable candidate was found for the configured command token.
    #[error("command not found: {command}")]
    CommandNotFound {
        /// The command token as configured.
        command: String,
    },

    /// The OS refused to spawn the resolved executable.
    #[error("failed to spawn {command}: {source}")]
    SpawnFailed {
        /// The resolved executable path.
        command: String,
        /// The underlying OS error.
        source: std::io::Error,
    },

    /// The configured port is below 1024.
    ///
    /// System ports require elevated privileges and are rejected before any
    /// bind is attempted.
    #[error("port {port} is restricted (ports below 1024 are reserved)")]
    PortRestricted {
        /// The configured port.
        port: u16,
    },

    /// Another process already holds the configured port.
    #[error("port {port} is already in use")]
    PortInUse {
        /// The configured port.
        port: u16,
    },

    /// The listener could not bind for a reason other than port contention.
    #[error("failed to bind {addr}: {source}")]
    BindFailed {
        /// The host:port the bind was attempted on.
        addr: String,
        /// The underlying OS error.
        source: std::io::Error,
    },

    /// The child process exited while the bridge was running.
    #[error("child exited with status {status}")]
    ChildExited {
        /// Display form of the exit status.
        status: String,
    },

    /// The validate handshake did not complete within its wall clock.
    #[error("validation timed out after {seconds}s")]
    ValidateTimeout {
        /// The configured timeout in seconds.
        seconds: u64,
    },

    /// The validate handshake failed for a reason other than the wall clock:
    /// the child closed stdout early or answered with an unusable response.
    #[error("validation failed: {reason}")]
    ValidateFailed {
        /// Human-readable description of the failure.
        reason: String,
    },

    /// A configuration field failed validation.
    #[error("invalid config for {id:?}: {reason}")]
    InvalidConfig {
        /// The config id, if known.
        id: String,
        /// Human-readable description of the violation.
        reason: String,
    },

    /// A configuration file could not be read or parsed.
    #[error("failed to load config {}: {reason}", path.display())]
    ConfigLoad {
        /// The path that was read.
        path: PathBuf,
        /// Human-readable description of the failure.
        reason: String,
    },

    /// The bridge is not in a state where the requested operation applies.
    #[error("bridge {id} is {status}, cannot {operation}")]
    InvalidState {
        /// The bridge id.
        id: String,
        /// Current status display form.
        status: String,
        /// The operation that was refused.
        operation: &'static str,
    },

    /// An underlying IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
