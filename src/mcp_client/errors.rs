//! MCP Client error types.
//!
//! Protocol-level noise (malformed lines, responses for unknown ids) never
//! becomes an `McpError`; it is logged and dropped inside the connection.

use thiserror::Error;

/// Errors that can occur during MCP client operations.
#[derive(Debug, Error)]
pub enum McpError {
    /// No connection is tracked under this name.
    #[error("MCP server '{name}' not available")]
    NotAvailable {
        name: String,
    },

    /// A server process failed to start.
    #[error("failed to spawn server '{name}': {reason}")]
    SpawnFailed {
        name: String,
        reason: String,
    },

    /// The initialization handshake failed.
    #[error("server '{name}' initialization failed: {reason}")]
    InitFailed {
        name: String,
        reason: String,
    },

    /// The connection is gone (process exit, EOF, broken stdin, or close).
    #[error("connection to server '{server}' closed: {reason}")]
    ConnectionClosed {
        server: String,
        reason: String,
    },

    /// A request could not be encoded for the wire.
    #[error("transport error for server '{server}': {reason}")]
    TransportError {
        server: String,
        reason: String,
    },

    /// Server returned a JSON-RPC error response.
    #[error("server error [{code}]: {message}")]
    ServerError {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// No response arrived within the request timeout.
    #[error("request '{method}' to server '{server}' timed out after {timeout_ms}ms")]
    Timeout {
        server: String,
        method: String,
        timeout_ms: u64,
    },

    /// Configuration error (missing or unparseable config file).
    #[error("config error: {reason}")]
    ConfigError {
        reason: String,
    },
}

/// Coarse classification callers use to decide how to react.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The named server is not in the available set. Do not retry.
    Availability,
    /// The connection failed or was never established.
    Connection,
    /// The peer answered with an error.
    Remote,
    /// The peer did not answer in time. May be retried.
    Timeout,
    Config,
}

impl McpError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            McpError::NotAvailable { .. } => ErrorKind::Availability,
            McpError::SpawnFailed { .. }
            | McpError::InitFailed { .. }
            | McpError::ConnectionClosed { .. }
            | McpError::TransportError { .. } => ErrorKind::Connection,
            McpError::ServerError { .. } => ErrorKind::Remote,
            McpError::Timeout { .. } => ErrorKind::Timeout,
            McpError::ConfigError { .. } => ErrorKind::Config,
        }
    }

    pub fn is_not_available(&self) -> bool {
        self.kind() == ErrorKind::Availability
    }

    pub fn is_timeout(&self) -> bool {
        self.kind() == ErrorKind::Timeout
    }

    /// Only timeouts are worth retrying as-is.
    pub fn is_retryable(&self) -> bool {
        self.is_timeout()
    }
}
