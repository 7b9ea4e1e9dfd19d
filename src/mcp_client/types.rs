//! Shared types for the MCP client.
//!
//! JSON-RPC 2.0 message types, the parse boundary for incoming lines, and
//! the MCP request/config structures used by the multiplexer.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ─── JSON-RPC 2.0 ───────────────────────────────────────────────────────────

/// JSON-RPC 2.0 request message.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request.
    pub fn new(id: u64, method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 notification (no id, no response expected).
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    /// Build an error object from whatever the peer put in `error`.
    ///
    /// Missing or mistyped fields fall back to `INTERNAL_ERROR` / "MCP error".
    pub fn from_value(value: &Value) -> Self {
        let code = value
            .get("code")
            .and_then(Value::as_i64)
            .unwrap_or(error_codes::INTERNAL_ERROR);
        let message = value
            .get("message")
            .and_then(Value::as_str)
            .filter(|m| !m.is_empty())
            .unwrap_or(DEFAULT_REMOTE_ERROR_MESSAGE)
            .to_string();
        let data = value.get("data").cloned();
        Self {
            code,
            message,
            data,
        }
    }
}

/// Message used when a peer error carries no message of its own.
pub const DEFAULT_REMOTE_ERROR_MESSAGE: &str = "MCP error";

/// Outcome carried by a response: exactly one of success or failure.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponsePayload {
    Success(Value),
    Failure(JsonRpcError),
}

/// A classified line received from a server's stdout.
#[derive(Debug, Clone, PartialEq)]
pub enum IncomingMessage {
    /// A response to one of our requests.
    Response { id: u64, payload: ResponsePayload },
    /// Something carrying an id we could never have issued (string, negative, ...).
    UnknownIdResponse { id: Value },
    /// A server-initiated notification or request.
    ServerMessage { method: String, id: Option<Value> },
    /// Valid JSON that is not a JSON-RPC message.
    Invalid,
}

impl IncomingMessage {
    /// Classify a parsed JSON value.
    ///
    /// An `error` field wins over `result`. A response with neither is a
    /// success with a `null` result.
    pub fn classify(value: Value) -> Self {
        let Value::Object(mut obj) = value else {
            return Self::Invalid;
        };

        if let Some(method) = obj.get("method").and_then(Value::as_str) {
            return Self::ServerMessage {
                method: method.to_string(),
                id: obj.get("id").cloned(),
            };
        }

        let Some(id_value) = obj.get("id").cloned() else {
            return Self::Invalid;
        };
        let Some(id) = id_value.as_u64() else {
            return Self::UnknownIdResponse { id: id_value };
        };

        let payload = match obj.remove("error") {
            Some(err) if !err.is_null() => ResponsePayload::Failure(JsonRpcError::from_value(&err)),
            _ => ResponsePayload::Success(obj.remove("result").unwrap_or(Value::Null)),
        };

        Self::Response { id, payload }
    }
}

// ─── MCP Protocol Types ──────────────────────────────────────────────────────

/// Parameters for `tools/call`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
}

impl ToolCall {
    pub fn new(name: &str, arguments: Map<String, Value>) -> Self {
        Self {
            name: name.to_string(),
            arguments,
        }
    }
}

/// Parameters for `resources/read`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub uri: String,
}

impl ResourceRequest {
    pub fn new(uri: &str) -> Self {
        Self {
            uri: uri.to_string(),
        }
    }
}

/// Server configuration (one entry of `mcp-servers.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Per-server working directory (overrides the client-wide working_dir).
    #[serde(default)]
    pub cwd: Option<String>,
}

impl ServerConfig {
    pub fn new(command: &str, args: &[&str]) -> Self {
        Self {
            command: command.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            env: HashMap::new(),
            cwd: None,
        }
    }
}

/// Top-level MCP servers configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct McpServersConfig {
    #[serde(default)]
    pub servers: HashMap<String, ServerConfig>,
    /// Optional allowlist of server names to start. Absent or empty means all.
    #[serde(default)]
    pub enabled_servers: Option<Vec<String>>,
}

/// Per-server liveness/capability snapshot returned by `get_server_status`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ServerStatus {
    pub connected: bool,
    pub tools: usize,
    pub resources: usize,
}

impl ServerStatus {
    /// The record reported for a server whose probes failed.
    pub fn disconnected() -> Self {
        Self::default()
    }
}

/// MCP initialize response payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InitializeResult {
    #[serde(default, alias = "protocolVersion")]
    pub protocol_version: Option<String>,
    #[serde(default)]
    pub capabilities: Value,
    #[serde(default, alias = "serverInfo")]
    pub server_info: Option<ServerInfo>,
}

/// Server info returned in the initialize response.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerInfo {
    pub name: Option<String>,
    pub version: Option<String>,
}

// ─── Standard MCP Error Codes ────────────────────────────────────────────────

/// Well-known JSON-RPC error codes.
pub mod error_codes {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i64 = -32700;
    /// The JSON sent is not a valid Request object.
    pub const INVALID_REQUEST: i64 = -32600;
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i64 = -32602;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i64 = -32603;
}

// ─── Tests ───────────────────────────────────────────────────────────────────
