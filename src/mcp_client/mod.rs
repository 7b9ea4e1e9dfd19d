//! MCP Client — JSON-RPC over stdio for a set of MCP server processes.
//!
//! This module handles:
//! - Spawning and supervising MCP server child processes
//! - Line-delimited JSON-RPC 2.0 framing over process stdio
//! - Correlating concurrent requests and responses by id
//! - Routing tool calls and resource reads to the named server
//! - Aggregated liveness/capability status and graceful shutdown
//!
//! A failure in one server (spawn error, hang, crash) is isolated to calls
//! addressed to that server.

pub mod client;
pub mod config;
pub mod connection;
pub mod errors;
pub mod framer;
pub mod lifecycle;
pub mod types;

// Re-exports for convenience
pub use client::McpClient;
pub use config::ClientOptions;
pub use connection::{Connection, ConnectionOptions, ConnectionState};
pub use errors::{ErrorKind, McpError};
pub use types::{McpServersConfig, ResourceRequest, ServerConfig, ServerStatus, ToolCall};
