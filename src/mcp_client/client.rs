//! MCP Client — multiplexes calls across several named servers.
//!
//! Owns one [`Connection`] per successfully initialized server. A server
//! that fails to start, hangs, or dies affects only calls addressed to it.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use super::config::ClientOptions;
use super::connection::Connection;
use super::errors::McpError;
use super::lifecycle;
use super::types::{
    McpServersConfig, ResourceRequest, ServerConfig, ServerInfo, ServerStatus, ToolCall,
};

// ─── McpClient ───────────────────────────────────────────────────────────────

/// High-level MCP client that manages multiple servers and routes calls.
pub struct McpClient {
    /// Connections that completed the handshake.
    servers: HashMap<String, Arc<Connection>>,
    /// Server configurations, including ones that failed to start.
    configs: HashMap<String, ServerConfig>,
    options: ClientOptions,
}

impl McpClient {
    /// Create a client for the given servers. Nothing is spawned yet.
    pub fn new(config: McpServersConfig, options: ClientOptions) -> Self {
        Self {
            servers: HashMap::new(),
            configs: config.servers,
            options,
        }
    }

    /// Set the request timeout in milliseconds, for current and future connections.
    pub fn set_call_timeout(&mut self, timeout_ms: u64) {
        let timeout = Duration::from_millis(timeout_ms);
        self.options.call_timeout = timeout;
        for connection in self.servers.values() {
            connection.set_request_timeout(timeout);
        }
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Start every configured server that is not already running.
    ///
    /// Returns the servers that failed (partial startup is OK). Failed
    /// servers are not retried; they simply stay unavailable.
    pub async fn initialize(&mut self) -> Vec<(String, McpError)> {
        let to_start: HashMap<String, ServerConfig> = self
            .configs
            .iter()
            .filter(|(name, _)| !self.servers.contains_key(*name))
            .map(|(name, config)| (name.clone(), config.clone()))
            .collect();

        let (started, errors) = lifecycle::spawn_all_servers(&to_start, &self.options).await;

        for (name, err) in &errors {
            tracing::warn!(
                server = %name,
                error = %err,
                "MCP server failed to start (non-fatal)"
            );
        }

        for (name, connection) in started {
            self.servers.insert(name, Arc::new(connection));
        }

        tracing::info!(
            running_servers = self.servers.len(),
            failed_servers = errors.len(),
            "MCP client initialized"
        );

        errors
    }

    /// Close every connection and forget them. Safe to call repeatedly.
    pub async fn shutdown(&mut self) {
        if self.servers.is_empty() {
            return;
        }
        let count = self.servers.len();
        lifecycle::shutdown_all_servers(&mut self.servers).await;
        tracing::info!(closed = count, "MCP client shut down");
    }

    /// Drop connections whose process or pipes have died.
    ///
    /// Dead connections otherwise stay listed until a call fails against
    /// them; this sweep only runs when the caller asks for it.
    pub async fn prune_dead_servers(&mut self) -> Vec<String> {
        let dead: Vec<String> = self
            .servers
            .iter()
            .filter(|(_, connection)| !connection.is_alive())
            .map(|(name, _)| name.clone())
            .collect();

        for name in &dead {
            if let Some(connection) = self.servers.remove(name) {
                connection.close().await;
                tracing::info!(server = %name, "removed dead MCP server");
            }
        }

        dead
    }

    // ─── Calls ───────────────────────────────────────────────────────────

    fn connection(&self, server_name: &str) -> Result<&Arc<Connection>, McpError> {
        self.servers
            .get(server_name)
            .ok_or_else(|| McpError::NotAvailable {
                name: server_name.to_string(),
            })
    }

    /// Invoke a tool on the named server (`tools/call`).
    pub async fn call_tool(&self, server_name: &str, call: ToolCall) -> Result<Value, McpError> {
        let connection = self.connection(server_name)?;
        let params = serde_json::to_value(&call).map_err(|e| McpError::TransportError {
            server: server_name.to_string(),
            reason: format!("failed to encode tool call: {e}"),
        })?;
        connection.send("tools/call", Some(params)).await
    }

    /// Read a resource from the named server (`resources/read`).
    pub async fn get_resource(
        &self,
        server_name: &str,
        request: ResourceRequest,
    ) -> Result<Value, McpError> {
        let connection = self.connection(server_name)?;
        connection
            .send("resources/read", Some(json!({ "uri": request.uri })))
            .await
    }

    /// List the named server's tools (`tools/list`).
    pub async fn list_tools(&self, server_name: &str) -> Result<Value, McpError> {
        let connection = self.connection(server_name)?;
        connection.send("tools/list", Some(json!({}))).await
    }

    /// List the named server's resource templates (`resources/templates/list`).
    pub async fn list_resources(&self, server_name: &str) -> Result<Value, McpError> {
        let connection = self.connection(server_name)?;
        connection
            .send("resources/templates/list", Some(json!({})))
            .await
    }

    // ─── Status ──────────────────────────────────────────────────────────

    /// Probe every tracked server. Never fails: a failing probe reports
    /// the server as disconnected.
    pub async fn get_server_status(&self) -> BTreeMap<String, ServerStatus> {
        let probes = self.servers.iter().map(|(name, connection)| async move {
            (name.clone(), probe_server(name, connection).await)
        });
        futures::future::join_all(probes).await.into_iter().collect()
    }

    /// Names of tracked servers, sorted.
    pub fn get_available_servers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.servers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_server_available(&self, name: &str) -> bool {
        self.servers.contains_key(name)
    }

    pub fn running_server_count(&self) -> usize {
        self.servers.len()
    }

    /// What the server reported about itself during the handshake.
    pub fn server_info(&self, name: &str) -> Option<ServerInfo> {
        self.servers.get(name).and_then(|c| c.server_info())
    }

    /// Get names of all configured servers (including those that failed to start).
    pub fn configured_servers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.configs.keys().cloned().collect();
        names.sort();
        names
    }
}

async fn probe_server(name: &str, connection: &Connection) -> ServerStatus {
    if !connection.is_alive() {
        return ServerStatus::disconnected();
    }

    let (tools, resources) = tokio::join!(
        connection.send("tools/list", Some(json!({}))),
        connection.send("resources/templates/list", Some(json!({}))),
    );

    match (tools, resources) {
        (Ok(tools), Ok(resources)) => ServerStatus {
            connected: true,
            tools: array_len(&tools, "tools"),
            resources: array_len(&resources, "resourceTemplates"),
        },
        (Err(e), _) | (_, Err(e)) => {
            tracing::warn!(server = %name, error = %e, "status probe failed");
            ServerStatus::disconnected()
        }
    }
}

fn array_len(result: &Value, key: &str) -> usize {
    result
        .get(key)
        .and_then(Value::as_array)
        .map(Vec::len)
        .unwrap_or(0)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
