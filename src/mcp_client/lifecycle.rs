//! Server process lifecycle management.
//!
//! Handles spawning MCP server child processes, wiring their stdio into a
//! [`Connection`], the initialization handshake, and shutdown. Each server
//! runs as a separate OS process communicating via JSON-RPC over stdio.

use std::collections::HashMap;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::config::ClientOptions;
use super::connection::{Connection, ConnectionOptions, ExitNotifier, StderrTail};
use super::errors::McpError;
use super::types::{InitializeResult, ServerConfig};

// ─── Constants ───────────────────────────────────────────────────────────────

/// MCP protocol revision announced in the handshake.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Number of stderr lines retained per server for failure diagnostics.
const STDERR_TAIL_LINES: usize = 20;

/// How long to wait for stderr to drain after a failed handshake.
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

// ─── Process supervision ─────────────────────────────────────────────────────

/// Handle to the task that owns a server's child process.
pub struct ProcessHandle {
    pid: Option<u32>,
    task: JoinHandle<()>,
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Wait for the supervisor to finish (process reaped).
    pub(crate) async fn wait(self) {
        let _ = self.task.await;
    }

    /// Drop the supervisor; `kill_on_drop` takes the child down with it.
    pub(crate) fn abort(self) {
        self.task.abort();
    }
}

enum Wake {
    Exited(std::io::Result<ExitStatus>),
    Terminate(Duration),
}

/// Own the child: report an unexpected exit, or stop it on request.
fn spawn_supervisor(
    name: String,
    mut child: Child,
    notifier: ExitNotifier,
    terminate_rx: oneshot::Receiver<Duration>,
) -> ProcessHandle {
    let pid = child.id();
    let task = tokio::spawn(async move {
        let wake = tokio::select! {
            status = child.wait() => Wake::Exited(status),
            grace = terminate_rx => Wake::Terminate(grace.unwrap_or(Duration::ZERO)),
        };

        match wake {
            Wake::Exited(status) => {
                let reason = match status {
                    Ok(status) => format!("process exited ({status})"),
                    Err(e) => format!("failed to wait for process: {e}"),
                };
                tracing::warn!(server = %name, reason = %reason, "MCP server process exited");
                notifier.notify_closed(reason);
            }
            Wake::Terminate(grace) => {
                // stdin is already closed; give the server a chance to exit on EOF.
                match tokio::time::timeout(grace, child.wait()).await {
                    Ok(Ok(status)) => {
                        tracing::debug!(server = %name, status = %status, "MCP server exited");
                    }
                    _ => {
                        if let Err(e) = child.kill().await {
                            tracing::warn!(server = %name, error = %e, "failed to kill MCP server");
                        } else {
                            tracing::debug!(server = %name, "MCP server killed");
                        }
                    }
                }
            }
        }
    });

    ProcessHandle { pid, task }
}

/// Log every stderr line and keep the last few for error reports.
fn spawn_stderr_logger(name: String, stderr: ChildStderr, tail: StderrTail) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stderr);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf).trim_end().to_string();
                    if line.is_empty() {
                        continue;
                    }
                    tracing::debug!(server = %name, line = %line, "server stderr");
                    if let Ok(mut tail) = tail.lock() {
                        if tail.len() == STDERR_TAIL_LINES {
                            tail.pop_front();
                        }
                        tail.push_back(line);
                    }
                }
                Err(e) => {
                    tracing::debug!(server = %name, error = %e, "stderr read failed");
                    break;
                }
            }
        }
    })
}

// ─── Spawning ────────────────────────────────────────────────────────────────

/// Build the command for a server: args, env, cwd, and three piped streams.
pub fn build_command(config: &ServerConfig, working_dir: Option<&str>) -> Command {
    let mut cmd = Command::new(&config.command);
    cmd.args(&config.args);

    for (key, value) in &config.env {
        cmd.env(key, value);
    }

    // Per-server cwd overrides the client-wide working_dir
    let effective_dir = config.cwd.as_deref().or(working_dir);
    if let Some(dir) = effective_dir {
        cmd.current_dir(dir);
    }

    // Windows: prevent console window from appearing for child processes
    #[cfg(target_os = "windows")]
    {
        const CREATE_NO_WINDOW: u32 = 0x08000000;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }

    cmd.stdin(std::process::Stdio::piped());
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());
    cmd.kill_on_drop(true);

    cmd
}

/// Spawn a server process and wire it into a connection (no handshake).
///
/// Must be called from within a tokio runtime.
pub fn connect(
    name: &str,
    config: &ServerConfig,
    working_dir: Option<&str>,
    options: ConnectionOptions,
) -> Result<Connection, McpError> {
    tracing::debug!(
        server = name,
        command = %config.command,
        args = ?config.args,
        "spawning MCP server"
    );

    let mut child = build_command(config, working_dir)
        .spawn()
        .map_err(|e| McpError::SpawnFailed {
            name: name.to_string(),
            reason: format!("{e}"),
        })?;

    let stdin = child.stdin.take().ok_or(McpError::SpawnFailed {
        name: name.to_string(),
        reason: "failed to capture stdin".into(),
    })?;

    let stdout = child.stdout.take().ok_or(McpError::SpawnFailed {
        name: name.to_string(),
        reason: "failed to capture stdout".into(),
    })?;

    let stderr = child.stderr.take();

    let mut connection = Connection::from_io(name, stdout, stdin, options);

    if let Some(stderr) = stderr {
        let task = spawn_stderr_logger(name.to_string(), stderr, connection.stderr_buffer());
        connection.attach_stderr_task(task);
    }

    let (terminate_tx, terminate_rx) = oneshot::channel();
    let process = spawn_supervisor(
        name.to_string(),
        child,
        connection.exit_notifier(),
        terminate_rx,
    );
    connection.attach_process(process, terminate_tx);

    Ok(connection)
}

/// Perform the MCP initialization handshake.
pub async fn handshake(
    connection: &Connection,
    options: &ClientOptions,
) -> Result<InitializeResult, McpError> {
    let params = serde_json::json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": options.client_name,
            "version": options.client_version,
        },
    });

    let result = connection
        .send_with_timeout("initialize", Some(params), options.init_timeout)
        .await?;

    let init_result = if result.is_null() {
        InitializeResult::default()
    } else {
        serde_json::from_value::<InitializeResult>(result).map_err(|e| McpError::InitFailed {
            name: connection.name().to_string(),
            reason: format!("failed to parse initialize response: {e}"),
        })?
    };

    connection.notify("notifications/initialized", None).await?;

    Ok(init_result)
}

/// Spawn a single MCP server process and complete the handshake.
///
/// On handshake failure the process is stopped and the error carries
/// whatever the server wrote to stderr.
pub async fn spawn_server(
    name: &str,
    config: &ServerConfig,
    options: &ClientOptions,
) -> Result<Connection, McpError> {
    let connection = connect(
        name,
        config,
        options.working_dir.as_deref(),
        options.connection_options(),
    )?;

    match handshake(&connection, options).await {
        Ok(init) => {
            let server_info = init.server_info;
            tracing::info!(
                server = name,
                pid = ?connection.pid(),
                remote_name = ?server_info.as_ref().and_then(|i| i.name.as_deref()),
                protocol = ?init.protocol_version,
                "MCP server initialized"
            );
            connection.set_server_info(server_info);
            Ok(connection)
        }
        Err(e) => {
            connection.close().await;
            let stderr_ctx = connection.collect_stderr(STDERR_DRAIN_TIMEOUT).await;
            if !stderr_ctx.is_empty() {
                tracing::warn!(
                    server = name,
                    stderr = %stderr_ctx,
                    "server stderr captured on failure"
                );
            }
            let reason = match e {
                McpError::InitFailed { reason, .. } => reason,
                other => other.to_string(),
            };
            Err(McpError::InitFailed {
                name: name.to_string(),
                reason: format!("{reason}{}", format_stderr_suffix(&stderr_ctx)),
            })
        }
    }
}

/// Format a stderr suffix for error messages (empty string if no stderr).
fn format_stderr_suffix(stderr: &str) -> String {
    if stderr.is_empty() {
        String::new()
    } else {
        format!(" | stderr: {}", stderr.trim())
    }
}

// ─── Batch Operations ────────────────────────────────────────────────────────

/// Spawn all given servers concurrently.
///
/// Each server is its own failure scope: servers that fail to start are
/// reported in the error list and left out of the map.
pub async fn spawn_all_servers(
    configs: &HashMap<String, ServerConfig>,
    options: &ClientOptions,
) -> (HashMap<String, Connection>, Vec<(String, McpError)>) {
    let mut servers = HashMap::new();
    let mut errors = Vec::new();

    let mut handles: Vec<(String, _)> = Vec::new();
    for (name, config) in configs {
        let name = name.clone();
        let config = config.clone();
        let options = options.clone();
        handles.push((
            name.clone(),
            tokio::spawn(async move { spawn_server(&name, &config, &options).await }),
        ));
    }

    for (name, handle) in handles {
        match handle.await {
            Ok(Ok(connection)) => {
                servers.insert(name, connection);
            }
            Ok(Err(e)) => {
                errors.push((name, e));
            }
            Err(e) => {
                errors.push((
                    name.clone(),
                    McpError::SpawnFailed {
                        name,
                        reason: format!("join error: {e}"),
                    },
                ));
            }
        }
    }

    (servers, errors)
}

/// Close every connection concurrently and clear the map.
pub async fn shutdown_all_servers(servers: &mut HashMap<String, Arc<Connection>>) {
    let closing = servers.values().map(|connection| connection.close());
    futures::future::join_all(closing).await;
    servers.clear();
}

// ─── Tests ───────────────────────────────────────────────────────────────────
