//! `mcp-mux` — start the configured MCP servers, print their status, and
//! optionally invoke one tool.
//!
//! ```text
//! mcp-mux [CONFIG] [SERVER TOOL [JSON_ARGS]]
//! ```

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use serde_json::{json, Map, Value};

use mcp_mux::mcp_client::config::{find_config_path, load_servers_config};
use mcp_mux::mcp_client::{ClientOptions, McpClient, ToolCall};
use mcp_mux::LogTarget;

const USAGE: &str = "usage: mcp-mux [CONFIG] [SERVER TOOL [JSON_ARGS]]

Starts every server in CONFIG (default: $MCP_MUX_CONFIG or the nearest
mcp-servers.json), prints a JSON status report, optionally calls TOOL on
SERVER with JSON_ARGS (an object, default {}), then shuts everything down.

Environment:
  RUST_LOG             log filter (default mcp_mux=info,warn)
  MCP_MUX_LOG_FORMAT   set to `json` for JSON log lines
  MCP_MUX_LOG_FILE     set to log into the data directory instead of stderr";

struct ToolRequest {
    server: String,
    tool: String,
    arguments: Map<String, Value>,
}

fn parse_args(args: &[String]) -> Result<(Option<PathBuf>, Option<ToolRequest>)> {
    let tool_request = |server: &str, tool: &str, raw: &str| -> Result<ToolRequest> {
        let arguments: Map<String, Value> =
            serde_json::from_str(raw).context("tool arguments must be a JSON object")?;
        Ok(ToolRequest {
            server: server.to_string(),
            tool: tool.to_string(),
            arguments,
        })
    };

    Ok(match args {
        [] => (None, None),
        [path] => (Some(PathBuf::from(path)), None),
        [path, server, tool] => (
            Some(PathBuf::from(path)),
            Some(tool_request(server, tool, "{}")?),
        ),
        [path, server, tool, raw] => (
            Some(PathBuf::from(path)),
            Some(tool_request(server, tool, raw)?),
        ),
        _ => bail!("{USAGE}"),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.iter().any(|a| a == "-h" || a == "--help") {
        println!("{USAGE}");
        return Ok(());
    }

    let target = if std::env::var_os("MCP_MUX_LOG_FILE").is_some() {
        LogTarget::File
    } else {
        LogTarget::Stderr
    };
    mcp_mux::init_tracing(target).context("failed to initialize logging")?;

    let (config_path, tool_request) = parse_args(&args)?;
    let config_path = match config_path {
        Some(path) => path,
        None => find_config_path(&std::env::current_dir()?)?,
    };
    let config = load_servers_config(&config_path)?;

    let mut client = McpClient::new(config, ClientOptions::default());
    let failures = client.initialize().await;
    let status = client.get_server_status().await;

    let report = json!({
        "checked_at": chrono::Utc::now().to_rfc3339(),
        "config": config_path.display().to_string(),
        "servers": status,
        "failed": failures
            .iter()
            .map(|(name, err)| json!({ "name": name, "error": err.to_string() }))
            .collect::<Vec<_>>(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    let outcome = match tool_request {
        Some(request) => {
            let call = ToolCall::new(&request.tool, request.arguments);
            tokio::select! {
                result = client.call_tool(&request.server, call) => Some(result),
                _ = tokio::signal::ctrl_c() => {
                    tracing::warn!("interrupted, shutting down");
                    None
                }
            }
        }
        None => None,
    };

    client.shutdown().await;

    if let Some(result) = outcome {
        let value = result.with_context(|| "tool call failed")?;
        println!("{}", serde_json::to_string_pretty(&value)?);
    }

    Ok(())
}
