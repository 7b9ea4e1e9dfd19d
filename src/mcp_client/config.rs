//! Server configuration loading and client options.
//!
//! Reads `mcp-servers.json` (or `.yaml`/`.yml`), interpolates environment
//! variables, resolves relative working directories, and applies the
//! optional `enabled_servers` allowlist.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::connection::{ConnectionOptions, DEFAULT_REQUEST_TIMEOUT, DEFAULT_SHUTDOWN_TIMEOUT};
use super::errors::McpError;
use super::types::{McpServersConfig, ServerConfig};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Environment variable pointing at the servers config file.
pub const CONFIG_ENV_VAR: &str = "MCP_MUX_CONFIG";

/// File names searched for when walking up from a start directory.
const CONFIG_FILE_NAMES: [&str; 3] = ["mcp-servers.json", "mcp-servers.yaml", "mcp-servers.yml"];

/// Timeout for the initialize handshake.
///
/// Generous because some servers import large frameworks at startup.
pub const INIT_TIMEOUT: Duration = Duration::from_secs(30);

// ─── Client options ──────────────────────────────────────────────────────────

/// Settings shared by every connection an `McpClient` creates.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Working directory for servers without their own `cwd`.
    pub working_dir: Option<String>,
    /// Default per-request timeout.
    pub call_timeout: Duration,
    pub init_timeout: Duration,
    /// Grace period between closing stdin and killing the process.
    pub shutdown_timeout: Duration,
    /// Reported to servers as `clientInfo` during the handshake.
    pub client_name: String,
    pub client_version: String,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            working_dir: None,
            call_timeout: DEFAULT_REQUEST_TIMEOUT,
            init_timeout: INIT_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            client_name: env!("CARGO_PKG_NAME").to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl ClientOptions {
    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            request_timeout: self.call_timeout,
            shutdown_timeout: self.shutdown_timeout,
        }
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Locate the servers config file.
///
/// Checks `MCP_MUX_CONFIG` first, then walks upward from `start` looking
/// for `mcp-servers.{json,yaml,yml}`.
pub fn find_config_path(start: &Path) -> Result<PathBuf, McpError> {
    // 1. Check env var
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        let candidate = PathBuf::from(expand_tilde(&path));
        if candidate.is_file() {
            return Ok(candidate);
        }
        tracing::warn!(
            path = %candidate.display(),
            "{CONFIG_ENV_VAR} does not point at a file, searching instead"
        );
    }

    // 2. Walk upward from `start`
    let mut dir = start.to_path_buf();
    loop {
        for file_name in CONFIG_FILE_NAMES {
            let candidate = dir.join(file_name);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
        if !dir.pop() {
            break;
        }
    }

    Err(McpError::ConfigError {
        reason: format!("could not find mcp-servers.json above {}", start.display()),
    })
}

/// Load and parse a servers config file.
///
/// The format follows the extension (`.yaml`/`.yml` → YAML, anything else →
/// JSON). `${VAR}` and `${VAR:-default}` are interpolated first. Relative
/// `cwd` entries are resolved against the file's directory, and the
/// `enabled_servers` allowlist is applied.
pub fn load_servers_config(path: &Path) -> Result<McpServersConfig, McpError> {
    let raw = std::fs::read_to_string(path).map_err(|e| McpError::ConfigError {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;

    let mut config = parse_servers_config(&raw, is_yaml(path)).map_err(|reason| {
        McpError::ConfigError {
            reason: format!("failed to parse {}: {reason}", path.display()),
        }
    })?;

    if let Some(base) = path.parent() {
        resolve_relative_cwds(&mut config.servers, base);
    }

    if let Some(local) = load_local_overrides(path)? {
        config.servers = merge_configs(config.servers, local.servers);
        if local.enabled_servers.is_some() {
            config.enabled_servers = local.enabled_servers;
        }
    }
    apply_enabled_servers(&mut config);

    tracing::info!(
        path = %path.display(),
        count = config.servers.len(),
        servers = ?config.servers.keys().collect::<Vec<_>>(),
        "loaded MCP servers config"
    );

    Ok(config)
}

/// Parse config text after env-var interpolation.
pub fn parse_servers_config(raw: &str, yaml: bool) -> Result<McpServersConfig, String> {
    let interpolated = interpolate_env_vars(raw);
    if yaml {
        serde_yaml::from_str(&interpolated).map_err(|e| e.to_string())
    } else {
        serde_json::from_str(&interpolated).map_err(|e| e.to_string())
    }
}

/// `mcp-servers.json` → `mcp-servers.local.json`, next to the main file.
fn local_override_path(path: &Path) -> Option<PathBuf> {
    let stem = path.file_stem()?.to_str()?;
    let file_name = match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{stem}.local.{ext}"),
        None => format!("{stem}.local"),
    };
    Some(path.with_file_name(file_name))
}

/// Load the optional machine-local override file, if present.
fn load_local_overrides(path: &Path) -> Result<Option<McpServersConfig>, McpError> {
    let Some(local_path) = local_override_path(path) else {
        return Ok(None);
    };
    if !local_path.is_file() {
        return Ok(None);
    }

    let raw = std::fs::read_to_string(&local_path).map_err(|e| McpError::ConfigError {
        reason: format!("failed to read {}: {e}", local_path.display()),
    })?;
    let mut local = parse_servers_config(&raw, is_yaml(&local_path)).map_err(|reason| {
        McpError::ConfigError {
            reason: format!("failed to parse {}: {reason}", local_path.display()),
        }
    })?;
    if let Some(base) = local_path.parent() {
        resolve_relative_cwds(&mut local.servers, base);
    }

    tracing::info!(
        path = %local_path.display(),
        count = local.servers.len(),
        "applying local MCP server overrides"
    );
    Ok(Some(local))
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}

// ─── Merge / filter ──────────────────────────────────────────────────────────

/// Merge a base set of servers with overrides.
///
/// Override entries **fully replace** base entries for the same server name.
/// Override-only servers are added as-is.
pub fn merge_configs(
    mut base: HashMap<String, ServerConfig>,
    overrides: HashMap<String, ServerConfig>,
) -> HashMap<String, ServerConfig> {
    for (name, override_config) in overrides {
        base.insert(name, override_config);
    }
    base
}

/// Keep only servers named in `enabled_servers`, when that list is non-empty.
pub fn apply_enabled_servers(config: &mut McpServersConfig) {
    let Some(enabled) = config.enabled_servers.as_ref() else {
        return;
    };
    if enabled.is_empty() {
        return;
    }

    let allowlist: HashSet<&str> = enabled.iter().map(String::as_str).collect();
    let before = config.servers.len();
    config
        .servers
        .retain(|name, _| allowlist.contains(name.as_str()));

    tracing::info!(
        before,
        after = config.servers.len(),
        enabled = ?allowlist,
        "filtered MCP servers by enabled_servers allowlist"
    );
}

/// Make relative `cwd` entries absolute with respect to `base`.
fn resolve_relative_cwds(servers: &mut HashMap<String, ServerConfig>, base: &Path) {
    for server_config in servers.values_mut() {
        if let Some(ref cwd) = server_config.cwd {
            if !Path::new(cwd).is_absolute() {
                let abs_cwd = base.join(cwd);
                server_config.cwd = Some(abs_cwd.to_string_lossy().into_owned());
            }
        }
    }
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Substitute `${NAME}` and `${NAME:-fallback}` from the process environment.
///
/// Unset variables without a fallback become empty. An unterminated `${` is
/// copied through untouched.
fn interpolate_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(open) = rest.find("${") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        match after.find('}') {
            Some(close) => {
                out.push_str(&lookup_var(&after[..close]));
                rest = &after[close + 1..];
            }
            None => {
                out.push_str(&rest[open..]);
                return out;
            }
        }
    }

    out.push_str(rest);
    out
}

fn lookup_var(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((name, fallback)) => {
            std::env::var(name).unwrap_or_else(|_| expand_tilde(fallback))
        }
        None => std::env::var(expr).unwrap_or_default(),
    }
}

/// `~` and `~/…` become paths under the home directory; `~user` is left alone.
fn expand_tilde(path: &str) -> String {
    let Some(home) = dirs::home_dir() else {
        return path.to_string();
    };
    if path == "~" {
        return home.display().to_string();
    }
    match path.strip_prefix("~/") {
        Some(rest) => home.join(rest).display().to_string(),
        None => path.to_string(),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
