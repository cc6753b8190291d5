//! Server configuration loading and validation.
//!
//! Reads `servers.json` (or YAML) and checks it structurally before any
//! subprocess is launched.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use super::errors::McpError;
use super::types::McpServersConfig;

/// Environment variable that overrides the default config location.
pub const CONFIG_ENV_VAR: &str = "MCP_HUB_CONFIG";

/// Default config path: `$MCP_HUB_CONFIG`, else `<config dir>/mcp-hub/servers.json`.
pub fn default_config_path() -> PathBuf {
    if let Some(path) = std::env::var_os(CONFIG_ENV_VAR) {
        return PathBuf::from(path);
    }
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("mcp-hub")
        .join("servers.json")
}

/// Load and validate a configuration file.
///
/// `.yaml` / `.yml` files are parsed as YAML, everything else as JSON.
pub fn load_config(path: &Path) -> Result<McpServersConfig, McpError> {
    let content = std::fs::read_to_string(path).map_err(|e| McpError::ConfigError {
        reason: format!("cannot read {}: {e}", path.display()),
    })?;

    let is_yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    );
    let config = if is_yaml {
        parse_yaml(&content)
    } else {
        parse_json(&content)
    }
    .map_err(|reason| McpError::ConfigError {
        reason: format!("cannot parse {}: {reason}", path.display()),
    })?;

    validate(&config)?;

    tracing::info!(
        path = %path.display(),
        count = config.servers.len(),
        servers = ?config.servers.keys().collect::<Vec<_>>(),
        "loaded MCP server config"
    );
    Ok(config)
}

fn parse_json(content: &str) -> Result<McpServersConfig, String> {
    serde_json::from_str(content).map_err(|e| e.to_string())
}

fn parse_yaml(content: &str) -> Result<McpServersConfig, String> {
    serde_yaml::from_str(content).map_err(|e| e.to_string())
}

/// Structural validation. Every problem is reported in one error.
pub fn validate(config: &McpServersConfig) -> Result<(), McpError> {
    let mut problems = Vec::new();

    if config.servers.is_empty() {
        problems.push("no servers configured".to_string());
    }

    let mut names: Vec<&String> = config.servers.keys().collect();
    names.sort();
    for name in names {
        let server = &config.servers[name];
        if name.trim().is_empty() {
            problems.push("server name must not be empty".to_string());
        } else if name.chars().any(char::is_whitespace) {
            problems.push(format!("server name '{name}' must not contain whitespace"));
        }
        if server.command.trim().is_empty() {
            problems.push(format!("server '{name}': command must not be empty"));
        }
    }

    for (field, value) in [
        ("handshake_timeout_ms", config.handshake_timeout_ms),
        ("call_timeout_ms", config.call_timeout_ms),
        ("shutdown_grace_ms", config.shutdown_grace_ms),
    ] {
        if value == 0 {
            problems.push(format!("{field} must be greater than zero"));
        }
    }

    for name in &config.enabled_servers {
        if !config.servers.contains_key(name) {
            problems.push(format!("enabled_servers names unknown server '{name}'"));
        }
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(McpError::ConfigError {
            reason: problems.join("; "),
        })
    }
}

/// Apply the `enabled_servers` allowlist. An empty list keeps every server.
pub fn filter_enabled_servers(config: &mut McpServersConfig) {
    if config.enabled_servers.is_empty() {
        return;
    }

    let allowlist: HashSet<&String> = config.enabled_servers.iter().collect();
    let before = config.servers.len();
    config.servers.retain(|name, _| allowlist.contains(name));
    let after = config.servers.len();

    tracing::info!(
        before,
        after,
        enabled = ?config.enabled_servers,
        "filtered MCP servers by enabled_servers allowlist"
    );
}

// ─── Tests ───────────────────────────────────────────────────────────────────
