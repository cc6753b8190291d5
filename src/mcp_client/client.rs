//! MCP Client — high-level interface for tool execution.
//!
//! Owns every server connection, builds the merged tool registry, and routes
//! tool calls to the server that owns each tool. This is the API used by the
//! orchestration layer: `initialize`, `list_tools`, `call_tool`, `shutdown`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;

use super::config;
use super::connection::{ConnectionOptions, ConnectionState, ServerConnection};
use super::errors::{McpError, ToolCallError};
use super::registry::ToolRegistry;
use super::types::{McpServersConfig, McpToolDefinition, ServerConfig, ToolInfo};

/// Outcome of `McpClient::initialize`.
#[derive(Debug)]
pub struct StartupReport {
    /// Servers that started and completed discovery, sorted by name.
    pub started: Vec<String>,
    /// Servers that failed, with the reason.
    pub failed: Vec<(String, McpError)>,
}

/// Operator-facing snapshot of one configured server.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub name: String,
    pub state: ConnectionState,
    pub tool_count: usize,
    pub pid: Option<u32>,
    pub ready_at: Option<DateTime<Utc>>,
    pub failure: Option<String>,
}

// ─── McpClient ───────────────────────────────────────────────────────────────

/// High-level MCP client that manages multiple servers and routes tool calls.
pub struct McpClient {
    options: ConnectionOptions,
    /// Server configurations (kept for reconnects).
    configs: HashMap<String, ServerConfig>,
    /// Live connections, including ones that failed after startup.
    servers: HashMap<String, Arc<ServerConnection>>,
    /// Aggregated tool definitions from all servers.
    registry: ToolRegistry,
    /// Optional `enabled_tools` allowlist applied after every discovery.
    enabled_tools: HashSet<String>,
}

impl McpClient {
    /// Create a client with explicit connection options.
    pub fn new(options: ConnectionOptions) -> Self {
        Self {
            options,
            configs: HashMap::new(),
            servers: HashMap::new(),
            registry: ToolRegistry::new(),
            enabled_tools: HashSet::new(),
        }
    }

    /// Create a client whose timeouts come from a configuration file.
    pub fn from_config(config: &McpServersConfig) -> Self {
        Self::new(ConnectionOptions::from_config(config))
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Start every configured server concurrently and build the registry.
    ///
    /// One server failing never prevents the others from starting. Fails
    /// with `NoServersAvailable` only when every server failed. The timeouts
    /// in `config` replace the ones the client was built with.
    pub async fn initialize(
        &mut self,
        config: &McpServersConfig,
    ) -> Result<StartupReport, McpError> {
        if !self.servers.is_empty() {
            return Err(McpError::AlreadyInitialized {
                running: self.servers.len(),
            });
        }

        config::validate(config)?;
        self.options = ConnectionOptions {
            client_info: self.options.client_info.clone(),
            ..ConnectionOptions::from_config(config)
        };
        let mut config = config.clone();
        config::filter_enabled_servers(&mut config);

        let mut names: Vec<String> = config.servers.keys().cloned().collect();
        names.sort();
        tracing::info!(count = names.len(), servers = ?names, "initializing MCP servers");

        let options = &self.options;
        let servers = &config.servers;
        let outcomes = join_all(names.iter().map(|name| async move {
            let outcome = start_and_discover(name, &servers[name], options).await;
            (name.clone(), outcome)
        }))
        .await;

        let mut started = Vec::new();
        let mut failed = Vec::new();
        for (name, outcome) in outcomes {
            match outcome {
                Ok((connection, tools)) => {
                    tracing::info!(server = %name, tools = tools.len(), "server ready");
                    self.registry.register(&name, tools);
                    self.servers.insert(name.clone(), connection);
                    started.push(name);
                }
                Err(e) => {
                    tracing::error!(server = %name, error = %e, "failed to initialize server");
                    failed.push((name, e));
                }
            }
        }

        self.configs = config.servers;
        self.enabled_tools = config.enabled_tools.into_iter().collect();
        self.apply_tool_allowlist();

        if started.is_empty() {
            return Err(McpError::NoServersAvailable {
                failures: failed
                    .into_iter()
                    .map(|(name, e)| (name, e.to_string()))
                    .collect(),
            });
        }

        tracing::info!(
            servers = started.len(),
            failed = failed.len(),
            tools = self.registry.len(),
            "MCP servers initialized"
        );
        Ok(StartupReport { started, failed })
    }

    /// Close every connection concurrently and clear the registry.
    ///
    /// All processes are released even when some closes fail; the failures
    /// are reported together. Calling this twice is harmless.
    pub async fn shutdown(&mut self) -> Result<(), McpError> {
        let servers: Vec<(String, Arc<ServerConnection>)> = self.servers.drain().collect();
        self.registry = ToolRegistry::new();

        if servers.is_empty() {
            return Ok(());
        }
        tracing::info!(count = servers.len(), "shutting down all MCP servers");

        let results = join_all(servers.iter().map(|(name, connection)| async move {
            (name.clone(), connection.close().await)
        }))
        .await;

        let failures: Vec<(String, String)> = results
            .into_iter()
            .filter_map(|(name, result)| result.err().map(|e| (name, e.to_string())))
            .collect();

        if failures.is_empty() {
            Ok(())
        } else {
            for (name, reason) in &failures {
                tracing::error!(server = %name, error = %reason, "error stopping server");
            }
            Err(McpError::ShutdownFailed { failures })
        }
    }

    /// Restart one server from its stored configuration and re-register its tools.
    ///
    /// This is how a connection that failed at runtime is brought back.
    pub async fn reconnect(&mut self, name: &str) -> Result<(), McpError> {
        let config = self
            .configs
            .get(name)
            .cloned()
            .ok_or_else(|| McpError::ConfigError {
                reason: format!("no configuration for server '{name}'"),
            })?;

        self.registry.unregister_server(name);
        if let Some(old) = self.servers.remove(name) {
            if let Err(e) = old.close().await {
                tracing::warn!(server = name, error = %e, "error closing previous connection");
            }
        }

        let (connection, tools) = start_and_discover(name, &config, &self.options).await?;
        self.registry.register(name, tools);
        self.servers.insert(name.to_string(), connection);
        self.apply_tool_allowlist();

        tracing::info!(server = name, "server reconnected");
        Ok(())
    }

    /// Re-run discovery on every ready server and rebuild the registry.
    ///
    /// Returns the servers whose discovery failed; their tools are dropped.
    pub async fn refresh_tools(&mut self) -> Vec<(String, McpError)> {
        let mut ready: Vec<(&String, &Arc<ServerConnection>)> = self
            .servers
            .iter()
            .filter(|(_, c)| c.state() == ConnectionState::Ready)
            .collect();
        ready.sort_by(|a, b| a.0.cmp(b.0));

        let results = join_all(ready.into_iter().map(|(name, connection)| async move {
            (name.clone(), connection.discover_tools().await)
        }))
        .await;

        let mut registry = ToolRegistry::new();
        let mut failures = Vec::new();
        for (name, result) in results {
            match result {
                Ok(tools) => {
                    registry.register(&name, tools);
                }
                Err(e) => {
                    tracing::warn!(server = %name, error = %e, "tool discovery failed during refresh");
                    failures.push((name, e));
                }
            }
        }

        self.registry = registry;
        self.apply_tool_allowlist();
        failures
    }

    fn apply_tool_allowlist(&mut self) {
        if !self.enabled_tools.is_empty() {
            self.registry.retain_tools(&self.enabled_tools);
        }
    }

    // ─── Tool Execution ──────────────────────────────────────────────────

    /// The merged tool catalog, each entry tagged with its owning server.
    pub fn list_tools(&self) -> Vec<ToolInfo> {
        self.registry.all_tools()
    }

    /// Execute a tool call, routing to the server that owns the tool.
    ///
    /// Every failure (unknown tool, RPC error, timeout, dead connection) is
    /// reported as a `ToolCallError` carrying the original message.
    pub async fn call_tool(
        &self,
        tool_name: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, ToolCallError> {
        let connection = self
            .route(tool_name)
            .map_err(|e| ToolCallError::new(tool_name, &e))?;

        connection
            .invoke(tool_name, arguments)
            .await
            .map_err(|e| {
                if e.is_transport() {
                    tracing::error!(
                        server = %connection.name(),
                        tool = tool_name,
                        error = %e,
                        "server connection lost; reconnect required"
                    );
                }
                ToolCallError::new(tool_name, &e)
            })
    }

    fn route(&self, tool_name: &str) -> Result<Arc<ServerConnection>, McpError> {
        let server_name = self.registry.resolve(tool_name)?;
        self.servers
            .get(server_name)
            .cloned()
            .ok_or_else(|| McpError::TransportError {
                server: server_name.to_string(),
                reason: "server not running".into(),
            })
    }

    /// Read-only access to the aggregated registry.
    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    // ─── Status ──────────────────────────────────────────────────────────

    /// Get the number of live connections (including failed ones not yet closed).
    pub fn running_server_count(&self) -> usize {
        self.servers.len()
    }

    /// Get the number of registered tools.
    pub fn tool_count(&self) -> usize {
        self.registry.len()
    }

    /// Check if a specific server is connected and ready.
    pub fn is_server_running(&self, name: &str) -> bool {
        self.servers
            .get(name)
            .is_some_and(|c| c.state() == ConnectionState::Ready)
    }

    /// Get a sorted list of ready server names.
    pub fn running_servers(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .servers
            .iter()
            .filter(|(_, c)| c.state() == ConnectionState::Ready)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Get names of all configured servers (including those that failed to start).
    pub fn configured_servers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.configs.keys().cloned().collect();
        names.sort();
        names
    }

    /// Status of every configured server, sorted by name.
    pub fn server_status(&self) -> Vec<ServerStatus> {
        self.configured_servers()
            .into_iter()
            .map(|name| match self.servers.get(&name) {
                Some(c) => ServerStatus {
                    tool_count: self.registry.tools_for_server(&name),
                    state: c.state(),
                    pid: c.pid(),
                    ready_at: c.ready_at(),
                    failure: c.failure(),
                    name,
                },
                None => ServerStatus {
                    name,
                    state: ConnectionState::Failed,
                    tool_count: 0,
                    pid: None,
                    ready_at: None,
                    failure: Some("not running".into()),
                },
            })
            .collect()
    }
}

impl Default for McpClient {
    fn default() -> Self {
        Self::new(ConnectionOptions::default())
    }
}

/// Start one server and fetch its catalog. A server that starts but fails
/// discovery is closed before the error is returned.
async fn start_and_discover(
    name: &str,
    config: &ServerConfig,
    options: &ConnectionOptions,
) -> Result<(Arc<ServerConnection>, Vec<McpToolDefinition>), McpError> {
    let connection = Arc::new(ServerConnection::new(name, config.clone(), options.clone()));
    connection.start().await?;

    match connection.discover_tools().await {
        Ok(tools) => Ok((connection, tools)),
        Err(e) => {
            if let Err(close_err) = connection.close().await {
                tracing::warn!(server = name, error = %close_err, "error closing server after failed discovery");
            }
            Err(e)
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
