//! Tool registry — aggregates tool definitions across all MCP servers.
//!
//! Provides:
//! - One flat namespace of tool names across every connected server
//! - Resolution of a tool name to the server that owns it
//! - Collision reporting when uncoordinated servers export the same name
//!
//! The registry performs no I/O and can be rebuilt at any time by re-running
//! discovery.

use std::collections::{HashMap, HashSet};

use super::errors::McpError;
use super::types::{McpToolDefinition, ToolInfo};

/// Record of a tool name that moved from one server to another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCollision {
    pub tool: String,
    pub previous_server: String,
    pub new_server: String,
}

// ─── ToolRegistry ────────────────────────────────────────────────────────────

/// Aggregated tool registry across all MCP servers.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    /// `tool_name → (server_name, definition)`.
    tools: HashMap<String, (String, McpToolDefinition)>,
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register tools from a server.
    ///
    /// A name already owned by a different server is taken over by this one
    /// (last registration wins) and reported in the returned list.
    pub fn register(
        &mut self,
        server_name: &str,
        tools: Vec<McpToolDefinition>,
    ) -> Vec<ToolCollision> {
        let mut collisions = Vec::new();

        for tool in tools {
            let name = tool.name.clone();
            let previous = self
                .tools
                .insert(name.clone(), (server_name.to_string(), tool));

            match previous {
                Some((previous_server, _)) if previous_server != server_name => {
                    tracing::warn!(
                        tool = %name,
                        previous_server = %previous_server,
                        new_server = server_name,
                        "tool name collision; last registered server wins"
                    );
                    collisions.push(ToolCollision {
                        tool: name,
                        previous_server,
                        new_server: server_name.to_string(),
                    });
                }
                _ => {
                    tracing::debug!(tool = %name, server = server_name, "registered tool");
                }
            }
        }

        collisions
    }

    /// Resolve a tool name to its owning server.
    pub fn resolve(&self, tool_name: &str) -> Result<&str, McpError> {
        self.tools
            .get(tool_name)
            .map(|(srv, _)| srv.as_str())
            .ok_or_else(|| McpError::UnknownTool {
                name: tool_name.to_string(),
            })
    }

    /// Remove all tools belonging to a server.
    pub fn unregister_server(&mut self, server_name: &str) {
        self.tools.retain(|_, (srv, _)| srv != server_name);
    }

    /// Look up a tool definition by name.
    pub fn get_tool(&self, name: &str) -> Option<&McpToolDefinition> {
        self.tools.get(name).map(|(_, def)| def)
    }

    /// Every registered tool tagged with its server, sorted by name.
    pub fn all_tools(&self) -> Vec<ToolInfo> {
        let mut tools: Vec<ToolInfo> = self
            .tools
            .iter()
            .map(|(name, (server, def))| ToolInfo {
                name: name.clone(),
                description: def.description.clone(),
                schema: def.input_schema.clone(),
                server: server.clone(),
            })
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    /// Return all registered tool names.
    pub fn tool_names(&self) -> Vec<&str> {
        self.tools.keys().map(|k| k.as_str()).collect()
    }

    /// Number of registered tools.
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Count tools belonging to a specific server.
    pub fn tools_for_server(&self, server_name: &str) -> usize {
        self.tools
            .values()
            .filter(|(srv, _)| srv == server_name)
            .count()
    }

    /// Retain only tools whose names appear in the allowlist.
    pub fn retain_tools(&mut self, allowed: &HashSet<String>) {
        let before = self.tools.len();
        self.tools.retain(|name, _| allowed.contains(name));
        let after = self.tools.len();
        tracing::info!(before, after, "filtered tool registry by enabled_tools allowlist");
    }

    /// Return all unique server names.
    pub fn server_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .tools
            .values()
            .map(|(srv, _)| srv.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        names.sort();
        names
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
