//! MCP Client error types.

use thiserror::Error;

use super::connection::ConnectionState;

/// Errors that can occur during MCP client operations.
#[derive(Debug, Clone, Error)]
pub enum McpError {
    /// A server process failed to start, or exited before the handshake completed.
    #[error("failed to launch server '{name}': {reason}")]
    SpawnFailed { name: String, reason: String },

    /// The initialization handshake failed (error payload, bad result, or timeout).
    #[error("server '{name}' initialization failed: {reason}")]
    InitFailed { name: String, reason: String },

    /// A line from the server could not be parsed as a JSON-RPC message.
    #[error("framing error from server '{server}': {reason}")]
    Framing { server: String, reason: String },

    /// JSON-RPC communication error (closed stream, write failure, corrupted framing).
    #[error("transport error for server '{server}': {reason}")]
    TransportError { server: String, reason: String },

    /// Server returned a JSON-RPC error response.
    #[error("server '{server}' returned error for '{method}' [{code}]: {message}")]
    ServerError {
        server: String,
        method: String,
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// No response arrived before the per-request deadline.
    #[error("'{method}' on server '{server}' timed out after {timeout_ms}ms")]
    Timeout {
        server: String,
        method: String,
        timeout_ms: u64,
    },

    /// Tool not found in the aggregated registry.
    #[error("unknown tool: '{name}'")]
    UnknownTool { name: String },

    /// The connection is not in a state that permits the operation.
    #[error("server '{name}' is not ready (state: {state})")]
    NotReady { name: String, state: ConnectionState },

    /// Every configured server failed during initialization.
    #[error("no MCP servers available: {}", summarize(.failures))]
    NoServersAvailable { failures: Vec<(String, String)> },

    /// Configuration error (missing servers, bad config file).
    #[error("config error: {reason}")]
    ConfigError { reason: String },

    /// `initialize` was called while servers are still running.
    #[error("client already initialized with {running} running server(s); shut down first")]
    AlreadyInitialized { running: usize },

    /// One or more servers could not be closed cleanly.
    #[error("shutdown failed for {} server(s): {}", .failures.len(), summarize(.failures))]
    ShutdownFailed { failures: Vec<(String, String)> },
}

impl McpError {
    /// Whether this error indicates the connection itself is broken.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            McpError::TransportError { .. } | McpError::Framing { .. }
        )
    }
}

fn summarize(failures: &[(String, String)]) -> String {
    failures
        .iter()
        .map(|(name, reason)| format!("{name}: {reason}"))
        .collect::<Vec<_>>()
        .join("; ")
}

/// The single failure type reported to callers of `McpClient::call_tool`.
///
/// Carries the original diagnostic text verbatim so an operator can see which
/// server and method failed, without exposing the internal error taxonomy.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("tool '{tool}' failed: {message}")]
pub struct ToolCallError {
    pub tool: String,
    pub message: String,
}

impl ToolCallError {
    pub(crate) fn new(tool: &str, source: &McpError) -> Self {
        Self {
            tool: tool.to_string(),
            message: source.to_string(),
        }
    }
}
