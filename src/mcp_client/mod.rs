//! MCP Client — JSON-RPC over stdio transport for MCP server management.
//!
//! This module handles:
//! - Spawning MCP server child processes and performing the protocol handshake
//! - Line-delimited JSON-RPC 2.0 with id-based response demultiplexing
//! - Tool discovery and aggregation across all servers
//! - Routing tool calls to the server that owns each tool
//! - Server lifecycle (concurrent startup, reconnect, bounded shutdown)

pub mod client;
pub mod config;
pub mod connection;
pub mod errors;
pub mod registry;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use client::{McpClient, ServerStatus, StartupReport};
pub use connection::{ConnectionOptions, ConnectionState, ServerConnection};
pub use errors::{McpError, ToolCallError};
pub use registry::{ToolCollision, ToolRegistry};
pub use types::{McpServersConfig, McpToolDefinition, ServerConfig, ToolInfo};
