//! MCP (Model Context Protocol) client support.
//!
//! External tool servers run as child processes and speak JSON-RPC 2.0 over
//! newline-delimited stdio.
//!
//! - [`McpClient`]: one connection, handshake, tool catalog, `tools/call`
//! - [`McpManager`]: the configured server table and its live connections
//! - [`protocol`]: JSON-RPC and MCP message shapes

pub mod client;
pub mod manager;
pub mod protocol;

pub use client::McpClient;
pub use manager::{McpManager, McpServerStatus};
pub use protocol::{McpToolDefinition, PROTOCOL_VERSION, ServerInfo};
