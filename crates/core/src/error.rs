//! Error types for the turnloop domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error enum; [`Error`] ties them together.

use std::time::Duration;
use thiserror::Error;

/// The top-level error type for turnloop operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("MCP error: {0}")]
    Mcp(#[from] McpError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Configuration error: {message}")]
    Config { message: String },

    /// A turn ended with an `error` event.
    #[error("Generation failed: {0}")]
    Generation(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

/// Failures of the generation transport. Any of these aborts the current turn.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("API error (status {status}): {body}")]
    Http { status: u16, body: String },

    #[error("max retries exceeded after {attempts} attempts (last retry delay {last_delay:?})")]
    RetriesExhausted { attempts: u32, last_delay: Duration },

    #[error("Authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Failed to decode response: {0}")]
    Decode(String),

    #[error("generation cancelled")]
    Cancelled,
}

/// Credential lookup or refresh failure.
#[derive(Debug, Clone, Error)]
pub enum AuthError {
    #[error("no credentials configured")]
    Missing,

    #[error("credential refresh failed: {0}")]
    Refresh(String),
}

/// Failures of a single tool call. The engine converts these into result text.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    NotFound(String),

    #[error("invalid arguments for {tool_name}: {reason}")]
    InvalidArguments { tool_name: String, reason: String },

    #[error("{tool_name} failed: {reason}")]
    ExecutionFailed { tool_name: String, reason: String },

    #[error(
        "tool {0:?} is not allowed in Plan Mode. Only read-only tools are available."
    )]
    PlanModeViolation(String),

    #[error("{0}")]
    Mcp(#[from] McpError),

    #[error("tool execution cancelled")]
    Cancelled,
}

impl ToolError {
    pub fn invalid(tool_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidArguments {
            tool_name: tool_name.into(),
            reason: reason.into(),
        }
    }

    pub fn failed(tool_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ExecutionFailed {
            tool_name: tool_name.into(),
            reason: reason.into(),
        }
    }
}

/// Failures talking to an MCP server.
#[derive(Debug, Error)]
pub enum McpError {
    #[error("failed to start MCP server {server:?}: {reason}")]
    Spawn { server: String, reason: String },

    #[error("connection to MCP server closed: {0}")]
    ConnectionClosed(String),

    #[error("malformed JSON-RPC message: {0}")]
    Protocol(String),

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("tool error: {0}")]
    ToolFailed(String),

    #[error("MCP {operation} timed out after {timeout_secs}s")]
    Timeout {
        operation: String,
        timeout_secs: u64,
    },

    #[error("MCP server {0:?} not connected")]
    NotConnected(String),

    #[error("MCP server {0:?} not found in config")]
    UnknownServer(String),

    #[error("{0}")]
    Unsupported(String),
}

impl McpError {
    /// Whether the connection this error came from can no longer be used.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::ConnectionClosed(_) | Self::Protocol(_) | Self::Timeout { .. }
        )
    }
}

/// Errors returned synchronously by the conversation engine's public API.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("a generation is already in progress")]
    Busy,

    #[error("failed to read attachment {path}: {reason}")]
    Attachment { path: String, reason: String },
}
