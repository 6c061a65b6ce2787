//! # turnloop core
//!
//! Domain types, traits, and error definitions shared by every turnloop crate.
//! Nothing here talks to the network or spawns processes; the transport, MCP
//! client, built-in tools and engine crates implement against these types.
//!
//! ## Layout
//!
//! - [`content`]: `Content` / `Part`, the unit of conversation history
//! - [`generation`]: generation requests, stream events and the [`Transport`] trait
//! - [`tool`]: function declarations and the built-in tool capability
//! - [`session`]: display messages and persisted session snapshots
//! - [`auth`]: the credential capability consumed by the transport

pub mod auth;
pub mod content;
pub mod error;
pub mod generation;
pub mod session;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use auth::{CredentialProvider, StaticCredentials};
pub use content::{Content, FunctionCall, FunctionResponse, InlineData, Part, Role, ToolArgs};
pub use error::{AuthError, EngineError, Error, McpError, Result, ToolError, TransportError};
pub use generation::{
    GenerateRequest, GenerateResponse, GenerationConfig, StreamEvent, ThinkingConfig, Transport,
    Usage,
};
pub use session::{DisplayMessage, DisplayRole, Session};
pub use tool::{BuiltinToolProvider, FunctionDeclaration};
