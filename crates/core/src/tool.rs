//! Tool declarations and the built-in tool capability.
//!
//! Tools are what give the agent the ability to act in the world. Built-in
//! tools are reached through [`BuiltinToolProvider`]; externally hosted tools
//! come from MCP servers and are routed by the agent crate.

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::content::ToolArgs;
use crate::error::ToolError;

/// A tool declaration sent to the model so it knows what it can call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDeclaration {
    /// The tool name as the model sees it
    pub name: String,

    /// Description of what the tool does
    #[serde(default)]
    pub description: String,

    /// JSON Schema describing the tool's parameters
    pub parameters: serde_json::Value,
}

impl FunctionDeclaration {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

/// The built-in tool set.
///
/// `execute` returns the text fed back to the model; the engine wraps errors
/// as `"Error: ..."` results rather than aborting the turn.
#[async_trait]
pub trait BuiltinToolProvider: Send + Sync {
    /// Declarations for every built-in tool, in a stable order.
    fn declarations(&self) -> Vec<FunctionDeclaration>;

    /// Whether `name` is a built-in tool.
    fn contains(&self, name: &str) -> bool;

    /// Whether `name` is on the read-only allow-list used in plan mode.
    fn is_read_only(&self, name: &str) -> bool;

    async fn execute(
        &self,
        cancel: CancellationToken,
        work_dir: &Path,
        name: &str,
        args: &ToolArgs,
    ) -> std::result::Result<String, ToolError>;

    /// Declarations restricted to the read-only allow-list.
    fn read_only_declarations(&self) -> Vec<FunctionDeclaration> {
        self.declarations()
            .into_iter()
            .filter(|d| self.is_read_only(&d.name))
            .collect()
    }
}
