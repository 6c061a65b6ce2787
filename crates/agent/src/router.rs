//! Tool routing between the built-in set and connected MCP servers.
//!
//! MCP tools are exported to the model as `<server>__<tool>`, with both halves
//! reduced to `[A-Za-z0-9_]`. Resolution walks the same order as export so
//! the name the model sees always maps back to the tool that was declared.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use turnloop_core::{BuiltinToolProvider, FunctionDeclaration, ToolArgs, ToolError};
use turnloop_mcp::McpManager;

/// Separator between the server and tool halves of an exported MCP name.
pub const MCP_SEPARATOR: &str = "__";

/// Schema keys the model API rejects.
const UNSUPPORTED_SCHEMA_KEYS: [&str; 6] = [
    "$schema",
    "$id",
    "$comment",
    "$defs",
    "definitions",
    "additionalProperties",
];

/// Where a tool call goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Builtin(String),
    Mcp { server: String, tool: String },
}

/// Replace every character outside `[A-Za-z0-9_]` with `_`.
pub fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

/// Exported names for `server` start with this. Trailing underscores of the
/// sanitized server name are trimmed so the separator stays a clean `__`.
pub fn export_prefix(server: &str) -> String {
    let server = sanitize(server);
    format!("{}{MCP_SEPARATOR}", server.trim_end_matches('_'))
}

/// The exported name of `tool` on `server`.
pub fn export_name(server: &str, tool: &str) -> String {
    format!("{}{}", export_prefix(server), sanitize(tool))
}

/// Strip unsupported keys from a JSON schema, recursing into nested schemas.
pub fn scrub_schema(schema: Option<&Value>) -> Value {
    match schema {
        Some(Value::Object(map)) => Value::Object(scrub_object(map)),
        _ => serde_json::json!({"type": "object", "properties": {}}),
    }
}

fn scrub_object(map: &Map<String, Value>) -> Map<String, Value> {
    let mut out = Map::new();
    for (key, value) in map {
        if UNSUPPORTED_SCHEMA_KEYS.contains(&key.as_str()) {
            continue;
        }
        let cleaned = match (key.as_str(), value) {
            ("properties", Value::Object(props)) => Value::Object(
                props
                    .iter()
                    .map(|(name, prop)| (name.clone(), scrub_value(prop)))
                    .collect(),
            ),
            ("items", v) => scrub_value(v),
            ("anyOf" | "oneOf" | "allOf", Value::Array(variants)) => {
                Value::Array(variants.iter().map(scrub_value).collect())
            }
            _ => value.clone(),
        };
        out.insert(key.clone(), cleaned);
    }
    out
}

fn scrub_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(scrub_object(map)),
        other => other.clone(),
    }
}

/// Routes tool calls to built-ins or MCP servers.
#[derive(Clone)]
pub struct ToolRouter {
    builtins: Arc<dyn BuiltinToolProvider>,
    mcp: Arc<McpManager>,
}

impl ToolRouter {
    pub fn new(builtins: Arc<dyn BuiltinToolProvider>, mcp: Arc<McpManager>) -> Self {
        Self { builtins, mcp }
    }

    pub fn mcp(&self) -> &Arc<McpManager> {
        &self.mcp
    }

    /// Declarations offered to the model.
    ///
    /// Plan mode offers only the built-in read-only tools. Otherwise built-ins
    /// come first, then each connected server's catalog in server-name order.
    /// An exported name that collides with an earlier one is dropped.
    pub fn declarations(&self, plan_mode: bool) -> Vec<FunctionDeclaration> {
        if plan_mode {
            return self.builtins.read_only_declarations();
        }

        let mut decls = self.builtins.declarations();
        let mut seen: HashSet<String> = decls.iter().map(|d| d.name.clone()).collect();

        for (server, client) in self.mcp.connected() {
            for tool in client.tools() {
                let name = export_name(&server, &tool.name);
                if !seen.insert(name.clone()) {
                    warn!(
                        server = %server,
                        tool = %tool.name,
                        exported = %name,
                        "MCP tool name collides after sanitization; keeping the first"
                    );
                    continue;
                }
                decls.push(FunctionDeclaration::new(
                    name,
                    tool.description.clone(),
                    scrub_schema(tool.input_schema.as_ref()),
                ));
            }
        }
        decls
    }

    /// Map an exported name back to its owner.
    pub fn resolve(&self, name: &str) -> Result<Route, ToolError> {
        if self.builtins.contains(name) {
            return Ok(Route::Builtin(name.to_string()));
        }

        for (server, client) in self.mcp.connected() {
            let Some(rest) = name.strip_prefix(&export_prefix(&server)) else {
                continue;
            };
            if let Some(tool) = client.tools().iter().find(|t| sanitize(&t.name) == rest) {
                return Ok(Route::Mcp {
                    server,
                    tool: tool.name.clone(),
                });
            }
        }
        Err(ToolError::NotFound(name.to_string()))
    }

    /// Resolve and execute a tool call.
    pub async fn dispatch(
        &self,
        cancel: CancellationToken,
        work_dir: &Path,
        name: &str,
        args: &ToolArgs,
    ) -> Result<String, ToolError> {
        match self.resolve(name)? {
            Route::Builtin(tool) => self.builtins.execute(cancel, work_dir, &tool, args).await,
            Route::Mcp { server, tool } => {
                debug!(server = %server, tool = %tool, "Dispatching MCP tool");
                tokio::select! {
                    _ = cancel.cancelled() => {
                        warn!(server = %server, tool = %tool, "MCP call abandoned on cancellation");
                        Err(ToolError::Cancelled)
                    }
                    res = self.mcp.call_tool(&server, &tool, args) => Ok(res?),
                }
            }
        }
    }

    /// Whether `name` may run in plan mode. MCP tools never may.
    pub fn is_plan_mode_tool(&self, name: &str) -> bool {
        self.builtins.is_read_only(name)
    }
}
