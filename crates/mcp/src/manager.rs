//! The configured MCP server table and its live connections.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use turnloop_config::{AppConfig, McpServerConfig};
use turnloop_core::{McpError, ToolArgs};

use crate::client::McpClient;

/// Status of one configured server, for listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct McpServerStatus {
    pub name: String,
    pub connected: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub tool_count: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Owns every MCP connection.
///
/// The maps are keyed by server name, so iteration (and therefore tool
/// export order) follows name order.
pub struct McpManager {
    configs: RwLock<BTreeMap<String, McpServerConfig>>,
    clients: RwLock<BTreeMap<String, Arc<McpClient>>>,
    errors: RwLock<BTreeMap<String, String>>,
    init_timeout: Duration,
}

impl Default for McpManager {
    fn default() -> Self {
        Self::new(BTreeMap::new(), Duration::from_secs(30))
    }
}

impl McpManager {
    pub fn new(servers: BTreeMap<String, McpServerConfig>, init_timeout: Duration) -> Self {
        Self {
            configs: RwLock::new(servers),
            clients: RwLock::new(BTreeMap::new()),
            errors: RwLock::new(BTreeMap::new()),
            init_timeout,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(config.mcp_servers.clone(), config.mcp.init_timeout())
    }

    /// (Re)connect one configured server. Any existing connection is closed first.
    pub async fn connect_server(&self, name: &str) -> Result<(), McpError> {
        let config = self
            .configs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
            .ok_or_else(|| McpError::UnknownServer(name.to_string()))?;

        self.disconnect_server(name).await;

        match McpClient::spawn(name, &config, self.init_timeout).await {
            Ok(client) => {
                self.clients
                    .write()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(name.to_string(), Arc::new(client));
                Ok(())
            }
            Err(e) => {
                warn!(server = name, error = %e, "Failed to connect MCP server");
                self.record_error(name, &e);
                Err(e)
            }
        }
    }

    /// Close one server's connection, if any, and clear its recorded error.
    pub async fn disconnect_server(&self, name: &str) {
        let client = self
            .clients
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name);
        self.errors
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name);
        if let Some(client) = client {
            client.close().await;
            info!(server = name, "MCP server disconnected");
        }
    }

    /// Connect every configured server. Failures are recorded per server and
    /// returned; they never stop the remaining servers from connecting.
    pub async fn connect_all(&self) -> Vec<(String, McpError)> {
        let names: Vec<String> = self
            .configs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();

        let mut failures = Vec::new();
        for name in names {
            if let Err(e) = self.connect_server(&name).await {
                failures.push((name, e));
            }
        }
        failures
    }

    pub async fn disconnect_all(&self) {
        let clients = std::mem::take(&mut *self.clients.write().unwrap_or_else(|e| e.into_inner()));
        for (name, client) in clients {
            client.close().await;
            info!(server = %name, "MCP server disconnected");
        }
    }

    /// Add or replace a server in the table. Does not connect it.
    pub fn add_server(&self, name: impl Into<String>, config: McpServerConfig) {
        self.configs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.into(), config);
    }

    /// Disconnect a server and drop it from the table.
    pub async fn remove_server(&self, name: &str) {
        self.disconnect_server(name).await;
        self.configs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name);
    }

    /// Register an already-connected client under `name`.
    pub fn attach(&self, name: impl Into<String>, client: McpClient) {
        let name = name.into();
        self.errors
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&name);
        self.clients
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name, Arc::new(client));
    }

    /// Status of every configured, attached or failed server, in name order.
    pub fn list_servers(&self) -> Vec<McpServerStatus> {
        let configs = self.configs.read().unwrap_or_else(|e| e.into_inner());
        let clients = self.clients.read().unwrap_or_else(|e| e.into_inner());
        let errors = self.errors.read().unwrap_or_else(|e| e.into_inner());

        let mut names: Vec<&String> = configs
            .keys()
            .chain(clients.keys())
            .chain(errors.keys())
            .collect();
        names.sort();
        names.dedup();

        names
            .into_iter()
            .map(|name| {
                let config = configs.get(name);
                let client = clients.get(name);
                let tools: Vec<String> = client
                    .map(|c| c.tools().iter().map(|t| t.name.clone()).collect())
                    .unwrap_or_default();
                McpServerStatus {
                    name: name.clone(),
                    connected: client.is_some(),
                    command: config.map(|c| c.command.clone()).unwrap_or_default(),
                    url: config.and_then(|c| c.url.clone()),
                    tool_count: tools.len(),
                    tools,
                    error: errors.get(name).cloned(),
                }
            })
            .collect()
    }

    /// Connected clients in name order.
    pub fn connected(&self) -> Vec<(String, Arc<McpClient>)> {
        self.clients
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(name, client)| (name.clone(), client.clone()))
            .collect()
    }

    pub fn client(&self, name: &str) -> Option<Arc<McpClient>> {
        self.clients
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    /// Call `tool` on `server`. A connection-level failure drops the client.
    pub async fn call_tool(
        &self,
        server: &str,
        tool: &str,
        args: &ToolArgs,
    ) -> Result<String, McpError> {
        let client = self
            .client(server)
            .ok_or_else(|| McpError::NotConnected(server.to_string()))?;

        let result = client.call_tool(tool, args).await;
        if let Err(e) = &result {
            if e.is_connection_error() {
                warn!(server, error = %e, "Dropping broken MCP connection");
                let removed = {
                    let mut clients = self.clients.write().unwrap_or_else(|e| e.into_inner());
                    let same = clients
                        .get(server)
                        .is_some_and(|current| Arc::ptr_eq(current, &client));
                    if same { clients.remove(server) } else { None }
                };
                self.record_error(server, e);
                if let Some(removed) = removed {
                    removed.close().await;
                }
            }
        }
        result
    }

    fn record_error(&self, name: &str, err: &McpError) {
        self.errors
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), err.to_string());
    }
}
