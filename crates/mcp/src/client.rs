//! MCP client over newline-delimited JSON-RPC on a child's stdio.
//!
//! One request is in flight at a time: the writer and reader sit behind a
//! single async mutex, and a call writes its line then reads until the
//! matching response arrives.

use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use turnloop_config::McpServerConfig;
use turnloop_core::{McpError, ToolArgs};

use crate::protocol::{
    InitializeResult, JsonRpcMessage, JsonRpcRequest, McpToolCallResult, McpToolDefinition,
    PROTOCOL_VERSION, ServerInfo, ToolsListResult,
};

const CLIENT_NAME: &str = env!("CARGO_PKG_NAME");
const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");
const CLOSE_GRACE: Duration = Duration::from_secs(2);

type Reader = BufReader<Box<dyn AsyncRead + Send + Unpin>>;
type Writer = Box<dyn AsyncWrite + Send + Unpin>;

struct Connection {
    reader: Reader,
    writer: Writer,
}

impl Connection {
    async fn write_message(&mut self, request: &JsonRpcRequest<'_>) -> Result<(), McpError> {
        let mut line = serde_json::to_vec(request)
            .map_err(|e| McpError::Protocol(format!("failed to encode request: {e}")))?;
        line.push(b'\n');
        self.writer
            .write_all(&line)
            .await
            .map_err(|e| McpError::ConnectionClosed(format!("failed to write request: {e}")))?;
        self.writer
            .flush()
            .await
            .map_err(|e| McpError::ConnectionClosed(format!("failed to write request: {e}")))
    }

    /// Read lines until the response for `id` arrives, skipping notifications.
    async fn read_response(&mut self, server: &str, id: u64) -> Result<Value, McpError> {
        let mut line = String::new();
        loop {
            line.clear();
            let n = self
                .reader
                .read_line(&mut line)
                .await
                .map_err(|e| McpError::ConnectionClosed(format!("failed to read response: {e}")))?;
            if n == 0 {
                return Err(McpError::ConnectionClosed("EOF while reading response".into()));
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let message: JsonRpcMessage = serde_json::from_str(trimmed)
                .map_err(|e| McpError::Protocol(format!("failed to parse response: {e}")))?;

            if message.is_notification() {
                debug!(server, method = ?message.method, "Skipping server notification");
                continue;
            }
            if message.is_server_request() {
                debug!(server, method = ?message.method, "Ignoring server-initiated request");
                continue;
            }
            if message.id.as_ref().and_then(Value::as_u64).is_some_and(|n| n < id) {
                debug!(server, stale = ?message.id, "Skipping reply to an abandoned request");
                continue;
            }
            if !message.id_matches(id) && !message.is_unaddressed_response() {
                return Err(McpError::Protocol(format!(
                    "expected response id {id}, got {:?}",
                    message.id
                )));
            }
            if let Some(err) = message.error {
                return Err(McpError::Rpc {
                    code: err.code,
                    message: err.message,
                });
            }
            return Ok(message.result.unwrap_or(Value::Null));
        }
    }
}

/// A live connection to one MCP server.
pub struct McpClient {
    name: String,
    conn: Mutex<Option<Connection>>,
    child: StdMutex<Option<Child>>,
    next_id: AtomicU64,
    broken: AtomicBool,
    server_info: ServerInfo,
    tools: Vec<McpToolDefinition>,
}

impl std::fmt::Debug for McpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpClient")
            .field("name", &self.name)
            .field("server_info", &self.server_info)
            .field("tools", &self.tools.len())
            .field("broken", &self.is_broken())
            .finish()
    }
}

impl McpClient {
    /// Spawn the configured server and run the handshake.
    pub async fn spawn(
        name: &str,
        config: &McpServerConfig,
        init_timeout: Duration,
    ) -> Result<Self, McpError> {
        if config.command.is_empty() {
            return Err(McpError::Unsupported(format!(
                "server {name:?} has no command configured (HTTP transport not supported)"
            )));
        }

        let mut command = Command::new(&config.command);
        command
            .args(&config.args)
            .envs(&config.env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &config.cwd {
            command.current_dir(cwd);
        }

        let mut child = command.spawn().map_err(|e| McpError::Spawn {
            server: name.to_string(),
            reason: e.to_string(),
        })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(McpError::Spawn {
                server: name.to_string(),
                reason: "child stdio was not captured".into(),
            });
        };

        if let Some(stderr) = child.stderr.take() {
            let server = name.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(server = %server, "{line}");
                }
            });
        }

        debug!(server = name, command = %config.command, "Spawned MCP server");
        Self::connect(name, Box::new(stdout), Box::new(stdin), Some(child), init_timeout).await
    }

    /// Run the handshake over arbitrary streams (used with in-memory pipes).
    pub async fn from_streams<R, W>(
        name: &str,
        reader: R,
        writer: W,
        init_timeout: Duration,
    ) -> Result<Self, McpError>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::connect(name, Box::new(reader), Box::new(writer), None, init_timeout).await
    }

    async fn connect(
        name: &str,
        reader: Box<dyn AsyncRead + Send + Unpin>,
        writer: Writer,
        child: Option<Child>,
        init_timeout: Duration,
    ) -> Result<Self, McpError> {
        let mut client = Self {
            name: name.to_string(),
            conn: Mutex::new(Some(Connection {
                reader: BufReader::new(reader),
                writer,
            })),
            child: StdMutex::new(child),
            next_id: AtomicU64::new(1),
            broken: AtomicBool::new(false),
            server_info: ServerInfo::default(),
            tools: Vec::new(),
        };

        let outcome = tokio::time::timeout(init_timeout, client.handshake()).await;
        match outcome {
            Ok(Ok((info, tools))) => {
                info!(
                    server = name,
                    server_name = %info.name,
                    server_version = %info.version,
                    tools = tools.len(),
                    "MCP server connected"
                );
                client.server_info = info;
                client.tools = tools;
                Ok(client)
            }
            Ok(Err(e)) => {
                client.close().await;
                Err(e)
            }
            Err(_) => {
                client.close().await;
                Err(McpError::Timeout {
                    operation: "initialize".into(),
                    timeout_secs: init_timeout.as_secs(),
                })
            }
        }
    }

    async fn handshake(&self) -> Result<(ServerInfo, Vec<McpToolDefinition>), McpError> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": { "name": CLIENT_NAME, "version": CLIENT_VERSION },
        });
        let result = self.call("initialize", Some(params)).await?;
        let init: InitializeResult = serde_json::from_value(result)
            .map_err(|e| McpError::Protocol(format!("failed to parse initialize result: {e}")))?;
        debug!(server = %self.name, protocol = %init.protocol_version, "Initialize acknowledged");

        self.notify("notifications/initialized", None).await?;

        let result = self.call("tools/list", None).await?;
        let list: ToolsListResult = serde_json::from_value(result)
            .map_err(|e| McpError::Protocol(format!("failed to parse tools: {e}")))?;

        Ok((init.server_info, list.tools))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn server_info(&self) -> &ServerInfo {
        &self.server_info
    }

    /// The catalog fetched during the handshake.
    pub fn tools(&self) -> &[McpToolDefinition] {
        &self.tools
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.iter().any(|t| t.name == name)
    }

    /// Whether a connection-level failure made this client unusable.
    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::SeqCst)
    }

    /// Invoke a tool, returning its concatenated text output.
    pub async fn call_tool(&self, name: &str, args: &ToolArgs) -> Result<String, McpError> {
        debug!(server = %self.name, tool = name, "Calling MCP tool");
        let params = json!({ "name": name, "arguments": args });
        let result = self.call("tools/call", Some(params)).await?;
        let outcome: McpToolCallResult = serde_json::from_value(result)
            .map_err(|e| McpError::Protocol(format!("failed to parse tool result: {e}")))?;

        if outcome.is_error {
            return Err(McpError::ToolFailed(outcome.error_text()));
        }
        Ok(outcome.text())
    }

    async fn call(&self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        if self.is_broken() {
            return Err(McpError::ConnectionClosed("connection previously failed".into()));
        }

        let mut guard = self.conn.lock().await;
        let conn = guard
            .as_mut()
            .ok_or_else(|| McpError::ConnectionClosed("client closed".into()))?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = JsonRpcRequest::call(id, method, params);

        let outcome = match conn.write_message(&request).await {
            Ok(()) => conn.read_response(&self.name, id).await,
            Err(e) => Err(e),
        };

        if let Err(e) = &outcome {
            if e.is_connection_error() {
                warn!(server = %self.name, method, error = %e, "MCP connection failed");
                self.broken.store(true, Ordering::SeqCst);
            }
        }
        outcome
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        let mut guard = self.conn.lock().await;
        let conn = guard
            .as_mut()
            .ok_or_else(|| McpError::ConnectionClosed("client closed".into()))?;
        conn.write_message(&JsonRpcRequest::notification(method, params)).await
    }

    /// Close stdin, release stdout and wait for the child, killing it after
    /// a grace period.
    pub async fn close(&self) {
        if let Some(mut conn) = self.conn.lock().await.take() {
            let _ = conn.writer.shutdown().await;
        }
        self.broken.store(true, Ordering::SeqCst);

        let child = self
            .child
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(mut child) = child {
            match tokio::time::timeout(CLOSE_GRACE, child.wait()).await {
                Ok(Ok(status)) => debug!(server = %self.name, %status, "MCP server exited"),
                Ok(Err(e)) => warn!(server = %self.name, error = %e, "Waiting for MCP server failed"),
                Err(_) => {
                    warn!(server = %self.name, "MCP server did not exit, killing");
                    let _ = child.kill().await;
                }
            }
        }
    }
}
