//! Shared fixtures for the agent unit tests.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use turnloop_core::{
    BuiltinToolProvider, FunctionDeclaration, GenerateRequest, GenerateResponse, StreamEvent,
    ToolArgs, ToolError, Transport, TransportError, Usage,
};
use turnloop_mcp::{McpClient, McpManager, PROTOCOL_VERSION};
use turnloop_tools::BuiltinTools;

use crate::event::EngineEvent;
use crate::router::ToolRouter;

/// One scripted model response.
pub enum Step {
    /// Stream these events, then `Done` with the given total.
    Events(Vec<StreamEvent>, u32),
    /// Fail before the stream opens.
    Fail(TransportError),
    /// Open the stream and wait for cancellation.
    Hang,
}

impl Step {
    pub fn events(events: Vec<StreamEvent>) -> Self {
        Self::Events(events, 0)
    }

    pub fn with_usage(self, total: u32) -> Self {
        match self {
            Self::Events(events, _) => Self::Events(events, total),
            other => other,
        }
    }
}

/// A transport that replays scripted steps and records every request.
pub struct ScriptedTransport {
    steps: Mutex<VecDeque<Step>>,
    requests: Mutex<Vec<GenerateRequest>>,
}

impl ScriptedTransport {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<GenerateRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn generate(
        &self,
        _request: GenerateRequest,
        _cancel: CancellationToken,
    ) -> Result<GenerateResponse, TransportError> {
        Err(TransportError::Network("not scripted".into()))
    }

    async fn stream_generate(
        &self,
        request: GenerateRequest,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<StreamEvent>, TransportError> {
        let model = request.model.clone();
        self.requests.lock().unwrap().push(request);
        let step = self
            .steps
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Step::events(vec![]));

        let (tx, rx) = mpsc::channel(32);
        match step {
            Step::Fail(err) => return Err(err),
            Step::Events(events, total) => {
                tokio::spawn(async move {
                    let _ = tx.send(StreamEvent::Start { model }).await;
                    for event in events {
                        let _ = tx.send(event).await;
                    }
                    let usage = Usage {
                        prompt_tokens: total,
                        completion_tokens: 0,
                        total_tokens: total,
                    };
                    let _ = tx.send(StreamEvent::Done { usage }).await;
                });
            }
            Step::Hang => {
                tokio::spawn(async move {
                    let _ = tx.send(StreamEvent::Start { model }).await;
                    cancel.cancelled().await;
                    let _ = tx
                        .send(StreamEvent::Error {
                            message: TransportError::Cancelled.to_string(),
                        })
                        .await;
                    let _ = tx.send(StreamEvent::Done { usage: Usage::default() }).await;
                });
            }
        }
        Ok(rx)
    }
}

/// Events up to and including the end of the turn. A `done` is followed by
/// one final `messages` update, which is included.
pub async fn collect_turn(rx: &mut mpsc::UnboundedReceiver<EngineEvent>) -> Vec<EngineEvent> {
    let mut events = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("turn timed out")
            .expect("event channel closed");
        let terminal = event.is_terminal();
        let done = matches!(event, EngineEvent::Done { .. });
        events.push(event);
        if terminal {
            if done {
                events.push(rx.recv().await.expect("final messages update"));
            }
            return events;
        }
    }
}

/// Router over the real built-in tool set with no MCP servers.
pub fn router_with_builtins() -> ToolRouter {
    ToolRouter::new(Arc::new(BuiltinTools), Arc::new(McpManager::default()))
}

/// Two tools: `peek` (read-only) and `poke`. Both echo their `text` argument.
pub struct EchoBuiltins;

#[async_trait]
impl BuiltinToolProvider for EchoBuiltins {
    fn declarations(&self) -> Vec<FunctionDeclaration> {
        ["peek", "poke"]
            .into_iter()
            .map(|n| FunctionDeclaration::new(n, format!("{n} tool"), json!({"type": "object"})))
            .collect()
    }

    fn contains(&self, name: &str) -> bool {
        matches!(name, "peek" | "poke")
    }

    fn is_read_only(&self, name: &str) -> bool {
        name == "peek"
    }

    async fn execute(
        &self,
        _cancel: CancellationToken,
        _work_dir: &Path,
        name: &str,
        args: &ToolArgs,
    ) -> Result<String, ToolError> {
        let text = args.get("text").and_then(Value::as_str).unwrap_or_default();
        Ok(format!("{name}: {text}"))
    }
}

pub fn echo_builtins() -> Arc<dyn BuiltinToolProvider> {
    Arc::new(EchoBuiltins)
}

/// Connect to an in-process MCP server exposing `tools`. Calls answer
/// `echo: <text>`, except a tool named `hang`, which never answers.
pub async fn connect_mcp(server: &str, tools: &[&str]) -> McpClient {
    let catalog: Vec<Value> = tools
        .iter()
        .map(|t| {
            json!({
                "name": t,
                "description": format!("tool {t}"),
                "inputSchema": {
                    "$schema": "http://json-schema.org/draft-07/schema#",
                    "type": "object",
                    "properties": {"text": {"type": "string"}}
                }
            })
        })
        .collect();

    let (client_side, server_side) = tokio::io::duplex(64 * 1024);
    let (server_read, mut server_write) = tokio::io::split(server_side);
    tokio::spawn(async move {
        let mut lines = BufReader::new(server_read).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let msg: Value = serde_json::from_str(&line).unwrap();
            let Some(id) = msg.get("id").cloned() else {
                continue;
            };
            let result = match msg["method"].as_str().unwrap_or_default() {
                "initialize" => json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "serverInfo": {"name": "fixture", "version": "1.0.0"}
                }),
                "tools/list" => json!({"tools": catalog}),
                "tools/call" if msg["params"]["name"] == "hang" => continue,
                "tools/call" => {
                    let text = msg["params"]["arguments"]["text"].as_str().unwrap_or_default();
                    json!({"content": [{"type": "text", "text": format!("echo: {text}")}]})
                }
                _ => json!({}),
            };
            let reply = json!({"jsonrpc": "2.0", "id": id, "result": result});
            server_write
                .write_all(format!("{reply}\n").as_bytes())
                .await
                .unwrap();
        }
    });

    let (reader, writer) = tokio::io::split(client_side);
    McpClient::from_streams(server, reader, writer, Duration::from_secs(5))
        .await
        .unwrap()
}
