//! End-to-end tests for the turnloop conversation pipeline.
//!
//! These drive the engine with the real built-in tools against a temporary
//! working directory, with the model side replaced by a scripted transport.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use turnloop_agent::{ConversationEngine, EngineConfig, EngineEvent, Phase, ToolRouter};
use turnloop_core::{
    DisplayRole, FunctionCall, GenerateRequest, GenerateResponse, Role, StreamEvent, Transport,
    TransportError, Usage,
};
use turnloop_mcp::McpManager;
use turnloop_tools::BuiltinTools;

// ── Mock Transport ───────────────────────────────────────────────────────

/// A transport that streams scripted model turns in sequence.
struct ScriptedTransport {
    turns: Mutex<VecDeque<Vec<StreamEvent>>>,
    requests: Mutex<Vec<GenerateRequest>>,
}

impl ScriptedTransport {
    fn new(turns: Vec<Vec<StreamEvent>>) -> Self {
        Self {
            turns: Mutex::new(turns.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    fn requests(&self) -> Vec<GenerateRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Transport for ScriptedTransport {
    async fn generate(
        &self,
        _request: GenerateRequest,
        _cancel: CancellationToken,
    ) -> Result<GenerateResponse, TransportError> {
        Err(TransportError::Network("unary generation is not scripted".into()))
    }

    async fn stream_generate(
        &self,
        request: GenerateRequest,
        _cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<StreamEvent>, TransportError> {
        let model = request.model.clone();
        self.requests.lock().unwrap().push(request);
        let turn = self
            .turns
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| panic!("ScriptedTransport exhausted"));

        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(async move {
            let _ = tx.send(StreamEvent::Start { model }).await;
            for event in turn {
                let _ = tx.send(event).await;
            }
            let usage = Usage {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
            };
            let _ = tx.send(StreamEvent::Done { usage }).await;
        });
        Ok(rx)
    }
}

fn tool_call(name: &str, args: serde_json::Value) -> StreamEvent {
    StreamEvent::ToolCall {
        call: FunctionCall::new(name, args.as_object().cloned().unwrap_or_default()),
        signature: None,
    }
}

fn text(t: &str) -> StreamEvent {
    StreamEvent::Content { text: t.into() }
}

fn setup(
    turns: Vec<Vec<StreamEvent>>,
    work_dir: &std::path::Path,
) -> (
    ConversationEngine,
    mpsc::UnboundedReceiver<EngineEvent>,
    Arc<ScriptedTransport>,
) {
    let transport = Arc::new(ScriptedTransport::new(turns));
    let router = ToolRouter::new(Arc::new(BuiltinTools), Arc::new(McpManager::default()));
    let (engine, rx) = ConversationEngine::new(
        transport.clone(),
        router,
        EngineConfig::new("gemini-2.5-pro", work_dir),
    );
    (engine, rx, transport)
}

/// Events until the turn's terminal event.
async fn until_terminal(rx: &mut mpsc::UnboundedReceiver<EngineEvent>) -> Vec<EngineEvent> {
    let mut events = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("turn timed out")
            .expect("event channel closed");
        let terminal = event.is_terminal();
        events.push(event);
        if terminal {
            return events;
        }
    }
}

fn tool_results(events: &[EngineEvent]) -> Vec<(String, String)> {
    events
        .iter()
        .filter_map(|e| match e {
            EngineEvent::ToolResult { name, text } => Some((name.clone(), text.clone())),
            _ => None,
        })
        .collect()
}

// ── E2E: Tool pipeline ───────────────────────────────────────────────────

#[tokio::test]
async fn e2e_write_edit_read_in_one_turn() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, mut rx, transport) = setup(
        vec![
            vec![
                text("Creating the file."),
                tool_call(
                    "write_file",
                    json!({"file_path": "notes/todo.txt", "content": "buy milk\n"}),
                ),
                tool_call(
                    "replace",
                    json!({"file_path": "notes/todo.txt", "old_string": "milk", "new_string": "bread"}),
                ),
            ],
            vec![tool_call("read_file", json!({"file_path": "notes/todo.txt"}))],
            vec![text("Your list says: buy bread.")],
        ],
        dir.path(),
    );

    engine.send_message("make me a todo list", Vec::new()).unwrap();
    let events = until_terminal(&mut rx).await;

    assert!(matches!(events.last(), Some(EngineEvent::Done { usage }) if usage.total_tokens == 45));
    assert_eq!(
        std::fs::read_to_string(dir.path().join("notes/todo.txt")).unwrap(),
        "buy bread\n"
    );

    let results = tool_results(&events);
    let names: Vec<_> = results.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(names, ["write_file", "replace", "read_file"]);
    assert!(results[0].1.starts_with("Successfully wrote 9 bytes"));
    assert!(results[1].1.starts_with("Successfully replaced 1 occurrence(s)"));
    assert_eq!(results[2].1, "buy bread\n");

    // user, model(2 calls), user(2 responses), model(1 call), user(1 response), model(text)
    let history = engine.history();
    let roles: Vec<_> = history.iter().map(|c| c.role).collect();
    assert_eq!(
        roles,
        [Role::User, Role::Model, Role::User, Role::Model, Role::User, Role::Model]
    );
    let responses: Vec<_> = history[2].function_responses().map(|r| r.name.clone()).collect();
    assert_eq!(responses, ["write_file", "replace"]);

    // The third request carried the whole conversation so far.
    let requests = transport.requests();
    assert_eq!(requests.len(), 3);
    assert_eq!(requests[2].contents.len(), 5);
    assert!(requests[0].tools.iter().any(|d| d.name == "run_shell_command"));
    assert_eq!(engine.phase(), Phase::Idle);
}

#[tokio::test]
async fn e2e_tool_errors_are_fed_back_to_the_model() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, mut rx, transport) = setup(
        vec![
            vec![
                tool_call("read_file", json!({"file_path": "missing.txt"})),
                tool_call("does_not_exist", json!({})),
            ],
            vec![text("That file does not exist.")],
        ],
        dir.path(),
    );

    engine.send_message("read missing.txt", Vec::new()).unwrap();
    let events = until_terminal(&mut rx).await;
    assert!(matches!(events.last(), Some(EngineEvent::Done { .. })));

    let results = tool_results(&events);
    assert!(results[0].1.starts_with("Error: "));
    assert_eq!(results[1].1, "Error: unknown tool: does_not_exist");

    let second = &transport.requests()[1];
    let fed_back: Vec<_> = second
        .contents
        .last()
        .unwrap()
        .function_responses()
        .map(|r| r.result_text().unwrap_or_default().to_string())
        .collect();
    assert_eq!(fed_back.len(), 2);
    assert!(fed_back.iter().all(|t| t.starts_with("Error: ")));
}

// ── E2E: Plan mode ───────────────────────────────────────────────────────

#[tokio::test]
async fn e2e_plan_mode_blocks_writes() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("main.rs"), "fn main() {}\n").unwrap();

    let (engine, mut rx, transport) = setup(
        vec![
            vec![
                tool_call("list_directory", json!({})),
                tool_call("write_file", json!({"file_path": "x.txt", "content": "x"})),
            ],
            vec![text("Plan: edit main.rs once plan mode is off.")],
        ],
        dir.path(),
    );
    engine.set_plan_mode(true);

    engine.send_message("plan a change", Vec::new()).unwrap();
    let events = until_terminal(&mut rx).await;
    assert!(matches!(events.last(), Some(EngineEvent::Done { .. })));

    let results = tool_results(&events);
    assert_eq!(results[0].1, "main.rs");
    assert_eq!(
        results[1].1,
        "Error: tool \"write_file\" is not allowed in Plan Mode. Only read-only tools are available."
    );
    assert!(!dir.path().join("x.txt").exists());

    let request = &transport.requests()[0];
    let mut offered: Vec<_> = request.tools.iter().map(|d| d.name.as_str()).collect();
    offered.sort_unstable();
    assert_eq!(
        offered,
        ["ask_user", "list_directory", "read_file", "search_file_content"]
    );
    assert!(
        request
            .system_instruction
            .as_deref()
            .unwrap_or_default()
            .contains("Plan mode")
    );
}

// ── E2E: Ask user ────────────────────────────────────────────────────────

#[tokio::test]
async fn e2e_ask_user_answer_reaches_the_model() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, mut rx, transport) = setup(
        vec![
            vec![tool_call(
                "ask_user",
                json!({"questions": [{
                    "question": "Which language?",
                    "header": "Language",
                    "type": "choice",
                    "options": [{"label": "Rust"}, {"label": "Go"}]
                }]}),
            )],
            vec![text("Rust it is.")],
        ],
        dir.path(),
    );

    assert!(!engine.submit_ask_user_response("too early"));
    engine.send_message("start a project", Vec::new()).unwrap();

    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .unwrap()
            .unwrap();
        if let EngineEvent::AskUser { questions } = event {
            assert_eq!(questions.len(), 1);
            assert_eq!(questions[0].options.len(), 2);
            break;
        }
    }
    assert!(engine.has_pending_question());
    assert!(engine.submit_ask_user_response("Rust"));

    let events = until_terminal(&mut rx).await;
    assert!(matches!(events.last(), Some(EngineEvent::Done { .. })));

    let answer = transport.requests()[1]
        .contents
        .last()
        .unwrap()
        .function_responses()
        .next()
        .and_then(|r| r.result_text().map(str::to_string));
    assert_eq!(answer.as_deref(), Some("Rust"));
}

// ── E2E: Sessions ────────────────────────────────────────────────────────

#[tokio::test]
async fn e2e_snapshot_restores_into_a_fresh_engine() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.txt"), "alpha\n").unwrap();

    let (engine, mut rx, _) = setup(
        vec![
            vec![tool_call("read_file", json!({"file_path": "a.txt"}))],
            vec![text("It says alpha.")],
        ],
        dir.path(),
    );
    engine.set_model("gemini-2.5-flash");
    engine.send_message("what is in a.txt?", Vec::new()).unwrap();
    until_terminal(&mut rx).await;

    let session = engine.snapshot();
    let json = serde_json::to_string(&session).unwrap();
    let restored_session = serde_json::from_str(&json).unwrap();

    let (fresh, mut fresh_rx, transport) = setup(vec![vec![text("Still alpha.")]], dir.path());
    fresh.restore(restored_session).unwrap();

    assert_eq!(fresh.history(), engine.history());
    assert_eq!(fresh.messages(), engine.messages());
    assert_eq!(fresh.model(), "gemini-2.5-flash");

    let roles: Vec<_> = fresh.messages().iter().map(|m| m.role).collect();
    assert_eq!(
        roles,
        [
            DisplayRole::User,
            DisplayRole::ToolCall,
            DisplayRole::ToolResult,
            DisplayRole::Model
        ]
    );

    fresh.send_message("and now?", Vec::new()).unwrap();
    let events = until_terminal(&mut fresh_rx).await;
    assert!(matches!(events.last(), Some(EngineEvent::Done { .. })));
    let request = &transport.requests()[0];
    assert_eq!(request.model, "gemini-2.5-flash");
    assert_eq!(request.contents.len(), 5);
}
