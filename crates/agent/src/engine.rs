//! The conversation engine: one live conversation and its turn loop.
//!
//! A turn runs `Idle → Streaming → (ToolExecution → Streaming)* → Idle`.
//! `send_message` starts it on a background task; progress is reported on
//! the event channel handed out by [`ConversationEngine::new`].
//!
//! All mutable conversation state sits behind one `std::sync::Mutex` that is
//! never held across an `.await`. Readers get copies.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use turnloop_config::AppConfig;
use turnloop_core::{
    Content, DisplayMessage, EngineError, FunctionCall, FunctionResponse, GenerateRequest,
    GenerationConfig, Part, Session, StreamEvent, ToolError, Transport, TransportError, Usage,
};

use crate::ask_user::{CANCELLED_ANSWER, parse_questions};
use crate::event::EngineEvent;
use crate::prompt::build_system_prompt;
use crate::router::ToolRouter;

/// Name of the tool the engine answers itself.
pub const ASK_USER_TOOL: &str = "ask_user";

const PLAN_MODE_ON_NOTICE: &str = "[SYSTEM: Plan mode is now ON. Use read-only tools only and \
do not modify any files. Describe the plan instead of making changes.]";

const PLAN_MODE_OFF_NOTICE: &str = "[SYSTEM: Plan mode is now OFF. All tools available again, \
including write_file, replace and run_shell_command.]";

/// Where the turn loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Streaming,
    ToolExecution,
}

/// Static settings for an engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub default_model: String,
    pub project: Option<String>,
    pub work_dir: PathBuf,
    pub generation_config: Option<GenerationConfig>,
}

impl EngineConfig {
    pub fn new(default_model: impl Into<String>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            default_model: default_model.into(),
            project: None,
            work_dir: work_dir.into(),
            generation_config: None,
        }
    }

    pub fn from_app_config(config: &AppConfig, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            project: config.api.project.clone(),
            ..Self::new(config.default_model.clone(), work_dir)
        }
    }
}

/// A file sent along with a user message.
#[derive(Debug, Clone, PartialEq)]
pub struct Attachment {
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl Attachment {
    pub fn new(mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            mime_type: mime_type.into(),
            data,
        }
    }

    /// Read `path` for attaching.
    pub async fn from_path(path: &Path, mime_type: impl Into<String>) -> Result<Self, EngineError> {
        let data = tokio::fs::read(path)
            .await
            .map_err(|e| EngineError::Attachment {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self::new(mime_type, data))
    }
}

struct State {
    session_id: String,
    created_at: DateTime<Utc>,
    history: Vec<Content>,
    messages: Vec<DisplayMessage>,
    model_override: Option<String>,
    work_dir: PathBuf,
    plan_mode: bool,
    /// Plan-mode notices raised mid-turn, appended at the next safe point.
    pending_notices: Vec<Content>,
    /// Present while a turn is running.
    cancel: Option<CancellationToken>,
    ask_slot: Option<oneshot::Sender<String>>,
}

impl State {
    /// Notices go in only between complete turns, so a model turn with
    /// function calls is always followed directly by its responses.
    fn flush_notices(&mut self) {
        let notices = std::mem::take(&mut self.pending_notices);
        self.history.extend(notices);
    }
}

struct Inner {
    transport: Arc<dyn Transport>,
    router: ToolRouter,
    config: EngineConfig,
    state: Mutex<State>,
    events: mpsc::UnboundedSender<EngineEvent>,
    phase: watch::Sender<Phase>,
}

/// Model output accumulated from one stream.
#[derive(Default)]
struct ModelTurn {
    thought: String,
    text: String,
    calls: Vec<(FunctionCall, Option<String>)>,
}

impl ModelTurn {
    fn into_content(self) -> Option<Content> {
        let mut parts = Vec::new();
        if !self.thought.is_empty() {
            parts.push(Part::thought(self.thought));
        }
        if !self.text.is_empty() {
            parts.push(Part::text(self.text));
        }
        parts.extend(
            self.calls
                .into_iter()
                .map(|(call, signature)| Part::function_call(call, signature)),
        );
        (!parts.is_empty()).then(|| Content::model(parts))
    }
}

/// Drives one conversation. Cheap to clone; clones share the conversation.
#[derive(Clone)]
pub struct ConversationEngine {
    inner: Arc<Inner>,
}

impl ConversationEngine {
    /// Create an engine and the receiving end of its progress channel.
    pub fn new(
        transport: Arc<dyn Transport>,
        router: ToolRouter,
        config: EngineConfig,
    ) -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let (phase, _) = watch::channel(Phase::Idle);
        let session = Session::new(config.default_model.clone(), config.work_dir.clone());
        let state = State {
            session_id: session.id,
            created_at: session.created_at,
            history: Vec::new(),
            messages: Vec::new(),
            model_override: None,
            work_dir: config.work_dir.clone(),
            plan_mode: false,
            pending_notices: Vec::new(),
            cancel: None,
            ask_slot: None,
        };
        let engine = Self {
            inner: Arc::new(Inner {
                transport,
                router,
                config,
                state: Mutex::new(state),
                events,
                phase,
            }),
        };
        (engine, rx)
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: EngineEvent) {
        // Nobody listening is fine.
        let _ = self.inner.events.send(event);
    }

    fn set_phase(&self, phase: Phase) {
        self.inner.phase.send_replace(phase);
    }

    fn current_model(&self, state: &State) -> String {
        state
            .model_override
            .clone()
            .unwrap_or_else(|| self.inner.config.default_model.clone())
    }

    // --- Public API ---

    /// Append a user turn and start the turn loop in the background.
    pub fn send_message(&self, text: &str, attachments: Vec<Attachment>) -> Result<(), EngineError> {
        let cancel = CancellationToken::new();
        let attached = attachments.len();
        let messages = {
            let mut state = self.state();
            if state.cancel.is_some() {
                return Err(EngineError::Busy);
            }

            let mut parts = Vec::with_capacity(attached + 1);
            if !text.is_empty() {
                parts.push(Part::text(text));
            }
            parts.extend(
                attachments
                    .into_iter()
                    .map(|a| Part::inline_data(a.mime_type, a.data)),
            );

            let mut display = text.to_string();
            if attached > 0 {
                display.push_str(&format!(" [{attached} file(s) attached]"));
            }

            state.flush_notices();
            state.history.push(Content::user(parts));
            state.messages.push(DisplayMessage::user(display));
            state.cancel = Some(cancel.clone());
            state.messages.clone()
        };

        info!(attachments = attached, "Starting turn");
        self.emit(EngineEvent::Messages { messages });
        self.set_phase(Phase::Streaming);

        let engine = self.clone();
        tokio::spawn(async move { engine.run_turn(cancel).await });
        Ok(())
    }

    /// Cancel the running turn, if any.
    pub fn stop_generation(&self) {
        if let Some(cancel) = &self.state().cancel {
            info!("Stopping generation");
            cancel.cancel();
        }
    }

    /// Forget the conversation. The working directory is kept.
    pub fn clear_history(&self) {
        {
            let mut state = self.state();
            state.history.clear();
            state.messages.clear();
            state.pending_notices.clear();
            state.model_override = None;
        }
        self.emit(EngineEvent::Messages {
            messages: Vec::new(),
        });
    }

    /// Deliver an answer to an open `ask_user` question.
    ///
    /// Returns whether a question was waiting. With none open this is a no-op.
    pub fn submit_ask_user_response(&self, answer: impl Into<String>) -> bool {
        let slot = self.state().ask_slot.take();
        match slot {
            Some(tx) => tx.send(answer.into()).is_ok(),
            None => false,
        }
    }

    /// Whether an `ask_user` question is waiting for an answer.
    pub fn has_pending_question(&self) -> bool {
        self.state().ask_slot.is_some()
    }

    /// Toggle plan mode. A real transition on a non-empty conversation tells
    /// the model about it with a user notice.
    pub fn set_plan_mode(&self, enabled: bool) {
        let mut state = self.state();
        let previous = std::mem::replace(&mut state.plan_mode, enabled);
        if previous == enabled || state.history.is_empty() {
            return;
        }

        let notice = Content::user_text(if enabled {
            PLAN_MODE_ON_NOTICE
        } else {
            PLAN_MODE_OFF_NOTICE
        });
        if state.cancel.is_some() {
            state.pending_notices.push(notice);
        } else {
            state.history.push(notice);
        }
        info!(enabled, "Plan mode changed");
    }

    pub fn plan_mode(&self) -> bool {
        self.state().plan_mode
    }

    /// The session model override, or the configured default.
    pub fn model(&self) -> String {
        let state = self.state();
        self.current_model(&state)
    }

    /// Override the model for this conversation. An empty name clears it.
    pub fn set_model(&self, model: impl Into<String>) {
        let model = model.into();
        self.state().model_override = (!model.is_empty()).then_some(model);
    }

    pub fn work_dir(&self) -> PathBuf {
        self.state().work_dir.clone()
    }

    pub fn set_work_dir(&self, dir: impl Into<PathBuf>) {
        self.state().work_dir = dir.into();
    }

    pub fn messages(&self) -> Vec<DisplayMessage> {
        self.state().messages.clone()
    }

    pub fn history(&self) -> Vec<Content> {
        self.state().history.clone()
    }

    pub fn is_busy(&self) -> bool {
        self.state().cancel.is_some()
    }

    pub fn phase(&self) -> Phase {
        *self.inner.phase.borrow()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<Phase> {
        self.inner.phase.subscribe()
    }

    /// Copy of the conversation for persistence.
    pub fn snapshot(&self) -> Session {
        let state = self.state();
        let mut history = state.history.clone();
        history.extend(state.pending_notices.iter().cloned());
        Session {
            id: state.session_id.clone(),
            model: self.current_model(&state),
            work_dir: state.work_dir.clone(),
            history,
            messages: state.messages.clone(),
            created_at: state.created_at,
            updated_at: Utc::now(),
        }
    }

    /// Replace the conversation with a persisted one.
    pub fn restore(&self, session: Session) -> Result<(), EngineError> {
        let messages = {
            let mut state = self.state();
            if state.cancel.is_some() {
                return Err(EngineError::Busy);
            }
            state.model_override =
                (session.model != self.inner.config.default_model).then_some(session.model);
            state.session_id = session.id;
            state.created_at = session.created_at;
            state.work_dir = session.work_dir;
            state.history = session.history;
            state.messages = session.messages;
            state.pending_notices.clear();
            state.messages.clone()
        };
        self.emit(EngineEvent::Messages { messages });
        Ok(())
    }

    // --- Turn loop ---

    async fn run_turn(self, cancel: CancellationToken) {
        let mut usage = Usage::default();
        let outcome = self.drive(&cancel, &mut usage).await;

        // Back to idle before the terminal event, so a listener reacting to it
        // can start the next turn straight away. The phase changes before the
        // cancel slot is released so a new turn's phase is never overwritten.
        {
            let mut state = self.state();
            state.ask_slot = None;
            state.flush_notices();
            self.set_phase(Phase::Idle);
            state.cancel = None;
        }

        match outcome {
            Ok(()) => {
                info!(total_tokens = usage.total_tokens, "Turn complete");
                self.emit(EngineEvent::Done { usage });
                self.emit(EngineEvent::Messages {
                    messages: self.messages(),
                });
            }
            Err(message) => {
                warn!(error = %message, "Turn aborted");
                self.emit(EngineEvent::Error { message });
            }
        }
    }

    async fn drive(&self, cancel: &CancellationToken, usage: &mut Usage) -> Result<(), String> {
        let mut iteration = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(TransportError::Cancelled.to_string());
            }
            iteration += 1;

            let request = self.build_request();
            debug!(
                iteration,
                model = %request.model,
                contents = request.contents.len(),
                tools = request.tools.len(),
                "Requesting model turn"
            );
            self.set_phase(Phase::Streaming);

            let mut stream = tokio::select! {
                _ = cancel.cancelled() => return Err(TransportError::Cancelled.to_string()),
                res = self.inner.transport.stream_generate(request, cancel.clone()) => {
                    res.map_err(|e| e.to_string())?
                }
            };

            let mut turn = ModelTurn::default();
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => return Err(TransportError::Cancelled.to_string()),
                    event = stream.recv() => event,
                };
                let Some(event) = event else { break };
                match event {
                    StreamEvent::Start { model } => self.emit(EngineEvent::Start { model }),
                    StreamEvent::Content { text } => {
                        turn.text.push_str(&text);
                        self.emit(EngineEvent::Content { text });
                    }
                    StreamEvent::Thought { text } => {
                        turn.thought.push_str(&text);
                        self.emit(EngineEvent::Thought { text });
                    }
                    StreamEvent::ToolCall { call, signature } => {
                        self.emit(EngineEvent::ToolCall {
                            name: call.name.clone(),
                            args: call.args_json(),
                        });
                        turn.calls.push((call, signature));
                    }
                    StreamEvent::Error { message } => return Err(message),
                    StreamEvent::Done { usage: used } => {
                        *usage += used;
                        break;
                    }
                }
            }

            let calls: Vec<FunctionCall> = turn.calls.iter().map(|(c, _)| c.clone()).collect();
            self.commit_model_turn(turn);
            if calls.is_empty() {
                return Ok(());
            }

            self.set_phase(Phase::ToolExecution);
            let responses = self.execute_calls(cancel, calls).await;
            let messages = {
                let mut state = self.state();
                state.history.push(Content::user(responses));
                state.messages.clone()
            };
            self.emit(EngineEvent::Messages { messages });
        }
    }

    fn build_request(&self) -> GenerateRequest {
        let (contents, work_dir, plan_mode, model) = {
            let mut state = self.state();
            state.flush_notices();
            (
                state.history.clone(),
                state.work_dir.clone(),
                state.plan_mode,
                self.current_model(&state),
            )
        };
        GenerateRequest {
            model,
            project: self.inner.config.project.clone(),
            contents,
            system_instruction: Some(build_system_prompt(&work_dir, plan_mode)),
            tools: self.inner.router.declarations(plan_mode),
            generation_config: self.inner.config.generation_config.clone(),
        }
    }

    fn commit_model_turn(&self, turn: ModelTurn) {
        let text = turn.text.clone();
        let mut state = self.state();
        if !text.is_empty() {
            state.messages.push(DisplayMessage::model(text));
        }
        if let Some(content) = turn.into_content() {
            state.history.push(content);
        }
    }

    /// Run each call in order. Always returns one response per call.
    async fn execute_calls(&self, cancel: &CancellationToken, calls: Vec<FunctionCall>) -> Vec<Part> {
        let mut responses = Vec::with_capacity(calls.len());
        for call in calls {
            let (plan_mode, work_dir) = {
                let mut state = self.state();
                state
                    .messages
                    .push(DisplayMessage::tool_call(&call.name, call.args_json()));
                (state.plan_mode, state.work_dir.clone())
            };

            let text = if cancel.is_cancelled() {
                format!("Error: skipped: {}", TransportError::Cancelled)
            } else {
                match self.execute_call(cancel, plan_mode, &work_dir, &call).await {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(tool = %call.name, error = %e, "Tool execution failed");
                        format!("Error: {e}")
                    }
                }
            };

            self.emit(EngineEvent::ToolResult {
                name: call.name.clone(),
                text: text.clone(),
            });
            self.state()
                .messages
                .push(DisplayMessage::tool_result(&call.name, &text));
            responses.push(Part::function_response(FunctionResponse::result(
                call.name, text,
            )));
        }
        responses
    }

    async fn execute_call(
        &self,
        cancel: &CancellationToken,
        plan_mode: bool,
        work_dir: &Path,
        call: &FunctionCall,
    ) -> Result<String, ToolError> {
        if plan_mode && !self.inner.router.is_plan_mode_tool(&call.name) {
            return Err(ToolError::PlanModeViolation(call.name.clone()));
        }
        if call.name == ASK_USER_TOOL {
            return self.ask_user(cancel, call).await;
        }
        debug!(tool = %call.name, "Dispatching tool call");
        self.inner
            .router
            .dispatch(cancel.clone(), work_dir, &call.name, &call.args)
            .await
    }

    async fn ask_user(&self, cancel: &CancellationToken, call: &FunctionCall) -> Result<String, ToolError> {
        let questions = parse_questions(&call.args)?;
        let (tx, rx) = oneshot::channel();
        self.state().ask_slot = Some(tx);
        self.emit(EngineEvent::AskUser { questions });

        let answer = tokio::select! {
            _ = cancel.cancelled() => CANCELLED_ANSWER.to_string(),
            answer = rx => answer.unwrap_or_else(|_| CANCELLED_ANSWER.to_string()),
        };
        self.state().ask_slot = None;
        Ok(answer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ScriptedTransport, Step, collect_turn, router_with_builtins};
    use serde_json::json;
    use std::time::Duration;
    use turnloop_core::{DisplayRole, Role};

    fn call(name: &str, args: serde_json::Value) -> StreamEvent {
        StreamEvent::ToolCall {
            call: FunctionCall::new(name, args.as_object().cloned().unwrap_or_default()),
            signature: Some(format!("sig-{name}")),
        }
    }

    fn text(t: &str) -> StreamEvent {
        StreamEvent::Content { text: t.into() }
    }

    fn engine(
        steps: Vec<Step>,
        work_dir: &Path,
    ) -> (ConversationEngine, mpsc::UnboundedReceiver<EngineEvent>, Arc<ScriptedTransport>) {
        let transport = Arc::new(ScriptedTransport::new(steps));
        let (engine, rx) = ConversationEngine::new(
            transport.clone(),
            router_with_builtins(),
            EngineConfig::new("test-model", work_dir),
        );
        (engine, rx, transport)
    }

    #[tokio::test]
    async fn text_turn_appends_history_and_display() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, mut rx, transport) = engine(
            vec![Step::events(vec![
                StreamEvent::Thought { text: "thinking".into() },
                text("Hello "),
                text("there"),
            ])],
            dir.path(),
        );

        engine.send_message("hi", vec![]).unwrap();
        let events = collect_turn(&mut rx).await;

        assert!(matches!(events.first(), Some(EngineEvent::Messages { .. })));
        assert!(events.contains(&EngineEvent::Start { model: "test-model".into() }));
        assert!(matches!(events.iter().rev().nth(1), Some(EngineEvent::Done { .. })));

        let history = engine.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].role, Role::Model);
        assert_eq!(
            history[1].parts,
            vec![Part::thought("thinking"), Part::text("Hello there")]
        );

        let messages = engine.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].role, DisplayRole::Model);
        assert_eq!(messages[1].content, "Hello there");

        let request = &transport.requests()[0];
        assert_eq!(request.model, "test-model");
        assert!(request.system_instruction.as_deref().unwrap().contains("Current working directory"));
        assert_eq!(engine.phase(), Phase::Idle);
    }

    #[tokio::test]
    async fn tool_calls_get_responses_in_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "alpha").unwrap();
        std::fs::write(dir.path().join("b.txt"), "beta").unwrap();

        let (engine, mut rx, transport) = engine(
            vec![
                Step::events(vec![
                    call("read_file", json!({"file_path": "a.txt"})),
                    call("read_file", json!({"file_path": "b.txt"})),
                    call("no_such_tool", json!({})),
                ]),
                Step::events(vec![text("done")]),
            ],
            dir.path(),
        );

        engine.send_message("read both", vec![]).unwrap();
        let events = collect_turn(&mut rx).await;

        let results: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                EngineEvent::ToolResult { name, text } => Some((name.as_str(), text.as_str())),
                _ => None,
            })
            .collect();
        assert_eq!(results[0], ("read_file", "alpha"));
        assert_eq!(results[1], ("read_file", "beta"));
        assert_eq!(results[2].1, "Error: unknown tool: no_such_tool");

        let history = engine.history();
        assert_eq!(history.len(), 4);
        let calls: Vec<_> = history[1].function_calls().map(|c| c.name.as_str()).collect();
        let responses: Vec<_> = history[2].function_responses().collect();
        assert_eq!(calls.len(), responses.len());
        assert_eq!(responses[0].result_text(), Some("alpha"));
        assert_eq!(responses[2].name, "no_such_tool");
        assert_eq!(history[2].role, Role::User);

        // The signature is echoed back on the next request.
        let second = &transport.requests()[1];
        assert!(matches!(
            &second.contents[1].parts[0],
            Part::FunctionCall { signature: Some(s), .. } if s == "sig-read_file"
        ));

        let roles: Vec<_> = engine.messages().iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            [
                DisplayRole::User,
                DisplayRole::ToolCall,
                DisplayRole::ToolResult,
                DisplayRole::ToolCall,
                DisplayRole::ToolResult,
                DisplayRole::ToolCall,
                DisplayRole::ToolResult,
                DisplayRole::Model,
            ]
        );
    }

    #[tokio::test]
    async fn usage_is_summed_across_iterations() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, mut rx, _) = engine(
            vec![
                Step::events(vec![call("list_directory", json!({}))]).with_usage(10),
                Step::events(vec![text("ok")]).with_usage(5),
            ],
            dir.path(),
        );
        engine.send_message("ls", vec![]).unwrap();
        let events = collect_turn(&mut rx).await;
        let usage = events.iter().find_map(|e| match e {
            EngineEvent::Done { usage } => Some(*usage),
            _ => None,
        });
        assert_eq!(usage.unwrap().total_tokens, 15);
    }

    #[tokio::test]
    async fn overlapping_send_is_busy() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, mut rx, _) = engine(vec![Step::Hang], dir.path());
        engine.send_message("first", vec![]).unwrap();
        assert!(matches!(engine.send_message("second", vec![]), Err(EngineError::Busy)));
        assert!(engine.is_busy());

        engine.stop_generation();
        let events = collect_turn(&mut rx).await;
        assert!(matches!(events.last(), Some(EngineEvent::Error { .. })));
        assert!(!engine.is_busy());
    }

    #[tokio::test]
    async fn stop_ends_turn_without_done() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, mut rx, _) = engine(vec![Step::Hang], dir.path());
        let mut phase = engine.subscribe_phase();

        engine.send_message("go", vec![]).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        engine.stop_generation();

        let events = collect_turn(&mut rx).await;
        assert_eq!(
            events.last(),
            Some(&EngineEvent::Error {
                message: "generation cancelled".into()
            })
        );
        assert!(!events.iter().any(|e| matches!(e, EngineEvent::Done { .. })));
        // Nothing after the error event.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());

        phase.wait_for(|p| *p == Phase::Idle).await.unwrap();
        // Partial output of the aborted stream is not kept.
        assert_eq!(engine.history().len(), 1);
    }

    #[tokio::test]
    async fn stop_interrupts_a_silent_mcp_tool() {
        use crate::test_support::{connect_mcp, echo_builtins};
        use turnloop_mcp::McpManager;

        let dir = tempfile::tempdir().unwrap();
        let mcp = Arc::new(McpManager::default());
        mcp.attach("srv", connect_mcp("srv", &["hang"]).await);
        let transport = Arc::new(ScriptedTransport::new(vec![Step::events(vec![call(
            "srv__hang",
            json!({}),
        )])]));
        let (engine, mut rx) = ConversationEngine::new(
            transport.clone(),
            ToolRouter::new(echo_builtins(), mcp),
            EngineConfig::new("test-model", dir.path()),
        );
        let mut phase = engine.subscribe_phase();

        engine.send_message("go", vec![]).unwrap();
        phase.wait_for(|p| *p == Phase::ToolExecution).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        engine.stop_generation();

        let events = collect_turn(&mut rx).await;
        assert!(events.contains(&EngineEvent::ToolResult {
            name: "srv__hang".into(),
            text: "Error: tool execution cancelled".into(),
        }));
        assert_eq!(
            events.last(),
            Some(&EngineEvent::Error {
                message: "generation cancelled".into()
            })
        );
        assert!(!engine.is_busy());
        // The call still gets its response in history.
        assert_eq!(engine.history().len(), 3);
        assert_eq!(transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn transport_failure_aborts_turn() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, mut rx, _) = engine(
            vec![Step::Fail(TransportError::Http {
                status: 500,
                body: "boom".into(),
            })],
            dir.path(),
        );
        engine.send_message("hi", vec![]).unwrap();
        let events = collect_turn(&mut rx).await;
        match events.last() {
            Some(EngineEvent::Error { message }) => assert!(message.contains("500")),
            other => panic!("expected error, got {other:?}"),
        }
        assert_eq!(engine.history().len(), 1);
    }

    #[tokio::test]
    async fn stream_error_event_aborts_turn() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, mut rx, _) = engine(
            vec![Step::events(vec![
                text("partial"),
                StreamEvent::Error {
                    message: "connection reset".into(),
                },
            ])],
            dir.path(),
        );
        engine.send_message("hi", vec![]).unwrap();
        let events = collect_turn(&mut rx).await;
        assert_eq!(
            events.last(),
            Some(&EngineEvent::Error {
                message: "connection reset".into()
            })
        );
        assert_eq!(engine.history().len(), 1);
        assert_eq!(engine.messages().len(), 1);
    }

    #[tokio::test]
    async fn plan_mode_notices_and_gate() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, mut rx, transport) = engine(
            vec![
                Step::events(vec![text("first")]),
                Step::events(vec![call("write_file", json!({"file_path": "x.txt", "content": "x"}))]),
                Step::events(vec![text("ok, planning instead")]),
            ],
            dir.path(),
        );

        // No history yet: no notice.
        engine.set_plan_mode(true);
        engine.set_plan_mode(false);
        assert!(engine.history().is_empty());

        engine.send_message("hello", vec![]).unwrap();
        collect_turn(&mut rx).await;
        assert_eq!(engine.history().len(), 2);

        engine.set_plan_mode(true);
        engine.set_plan_mode(true);
        assert_eq!(engine.history().len(), 3);
        assert!(engine.history()[2].text().contains("Plan mode is now ON"));

        engine.send_message("write it", vec![]).unwrap();
        let events = collect_turn(&mut rx).await;
        let result = events.iter().find_map(|e| match e {
            EngineEvent::ToolResult { text, .. } => Some(text.clone()),
            _ => None,
        });
        assert!(result.unwrap().contains("is not allowed in Plan Mode"));
        assert!(!dir.path().join("x.txt").exists());

        let request = &transport.requests()[1];
        let names: Vec<_> = request.tools.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, ["read_file", "list_directory", "search_file_content", "ask_user"]);
        assert!(request.system_instruction.as_deref().unwrap().contains("Plan mode is on"));

        let before = engine.history().len();
        engine.set_plan_mode(false);
        assert_eq!(engine.history().len(), before + 1);
        assert!(engine.history()[before].text().contains("All tools available"));
    }

    #[tokio::test]
    async fn plan_mode_on_then_off_appends_two_notices() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, mut rx, _) = engine(vec![Step::events(vec![text("hi")])], dir.path());
        engine.send_message("hello", vec![]).unwrap();
        collect_turn(&mut rx).await;

        engine.set_plan_mode(true);
        engine.set_plan_mode(false);
        assert_eq!(engine.history().len(), 4);
    }

    #[tokio::test]
    async fn plan_mode_toggled_mid_turn_waits_for_the_responses() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, mut rx, transport) = engine(
            vec![
                Step::events(vec![call("ask_user", json!({"question": "Proceed?"}))]),
                Step::events(vec![text("read-only from here")]),
            ],
            dir.path(),
        );

        engine.send_message("go", vec![]).unwrap();
        loop {
            match rx.recv().await.unwrap() {
                EngineEvent::AskUser { .. } => break,
                e => assert!(!e.is_terminal(), "turn ended early: {e:?}"),
            }
        }

        engine.set_plan_mode(true);
        // Deferred: the call is still waiting for its response.
        assert_eq!(engine.history().len(), 2);
        assert_eq!(engine.snapshot().history.len(), 3);

        assert!(engine.submit_ask_user_response("yes"));
        let events = collect_turn(&mut rx).await;
        assert!(matches!(events.iter().rev().nth(1), Some(EngineEvent::Done { .. })));

        let history = engine.history();
        assert_eq!(history.len(), 5);
        assert_eq!(history[1].function_calls().count(), 1);
        assert_eq!(history[2].function_responses().count(), 1);
        assert!(history[3].text().contains("Plan mode is now ON"));
        assert_eq!(history[4].role, Role::Model);

        let requests = transport.requests();
        let follow_up = &requests[1];
        assert_eq!(follow_up.contents.len(), 4);
        assert!(follow_up.contents[3].text().contains("Plan mode is now ON"));
        let names: Vec<_> = follow_up.tools.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, ["read_file", "list_directory", "search_file_content", "ask_user"]);
        assert!(follow_up.system_instruction.as_deref().unwrap().contains("Plan mode is on"));
        assert!(requests[0].tools.iter().any(|d| d.name == "write_file"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn accepted_follow_up_send_is_never_reported_idle() {
        let dir = tempfile::tempdir().unwrap();
        for _ in 0..20 {
            let (engine, _rx, _) = engine(
                vec![Step::events(vec![text("first")]), Step::Hang],
                dir.path(),
            );
            engine.send_message("one", vec![]).unwrap();
            let phase = loop {
                match engine.send_message("two", vec![]) {
                    Ok(()) => break engine.phase(),
                    Err(EngineError::Busy) => tokio::task::yield_now().await,
                    Err(e) => panic!("unexpected error: {e}"),
                }
            };
            assert_ne!(phase, Phase::Idle);
            assert!(engine.is_busy());
            engine.stop_generation();
        }
    }

    #[tokio::test]
    async fn ask_user_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, mut rx, _) = engine(
            vec![
                Step::events(vec![call("ask_user", json!({"question": "Which color?"}))]),
                Step::events(vec![text("blue it is")]),
            ],
            dir.path(),
        );

        assert!(!engine.submit_ask_user_response("ignored"));
        engine.send_message("pick", vec![]).unwrap();

        loop {
            match rx.recv().await.unwrap() {
                EngineEvent::AskUser { questions } => {
                    assert_eq!(questions[0].question, "Which color?");
                    break;
                }
                e => assert!(!e.is_terminal(), "turn ended early: {e:?}"),
            }
        }
        assert!(engine.has_pending_question());
        assert!(engine.submit_ask_user_response("blue"));
        assert!(!engine.submit_ask_user_response("again"));

        let events = collect_turn(&mut rx).await;
        assert!(events.contains(&EngineEvent::ToolResult {
            name: "ask_user".into(),
            text: "blue".into()
        }));
        let history = engine.history();
        let response = history[2].function_responses().next().unwrap();
        assert_eq!(response.result_text(), Some("blue"));
    }

    #[tokio::test]
    async fn ask_user_cancelled_keeps_history_consistent() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, mut rx, _) = engine(
            vec![Step::events(vec![
                call("ask_user", json!({"question": "Continue?"})),
                call("list_directory", json!({})),
            ])],
            dir.path(),
        );
        engine.send_message("go", vec![]).unwrap();
        loop {
            if let EngineEvent::AskUser { .. } = rx.recv().await.unwrap() {
                break;
            }
        }
        engine.stop_generation();
        let events = collect_turn(&mut rx).await;
        assert!(events.contains(&EngineEvent::ToolResult {
            name: "ask_user".into(),
            text: CANCELLED_ANSWER.into()
        }));
        assert!(matches!(events.last(), Some(EngineEvent::Error { .. })));

        let history = engine.history();
        assert_eq!(history.len(), 3);
        let responses: Vec<_> = history[2].function_responses().collect();
        assert_eq!(responses.len(), 2);
        assert!(responses[1].result_text().unwrap().starts_with("Error: skipped"));
    }

    #[tokio::test]
    async fn missing_questions_become_error_result() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, mut rx, _) = engine(
            vec![
                Step::events(vec![call("ask_user", json!({}))]),
                Step::events(vec![text("sorry")]),
            ],
            dir.path(),
        );
        engine.send_message("go", vec![]).unwrap();
        let events = collect_turn(&mut rx).await;
        assert!(events.iter().any(|e| matches!(
            e,
            EngineEvent::ToolResult { text, .. } if text.contains("questions array is required")
        )));
        assert!(matches!(events.iter().rev().nth(1), Some(EngineEvent::Done { .. })));
    }

    #[tokio::test]
    async fn attachments_become_inline_data() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("pic.png");
        std::fs::write(&image, [0x89, b'P', b'N', b'G']).unwrap();
        let attachment = Attachment::from_path(&image, "image/png").await.unwrap();

        let (engine, mut rx, _) = engine(vec![Step::events(vec![text("nice")])], dir.path());
        engine.send_message("look", vec![attachment]).unwrap();
        collect_turn(&mut rx).await;

        let history = engine.history();
        assert_eq!(history[0].parts.len(), 2);
        assert!(matches!(&history[0].parts[1], Part::InlineData(d) if d.mime_type == "image/png"));
        assert_eq!(engine.messages()[0].content, "look [1 file(s) attached]");

        let err = Attachment::from_path(&dir.path().join("missing.png"), "image/png")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Attachment { .. }));
    }

    #[tokio::test]
    async fn clear_history_resets_model_but_keeps_work_dir() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, mut rx, _) = engine(vec![Step::events(vec![text("hi")])], dir.path());
        engine.set_model("other-model");
        engine.send_message("hello", vec![]).unwrap();
        collect_turn(&mut rx).await;

        engine.clear_history();
        assert!(engine.history().is_empty());
        assert!(engine.messages().is_empty());
        assert_eq!(engine.model(), "test-model");
        assert_eq!(engine.work_dir(), dir.path());
        assert_eq!(
            rx.recv().await.unwrap(),
            EngineEvent::Messages { messages: vec![] }
        );
    }

    #[tokio::test]
    async fn snapshot_restore_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, mut rx, _) = engine(
            vec![
                Step::events(vec![call("list_directory", json!({}))]),
                Step::events(vec![text("empty")]),
            ],
            dir.path(),
        );
        engine.set_model("custom-model");
        engine.send_message("ls", vec![]).unwrap();
        collect_turn(&mut rx).await;

        let session = engine.snapshot();
        let json = serde_json::to_string(&session).unwrap();
        let restored_session: Session = serde_json::from_str(&json).unwrap();

        let (fresh, _rx, _) = engine_with_default(dir.path());
        fresh.restore(restored_session).unwrap();
        assert_eq!(fresh.history(), engine.history());
        assert_eq!(fresh.messages(), engine.messages());
        assert_eq!(fresh.model(), "custom-model");
        assert_eq!(fresh.snapshot().id, session.id);
    }

    fn engine_with_default(
        work_dir: &Path,
    ) -> (ConversationEngine, mpsc::UnboundedReceiver<EngineEvent>, Arc<ScriptedTransport>) {
        engine(vec![], work_dir)
    }
}
