//! Progress events emitted by the conversation engine.
//!
//! `EngineEvent` is what a front end consumes: live stream deltas, tool
//! activity, turn completion, display-list refreshes and ask-user prompts.

use serde::{Deserialize, Serialize};
use turnloop_core::{DisplayMessage, Usage};

use crate::ask_user::AskUserQuestion;

/// Events sent over the engine's progress channel.
///
/// - `start`: the model began answering
/// - `content`: partial answer text
/// - `thought`: partial reasoning text
/// - `tool_call`: the model requested a tool
/// - `tool_result`: a tool finished
/// - `done`: the turn completed
/// - `error`: the turn was aborted
/// - `messages`: the display list changed
/// - `ask_user`: the model is waiting on an answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    Start { model: String },

    Content { text: String },

    Thought { text: String },

    ToolCall { name: String, args: String },

    ToolResult { name: String, text: String },

    /// Usage is summed over every model request of the turn.
    Done { usage: Usage },

    Error { message: String },

    Messages { messages: Vec<DisplayMessage> },

    AskUser { questions: Vec<AskUserQuestion> },
}

impl EngineEvent {
    /// Wire name of this event type.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::Content { .. } => "content",
            Self::Thought { .. } => "thought",
            Self::ToolCall { .. } => "tool_call",
            Self::ToolResult { .. } => "tool_result",
            Self::Done { .. } => "done",
            Self::Error { .. } => "error",
            Self::Messages { .. } => "messages",
            Self::AskUser { .. } => "ask_user",
        }
    }

    /// Whether this event ends a turn.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }
}
