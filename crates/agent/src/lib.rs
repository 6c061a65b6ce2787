//! The conversation core of turnloop.
//!
//! The engine follows a **stream → act → feed back** cycle:
//!
//! 1. **Receive** a user message (text plus optional attachments)
//! 2. **Build the request**: history, system prompt, tool declarations
//! 3. **Stream** the model turn through the transport
//! 4. **If tool calls**: run them in order, append the results, go back to 3
//! 5. **Otherwise**: the turn is done
//!
//! Tool calls are routed by [`ToolRouter`] to the built-in set or to an MCP
//! server. The `ask_user` tool and the plan-mode gate live in the engine.

pub mod ask_user;
pub mod engine;
pub mod event;
pub mod prompt;
pub mod router;

#[cfg(test)]
mod test_support;

pub use ask_user::{AskUserOption, AskUserQuestion, QuestionKind};
pub use engine::{Attachment, ConversationEngine, EngineConfig, Phase};
pub use event::EngineEvent;
pub use prompt::build_system_prompt;
pub use router::{Route, ToolRouter, sanitize};
