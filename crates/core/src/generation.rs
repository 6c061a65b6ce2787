//! Transport trait: the abstraction over the generation backend.
//!
//! A Transport knows how to send the conversation history to the model and
//! get a response back, either as one complete turn or as a stream of events.
//! The conversation engine only ever talks to this trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::content::{Content, FunctionCall};
use crate::error::TransportError;
use crate::tool::FunctionDeclaration;

/// Everything needed for one generation request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerateRequest {
    /// The model to use (e.g., "gemini-2.5-pro")
    pub model: String,

    /// Optional project identifier forwarded with the request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,

    /// The full conversation history
    pub contents: Vec<Content>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<String>,

    /// Tools the model can call
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<FunctionDeclaration>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
}

/// Sampling knobs forwarded to the model as-is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_config: Option<ThinkingConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThinkingConfig {
    /// Ask the model to stream its reasoning as thought parts
    #[serde(default)]
    pub include_thoughts: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_budget: Option<i32>,
}

/// A complete (non-streaming) response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateResponse {
    /// The model turn, if the backend returned a candidate
    pub content: Option<Content>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,

    #[serde(default)]
    pub usage: Usage,
}

/// Token usage information.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn is_empty(&self) -> bool {
        self.total_tokens == 0
    }
}

impl std::ops::AddAssign for Usage {
    fn add_assign(&mut self, other: Self) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// One incremental event of a streamed generation.
///
/// A stream always starts with `Start` and ends with exactly one `Done`,
/// even when an `Error` was emitted before it.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Start { model: String },
    Content { text: String },
    Thought { text: String },
    ToolCall {
        call: FunctionCall,
        signature: Option<String>,
    },
    Error { message: String },
    Done { usage: Usage },
}

/// The generation backend.
///
/// Implementations retry rate limits internally; every error returned here is
/// terminal for the current turn.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and wait for the complete model turn.
    async fn generate(
        &self,
        request: GenerateRequest,
        cancel: CancellationToken,
    ) -> std::result::Result<GenerateResponse, TransportError>;

    /// Send a request and receive the model turn as a stream of events.
    ///
    /// Errors returned directly happen before the stream opens. Once open,
    /// failures arrive as `StreamEvent::Error` followed by `StreamEvent::Done`.
    async fn stream_generate(
        &self,
        request: GenerateRequest,
        cancel: CancellationToken,
    ) -> std::result::Result<mpsc::Receiver<StreamEvent>, TransportError>;
}
