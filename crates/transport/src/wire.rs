//! Request/response envelopes of the generation API.
//!
//! Request:  `{model, project?, request: {contents, systemInstruction?, tools?, generationConfig?}}`
//! Response: `{response: {candidates: [{content, finishReason}], usageMetadata}}`
//!
//! Streaming chunks use the same response envelope, one per SSE `data:` line.

use serde::{Deserialize, Deserializer, Serialize};
use tracing::debug;
use turnloop_core::{
    Content, FunctionDeclaration, GenerateRequest, GenerateResponse, GenerationConfig, Part, Role,
    StreamEvent, Usage,
};

#[derive(Debug, Serialize)]
pub struct RequestEnvelope<'a> {
    model: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    project: Option<&'a str>,
    request: InnerRequest<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InnerRequest<'a> {
    contents: &'a [Content],
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<SystemInstruction>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ToolGroup<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<&'a GenerationConfig>,
}

#[derive(Debug, Serialize)]
struct SystemInstruction {
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolGroup<'a> {
    function_declarations: &'a [FunctionDeclaration],
}

impl<'a> RequestEnvelope<'a> {
    pub fn new(request: &'a GenerateRequest) -> Self {
        let tools = if request.tools.is_empty() {
            Vec::new()
        } else {
            vec![ToolGroup {
                function_declarations: &request.tools,
            }]
        };
        Self {
            model: &request.model,
            project: request.project.as_deref().filter(|p| !p.is_empty()),
            request: InnerRequest {
                contents: &request.contents,
                system_instruction: request
                    .system_instruction
                    .as_ref()
                    .map(|text| SystemInstruction {
                        parts: vec![Part::text(text.clone())],
                    }),
                tools,
                generation_config: request.generation_config.as_ref(),
            },
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ResponseEnvelope {
    #[serde(default)]
    pub response: InnerResponse,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InnerResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    #[serde(default)]
    pub usage_metadata: UsageMetadata,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    #[serde(default)]
    pub content: CandidateContent,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

/// Candidate content. Chunks may omit the role, so it is optional here.
#[derive(Debug, Default, Deserialize)]
pub struct CandidateContent {
    #[serde(default)]
    pub role: Option<Role>,
    #[serde(default, deserialize_with = "known_parts")]
    pub parts: Vec<Part>,
}

/// Decode each part on its own, dropping ones this client does not
/// understand so their siblings survive.
fn known_parts<'de, D>(deserializer: D) -> Result<Vec<Part>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Vec<serde_json::Value>>::deserialize(deserializer)?.unwrap_or_default();
    Ok(raw
        .into_iter()
        .filter_map(|value| match serde_json::from_value::<Part>(value) {
            Ok(part) => Some(part),
            Err(e) => {
                debug!(error = %e, "Skipping unrecognized response part");
                None
            }
        })
        .collect())
}

#[derive(Debug, Default, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetadata {
    #[serde(default)]
    pub prompt_token_count: u32,
    #[serde(default)]
    pub candidates_token_count: u32,
    #[serde(default)]
    pub total_token_count: u32,
}

impl From<UsageMetadata> for Usage {
    fn from(meta: UsageMetadata) -> Self {
        Usage {
            prompt_tokens: meta.prompt_token_count,
            completion_tokens: meta.candidates_token_count,
            total_tokens: meta.total_token_count,
        }
    }
}

impl From<ResponseEnvelope> for GenerateResponse {
    fn from(envelope: ResponseEnvelope) -> Self {
        let usage = envelope.response.usage_metadata.into();
        let first = envelope.response.candidates.into_iter().next();
        match first {
            Some(candidate) => GenerateResponse {
                content: Some(Content::new(
                    candidate.content.role.unwrap_or(Role::Model),
                    candidate.content.parts,
                )),
                finish_reason: candidate.finish_reason,
                usage,
            },
            None => GenerateResponse {
                content: None,
                finish_reason: None,
                usage,
            },
        }
    }
}

impl ResponseEnvelope {
    /// Stream events carried by one chunk, in part order.
    ///
    /// Empty text and empty thoughts are dropped; function calls keep their
    /// signature.
    pub fn stream_events(&self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        for candidate in &self.response.candidates {
            for part in &candidate.content.parts {
                match part {
                    Part::Text { text } if !text.is_empty() => {
                        events.push(StreamEvent::Content { text: text.clone() })
                    }
                    Part::Thought { text, .. } if !text.is_empty() => {
                        events.push(StreamEvent::Thought { text: text.clone() })
                    }
                    Part::FunctionCall { call, signature } => events.push(StreamEvent::ToolCall {
                        call: call.clone(),
                        signature: signature.clone(),
                    }),
                    _ => {}
                }
            }
        }
        events
    }

    /// Usage carried by this chunk, if any tokens were counted.
    pub fn usage(&self) -> Option<Usage> {
        let usage: Usage = self.response.usage_metadata.into();
        (!usage.is_empty()).then_some(usage)
    }
}
