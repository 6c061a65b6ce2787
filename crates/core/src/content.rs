//! Content and Part domain types.
//!
//! A [`Content`] is one turn of the conversation: a role plus an ordered list of
//! [`Part`]s. History is a `Vec<Content>` and is sent verbatim to the model on
//! every request, so the serde shape here is the model API's wire shape.

use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Deserializer, Serialize};

/// Argument / response maps exchanged with tools.
pub type ToolArgs = serde_json::Map<String, serde_json::Value>;

/// The author of a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The end user, and also tool results fed back to the model
    User,
    /// The model
    Model,
}

/// A single turn in the conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Content {
    pub role: Role,
    #[serde(default)]
    pub parts: Vec<Part>,
}

impl Content {
    pub fn new(role: Role, parts: Vec<Part>) -> Self {
        Self { role, parts }
    }

    pub fn user(parts: Vec<Part>) -> Self {
        Self::new(Role::User, parts)
    }

    pub fn model(parts: Vec<Part>) -> Self {
        Self::new(Role::Model, parts)
    }

    /// A user turn holding a single text part.
    pub fn user_text(text: impl Into<String>) -> Self {
        Self::user(vec![Part::text(text)])
    }

    /// Function calls in this turn, in order.
    pub fn function_calls(&self) -> impl Iterator<Item = &FunctionCall> {
        self.parts.iter().filter_map(Part::as_function_call)
    }

    /// Function responses in this turn, in order.
    pub fn function_responses(&self) -> impl Iterator<Item = &FunctionResponse> {
        self.parts.iter().filter_map(|p| match p {
            Part::FunctionResponse(resp) => Some(resp),
            _ => None,
        })
    }

    /// Concatenated non-thought text of this turn.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }
}

/// One semantic unit within a [`Content`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WirePart", into = "WirePart")]
pub enum Part {
    Text {
        text: String,
    },
    /// Reasoning text. The signature is opaque and must be echoed back unchanged.
    Thought {
        text: String,
        signature: Option<String>,
    },
    FunctionCall {
        call: FunctionCall,
        signature: Option<String>,
    },
    FunctionResponse(FunctionResponse),
    InlineData(InlineData),
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn thought(text: impl Into<String>) -> Self {
        Self::Thought {
            text: text.into(),
            signature: None,
        }
    }

    pub fn function_call(call: FunctionCall, signature: Option<String>) -> Self {
        Self::FunctionCall { call, signature }
    }

    pub fn function_response(response: FunctionResponse) -> Self {
        Self::FunctionResponse(response)
    }

    pub fn inline_data(mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self::InlineData(InlineData {
            mime_type: mime_type.into(),
            data,
        })
    }

    pub fn as_function_call(&self) -> Option<&FunctionCall> {
        match self {
            Self::FunctionCall { call, .. } => Some(call),
            _ => None,
        }
    }
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub args: ToolArgs,
}

impl FunctionCall {
    pub fn new(name: impl Into<String>, args: ToolArgs) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }

    /// Arguments rendered as compact JSON, for display and progress events.
    pub fn args_json(&self) -> String {
        serde_json::to_string(&self.args).unwrap_or_else(|_| "{}".into())
    }
}

/// The result of a tool invocation, fed back to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionResponse {
    pub name: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub response: ToolArgs,
}

impl FunctionResponse {
    /// The `{"result": text}` shape used for every tool result.
    pub fn result(name: impl Into<String>, text: impl Into<String>) -> Self {
        let mut response = ToolArgs::new();
        response.insert("result".into(), serde_json::Value::String(text.into()));
        Self {
            name: name.into(),
            response,
        }
    }

    /// The `result` string, if this response has one.
    pub fn result_text(&self) -> Option<&str> {
        self.response.get("result").and_then(|v| v.as_str())
    }
}

/// Binary data sent inline with a turn (images, documents).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    pub mime_type: String,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<ToolArgs, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<ToolArgs>::deserialize(deserializer)?.unwrap_or_default())
}

mod base64_bytes {
    use super::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

// --- Wire shape ---
//
// The model API uses one flat object per part with optional fields; exactly
// one of them (besides `thought` / `thoughtSignature`) is meaningful.

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePart {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    thought: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    thought_signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    function_call: Option<FunctionCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    function_response: Option<FunctionResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    inline_data: Option<InlineData>,
}

impl TryFrom<WirePart> for Part {
    type Error = String;

    fn try_from(wire: WirePart) -> Result<Self, Self::Error> {
        if let Some(call) = wire.function_call {
            return Ok(Part::FunctionCall {
                call,
                signature: wire.thought_signature,
            });
        }
        if let Some(response) = wire.function_response {
            return Ok(Part::FunctionResponse(response));
        }
        if let Some(data) = wire.inline_data {
            return Ok(Part::InlineData(data));
        }
        match wire.text {
            Some(text) if wire.thought => Ok(Part::Thought {
                text,
                signature: wire.thought_signature,
            }),
            Some(text) => Ok(Part::Text { text }),
            None if wire.thought_signature.is_some() => Ok(Part::Thought {
                text: String::new(),
                signature: wire.thought_signature,
            }),
            None => Err("part carries no text, function call, function response or inline data".into()),
        }
    }
}

impl From<Part> for WirePart {
    fn from(part: Part) -> Self {
        match part {
            Part::Text { text } => WirePart {
                text: Some(text),
                ..Default::default()
            },
            Part::Thought { text, signature } => WirePart {
                text: Some(text),
                thought: true,
                thought_signature: signature,
                ..Default::default()
            },
            Part::FunctionCall { call, signature } => WirePart {
                function_call: Some(call),
                thought_signature: signature,
                ..Default::default()
            },
            Part::FunctionResponse(response) => WirePart {
                function_response: Some(response),
                ..Default::default()
            },
            Part::InlineData(data) => WirePart {
                inline_data: Some(data),
                ..Default::default()
            },
        }
    }
}
