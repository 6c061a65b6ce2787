//! Questions posed through the `ask_user` tool.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use turnloop_core::{ToolArgs, ToolError};

/// Answer recorded when the turn is cancelled while a question is open.
pub const CANCELLED_ANSWER: &str = "User cancelled the question.";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuestionKind {
    Choice,
    #[default]
    Text,
    YesNo,
}

impl QuestionKind {
    fn parse(s: &str) -> Self {
        match s {
            "choice" => Self::Choice,
            "yesno" => Self::YesNo,
            _ => Self::Text,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AskUserOption {
    pub label: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AskUserQuestion {
    pub question: String,
    #[serde(default)]
    pub header: String,
    #[serde(rename = "type", default)]
    pub kind: QuestionKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<AskUserOption>,
}

impl AskUserQuestion {
    pub fn text(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            header: "Question".into(),
            kind: QuestionKind::Text,
            options: Vec::new(),
        }
    }
}

fn str_field(map: &serde_json::Map<String, Value>, key: &str) -> String {
    map.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Read the question set from tool arguments.
///
/// Accepts a `questions` array, or a lone `question` string. Malformed
/// entries inside the array are dropped.
pub fn parse_questions(args: &ToolArgs) -> Result<Vec<AskUserQuestion>, ToolError> {
    let listed = args
        .get("questions")
        .and_then(Value::as_array)
        .filter(|qs| !qs.is_empty());

    let Some(listed) = listed else {
        return match args.get("question").and_then(Value::as_str) {
            Some(q) if !q.is_empty() => Ok(vec![AskUserQuestion::text(q)]),
            _ => Err(ToolError::invalid("ask_user", "questions array is required")),
        };
    };

    Ok(listed
        .iter()
        .filter_map(Value::as_object)
        .map(|q| AskUserQuestion {
            question: str_field(q, "question"),
            header: str_field(q, "header"),
            kind: QuestionKind::parse(&str_field(q, "type")),
            options: q
                .get("options")
                .and_then(Value::as_array)
                .map(|opts| {
                    opts.iter()
                        .filter_map(Value::as_object)
                        .map(|o| AskUserOption {
                            label: str_field(o, "label"),
                            description: str_field(o, "description"),
                        })
                        .collect()
                })
                .unwrap_or_default(),
        })
        .collect())
}
