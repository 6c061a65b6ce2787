//! Display messages and the persistable session snapshot.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::content::Content;

/// Who a display entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayRole {
    User,
    Model,
    ToolCall,
    ToolResult,
}

/// A UI-facing projection of the conversation.
///
/// A tool call and its result are two entries here, while the history holds
/// them as one model turn and one user turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayMessage {
    pub id: String,
    pub role: DisplayRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_args: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl DisplayMessage {
    pub fn new(role: DisplayRole, content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            tool_name: None,
            tool_args: None,
            timestamp: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(DisplayRole::User, content)
    }

    pub fn model(content: impl Into<String>) -> Self {
        Self::new(DisplayRole::Model, content)
    }

    pub fn tool_call(name: impl Into<String>, args_json: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            tool_name: Some(name.clone()),
            tool_args: Some(args_json.into()),
            ..Self::new(DisplayRole::ToolCall, name)
        }
    }

    pub fn tool_result(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            tool_name: Some(name.into()),
            ..Self::new(DisplayRole::ToolResult, text)
        }
    }
}

/// Everything needed to resume a conversation later.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub model: String,
    pub work_dir: PathBuf,
    #[serde(default)]
    pub history: Vec<Content>,
    #[serde(default)]
    pub messages: Vec<DisplayMessage>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(model: impl Into<String>, work_dir: impl Into<PathBuf>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            model: model.into(),
            work_dir: work_dir.into(),
            history: Vec::new(),
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}
