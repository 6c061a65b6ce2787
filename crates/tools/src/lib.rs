//! Built-in tool set for turnloop.
//!
//! Tools give the agent the ability to interact with the local machine:
//! run shell commands, read, write and edit files, list directories and
//! search file contents. `ask_user` is declared here so the model sees it,
//! but the conversation engine executes it.
//!
//! The set is fixed at compile time: [`BuiltinTool`] is the lookup table and
//! [`BuiltinTools`] exposes it through `BuiltinToolProvider`.

pub mod ask_user;
pub mod file_edit;
pub mod file_read;
pub mod file_write;
pub mod list_dir;
pub mod search;
pub mod shell;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use turnloop_core::{BuiltinToolProvider, FunctionDeclaration, ToolArgs, ToolError};

/// Every built-in tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuiltinTool {
    RunShellCommand,
    ReadFile,
    WriteFile,
    Replace,
    ListDirectory,
    SearchFileContent,
    AskUser,
}

impl BuiltinTool {
    /// Declaration order, which is also the order the model sees.
    pub const ALL: [BuiltinTool; 7] = [
        BuiltinTool::RunShellCommand,
        BuiltinTool::ReadFile,
        BuiltinTool::WriteFile,
        BuiltinTool::Replace,
        BuiltinTool::ListDirectory,
        BuiltinTool::SearchFileContent,
        BuiltinTool::AskUser,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::RunShellCommand => "run_shell_command",
            Self::ReadFile => "read_file",
            Self::WriteFile => "write_file",
            Self::Replace => "replace",
            Self::ListDirectory => "list_directory",
            Self::SearchFileContent => "search_file_content",
            Self::AskUser => ask_user::NAME,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.name() == name)
    }

    /// Read-only tools are the only ones offered in plan mode.
    pub fn is_read_only(self) -> bool {
        matches!(
            self,
            Self::ReadFile | Self::ListDirectory | Self::SearchFileContent | Self::AskUser
        )
    }

    pub fn declaration(self) -> FunctionDeclaration {
        match self {
            Self::RunShellCommand => shell::declaration(),
            Self::ReadFile => file_read::declaration(),
            Self::WriteFile => file_write::declaration(),
            Self::Replace => file_edit::declaration(),
            Self::ListDirectory => list_dir::declaration(),
            Self::SearchFileContent => search::declaration(),
            Self::AskUser => ask_user::declaration(),
        }
    }
}

/// The built-in tool provider handed to the tool router.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinTools;

#[async_trait]
impl BuiltinToolProvider for BuiltinTools {
    fn declarations(&self) -> Vec<FunctionDeclaration> {
        BuiltinTool::ALL.iter().map(|t| t.declaration()).collect()
    }

    fn contains(&self, name: &str) -> bool {
        BuiltinTool::from_name(name).is_some()
    }

    fn is_read_only(&self, name: &str) -> bool {
        BuiltinTool::from_name(name).is_some_and(BuiltinTool::is_read_only)
    }

    async fn execute(
        &self,
        cancel: CancellationToken,
        work_dir: &Path,
        name: &str,
        args: &ToolArgs,
    ) -> Result<String, ToolError> {
        let tool = BuiltinTool::from_name(name).ok_or_else(|| ToolError::NotFound(name.into()))?;
        debug!(tool = name, work_dir = %work_dir.display(), "Executing built-in tool");

        match tool {
            BuiltinTool::RunShellCommand => shell::execute(&cancel, work_dir, args).await,
            BuiltinTool::ReadFile => file_read::execute(work_dir, args).await,
            BuiltinTool::WriteFile => file_write::execute(work_dir, args).await,
            BuiltinTool::Replace => file_edit::execute(work_dir, args).await,
            BuiltinTool::ListDirectory => list_dir::execute(work_dir, args).await,
            BuiltinTool::SearchFileContent => search::execute(&cancel, work_dir, args).await,
            BuiltinTool::AskUser => Err(ToolError::failed(
                ask_user::NAME,
                "ask_user is handled by the conversation engine",
            )),
        }
    }
}

// --- Argument helpers shared by the tool modules ---

pub(crate) fn required_str<'a>(tool: &str, args: &'a ToolArgs, key: &str) -> Result<&'a str, ToolError> {
    match args.get(key).and_then(|v| v.as_str()) {
        Some(s) if !s.is_empty() => Ok(s),
        _ => Err(ToolError::invalid(tool, format!("{key} is required"))),
    }
}

pub(crate) fn optional_str<'a>(args: &'a ToolArgs, key: &str) -> Option<&'a str> {
    args.get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
}

/// Numbers arrive as JSON floats from the model; negative values are ignored.
pub(crate) fn optional_usize(args: &ToolArgs, key: &str) -> Option<usize> {
    let value = args.get(key)?;
    value
        .as_u64()
        .map(|n| n as usize)
        .or_else(|| value.as_f64().filter(|f| *f >= 0.0).map(|f| f as usize))
}

/// Resolve a tool-supplied path against the session working directory.
pub(crate) fn resolve_path(work_dir: &Path, path: &str) -> PathBuf {
    let candidate = Path::new(path);
    if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        work_dir.join(candidate)
    }
}

/// Cut `text` to at most `max` bytes on a char boundary, noting the cut.
pub(crate) fn truncate(text: &mut String, max: usize, note: &str) {
    if text.len() <= max {
        return;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text.truncate(end);
    text.push_str(note);
}
