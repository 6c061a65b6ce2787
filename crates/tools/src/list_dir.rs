//! `list_directory`: one entry per line, directories suffixed with `/`.

use std::path::Path;

use serde_json::json;
use turnloop_core::{FunctionDeclaration, ToolArgs, ToolError};

use crate::{optional_str, resolve_path};

const NAME: &str = "list_directory";

pub fn declaration() -> FunctionDeclaration {
    FunctionDeclaration::new(
        NAME,
        "Lists files and subdirectories in a directory. Directories have a trailing /.",
        json!({
            "type": "object",
            "properties": {
                "dir_path": {
                    "type": "string",
                    "description": "Directory to list. Defaults to the working directory."
                }
            }
        }),
    )
}

pub async fn execute(work_dir: &Path, args: &ToolArgs) -> Result<String, ToolError> {
    let dir = optional_str(args, "dir_path")
        .map(|d| resolve_path(work_dir, d))
        .unwrap_or_else(|| work_dir.to_path_buf());

    let read_err = |e: std::io::Error| ToolError::failed(NAME, format!("failed to read directory: {e}"));
    let mut entries = tokio::fs::read_dir(&dir).await.map_err(read_err)?;

    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(read_err)? {
        let mut name = entry.file_name().to_string_lossy().into_owned();
        if entry.file_type().await.is_ok_and(|t| t.is_dir()) {
            name.push('/');
        }
        names.push(name);
    }

    if names.is_empty() {
        return Ok("(empty directory)".into());
    }
    names.sort();
    Ok(names.join("\n"))
}
