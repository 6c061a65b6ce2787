//! `write_file`: create or overwrite a file, creating parent directories.

use std::path::Path;

use serde_json::json;
use turnloop_core::{FunctionDeclaration, ToolArgs, ToolError};

use crate::{required_str, resolve_path};

const NAME: &str = "write_file";

pub fn declaration() -> FunctionDeclaration {
    FunctionDeclaration::new(
        NAME,
        "Writes content to a file. Creates the file if it doesn't exist and overwrites it if it \
         does. Parent directories are created as needed.",
        json!({
            "type": "object",
            "properties": {
                "file_path": {
                    "type": "string",
                    "description": "Path to the file to write."
                },
                "content": {
                    "type": "string",
                    "description": "The content to write to the file."
                }
            },
            "required": ["file_path", "content"]
        }),
    )
}

pub async fn execute(work_dir: &Path, args: &ToolArgs) -> Result<String, ToolError> {
    let path = resolve_path(work_dir, required_str(NAME, args, "file_path")?);
    let content = args.get("content").and_then(|v| v.as_str()).unwrap_or_default();

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| ToolError::failed(NAME, format!("failed to create directory: {e}")))?;
    }
    tokio::fs::write(&path, content)
        .await
        .map_err(|e| ToolError::failed(NAME, format!("failed to write file: {e}")))?;

    Ok(format!(
        "Successfully wrote {} bytes to {}",
        content.len(),
        path.display()
    ))
}
