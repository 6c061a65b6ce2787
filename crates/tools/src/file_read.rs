//! `read_file`: whole-file reads, or a numbered line window.

use std::fmt::Write as _;
use std::path::Path;

use serde_json::json;
use turnloop_core::{FunctionDeclaration, ToolArgs, ToolError};

use crate::{optional_usize, required_str, resolve_path};

const NAME: &str = "read_file";
const MAX_BYTES: usize = 100_000;

pub fn declaration() -> FunctionDeclaration {
    FunctionDeclaration::new(
        NAME,
        "Reads and returns the content of a file. For text files, a line range can be read \
         with offset and limit.",
        json!({
            "type": "object",
            "properties": {
                "file_path": {
                    "type": "string",
                    "description": "Path to the file to read."
                },
                "offset": {
                    "type": "number",
                    "description": "Optional: 0-based line number to start reading from."
                },
                "limit": {
                    "type": "number",
                    "description": "Optional: maximum number of lines to read."
                }
            },
            "required": ["file_path"]
        }),
    )
}

pub async fn execute(work_dir: &Path, args: &ToolArgs) -> Result<String, ToolError> {
    let path = resolve_path(work_dir, required_str(NAME, args, "file_path")?);
    let content = tokio::fs::read_to_string(&path)
        .await
        .map_err(|e| ToolError::failed(NAME, format!("failed to read {}: {e}", path.display())))?;

    let offset = optional_usize(args, "offset");
    let limit = optional_usize(args, "limit");
    if offset.is_some() || limit.is_some() {
        return Ok(window(&content, offset.unwrap_or(0), limit));
    }

    if content.len() > MAX_BYTES {
        let mut end = MAX_BYTES;
        while !content.is_char_boundary(end) {
            end -= 1;
        }
        return Ok(format!(
            "{}\n... (truncated, total {} bytes. Use offset/limit to read more.)",
            &content[..end],
            content.len()
        ));
    }
    Ok(content)
}

/// Lines `offset..offset+limit`, numbered from 1.
fn window(content: &str, offset: usize, limit: Option<usize>) -> String {
    let lines: Vec<&str> = content.split('\n').collect();
    if offset >= lines.len() {
        return "(offset beyond end of file)".into();
    }
    let end = limit
        .map(|l| offset.saturating_add(l).min(lines.len()))
        .unwrap_or(lines.len());

    let mut out = String::new();
    for (i, line) in lines[offset..end].iter().enumerate() {
        let _ = writeln!(out, "{}: {line}", offset + i + 1);
    }
    out
}
