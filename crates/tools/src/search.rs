//! `search_file_content`: recursive literal search.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use serde_json::json;
use tokio_util::sync::CancellationToken;
use turnloop_core::{FunctionDeclaration, ToolArgs, ToolError};

use crate::{optional_str, required_str, resolve_path};

const NAME: &str = "search_file_content";
const MAX_MATCHES: usize = 500;
const SKIP_DIRS: [&str; 6] = ["node_modules", ".git", "target", "vendor", "dist", "build"];

pub fn declaration() -> FunctionDeclaration {
    FunctionDeclaration::new(
        NAME,
        "Searches file contents below a directory for a literal string. Returns matching lines \
         as `path:line: text`.",
        json!({
            "type": "object",
            "properties": {
                "pattern": {
                    "type": "string",
                    "description": "The literal text to search for."
                },
                "dir_path": {
                    "type": "string",
                    "description": "Optional: directory to search. Defaults to the working directory."
                }
            },
            "required": ["pattern"]
        }),
    )
}

pub async fn execute(
    cancel: &CancellationToken,
    work_dir: &Path,
    args: &ToolArgs,
) -> Result<String, ToolError> {
    let pattern = required_str(NAME, args, "pattern")?;
    let root = optional_str(args, "dir_path")
        .map(|d| resolve_path(work_dir, d))
        .unwrap_or_else(|| work_dir.to_path_buf());

    let files = collect_files(&root)
        .await
        .map_err(|e| ToolError::failed(NAME, format!("failed to walk {}: {e}", root.display())))?;

    let mut out = String::new();
    let mut matches = 0;
    'files: for file in files {
        if cancel.is_cancelled() {
            return Err(ToolError::Cancelled);
        }
        // Binary and non-UTF-8 files are skipped.
        let Ok(content) = tokio::fs::read_to_string(&file).await else {
            continue;
        };
        let rel = file.strip_prefix(&root).unwrap_or(&file);
        for (n, line) in content.lines().enumerate() {
            if line.contains(pattern) {
                let _ = writeln!(out, "{}:{}: {}", rel.display(), n + 1, line.trim());
                matches += 1;
                if matches >= MAX_MATCHES {
                    let _ = writeln!(out, "... (results capped at {MAX_MATCHES} matches)");
                    break 'files;
                }
            }
        }
    }

    if matches == 0 {
        return Ok("(no matches found)".into());
    }
    Ok(out)
}

/// Every regular file below `root`, depth-first in name order.
async fn collect_files(root: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        let mut children = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            children.push(entry);
        }
        children.sort_by_key(|e| e.file_name());

        let mut subdirs = Vec::new();
        for entry in children {
            let Ok(kind) = entry.file_type().await else {
                continue;
            };
            if kind.is_dir() {
                if !SKIP_DIRS.iter().any(|s| entry.file_name() == *s) {
                    subdirs.push(entry.path());
                }
            } else if kind.is_file() {
                files.push(entry.path());
            }
        }
        pending.extend(subdirs.into_iter().rev());
    }
    Ok(files)
}
