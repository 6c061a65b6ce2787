//! `replace`: exact literal substitution inside a file.

use std::path::Path;

use serde_json::json;
use turnloop_core::{FunctionDeclaration, ToolArgs, ToolError};

use crate::{optional_usize, required_str, resolve_path};

const NAME: &str = "replace";

pub fn declaration() -> FunctionDeclaration {
    FunctionDeclaration::new(
        NAME,
        "Replaces text within a file. Finds the exact literal old_string and replaces it with \
         new_string. Read the file first and include enough surrounding context to identify the \
         location uniquely.",
        json!({
            "type": "object",
            "properties": {
                "file_path": {
                    "type": "string",
                    "description": "Path to the file to modify."
                },
                "old_string": {
                    "type": "string",
                    "description": "The exact literal text to replace, including whitespace and indentation."
                },
                "new_string": {
                    "type": "string",
                    "description": "The replacement text."
                },
                "expected_replacements": {
                    "type": "number",
                    "description": "Optional: number of replacements expected. Defaults to 1."
                }
            },
            "required": ["file_path", "old_string", "new_string"]
        }),
    )
}

pub async fn execute(work_dir: &Path, args: &ToolArgs) -> Result<String, ToolError> {
    let path = resolve_path(work_dir, required_str(NAME, args, "file_path")?);
    let old = required_str(NAME, args, "old_string")?;
    let new = args.get("new_string").and_then(|v| v.as_str()).unwrap_or_default();
    let expected = optional_usize(args, "expected_replacements").unwrap_or(1);

    let content = tokio::fs::read_to_string(&path)
        .await
        .map_err(|e| ToolError::failed(NAME, format!("failed to read file: {e}")))?;

    let updated = substitute(&content, old, new, expected).map_err(|reason| ToolError::failed(NAME, reason))?;

    tokio::fs::write(&path, updated)
        .await
        .map_err(|e| ToolError::failed(NAME, format!("failed to write file: {e}")))?;

    Ok(format!(
        "Successfully replaced {expected} occurrence(s) in {}",
        path.display()
    ))
}

fn substitute(content: &str, old: &str, new: &str, expected: usize) -> Result<String, String> {
    let count = content.matches(old).count();
    if count == 0 {
        return Err(
            "old_string not found in file. Make sure the text matches exactly including whitespace"
                .into(),
        );
    }
    if expected == 1 && count > 1 {
        return Err(format!(
            "old_string matches {count} locations. Include more context to uniquely identify the \
             target, or set expected_replacements={count}"
        ));
    }
    if count != expected {
        return Err(format!(
            "expected {expected} replacements but found {count} matches"
        ));
    }
    Ok(content.replacen(old, new, expected))
}
