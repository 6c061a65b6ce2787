//! Shell tool: run a command through the platform shell.
//!
//! Output is stdout followed by stderr. A non-zero exit is reported in the
//! result text rather than as a tool error, so the model can react to it.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use serde_json::json;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use turnloop_core::{FunctionDeclaration, ToolArgs, ToolError};

use crate::{optional_str, required_str, resolve_path, truncate};

const NAME: &str = "run_shell_command";
const TIMEOUT: Duration = Duration::from_secs(120);
const MAX_OUTPUT: usize = 50_000;

pub fn declaration() -> FunctionDeclaration {
    FunctionDeclaration::new(
        NAME,
        "Executes a shell command (`sh -c` on Unix, `cmd /C` on Windows). Returns combined \
         stdout/stderr and the exit code if non-zero. Use for builds, tests, git and other CLI tasks.",
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute."
                },
                "description": {
                    "type": "string",
                    "description": "Brief description of what the command does."
                },
                "dir_path": {
                    "type": "string",
                    "description": "Optional: directory to run in. Defaults to the working directory."
                }
            },
            "required": ["command"]
        }),
    )
}

fn shell_command(command: &str) -> Command {
    if cfg!(target_os = "windows") {
        let mut cmd = Command::new("cmd");
        cmd.args(["/C", command]);
        cmd
    } else {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", command]);
        cmd
    }
}

pub async fn execute(
    cancel: &CancellationToken,
    work_dir: &Path,
    args: &ToolArgs,
) -> Result<String, ToolError> {
    let command = required_str(NAME, args, "command")?;
    let dir = optional_str(args, "dir_path")
        .map(|d| resolve_path(work_dir, d))
        .unwrap_or_else(|| work_dir.to_path_buf());

    debug!(command = %command, dir = %dir.display(), "Executing shell command");

    let child = shell_command(command)
        .current_dir(&dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| ToolError::failed(NAME, format!("command error: {e}")))?;

    // Dropping the wait future on cancel or timeout kills the child.
    let output = tokio::select! {
        _ = cancel.cancelled() => return Err(ToolError::Cancelled),
        res = tokio::time::timeout(TIMEOUT, child.wait_with_output()) => match res {
            Ok(out) => out.map_err(|e| ToolError::failed(NAME, format!("command error: {e}")))?,
            Err(_) => {
                return Err(ToolError::failed(
                    NAME,
                    format!("command timed out after {}s", TIMEOUT.as_secs()),
                ));
            }
        },
    };

    let mut result = String::from_utf8_lossy(&output.stdout).into_owned();
    result.push_str(&String::from_utf8_lossy(&output.stderr));
    truncate(&mut result, MAX_OUTPUT, "\n... (output truncated)");

    if !output.status.success() {
        let code = output.status.code().unwrap_or(-1);
        warn!(command = %command, exit_code = code, "Command failed");
        return Ok(format!("{result}\nExit code: {code}"));
    }

    if result.is_empty() {
        result = "(empty output)".into();
    }
    Ok(result)
}
