//! System prompt construction.
//!
//! The prompt is rebuilt for every model request so that changes to the
//! working directory or plan mode are picked up immediately.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

const CORE_PROMPT: &str = "\
You are an interactive command-line agent for software engineering tasks. Help the user \
safely and efficiently, using the tools available to you.

# Working rules

- Follow the conventions of the project you are working in. Read surrounding code, tests and \
configuration before changing anything.
- Never assume a library is available. Check the project's manifests and imports first.
- Keep changes idiomatic for the code around them. Add comments sparingly.
- Do what was asked, including obvious follow-up steps, but confirm before going beyond the \
request.
- Build full paths for file tools by joining the project root with the relative path.
- Do not revert changes you did not make unless asked.

# Workflow

1. Understand: search and read the relevant code.
2. Plan: form a concrete plan and share it briefly when it helps.
3. Implement: use the tools to carry out the plan.
4. Verify: run the project's own tests, build and lint commands.

# Style

Be concise and direct. Use GitHub-flavored Markdown. Explain commands that modify files or \
system state before running them. Never expose secrets. Keep going until the request is \
resolved.";

const PLAN_MODE_SECTION: &str = "\n\n## Plan mode\n\
Plan mode is on. Use only read-only tools to explore the code and design an implementation \
plan. Do not modify any files. Present the plan to the user for approval before proceeding.";

/// Project instructions picked up from the working directory.
pub const PROJECT_INSTRUCTIONS_FILE: &str = "TURNLOOP.md";

const TREE_LIMIT: usize = 200;
const SUBDIR_LIMIT: usize = 10;
const SKIPPED: [&str; 5] = ["node_modules", "vendor", "__pycache__", "dist", "build"];

/// Full system instruction for one request.
pub fn build_system_prompt(work_dir: &Path, plan_mode: bool) -> String {
    let mut out = String::from(CORE_PROMPT);
    out.push_str("\n\n# Environment\n\n");
    let _ = writeln!(
        out,
        "Today's date is {}.",
        chrono::Local::now().format("%Y-%m-%d (%A)")
    );
    let _ = writeln!(
        out,
        "Operating system: {}/{}",
        std::env::consts::OS,
        std::env::consts::ARCH
    );

    if !work_dir.as_os_str().is_empty() {
        let _ = writeln!(out, "Current working directory: {}", work_dir.display());
        out.push_str("\nFolder structure of the current working directory:\n\n```\n");
        out.push_str(&directory_tree(work_dir));
        out.push_str("```\n");

        if work_dir.join(".git").exists() {
            out.push_str("\nThis directory is managed by a git repository.\n");
        }
        if let Ok(instructions) = fs::read_to_string(work_dir.join(PROJECT_INSTRUCTIONS_FILE)) {
            let _ = write!(
                out,
                "\n# Project instructions ({PROJECT_INSTRUCTIONS_FILE})\n\n{instructions}\n"
            );
        }
    }

    if plan_mode {
        out.push_str(PLAN_MODE_SECTION);
    }
    out
}

fn visible(name: &str) -> bool {
    !name.starts_with('.') && !SKIPPED.contains(&name)
}

/// Sorted entries, directories first, hidden and build output skipped.
fn sorted_entries(dir: &Path) -> Vec<(String, bool)> {
    let Ok(read) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut entries: Vec<(String, bool)> = read
        .filter_map(Result::ok)
        .map(|e| {
            let is_dir = e.file_type().is_ok_and(|t| t.is_dir());
            (e.file_name().to_string_lossy().into_owned(), is_dir)
        })
        .filter(|(name, _)| visible(name))
        .collect();
    entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    entries
}

/// Two-level tree of `root`, capped at a fixed number of entries.
fn directory_tree(root: &Path) -> String {
    let mut out = format!("{}/\n", root.display());
    let entries = sorted_entries(root);
    let mut count = 0;

    for (i, (name, is_dir)) in entries.iter().enumerate() {
        if count >= TREE_LIMIT {
            out.push_str("└── ... (truncated)\n");
            break;
        }
        let last = i + 1 == entries.len();
        let branch = if last { "└── " } else { "├── " };
        count += 1;

        if !is_dir {
            let _ = writeln!(out, "{branch}{name}");
            continue;
        }
        let _ = writeln!(out, "{branch}{name}/");

        let indent = if last { "    " } else { "│   " };
        let children = sorted_entries(&root.join(name));
        for (j, (child, child_is_dir)) in children.iter().enumerate() {
            if j >= SUBDIR_LIMIT {
                let _ = writeln!(out, "{indent}└── ... ({} more)", children.len() - j);
                break;
            }
            let child_branch = if j + 1 == children.len() { "└── " } else { "├── " };
            let suffix = if *child_is_dir { "/" } else { "" };
            let _ = writeln!(out, "{indent}{child_branch}{child}{suffix}");
            count += 1;
        }
    }
    out
}
