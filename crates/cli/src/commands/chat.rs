//! `turnloop chat`: interactive or single-message chat.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{info, warn};
use turnloop_agent::{
    AskUserQuestion, Attachment, ConversationEngine, EngineConfig, EngineEvent, QuestionKind,
    ToolRouter,
};
use turnloop_config::AppConfig;
use turnloop_core::{Error, Result, StaticCredentials};
use turnloop_mcp::McpManager;
use turnloop_tools::BuiltinTools;
use turnloop_transport::GeminiTransport;

/// Longest tool argument or result preview printed in the transcript.
const PREVIEW_CHARS: usize = 200;

pub struct ChatOptions {
    pub message: Option<String>,
    pub workdir: Option<PathBuf>,
    pub model: Option<String>,
    pub plan: bool,
}

pub async fn run(opts: ChatOptions) -> Result<()> {
    let config = AppConfig::load().map_err(|e| Error::config(format!("failed to load config: {e}")))?;

    if !config.has_api_key() {
        eprintln!();
        eprintln!("  ERROR: No API key configured!");
        eprintln!();
        eprintln!("  Set one of these environment variables:");
        eprintln!("    TURNLOOP_API_KEY=...");
        eprintln!("    GEMINI_API_KEY=...");
        eprintln!();
        eprintln!("  Or add `api_key` to your config file:");
        eprintln!("    {}", AppConfig::config_dir().join("config.toml").display());
        eprintln!();
        return Err(Error::config("no API key found, see above for setup instructions"));
    }

    let work_dir = match opts.workdir {
        Some(dir) => dir,
        None => std::env::current_dir()?,
    };
    let work_dir = work_dir
        .canonicalize()
        .map_err(|e| Error::config(format!("working directory {}: {e}", work_dir.display())))?;

    let credentials = Arc::new(StaticCredentials::from(config.api_key.clone()));
    let transport = Arc::new(GeminiTransport::from_config(&config, credentials)?);

    let mcp = Arc::new(McpManager::from_config(&config));
    for (name, err) in mcp.connect_all().await {
        warn!(server = %name, error = %err, "MCP server failed to connect");
        eprintln!("  warning: MCP server {name} failed to connect: {err}");
    }

    let router = ToolRouter::new(Arc::new(BuiltinTools), mcp.clone());
    let (engine, mut events) = ConversationEngine::new(
        transport,
        router,
        EngineConfig::from_app_config(&config, work_dir.clone()),
    );
    if let Some(model) = opts.model {
        engine.set_model(model);
    }
    if opts.plan {
        engine.set_plan_mode(true);
    }
    info!(
        model = %engine.model(),
        work_dir = %work_dir.display(),
        plan_mode = opts.plan,
        "Chat session ready"
    );

    let result = match opts.message {
        Some(msg) => one_shot(&engine, &mut events, &msg).await,
        None => {
            banner(&engine, &mcp);
            repl(&engine, &mut events).await
        }
    };

    mcp.disconnect_all().await;
    result
}

async fn one_shot(
    engine: &ConversationEngine,
    events: &mut UnboundedReceiver<EngineEvent>,
    message: &str,
) -> Result<()> {
    engine.send_message(message, Vec::new())?;

    let mut renderer = Renderer::default();
    let mut failed = None;
    while let Some(event) = events.recv().await {
        if let EngineEvent::AskUser { .. } = event {
            // Nobody to ask in one-shot mode.
            engine.submit_ask_user_response("The user is not available to answer questions.");
        }
        if let EngineEvent::Error { message } = &event {
            failed = Some(message.clone());
        }
        let terminal = event.is_terminal();
        renderer.render(&event);
        if terminal {
            break;
        }
    }

    match failed {
        Some(message) => Err(Error::Generation(message)),
        None => Ok(()),
    }
}

fn banner(engine: &ConversationEngine, mcp: &McpManager) {
    let servers = mcp.list_servers();
    let connected = servers.iter().filter(|s| s.connected).count();
    let tools: usize = servers.iter().map(|s| s.tool_count).sum();

    println!();
    println!("  turnloop, interactive mode");
    println!();
    println!("  Model:     {}", engine.model());
    println!("  Workdir:   {}", engine.work_dir().display());
    println!(
        "  MCP:       {connected}/{} server(s), {tools} tool(s)",
        servers.len()
    );
    if engine.plan_mode() {
        println!("  Plan mode: on");
    }
    println!();
    println!("  Type your message and press Enter. /help lists commands.");
    println!("  Ctrl+C stops a running reply; /quit exits.");
    println!();
}

async fn repl(
    engine: &ConversationEngine,
    events: &mut UnboundedReceiver<EngineEvent>,
) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut renderer = Renderer::default();
    let mut staged: Vec<Attachment> = Vec::new();

    prompt()?;
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let line = line.trim();

                if engine.has_pending_question() {
                    engine.submit_ask_user_response(line);
                    continue;
                }
                if line.is_empty() {
                    prompt()?;
                    continue;
                }

                match ReplCommand::parse(line) {
                    Some(ReplCommand::Quit) => break,
                    Some(cmd) => {
                        apply(engine, cmd, &mut staged).await;
                        if !engine.is_busy() {
                            prompt()?;
                        }
                    }
                    None => {
                        if let Err(e) = engine.send_message(line, std::mem::take(&mut staged)) {
                            eprintln!("  [Error] {e}");
                            prompt()?;
                        }
                    }
                }
            }
            Some(event) = events.recv() => {
                let terminal = event.is_terminal();
                renderer.render(&event);
                if terminal {
                    prompt()?;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                if engine.is_busy() {
                    engine.stop_generation();
                } else {
                    println!();
                    break;
                }
            }
        }
    }

    engine.stop_generation();
    println!("  Goodbye!");
    Ok(())
}

fn prompt() -> std::io::Result<()> {
    print!("\n  You > ");
    std::io::stdout().flush()
}

/// Slash commands understood by the REPL.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ReplCommand {
    Plan(Option<bool>),
    Clear,
    Model(Option<String>),
    Attach(PathBuf),
    Stop,
    Help,
    Quit,
    Unknown(String),
}

impl ReplCommand {
    /// `None` for ordinary chat input.
    fn parse(line: &str) -> Option<Self> {
        let rest = line.strip_prefix('/')?;
        let (cmd, arg) = match rest.split_once(char::is_whitespace) {
            Some((cmd, arg)) => (cmd, arg.trim()),
            None => (rest, ""),
        };

        Some(match cmd {
            "plan" => match arg {
                "on" => Self::Plan(Some(true)),
                "off" => Self::Plan(Some(false)),
                _ => Self::Plan(None),
            },
            "clear" => Self::Clear,
            "model" => Self::Model((!arg.is_empty()).then(|| arg.to_string())),
            "attach" if !arg.is_empty() => Self::Attach(PathBuf::from(arg)),
            "stop" => Self::Stop,
            "help" => Self::Help,
            "quit" | "exit" => Self::Quit,
            other => Self::Unknown(other.to_string()),
        })
    }
}

async fn apply(engine: &ConversationEngine, cmd: ReplCommand, staged: &mut Vec<Attachment>) {
    match cmd {
        ReplCommand::Plan(Some(on)) => {
            engine.set_plan_mode(on);
            println!("  Plan mode {}.", if on { "on" } else { "off" });
        }
        ReplCommand::Plan(None) => {
            let state = if engine.plan_mode() { "on" } else { "off" };
            println!("  Plan mode is {state}. Use /plan on or /plan off.");
        }
        ReplCommand::Clear => {
            engine.clear_history();
            staged.clear();
            println!("  Conversation cleared.");
        }
        ReplCommand::Model(Some(model)) => {
            engine.set_model(model);
            println!("  Model: {}", engine.model());
        }
        ReplCommand::Model(None) => println!("  Model: {}", engine.model()),
        ReplCommand::Attach(path) => {
            let path = resolve(&engine.work_dir(), &path);
            match Attachment::from_path(&path, mime_for(&path)).await {
                Ok(attachment) => {
                    staged.push(attachment);
                    println!(
                        "  Attached {} ({} file(s) staged for the next message).",
                        path.display(),
                        staged.len()
                    );
                }
                Err(e) => eprintln!("  [Error] {e}"),
            }
        }
        ReplCommand::Stop => engine.stop_generation(),
        ReplCommand::Help => {
            println!("  /plan on|off     Toggle plan mode (read-only tools)");
            println!("  /model [name]    Show or switch the model");
            println!("  /attach <path>   Attach a file to the next message");
            println!("  /clear           Start a fresh conversation");
            println!("  /stop            Stop the running reply");
            println!("  /quit            Exit");
        }
        ReplCommand::Unknown(cmd) => println!("  Unknown command /{cmd}. Try /help."),
        ReplCommand::Quit => {}
    }
}

fn resolve(work_dir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        work_dir.join(path)
    }
}

/// MIME type for an attachment, by extension.
fn mime_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "pdf" => "application/pdf",
        "json" => "application/json",
        "md" | "txt" | "rs" | "toml" | "yaml" | "yml" | "py" | "js" | "ts" | "go" => "text/plain",
        _ => "application/octet-stream",
    }
}

/// Prints engine events as a running transcript.
#[derive(Default)]
struct Renderer {
    /// A model text line is open and needs a newline before other output.
    mid_line: bool,
    thinking: bool,
}

impl Renderer {
    fn render(&mut self, event: &EngineEvent) {
        match event {
            EngineEvent::Start { .. } | EngineEvent::Messages { .. } => {}
            EngineEvent::Thought { .. } => {
                if !self.thinking {
                    self.break_line();
                    println!("  (thinking...)");
                    self.thinking = true;
                }
            }
            EngineEvent::Content { text } => {
                if !self.mid_line {
                    print!("\n  ");
                }
                print!("{}", text.replace('\n', "\n  "));
                let _ = std::io::stdout().flush();
                self.mid_line = true;
            }
            EngineEvent::ToolCall { name, args } => {
                self.break_line();
                println!("  > {name} {}", preview(args));
            }
            EngineEvent::ToolResult { name, text } => {
                println!("  < {name}: {}", preview(text));
            }
            EngineEvent::AskUser { questions } => {
                self.break_line();
                print_questions(questions);
                print!("\n  Answer > ");
                let _ = std::io::stdout().flush();
            }
            EngineEvent::Done { usage } => {
                self.break_line();
                if !usage.is_empty() {
                    println!("  [{} tokens]", usage.total_tokens);
                }
                self.thinking = false;
            }
            EngineEvent::Error { message } => {
                self.break_line();
                eprintln!("  [Error] {message}");
                self.thinking = false;
            }
        }
    }

    fn break_line(&mut self) {
        if self.mid_line {
            println!();
            self.mid_line = false;
        }
    }
}

fn print_questions(questions: &[AskUserQuestion]) {
    for q in questions {
        println!();
        println!("  [{}] {}", q.header, q.question);
        match q.kind {
            QuestionKind::Choice => {
                for (i, opt) in q.options.iter().enumerate() {
                    if opt.description.is_empty() {
                        println!("    {}. {}", i + 1, opt.label);
                    } else {
                        println!("    {}. {}: {}", i + 1, opt.label, opt.description);
                    }
                }
            }
            QuestionKind::YesNo => println!("    (yes/no)"),
            QuestionKind::Text => {}
        }
    }
}

/// First line of `text`, cut to [`PREVIEW_CHARS`].
fn preview(text: &str) -> String {
    let line = text.lines().next().unwrap_or_default();
    let mut out: String = line.chars().take(PREVIEW_CHARS).collect();
    if out.len() < line.len() || text.lines().nth(1).is_some() {
        out.push_str(" ...");
    }
    out
}
