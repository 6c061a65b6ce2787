//! turnloop CLI, the main entry point.
//!
//! Commands:
//! - `chat`      Interactive chat or single-message mode
//! - `mcp list`  Connect configured MCP servers and show their tools

use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "turnloop",
    about = "turnloop: a streaming, tool-using chat agent",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Chat with the model
    Chat {
        /// Send a single message instead of entering interactive mode
        #[arg(short, long)]
        message: Option<String>,

        /// Working directory for tools (defaults to the current directory)
        #[arg(short, long)]
        workdir: Option<PathBuf>,

        /// Override the configured model for this session
        #[arg(long)]
        model: Option<String>,

        /// Start in plan mode (read-only tools only)
        #[arg(long)]
        plan: bool,
    },

    /// Manage MCP servers
    Mcp {
        #[command(subcommand)]
        action: McpAction,
    },
}

#[derive(Subcommand)]
enum McpAction {
    /// Connect every configured server and list its status and tools
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Chat {
            message,
            workdir,
            model,
            plan,
        } => {
            commands::chat::run(commands::chat::ChatOptions {
                message,
                workdir,
                model,
                plan,
            })
            .await?
        }
        Commands::Mcp {
            action: McpAction::List { json },
        } => commands::mcp::list(json).await?,
    }

    Ok(())
}
