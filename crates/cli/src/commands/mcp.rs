//! `turnloop mcp list`: connect configured servers and report on them.

use turnloop_config::AppConfig;
use turnloop_core::{Error, Result};
use turnloop_mcp::{McpManager, McpServerStatus};

pub async fn list(json: bool) -> Result<()> {
    let config = AppConfig::load().map_err(|e| Error::config(format!("failed to load config: {e}")))?;
    let manager = McpManager::from_config(&config);

    if config.mcp_servers.is_empty() {
        println!();
        println!("  No MCP servers configured.");
        println!("  Add one under [mcp_servers.<name>] in:");
        println!("    {}", AppConfig::config_dir().join("config.toml").display());
        println!();
        return Ok(());
    }

    // Failures are recorded per server and shown in the listing.
    let _ = manager.connect_all().await;
    let servers = manager.list_servers();
    manager.disconnect_all().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&servers)?);
    } else {
        print!("{}", render(&servers));
    }
    Ok(())
}

fn render(servers: &[McpServerStatus]) -> String {
    let mut out = String::from("\n");
    for server in servers {
        let status = if server.connected { "connected" } else { "disconnected" };
        let target = server.url.as_deref().unwrap_or(&server.command);
        out.push_str(&format!("  {} ({status})  {target}\n", server.name));
        if let Some(err) = &server.error {
            out.push_str(&format!("    error: {err}\n"));
        }
        if server.connected {
            out.push_str(&format!("    {} tool(s)\n", server.tool_count));
            for tool in &server.tools {
                out.push_str(&format!("      - {tool}\n"));
            }
        }
        out.push('\n');
    }
    out
}
