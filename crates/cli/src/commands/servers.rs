//! `tierwise servers` — List tool servers and their health.

use anyhow::bail;
use std::time::Duration;
use tierwise_config::AppConfig;
use tierwise_tools::{ServerStatus, ToolDispatcher};

use crate::runtime::Runtime;

pub async fn run(config: AppConfig, discover: bool, json: bool, watch: bool) -> anyhow::Result<()> {
    let deadline = Duration::from_millis(config.tools.default_deadline_ms);
    let runtime = Runtime::open(config)?;
    let dispatcher = runtime.dispatcher()?;

    if watch {
        return watch_registry(&runtime, &dispatcher).await;
    }

    let discovered = if discover {
        dispatcher.discover(deadline).await
    } else {
        Vec::new()
    };
    let statuses = dispatcher.status();

    if json {
        let servers: Vec<_> = statuses
            .iter()
            .map(|status| {
                let mut entry = serde_json::to_value(status).unwrap_or_default();
                if let Some((_, found)) = discovered.iter().find(|(name, _)| *name == status.name) {
                    entry["tools"] = match found {
                        Ok(tools) => serde_json::to_value(tools).unwrap_or_default(),
                        Err(e) => serde_json::json!({ "error": e.to_string() }),
                    };
                }
                entry
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&servers)?);
        return Ok(());
    }

    println!("🔌 Tool Servers");
    println!("===============\n");
    for status in &statuses {
        println!("  {}", status_line(status));
        if let Some((_, found)) = discovered.iter().find(|(name, _)| *name == status.name) {
            match found {
                Ok(tools) if tools.is_empty() => println!("      (no tools)"),
                Ok(tools) => {
                    for tool in tools {
                        println!("      • {} — {}", tool.name, tool.description);
                    }
                }
                Err(e) => println!("      ⚠️  {e}"),
            }
        }
    }
    println!("\n  {} server(s) configured", statuses.len());
    Ok(())
}

/// Print the server table again after every reload until Ctrl-C.
async fn watch_registry(runtime: &Runtime, dispatcher: &ToolDispatcher) -> anyhow::Result<()> {
    let Some(watcher) = runtime.watch_servers(dispatcher)? else {
        bail!("Nothing to watch: set tools.servers_file and tools.auto_reload");
    };
    println!("👀 Watching {} (Ctrl-C to stop)\n", watcher.path().display());

    let mut seen = dispatcher.registry().generation();
    print_table(&dispatcher.status());
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = tokio::time::sleep(Duration::from_millis(250)) => {
                let generation = dispatcher.registry().generation();
                if generation != seen {
                    seen = generation;
                    println!("\n🔄 Reloaded (generation {generation})");
                    print_table(&dispatcher.status());
                }
            }
        }
    }
    Ok(())
}

fn print_table(statuses: &[ServerStatus]) {
    for status in statuses {
        println!("  {}", status_line(status));
    }
}

fn status_line(status: &ServerStatus) -> String {
    let marker = if !status.enabled {
        "⏸️ "
    } else if status.retry_in_ms.is_some() {
        "🔴"
    } else {
        "🟢"
    };
    let mut line = format!(
        "{marker} {:<16} {:<10} {:<12} pool {}/{}",
        status.name,
        status.transport,
        status.state.to_string(),
        status.pool.in_use,
        status.pool.pool_size
    );
    if let Some(ms) = status.retry_in_ms {
        line.push_str(&format!(" — circuit open, retry in {ms}ms"));
    }
    if status.consecutive_failures > 0 {
        line.push_str(&format!(" — {} consecutive failure(s)", status.consecutive_failures));
    }
    line
}
