//! `tierwise ask` — Run one turn: recall, call planned tools, answer, store.

use anyhow::{Context, bail};
use clap::Args;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tierwise_agent::{AgentEvent, Orchestrator, PlannedCall, RecallGenerator, TurnRequest};
use tierwise_config::AppConfig;
use tierwise_core::memory::ConversationKey;

use crate::runtime::Runtime;

#[derive(Debug, Args)]
pub struct AskArgs {
    #[arg(short, long)]
    pub user: String,

    #[arg(short, long)]
    pub conversation: String,

    /// The message
    pub message: String,

    /// Call a tool before answering: `server/tool` or `server/tool:{"json":"args"}`
    #[arg(long = "plan", value_parser = parse_planned_call)]
    pub plan: Vec<PlannedCall>,

    /// Print each event as a JSON line
    #[arg(long)]
    pub json: bool,
}

fn parse_planned_call(value: &str) -> Result<PlannedCall, String> {
    let (target, args) = match value.split_once(':') {
        Some((target, args)) => {
            let args: serde_json::Value =
                serde_json::from_str(args).map_err(|e| format!("invalid JSON arguments: {e}"))?;
            (target, args)
        }
        None => (value, serde_json::json!({})),
    };
    match target.split_once('/') {
        Some((server, tool)) if !server.is_empty() && !tool.is_empty() => {
            Ok(PlannedCall::new(server, tool, args))
        }
        _ => Err(format!("expected server/tool, got '{target}'")),
    }
}

pub async fn run(config: AppConfig, args: AskArgs) -> anyhow::Result<()> {
    let deadline = Duration::from_millis(config.tools.default_deadline_ms);
    let runtime = Runtime::open(config)?;
    let dispatcher = runtime.dispatcher()?;

    let generator = Arc::new(RecallGenerator::new().with_plan(args.plan));
    let orchestrator = Arc::new(
        Orchestrator::new(Arc::clone(&runtime.store), generator)
            .with_dispatcher(dispatcher)
            .with_recall_limit(runtime.config.memory.search_limit),
    );

    let key = ConversationKey::new(&args.user, &args.conversation);
    let mut stream = orchestrator.run_turn(TurnRequest::new(key.clone(), args.message).with_deadline(deadline));

    let mut failure = None;
    let mut stdout = std::io::stdout();
    while let Some(event) = stream.next_event().await {
        if args.json {
            println!("{}", serde_json::to_string(&event)?);
        } else {
            match &event {
                AgentEvent::Token { content } => {
                    print!("{content}");
                    stdout.flush().context("Failed to write output")?;
                }
                AgentEvent::ToolCall { server, tool, .. } => println!("🔧 {server}/{tool}"),
                AgentEvent::ToolResult {
                    server, tool, error: Some(e), ..
                } => println!("⚠️  {server}/{tool}: {e}"),
                AgentEvent::ToolResult { .. } => {}
                AgentEvent::Done { .. } => println!(),
                AgentEvent::Error { .. } => {}
            }
        }
        if let AgentEvent::Error { message } = event {
            failure = Some(message);
        }
    }

    runtime.store.consolidate_until_bounded(&key).await?;
    runtime.save()?;

    if let Some(message) = failure {
        bail!("Turn failed: {message}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_tool() {
        let call = parse_planned_call("memory/memory_search").unwrap();
        assert_eq!(call.server, "memory");
        assert_eq!(call.tool, "memory_search");
        assert_eq!(call.args, serde_json::json!({}));
    }

    #[test]
    fn parses_json_arguments() {
        let call = parse_planned_call(r#"memory/memory_search:{"query":"rust","limit":2}"#).unwrap();
        assert_eq!(call.args["query"], "rust");
        assert_eq!(call.args["limit"], 2);
    }

    #[test]
    fn rejects_malformed_plans() {
        assert!(parse_planned_call("memory").is_err());
        assert!(parse_planned_call("/tool").is_err());
        assert!(parse_planned_call("memory/search:{not json}").is_err());
    }
}
