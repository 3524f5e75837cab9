//! Memory commands: `ingest`, `search`, `stats`, `consolidate`.

use anyhow::{Context, bail};
use clap::Args;
use serde_json::json;
use std::path::PathBuf;
use tierwise_config::AppConfig;
use tierwise_core::memory::{ConversationKey, MemoryQuery, MemoryStats, SearchScope, Tier};

use crate::runtime::Runtime;

#[derive(Debug, Args)]
pub struct IngestArgs {
    #[arg(short, long)]
    pub user: String,

    #[arg(short, long)]
    pub conversation: String,

    /// Source label stored with each chunk (defaults to the file name)
    #[arg(short, long)]
    pub source: Option<String>,

    /// Read the text from this file
    #[arg(conflicts_with = "text")]
    pub file: Option<PathBuf>,

    /// Ingest this text directly
    #[arg(short, long)]
    pub text: Option<String>,
}

#[derive(Debug, Args)]
pub struct SearchArgs {
    /// What to search for
    pub query: String,

    /// Only this user's conversations
    #[arg(short, long)]
    pub user: Option<String>,

    /// Only this conversation (requires --user)
    #[arg(short, long, requires = "user")]
    pub conversation: Option<String>,

    /// Maximum number of results (defaults to memory.search_limit)
    #[arg(short, long)]
    pub limit: Option<usize>,

    /// Drop results scoring below this
    #[arg(long)]
    pub min_score: Option<f32>,

    /// Only search one tier
    #[arg(long, value_parser = parse_tier)]
    pub tier: Option<Tier>,

    /// Emit JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Args)]
pub struct ConsolidateArgs {
    #[arg(short, long)]
    pub user: Option<String>,

    /// Only this conversation (requires --user)
    #[arg(short, long, requires = "user")]
    pub conversation: Option<String>,
}

fn parse_tier(value: &str) -> Result<Tier, String> {
    match value.to_ascii_lowercase().as_str() {
        "short" | "short_term" => Ok(Tier::Short),
        "long" | "long_term" => Ok(Tier::Long),
        other => Err(format!("unknown tier '{other}' (expected short or long)")),
    }
}

fn scope(user: Option<String>, conversation: Option<String>) -> SearchScope {
    match (user, conversation) {
        (Some(user), Some(conversation)) => SearchScope::Conversation(ConversationKey::new(user, conversation)),
        (Some(user), None) => SearchScope::User(user),
        _ => SearchScope::Global,
    }
}

pub async fn ingest(config: AppConfig, args: IngestArgs) -> anyhow::Result<()> {
    let (text, source) = match (&args.file, &args.text) {
        (Some(path), _) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let source = args.source.clone().unwrap_or_else(|| path.display().to_string());
            (text, Some(source))
        }
        (None, Some(text)) => (text.clone(), args.source.clone()),
        (None, None) => bail!("Nothing to ingest: pass a file or --text"),
    };

    let runtime = Runtime::open(config)?;
    let key = ConversationKey::new(&args.user, &args.conversation);
    let stored = runtime.store.ingest(&key, source.as_deref(), &text).await?;
    let events = runtime.store.consolidate_until_bounded(&key).await?;
    let entries = runtime.save()?;

    println!("📥 Stored {} chunk(s) in {key}", stored.len());
    for event in &events {
        println!(
            "  🗜️  Consolidated {} chunk(s) ({} tokens) into {}",
            event.merged_chunk_ids.len(),
            event.merged_token_count,
            event.summary_chunk.id
        );
    }
    println!("💾 Index: {entries} entries in {}", runtime.index_path().display());
    Ok(())
}

pub async fn search(config: AppConfig, args: SearchArgs) -> anyhow::Result<()> {
    let runtime = Runtime::open(config)?;
    let limit = args.limit.unwrap_or(runtime.config.memory.search_limit);

    let embedding = runtime.store.embedder().embed(&args.query).await?;
    let mut query = MemoryQuery::new(scope(args.user, args.conversation), embedding.vector, limit);
    if let Some(tier) = args.tier {
        query = query.with_tiers([tier]);
    }
    if let Some(min_score) = args.min_score {
        query = query.with_min_score(min_score);
    }
    let results = runtime.store.search(&query)?;

    if args.json {
        let hits: Vec<_> = results
            .iter()
            .map(|r| {
                json!({
                    "id": r.chunk.id,
                    "score": r.score,
                    "tier": r.tier,
                    "user_id": r.conversation.user_id,
                    "conversation_id": r.conversation.conversation_id,
                    "source": r.chunk.source_id,
                    "content": r.chunk.text,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&hits)?);
        return Ok(());
    }

    if results.is_empty() {
        println!("🔍 No matches for \"{}\"", args.query);
        return Ok(());
    }
    println!("🔍 {} match(es) for \"{}\"\n", results.len(), args.query);
    for (rank, hit) in results.iter().enumerate() {
        let preview: String = hit.chunk.text.chars().take(100).collect();
        println!(
            "  {}. [{:.3}] ({}, {}) {}",
            rank + 1,
            hit.score,
            hit.tier,
            hit.conversation,
            preview.replace('\n', " ")
        );
    }
    Ok(())
}

pub fn stats(config: AppConfig, user: Option<String>) -> anyhow::Result<()> {
    let runtime = Runtime::open(config)?;
    let (label, stats) = match &user {
        Some(user) => (format!("user {user}"), runtime.store.stats(user)),
        None => ("all users".to_string(), runtime.store.global_stats()),
    };
    print_stats(&label, &stats);
    Ok(())
}

fn print_stats(label: &str, stats: &MemoryStats) {
    println!("📊 Memory — {label}");
    println!("==================\n");
    println!("  Conversations:     {}", stats.conversations);
    println!("  Short-term chunks: {}", stats.short_count);
    println!("  Long-term chunks:  {}", stats.long_count);
    println!("  Tokens:            {}", stats.total_tokens);
    println!("  Important chunks:  {}", stats.important_count);
}

pub async fn consolidate(config: AppConfig, args: ConsolidateArgs) -> anyhow::Result<()> {
    let runtime = Runtime::open(config)?;
    let events = match scope(args.user, args.conversation) {
        SearchScope::Conversation(key) => runtime.store.consolidate_until_bounded(&key).await?,
        SearchScope::User(user) => {
            let mut events = Vec::new();
            for key in runtime.store.conversations().into_iter().filter(|k| k.user_id == user) {
                events.extend(runtime.store.consolidate_until_bounded(&key).await?);
            }
            events
        }
        SearchScope::Global => runtime.store.consolidate_all().await?,
    };

    if events.is_empty() {
        println!("✅ Everything is within bounds");
        return Ok(());
    }

    runtime.save()?;
    for event in &events {
        println!(
            "🗜️  {}:{} — merged {} chunk(s), {} tokens → {}",
            event.user_id,
            event.conversation_id,
            event.merged_chunk_ids.len(),
            event.merged_token_count,
            event.summary_chunk.id
        );
    }
    Ok(())
}
