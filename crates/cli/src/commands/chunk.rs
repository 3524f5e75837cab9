//! `tierwise chunk` — Show how a file would be chunked.

use anyhow::Context;
use clap::Args;
use std::path::PathBuf;
use tierwise_config::{AppConfig, ChunkingConfig};
use tierwise_memory::Chunker;

#[derive(Debug, Args)]
pub struct ChunkArgs {
    /// File to chunk
    pub file: PathBuf,

    /// Override the configured chunk size
    #[arg(long)]
    pub size: Option<usize>,

    /// Override the configured overlap
    #[arg(long)]
    pub overlap: Option<usize>,

    /// Emit the chunk drafts as JSON
    #[arg(long)]
    pub json: bool,
}

/// The configured chunking settings with command-line overrides applied.
fn effective_config(base: &ChunkingConfig, args: &ChunkArgs) -> ChunkingConfig {
    let mut config = base.clone();
    if let Some(size) = args.size {
        config.chunk_size = size;
        config.boundary_window = config.boundary_window.min(size / 10);
    }
    if let Some(overlap) = args.overlap {
        config.overlap = overlap;
    }
    config
}

pub fn run(config: &AppConfig, args: ChunkArgs) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(&args.file)
        .with_context(|| format!("Failed to read {}", args.file.display()))?;
    let settings = effective_config(&config.chunking, &args);
    let chunker = Chunker::from_config(&settings)?;

    let source = args.file.display().to_string();
    let drafts = chunker.split(&text, Some(&source))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&drafts)?);
        return Ok(());
    }

    println!(
        "✂️  {} → {} chunk(s) (size {}, overlap {})\n",
        source,
        drafts.len(),
        settings.chunk_size,
        settings.overlap
    );
    for draft in &drafts {
        let preview: String = draft.text.chars().take(60).collect();
        println!(
            "  #{:<3} [{}..{}] {}{}",
            draft.index,
            draft.span.start,
            draft.span.end,
            preview.replace('\n', " "),
            if draft.text.chars().count() > 60 { "…" } else { "" }
        );
    }
    Ok(())
}
