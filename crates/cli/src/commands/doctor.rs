//! `tierwise doctor` — Diagnose configuration and index health.

use std::path::Path;
use tierwise_config::{AppConfig, ConfigError};
use tierwise_memory::{Chunker, PersistedIndex};

pub fn run(config_path: Option<&Path>, loaded: Result<AppConfig, ConfigError>) -> anyhow::Result<()> {
    println!("🩺 Tierwise Doctor — System Diagnostics");
    println!("=======================================\n");

    let mut issues = 0;

    let default_path = AppConfig::config_dir().join("config.toml");
    let config_path = config_path.unwrap_or(&default_path);
    let config = match loaded {
        Ok(config) if config_path.exists() => {
            println!("  ✅ Config file valid: {}", config_path.display());
            config
        }
        Ok(config) => {
            println!("  ⚠️  No config file at {} — using defaults (run `tierwise onboard`)", config_path.display());
            issues += 1;
            config
        }
        Err(e) => {
            println!("  ❌ Config file invalid: {e}");
            println!("\n  ⚠️  Fix the config file and run doctor again.");
            return Ok(());
        }
    };

    match Chunker::from_config(&config.chunking) {
        Ok(chunker) => println!(
            "  ✅ Chunking: size {}, overlap {}",
            chunker.chunk_size(),
            chunker.overlap()
        ),
        Err(e) => {
            println!("  ❌ Chunking: {e}");
            issues += 1;
        }
    }

    let dimension = match tierwise_providers::build_embedder(&config.embedding) {
        Ok(embedder) => {
            println!(
                "  ✅ Embedder: {} ({} dimensions)",
                embedder.name(),
                embedder.dimension()
            );
            Some(embedder.dimension())
        }
        Err(e) => {
            println!("  ❌ Embedder: {e}");
            issues += 1;
            None
        }
    };

    let index_path = config.index_path();
    if !index_path.exists() {
        println!("  ✅ No index yet at {} (created on first ingest)", index_path.display());
    } else if let Some(dimension) = dimension {
        match PersistedIndex::load(&index_path, dimension) {
            Ok(index) => println!(
                "  ✅ Index: {} entries, {} conversation(s)",
                index.entries.len(),
                index.conversations.len()
            ),
            Err(e) => {
                println!("  ❌ Index {}: {e}", index_path.display());
                issues += 1;
            }
        }
    }

    if let Some(servers_file) = &config.tools.servers_file {
        if !servers_file.exists() {
            println!("  ⚠️  Servers file missing: {}", servers_file.display());
            issues += 1;
        }
    }
    match config.tool_servers() {
        Ok(servers) => {
            let enabled = servers.iter().filter(|s| s.enabled).count();
            println!("  ✅ Tool servers: {} configured, {} enabled", servers.len(), enabled);
        }
        Err(e) => {
            println!("  ❌ Tool servers: {e}");
            issues += 1;
        }
    }

    println!();
    if issues == 0 {
        println!("  🎉 All checks passed!");
    } else {
        println!("  ⚠️  {issues} issue(s) found. See above for details.");
    }

    Ok(())
}
