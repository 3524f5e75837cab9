//! `tierwise onboard` — Write a default configuration.

use anyhow::Context;
use std::path::Path;
use tierwise_config::AppConfig;

pub fn run(config_path: Option<&Path>, force: bool) -> anyhow::Result<()> {
    let default_path = AppConfig::config_dir().join("config.toml");
    let config_path = config_path.unwrap_or(&default_path);

    println!("🧠 Tierwise — First-Time Setup");
    println!("==============================\n");

    if let Some(dir) = config_path.parent().filter(|d| !d.as_os_str().is_empty()) {
        if !dir.exists() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
            println!("✅ Created config directory: {}", dir.display());
        }
    }

    if config_path.exists() && !force {
        println!("  Config file exists: {}", config_path.display());
        println!("  Pass --force to overwrite it.");
        return Ok(());
    }

    std::fs::write(config_path, AppConfig::default_toml())
        .with_context(|| format!("Failed to write {}", config_path.display()))?;
    println!("✅ Wrote default config: {}", config_path.display());

    println!("\nNext steps:");
    println!("  tierwise ingest --user me --conversation notes --text \"...\"");
    println!("  tierwise search \"what did I say about...\" --user me");
    println!("  tierwise doctor");
    Ok(())
}
