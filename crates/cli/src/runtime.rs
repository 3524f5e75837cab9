//! Wiring shared by the commands: memory store, persisted index, tool dispatch.

use anyhow::Context;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tierwise_agent::{MEMORY_SERVER, MemorySearchTool};
use tierwise_config::{AppConfig, ServersFile};
use tierwise_core::tool::{Tool, ToolServerConfig, TransportDescriptor};
use tierwise_memory::{Chunker, MemoryStore};
use tierwise_tools::{InProcessTransport, RegistryWatcher, ToolDispatcher, ToolRegistry, TransportSet};
use tracing::{debug, info};

pub struct Runtime {
    pub config: AppConfig,
    pub store: Arc<MemoryStore>,
    index_path: PathBuf,
}

impl Runtime {
    /// Build the memory store and load the persisted index if there is one.
    pub fn open(config: AppConfig) -> anyhow::Result<Self> {
        let embedder = tierwise_providers::build_embedder(&config.embedding)
            .context("Failed to set up embedding providers")?;
        let chunker = Chunker::from_config(&config.chunking).context("Invalid chunking settings")?;
        let store = MemoryStore::new(config.memory.clone(), embedder).with_chunker(chunker);

        let index_path = config.index_path();
        if index_path.exists() {
            let entries = store.restore(&index_path).with_context(|| {
                format!(
                    "Failed to load index {} (delete it or switch back to the embedder that wrote it)",
                    index_path.display()
                )
            })?;
            debug!(path = %index_path.display(), entries, "Index loaded");
        }

        Ok(Self {
            config,
            store: Arc::new(store),
            index_path,
        })
    }

    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    /// Write the index back to disk.
    pub fn save(&self) -> anyhow::Result<usize> {
        let entries = self
            .store
            .save_index(&self.index_path)
            .with_context(|| format!("Failed to save index {}", self.index_path.display()))?;
        info!(path = %self.index_path.display(), entries, "Index saved");
        Ok(entries)
    }

    /// Inline servers plus the built-in in-process memory server. These
    /// stay registered across servers-file reloads.
    fn fixed_servers(&self) -> Vec<ToolServerConfig> {
        let mut servers = self.config.tools.servers.clone();
        if !servers.iter().any(|s| s.name == MEMORY_SERVER) {
            let mut memory = ToolServerConfig::new(MEMORY_SERVER, TransportDescriptor::InProcess);
            memory.description = "Built-in memory search".into();
            servers.push(memory);
        }
        servers
    }

    /// A dispatcher over the configured servers. In-process memory tools are
    /// always hosted; stdio and HTTP servers need an external transport.
    pub fn dispatcher(&self) -> anyhow::Result<Arc<ToolDispatcher>> {
        let registry = ToolRegistry::new().with_fixed(self.fixed_servers());
        let from_file = match &self.config.tools.servers_file {
            Some(path) => ServersFile::load(path)
                .with_context(|| format!("Failed to load tool servers from {}", path.display()))?
                .servers,
            None => Vec::new(),
        };
        registry.load(from_file).context("Invalid tool server configuration")?;

        let host = Arc::new(InProcessTransport::new());
        host.register(
            MEMORY_SERVER,
            vec![Arc::new(MemorySearchTool::new(Arc::clone(&self.store))) as Arc<dyn Tool>],
        );
        let transports = TransportSet::new().register(host);

        Ok(Arc::new(ToolDispatcher::new(Arc::new(registry), transports)))
    }

    /// Reload the dispatcher's registry when the servers file changes.
    /// `None` when there is no servers file or reloading is turned off.
    pub fn watch_servers(&self, dispatcher: &ToolDispatcher) -> anyhow::Result<Option<RegistryWatcher>> {
        let Some(path) = &self.config.tools.servers_file else {
            return Ok(None);
        };
        if !self.config.tools.auto_reload {
            return Ok(None);
        }
        let watcher = RegistryWatcher::spawn(Arc::clone(dispatcher.registry()), path.clone())?;
        Ok(Some(watcher))
    }
}
