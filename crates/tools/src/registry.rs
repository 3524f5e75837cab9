//! Tool server registry.
//!
//! The active server set is an immutable snapshot behind an `ArcSwap`.
//! Readers take the current snapshot without locking; `load` validates a
//! complete replacement and swaps it in one step. Invocations that already
//! resolved a server keep their `Arc<ToolServerConfig>` and finish against it.

use arc_swap::ArcSwap;
use chrono::Utc;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tierwise_config::ServersFile;
use tierwise_core::error::RegistryError;
use tierwise_core::event::{DomainEvent, EventBus};
use tierwise_core::tool::ToolServerConfig;
use tracing::info;

/// One immutable generation of the server set.
#[derive(Debug, Default)]
pub struct RegistrySnapshot {
    pub servers: BTreeMap<String, Arc<ToolServerConfig>>,
    pub generation: u64,
}

impl RegistrySnapshot {
    pub fn get(&self, name: &str) -> Option<&Arc<ToolServerConfig>> {
        self.servers.get(name)
    }
}

pub struct ToolRegistry {
    current: ArcSwap<RegistrySnapshot>,
    /// Merged into every load unless a loaded server has the same name
    fixed: Vec<ToolServerConfig>,
    events: Option<Arc<EventBus>>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.current.load();
        f.debug_struct("ToolRegistry")
            .field("servers", &snapshot.servers.keys().collect::<Vec<_>>())
            .field("generation", &snapshot.generation)
            .finish()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(RegistrySnapshot::default()),
            fixed: Vec::new(),
            events: None,
        }
    }

    /// Publish `RegistryReloaded` on every successful load.
    pub fn with_event_bus(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Servers that survive every reload, such as inline and built-in ones.
    /// Takes effect from the next `load`.
    pub fn with_fixed(mut self, fixed: Vec<ToolServerConfig>) -> Self {
        self.fixed = fixed;
        self
    }

    /// Build a registry from an initial server list.
    pub fn from_configs(configs: Vec<ToolServerConfig>) -> Result<Self, RegistryError> {
        let registry = Self::new();
        registry.load(configs)?;
        Ok(registry)
    }

    /// Replace the whole server set. Nothing changes if any config is invalid.
    pub fn load(&self, mut configs: Vec<ToolServerConfig>) -> Result<u64, RegistryError> {
        let loaded: HashSet<String> = configs.iter().map(|c| c.name.clone()).collect();
        configs.extend(
            self.fixed
                .iter()
                .filter(|f| !loaded.contains(&f.name))
                .cloned(),
        );

        let mut seen = HashSet::new();
        for config in &configs {
            config.validate()?;
            if !seen.insert(config.name.clone()) {
                return Err(RegistryError::DuplicateServer(config.name.clone()));
            }
        }

        let servers: BTreeMap<_, _> = configs
            .into_iter()
            .map(|c| (c.name.clone(), Arc::new(c)))
            .collect();
        let count = servers.len();

        let previous = self.current.rcu(|old| RegistrySnapshot {
            servers: servers.clone(),
            generation: old.generation + 1,
        });
        let generation = previous.generation + 1;

        info!(servers = count, generation, "Tool registry loaded");
        if let Some(events) = &self.events {
            events.publish(DomainEvent::RegistryReloaded {
                servers: count,
                generation,
                timestamp: Utc::now(),
            });
        }
        Ok(generation)
    }

    /// Load the servers file at `path`. On error the active set is kept.
    pub fn reload_from_path(&self, path: &Path) -> Result<u64, RegistryError> {
        let file = ServersFile::load(path).map_err(|e| RegistryError::Load {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        self.load(file.servers)
    }

    /// The config of an enabled server.
    pub fn get(&self, name: &str) -> Result<Arc<ToolServerConfig>, RegistryError> {
        self.current
            .load()
            .get(name)
            .filter(|c| c.enabled)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    /// Every configured server, enabled or not, ordered by name.
    pub fn list(&self) -> Vec<Arc<ToolServerConfig>> {
        self.current.load().servers.values().cloned().collect()
    }

    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.current.load_full()
    }

    pub fn generation(&self) -> u64 {
        self.current.load().generation
    }

    /// Toggle a server without touching the rest of the set.
    pub fn set_enabled(&self, name: &str, enabled: bool) -> Result<(), RegistryError> {
        if !self.current.load().servers.contains_key(name) {
            return Err(RegistryError::NotFound(name.to_string()));
        }
        let mut found = false;
        self.current.rcu(|old| {
            let mut servers = old.servers.clone();
            found = false;
            if let Some(config) = servers.get_mut(name) {
                found = true;
                if config.enabled != enabled {
                    let mut updated = (**config).clone();
                    updated.enabled = enabled;
                    *config = Arc::new(updated);
                }
            }
            RegistrySnapshot {
                servers,
                generation: old.generation + 1,
            }
        });
        if !found {
            return Err(RegistryError::NotFound(name.to_string()));
        }
        info!(server = name, enabled, "Tool server toggled");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tierwise_core::tool::TransportDescriptor;

    fn server(name: &str) -> ToolServerConfig {
        ToolServerConfig::new(name, TransportDescriptor::InProcess)
    }

    #[test]
    fn load_and_get() {
        let registry = ToolRegistry::from_configs(vec![server("a"), server("b")]).unwrap();
        assert_eq!(registry.list().len(), 2);
        assert_eq!(registry.get("a").unwrap().name, "a");
        assert!(matches!(registry.get("zzz"), Err(RegistryError::NotFound(_))));
    }

    #[test]
    fn duplicate_names_rejected_atomically() {
        let registry = ToolRegistry::from_configs(vec![server("a")]).unwrap();
        let before = registry.generation();
        let err = registry.load(vec![server("x"), server("x")]).unwrap_err();
        assert_eq!(err, RegistryError::DuplicateServer("x".into()));
        assert_eq!(registry.generation(), before);
        assert!(registry.get("a").is_ok());
    }

    #[test]
    fn disabled_servers_are_not_found() {
        let registry = ToolRegistry::from_configs(vec![server("a")]).unwrap();
        registry.set_enabled("a", false).unwrap();
        assert!(registry.get("a").is_err());
        assert_eq!(registry.list().len(), 1);
        registry.set_enabled("a", true).unwrap();
        assert!(registry.get("a").is_ok());
        assert!(registry.set_enabled("ghost", true).is_err());
    }

    #[test]
    fn resolved_config_survives_replacement() {
        let registry = ToolRegistry::from_configs(vec![server("old")]).unwrap();
        let held = registry.get("old").unwrap();
        registry.load(vec![server("new")]).unwrap();
        assert_eq!(held.name, "old");
        assert!(registry.get("old").is_err());
        assert!(registry.get("new").is_ok());
    }

    #[test]
    fn fixed_servers_survive_reloads() {
        let registry = ToolRegistry::new().with_fixed(vec![server("memory")]);
        registry.load(vec![server("git")]).unwrap();
        assert!(registry.get("memory").is_ok());
        assert!(registry.get("git").is_ok());

        registry.load(vec![]).unwrap();
        assert!(registry.get("memory").is_ok());
        assert!(registry.get("git").is_err());

        // A loaded server with the same name wins
        let mut custom = server("memory");
        custom.pool_size = 1;
        registry.load(vec![custom]).unwrap();
        assert_eq!(registry.get("memory").unwrap().pool_size, 1);
        assert_eq!(registry.list().len(), 1);
    }

    #[test]
    fn reload_from_bad_file_keeps_current_set() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("servers.toml");
        std::fs::write(
            &path,
            "[[servers]]\nname = \"files\"\n[servers.transport]\ntype = \"in_process\"\n",
        )
        .unwrap();

        let registry = ToolRegistry::new();
        registry.reload_from_path(&path).unwrap();
        assert!(registry.get("files").is_ok());

        std::fs::write(&path, "[[servers]\nbroken").unwrap();
        assert!(matches!(
            registry.reload_from_path(&path),
            Err(RegistryError::Load { .. })
        ));
        assert!(registry.get("files").is_ok());
    }

    #[tokio::test]
    async fn load_publishes_event() {
        let bus = Arc::new(EventBus::default());
        let mut rx = bus.subscribe();
        let registry = ToolRegistry::new().with_event_bus(bus);
        registry.load(vec![server("a")]).unwrap();
        match &*rx.recv().await.unwrap() {
            DomainEvent::RegistryReloaded {
                servers, generation, ..
            } => {
                assert_eq!(*servers, 1);
                assert_eq!(*generation, 1);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
