//! Hot reload of the servers file.
//!
//! The parent directory is watched rather than the file itself so that
//! editors replacing the file by rename are still picked up. Bursts of
//! events are coalesced before the registry reloads.

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tierwise_core::error::RegistryError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::registry::ToolRegistry;

const DEBOUNCE: Duration = Duration::from_millis(200);

/// Keeps the registry in sync with a servers file until dropped.
pub struct RegistryWatcher {
    path: PathBuf,
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl std::fmt::Debug for RegistryWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryWatcher")
            .field("path", &self.path)
            .finish()
    }
}

impl RegistryWatcher {
    /// Start watching `path`. Must be called inside a tokio runtime.
    pub fn spawn(registry: Arc<ToolRegistry>, path: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let path: PathBuf = path.into();
        let load_err = |reason: String| RegistryError::Load {
            path: path.display().to_string(),
            reason,
        };
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let file_name = path
            .file_name()
            .map(|n| n.to_os_string())
            .ok_or_else(|| load_err("servers file path has no file name".into()))?;

        let (tx, rx) = mpsc::unbounded_channel::<()>();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| match res {
            Ok(event) => {
                let relevant = matches!(
                    event.kind,
                    EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                ) && event
                    .paths
                    .iter()
                    .any(|p| p.file_name() == Some(file_name.as_os_str()));
                if relevant {
                    let _ = tx.send(());
                }
            }
            Err(e) => warn!(error = %e, "Servers file watch error"),
        })
        .map_err(|e| load_err(e.to_string()))?;
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| load_err(e.to_string()))?;

        let task = tokio::spawn(reload_loop(registry, path.clone(), rx));
        info!(path = %path.display(), "Watching tool servers file");
        Ok(Self {
            path,
            _watcher: watcher,
            task,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RegistryWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn reload_loop(registry: Arc<ToolRegistry>, path: PathBuf, mut rx: mpsc::UnboundedReceiver<()>) {
    while rx.recv().await.is_some() {
        tokio::time::sleep(DEBOUNCE).await;
        while rx.try_recv().is_ok() {}

        if !path.exists() {
            debug!(path = %path.display(), "Servers file removed; keeping current set");
            continue;
        }
        match registry.reload_from_path(&path) {
            Ok(generation) => info!(path = %path.display(), generation, "Tool servers reloaded"),
            Err(e) => warn!(path = %path.display(), error = %e, "Servers file rejected; keeping current set"),
        }
    }
}
