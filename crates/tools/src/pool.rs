//! Per-server bounded connection pool.
//!
//! Capacity is a semaphore with `pool_size` permits. Idle sessions are kept
//! for reuse; a permit is held for the whole of an invocation, including any
//! connect and retries, and released when the [`PooledConnection`] drops.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tierwise_core::error::DispatchError;
use tierwise_core::tool::{ToolServerConfig, TransportSession};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::debug;

use crate::health::{HealthSnapshot, ServerHealth};

/// Everything the dispatcher keeps per configured server.
pub struct ServerLink {
    config: Arc<ToolServerConfig>,
    capacity: Arc<Semaphore>,
    idle: Mutex<Vec<Box<dyn TransportSession>>>,
    health: ServerHealth,
}

impl std::fmt::Debug for ServerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerLink")
            .field("server", &self.config.name)
            .field("pool_size", &self.config.pool_size)
            .field("available", &self.capacity.available_permits())
            .field("idle", &self.idle.lock().len())
            .finish()
    }
}

/// Pool and health view for one server.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolStatus {
    pub pool_size: usize,
    pub idle: usize,
    pub in_use: usize,
}

impl ServerLink {
    pub fn new(config: Arc<ToolServerConfig>) -> Self {
        Self {
            capacity: Arc::new(Semaphore::new(config.pool_size)),
            idle: Mutex::new(Vec::new()),
            health: ServerHealth::new(config.circuit.clone()),
            config,
        }
    }

    pub fn config(&self) -> &Arc<ToolServerConfig> {
        &self.config
    }

    pub fn health(&self) -> &ServerHealth {
        &self.health
    }

    /// Wait for a free slot until `deadline`, then give up with `PoolExhausted`.
    pub async fn acquire(self: &Arc<Self>, deadline: Instant) -> Result<PooledConnection, DispatchError> {
        let exhausted = || DispatchError::PoolExhausted {
            server: self.config.name.clone(),
            pool_size: self.config.pool_size,
        };
        let permit = match tokio::time::timeout_at(deadline, self.capacity.clone().acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            // Closed semaphore or deadline reached
            Ok(Err(_)) | Err(_) => return Err(exhausted()),
        };
        let session = self.idle.lock().pop();
        debug!(
            server = %self.config.name,
            reused = session.is_some(),
            "Acquired pooled connection"
        );
        Ok(PooledConnection {
            link: Arc::clone(self),
            session,
            _permit: permit,
        })
    }

    pub fn pool_status(&self) -> PoolStatus {
        let available = self.capacity.available_permits();
        PoolStatus {
            pool_size: self.config.pool_size,
            idle: self.idle.lock().len(),
            in_use: self.config.pool_size.saturating_sub(available),
        }
    }

    pub fn health_snapshot(&self) -> HealthSnapshot {
        self.health.snapshot()
    }

    /// Drop every idle session so the next call has to connect again.
    /// Used when the circuit trips. Returns how many were dropped.
    pub fn discard_idle(&self) -> usize {
        let sessions: Vec<_> = std::mem::take(&mut *self.idle.lock());
        let dropped = sessions.len();
        for mut session in sessions {
            tokio::spawn(async move { session.close().await });
        }
        if dropped > 0 {
            debug!(server = %self.config.name, dropped, "Dropped idle sessions");
        }
        dropped
    }

    /// Close every idle session. Used when a server leaves the registry.
    pub async fn drain(&self) {
        let sessions: Vec<_> = std::mem::take(&mut *self.idle.lock());
        for mut session in sessions {
            session.close().await;
        }
        self.health.disconnected();
    }
}

/// A pool slot, optionally holding an open session.
pub struct PooledConnection {
    link: Arc<ServerLink>,
    session: Option<Box<dyn TransportSession>>,
    _permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("server", &self.link.config.name)
            .field("has_session", &self.session.is_some())
            .finish()
    }
}

impl PooledConnection {
    pub fn session(&mut self) -> Option<&mut Box<dyn TransportSession>> {
        self.session.as_mut()
    }

    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    pub fn attach(&mut self, session: Box<dyn TransportSession>) {
        self.session = Some(session);
    }

    /// Forget the session after a transport failure. The session is closed
    /// in the background.
    pub fn discard(&mut self) {
        if let Some(mut session) = self.session.take() {
            tokio::spawn(async move { session.close().await });
        }
    }

    /// Hand the session back for reuse and free the slot. While the
    /// circuit is open the session is closed instead.
    pub fn release(mut self) {
        if self.link.health.is_tripped() {
            self.discard();
            return;
        }
        if let Some(session) = self.session.take() {
            self.link.idle.lock().push(session);
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        // A slot dropped without release() had its call abandoned mid-flight
        if self.session.take().is_some() {
            debug!(server = %self.link.config.name, "Dropping session of abandoned call");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tierwise_core::tool::TransportDescriptor;

    fn link(pool_size: usize) -> Arc<ServerLink> {
        let mut config = ToolServerConfig::new("srv", TransportDescriptor::InProcess);
        config.pool_size = pool_size;
        Arc::new(ServerLink::new(Arc::new(config)))
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_pool_waits_until_deadline() {
        let link = link(1);
        let held = link.acquire(Instant::now() + Duration::from_secs(1)).await.unwrap();
        assert_eq!(link.pool_status().in_use, 1);

        let err = link
            .acquire(Instant::now() + Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::PoolExhausted { pool_size: 1, .. }));

        drop(held);
        assert_eq!(link.pool_status().in_use, 0);
        assert!(link.acquire(Instant::now() + Duration::from_millis(50)).await.is_ok());
    }

    #[tokio::test]
    async fn waiter_gets_slot_when_released() {
        let link = link(1);
        let held = link.acquire(Instant::now() + Duration::from_secs(1)).await.unwrap();
        let waiter = {
            let link = Arc::clone(&link);
            tokio::spawn(async move { link.acquire(Instant::now() + Duration::from_secs(5)).await.is_ok() })
        };
        tokio::task::yield_now().await;
        held.release();
        assert!(waiter.await.unwrap());
    }
}
