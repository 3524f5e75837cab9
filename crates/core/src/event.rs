//! Domain event system — decoupled communication between bounded contexts.
//!
//! Memory and tool components publish events when their state changes.
//! Health reporting and tests subscribe without tight coupling.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::memory::{ConsolidationEvent, ConversationKey};

/// All domain events in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DomainEvent {
    /// A chunk was appended to a conversation's short-term tier
    ChunkAppended {
        conversation: ConversationKey,
        chunk_id: String,
        short_term_len: usize,
        timestamp: DateTime<Utc>,
    },

    /// Short-term chunks were merged into a long-term summary
    Consolidated(ConsolidationEvent),

    /// A consolidation step was abandoned without touching state
    ConsolidationAborted {
        conversation: ConversationKey,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// The vector index stopped accepting writes
    IndexHalted {
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// The vector index was rebuilt from a snapshot
    IndexRebuilt {
        entries: usize,
        dimension: usize,
        timestamp: DateTime<Utc>,
    },

    /// A tool call finished
    ToolInvoked {
        server: String,
        tool: String,
        success: bool,
        attempts: u32,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// A server's circuit opened
    CircuitOpened {
        server: String,
        open_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// The tool registry was replaced
    RegistryReloaded {
        servers: usize,
        generation: u64,
        timestamp: DateTime<Utc>,
    },
}

/// A broadcast-based event bus for domain events.
///
/// Uses `tokio::sync::broadcast` for multi-consumer pub/sub.
pub struct EventBus {
    sender: broadcast::Sender<Arc<DomainEvent>>,
}

impl EventBus {
    /// Create a new event bus with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: DomainEvent) {
        // No subscribers is fine
        let _ = self.sender.send(Arc::new(event));
    }

    /// Subscribe to receive events.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<DomainEvent>> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
