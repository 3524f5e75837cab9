//! Memory domain types — tiers, records, consolidation events and queries.
//!
//! Each conversation owns two ordered records: a short-term tier of verbatim
//! chunks and a long-term tier of consolidated summaries.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use crate::chunk::{Chunk, ChunkId};

/// Memory tier classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Recent, verbatim chunks
    Short,
    /// Consolidated summaries
    Long,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Short => write!(f, "short"),
            Self::Long => write!(f, "long"),
        }
    }
}

/// Identifies one conversation of one user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConversationKey {
    pub user_id: String,
    pub conversation_id: String,
}

impl ConversationKey {
    pub fn new(user_id: impl Into<String>, conversation_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            conversation_id: conversation_id.into(),
        }
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.user_id, self.conversation_id)
    }
}

/// The ordered chunks of one (conversation, tier) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub conversation_id: String,
    pub user_id: String,
    pub tier: Tier,
    pub chunks: Vec<Arc<Chunk>>,
    pub token_count: usize,
}

impl MemoryRecord {
    pub fn new(key: &ConversationKey, tier: Tier) -> Self {
        Self {
            conversation_id: key.conversation_id.clone(),
            user_id: key.user_id.clone(),
            tier,
            chunks: Vec::new(),
            token_count: 0,
        }
    }

    pub fn push(&mut self, chunk: Arc<Chunk>) {
        self.token_count += chunk.token_count;
        self.chunks.push(chunk);
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Arc<Chunk>> {
        self.chunks.iter().find(|c| c.id == id)
    }

    /// Recompute `token_count` from the chunks.
    pub fn recount(&mut self) {
        self.token_count = self.chunks.iter().map(|c| c.token_count).sum();
    }
}

/// Emitted exactly once for every successful consolidation step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsolidationEvent {
    pub conversation_id: String,
    pub user_id: String,
    pub merged_chunk_ids: BTreeSet<ChunkId>,
    /// Tokens held by the merged chunks before consolidation
    pub merged_token_count: usize,
    pub summary_chunk: Arc<Chunk>,
    pub triggered_at: DateTime<Utc>,
}

/// Which conversations a search covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchScope {
    Conversation(ConversationKey),
    User(String),
    Global,
}

/// A memory search request over an already-embedded query.
#[derive(Debug, Clone)]
pub struct MemoryQuery {
    pub scope: SearchScope,
    pub vector: Vec<f32>,
    pub limit: usize,
    /// Empty = both tiers
    pub tiers: Vec<Tier>,
    pub min_score: f32,
}

impl MemoryQuery {
    pub fn new(scope: SearchScope, vector: Vec<f32>, limit: usize) -> Self {
        Self {
            scope,
            vector,
            limit,
            tiers: Vec::new(),
            min_score: f32::MIN,
        }
    }

    pub fn with_tiers(mut self, tiers: impl Into<Vec<Tier>>) -> Self {
        self.tiers = tiers.into();
        self
    }

    pub fn with_min_score(mut self, min_score: f32) -> Self {
        self.min_score = min_score;
        self
    }

    pub fn accepts_tier(&self, tier: Tier) -> bool {
        self.tiers.is_empty() || self.tiers.contains(&tier)
    }
}

/// A search hit.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: Arc<Chunk>,
    pub score: f32,
    pub tier: Tier,
    pub conversation: ConversationKey,
}

/// Per-user memory statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryStats {
    pub short_count: usize,
    pub long_count: usize,
    pub total_tokens: usize,
    pub conversations: usize,
    /// Chunks at or above `chunk::IMPORTANT_THRESHOLD`
    #[serde(default)]
    pub important_count: usize,
}

/// Pluggable summarization capability used by consolidation.
///
/// Implementations may call out to a language model; the default
/// concatenates the merged text.
#[async_trait]
pub trait Summarizer: Send + Sync {
    fn name(&self) -> &str;

    /// Produce one summary text for the given chunk texts, oldest first.
    async fn summarize(&self, texts: &[&str]) -> std::result::Result<String, String>;
}
