//! Persisted index format.
//!
//! A JSON document mapping chunk ids to `(vector, metadata)` plus the index
//! dimension. The metadata carries everything needed to rebuild the memory
//! records, so restoring the file restores both tiers of every conversation.
//!
//! Loading checks the stored dimension against the active embedder and
//! rejects structurally broken files. Nothing is repaired silently.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use parking_lot::Mutex;
use tierwise_core::chunk::{Chunk, ChunkId, Span};
use tierwise_core::error::{IndexError, MemoryError};
use tierwise_core::memory::{ConversationKey, Tier};
use tracing::info;

use crate::index::{IndexMeta, IndexSnapshot};
use crate::store::{ConversationMap, ConversationMemory, MemoryStore};

const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedIndex {
    pub version: u32,
    pub dimension: usize,
    pub entries: BTreeMap<ChunkId, PersistedEntry>,
    #[serde(default)]
    pub conversations: Vec<PersistedConversation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedEntry {
    pub vector: Vec<f32>,
    pub metadata: EntryMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryMetadata {
    pub user_id: String,
    pub conversation_id: String,
    pub tier: Tier,
    /// Position within the (conversation, tier) record
    pub position: usize,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    pub span: Span,
    pub token_count: usize,
    #[serde(default = "tierwise_core::chunk::neutral_importance")]
    pub importance: f32,
    pub created_at: DateTime<Utc>,
}

/// Per-conversation accounting that is not derivable from the entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedConversation {
    pub user_id: String,
    pub conversation_id: String,
    pub consolidated_tokens: usize,
}

impl PersistedIndex {
    /// Read and validate a persisted index.
    pub fn load(path: &Path, expected_dimension: usize) -> Result<Self, IndexError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| IndexError::Storage(format!("{}: {e}", path.display())))?;
        let persisted: Self = serde_json::from_str(&content)
            .map_err(|e| IndexError::Corrupted(format!("{}: {e}", path.display())))?;
        persisted.validate(expected_dimension)?;
        Ok(persisted)
    }

    fn validate(&self, expected_dimension: usize) -> Result<(), IndexError> {
        if self.version != FORMAT_VERSION {
            return Err(IndexError::Corrupted(format!(
                "unsupported format version {}",
                self.version
            )));
        }
        if self.dimension != expected_dimension {
            return Err(IndexError::DimensionMismatch {
                expected: expected_dimension,
                actual: self.dimension,
            });
        }
        let mut positions = std::collections::HashSet::new();
        for (id, entry) in &self.entries {
            if entry.vector.len() != self.dimension {
                return Err(IndexError::Corrupted(format!(
                    "entry {id} has dimension {}, file declares {}",
                    entry.vector.len(),
                    self.dimension
                )));
            }
            let m = &entry.metadata;
            if !positions.insert((&m.user_id, &m.conversation_id, m.tier, m.position)) {
                return Err(IndexError::Corrupted(format!(
                    "entry {id} repeats position {} in {}:{} ({})",
                    m.position, m.user_id, m.conversation_id, m.tier
                )));
            }
        }
        Ok(())
    }

    /// Write atomically: a temporary file renamed over the target.
    pub fn save(&self, path: &Path) -> Result<(), IndexError> {
        let storage = |e: std::io::Error| IndexError::Storage(format!("{}: {e}", path.display()));
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(storage)?;
            }
        }
        let json = serde_json::to_vec(self).map_err(|e| IndexError::Storage(e.to_string()))?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, json).map_err(storage)?;
        std::fs::rename(&tmp, path).map_err(storage)?;
        Ok(())
    }
}

impl MemoryStore {
    /// Persist every conversation and its vectors. Returns the entry count.
    pub fn save_index(&self, path: &Path) -> Result<usize, MemoryError> {
        let mut persisted = PersistedIndex {
            version: FORMAT_VERSION,
            dimension: self.index.dimension(),
            entries: BTreeMap::new(),
            conversations: Vec::new(),
        };

        for key in self.conversations() {
            let Some(conversation) = self.conversation(&key) else {
                continue;
            };
            let memory = conversation.lock();
            persisted.conversations.push(PersistedConversation {
                user_id: key.user_id.clone(),
                conversation_id: key.conversation_id.clone(),
                consolidated_tokens: memory.consolidated_tokens,
            });
            for tier in [Tier::Short, Tier::Long] {
                for (position, chunk) in memory.record(tier).chunks.iter().enumerate() {
                    persisted.entries.insert(
                        chunk.id.clone(),
                        PersistedEntry {
                            vector: chunk.embedding.clone(),
                            metadata: EntryMetadata {
                                user_id: key.user_id.clone(),
                                conversation_id: key.conversation_id.clone(),
                                tier,
                                position,
                                text: chunk.text.clone(),
                                source_id: chunk.source_id.clone(),
                                span: chunk.span,
                                token_count: chunk.token_count,
                                importance: chunk.importance,
                                created_at: chunk.created_at,
                            },
                        },
                    );
                }
            }
        }

        let count = persisted.entries.len();
        persisted.save(path)?;
        info!(path = %path.display(), entries = count, "Index saved");
        Ok(count)
    }

    /// Replace all memory with the contents of a persisted index.
    ///
    /// Meant for startup, before the store serves traffic.
    pub fn restore(&self, path: &Path) -> Result<usize, MemoryError> {
        let expected = self.embedder().dimension();
        let persisted = PersistedIndex::load(path, expected)?;

        let mut memories: HashMap<ConversationKey, ConversationMemory> = HashMap::new();
        let mut ordered: Vec<(ChunkId, PersistedEntry)> = persisted.entries.into_iter().collect();
        ordered.sort_by(|(_, a), (_, b)| {
            (a.metadata.created_at, a.metadata.position).cmp(&(b.metadata.created_at, b.metadata.position))
        });

        let mut snapshot = IndexSnapshot {
            dimension: persisted.dimension,
            entries: Vec::with_capacity(ordered.len()),
        };
        let mut placed: Vec<(ConversationKey, Tier, usize, Arc<Chunk>)> = Vec::with_capacity(ordered.len());
        for (seq, (id, entry)) in ordered.into_iter().enumerate() {
            let m = entry.metadata;
            let key = ConversationKey::new(m.user_id, m.conversation_id);
            let mut meta = IndexMeta::new(key.clone(), m.tier, m.created_at);
            meta.seq = seq as u64;
            snapshot.entries.push((id.clone(), entry.vector.clone(), meta));
            placed.push((
                key,
                m.tier,
                m.position,
                Arc::new(Chunk {
                    id,
                    source_id: m.source_id,
                    text: m.text,
                    embedding: entry.vector,
                    span: m.span,
                    token_count: m.token_count,
                    importance: m.importance,
                    created_at: m.created_at,
                }),
            ));
        }

        placed.sort_by(|a, b| (&a.0, a.1 == Tier::Long, a.2).cmp(&(&b.0, b.1 == Tier::Long, b.2)));
        for (key, tier, _, chunk) in placed {
            let memory = memories
                .entry(key.clone())
                .or_insert_with(|| ConversationMemory::new(&key));
            match tier {
                Tier::Short => memory.short.push(chunk),
                Tier::Long => memory.long.push(chunk),
            }
        }
        for c in persisted.conversations {
            let key = ConversationKey::new(c.user_id, c.conversation_id);
            memories
                .entry(key.clone())
                .or_insert_with(|| ConversationMemory::new(&key))
                .consolidated_tokens = c.consolidated_tokens;
        }

        let count = snapshot.entries.len();
        let map: ConversationMap = memories
            .into_iter()
            .map(|(k, m)| (k, Arc::new(Mutex::new(m))))
            .collect();

        let mut conversations = self.conversations.write();
        self.index.rebuild(snapshot)?;
        *conversations = map;
        drop(conversations);

        info!(path = %path.display(), entries = count, "Index restored");
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::{chunk, small_config, store};

    #[tokio::test]
    async fn save_and_restore_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");

        let original = store(small_config());
        let key = ConversationKey::new("u1", "c1");
        original.append(&key, chunk("remember this, it is urgent")).unwrap();
        for i in 0..30 {
            original.append(&key, chunk(&format!("note {i} about things"))).unwrap();
        }
        original.consolidate_until_bounded(&key).await.unwrap();
        let saved = original.save_index(&path).unwrap();
        assert_eq!(saved, original.index().len());

        let restored = store(small_config());
        assert_eq!(restored.restore(&path).unwrap(), saved);
        assert_eq!(restored.index().len(), saved);

        let before_short = original.record(&key, Tier::Short).unwrap();
        let after_short = restored.record(&key, Tier::Short).unwrap();
        let ids = |r: &tierwise_core::memory::MemoryRecord| {
            r.chunks.iter().map(|c| c.id.clone()).collect::<Vec<_>>()
        };
        assert_eq!(ids(&before_short), ids(&after_short));
        assert_eq!(after_short.token_count, before_short.token_count);
        assert_eq!(restored.record(&key, Tier::Long).unwrap().len(), 1);
        assert_eq!(restored.accounted_tokens(&key), original.accounted_tokens(&key));

        // The summary keeps the weight of the important chunk it absorbed
        let summary = &restored.record(&key, Tier::Long).unwrap().chunks[0];
        assert!(summary.importance >= 0.7);
        assert_eq!(restored.stats("u1").important_count, 1);
    }

    #[test]
    fn dimension_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");
        let original = store(small_config());
        original
            .append(&ConversationKey::new("u1", "c1"), chunk("hello"))
            .unwrap();
        original.save_index(&path).unwrap();

        assert!(matches!(
            PersistedIndex::load(&path, 128),
            Err(IndexError::DimensionMismatch { expected: 128, actual: 64 })
        ));
    }

    #[test]
    fn corrupted_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            PersistedIndex::load(&path, 64),
            Err(IndexError::Corrupted(_))
        ));

        let bad = r#"{"version":1,"dimension":2,"entries":{"a":{"vector":[1.0],"metadata":{
            "user_id":"u","conversation_id":"c","tier":"short","position":0,"text":"x",
            "span":{"start":0,"end":1},"token_count":1,"created_at":"2026-01-01T00:00:00Z"}}}}"#;
        std::fs::write(&path, bad).unwrap();
        assert!(matches!(
            PersistedIndex::load(&path, 2),
            Err(IndexError::Corrupted(_))
        ));
    }

    #[test]
    fn failed_restore_keeps_existing_memory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");
        std::fs::write(&path, "[]").unwrap();

        let store = store(small_config());
        let key = ConversationKey::new("u1", "c1");
        store.append(&key, chunk("keep me")).unwrap();
        assert!(store.restore(&path).is_err());
        assert_eq!(store.record(&key, Tier::Short).unwrap().len(), 1);
    }
}
