//! Tiered conversation memory.
//!
//! Every conversation owns a short-term record (verbatim chunks, in append
//! order) and a long-term record (consolidation summaries). Both live behind
//! one per-conversation `parking_lot::Mutex`, which serializes writers of that
//! conversation; different conversations never contend.
//!
//! The vector index is updated inside the same critical section as the
//! record, so its id space always equals the ids held by the records.
//!
//! Lock order: conversation map, then conversation, then index.

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tierwise_config::MemoryConfig;
use tierwise_core::chunk::{Chunk, ChunkId, IMPORTANT_THRESHOLD};
use tierwise_core::embedding::Embedder;
use tierwise_core::error::{EmbeddingError, IndexError, MemoryError};
use tierwise_core::event::{DomainEvent, EventBus};
use tierwise_core::memory::{
    ConversationKey, MemoryQuery, MemoryRecord, MemoryStats, ScoredChunk, SearchScope, Summarizer,
    Tier,
};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::chunker::Chunker;
use crate::index::{IndexMeta, IndexSnapshot, VectorIndex};
use crate::summarizer::ConcatSummarizer;

/// Attempts at committing a rebuild before giving up on racing writers.
const REBUILD_ATTEMPTS: usize = 3;

/// Both tiers of one conversation.
#[derive(Debug, Clone)]
pub(crate) struct ConversationMemory {
    pub(crate) short: MemoryRecord,
    pub(crate) long: MemoryRecord,
    /// Tokens that left the short tier through consolidation
    pub(crate) consolidated_tokens: usize,
}

impl ConversationMemory {
    pub(crate) fn new(key: &ConversationKey) -> Self {
        Self {
            short: MemoryRecord::new(key, Tier::Short),
            long: MemoryRecord::new(key, Tier::Long),
            consolidated_tokens: 0,
        }
    }

    pub(crate) fn record(&self, tier: Tier) -> &MemoryRecord {
        match tier {
            Tier::Short => &self.short,
            Tier::Long => &self.long,
        }
    }

    fn record_mut(&mut self, tier: Tier) -> &mut MemoryRecord {
        match tier {
            Tier::Short => &mut self.short,
            Tier::Long => &mut self.long,
        }
    }

    fn chunks(&self) -> impl Iterator<Item = (Tier, &Arc<Chunk>)> {
        self.short
            .chunks
            .iter()
            .map(|c| (Tier::Short, c))
            .chain(self.long.chunks.iter().map(|c| (Tier::Long, c)))
    }
}

pub(crate) type ConversationMap = HashMap<ConversationKey, Arc<Mutex<ConversationMemory>>>;

/// Conversation memory with a vector index and background consolidation.
pub struct MemoryStore {
    pub(crate) config: MemoryConfig,
    pub(crate) chunker: Chunker,
    pub(crate) embedder: RwLock<Arc<dyn Embedder>>,
    pub(crate) summarizer: Arc<dyn Summarizer>,
    pub(crate) index: VectorIndex,
    pub(crate) conversations: RwLock<ConversationMap>,
    pub(crate) events: Arc<EventBus>,
    pub(crate) consolidation_tx: Mutex<Option<mpsc::Sender<ConversationKey>>>,
    pub(crate) pending: Mutex<HashSet<ConversationKey>>,
}

impl MemoryStore {
    pub fn new(config: MemoryConfig, embedder: Arc<dyn Embedder>) -> Self {
        let index = VectorIndex::new(embedder.dimension());
        Self {
            config,
            chunker: Chunker::default(),
            embedder: RwLock::new(embedder),
            summarizer: Arc::new(ConcatSummarizer),
            index,
            conversations: RwLock::new(HashMap::new()),
            events: Arc::new(EventBus::default()),
            consolidation_tx: Mutex::new(None),
            pending: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_chunker(mut self, chunker: Chunker) -> Self {
        self.chunker = chunker;
        self
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = summarizer;
        self
    }

    /// Publish events on a shared bus instead of a private one.
    pub fn with_event_bus(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    pub fn chunker(&self) -> &Chunker {
        &self.chunker
    }

    pub fn index(&self) -> &VectorIndex {
        &self.index
    }

    /// The embedder currently used for ingest and summaries.
    pub fn embedder(&self) -> Arc<dyn Embedder> {
        self.embedder.read().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<DomainEvent>> {
        self.events.subscribe()
    }

    pub(crate) fn conversation(&self, key: &ConversationKey) -> Option<Arc<Mutex<ConversationMemory>>> {
        self.conversations.read().get(key).cloned()
    }

    fn conversation_or_create(&self, key: &ConversationKey) -> Arc<Mutex<ConversationMemory>> {
        if let Some(existing) = self.conversation(key) {
            return existing;
        }
        self.conversations
            .write()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(ConversationMemory::new(key))))
            .clone()
    }

    pub(crate) fn over_threshold(&self, short: &MemoryRecord) -> bool {
        short.len() > self.config.max_short_term_chunks
            || short.token_count > self.config.max_memory_tokens
    }

    /// Publish `IndexHalted` when an index error halted the index.
    pub(crate) fn note_index_error(&self, error: &IndexError) {
        if let IndexError::DimensionMismatch { .. } = error {
            if let Some(reason) = self.index.halted() {
                self.events.publish(DomainEvent::IndexHalted {
                    reason,
                    timestamp: Utc::now(),
                });
            }
        }
    }

    /// Append an embedded chunk to the conversation's short-term tier.
    ///
    /// The chunk is indexed first; if indexing fails the record is untouched.
    pub fn append(&self, key: &ConversationKey, chunk: Chunk) -> Result<Arc<Chunk>, MemoryError> {
        let chunk = Arc::new(chunk);
        self.commit_appends(key, vec![chunk.clone()])?;
        Ok(chunk)
    }

    /// Append chunks as one contiguous run under a single hold of the
    /// conversation lock. Either every chunk is stored or none is.
    pub fn append_batch(&self, key: &ConversationKey, chunks: Vec<Chunk>) -> Result<Vec<Arc<Chunk>>, MemoryError> {
        let chunks: Vec<Arc<Chunk>> = chunks.into_iter().map(Arc::new).collect();
        self.commit_appends(key, chunks.clone())?;
        Ok(chunks)
    }

    fn commit_appends(&self, key: &ConversationKey, chunks: Vec<Arc<Chunk>>) -> Result<(), MemoryError> {
        if chunks.is_empty() {
            return Ok(());
        }
        let conversation = self.conversation_or_create(key);

        let (short_len, needs_consolidation) = {
            let mut memory = conversation.lock();
            let entries = chunks
                .iter()
                .map(|c| {
                    let meta = IndexMeta::new(key.clone(), Tier::Short, c.created_at);
                    (c.id.clone(), c.embedding.clone(), meta)
                })
                .collect();
            if let Err(e) = self.index.add_many(entries) {
                drop(memory);
                self.note_index_error(&e);
                return Err(e.into());
            }
            for chunk in &chunks {
                memory.short.push(chunk.clone());
            }
            (memory.short.len(), self.over_threshold(&memory.short))
        };

        let first_len = short_len + 1 - chunks.len();
        for (offset, chunk) in chunks.iter().enumerate() {
            debug!(conversation = %key, chunk_id = %chunk.id, short_len = first_len + offset, "Chunk appended");
            self.events.publish(DomainEvent::ChunkAppended {
                conversation: key.clone(),
                chunk_id: chunk.id.clone(),
                short_term_len: first_len + offset,
                timestamp: Utc::now(),
            });
        }

        if needs_consolidation {
            self.schedule_consolidation(key);
        }
        Ok(())
    }

    /// Chunk, embed and append `text` as one contiguous run.
    pub async fn ingest(
        &self,
        key: &ConversationKey,
        source_id: Option<&str>,
        text: &str,
    ) -> Result<Vec<Arc<Chunk>>, MemoryError> {
        let drafts = self.chunker.split(text, source_id)?;
        if drafts.is_empty() {
            return Ok(vec![]);
        }

        let embedder = self.embedder();
        let texts: Vec<String> = drafts.iter().map(|d| d.text.clone()).collect();
        let batch = embedder.embed_batch(&texts).await?;
        if batch.vectors.len() != drafts.len() {
            return Err(EmbeddingError::InvalidResponse {
                provider: embedder.name().to_string(),
                reason: format!(
                    "expected {} embeddings, got {}",
                    drafts.len(),
                    batch.vectors.len()
                ),
            }
            .into());
        }

        let chunks = drafts
            .into_iter()
            .zip(batch.vectors)
            .map(|(draft, vector)| draft.embed(vector))
            .collect();
        self.append_batch(key, chunks)
    }

    /// Ranked chunks for an embedded query.
    pub fn search(&self, query: &MemoryQuery) -> Result<Vec<ScoredChunk>, MemoryError> {
        let hits = self.index.search_filtered(&query.vector, query.limit, |meta| {
            query.accepts_tier(meta.tier) && scope_matches(&query.scope, &meta.conversation)
        })?;

        let conversations = self.conversations.read();
        let mut results = Vec::with_capacity(hits.len());
        for hit in hits {
            if hit.score < query.min_score {
                break;
            }
            let Some(conversation) = conversations.get(&hit.meta.conversation) else {
                continue;
            };
            let memory = conversation.lock();
            if let Some(chunk) = memory.record(hit.meta.tier).get(&hit.id) {
                results.push(ScoredChunk {
                    chunk: chunk.clone(),
                    score: hit.score,
                    tier: hit.meta.tier,
                    conversation: hit.meta.conversation.clone(),
                });
            }
        }
        Ok(results)
    }

    /// Embed `text` and search with it.
    pub async fn search_text(
        &self,
        scope: SearchScope,
        text: &str,
        limit: usize,
    ) -> Result<Vec<ScoredChunk>, MemoryError> {
        let embedding = self.embedder().embed(text).await?;
        self.search(&MemoryQuery::new(scope, embedding.vector, limit))
    }

    /// Counts and tokens across all of a user's conversations.
    pub fn stats(&self, user_id: &str) -> MemoryStats {
        self.collect_stats(|key| key.user_id == user_id)
    }

    /// Counts and tokens across every conversation.
    pub fn global_stats(&self) -> MemoryStats {
        self.collect_stats(|_| true)
    }

    fn collect_stats(&self, include: impl Fn(&ConversationKey) -> bool) -> MemoryStats {
        let conversations = self.conversations.read();
        let mut stats = MemoryStats::default();
        for (_, conversation) in conversations.iter().filter(|(k, _)| include(k)) {
            let memory = conversation.lock();
            stats.short_count += memory.short.len();
            stats.long_count += memory.long.len();
            stats.total_tokens += memory.short.token_count + memory.long.token_count;
            stats.important_count += memory
                .chunks()
                .filter(|(_, c)| c.importance >= IMPORTANT_THRESHOLD)
                .count();
            stats.conversations += 1;
        }
        stats
    }

    /// Most recent short-term chunks whose tokens fit `max_tokens`, oldest first.
    pub fn context_window(&self, key: &ConversationKey, max_tokens: usize) -> Vec<Arc<Chunk>> {
        let Some(conversation) = self.conversation(key) else {
            return vec![];
        };
        let memory = conversation.lock();
        let mut used = 0;
        let mut window: Vec<Arc<Chunk>> = memory
            .short
            .chunks
            .iter()
            .rev()
            .take_while(|c| {
                used += c.token_count;
                used <= max_tokens
            })
            .cloned()
            .collect();
        window.reverse();
        window
    }

    /// Remove one chunk from its record and the index. Returns whether it existed.
    pub fn delete(&self, chunk_id: &str) -> bool {
        let conversations = self.conversations.read();
        for conversation in conversations.values() {
            let mut memory = conversation.lock();
            let found = [Tier::Short, Tier::Long].into_iter().find_map(|tier| {
                memory
                    .record(tier)
                    .chunks
                    .iter()
                    .position(|c| c.id == chunk_id)
                    .map(|pos| (tier, pos))
            });
            if let Some((tier, pos)) = found {
                let record = memory.record_mut(tier);
                record.chunks.remove(pos);
                record.recount();
                self.index.remove(chunk_id);
                debug!(chunk_id, tier = %tier, "Chunk deleted");
                return true;
            }
        }
        false
    }

    /// A copy of one tier of one conversation.
    pub fn record(&self, key: &ConversationKey, tier: Tier) -> Option<MemoryRecord> {
        self.conversation(key)
            .map(|c| c.lock().record(tier).clone())
    }

    /// Short-term tokens plus tokens already merged into summaries.
    pub fn accounted_tokens(&self, key: &ConversationKey) -> usize {
        self.conversation(key)
            .map(|c| {
                let memory = c.lock();
                memory.short.token_count + memory.consolidated_tokens
            })
            .unwrap_or(0)
    }

    pub fn conversations(&self) -> Vec<ConversationKey> {
        let mut keys: Vec<_> = self.conversations.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Re-embed every stored chunk with `embedder`, make it the active
    /// embedder, and rebuild the index. Clears a halted index.
    pub async fn rebuild(&self, embedder: Arc<dyn Embedder>) -> Result<usize, MemoryError> {
        for attempt in 1..=REBUILD_ATTEMPTS {
            let chunks: Vec<Arc<Chunk>> = {
                let conversations = self.conversations.read();
                conversations
                    .values()
                    .flat_map(|c| {
                        let memory = c.lock();
                        memory.chunks().map(|(_, chunk)| chunk.clone()).collect::<Vec<_>>()
                    })
                    .collect()
            };

            let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
            let batch = embedder.embed_batch(&texts).await?;
            if batch.vectors.len() != chunks.len() || batch.dim != embedder.dimension() {
                return Err(EmbeddingError::InvalidResponse {
                    provider: embedder.name().to_string(),
                    reason: "re-embedding returned an inconsistent batch".into(),
                }
                .into());
            }
            let reembedded: HashMap<ChunkId, Arc<Chunk>> = chunks
                .iter()
                .zip(batch.vectors)
                .map(|(c, v)| (c.id.clone(), Arc::new(c.with_embedding(v))))
                .collect();

            if let Some(count) = self.commit_rebuild(&reembedded, embedder.dimension())? {
                *self.embedder.write() = embedder.clone();
                self.events.publish(DomainEvent::IndexRebuilt {
                    entries: count,
                    dimension: embedder.dimension(),
                    timestamp: Utc::now(),
                });
                return Ok(count);
            }
            warn!(attempt, "Chunks appended during rebuild, retrying");
        }
        Err(IndexError::Storage("writers kept racing the rebuild".into()).into())
    }

    /// Swap re-embedded chunks into every record and rebuild the index.
    /// Returns `None` without changing anything if a chunk was not re-embedded.
    fn commit_rebuild(
        &self,
        reembedded: &HashMap<ChunkId, Arc<Chunk>>,
        dimension: usize,
    ) -> Result<Option<usize>, MemoryError> {
        let conversations = self.conversations.read();
        let mut keys: Vec<&ConversationKey> = conversations.keys().collect();
        keys.sort();
        let mut guards: Vec<_> = keys
            .iter()
            .map(|k| (*k, conversations[*k].lock()))
            .collect();

        let complete = guards
            .iter()
            .all(|(_, memory)| memory.chunks().all(|(_, c)| reembedded.contains_key(&c.id)));
        if !complete {
            return Ok(None);
        }

        let mut snapshot = IndexSnapshot {
            dimension,
            entries: Vec::with_capacity(reembedded.len()),
        };
        let mut seq = 0;
        let mut replaced = Vec::with_capacity(guards.len());
        for (key, memory) in guards.iter() {
            let mut next = (**memory).clone();
            for tier in [Tier::Short, Tier::Long] {
                let record = next.record_mut(tier);
                for chunk in record.chunks.iter_mut() {
                    *chunk = reembedded[&chunk.id].clone();
                    let mut meta = IndexMeta::new((*key).clone(), tier, chunk.created_at);
                    meta.seq = seq;
                    seq += 1;
                    snapshot
                        .entries
                        .push((chunk.id.clone(), chunk.embedding.clone(), meta));
                }
            }
            replaced.push(next);
        }

        let count = snapshot.entries.len();
        self.index.rebuild(snapshot)?;
        for ((_, memory), next) in guards.iter_mut().zip(replaced) {
            **memory = next;
        }
        info!(entries = count, dimension, "Memory re-embedded");
        Ok(Some(count))
    }
}

pub(crate) fn scope_matches(scope: &SearchScope, conversation: &ConversationKey) -> bool {
    match scope {
        SearchScope::Conversation(key) => key == conversation,
        SearchScope::User(user_id) => &conversation.user_id == user_id,
        SearchScope::Global => true,
    }
}
