//! Consolidation: merging aging short-term chunks into long-term summaries.
//!
//! Appends that push a conversation over its short-term bounds enqueue the
//! conversation on a bounded channel. A background task drains the queue and
//! consolidates each conversation until it is back within bounds.
//!
//! One step works on a snapshot: the batch is chosen and summarized without
//! holding the conversation lock, then the lock is retaken only to verify the
//! batch is still the oldest run of the short tier and to swap it for the
//! summary. Any failure leaves the conversation exactly as it was.

use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::{Arc, Weak};
use tierwise_core::chunk::{Chunk, ChunkId};
use tierwise_core::error::MemoryError;
use tierwise_core::event::DomainEvent;
use tierwise_core::memory::{ConsolidationEvent, ConversationKey, Tier};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::chunker::Chunker;
use crate::index::IndexMeta;
use crate::store::MemoryStore;

/// How many oldest short-term chunks to merge.
///
/// The batch is the shortest prefix whose tokens exceed
/// `consolidation_batch_tokens`, capped so the newest `retain_recent_chunks`
/// stay verbatim, but always large enough to bring the tier back under both
/// bounds and never empty.
pub(crate) fn select_batch(
    token_counts: &[usize],
    max_chunks: usize,
    max_tokens: usize,
    batch_tokens: usize,
    retain_recent: usize,
) -> usize {
    let len = token_counts.len();
    if len == 0 {
        return 0;
    }

    let mut by_batch = len;
    let mut running = 0;
    for (i, t) in token_counts.iter().enumerate() {
        running += t;
        if running > batch_tokens {
            by_batch = i + 1;
            break;
        }
    }
    let preferred = by_batch.min(len.saturating_sub(retain_recent));

    let by_count = len.saturating_sub(max_chunks);
    let total: usize = token_counts.iter().sum();
    let mut by_tokens = 0;
    let mut remaining = total;
    while remaining > max_tokens && by_tokens < len {
        remaining -= token_counts[by_tokens];
        by_tokens += 1;
    }

    preferred.max(by_count).max(by_tokens).max(1).min(len)
}

/// Cut a summary down to at most `max_chars`, preferring a sentence boundary.
pub(crate) fn bound_summary(summary: &str, max_chars: usize) -> Result<String, MemoryError> {
    let chunker = Chunker::with_window(max_chars, 0, max_chars / 4)?;
    Ok(chunker.first_chunk(summary.trim())?)
}

impl MemoryStore {
    /// Queue a conversation for the background consolidator, once.
    pub(crate) fn schedule_consolidation(&self, key: &ConversationKey) {
        let tx = self.consolidation_tx.lock().clone();
        let Some(tx) = tx else {
            debug!(conversation = %key, "No consolidator running, leaving over threshold");
            return;
        };
        if !self.pending.lock().insert(key.clone()) {
            return;
        }
        if let Err(e) = tx.try_send(key.clone()) {
            self.pending.lock().remove(key);
            warn!(conversation = %key, error = %e, "Consolidation queue full, will retry on next append");
        }
    }

    /// Start the background consolidator. Dropping the store stops it.
    pub fn start_consolidator(self: &Arc<Self>) -> JoinHandle<()> {
        let (tx, mut rx) = mpsc::channel(self.config.consolidation_queue);
        *self.consolidation_tx.lock() = Some(tx);
        let store: Weak<Self> = Arc::downgrade(self);

        tokio::spawn(async move {
            while let Some(key) = rx.recv().await {
                let Some(store) = store.upgrade() else {
                    break;
                };
                store.pending.lock().remove(&key);
                if let Err(e) = store.consolidate_until_bounded(&key).await {
                    warn!(conversation = %key, error = %e, "Consolidation aborted");
                }
            }
            debug!("Consolidator stopped");
        })
    }

    /// Consolidate repeatedly until the conversation is within bounds.
    pub async fn consolidate_until_bounded(
        &self,
        key: &ConversationKey,
    ) -> Result<Vec<ConsolidationEvent>, MemoryError> {
        let mut events = Vec::new();
        while let Some(event) = self.consolidate(key).await? {
            events.push(event);
        }
        Ok(events)
    }

    /// Consolidate every conversation that is over its bounds.
    pub async fn consolidate_all(&self) -> Result<Vec<ConsolidationEvent>, MemoryError> {
        let mut events = Vec::new();
        for key in self.conversations() {
            events.extend(self.consolidate_until_bounded(&key).await?);
        }
        Ok(events)
    }

    /// Run one consolidation step. Returns `None` when the conversation is
    /// within bounds, so re-evaluating a consolidated state does nothing.
    pub async fn consolidate(
        &self,
        key: &ConversationKey,
    ) -> Result<Option<ConsolidationEvent>, MemoryError> {
        let result = self.consolidate_step(key).await;
        if let Err(e) = &result {
            self.events.publish(DomainEvent::ConsolidationAborted {
                conversation: key.clone(),
                reason: e.to_string(),
                timestamp: Utc::now(),
            });
        }
        result
    }

    async fn consolidate_step(
        &self,
        key: &ConversationKey,
    ) -> Result<Option<ConsolidationEvent>, MemoryError> {
        let Some(conversation) = self.conversation(key) else {
            return Err(MemoryError::ConversationNotFound(key.to_string()));
        };

        let batch: Vec<Arc<Chunk>> = {
            let memory = conversation.lock();
            if !self.over_threshold(&memory.short) {
                return Ok(None);
            }
            let counts: Vec<usize> = memory.short.chunks.iter().map(|c| c.token_count).collect();
            let n = select_batch(
                &counts,
                self.config.max_short_term_chunks,
                self.config.max_memory_tokens,
                self.config.consolidation_batch_tokens,
                self.config.retain_recent_chunks,
            );
            memory.short.chunks[..n].to_vec()
        };

        let aborted = |reason: String| MemoryError::ConsolidationAborted {
            conversation_id: key.to_string(),
            reason,
        };

        let texts: Vec<&str> = batch.iter().map(|c| c.text.as_str()).collect();
        let summary = self
            .summarizer
            .summarize(&texts)
            .await
            .map_err(|e| aborted(format!("summarizer '{}': {e}", self.summarizer.name())))?;
        let summary = bound_summary(&summary, self.config.summary_max_chars)
            .map_err(|e| aborted(e.to_string()))?;
        if summary.is_empty() {
            return Err(aborted("summary is empty".into()));
        }

        let embedding = self
            .embedder()
            .embed(&summary)
            .await
            .map_err(|e| aborted(e.to_string()))?;
        // A summary is at least as important as the most important chunk it merges
        let carried = batch.iter().map(|c| c.importance).fold(0.0, f32::max);
        let summary_chunk = Chunk::from_text(summary, Some(format!("consolidation:{key}")), embedding.vector);
        let importance = summary_chunk.importance.max(carried);
        let summary_chunk = Arc::new(summary_chunk.with_importance(importance));

        let merged_ids: Vec<ChunkId> = batch.iter().map(|c| c.id.clone()).collect();
        let merged_tokens: usize = batch.iter().map(|c| c.token_count).sum();

        {
            let mut memory = conversation.lock();
            let unchanged = memory.short.chunks.len() >= batch.len()
                && memory.short.chunks[..batch.len()]
                    .iter()
                    .zip(&batch)
                    .all(|(a, b)| Arc::ptr_eq(a, b));
            if !unchanged {
                return Err(aborted("short-term tier changed during consolidation".into()));
            }

            let meta = IndexMeta::new(key.clone(), Tier::Long, summary_chunk.created_at);
            if let Err(e) = self.index.replace(
                &merged_ids,
                summary_chunk.id.clone(),
                summary_chunk.embedding.clone(),
                meta,
            ) {
                drop(memory);
                self.note_index_error(&e);
                return Err(aborted(e.to_string()));
            }

            memory.short.chunks.drain(..batch.len());
            memory.short.recount();
            memory.long.push(summary_chunk.clone());
            memory.consolidated_tokens += merged_tokens;
        }

        let event = ConsolidationEvent {
            conversation_id: key.conversation_id.clone(),
            user_id: key.user_id.clone(),
            merged_chunk_ids: merged_ids.into_iter().collect::<BTreeSet<_>>(),
            merged_token_count: merged_tokens,
            summary_chunk,
            triggered_at: Utc::now(),
        };
        info!(
            conversation = %key,
            merged = event.merged_chunk_ids.len(),
            merged_tokens,
            "Consolidated short-term memory"
        );
        self.events.publish(DomainEvent::Consolidated(event.clone()));
        Ok(Some(event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::{chunk, small_config, store};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::time::Duration;
    use tierwise_core::memory::Summarizer;

    struct FailingSummarizer;

    #[async_trait]
    impl Summarizer for FailingSummarizer {
        fn name(&self) -> &str {
            "failing"
        }
        async fn summarize(&self, _texts: &[&str]) -> Result<String, String> {
            Err("model unavailable".into())
        }
    }

    #[test]
    fn batch_is_prefix_exceeding_batch_tokens() {
        // 3 + 3 = 6 > 5
        assert_eq!(select_batch(&[3, 3, 3, 3, 3, 3], 5, 1000, 5, 0), 2);
    }

    #[test]
    fn batch_keeps_recent_chunks() {
        assert_eq!(select_batch(&[1; 10], 8, 1000, 1000, 4), 6);
    }

    #[test]
    fn batch_restores_count_bound() {
        // Batch tokens are satisfied by one chunk, but the count bound needs three.
        assert_eq!(select_batch(&[10, 1, 1, 1, 1], 2, 1000, 5, 4), 3);
    }

    #[test]
    fn batch_restores_token_bound() {
        assert_eq!(select_batch(&[5, 5, 5, 5], 100, 8, 1, 4), 3);
    }

    #[test]
    fn batch_never_empty() {
        assert_eq!(select_batch(&[1, 1], 1, 1000, 1000, 5), 1);
        assert_eq!(select_batch(&[], 1, 1, 1, 1), 0);
    }

    #[test]
    fn summary_is_bounded() {
        let s = bound_summary("First sentence here. Second one is long enough", 25).unwrap();
        assert!(s.chars().count() <= 25);
        assert_eq!(s, "First sentence here. ");
    }

    #[tokio::test]
    async fn within_bounds_is_noop() {
        let store = store(small_config());
        let key = ConversationKey::new("u1", "c1");
        store.append(&key, chunk("hello")).unwrap();
        assert!(store.consolidate(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn twenty_sixth_append_consolidates_once() {
        let store = store(small_config());
        let key = ConversationKey::new("u1", "c1");
        let mut rx = store.subscribe();

        let mut accounted = 0;
        for i in 0..26 {
            store.append(&key, chunk(&format!("message number {i} words"))).unwrap();
            let now = store.accounted_tokens(&key);
            assert!(now >= accounted);
            accounted = now;
        }

        let events = store.consolidate_until_bounded(&key).await.unwrap();
        assert_eq!(events.len(), 1);
        assert!(store.consolidate(&key).await.unwrap().is_none());

        let short = store.record(&key, Tier::Short).unwrap();
        let long = store.record(&key, Tier::Long).unwrap();
        assert!(short.len() <= 25);
        assert_eq!(long.len(), 1);
        assert!(store.accounted_tokens(&key) >= accounted);

        // Index id space: remaining short ids plus the summary
        assert_eq!(store.index().len(), short.len() + 1);
        for id in &events[0].merged_chunk_ids {
            assert!(!store.index().contains(id));
        }
        assert!(store.index().contains(&events[0].summary_chunk.id));

        let mut consolidated = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event.as_ref(), DomainEvent::Consolidated(_)) {
                consolidated += 1;
            }
        }
        assert_eq!(consolidated, 1);
    }

    #[tokio::test]
    async fn summarizer_failure_aborts_without_removal() {
        let store = store(small_config()).with_summarizer(Arc::new(FailingSummarizer));
        let key = ConversationKey::new("u1", "c1");
        for i in 0..26 {
            store.append(&key, chunk(&format!("message {i}"))).unwrap();
        }

        let err = store.consolidate(&key).await.unwrap_err();
        assert!(matches!(err, MemoryError::ConsolidationAborted { .. }));
        assert_eq!(store.record(&key, Tier::Short).unwrap().len(), 26);
        assert_eq!(store.record(&key, Tier::Long).unwrap().len(), 0);
        assert_eq!(store.index().len(), 26);
    }

    #[tokio::test]
    async fn background_consolidator_bounds_every_conversation() {
        let store = Arc::new(store(small_config()));
        let _worker = store.start_consolidator();
        let mut rx = store.subscribe();

        let keys: Vec<_> = (0..3).map(|i| ConversationKey::new("u1", format!("c{i}"))).collect();
        for i in 0..60 {
            for key in &keys {
                store.append(key, chunk(&format!("{key} entry {i} with some words"))).unwrap();
            }
        }

        // Each merged id appears in exactly one event
        let mut seen: HashMap<ChunkId, usize> = HashMap::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let all_bounded = keys.iter().all(|k| {
                store.record(k, Tier::Short).map(|r| r.len()).unwrap_or(0) <= 25
            });
            while let Ok(event) = rx.try_recv() {
                if let DomainEvent::Consolidated(e) = event.as_ref() {
                    for id in &e.merged_chunk_ids {
                        *seen.entry(id.clone()).or_default() += 1;
                    }
                }
            }
            if all_bounded || tokio::time::Instant::now() > deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        for key in &keys {
            assert!(store.record(key, Tier::Short).unwrap().len() <= 25);
        }
        assert!(seen.values().all(|n| *n == 1));
    }
}
