//! In-memory vector index with brute-force cosine search.
//!
//! The index holds one vector per chunk id plus the metadata search filters
//! need (conversation, tier, recency). Reads share a `parking_lot::RwLock`;
//! writes and rebuild swaps take it exclusively and never hold it across an
//! await point.
//!
//! A vector of the wrong dimension halts the index. A halted index rejects
//! writes and searches until [`VectorIndex::rebuild`] installs a consistent
//! snapshot.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use tierwise_core::chunk::ChunkId;
use tierwise_core::error::IndexError;
use tierwise_core::memory::{ConversationKey, Tier};
use tracing::{error, info};

/// Compute cosine similarity between two vectors.
///
/// Returns a value in [-1, 1] where 1 = identical, 0 = orthogonal, -1 = opposite.
/// Returns 0.0 if the lengths differ or either vector is empty or zero.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;

    for (x, y) in a.iter().zip(b.iter()) {
        let x = *x as f64;
        let y = *y as f64;
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < 1e-10 {
        return 0.0;
    }

    (dot / denom) as f32
}

/// What the index knows about a chunk besides its vector.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexMeta {
    pub conversation: ConversationKey,
    pub tier: Tier,
    pub created_at: DateTime<Utc>,
    /// Insertion order, breaks ties between equal timestamps
    pub seq: u64,
}

impl IndexMeta {
    pub fn new(conversation: ConversationKey, tier: Tier, created_at: DateTime<Utc>) -> Self {
        Self {
            conversation,
            tier,
            created_at,
            seq: 0,
        }
    }
}

/// One search result.
#[derive(Debug, Clone)]
pub struct IndexHit {
    pub id: ChunkId,
    pub score: f32,
    pub meta: IndexMeta,
}

/// A complete set of entries to install with [`VectorIndex::rebuild`].
#[derive(Debug, Clone, Default)]
pub struct IndexSnapshot {
    pub dimension: usize,
    pub entries: Vec<(ChunkId, Vec<f32>, IndexMeta)>,
}

struct IndexEntry {
    vector: Vec<f32>,
    meta: IndexMeta,
}

struct IndexState {
    dimension: usize,
    entries: HashMap<ChunkId, IndexEntry>,
    halted: Option<String>,
    next_seq: u64,
}

impl IndexState {
    fn check_writable(&self) -> Result<(), IndexError> {
        match &self.halted {
            Some(reason) => Err(IndexError::Halted {
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Validate a vector for insertion; a bad dimension halts the index.
    fn admit(&mut self, id: &str, vector: &[f32]) -> Result<(), IndexError> {
        self.check_writable()?;
        if vector.len() != self.dimension {
            let reason = format!(
                "chunk {id} has dimension {}, index expects {}",
                vector.len(),
                self.dimension
            );
            error!(chunk_id = %id, expected = self.dimension, actual = vector.len(), "Index halted: dimension mismatch");
            self.halted = Some(reason);
            return Err(IndexError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        Ok(())
    }

    fn insert(&mut self, id: ChunkId, vector: Vec<f32>, mut meta: IndexMeta) {
        meta.seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(id, IndexEntry { vector, meta });
    }
}

/// Cosine-similarity index over chunk vectors.
pub struct VectorIndex {
    state: RwLock<IndexState>,
}

impl VectorIndex {
    pub fn new(dimension: usize) -> Self {
        Self {
            state: RwLock::new(IndexState {
                dimension,
                entries: HashMap::new(),
                halted: None,
                next_seq: 0,
            }),
        }
    }

    pub fn dimension(&self) -> usize {
        self.state.read().dimension
    }

    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &str) -> bool {
        self.state.read().entries.contains_key(id)
    }

    /// The reason the index halted, if it has.
    pub fn halted(&self) -> Option<String> {
        self.state.read().halted.clone()
    }

    /// Insert a vector. Fails with `DimensionMismatch` (and halts) on a wrong length.
    pub fn add(&self, id: ChunkId, vector: Vec<f32>, meta: IndexMeta) -> Result<(), IndexError> {
        let mut state = self.state.write();
        state.admit(&id, &vector)?;
        if state.entries.contains_key(&id) {
            return Err(IndexError::DuplicateId(id));
        }
        state.insert(id, vector, meta);
        Ok(())
    }

    /// Insert several vectors. Nothing is inserted unless every one is valid.
    pub fn add_many(&self, entries: Vec<(ChunkId, Vec<f32>, IndexMeta)>) -> Result<(), IndexError> {
        let mut state = self.state.write();
        let mut batch_ids = HashSet::with_capacity(entries.len());
        for (id, vector, _) in &entries {
            state.admit(id, vector)?;
            if state.entries.contains_key(id) || !batch_ids.insert(id.as_str()) {
                return Err(IndexError::DuplicateId(id.clone()));
            }
        }
        for (id, vector, meta) in entries {
            state.insert(id, vector, meta);
        }
        Ok(())
    }

    /// Remove a vector. Returns whether it was present.
    pub fn remove(&self, id: &str) -> bool {
        self.state.write().entries.remove(id).is_some()
    }

    /// Remove `remove_ids` and insert one new entry as a single step.
    ///
    /// Nothing changes unless every removed id exists and the new vector is valid.
    pub fn replace(
        &self,
        remove_ids: &[ChunkId],
        id: ChunkId,
        vector: Vec<f32>,
        meta: IndexMeta,
    ) -> Result<(), IndexError> {
        let mut state = self.state.write();
        state.admit(&id, &vector)?;
        if state.entries.contains_key(&id) {
            return Err(IndexError::DuplicateId(id));
        }
        if let Some(missing) = remove_ids.iter().find(|r| !state.entries.contains_key(*r)) {
            return Err(IndexError::Storage(format!(
                "chunk {missing} is not indexed"
            )));
        }
        for r in remove_ids {
            state.entries.remove(r);
        }
        state.insert(id, vector, meta);
        Ok(())
    }

    /// Top-k chunk ids by cosine similarity.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<(ChunkId, f32)>, IndexError> {
        Ok(self
            .search_filtered(query, k, |_| true)?
            .into_iter()
            .map(|hit| (hit.id, hit.score))
            .collect())
    }

    /// Top-k hits among entries whose metadata passes `filter`.
    ///
    /// Ordered by score descending, then newer `created_at`, then later insertion.
    pub fn search_filtered<F>(&self, query: &[f32], k: usize, filter: F) -> Result<Vec<IndexHit>, IndexError>
    where
        F: Fn(&IndexMeta) -> bool,
    {
        let state = self.state.read();
        if let Some(reason) = &state.halted {
            return Err(IndexError::Halted {
                reason: reason.clone(),
            });
        }
        if query.len() != state.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: state.dimension,
                actual: query.len(),
            });
        }
        if k == 0 {
            return Ok(vec![]);
        }

        let mut hits: Vec<IndexHit> = state
            .entries
            .iter()
            .filter(|(_, entry)| filter(&entry.meta))
            .map(|(id, entry)| IndexHit {
                id: id.clone(),
                score: cosine_similarity(query, &entry.vector),
                meta: entry.meta.clone(),
            })
            .collect();
        drop(state);

        hits.sort_by(rank);
        hits.truncate(k);
        Ok(hits)
    }

    /// Copy out every entry, e.g. for persistence.
    pub fn snapshot(&self) -> IndexSnapshot {
        let state = self.state.read();
        let mut entries: Vec<_> = state
            .entries
            .iter()
            .map(|(id, e)| (id.clone(), e.vector.clone(), e.meta.clone()))
            .collect();
        entries.sort_by_key(|(_, _, meta)| meta.seq);
        IndexSnapshot {
            dimension: state.dimension,
            entries,
        }
    }

    /// Replace the whole index with `snapshot`, clearing any halt.
    ///
    /// The new state is built before the lock is taken; the swap itself is a move.
    pub fn rebuild(&self, snapshot: IndexSnapshot) -> Result<(), IndexError> {
        let mut entries = HashMap::with_capacity(snapshot.entries.len());
        let mut next_seq = 0;
        for (id, vector, meta) in snapshot.entries {
            if vector.len() != snapshot.dimension {
                return Err(IndexError::DimensionMismatch {
                    expected: snapshot.dimension,
                    actual: vector.len(),
                });
            }
            next_seq = next_seq.max(meta.seq + 1);
            if entries.insert(id.clone(), IndexEntry { vector, meta }).is_some() {
                return Err(IndexError::DuplicateId(id));
            }
        }

        let count = entries.len();
        let fresh = IndexState {
            dimension: snapshot.dimension,
            entries,
            halted: None,
            next_seq,
        };
        *self.state.write() = fresh;
        info!(entries = count, dimension = snapshot.dimension, "Vector index rebuilt");
        Ok(())
    }
}

fn rank(a: &IndexHit, b: &IndexHit) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| b.meta.created_at.cmp(&a.meta.created_at))
        .then_with(|| b.meta.seq.cmp(&a.meta.seq))
}

impl std::fmt::Debug for VectorIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("VectorIndex")
            .field("dimension", &state.dimension)
            .field("entries", &state.entries.len())
            .field("halted", &state.halted)
            .finish()
    }
}
