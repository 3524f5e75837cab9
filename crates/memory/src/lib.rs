//! Tiered memory and retrieval for Tierwise.
//!
//! - [`Chunker`]: overlapping, boundary-aware text splitting
//! - [`VectorIndex`]: cosine top-k search with dimension guarding
//! - [`MemoryStore`]: short/long-term records per conversation, with
//!   background consolidation and a persisted index

pub mod chunker;
pub mod consolidator;
pub mod index;
pub mod persist;
pub mod store;
pub mod summarizer;

pub use chunker::{Chunker, Segmentation};
pub use index::{IndexHit, IndexMeta, IndexSnapshot, VectorIndex, cosine_similarity};
pub use persist::PersistedIndex;
pub use store::MemoryStore;
pub use summarizer::ConcatSummarizer;
