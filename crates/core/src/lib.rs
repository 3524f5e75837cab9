//! # Tierwise Core
//!
//! Domain types, traits, and error definitions for tiered conversational
//! memory and multi-server tool dispatch. This crate has **no framework
//! dependencies**; it defines the model every other crate implements against.
//!
//! ## Design Philosophy
//!
//! Every pluggable capability is a trait here (embedders, summarizers, local
//! tools, tool transports). Implementations live in their respective crates:
//! - Swapping implementations via configuration
//! - Easy testing with scripted implementations
//! - Clean dependency graph (all crates depend inward on core)

pub mod error;
pub mod chunk;
pub mod embedding;
pub mod memory;
pub mod tool;
pub mod event;

// Re-export key types at crate root for ergonomics
pub use error::{Error, Result};
pub use chunk::{Chunk, ChunkDraft, ChunkId, Span};
pub use embedding::{Embedder, Embedding, EmbeddingBatch};
pub use memory::{
    ConsolidationEvent, ConversationKey, MemoryQuery, MemoryRecord, MemoryStats, ScoredChunk,
    SearchScope, Summarizer, Tier,
};
pub use tool::{
    CircuitPolicy, RetryPolicy, Tool, ToolDescriptor, ToolServerConfig, ToolTransport,
    TransportDescriptor, TransportSession,
};
pub use event::{DomainEvent, EventBus};
