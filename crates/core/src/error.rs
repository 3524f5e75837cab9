//! Error types for the Tierwise domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error enum; `Error` unifies them.

use std::time::Duration;
use thiserror::Error;

/// The top-level error type for all Tierwise operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Chunking errors ---
    #[error("Chunking error: {0}")]
    Chunking(#[from] ChunkingError),

    // --- Embedding errors ---
    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    // --- Vector index errors ---
    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    // --- Memory errors ---
    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),

    // --- Registry errors ---
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    // --- Dispatch errors ---
    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChunkingError {
    #[error("Invalid chunking parameters: {0}")]
    InvalidParameters(String),

    #[error("Tokenizer unavailable: {0}")]
    Tokenizer(String),
}

#[derive(Debug, Clone, Error)]
pub enum EmbeddingError {
    #[error("Embedding provider '{provider}' unavailable: {reason}")]
    Unavailable { provider: String, reason: String },

    #[error("Embedding provider '{provider}' returned an invalid response: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("No embedding providers configured")]
    NotConfigured,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum IndexError {
    #[error("Dimension mismatch: index expects {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Index halted until rebuild: {reason}")]
    Halted { reason: String },

    #[error("Duplicate chunk id in index: {0}")]
    DuplicateId(String),

    #[error("Corrupted index state: {0}")]
    Corrupted(String),

    #[error("Index storage error: {0}")]
    Storage(String),
}

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error(transparent)]
    Chunking(#[from] ChunkingError),

    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error("Consolidation aborted for {conversation_id}: {reason}")]
    ConsolidationAborted {
        conversation_id: String,
        reason: String,
    },

    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),

    #[error("Summarizer failed: {0}")]
    Summarizer(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("Duplicate tool server name: {0}")]
    DuplicateServer(String),

    #[error("Tool server not found: {0}")]
    NotFound(String),

    #[error("Invalid tool server '{name}': {reason}")]
    InvalidServer { name: String, reason: String },

    #[error("Failed to load servers file {path}: {reason}")]
    Load { path: String, reason: String },
}

/// Errors raised by a transport while talking to a tool server.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Transport failure: {0}")]
    Io(String),

    #[error("Connection closed")]
    Closed,

    #[error("Tool '{tool}' rejected the call: {reason}")]
    ToolRejected { tool: String, reason: String },

    #[error("Unsupported transport '{0}'")]
    Unsupported(String),
}

impl TransportError {
    /// Whether the failure says something about the health of the connection.
    ///
    /// Tool-level rejections travel over a healthy connection and are not retried.
    pub fn is_transport_failure(&self) -> bool {
        matches!(self, Self::Connect(_) | Self::Io(_) | Self::Closed)
    }
}

/// Structured errors surfaced by the tool dispatcher.
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    #[error("Tool server not found or disabled: {server}")]
    ServerNotFound { server: String },

    #[error("Connection pool exhausted for {server} (size {pool_size})")]
    PoolExhausted { server: String, pool_size: usize },

    #[error("Circuit open for {server}, retry in {retry_in:?}")]
    CircuitOpen {
        server: String,
        retry_in: Duration,
        attempts: u32,
    },

    #[error("Tool call {server}/{tool} timed out after {attempts} attempt(s)")]
    Timeout {
        server: String,
        tool: String,
        attempts: u32,
    },

    #[error("Tool call {server}/{tool} failed after {attempts} attempt(s): {source}")]
    ToolInvocationFailed {
        server: String,
        tool: String,
        attempts: u32,
        source: TransportError,
    },
}

impl DispatchError {
    /// Number of transport attempts made before this error surfaced.
    pub fn attempts(&self) -> u32 {
        match self {
            Self::ServerNotFound { .. } | Self::PoolExhausted { .. } => 0,
            Self::CircuitOpen { attempts, .. }
            | Self::Timeout { attempts, .. }
            | Self::ToolInvocationFailed { attempts, .. } => *attempts,
        }
    }

    /// The server this error refers to.
    pub fn server(&self) -> &str {
        match self {
            Self::ServerNotFound { server }
            | Self::PoolExhausted { server, .. }
            | Self::CircuitOpen { server, .. }
            | Self::Timeout { server, .. }
            | Self::ToolInvocationFailed { server, .. } => server,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dimension_mismatch_displays_both_sides() {
        let err = Error::Index(IndexError::DimensionMismatch {
            expected: 384,
            actual: 1536,
        });
        assert!(err.to_string().contains("384"));
        assert!(err.to_string().contains("1536"));
    }

    #[test]
    fn dispatch_error_carries_attempts() {
        let err = DispatchError::ToolInvocationFailed {
            server: "git".into(),
            tool: "log".into(),
            attempts: 3,
            source: TransportError::Io("broken pipe".into()),
        };
        assert_eq!(err.attempts(), 3);
        assert_eq!(err.server(), "git");
        assert!(err.to_string().contains("broken pipe"));
    }

    #[test]
    fn tool_rejection_is_not_a_transport_failure() {
        let rejected = TransportError::ToolRejected {
            tool: "search".into(),
            reason: "bad args".into(),
        };
        assert!(!rejected.is_transport_failure());
        assert!(TransportError::Closed.is_transport_failure());
    }
}
