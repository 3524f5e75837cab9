//! Chunk types — the unit of text that gets embedded, indexed and remembered.
//!
//! A chunk starts life as a [`ChunkDraft`] produced by the chunker. Attaching
//! an embedding turns it into an immutable [`Chunk`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique chunk identifier.
pub type ChunkId = String;

/// Chunks scoring at least this count as important in stats.
pub const IMPORTANT_THRESHOLD: f32 = 0.7;

const IMPORTANCE_CUES: [&str; 5] = ["important", "urgent", "critical", "remember", "forget"];

/// Half-open range `[start, end)` in segmentation units of the source text.
///
/// Units are characters in character mode, tokens in token mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    /// Number of units covered.
    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An unembedded chunk, as produced by the chunker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkDraft {
    /// Unique ID for this chunk
    pub id: ChunkId,

    /// The source document / message this chunk was cut from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,

    /// Exact slice of the source text covered by `span`
    pub text: String,

    /// Position within the source, in segmentation units
    pub span: Span,

    /// Position of this chunk in the source's chunk sequence
    pub index: usize,
}

impl ChunkDraft {
    /// Attach an embedding, producing an immutable chunk.
    pub fn embed(self, embedding: Vec<f32>) -> Chunk {
        let token_count = count_tokens(&self.text);
        let importance = importance_score(&self.text);
        Chunk {
            id: self.id,
            source_id: self.source_id,
            text: self.text,
            embedding,
            span: self.span,
            token_count,
            importance,
            created_at: Utc::now(),
        }
    }
}

/// An embedded chunk. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: ChunkId,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,

    pub text: String,

    pub embedding: Vec<f32>,

    pub span: Span,

    /// Approximate token count, used for tier budgets
    pub token_count: usize,

    /// Heuristic weight in `[0.5, 1.0]`. Reported in stats, not used for ranking.
    #[serde(default = "neutral_importance")]
    pub importance: f32,

    pub created_at: DateTime<Utc>,
}

impl Chunk {
    /// Build an embedded chunk directly from text (e.g. a consolidation summary).
    pub fn from_text(text: impl Into<String>, source_id: Option<String>, embedding: Vec<f32>) -> Self {
        let text = text.into();
        let units = text.chars().count();
        ChunkDraft {
            id: new_chunk_id(),
            source_id,
            text,
            span: Span::new(0, units),
            index: 0,
        }
        .embed(embedding)
    }

    /// Same chunk with a different embedding. Used when re-embedding for a rebuild.
    pub fn with_embedding(&self, embedding: Vec<f32>) -> Self {
        Self {
            embedding,
            ..self.clone()
        }
    }

    pub fn with_importance(self, importance: f32) -> Self {
        Self { importance, ..self }
    }

    /// Dimension of the attached embedding.
    pub fn dimension(&self) -> usize {
        self.embedding.len()
    }
}

/// Generate a fresh chunk id.
pub fn new_chunk_id() -> ChunkId {
    Uuid::new_v4().to_string()
}

/// Importance of text with no cues.
pub fn neutral_importance() -> f32 {
    0.5
}

/// Heuristic importance: long text, questions and cue words such as
/// "remember" or "urgent" each add a tenth, capped at 1.0.
pub fn importance_score(text: &str) -> f32 {
    let mut tenths = 5u32;
    if text.chars().count() > 100 {
        tenths += 1;
    }
    if text.contains('?') {
        tenths += 1;
    }
    let lower = text.to_lowercase();
    tenths += IMPORTANCE_CUES.iter().filter(|cue| lower.contains(*cue)).count() as u32;
    tenths.min(10) as f32 / 10.0
}

/// Rough token estimate: whitespace-separated words.
pub fn count_tokens(text: &str) -> usize {
    text.split_whitespace().count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn draft_embeds_into_chunk() {
        let draft = ChunkDraft {
            id: "c1".into(),
            source_id: Some("msg_1".into()),
            text: "the quick brown fox".into(),
            span: Span::new(0, 19),
            index: 0,
        };
        let chunk = draft.embed(vec![0.1, 0.2, 0.3]);
        assert_eq!(chunk.id, "c1");
        assert_eq!(chunk.token_count, 4);
        assert_eq!(chunk.dimension(), 3);
    }

    #[test]
    fn from_text_spans_whole_text() {
        let chunk = Chunk::from_text("héllo wörld", None, vec![1.0]);
        assert_eq!(chunk.span, Span::new(0, 11));
        assert!(!chunk.id.is_empty());
    }

    #[test]
    fn with_embedding_keeps_identity() {
        let chunk = Chunk::from_text("abc", None, vec![1.0, 0.0]);
        let again = chunk.with_embedding(vec![0.0, 1.0, 0.0]);
        assert_eq!(again.id, chunk.id);
        assert_eq!(again.created_at, chunk.created_at);
        assert_eq!(again.dimension(), 3);
    }

    #[test]
    fn importance_follows_cues() {
        assert_eq!(importance_score("ok"), 0.5);
        assert_eq!(importance_score("Can you remember my address?"), 0.7);
        assert!(importance_score("Can you remember my address?") >= IMPORTANT_THRESHOLD);
        let shouted = format!("{} important urgent critical remember forget?", "x".repeat(100));
        assert_eq!(importance_score(&shouted), 1.0);
        assert_eq!(Chunk::from_text("urgent", None, vec![]).importance, 0.6);
    }

    #[test]
    fn importance_defaults_when_missing() {
        let chunk = Chunk::from_text("abc", None, vec![1.0]);
        let mut value = serde_json::to_value(&chunk).unwrap();
        value.as_object_mut().unwrap().remove("importance");
        let back: Chunk = serde_json::from_value(value).unwrap();
        assert_eq!(back.importance, neutral_importance());
    }
}
