//! Text chunker: splits text into overlapping, bounded-size drafts.
//!
//! Text is first cut into segmentation units (characters, or tokenizer tokens
//! with the `hf-tokenizer` feature). A chunk covers at most `chunk_size` units;
//! consecutive chunks share exactly `overlap` units. Before falling back to a
//! hard cut, the chunker looks back up to `boundary_window` units for a
//! paragraph break, then for a sentence break.
//!
//! Chunk text is the exact slice of the source covered by its span, so the
//! source can be reassembled by dropping the first `overlap` units of every
//! chunk after the first.

#[cfg(feature = "hf-tokenizer")]
use std::sync::Arc;
use tierwise_config::{ChunkingConfig, SegmentationMode};
use tierwise_core::chunk::{ChunkDraft, Span, new_chunk_id};
use tierwise_core::error::ChunkingError;

/// How text is cut into units.
#[derive(Clone, Default)]
pub enum Segmentation {
    #[default]
    Characters,
    #[cfg(feature = "hf-tokenizer")]
    Tokens(Arc<tokenizers::Tokenizer>),
}

impl std::fmt::Debug for Segmentation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Characters => f.write_str("Characters"),
            #[cfg(feature = "hf-tokenizer")]
            Self::Tokens(_) => f.write_str("Tokens"),
        }
    }
}

impl Segmentation {
    /// Byte offsets where each unit starts, followed by `text.len()`.
    fn unit_bounds(&self, text: &str) -> Result<Vec<usize>, ChunkingError> {
        let mut bounds: Vec<usize> = match self {
            Self::Characters => text.char_indices().map(|(i, _)| i).collect(),
            #[cfg(feature = "hf-tokenizer")]
            Self::Tokens(tokenizer) => {
                let encoding = tokenizer
                    .encode(text, false)
                    .map_err(|e| ChunkingError::Tokenizer(e.to_string()))?;
                let mut starts: Vec<usize> = encoding
                    .get_offsets()
                    .iter()
                    .map(|(start, _)| *start)
                    .filter(|s| *s < text.len() && text.is_char_boundary(*s))
                    .collect();
                // Leading whitespace the tokenizer skipped belongs to the first unit.
                if !text.is_empty() {
                    starts.push(0);
                }
                starts.sort_unstable();
                starts.dedup();
                starts
            }
        };
        bounds.push(text.len());
        Ok(bounds)
    }
}

/// Splits text into [`ChunkDraft`]s.
#[derive(Debug, Clone)]
pub struct Chunker {
    chunk_size: usize,
    overlap: usize,
    boundary_window: usize,
    segmentation: Segmentation,
}

impl Chunker {
    /// Character-mode chunker with a boundary window of a tenth of the chunk size.
    pub fn new(chunk_size: usize, overlap: usize) -> Result<Self, ChunkingError> {
        Self::with_window(chunk_size, overlap, chunk_size / 10)
    }

    pub fn with_window(
        chunk_size: usize,
        overlap: usize,
        boundary_window: usize,
    ) -> Result<Self, ChunkingError> {
        if chunk_size == 0 {
            return Err(ChunkingError::InvalidParameters(
                "chunk_size must be > 0".into(),
            ));
        }
        if overlap >= chunk_size {
            return Err(ChunkingError::InvalidParameters(format!(
                "overlap ({overlap}) must be smaller than chunk_size ({chunk_size})"
            )));
        }
        Ok(Self {
            chunk_size,
            overlap,
            boundary_window,
            segmentation: Segmentation::Characters,
        })
    }

    pub fn with_segmentation(mut self, segmentation: Segmentation) -> Self {
        self.segmentation = segmentation;
        self
    }

    /// Build from configuration, loading the tokenizer file in token mode.
    pub fn from_config(config: &ChunkingConfig) -> Result<Self, ChunkingError> {
        let chunker = Self::with_window(config.chunk_size, config.overlap, config.boundary_window)?;
        match config.segmentation {
            SegmentationMode::Characters => Ok(chunker),
            SegmentationMode::Tokens => {
                let path = config.tokenizer_path.as_ref().ok_or_else(|| {
                    ChunkingError::InvalidParameters(
                        "token segmentation requires tokenizer_path".into(),
                    )
                })?;
                Ok(chunker.with_segmentation(load_tokenizer(path)?))
            }
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn overlap(&self) -> usize {
        self.overlap
    }

    /// Lazily produce chunks. Calling again on the same text yields the same spans.
    pub fn chunks<'a>(
        &'a self,
        text: &'a str,
        source_id: Option<&str>,
    ) -> Result<Chunks<'a>, ChunkingError> {
        let bounds = self.segmentation.unit_bounds(text)?;
        let next_start = if bounds.len() > 1 { Some(0) } else { None };
        Ok(Chunks {
            chunker: self,
            text,
            source_id: source_id.map(str::to_string),
            bounds,
            next_start,
            index: 0,
        })
    }

    /// Split text into an ordered sequence of drafts.
    pub fn split(&self, text: &str, source_id: Option<&str>) -> Result<Vec<ChunkDraft>, ChunkingError> {
        Ok(self.chunks(text, source_id)?.collect())
    }

    /// Number of units in `text` under this chunker's segmentation.
    pub fn unit_count(&self, text: &str) -> Result<usize, ChunkingError> {
        Ok(self.segmentation.unit_bounds(text)?.len() - 1)
    }

    /// The longest prefix of `text` that fits in one chunk, cut at the best boundary.
    pub fn first_chunk(&self, text: &str) -> Result<String, ChunkingError> {
        Ok(self
            .chunks(text, None)?
            .next()
            .map(|draft| draft.text)
            .unwrap_or_default())
    }
}

impl Default for Chunker {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            overlap: 100,
            boundary_window: 100,
            segmentation: Segmentation::Characters,
        }
    }
}

#[cfg(feature = "hf-tokenizer")]
fn load_tokenizer(path: &std::path::Path) -> Result<Segmentation, ChunkingError> {
    let tokenizer = tokenizers::Tokenizer::from_file(path)
        .map_err(|e| ChunkingError::Tokenizer(format!("{}: {e}", path.display())))?;
    Ok(Segmentation::Tokens(Arc::new(tokenizer)))
}

#[cfg(not(feature = "hf-tokenizer"))]
fn load_tokenizer(path: &std::path::Path) -> Result<Segmentation, ChunkingError> {
    Err(ChunkingError::Tokenizer(format!(
        "{}: built without the hf-tokenizer feature",
        path.display()
    )))
}

/// Iterator over the chunks of one text.
pub struct Chunks<'a> {
    chunker: &'a Chunker,
    text: &'a str,
    source_id: Option<String>,
    bounds: Vec<usize>,
    next_start: Option<usize>,
    index: usize,
}

impl Chunks<'_> {
    fn units(&self) -> usize {
        self.bounds.len() - 1
    }

    /// Slice between two unit positions.
    fn slice(&self, start: usize, end: usize) -> &str {
        &self.text[self.bounds[start]..self.bounds[end]]
    }

    /// Pick the end of a chunk starting at `start` whose hard limit is `hard_end`.
    ///
    /// Candidates lie in `(start + overlap, hard_end]` so every chunk advances.
    fn choose_end(&self, start: usize, hard_end: usize) -> usize {
        let chunker = self.chunker;
        let lowest = (start + chunker.overlap + 1).max(hard_end.saturating_sub(chunker.boundary_window));
        if lowest > hard_end {
            return hard_end;
        }

        let candidates = || (lowest..=hard_end).rev();
        if let Some(end) = candidates().find(|&e| is_paragraph_break(self.slice(start, e))) {
            return end;
        }
        if let Some(end) = candidates().find(|&e| is_sentence_break(self.slice(start, e))) {
            return end;
        }
        hard_end
    }
}

impl Iterator for Chunks<'_> {
    type Item = ChunkDraft;

    fn next(&mut self) -> Option<ChunkDraft> {
        let start = self.next_start?;
        let units = self.units();
        let hard_end = (start + self.chunker.chunk_size).min(units);
        let end = if hard_end < units {
            self.choose_end(start, hard_end)
        } else {
            units
        };

        self.next_start = if end >= units {
            None
        } else {
            Some(end - self.chunker.overlap)
        };

        let draft = ChunkDraft {
            id: new_chunk_id(),
            source_id: self.source_id.clone(),
            text: self.slice(start, end).to_string(),
            span: Span::new(start, end),
            index: self.index,
        };
        self.index += 1;
        Some(draft)
    }
}

fn is_paragraph_break(prefix: &str) -> bool {
    prefix.ends_with("\n\n")
}

/// A sentence ends at a newline, or at `.`, `!` or `?` followed by spaces.
/// A `.` right after an uppercase letter ("U.S. ") is treated as an abbreviation.
fn is_sentence_break(prefix: &str) -> bool {
    if prefix.ends_with('\n') {
        return true;
    }
    let trimmed = prefix.trim_end_matches([' ', '\t']);
    if trimmed.len() == prefix.len() {
        return false;
    }
    let mut rev = trimmed.chars().rev();
    match rev.next() {
        Some('!') | Some('?') => true,
        Some('.') => !matches!(rev.next(), Some(c) if c.is_uppercase()),
        _ => false,
    }
}
