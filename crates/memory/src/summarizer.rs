use async_trait::async_trait;
use tierwise_core::memory::Summarizer;

/// Joins the merged texts, oldest first, one per line.
///
/// The store bounds the result to `summary_max_chars` before embedding it.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConcatSummarizer;

#[async_trait]
impl Summarizer for ConcatSummarizer {
    fn name(&self) -> &str {
        "concat"
    }

    async fn summarize(&self, texts: &[&str]) -> Result<String, String> {
        Ok(texts
            .iter()
            .map(|t| t.trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn joins_non_empty_texts_in_order() {
        let summary = ConcatSummarizer
            .summarize(&["first ", "", "  second"])
            .await
            .unwrap();
        assert_eq!(summary, "first\nsecond");
    }
}
