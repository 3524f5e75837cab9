//! Pluggable response generation.
//!
//! The orchestrator owns memory and tool plumbing; a [`ResponseGenerator`]
//! decides which tools to call and writes the answer. Model-backed
//! generators live outside this crate.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tierwise_core::chunk::Chunk;
use tierwise_core::memory::{ConversationKey, ScoredChunk};

/// What a generator sees when planning and answering.
#[derive(Debug, Clone)]
pub struct TurnContext {
    pub key: ConversationKey,
    pub message: String,
    /// Retrieved memory, best match first
    pub recalled: Vec<ScoredChunk>,
    /// Most recent short-term chunks, oldest first
    pub history: Vec<Arc<Chunk>>,
}

/// A tool call the generator wants made.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedCall {
    pub server: String,
    pub tool: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

impl PlannedCall {
    pub fn new(server: impl Into<String>, tool: impl Into<String>, args: serde_json::Value) -> Self {
        Self {
            server: server.into(),
            tool: tool.into(),
            args,
        }
    }
}

/// The outcome of a planned call. Failures are data, not errors.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub call: PlannedCall,
    pub result: Result<serde_json::Value, String>,
}

#[async_trait]
pub trait ResponseGenerator: Send + Sync {
    fn name(&self) -> &str;

    /// Tool calls to make before answering. Empty means answer directly.
    async fn plan(&self, context: &TurnContext) -> Result<Vec<PlannedCall>, String>;

    /// Write the answer from the context and the tool outcomes.
    async fn respond(&self, context: &TurnContext, outcomes: &[ToolOutcome]) -> Result<String, String>;
}

/// Answers from memory alone: restates the best recalled snippets and
/// reports tool outcomes. Plans no calls unless configured with a fixed plan.
#[derive(Debug, Clone)]
pub struct RecallGenerator {
    plan: Vec<PlannedCall>,
    max_snippets: usize,
}

impl RecallGenerator {
    pub fn new() -> Self {
        Self {
            plan: Vec::new(),
            max_snippets: 3,
        }
    }

    /// Always make these calls before answering.
    pub fn with_plan(mut self, plan: Vec<PlannedCall>) -> Self {
        self.plan = plan;
        self
    }
}

impl Default for RecallGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResponseGenerator for RecallGenerator {
    fn name(&self) -> &str {
        "recall"
    }

    async fn plan(&self, _context: &TurnContext) -> Result<Vec<PlannedCall>, String> {
        Ok(self.plan.clone())
    }

    async fn respond(&self, context: &TurnContext, outcomes: &[ToolOutcome]) -> Result<String, String> {
        let mut answer = String::new();
        if context.recalled.is_empty() {
            answer.push_str("Nothing relevant in memory.");
        } else {
            answer.push_str("From memory:");
            for hit in context.recalled.iter().take(self.max_snippets) {
                answer.push_str(&format!("\n- [{:.2}] {}", hit.score, hit.chunk.text.trim()));
            }
        }
        for outcome in outcomes {
            let line = match &outcome.result {
                Ok(value) => format!("\n{}/{}: {value}", outcome.call.server, outcome.call.tool),
                Err(e) => format!("\n{}/{} unavailable: {e}", outcome.call.server, outcome.call.tool),
            };
            answer.push_str(&line);
        }
        Ok(answer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tierwise_core::memory::Tier;

    fn context(recalled: &[&str]) -> TurnContext {
        let key = ConversationKey::new("u", "c");
        TurnContext {
            key: key.clone(),
            message: "question".into(),
            recalled: recalled
                .iter()
                .map(|t| ScoredChunk {
                    chunk: Arc::new(Chunk::from_text(*t, None, vec![1.0])),
                    score: 0.9,
                    tier: Tier::Short,
                    conversation: key.clone(),
                })
                .collect(),
            history: vec![],
        }
    }

    #[tokio::test]
    async fn answers_from_recalled_snippets() {
        let answer = RecallGenerator::new()
            .respond(&context(&["one", "two", "three", "four"]), &[])
            .await
            .unwrap();
        assert!(answer.starts_with("From memory:"));
        assert!(answer.contains("three"));
        assert!(!answer.contains("four"));
    }

    #[tokio::test]
    async fn reports_degraded_tools() {
        let outcome = ToolOutcome {
            call: PlannedCall::new("git", "log", serde_json::json!({})),
            result: Err("circuit open".into()),
        };
        let answer = RecallGenerator::new()
            .respond(&context(&[]), &[outcome])
            .await
            .unwrap();
        assert!(answer.contains("Nothing relevant"));
        assert!(answer.contains("git/log unavailable: circuit open"));
    }
}
