//! Memory search exposed as a tool.
//!
//! Hosted on an in-process tool server so that planned tool calls can
//! search memory through the dispatcher like any other tool.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tierwise_core::memory::{ConversationKey, SearchScope, Tier};
use tierwise_core::tool::Tool;
use tierwise_memory::MemoryStore;

/// Name of the in-process server the memory tools are registered under.
pub const MEMORY_SERVER: &str = "memory";

const DEFAULT_LIMIT: u64 = 5;
const MAX_LIMIT: u64 = 50;

pub struct MemorySearchTool {
    store: Arc<MemoryStore>,
}

impl MemorySearchTool {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self { store }
    }
}

#[derive(Debug, Serialize)]
struct MemoryHit {
    id: String,
    content: String,
    score: f32,
    tier: Tier,
    user_id: String,
    conversation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    source: Option<String>,
    created_at: String,
}

#[async_trait]
impl Tool for MemorySearchTool {
    fn name(&self) -> &str {
        "memory_search"
    }

    fn description(&self) -> &str {
        "Search stored conversation memory. Scope the search to a user, or to one \
         of their conversations, by passing user_id and conversation_id."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Text to search for"
                },
                "user_id": {
                    "type": "string",
                    "description": "Restrict to this user's conversations"
                },
                "conversation_id": {
                    "type": "string",
                    "description": "Restrict to one conversation (requires user_id)"
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of results (default 5)",
                    "default": DEFAULT_LIMIT
                },
                "min_score": {
                    "type": "number",
                    "description": "Drop results scoring below this"
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<serde_json::Value, String> {
        let query = arguments["query"]
            .as_str()
            .filter(|q| !q.trim().is_empty())
            .ok_or("Missing 'query' argument")?;
        let limit = arguments["limit"].as_u64().unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT) as usize;
        let min_score = arguments["min_score"].as_f64().unwrap_or(f64::MIN) as f32;

        let scope = match (arguments["user_id"].as_str(), arguments["conversation_id"].as_str()) {
            (Some(user), Some(conversation)) => SearchScope::Conversation(ConversationKey::new(user, conversation)),
            (Some(user), None) => SearchScope::User(user.to_string()),
            (None, Some(_)) => return Err("'conversation_id' requires 'user_id'".into()),
            (None, None) => SearchScope::Global,
        };

        let results = self
            .store
            .search_text(scope, query, limit)
            .await
            .map_err(|e| format!("Memory search failed: {e}"))?;

        let hits: Vec<MemoryHit> = results
            .into_iter()
            .filter(|r| r.score >= min_score)
            .map(|r| MemoryHit {
                id: r.chunk.id.clone(),
                content: r.chunk.text.clone(),
                score: r.score,
                tier: r.tier,
                user_id: r.conversation.user_id,
                conversation_id: r.conversation.conversation_id,
                source: r.chunk.source_id.clone(),
                created_at: r.chunk.created_at.to_rfc3339(),
            })
            .collect();

        Ok(serde_json::json!({
            "count": hits.len(),
            "results": hits,
        }))
    }
}
