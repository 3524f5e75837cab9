//! Turn orchestration: recall → plan → tools → answer → store.
//!
//! Each turn runs on its own task and reports through a bounded channel of
//! [`AgentEvent`]s. The producer waits when the consumer falls behind, and
//! dropping the [`TurnStream`] aborts the task, including any tool call in
//! flight.

use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tierwise_core::memory::{ConversationKey, SearchScope};
use tierwise_memory::MemoryStore;
use tierwise_tools::ToolDispatcher;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::generator::{ResponseGenerator, ToolOutcome, TurnContext};
use crate::stream_event::AgentEvent;

/// One user message to answer.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub key: ConversationKey,
    pub message: String,
    /// Overrides the orchestrator's turn timeout
    pub deadline: Option<Duration>,
}

impl TurnRequest {
    pub fn new(key: ConversationKey, message: impl Into<String>) -> Self {
        Self {
            key,
            message: message.into(),
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Ordered events of one turn. Dropping it cancels the turn.
pub struct TurnStream {
    rx: mpsc::Receiver<AgentEvent>,
    task: JoinHandle<()>,
}

impl TurnStream {
    /// The next event, or `None` once the turn has ended.
    pub async fn next_event(&mut self) -> Option<AgentEvent> {
        self.rx.recv().await
    }

    /// Drain the turn to completion.
    pub async fn collect_all(mut self) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.rx.recv().await {
            events.push(event);
        }
        events
    }
}

impl Stream for TurnStream {
    type Item = AgentEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

impl Drop for TurnStream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

enum Abort {
    /// The consumer went away
    Cancelled,
    Failed(String),
}

pub struct Orchestrator {
    memory: Arc<MemoryStore>,
    generator: Arc<dyn ResponseGenerator>,
    dispatcher: Option<Arc<ToolDispatcher>>,
    recall_limit: usize,
    history_tokens: usize,
    channel_capacity: usize,
    turn_timeout: Duration,
}

impl Orchestrator {
    pub fn new(memory: Arc<MemoryStore>, generator: Arc<dyn ResponseGenerator>) -> Self {
        Self {
            memory,
            generator,
            dispatcher: None,
            recall_limit: 5,
            history_tokens: 1_000,
            channel_capacity: 32,
            turn_timeout: Duration::from_secs(30),
        }
    }

    /// Route planned tool calls through this dispatcher.
    pub fn with_dispatcher(mut self, dispatcher: Arc<ToolDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn with_recall_limit(mut self, limit: usize) -> Self {
        self.recall_limit = limit;
        self
    }

    /// Token budget for recent history handed to the generator.
    pub fn with_history_tokens(mut self, tokens: usize) -> Self {
        self.history_tokens = tokens;
        self
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    pub fn with_turn_timeout(mut self, timeout: Duration) -> Self {
        self.turn_timeout = timeout;
        self
    }

    /// Start a turn. Must be called inside a tokio runtime.
    pub fn run_turn(self: &Arc<Self>, request: TurnRequest) -> TurnStream {
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let this = Arc::clone(self);
        let task = tokio::spawn(async move {
            let key = request.key.clone();
            match this.drive(request, &tx).await {
                Ok(()) => {}
                Err(Abort::Cancelled) => debug!(conversation = %key, "Turn cancelled by consumer"),
                Err(Abort::Failed(message)) => {
                    warn!(conversation = %key, error = %message, "Turn failed");
                    let _ = tx.send(AgentEvent::Error { message }).await;
                }
            }
        });
        TurnStream { rx, task }
    }

    async fn drive(&self, request: TurnRequest, tx: &mpsc::Sender<AgentEvent>) -> Result<(), Abort> {
        let TurnRequest { key, message, deadline } = request;
        let deadline = Instant::now() + deadline.unwrap_or(self.turn_timeout);
        info!(conversation = %key, generator = self.generator.name(), "Turn started");

        let recalled = match self
            .memory
            .search_text(SearchScope::User(key.user_id.clone()), &message, self.recall_limit)
            .await
        {
            Ok(hits) => hits,
            Err(e) => {
                warn!(conversation = %key, error = %e, "Memory recall failed; answering without it");
                Vec::new()
            }
        };
        let history = self.memory.context_window(&key, self.history_tokens);

        self.memory
            .ingest(&key, Some("user"), &message)
            .await
            .map_err(|e| Abort::Failed(format!("Failed to store message: {e}")))?;

        let context = TurnContext {
            key: key.clone(),
            message,
            recalled,
            history,
        };

        let plan = self.generator.plan(&context).await.map_err(Abort::Failed)?;
        let mut outcomes = Vec::with_capacity(plan.len());
        for (i, call) in plan.into_iter().enumerate() {
            let id = format!("call_{}", i + 1);
            emit(
                tx,
                AgentEvent::ToolCall {
                    id: id.clone(),
                    server: call.server.clone(),
                    tool: call.tool.clone(),
                    input: call.args.clone(),
                },
            )
            .await?;

            let result = match &self.dispatcher {
                Some(dispatcher) => dispatcher
                    .invoke(&call.server, &call.tool, call.args.clone(), deadline)
                    .await
                    .map_err(|e| e.to_string()),
                None => Err("no tool dispatcher configured".to_string()),
            };
            emit(
                tx,
                AgentEvent::ToolResult {
                    id,
                    server: call.server.clone(),
                    tool: call.tool.clone(),
                    success: result.is_ok(),
                    output: result.as_ref().cloned().unwrap_or(serde_json::Value::Null),
                    error: result.as_ref().err().cloned(),
                },
            )
            .await?;
            outcomes.push(ToolOutcome { call, result });
        }

        let answer = self
            .generator
            .respond(&context, &outcomes)
            .await
            .map_err(Abort::Failed)?;
        for token in answer.split_inclusive(char::is_whitespace) {
            emit(
                tx,
                AgentEvent::Token {
                    content: token.to_string(),
                },
            )
            .await?;
        }

        if let Err(e) = self.memory.ingest(&key, Some("assistant"), &answer).await {
            warn!(conversation = %key, error = %e, "Failed to store answer");
        }

        emit(
            tx,
            AgentEvent::Done {
                conversation_id: key.conversation_id.clone(),
                recalled: context.recalled.len(),
                tool_calls_made: outcomes.len(),
            },
        )
        .await?;
        info!(conversation = %key, tool_calls = outcomes.len(), "Turn finished");
        Ok(())
    }
}

async fn emit(tx: &mpsc::Sender<AgentEvent>, event: AgentEvent) -> Result<(), Abort> {
    tx.send(event).await.map_err(|_| Abort::Cancelled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::{PlannedCall, RecallGenerator};
    use crate::memory_tool::{MEMORY_SERVER, MemorySearchTool};
    use async_trait::async_trait;
    use futures::StreamExt;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tierwise_config::MemoryConfig;
    use tierwise_core::memory::Tier;
    use tierwise_core::tool::{Tool, ToolServerConfig, TransportDescriptor};
    use tierwise_providers::HashingEmbedder;
    use tierwise_tools::{InProcessTransport, ToolRegistry, TransportSet};

    fn memory() -> Arc<MemoryStore> {
        Arc::new(MemoryStore::new(
            MemoryConfig::default(),
            Arc::new(HashingEmbedder::new(64)),
        ))
    }

    struct FailingGenerator;

    #[async_trait]
    impl ResponseGenerator for FailingGenerator {
        fn name(&self) -> &str {
            "failing"
        }
        async fn plan(&self, _context: &TurnContext) -> Result<Vec<PlannedCall>, String> {
            Ok(vec![])
        }
        async fn respond(&self, _context: &TurnContext, _outcomes: &[ToolOutcome]) -> Result<String, String> {
            Err("model unavailable".into())
        }
    }

    /// Never answers; records when its call is dropped.
    struct HangingTool {
        dropped: Arc<AtomicBool>,
    }

    struct SetOnDrop(Arc<AtomicBool>);

    impl Drop for SetOnDrop {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Tool for HangingTool {
        fn name(&self) -> &str {
            "hang"
        }
        fn description(&self) -> &str {
            "Never returns"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }
        async fn execute(&self, _arguments: serde_json::Value) -> Result<serde_json::Value, String> {
            let _guard = SetOnDrop(Arc::clone(&self.dropped));
            std::future::pending::<()>().await;
            Ok(serde_json::Value::Null)
        }
    }

    #[tokio::test]
    async fn turn_streams_tokens_then_done_and_stores_both_sides() {
        let memory = memory();
        let key = ConversationKey::new("alice", "c1");
        memory
            .ingest(&key, None, "The deploy window is Thursday at noon.")
            .await
            .unwrap();

        let orchestrator = Arc::new(Orchestrator::new(Arc::clone(&memory), Arc::new(RecallGenerator::new())));
        let events = orchestrator
            .run_turn(TurnRequest::new(key.clone(), "When is the deploy window?"))
            .collect_all()
            .await;

        let last = events.last().unwrap();
        assert!(matches!(last, AgentEvent::Done { recalled: 1, tool_calls_made: 0, .. }));
        let text: String = events
            .iter()
            .filter_map(|e| match e {
                AgentEvent::Token { content } => Some(content.as_str()),
                _ => None,
            })
            .collect();
        assert!(text.contains("Thursday at noon"));

        // Seed, question and answer
        assert_eq!(memory.record(&key, Tier::Short).unwrap().len(), 3);
    }

    #[tokio::test]
    async fn planned_tools_run_through_dispatcher() {
        let memory = memory();
        let key = ConversationKey::new("alice", "c1");
        memory.ingest(&key, None, "Invoices are due monthly.").await.unwrap();

        let host = Arc::new(InProcessTransport::new());
        host.register(
            MEMORY_SERVER,
            vec![Arc::new(MemorySearchTool::new(Arc::clone(&memory))) as Arc<dyn Tool>],
        );
        let registry = Arc::new(
            ToolRegistry::from_configs(vec![ToolServerConfig::new(MEMORY_SERVER, TransportDescriptor::InProcess)])
                .unwrap(),
        );
        let dispatcher = Arc::new(ToolDispatcher::new(registry, TransportSet::new().register(host)));

        let generator = RecallGenerator::new().with_plan(vec![
            PlannedCall::new(
                MEMORY_SERVER,
                "memory_search",
                serde_json::json!({"query": "invoices", "user_id": "alice"}),
            ),
            PlannedCall::new("offline", "anything", serde_json::json!({})),
        ]);
        let orchestrator = Arc::new(
            Orchestrator::new(Arc::clone(&memory), Arc::new(generator)).with_dispatcher(dispatcher),
        );

        let events: Vec<AgentEvent> = orchestrator
            .run_turn(TurnRequest::new(key, "What about invoices?"))
            .collect()
            .await;
        let kinds: Vec<&str> = events.iter().map(|e| e.event_type()).take(4).collect();
        assert_eq!(kinds, vec!["tool_call", "tool_result", "tool_call", "tool_result"]);

        match &events[1] {
            AgentEvent::ToolResult { success, output, .. } => {
                assert!(success);
                // The seeded note and the question itself
                assert_eq!(output["count"], 2);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        match &events[3] {
            AgentEvent::ToolResult { success, error, .. } => {
                assert!(!success);
                assert!(error.as_deref().unwrap().contains("offline"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(matches!(events.last(), Some(AgentEvent::Done { tool_calls_made: 2, .. })));
    }

    #[tokio::test]
    async fn generator_failure_ends_with_error() {
        let orchestrator = Arc::new(Orchestrator::new(memory(), Arc::new(FailingGenerator)));
        let events = orchestrator
            .run_turn(TurnRequest::new(ConversationKey::new("u", "c"), "hello"))
            .collect_all()
            .await;
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0],
            AgentEvent::Error {
                message: "model unavailable".into()
            }
        );
    }

    #[tokio::test]
    async fn no_dispatcher_degrades_tool_results() {
        let generator = RecallGenerator::new().with_plan(vec![PlannedCall::new("git", "log", serde_json::json!({}))]);
        let orchestrator = Arc::new(Orchestrator::new(memory(), Arc::new(generator)));
        let events = orchestrator
            .run_turn(TurnRequest::new(ConversationKey::new("u", "c"), "hello"))
            .collect_all()
            .await;
        assert!(matches!(&events[1], AgentEvent::ToolResult { success: false, .. }));
        assert!(events.last().unwrap().is_terminal());
    }

    #[tokio::test]
    async fn dropping_stream_cancels_in_flight_tool() {
        let dropped = Arc::new(AtomicBool::new(false));
        let host = Arc::new(InProcessTransport::new());
        host.register(
            "slow",
            vec![Arc::new(HangingTool {
                dropped: Arc::clone(&dropped),
            }) as Arc<dyn Tool>],
        );
        let registry = Arc::new(
            ToolRegistry::from_configs(vec![ToolServerConfig::new("slow", TransportDescriptor::InProcess)]).unwrap(),
        );
        let dispatcher = Arc::new(ToolDispatcher::new(registry, TransportSet::new().register(host)));
        let generator = RecallGenerator::new().with_plan(vec![PlannedCall::new("slow", "hang", serde_json::json!({}))]);
        let orchestrator = Arc::new(
            Orchestrator::new(memory(), Arc::new(generator)).with_dispatcher(Arc::clone(&dispatcher)),
        );

        let mut stream = orchestrator.run_turn(TurnRequest::new(ConversationKey::new("u", "c"), "go"));
        assert!(matches!(stream.next_event().await, Some(AgentEvent::ToolCall { .. })));
        // Let the call reach the tool
        for _ in 0..50 {
            if dispatcher.status()[0].pool.in_use == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        drop(stream);

        for _ in 0..50 {
            if dropped.load(Ordering::SeqCst) {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(dropped.load(Ordering::SeqCst));
        assert_eq!(dispatcher.status()[0].pool.in_use, 0);
    }
}
