//! Reference turn orchestrator for Tierwise.
//!
//! A turn follows **recall → plan → act → answer → store**:
//!
//! 1. **Recall** the user's most relevant memories
//! 2. **Plan** tool calls with the configured [`ResponseGenerator`]
//! 3. **Act** through the [`ToolDispatcher`](tierwise_tools::ToolDispatcher);
//!    failed calls become degraded `tool_result` events
//! 4. **Answer**, streamed as `token` events, then `done`
//! 5. **Store** both sides of the exchange in memory

pub mod generator;
pub mod memory_tool;
pub mod orchestrator;
pub mod stream_event;

pub use generator::{PlannedCall, RecallGenerator, ResponseGenerator, ToolOutcome, TurnContext};
pub use memory_tool::{MEMORY_SERVER, MemorySearchTool};
pub use orchestrator::{Orchestrator, TurnRequest, TurnStream};
pub use stream_event::AgentEvent;
