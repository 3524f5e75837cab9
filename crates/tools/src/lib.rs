//! Multi-server tool dispatch for Tierwise.
//!
//! Tool servers are configured in a [`ToolRegistry`] (optionally kept in
//! sync with a servers file by a [`RegistryWatcher`]). The
//! [`ToolDispatcher`] routes calls to them through per-server connection
//! pools, retrying transport failures and breaking the circuit of servers
//! that keep failing.

pub mod dispatcher;
pub mod health;
pub mod pool;
pub mod registry;
pub mod transport;
pub mod watcher;

pub use dispatcher::{ServerStatus, ToolDispatcher};
pub use health::{ConnectionState, HealthSnapshot, ServerHealth};
pub use pool::{PoolStatus, PooledConnection, ServerLink};
pub use registry::{RegistrySnapshot, ToolRegistry};
pub use transport::{InProcessTransport, TransportSet};
pub use watcher::RegistryWatcher;
