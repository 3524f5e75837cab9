//! Tool traits — local tools, tool server configuration and transports.
//!
//! A tool server is an independently operated process exposing callable
//! tools. Each configured server names a [`TransportDescriptor`]; the
//! transport registered for that descriptor kind knows how to open sessions.
//! New transports are added by implementing [`ToolTransport`], never by
//! branching on server type.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use crate::error::{RegistryError, TransportError};

/// Description of a callable tool, as advertised by a server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// JSON Schema describing the tool's parameters
    #[serde(default)]
    pub schema: serde_json::Value,
}

/// A tool implemented in this process.
///
/// Local tools can be served to the dispatcher through the in-process transport.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool within its server.
    fn name(&self) -> &str;

    /// A description of what this tool does.
    fn description(&self) -> &str;

    /// JSON Schema describing this tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Execute the tool with the given arguments.
    async fn execute(&self, arguments: serde_json::Value) -> std::result::Result<serde_json::Value, String>;

    fn to_descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: self.name().to_string(),
            description: self.description().to_string(),
            schema: self.parameters_schema(),
        }
    }
}

/// How to reach a tool server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportDescriptor {
    /// Spawn a child process and talk over stdin/stdout
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: BTreeMap<String, String>,
    },
    /// Remote server over HTTP
    Http {
        url: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
    /// Tools hosted inside this process
    InProcess,
}

impl TransportDescriptor {
    /// The transport kind used to select an implementation.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Stdio { .. } => "stdio",
            Self::Http { .. } => "http",
            Self::InProcess => "in_process",
        }
    }
}

/// Per-call retry policy: bounded attempts, exponential backoff with jitter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_base_backoff_ms() -> u64 {
    1_000
}
fn default_max_backoff_ms() -> u64 {
    30_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl RetryPolicy {
    /// Un-jittered backoff before retry number `retry` (0-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        capped_exponential(self.base_backoff_ms, self.max_backoff_ms, retry)
    }
}

/// Circuit breaker policy for a server connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitPolicy {
    /// Consecutive failures before the circuit opens
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_base_open_ms")]
    pub base_open_ms: u64,

    #[serde(default = "default_max_open_ms")]
    pub max_open_ms: u64,
}

fn default_failure_threshold() -> u32 {
    3
}
fn default_base_open_ms() -> u64 {
    5_000
}
fn default_max_open_ms() -> u64 {
    300_000
}

impl Default for CircuitPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            base_open_ms: default_base_open_ms(),
            max_open_ms: default_max_open_ms(),
        }
    }
}

impl CircuitPolicy {
    /// Open window after the circuit has tripped `trips` times in a row (1-based).
    pub fn open_window(&self, trips: u32) -> Duration {
        capped_exponential(self.base_open_ms, self.max_open_ms, trips.saturating_sub(1))
    }
}

fn capped_exponential(base_ms: u64, max_ms: u64, exponent: u32) -> Duration {
    let factor = 1u64.checked_shl(exponent.min(32)).unwrap_or(u64::MAX);
    Duration::from_millis(base_ms.saturating_mul(factor).min(max_ms))
}

/// Configuration for a single tool server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolServerConfig {
    /// Unique name (registry key)
    pub name: String,

    pub transport: TransportDescriptor,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub circuit: CircuitPolicy,

    /// Per-attempt timeout
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Maximum concurrent connections to this server
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

fn default_true() -> bool {
    true
}
fn default_timeout_ms() -> u64 {
    30_000
}
fn default_pool_size() -> usize {
    4
}

impl ToolServerConfig {
    /// A config with defaults for everything but name and transport.
    pub fn new(name: impl Into<String>, transport: TransportDescriptor) -> Self {
        Self {
            name: name.into(),
            transport,
            enabled: true,
            retry: RetryPolicy::default(),
            circuit: CircuitPolicy::default(),
            timeout_ms: default_timeout_ms(),
            pool_size: default_pool_size(),
            description: String::new(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Check the config for values the dispatcher cannot work with.
    pub fn validate(&self) -> std::result::Result<(), RegistryError> {
        let invalid = |reason: &str| RegistryError::InvalidServer {
            name: self.name.clone(),
            reason: reason.to_string(),
        };
        if self.name.trim().is_empty() {
            return Err(invalid("name must not be empty"));
        }
        if self.pool_size == 0 {
            return Err(invalid("pool_size must be > 0"));
        }
        if self.timeout_ms == 0 {
            return Err(invalid("timeout_ms must be > 0"));
        }
        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts must be >= 1"));
        }
        if self.retry.base_backoff_ms > self.retry.max_backoff_ms {
            return Err(invalid("retry.base_backoff_ms exceeds retry.max_backoff_ms"));
        }
        if self.circuit.failure_threshold == 0 {
            return Err(invalid("circuit.failure_threshold must be >= 1"));
        }
        if self.circuit.base_open_ms > self.circuit.max_open_ms {
            return Err(invalid("circuit.base_open_ms exceeds circuit.max_open_ms"));
        }
        Ok(())
    }
}

/// An open session with one tool server.
#[async_trait]
pub trait TransportSession: Send + Sync {
    /// Tools the server currently advertises.
    async fn list_tools(&mut self) -> std::result::Result<Vec<ToolDescriptor>, TransportError>;

    /// Invoke a tool. Implementations should give up after `timeout`.
    async fn invoke(
        &mut self,
        tool: &str,
        args: serde_json::Value,
        timeout: Duration,
    ) -> std::result::Result<serde_json::Value, TransportError>;

    /// Close the session. Errors while closing are swallowed.
    async fn close(&mut self);
}

/// Opens sessions for one transport kind.
#[async_trait]
pub trait ToolTransport: Send + Sync {
    /// The descriptor kind this transport handles ("stdio", "http", "in_process").
    fn kind(&self) -> &str;

    async fn connect(
        &self,
        config: &ToolServerConfig,
    ) -> std::result::Result<Box<dyn TransportSession>, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_config_parses_with_defaults() {
        let toml_str = r#"
name = "filesystem"
[transport]
type = "stdio"
command = "uvx"
args = ["mcp-server-filesystem", "/tmp"]
"#;
        let config: ToolServerConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.name, "filesystem");
        assert!(config.enabled);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.pool_size, 4);
        assert_eq!(config.transport.kind(), "stdio");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn invalid_pool_size_rejected() {
        let mut config = ToolServerConfig::new("x", TransportDescriptor::InProcess);
        config.pool_size = 0;
        assert!(matches!(
            config.validate(),
            Err(RegistryError::InvalidServer { .. })
        ));
    }

    #[test]
    fn retry_backoff_is_capped_exponential() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_backoff_ms: 100,
            max_backoff_ms: 500,
        };
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(2), Duration::from_millis(400));
        assert_eq!(policy.backoff(3), Duration::from_millis(500));
        assert_eq!(policy.backoff(60), Duration::from_millis(500));
    }

    #[test]
    fn circuit_window_grows_per_trip() {
        let policy = CircuitPolicy {
            failure_threshold: 3,
            base_open_ms: 1_000,
            max_open_ms: 3_000,
        };
        assert_eq!(policy.open_window(1), Duration::from_secs(1));
        assert_eq!(policy.open_window(2), Duration::from_secs(2));
        assert_eq!(policy.open_window(3), Duration::from_secs(3));
        assert_eq!(policy.open_window(9), Duration::from_secs(3));
    }

    #[test]
    fn http_descriptor_roundtrip() {
        let desc = TransportDescriptor::Http {
            url: "http://localhost:9000/mcp".into(),
            headers: BTreeMap::new(),
        };
        let json = serde_json::to_string(&desc).unwrap();
        assert!(json.contains(r#""type":"http""#));
        let back: TransportDescriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(back, desc);
    }
}
