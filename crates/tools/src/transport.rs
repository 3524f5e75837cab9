//! Transport selection and the in-process transport.
//!
//! A [`TransportSet`] maps descriptor kinds to [`ToolTransport`]s. Stdio and
//! HTTP wire encodings come from transport crates registered into the set;
//! a server whose kind has no registered transport fails to connect with
//! [`TransportError::Unsupported`].

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tierwise_core::error::TransportError;
use tierwise_core::tool::{Tool, ToolDescriptor, ToolServerConfig, ToolTransport, TransportSession};

/// Transports keyed by descriptor kind.
#[derive(Default, Clone)]
pub struct TransportSet {
    transports: HashMap<String, Arc<dyn ToolTransport>>,
}

impl TransportSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transport under its own `kind()`, replacing any previous one.
    pub fn register(mut self, transport: Arc<dyn ToolTransport>) -> Self {
        self.transports.insert(transport.kind().to_string(), transport);
        self
    }

    pub fn get(&self, kind: &str) -> Option<&Arc<dyn ToolTransport>> {
        self.transports.get(kind)
    }

    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.transports.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    /// Open a session with the transport the server's descriptor names.
    pub async fn connect(
        &self,
        config: &ToolServerConfig,
    ) -> Result<Box<dyn TransportSession>, TransportError> {
        let kind = config.transport.kind();
        match self.transports.get(kind) {
            Some(transport) => transport.connect(config).await,
            None => Err(TransportError::Unsupported(kind.to_string())),
        }
    }
}

impl std::fmt::Debug for TransportSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportSet")
            .field("kinds", &self.kinds())
            .finish()
    }
}

type ToolMap = HashMap<String, Arc<dyn Tool>>;

/// Serves [`Tool`] implementations living in this process as tool servers.
///
/// Tools are registered per server name; a server config with the
/// `in_process` descriptor connects to the tools registered under its name.
#[derive(Default)]
pub struct InProcessTransport {
    servers: RwLock<HashMap<String, Arc<ToolMap>>>,
}

impl InProcessTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Host `tools` under `server`, replacing what was there.
    pub fn register(&self, server: impl Into<String>, tools: Vec<Arc<dyn Tool>>) {
        let map: ToolMap = tools
            .into_iter()
            .map(|tool| (tool.name().to_string(), tool))
            .collect();
        self.servers.write().insert(server.into(), Arc::new(map));
    }

    pub fn unregister(&self, server: &str) -> bool {
        self.servers.write().remove(server).is_some()
    }
}

#[async_trait]
impl ToolTransport for InProcessTransport {
    fn kind(&self) -> &str {
        "in_process"
    }

    async fn connect(
        &self,
        config: &ToolServerConfig,
    ) -> Result<Box<dyn TransportSession>, TransportError> {
        let tools = self
            .servers
            .read()
            .get(&config.name)
            .cloned()
            .ok_or_else(|| {
                TransportError::Connect(format!("no in-process tools hosted for '{}'", config.name))
            })?;
        Ok(Box::new(InProcessSession { tools: Some(tools) }))
    }
}

struct InProcessSession {
    tools: Option<Arc<ToolMap>>,
}

impl InProcessSession {
    fn tools(&self) -> Result<&Arc<ToolMap>, TransportError> {
        self.tools.as_ref().ok_or(TransportError::Closed)
    }
}

#[async_trait]
impl TransportSession for InProcessSession {
    async fn list_tools(&mut self) -> Result<Vec<ToolDescriptor>, TransportError> {
        let mut descriptors: Vec<ToolDescriptor> =
            self.tools()?.values().map(|t| t.to_descriptor()).collect();
        descriptors.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(descriptors)
    }

    async fn invoke(
        &mut self,
        tool: &str,
        args: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value, TransportError> {
        let target = self
            .tools()?
            .get(tool)
            .cloned()
            .ok_or_else(|| TransportError::ToolRejected {
                tool: tool.to_string(),
                reason: "unknown tool".into(),
            })?;
        match tokio::time::timeout(timeout, target.execute(args)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(reason)) => Err(TransportError::ToolRejected {
                tool: tool.to_string(),
                reason,
            }),
            Err(_) => Err(TransportError::Io(format!("tool '{tool}' did not answer within {timeout:?}"))),
        }
    }

    async fn close(&mut self) {
        self.tools = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tierwise_core::tool::TransportDescriptor;

    /// Echoes its arguments back; fails when asked to.
    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "Echo the arguments"
        }

        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }

        async fn execute(&self, arguments: serde_json::Value) -> Result<serde_json::Value, String> {
            if arguments.get("fail").and_then(|v| v.as_bool()).unwrap_or(false) {
                return Err("asked to fail".into());
            }
            Ok(arguments)
        }
    }

    #[tokio::test]
    async fn in_process_session_invokes_registered_tools() {
        let transport = InProcessTransport::new();
        transport.register("local", vec![Arc::new(EchoTool) as Arc<dyn Tool>]);
        let config = ToolServerConfig::new("local", TransportDescriptor::InProcess);

        let mut session = transport.connect(&config).await.unwrap();
        let tools = session.list_tools().await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "echo");

        let out = session
            .invoke("echo", serde_json::json!({"x": 1}), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(out["x"], 1);

        let rejected = session
            .invoke("echo", serde_json::json!({"fail": true}), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(rejected, TransportError::ToolRejected { .. }));

        let unknown = session
            .invoke("nope", serde_json::json!({}), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(!unknown.is_transport_failure());

        session.close().await;
        assert_eq!(session.list_tools().await.unwrap_err(), TransportError::Closed);
    }

    #[tokio::test]
    async fn unknown_in_process_server_fails_to_connect() {
        let transport = InProcessTransport::new();
        let config = ToolServerConfig::new("ghost", TransportDescriptor::InProcess);
        assert!(matches!(
            transport.connect(&config).await,
            Err(TransportError::Connect(_))
        ));
    }

    #[tokio::test]
    async fn unregistered_kind_is_unsupported() {
        let set = TransportSet::new().register(Arc::new(InProcessTransport::new()));
        assert_eq!(set.kinds(), vec!["in_process"]);
        let config = ToolServerConfig::new(
            "git",
            TransportDescriptor::Stdio {
                command: "mcp-git".into(),
                args: vec![],
                env: Default::default(),
            },
        );
        assert!(matches!(
            set.connect(&config).await,
            Err(TransportError::Unsupported(kind)) if kind == "stdio"
        ));
    }
}
