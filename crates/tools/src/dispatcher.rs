//! Tool dispatcher — routes calls to tool servers.
//!
//! Every call resolves the server in the registry, takes a slot from the
//! server's bounded pool and runs the attempt loop:
//!
//! - transport failures are retried with exponential backoff (±25% jitter)
//!   up to `retry.max_attempts`;
//! - a tool rejecting its arguments is returned at once and says nothing
//!   about the connection;
//! - `circuit.failure_threshold` consecutive transport failures open the
//!   server's circuit, and calls fail fast with `CircuitOpen` until the
//!   window expires;
//! - the caller's deadline bounds everything. When it expires the attempt is
//!   abandoned, the server is marked for a re-check and `Timeout` returned.

use chrono::Utc;
use futures::future::join_all;
use parking_lot::RwLock;
use rand::Rng;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tierwise_core::error::{DispatchError, TransportError};
use tierwise_core::event::{DomainEvent, EventBus};
use tierwise_core::tool::{ToolDescriptor, ToolServerConfig};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::health::ConnectionState;
use crate::pool::{PoolStatus, PooledConnection, ServerLink};
use crate::registry::ToolRegistry;
use crate::transport::TransportSet;

/// Observable state of one configured server.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub name: String,
    pub enabled: bool,
    pub transport: String,
    pub state: ConnectionState,
    pub consecutive_failures: u32,
    /// Milliseconds until the open circuit closes
    pub retry_in_ms: Option<u64>,
    pub needs_recheck: bool,
    pub pool: PoolStatus,
}

pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    transports: TransportSet,
    links: RwLock<HashMap<String, Arc<ServerLink>>>,
    seen_generation: AtomicU64,
    events: Option<Arc<EventBus>>,
}

impl std::fmt::Debug for ToolDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDispatcher")
            .field("registry", &self.registry)
            .field("transports", &self.transports)
            .field("links", &self.links.read().len())
            .finish()
    }
}

impl ToolDispatcher {
    pub fn new(registry: Arc<ToolRegistry>, transports: TransportSet) -> Self {
        Self {
            registry,
            transports,
            links: RwLock::new(HashMap::new()),
            seen_generation: AtomicU64::new(0),
            events: None,
        }
    }

    pub fn with_event_bus(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Invoke `tool` on `server`, giving up at `deadline`.
    pub async fn invoke(
        &self,
        server: &str,
        tool: &str,
        args: serde_json::Value,
        deadline: Instant,
    ) -> Result<serde_json::Value, DispatchError> {
        let started = Instant::now();
        let result = self.dispatch(server, tool, args, deadline).await;

        let (success, attempts) = match &result {
            Ok((_, attempts)) => (true, *attempts),
            Err(e) => (false, e.attempts()),
        };
        let duration_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => debug!(server, tool, attempts, duration_ms, "Tool call succeeded"),
            Err(e) => warn!(server, tool, attempts, duration_ms, error = %e, "Tool call failed"),
        }
        self.publish(DomainEvent::ToolInvoked {
            server: server.to_string(),
            tool: tool.to_string(),
            success,
            attempts,
            duration_ms,
            timestamp: Utc::now(),
        });

        result.map(|(value, _)| value)
    }

    /// [`invoke`](Self::invoke) with a deadline relative to now.
    pub async fn invoke_with_timeout(
        &self,
        server: &str,
        tool: &str,
        args: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value, DispatchError> {
        self.invoke(server, tool, args, Instant::now() + timeout).await
    }

    async fn dispatch(
        &self,
        server: &str,
        tool: &str,
        args: serde_json::Value,
        deadline: Instant,
    ) -> Result<(serde_json::Value, u32), DispatchError> {
        let (config, link) = self.resolve(server)?;
        let health = link.health();
        let circuit_open = |retry_in| DispatchError::CircuitOpen {
            server: server.to_string(),
            retry_in,
            attempts: 0,
        };

        health.check().map_err(circuit_open)?;
        let mut conn = link.acquire(deadline).await?;
        // The circuit may have opened while this call waited for a slot
        health.check().map_err(circuit_open)?;
        // Sessions opened before a timeout or a trip are not trusted
        if (health.needs_recheck() || health.on_probation()) && conn.has_session() {
            conn.discard();
        }

        let retry = &config.retry;
        let mut attempts = 0u32;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(self.timed_out(&link, &mut conn, server, tool, attempts));
            }
            attempts += 1;
            let attempt_deadline = (now + config.timeout()).min(deadline);
            let outcome = tokio::time::timeout_at(
                attempt_deadline,
                self.attempt(&link, &mut conn, tool, args.clone(), attempt_deadline - now),
            )
            .await;

            let failure = match outcome {
                Ok(Ok(value)) => {
                    health.record_success();
                    conn.release();
                    return Ok((value, attempts));
                }
                Ok(Err(e)) if e.is_transport_failure() => e,
                Ok(Err(e @ TransportError::ToolRejected { .. })) => {
                    // The server answered; the connection is fine
                    health.record_success();
                    conn.release();
                    return Err(invocation_failed(server, tool, attempts, e));
                }
                Ok(Err(e)) => {
                    health.disconnected();
                    conn.discard();
                    return Err(invocation_failed(server, tool, attempts, e));
                }
                Err(_) if attempt_deadline >= deadline => {
                    return Err(self.timed_out(&link, &mut conn, server, tool, attempts));
                }
                Err(_) => TransportError::Io(format!(
                    "no answer within per-attempt timeout of {}ms",
                    config.timeout_ms
                )),
            };

            conn.discard();
            if let Some(window) = health.record_failure() {
                link.discard_idle();
                warn!(
                    server,
                    open_ms = window.as_millis() as u64,
                    error = %failure,
                    "Circuit opened"
                );
                self.publish(DomainEvent::CircuitOpened {
                    server: server.to_string(),
                    open_ms: window.as_millis() as u64,
                    timestamp: Utc::now(),
                });
                return Err(invocation_failed(server, tool, attempts, failure));
            }
            if attempts >= retry.max_attempts {
                return Err(invocation_failed(server, tool, attempts, failure));
            }

            let delay = jitter(retry.backoff(attempts - 1));
            if Instant::now() + delay >= deadline {
                // No room left for another attempt
                return Err(invocation_failed(server, tool, attempts, failure));
            }
            warn!(
                server,
                tool,
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                error = %failure,
                "Tool call failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Connect if the slot holds no session, then invoke.
    async fn attempt(
        &self,
        link: &ServerLink,
        conn: &mut PooledConnection,
        tool: &str,
        args: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value, TransportError> {
        if !conn.has_session() {
            link.health().connecting();
            let session = self.transports.connect(link.config()).await?;
            link.health().connected();
            conn.attach(session);
        }
        let session = conn.session().ok_or(TransportError::Closed)?;
        session.invoke(tool, args, timeout).await
    }

    fn timed_out(
        &self,
        link: &ServerLink,
        conn: &mut PooledConnection,
        server: &str,
        tool: &str,
        attempts: u32,
    ) -> DispatchError {
        link.health().mark_for_recheck();
        conn.discard();
        DispatchError::Timeout {
            server: server.to_string(),
            tool: tool.to_string(),
            attempts,
        }
    }

    /// Tools advertised by one server.
    pub async fn list_tools(&self, server: &str, deadline: Instant) -> Result<Vec<ToolDescriptor>, DispatchError> {
        let (config, link) = self.resolve(server)?;
        let health = link.health();
        let circuit_open = |retry_in| DispatchError::CircuitOpen {
            server: server.to_string(),
            retry_in,
            attempts: 0,
        };
        health.check().map_err(circuit_open)?;
        let mut conn = link.acquire(deadline).await?;
        health.check().map_err(circuit_open)?;
        if (health.needs_recheck() || health.on_probation()) && conn.has_session() {
            conn.discard();
        }

        let attempt_deadline = (Instant::now() + config.timeout()).min(deadline);
        let listed = tokio::time::timeout_at(attempt_deadline, async {
            if !conn.has_session() {
                health.connecting();
                let session = self.transports.connect(&config).await?;
                health.connected();
                conn.attach(session);
            }
            conn.session()
                .ok_or(TransportError::Closed)?
                .list_tools()
                .await
        })
        .await;

        match listed {
            Ok(Ok(tools)) => {
                health.record_success();
                conn.release();
                Ok(tools)
            }
            Ok(Err(e)) => {
                if e.is_transport_failure() {
                    if health.record_failure().is_some() {
                        link.discard_idle();
                    }
                } else {
                    health.disconnected();
                }
                conn.discard();
                Err(invocation_failed(server, "list_tools", 1, e))
            }
            Err(_) => Err(self.timed_out(&link, &mut conn, server, "list_tools", 1)),
        }
    }

    /// List tools on every enabled server concurrently.
    pub async fn discover(
        &self,
        timeout: Duration,
    ) -> Vec<(String, Result<Vec<ToolDescriptor>, DispatchError>)> {
        let deadline = Instant::now() + timeout;
        let names: Vec<String> = self
            .registry
            .list()
            .into_iter()
            .filter(|c| c.enabled)
            .map(|c| c.name.clone())
            .collect();
        let results = join_all(names.iter().map(|name| self.list_tools(name, deadline))).await;
        let found: usize = results.iter().filter_map(|r| r.as_ref().ok()).map(Vec::len).sum();
        info!(servers = names.len(), tools = found, "Tool discovery finished");
        names.into_iter().zip(results).collect()
    }

    /// Connection state, circuit and pool usage for every configured server.
    pub fn status(&self) -> Vec<ServerStatus> {
        self.prune();
        let links = self.links.read();
        self.registry
            .list()
            .into_iter()
            .map(|config| {
                let link = links.get(&config.name).filter(|l| l.config().as_ref() == config.as_ref());
                let (health, pool) = match link {
                    Some(link) => (Some(link.health_snapshot()), link.pool_status()),
                    None => (
                        None,
                        PoolStatus {
                            pool_size: config.pool_size,
                            idle: 0,
                            in_use: 0,
                        },
                    ),
                };
                ServerStatus {
                    name: config.name.clone(),
                    enabled: config.enabled,
                    transport: config.transport.kind().to_string(),
                    state: health.as_ref().map_or(ConnectionState::Disconnected, |h| h.state),
                    consecutive_failures: health.as_ref().map_or(0, |h| h.consecutive_failures),
                    retry_in_ms: health
                        .as_ref()
                        .and_then(|h| h.retry_in)
                        .map(|d| d.as_millis() as u64),
                    needs_recheck: health.as_ref().is_some_and(|h| h.needs_recheck),
                    pool,
                }
            })
            .collect()
    }

    /// Look up an enabled server and its link.
    fn resolve(&self, server: &str) -> Result<(Arc<ToolServerConfig>, Arc<ServerLink>), DispatchError> {
        self.prune();
        let config = self
            .registry
            .get(server)
            .map_err(|_| DispatchError::ServerNotFound {
                server: server.to_string(),
            })?;
        let link = self.link_for(&config);
        Ok((config, link))
    }

    /// The link for a config, replaced when the config changed.
    fn link_for(&self, config: &Arc<ToolServerConfig>) -> Arc<ServerLink> {
        if let Some(link) = self.links.read().get(&config.name) {
            if link.config().as_ref() == config.as_ref() {
                return Arc::clone(link);
            }
        }
        let mut links = self.links.write();
        if let Some(link) = links.get(&config.name) {
            if link.config().as_ref() == config.as_ref() {
                return Arc::clone(link);
            }
        }
        let link = Arc::new(ServerLink::new(Arc::clone(config)));
        if let Some(old) = links.insert(config.name.clone(), Arc::clone(&link)) {
            debug!(server = %config.name, "Server config changed; replacing link");
            retire(old);
        }
        link
    }

    /// Drop links of servers that left the registry.
    fn prune(&self) {
        let generation = self.registry.generation();
        if self.seen_generation.swap(generation, Ordering::AcqRel) == generation {
            return;
        }
        let snapshot = self.registry.snapshot();
        let mut links = self.links.write();
        let removed: Vec<String> = links
            .keys()
            .filter(|name| !snapshot.servers.contains_key(*name))
            .cloned()
            .collect();
        for name in removed {
            if let Some(link) = links.remove(&name) {
                debug!(server = %name, "Server removed from registry; retiring link");
                retire(link);
            }
        }
    }

    fn publish(&self, event: DomainEvent) {
        if let Some(events) = &self.events {
            events.publish(event);
        }
    }
}

/// Close idle sessions of a link no longer in use. In-flight calls keep
/// their own reference and finish normally.
fn retire(link: Arc<ServerLink>) {
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(async move { link.drain().await });
    }
}

fn invocation_failed(server: &str, tool: &str, attempts: u32, source: TransportError) -> DispatchError {
    DispatchError::ToolInvocationFailed {
        server: server.to_string(),
        tool: tool.to_string(),
        attempts,
        source,
    }
}

/// ±25% around `base`.
fn jitter(base: Duration) -> Duration {
    let base_ms = base.as_millis() as u64;
    let spread = base_ms / 4;
    if spread == 0 {
        return base;
    }
    Duration::from_millis(rand::rng().random_range(base_ms - spread..=base_ms + spread))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use tierwise_core::tool::{
        CircuitPolicy, RetryPolicy, ToolTransport, TransportDescriptor, TransportSession,
    };

    #[derive(Clone)]
    enum Step {
        Reply(serde_json::Value),
        Fail(TransportError),
        Delay(Duration),
        Hang,
    }

    #[derive(Default)]
    struct Counters {
        connects: usize,
        invokes: usize,
    }

    /// Plays back scripted steps; repeats the fallback once the script runs out.
    struct ScriptedTransport {
        script: Arc<Mutex<VecDeque<Step>>>,
        fallback: Step,
        counters: Arc<Mutex<Counters>>,
    }

    impl ScriptedTransport {
        fn new(steps: Vec<Step>, fallback: Step) -> Self {
            Self {
                script: Arc::new(Mutex::new(steps.into())),
                fallback,
                counters: Arc::new(Mutex::new(Counters::default())),
            }
        }
    }

    #[async_trait]
    impl ToolTransport for ScriptedTransport {
        fn kind(&self) -> &str {
            "stdio"
        }

        async fn connect(&self, _config: &ToolServerConfig) -> Result<Box<dyn TransportSession>, TransportError> {
            self.counters.lock().connects += 1;
            Ok(Box::new(ScriptedSession {
                script: Arc::clone(&self.script),
                fallback: self.fallback.clone(),
                counters: Arc::clone(&self.counters),
            }))
        }
    }

    struct ScriptedSession {
        script: Arc<Mutex<VecDeque<Step>>>,
        fallback: Step,
        counters: Arc<Mutex<Counters>>,
    }

    #[async_trait]
    impl TransportSession for ScriptedSession {
        async fn list_tools(&mut self) -> Result<Vec<ToolDescriptor>, TransportError> {
            Ok(vec![ToolDescriptor {
                name: "echo".into(),
                description: String::new(),
                schema: serde_json::json!({}),
            }])
        }

        async fn invoke(
            &mut self,
            _tool: &str,
            _args: serde_json::Value,
            _timeout: Duration,
        ) -> Result<serde_json::Value, TransportError> {
            self.counters.lock().invokes += 1;
            let step = self.script.lock().pop_front().unwrap_or_else(|| self.fallback.clone());
            match step {
                Step::Reply(v) => Ok(v),
                Step::Fail(e) => Err(e),
                Step::Delay(d) => {
                    tokio::time::sleep(d).await;
                    Ok(serde_json::json!("late"))
                }
                Step::Hang => std::future::pending().await,
            }
        }

        async fn close(&mut self) {}
    }

    fn server(name: &str) -> ToolServerConfig {
        let mut config = ToolServerConfig::new(
            name,
            TransportDescriptor::Stdio {
                command: "scripted".into(),
                args: vec![],
                env: Default::default(),
            },
        );
        config.retry = RetryPolicy {
            max_attempts: 3,
            base_backoff_ms: 10,
            max_backoff_ms: 100,
        };
        config.circuit = CircuitPolicy {
            failure_threshold: 3,
            base_open_ms: 1_000,
            max_open_ms: 8_000,
        };
        config.timeout_ms = 5_000;
        config
    }

    fn setup(
        configs: Vec<ToolServerConfig>,
        transport: ScriptedTransport,
    ) -> (ToolDispatcher, Arc<Mutex<Counters>>, Arc<EventBus>) {
        let counters = Arc::clone(&transport.counters);
        let bus = Arc::new(EventBus::default());
        let registry = Arc::new(ToolRegistry::from_configs(configs).unwrap());
        let dispatcher = ToolDispatcher::new(registry, TransportSet::new().register(Arc::new(transport)))
            .with_event_bus(Arc::clone(&bus));
        (dispatcher, counters, bus)
    }

    fn io() -> TransportError {
        TransportError::Io("broken pipe".into())
    }

    fn secs(n: u64) -> Instant {
        Instant::now() + Duration::from_secs(n)
    }

    #[tokio::test(start_paused = true)]
    async fn success_reuses_pooled_session() {
        let transport = ScriptedTransport::new(vec![], Step::Reply(serde_json::json!({"ok": true})));
        let (dispatcher, counters, _) = setup(vec![server("git")], transport);

        for _ in 0..3 {
            let out = dispatcher.invoke("git", "log", serde_json::json!({}), secs(10)).await.unwrap();
            assert_eq!(out["ok"], true);
        }
        assert_eq!(counters.lock().connects, 1);
        let status = &dispatcher.status()[0];
        assert_eq!(status.state, ConnectionState::Connected);
        assert_eq!(status.pool.idle, 1);
        assert_eq!(status.pool.in_use, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn transport_failure_is_retried() {
        let transport = ScriptedTransport::new(
            vec![Step::Fail(io()), Step::Fail(TransportError::Closed)],
            Step::Reply(serde_json::json!(7)),
        );
        let (dispatcher, counters, bus) = setup(vec![server("git")], transport);
        let mut rx = bus.subscribe();

        let out = dispatcher.invoke("git", "log", serde_json::json!({}), secs(10)).await.unwrap();
        assert_eq!(out, serde_json::json!(7));
        assert_eq!(counters.lock().invokes, 3);
        // Failed sessions are dropped and reopened
        assert_eq!(counters.lock().connects, 3);

        match &*rx.recv().await.unwrap() {
            DomainEvent::ToolInvoked { success, attempts, .. } => {
                assert!(success);
                assert_eq!(*attempts, 3);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(dispatcher.status()[0].consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn circuit_opens_after_three_failures() {
        let transport = ScriptedTransport::new(vec![], Step::Fail(io()));
        let (dispatcher, counters, bus) = setup(vec![server("git")], transport);
        let mut rx = bus.subscribe();

        let err = dispatcher
            .invoke("git", "log", serde_json::json!({}), secs(10))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::ToolInvocationFailed { attempts: 3, .. }));
        assert!(matches!(&*rx.recv().await.unwrap(), DomainEvent::CircuitOpened { open_ms: 1_000, .. }));

        let status = &dispatcher.status()[0];
        assert_eq!(status.state, ConnectionState::Failed);
        assert!(status.retry_in_ms.is_some());

        // Fails fast without touching the transport
        let err = dispatcher
            .invoke("git", "log", serde_json::json!({}), secs(10))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::CircuitOpen { attempts: 0, .. }));
        assert_eq!(counters.lock().invokes, 3);

        // After the window one probe is allowed; its failure reopens with a longer window
        tokio::time::advance(Duration::from_millis(1_100)).await;
        let err = dispatcher
            .invoke("git", "log", serde_json::json!({}), secs(10))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::ToolInvocationFailed { attempts: 1, .. }));
        assert_eq!(counters.lock().invokes, 4);
        let retry_in = dispatcher.status()[0].retry_in_ms.unwrap();
        assert!(retry_in > 1_000 && retry_in <= 2_000);
    }

    #[tokio::test(start_paused = true)]
    async fn tripping_drops_idle_sessions_so_recovery_reconnects() {
        let mut config = server("git");
        config.pool_size = 2;
        let transport = ScriptedTransport::new(
            vec![
                Step::Delay(Duration::from_secs(1)),
                Step::Delay(Duration::from_secs(1)),
                Step::Fail(io()),
                Step::Fail(io()),
                Step::Fail(io()),
            ],
            Step::Reply(serde_json::json!("fresh")),
        );
        let (dispatcher, counters, _) = setup(vec![config], transport);

        // Two overlapping calls leave two idle sessions behind
        let (a, b) = tokio::join!(
            dispatcher.invoke("git", "slow", serde_json::json!({}), secs(10)),
            dispatcher.invoke("git", "slow", serde_json::json!({}), secs(10)),
        );
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(counters.lock().connects, 2);
        assert_eq!(dispatcher.status()[0].pool.idle, 2);

        let err = dispatcher
            .invoke("git", "log", serde_json::json!({}), secs(10))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::ToolInvocationFailed { attempts: 3, .. }));
        let status = &dispatcher.status()[0];
        assert_eq!(status.state, ConnectionState::Failed);
        assert_eq!(status.pool.idle, 0);
        let connects_before = counters.lock().connects;

        tokio::time::advance(Duration::from_millis(1_100)).await;
        let out = dispatcher
            .invoke("git", "log", serde_json::json!({}), secs(10))
            .await
            .unwrap();
        assert_eq!(out, serde_json::json!("fresh"));
        assert_eq!(counters.lock().connects, connects_before + 1);
        assert_eq!(dispatcher.status()[0].state, ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn rejection_is_not_retried_or_counted() {
        let transport = ScriptedTransport::new(
            vec![Step::Fail(TransportError::ToolRejected {
                tool: "log".into(),
                reason: "bad args".into(),
            })],
            Step::Reply(serde_json::json!(null)),
        );
        let (dispatcher, counters, _) = setup(vec![server("git")], transport);

        let err = dispatcher
            .invoke("git", "log", serde_json::json!({}), secs(10))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DispatchError::ToolInvocationFailed {
                attempts: 1,
                source: TransportError::ToolRejected { .. },
                ..
            }
        ));
        assert_eq!(counters.lock().invokes, 1);
        let status = &dispatcher.status()[0];
        assert_eq!(status.consecutive_failures, 0);
        assert_eq!(status.state, ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_expiry_is_timeout_not_failure() {
        let transport = ScriptedTransport::new(vec![Step::Hang], Step::Reply(serde_json::json!(1)));
        let (dispatcher, counters, _) = setup(vec![server("git")], transport);

        let err = dispatcher
            .invoke("git", "log", serde_json::json!({}), secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Timeout { attempts: 1, .. }));
        let status = &dispatcher.status()[0];
        assert!(status.needs_recheck);
        assert_eq!(status.consecutive_failures, 0);
        assert_eq!(status.pool.in_use, 0);

        // The next call reconnects and clears the re-check flag
        dispatcher.invoke("git", "log", serde_json::json!({}), secs(1)).await.unwrap();
        assert_eq!(counters.lock().connects, 2);
        assert!(!dispatcher.status()[0].needs_recheck);
    }

    #[tokio::test(start_paused = true)]
    async fn per_attempt_timeout_counts_as_failure() {
        let mut config = server("git");
        config.timeout_ms = 100;
        let transport = ScriptedTransport::new(vec![], Step::Hang);
        let (dispatcher, _, _) = setup(vec![config], transport);

        let err = dispatcher
            .invoke("git", "log", serde_json::json!({}), secs(10))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DispatchError::ToolInvocationFailed {
                attempts: 3,
                source: TransportError::Io(_),
                ..
            }
        ));
        assert_eq!(dispatcher.status()[0].state, ConnectionState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn full_pool_is_exhausted_at_deadline() {
        let mut config = server("git");
        config.pool_size = 1;
        let transport = ScriptedTransport::new(vec![Step::Delay(Duration::from_secs(3))], Step::Reply(serde_json::json!(1)));
        let (dispatcher, _, _) = setup(vec![config], transport);
        let dispatcher = Arc::new(dispatcher);

        let busy = {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move { dispatcher.invoke("git", "slow", serde_json::json!({}), secs(10)).await })
        };
        tokio::task::yield_now().await;
        assert_eq!(dispatcher.status()[0].pool.in_use, 1);

        let err = dispatcher
            .invoke("git", "log", serde_json::json!({}), Instant::now() + Duration::from_millis(500))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::PoolExhausted { pool_size: 1, .. }));
        assert!(busy.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_and_disabled_servers_are_not_found() {
        let transport = ScriptedTransport::new(vec![], Step::Reply(serde_json::json!(1)));
        let (dispatcher, _, _) = setup(vec![server("git")], transport);

        let err = dispatcher.invoke("nope", "x", serde_json::json!({}), secs(1)).await.unwrap_err();
        assert!(matches!(err, DispatchError::ServerNotFound { .. }));

        dispatcher.registry().set_enabled("git", false).unwrap();
        let err = dispatcher.invoke("git", "x", serde_json::json!({}), secs(1)).await.unwrap_err();
        assert!(matches!(err, DispatchError::ServerNotFound { .. }));
        assert!(!dispatcher.status()[0].enabled);
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_call_survives_reload() {
        let transport = ScriptedTransport::new(vec![Step::Delay(Duration::from_secs(2))], Step::Reply(serde_json::json!(1)));
        let (dispatcher, _, _) = setup(vec![server("old")], transport);
        let dispatcher = Arc::new(dispatcher);

        let in_flight = {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move { dispatcher.invoke("old", "slow", serde_json::json!({}), secs(10)).await })
        };
        tokio::task::yield_now().await;

        dispatcher.registry().load(vec![server("new")]).unwrap();
        let err = dispatcher.invoke("old", "x", serde_json::json!({}), secs(1)).await.unwrap_err();
        assert!(matches!(err, DispatchError::ServerNotFound { .. }));
        assert!(dispatcher.invoke("new", "x", serde_json::json!({}), secs(1)).await.is_ok());

        assert_eq!(in_flight.await.unwrap().unwrap(), serde_json::json!("late"));
        let names: Vec<_> = dispatcher.status().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["new".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_transport_is_unsupported() {
        let transport = ScriptedTransport::new(vec![], Step::Reply(serde_json::json!(1)));
        let mut http = server("remote");
        http.transport = TransportDescriptor::Http {
            url: "http://localhost:9/".into(),
            headers: Default::default(),
        };
        let (dispatcher, _, _) = setup(vec![http], transport);

        let err = dispatcher.invoke("remote", "x", serde_json::json!({}), secs(1)).await.unwrap_err();
        assert!(matches!(
            err,
            DispatchError::ToolInvocationFailed {
                attempts: 1,
                source: TransportError::Unsupported(_),
                ..
            }
        ));
        assert_eq!(dispatcher.status()[0].consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn discover_lists_enabled_servers() {
        let transport = ScriptedTransport::new(vec![], Step::Reply(serde_json::json!(1)));
        let mut off = server("off");
        off.enabled = false;
        let (dispatcher, _, _) = setup(vec![server("git"), off], transport);

        let found = dispatcher.discover(Duration::from_secs(1)).await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].0, "git");
        assert_eq!(found[0].1.as_ref().unwrap()[0].name, "echo");
    }

    #[test]
    fn jitter_stays_within_a_quarter() {
        for _ in 0..100 {
            let d = jitter(Duration::from_millis(1_000));
            assert!(d >= Duration::from_millis(750) && d <= Duration::from_millis(1_250));
        }
        assert_eq!(jitter(Duration::from_millis(2)), Duration::from_millis(2));
    }
}
