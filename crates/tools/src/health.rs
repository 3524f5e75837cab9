//! Per-server connection health and circuit breaking.
//!
//! States: `disconnected → connecting → connected`, `connecting → failed`,
//! `failed → disconnected` once the open window expires, and
//! `connected → disconnected` when a session is dropped.
//!
//! Consecutive transport failures trip the circuit after
//! `CircuitPolicy::failure_threshold`. The open window grows with every trip
//! (capped exponential) and resets after a successful call. A failure on the
//! first call after a window expires trips again immediately.

use parking_lot::Mutex;
use serde::Serialize;
use std::time::Duration;
use tierwise_core::tool::CircuitPolicy;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
struct HealthInner {
    state: ConnectionState,
    consecutive_failures: u32,
    trips: u32,
    open_until: Option<Instant>,
    half_open: bool,
    needs_recheck: bool,
}

/// Point-in-time view of a server's health.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSnapshot {
    pub state: ConnectionState,
    pub consecutive_failures: u32,
    pub trips: u32,
    /// Time until the circuit closes, when open
    pub retry_in: Option<Duration>,
    pub needs_recheck: bool,
}

/// Health tracker for one server.
#[derive(Debug)]
pub struct ServerHealth {
    policy: CircuitPolicy,
    inner: Mutex<HealthInner>,
}

impl ServerHealth {
    pub fn new(policy: CircuitPolicy) -> Self {
        Self {
            policy,
            inner: Mutex::new(HealthInner {
                state: ConnectionState::Disconnected,
                consecutive_failures: 0,
                trips: 0,
                open_until: None,
                half_open: false,
                needs_recheck: false,
            }),
        }
    }

    /// `Err(retry_in)` while the circuit is open. An expired window moves the
    /// server back to `Disconnected` on probation.
    pub fn check(&self) -> Result<(), Duration> {
        let mut inner = self.inner.lock();
        if inner.state != ConnectionState::Failed {
            return Ok(());
        }
        let now = Instant::now();
        match inner.open_until {
            Some(until) if until > now => Err(until - now),
            _ => {
                inner.state = ConnectionState::Disconnected;
                inner.open_until = None;
                inner.half_open = true;
                Ok(())
            }
        }
    }

    pub fn connecting(&self) {
        let mut inner = self.inner.lock();
        if inner.state != ConnectionState::Failed {
            inner.state = ConnectionState::Connecting;
        }
    }

    pub fn connected(&self) {
        let mut inner = self.inner.lock();
        if inner.state != ConnectionState::Failed {
            inner.state = ConnectionState::Connected;
        }
    }

    /// A session was dropped; nothing is connected until the next attempt.
    pub fn disconnected(&self) {
        let mut inner = self.inner.lock();
        if inner.state != ConnectionState::Failed {
            inner.state = ConnectionState::Disconnected;
        }
    }

    /// The server answered. Resets the failure streak and the backoff.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.state = ConnectionState::Connected;
        inner.consecutive_failures = 0;
        inner.trips = 0;
        inner.half_open = false;
        inner.needs_recheck = false;
    }

    /// Count a transport failure. Returns the open window if this trips the circuit.
    pub fn record_failure(&self) -> Option<Duration> {
        let mut inner = self.inner.lock();
        inner.consecutive_failures += 1;
        if inner.consecutive_failures < self.policy.failure_threshold && !inner.half_open {
            inner.state = ConnectionState::Disconnected;
            return None;
        }

        inner.trips += 1;
        let window = self.policy.open_window(inner.trips);
        inner.state = ConnectionState::Failed;
        inner.open_until = Some(Instant::now() + window);
        inner.consecutive_failures = 0;
        inner.half_open = false;
        Some(window)
    }

    /// A deadline expired mid-call. Not a failure; the next call re-checks.
    pub fn mark_for_recheck(&self) {
        let mut inner = self.inner.lock();
        inner.needs_recheck = true;
        if inner.state != ConnectionState::Failed {
            inner.state = ConnectionState::Disconnected;
        }
    }

    pub fn needs_recheck(&self) -> bool {
        self.inner.lock().needs_recheck
    }

    /// The open window expired and no call has succeeded since.
    pub fn on_probation(&self) -> bool {
        self.inner.lock().half_open
    }

    /// The circuit is open (window not yet checked out).
    pub fn is_tripped(&self) -> bool {
        self.inner.lock().state == ConnectionState::Failed
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let inner = self.inner.lock();
        let now = Instant::now();
        HealthSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            trips: inner.trips,
            retry_in: inner
                .open_until
                .filter(|until| *until > now)
                .map(|until| until - now),
            needs_recheck: inner.needs_recheck,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> CircuitPolicy {
        CircuitPolicy {
            failure_threshold: 3,
            base_open_ms: 1_000,
            max_open_ms: 4_000,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn trips_after_threshold() {
        let health = ServerHealth::new(policy());
        assert_eq!(health.record_failure(), None);
        assert_eq!(health.record_failure(), None);
        assert_eq!(health.record_failure(), Some(Duration::from_secs(1)));
        assert_eq!(health.snapshot().state, ConnectionState::Failed);
        assert!(health.is_tripped());
        assert_eq!(health.check(), Err(Duration::from_secs(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn window_expiry_returns_to_disconnected() {
        let health = ServerHealth::new(policy());
        for _ in 0..3 {
            health.record_failure();
        }
        tokio::time::advance(Duration::from_millis(1_001)).await;
        assert!(health.check().is_ok());
        assert_eq!(health.snapshot().state, ConnectionState::Disconnected);
        assert!(health.on_probation());
        assert!(!health.is_tripped());

        health.record_success();
        assert!(!health.on_probation());
    }

    #[tokio::test(start_paused = true)]
    async fn probation_failure_trips_with_longer_window() {
        let health = ServerHealth::new(policy());
        for _ in 0..3 {
            health.record_failure();
        }
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(health.check().is_ok());

        assert_eq!(health.record_failure(), Some(Duration::from_secs(2)));
        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(health.check().is_ok());
        assert_eq!(health.record_failure(), Some(Duration::from_secs(4)));
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(health.check().is_ok());
        // Capped
        assert_eq!(health.record_failure(), Some(Duration::from_secs(4)));
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_backoff() {
        let health = ServerHealth::new(policy());
        for _ in 0..3 {
            health.record_failure();
        }
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(health.check().is_ok());
        health.record_success();

        let snap = health.snapshot();
        assert_eq!(snap.state, ConnectionState::Connected);
        assert_eq!(snap.trips, 0);
        assert_eq!(health.record_failure(), None);
    }

    #[test]
    fn state_transitions() {
        let health = ServerHealth::new(policy());
        assert_eq!(health.snapshot().state, ConnectionState::Disconnected);
        health.connecting();
        assert_eq!(health.snapshot().state, ConnectionState::Connecting);
        health.connected();
        assert_eq!(health.snapshot().state, ConnectionState::Connected);
        health.disconnected();
        assert_eq!(health.snapshot().state, ConnectionState::Disconnected);
    }

    #[test]
    fn recheck_is_not_a_failure() {
        let health = ServerHealth::new(policy());
        health.connected();
        health.mark_for_recheck();
        let snap = health.snapshot();
        assert!(snap.needs_recheck);
        assert_eq!(snap.consecutive_failures, 0);
        assert_eq!(snap.state, ConnectionState::Disconnected);
    }
}
