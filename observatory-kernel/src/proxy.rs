/**
 * SUBSYSTEM PROXY - Per-daemon client with silent reconnection
 *
 * ROLE:
 * Owns the single connection handle to one device daemon and the
 * `SubsystemState` bucket fed by it.
 *
 * OPERATION:
 * - `update_state()`: disconnected → one connection attempt; connected →
 *   `getState()` merged into the bucket. Never fails to its caller: the
 *   outcome is reported as a `PollOutcome` and via `is_connected`
 * - `send()`: forwarded only while connected, bounded by the call timeout
 * - Reconnection builds a fresh handle and drops the old one
 */

use crate::context::Clock;
use crate::state::SubsystemState;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProxyError {
    #[error("{0} is not connected")]
    NotConnected(String),
    #[error("{daemon} did not answer within {ms} ms")]
    Timeout { daemon: String, ms: u64 },
    #[error("connection to {daemon} failed: {reason}")]
    Connect { daemon: String, reason: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("daemon refused: {0}")]
    Remote(String),
    #[error("command queue for {0} is full")]
    QueueFull(String),
    #[error("worker for {0} has stopped")]
    WorkerStopped(String),
}

impl ProxyError {
    /// Errors after which the handle can no longer be trusted.
    pub fn breaks_link(&self) -> bool {
        matches!(self, ProxyError::Transport(_) | ProxyError::Timeout { .. })
    }
}

/// RPC surface of one device daemon.
#[async_trait]
pub trait DeviceClient: Send + Sync {
    async fn get_state(&self) -> Result<Map<String, Value>, ProxyError>;
    async fn call(&self, method: &str, args: &[Value]) -> Result<Value, ProxyError>;
}

/// Resolves a daemon name into a fresh client handle.
#[async_trait]
pub trait DeviceConnector: Send + Sync {
    async fn connect(&self, daemon: &str) -> Result<Box<dyn DeviceClient>, ProxyError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Refreshed,
    Reconnected,
    ConnectFailed(ProxyError),
    PollFailed(ProxyError),
}

pub struct SubsystemProxy {
    name: String,
    daemon: String,
    connector: Arc<dyn DeviceConnector>,
    client: Option<Box<dyn DeviceClient>>,
    state: SubsystemState,
    call_timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl SubsystemProxy {
    pub fn new(
        name: &str,
        daemon: &str,
        connector: Arc<dyn DeviceConnector>,
        state: SubsystemState,
        call_timeout: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            name: name.to_string(),
            daemon: daemon.to_string(),
            connector,
            client: None,
            state,
            call_timeout,
            clock,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> &SubsystemState {
        &self.state
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_some() && self.state.is_connected
    }

    fn timeout_error(&self) -> ProxyError {
        ProxyError::Timeout { daemon: self.daemon.clone(), ms: self.call_timeout.as_millis() as u64 }
    }

    fn drop_link(&mut self) {
        self.client = None;
        self.state.mark_disconnected();
    }

    async fn reconnect(&mut self) -> PollOutcome {
        match timeout(self.call_timeout, self.connector.connect(&self.daemon)).await {
            Ok(Ok(client)) => {
                self.client = Some(client);
                self.state.is_connected = true;
                PollOutcome::Reconnected
            }
            Ok(Err(e)) => {
                self.state.mark_disconnected();
                PollOutcome::ConnectFailed(e)
            }
            Err(_) => {
                self.state.mark_disconnected();
                PollOutcome::ConnectFailed(self.timeout_error())
            }
        }
    }

    pub async fn update_state(&mut self) -> PollOutcome {
        let Some(client) = self.client.as_ref() else {
            return self.reconnect().await;
        };
        match timeout(self.call_timeout, client.get_state()).await {
            Ok(Ok(remote)) => {
                let now = self.clock.unix();
                self.state.merge(remote, now);
                PollOutcome::Refreshed
            }
            Ok(Err(e)) => {
                self.drop_link();
                PollOutcome::PollFailed(e)
            }
            Err(_) => {
                let e = self.timeout_error();
                self.drop_link();
                PollOutcome::PollFailed(e)
            }
        }
    }

    pub async fn send(&mut self, action: &str, args: &[Value]) -> Result<Value, ProxyError> {
        let Some(client) = self.client.as_ref() else {
            return Err(ProxyError::NotConnected(self.name.clone()));
        };
        let result = match timeout(self.call_timeout, client.call(action, args)).await {
            Ok(r) => r,
            Err(_) => Err(self.timeout_error()),
        };
        if let Err(e) = &result {
            if e.breaks_link() {
                self.drop_link();
            }
        }
        result
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::context::FixedClock;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Scriptable daemon shared between the connector and the test.
    #[derive(Default)]
    pub struct FakeDaemon {
        pub state: Mutex<Map<String, Value>>,
        pub reachable: AtomicBool,
        pub fail_polls: AtomicBool,
        pub calls: Mutex<Vec<(String, Vec<Value>)>>,
        pub connects: AtomicUsize,
    }

    struct FakeClient(Arc<FakeDaemon>);

    #[async_trait]
    impl DeviceClient for FakeClient {
        async fn get_state(&self) -> Result<Map<String, Value>, ProxyError> {
            if self.0.fail_polls.load(Ordering::SeqCst) {
                return Err(ProxyError::Transport("socket closed".into()));
            }
            Ok(self.0.state.lock().clone())
        }

        async fn call(&self, method: &str, args: &[Value]) -> Result<Value, ProxyError> {
            self.0.calls.lock().push((method.to_string(), args.to_vec()));
            if method == "explode" {
                return Err(ProxyError::Remote("no such command".into()));
            }
            Ok(json!("ok"))
        }
    }

    pub struct FakeConnector(pub Arc<FakeDaemon>);

    #[async_trait]
    impl DeviceConnector for FakeConnector {
        async fn connect(&self, daemon: &str) -> Result<Box<dyn DeviceClient>, ProxyError> {
            self.0.connects.fetch_add(1, Ordering::SeqCst);
            if self.0.reachable.load(Ordering::SeqCst) {
                Ok(Box::new(FakeClient(self.0.clone())))
            } else {
                Err(ProxyError::Connect { daemon: daemon.into(), reason: "refused".into() })
            }
        }
    }

    fn proxy(daemon: Arc<FakeDaemon>) -> SubsystemProxy {
        let mut defaults = BTreeMap::new();
        defaults.insert("tec_temp".to_string(), json!(-888));
        SubsystemProxy::new(
            "camera",
            "camera_daemon",
            Arc::new(FakeConnector(daemon)),
            SubsystemState::with_defaults("camera", &defaults),
            Duration::from_millis(200),
            Arc::new(FixedClock::at_unix(1_000)),
        )
    }

    #[tokio::test]
    async fn first_tick_connects_second_tick_polls() {
        let daemon = Arc::new(FakeDaemon::default());
        daemon.reachable.store(true, Ordering::SeqCst);
        daemon.state.lock().insert("tec_temp".into(), json!(-20.0));
        let mut p = proxy(daemon.clone());

        assert_eq!(p.update_state().await, PollOutcome::Reconnected);
        assert_eq!(p.state().get_f64("tec_temp"), Some(-888.0));
        assert_eq!(p.update_state().await, PollOutcome::Refreshed);
        assert_eq!(p.state().get_f64("tec_temp"), Some(-20.0));
        assert_eq!(p.state().last_refresh, Some(1000.0));
    }

    #[tokio::test]
    async fn failed_polls_keep_known_values() {
        let daemon = Arc::new(FakeDaemon::default());
        daemon.reachable.store(true, Ordering::SeqCst);
        daemon.state.lock().insert("tec_temp".into(), json!(-20.0));
        let mut p = proxy(daemon.clone());
        p.update_state().await;
        p.update_state().await;

        daemon.fail_polls.store(true, Ordering::SeqCst);
        daemon.reachable.store(false, Ordering::SeqCst);
        for _ in 0..5 {
            let outcome = p.update_state().await;
            assert!(matches!(outcome, PollOutcome::PollFailed(_) | PollOutcome::ConnectFailed(_)));
            assert!(!p.state().is_connected);
            assert_eq!(p.state().get_f64("tec_temp"), Some(-20.0));
        }
    }

    #[tokio::test]
    async fn one_connection_attempt_per_tick() {
        let daemon = Arc::new(FakeDaemon::default());
        let mut p = proxy(daemon.clone());
        for _ in 0..3 {
            assert!(matches!(p.update_state().await, PollOutcome::ConnectFailed(_)));
        }
        assert_eq!(daemon.connects.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn send_requires_connection() {
        let daemon = Arc::new(FakeDaemon::default());
        let mut p = proxy(daemon.clone());
        assert_eq!(p.send("startup", &[]).await, Err(ProxyError::NotConnected("camera".into())));

        daemon.reachable.store(true, Ordering::SeqCst);
        p.update_state().await;
        assert_eq!(p.send("startup", &[json!(1)]).await, Ok(json!("ok")));
        assert_eq!(daemon.calls.lock()[0], ("startup".to_string(), vec![json!(1)]));
    }

    #[tokio::test]
    async fn remote_refusal_keeps_the_link() {
        let daemon = Arc::new(FakeDaemon::default());
        daemon.reachable.store(true, Ordering::SeqCst);
        let mut p = proxy(daemon.clone());
        p.update_state().await;
        assert!(matches!(p.send("explode", &[]).await, Err(ProxyError::Remote(_))));
        assert!(p.is_connected());
    }
}
