/*!
Scriptable device daemons.

A `MockDevice` holds a field map returned by `getState` and optional
reactions per command. Reachability, poll failures and hangs can be toggled
at any time to exercise the proxy's reconnection path.
*/

use async_trait::async_trait;
use observatory_kernel::proxy::{DeviceClient, DeviceConnector, ProxyError};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

pub type Reaction = Box<dyn Fn(&mut Map<String, Value>, &[Value]) -> Result<Value, String> + Send + Sync>;

pub struct MockDevice {
    state: Mutex<Map<String, Value>>,
    reactions: Mutex<HashMap<String, Reaction>>,
    calls: Mutex<Vec<(String, Vec<Value>)>>,
    reachable: AtomicBool,
    failing: AtomicBool,
    hanging: AtomicBool,
    connects: AtomicUsize,
}

impl MockDevice {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(Map::new()),
            reactions: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            reachable: AtomicBool::new(true),
            failing: AtomicBool::new(false),
            hanging: AtomicBool::new(false),
            connects: AtomicUsize::new(0),
        })
    }

    /// Cools on `startup`, warms on `stop_cooling`, counts `do_exposure`.
    pub fn camera() -> Arc<Self> {
        let dev = Self::new();
        dev.set("tec_at_setpoint", json!(false));
        dev.set("warmed_up", json!(true));
        dev.set("exposures", json!(0));
        dev.on("startup", |st, _| {
            st.insert("tec_at_setpoint".into(), json!(true));
            st.insert("warmed_up".into(), json!(false));
            Ok(json!("ok"))
        });
        dev.on("stop_cooling", |st, _| {
            st.insert("tec_at_setpoint".into(), json!(false));
            st.insert("warmed_up".into(), json!(true));
            Ok(json!("ok"))
        });
        dev.on("do_exposure", |st, _| {
            let n = st.get("exposures").and_then(Value::as_u64).unwrap_or(0);
            st.insert("exposures".into(), json!(n + 1));
            Ok(json!("ok"))
        });
        dev
    }

    /// Slews instantly.
    pub fn mount() -> Arc<Self> {
        let dev = Self::new();
        dev.set("mount_is_slewing", json!(false));
        dev.on("goto_ra_dec", |st, args| {
            st.insert("ra".into(), args.first().cloned().unwrap_or(Value::Null));
            st.insert("dec".into(), args.get(1).cloned().unwrap_or(Value::Null));
            Ok(json!("ok"))
        });
        dev
    }

    pub fn ephem(sun_alt: f64) -> Arc<Self> {
        let dev = Self::new();
        dev.set("sun_alt", json!(sun_alt));
        dev
    }

    pub fn set(&self, field: &str, value: Value) {
        self.state.lock().insert(field.to_string(), value);
    }

    pub fn get(&self, field: &str) -> Option<Value> {
        self.state.lock().get(field).cloned()
    }

    pub fn on<F>(&self, method: &str, reaction: F)
    where
        F: Fn(&mut Map<String, Value>, &[Value]) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.reactions.lock().insert(method.to_string(), Box::new(reaction));
    }

    pub fn set_reachable(&self, on: bool) {
        self.reachable.store(on, Ordering::SeqCst);
    }

    /// Polls fail with a transport error while set.
    pub fn set_failing(&self, on: bool) {
        self.failing.store(on, Ordering::SeqCst);
    }

    /// Every request stays unanswered while set.
    pub fn set_hanging(&self, on: bool) {
        self.hanging.store(on, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<(String, Vec<Value>)> {
        self.calls.lock().clone()
    }

    pub fn called(&self, method: &str) -> usize {
        self.calls.lock().iter().filter(|(m, _)| m == method).count()
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    async fn gate(&self) -> Result<(), ProxyError> {
        if self.hanging.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(ProxyError::Transport("connection reset".into()));
        }
        Ok(())
    }

    fn invoke(&self, method: &str, args: &[Value]) -> Result<Value, ProxyError> {
        self.calls.lock().push((method.to_string(), args.to_vec()));
        let reactions = self.reactions.lock();
        match reactions.get(method) {
            Some(reaction) => {
                let mut state = self.state.lock();
                reaction(&mut state, args).map_err(ProxyError::Remote)
            }
            None => Ok(json!("ok")),
        }
    }
}

struct MockClient(Arc<MockDevice>);

#[async_trait]
impl DeviceClient for MockClient {
    async fn get_state(&self) -> Result<Map<String, Value>, ProxyError> {
        self.0.gate().await?;
        if self.0.failing.load(Ordering::SeqCst) {
            return Err(ProxyError::Transport("getState failed".into()));
        }
        Ok(self.0.state.lock().clone())
    }

    async fn call(&self, method: &str, args: &[Value]) -> Result<Value, ProxyError> {
        self.0.gate().await?;
        self.0.invoke(method, args)
    }
}

/// Resolves daemon names to registered mock devices.
#[derive(Default)]
pub struct MockConnector {
    devices: Mutex<HashMap<String, Arc<MockDevice>>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, daemon: &str, device: Arc<MockDevice>) {
        self.devices.lock().insert(daemon.to_string(), device);
    }

    pub fn device(&self, daemon: &str) -> Option<Arc<MockDevice>> {
        self.devices.lock().get(daemon).cloned()
    }
}

#[async_trait]
impl DeviceConnector for MockConnector {
    async fn connect(&self, daemon: &str) -> Result<Box<dyn DeviceClient>, ProxyError> {
        let refused = |reason: &str| ProxyError::Connect { daemon: daemon.to_string(), reason: reason.to_string() };
        let device = self.device(daemon).ok_or_else(|| refused("no such daemon"))?;
        device.connects.fetch_add(1, Ordering::SeqCst);
        if !device.reachable.load(Ordering::SeqCst) {
            return Err(refused("connection refused"));
        }
        Ok(Box::new(MockClient(device)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reactions_mutate_state() {
        let conn = MockConnector::new();
        conn.add("cam", MockDevice::camera());
        let client = conn.connect("cam").await.unwrap();
        client.call("startup", &[]).await.unwrap();
        let st = client.get_state().await.unwrap();
        assert_eq!(st["tec_at_setpoint"], json!(true));
        assert_eq!(conn.device("cam").unwrap().called("startup"), 1);
    }

    #[tokio::test]
    async fn unreachable_devices_refuse_and_break_clients() {
        let conn = MockConnector::new();
        let dev = MockDevice::new();
        conn.add("pdu", dev.clone());
        let client = conn.connect("pdu").await.unwrap();
        dev.set_reachable(false);
        assert!(matches!(client.get_state().await, Err(ProxyError::Transport(_))));
        assert!(matches!(conn.connect("pdu").await, Err(ProxyError::Connect { .. })));
        assert!(matches!(conn.connect("ghost").await, Err(ProxyError::Connect { .. })));
        assert_eq!(dev.connects(), 2);
    }
}
