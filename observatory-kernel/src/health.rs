use crate::state::{SnapshotRegistry, StateSnapshot};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Serialize, Deserialize)]
pub struct KernelHealth {
    pub uptime_seconds: u64,
    pub memory_usage_mb: f32,
    pub bus_status: String,
    pub bus_reconnects: u32,
    pub subsystems_connected: u32,
    pub subsystems_total: u32,
    pub observatory_state: String,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    bus_reconnects: Arc<AtomicU32>,
    bus_status: Arc<Mutex<String>>,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            bus_reconnects: Arc::new(AtomicU32::new(0)),
            bus_status: Arc::new(Mutex::new("connecting".to_string())),
        }
    }

    pub fn mark_bus_connected(&self) {
        *self.bus_status.lock() = "connected".to_string();
    }

    pub fn mark_bus_disconnected(&self) {
        *self.bus_status.lock() = "disconnected".to_string();
    }

    pub fn increment_reconnects(&self) {
        self.bus_reconnects.fetch_add(1, Ordering::Relaxed);
        *self.bus_status.lock() = "reconnecting".to_string();
    }

    pub fn bus_status(&self) -> String {
        self.bus_status.lock().clone()
    }

    pub fn get_health(&self, snapshots: &SnapshotRegistry, observatory_state: &str) -> KernelHealth {
        let snap = StateSnapshot::capture(snapshots);
        KernelHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            memory_usage_mb: get_memory_usage_mb(),
            bus_status: self.bus_status(),
            bus_reconnects: self.bus_reconnects.load(Ordering::Relaxed),
            subsystems_connected: snap.connected_count() as u32,
            subsystems_total: snap.subsystems.len() as u32,
            observatory_state: observatory_state.to_string(),
        }
    }
}

fn get_memory_usage_mb() -> f32 {
    #[cfg(target_os = "linux")]
    {
        let pid = std::process::id();
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", pid)) {
            for line in status.lines() {
                if line.starts_with("VmRSS:") {
                    if let Some(kb) = line.split_whitespace().nth(1).and_then(|s| s.parse::<u64>().ok()) {
                        return kb as f32 / 1024.0;
                    }
                }
            }
        }
    }
    0.0
}
