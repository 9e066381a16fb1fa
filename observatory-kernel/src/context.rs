/**
 * OBSERVATORY CONTEXT - Shared services injected into every component
 *
 * ROLE:
 * Built once at startup and handed out by `Arc`. Replaces module-level
 * globals: configuration, clock, alert sink, the telemetry snapshot
 * registry, the weather safety flag and the latest alarm records.
 */

use crate::alarms::AlarmRecord;
use crate::alerts::AlertSink;
use crate::config::ObservatoryConfig;
use crate::health::HealthTracker;
use crate::models::{datetime_to_unix, unix_to_mjd};
use crate::state::{new_registry, new_state, Shared, SnapshotRegistry, StateSnapshot};
use parking_lot::Mutex;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::watch;

pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;

    fn unix(&self) -> f64 {
        datetime_to_unix(self.now())
    }

    fn mjd(&self) -> f64 {
        unix_to_mjd(self.unix())
    }
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// Manually driven clock for tests and replays.
pub struct FixedClock {
    now: Mutex<OffsetDateTime>,
}

impl FixedClock {
    pub fn at_unix(unix: i64) -> Self {
        let now = OffsetDateTime::from_unix_timestamp(unix).unwrap_or(OffsetDateTime::UNIX_EPOCH);
        Self { now: Mutex::new(now) }
    }

    pub fn set(&self, t: OffsetDateTime) {
        *self.now.lock() = t;
    }

    pub fn advance_secs(&self, secs: f64) {
        let mut now = self.now.lock();
        *now += time::Duration::seconds_f64(secs);
    }
}

impl Clock for FixedClock {
    fn now(&self) -> OffsetDateTime {
        *self.now.lock()
    }
}

/// Weather/dome safety flag written by the external safety collaborator.
/// `true` means safe to observe.
#[derive(Clone)]
pub struct SafetyFlag {
    tx: Arc<watch::Sender<bool>>,
}

impl SafetyFlag {
    pub fn new(initial: bool) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    pub fn set(&self, safe: bool) {
        self.tx.send_if_modified(|cur| {
            if *cur == safe {
                false
            } else {
                *cur = safe;
                true
            }
        });
    }

    pub fn is_safe(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

pub struct ObservatoryContext {
    pub config: ObservatoryConfig,
    pub clock: Arc<dyn Clock>,
    pub alerts: Arc<dyn AlertSink>,
    pub snapshots: SnapshotRegistry,
    pub safety: SafetyFlag,
    pub alarms: Shared<Vec<AlarmRecord>>,
    pub health: HealthTracker,
}

impl ObservatoryContext {
    pub fn new(config: ObservatoryConfig, clock: Arc<dyn Clock>, alerts: Arc<dyn AlertSink>) -> Self {
        Self {
            config,
            clock,
            alerts,
            snapshots: new_registry(),
            // Unsafe until the safety collaborator says otherwise.
            safety: SafetyFlag::new(false),
            alarms: new_state(Vec::new()),
            health: HealthTracker::new(),
        }
    }

    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot::capture(&self.snapshots)
    }

    /// Sun altitude as published by the ephemeris collaborator, if any.
    pub fn sun_altitude(&self) -> Option<f64> {
        let site = &self.config.site;
        self.snapshots
            .lock()
            .get(&site.sun_subsystem)
            .and_then(|s| s.get_f64(&site.sun_alt_field))
    }

    pub fn is_dark(&self) -> bool {
        self.sun_altitude()
            .map(|alt| alt < self.config.site.sun_alt_threshold_deg)
            .unwrap_or(false)
    }
}
