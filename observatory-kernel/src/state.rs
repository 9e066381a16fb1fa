/**
 * SUBSYSTEM STATE - Telemetry buckets and aggregated snapshot
 *
 * ROLE:
 * Each managed subsystem owns one `SubsystemState`: the last known value of
 * every field reported by its daemon, with the time that field was last
 * refreshed. Only the subsystem worker writes it; everyone else reads the
 * copy published into the shared `SnapshotRegistry`.
 *
 * OPERATION:
 * - Created with configured defaults (never refreshed, no timestamp)
 * - `merge()` overwrites the keys a successful poll returned
 * - A failed poll only flips `is_connected`: known values stay in place
 * - `StateSnapshot` flattens every bucket into `<subsystem>.<field>` keys,
 *   each paired with `<subsystem>.<field>_timestamp`, and exposes the
 *   timestamps the watchdog measures
 */

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

pub type Shared<T> = Arc<Mutex<T>>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}

/// One telemetry field: its value and the unix time it was last refreshed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldValue {
    pub value: Value,
    pub updated: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubsystemState {
    pub name: String,
    pub is_connected: bool,
    /// Unix time of the last successful poll.
    pub last_refresh: Option<f64>,
    pub fields: BTreeMap<String, FieldValue>,
}

impl SubsystemState {
    pub fn with_defaults(name: &str, defaults: &BTreeMap<String, Value>) -> Self {
        let fields = defaults
            .iter()
            .map(|(k, v)| (k.clone(), FieldValue { value: v.clone(), updated: None }))
            .collect();
        Self {
            name: name.to_string(),
            is_connected: false,
            last_refresh: None,
            fields,
        }
    }

    /// Overwrites every key returned by the daemon. Keys absent from `remote`
    /// keep their previous value and timestamp.
    pub fn merge(&mut self, remote: Map<String, Value>, now: f64) {
        for (key, value) in remote {
            self.fields.insert(key, FieldValue { value, updated: Some(now) });
        }
        self.is_connected = true;
        self.last_refresh = Some(now);
    }

    pub fn mark_disconnected(&mut self) {
        self.is_connected = false;
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field).map(|f| &f.value)
    }

    pub fn get_f64(&self, field: &str) -> Option<f64> {
        self.get(field).and_then(value_as_f64)
    }

    pub fn is_truthy(&self, field: &str) -> bool {
        self.get(field).map(value_is_truthy).unwrap_or(false)
    }
}

pub fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Unix seconds from a number, a numeric string or an RFC 3339 string.
pub fn value_as_unix(value: &Value) -> Option<f64> {
    if let Some(t) = value_as_f64(value).filter(|_| !value.is_boolean()) {
        return Some(t);
    }
    let s = value.as_str()?;
    OffsetDateTime::parse(s.trim(), &Rfc3339)
        .ok()
        .map(|dt| dt.unix_timestamp() as f64 + f64::from(dt.nanosecond()) / 1e9)
}

/// Daemons report flags as bools, 0/1 integers or strings depending on the
/// hardware family.
pub fn value_is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|x| x != 0.0).unwrap_or(false),
        Value::String(s) => matches!(s.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        _ => false,
    }
}

pub type SnapshotRegistry = Shared<BTreeMap<String, SubsystemState>>;

pub fn new_registry() -> SnapshotRegistry {
    new_state(BTreeMap::new())
}

/// Read-only copy of every subsystem bucket at one instant.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StateSnapshot {
    pub subsystems: BTreeMap<String, SubsystemState>,
}

impl StateSnapshot {
    pub fn capture(registry: &SnapshotRegistry) -> Self {
        Self { subsystems: registry.lock().clone() }
    }

    pub fn subsystem(&self, name: &str) -> Option<&SubsystemState> {
        self.subsystems.get(name)
    }

    pub fn field(&self, subsystem: &str, field: &str) -> Option<&Value> {
        self.subsystems.get(subsystem).and_then(|s| s.get(field))
    }

    /// Every timestamp the watchdog measures:
    /// - `<subsystem>_timestamp`: last successful poll of that subsystem
    /// - `<subsystem>.<field>_timestamp`: last refresh of each field the
    ///   daemon has reported at least once (configured defaults are left out)
    /// - `<subsystem>.<field>`: daemon-reported fields whose name contains
    ///   `timestamp`, holding unix seconds or an RFC 3339 time. Values that
    ///   parse as neither are left out; see `unreadable_timestamps`
    pub fn timestamps(&self) -> Vec<(String, Option<f64>)> {
        let mut out = Vec::new();
        for (name, st) in &self.subsystems {
            out.push((format!("{name}_timestamp"), st.last_refresh));
            for (field, fv) in &st.fields {
                if fv.updated.is_some() {
                    out.push((format!("{name}.{field}_timestamp"), fv.updated));
                }
                if field.contains("timestamp") {
                    if let Some(t) = value_as_unix(&fv.value) {
                        out.push((format!("{name}.{field}"), Some(t)));
                    }
                }
            }
        }
        out
    }

    /// Daemon `*timestamp` fields whose value is not a readable time.
    pub fn unreadable_timestamps(&self) -> Vec<String> {
        self.subsystems
            .iter()
            .flat_map(|(name, st)| {
                st.fields
                    .iter()
                    .filter(|(field, fv)| field.contains("timestamp") && value_as_unix(&fv.value).is_none())
                    .map(move |(field, _)| format!("{name}.{field}"))
            })
            .collect()
    }

    /// Flat `<subsystem>.<field>` view used by the command server and HTTP
    /// API, with `<subsystem>.<field>_timestamp` next to every field (null
    /// until the daemon first reports it).
    pub fn flatten(&self) -> Map<String, Value> {
        let mut out = Map::new();
        for (name, st) in &self.subsystems {
            out.insert(format!("{name}.is_connected"), Value::Bool(st.is_connected));
            for (field, fv) in &st.fields {
                let updated = fv.updated.map(Value::from).unwrap_or(Value::Null);
                out.entry(format!("{name}.{field}_timestamp")).or_insert(updated);
                out.insert(format!("{name}.{field}"), fv.value.clone());
            }
        }
        out
    }

    pub fn connected_count(&self) -> usize {
        self.subsystems.values().filter(|s| s.is_connected).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn defaults() -> BTreeMap<String, Value> {
        let mut d = BTreeMap::new();
        d.insert("tec_temp".to_string(), json!(-888));
        d.insert("tec_at_setpoint".to_string(), json!(false));
        d
    }

    #[test]
    fn starts_from_defaults_without_timestamps() {
        let st = SubsystemState::with_defaults("camera", &defaults());
        assert!(!st.is_connected);
        assert_eq!(st.get_f64("tec_temp"), Some(-888.0));
        assert_eq!(st.fields["tec_temp"].updated, None);
        assert_eq!(st.last_refresh, None);
    }

    #[test]
    fn merge_overwrites_returned_keys_only() {
        let mut st = SubsystemState::with_defaults("camera", &defaults());
        let mut remote = Map::new();
        remote.insert("tec_temp".into(), json!(-20.5));
        st.merge(remote, 100.0);

        assert!(st.is_connected);
        assert_eq!(st.get_f64("tec_temp"), Some(-20.5));
        assert_eq!(st.fields["tec_temp"].updated, Some(100.0));
        assert_eq!(st.get("tec_at_setpoint"), Some(&json!(false)));
        assert_eq!(st.fields["tec_at_setpoint"].updated, None);
    }

    #[test]
    fn disconnect_keeps_known_values() {
        let mut st = SubsystemState::with_defaults("camera", &defaults());
        let mut remote = Map::new();
        remote.insert("tec_temp".into(), json!(-20.5));
        st.merge(remote, 100.0);
        st.mark_disconnected();
        st.mark_disconnected();

        assert!(!st.is_connected);
        assert_eq!(st.get_f64("tec_temp"), Some(-20.5));
        assert_eq!(st.last_refresh, Some(100.0));
    }

    #[test]
    fn truthiness_accepts_daemon_flag_encodings() {
        assert!(value_is_truthy(&json!(true)));
        assert!(value_is_truthy(&json!(1)));
        assert!(value_is_truthy(&json!("yes")));
        assert!(!value_is_truthy(&json!(0)));
        assert!(!value_is_truthy(&json!("off")));
        assert!(!value_is_truthy(&Value::Null));
    }

    #[test]
    fn snapshot_lists_poll_and_daemon_timestamps() {
        let registry = new_registry();
        let mut cam = SubsystemState::with_defaults("camera", &BTreeMap::new());
        let mut remote = Map::new();
        remote.insert("image_timestamp".into(), json!(95.0));
        remote.insert("tec_temp".into(), json!(-20));
        cam.merge(remote, 100.0);
        registry.lock().insert("camera".into(), cam);
        registry
            .lock()
            .insert("dome".into(), SubsystemState::with_defaults("dome", &BTreeMap::new()));

        let snap = StateSnapshot::capture(&registry);
        let ts = snap.timestamps();
        assert!(ts.contains(&("camera_timestamp".to_string(), Some(100.0))));
        assert!(ts.contains(&("camera.image_timestamp".to_string(), Some(95.0))));
        assert!(ts.contains(&("camera.tec_temp_timestamp".to_string(), Some(100.0))));
        assert!(ts.contains(&("camera.image_timestamp_timestamp".to_string(), Some(100.0))));
        assert!(ts.contains(&("dome_timestamp".to_string(), None)));
        assert_eq!(ts.len(), 5);

        let flat = snap.flatten();
        assert_eq!(flat["camera.tec_temp"], json!(-20));
        assert_eq!(flat["camera.tec_temp_timestamp"], json!(100.0));
        assert_eq!(flat["dome.is_connected"], json!(false));
        assert_eq!(snap.connected_count(), 1);
    }

    #[test]
    fn defaults_flatten_with_null_timestamps_and_are_not_measured() {
        let mut snap = StateSnapshot::default();
        let mut cam = SubsystemState::with_defaults("camera", &defaults());
        let mut remote = Map::new();
        remote.insert("tec_temp".into(), json!(-20.5));
        cam.merge(remote, 100.0);
        snap.subsystems.insert("camera".into(), cam);

        let flat = snap.flatten();
        assert_eq!(flat["camera.tec_temp_timestamp"], json!(100.0));
        assert_eq!(flat["camera.tec_at_setpoint_timestamp"], Value::Null);
        let keys: Vec<String> = snap.timestamps().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["camera_timestamp", "camera.tec_temp_timestamp"]);
    }

    #[test]
    fn daemon_timestamps_accept_rfc3339() {
        assert_eq!(value_as_unix(&json!("2023-11-14T22:13:20Z")), Some(1_700_000_000.0));
        assert_eq!(value_as_unix(&json!("2023-11-14T23:13:20.5+01:00")), Some(1_700_000_000.5));
        assert_eq!(value_as_unix(&json!(1_700_000_000)), Some(1_700_000_000.0));
        assert_eq!(value_as_unix(&json!("1700000000")), Some(1_700_000_000.0));
        assert_eq!(value_as_unix(&json!("last tuesday")), None);
        assert_eq!(value_as_unix(&json!(true)), None);
        assert_eq!(value_as_unix(&Value::Null), None);

        let mut snap = StateSnapshot::default();
        let mut cam = SubsystemState::with_defaults("camera", &BTreeMap::new());
        let mut remote = Map::new();
        remote.insert("image_timestamp".into(), json!("2023-11-14T22:13:00Z"));
        remote.insert("shutter_timestamp".into(), json!("soon"));
        cam.merge(remote, 1_700_000_000.0);
        snap.subsystems.insert("camera".into(), cam);

        let ts = snap.timestamps();
        assert!(ts.contains(&("camera.image_timestamp".to_string(), Some(1_699_999_980.0))));
        assert!(!ts.iter().any(|(k, _)| k == "camera.shutter_timestamp"));
        assert_eq!(snap.unreadable_timestamps(), vec!["camera.shutter_timestamp"]);
    }
}
