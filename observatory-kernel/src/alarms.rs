//! Alarm decoding and rate-limited delivery.
//!
//! Hardware alarm words (chiller, PDU...) are decoded bit by bit through the
//! configured rule table. Records are recomputed on every watchdog tick and
//! never persisted; operators are told through the alert sink, at most once
//! per `alerts.min_interval_s` for each condition.

use crate::alerts::{AlertSink, AlertThrottle};
use crate::config::{AlarmRule, AlertsConf};
use crate::state::{value_is_truthy, StateSnapshot};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlarmRecord {
    pub subsystem: String,
    pub field: String,
    pub condition: String,
    pub active: bool,
}

impl AlarmRecord {
    fn key(&self) -> String {
        format!("{}.{}:{}", self.subsystem, self.field, self.condition)
    }
}

/// Parses an alarm word reported as an integer, a float holding an
/// integer, or a decimal/`0x` hex string.
pub fn parse_alarm_word(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64().or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        Value::String(s) => {
            let s = s.trim();
            match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                Some(hex) => u64::from_str_radix(hex, 16).ok(),
                None => s.parse().ok(),
            }
        }
        _ => None,
    }
}

fn rule_active(rule: &AlarmRule, value: Option<&Value>) -> bool {
    let Some(value) = value else { return false };
    match rule.bit {
        Some(bit) if bit < 64 => parse_alarm_word(value).map(|w| w & (1u64 << bit) != 0).unwrap_or(false),
        Some(_) => false,
        None => value_is_truthy(value),
    }
}

pub fn decode_alarms(rules: &[AlarmRule], snapshot: &StateSnapshot) -> Vec<AlarmRecord> {
    rules
        .iter()
        .map(|rule| AlarmRecord {
            subsystem: rule.subsystem.clone(),
            field: rule.field.clone(),
            condition: rule.condition.clone(),
            active: rule_active(rule, snapshot.field(&rule.subsystem, &rule.field)),
        })
        .collect()
}

pub struct AlarmEvaluator {
    rules: Vec<AlarmRule>,
    alerts: AlertsConf,
    throttle: AlertThrottle,
    previously_active: HashMap<String, bool>,
}

impl AlarmEvaluator {
    pub fn new(rules: Vec<AlarmRule>, alerts: AlertsConf) -> Self {
        let throttle = AlertThrottle::new(alerts.min_interval_s);
        Self { rules, alerts, throttle, previously_active: HashMap::new() }
    }

    /// Recomputes every record and delivers the alerts that are due.
    /// Returns the fresh records.
    pub async fn evaluate(&mut self, snapshot: &StateSnapshot, now: f64, sink: &dyn AlertSink) -> Vec<AlarmRecord> {
        let records = decode_alarms(&self.rules, snapshot);
        for rec in &records {
            let key = rec.key();
            let was_active = self.previously_active.insert(key.clone(), rec.active).unwrap_or(false);
            let message = if rec.active {
                if !self.throttle.allow(&key, now) {
                    continue;
                }
                format!("ALARM {}: {} ({})", rec.subsystem, rec.condition, rec.field)
            } else if was_active {
                // clears have their own window; the alarm's keeps running
                if !self.throttle.allow(&format!("{key}:cleared"), now) {
                    continue;
                }
                format!("cleared {}: {} ({})", rec.subsystem, rec.condition, rec.field)
            } else {
                continue;
            };
            info!("[alarms] {message}");
            if let Err(e) = sink.post(&self.alerts.group, &message).await {
                warn!("[alarms] alert delivery failed: {e}");
            }
        }
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::AlertError;
    use crate::state::SubsystemState;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::{json, Map};
    use std::collections::BTreeMap;

    #[derive(Default)]
    struct Collect(Mutex<Vec<String>>);

    #[async_trait]
    impl AlertSink for Collect {
        async fn post(&self, _group: &str, message: &str) -> Result<(), AlertError> {
            self.0.lock().push(message.to_string());
            Ok(())
        }
        async fn send_email(&self, _r: &[String], subject: &str, _b: &str) -> Result<(), AlertError> {
            self.0.lock().push(subject.to_string());
            Ok(())
        }
    }

    fn rules() -> Vec<AlarmRule> {
        vec![
            AlarmRule { subsystem: "chiller".into(), field: "alarm_word".into(), bit: Some(0), condition: "low flow".into() },
            AlarmRule { subsystem: "chiller".into(), field: "alarm_word".into(), bit: Some(3), condition: "low coolant".into() },
            AlarmRule { subsystem: "pdu".into(), field: "overcurrent".into(), bit: None, condition: "overcurrent".into() },
        ]
    }

    fn snapshot(word: Value, overcurrent: Value) -> StateSnapshot {
        let mut snap = StateSnapshot::default();
        let mut chiller = SubsystemState::with_defaults("chiller", &BTreeMap::new());
        let mut m = Map::new();
        m.insert("alarm_word".into(), word);
        chiller.merge(m, 0.0);
        let mut pdu = SubsystemState::with_defaults("pdu", &BTreeMap::new());
        let mut m = Map::new();
        m.insert("overcurrent".into(), overcurrent);
        pdu.merge(m, 0.0);
        snap.subsystems.insert("chiller".into(), chiller);
        snap.subsystems.insert("pdu".into(), pdu);
        snap
    }

    #[test]
    fn alarm_words_parse_hex_and_decimal() {
        assert_eq!(parse_alarm_word(&json!("0x0008")), Some(8));
        assert_eq!(parse_alarm_word(&json!("12")), Some(12));
        assert_eq!(parse_alarm_word(&json!(9)), Some(9));
        assert_eq!(parse_alarm_word(&json!("garbage")), None);
    }

    #[test]
    fn bits_decode_to_conditions() {
        let recs = decode_alarms(&rules(), &snapshot(json!("0x08"), json!(false)));
        let active: Vec<_> = recs.iter().filter(|r| r.active).map(|r| r.condition.as_str()).collect();
        assert_eq!(active, vec!["low coolant"]);
        assert_eq!(recs.len(), 3);
    }

    #[test]
    fn missing_fields_are_inactive() {
        let recs = decode_alarms(&rules(), &StateSnapshot::default());
        assert!(recs.iter().all(|r| !r.active));
    }

    #[tokio::test]
    async fn alerts_are_rate_limited_and_cleared_once() {
        let sink = Collect::default();
        let conf = AlertsConf { min_interval_s: 60.0, ..AlertsConf::default() };
        let mut eval = AlarmEvaluator::new(rules(), conf);
        let bad = snapshot(json!(1), json!(false));
        let good = snapshot(json!(0), json!(false));

        eval.evaluate(&bad, 0.0, &sink).await;
        eval.evaluate(&bad, 10.0, &sink).await;
        eval.evaluate(&bad, 59.0, &sink).await;
        assert_eq!(sink.0.lock().len(), 1);
        eval.evaluate(&bad, 61.0, &sink).await;
        assert_eq!(sink.0.lock().len(), 2);

        eval.evaluate(&good, 62.0, &sink).await;
        eval.evaluate(&good, 63.0, &sink).await;
        let msgs = sink.0.lock().clone();
        assert_eq!(msgs.len(), 3);
        assert!(msgs[2].starts_with("cleared chiller: low flow"));
    }

    #[tokio::test]
    async fn flapping_alarm_stays_within_the_interval() {
        let sink = Collect::default();
        let conf = AlertsConf { min_interval_s: 600.0, ..AlertsConf::default() };
        let mut eval = AlarmEvaluator::new(rules(), conf);
        let bad = snapshot(json!(1), json!(false));
        let good = snapshot(json!(0), json!(false));

        for i in 0..10 {
            let snap = if i % 2 == 0 { &bad } else { &good };
            eval.evaluate(snap, i as f64 * 5.0, &sink).await;
        }
        let msgs = sink.0.lock().clone();
        assert_eq!(msgs.len(), 2, "{msgs:?}");
        assert!(msgs[0].starts_with("ALARM chiller: low flow"));
        assert!(msgs[1].starts_with("cleared chiller: low flow"));

        eval.evaluate(&bad, 601.0, &sink).await;
        assert_eq!(sink.0.lock().len(), 3);
    }
}
