//! Alert delivery seam.
//!
//! The core only ever calls `post` and `send_email`; formatting and the
//! actual transport (Slack, SMTP...) live behind the bus in external relays.

use async_trait::async_trait;
use rumqttc::{AsyncClient, QoS};
use serde::Serialize;
use std::collections::HashMap;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum AlertError {
    #[error("alert transport failed: {0}")]
    Transport(String),
    #[error("alert payload encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn post(&self, group: &str, message: &str) -> Result<(), AlertError>;
    async fn send_email(&self, recipients: &[String], subject: &str, body: &str) -> Result<(), AlertError>;
}

/// Writes alerts to the log only. Used on benches without a relay.
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn post(&self, group: &str, message: &str) -> Result<(), AlertError> {
        warn!("[alert] @{group}: {message}");
        Ok(())
    }

    async fn send_email(&self, recipients: &[String], subject: &str, body: &str) -> Result<(), AlertError> {
        warn!("[alert] email to {:?}: {subject} | {body}", recipients);
        Ok(())
    }
}

#[derive(Serialize)]
struct PostMessage<'a> {
    group: &'a str,
    message: &'a str,
}

#[derive(Serialize)]
struct EmailMessage<'a> {
    recipients: &'a [String],
    subject: &'a str,
    body: &'a str,
}

pub const ALERT_POST_TOPIC: &str = "observatory/alerts/post@v1";
pub const ALERT_EMAIL_TOPIC: &str = "observatory/alerts/email@v1";

/// Publishes alerts on the bus for the relay daemons.
pub struct BusAlertSink {
    client: AsyncClient,
}

impl BusAlertSink {
    pub fn new(client: AsyncClient) -> Self {
        Self { client }
    }

    async fn publish(&self, topic: &str, payload: String) -> Result<(), AlertError> {
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| AlertError::Transport(e.to_string()))
    }
}

#[async_trait]
impl AlertSink for BusAlertSink {
    async fn post(&self, group: &str, message: &str) -> Result<(), AlertError> {
        let payload = serde_json::to_string(&PostMessage { group, message })?;
        self.publish(ALERT_POST_TOPIC, payload).await
    }

    async fn send_email(&self, recipients: &[String], subject: &str, body: &str) -> Result<(), AlertError> {
        let payload = serde_json::to_string(&EmailMessage { recipients, subject, body })?;
        self.publish(ALERT_EMAIL_TOPIC, payload).await
    }
}

/// At most one delivery per key every `min_interval_s`.
#[derive(Debug)]
pub struct AlertThrottle {
    min_interval_s: f64,
    last_sent: HashMap<String, f64>,
}

impl AlertThrottle {
    pub fn new(min_interval_s: f64) -> Self {
        Self { min_interval_s, last_sent: HashMap::new() }
    }

    pub fn allow(&mut self, key: &str, now: f64) -> bool {
        match self.last_sent.get(key) {
            Some(last) if now - last < self.min_interval_s => false,
            _ => {
                self.last_sent.insert(key.to_string(), now);
                true
            }
        }
    }
}
