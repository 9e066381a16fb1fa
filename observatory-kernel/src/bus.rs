/**
 * DEVICE BUS - Request/reply RPC to device daemons over MQTT
 *
 * ROLE:
 * Implements `DeviceConnector` / `DeviceClient` on top of one shared MQTT
 * connection. Every daemon listens on `observatory/<daemon>/request@v1` and
 * answers on `observatory/<daemon>/reply@v1`.
 *
 * OPERATION:
 * - Requests carry a uuid `request_id`; the event loop routes replies to the
 *   waiting caller through a pending map of oneshot senders
 * - A caller that gives up (timeout, cancellation) removes its pending entry
 * - Reply topics are re-subscribed after every reconnection
 * - `connect()` is a `ping` round trip, so a dead daemon is reported as a
 *   failed connection rather than a handle that never answers
 */

use crate::config::BusConf;
use crate::health::HealthTracker;
use crate::proxy::{DeviceClient, DeviceConnector, ProxyError};
use crate::state::{new_state, Shared};
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const PING_METHOD: &str = "ping";
pub const GET_STATE_METHOD: &str = "getState";

pub fn request_topic(daemon: &str) -> String {
    format!("observatory/{daemon}/request@v1")
}

pub fn reply_topic(daemon: &str) -> String {
    format!("observatory/{daemon}/reply@v1")
}

/// Daemon name from a request or reply topic.
pub fn daemon_from_topic(topic: &str) -> Option<&str> {
    let rest = topic.strip_prefix("observatory/")?;
    let (daemon, tail) = rest.split_once('/')?;
    matches!(tail, "request@v1" | "reply@v1").then_some(daemon)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusRequest {
    pub request_id: String,
    pub method: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusReply {
    pub request_id: String,
    pub ok: bool,
    #[serde(default)]
    pub result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BusReply {
    pub fn success(request_id: &str, result: Value) -> Self {
        Self { request_id: request_id.to_string(), ok: true, result, error: None }
    }

    pub fn failure(request_id: &str, error: impl Into<String>) -> Self {
        Self { request_id: request_id.to_string(), ok: false, result: Value::Null, error: Some(error.into()) }
    }

    fn into_result(self) -> Result<Value, ProxyError> {
        if self.ok {
            Ok(self.result)
        } else {
            Err(ProxyError::Remote(self.error.unwrap_or_else(|| "unspecified error".into())))
        }
    }
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("mqtt client: {0}")]
    Client(#[from] rumqttc::ClientError),
    #[error("encode: {0}")]
    Encode(#[from] serde_json::Error),
}

impl From<BusError> for ProxyError {
    fn from(e: BusError) -> Self {
        ProxyError::Transport(e.to_string())
    }
}

type Pending = Shared<HashMap<String, oneshot::Sender<BusReply>>>;

/// Removes the pending entry when the caller stops waiting.
struct PendingGuard {
    pending: Pending,
    request_id: String,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.request_id);
    }
}

pub struct BusLink {
    client: AsyncClient,
    pending: Pending,
    reply_topics: Shared<HashSet<String>>,
}

impl BusLink {
    /// Creates the MQTT client and spawns its event loop.
    pub fn start(conf: &BusConf, health: HealthTracker) -> (Arc<Self>, JoinHandle<()>) {
        let mut opts = MqttOptions::new(&conf.client_id, &conf.host, conf.port);
        opts.set_keep_alive(Duration::from_secs(conf.keep_alive_s.max(5)));
        let (client, mut eventloop) = AsyncClient::new(opts, 64);

        let link = Arc::new(Self {
            client,
            pending: new_state(HashMap::new()),
            reply_topics: new_state(HashSet::new()),
        });

        let inner = link.clone();
        let task = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                        info!("[bus] connected");
                        health.mark_bus_connected();
                        inner.resubscribe();
                    }
                    Ok(Event::Incoming(Incoming::Publish(p))) => {
                        match serde_json::from_slice::<BusReply>(&p.payload) {
                            Ok(reply) => inner.route_reply(reply),
                            Err(e) => warn!("[bus] invalid reply on {}: {e}", p.topic),
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("[bus] connection error: {e}");
                        health.mark_bus_disconnected();
                        health.increment_reconnects();
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                }
            }
        });
        (link, task)
    }

    pub fn client(&self) -> AsyncClient {
        self.client.clone()
    }

    fn resubscribe(&self) {
        for topic in self.reply_topics.lock().iter() {
            if let Err(e) = self.client.try_subscribe(topic.as_str(), QoS::AtLeastOnce) {
                warn!("[bus] resubscribe {topic} failed: {e}");
            }
        }
    }

    fn route_reply(&self, reply: BusReply) {
        match self.pending.lock().remove(&reply.request_id) {
            Some(tx) => {
                let _ = tx.send(reply);
            }
            None => debug!("[bus] reply for unknown request {}", reply.request_id),
        }
    }

    async fn ensure_reply_subscription(&self, daemon: &str) -> Result<(), BusError> {
        let topic = reply_topic(daemon);
        let added = self.reply_topics.lock().insert(topic.clone());
        if added {
            if let Err(e) = self.client.subscribe(topic.as_str(), QoS::AtLeastOnce).await {
                self.reply_topics.lock().remove(&topic);
                return Err(e.into());
            }
        }
        Ok(())
    }

    /// Publishes a request and waits for the matching reply. The caller
    /// bounds the wait.
    pub async fn call(&self, daemon: &str, method: &str, args: &[Value]) -> Result<Value, ProxyError> {
        self.ensure_reply_subscription(daemon).await?;

        let request = BusRequest {
            request_id: Uuid::new_v4().to_string(),
            method: method.to_string(),
            args: args.to_vec(),
        };
        let payload = serde_json::to_vec(&request).map_err(BusError::from)?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request.request_id.clone(), tx);
        let _guard = PendingGuard { pending: self.pending.clone(), request_id: request.request_id.clone() };

        self.client
            .publish(request_topic(daemon), QoS::AtLeastOnce, false, payload)
            .await
            .map_err(BusError::from)?;

        match rx.await {
            Ok(reply) => reply.into_result(),
            Err(_) => Err(ProxyError::Transport(format!("reply channel for {daemon} closed"))),
        }
    }
}

pub struct BusConnector {
    link: Arc<BusLink>,
}

impl BusConnector {
    pub fn new(link: Arc<BusLink>) -> Self {
        Self { link }
    }
}

#[async_trait]
impl DeviceConnector for BusConnector {
    async fn connect(&self, daemon: &str) -> Result<Box<dyn DeviceClient>, ProxyError> {
        self.link.call(daemon, PING_METHOD, &[]).await.map_err(|e| ProxyError::Connect {
            daemon: daemon.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Box::new(BusClient { link: self.link.clone(), daemon: daemon.to_string() }))
    }
}

pub struct BusClient {
    link: Arc<BusLink>,
    daemon: String,
}

#[async_trait]
impl DeviceClient for BusClient {
    async fn get_state(&self) -> Result<Map<String, Value>, ProxyError> {
        match self.link.call(&self.daemon, GET_STATE_METHOD, &[]).await? {
            Value::Object(map) => Ok(map),
            other => Err(ProxyError::Remote(format!("getState returned {other}"))),
        }
    }

    async fn call(&self, method: &str, args: &[Value]) -> Result<Value, ProxyError> {
        self.link.call(&self.daemon, method, args).await
    }
}
