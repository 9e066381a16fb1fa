/**
 * SUBSYSTEM WORKER - One task per subsystem, single writer of its state
 *
 * ROLE:
 * Owns a `SubsystemProxy`, polls it on its own interval and drains the
 * subsystem's bounded command queue. Commands from the state machines, the
 * command server and the schedule executor all funnel through this queue,
 * so one device never sees concurrent calls.
 *
 * OPERATION:
 * - `tokio::select!` between the poll interval and the command queue
 * - After every poll the bucket is published into the snapshot registry
 * - Connection edges are logged once, not on every failed tick
 * - The task ends when every `SubsystemHandle` has been dropped
 */

use crate::proxy::{PollOutcome, ProxyError, SubsystemProxy};
use crate::state::SnapshotRegistry;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

#[derive(Debug)]
pub struct WorkerCommand {
    pub action: String,
    pub args: Vec<Value>,
    pub reply: Option<oneshot::Sender<Result<Value, ProxyError>>>,
}

/// Cloneable sender side of a subsystem's command queue.
#[derive(Debug, Clone)]
pub struct SubsystemHandle {
    name: String,
    tx: mpsc::Sender<WorkerCommand>,
}

impl SubsystemHandle {
    /// Handle plus the raw receiving end, for components that drain the
    /// queue themselves.
    pub fn channel(name: &str, depth: usize) -> (Self, mpsc::Receiver<WorkerCommand>) {
        let (tx, rx) = mpsc::channel(depth.max(1));
        (Self { name: name.to_string(), tx }, rx)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn enqueue(&self, cmd: WorkerCommand) -> Result<(), ProxyError> {
        self.tx.try_send(cmd).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ProxyError::QueueFull(self.name.clone()),
            mpsc::error::TrySendError::Closed(_) => ProxyError::WorkerStopped(self.name.clone()),
        })
    }

    /// Fire-and-forget enqueue. Never waits: a full queue is an error.
    pub fn submit(&self, action: &str, args: Vec<Value>) -> Result<(), ProxyError> {
        self.enqueue(WorkerCommand { action: action.to_string(), args, reply: None })
    }

    /// Enqueues without waiting and hands back the receiver the daemon's
    /// answer will arrive on. The caller polls it later.
    pub fn submit_tracked(
        &self,
        action: &str,
        args: Vec<Value>,
    ) -> Result<oneshot::Receiver<Result<Value, ProxyError>>, ProxyError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.enqueue(WorkerCommand { action: action.to_string(), args, reply: Some(reply_tx) })?;
        Ok(reply_rx)
    }

    /// Enqueues and waits for the daemon's answer, bounded by `wait`.
    pub async fn request(&self, action: &str, args: Vec<Value>, wait: Duration) -> Result<Value, ProxyError> {
        let reply_rx = self.submit_tracked(action, args)?;
        match timeout(wait, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ProxyError::WorkerStopped(self.name.clone())),
            Err(_) => Err(ProxyError::Timeout { daemon: self.name.clone(), ms: wait.as_millis() as u64 }),
        }
    }
}

fn publish(proxy: &SubsystemProxy, registry: &SnapshotRegistry) {
    registry.lock().insert(proxy.name().to_string(), proxy.state().clone());
}

pub fn spawn_subsystem_worker(
    mut proxy: SubsystemProxy,
    poll_interval: Duration,
    queue_depth: usize,
    registry: SnapshotRegistry,
) -> (SubsystemHandle, JoinHandle<()>) {
    let (handle, mut rx) = SubsystemHandle::channel(proxy.name(), queue_depth);
    publish(&proxy, &registry);

    let task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(poll_interval.max(Duration::from_millis(1)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut was_connected = false;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let outcome = proxy.update_state().await;
                    match &outcome {
                        PollOutcome::Refreshed => {}
                        PollOutcome::Reconnected => info!("[{}] connected to daemon", proxy.name()),
                        PollOutcome::ConnectFailed(e) => debug!("[{}] connect failed: {e}", proxy.name()),
                        PollOutcome::PollFailed(e) => debug!("[{}] poll failed: {e}", proxy.name()),
                    }
                    let connected = proxy.state().is_connected;
                    if was_connected && !connected {
                        warn!("[{}] lost connection to daemon", proxy.name());
                    }
                    was_connected = connected;
                    publish(&proxy, &registry);
                }
                cmd = rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    let result = proxy.send(&cmd.action, &cmd.args).await;
                    match &result {
                        Ok(_) => debug!("[{}] {} ok", proxy.name(), cmd.action),
                        Err(e) => warn!("[{}] {} failed: {e}", proxy.name(), cmd.action),
                    }
                    if let Some(reply) = cmd.reply {
                        let _ = reply.send(result);
                    }
                    publish(&proxy, &registry);
                }
            }
        }
        debug!("[{}] worker stopped", proxy.name());
    });

    (handle, task)
}
