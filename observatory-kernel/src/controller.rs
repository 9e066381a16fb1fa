/**
 * DEVICE STATE MACHINE - Lifecycle of one camera
 *
 * ROLE:
 * OFF → STARTING → READY ↔ OBSERVING → WARMING → OFF, driven by named
 * triggers. Every enter/exit action enqueues exactly one idempotent daemon
 * command on the subsystem's queue.
 *
 * OPERATION:
 * - Transitions come from the static `TRANSITIONS` table
 * - A trigger not valid for the current state is ignored: no state change,
 *   no command issued
 * - Guards read the published `SubsystemState` only
 * - If an action cannot be enqueued the controller stays put; the next tick
 *   or a retry fires the trigger again
 * - Issued actions stay pending until the worker answers. `settle` reverts
 *   to the pre-transition state when the daemon refused or never ran one,
 *   so a camera whose startup failed is back in OFF and gets restarted
 * - Every state change is reported on the master's event channel
 */

use crate::config::DeviceCommands;
use crate::proxy::ProxyError;
use crate::state::SnapshotRegistry;
use crate::worker::SubsystemHandle;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceState {
    Off,
    Starting,
    Ready,
    Observing,
    Warming,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceState::Off => "OFF",
            DeviceState::Starting => "STARTING",
            DeviceState::Ready => "READY",
            DeviceState::Observing => "OBSERVING",
            DeviceState::Warming => "WARMING",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceTrigger {
    Startup,
    BootOk,
    BeginObs,
    EndObs,
    Warm,
    CoolOff,
}

impl DeviceTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceTrigger::Startup => "startup",
            DeviceTrigger::BootOk => "boot_ok",
            DeviceTrigger::BeginObs => "begin_obs",
            DeviceTrigger::EndObs => "end_obs",
            DeviceTrigger::Warm => "warm",
            DeviceTrigger::CoolOff => "cool_off",
        }
    }
}

impl FromStr for DeviceTrigger {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "startup" => Ok(DeviceTrigger::Startup),
            "boot_ok" => Ok(DeviceTrigger::BootOk),
            "begin_obs" => Ok(DeviceTrigger::BeginObs),
            "end_obs" => Ok(DeviceTrigger::EndObs),
            "warm" => Ok(DeviceTrigger::Warm),
            "cool_off" => Ok(DeviceTrigger::CoolOff),
            other => Err(format!("unknown device trigger {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Guard {
    Always,
    /// `cooled_and_stable`: the ready field is truthy.
    CooledAndStable,
    WarmedUp,
}

struct Transition {
    trigger: DeviceTrigger,
    from: &'static [DeviceState],
    to: DeviceState,
    guard: Guard,
}

use DeviceState::*;

const TRANSITIONS: &[Transition] = &[
    Transition { trigger: DeviceTrigger::Startup, from: &[Off], to: Starting, guard: Guard::Always },
    Transition { trigger: DeviceTrigger::BootOk, from: &[Starting], to: Ready, guard: Guard::CooledAndStable },
    Transition { trigger: DeviceTrigger::BeginObs, from: &[Ready], to: Observing, guard: Guard::Always },
    Transition { trigger: DeviceTrigger::EndObs, from: &[Observing], to: Ready, guard: Guard::Always },
    Transition { trigger: DeviceTrigger::Warm, from: &[Ready, Observing], to: Warming, guard: Guard::Always },
    Transition { trigger: DeviceTrigger::CoolOff, from: &[Warming], to: Off, guard: Guard::WarmedUp },
];

#[derive(Debug, Clone, PartialEq)]
pub enum FireOutcome {
    Transitioned { from: DeviceState, to: DeviceState },
    /// No transition for this trigger in the current state.
    Invalid,
    GuardFailed,
    /// An action could not be enqueued; state unchanged.
    Blocked(ProxyError),
}

impl FireOutcome {
    pub fn changed(&self) -> bool {
        matches!(self, FireOutcome::Transitioned { .. })
    }
}

/// Sent to the master on every state change.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceEvent {
    pub subsystem: String,
    pub from: DeviceState,
    pub to: DeviceState,
    pub trigger: DeviceTrigger,
}

/// Commands of one transition still waiting for the worker's answer.
struct PendingActions {
    from: DeviceState,
    trigger: DeviceTrigger,
    replies: Vec<(String, oneshot::Receiver<Result<Value, ProxyError>>)>,
}

impl PendingActions {
    /// Drops answered commands and returns the first failure, if any.
    fn collect(&mut self, subsystem: &str) -> Option<(String, ProxyError)> {
        let mut failed = None;
        self.replies.retain_mut(|(action, rx)| match rx.try_recv() {
            Ok(Ok(_)) => false,
            Ok(Err(e)) => {
                failed.get_or_insert((action.clone(), e));
                false
            }
            Err(oneshot::error::TryRecvError::Empty) => true,
            Err(oneshot::error::TryRecvError::Closed) => {
                failed.get_or_insert((action.clone(), ProxyError::WorkerStopped(subsystem.to_string())));
                false
            }
        });
        failed
    }
}

pub struct SubsystemController {
    name: String,
    state: DeviceState,
    handle: SubsystemHandle,
    commands: DeviceCommands,
    snapshots: SnapshotRegistry,
    events: mpsc::UnboundedSender<DeviceEvent>,
    pending: Vec<PendingActions>,
}

impl SubsystemController {
    pub fn new(
        handle: SubsystemHandle,
        commands: DeviceCommands,
        snapshots: SnapshotRegistry,
        events: mpsc::UnboundedSender<DeviceEvent>,
    ) -> Self {
        Self {
            name: handle.name().to_string(),
            state: DeviceState::Off,
            handle,
            commands,
            snapshots,
            events,
            pending: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    fn field_truthy(&self, field: &str) -> bool {
        self.snapshots.lock().get(&self.name).map(|s| s.is_truthy(field)).unwrap_or(false)
    }

    pub fn cooled_and_stable(&self) -> bool {
        self.field_truthy(&self.commands.ready_field)
    }

    fn guard_passes(&self, guard: Guard) -> bool {
        match guard {
            Guard::Always => true,
            Guard::CooledAndStable => self.cooled_and_stable(),
            Guard::WarmedUp => self.field_truthy(&self.commands.warmed_field),
        }
    }

    /// Commands issued when leaving `from` for `to`, exit action first.
    fn actions(&self, trigger: DeviceTrigger, from: DeviceState, to: DeviceState) -> Vec<String> {
        let mut out = Vec::new();
        if from == Observing && to != Observing {
            out.push(self.commands.flush.clone());
        }
        match to {
            Starting if trigger == DeviceTrigger::Startup => out.push(self.commands.startup.clone()),
            Observing => out.push(self.commands.observing_defaults.clone()),
            Warming => out.push(self.commands.stop_cooling.clone()),
            _ => {}
        }
        out
    }

    /// Whether commands from an earlier transition are still unanswered.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn fire(&mut self, trigger: DeviceTrigger) -> FireOutcome {
        let Some(t) = TRANSITIONS
            .iter()
            .find(|t| t.trigger == trigger && t.from.contains(&self.state))
        else {
            debug!("[{}] ignoring {} in {}", self.name, trigger.as_str(), self.state);
            return FireOutcome::Invalid;
        };
        if !self.guard_passes(t.guard) {
            debug!("[{}] guard blocked {} in {}", self.name, trigger.as_str(), self.state);
            return FireOutcome::GuardFailed;
        }

        let from = self.state;
        let mut replies = Vec::new();
        for action in self.actions(trigger, from, t.to) {
            match self.handle.submit_tracked(&action, Vec::new()) {
                Ok(rx) => replies.push((action, rx)),
                Err(e) => {
                    warn!("[{}] {} not issued, staying {}: {e}", self.name, action, from);
                    return FireOutcome::Blocked(e);
                }
            }
        }
        if !replies.is_empty() {
            self.pending.push(PendingActions { from, trigger, replies });
        }

        self.move_to(t.to, trigger);
        FireOutcome::Transitioned { from, to: t.to }
    }

    fn move_to(&mut self, to: DeviceState, trigger: DeviceTrigger) {
        let from = self.state;
        self.state = to;
        info!("[{}] {} -> {} ({})", self.name, from, to, trigger.as_str());
        let _ = self.events.send(DeviceEvent {
            subsystem: self.name.clone(),
            from,
            to,
            trigger,
        });
    }

    /// Checks the answers to issued commands. When one failed, the
    /// transition that issued it is undone along with every later one and
    /// the error is returned.
    pub fn settle(&mut self) -> Option<ProxyError> {
        for i in 0..self.pending.len() {
            let Some((action, err)) = self.pending[i].collect(&self.name) else {
                continue;
            };
            let PendingActions { from, trigger, .. } = self.pending.remove(i);
            self.pending.truncate(i);
            self.pending.retain(|p| !p.replies.is_empty());
            warn!("[{}] {} failed ({err}), back to {}", self.name, action, from);
            self.move_to(from, trigger);
            return Some(err);
        }
        self.pending.retain(|p| !p.replies.is_empty());
        None
    }
}
