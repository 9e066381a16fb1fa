/**
 * MASTER CONTROLLER - Observatory-level state machine
 *
 * ROLE:
 * Composes one `SubsystemController` per camera and drives the night:
 * IDLE → STARTING_CAMERAS → WAITING_FOR_NIGHT → OBSERVING ↔ WEATHER_CLOSURE
 * → SHUTDOWN → IDLE, plus LOCKOUT and ENGINEERING side states.
 *
 * OPERATION:
 * - One actor task owns the controller and handles one trigger at a time
 * - Inputs: explicit triggers (command server), device events, edges of the
 *   safety flag, and a periodic tick that fires the automatic triggers
 *   (boot_ok, all_cams_ready, nighttime, sunrise, cool_off, shutdown_done)
 * - Invalid triggers are ignored; callers re-read the published status
 * - Guards and actions never block: device commands go through the
 *   subsystem queues
 * - At most one camera is OBSERVING at any time
 */

use crate::context::ObservatoryContext;
use crate::controller::{DeviceEvent, DeviceState, DeviceTrigger, FireOutcome, SubsystemController};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ObservatoryState {
    Idle,
    StartingCameras,
    WaitingForNight,
    Observing,
    WeatherClosure,
    Shutdown,
    Lockout,
    Engineering,
}

impl fmt::Display for ObservatoryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ObservatoryState::Idle => "IDLE",
            ObservatoryState::StartingCameras => "STARTING_CAMERAS",
            ObservatoryState::WaitingForNight => "WAITING_FOR_NIGHT",
            ObservatoryState::Observing => "OBSERVING",
            ObservatoryState::WeatherClosure => "WEATHER_CLOSURE",
            ObservatoryState::Shutdown => "SHUTDOWN",
            ObservatoryState::Lockout => "LOCKOUT",
            ObservatoryState::Engineering => "ENGINEERING",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MasterTrigger {
    BeginStartup,
    AllCamsReady,
    Nighttime,
    WeatherBad,
    WeatherGood,
    Sunrise,
    ShutdownDone,
    SwitchCamera(String),
    Lockout,
    Release,
    Engineering,
    ExitEngineering,
}

impl MasterTrigger {
    pub fn name(&self) -> &'static str {
        match self {
            MasterTrigger::BeginStartup => "begin_startup",
            MasterTrigger::AllCamsReady => "all_cams_ready",
            MasterTrigger::Nighttime => "nighttime",
            MasterTrigger::WeatherBad => "weather_bad",
            MasterTrigger::WeatherGood => "weather_good",
            MasterTrigger::Sunrise => "sunrise",
            MasterTrigger::ShutdownDone => "shutdown_done",
            MasterTrigger::SwitchCamera(_) => "switch_camera",
            MasterTrigger::Lockout => "lockout",
            MasterTrigger::Release => "release",
            MasterTrigger::Engineering => "engineering",
            MasterTrigger::ExitEngineering => "exit_engineering",
        }
    }

    pub fn parse(name: &str, arg: Option<&str>) -> Result<Self, String> {
        let t = match name {
            "begin_startup" => MasterTrigger::BeginStartup,
            "all_cams_ready" => MasterTrigger::AllCamsReady,
            "nighttime" => MasterTrigger::Nighttime,
            "weather_bad" => MasterTrigger::WeatherBad,
            "weather_good" => MasterTrigger::WeatherGood,
            "sunrise" => MasterTrigger::Sunrise,
            "shutdown_done" => MasterTrigger::ShutdownDone,
            "switch_camera" => match arg {
                Some(cam) => MasterTrigger::SwitchCamera(cam.to_string()),
                None => return Err("switch_camera needs a camera name".into()),
            },
            "lockout" => MasterTrigger::Lockout,
            "release" => MasterTrigger::Release,
            "engineering" => MasterTrigger::Engineering,
            "exit_engineering" => MasterTrigger::ExitEngineering,
            other => return Err(format!("unknown trigger {other:?}")),
        };
        Ok(t)
    }
}

use ObservatoryState as S;

struct MasterTransition {
    trigger: &'static str,
    from: &'static [ObservatoryState],
    to: ObservatoryState,
}

const ANY_BUT_LOCKOUT: &[ObservatoryState] = &[
    S::Idle,
    S::StartingCameras,
    S::WaitingForNight,
    S::Observing,
    S::WeatherClosure,
    S::Shutdown,
    S::Engineering,
];

const MASTER_TRANSITIONS: &[MasterTransition] = &[
    MasterTransition { trigger: "begin_startup", from: &[S::Idle], to: S::StartingCameras },
    MasterTransition { trigger: "all_cams_ready", from: &[S::StartingCameras], to: S::WaitingForNight },
    MasterTransition { trigger: "nighttime", from: &[S::WaitingForNight], to: S::Observing },
    MasterTransition { trigger: "weather_bad", from: &[S::Observing], to: S::WeatherClosure },
    MasterTransition { trigger: "weather_good", from: &[S::WeatherClosure], to: S::Observing },
    MasterTransition { trigger: "sunrise", from: &[S::Observing, S::WeatherClosure], to: S::Shutdown },
    MasterTransition { trigger: "shutdown_done", from: &[S::Shutdown], to: S::Idle },
    MasterTransition { trigger: "switch_camera", from: &[S::Observing], to: S::Observing },
    MasterTransition { trigger: "lockout", from: ANY_BUT_LOCKOUT, to: S::Lockout },
    MasterTransition { trigger: "release", from: &[S::Lockout], to: S::Idle },
    MasterTransition { trigger: "engineering", from: &[S::Idle], to: S::Engineering },
    MasterTransition { trigger: "exit_engineering", from: &[S::Engineering], to: S::Idle },
];

#[derive(Debug, Clone, PartialEq)]
pub enum MasterOutcome {
    Transitioned { from: ObservatoryState, to: ObservatoryState },
    Invalid { state: ObservatoryState },
    GuardFailed(&'static str),
    ActionFailed(String),
}

impl MasterOutcome {
    pub fn changed(&self) -> bool {
        matches!(self, MasterOutcome::Transitioned { .. })
    }
}

impl fmt::Display for MasterOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MasterOutcome::Transitioned { from, to } => write!(f, "{from} -> {to}"),
            MasterOutcome::Invalid { state } => write!(f, "ignored: not valid in {state}"),
            MasterOutcome::GuardFailed(why) => write!(f, "ignored: {why}"),
            MasterOutcome::ActionFailed(why) => write!(f, "ignored: {why}"),
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum MasterError {
    #[error("master controller has stopped")]
    Stopped,
    #[error("unknown camera {0}")]
    UnknownCamera(String),
    #[error("device triggers are only accepted in ENGINEERING (now {0})")]
    NotInEngineering(ObservatoryState),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MasterStatus {
    pub state: ObservatoryState,
    pub active_camera: Option<String>,
    pub cameras: BTreeMap<String, DeviceState>,
}

pub struct MasterController {
    ctx: Arc<ObservatoryContext>,
    state: ObservatoryState,
    cameras: BTreeMap<String, SubsystemController>,
    active_camera: Option<String>,
}

impl MasterController {
    pub fn new(ctx: Arc<ObservatoryContext>, cameras: Vec<SubsystemController>) -> Self {
        let cameras = cameras.into_iter().map(|c| (c.name().to_string(), c)).collect();
        Self { ctx, state: ObservatoryState::Idle, cameras, active_camera: None }
    }

    pub fn state(&self) -> ObservatoryState {
        self.state
    }

    pub fn active_camera(&self) -> Option<&str> {
        self.active_camera.as_deref()
    }

    pub fn status(&self) -> MasterStatus {
        MasterStatus {
            state: self.state,
            active_camera: self.active_camera.clone(),
            cameras: self.cameras.iter().map(|(n, c)| (n.clone(), c.state())).collect(),
        }
    }

    fn cameras_in(&self, state: DeviceState) -> Vec<String> {
        self.cameras.values().filter(|c| c.state() == state).map(|c| c.name().to_string()).collect()
    }

    fn all_cameras(&self, state: DeviceState) -> bool {
        !self.cameras.is_empty() && self.cameras.values().all(|c| c.state() == state)
    }

    fn any_camera(&self, state: DeviceState) -> bool {
        self.cameras.values().any(|c| c.state() == state)
    }

    fn sun_up(&self) -> bool {
        self.ctx
            .sun_altitude()
            .map(|alt| alt >= self.ctx.config.site.sun_alt_threshold_deg)
            .unwrap_or(false)
    }

    fn fire_camera(&mut self, name: &str, trigger: DeviceTrigger) -> FireOutcome {
        match self.cameras.get_mut(name) {
            Some(cam) => cam.fire(trigger),
            None => FireOutcome::Invalid,
        }
    }

    fn guard(&self, trigger: &MasterTrigger) -> Result<(), &'static str> {
        match trigger {
            MasterTrigger::AllCamsReady if !self.all_cameras(DeviceState::Ready) => {
                Err("not every camera is READY")
            }
            MasterTrigger::Nighttime if !self.any_camera(DeviceState::Ready) => Err("no camera READY"),
            MasterTrigger::Nighttime if !self.ctx.is_dark() => Err("sun above threshold"),
            MasterTrigger::WeatherGood if !self.ctx.safety.is_safe() => Err("weather still unsafe"),
            MasterTrigger::WeatherGood if !self.ctx.is_dark() => Err("no longer dark"),
            MasterTrigger::ShutdownDone if !self.all_cameras(DeviceState::Off) => {
                Err("cameras still powered")
            }
            MasterTrigger::SwitchCamera(target) => match self.cameras.get(target) {
                None => Err("unknown camera"),
                Some(c) if c.state() != DeviceState::Ready => Err("target camera not READY"),
                Some(_) => Ok(()),
            },
            _ => Ok(()),
        }
    }

    /// Puts `target` (or the first READY camera) into OBSERVING. The
    /// currently active camera must already have left OBSERVING.
    fn begin_observing(&mut self, target: Option<String>) -> Result<(), String> {
        if let Some(active) = self.active_camera.clone() {
            if self.cameras.get(&active).map(|c| c.state()) == Some(DeviceState::Observing) {
                if target.as_deref().map(|t| t == active).unwrap_or(true) {
                    return Ok(());
                }
                return Err(format!("{active} is still observing"));
            }
        }
        let name = match target {
            Some(t) => t,
            None => {
                let preferred = self
                    .active_camera
                    .clone()
                    .filter(|a| self.cameras.get(a).map(|c| c.state()) == Some(DeviceState::Ready));
                match preferred.or_else(|| self.cameras_in(DeviceState::Ready).into_iter().next()) {
                    Some(n) => n,
                    None => return Err("no camera READY".into()),
                }
            }
        };
        match self.fire_camera(&name, DeviceTrigger::BeginObs) {
            FireOutcome::Transitioned { .. } => {
                self.active_camera = Some(name);
                Ok(())
            }
            other => Err(format!("begin_obs on {name}: {other:?}")),
        }
    }

    fn end_active(&mut self) -> Result<(), String> {
        let Some(active) = self.active_camera.clone() else {
            return Ok(());
        };
        if self.cameras.get(&active).map(|c| c.state()) != Some(DeviceState::Observing) {
            return Ok(());
        }
        match self.fire_camera(&active, DeviceTrigger::EndObs) {
            FireOutcome::Transitioned { .. } => Ok(()),
            other => Err(format!("end_obs on {active}: {other:?}")),
        }
    }

    fn start_off_cameras(&mut self) {
        for name in self.cameras_in(DeviceState::Off) {
            self.fire_camera(&name, DeviceTrigger::Startup);
        }
    }

    fn warm_active_cameras(&mut self) {
        let mut names = self.cameras_in(DeviceState::Observing);
        names.extend(self.cameras_in(DeviceState::Ready));
        for name in names {
            self.fire_camera(&name, DeviceTrigger::Warm);
        }
    }

    /// Side effects of a guarded transition. An `Err` aborts the transition.
    fn act(&mut self, trigger: &MasterTrigger) -> Result<(), String> {
        match trigger {
            MasterTrigger::BeginStartup => {
                self.start_off_cameras();
                Ok(())
            }
            MasterTrigger::Nighttime | MasterTrigger::WeatherGood => self.begin_observing(None),
            MasterTrigger::WeatherBad | MasterTrigger::Lockout => {
                if let Err(e) = self.end_active() {
                    warn!("[master] {}: {e}", trigger.name());
                }
                if *trigger == MasterTrigger::Lockout {
                    self.active_camera = None;
                }
                Ok(())
            }
            MasterTrigger::Sunrise => {
                self.warm_active_cameras();
                self.active_camera = None;
                Ok(())
            }
            MasterTrigger::SwitchCamera(target) => {
                if self.active_camera.as_deref() == Some(target.as_str()) {
                    return Ok(());
                }
                self.end_active()?;
                if let Err(e) = self.begin_observing(Some(target.clone())) {
                    // the old camera is READY now and no longer active
                    self.active_camera = None;
                    return Err(e);
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    pub fn fire(&mut self, trigger: MasterTrigger) -> MasterOutcome {
        let Some(t) = MASTER_TRANSITIONS
            .iter()
            .find(|t| t.trigger == trigger.name() && t.from.contains(&self.state))
        else {
            debug!("[master] ignoring {} in {}", trigger.name(), self.state);
            return MasterOutcome::Invalid { state: self.state };
        };
        if let Err(why) = self.guard(&trigger) {
            debug!("[master] {} blocked: {why}", trigger.name());
            return MasterOutcome::GuardFailed(why);
        }
        if let Err(why) = self.act(&trigger) {
            warn!("[master] {} aborted: {why}", trigger.name());
            return MasterOutcome::ActionFailed(why);
        }
        let from = self.state;
        self.state = t.to;
        if from != t.to {
            info!("[master] {} -> {} ({})", from, t.to, trigger.name());
        }
        MasterOutcome::Transitioned { from, to: t.to }
    }

    /// Device triggers from operators, honoured only in ENGINEERING so the
    /// single-active-camera rule cannot be bypassed during a night.
    pub fn fire_device(&mut self, camera: &str, trigger: DeviceTrigger) -> Result<FireOutcome, MasterError> {
        if self.state != ObservatoryState::Engineering {
            return Err(MasterError::NotInEngineering(self.state));
        }
        if !self.cameras.contains_key(camera) {
            return Err(MasterError::UnknownCamera(camera.to_string()));
        }
        if trigger == DeviceTrigger::BeginObs && self.any_camera(DeviceState::Observing) {
            return Ok(FireOutcome::GuardFailed);
        }
        Ok(self.fire_camera(camera, trigger))
    }

    pub fn on_device_event(&mut self, ev: &DeviceEvent) {
        debug!("[master] {} {} -> {}", ev.subsystem, ev.from, ev.to);
        if self.state == ObservatoryState::StartingCameras && self.all_cameras(DeviceState::Ready) {
            self.fire(MasterTrigger::AllCamsReady);
        }
    }

    pub fn on_safety_change(&mut self, safe: bool) -> MasterOutcome {
        if safe {
            self.fire(MasterTrigger::WeatherGood)
        } else {
            self.fire(MasterTrigger::WeatherBad)
        }
    }

    /// Collects command answers from every camera. A camera whose command
    /// failed has already stepped back; the active slot follows it.
    fn settle_cameras(&mut self) {
        let names: Vec<String> = self.cameras.keys().cloned().collect();
        for name in names {
            let Some(cam) = self.cameras.get_mut(&name) else {
                continue;
            };
            let Some(err) = cam.settle() else {
                continue;
            };
            let now = cam.state();
            warn!("[master] {name} back in {now} after a failed command: {err}");
            let active = self.active_camera.as_deref() == Some(name.as_str());
            if now == DeviceState::Observing && !active {
                self.fire_camera(&name, DeviceTrigger::EndObs);
            } else if now != DeviceState::Observing && active {
                self.active_camera = None;
            }
        }
    }

    /// Automatic triggers, evaluated on every tick.
    pub fn tick(&mut self) {
        self.settle_cameras();
        for name in self.cameras_in(DeviceState::Starting) {
            self.fire_camera(&name, DeviceTrigger::BootOk);
        }
        for name in self.cameras_in(DeviceState::Warming) {
            self.fire_camera(&name, DeviceTrigger::CoolOff);
        }
        match self.state {
            S::StartingCameras => {
                self.start_off_cameras();
                if self.all_cameras(DeviceState::Ready) {
                    self.fire(MasterTrigger::AllCamsReady);
                }
            }
            S::WaitingForNight => {
                if self.ctx.is_dark() {
                    self.fire(MasterTrigger::Nighttime);
                }
            }
            S::Observing | S::WeatherClosure => {
                if self.sun_up() {
                    self.fire(MasterTrigger::Sunrise);
                } else if self.state == S::Observing && !self.ctx.safety.is_safe() {
                    self.fire(MasterTrigger::WeatherBad);
                } else if self.state == S::Observing && !self.any_camera(DeviceState::Observing) {
                    if let Err(e) = self.begin_observing(None) {
                        debug!("[master] no camera observing yet: {e}");
                    }
                }
            }
            S::Shutdown => {
                self.warm_active_cameras();
                if self.all_cameras(DeviceState::Off) {
                    self.fire(MasterTrigger::ShutdownDone);
                }
            }
            S::Idle | S::Lockout | S::Engineering => {}
        }
    }
}

enum MasterRequest {
    Fire {
        trigger: MasterTrigger,
        reply: oneshot::Sender<MasterOutcome>,
    },
    Device {
        camera: String,
        trigger: DeviceTrigger,
        reply: oneshot::Sender<Result<FireOutcome, MasterError>>,
    },
}

#[derive(Clone)]
pub struct MasterHandle {
    tx: mpsc::Sender<MasterRequest>,
    status: watch::Receiver<MasterStatus>,
}

impl MasterHandle {
    pub async fn fire(&self, trigger: MasterTrigger) -> Result<MasterOutcome, MasterError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(MasterRequest::Fire { trigger, reply })
            .await
            .map_err(|_| MasterError::Stopped)?;
        rx.await.map_err(|_| MasterError::Stopped)
    }

    pub async fn device(&self, camera: &str, trigger: DeviceTrigger) -> Result<FireOutcome, MasterError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(MasterRequest::Device { camera: camera.to_string(), trigger, reply })
            .await
            .map_err(|_| MasterError::Stopped)?;
        rx.await.map_err(|_| MasterError::Stopped)?
    }

    pub fn status(&self) -> MasterStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<MasterStatus> {
        self.status.clone()
    }
}

pub fn spawn_master(
    mut controller: MasterController,
    mut events: mpsc::UnboundedReceiver<DeviceEvent>,
    tick: Duration,
) -> (MasterHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<MasterRequest>(32);
    let (status_tx, status_rx) = watch::channel(controller.status());
    let mut safety = controller.ctx.safety.subscribe();

    let task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(tick.max(Duration::from_millis(1)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut safety_open = true;

        loop {
            tokio::select! {
                req = rx.recv() => {
                    match req {
                        Some(MasterRequest::Fire { trigger, reply }) => {
                            let _ = reply.send(controller.fire(trigger));
                        }
                        Some(MasterRequest::Device { camera, trigger, reply }) => {
                            let _ = reply.send(controller.fire_device(&camera, trigger));
                        }
                        None => break,
                    }
                }
                Some(ev) = events.recv() => controller.on_device_event(&ev),
                changed = safety.changed(), if safety_open => {
                    match changed {
                        Ok(()) => {
                            let safe = *safety.borrow_and_update();
                            info!("[master] safety flag now {}", if safe { "ok" } else { "unsafe" });
                            controller.on_safety_change(safe);
                        }
                        Err(_) => safety_open = false,
                    }
                }
                _ = interval.tick() => controller.tick(),
            }
            status_tx.send_if_modified(|cur| {
                let next = controller.status();
                if *cur == next {
                    false
                } else {
                    *cur = next;
                    true
                }
            });
        }
        debug!("[master] stopped");
    });

    (MasterHandle { tx, status: status_rx }, task)
}
