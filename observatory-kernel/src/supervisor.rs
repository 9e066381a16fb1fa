//! Wires the configured subsystems into running tasks.
//!
//! One worker per subsystem, one device state machine per camera, the
//! master actor, the schedule executor and the watchdog. Everything shares
//! the same `ObservatoryContext`.

use crate::config::SubsystemKind;
use crate::context::ObservatoryContext;
use crate::controller::SubsystemController;
use crate::dispatch::CommandServices;
use crate::executor::{DeviceExposureDriver, ExecutorControl, ExposureDriver, ExposureLog, ScheduleExecutor};
use crate::master::{spawn_master, MasterController, MasterHandle};
use crate::periodic::{secs, spawn_periodic};
use crate::proxy::{DeviceConnector, SubsystemProxy};
use crate::schedule::{Schedule, ScheduleError, ScheduleKind, SqliteScheduleStore, NIGHTLY};
use crate::state::SubsystemState;
use crate::watchdog::{ProcessKiller, WatchdogMonitor};
use crate::worker::{spawn_subsystem_worker, SubsystemHandle};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Collaborators injected at startup; tests pass mocks here.
pub struct SupervisorParts {
    pub connector: Arc<dyn DeviceConnector>,
    pub killer: Arc<dyn ProcessKiller>,
    /// `None` drives the configured mount and the active camera.
    pub driver: Option<Arc<dyn ExposureDriver>>,
    pub exposure_log: Box<dyn ExposureLog>,
}

pub struct Supervisor {
    pub ctx: Arc<ObservatoryContext>,
    pub master: MasterHandle,
    pub subsystems: BTreeMap<String, SubsystemHandle>,
    pub executor: ExecutorControl,
    tasks: Vec<JoinHandle<()>>,
}

async fn load_nightly(path: PathBuf) -> Result<Schedule, ScheduleError> {
    tokio::task::spawn_blocking(move || {
        let store = SqliteScheduleStore::open(&path)?;
        Schedule::load(NIGHTLY, ScheduleKind::Nightly, Box::new(store))
    })
    .await
    .map_err(|e| ScheduleError::Store(e.to_string()))?
}

impl Supervisor {
    pub async fn start(ctx: Arc<ObservatoryContext>, parts: SupervisorParts) -> Self {
        let conf = &ctx.config;
        let mut tasks = Vec::new();
        let mut subsystems = BTreeMap::new();
        let mut cameras = Vec::new();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        for sub in &conf.subsystems {
            let state = SubsystemState::with_defaults(&sub.name, &sub.defaults);
            let proxy = SubsystemProxy::new(
                &sub.name,
                sub.daemon_name(),
                parts.connector.clone(),
                state,
                Duration::from_millis(sub.call_timeout_ms),
                ctx.clock.clone(),
            );
            let (handle, task) = spawn_subsystem_worker(
                proxy,
                Duration::from_millis(sub.poll_interval_ms),
                sub.queue_depth,
                ctx.snapshots.clone(),
            );
            tasks.push(task);
            if sub.kind == SubsystemKind::Camera {
                cameras.push(SubsystemController::new(
                    handle.clone(),
                    sub.commands.clone(),
                    ctx.snapshots.clone(),
                    events_tx.clone(),
                ));
            }
            info!("[supervisor] {} -> daemon {} ({:?})", sub.name, sub.daemon_name(), sub.kind);
            subsystems.insert(sub.name.clone(), handle);
        }
        drop(events_tx);

        let camera_names: Vec<String> = cameras.iter().map(|c| c.name().to_string()).collect();
        let (master, master_task) =
            spawn_master(MasterController::new(ctx.clone(), cameras), events_rx, secs(conf.site.tick_s));
        tasks.push(master_task);

        let executor = ExecutorControl::new(conf.scheduler.start_running);
        if let Some(path) = conf.scheduler.nightly.clone() {
            match load_nightly(path.clone()).await {
                Ok(schedule) => {
                    info!("[supervisor] nightly schedule {} ({} observations)", path.display(), schedule.len());
                    executor.schedules().lock().set_nightly(schedule);
                }
                Err(e) => warn!("[supervisor] nightly schedule {} not loaded: {e}", path.display()),
            }
        }

        let driver = match parts.driver {
            Some(driver) => Some(driver),
            None => match subsystems.get(&conf.scheduler.mount) {
                Some(mount) => {
                    let camera_handles = camera_names
                        .iter()
                        .filter_map(|n| subsystems.get(n).map(|h| (n.clone(), h.clone())))
                        .collect();
                    let driver: Arc<dyn ExposureDriver> = Arc::new(DeviceExposureDriver::new(
                        ctx.clone(),
                        master.subscribe(),
                        mount.clone(),
                        camera_handles,
                    ));
                    Some(driver)
                }
                None => {
                    warn!("[supervisor] no mount named {:?}, schedule executor disabled", conf.scheduler.mount);
                    None
                }
            },
        };
        if let Some(driver) = driver {
            let exec = ScheduleExecutor::new(ctx.clone(), executor.clone(), driver, parts.exposure_log);
            tasks.push(spawn_periodic(exec, secs(conf.scheduler.tick_s)));
        }

        let watchdog = WatchdogMonitor::new(ctx.clone(), parts.killer);
        tasks.push(spawn_periodic(watchdog, secs(conf.watchdog.interval_s)));

        info!(
            "[supervisor] started {} subsystems, {} cameras",
            subsystems.len(),
            camera_names.len()
        );
        Self { ctx, master, subsystems, executor, tasks }
    }

    pub fn services(&self) -> CommandServices {
        CommandServices {
            ctx: self.ctx.clone(),
            master: self.master.clone(),
            subsystems: self.subsystems.clone(),
            executor: self.executor.clone(),
        }
    }

    pub fn shutdown(self) {
        for task in self.tasks {
            task.abort();
        }
        info!("[supervisor] stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::LogAlertSink;
    use crate::config::ObservatoryConfig;
    use crate::context::FixedClock;
    use crate::executor::ExposureRecord;
    use crate::master::ObservatoryState;
    use crate::proxy::tests::{FakeConnector, FakeDaemon};
    use crate::watchdog::WatchdogError;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::Ordering;

    struct NoKill;

    #[async_trait]
    impl ProcessKiller for NoKill {
        async fn kill_matching(&self, program: &str) -> Result<u32, WatchdogError> {
            Err(WatchdogError::NotFound(program.to_string()))
        }
    }

    struct NullLog;

    impl ExposureLog for NullLog {
        fn append(&mut self, _record: &ExposureRecord) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn config(dir: &std::path::Path) -> ObservatoryConfig {
        let mut conf = ObservatoryConfig::default();
        for sub in &mut conf.subsystems {
            sub.poll_interval_ms = 10;
        }
        conf.watchdog.kill_enabled = false;
        conf.watchdog.telemetry_log = dir.join("watchdog.jsonl");
        conf.scheduler.start_running = false;
        conf.site.tick_s = 0.01;
        conf
    }

    #[tokio::test]
    async fn workers_publish_and_master_starts_idle() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = Arc::new(FakeDaemon::default());
        daemon.reachable.store(true, Ordering::SeqCst);
        daemon.state.lock().insert("tec_at_setpoint".into(), json!(true));

        let ctx = Arc::new(ObservatoryContext::new(
            config(dir.path()),
            Arc::new(FixedClock::at_unix(1_000)),
            Arc::new(LogAlertSink),
        ));
        let sup = Supervisor::start(
            ctx.clone(),
            SupervisorParts {
                connector: Arc::new(FakeConnector(daemon)),
                killer: Arc::new(NoKill),
                driver: None,
                exposure_log: Box::new(NullLog),
            },
        )
        .await;

        assert_eq!(sup.master.status().state, ObservatoryState::Idle);
        assert_eq!(sup.subsystems.keys().collect::<Vec<_>>(), vec!["camera", "mount"]);

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let snap = ctx.snapshot();
                if snap.field("camera", "tec_at_setpoint") == Some(&json!(true)) && snap.connected_count() == 2 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(!sup.executor.is_running());
        sup.shutdown();
    }
}
