/*!
Test harness running a complete supervisor in-process.

Starts from a small observatory (one camera, a mount, an ephemeris source)
with millisecond poll and tick intervals, a pinned clock and recording
collaborators. Tests tweak `config` and the mock devices before `start()`.
*/

use crate::mock_device::{MockConnector, MockDevice};
use crate::recorders::{MemoryExposureLog, RecordingAlertSink, RecordingKiller};
use anyhow::{bail, Context, Result};
use observatory_kernel::command_server::{CommandServer, LineAction, ShutdownHandle};
use observatory_kernel::config::{ObservatoryConfig, SubsystemConf, SubsystemKind};
use observatory_kernel::context::{Clock, FixedClock, ObservatoryContext};
use observatory_kernel::dispatch::build_registry;
use observatory_kernel::master::{MasterHandle, ObservatoryState};
use observatory_kernel::supervisor::{Supervisor, SupervisorParts};
use serde_json::json;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// Early evening, 2023-11-14T22:13:20Z.
pub const NIGHT_UNIX: i64 = 1_700_000_000;
pub const KILLED_PID: u32 = 4242;

/// Polls `cond` every 10 ms until it holds or `limit` elapses.
pub async fn wait_for<F: FnMut() -> bool>(what: &str, limit: Duration, mut cond: F) -> Result<()> {
    let start = Instant::now();
    loop {
        if cond() {
            return Ok(());
        }
        if start.elapsed() > limit {
            bail!("timed out after {:?} waiting for {what}", limit);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn fast_subsystem(name: &str, kind: SubsystemKind) -> SubsystemConf {
    let mut conf = SubsystemConf::new(name, kind);
    conf.poll_interval_ms = 10;
    conf.call_timeout_ms = 200;
    conf
}

fn fast_config(dir: &Path) -> ObservatoryConfig {
    let mut config = ObservatoryConfig::default();
    let mut camera = fast_subsystem("camera", SubsystemKind::Camera);
    camera.defaults.insert("tec_at_setpoint".into(), json!(false));
    camera.defaults.insert("warmed_up".into(), json!(false));
    let mut mount = fast_subsystem("mount", SubsystemKind::Mount);
    mount.defaults.insert("mount_is_slewing".into(), json!(false));
    config.subsystems = vec![camera, mount, fast_subsystem("ephem", SubsystemKind::Other)];

    config.watchdog.interval_s = 0.05;
    config.watchdog.telemetry_log = dir.join("watchdog.jsonl");
    config.scheduler.tick_s = 0.02;
    config.scheduler.settle_s = 0.0;
    config.scheduler.slew_poll_ms = 1;
    config.scheduler.slew_timeout_s = 2.0;
    config.scheduler.readout_s = 0.0;
    config.scheduler.exposure_log = dir.join("exposures.jsonl");
    config.site.tick_s = 0.02;
    config.command_server.reply_timeout_s = 2.0;
    config
}

pub struct TestHarness {
    pub config: ObservatoryConfig,
    pub clock: Arc<FixedClock>,
    pub devices: Arc<MockConnector>,
    pub alerts: Arc<RecordingAlertSink>,
    pub killer: Arc<RecordingKiller>,
    pub exposures: MemoryExposureLog,
    ctx: Option<Arc<ObservatoryContext>>,
    supervisor: Option<Supervisor>,
    commands: Option<CommandServer>,
    listeners: Vec<(ShutdownHandle, JoinHandle<std::io::Result<()>>)>,
    dir: TempDir,
}

impl TestHarness {
    pub fn new() -> Result<Self> {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
            .with_test_writer()
            .try_init()
            .ok();

        let dir = tempfile::tempdir().context("creating harness directory")?;
        let devices = Arc::new(MockConnector::new());
        devices.add("camera", MockDevice::camera());
        devices.add("mount", MockDevice::mount());
        devices.add("ephem", MockDevice::ephem(-20.0));

        Ok(Self {
            config: fast_config(dir.path()),
            clock: Arc::new(FixedClock::at_unix(NIGHT_UNIX)),
            devices,
            alerts: Arc::new(RecordingAlertSink::default()),
            killer: Arc::new(RecordingKiller::new(KILLED_PID)),
            exposures: MemoryExposureLog::default(),
            ctx: None,
            supervisor: None,
            commands: None,
            listeners: Vec::new(),
            dir,
        })
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Registers an extra subsystem and the device answering for it.
    pub fn add_subsystem(&mut self, name: &str, kind: SubsystemKind, device: Arc<MockDevice>) {
        self.config.subsystems.push(fast_subsystem(name, kind));
        self.devices.add(name, device);
    }

    pub fn device(&self, name: &str) -> Result<Arc<MockDevice>> {
        self.devices.device(name).with_context(|| format!("no mock device {name}"))
    }

    pub async fn start(&mut self) -> Result<()> {
        if self.supervisor.is_some() {
            bail!("harness already started");
        }
        self.config.validate()?;
        let clock: Arc<dyn Clock> = self.clock.clone();
        let ctx = Arc::new(ObservatoryContext::new(self.config.clone(), clock, self.alerts.clone()));
        let supervisor = Supervisor::start(
            ctx.clone(),
            SupervisorParts {
                connector: self.devices.clone(),
                killer: self.killer.clone(),
                driver: None,
                exposure_log: Box::new(self.exposures.clone()),
            },
        )
        .await;
        let registry = build_registry(supervisor.services())?;
        self.commands = Some(CommandServer::new(registry, Duration::from_secs_f64(self.config.command_server.reply_timeout_s)));
        self.ctx = Some(ctx);
        self.supervisor = Some(supervisor);
        info!(
            "[harness] supervisor started in {} with {} subsystems",
            self.dir.path().display(),
            self.config.subsystems.len()
        );
        Ok(())
    }

    pub fn ctx(&self) -> Result<&Arc<ObservatoryContext>> {
        self.ctx.as_ref().context("harness not started")
    }

    pub fn master(&self) -> Result<&MasterHandle> {
        self.supervisor.as_ref().map(|s| &s.master).context("harness not started")
    }

    pub fn state(&self) -> Result<ObservatoryState> {
        Ok(self.master()?.status().state)
    }

    /// Runs one command line and returns the reply line.
    pub async fn command(&self, line: &str) -> Result<String> {
        let server = self.commands.as_ref().context("harness not started")?;
        Ok(match server.handle_line(line).await {
            LineAction::Reply(r) | LineAction::Close(r) | LineAction::KillServer(r) => r,
            LineAction::Skip => String::new(),
        })
    }

    /// Like `command` but fails unless the reply starts with `OK`.
    pub async fn ok(&self, line: &str) -> Result<String> {
        let reply = self.command(line).await?;
        match reply.strip_prefix("OK") {
            Some(rest) => Ok(rest.trim_start().to_string()),
            None => bail!("{line:?} answered {reply:?}"),
        }
    }

    /// Serves the command port on an ephemeral local address.
    pub async fn serve_commands(&mut self) -> Result<SocketAddr> {
        let supervisor = self.supervisor.as_ref().context("harness not started")?;
        let registry = build_registry(supervisor.services())?;
        let server = CommandServer::new(registry, Duration::from_secs_f64(self.config.command_server.reply_timeout_s));
        let listener = CommandServer::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        debug!("[harness] command port on {addr}");
        let stop = server.shutdown_handle();
        self.listeners.push((stop, tokio::spawn(server.serve(listener))));
        Ok(addr)
    }

    pub async fn wait_for_state(&self, state: ObservatoryState, limit: Duration) -> Result<()> {
        let master = self.master()?.clone();
        wait_for(&format!("observatory {state}"), limit, || master.status().state == state).await
    }

    /// Waits until every subsystem has been polled at least once.
    pub async fn wait_connected(&self, limit: Duration) -> Result<()> {
        let ctx = self.ctx()?.clone();
        let total = self.config.subsystems.len();
        wait_for("all subsystems connected", limit, || {
            let snap = ctx.snapshot();
            snap.connected_count() == total && snap.subsystems.values().all(|s| s.last_refresh.is_some())
        })
        .await
    }

    pub fn shutdown(&mut self) {
        for (stop, task) in self.listeners.drain(..) {
            stop.shutdown();
            task.abort();
        }
        if let Some(supervisor) = self.supervisor.take() {
            supervisor.shutdown();
            debug!("[harness] supervisor stopped");
        }
    }
}

impl Drop for TestHarness {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Declares a multi-threaded tokio test around a fresh `TestHarness`.
#[macro_export]
macro_rules! observatory_test {
    ($name:ident, |$h:ident| $body:block) => {
        #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
        async fn $name() {
            let mut $h = $crate::test_utils::TestHarness::new().expect("harness");
            let result: anyhow::Result<()> = async { $body }.await;
            $h.shutdown();
            if let Err(e) = result {
                panic!("{} failed: {e:#}", stringify!($name));
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    observatory_test!(harness_connects_every_subsystem, |h| {
        h.start().await?;
        h.wait_connected(Duration::from_secs(5)).await?;
        assert_eq!(h.state()?, ObservatoryState::Idle);
        let reply = h.ok("state ephem").await?;
        assert!(reply.contains("sun_alt"));
        Ok(())
    });

    #[tokio::test]
    async fn commands_fail_before_start() {
        let h = TestHarness::new().unwrap();
        assert!(h.command("status").await.is_err());
        assert!(h.master().is_err());
    }
}
