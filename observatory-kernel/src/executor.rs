/**
 * SCHEDULE EXECUTOR - Picks and drives one observation per tick
 *
 * ROLE:
 * Asks the `ScheduleSet` for the best eligible observation, runs its dither
 * sequence through an `ExposureDriver`, logs every exposure and marks the
 * observation observed once the log says it happened.
 *
 * OPERATION:
 * - Stand-by (no error) when paused, unsafe or nothing is eligible
 * - Per dither offset: slew, wait until the mount stops, settle, expose
 * - If observing becomes unsafe mid-visit, remaining offsets are skipped
 *   but still consume their time slot
 * - `observed` is written only when at least one exposure was logged and
 *   every log write succeeded, visit record included
 * - Stopping the executor stops issuing further steps; commands already
 *   sent to a daemon are not cancelled
 */

use crate::config::SchedulerConf;
use crate::context::ObservatoryContext;
use crate::master::{MasterStatus, ObservatoryState};
use crate::models::{DitherOffset, Observation};
use crate::periodic::{secs, PeriodicTask, TickFlow};
use crate::proxy::ProxyError;
use crate::schedule::{ScheduleSet, Selection};
use crate::state::{new_state, Shared};
use crate::worker::SubsystemHandle;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use tokio::sync::watch;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExecError {
    #[error("device: {0}")]
    Device(#[from] ProxyError),
    #[error("mount still slewing after {0:.0}s")]
    SlewTimeout(f64),
    #[error("no active camera")]
    NoActiveCamera,
}

#[async_trait]
pub trait ExposureDriver: Send + Sync {
    async fn ok_to_observe(&self) -> bool;
    async fn slew(&self, ra_deg: f64, dec_deg: f64) -> Result<(), ExecError>;
    async fn is_slewing(&self) -> Result<bool, ExecError>;
    /// Returns once the exposure has been read out.
    async fn expose(&self, obs: &Observation, exposure_s: f64, dither_index: usize) -> Result<(), ExecError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Dither,
    Visit,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExposureRecord {
    pub kind: RecordKind,
    pub schedule: String,
    pub obs_id: i64,
    pub filter: String,
    pub ra: f64,
    pub dec: f64,
    pub dither_index: Option<usize>,
    pub exposure_s: f64,
    pub mjd: f64,
    pub time: String,
}

pub trait ExposureLog: Send + Sync {
    fn append(&mut self, record: &ExposureRecord) -> std::io::Result<()>;
}

/// One JSON object per line, appended and flushed per record.
pub struct JsonlExposureLog {
    path: PathBuf,
}

impl JsonlExposureLog {
    pub fn new(path: &Path) -> Self {
        Self { path: path.to_path_buf() }
    }
}

impl ExposureLog for JsonlExposureLog {
    fn append(&mut self, record: &ExposureRecord) -> std::io::Result<()> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        file.write_all(&line)?;
        file.flush()
    }
}

/// Shared handle used by the command server and HTTP API.
#[derive(Clone)]
pub struct ExecutorControl {
    running: Arc<AtomicBool>,
    schedules: Shared<ScheduleSet>,
}

impl ExecutorControl {
    pub fn new(running: bool) -> Self {
        Self { running: Arc::new(AtomicBool::new(running)), schedules: new_state(ScheduleSet::new()) }
    }

    pub fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn schedules(&self) -> &Shared<ScheduleSet> {
        &self.schedules
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickReport {
    Paused,
    NotReady,
    NothingEligible,
    Observed { schedule: String, id: i64, exposures: usize },
    NotObserved { schedule: String, id: i64, exposures: usize, reason: String },
}

pub struct ScheduleExecutor {
    ctx: Arc<ObservatoryContext>,
    control: ExecutorControl,
    driver: Arc<dyn ExposureDriver>,
    log: Box<dyn ExposureLog>,
    dithers: Vec<DitherOffset>,
    settle: Duration,
    slew_poll: Duration,
    slew_timeout: Duration,
}

impl ScheduleExecutor {
    pub fn new(
        ctx: Arc<ObservatoryContext>,
        control: ExecutorControl,
        driver: Arc<dyn ExposureDriver>,
        log: Box<dyn ExposureLog>,
    ) -> Self {
        let conf = &ctx.config.scheduler;
        let dithers = conf.dithers.clone();
        let settle = secs(conf.settle_s);
        let slew_poll = Duration::from_millis(conf.slew_poll_ms.max(1));
        let slew_timeout = secs(conf.slew_timeout_s);
        Self { ctx, control, driver, log, dithers, settle, slew_poll, slew_timeout }
    }

    fn record(&self, kind: RecordKind, sel: &Selection, pointing: (f64, f64), dither_index: Option<usize>, exposure_s: f64) -> ExposureRecord {
        ExposureRecord {
            kind,
            schedule: sel.schedule.clone(),
            obs_id: sel.observation.id,
            filter: sel.observation.filter.clone(),
            ra: pointing.0,
            dec: pointing.1,
            dither_index,
            exposure_s,
            mjd: self.ctx.clock.mjd(),
            time: self.ctx.clock.now().format(&Rfc3339).unwrap_or_default(),
        }
    }

    async fn point(&self, ra: f64, dec: f64) -> Result<(), ExecError> {
        self.driver.slew(ra, dec).await?;
        let started = Instant::now();
        loop {
            sleep(self.slew_poll).await;
            if !self.driver.is_slewing().await? {
                return Ok(());
            }
            if started.elapsed() >= self.slew_timeout {
                return Err(ExecError::SlewTimeout(self.slew_timeout.as_secs_f64()));
            }
        }
    }

    pub async fn run_once(&mut self) -> TickReport {
        if !self.control.is_running() {
            return TickReport::Paused;
        }
        if !self.driver.ok_to_observe().await {
            return TickReport::NotReady;
        }
        let now = self.ctx.clock.mjd();
        let selected = self.control.schedules.lock().select(now);
        let Some(sel) = selected else {
            return TickReport::NothingEligible;
        };
        let obs = sel.observation.clone();

        let count = match obs.dither_number as usize {
            0 => self.dithers.len(),
            n => n.min(self.dithers.len()),
        }
        .max(1);
        let per_exposure = obs.exposure_time / count as f64;
        info!(
            "[executor] {} #{} ({:.4}, {:.4}) {} {}x{:.1}s",
            sel.schedule, obs.id, obs.ra, obs.dec, obs.filter, count, per_exposure
        );

        let mut exposures = 0;
        let mut log_failed = false;
        let mut last_error: Option<String> = None;

        for index in 0..count {
            if !self.control.is_running() {
                last_error = Some("executor stopped".into());
                break;
            }
            let offset = self.dithers.get(index).copied().unwrap_or(DitherOffset { ra_arcsec: 0.0, dec_arcsec: 0.0 });
            if !self.driver.ok_to_observe().await {
                debug!("[executor] unsafe, skipping dither {index}");
                last_error = Some("observing became unsafe".into());
                sleep(secs(per_exposure)).await;
                continue;
            }
            let pointing = offset.apply(obs.ra, obs.dec);
            if let Err(e) = self.point(pointing.0, pointing.1).await {
                warn!("[executor] dither {index}: {e}");
                last_error = Some(e.to_string());
                continue;
            }
            sleep(self.settle).await;
            if let Err(e) = self.driver.expose(&obs, per_exposure, index).await {
                warn!("[executor] exposure {index} failed: {e}");
                last_error = Some(e.to_string());
                continue;
            }
            let rec = self.record(RecordKind::Dither, &sel, pointing, Some(index), per_exposure);
            match self.log.append(&rec) {
                Ok(()) => exposures += 1,
                Err(e) => {
                    warn!("[executor] exposure log write failed: {e}");
                    log_failed = true;
                }
            }
        }

        let not_observed = |reason: String| TickReport::NotObserved {
            schedule: sel.schedule.clone(),
            id: obs.id,
            exposures,
            reason,
        };
        if log_failed {
            return not_observed("exposure log write failed".into());
        }
        if exposures == 0 {
            return not_observed(last_error.unwrap_or_else(|| "no exposure taken".into()));
        }
        let visit = self.record(RecordKind::Visit, &sel, (obs.ra, obs.dec), None, obs.exposure_time);
        if let Err(e) = self.log.append(&visit) {
            warn!("[executor] visit log write failed: {e}");
            return not_observed("exposure log write failed".into());
        }
        let marked = self.control.schedules.lock().mark_observed(&sel.schedule, obs.id);
        if let Err(e) = marked {
            warn!("[executor] could not mark #{} observed: {e}", obs.id);
            return not_observed(e.to_string());
        }
        info!("[executor] {} #{} observed ({} exposures)", sel.schedule, obs.id, exposures);
        TickReport::Observed { schedule: sel.schedule.clone(), id: obs.id, exposures }
    }
}

#[async_trait]
impl PeriodicTask for ScheduleExecutor {
    fn name(&self) -> &str {
        "executor"
    }

    async fn tick(&mut self) -> TickFlow {
        match self.run_once().await {
            TickReport::NotObserved { schedule, id, reason, .. } => {
                warn!("[executor] {schedule} #{id} not marked observed: {reason}");
            }
            other => debug!("[executor] {other:?}"),
        }
        TickFlow::Continue
    }
}

/// Drives the real mount and the master's active camera through their
/// subsystem queues.
pub struct DeviceExposureDriver {
    ctx: Arc<ObservatoryContext>,
    master: watch::Receiver<MasterStatus>,
    mount: SubsystemHandle,
    cameras: BTreeMap<String, SubsystemHandle>,
    conf: SchedulerConf,
    call_timeout: Duration,
}

impl DeviceExposureDriver {
    pub fn new(
        ctx: Arc<ObservatoryContext>,
        master: watch::Receiver<MasterStatus>,
        mount: SubsystemHandle,
        cameras: BTreeMap<String, SubsystemHandle>,
    ) -> Self {
        let conf = ctx.config.scheduler.clone();
        let call_timeout = ctx
            .config
            .subsystem(&conf.mount)
            .map(|s| Duration::from_millis(s.call_timeout_ms))
            .unwrap_or(Duration::from_secs(1));
        Self { ctx, master, mount, cameras, conf, call_timeout }
    }

    fn active_camera(&self) -> Option<SubsystemHandle> {
        let status = self.master.borrow();
        status.active_camera.as_ref().and_then(|c| self.cameras.get(c)).cloned()
    }
}

#[async_trait]
impl ExposureDriver for DeviceExposureDriver {
    async fn ok_to_observe(&self) -> bool {
        let observing = {
            let status = self.master.borrow();
            status.state == ObservatoryState::Observing && status.active_camera.is_some()
        };
        observing && self.ctx.safety.is_safe()
    }

    async fn slew(&self, ra_deg: f64, dec_deg: f64) -> Result<(), ExecError> {
        self.mount
            .request(&self.conf.slew_command, vec![json!(ra_deg), json!(dec_deg)], self.call_timeout)
            .await?;
        Ok(())
    }

    async fn is_slewing(&self) -> Result<bool, ExecError> {
        let snaps = self.ctx.snapshots.lock();
        let mount = snaps
            .get(self.mount.name())
            .ok_or_else(|| ProxyError::NotConnected(self.mount.name().to_string()))?;
        if !mount.is_connected {
            return Err(ProxyError::NotConnected(self.mount.name().to_string()).into());
        }
        Ok(mount.is_truthy(&self.conf.slewing_field))
    }

    async fn expose(&self, obs: &Observation, exposure_s: f64, dither_index: usize) -> Result<(), ExecError> {
        let camera = self.active_camera().ok_or(ExecError::NoActiveCamera)?;
        let args = vec![json!(exposure_s), json!(obs.filter), json!(obs.id), json!(dither_index)];
        camera.request(&self.conf.expose_command, args, self.call_timeout).await?;
        sleep(secs(exposure_s + self.conf.readout_s)).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::LogAlertSink;
    use crate::config::ObservatoryConfig;
    use crate::context::FixedClock;
    use crate::models::unix_to_mjd;
    use crate::schedule::tests::obs;
    use crate::schedule::{MemoryScheduleStore, Schedule, ScheduleKind, NIGHTLY};
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Script {
        unsafe_after_exposures: Option<usize>,
        exposures: AtomicUsize,
        slews: Mutex<Vec<(f64, f64)>>,
        fail_expose: bool,
    }

    #[async_trait]
    impl ExposureDriver for Script {
        async fn ok_to_observe(&self) -> bool {
            match self.unsafe_after_exposures {
                Some(n) => self.exposures.load(Ordering::SeqCst) < n,
                None => true,
            }
        }
        async fn slew(&self, ra: f64, dec: f64) -> Result<(), ExecError> {
            self.slews.lock().push((ra, dec));
            Ok(())
        }
        async fn is_slewing(&self) -> Result<bool, ExecError> {
            Ok(false)
        }
        async fn expose(&self, _obs: &Observation, _s: f64, _i: usize) -> Result<(), ExecError> {
            if self.fail_expose {
                return Err(ExecError::NoActiveCamera);
            }
            self.exposures.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct MemLog {
        records: Arc<Mutex<Vec<ExposureRecord>>>,
        fail: Arc<AtomicBool>,
    }

    impl ExposureLog for MemLog {
        fn append(&mut self, record: &ExposureRecord) -> std::io::Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full"));
            }
            self.records.lock().push(record.clone());
            Ok(())
        }
    }

    const NOW: i64 = 1_700_000_000;

    fn executor(script: Arc<Script>, log: MemLog) -> (ScheduleExecutor, ExecutorControl) {
        let mut config = ObservatoryConfig::default();
        config.scheduler.settle_s = 0.0;
        config.scheduler.slew_poll_ms = 1;
        let ctx = Arc::new(ObservatoryContext::new(
            config,
            Arc::new(FixedClock::at_unix(NOW)),
            Arc::new(LogAlertSink),
        ));
        let control = ExecutorControl::new(true);
        let t = unix_to_mjd(NOW as f64);
        let mut o = obs(1, t - 0.1, t + 0.1);
        o.exposure_time = 50.0;
        control
            .schedules()
            .lock()
            .set_nightly(Schedule::load(NIGHTLY, ScheduleKind::Nightly, Box::new(MemoryScheduleStore::new("n", vec![o]))).unwrap());
        (ScheduleExecutor::new(ctx, control.clone(), script, Box::new(log)), control)
    }

    #[tokio::test(start_paused = true)]
    async fn full_visit_marks_observed() {
        let script = Arc::new(Script::default());
        let log = MemLog::default();
        let (mut ex, control) = executor(script.clone(), log.clone());

        let report = ex.run_once().await;
        assert_eq!(report, TickReport::Observed { schedule: "nightly".into(), id: 1, exposures: 5 });
        assert_eq!(script.slews.lock().len(), 5);
        let records = log.records.lock();
        assert_eq!(records.len(), 6);
        assert_eq!(records[0].exposure_s, 10.0);
        assert_eq!(records[5].kind, RecordKind::Visit);
        drop(records);

        assert_eq!(ex.run_once().await, TickReport::NothingEligible);
        assert!(control.schedules().lock().summaries(unix_to_mjd(NOW as f64))[0].current.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_log_write_leaves_observation_eligible() {
        let script = Arc::new(Script::default());
        let log = MemLog::default();
        log.fail.store(true, Ordering::SeqCst);
        let (mut ex, _control) = executor(script, log.clone());

        let report = ex.run_once().await;
        assert!(matches!(report, TickReport::NotObserved { ref reason, .. } if reason == "exposure log write failed"));

        log.fail.store(false, Ordering::SeqCst);
        assert!(matches!(ex.run_once().await, TickReport::Observed { id: 1, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn unsafe_mid_visit_skips_remaining_dithers() {
        let script = Arc::new(Script { unsafe_after_exposures: Some(2), ..Script::default() });
        let log = MemLog::default();
        let (mut ex, _control) = executor(script.clone(), log.clone());

        let started = Instant::now();
        let report = ex.run_once().await;
        assert_eq!(report, TickReport::Observed { schedule: "nightly".into(), id: 1, exposures: 2 });
        assert_eq!(script.slews.lock().len(), 2);
        // three skipped slots of 10 s each still elapse
        assert!(started.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn nothing_exposed_is_not_observed() {
        let script = Arc::new(Script { fail_expose: true, ..Script::default() });
        let (mut ex, _control) = executor(script, MemLog::default());
        let report = ex.run_once().await;
        assert!(matches!(report, TickReport::NotObserved { exposures: 0, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn paused_and_unsafe_stand_by() {
        let script = Arc::new(Script { unsafe_after_exposures: Some(0), ..Script::default() });
        let (mut ex, control) = executor(script, MemLog::default());
        assert_eq!(ex.run_once().await, TickReport::NotReady);
        control.stop();
        assert_eq!(ex.run_once().await, TickReport::Paused);
    }

    fn shareable<T: Send + Sync + ?Sized>() {}

    #[test]
    fn executor_and_logs_cross_task_boundaries() {
        shareable::<dyn ExposureLog>();
        shareable::<JsonlExposureLog>();
        shareable::<ScheduleExecutor>();
    }

    #[test]
    fn jsonl_log_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("exposures.jsonl");
        let mut log = JsonlExposureLog::new(&path);
        let rec = ExposureRecord {
            kind: RecordKind::Dither,
            schedule: "nightly".into(),
            obs_id: 4,
            filter: "J".into(),
            ra: 1.0,
            dec: 2.0,
            dither_index: Some(0),
            exposure_s: 8.0,
            mjd: 60000.0,
            time: "2024-01-01T00:00:00Z".into(),
        };
        log.append(&rec).unwrap();
        log.append(&rec).unwrap();
        let txt = std::fs::read_to_string(&path).unwrap();
        assert_eq!(txt.lines().count(), 2);
        let first: serde_json::Value = serde_json::from_str(txt.lines().next().unwrap()).unwrap();
        assert_eq!(first["kind"], "dither");
        assert_eq!(first["obs_id"], 4);
    }
}
