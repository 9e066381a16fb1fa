/**
 * WATCHDOG - Telemetry staleness monitor
 *
 * ROLE:
 * Each tick, measures how long ago every subsystem (and every daemon
 * timestamp field) was refreshed. Any value older than its threshold means
 * the supervisor can no longer be trusted: alert, then kill the supervising
 * process and let the external process manager relaunch it.
 *
 * OPERATION:
 * - Threshold per snapshot key: configured override, else the default
 * - Keys never refreshed are measured from the monitor start
 * - Daemon timestamp fields that hold no readable time are skipped, with
 *   one warning per key
 * - One JSON line of telemetry per tick; the log is flushed and closed
 *   before any kill so the next instance reopens it cleanly
 * - The kill target is matched by command line and must be unique
 * - Alarm records are recomputed on the same tick
 */

use crate::alarms::AlarmEvaluator;
use crate::alerts::AlertThrottle;
use crate::config::WatchdogConf;
use crate::context::ObservatoryContext;
use crate::periodic::{PeriodicTask, TickFlow};
use crate::state::StateSnapshot;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use sysinfo::{Pid, Signal, System};
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum WatchdogError {
    #[error("no running process matches {0:?}")]
    NotFound(String),
    #[error("{program:?} matches several processes: {pids:?}")]
    Ambiguous { program: String, pids: Vec<u32> },
    #[error("could not signal process {0}")]
    KillFailed(u32),
    #[error("kill disabled by configuration")]
    KillDisabled,
    #[error("telemetry log: {0}")]
    Telemetry(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct StalenessPolicy {
    pub default_s: f64,
    pub overrides: BTreeMap<String, f64>,
}

impl StalenessPolicy {
    pub fn from_conf(conf: &WatchdogConf) -> Self {
        Self { default_s: conf.default_threshold_s, overrides: conf.overrides.clone() }
    }

    pub fn threshold(&self, key: &str) -> f64 {
        self.overrides.get(key).copied().unwrap_or(self.default_s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StaleField {
    pub key: String,
    pub staleness_s: f64,
    pub threshold_s: f64,
}

/// Keys whose staleness exceeds their threshold. `since` stands in for keys
/// that were never refreshed.
pub fn find_stale(snapshot: &StateSnapshot, policy: &StalenessPolicy, now: f64, since: f64) -> Vec<StaleField> {
    snapshot
        .timestamps()
        .into_iter()
        .filter_map(|(key, ts)| {
            let staleness_s = now - ts.unwrap_or(since);
            let threshold_s = policy.threshold(&key);
            (staleness_s > threshold_s).then_some(StaleField { key, staleness_s, threshold_s })
        })
        .collect()
}

#[async_trait]
pub trait ProcessKiller: Send + Sync {
    /// Terminates the single process whose command line names `program`.
    async fn kill_matching(&self, program: &str) -> Result<u32, WatchdogError>;
}

/// True when one argument is `program` itself or a path ending in it.
pub fn cmdline_matches(cmd: &[String], program: &str) -> bool {
    cmd.iter().any(|arg| {
        arg == program || Path::new(arg).file_name().map(|f| f == program).unwrap_or(false)
    })
}

pub struct SysinfoKiller;

#[async_trait]
impl ProcessKiller for SysinfoKiller {
    async fn kill_matching(&self, program: &str) -> Result<u32, WatchdogError> {
        let mut sys = System::new();
        sys.refresh_processes();

        let matching: HashSet<Pid> = sys
            .processes()
            .iter()
            .filter(|(_, p)| cmdline_matches(p.cmd(), program))
            .map(|(pid, _)| *pid)
            .collect();
        // Threads share their parent's command line; keep process roots only.
        let roots: Vec<Pid> = matching
            .iter()
            .filter(|pid| {
                sys.process(**pid)
                    .and_then(|p| p.parent())
                    .map(|parent| !matching.contains(&parent))
                    .unwrap_or(true)
            })
            .copied()
            .collect();

        match roots.as_slice() {
            [] => Err(WatchdogError::NotFound(program.to_string())),
            [pid] => {
                let process = sys.process(*pid).ok_or(WatchdogError::KillFailed(pid.as_u32()))?;
                let sent = process.kill_with(Signal::Term).unwrap_or_else(|| process.kill());
                if sent {
                    Ok(pid.as_u32())
                } else {
                    Err(WatchdogError::KillFailed(pid.as_u32()))
                }
            }
            many => Err(WatchdogError::Ambiguous {
                program: program.to_string(),
                pids: many.iter().map(|p| p.as_u32()).collect(),
            }),
        }
    }
}

#[derive(Serialize)]
struct TelemetryLine<'a> {
    time: String,
    max_staleness_s: f64,
    connected: usize,
    stale: &'a [StaleField],
}

struct TelemetryLog {
    writer: BufWriter<File>,
}

impl TelemetryLog {
    fn open(path: &Path) -> std::io::Result<Self> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { writer: BufWriter::new(file) })
    }

    fn write(&mut self, line: &TelemetryLine<'_>) -> std::io::Result<()> {
        serde_json::to_writer(&mut self.writer, line)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()
    }

    fn close(self) -> std::io::Result<()> {
        let file = self.writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()
    }
}

pub struct WatchdogMonitor {
    ctx: Arc<ObservatoryContext>,
    policy: StalenessPolicy,
    killer: Arc<dyn ProcessKiller>,
    alarms: AlarmEvaluator,
    telemetry_path: PathBuf,
    telemetry: Option<TelemetryLog>,
    escalation_alerts: AlertThrottle,
    unreadable: HashSet<String>,
    started: f64,
}

impl WatchdogMonitor {
    pub fn new(ctx: Arc<ObservatoryContext>, killer: Arc<dyn ProcessKiller>) -> Self {
        let conf = &ctx.config;
        let policy = StalenessPolicy::from_conf(&conf.watchdog);
        let alarms = AlarmEvaluator::new(conf.alarms.clone(), conf.alerts.clone());
        let escalation_alerts = AlertThrottle::new(conf.alerts.min_interval_s);
        let telemetry_path = conf.watchdog.telemetry_log.clone();
        let started = ctx.clock.unix();
        Self {
            ctx,
            policy,
            killer,
            alarms,
            telemetry_path,
            telemetry: None,
            escalation_alerts,
            unreadable: HashSet::new(),
            started,
        }
    }

    fn record_telemetry(&mut self, snapshot: &StateSnapshot, stale: &[StaleField], now: f64) {
        if self.telemetry.is_none() {
            match TelemetryLog::open(&self.telemetry_path) {
                Ok(log) => self.telemetry = Some(log),
                Err(e) => {
                    warn!("[watchdog] cannot open {}: {e}", self.telemetry_path.display());
                    return;
                }
            }
        }
        let max_staleness_s = snapshot
            .timestamps()
            .iter()
            .map(|(_, ts)| now - ts.unwrap_or(self.started))
            .fold(0.0, f64::max);
        let line = TelemetryLine {
            time: self.ctx.clock.now().format(&Rfc3339).unwrap_or_default(),
            max_staleness_s,
            connected: snapshot.connected_count(),
            stale,
        };
        if let Some(log) = self.telemetry.as_mut() {
            if let Err(e) = log.write(&line) {
                warn!("[watchdog] telemetry write failed: {e}");
                self.telemetry = None;
            }
        }
    }

    /// One pass: alarms, staleness, telemetry. Returns the stale keys.
    pub async fn check(&mut self) -> Vec<StaleField> {
        let snapshot = self.ctx.snapshot();
        let now = self.ctx.clock.unix();

        let records = self.alarms.evaluate(&snapshot, now, self.ctx.alerts.as_ref()).await;
        *self.ctx.alarms.lock() = records;

        for key in snapshot.unreadable_timestamps() {
            if self.unreadable.insert(key.clone()) {
                warn!("[watchdog] {key} is not a unix or RFC 3339 time, not measured");
            }
        }

        let stale = find_stale(&snapshot, &self.policy, now, self.started);
        self.record_telemetry(&snapshot, &stale, now);
        stale
    }

    /// Alerts, closes the telemetry log and kills the supervised process.
    pub async fn escalate(&mut self, stale: &[StaleField]) -> Result<u32, WatchdogError> {
        let keys: Vec<String> = stale
            .iter()
            .map(|s| format!("{} ({:.0}s > {:.0}s)", s.key, s.staleness_s, s.threshold_s))
            .collect();
        let summary = format!("stale telemetry: {}", keys.join(", "));
        error!("[watchdog] {summary}");

        let conf = &self.ctx.config;
        if self.escalation_alerts.allow("watchdog", self.ctx.clock.unix()) {
            let program = &conf.watchdog.program_name;
            if let Err(e) = self.ctx.alerts.post(&conf.alerts.group, &format!("{program} restart: {summary}")).await {
                warn!("[watchdog] alert failed: {e}");
            }
            if !conf.alerts.recipients.is_empty() {
                let subject = format!("{program} watchdog restart");
                if let Err(e) = self.ctx.alerts.send_email(&conf.alerts.recipients, &subject, &summary).await {
                    warn!("[watchdog] email failed: {e}");
                }
            }
        }

        if !conf.watchdog.kill_enabled {
            return Err(WatchdogError::KillDisabled);
        }
        if let Some(log) = self.telemetry.take() {
            if let Err(e) = log.close() {
                warn!("[watchdog] closing telemetry log: {e}");
            }
        }
        self.killer.kill_matching(&conf.watchdog.program_name).await
    }
}

#[async_trait]
impl PeriodicTask for WatchdogMonitor {
    fn name(&self) -> &str {
        "watchdog"
    }

    async fn tick(&mut self) -> TickFlow {
        let stale = self.check().await;
        if stale.is_empty() {
            return TickFlow::Continue;
        }
        match self.escalate(&stale).await {
            Ok(pid) => {
                info!("[watchdog] sent SIGTERM to pid {pid}");
                TickFlow::Stop
            }
            Err(WatchdogError::KillDisabled) => TickFlow::Continue,
            Err(e) => {
                error!("[watchdog] kill failed: {e}");
                TickFlow::Continue
            }
        }
    }
}
