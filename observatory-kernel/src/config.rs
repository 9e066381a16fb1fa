/**
 * CONFIGURATION - observatory.yaml
 *
 * ROLE:
 * Typed view of the supervisor configuration. Every section has defaults so
 * a partial (or absent) file still yields a runnable bench setup.
 *
 * OPERATION:
 * - Path from env `OBSERVATORY_CONFIG`, fallback `observatory.yaml`
 * - Missing file: defaults with a warning
 * - Unreadable or invalid file: error, the kernel refuses to start
 */

use crate::models::DitherOffset;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io { path: String, source: std::io::Error },
    #[error("invalid config {path}: {source}")]
    Parse { path: String, source: serde_yaml::Error },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservatoryConfig {
    pub bus: BusConf,
    pub subsystems: Vec<SubsystemConf>,
    pub watchdog: WatchdogConf,
    pub scheduler: SchedulerConf,
    pub command_server: CommandServerConf,
    pub http: HttpConf,
    pub alerts: AlertsConf,
    pub alarms: Vec<AlarmRule>,
    pub site: SiteConf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConf {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive_s: u64,
}

impl Default for BusConf {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 1883,
            client_id: "observatory-kernel".into(),
            keep_alive_s: 15,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubsystemKind {
    Camera,
    Mount,
    Dome,
    Chiller,
    Power,
    FilterWheel,
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubsystemConf {
    pub name: String,
    /// Daemon name on the bus; defaults to `name`.
    #[serde(default)]
    pub daemon: Option<String>,
    #[serde(default = "default_kind")]
    pub kind: SubsystemKind,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    /// Sticky values reported until the daemon answers for the first time.
    #[serde(default)]
    pub defaults: BTreeMap<String, Value>,
    #[serde(default)]
    pub commands: DeviceCommands,
}

impl SubsystemConf {
    pub fn new(name: &str, kind: SubsystemKind) -> Self {
        Self {
            name: name.to_string(),
            daemon: None,
            kind,
            poll_interval_ms: default_poll_interval_ms(),
            call_timeout_ms: default_call_timeout_ms(),
            queue_depth: default_queue_depth(),
            defaults: BTreeMap::new(),
            commands: DeviceCommands::default(),
        }
    }

    pub fn daemon_name(&self) -> &str {
        self.daemon.as_deref().unwrap_or(&self.name)
    }
}

fn default_kind() -> SubsystemKind {
    SubsystemKind::Other
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_call_timeout_ms() -> u64 {
    1000
}

fn default_queue_depth() -> usize {
    32
}

/// Daemon command names issued by the device state machine, and the state
/// fields its guards read.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceCommands {
    pub startup: String,
    pub observing_defaults: String,
    pub flush: String,
    pub stop_cooling: String,
    pub ready_field: String,
    pub warmed_field: String,
}

impl Default for DeviceCommands {
    fn default() -> Self {
        Self {
            startup: "startup".into(),
            observing_defaults: "set_observing_defaults".into(),
            flush: "flush_buffers".into(),
            stop_cooling: "stop_cooling".into(),
            ready_field: "tec_at_setpoint".into(),
            warmed_field: "warmed_up".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConf {
    pub interval_s: f64,
    pub default_threshold_s: f64,
    /// Per-key thresholds, e.g. `camera_timestamp: 600`.
    pub overrides: BTreeMap<String, f64>,
    /// Command-line token identifying the supervised process.
    pub program_name: String,
    pub telemetry_log: PathBuf,
    /// When false the watchdog only alerts.
    pub kill_enabled: bool,
}

impl Default for WatchdogConf {
    fn default() -> Self {
        Self {
            interval_s: 5.0,
            default_threshold_s: 60.0,
            overrides: BTreeMap::new(),
            program_name: "observatory-kernel".into(),
            telemetry_log: PathBuf::from("logs/watchdog.jsonl"),
            kill_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConf {
    /// Nightly SQLite schedule loaded at startup.
    pub nightly: Option<PathBuf>,
    pub tick_s: f64,
    pub dithers: Vec<DitherOffset>,
    pub settle_s: f64,
    pub slew_poll_ms: u64,
    pub slew_timeout_s: f64,
    pub exposure_log: PathBuf,
    pub mount: String,
    pub slew_command: String,
    pub slewing_field: String,
    pub expose_command: String,
    /// Extra wait after the exposure time for readout.
    pub readout_s: f64,
    pub start_running: bool,
}

impl Default for SchedulerConf {
    fn default() -> Self {
        let d = |ra_arcsec, dec_arcsec| DitherOffset { ra_arcsec, dec_arcsec };
        Self {
            nightly: None,
            tick_s: 5.0,
            dithers: vec![d(0.0, 0.0), d(15.0, 15.0), d(-15.0, 15.0), d(-15.0, -15.0), d(15.0, -15.0)],
            settle_s: 2.0,
            slew_poll_ms: 250,
            slew_timeout_s: 120.0,
            exposure_log: PathBuf::from("logs/exposures.jsonl"),
            mount: "mount".into(),
            slew_command: "goto_ra_dec".into(),
            slewing_field: "mount_is_slewing".into(),
            expose_command: "do_exposure".into(),
            readout_s: 1.0,
            start_running: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandServerConf {
    pub addr: String,
    pub reply_timeout_s: f64,
}

impl Default for CommandServerConf {
    fn default() -> Self {
        Self { addr: "0.0.0.0:7075".into(), reply_timeout_s: 5.0 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConf {
    pub addr: String,
    pub enabled: bool,
}

impl Default for HttpConf {
    fn default() -> Self {
        Self { addr: "0.0.0.0:8080".into(), enabled: true }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertBackend {
    Log,
    Bus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertsConf {
    pub backend: AlertBackend,
    pub group: String,
    pub recipients: Vec<String>,
    pub min_interval_s: f64,
}

impl Default for AlertsConf {
    fn default() -> Self {
        Self {
            backend: AlertBackend::Log,
            group: "operator".into(),
            recipients: Vec::new(),
            min_interval_s: 60.0,
        }
    }
}

/// Decodes one alarm condition out of a subsystem field. With `bit` set the
/// field is read as an integer alarm word (decimal or `0x` hex).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlarmRule {
    pub subsystem: String,
    pub field: String,
    #[serde(default)]
    pub bit: Option<u32>,
    pub condition: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SiteConf {
    /// Subsystem publishing the sun altitude (degrees).
    pub sun_subsystem: String,
    pub sun_alt_field: String,
    pub sun_alt_threshold_deg: f64,
    pub tick_s: f64,
}

impl Default for SiteConf {
    fn default() -> Self {
        Self {
            sun_subsystem: "ephem".into(),
            sun_alt_field: "sun_alt".into(),
            sun_alt_threshold_deg: -12.0,
            tick_s: 2.0,
        }
    }
}

impl Default for ObservatoryConfig {
    fn default() -> Self {
        let mut camera = SubsystemConf::new("camera", SubsystemKind::Camera);
        camera.defaults.insert("tec_at_setpoint".into(), Value::Bool(false));
        camera.defaults.insert("warmed_up".into(), Value::Bool(false));
        let mut mount = SubsystemConf::new("mount", SubsystemKind::Mount);
        mount.defaults.insert("mount_is_slewing".into(), Value::Bool(false));
        Self {
            bus: BusConf::default(),
            subsystems: vec![camera, mount],
            watchdog: WatchdogConf::default(),
            scheduler: SchedulerConf::default(),
            command_server: CommandServerConf::default(),
            http: HttpConf::default(),
            alerts: AlertsConf::default(),
            alarms: Vec::new(),
            site: SiteConf::default(),
        }
    }
}

impl ObservatoryConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for s in &self.subsystems {
            if s.name.trim().is_empty() || s.name.contains(char::is_whitespace) {
                return Err(ConfigError::Invalid(format!("bad subsystem name {:?}", s.name)));
            }
            if !seen.insert(s.name.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate subsystem {}", s.name)));
            }
            if s.queue_depth == 0 {
                return Err(ConfigError::Invalid(format!("{}: queue_depth must be > 0", s.name)));
            }
        }
        if self.watchdog.default_threshold_s <= 0.0 {
            return Err(ConfigError::Invalid("watchdog.default_threshold_s must be > 0".into()));
        }
        if self.scheduler.dithers.is_empty() {
            return Err(ConfigError::Invalid("scheduler.dithers must not be empty".into()));
        }
        Ok(())
    }

    pub fn cameras(&self) -> impl Iterator<Item = &SubsystemConf> {
        self.subsystems.iter().filter(|s| s.kind == SubsystemKind::Camera)
    }

    pub fn subsystem(&self, name: &str) -> Option<&SubsystemConf> {
        self.subsystems.iter().find(|s| s.name == name)
    }
}

pub fn parse_config(txt: &str, origin: &str) -> Result<ObservatoryConfig, ConfigError> {
    if txt.trim().is_empty() {
        return Ok(ObservatoryConfig::default());
    }
    let cfg: ObservatoryConfig = serde_yaml::from_str(txt)
        .map_err(|source| ConfigError::Parse { path: origin.to_string(), source })?;
    cfg.validate()?;
    Ok(cfg)
}

pub async fn load_config_from(path: &Path) -> Result<ObservatoryConfig, ConfigError> {
    let shown = path.display().to_string();
    if !path.exists() {
        warn!("[config] {shown} not found, using defaults");
        return Ok(ObservatoryConfig::default());
    }
    let txt = fs::read_to_string(path)
        .await
        .map_err(|source| ConfigError::Io { path: shown.clone(), source })?;
    parse_config(&txt, &shown)
}

pub async fn load_config() -> Result<ObservatoryConfig, ConfigError> {
    let path = std::env::var("OBSERVATORY_CONFIG").unwrap_or_else(|_| "observatory.yaml".into());
    load_config_from(Path::new(&path)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let cfg = parse_config("  \n", "mem").unwrap();
        assert_eq!(cfg.watchdog.default_threshold_s, 60.0);
        assert_eq!(cfg.command_server.addr, "0.0.0.0:7075");
        assert_eq!(cfg.cameras().count(), 1);
    }

    #[test]
    fn partial_sections_fill_in_defaults() {
        let yaml = r#"
subsystems:
  - name: spring
    kind: camera
    daemon: spring_daemon
  - name: dome
    kind: dome
    poll_interval_ms: 500
watchdog:
  overrides:
    spring_timestamp: 600
alarms:
  - subsystem: chiller
    field: alarm_word
    bit: 3
    condition: "low coolant"
"#;
        let cfg = parse_config(yaml, "mem").unwrap();
        assert_eq!(cfg.subsystems.len(), 2);
        assert_eq!(cfg.subsystems[0].daemon_name(), "spring_daemon");
        assert_eq!(cfg.subsystems[1].daemon_name(), "dome");
        assert_eq!(cfg.subsystems[1].poll_interval_ms, 500);
        assert_eq!(cfg.subsystems[0].commands.ready_field, "tec_at_setpoint");
        assert_eq!(cfg.watchdog.overrides["spring_timestamp"], 600.0);
        assert_eq!(cfg.watchdog.default_threshold_s, 60.0);
        assert_eq!(cfg.alarms[0].bit, Some(3));
        assert_eq!(cfg.scheduler.dithers.len(), 5);
    }

    #[test]
    fn duplicate_subsystems_are_rejected() {
        let yaml = "subsystems:\n  - name: cam\n  - name: cam\n";
        assert!(matches!(parse_config(yaml, "mem"), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn malformed_yaml_is_an_error() {
        assert!(matches!(parse_config("watchdog: [1, 2", "mem"), Err(ConfigError::Parse { .. })));
    }

    #[tokio::test]
    async fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load_config_from(&dir.path().join("absent.yaml")).await.unwrap();
        assert_eq!(cfg.bus.port, 1883);
    }
}
