/**
 * COMMAND TABLE - Named operator commands
 *
 * ROLE:
 * Maps command names to async handlers. Used by the TCP command server;
 * every command is registered once at startup, validated at registration
 * and looked up at dispatch.
 *
 * OPERATION:
 * - Arity is checked before the handler runs; a mismatch returns the usage
 * - Handlers return `Result<String, CommandError>`; nothing is swallowed
 * - `help` is answered by the table itself
 */

use crate::context::ObservatoryContext;
use crate::controller::DeviceTrigger;
use crate::executor::ExecutorControl;
use crate::master::{MasterHandle, MasterTrigger};
use crate::schedule::{Schedule, ScheduleKind, SqliteScheduleStore, NIGHTLY};
use crate::worker::SubsystemHandle;
use futures::future::{BoxFuture, FutureExt};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum CommandError {
    #[error("empty command")]
    Empty,
    #[error("unknown command {0:?}")]
    Unknown(String),
    #[error("usage: {0}")]
    Usage(String),
    #[error("{0}")]
    Failed(String),
    #[error("invalid registration: {0}")]
    Registration(String),
}

pub type HandlerFuture = BoxFuture<'static, Result<String, CommandError>>;
pub type Handler = Arc<dyn Fn(Vec<String>) -> HandlerFuture + Send + Sync>;

/// Names handled by the connection loop, never by the table.
pub const RESERVED: &[&str] = &["help", "quit", "killserver"];

struct Entry {
    usage: String,
    help: String,
    min_args: usize,
    max_args: Option<usize>,
    handler: Handler,
}

#[derive(Default)]
pub struct CommandRegistry {
    entries: BTreeMap<String, Entry>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, Fut>(
        &mut self,
        name: &str,
        usage: &str,
        help: &str,
        arity: (usize, Option<usize>),
        f: F,
    ) -> Result<(), CommandError>
    where
        F: Fn(Vec<String>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, CommandError>> + Send + 'static,
    {
        let valid = !name.is_empty()
            && name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
        if !valid {
            return Err(CommandError::Registration(format!("bad command name {name:?}")));
        }
        if RESERVED.contains(&name) || self.entries.contains_key(name) {
            return Err(CommandError::Registration(format!("{name} already defined")));
        }
        let (min_args, max_args) = arity;
        if max_args.map(|m| m < min_args).unwrap_or(false) {
            return Err(CommandError::Registration(format!("{name}: max arity below min")));
        }
        let handler: Handler = Arc::new(move |args| f(args).boxed());
        self.entries.insert(
            name.to_string(),
            Entry { usage: usage.to_string(), help: help.to_string(), min_args, max_args, handler },
        );
        Ok(())
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    pub fn help(&self) -> String {
        self.entries
            .values()
            .map(|e| format!("{} - {}", e.usage, e.help))
            .collect::<Vec<_>>()
            .join("; ")
    }

    /// `args[0]` is the command name.
    pub async fn dispatch(&self, mut args: Vec<String>) -> Result<String, CommandError> {
        if args.is_empty() {
            return Err(CommandError::Empty);
        }
        let name = args.remove(0).to_ascii_lowercase();
        if name == "help" {
            return Ok(self.help());
        }
        let entry = self.entries.get(&name).ok_or(CommandError::Unknown(name))?;
        let too_many = entry.max_args.map(|m| args.len() > m).unwrap_or(false);
        if args.len() < entry.min_args || too_many {
            return Err(CommandError::Usage(entry.usage.clone()));
        }
        let handler = entry.handler.clone();
        handler(args).await
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<String, CommandError> {
    serde_json::to_string(value).map_err(|e| CommandError::Failed(e.to_string()))
}

fn failed(e: impl std::fmt::Display) -> CommandError {
    CommandError::Failed(e.to_string())
}

/// Operator arguments are JSON when they parse as JSON, strings otherwise.
pub fn parse_arg(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Everything the built-in commands act on.
#[derive(Clone)]
pub struct CommandServices {
    pub ctx: Arc<ObservatoryContext>,
    pub master: MasterHandle,
    pub subsystems: BTreeMap<String, SubsystemHandle>,
    pub executor: ExecutorControl,
}

async fn load_schedule(name: String, kind: ScheduleKind, path: PathBuf) -> Result<Schedule, CommandError> {
    tokio::task::spawn_blocking(move || {
        let store = SqliteScheduleStore::open(&path)?;
        Schedule::load(&name, kind, Box::new(store))
    })
    .await
    .map_err(failed)?
    .map_err(failed)
}

pub fn build_registry(services: CommandServices) -> Result<CommandRegistry, CommandError> {
    let mut reg = CommandRegistry::new();

    let s = services.clone();
    reg.register("status", "status", "observatory, executor and link summary", (0, Some(0)), move |_| {
        let s = s.clone();
        async move {
            let status = s.master.status();
            let snap = s.ctx.snapshot();
            let active_alarms = s.ctx.alarms.lock().iter().filter(|a| a.active).count();
            to_json(&json!({
                "state": status.state,
                "active_camera": status.active_camera,
                "cameras": status.cameras,
                "executor_running": s.executor.is_running(),
                "safe": s.ctx.safety.is_safe(),
                "subsystems_connected": snap.connected_count(),
                "subsystems_total": snap.subsystems.len(),
                "active_alarms": active_alarms,
            }))
        }
    })?;

    let s = services.clone();
    reg.register("state", "state [subsystem]", "telemetry snapshot", (0, Some(1)), move |args| {
        let s = s.clone();
        async move {
            let snap = s.ctx.snapshot();
            match args.first() {
                None => to_json(&snap.flatten()),
                Some(name) => match snap.subsystem(name) {
                    Some(st) => to_json(st),
                    None => Err(CommandError::Failed(format!("unknown subsystem {name}"))),
                },
            }
        }
    })?;

    let s = services.clone();
    reg.register("trigger", "trigger <name> [camera]", "fire an observatory trigger", (1, Some(2)), move |args| {
        let s = s.clone();
        async move {
            let trigger = MasterTrigger::parse(&args[0], args.get(1).map(String::as_str)).map_err(failed)?;
            let outcome = s.master.fire(trigger).await.map_err(failed)?;
            Ok(format!("{outcome} (now {})", s.master.status().state))
        }
    })?;

    let s = services.clone();
    reg.register("device", "device <camera> <trigger>", "fire a camera trigger (ENGINEERING only)", (2, Some(2)), move |args| {
        let s = s.clone();
        async move {
            let trigger: DeviceTrigger = args[1].parse().map_err(failed)?;
            let outcome = s.master.device(&args[0], trigger).await.map_err(failed)?;
            Ok(format!("{outcome:?}"))
        }
    })?;

    let s = services.clone();
    reg.register("send", "send <subsystem> <action> [args...]", "call a daemon command", (2, None), move |args| {
        let s = s.clone();
        async move {
            let handle = s
                .subsystems
                .get(&args[0])
                .ok_or_else(|| CommandError::Failed(format!("unknown subsystem {}", args[0])))?;
            let timeout = s
                .ctx
                .config
                .subsystem(&args[0])
                .map(|c| Duration::from_millis(c.call_timeout_ms))
                .unwrap_or(Duration::from_secs(1));
            let call_args = args[2..].iter().map(|a| parse_arg(a)).collect();
            let result = handle.request(&args[1], call_args, timeout).await.map_err(failed)?;
            Ok(result.to_string())
        }
    })?;

    let s = services.clone();
    reg.register("load_nightly", "load_nightly <path>", "load or replace the nightly schedule", (1, Some(1)), move |args| {
        let s = s.clone();
        async move {
            let schedule = load_schedule(NIGHTLY.into(), ScheduleKind::Nightly, PathBuf::from(&args[0])).await?;
            let n = schedule.len();
            s.executor.schedules().lock().set_nightly(schedule);
            Ok(format!("nightly loaded ({n} observations)"))
        }
    })?;

    let s = services.clone();
    reg.register("load_too", "load_too <name> <path>", "load a target-of-opportunity schedule", (2, Some(2)), move |args| {
        let s = s.clone();
        async move {
            if args[0] == NIGHTLY {
                return Err(CommandError::Failed("use load_nightly for the nightly schedule".into()));
            }
            let schedule =
                load_schedule(args[0].clone(), ScheduleKind::TargetOfOpportunity, PathBuf::from(&args[1])).await?;
            let n = schedule.len();
            s.executor.schedules().lock().add_too(schedule);
            Ok(format!("{} loaded ({n} observations)", args[0]))
        }
    })?;

    let s = services.clone();
    reg.register("unload_too", "unload_too <name>", "unload a schedule", (1, Some(1)), move |args| {
        let s = s.clone();
        async move {
            s.executor.schedules().lock().unload(&args[0]).map_err(failed)?;
            Ok(format!("{} unloaded", args[0]))
        }
    })?;

    let s = services.clone();
    reg.register("schedules", "schedules", "loaded schedules and their current observation", (0, Some(0)), move |_| {
        let s = s.clone();
        async move {
            let now = s.ctx.clock.mjd();
            let summaries = s.executor.schedules().lock().summaries(now);
            to_json(&summaries)
        }
    })?;

    let s = services.clone();
    reg.register("stop_schedule", "stop_schedule", "stop issuing schedule steps", (0, Some(0)), move |_| {
        let s = s.clone();
        async move {
            s.executor.stop();
            Ok("schedule executor stopped".to_string())
        }
    })?;

    let s = services.clone();
    reg.register("start_schedule", "start_schedule", "resume the schedule executor", (0, Some(0)), move |_| {
        let s = s.clone();
        async move {
            s.executor.start();
            Ok("schedule executor running".to_string())
        }
    })?;

    let s = services.clone();
    reg.register("alarms", "alarms", "decoded alarm records", (0, Some(0)), move |_| {
        let s = s.clone();
        async move {
            let records = s.ctx.alarms.lock().clone();
            to_json(&records)
        }
    })?;

    let s = services;
    reg.register("safety", "safety <ok|bad>", "set the weather safety flag", (1, Some(1)), move |args| {
        let s = s.clone();
        async move {
            let safe = match args[0].as_str() {
                "ok" | "good" | "safe" => true,
                "bad" | "unsafe" => false,
                _ => return Err(CommandError::Usage("safety <ok|bad>".into())),
            };
            s.ctx.safety.set(safe);
            Ok(format!("safety {}", if safe { "ok" } else { "bad" }))
        }
    })?;

    Ok(reg)
}
