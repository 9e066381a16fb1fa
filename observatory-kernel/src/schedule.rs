/**
 * SCHEDULES - Observation stores, cursors and the loaded schedule set
 *
 * ROLE:
 * A `Schedule` is a cursor over one backing store (SQLite `Summary` table in
 * production). The `ScheduleSet` holds the nightly baseline plus any number
 * of target-of-opportunity schedules and picks the best eligible
 * observation across all of them.
 *
 * OPERATION:
 * - Entries are kept sorted by `validStop`; the cursor skips entries that
 *   have expired or were observed
 * - Current observation: first entry with `validStart ≤ now < validStop`
 *   and not observed
 * - Selection ranks by `validStop` ascending, then priority descending,
 *   then load order (earliest loaded wins), then observation id
 * - Only the `observed` column is ever written back
 */

use crate::models::Observation;
use rusqlite::{params, Connection, OpenFlags};
use serde::Serialize;
use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("{0} has no Summary table")]
    MissingTable(String),
    #[error("observation {0} not found")]
    UnknownObservation(i64),
    #[error("no schedule named {0}")]
    NotLoaded(String),
    #[error("store rejected update: {0}")]
    Store(String),
}

pub trait ScheduleStore: Send {
    fn source(&self) -> String;
    fn load(&mut self) -> Result<Vec<Observation>, ScheduleError>;
    fn mark_observed(&mut self, id: i64) -> Result<(), ScheduleError>;
}

pub const SUMMARY_SCHEMA: &str = "CREATE TABLE IF NOT EXISTS Summary (
    obsHistID INTEGER PRIMARY KEY,
    raDeg REAL NOT NULL,
    decDeg REAL NOT NULL,
    filter TEXT NOT NULL,
    validStart REAL NOT NULL,
    validStop REAL NOT NULL,
    observed INTEGER NOT NULL DEFAULT 0,
    visitExpTime REAL NOT NULL,
    ditherNumber INTEGER NOT NULL DEFAULT 0,
    priority REAL NOT NULL DEFAULT 0
)";

pub fn create_summary_table(conn: &Connection) -> Result<(), ScheduleError> {
    conn.execute(SUMMARY_SCHEMA, [])?;
    Ok(())
}

pub fn insert_observation(conn: &Connection, o: &Observation) -> Result<(), ScheduleError> {
    conn.execute(
        "INSERT INTO Summary (obsHistID, raDeg, decDeg, filter, validStart, validStop, observed, visitExpTime, ditherNumber, priority)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            o.id,
            o.ra,
            o.dec,
            o.filter,
            o.valid_start,
            o.valid_stop,
            o.observed as i64,
            o.exposure_time,
            o.dither_number as i64,
            o.priority
        ],
    )?;
    Ok(())
}

/// Creates (or extends) a schedule file holding `rows`.
pub fn write_schedule_db(path: &Path, rows: &[Observation]) -> Result<(), ScheduleError> {
    let mut conn = Connection::open(path)?;
    create_summary_table(&conn)?;
    let tx = conn.transaction()?;
    for o in rows {
        insert_observation(&tx, o)?;
    }
    tx.commit()?;
    Ok(())
}

pub struct SqliteScheduleStore {
    path: PathBuf,
    conn: Connection,
    has_priority: bool,
}

impl SqliteScheduleStore {
    /// Opens an existing schedule file. The file is never created here.
    pub fn open(path: &Path) -> Result<Self, ScheduleError> {
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_WRITE)?;
        let tables: i64 = conn.query_row(
            "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND lower(name) = 'summary'",
            [],
            |r| r.get(0),
        )?;
        if tables == 0 {
            return Err(ScheduleError::MissingTable(path.display().to_string()));
        }
        let mut stmt = conn.prepare("PRAGMA table_info(Summary)")?;
        let columns: Vec<String> = stmt
            .query_map([], |r| r.get::<_, String>(1))?
            .collect::<Result<_, _>>()?;
        drop(stmt);
        let has_priority = columns.iter().any(|c| c.eq_ignore_ascii_case("priority"));
        Ok(Self { path: path.to_path_buf(), conn, has_priority })
    }
}

impl ScheduleStore for SqliteScheduleStore {
    fn source(&self) -> String {
        self.path.display().to_string()
    }

    fn load(&mut self) -> Result<Vec<Observation>, ScheduleError> {
        let priority = if self.has_priority { "priority" } else { "0.0" };
        let sql = format!(
            "SELECT obsHistID, raDeg, decDeg, filter, validStart, validStop, observed, visitExpTime, ditherNumber, {priority}
             FROM Summary ORDER BY validStop, obsHistID"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], |r| {
            Ok(Observation {
                id: r.get(0)?,
                ra: r.get(1)?,
                dec: r.get(2)?,
                filter: r.get(3)?,
                valid_start: r.get(4)?,
                valid_stop: r.get(5)?,
                observed: r.get::<_, Option<i64>>(6)?.unwrap_or(0) != 0,
                exposure_time: r.get(7)?,
                dither_number: r.get::<_, Option<i64>>(8)?.unwrap_or(0).max(0) as u32,
                priority: r.get::<_, Option<f64>>(9)?.unwrap_or(0.0),
            })
        })?;
        let observations = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(observations)
    }

    fn mark_observed(&mut self, id: i64) -> Result<(), ScheduleError> {
        let changed = self
            .conn
            .execute("UPDATE Summary SET observed = 1 WHERE obsHistID = ?1", params![id])?;
        if changed == 0 {
            return Err(ScheduleError::UnknownObservation(id));
        }
        Ok(())
    }
}

/// In-memory store, for replayed schedules and tests.
pub struct MemoryScheduleStore {
    name: String,
    rows: Vec<Observation>,
    pub fail_updates: bool,
}

impl MemoryScheduleStore {
    pub fn new(name: &str, rows: Vec<Observation>) -> Self {
        Self { name: name.to_string(), rows, fail_updates: false }
    }
}

impl ScheduleStore for MemoryScheduleStore {
    fn source(&self) -> String {
        format!("memory:{}", self.name)
    }

    fn load(&mut self) -> Result<Vec<Observation>, ScheduleError> {
        Ok(self.rows.clone())
    }

    fn mark_observed(&mut self, id: i64) -> Result<(), ScheduleError> {
        if self.fail_updates {
            return Err(ScheduleError::Store("read-only".into()));
        }
        let row = self.rows.iter_mut().find(|o| o.id == id).ok_or(ScheduleError::UnknownObservation(id))?;
        row.observed = true;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    Nightly,
    TargetOfOpportunity,
}

pub struct Schedule {
    name: String,
    kind: ScheduleKind,
    load_seq: u64,
    store: Box<dyn ScheduleStore>,
    entries: Vec<Observation>,
    cursor: usize,
}

fn by_valid_stop(a: &Observation, b: &Observation) -> Ordering {
    a.valid_stop.total_cmp(&b.valid_stop).then(a.id.cmp(&b.id))
}

impl Schedule {
    pub fn load(name: &str, kind: ScheduleKind, mut store: Box<dyn ScheduleStore>) -> Result<Self, ScheduleError> {
        let mut entries = store.load()?;
        let before = entries.len();
        entries.retain(|o| o.has_valid_window());
        if entries.len() != before {
            warn!("[schedule] {name}: dropped {} rows with validStart > validStop", before - entries.len());
        }
        entries.sort_by(by_valid_stop);
        info!("[schedule] loaded {name} from {} ({} observations)", store.source(), entries.len());
        Ok(Self { name: name.to_string(), kind, load_seq: 0, store, entries, cursor: 0 })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ScheduleKind {
        self.kind
    }

    pub fn load_seq(&self) -> u64 {
        self.load_seq
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Advances past entries that can never become eligible again and
    /// returns the current observation, if any.
    pub fn current(&mut self, now_mjd: f64) -> Option<&Observation> {
        while let Some(o) = self.entries.get(self.cursor) {
            if o.observed || o.is_expired(now_mjd) {
                self.cursor += 1;
            } else {
                break;
            }
        }
        self.entries[self.cursor..].iter().find(|o| o.is_eligible(now_mjd))
    }

    /// Writes `observed` to the store first; the local entry only changes
    /// once the store accepted it.
    pub fn mark_observed(&mut self, id: i64) -> Result<(), ScheduleError> {
        let idx = self
            .entries
            .iter()
            .position(|o| o.id == id)
            .ok_or(ScheduleError::UnknownObservation(id))?;
        self.store.mark_observed(id)?;
        self.entries[idx].observed = true;
        Ok(())
    }

    pub fn summary(&mut self, now_mjd: f64) -> ScheduleSummary {
        let current = self.current(now_mjd).map(|o| o.id);
        ScheduleSummary {
            name: self.name.clone(),
            kind: self.kind,
            load_seq: self.load_seq,
            source: self.store.source(),
            total: self.entries.len(),
            remaining: self.entries.iter().filter(|o| !o.observed && !o.is_expired(now_mjd)).count(),
            current,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduleSummary {
    pub name: String,
    pub kind: ScheduleKind,
    pub load_seq: u64,
    pub source: String,
    pub total: usize,
    pub remaining: usize,
    pub current: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub schedule: String,
    pub load_seq: u64,
    pub observation: Observation,
}

fn rank(a: &Selection, b: &Selection) -> Ordering {
    a.observation
        .valid_stop
        .total_cmp(&b.observation.valid_stop)
        .then(b.observation.priority.total_cmp(&a.observation.priority))
        .then(a.load_seq.cmp(&b.load_seq))
        .then(a.observation.id.cmp(&b.observation.id))
}

pub const NIGHTLY: &str = "nightly";

#[derive(Default)]
pub struct ScheduleSet {
    nightly: Option<Schedule>,
    toos: Vec<Schedule>,
    next_seq: u64,
}

impl ScheduleSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn stamp(&mut self, mut schedule: Schedule) -> Schedule {
        self.next_seq += 1;
        schedule.load_seq = self.next_seq;
        schedule
    }

    /// Replaces the nightly baseline.
    pub fn set_nightly(&mut self, schedule: Schedule) {
        let schedule = self.stamp(schedule);
        self.nightly = Some(schedule);
    }

    /// Adds a ToO schedule. Reloading a name replaces the old one and moves
    /// it to the back of the load order.
    pub fn add_too(&mut self, schedule: Schedule) {
        let schedule = self.stamp(schedule);
        self.toos.retain(|s| s.name != schedule.name);
        self.toos.push(schedule);
    }

    pub fn unload(&mut self, name: &str) -> Result<(), ScheduleError> {
        if name == NIGHTLY && self.nightly.is_some() {
            self.nightly = None;
            return Ok(());
        }
        let before = self.toos.len();
        self.toos.retain(|s| s.name != name);
        if self.toos.len() == before {
            return Err(ScheduleError::NotLoaded(name.to_string()));
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.nightly.is_none() && self.toos.is_empty()
    }

    fn all_mut(&mut self) -> impl Iterator<Item = &mut Schedule> {
        self.nightly.iter_mut().chain(self.toos.iter_mut())
    }

    /// Best eligible observation across every loaded schedule.
    pub fn select(&mut self, now_mjd: f64) -> Option<Selection> {
        self.all_mut()
            .filter_map(|s| {
                let (schedule, load_seq) = (s.name.clone(), s.load_seq);
                s.current(now_mjd).map(|o| Selection { schedule, load_seq, observation: o.clone() })
            })
            .min_by(rank)
    }

    pub fn mark_observed(&mut self, schedule: &str, id: i64) -> Result<(), ScheduleError> {
        self.all_mut()
            .find(|s| s.name == schedule)
            .ok_or_else(|| ScheduleError::NotLoaded(schedule.to_string()))?
            .mark_observed(id)
    }

    pub fn summaries(&mut self, now_mjd: f64) -> Vec<ScheduleSummary> {
        self.all_mut().map(|s| s.summary(now_mjd)).collect()
    }
}
