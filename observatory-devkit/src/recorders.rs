/*!
Recording stand-ins for the kernel's outward effects: alerts, process
kills and exposure records.
*/

use async_trait::async_trait;
use observatory_kernel::alerts::{AlertError, AlertSink};
use observatory_kernel::executor::{ExposureLog, ExposureRecord, RecordKind};
use observatory_kernel::watchdog::{ProcessKiller, WatchdogError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub struct Email {
    pub recipients: Vec<String>,
    pub subject: String,
    pub body: String,
}

#[derive(Default)]
pub struct RecordingAlertSink {
    posts: Mutex<Vec<(String, String)>>,
    emails: Mutex<Vec<Email>>,
}

impl RecordingAlertSink {
    pub fn posts(&self) -> Vec<(String, String)> {
        self.posts.lock().clone()
    }

    pub fn emails(&self) -> Vec<Email> {
        self.emails.lock().clone()
    }

    pub fn posted_containing(&self, needle: &str) -> usize {
        self.posts.lock().iter().filter(|(_, m)| m.contains(needle)).count()
    }
}

#[async_trait]
impl AlertSink for RecordingAlertSink {
    async fn post(&self, group: &str, message: &str) -> Result<(), AlertError> {
        self.posts.lock().push((group.to_string(), message.to_string()));
        Ok(())
    }

    async fn send_email(&self, recipients: &[String], subject: &str, body: &str) -> Result<(), AlertError> {
        self.emails.lock().push(Email {
            recipients: recipients.to_vec(),
            subject: subject.to_string(),
            body: body.to_string(),
        });
        Ok(())
    }
}

/// Pretends to terminate the matching process and remembers the request.
pub struct RecordingKiller {
    pid: u32,
    kills: Mutex<Vec<String>>,
    ambiguous: AtomicBool,
}

impl RecordingKiller {
    pub fn new(pid: u32) -> Self {
        Self { pid, kills: Mutex::new(Vec::new()), ambiguous: AtomicBool::new(false) }
    }

    /// Makes every kill fail as if two processes matched.
    pub fn set_ambiguous(&self, on: bool) {
        self.ambiguous.store(on, Ordering::SeqCst);
    }

    pub fn kills(&self) -> Vec<String> {
        self.kills.lock().clone()
    }
}

#[async_trait]
impl ProcessKiller for RecordingKiller {
    async fn kill_matching(&self, program: &str) -> Result<u32, WatchdogError> {
        if self.ambiguous.load(Ordering::SeqCst) {
            return Err(WatchdogError::Ambiguous { program: program.to_string(), pids: vec![self.pid, self.pid + 1] });
        }
        self.kills.lock().push(program.to_string());
        Ok(self.pid)
    }
}

/// Exposure log kept in memory; clones share the same records.
#[derive(Clone, Default)]
pub struct MemoryExposureLog {
    records: Arc<Mutex<Vec<ExposureRecord>>>,
    fail: Arc<AtomicBool>,
}

impl MemoryExposureLog {
    pub fn records(&self) -> Vec<ExposureRecord> {
        self.records.lock().clone()
    }

    pub fn visits(&self) -> Vec<ExposureRecord> {
        self.records.lock().iter().filter(|r| r.kind == RecordKind::Visit).cloned().collect()
    }

    /// Makes every following append fail.
    pub fn set_failing(&self, on: bool) {
        self.fail.store(on, Ordering::SeqCst);
    }
}

impl ExposureLog for MemoryExposureLog {
    fn append(&mut self, record: &ExposureRecord) -> std::io::Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full"));
        }
        self.records.lock().push(record.clone());
        Ok(())
    }
}
