// ABOUTME: Append-only JSONL audit log with size-based rotation.
// ABOUTME: Every negative outcome in the store and resolver is recorded here before it surfaces.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::warn;

/// Audit event identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditEvent {
    StateCorruptedParse,
    StateCorruptedParseBackup,
    StateHashMismatch,
    TasksHashMismatch,
    StateRecovered,
    StateRestoreFailed,
    StateWriteFailed,
    InvalidArguments,
    ConfigInvalid,
    LockBusy,
    LockFailed,
    LockStaleBroken,
    LockForceReleased,
    FailClosed,
    DeniedWeakening,
    GuardModeCorrupted,
}

impl AuditEvent {
    /// Event for a primary-record corruption code.
    pub fn for_code(code: &str) -> Self {
        match code {
            "STATE_HASH_MISMATCH" => Self::StateHashMismatch,
            "TASKS_HASH_MISMATCH" => Self::TasksHashMismatch,
            _ => Self::StateCorruptedParse,
        }
    }
}

/// One line of the audit log.
#[derive(Debug, Serialize)]
pub struct AuditEntry<'a> {
    pub event: AuditEvent,
    pub message: &'a str,
    pub timestamp: String,
    pub pid: u32,
    #[serde(flatten)]
    pub details: Map<String, Value>,
}

/// Size-rotated JSONL log.
#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
    max_bytes: u64,
    backups: usize,
}

impl AuditLog {
    pub fn new(path: PathBuf, max_bytes: u64, backups: usize) -> Self {
        Self {
            path,
            max_bytes,
            backups,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append an entry. Failures are reported through tracing and swallowed
    /// so auditing never masks the error being audited.
    pub fn record(&self, event: AuditEvent, message: &str, details: Value) {
        if let Err(e) = self.try_record(event, message, details) {
            warn!(path = %self.path.display(), error = %e, ?event, "failed to write audit entry");
        }
    }

    fn try_record(&self, event: AuditEvent, message: &str, details: Value) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        self.rotate_if_needed()?;

        let details = match details {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("details".to_string(), other);
                map
            }
        };
        let entry = AuditEntry {
            event,
            message,
            timestamp: Utc::now().to_rfc3339(),
            pid: std::process::id(),
            details,
        };
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        // Single write so concurrent appenders do not interleave within a line.
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    fn rotated_path(&self, generation: usize) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(format!(".{generation}"));
        PathBuf::from(name)
    }

    fn rotate_if_needed(&self) -> std::io::Result<()> {
        let size = match fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            Err(_) => return Ok(()),
        };
        if size < self.max_bytes {
            return Ok(());
        }
        if self.backups == 0 {
            return fs::remove_file(&self.path);
        }
        for generation in (1..self.backups).rev() {
            let from = self.rotated_path(generation);
            if from.exists() {
                fs::rename(&from, self.rotated_path(generation + 1))?;
            }
        }
        match fs::rename(&self.path, self.rotated_path(1)) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    /// Parse every current entry (oldest first). Used by operators and tests.
    pub fn entries(&self) -> Vec<Value> {
        fs::read_to_string(&self.path)
            .map(|content| {
                content
                    .lines()
                    .filter_map(|line| serde_json::from_str(line).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// True when any current entry carries `event`.
    pub fn contains(&self, event: AuditEvent) -> bool {
        let Ok(Value::String(name)) = serde_json::to_value(event) else {
            return false;
        };
        self.entries()
            .iter()
            .any(|e| e.get("event").and_then(Value::as_str) == Some(name.as_str()))
    }
}
