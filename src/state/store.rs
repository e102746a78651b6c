// ABOUTME: Durable task-state and guard-mode storage — locked atomic writes, hash-verified reads.
// ABOUTME: Rotates generational backups on every write and restores the newest valid one on corruption.

use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::audit::{AuditEvent, AuditLog};
use super::hash::{compute_state_hash, tasks_document_hash};
use super::lock::{self, DirLock, LockInspection, LockSettings, UnlockOptions, UnlockOutcome};
use super::types::{Corruption, GuardMode, GuardModeState, ReadOutcome, TaskState};
use crate::config::Config;
use crate::error::{GuardError, Result};
use crate::paths;

/// File layout inside the state directory.
#[derive(Debug, Clone)]
pub struct StatePaths {
    pub dir: PathBuf,
    pub state_file: PathBuf,
    pub guard_mode_file: PathBuf,
    pub lock_dir: PathBuf,
    pub policy_file: PathBuf,
}

impl StatePaths {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            state_file: dir.join("state.json"),
            guard_mode_file: dir.join("guard-mode.json"),
            lock_dir: dir.join("state.lock"),
            policy_file: dir.join("policy.json"),
            dir,
        }
    }
}

/// A temporary file removed on drop unless it was renamed into place.
struct TempFile {
    path: PathBuf,
    armed: bool,
}

impl TempFile {
    fn beside(target: &Path) -> Self {
        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            path: target.with_file_name(format!("{name}.{}.tmp", std::process::id())),
            armed: true,
        }
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = fs::remove_file(&self.path) {
                if e.kind() != ErrorKind::NotFound {
                    warn!(path = %self.path.display(), error = %e, "failed to remove temp file");
                }
            }
        }
    }
}

/// Write `bytes` to a temp file beside `path` and rename it over `path`.
fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut tmp = TempFile::beside(path);
    let mut file = File::create(&tmp.path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);
    fs::rename(&tmp.path, path)?;
    tmp.armed = false;
    Ok(())
}

/// Lock-protected, integrity-checked store for the active task and guard mode.
#[derive(Debug, Clone)]
pub struct StateStore {
    paths: StatePaths,
    tasks_document: PathBuf,
    backups: usize,
    lock: LockSettings,
    audit: AuditLog,
}

impl StateStore {
    pub fn new(
        paths: StatePaths,
        tasks_document: PathBuf,
        backups: usize,
        lock: LockSettings,
        audit: AuditLog,
    ) -> Self {
        Self {
            paths,
            tasks_document,
            backups,
            lock,
            audit,
        }
    }

    /// Build a store rooted in `worktree`. The state directory and task
    /// document must resolve inside the worktree.
    pub fn from_config(config: &Config, worktree: &Path) -> Result<Self> {
        let dir = paths::validate_containment(&config.state.dir, worktree)?;
        let tasks_document = paths::validate_containment(&config.state.tasks_file, worktree)?;
        let audit = AuditLog::new(
            dir.join(&config.audit.file),
            config.audit.max_bytes,
            config.audit.backups,
        );
        Ok(Self::new(
            StatePaths::new(dir),
            tasks_document,
            config.state.backups,
            config.lock_settings(),
            audit,
        ))
    }

    pub fn paths(&self) -> &StatePaths {
        &self.paths
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// Backup generations for `path`, newest first: `.bak`, `.bak.1`, ...
    pub fn backup_paths(&self, path: &Path) -> Vec<PathBuf> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        (0..self.backups)
            .map(|generation| match generation {
                0 => path.with_file_name(format!("{name}.bak")),
                n => path.with_file_name(format!("{name}.bak.{n}")),
            })
            .collect()
    }

    fn acquire(&self, task_id: Option<&str>) -> Result<DirLock> {
        DirLock::acquire(&self.paths.lock_dir, task_id, &self.lock, &self.audit).inspect_err(|e| {
            // Exhausted retries are already audited as LOCK_BUSY.
            if !matches!(e, GuardError::LockBusy { .. }) {
                self.audit.record(
                    AuditEvent::LockFailed,
                    "lock could not be acquired",
                    json!({
                        "path": self.paths.lock_dir.display().to_string(),
                        "error": e.to_string(),
                    }),
                );
            }
        })
    }

    // ── Task state ───────────────────────────────────────────────────────

    /// Persist `state`, filling in `tasksMdHash` and `stateHash`.
    pub fn write_state(&self, state: &TaskState) -> Result<TaskState> {
        if state.active_task_id.trim().is_empty() {
            let err = GuardError::InvalidArguments("activeTaskId must not be empty".to_string());
            self.audit.record(
                AuditEvent::InvalidArguments,
                "state write rejected",
                json!({ "error": err.to_string() }),
            );
            return Err(err);
        }
        let _lock = self.acquire(Some(&state.active_task_id))?;
        self.write_state_locked(state)
            .inspect_err(|e| self.audit_write_failure(&self.paths.state_file, e))
    }

    fn write_state_locked(&self, state: &TaskState) -> Result<TaskState> {
        let mut record = state.clone();
        record.tasks_md_hash = Some(tasks_document_hash(&self.tasks_document)?);
        record.state_hash = None;
        record.state_hash = Some(compute_state_hash(&record)?);
        let bytes = serde_json::to_vec_pretty(&record)?;
        self.replace(&self.paths.state_file, &bytes)?;
        debug!(task = %record.active_task_id, "state written");
        Ok(record)
    }

    /// Read and verify the task state, recovering from backups if needed.
    pub fn read_state(&self) -> ReadOutcome<TaskState> {
        self.read_state_inner(false)
    }

    fn read_state_inner(&self, lock_held: bool) -> ReadOutcome<TaskState> {
        self.read_verified(
            &self.paths.state_file,
            |bytes| self.verify_task_state(bytes),
            None,
            lock_held,
        )
    }

    /// Remove the active task. The last state is kept as the newest backup.
    pub fn clear_state(&self) -> Result<bool> {
        let _lock = self.acquire(None)?;
        let path = &self.paths.state_file;
        if !path.exists() {
            return Ok(false);
        }
        let result = self.rotate_backups(path).and_then(|()| {
            fs::remove_file(path)?;
            Ok(true)
        });
        result.inspect_err(|e| self.audit_write_failure(path, e))
    }

    /// Bump `validationAttempts` under the lock and return the new count.
    pub fn increment_validation_attempts(&self) -> Result<u32> {
        let _lock = self.acquire(None)?;
        let mut state = match self.read_state_inner(true) {
            ReadOutcome::Ok(state) | ReadOutcome::Recovered { value: state, .. } => state,
            ReadOutcome::NotFound => {
                return Err(GuardError::InvalidArguments(
                    "no active task to record a validation attempt for".to_string(),
                ));
            }
            ReadOutcome::Corrupted(cause) => {
                return Err(GuardError::StateCorrupted {
                    code: cause.code(),
                    message: cause.to_string(),
                });
            }
        };
        state.validation_attempts += 1;
        let written = self
            .write_state_locked(&state)
            .inspect_err(|e| self.audit_write_failure(&self.paths.state_file, e))?;
        Ok(written.validation_attempts)
    }

    fn verify_task_state(&self, bytes: &[u8]) -> std::result::Result<TaskState, Corruption> {
        let value: Value =
            serde_json::from_slice(bytes).map_err(|e| Corruption::Parse(e.to_string()))?;
        let mut state: TaskState =
            serde_json::from_value(value).map_err(|e| Corruption::Schema(e.to_string()))?;
        if state.active_task_id.trim().is_empty() {
            return Err(Corruption::Schema("activeTaskId is empty".to_string()));
        }

        let current_tasks = tasks_document_hash(&self.tasks_document).map_err(|e| {
            Corruption::Schema(format!("cannot hash task document: {e}"))
        })?;
        let recomputed = compute_state_hash(&state).map_err(|e| Corruption::Schema(e.to_string()))?;

        match (&state.state_hash, &state.tasks_md_hash) {
            (Some(stored), Some(tasks)) => {
                if *stored != recomputed {
                    return Err(Corruption::StateHashMismatch);
                }
                if *tasks != current_tasks {
                    return Err(Corruption::TasksHashMismatch);
                }
            }
            _ => {
                debug!(task = %state.active_task_id, "migrating legacy state without hashes");
                state.tasks_md_hash = Some(current_tasks);
                state.state_hash = None;
                state.state_hash =
                    Some(compute_state_hash(&state).map_err(|e| Corruption::Schema(e.to_string()))?);
            }
        }
        Ok(state)
    }

    // ── Guard mode ───────────────────────────────────────────────────────

    pub fn write_guard_mode(&self, mode: GuardMode, updated_by: &str) -> Result<GuardModeState> {
        let record = GuardModeState {
            mode,
            updated_at: Utc::now().to_rfc3339(),
            updated_by: updated_by.to_string(),
        };
        let _lock = self.acquire(None)?;
        let path = &self.paths.guard_mode_file;
        serde_json::to_vec_pretty(&record)
            .map_err(GuardError::from)
            .and_then(|bytes| self.replace(path, &bytes))
            .inspect_err(|e| self.audit_write_failure(path, e))?;
        Ok(record)
    }

    pub fn read_guard_mode(&self) -> ReadOutcome<GuardModeState> {
        self.read_verified(
            &self.paths.guard_mode_file,
            |bytes| {
                let value: Value =
                    serde_json::from_slice(bytes).map_err(|e| Corruption::Parse(e.to_string()))?;
                serde_json::from_value(value).map_err(|e| Corruption::Schema(e.to_string()))
            },
            Some(AuditEvent::GuardModeCorrupted),
            false,
        )
    }

    // ── Locks ────────────────────────────────────────────────────────────

    pub fn inspect_lock(&self) -> LockInspection {
        lock::inspect(&self.paths.lock_dir)
    }

    pub fn force_unlock(&self, options: UnlockOptions) -> Result<UnlockOutcome> {
        lock::force_unlock(&self.paths.lock_dir, options, &self.audit)
    }

    // ── Shared machinery ─────────────────────────────────────────────────

    /// Rotate backups, then atomically replace `path`. Caller holds the lock.
    fn replace(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        self.rotate_backups(path)?;
        atomic_write(path, bytes)
    }

    /// Shift `.bak` → `.bak.1` → ... and copy the current primary into `.bak`.
    fn rotate_backups(&self, path: &Path) -> Result<()> {
        let generations = self.backup_paths(path);
        let Some(newest) = generations.first() else {
            return Ok(());
        };
        if !path.exists() {
            return Ok(());
        }
        if let Some(oldest) = generations.last() {
            match fs::remove_file(oldest) {
                Err(e) if e.kind() != ErrorKind::NotFound => return Err(e.into()),
                _ => {}
            }
        }
        for i in (1..generations.len()).rev() {
            match fs::rename(&generations[i - 1], &generations[i]) {
                Err(e) if e.kind() != ErrorKind::NotFound => return Err(e.into()),
                _ => {}
            }
        }
        atomic_write(newest, &fs::read(path)?)
    }

    fn read_verified<T, F>(
        &self,
        path: &Path,
        verify: F,
        primary_event: Option<AuditEvent>,
        lock_held: bool,
    ) -> ReadOutcome<T>
    where
        F: Fn(&[u8]) -> std::result::Result<T, Corruption>,
    {
        let cause = match fs::read(path) {
            Ok(bytes) => match verify(&bytes) {
                Ok(value) => return ReadOutcome::Ok(value),
                Err(cause) => cause,
            },
            Err(e) if e.kind() == ErrorKind::NotFound => return ReadOutcome::NotFound,
            Err(e) => Corruption::Parse(e.to_string()),
        };

        self.audit.record(
            primary_event.unwrap_or_else(|| AuditEvent::for_code(cause.code())),
            "stored record failed verification",
            json!({
                "path": path.display().to_string(),
                "code": cause.code(),
                "error": cause.to_string(),
            }),
        );

        for backup in self.backup_paths(path) {
            let bytes = match fs::read(&backup) {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => {
                    self.audit_backup_failure(&backup, &e.to_string());
                    continue;
                }
            };
            match verify(&bytes) {
                Ok(value) => {
                    let from_backup = backup
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    if let Some(fresh) = self.restore(&backup, path, &bytes, lock_held, &verify) {
                        return ReadOutcome::Ok(fresh);
                    }
                    return ReadOutcome::Recovered {
                        value,
                        from_backup,
                        cause,
                    };
                }
                Err(backup_cause) => {
                    self.audit_backup_failure(&backup, &backup_cause.to_string());
                }
            }
        }
        ReadOutcome::Corrupted(cause)
    }

    /// Copy a validated backup onto the primary path under the lock.
    ///
    /// When the lock has to be taken here, the primary is checked again once
    /// it is held: a writer may have replaced it since it was read. A primary
    /// that now verifies is kept and returned instead.
    fn restore<T, F>(
        &self,
        backup: &Path,
        path: &Path,
        bytes: &[u8],
        lock_held: bool,
        verify: &F,
    ) -> Option<T>
    where
        F: Fn(&[u8]) -> std::result::Result<T, Corruption>,
    {
        let result = if lock_held {
            atomic_write(path, bytes).map(|()| None)
        } else {
            self.acquire(None).and_then(|_lock| {
                if let Some(fresh) = fs::read(path).ok().and_then(|current| verify(&current).ok()) {
                    return Ok(Some(fresh));
                }
                atomic_write(path, bytes).map(|()| None)
            })
        };
        match result {
            Ok(Some(fresh)) => {
                debug!(path = %path.display(), "primary rewritten since it was read; restore skipped");
                Some(fresh)
            }
            Ok(None) => {
                self.audit.record(
                    AuditEvent::StateRecovered,
                    "restored record from backup",
                    json!({
                        "path": path.display().to_string(),
                        "backup": backup.display().to_string(),
                    }),
                );
                None
            }
            Err(e) => {
                self.audit.record(
                    AuditEvent::StateRestoreFailed,
                    "backup validated but could not be restored",
                    json!({
                        "path": path.display().to_string(),
                        "backup": backup.display().to_string(),
                        "error": e.to_string(),
                    }),
                );
                None
            }
        }
    }

    fn audit_backup_failure(&self, backup: &Path, error: &str) {
        self.audit.record(
            AuditEvent::StateCorruptedParseBackup,
            "backup failed verification",
            json!({
                "backup": backup.display().to_string(),
                "error": error,
            }),
        );
    }

    fn audit_write_failure(&self, path: &Path, error: &GuardError) {
        self.audit.record(
            AuditEvent::StateWriteFailed,
            "write failed",
            json!({
                "path": path.display().to_string(),
                "error": error.to_string(),
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn store_in(dir: &Path) -> StateStore {
        let state_dir = dir.join("state");
        StateStore::new(
            StatePaths::new(state_dir.clone()),
            dir.join("specs/tasks.md"),
            3,
            LockSettings {
                retries: 200,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(10),
                stale_after: Duration::from_secs(30),
            },
            AuditLog::new(state_dir.join("audit.log"), 1 << 20, 2),
        )
    }

    fn sample(id: &str) -> TaskState {
        TaskState::new(id, vec!["src/auth/**".to_string()], "tester").with_title("Auth work")
    }

    #[test]
    fn write_then_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let original = sample("T-1");
        let written = store.write_state(&original).unwrap();

        let read = store.read_state();
        let loaded = match read {
            ReadOutcome::Ok(state) => state,
            other => panic!("expected Ok, got {:?}", other),
        };
        assert_eq!(loaded, written);
        assert_eq!(loaded.active_task_id, original.active_task_id);
        assert_eq!(loaded.allowed_scopes, original.allowed_scopes);
        assert_eq!(loaded.tasks_md_hash.as_deref(), Some(""));
        assert_eq!(loaded.state_hash.as_ref().unwrap().len(), 64);
    }

    #[test]
    fn missing_state_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(store_in(dir.path()).read_state(), ReadOutcome::NotFound);
    }

    #[test]
    fn write_leaves_no_temp_file_and_rotates_backups() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        for i in 0..5 {
            store.write_state(&sample(&format!("T-{i}"))).unwrap();
        }
        let state_dir = dir.path().join("state");
        let names: Vec<String> = fs::read_dir(&state_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        assert!(!names.iter().any(|n| n.ends_with(".tmp")), "{names:?}");
        assert!(!names.iter().any(|n| n == "state.lock"), "{names:?}");
        assert!(names.contains(&"state.json.bak".to_string()));
        assert!(names.contains(&"state.json.bak.1".to_string()));
        assert!(names.contains(&"state.json.bak.2".to_string()));
        assert!(!names.contains(&"state.json.bak.3".to_string()));

        let bak: TaskState =
            serde_json::from_slice(&fs::read(state_dir.join("state.json.bak")).unwrap()).unwrap();
        assert_eq!(bak.active_task_id, "T-3");
        let oldest: TaskState =
            serde_json::from_slice(&fs::read(state_dir.join("state.json.bak.2")).unwrap()).unwrap();
        assert_eq!(oldest.active_task_id, "T-1");
    }

    #[test]
    fn failed_rename_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("occupied");
        fs::create_dir_all(target.join("child")).unwrap();

        assert!(atomic_write(&target, b"{}").is_err());
        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["occupied".to_string()]);
        assert!(target.is_dir());
    }

    #[test]
    fn tampered_state_is_hash_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        store.write_state(&sample("T-1")).unwrap();

        let path = &store.paths().state_file;
        let mut value: Value = serde_json::from_slice(&fs::read(path).unwrap()).unwrap();
        value["allowedScopes"] = json!(["**"]);
        fs::write(path, serde_json::to_vec(&value).unwrap()).unwrap();

        assert_eq!(
            store.read_state(),
            ReadOutcome::Corrupted(Corruption::StateHashMismatch)
        );
        assert!(store.audit().contains(AuditEvent::StateHashMismatch));
    }

    #[test]
    fn edited_task_document_is_tasks_hash_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("specs")).unwrap();
        fs::write(dir.path().join("specs/tasks.md"), "- [ ] T-1").unwrap();
        let store = store_in(dir.path());
        store.write_state(&sample("T-1")).unwrap();

        fs::write(dir.path().join("specs/tasks.md"), "- [x] T-1").unwrap();
        assert_eq!(
            store.read_state(),
            ReadOutcome::Corrupted(Corruption::TasksHashMismatch)
        );
    }

    #[test]
    fn corrupt_primary_recovers_from_bak() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        store.write_state(&sample("T-1")).unwrap();
        store.write_state(&sample("T-2")).unwrap();

        fs::write(&store.paths().state_file, "{ truncated").unwrap();
        match store.read_state() {
            ReadOutcome::Recovered {
                value,
                from_backup,
                cause,
            } => {
                assert_eq!(value.active_task_id, "T-1");
                assert_eq!(from_backup, "state.json.bak");
                assert!(matches!(cause, Corruption::Parse(_)));
            }
            other => panic!("expected Recovered, got {:?}", other),
        }
        // The primary was restored, so the next read is clean.
        assert!(matches!(store.read_state(), ReadOutcome::Ok(_)));
        assert!(store.audit().contains(AuditEvent::StateCorruptedParse));
        assert!(store.audit().contains(AuditEvent::StateRecovered));
    }

    #[test]
    fn corrupt_primary_and_bak_recovers_from_bak1() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        for id in ["T-1", "T-2", "T-3"] {
            store.write_state(&sample(id)).unwrap();
        }
        fs::write(&store.paths().state_file, "garbage").unwrap();
        let bak = store.backup_paths(&store.paths().state_file)[0].clone();
        fs::write(&bak, "{}").unwrap();

        match store.read_state() {
            ReadOutcome::Recovered {
                value, from_backup, ..
            } => {
                assert_eq!(value.active_task_id, "T-1");
                assert_eq!(from_backup, "state.json.bak.1");
            }
            other => panic!("expected Recovered, got {:?}", other),
        }
        assert!(store.audit().contains(AuditEvent::StateCorruptedParseBackup));
    }

    #[test]
    fn no_valid_backup_stays_corrupted() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        store.write_state(&sample("T-1")).unwrap();
        fs::write(&store.paths().state_file, r#"{"version":1}"#).unwrap();

        match store.read_state() {
            ReadOutcome::Corrupted(Corruption::Schema(_)) => {}
            other => panic!("expected schema corruption, got {:?}", other),
        }
    }

    #[test]
    fn legacy_record_is_migrated() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        fs::create_dir_all(&store.paths().dir).unwrap();
        fs::write(
            &store.paths().state_file,
            r#"{"version":1,"activeTaskId":"T-7","allowedScopes":["docs/**"],"startedAt":"t","startedBy":"u"}"#,
        )
        .unwrap();

        match store.read_state() {
            ReadOutcome::Ok(state) => {
                assert_eq!(state.active_task_id, "T-7");
                assert_eq!(state.tasks_md_hash.as_deref(), Some(""));
                assert!(state.state_hash.is_some());
            }
            other => panic!("expected Ok, got {:?}", other),
        }
    }

    #[test]
    fn empty_task_id_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        assert!(matches!(
            store.write_state(&sample("  ")),
            Err(GuardError::InvalidArguments(_))
        ));
        assert!(store.audit().contains(AuditEvent::InvalidArguments));
    }

    #[test]
    fn restore_keeps_a_primary_rewritten_after_the_failed_read() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        store.write_state(&sample("T-1")).unwrap();
        store.write_state(&sample("T-2")).unwrap();
        let path = store.paths().state_file.clone();
        let backup = store.backup_paths(&path)[0].clone();
        let stale = fs::read(&backup).unwrap();

        // A reader saw a corrupt primary, then a writer landed T-3 before
        // the reader got the lock.
        store.write_state(&sample("T-3")).unwrap();
        let verify = |bytes: &[u8]| store.verify_task_state(bytes);
        let fresh = store.restore(&backup, &path, &stale, false, &verify).unwrap();
        assert_eq!(fresh.active_task_id, "T-3");
        assert_eq!(
            store.read_state().into_value().unwrap().active_task_id,
            "T-3"
        );
        assert!(!store.audit().contains(AuditEvent::StateRecovered));

        fs::write(&path, "garbage").unwrap();
        assert!(store.restore(&backup, &path, &stale, false, &verify).is_none());
        assert_eq!(
            store.read_state().into_value().unwrap().active_task_id,
            "T-1"
        );
        assert!(store.audit().contains(AuditEvent::StateRecovered));
    }

    #[test]
    fn lock_io_failure_is_audited() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("blocker"), "not a directory").unwrap();
        let mut paths = StatePaths::new(dir.path().join("state"));
        paths.lock_dir = dir.path().join("blocker/state.lock");
        let store = StateStore::new(
            paths,
            dir.path().join("specs/tasks.md"),
            3,
            LockSettings::default(),
            AuditLog::new(dir.path().join("state/audit.log"), 1 << 20, 2),
        );

        let err = store.write_state(&sample("T-1")).unwrap_err();
        assert!(!matches!(err, GuardError::LockBusy { .. }));
        assert!(store.audit().contains(AuditEvent::LockFailed));
    }

    #[test]
    fn clear_state_keeps_backup() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        store.write_state(&sample("T-1")).unwrap();
        assert!(store.clear_state().unwrap());
        assert_eq!(store.read_state(), ReadOutcome::NotFound);
        assert!(store.backup_paths(&store.paths().state_file)[0].exists());
        assert!(!store.clear_state().unwrap());
    }

    #[test]
    fn validation_attempts_increment() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        assert!(matches!(
            store.increment_validation_attempts(),
            Err(GuardError::InvalidArguments(_))
        ));
        store.write_state(&sample("T-1")).unwrap();
        assert_eq!(store.increment_validation_attempts().unwrap(), 1);
        assert_eq!(store.increment_validation_attempts().unwrap(), 2);
        assert_eq!(
            store.read_state().into_value().unwrap().validation_attempts,
            2
        );
    }

    #[test]
    fn increment_on_unrecoverable_state_errors() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        fs::create_dir_all(&store.paths().dir).unwrap();
        fs::write(&store.paths().state_file, "nope").unwrap();
        assert!(matches!(
            store.increment_validation_attempts(),
            Err(GuardError::StateCorrupted {
                code: "STATE_CORRUPTED_PARSE",
                ..
            })
        ));
    }

    #[test]
    fn guard_mode_roundtrip_and_recovery() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        assert_eq!(store.read_guard_mode(), ReadOutcome::NotFound);

        store.write_guard_mode(GuardMode::Warn, "alice").unwrap();
        store.write_guard_mode(GuardMode::Block, "bob").unwrap();
        let current = store.read_guard_mode().into_value().unwrap();
        assert_eq!(current.mode, GuardMode::Block);
        assert_eq!(current.updated_by, "bob");

        fs::write(&store.paths().guard_mode_file, "???").unwrap();
        match store.read_guard_mode() {
            ReadOutcome::Recovered { value, .. } => assert_eq!(value.mode, GuardMode::Warn),
            other => panic!("expected Recovered, got {:?}", other),
        }
        assert!(store.audit().contains(AuditEvent::GuardModeCorrupted));
    }

    #[test]
    fn write_fails_fast_when_lock_is_held() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(dir.path());
        store.lock.retries = 1;
        let _held = store.acquire(None).unwrap();
        assert!(matches!(
            store.write_state(&sample("T-1")),
            Err(GuardError::LockBusy { .. })
        ));
        assert!(store.audit().contains(AuditEvent::LockBusy));
    }
}
