// ABOUTME: Directory-based advisory lock with owner metadata, bounded backoff, and stale breaking.
// ABOUTME: The guard releases on drop; inspect/force-unlock break locks left by crashed holders.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, warn};

use super::audit::{AuditEvent, AuditLog};
use super::types::LockOwnership;
use crate::error::{GuardError, Result};

const OWNER_FILE: &str = "owner.json";

/// Retry and staleness policy for lock acquisition.
#[derive(Debug, Clone)]
pub struct LockSettings {
    pub retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub stale_after: Duration,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            retries: 50,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(500),
            stale_after: Duration::from_secs(30),
        }
    }
}

impl LockSettings {
    fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// A held lock. Dropping it removes the lock directory.
#[derive(Debug)]
pub struct DirLock {
    path: PathBuf,
}

impl DirLock {
    /// Acquire the lock at `path`, retrying with backoff.
    ///
    /// Locks older than `settings.stale_after` are broken. Exhausting the
    /// retry budget records `LOCK_BUSY` and returns [`GuardError::LockBusy`].
    pub fn acquire(
        path: &Path,
        task_id: Option<&str>,
        settings: &LockSettings,
        audit: &AuditLog,
    ) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let attempts = settings.retries + 1;
        for attempt in 0..attempts {
            match fs::create_dir(path) {
                Ok(()) => {
                    let lock = Self {
                        path: path.to_path_buf(),
                    };
                    lock.write_owner(task_id)?;
                    debug!(path = %path.display(), attempt, "lock acquired");
                    return Ok(lock);
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if break_if_stale(path, settings.stale_after, audit) {
                        continue;
                    }
                    if attempt + 1 < attempts {
                        thread::sleep(settings.delay_for(attempt));
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        let owner = read_owner(path);
        audit.record(
            AuditEvent::LockBusy,
            "lock acquisition exhausted retries",
            json!({
                "lockPath": path.display().to_string(),
                "attempts": attempts,
                "owner": owner,
            }),
        );
        Err(GuardError::LockBusy {
            path: path.to_path_buf(),
            attempts,
        })
    }

    fn write_owner(&self, task_id: Option<&str>) -> Result<()> {
        let owner = current_owner(task_id);
        let content = serde_json::to_vec_pretty(&owner)?;
        // A failed owner write must not strand the directory.
        if let Err(e) = fs::write(self.path.join(OWNER_FILE), content) {
            let _ = fs::remove_dir_all(&self.path);
            return Err(e.into());
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_all(&self.path) {
            if e.kind() != ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "failed to release lock");
            }
        }
    }
}

/// Ownership record for the calling process.
pub fn current_owner(task_id: Option<&str>) -> LockOwnership {
    LockOwnership {
        task_id: task_id.map(str::to_string),
        pid: std::process::id(),
        host: current_host(),
        started_at: Utc::now().to_rfc3339(),
    }
}

pub fn current_host() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string())
}

fn read_owner(path: &Path) -> Option<LockOwnership> {
    let content = fs::read(path.join(OWNER_FILE)).ok()?;
    serde_json::from_slice(&content).ok()
}

/// Age from the owner's `startedAt`, falling back to the directory mtime.
fn lock_age(path: &Path, owner: Option<&LockOwnership>) -> Option<Duration> {
    if let Some(started) = owner.and_then(|o| DateTime::parse_from_rfc3339(&o.started_at).ok()) {
        let elapsed = Utc::now().signed_duration_since(started.with_timezone(&Utc));
        return Some(elapsed.to_std().unwrap_or(Duration::ZERO));
    }
    let modified = fs::metadata(path).and_then(|m| m.modified()).ok()?;
    SystemTime::now().duration_since(modified).ok()
}

/// Break a stale lock. Returns true when the caller should retry at once.
fn break_if_stale(path: &Path, stale_after: Duration, audit: &AuditLog) -> bool {
    let owner = read_owner(path);
    let Some(age) = lock_age(path, owner.as_ref()) else {
        // Vanished between create_dir and inspection.
        return !path.exists();
    };
    if age < stale_after {
        return false;
    }

    // Move aside first so only one breaker wins.
    let graveyard = path.with_extension(format!("stale.{}", std::process::id()));
    match fs::rename(path, &graveyard) {
        Ok(()) => {
            let _ = fs::remove_dir_all(&graveyard);
            audit.record(
                AuditEvent::LockStaleBroken,
                "broke stale lock",
                json!({
                    "lockPath": path.display().to_string(),
                    "ageMs": age.as_millis() as u64,
                    "owner": owner,
                }),
            );
            true
        }
        Err(e) if e.kind() == ErrorKind::NotFound => true,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to break stale lock");
            false
        }
    }
}

/// What `inspect` found at a lock path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockInspection {
    pub present: bool,
    pub owner: Option<LockOwnership>,
    pub age: Option<Duration>,
}

pub fn inspect(path: &Path) -> LockInspection {
    if !path.exists() {
        return LockInspection {
            present: false,
            owner: None,
            age: None,
        };
    }
    let owner = read_owner(path);
    let age = lock_age(path, owner.as_ref());
    LockInspection {
        present: true,
        owner,
        age,
    }
}

/// Flags for [`force_unlock`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnlockOptions {
    /// Actually remove the lock; otherwise only report.
    pub force: bool,
    /// Allow removing a lock recorded for another pid/host.
    pub override_owner: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnlockOutcome {
    NotLocked,
    Reported(LockInspection),
    Removed(LockInspection),
}

/// Diagnose and optionally remove a lock.
pub fn force_unlock(path: &Path, options: UnlockOptions, audit: &AuditLog) -> Result<UnlockOutcome> {
    let inspection = inspect(path);
    if !inspection.present {
        return Ok(UnlockOutcome::NotLocked);
    }
    if !options.force {
        return Ok(UnlockOutcome::Reported(inspection));
    }

    if let Some(owner) = &inspection.owner {
        let foreign = owner.pid != std::process::id() || owner.host != current_host();
        if foreign && !options.override_owner {
            return Err(GuardError::LockOwnedByOther {
                path: path.to_path_buf(),
                pid: owner.pid,
                host: owner.host.clone(),
            });
        }
    }

    match fs::remove_dir_all(path) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    audit.record(
        AuditEvent::LockForceReleased,
        "lock removed by force-unlock",
        json!({
            "lockPath": path.display().to_string(),
            "owner": inspection.owner,
            "overrideOwner": options.override_owner,
        }),
    );
    Ok(UnlockOutcome::Removed(inspection))
}
