// ABOUTME: Persisted record types — active task state, guard-mode override, lock ownership.
// ABOUTME: Also the read outcome and corruption taxonomy returned by the state store.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Current on-disk schema version of [`TaskState`].
pub const STATE_VERSION: u32 = 1;

/// Enforcement strictness. Ordered `Disabled < Warn < Block`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuardMode {
    Disabled,
    Warn,
    Block,
}

impl GuardMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::Warn => "warn",
            Self::Block => "block",
        }
    }
}

impl fmt::Display for GuardMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GuardMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "disabled" | "off" | "none" => Ok(Self::Disabled),
            "warn" | "warning" => Ok(Self::Warn),
            "block" | "strict" | "enforce" => Ok(Self::Block),
            other => Err(format!("unknown guard mode {other:?}")),
        }
    }
}

/// Role attached to the active task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// May edit anything under the spec tree, nothing outside it.
    Architect,
    /// May only touch the task list inside the spec tree.
    Implementer,
}

/// The single active task and the scopes it may modify.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskState {
    pub version: u32,
    pub active_task_id: String,
    #[serde(default)]
    pub active_task_title: String,
    pub allowed_scopes: Vec<String>,
    pub started_at: String,
    pub started_by: String,
    #[serde(default)]
    pub validation_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    /// Hash of the task document at write time; empty when it did not exist.
    /// `None` only for records written before hashing existed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tasks_md_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_hash: Option<String>,
}

impl TaskState {
    /// A fresh state for `task_id` with no hashes yet.
    pub fn new(task_id: impl Into<String>, scopes: Vec<String>, started_by: impl Into<String>) -> Self {
        Self {
            version: STATE_VERSION,
            active_task_id: task_id.into(),
            active_task_title: String::new(),
            allowed_scopes: scopes,
            started_at: chrono::Utc::now().to_rfc3339(),
            started_by: started_by.into(),
            validation_attempts: 0,
            role: None,
            tasks_md_hash: None,
            state_hash: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.active_task_title = title.into();
        self
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.role = Some(role);
        self
    }
}

/// Persisted guard-mode override.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuardModeState {
    pub mode: GuardMode,
    pub updated_at: String,
    pub updated_by: String,
}

/// Owner metadata written inside a held lock directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockOwnership {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub pid: u32,
    pub host: String,
    pub started_at: String,
}

/// Why a stored record was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Corruption {
    /// Not valid JSON.
    Parse(String),
    /// Valid JSON with missing or wrong-typed fields.
    Schema(String),
    /// `stateHash` does not match the record's content.
    StateHashMismatch,
    /// The task document changed since the record was written.
    TasksHashMismatch,
}

impl Corruption {
    /// Stable audit/error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Parse(_) | Self::Schema(_) => "STATE_CORRUPTED_PARSE",
            Self::StateHashMismatch => "STATE_HASH_MISMATCH",
            Self::TasksHashMismatch => "TASKS_HASH_MISMATCH",
        }
    }
}

impl fmt::Display for Corruption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parse(e) => write!(f, "unparseable JSON: {e}"),
            Self::Schema(e) => write!(f, "invalid record: {e}"),
            Self::StateHashMismatch => f.write_str("stateHash does not match record content"),
            Self::TasksHashMismatch => {
                f.write_str("task document changed since the state was written")
            }
        }
    }
}

/// Result of reading a verified record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome<T> {
    Ok(T),
    NotFound,
    /// Primary and every backup failed verification.
    Corrupted(Corruption),
    /// Primary failed verification; a backup was restored.
    Recovered {
        value: T,
        from_backup: String,
        cause: Corruption,
    },
}

impl<T> ReadOutcome<T> {
    /// The usable value, treating `Recovered` like `Ok`.
    pub fn value(&self) -> Option<&T> {
        match self {
            Self::Ok(value) | Self::Recovered { value, .. } => Some(value),
            Self::NotFound | Self::Corrupted(_) => None,
        }
    }

    pub fn into_value(self) -> Option<T> {
        match self {
            Self::Ok(value) | Self::Recovered { value, .. } => Some(value),
            Self::NotFound | Self::Corrupted(_) => None,
        }
    }

    pub fn is_corrupted(&self) -> bool {
        matches!(self, Self::Corrupted(_))
    }

    pub fn status(&self) -> &'static str {
        match self {
            Self::Ok(_) => "ok",
            Self::NotFound => "not_found",
            Self::Corrupted(_) => "corrupted",
            Self::Recovered { .. } => "recovered",
        }
    }
}
