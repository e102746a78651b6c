// ABOUTME: Configuration loading for scopegate.
// ABOUTME: Defaults, then <worktree>/.scopegate.toml (or the user config dir), then SCOPEGATE_* env overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::error::Result;
use crate::state::{GuardMode, LockSettings};

/// File name of the per-worktree config.
pub const CONFIG_FILE: &str = ".scopegate.toml";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub state: StateConfig,
    pub lock: LockConfig,
    pub audit: AuditConfig,
    pub roles: RolesConfig,
    pub guard: GuardConfig,
}

/// Where state lives and how many backups are kept.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// State directory, relative to the worktree.
    pub dir: String,
    /// Task document whose hash is pinned into the state.
    pub tasks_file: String,
    pub backups: usize,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            dir: ".opencode/state".to_string(),
            tasks_file: "specs/tasks.md".to_string(),
            backups: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub stale_after_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            retries: 50,
            base_delay_ms: 10,
            max_delay_ms: 500,
            stale_after_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Log file name inside the state directory.
    pub file: String,
    pub max_bytes: u64,
    pub backups: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            file: "audit.log".to_string(),
            max_bytes: 1024 * 1024,
            backups: 2,
        }
    }
}

/// Layout the role filter checks against.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RolesConfig {
    pub spec_dir: String,
    pub task_list_file: String,
}

impl Default for RolesConfig {
    fn default() -> Self {
        Self {
            spec_dir: "specs".to_string(),
            task_list_file: "tasks.md".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    /// Requested mode; merged with the persisted override, never weakening it.
    pub mode: Option<GuardMode>,
}

impl Config {
    /// Load config for `worktree`, falling back to defaults, then apply the
    /// process environment.
    pub fn load(worktree: &Path) -> Result<Self> {
        let mut config = match Self::find_config_file(worktree) {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_env(std::env::vars());
        Ok(config)
    }

    /// Parse a TOML config file. A malformed file is an error.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Path to the per-worktree config file.
    pub fn config_path(worktree: &Path) -> PathBuf {
        worktree.join(CONFIG_FILE)
    }

    /// Path to the user-wide config file.
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("scopegate").join("config.toml"))
    }

    fn find_config_file(worktree: &Path) -> Option<PathBuf> {
        let local = Self::config_path(worktree);
        if local.exists() {
            return Some(local);
        }
        Self::global_config_path().filter(|path| path.exists())
    }

    /// Apply `SCOPEGATE_*` overrides. Unparseable values are ignored with a warning.
    pub fn apply_env<I>(&mut self, vars: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            match key.as_str() {
                "SCOPEGATE_GUARD_MODE" => {
                    if let Some(mode) = parse_env(&key, &value) {
                        self.guard.mode = Some(mode);
                    }
                }
                "SCOPEGATE_STATE_DIR" if !value.trim().is_empty() => {
                    self.state.dir = value.trim().to_string();
                }
                "SCOPEGATE_LOCK_RETRIES" => {
                    if let Some(retries) = parse_env(&key, &value) {
                        self.lock.retries = retries;
                    }
                }
                "SCOPEGATE_LOCK_STALE_MS" => {
                    if let Some(ms) = parse_env(&key, &value) {
                        self.lock.stale_after_ms = ms;
                    }
                }
                "SCOPEGATE_AUDIT_MAX_BYTES" => {
                    if let Some(bytes) = parse_env(&key, &value) {
                        self.audit.max_bytes = bytes;
                    }
                }
                "SCOPEGATE_AUDIT_BACKUPS" => {
                    if let Some(backups) = parse_env(&key, &value) {
                        self.audit.backups = backups;
                    }
                }
                _ => {}
            }
        }
    }

    pub fn lock_settings(&self) -> LockSettings {
        LockSettings {
            retries: self.lock.retries,
            base_delay: Duration::from_millis(self.lock.base_delay_ms),
            max_delay: Duration::from_millis(self.lock.max_delay_ms),
            stale_after: Duration::from_millis(self.lock.stale_after_ms),
        }
    }
}

fn parse_env<T>(key: &str, value: &str) -> Option<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match value.trim().parse() {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            warn!(key, value, error = %e, "ignoring unparseable environment override");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn default_config_values() {
        let config = Config::default();
        assert_eq!(config.state.dir, ".opencode/state");
        assert_eq!(config.state.tasks_file, "specs/tasks.md");
        assert_eq!(config.state.backups, 3);
        assert_eq!(config.lock.retries, 50);
        assert_eq!(config.lock.stale_after_ms, 30_000);
        assert_eq!(config.audit.max_bytes, 1024 * 1024);
        assert_eq!(config.audit.backups, 2);
        assert_eq!(config.roles.task_list_file, "tasks.md");
        assert_eq!(config.guard.mode, None);
    }

    #[test]
    fn parse_config_toml() {
        let toml_str = r#"
[state]
dir = "var/gate"
backups = 5

[lock]
retries = 3
stale_after_ms = 1000

[guard]
mode = "block"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.state.dir, "var/gate");
        assert_eq!(config.state.backups, 5);
        assert_eq!(config.state.tasks_file, "specs/tasks.md");
        assert_eq!(config.lock.retries, 3);
        assert_eq!(config.lock_settings().stale_after, Duration::from_secs(1));
        assert_eq!(config.guard.mode, Some(GuardMode::Block));
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = Config::default();
        config.apply_env(vars(&[
            ("SCOPEGATE_GUARD_MODE", "warn"),
            ("SCOPEGATE_STATE_DIR", "custom/state"),
            ("SCOPEGATE_LOCK_RETRIES", "7"),
            ("SCOPEGATE_LOCK_STALE_MS", "2500"),
            ("SCOPEGATE_AUDIT_MAX_BYTES", "4096"),
            ("SCOPEGATE_AUDIT_BACKUPS", "4"),
            ("UNRELATED", "x"),
        ]));
        assert_eq!(config.guard.mode, Some(GuardMode::Warn));
        assert_eq!(config.state.dir, "custom/state");
        assert_eq!(config.lock.retries, 7);
        assert_eq!(config.lock.stale_after_ms, 2500);
        assert_eq!(config.audit.max_bytes, 4096);
        assert_eq!(config.audit.backups, 4);
    }

    #[test]
    fn bad_env_values_are_ignored() {
        let mut config = Config::default();
        config.apply_env(vars(&[
            ("SCOPEGATE_GUARD_MODE", "loud"),
            ("SCOPEGATE_LOCK_RETRIES", "many"),
            ("SCOPEGATE_STATE_DIR", "  "),
        ]));
        assert_eq!(config.guard.mode, None);
        assert_eq!(config.lock.retries, 50);
        assert_eq!(config.state.dir, ".opencode/state");
    }

    #[test]
    fn worktree_file_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            Config::config_path(dir.path()),
            "[roles]\nspec_dir = \"design\"\n",
        )
        .unwrap();
        let config = Config::from_file(&Config::config_path(dir.path())).unwrap();
        assert_eq!(config.roles.spec_dir, "design");
        assert_eq!(config.roles.task_list_file, "tasks.md");
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = Config::config_path(dir.path());
        std::fs::write(&path, "[state\n").unwrap();
        assert!(Config::from_file(&path).is_err());
    }
}
