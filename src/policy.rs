// ABOUTME: Policy document loading — always-allow path prefixes and extra destructive shell patterns.
// ABOUTME: Dangerous entries are a fatal ConfigInvalid; a missing or unreadable file falls back to defaults.

use std::path::Path;
use std::sync::Once;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{GuardError, Result};
use crate::paths;
use crate::shell::DestructiveMatcher;

/// Prefixes editable without an active task when no policy file is usable.
pub const DEFAULT_ALWAYS_ALLOW: &[&str] = &["specs/", ".opencode/"];

static FALLBACK_NOTICE: Once = Once::new();

/// The policy document as stored on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyConfig {
    /// Worktree-relative path prefixes exempt from scope checks.
    #[serde(default = "default_always_allow")]
    pub always_allow: Vec<String>,
    /// Additional destructive command patterns, on top of the built-in table.
    #[serde(default)]
    pub destructive_bash: Vec<String>,
}

fn default_always_allow() -> Vec<String> {
    DEFAULT_ALWAYS_ALLOW.iter().map(|s| s.to_string()).collect()
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            always_allow: default_always_allow(),
            destructive_bash: Vec::new(),
        }
    }
}

impl PolicyConfig {
    /// Load the policy from disk.
    ///
    /// A missing or unparseable file yields the defaults with a one-time
    /// warning. A file that parses but carries a dangerous `alwaysAllow`
    /// entry is rejected with [`GuardError::ConfigInvalid`].
    pub fn load(path: &Path) -> Result<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    notice_fallback(path, &e.to_string());
                }
                return Ok(Self::default());
            }
        };
        let policy: Self = match serde_json::from_str(&content) {
            Ok(policy) => policy,
            Err(e) => {
                notice_fallback(path, &e.to_string());
                return Ok(Self::default());
            }
        };
        policy.validate()?;
        Ok(policy)
    }

    /// Reject entries that would silently widen the always-allow set.
    pub fn validate(&self) -> Result<()> {
        for entry in &self.always_allow {
            validate_prefix(entry)?;
        }
        Ok(())
    }

    /// True when the worktree-relative `path` sits under an always-allow prefix.
    pub fn is_always_allowed(&self, path: &str) -> bool {
        let path = path.replace('\\', "/");
        let path = path.trim_start_matches("./");
        self.always_allow.iter().any(|prefix| {
            let prefix = prefix.replace('\\', "/");
            let prefix = prefix.trim_start_matches("./");
            if prefix.ends_with('/') {
                path.starts_with(prefix)
            } else {
                path == prefix
                    || path
                        .strip_prefix(prefix)
                        .is_some_and(|rest| rest.starts_with('/'))
            }
        })
    }

    /// Destructive matcher seeded with this policy's patterns.
    pub fn destructive_matcher(&self) -> DestructiveMatcher {
        DestructiveMatcher::new(&self.destructive_bash)
    }
}

fn validate_prefix(entry: &str) -> Result<()> {
    let trimmed = entry.trim();
    if trimmed.is_empty() {
        return Err(GuardError::ConfigInvalid(
            "alwaysAllow entry is empty".to_string(),
        ));
    }
    if trimmed.contains(&['*', '?', '[', ']', '{', '}'][..]) {
        return Err(GuardError::ConfigInvalid(format!(
            "alwaysAllow entry {entry:?} contains a glob wildcard"
        )));
    }
    if matches!(trimmed, "/" | "." | "./" | "\\" | ".\\") {
        return Err(GuardError::ConfigInvalid(format!(
            "alwaysAllow entry {entry:?} would allow the whole worktree"
        )));
    }
    if paths::has_parent_segment(trimmed) {
        return Err(GuardError::ConfigInvalid(format!(
            "alwaysAllow entry {entry:?} contains a '..' segment"
        )));
    }
    Ok(())
}

fn notice_fallback(path: &Path, reason: &str) {
    FALLBACK_NOTICE.call_once(|| {
        warn!(
            path = %path.display(),
            reason,
            "policy file unusable; using default always-allow list"
        );
    });
}
