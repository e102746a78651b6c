// ABOUTME: Hook-facing gate — resolves the guard mode, reads the task state, and evaluates a tool call.
// ABOUTME: Extracts target paths from edit, multiedit, and patch parameters before running the cascade.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::evaluator::{
    AccessContext, aggregate, evaluate_access, evaluate_file_access, evaluate_multi_edit,
    file_path_of,
};
use super::types::{AccessResult, Enforcement, ToolKind};
use crate::config::{Config, RolesConfig};
use crate::error::{GuardError, Result};
use crate::mode;
use crate::policy::PolicyConfig;
use crate::shell::DestructiveMatcher;
use crate::state::{AuditEvent, GuardMode, ReadOutcome, StateStore};

const PATCH_HEADERS: &[&str] = &[
    "*** Add File:",
    "*** Update File:",
    "*** Delete File:",
    "*** Move to:",
];

const PATCH_KEYS: &[&str] = &["patch", "patchText", "patch_text", "input", "diff"];

/// A tool invocation as delivered by the host hook.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolCall {
    #[serde(alias = "tool_name", alias = "toolName")]
    pub tool: String,
    #[serde(default, alias = "args", alias = "tool_input", alias = "input")]
    pub params: Value,
}

impl ToolCall {
    pub fn new(tool: impl Into<String>, params: Value) -> Self {
        Self {
            tool: tool.into(),
            params,
        }
    }
}

/// The gate's answer for one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Guard mode is disabled; nothing was evaluated.
    Disabled,
    Evaluated {
        mode: GuardMode,
        result: AccessResult,
    },
}

impl Verdict {
    pub fn allowed(&self) -> bool {
        match self {
            Self::Disabled => true,
            Self::Evaluated { result, .. } => result.allowed,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::Disabled => json!({
                "status": "disabled",
                "allowed": true,
                "warned": false,
            }),
            Self::Evaluated { mode, result } => json!({
                "status": "evaluated",
                "mode": mode.as_str(),
                "allowed": result.allowed,
                "warned": result.warned,
                "message": result.message,
                "rule": result.rule,
            }),
        }
    }
}

/// Evaluates tool calls for one worktree.
#[derive(Debug, Clone)]
pub struct Gate {
    worktree: PathBuf,
    store: StateStore,
    policy: PolicyConfig,
    matcher: DestructiveMatcher,
    roles: RolesConfig,
    requested_mode: Option<GuardMode>,
}

impl Gate {
    /// Build a gate from config. A policy file with a dangerous entry is an error.
    pub fn new(config: &Config, worktree: &Path) -> Result<Self> {
        let store = StateStore::from_config(config, worktree)?;
        let policy_file = &store.paths().policy_file;
        let policy = PolicyConfig::load(policy_file).inspect_err(|e| {
            store.audit().record(
                AuditEvent::ConfigInvalid,
                "policy file rejected",
                json!({
                    "path": policy_file.display().to_string(),
                    "error": e.to_string(),
                }),
            );
        })?;
        Ok(Self::with_parts(
            worktree,
            store,
            policy,
            config.roles.clone(),
            config.guard.mode,
        ))
    }

    pub fn with_parts(
        worktree: &Path,
        store: StateStore,
        policy: PolicyConfig,
        roles: RolesConfig,
        requested_mode: Option<GuardMode>,
    ) -> Self {
        let matcher = policy.destructive_matcher();
        Self {
            worktree: worktree.to_path_buf(),
            store,
            policy,
            matcher,
            roles,
            requested_mode,
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn policy(&self) -> &PolicyConfig {
        &self.policy
    }

    pub fn effective_mode(&self) -> GuardMode {
        mode::effective_mode(&self.store, self.requested_mode)
    }

    /// Evaluate one tool call.
    pub fn check(&self, call: &ToolCall) -> Result<Verdict> {
        let mode = self.effective_mode();
        let Some(enforcement) = Enforcement::from_mode(mode) else {
            debug!(tool = %call.tool, "guard disabled");
            return Ok(Verdict::Disabled);
        };
        let ctx = AccessContext {
            worktree: &self.worktree,
            policy: &self.policy,
            matcher: &self.matcher,
            roles: &self.roles,
            enforcement,
        };

        let kind = ToolKind::from_name(&call.tool);
        let params = &call.params;
        let result = match kind {
            ToolKind::Bash | ToolKind::Other => {
                let command = params.get("command").and_then(Value::as_str);
                evaluate_access(&ctx, kind, None, command, &ReadOutcome::NotFound)
            }
            ToolKind::Edit | ToolKind::Write => {
                evaluate_file_access(&ctx, kind, file_path_of(params), &self.store.read_state())
            }
            ToolKind::MultiEdit => self.check_multi_edit(&ctx, params)?,
            ToolKind::Patch => self.check_patch(&ctx, params),
        };

        if result.warned {
            warn!(
                tool = %call.tool,
                rule = ?result.rule,
                allowed = result.allowed,
                message = result.message.as_deref().unwrap_or(""),
                "guard violation"
            );
        } else {
            debug!(tool = %call.tool, rule = ?result.rule, "allowed");
        }
        Ok(Verdict::Evaluated { mode, result })
    }

    fn check_multi_edit(&self, ctx: &AccessContext<'_>, params: &Value) -> Result<AccessResult> {
        let state = self.store.read_state();
        match params.get("files") {
            Some(files) => evaluate_multi_edit(ctx, files, &state),
            None => match file_path_of(params) {
                Some(path) => Ok(evaluate_file_access(ctx, ToolKind::Edit, Some(path), &state)),
                None => Err(GuardError::InvalidArguments(
                    "multiedit call has neither `files` nor a file path".to_string(),
                )),
            },
        }
    }

    fn check_patch(&self, ctx: &AccessContext<'_>, params: &Value) -> AccessResult {
        let text = PATCH_KEYS
            .iter()
            .find_map(|key| params.get(*key).and_then(Value::as_str))
            .unwrap_or("");
        let mut targets = patch_targets(text);
        if targets.is_empty() {
            targets.extend(file_path_of(params).map(str::to_string));
        }

        let state = self.store.read_state();
        if targets.is_empty() {
            return evaluate_file_access(ctx, ToolKind::Patch, None, &state);
        }
        let results: Vec<AccessResult> = targets
            .iter()
            .map(|target| evaluate_file_access(ctx, ToolKind::Patch, Some(target), &state))
            .collect();
        aggregate(&results)
    }
}

/// Files a patch touches, from apply-patch headers and unified-diff headers.
///
/// A `---`/`+++` pair only counts as a header when the two lines are adjacent,
/// so removed or added content lines are not mistaken for file names.
pub fn patch_targets(patch: &str) -> Vec<String> {
    let lines: Vec<&str> = patch.lines().map(str::trim_end).collect();
    let mut targets: Vec<String> = Vec::new();
    let mut push = |raw: &str| {
        // Unified diffs may append a tab-separated timestamp.
        let target = raw.split('\t').next().unwrap_or("").trim();
        if !target.is_empty() && target != "/dev/null" && !targets.iter().any(|t| t == target) {
            targets.push(target.to_string());
        }
    };

    for (i, line) in lines.iter().enumerate() {
        if let Some(target) = PATCH_HEADERS.iter().find_map(|h| line.strip_prefix(h)) {
            push(target);
            continue;
        }
        let Some(old) = line.strip_prefix("--- ") else {
            continue;
        };
        let Some(new) = lines.get(i + 1).and_then(|next| next.strip_prefix("+++ ")) else {
            continue;
        };
        push(old.strip_prefix("a/").unwrap_or(old));
        push(new.strip_prefix("b/").unwrap_or(new));
    }
    targets
}
