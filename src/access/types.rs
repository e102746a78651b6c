// ABOUTME: Core types for access evaluation — rules, results, tool kinds, and enforcement level.
// ABOUTME: Violations are ordinary AccessResult values whose allowed flag depends on enforcement.

use serde::Serialize;

use crate::state::GuardMode;

/// Which check decided an access result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Rule {
    /// Path is under an always-allow prefix.
    Rule0,
    /// No target path, or no active task / empty scopes.
    Rule1,
    /// Path matches none of the task's scopes.
    Rule2,
    /// Path resolves outside the worktree.
    Rule3,
    /// Destructive shell command.
    Rule4,
    RoleAllowed,
    RoleDenied,
    StateCorrupted,
}

/// Outcome of evaluating one tool invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccessResult {
    pub allowed: bool,
    pub warned: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// `None` for a plain allow that no rule had an opinion on.
    pub rule: Option<Rule>,
}

impl AccessResult {
    /// Silent allow.
    pub fn allow() -> Self {
        Self {
            allowed: true,
            warned: false,
            message: None,
            rule: None,
        }
    }

    /// Allow attributed to `rule`.
    pub fn allow_by(rule: Rule) -> Self {
        Self {
            rule: Some(rule),
            ..Self::allow()
        }
    }

    /// A violation; `allowed` follows the enforcement level.
    pub fn violation(rule: Rule, enforcement: Enforcement, message: impl Into<String>) -> Self {
        Self {
            allowed: enforcement.allowed_on_violation(),
            warned: true,
            message: Some(message.into()),
            rule: Some(rule),
        }
    }
}

/// Enforcement level once `Disabled` has been short-circuited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enforcement {
    Warn,
    Block,
}

impl Enforcement {
    /// `None` for `Disabled`: nothing is evaluated.
    pub fn from_mode(mode: GuardMode) -> Option<Self> {
        match mode {
            GuardMode::Disabled => None,
            GuardMode::Warn => Some(Self::Warn),
            GuardMode::Block => Some(Self::Block),
        }
    }

    pub fn allowed_on_violation(self) -> bool {
        self == Self::Warn
    }
}

/// Tool categories the evaluator distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolKind {
    Edit,
    Write,
    MultiEdit,
    Patch,
    Bash,
    /// Anything that does not mutate files or run commands.
    Other,
}

impl ToolKind {
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "edit" | "str_replace" | "edit_file" => Self::Edit,
            "write" | "create" | "write_file" => Self::Write,
            "multiedit" | "multi_edit" => Self::MultiEdit,
            "patch" | "apply_patch" => Self::Patch,
            "bash" | "shell" | "exec" => Self::Bash,
            _ => Self::Other,
        }
    }

    /// True for tools that change file content.
    pub fn is_mutating(self) -> bool {
        matches!(self, Self::Edit | Self::Write | Self::MultiEdit | Self::Patch)
    }
}
