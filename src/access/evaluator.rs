// ABOUTME: Rule cascade for a single tool invocation — always-allow, worktree containment, state, scopes.
// ABOUTME: Also the role filter layered on top and the aggregation used for multi-file edits.

use std::path::Path;

use serde_json::Value;
use tracing::{debug, warn};

use super::types::{AccessResult, Enforcement, Rule, ToolKind};
use crate::config::RolesConfig;
use crate::error::{GuardError, Result};
use crate::paths::{self, CASE_INSENSITIVE_FS};
use crate::policy::PolicyConfig;
use crate::shell::DestructiveMatcher;
use crate::state::{ReadOutcome, Role, TaskState};

const GLOB_CHARS: &[char] = &['*', '?', '[', ']', '{', '}'];

/// Everything the cascade needs besides the call itself.
#[derive(Debug, Clone, Copy)]
pub struct AccessContext<'a> {
    pub worktree: &'a Path,
    pub policy: &'a PolicyConfig,
    pub matcher: &'a DestructiveMatcher,
    pub roles: &'a RolesConfig,
    pub enforcement: Enforcement,
}

/// Run the scope cascade for one invocation.
///
/// Order matters: always-allow prefixes are checked before the state, so
/// they stay editable while the state file is broken.
pub fn evaluate_access(
    ctx: &AccessContext<'_>,
    tool: ToolKind,
    file_path: Option<&str>,
    command: Option<&str>,
    state: &ReadOutcome<TaskState>,
) -> AccessResult {
    if !tool.is_mutating() {
        if tool == ToolKind::Bash {
            if let Some(hit) = command.and_then(|c| ctx.matcher.find(c)) {
                let detail = match hit.complex {
                    Some(reason) => format!(" ({reason}, matched on raw text)"),
                    None => String::new(),
                };
                return AccessResult::violation(
                    Rule::Rule4,
                    ctx.enforcement,
                    format!(
                        "destructive command `{}` matches `{}`{detail}",
                        hit.segment, hit.pattern
                    ),
                );
            }
        }
        return AccessResult::allow();
    }

    let Some(raw) = file_path.filter(|p| !p.trim().is_empty()) else {
        return AccessResult {
            allowed: false,
            warned: true,
            message: Some("no file path supplied; cannot check task scope".to_string()),
            rule: Some(Rule::Rule1),
        };
    };

    let relative = paths::worktree_relative(raw, ctx.worktree);
    if ctx.policy.is_always_allowed(&relative) {
        return AccessResult::allow_by(Rule::Rule0);
    }

    if paths::is_outside(Path::new(raw), ctx.worktree) {
        return AccessResult::violation(
            Rule::Rule3,
            ctx.enforcement,
            format!("{raw} resolves outside the worktree"),
        );
    }

    let state = match state {
        ReadOutcome::Corrupted(cause) => {
            return AccessResult::violation(
                Rule::StateCorrupted,
                ctx.enforcement,
                format!(
                    "task state is corrupted ({}): {cause}; restart the task to rewrite it",
                    cause.code()
                ),
            );
        }
        ReadOutcome::Ok(state) | ReadOutcome::Recovered { value: state, .. } => Some(state),
        ReadOutcome::NotFound => None,
    };

    let Some(state) = state.filter(|s| !s.allowed_scopes.is_empty()) else {
        return AccessResult::violation(
            Rule::Rule1,
            ctx.enforcement,
            format!("no active task with scopes; start a task before modifying {relative}"),
        );
    };

    if !state
        .allowed_scopes
        .iter()
        .any(|scope| scope_matches(scope, &relative))
    {
        return AccessResult::violation(
            Rule::Rule2,
            ctx.enforcement,
            format!(
                "{relative} is outside the scope of task {} ({}): allowed {}",
                state.active_task_id,
                state.active_task_title,
                state.allowed_scopes.join(", ")
            ),
        );
    }

    debug!(path = %relative, task = %state.active_task_id, "within scope");
    AccessResult::allow()
}

/// Role filter for a mutating call on `file_path`. `None` when the role has
/// no opinion about the path.
pub fn evaluate_role_access(
    ctx: &AccessContext<'_>,
    file_path: &str,
    role: Option<Role>,
) -> Option<AccessResult> {
    let role = role?;
    let relative = paths::worktree_relative(file_path, ctx.worktree);
    let spec_dir = ctx.roles.spec_dir.trim().trim_matches('/');
    let in_spec_tree = under_dir(&relative, spec_dir);

    match role {
        Role::Architect if in_spec_tree => Some(AccessResult::allow_by(Rule::RoleAllowed)),
        Role::Architect => Some(AccessResult::violation(
            Rule::RoleDenied,
            ctx.enforcement,
            format!("architect tasks may only modify files under {spec_dir}/, not {relative}"),
        )),
        Role::Implementer if !in_spec_tree => None,
        Role::Implementer => {
            let basename = relative.rsplit('/').next().unwrap_or(relative.as_str());
            if basename == ctx.roles.task_list_file {
                Some(AccessResult::allow_by(Rule::RoleAllowed))
            } else {
                Some(AccessResult::violation(
                    Rule::RoleDenied,
                    ctx.enforcement,
                    format!(
                        "implementer tasks may only modify {} under {spec_dir}/, not {relative}",
                        ctx.roles.task_list_file
                    ),
                ))
            }
        }
    }
}

/// Scope cascade followed by the role filter of the active task.
pub fn evaluate_file_access(
    ctx: &AccessContext<'_>,
    tool: ToolKind,
    file_path: Option<&str>,
    state: &ReadOutcome<TaskState>,
) -> AccessResult {
    let scope = evaluate_access(ctx, tool, file_path, None, state);
    let role = state.value().and_then(|s| s.role);
    match file_path {
        Some(path) => layer(scope, evaluate_role_access(ctx, path, role)),
        None => scope,
    }
}

/// The first violation wins; a role allow only replaces an unattributed allow.
fn layer(scope: AccessResult, role: Option<AccessResult>) -> AccessResult {
    match role {
        None => scope,
        Some(_) if scope.warned || !scope.allowed => scope,
        Some(role) if role.warned || scope.rule.is_none() => role,
        Some(_) => scope,
    }
}

/// Evaluate each entry of a multi-edit `files` array as an edit.
pub fn evaluate_multi_edit(
    ctx: &AccessContext<'_>,
    files: &Value,
    state: &ReadOutcome<TaskState>,
) -> Result<AccessResult> {
    let Value::Array(entries) = files else {
        return Err(GuardError::InvalidArguments(format!(
            "multiedit `files` must be an array, got {}",
            json_kind(files)
        )));
    };
    let results: Vec<AccessResult> = entries
        .iter()
        .map(|entry| evaluate_file_access(ctx, ToolKind::Edit, file_path_of(entry), state))
        .collect();
    Ok(aggregate(&results))
}

/// Combine per-file results: allowed is the AND, warned is the OR.
pub fn aggregate(results: &[AccessResult]) -> AccessResult {
    let allowed = results.iter().all(|r| r.allowed);
    let warned: Vec<&AccessResult> = results.iter().filter(|r| r.warned).collect();

    let Some(first) = warned.first() else {
        let rule = results
            .first()
            .and_then(|r| r.rule)
            .filter(|rule| results.iter().all(|r| r.rule == Some(*rule)));
        return AccessResult {
            allowed,
            warned: false,
            message: None,
            rule,
        };
    };

    let mut message = format!("{}/{} files warned", warned.len(), results.len());
    for result in &warned {
        if let Some(m) = &result.message {
            message.push_str("\n- ");
            message.push_str(m);
        }
    }
    AccessResult {
        allowed,
        warned: true,
        message: Some(message),
        rule: first.rule,
    }
}

/// File path from a tool-parameter object, or the value itself if it is a string.
pub fn file_path_of(value: &Value) -> Option<&str> {
    if let Some(path) = value.as_str() {
        return Some(path);
    }
    ["file_path", "filePath", "path"]
        .iter()
        .find_map(|key| value.get(*key).and_then(Value::as_str))
}

/// Match a worktree-relative path against one scope.
///
/// A scope ending in `/` is a directory prefix, a scope without wildcards
/// matches itself and everything below it, anything else is a glob.
pub fn scope_matches(scope: &str, path: &str) -> bool {
    let scope = scope.trim().replace('\\', "/");
    let scope = scope.trim_start_matches("./");
    if scope.is_empty() {
        return false;
    }
    let (scope_key, path_key) = if CASE_INSENSITIVE_FS {
        (scope.to_lowercase(), path.to_lowercase())
    } else {
        (scope.to_string(), path.to_string())
    };

    if scope_key.ends_with('/') {
        return path_key.starts_with(&scope_key);
    }
    if !scope_key.contains(GLOB_CHARS) {
        return under_dir(&path_key, &scope_key);
    }

    let options = glob::MatchOptions {
        case_sensitive: !CASE_INSENSITIVE_FS,
        require_literal_separator: true,
        require_literal_leading_dot: false,
    };
    match glob::Pattern::new(scope) {
        Ok(pattern) => pattern.matches_with(path, options),
        Err(e) => {
            warn!(scope, error = %e, "ignoring invalid scope glob");
            false
        }
    }
}

fn under_dir(path: &str, dir: &str) -> bool {
    let (path, dir) = if CASE_INSENSITIVE_FS {
        (path.to_lowercase(), dir.to_lowercase())
    } else {
        (path.to_string(), dir.to_string())
    };
    path == dir
        || path
            .strip_prefix(dir.as_str())
            .is_some_and(|rest| rest.starts_with('/'))
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
