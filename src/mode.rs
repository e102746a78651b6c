// ABOUTME: Guard-mode resolver — merges the requested mode with the persisted override.
// ABOUTME: The strictest source wins; a request can never weaken the persisted policy.

use serde_json::json;
use tracing::debug;

use crate::state::{AuditEvent, AuditLog, GuardMode, GuardModeState, ReadOutcome, StateStore};

/// Strictest of the two sources, with an absent source counting as `Disabled`.
pub fn merge(requested: Option<GuardMode>, persisted: Option<GuardMode>) -> GuardMode {
    requested
        .unwrap_or(GuardMode::Disabled)
        .max(persisted.unwrap_or(GuardMode::Disabled))
}

/// Resolve the effective mode from a request and the persisted record.
///
/// An absent record is audited as `FAIL_CLOSED` and the request (or
/// `Disabled`) is used, so a fresh worktree is not locked out. A record that
/// is corrupted with no valid backup counts as `Block`. A request that ends
/// up overridden by a stricter persisted mode is audited as `DENIED_WEAKENING`.
pub fn resolve(
    requested: Option<GuardMode>,
    persisted: &ReadOutcome<GuardModeState>,
    audit: &AuditLog,
) -> GuardMode {
    let persisted_mode = match persisted {
        ReadOutcome::Ok(state) | ReadOutcome::Recovered { value: state, .. } => Some(state.mode),
        ReadOutcome::Corrupted(_) => Some(GuardMode::Block),
        ReadOutcome::NotFound => {
            audit.record(
                AuditEvent::FailClosed,
                "guard mode file absent; using requested mode",
                json!({
                    "requested": requested.map(|m| m.as_str()),
                    "fallback": requested.unwrap_or(GuardMode::Disabled).as_str(),
                }),
            );
            None
        }
    };

    let effective = merge(requested, persisted_mode);
    if let Some(requested) = requested {
        if effective > requested {
            audit.record(
                AuditEvent::DeniedWeakening,
                "requested guard mode is weaker than the persisted mode",
                json!({
                    "requested": requested.as_str(),
                    "persisted": persisted_mode.map(|m| m.as_str()),
                    "effective": effective.as_str(),
                }),
            );
        }
    }
    debug!(
        requested = ?requested,
        persisted = ?persisted_mode,
        effective = %effective,
        "resolved guard mode"
    );
    effective
}

/// Read the persisted record from `store` and resolve against `requested`.
pub fn effective_mode(store: &StateStore, requested: Option<GuardMode>) -> GuardMode {
    resolve(requested, &store.read_guard_mode(), store.audit())
}
