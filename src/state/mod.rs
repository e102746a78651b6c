// ABOUTME: State module — durable task state, guard-mode override, locking, hashing, and auditing.
// ABOUTME: Re-exports the store and the record types callers work with.

pub mod audit;
pub mod hash;
pub mod lock;
pub mod store;
pub mod types;

pub use audit::{AuditEvent, AuditLog};
pub use lock::{LockInspection, LockSettings, UnlockOptions, UnlockOutcome};
pub use store::{StatePaths, StateStore};
pub use types::{
    Corruption, GuardMode, GuardModeState, LockOwnership, ReadOutcome, Role, TaskState,
};
