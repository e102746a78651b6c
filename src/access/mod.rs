// ABOUTME: Access module — decides allow/warn/block for each tool invocation.
// ABOUTME: Rule cascade, role filter, and the hook-facing gate that ties them to state and mode.

pub mod evaluator;
pub mod gate;
pub mod types;

pub use evaluator::{
    AccessContext, aggregate, evaluate_access, evaluate_file_access, evaluate_multi_edit,
    evaluate_role_access, scope_matches,
};
pub use gate::{Gate, ToolCall, Verdict, patch_targets};
pub use types::{AccessResult, Enforcement, Rule, ToolKind};
