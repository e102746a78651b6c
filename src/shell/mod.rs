// ABOUTME: Shell command analysis — segmenting, classification, and destructive-pattern detection.
// ABOUTME: Conservative by construction: opaque constructs are matched on raw text.

pub mod destructive;
pub mod lexer;

pub use destructive::*;
pub use lexer::{BashNode, ComplexReason};
