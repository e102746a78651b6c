// ABOUTME: Library root for scopegate — re-exports all modules for integration testing.
// ABOUTME: The binary entry point is in main.rs, which uses this crate as a library.

pub mod access;
pub mod config;
pub mod error;
pub mod mode;
pub mod paths;
pub mod policy;
pub mod shell;
pub mod state;

pub use error::{GuardError, Result};
