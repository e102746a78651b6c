// ABOUTME: Content hashing for state integrity — SHA-256 over canonical JSON and the task document.

use std::io::ErrorKind;
use std::path::Path;

use sha2::{Digest, Sha256};

use super::types::TaskState;
use crate::error::Result;

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Hash over every field except `stateHash`, in declaration order.
pub fn compute_state_hash(state: &TaskState) -> Result<String> {
    let mut unhashed = state.clone();
    unhashed.state_hash = None;
    let bytes = serde_json::to_vec(&unhashed)?;
    Ok(sha256_hex(&bytes))
}

/// Hash of the task document, or an empty string when it does not exist.
pub fn tasks_document_hash(path: &Path) -> Result<String> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(sha256_hex(&bytes)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(e.into()),
    }
}
