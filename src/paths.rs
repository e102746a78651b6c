// ABOUTME: Symlink-safe path containment checks shared by the evaluator and the state store.
// ABOUTME: Lexical normalization, real-path resolution through missing tails, and volume-aware comparison.

use std::ffi::OsString;
use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use tracing::warn;

use crate::error::{GuardError, Result};

/// Symlink hops followed before a path is treated as unresolvable.
const MAX_LINK_DEPTH: usize = 40;

/// Whether path comparison ignores case on this platform.
pub const CASE_INSENSITIVE_FS: bool = cfg!(any(windows, target_os = "macos"));

/// Unify separators to `/` and resolve `.` and `..` segments lexically.
///
/// A `..` that would climb above a relative path's start is kept; one that
/// would climb above the root is dropped.
pub fn normalize(path: &Path) -> PathBuf {
    let unified = path.to_string_lossy().replace('\\', "/");
    let mut out: Vec<Component<'_>> = Vec::new();
    for component in Path::new(&unified).components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.last() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => out.push(component),
            },
            other => out.push(other),
        }
    }
    out.iter().map(|c| c.as_os_str()).collect()
}

/// True when the separator-unified input carries an explicit `..` segment.
pub fn has_parent_segment(raw: &str) -> bool {
    raw.replace('\\', "/").split('/').any(|segment| segment == "..")
}

/// Resolve `path` through symlinks to a canonical absolute path.
///
/// Components are resolved left to right, so a `..` applies to the real
/// location of whatever precedes it, the way the kernel walks a path.
/// Missing tails are kept as written under the nearest existing ancestor,
/// so a new file under a symlinked directory resolves against the link's
/// target. Returns `None` when resolution hits a permission error or a
/// link loop.
pub fn resolve_real(path: &Path) -> Option<PathBuf> {
    let unified = PathBuf::from(path.to_string_lossy().replace('\\', "/"));
    let absolute = if unified.is_absolute() {
        unified
    } else {
        std::env::current_dir().ok()?.join(unified)
    };
    resolve_with_depth(&absolute, 0)
}

fn resolve_with_depth(path: &Path, depth: usize) -> Option<PathBuf> {
    if depth > MAX_LINK_DEPTH {
        warn!(path = %path.display(), "symlink depth exceeded while resolving");
        return None;
    }
    let mut real = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => real.push(component.as_os_str()),
            Component::CurDir => {}
            // `real` holds no unresolved links, so popping lands where the OS would.
            Component::ParentDir => {
                real.pop();
            }
            Component::Normal(name) => {
                let next = real.join(name);
                real = match fs::canonicalize(&next) {
                    Ok(resolved) => resolved,
                    Err(e) if e.kind() == ErrorKind::NotFound => match fs::symlink_metadata(&next) {
                        // Dangling link: follow the target by hand.
                        Ok(meta) if meta.file_type().is_symlink() => {
                            let target = fs::read_link(&next).ok()?;
                            resolve_with_depth(&real.join(target), depth + 1)?
                        }
                        _ => next,
                    },
                    Err(e) => {
                        warn!(path = %next.display(), error = %e, "path resolution failed; treating as outside");
                        return None;
                    }
                };
            }
        }
    }
    Some(real)
}

/// True when `path` resolves outside `root`.
///
/// Relative paths are taken relative to `root`. Anything that cannot be
/// resolved counts as outside.
pub fn is_outside(path: &Path, root: &Path) -> bool {
    let Some(root_real) = resolve_real(root) else {
        return true;
    };
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        root_real.join(path)
    };
    match resolve_real(&joined) {
        Some(target) => !is_contained(&target, &root_real),
        None => true,
    }
}

/// Validate that `target` stays inside `base` and return its canonical path.
///
/// Callers must use the returned path rather than `target` so the checked
/// path and the used path are the same.
pub fn validate_containment(target: &str, base: &Path) -> Result<PathBuf> {
    if target.contains('\0') {
        return Err(GuardError::InvalidPath(format!(
            "null byte in path {:?}",
            target.replace('\0', "\\0")
        )));
    }
    if target.trim().is_empty() {
        return Err(GuardError::InvalidPath("empty path".to_string()));
    }
    if has_parent_segment(target) {
        return Err(GuardError::PathTraversal(format!(
            "'..' segment in {target}"
        )));
    }

    let base_real = resolve_real(base).ok_or_else(|| {
        GuardError::InvalidPath(format!("cannot resolve base {}", base.display()))
    })?;
    let candidate = Path::new(target);
    let joined = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        base_real.join(candidate)
    };
    let resolved = resolve_real(&joined).ok_or_else(|| {
        GuardError::PathTraversal(format!("{target} could not be resolved"))
    })?;

    if !is_contained(&resolved, &base_real) {
        return Err(GuardError::PathTraversal(format!(
            "{target} resolves to {} outside {}",
            resolved.display(),
            base_real.display()
        )));
    }
    Ok(normalize(&resolved))
}

/// Express `raw` relative to `worktree` with `/` separators.
///
/// Absolute paths are stripped of either the literal or the canonical
/// worktree prefix. Paths that fall outside both come back absolute. A path
/// with a `..` segment is resolved on disk first, since `link/..` is not
/// the directory holding `link` when `link` is a symlink.
pub fn worktree_relative(raw: &str, worktree: &Path) -> String {
    if has_parent_segment(raw) {
        if let Some(resolved) = resolved_relative(raw, worktree) {
            return resolved;
        }
    }
    let normalized = normalize(Path::new(raw));
    if !normalized.is_absolute() {
        return to_slash(&normalized);
    }
    let roots = std::iter::once(normalize(worktree)).chain(resolve_real(worktree));
    for root in roots {
        if let Some(rel) = relative_to(&root, &normalized) {
            let escapes = matches!(rel.components().next(), Some(Component::ParentDir));
            if !escapes && !rel.as_os_str().is_empty() {
                return to_slash(&rel);
            }
        }
    }
    to_slash(&normalized)
}

fn resolved_relative(raw: &str, worktree: &Path) -> Option<String> {
    let root_real = resolve_real(worktree)?;
    let candidate = PathBuf::from(raw.replace('\\', "/"));
    let joined = if candidate.is_absolute() {
        candidate
    } else {
        root_real.join(candidate)
    };
    let real = resolve_real(&joined)?;
    if is_contained(&real, &root_real) {
        if let Some(rel) = relative_to(&root_real, &real).filter(|r| !r.as_os_str().is_empty()) {
            return Some(to_slash(&rel));
        }
    }
    Some(to_slash(&real))
}

fn to_slash(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

/// Containment between two already-resolved absolute paths.
fn is_contained(target: &Path, root: &Path) -> bool {
    if volume_id(target) != volume_id(root) {
        return false;
    }
    match relative_to(root, target) {
        Some(rel) => {
            !rel.is_absolute()
                && !matches!(rel.components().next(), Some(Component::ParentDir))
        }
        None => false,
    }
}

/// Drive letter or UNC share, lowercased; empty on Unix.
fn volume_id(path: &Path) -> String {
    match path.components().next() {
        Some(Component::Prefix(prefix)) => prefix
            .as_os_str()
            .to_string_lossy()
            .replace('\\', "/")
            .to_lowercase(),
        _ => String::new(),
    }
}

fn component_key(component: &Component<'_>) -> OsString {
    let raw = component.as_os_str();
    if CASE_INSENSITIVE_FS {
        OsString::from(raw.to_string_lossy().to_lowercase())
    } else {
        raw.to_os_string()
    }
}

/// Relative path from `base` to `target`. Both must be absolute.
fn relative_to(base: &Path, target: &Path) -> Option<PathBuf> {
    if !base.is_absolute() || !target.is_absolute() {
        return None;
    }
    let base_parts: Vec<Component<'_>> = base.components().collect();
    let target_parts: Vec<Component<'_>> = target.components().collect();
    let common = base_parts
        .iter()
        .zip(&target_parts)
        .take_while(|(a, b)| component_key(a) == component_key(b))
        .count();

    let mut rel = PathBuf::new();
    for _ in common..base_parts.len() {
        rel.push("..");
    }
    for part in &target_parts[common..] {
        rel.push(part.as_os_str());
    }
    Some(rel)
}
