use crate::error::{Result, WtyError};
use std::path::{Component, Path, PathBuf};

#[derive(Clone, Copy, Debug, Default)]
pub struct PathPolicy {
    pub follow_symlinks: bool,
}

/// Resolve an entry filename to a path under the dump directory `root`.
///
/// Empty names, absolute paths and `..` are rejected. Without
/// `follow_symlinks` any symlink on the way is an error; with it, the
/// deepest existing ancestor must still resolve inside `root`.
pub fn validate_path(root: &Path, rel: &Path, policy: PathPolicy) -> Result<PathBuf> {
    if rel.as_os_str().is_empty() {
        return Err(WtyError::UnsafePath("empty file name".into()));
    }
    if rel.is_absolute() || rel.has_root() {
        return Err(WtyError::UnsafePath(format!("absolute paths are not allowed: {:?}", rel)));
    }
    for comp in rel.components() {
        match comp {
            Component::ParentDir => {
                return Err(WtyError::UnsafePath(format!(
                    "parent traversal not allowed: {:?}",
                    rel
                )))
            }
            Component::Prefix(_) => {
                return Err(WtyError::UnsafePath(format!("path prefix not allowed: {:?}", rel)))
            }
            _ => {}
        }
    }
    let candidate = root.join(rel);
    if !policy.follow_symlinks {
        let mut cur = root.to_path_buf();
        for comp in rel.components() {
            cur.push(comp);
            if let Ok(m) = std::fs::symlink_metadata(&cur) {
                if m.file_type().is_symlink() {
                    return Err(WtyError::UnsafePath(format!(
                        "symlink in path (not following): {:?}",
                        cur
                    )));
                }
            }
        }
        return Ok(candidate);
    }

    let root_can = std::fs::canonicalize(root).map_err(|e| WtyError::io(root, e))?;
    let mut probe = candidate.as_path();
    while !probe.exists() {
        match probe.parent() {
            Some(p) => probe = p,
            None => break,
        }
    }
    let probe_can = std::fs::canonicalize(probe).map_err(|e| WtyError::io(probe, e))?;
    if !probe_can.starts_with(&root_can) {
        return Err(WtyError::UnsafePath(format!("path escapes root: {:?}", rel)));
    }
    Ok(candidate)
}
