//! Workspace discovery
//!
//! A workspace is any directory holding a `mets.xml`.

use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// File that marks a workspace directory
pub const METS_FILE: &str = "mets.xml";

/// All workspaces below `root`, relative to it and sorted
pub fn list_all(root: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    collect(root, root, &mut found);
    found.sort();
    found
}

fn collect(root: &Path, dir: &Path, found: &mut Vec<PathBuf>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!(dir = %dir.display(), error = %e, "Skipping unreadable directory");
            return;
        }
    };

    for entry in entries.flatten() {
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        let path = entry.path();
        if file_type.is_dir() {
            collect(root, &path, found);
        } else if file_type.is_file() && entry.file_name() == METS_FILE {
            if let Ok(relative) = dir.strip_prefix(root) {
                if relative.as_os_str().is_empty() {
                    continue;
                }
                found.push(relative.to_path_buf());
            }
        }
    }
}

/// Whether `path` stays below the workspace root: relative, no `..`
pub fn is_safe_relative(path: &Path) -> bool {
    !path.as_os_str().is_empty()
        && path
            .components()
            .all(|component| matches!(component, Component::Normal(_) | Component::CurDir))
}
