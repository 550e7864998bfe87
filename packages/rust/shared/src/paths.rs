//! Path helpers shared by the manifest, README, and packaging crates.

use std::path::{Path, PathBuf};

use crate::error::{DatapackError, Result};

/// Expand a leading `~` to the user's home directory.
pub fn expand_user(path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    match path.strip_prefix("~") {
        Ok(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}

/// Expand `~` and make the path absolute without requiring it to exist.
pub fn absolutize(path: impl AsRef<Path>) -> PathBuf {
    let expanded = expand_user(path);
    if expanded.is_absolute() {
        return expanded;
    }
    match std::env::current_dir() {
        Ok(cwd) => cwd.join(expanded),
        Err(_) => expanded,
    }
}

/// Expand `~` and fully resolve the path. The path must exist.
pub fn resolve_strict(path: impl AsRef<Path>) -> Result<PathBuf> {
    let expanded = expand_user(path);
    std::fs::canonicalize(&expanded).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => {
            DatapackError::not_found(format!("{} does not exist", expanded.display()))
        }
        _ => DatapackError::io(&expanded, e),
    })
}

/// Resolve the path if it exists, otherwise return its absolute form.
pub fn resolve_lenient(path: impl AsRef<Path>) -> PathBuf {
    let absolute = absolutize(path);
    std::fs::canonicalize(&absolute).unwrap_or(absolute)
}
