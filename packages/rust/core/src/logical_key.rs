//! Logical key and package name helpers.

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

use datapack_shared::{DatapackError, Result, resolve_strict, sha256_hex};

/// Build a collision-resistant file name for a packaged file.
///
/// Files from different directories often share a name (`a/0.tiff`,
/// `b/0.tiff`). Prefixing the first 8 hex chars of the SHA-256 of the fully
/// resolved path keeps them apart. The path must exist.
pub fn create_unique_logical_key(path: impl AsRef<Path>) -> Result<String> {
    let resolved = resolve_strict(path)?;
    let hash = sha256_hex(resolved.to_string_lossy().as_bytes());
    let name = resolved
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(format!("{}_{name}", &hash[..8]))
}

/// Normalize a dataset name and check it is allowed as a package name.
///
/// Lowercases, turns spaces and hyphens into underscores, then requires only
/// lowercase alphanumerics, underscores, and hyphens to remain.
pub fn approve_name(name: &str) -> Result<String> {
    static NAME_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"^[a-z0-9_\-]*$").expect("valid regex"));

    let cleaned = name.to_lowercase().replace([' ', '-'], "_");
    if !NAME_RE.is_match(&cleaned) {
        return Err(DatapackError::validation(format!(
            "Dataset names may only include lowercase alphanumeric, underscore, and hyphen \
             characters. Received: {cleaned}"
        )));
    }
    Ok(cleaned)
}
