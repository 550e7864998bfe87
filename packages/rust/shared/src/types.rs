//! Core domain types for datapack packages.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{DatapackError, Result};

/// Current schema version for the package manifest format.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Hex-encoded SHA-256 of a byte slice.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

// ---------------------------------------------------------------------------
// PackageName
// ---------------------------------------------------------------------------

/// A fully qualified `owner/name` package handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PackageName {
    pub owner: String,
    pub name: String,
}

impl PackageName {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for PackageName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

impl std::str::FromStr for PackageName {
    type Err = DatapackError;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('/') {
            Some((owner, name)) if !owner.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok(Self::new(owner, name))
            }
            _ => Err(DatapackError::parse(format!(
                "package names look like 'owner/name', got '{s}'"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// PackageManifest
// ---------------------------------------------------------------------------

/// Where an entry's bytes come from before it is pushed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntrySource {
    /// A file on local disk.
    File(PathBuf),
    /// Bytes generated in memory (rewritten README, metadata CSV).
    Bytes(Vec<u8>),
}

impl EntrySource {
    /// Physical key recorded in an unpushed manifest.
    pub fn physical_key(&self) -> String {
        match self {
            Self::File(path) => path.display().to_string(),
            Self::Bytes(_) => "<memory>".to_string(),
        }
    }
}

/// One file inside a built package.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Path of the file inside the package (e.g. `FOV/1a2b3c4d_img.tiff`).
    pub logical_key: String,
    /// Where the bytes live: a source path before push, an object path after.
    pub physical_key: String,
    /// Size in bytes.
    pub size: u64,
    /// SHA-256 of the bytes.
    pub hash: String,
    /// User metadata attached to the file.
    #[serde(default)]
    pub meta: serde_json::Map<String, serde_json::Value>,
}

/// The JSON manifest describing one package version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageManifest {
    /// Schema version for forward compatibility.
    pub schema_version: u32,
    /// Content hash over all entries; identifies the version.
    pub top_hash: String,
    /// `owner/name`, set once pushed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Commit message attached at push time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// When this manifest was built.
    pub created_at: DateTime<Utc>,
    /// Entries sorted by logical key.
    pub entries: Vec<ManifestEntry>,
}

impl PackageManifest {
    /// Build a manifest from entries, sorting them and computing the top hash.
    pub fn from_entries(mut entries: Vec<ManifestEntry>) -> Self {
        entries.sort_by(|a, b| a.logical_key.cmp(&b.logical_key));
        let top_hash = compute_top_hash(&entries);
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            top_hash,
            name: None,
            message: None,
            created_at: Utc::now(),
            entries,
        }
    }

    /// Look up an entry by logical key.
    pub fn get(&self, logical_key: &str) -> Option<&ManifestEntry> {
        self.entries.iter().find(|e| e.logical_key == logical_key)
    }

    /// Sum of all entry sizes.
    pub fn total_bytes(&self) -> u64 {
        self.entries.iter().map(|e| e.size).sum()
    }

    /// Recompute the top hash and compare against the stored one.
    pub fn verify_top_hash(&self) -> bool {
        compute_top_hash(&self.entries) == self.top_hash
    }
}

/// Top hash: SHA-256 over one canonical JSON line per entry, in order.
/// Physical keys are excluded so relocating objects keeps the version id.
pub fn compute_top_hash(entries: &[ManifestEntry]) -> String {
    let mut hasher = Sha256::new();
    for entry in entries {
        let line = serde_json::json!({
            "logical_key": entry.logical_key,
            "hash": entry.hash,
            "size": entry.size,
            "meta": entry.meta,
        });
        hasher.update(line.to_string().as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(lk: &str, hash: &str) -> ManifestEntry {
        ManifestEntry {
            logical_key: lk.into(),
            physical_key: format!("/src/{lk}"),
            size: 3,
            hash: hash.into(),
            meta: serde_json::Map::new(),
        }
    }

    #[test]
    fn package_name_parses() {
        let name: PackageName = "aics/pipeline_integrated_cell".parse().expect("parse");
        assert_eq!(name.owner, "aics");
        assert_eq!(name.to_string(), "aics/pipeline_integrated_cell");

        assert!("no-slash".parse::<PackageName>().is_err());
        assert!("a/b/c".parse::<PackageName>().is_err());
        assert!("/b".parse::<PackageName>().is_err());
    }

    #[test]
    fn sha256_hex_known_value() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn top_hash_ignores_order_of_input_and_physical_keys() {
        let a = PackageManifest::from_entries(vec![entry("b/x", "1"), entry("a/y", "2")]);
        let mut moved = vec![entry("a/y", "2"), entry("b/x", "1")];
        for e in &mut moved {
            e.physical_key = format!("/objects/{}", e.hash);
        }
        let b = PackageManifest::from_entries(moved);
        assert_eq!(a.top_hash, b.top_hash);
        assert_eq!(a.entries[0].logical_key, "a/y");
        assert!(a.verify_top_hash());
    }

    #[test]
    fn top_hash_changes_with_meta() {
        let plain = PackageManifest::from_entries(vec![entry("a", "1")]);
        let mut tagged = entry("a", "1");
        tagged
            .meta
            .insert("Structure".into(), serde_json::json!("lysosome"));
        let tagged = PackageManifest::from_entries(vec![tagged]);
        assert_ne!(plain.top_hash, tagged.top_hash);
    }

    #[test]
    fn manifest_serialization() {
        let manifest = PackageManifest::from_entries(vec![entry("README.md", "abc")]);
        let json = serde_json::to_string_pretty(&manifest).expect("serialize");
        let parsed: PackageManifest = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed.schema_version, CURRENT_SCHEMA_VERSION);
        assert_eq!(parsed.top_hash, manifest.top_hash);
        assert_eq!(parsed.total_bytes(), 3);
        assert!(parsed.get("README.md").is_some());
    }
}
