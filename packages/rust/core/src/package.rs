//! In-memory package under construction.
//!
//! A [`Package`] maps logical keys to their byte source and metadata. Nothing
//! is hashed or copied until [`Package::build`] produces a manifest.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};
use tracing::{debug, instrument};
use walkdir::WalkDir;

use datapack_registry::BlobSource;
use datapack_shared::{DatapackError, EntrySource, ManifestEntry, PackageManifest, Result};

/// Metadata attached to one packaged file.
pub type Meta = serde_json::Map<String, serde_json::Value>;

/// One file in a package.
#[derive(Debug, Clone, PartialEq)]
pub struct PackageEntry {
    pub source: EntrySource,
    pub meta: Meta,
}

/// Logical key to entry, kept sorted.
#[derive(Debug, Clone, Default)]
pub struct Package {
    entries: BTreeMap<String, PackageEntry>,
}

impl Package {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an entry.
    pub fn set(&mut self, logical_key: impl Into<String>, source: EntrySource, meta: Meta) -> Result<()> {
        let logical_key = logical_key.into();
        check_logical_key(&logical_key)?;
        self.entries
            .insert(logical_key, PackageEntry { source, meta });
        Ok(())
    }

    /// Add every file under `dir` as `<logical_key>/<relative path>`.
    /// Returns the number of files added.
    pub fn set_dir(&mut self, logical_key: &str, dir: &Path) -> Result<usize> {
        if !dir.is_dir() {
            return Err(DatapackError::not_found(format!(
                "{} is not a directory",
                dir.display()
            )));
        }

        let prefix = logical_key.trim_end_matches('/');
        let mut added = 0;
        for entry in WalkDir::new(dir).sort_by_file_name() {
            let entry = entry.map_err(|e| {
                let path = e.path().unwrap_or(dir).to_path_buf();
                DatapackError::io(path, e.into())
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(dir)
                .map_err(|_| DatapackError::validation("walked outside of the package directory"))?;
            let relative = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            let key = if prefix.is_empty() {
                relative
            } else {
                format!("{prefix}/{relative}")
            };
            self.set(key, EntrySource::File(entry.path().to_path_buf()), Meta::new())?;
            added += 1;
        }

        debug!(logical_key = %prefix, dir = %dir.display(), files = added, "added directory");
        Ok(added)
    }

    pub fn get(&self, logical_key: &str) -> Option<&PackageEntry> {
        self.entries.get(logical_key)
    }

    pub fn get_mut(&mut self, logical_key: &str) -> Option<&mut PackageEntry> {
        self.entries.get_mut(logical_key)
    }

    pub fn contains(&self, logical_key: &str) -> bool {
        self.entries.contains_key(logical_key)
    }

    /// Replace an entry's metadata.
    pub fn set_meta(&mut self, logical_key: &str, meta: Meta) -> Result<()> {
        let entry = self.entries.get_mut(logical_key).ok_or_else(|| {
            DatapackError::validation(format!("no package entry '{logical_key}'"))
        })?;
        entry.meta = meta;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn logical_keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&String, &mut PackageEntry)> {
        self.entries.iter_mut()
    }

    /// Hash every entry and produce the package manifest.
    #[instrument(skip_all, fields(entries = self.entries.len()))]
    pub fn build(&self) -> Result<PackageManifest> {
        let mut entries = Vec::with_capacity(self.entries.len());
        for (logical_key, entry) in &self.entries {
            let (hash, size) = hash_source(&entry.source)?;
            entries.push(ManifestEntry {
                logical_key: logical_key.clone(),
                physical_key: entry.source.physical_key(),
                size,
                hash,
                meta: entry.meta.clone(),
            });
        }
        let manifest = PackageManifest::from_entries(entries);
        debug!(top_hash = %manifest.top_hash, bytes = manifest.total_bytes(), "built manifest");
        Ok(manifest)
    }
}

impl BlobSource for Package {
    fn source(&self, logical_key: &str) -> Option<&EntrySource> {
        self.entries.get(logical_key).map(|e| &e.source)
    }
}

/// Logical keys are relative, `/`-separated, and free of `.`/`..` segments.
fn check_logical_key(key: &str) -> Result<()> {
    let bad = key.is_empty()
        || key.starts_with('/')
        || key.ends_with('/')
        || key.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..");
    if bad {
        return Err(DatapackError::validation(format!("invalid logical key '{key}'")));
    }
    Ok(())
}

/// SHA-256 and size of an entry's bytes, streaming files from disk.
fn hash_source(source: &EntrySource) -> Result<(String, u64)> {
    let mut hasher = Sha256::new();
    let size = match source {
        EntrySource::Bytes(bytes) => {
            hasher.update(bytes);
            bytes.len() as u64
        }
        EntrySource::File(path) => {
            let mut file = std::fs::File::open(path).map_err(|e| DatapackError::io(path, e))?;
            let mut buf = vec![0u8; 64 * 1024];
            let mut total = 0u64;
            loop {
                let n = file.read(&mut buf).map_err(|e| DatapackError::io(path, e))?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
                total += n as u64;
            }
            total
        }
    };
    Ok((format!("{:x}", hasher.finalize()), size))
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use datapack_shared::sha256_hex;

    use super::*;

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("dp-package-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(dir.join("nested/deeper")).unwrap();
        std::fs::write(dir.join("top.txt"), b"top").unwrap();
        std::fs::write(dir.join("nested/mid.txt"), b"mid").unwrap();
        std::fs::write(dir.join("nested/deeper/low.txt"), b"low").unwrap();
        dir
    }

    #[test]
    fn set_replaces_entries() {
        let mut pkg = Package::new();
        pkg.set("a.txt", EntrySource::Bytes(b"1".to_vec()), Meta::new())
            .unwrap();
        pkg.set("a.txt", EntrySource::Bytes(b"2".to_vec()), Meta::new())
            .unwrap();
        assert_eq!(pkg.len(), 1);
        assert_eq!(
            pkg.get("a.txt").unwrap().source,
            EntrySource::Bytes(b"2".to_vec())
        );
    }

    #[test]
    fn rejects_bad_logical_keys() {
        let mut pkg = Package::new();
        for key in ["", "/abs", "dir/", "a/../b", "a//b"] {
            assert!(
                pkg.set(key, EntrySource::Bytes(vec![]), Meta::new()).is_err(),
                "{key}"
            );
        }
    }

    #[test]
    fn set_dir_adds_files_recursively() {
        let dir = temp_dir();
        let mut pkg = Package::new();
        let added = pkg.set_dir("Plates/1234_plate", &dir).unwrap();
        assert_eq!(added, 3);

        let keys: Vec<&str> = pkg.logical_keys().collect();
        assert_eq!(
            keys,
            vec![
                "Plates/1234_plate/nested/deeper/low.txt",
                "Plates/1234_plate/nested/mid.txt",
                "Plates/1234_plate/top.txt",
            ]
        );
        assert!(pkg.set_dir("x", &dir.join("top.txt")).is_err());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn build_hashes_files_and_bytes() {
        let dir = temp_dir();
        let mut pkg = Package::new();
        let mut meta = Meta::new();
        meta.insert("Structure".into(), serde_json::json!("lysosome"));
        pkg.set("top.txt", EntrySource::File(dir.join("top.txt")), meta)
            .unwrap();
        pkg.set("README.md", EntrySource::Bytes(b"# hi".to_vec()), Meta::new())
            .unwrap();

        let manifest = pkg.build().unwrap();
        assert_eq!(manifest.entries.len(), 2);
        assert_eq!(manifest.entries[0].logical_key, "README.md");
        let top = manifest.get("top.txt").unwrap();
        assert_eq!(top.hash, sha256_hex(b"top"));
        assert_eq!(top.size, 3);
        assert_eq!(top.meta["Structure"], "lysosome");

        // Same content and metadata give the same top hash.
        assert_eq!(pkg.build().unwrap().top_hash, manifest.top_hash);

        pkg.set_meta("top.txt", Meta::new()).unwrap();
        assert_ne!(pkg.build().unwrap().top_hash, manifest.top_hash);
        assert!(pkg.set_meta("missing", Meta::new()).is_err());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn serves_sources_for_push() {
        let mut pkg = Package::new();
        pkg.set("x", EntrySource::Bytes(b"x".to_vec()), Meta::new())
            .unwrap();
        assert!(BlobSource::source(&pkg, "x").is_some());
        assert!(BlobSource::source(&pkg, "y").is_none());
    }
}
