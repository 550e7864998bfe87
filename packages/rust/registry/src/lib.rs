//! Local, content-addressed package registry.
//!
//! Layout under the registry root:
//! ```text
//! <root>/.datapack/
//! ├── objects/<sha256>                        file bytes, written once
//! ├── packages/<top_hash>.json                content manifests, written once
//! ├── named_packages/<owner>/<name>/<unix_ts> version record (JSON)
//! ├── named_packages/<owner>/<name>/latest    top hash of the newest version
//! └── index.db                                search index (datapack-storage)
//! ```
//! Pushing never overwrites a version: each push adds a new timestamp file.
//! A top hash only covers content, so the package name and push message live
//! in the version record rather than the shared manifest.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument};
use url::Url;

use datapack_shared::{
    DatapackError, EntrySource, PackageManifest, PackageName, Result, absolutize,
};

const REGISTRY_DIR: &str = ".datapack";
const LATEST: &str = "latest";

/// Supplies the bytes for each logical key of a manifest being pushed.
pub trait BlobSource {
    fn source(&self, logical_key: &str) -> Option<&EntrySource>;
}

/// Outcome of a successful push.
#[derive(Debug, Clone, Serialize)]
pub struct PushReceipt {
    pub name: String,
    pub top_hash: String,
    /// Unix timestamp identifying this version.
    pub timestamp: i64,
    pub registry: PathBuf,
    pub objects_written: usize,
    pub objects_reused: usize,
}

/// One named version of a package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub timestamp: i64,
    pub top_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Handle to a registry directory.
#[derive(Debug, Clone)]
pub struct Registry {
    root: PathBuf,
}

impl Registry {
    /// Open (creating if needed) a registry at a local path or `file://` URL.
    pub fn open(target: &str) -> Result<Self> {
        let root = parse_target(target)?;
        let registry = Self { root };
        for dir in [
            registry.objects_dir(),
            registry.packages_dir(),
            registry.named_dir(),
        ] {
            std::fs::create_dir_all(&dir).map_err(|e| DatapackError::io(&dir, e))?;
        }
        debug!(root = %registry.root.display(), "opened registry");
        Ok(registry)
    }

    /// The registry root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the search index database.
    pub fn index_path(&self) -> PathBuf {
        self.root.join(REGISTRY_DIR).join("index.db")
    }

    fn objects_dir(&self) -> PathBuf {
        self.root.join(REGISTRY_DIR).join("objects")
    }

    fn packages_dir(&self) -> PathBuf {
        self.root.join(REGISTRY_DIR).join("packages")
    }

    fn named_dir(&self) -> PathBuf {
        self.root.join(REGISTRY_DIR).join("named_packages")
    }

    fn package_dir(&self, name: &PackageName) -> PathBuf {
        self.named_dir().join(&name.owner).join(&name.name)
    }

    // -----------------------------------------------------------------------
    // Push
    // -----------------------------------------------------------------------

    /// Copy every entry's bytes into the object store, write the manifest,
    /// and record a new named version.
    #[instrument(skip_all, fields(name = %name, top_hash = %manifest.top_hash))]
    pub fn push(
        &self,
        name: &PackageName,
        manifest: &PackageManifest,
        sources: &dyn BlobSource,
        message: Option<&str>,
    ) -> Result<PushReceipt> {
        if !manifest.verify_top_hash() {
            return Err(DatapackError::Registry(format!(
                "manifest top hash {} does not match its entries",
                manifest.top_hash
            )));
        }

        let mut pushed = manifest.clone();
        pushed.name = None;
        pushed.message = None;

        let mut objects_written = 0;
        let mut objects_reused = 0;
        for entry in &mut pushed.entries {
            let source = sources.source(&entry.logical_key).ok_or_else(|| {
                DatapackError::Registry(format!("no source for entry '{}'", entry.logical_key))
            })?;
            let object = self.objects_dir().join(&entry.hash);
            if object.exists() {
                objects_reused += 1;
            } else {
                write_object(source, &entry.hash, &object)?;
                objects_written += 1;
            }
            entry.physical_key = object.display().to_string();
        }

        let manifest_path = self.packages_dir().join(format!("{}.json", pushed.top_hash));
        if !manifest_path.exists() {
            write_atomic(&manifest_path, &to_json(&pushed)?)?;
        }

        let package_dir = self.package_dir(name);
        std::fs::create_dir_all(&package_dir).map_err(|e| DatapackError::io(&package_dir, e))?;

        // Two pushes in the same second still get distinct versions.
        let mut timestamp = Utc::now().timestamp();
        while package_dir.join(timestamp.to_string()).exists() {
            timestamp += 1;
        }
        let record = VersionRecord {
            timestamp,
            top_hash: pushed.top_hash.clone(),
            message: message.map(str::to_string),
        };
        write_atomic(&package_dir.join(timestamp.to_string()), &to_json(&record)?)?;
        write_atomic(&package_dir.join(LATEST), pushed.top_hash.as_bytes())?;

        info!(
            objects_written,
            objects_reused,
            timestamp,
            "pushed package"
        );

        Ok(PushReceipt {
            name: name.to_string(),
            top_hash: pushed.top_hash,
            timestamp,
            registry: self.root.clone(),
            objects_written,
            objects_reused,
        })
    }

    // -----------------------------------------------------------------------
    // Read
    // -----------------------------------------------------------------------

    /// All versions of a package, newest first.
    pub fn versions(&self, name: &PackageName) -> Result<Vec<VersionRecord>> {
        let dir = self.package_dir(name);
        if !dir.is_dir() {
            return Err(DatapackError::not_found(format!(
                "package {name} is not in registry {}",
                self.root.display()
            )));
        }

        let mut versions = Vec::new();
        for entry in std::fs::read_dir(&dir).map_err(|e| DatapackError::io(&dir, e))? {
            let entry = entry.map_err(|e| DatapackError::io(&dir, e))?;
            let file_name = entry.file_name();
            let Ok(timestamp) = file_name.to_string_lossy().parse::<i64>() else {
                continue;
            };
            let path = entry.path();
            let content = read_pointer(&path)?;
            let record: VersionRecord = serde_json::from_str(&content).map_err(|e| {
                DatapackError::parse(format!("invalid version record {}: {e}", path.display()))
            })?;
            versions.push(VersionRecord { timestamp, ..record });
        }
        versions.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(versions)
    }

    /// Resolve `latest`, a unix timestamp, or a top-hash prefix to a top hash.
    pub fn resolve(&self, name: &PackageName, version: &str) -> Result<String> {
        if version == LATEST {
            let latest = self.package_dir(name).join(LATEST);
            if !latest.is_file() {
                return Err(DatapackError::not_found(format!("package {name} has no versions")));
            }
            return read_pointer(&latest);
        }
        self.resolve_version(name, version).map(|v| v.top_hash)
    }

    /// Resolve `latest`, a unix timestamp, or a top-hash prefix to a version
    /// record. A hash prefix picks the newest push of that content.
    pub fn resolve_version(&self, name: &PackageName, version: &str) -> Result<VersionRecord> {
        let versions = self.versions(name)?;

        if version == LATEST {
            return versions.into_iter().next().ok_or_else(|| {
                DatapackError::not_found(format!("package {name} has no versions"))
            });
        }

        if let Ok(ts) = version.parse::<i64>() {
            if let Some(v) = versions.iter().find(|v| v.timestamp == ts) {
                return Ok(v.clone());
            }
        }

        let mut matches: Vec<&str> = versions
            .iter()
            .map(|v| v.top_hash.as_str())
            .filter(|h| h.starts_with(version))
            .collect();
        matches.sort_unstable();
        matches.dedup();
        match matches.as_slice() {
            [hash] => versions
                .iter()
                .find(|v| v.top_hash == *hash)
                .cloned()
                .ok_or_else(|| DatapackError::not_found(format!("no version of {name} is {hash}"))),
            [] => Err(DatapackError::not_found(format!(
                "no version of {name} matches '{version}'"
            ))),
            _ => Err(DatapackError::Registry(format!(
                "'{version}' is ambiguous for {name}"
            ))),
        }
    }

    /// Load one version of a package, with its name and push message.
    pub fn load_version(&self, name: &PackageName, version: &str) -> Result<PackageManifest> {
        let record = self.resolve_version(name, version)?;
        let mut manifest = self.load_manifest(&record.top_hash)?;
        manifest.name = Some(name.to_string());
        manifest.message = record.message;
        Ok(manifest)
    }

    /// Load a pushed manifest by top hash. Content only: name and message are
    /// per version, see [`Registry::load_version`].
    pub fn load_manifest(&self, top_hash: &str) -> Result<PackageManifest> {
        let path = self.packages_dir().join(format!("{top_hash}.json"));
        let content = std::fs::read_to_string(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                DatapackError::not_found(format!("no manifest for top hash {top_hash}"))
            }
            _ => DatapackError::io(&path, e),
        })?;
        serde_json::from_str(&content)
            .map_err(|e| DatapackError::parse(format!("invalid manifest {}: {e}", path.display())))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Accept a local path or `file://` URL. Remote object stores are rejected.
fn parse_target(target: &str) -> Result<PathBuf> {
    if target.contains("://") {
        let url = Url::parse(target)
            .map_err(|e| DatapackError::config(format!("invalid registry URL '{target}': {e}")))?;
        return match url.scheme() {
            "file" => url
                .to_file_path()
                .map_err(|_| DatapackError::config(format!("invalid file URL '{target}'"))),
            scheme => Err(DatapackError::config(format!(
                "{scheme}:// registries are not supported, push to a local directory instead"
            ))),
        };
    }
    Ok(absolutize(target))
}

fn read_pointer(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .map_err(|e| DatapackError::io(path, e))
}

fn temp_sibling(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!(".{name}.{}.tmp", uuid::Uuid::now_v7()))
}

/// Write to a temp file, then rename into place.
fn write_atomic(target: &Path, bytes: &[u8]) -> Result<()> {
    let temp = temp_sibling(target);
    std::fs::write(&temp, bytes).map_err(|e| DatapackError::io(&temp, e))?;
    std::fs::rename(&temp, target).map_err(|e| DatapackError::io(target, e))
}

fn to_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec_pretty(value)
        .map_err(|e| DatapackError::Registry(format!("serialization failed: {e}")))
}

fn hash_mismatch(source: &str, expected: &str, actual: &str) -> DatapackError {
    DatapackError::Registry(format!(
        "{source} changed since the package was built: expected sha256 {expected}, got {actual}"
    ))
}

/// Store an object under its hash, checking the bytes still hash to it.
fn write_object(source: &EntrySource, hash: &str, object: &Path) -> Result<()> {
    match source {
        EntrySource::Bytes(bytes) => {
            let actual = datapack_shared::sha256_hex(bytes);
            if actual != hash {
                return Err(hash_mismatch("<memory>", hash, &actual));
            }
            write_atomic(object, bytes)
        }
        EntrySource::File(path) => {
            let temp = temp_sibling(object);
            let actual = copy_hashed(path, &temp).inspect_err(|_| {
                let _ = std::fs::remove_file(&temp);
            })?;
            if actual != hash {
                let _ = std::fs::remove_file(&temp);
                return Err(hash_mismatch(&path.display().to_string(), hash, &actual));
            }
            std::fs::rename(&temp, object).map_err(|e| DatapackError::io(object, e))
        }
    }
}

/// Copy `from` to `to`, returning the SHA-256 of the bytes copied.
fn copy_hashed(from: &Path, to: &Path) -> Result<String> {
    let mut reader = std::fs::File::open(from).map_err(|e| DatapackError::io(from, e))?;
    let mut writer = std::fs::File::create(to).map_err(|e| DatapackError::io(to, e))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf).map_err(|e| DatapackError::io(from, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        writer.write_all(&buf[..n]).map_err(|e| DatapackError::io(to, e))?;
    }
    writer.flush().map_err(|e| DatapackError::io(to, e))?;
    Ok(format!("{:x}", hasher.finalize()))
}
