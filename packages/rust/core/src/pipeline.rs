//! End-to-end `distribute` pipeline: README → validate → package → push.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use serde_json::Value as Json;
use tracing::{debug, info, instrument};

use datapack_manifest::{Manifest, Schema, ValidateOptions, ValidationProgress, Value, validate};
use datapack_registry::{PushReceipt, Registry};
use datapack_shared::{
    DatapackError, EntrySource, PackageManifest, PackageName, Result, default_path_hints,
    resolve_lenient,
};
use datapack_storage::Storage;

use crate::dataset::Dataset;
use crate::logical_key::{approve_name, create_unique_logical_key};
use crate::package::{Meta, Package};

/// Logical key of the packaged README.
pub const README_KEY: &str = "README.md";
/// Logical key of the packaged manifest.
pub const METADATA_KEY: &str = "metadata.csv";
/// Metadata key holding a file's row associates.
pub const ASSOCIATES_KEY: &str = "associates";

/// Options for [`distribute`].
#[derive(Debug, Clone)]
pub struct DistributeOptions {
    /// Registry to push to (local path or `file://` URL). `None` only builds.
    pub push_uri: Option<String>,
    /// Message attached to the pushed version.
    pub message: Option<String>,
    /// Attach each row's `{label: logical_key}` map to its files.
    pub attach_associates: bool,
    /// Drop rows that fail validation instead of aborting.
    pub drop_on_error: bool,
    /// Column-name fragments marking path columns during schema inference.
    pub path_hints: Vec<String>,
}

impl Default for DistributeOptions {
    fn default() -> Self {
        Self {
            push_uri: None,
            message: None,
            attach_associates: true,
            drop_on_error: false,
            path_hints: default_path_hints(),
        }
    }
}

/// Result of the `distribute` pipeline.
#[derive(Debug)]
pub struct DistributeResult {
    pub name: PackageName,
    /// The built manifest. Physical keys point at the local sources.
    pub manifest: PackageManifest,
    /// Present when the package was pushed.
    pub receipt: Option<PushReceipt>,
    /// Schema the data was validated against.
    pub schema: Schema,
    /// Rows packaged.
    pub rows: usize,
    /// Rows dropped by validation.
    pub dropped_rows: usize,
    /// Total elapsed time.
    pub elapsed: std::time::Duration,
}

/// Progress callback for reporting pipeline status.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a new phase.
    fn phase(&self, name: &str);
    /// Called as work within a phase completes.
    fn tick(&self, current: usize, total: usize);
    /// Called when the pipeline completes.
    fn done(&self, result: &DistributeResult);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn tick(&self, _current: usize, _total: usize) {}
    fn done(&self, _result: &DistributeResult) {}
}

/// Forwards per-value validation ticks to a [`ProgressReporter`].
struct ValidationTicker<'a> {
    progress: &'a dyn ProgressReporter,
    checked: AtomicUsize,
    total: usize,
}

impl ValidationProgress for ValidationTicker<'_> {
    fn value_checked(&self) {
        let current = self.checked.fetch_add(1, Ordering::Relaxed) + 1;
        self.progress.tick(current, self.total);
    }
}

/// A package assembled from a dataset, ready to push.
#[derive(Debug)]
pub struct BuiltPackage {
    pub name: PackageName,
    pub package: Package,
    pub manifest: PackageManifest,
    pub schema: Schema,
    pub rows: usize,
    pub dropped_rows: usize,
}

/// Build the package for a dataset and, if a push target is set, push it
/// and index it.
#[instrument(skip_all, fields(dataset = %dataset))]
pub async fn distribute(
    dataset: &mut Dataset,
    options: &DistributeOptions,
    progress: &dyn ProgressReporter,
) -> Result<DistributeResult> {
    let start = Instant::now();

    let built = build_package(dataset, options, progress)?;

    let receipt = match &options.push_uri {
        Some(uri) => {
            progress.phase("Pushing package");
            let registry = Registry::open(uri)?;
            let receipt = registry.push(
                &built.name,
                &built.manifest,
                &built.package,
                options.message.as_deref(),
            )?;

            let storage = Storage::open(&registry.index_path()).await?;
            storage
                .record_push(
                    &receipt.name,
                    &built.manifest,
                    options.message.as_deref(),
                    receipt.timestamp,
                )
                .await?;
            Some(receipt)
        }
        None => None,
    };

    let result = DistributeResult {
        name: built.name,
        manifest: built.manifest,
        receipt,
        schema: built.schema,
        rows: built.rows,
        dropped_rows: built.dropped_rows,
        elapsed: start.elapsed(),
    };

    info!(
        name = %result.name,
        top_hash = %result.manifest.top_hash,
        entries = result.manifest.entries.len(),
        pushed = result.receipt.is_some(),
        elapsed_ms = result.elapsed.as_millis() as u64,
        "distribute complete"
    );
    progress.done(&result);

    Ok(result)
}

/// Assemble the package without pushing.
///
/// 1. Package the README and the local files it references
/// 2. Validate the manifest
/// 3. Package every file in the path columns with row metadata
/// 4. Collapse metadata lists that hold a single repeated value
/// 5. Attach associates
/// 6. Package `metadata.csv` and any extra files
/// 7. Hash everything into a manifest
#[instrument(skip_all, fields(dataset = %dataset))]
pub fn build_package(
    dataset: &mut Dataset,
    options: &DistributeOptions,
    progress: &dyn ProgressReporter,
) -> Result<BuiltPackage> {
    let name = PackageName::new(&dataset.package_owner, approve_name(&dataset.name)?);
    let mut pkg = Package::new();

    // --- README ---
    progress.phase("Packaging README");
    let (text, referenced) = dataset.readme.packaged_text()?;
    for (logical_key, path) in referenced {
        if path.is_dir() {
            pkg.set_dir(&logical_key, &path)?;
        } else {
            pkg.set(logical_key, EntrySource::File(path), Meta::new())?;
        }
    }
    pkg.set(README_KEY, EntrySource::Bytes(text.into_bytes()), Meta::new())?;

    // --- Validate ---
    progress.phase("Validating dataset");
    let ticker = ValidationTicker {
        progress,
        checked: AtomicUsize::new(0),
        total: dataset.data.height() * dataset.data.width(),
    };
    let validate_options = ValidateOptions {
        drop_on_error: options.drop_on_error,
        path_hints: options.path_hints.clone(),
    };
    let validated = validate(&dataset.data, None, &validate_options, Some(&ticker))?;
    let mut data = validated.data;
    let dropped_rows = dataset.data.height() - data.height();

    let path_columns = if dataset.path_columns.is_empty() {
        validated.schema.path_columns()
    } else {
        dataset.path_columns.clone()
    };
    debug!(?path_columns, "packaging path columns");

    // --- Files ---
    progress.phase("Constructing package");
    let mut reducible: BTreeMap<String, bool> = dataset
        .metadata_columns
        .iter()
        .map(|c| (c.clone(), true))
        .collect();
    let mut associates: BTreeMap<usize, serde_json::Map<String, Json>> = BTreeMap::new();

    let total = path_columns.len() * data.height();
    let mut done = 0;
    for column in &path_columns {
        if !data.has_column(column) {
            return Err(DatapackError::validation(format!(
                "path column '{column}' is not in the dataset"
            )));
        }
        let label = dataset
            .column_names_map
            .get(column)
            .cloned()
            .unwrap_or_else(|| column.clone());

        for row in 0..data.height() {
            let cell = data.get(row, column).cloned().unwrap_or(Value::Null);
            let Some(path) = cell.as_path() else {
                return Err(DatapackError::type_mismatch(format!(
                    "column '{column}' at row {row} does not hold a file path: '{cell}'"
                )));
            };
            let physical = resolve_lenient(&path);
            let logical_key = format!("{label}/{}", create_unique_logical_key(&physical)?);
            data.set(row, column, Value::Str(logical_key.clone()))?;

            if physical.is_file() {
                let meta = row_metadata(&data, row, &dataset.metadata_columns)?;
                if let Some(entry) = pkg.get_mut(&logical_key) {
                    join_metadata(&mut entry.meta, meta, &mut reducible);
                } else {
                    pkg.set(logical_key.clone(), EntrySource::File(physical), meta)?;
                }
                associates
                    .entry(row)
                    .or_default()
                    .insert(label.clone(), Json::String(logical_key));
            } else {
                pkg.set_dir(&logical_key, &physical)?;
            }

            done += 1;
            progress.tick(done, total);
        }
    }

    // --- Collapse metadata ---
    for (_, entry) in pkg.iter_mut() {
        reduce_metadata(&mut entry.meta, &reducible);
    }

    // --- Associates ---
    if options.attach_associates {
        progress.phase("Attaching associates");
        for mapping in associates.values() {
            for logical_key in mapping.values().filter_map(Json::as_str) {
                if let Some(entry) = pkg.get_mut(logical_key) {
                    entry
                        .meta
                        .insert(ASSOCIATES_KEY.to_string(), Json::Object(mapping.clone()));
                }
            }
        }
    }

    // --- metadata.csv and extras ---
    pkg.set(
        METADATA_KEY,
        EntrySource::Bytes(data.to_csv_bytes()?),
        Meta::new(),
    )?;

    for (parent, files) in &dataset.extra_files {
        for file in files {
            let file_name = file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let logical_key = format!("{parent}/{file_name}");
            if file.is_dir() {
                pkg.set_dir(&logical_key, file)?;
            } else {
                pkg.set(logical_key, EntrySource::File(file.clone()), Meta::new())?;
            }
        }
    }

    // --- Build ---
    progress.phase("Hashing package");
    let manifest = pkg.build()?;

    Ok(BuiltPackage {
        name,
        package: pkg,
        manifest,
        schema: validated.schema,
        rows: data.height(),
        dropped_rows,
    })
}

/// `{column: [value]}` for each metadata column of a row.
fn row_metadata(data: &Manifest, row: usize, columns: &[String]) -> Result<Meta> {
    let mut meta = Meta::new();
    for column in columns {
        let Some(value) = data.get(row, column) else {
            continue;
        };
        let json = value.to_json().ok_or_else(|| {
            DatapackError::type_mismatch(format!(
                "Non-simple-JSON-serializable type found in column: '{column}', at index: {row}: \
                 (path '{value}'). Only null, bool, int, float, and string values are allowed \
                 in metadata."
            ))
        })?;
        meta.insert(column.clone(), Json::Array(vec![json]));
    }
    Ok(meta)
}

/// Append `incoming` value lists onto an existing entry's lists.
///
/// A column stays reducible only while every joined value is equal; once it
/// is not, it never becomes reducible again.
fn join_metadata(existing: &mut Meta, incoming: Meta, reducible: &mut BTreeMap<String, bool>) {
    for (column, values) in incoming {
        let Json::Array(new_values) = values else {
            continue;
        };
        match existing.get_mut(&column) {
            Some(Json::Array(current)) => {
                current.extend(new_values);
                if let Some(flag) = reducible.get_mut(&column) {
                    if *flag {
                        *flag = current.iter().all(|v| v == &current[0]);
                    }
                }
            }
            _ => {
                existing.insert(column, Json::Array(new_values));
            }
        }
    }
}

/// Replace each reducible column's list with its first value.
fn reduce_metadata(meta: &mut Meta, reducible: &BTreeMap<String, bool>) {
    let columns: BTreeSet<String> = meta.keys().cloned().collect();
    for column in columns {
        if reducible.get(&column) != Some(&true) {
            continue;
        }
        if let Some(Json::Array(values)) = meta.get(&column) {
            let first = values.first().cloned().unwrap_or(Json::Null);
            meta.insert(column, first);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};

    use serde_json::json;

    use super::*;
    use crate::dataset::ExtraFiles;

    /// Scratch dataset: two FOV images shared by three cells, plus a plate dir.
    fn scratch() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("dp-pipeline-{}", uuid::Uuid::now_v7()));
        for sub in ["fovs", "cells", "plate/sub", "docs"] {
            std::fs::create_dir_all(dir.join(sub)).unwrap();
        }
        for (path, bytes) in [
            ("fovs/0.tiff", "fov0"),
            ("fovs/1.tiff", "fov1"),
            ("cells/0.tiff", "cell0"),
            ("cells/1.tiff", "cell1"),
            ("cells/2.tiff", "cell2"),
            ("plate/a.txt", "a"),
            ("plate/sub/b.txt", "b"),
            ("docs/figure.png", "png"),
            ("notes.txt", "notes"),
        ] {
            std::fs::write(dir.join(path), bytes).unwrap();
        }
        std::fs::write(
            dir.join("README.md"),
            "# Cells\n![figure](docs/figure.png)\n[home](https://allencell.org)\n",
        )
        .unwrap();

        let p = |rel: &str| dir.join(rel).display().to_string();
        let csv = format!(
            "CellId,Structure,FOVId,FOVPath,CellPath,PlatePath\n\
             1,lysosome,10,{},{},{}\n\
             2,lysosome,10,{},{},{}\n\
             3,golgi,11,{},{},{}\n",
            p("fovs/0.tiff"), p("cells/0.tiff"), p("plate"),
            p("fovs/0.tiff"), p("cells/1.tiff"), p("plate"),
            p("fovs/1.tiff"), p("cells/2.tiff"), p("plate"),
        );
        std::fs::write(dir.join("manifest.csv"), csv).unwrap();
        dir
    }

    fn dataset(dir: &Path) -> Dataset {
        Dataset::from_csv(dir.join("manifest.csv"), "Test Dataset", "aics", dir.join("README.md"))
            .unwrap()
    }

    fn fov_key(manifest: &PackageManifest, n: usize) -> String {
        let wanted = datapack_shared::sha256_hex(format!("fov{n}").as_bytes());
        manifest
            .entries
            .iter()
            .find(|e| e.logical_key.starts_with("FOVPath/") && e.hash == wanted)
            .map(|e| e.logical_key.clone())
            .unwrap()
    }

    #[test]
    fn builds_expected_layout() {
        let dir = scratch();
        let mut ds = dataset(&dir);
        ds.set_metadata_columns(vec!["CellId".into(), "Structure".into()])
            .unwrap();

        let built = build_package(&mut ds, &DistributeOptions::default(), &SilentProgress).unwrap();
        let m = &built.manifest;

        assert!(m.get(README_KEY).is_some());
        assert!(m.get(METADATA_KEY).is_some());
        assert!(m.get("referenced_files/figure.png").is_some());
        assert_eq!(m.entries.iter().filter(|e| e.logical_key.starts_with("FOVPath/")).count(), 2);
        assert_eq!(m.entries.iter().filter(|e| e.logical_key.starts_with("CellPath/")).count(), 3);
        // One plate directory of two files, reached from every row.
        assert_eq!(m.entries.iter().filter(|e| e.logical_key.starts_with("PlatePath/")).count(), 2);
        assert_eq!(built.rows, 3);
        assert_eq!(built.dropped_rows, 0);

        let readme = match &built.package.get(README_KEY).unwrap().source {
            EntrySource::Bytes(b) => String::from_utf8(b.clone()).unwrap(),
            EntrySource::File(_) => panic!("README should be rewritten in memory"),
        };
        assert!(readme.contains("![figure](referenced_files/figure.png)"));
        assert!(readme.contains("[home](https://allencell.org)"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn metadata_is_joined_and_reduced() {
        let dir = scratch();
        let mut ds = dataset(&dir);
        ds.set_metadata_columns(vec!["CellId".into(), "Structure".into()])
            .unwrap();

        let built = build_package(&mut ds, &DistributeOptions::default(), &SilentProgress).unwrap();
        let m = &built.manifest;

        // Shared FOV: CellId differs so it stays a list everywhere; Structure
        // was equal on every shared file so it collapses.
        let fov0 = m.get(&fov_key(m, 0)).unwrap();
        assert_eq!(fov0.meta["CellId"], json!([1, 2]));
        assert_eq!(fov0.meta["Structure"], json!("lysosome"));

        let fov1 = m.get(&fov_key(m, 1)).unwrap();
        assert_eq!(fov1.meta["CellId"], json!([3]));
        assert_eq!(fov1.meta["Structure"], json!("golgi"));

        let cell = m
            .entries
            .iter()
            .find(|e| e.logical_key.starts_with("CellPath/") && e.meta["CellId"] == json!([1]))
            .unwrap();
        assert_eq!(cell.meta["Structure"], json!("lysosome"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn associates_link_files_in_a_row() {
        let dir = scratch();
        let mut ds = dataset(&dir);
        let built = build_package(&mut ds, &DistributeOptions::default(), &SilentProgress).unwrap();
        let m = &built.manifest;

        let cell = m
            .entries
            .iter()
            .find(|e| e.logical_key.starts_with("CellPath/") && e.hash == datapack_shared::sha256_hex(b"cell2"))
            .unwrap();
        let associates = cell.meta[ASSOCIATES_KEY].as_object().unwrap();
        assert_eq!(associates["CellPath"], json!(cell.logical_key));
        assert_eq!(associates["FOVPath"], json!(fov_key(m, 1)));
        assert!(!associates.contains_key("PlatePath"));

        let mut ds = dataset(&dir);
        let options = DistributeOptions {
            attach_associates: false,
            ..Default::default()
        };
        let built = build_package(&mut ds, &options, &SilentProgress).unwrap();
        assert!(built.manifest.entries.iter().all(|e| !e.meta.contains_key(ASSOCIATES_KEY)));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn metadata_csv_holds_logical_keys() {
        let dir = scratch();
        let mut ds = dataset(&dir);
        let mut names = BTreeMap::new();
        names.insert("CellPath".to_string(), "Cells".to_string());
        ds.set_column_names_map(names).unwrap();

        let built = build_package(&mut ds, &DistributeOptions::default(), &SilentProgress).unwrap();
        let csv = match built.package.get(METADATA_KEY).unwrap().source.clone() {
            EntrySource::Bytes(b) => String::from_utf8(b).unwrap(),
            EntrySource::File(_) => panic!("metadata.csv should be generated"),
        };
        let parsed = Manifest::from_csv_reader(csv.as_bytes()).unwrap();
        let cell = parsed.get(0, "CellPath").unwrap().to_string();
        assert!(cell.starts_with("Cells/"));
        assert!(built.manifest.get(&cell).is_some());
        assert!(!csv.contains(&dir.display().to_string()));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn explicit_path_columns_and_extra_files() {
        let dir = scratch();
        let mut ds = dataset(&dir);
        ds.set_path_columns(vec!["CellPath".into()]).unwrap();
        ds.set_extra_files(ExtraFiles::List(vec![dir.join("notes.txt")]))
            .unwrap();

        let built = build_package(&mut ds, &DistributeOptions::default(), &SilentProgress).unwrap();
        let m = &built.manifest;
        assert!(m.entries.iter().all(|e| !e.logical_key.starts_with("FOVPath/")));
        assert!(m.get("supporting_files/notes.txt").is_some());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn path_metadata_is_rejected() {
        let dir = scratch();
        let mut ds = dataset(&dir);
        ds.set_path_columns(vec!["CellPath".into()]).unwrap();
        ds.set_metadata_columns(vec!["FOVPath".into()]).unwrap();
        let err = build_package(&mut ds, &DistributeOptions::default(), &SilentProgress).unwrap_err();
        assert!(err.to_string().contains("Non-simple-JSON-serializable"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_files_abort_or_drop() {
        let dir = scratch();
        std::fs::remove_file(dir.join("cells/1.tiff")).unwrap();

        let mut ds = dataset(&dir);
        assert!(build_package(&mut ds, &DistributeOptions::default(), &SilentProgress).is_err());

        let options = DistributeOptions {
            drop_on_error: true,
            ..Default::default()
        };
        let built = build_package(&mut ds, &options, &SilentProgress).unwrap();
        assert_eq!(built.rows, 2);
        assert_eq!(built.dropped_rows, 1);
        assert_eq!(
            built.manifest.entries.iter().filter(|e| e.logical_key.starts_with("CellPath/")).count(),
            2
        );
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn bad_names_fail_at_distribution() {
        let dir = scratch();
        let mut ds = dataset(&dir);
        ds.set_name("no/slashes");
        assert!(build_package(&mut ds, &DistributeOptions::default(), &SilentProgress).is_err());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn distribute_pushes_and_indexes() {
        let dir = scratch();
        let registry_root = dir.join("registry");
        let mut ds = dataset(&dir);
        let options = DistributeOptions {
            push_uri: Some(registry_root.display().to_string()),
            message: Some("initial".into()),
            ..Default::default()
        };

        let result = distribute(&mut ds, &options, &SilentProgress).await.unwrap();
        let receipt = result.receipt.as_ref().unwrap();
        assert_eq!(receipt.name, "aics/test_dataset");
        assert_eq!(receipt.top_hash, result.manifest.top_hash);

        let registry = Registry::open(&registry_root.display().to_string()).unwrap();
        let name: PackageName = "aics/test_dataset".parse().unwrap();
        assert_eq!(registry.resolve(&name, "latest").unwrap(), result.manifest.top_hash);

        let storage = Storage::open_readonly(&registry.index_path()).await.unwrap();
        let versions = storage.list_versions("aics/test_dataset").await.unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].message.as_deref(), Some("initial"));

        // Same inputs, same content address; a second push adds a version.
        let options = DistributeOptions {
            message: Some("rerun".into()),
            ..options
        };
        let again = distribute(&mut ds, &options, &SilentProgress).await.unwrap();
        assert_eq!(again.manifest.top_hash, result.manifest.top_hash);
        let pushed = registry.versions(&name).unwrap();
        assert_eq!(pushed.len(), 2);

        // The index lists the same versions the registry resolves.
        drop(storage);
        let storage = Storage::open_readonly(&registry.index_path()).await.unwrap();
        let indexed: Vec<(i64, Option<String>)> = storage
            .list_versions("aics/test_dataset")
            .await
            .unwrap()
            .into_iter()
            .map(|v| (v.pushed_at, v.message))
            .collect();
        let expected: Vec<(i64, Option<String>)> =
            pushed.iter().map(|v| (v.timestamp, v.message.clone())).collect();
        assert_eq!(indexed, expected);
        assert_eq!(expected[1].1.as_deref(), Some("initial"));
        let first = registry
            .load_version(&name, &expected[1].0.to_string())
            .unwrap();
        assert_eq!(first.message.as_deref(), Some("initial"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn reduction_sticks_once_values_differ() {
        let mut reducible = BTreeMap::from([("A".to_string(), true)]);
        let mut meta = Meta::new();
        meta.insert("A".into(), json!([1]));

        let mut m2 = Meta::new();
        m2.insert("A".into(), json!([2]));
        join_metadata(&mut meta, m2, &mut reducible);
        assert!(!reducible["A"]);

        let mut m3 = Meta::new();
        m3.insert("A".into(), json!([1]));
        join_metadata(&mut meta, m3, &mut reducible);
        assert!(!reducible["A"]);
        assert_eq!(meta["A"], json!([1, 2, 1]));

        reduce_metadata(&mut meta, &reducible);
        assert_eq!(meta["A"], json!([1, 2, 1]));
    }
}
