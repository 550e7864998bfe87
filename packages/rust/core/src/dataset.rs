//! A dataset manifest plus everything needed to package it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::debug;

use datapack_manifest::Manifest;
use datapack_readme::Readme;
use datapack_shared::{DatapackError, PackageName, Result, resolve_strict};

use crate::logical_key::approve_name;

/// Logical directory for extra files given without a parent.
pub const SUPPORTING_FILES_DIR: &str = "supporting_files";

/// Extra files to ship alongside the manifest.
#[derive(Debug, Clone)]
pub enum ExtraFiles {
    /// Placed under `supporting_files/`.
    List(Vec<PathBuf>),
    /// Placed under each key.
    Grouped(BTreeMap<String, Vec<PathBuf>>),
}

/// A dataset awaiting distribution.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub(crate) data: Manifest,
    pub(crate) name: String,
    pub(crate) package_owner: String,
    pub(crate) readme: Readme,
    pub(crate) metadata_columns: Vec<String>,
    pub(crate) path_columns: Vec<String>,
    pub(crate) column_names_map: BTreeMap<String, String>,
    pub(crate) extra_files: BTreeMap<String, Vec<PathBuf>>,
}

impl Dataset {
    /// Wrap an already loaded manifest.
    pub fn new(
        data: Manifest,
        name: &str,
        package_owner: &str,
        readme_path: impl AsRef<Path>,
    ) -> Result<Self> {
        let name = approve_name(name)?;
        let readme = Readme::open(readme_path)?;
        Ok(Self {
            data,
            name,
            package_owner: package_owner.to_string(),
            readme,
            metadata_columns: Vec::new(),
            path_columns: Vec::new(),
            column_names_map: BTreeMap::new(),
            extra_files: BTreeMap::new(),
        })
    }

    /// Load the manifest from a CSV file.
    pub fn from_csv(
        dataset_path: impl AsRef<Path>,
        name: &str,
        package_owner: &str,
        readme_path: impl AsRef<Path>,
    ) -> Result<Self> {
        let data = Manifest::from_csv_path(dataset_path)?;
        Self::new(data, name, package_owner, readme_path)
    }

    pub fn data(&self) -> &Manifest {
        &self.data
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Rename the dataset. The name is checked again at distribution.
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn package_owner(&self) -> &str {
        &self.package_owner
    }

    /// `owner/name` handle, with the name approved.
    pub fn package_name(&self) -> Result<PackageName> {
        Ok(PackageName::new(&self.package_owner, approve_name(&self.name)?))
    }

    pub fn readme(&self) -> &Readme {
        &self.readme
    }

    pub fn readme_mut(&mut self) -> &mut Readme {
        &mut self.readme
    }

    pub fn metadata_columns(&self) -> &[String] {
        &self.metadata_columns
    }

    pub fn path_columns(&self) -> &[String] {
        &self.path_columns
    }

    pub fn column_names_map(&self) -> &BTreeMap<String, String> {
        &self.column_names_map
    }

    pub fn extra_files(&self) -> &BTreeMap<String, Vec<PathBuf>> {
        &self.extra_files
    }

    /// Append usage documentation (file contents, or a standard paragraph for a link).
    pub fn add_usage_doc(&mut self, doc_or_link: &str) -> Result<()> {
        self.readme.append_standards(Some(doc_or_link), None)?;
        Ok(())
    }

    /// Append license documentation (file contents, or a standard paragraph for a link).
    pub fn add_license(&mut self, doc_or_link: &str) -> Result<()> {
        self.readme.append_standards(None, Some(doc_or_link))?;
        Ok(())
    }

    /// Columns whose values are attached as metadata to every file in the row.
    pub fn set_metadata_columns(&mut self, columns: Vec<String>) -> Result<()> {
        self.check_any_column(columns.iter())?;
        self.metadata_columns = columns;
        Ok(())
    }

    /// Columns holding file paths, overriding schema detection.
    pub fn set_path_columns(&mut self, columns: Vec<String>) -> Result<()> {
        self.check_any_column(columns.iter())?;
        self.path_columns = columns;
        Ok(())
    }

    /// Package directory label for each path column.
    pub fn set_column_names_map(&mut self, columns: BTreeMap<String, String>) -> Result<()> {
        self.check_any_column(columns.keys())?;
        self.column_names_map = columns;
        Ok(())
    }

    /// Supporting files. Every path must exist and is stored resolved.
    pub fn set_extra_files(&mut self, files: ExtraFiles) -> Result<()> {
        let grouped = match files {
            ExtraFiles::List(list) => BTreeMap::from([(SUPPORTING_FILES_DIR.to_string(), list)]),
            ExtraFiles::Grouped(map) => map,
        };

        let mut resolved = BTreeMap::new();
        for (parent, paths) in grouped {
            let paths = paths
                .iter()
                .map(resolve_strict)
                .collect::<Result<Vec<_>>>()?;
            debug!(parent = %parent, files = paths.len(), "extra files");
            resolved.insert(parent, paths);
        }
        self.extra_files = resolved;
        Ok(())
    }

    /// Error unless at least one of `columns` is in the manifest.
    fn check_any_column<'a>(&self, columns: impl Iterator<Item = &'a String>) -> Result<()> {
        let columns: Vec<&String> = columns.collect();
        if columns.iter().any(|c| self.data.has_column(c)) {
            return Ok(());
        }
        Err(DatapackError::validation(format!(
            "One or more columns provided were not found in the dataset. Received: {columns:?}"
        )))
    }
}

impl std::fmt::Display for Dataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "<Dataset [package: {}/{}, shape: ({}, {})]>",
            self.package_owner,
            self.name,
            self.data.height(),
            self.data.width()
        )
    }
}

#[cfg(test)]
mod tests {
    use datapack_manifest::Value;

    use super::*;

    fn scratch() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("dp-dataset-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("README.md"), "# Cells\n").unwrap();
        std::fs::write(dir.join("notes.txt"), "notes").unwrap();
        dir
    }

    fn dataset(dir: &Path) -> Dataset {
        let data = Manifest::new(
            vec!["CellId".into(), "Structure".into(), "ReadPath".into()],
            vec![vec![Value::Int(1), "lysosome".into(), "x.tiff".into()]],
        )
        .unwrap();
        Dataset::new(data, "Test Dataset", "aics", dir.join("README.md")).unwrap()
    }

    #[test]
    fn new_approves_name() {
        let dir = scratch();
        let ds = dataset(&dir);
        assert_eq!(ds.name(), "test_dataset");
        assert_eq!(ds.package_name().unwrap().to_string(), "aics/test_dataset");
        assert_eq!(ds.to_string(), "<Dataset [package: aics/test_dataset, shape: (1, 3)]>");

        let data = ds.data().clone();
        assert!(Dataset::new(data, "bad/name", "aics", dir.join("README.md")).is_err());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn column_setters_need_one_known_column() {
        let dir = scratch();
        let mut ds = dataset(&dir);

        ds.set_metadata_columns(vec!["Structure".into(), "Unknown".into()])
            .unwrap();
        assert_eq!(ds.metadata_columns().len(), 2);
        assert!(ds.set_path_columns(vec!["Nope".into()]).is_err());
        assert!(
            ds.set_column_names_map(BTreeMap::from([("ReadPath".into(), "Images".into())]))
                .is_ok()
        );
        assert!(
            ds.set_column_names_map(BTreeMap::from([("Nope".into(), "x".into())]))
                .is_err()
        );
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn extra_files_are_resolved() {
        let dir = scratch();
        let mut ds = dataset(&dir);

        ds.set_extra_files(ExtraFiles::List(vec![dir.join("notes.txt")]))
            .unwrap();
        assert_eq!(ds.extra_files()[SUPPORTING_FILES_DIR].len(), 1);

        ds.set_extra_files(ExtraFiles::Grouped(BTreeMap::from([(
            "docs".to_string(),
            vec![dir.join("notes.txt")],
        )])))
        .unwrap();
        assert!(ds.extra_files().contains_key("docs"));

        let err = ds
            .set_extra_files(ExtraFiles::List(vec![dir.join("missing.txt")]))
            .unwrap_err();
        assert!(matches!(err, DatapackError::FileNotFound { .. }));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn usage_and_license_update_readme() {
        let dir = scratch();
        let mut ds = dataset(&dir);
        ds.add_usage_doc("https://docs.quiltdata.com").unwrap();
        ds.add_license(&dir.join("notes.txt").display().to_string())
            .unwrap();
        let text = ds.readme_mut().text().unwrap();
        assert!(text.contains("### Usage"));
        assert!(text.ends_with("\nnotes"));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
