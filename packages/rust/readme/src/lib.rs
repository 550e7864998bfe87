//! Dataset README handling.
//!
//! A [`Readme`] wraps a Markdown file. It finds the local files the document
//! links to, appends usage and license sections, and rewrites links so the
//! README keeps working once packaged next to its referenced files.

mod links;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use datapack_shared::{DatapackError, Result, resolve_strict};

/// Logical directory that referenced files are packaged under.
pub const REFERENCED_FILES_DIR: &str = "referenced_files";

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// A local file or directory linked from the README.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferencedFile {
    /// The link target as written in the document.
    pub target: String,
    /// Absolute path the target resolves to.
    pub resolved: PathBuf,
}

impl ReferencedFile {
    /// Logical key this file gets inside a package.
    pub fn logical_key(&self) -> String {
        let name = self
            .resolved
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        format!("{REFERENCED_FILES_DIR}/{name}")
    }
}

/// A Markdown README on disk, plus any standards appended in memory.
#[derive(Debug, Clone)]
pub struct Readme {
    path: PathBuf,
    text: Option<String>,
}

// ---------------------------------------------------------------------------
// Readme
// ---------------------------------------------------------------------------

impl Readme {
    /// Open a README. The path must exist and be a file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = resolve_strict(path)?;
        if path.is_dir() {
            return Err(DatapackError::validation(format!(
                "README path {} is a directory",
                path.display()
            )));
        }
        Ok(Self { path, text: None })
    }

    /// Resolved path of the README file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current text, including appended standards. Reads the file on first use.
    pub fn text(&mut self) -> Result<&str> {
        if self.text.is_none() {
            let text = std::fs::read_to_string(&self.path)
                .map_err(|e| DatapackError::io(&self.path, e))?;
            self.text = Some(text);
        }
        Ok(self.text.as_deref().unwrap_or_default())
    }

    /// Local files and directories the README links to.
    ///
    /// External links and anchors are skipped. Targets are resolved against
    /// the README's directory; ones that don't exist are logged and ignored.
    pub fn referenced_files(&mut self) -> Result<Vec<ReferencedFile>> {
        let base = self
            .path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let targets = links::link_targets(self.text()?);

        let mut found: Vec<ReferencedFile> = Vec::new();
        for target in targets {
            if target.is_empty() || target.starts_with('#') || links::is_external(&target) {
                continue;
            }

            let candidate = base.join(&target);
            let Ok(resolved) = std::fs::canonicalize(&candidate) else {
                warn!(target = %target, "could not find file referenced in readme");
                continue;
            };

            if found.iter().any(|f| f.target == target) {
                continue;
            }
            debug!(target = %target, resolved = %resolved.display(), "readme reference");
            found.push(ReferencedFile { target, resolved });
        }

        Ok(found)
    }

    /// Append usage and/or license sections and return the full text.
    ///
    /// A link gets a short standard paragraph pointing at it. Anything else
    /// is treated as a path whose contents are appended.
    pub fn append_standards(
        &mut self,
        usage_doc_or_link: Option<&str>,
        license_doc_or_link: Option<&str>,
    ) -> Result<&str> {
        let mut text = self.text()?.to_string();

        if let Some(usage) = usage_doc_or_link {
            if links::is_external(usage) {
                text.push_str(&format!(
                    "\n### Usage\nFor documenation on how to use and interact with this \
                     dataset please refer to [{usage}]({usage})."
                ));
            } else {
                text.push('\n');
                text.push_str(&read_doc(usage)?);
            }
        }

        if let Some(license) = license_doc_or_link {
            if links::is_external(license) {
                text.push_str(&format!(
                    "\n### License\nFor questions on licensing please refer to \
                     [{license}]({license})."
                ));
            } else {
                text.push('\n');
                text.push_str(&read_doc(license)?);
            }
        }

        self.text = Some(text);
        self.text()
    }

    /// The text with every local reference rewritten to its packaged location,
    /// plus the `(logical key, resolved path)` pairs that must ship with it.
    pub fn packaged_text(&mut self) -> Result<(String, Vec<(String, PathBuf)>)> {
        let references = self.referenced_files()?;
        let rewrites: HashMap<&str, String> = references
            .iter()
            .map(|r| (r.target.as_str(), r.logical_key()))
            .collect();
        let text = links::rewrite_targets(self.text()?, |target| rewrites.get(target).cloned());

        let files = references
            .iter()
            .map(|r| (r.logical_key(), r.resolved.clone()))
            .collect();

        Ok((text, files))
    }
}

impl std::fmt::Display for Readme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<README [file: {}]>", self.path.display())
    }
}

fn read_doc(path: &str) -> Result<String> {
    let path = resolve_strict(path)?;
    std::fs::read_to_string(&path).map_err(|e| DatapackError::io(&path, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("dp-readme-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(dir.join("figs")).unwrap();
        std::fs::write(dir.join("figs").join("plot.png"), b"png").unwrap();
        std::fs::write(dir.join("methods.pdf"), b"pdf").unwrap();
        std::fs::write(dir.join("USAGE.md"), "## How to use\nLoad it.").unwrap();
        std::fs::write(
            dir.join("README.md"),
            "# Cells\n\n![plot](figs/plot.png)\n[methods](methods.pdf \"Methods\")\n\
             [again](methods.pdf)\n[missing](nope.tiff)\n[web](https://allencell.org)\n\
             [anchor](#cells)\n[folder](figs)\n",
        )
        .unwrap();
        dir
    }

    #[test]
    fn open_rejects_missing_and_directories() {
        let dir = scratch();
        assert!(matches!(
            Readme::open(dir.join("absent.md")).unwrap_err(),
            DatapackError::FileNotFound { .. }
        ));
        assert!(Readme::open(&dir).is_err());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn referenced_files_skips_external_and_missing() {
        let dir = scratch();
        let mut readme = Readme::open(dir.join("README.md")).unwrap();
        let refs = readme.referenced_files().unwrap();
        let targets: Vec<&str> = refs.iter().map(|r| r.target.as_str()).collect();
        assert_eq!(targets, vec!["figs/plot.png", "methods.pdf", "figs"]);
        assert!(refs.iter().all(|r| r.resolved.is_absolute()));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn append_standards_links_and_files() {
        let dir = scratch();
        let mut readme = Readme::open(dir.join("README.md")).unwrap();

        let text = readme
            .append_standards(Some("https://docs.quiltdata.com"), None)
            .unwrap()
            .to_string();
        assert!(text.ends_with(
            "\n### Usage\nFor documenation on how to use and interact with this dataset \
             please refer to [https://docs.quiltdata.com](https://docs.quiltdata.com)."
        ));

        let usage = dir.join("USAGE.md").display().to_string();
        let text = readme
            .append_standards(None, Some("http://www.allencell.org/terms-of-use.html"))
            .unwrap()
            .to_string();
        assert!(text.contains("### Usage"));
        assert!(text.contains("### License\nFor questions on licensing"));

        let text = readme.append_standards(Some(usage.as_str()), None).unwrap();
        assert!(text.ends_with("\n## How to use\nLoad it."));

        assert!(readme.append_standards(Some("no/such/doc.md"), None).is_err());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn packaged_text_rewrites_local_links() {
        let dir = scratch();
        let mut readme = Readme::open(dir.join("README.md")).unwrap();
        let (text, files) = readme.packaged_text().unwrap();

        assert!(text.contains("![plot](referenced_files/plot.png)"));
        assert!(text.contains("[methods](referenced_files/methods.pdf \"Methods\")"));
        assert!(text.contains("[web](https://allencell.org)"));
        let keys: Vec<&str> = files.iter().map(|(k, _)| k.as_str()).collect();
        assert!(keys.contains(&"referenced_files/methods.pdf"));
        assert!(keys.contains(&"referenced_files/figs"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn packaged_text_leaves_prose_and_nested_links_intact() {
        let dir = scratch();
        std::fs::create_dir_all(dir.join("data")).unwrap();
        std::fs::write(
            dir.join("NOTES.md"),
            "All figs live in [folder](figs).\n![plot](figs/plot.png)\n\
             Raw [data](data) and its metadata.",
        )
        .unwrap();

        let mut readme = Readme::open(dir.join("NOTES.md")).unwrap();
        let (text, files) = readme.packaged_text().unwrap();
        assert_eq!(
            text,
            "All figs live in [folder](referenced_files/figs).\n\
             ![plot](referenced_files/plot.png)\n\
             Raw [data](referenced_files/data) and its metadata."
        );
        assert_eq!(files.len(), 3);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
