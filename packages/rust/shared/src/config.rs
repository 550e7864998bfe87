//! Application configuration for datapack.
//!
//! User config lives at `~/.datapack/datapack.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{DatapackError, Result};
use crate::paths::expand_user;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "datapack.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".datapack";

// ---------------------------------------------------------------------------
// Config structs (matching datapack.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Global defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Manifest validation settings.
    #[serde(default)]
    pub validation: ValidationConfig,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Registry used when `distribute` is not given a push target.
    #[serde(default = "default_registry")]
    pub registry: String,

    /// Attach the per-row `associates` map to every packaged file.
    #[serde(default = "default_true")]
    pub attach_associates: bool,

    /// Show progress bars in the CLI.
    #[serde(default = "default_true")]
    pub show_progress: bool,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            registry: default_registry(),
            attach_associates: true,
            show_progress: true,
        }
    }
}

fn default_registry() -> String {
    "~/datapack-registry".into()
}
fn default_true() -> bool {
    true
}

/// `[validation]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Drop rows that fail validation instead of aborting.
    #[serde(default)]
    pub drop_on_error: bool,

    /// Column-name fragments that mark a string column as a file path.
    #[serde(default = "default_path_hints")]
    pub path_hints: Vec<String>,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            drop_on_error: false,
            path_hints: default_path_hints(),
        }
    }
}

/// The column-name fragments used when no config overrides them.
pub fn default_path_hints() -> Vec<String> {
    ["file", "path", "_dir", "directory"]
        .iter()
        .map(|s| (*s).to_string())
        .collect()
}

impl AppConfig {
    /// The default registry path with `~` expanded.
    pub fn registry_path(&self) -> PathBuf {
        expand_user(&self.defaults.registry)
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.datapack/`).
pub fn config_dir() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| DatapackError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.datapack/datapack.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| DatapackError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| DatapackError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| DatapackError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| DatapackError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| DatapackError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}
