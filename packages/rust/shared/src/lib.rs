//! Shared types, error model, and configuration for datapack.
//!
//! This crate is the foundation depended on by all other datapack crates.
//! It provides:
//! - [`DatapackError`]: the unified error type
//! - Package manifest types ([`PackageManifest`], [`ManifestEntry`], [`PackageName`])
//! - Configuration ([`AppConfig`], config loading)
//! - Path helpers (`~` expansion and resolution)

pub mod config;
pub mod error;
pub mod paths;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, DefaultsConfig, ValidationConfig, config_dir, config_file_path,
    default_path_hints, init_config, load_config, load_config_from,
};
pub use error::{DatapackError, Result};
pub use paths::{absolutize, expand_user, resolve_lenient, resolve_strict};
pub use types::{
    CURRENT_SCHEMA_VERSION, EntrySource, ManifestEntry, PackageManifest, PackageName,
    compute_top_hash, sha256_hex,
};
