//! Error types for datapack.
//!
//! Library crates use [`DatapackError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all datapack operations.
#[derive(Debug, thiserror::Error)]
pub enum DatapackError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A referenced file or directory does not exist.
    #[error("not found: {message}")]
    FileNotFound { message: String },

    /// A value could not be cast to the declared column type.
    #[error("cast error: {message}")]
    Cast { message: String },

    /// A value has a type other than the declared column type.
    #[error("type error: {message}")]
    Type { message: String },

    /// Data validation error (unknown columns, bad names, failed checks).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// Text parsing error (CSV cells, README links, manifests).
    #[error("parse error: {message}")]
    Parse { message: String },

    /// CSV reader/writer error.
    #[error("csv error: {0}")]
    Csv(String),

    /// Registry layout or push error.
    #[error("registry error: {0}")]
    Registry(String),

    /// Index database error.
    #[error("storage error: {0}")]
    Storage(String),
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, DatapackError>;

impl DatapackError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a not-found error.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::FileNotFound {
            message: msg.into(),
        }
    }

    /// Create a cast error.
    pub fn cast(msg: impl Into<String>) -> Self {
        Self::Cast {
            message: msg.into(),
        }
    }

    /// Create a type error.
    pub fn type_mismatch(msg: impl Into<String>) -> Self {
        Self::Type {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = DatapackError::config("registry not set");
        assert_eq!(err.to_string(), "config error: registry not set");

        let err = DatapackError::not_found("Filepath a.png was not found.");
        assert!(err.to_string().starts_with("not found:"));

        let err = DatapackError::validation("columns [x] not in dataset");
        assert!(err.to_string().contains("columns [x]"));
    }
}
