//! Dataset packaging and distribution for datapack.
//!
//! This crate ties together manifest validation, README handling, package
//! assembly, and registry push into the end-to-end `distribute` workflow.

pub mod dataset;
pub mod logical_key;
pub mod package;
pub mod pipeline;

pub use dataset::{Dataset, ExtraFiles, SUPPORTING_FILES_DIR};
pub use logical_key::{approve_name, create_unique_logical_key};
pub use package::{Meta, Package, PackageEntry};
pub use pipeline::{
    ASSOCIATES_KEY, BuiltPackage, DistributeOptions, DistributeResult, METADATA_KEY,
    ProgressReporter, README_KEY, SilentProgress, build_package, distribute,
};
