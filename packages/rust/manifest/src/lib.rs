//! Tabular dataset manifests: loading, type inference, and validation.

pub mod table;
pub mod validation;

pub use table::{DType, Manifest, Value};
pub use validation::{
    FeatureDefinition, FieldError, Schema, SchemaDefinition, ValidateOptions, ValidatedDataset,
    ValidatedFeature, ValidationFn, ValidationProgress, Validator, cast_value, display_name,
    generate_schema_template, validate,
};
