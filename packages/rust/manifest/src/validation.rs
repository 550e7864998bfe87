//! Column type inference and per-value validation.
//!
//! A [`FeatureDefinition`] describes what a column should hold. [`validate`]
//! checks (and optionally casts) every value of every defined column, either
//! aborting on the first problem or collecting per-row errors and dropping
//! the offending rows.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, instrument, warn};

use datapack_shared::{DatapackError, Result, default_path_hints, expand_user};

use crate::table::{DType, Manifest, Value, parse_bool};

/// Number of errors logged per column before the rest are elided.
const MAX_LOGGED_ERRORS: usize = 10;

/// A predicate run against every value of a feature.
pub type ValidationFn = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

// ---------------------------------------------------------------------------
// Feature definitions
// ---------------------------------------------------------------------------

/// What a column should contain, plus optional descriptive metadata.
#[derive(Clone)]
pub struct FeatureDefinition {
    pub dtype: DType,
    pub validation_functions: Vec<ValidationFn>,
    /// Cast values that don't match `dtype`. Always on for `Path`.
    pub cast_values: bool,
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub units: Option<String>,
}

impl FeatureDefinition {
    pub fn new(dtype: DType) -> Self {
        Self {
            dtype,
            validation_functions: Vec::new(),
            cast_values: dtype == DType::Path,
            display_name: None,
            description: None,
            units: None,
        }
    }

    /// Enable or disable casting. Path features always cast.
    pub fn with_cast_values(mut self, cast: bool) -> Self {
        self.cast_values = cast || self.dtype == DType::Path;
        self
    }

    pub fn with_validation(mut self, f: impl Fn(&Value) -> bool + Send + Sync + 'static) -> Self {
        self.validation_functions.push(Arc::new(f));
        self
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_units(mut self, units: impl Into<String>) -> Self {
        self.units = Some(units.into());
        self
    }
}

impl std::fmt::Debug for FeatureDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeatureDefinition")
            .field("dtype", &self.dtype)
            .field("validation_functions", &self.validation_functions.len())
            .field("cast_values", &self.cast_values)
            .field("display_name", &self.display_name)
            .field("description", &self.description)
            .field("units", &self.units)
            .finish()
    }
}

/// Column name to definition, in column order.
pub type SchemaDefinition = Vec<(String, FeatureDefinition)>;

// ---------------------------------------------------------------------------
// Schema inference
// ---------------------------------------------------------------------------

/// Guess a definition for every column of `data`.
///
/// The dtype is the most common non-null value type (ties go to the type seen
/// first). Casting is enabled when a column holds more than one kind of value,
/// nulls included. String columns whose name contains one of `path_hints`
/// (and doesn't end in `id`) are treated as file paths.
pub fn generate_schema_template(data: &Manifest, path_hints: &[String]) -> SchemaDefinition {
    let mut template = Vec::with_capacity(data.width());

    for col in data.columns() {
        let values = data.column(col).unwrap_or_default();

        // Kind counts in first-seen order.
        let mut counts: Vec<(Option<DType>, usize)> = Vec::new();
        for v in &values {
            let kind = v.kind();
            match counts.iter_mut().find(|(k, _)| *k == kind) {
                Some((_, n)) => *n += 1,
                None => counts.push((kind, 1)),
            }
        }

        let majority = counts
            .iter()
            .filter_map(|(k, n)| k.map(|k| (k, *n)))
            .fold(None::<(DType, usize)>, |best, (k, n)| match best {
                Some((_, best_n)) if best_n >= n => best,
                _ => Some((k, n)),
            })
            .map(|(k, _)| k);

        let cast_values = counts.len() > 1;

        // An all-null column has nothing to point at, whatever its name says.
        let dtype = match majority {
            Some(DType::Str | DType::Path) if is_path_column(col, path_hints) => DType::Path,
            Some(kind) => kind,
            None => DType::Str,
        };

        let definition = FeatureDefinition::new(dtype)
            .with_cast_values(cast_values)
            .with_display_name(display_name(col));

        debug!(column = %col, %dtype, cast_values, "inferred feature");
        template.push((col.clone(), definition));
    }

    template
}

fn is_path_column(column: &str, path_hints: &[String]) -> bool {
    let lower = column.to_lowercase();
    path_hints.iter().any(|hint| lower.contains(hint.as_str())) && !lower.ends_with("id")
}

/// Human-readable column label: separators become spaces, dots are removed,
/// and every word is title-cased.
pub fn display_name(column: &str) -> String {
    let spaced = column
        .replace('_', " ")
        .replace('-', " ")
        .replace("  ", " ")
        .replace('.', "");

    let mut out = String::with_capacity(spaced.len());
    let mut prev_alpha = false;
    for c in spaced.chars() {
        if c.is_alphabetic() {
            if prev_alpha {
                out.extend(c.to_lowercase());
            } else {
                out.extend(c.to_uppercase());
            }
            prev_alpha = true;
        } else {
            out.push(c);
            prev_alpha = false;
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Casting
// ---------------------------------------------------------------------------

/// Cast a value to `dtype`. `None` means the cast is impossible.
pub fn cast_value(value: &Value, dtype: DType) -> Option<Value> {
    if value.kind() == Some(dtype) {
        return Some(value.clone());
    }

    match (value, dtype) {
        (Value::Null, DType::Path) => None,
        (Value::Null, _) => Some(Value::Null),

        (Value::Str(s), DType::Int) => s.trim().parse().ok().map(Value::Int),
        (Value::Float(f), DType::Int)
            if f.fract() == 0.0 && *f >= i64::MIN as f64 && *f < i64::MAX as f64 =>
        {
            Some(Value::Int(*f as i64))
        }
        (Value::Bool(b), DType::Int) => Some(Value::Int(i64::from(*b))),

        (Value::Str(s), DType::Float) => s.trim().parse().ok().map(Value::Float),
        (Value::Int(i), DType::Float) => Some(Value::Float(*i as f64)),

        (Value::Str(s), DType::Bool) => parse_bool(s.trim()).map(Value::Bool),
        (Value::Int(i), DType::Bool) => Some(Value::Bool(*i != 0)),

        (Value::Bool(_) | Value::Int(_) | Value::Float(_) | Value::Path(_), DType::Str) => {
            Some(Value::Str(value.to_string()))
        }

        (Value::Str(s), DType::Path) => Some(Value::Path(PathBuf::from(s))),

        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Validated output types
// ---------------------------------------------------------------------------

/// A validation failure for one value, recorded when rows may be dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    /// Source row index.
    pub index: usize,
    pub column: String,
    pub message: String,
}

/// A column that went through validation.
#[derive(Debug, Clone, Serialize)]
pub struct ValidatedFeature {
    pub name: String,
    pub dtype: DType,
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub units: Option<String>,
    pub errored_results: Vec<FieldError>,
}

/// Every column of a dataset, validated or not.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    features: Vec<(String, Option<ValidatedFeature>)>,
}

impl Schema {
    pub fn new(features: Vec<(String, Option<ValidatedFeature>)>) -> Self {
        Self { features }
    }

    pub fn features(&self) -> &[(String, Option<ValidatedFeature>)] {
        &self.features
    }

    pub fn get(&self, name: &str) -> Option<&ValidatedFeature> {
        self.features
            .iter()
            .find(|(n, _)| n == name)
            .and_then(|(_, f)| f.as_ref())
    }

    /// Names of columns that were validated.
    pub fn validated(&self) -> Vec<&str> {
        self.features
            .iter()
            .filter(|(_, f)| f.is_some())
            .map(|(n, _)| n.as_str())
            .collect()
    }

    /// Names of columns that had no definition.
    pub fn unvalidated(&self) -> Vec<&str> {
        self.features
            .iter()
            .filter(|(_, f)| f.is_none())
            .map(|(n, _)| n.as_str())
            .collect()
    }

    /// Validated columns whose dtype is `Path`.
    pub fn path_columns(&self) -> Vec<String> {
        self.features
            .iter()
            .filter_map(|(n, f)| match f {
                Some(f) if f.dtype == DType::Path => Some(n.clone()),
                _ => None,
            })
            .collect()
    }

    /// Render the schema as a Markdown table.
    pub fn to_markdown_table(&self) -> String {
        let mut out = String::from(
            "| name | dtype | display_name | description | units | errored_results |\n\
             |---|---|---|---|---|---|\n",
        );
        for (name, feature) in &self.features {
            match feature {
                Some(f) => out.push_str(&format!(
                    "| {} | {} | {} | {} | {} | {} |\n",
                    name,
                    f.dtype,
                    f.display_name.as_deref().unwrap_or(""),
                    f.description.as_deref().unwrap_or(""),
                    f.units.as_deref().unwrap_or(""),
                    f.errored_results.len(),
                )),
                None => out.push_str(&format!("| {name} |  |  |  |  |  |\n")),
            }
        }
        out
    }
}

impl std::fmt::Display for Schema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pct = if self.features.is_empty() {
            0.0
        } else {
            self.validated().len() as f64 / self.features.len() as f64 * 100.0
        };
        write!(f, "Schema [features validated: {pct:.1}%]")
    }
}

/// A cleaned copy of the data plus the schema it was checked against.
#[derive(Debug, Clone)]
pub struct ValidatedDataset {
    pub data: Manifest,
    pub schema: Schema,
}

// ---------------------------------------------------------------------------
// Validator
// ---------------------------------------------------------------------------

/// Progress callback, ticked once per checked value.
pub trait ValidationProgress: Send + Sync {
    fn value_checked(&self);
}

/// Checks the values of one column against its definition.
pub struct Validator {
    pub name: String,
    /// `(source row index, value)` pairs; cast values are written back here.
    pub values: Vec<(usize, Value)>,
    pub definition: FeatureDefinition,
    pub drop_on_error: bool,
}

impl Validator {
    pub fn new(
        name: impl Into<String>,
        values: Vec<(usize, Value)>,
        definition: FeatureDefinition,
        drop_on_error: bool,
    ) -> Self {
        Self {
            name: name.into(),
            values,
            definition,
            drop_on_error,
        }
    }

    /// Validate every value. Without `drop_on_error` the first failure is
    /// returned as an error; with it, failures are collected per row.
    pub fn process(&mut self, progress: Option<&dyn ValidationProgress>) -> Result<ValidatedFeature> {
        let mut errored_results = Vec::new();

        for (index, value) in self.values.iter_mut() {
            if let Err(e) = check_value(&self.name, *index, value, &self.definition) {
                if !self.drop_on_error {
                    return Err(e);
                }
                errored_results.push(FieldError {
                    index: *index,
                    column: self.name.clone(),
                    message: e.to_string(),
                });
            }

            if let Some(p) = progress {
                p.value_checked();
            }
        }

        Ok(ValidatedFeature {
            name: self.name.clone(),
            dtype: self.definition.dtype,
            display_name: self.definition.display_name.clone(),
            description: self.definition.description.clone(),
            units: self.definition.units.clone(),
            errored_results,
        })
    }
}

/// Cast, type-check, existence-check, and run validation functions on one value.
fn check_value(
    column: &str,
    index: usize,
    value: &mut Value,
    definition: &FeatureDefinition,
) -> Result<()> {
    if definition.cast_values {
        match cast_value(value, definition.dtype) {
            Some(cast) => *value = cast,
            None => {
                return Err(DatapackError::cast(format!(
                    "Could not cast value {} to received type {}.",
                    describe(column, index, value),
                    definition.dtype
                )));
            }
        }
    }

    let type_ok = match value.kind() {
        Some(kind) => kind == definition.dtype,
        None => definition.dtype != DType::Path,
    };
    if !type_ok {
        return Err(DatapackError::type_mismatch(format!(
            "Value {} does not match the expected type {}.",
            describe(column, index, value),
            definition.dtype
        )));
    }

    if let Value::Path(p) = &*value {
        if !expand_user(p).exists() {
            return Err(DatapackError::not_found(format!(
                "Filepath {} was not found.",
                describe(column, index, value)
            )));
        }
    }

    for (func_index, f) in definition.validation_functions.iter().enumerate() {
        if !f(value) {
            return Err(DatapackError::validation(format!(
                "Value {} failed validation function {func_index}.",
                describe(column, index, value)
            )));
        }
    }

    Ok(())
}

fn describe(column: &str, index: usize, value: &Value) -> String {
    let kind = value
        .kind()
        .map(|k| k.to_string())
        .unwrap_or_else(|| "null".to_string());
    format!("from column: '{column}', at index: {index}: ({kind} '{value}')")
}

// ---------------------------------------------------------------------------
// validate
// ---------------------------------------------------------------------------

/// Options for [`validate`].
#[derive(Debug, Clone)]
pub struct ValidateOptions {
    /// Collect errors and drop failing rows instead of aborting.
    pub drop_on_error: bool,
    /// Column-name fragments marking path columns when inferring a schema.
    pub path_hints: Vec<String>,
}

impl Default for ValidateOptions {
    fn default() -> Self {
        Self {
            drop_on_error: false,
            path_hints: default_path_hints(),
        }
    }
}

/// Validate a dataset against `schema`, or against an inferred one.
///
/// Columns are validated in parallel on scoped threads. The input is left
/// untouched; the returned data holds cast values and, with
/// `drop_on_error`, only the rows that passed every column.
#[instrument(skip_all, fields(rows = data.height(), columns = data.width()))]
pub fn validate(
    data: &Manifest,
    schema: Option<SchemaDefinition>,
    options: &ValidateOptions,
    progress: Option<&dyn ValidationProgress>,
) -> Result<ValidatedDataset> {
    let schema = schema.unwrap_or_else(|| generate_schema_template(data, &options.path_hints));

    for (column, _) in &schema {
        if !data.has_column(column) {
            return Err(DatapackError::validation(format!(
                "schema column '{column}' is not in the dataset"
            )));
        }
    }

    let indices = data.row_indices();
    let mut validators: Vec<Validator> = schema
        .into_iter()
        .map(|(column, definition)| {
            let values = data
                .column(&column)
                .unwrap_or_default()
                .into_iter()
                .cloned();
            let values = indices.iter().copied().zip(values).collect();
            Validator::new(column, values, definition, options.drop_on_error)
        })
        .collect();

    let outcomes: Vec<Result<ValidatedFeature>> = std::thread::scope(|scope| {
        let handles: Vec<_> = validators
            .iter_mut()
            .map(|v| scope.spawn(move || v.process(progress)))
            .collect();
        handles
            .into_iter()
            .map(|h| {
                h.join().unwrap_or_else(|_| {
                    Err(DatapackError::validation("validator thread panicked"))
                })
            })
            .collect()
    });

    let mut features = Vec::with_capacity(outcomes.len());
    for outcome in outcomes {
        features.push(outcome?);
    }

    for feature in &features {
        if feature.errored_results.is_empty() {
            continue;
        }
        warn!(
            column = %feature.name,
            errors = feature.errored_results.len(),
            "validation produced errors"
        );
        for er in feature.errored_results.iter().take(MAX_LOGGED_ERRORS) {
            warn!("{}", er.message);
        }
        if feature.errored_results.len() > MAX_LOGGED_ERRORS {
            warn!("...");
        }
    }

    let mut cleaned = data.clone();
    for validator in validators {
        let values = validator.values.into_iter().map(|(_, v)| v).collect();
        cleaned.set_column(&validator.name, values)?;
    }

    if options.drop_on_error {
        let dropped: BTreeSet<usize> = features
            .iter()
            .flat_map(|f| f.errored_results.iter().map(|e| e.index))
            .collect();
        if !dropped.is_empty() {
            debug!(dropped = dropped.len(), "dropping rows that failed validation");
        }
        cleaned.drop_rows(&dropped);
    }

    let schema = Schema::new(
        data.columns()
            .iter()
            .map(|col| {
                let feature = features.iter().find(|f| &f.name == col).cloned();
                (col.clone(), feature)
            })
            .collect(),
    );

    Ok(ValidatedDataset {
        data: cleaned,
        schema,
    })
}
