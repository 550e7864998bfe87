//! Typed, in-memory dataset manifest.
//!
//! A [`Manifest`] is a small dataframe: named columns over rows of [`Value`]
//! cells. Reading a CSV coerces each column to a single type the way a
//! dataframe reader would; programmatic construction may mix types freely.

use std::collections::BTreeSet;
use std::io::Read;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use datapack_shared::{DatapackError, Result, expand_user};

// ---------------------------------------------------------------------------
// Cells
// ---------------------------------------------------------------------------

/// The type a column holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    Bool,
    Int,
    Float,
    Str,
    Path,
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Float => "float",
            Self::Str => "str",
            Self::Path => "path",
        };
        f.write_str(name)
    }
}

/// A single manifest cell.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Path(PathBuf),
}

impl Value {
    /// The cell's type, or `None` for a missing value.
    pub fn kind(&self) -> Option<DType> {
        match self {
            Self::Null => None,
            Self::Bool(_) => Some(DType::Bool),
            Self::Int(_) => Some(DType::Int),
            Self::Float(_) => Some(DType::Float),
            Self::Str(_) => Some(DType::Str),
            Self::Path(_) => Some(DType::Path),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Borrow the value as a filesystem path, if it is a string or a path.
    pub fn as_path(&self) -> Option<PathBuf> {
        match self {
            Self::Str(s) => Some(PathBuf::from(s)),
            Self::Path(p) => Some(p.clone()),
            _ => None,
        }
    }

    /// Convert to a simple JSON value. Paths have no JSON form and return `None`.
    pub fn to_json(&self) -> Option<serde_json::Value> {
        match self {
            Self::Null => Some(serde_json::Value::Null),
            Self::Bool(b) => Some(serde_json::Value::Bool(*b)),
            Self::Int(i) => Some(serde_json::Value::from(*i)),
            // Non-finite floats are not representable in JSON.
            Self::Float(f) => Some(
                serde_json::Number::from_f64(*f)
                    .map(serde_json::Value::Number)
                    .unwrap_or(serde_json::Value::Null),
            ),
            Self::Str(s) => Some(serde_json::Value::String(s.clone())),
            Self::Path(_) => None,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null => Ok(()),
            Self::Bool(b) => write!(f, "{}", if *b { "True" } else { "False" }),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(v) => {
                if v.is_finite() && v.fract() == 0.0 && v.abs() < 1e15 {
                    write!(f, "{v:.1}")
                } else {
                    write!(f, "{v}")
                }
            }
            Self::Str(s) => f.write_str(s),
            Self::Path(p) => write!(f, "{}", p.display()),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<PathBuf> for Value {
    fn from(p: PathBuf) -> Self {
        Self::Path(p)
    }
}

// ---------------------------------------------------------------------------
// Manifest
// ---------------------------------------------------------------------------

/// One manifest row, remembering its position in the source.
#[derive(Debug, Clone, PartialEq)]
struct Row {
    index: usize,
    values: Vec<Value>,
}

/// A tabular dataset manifest.
#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    columns: Vec<String>,
    rows: Vec<Row>,
}

impl Manifest {
    /// Build a manifest from column names and rows. Every row must have one
    /// value per column.
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Result<Self> {
        check_unique_columns(&columns)?;
        let width = columns.len();
        let rows = rows
            .into_iter()
            .enumerate()
            .map(|(index, values)| {
                if values.len() != width {
                    return Err(DatapackError::validation(format!(
                        "row {index} has {} values but the manifest has {width} columns",
                        values.len()
                    )));
                }
                Ok(Row { index, values })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { columns, rows })
    }

    /// Read a CSV manifest from disk.
    pub fn from_csv_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = expand_user(path);
        if path.is_dir() {
            return Err(DatapackError::validation(format!(
                "dataset path {} is a directory, expected a CSV file",
                path.display()
            )));
        }
        if !path.is_file() {
            return Err(DatapackError::not_found(format!(
                "dataset {} was not found",
                path.display()
            )));
        }

        let file = std::fs::File::open(&path).map_err(|e| DatapackError::io(&path, e))?;
        let manifest = Self::from_csv_reader(file)?;
        debug!(
            path = %path.display(),
            rows = manifest.height(),
            columns = manifest.width(),
            "loaded manifest"
        );
        Ok(manifest)
    }

    /// Read a CSV manifest from any reader, coercing each column to one type.
    pub fn from_csv_reader<R: Read>(reader: R) -> Result<Self> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_reader(reader);

        let columns: Vec<String> = csv_reader
            .headers()
            .map_err(|e| DatapackError::Csv(e.to_string()))?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();
        check_unique_columns(&columns)?;

        let mut raw: Vec<Vec<String>> = vec![Vec::new(); columns.len()];
        let mut height = 0;
        for record in csv_reader.records() {
            let record = record.map_err(|e| DatapackError::Csv(e.to_string()))?;
            for (col, cell) in raw.iter_mut().zip(record.iter()) {
                col.push(cell.trim().to_string());
            }
            height += 1;
        }

        let coerced: Vec<Vec<Value>> = raw.iter().map(|cells| coerce_column(cells)).collect();

        let rows = (0..height)
            .map(|index| Row {
                index,
                values: coerced.iter().map(|col| col[index].clone()).collect(),
            })
            .collect();

        Ok(Self { columns, rows })
    }

    /// Column names in order.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Number of rows.
    pub fn height(&self) -> usize {
        self.rows.len()
    }

    /// Number of columns.
    pub fn width(&self) -> usize {
        self.columns.len()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Source row indices of the remaining rows, in order.
    pub fn row_indices(&self) -> Vec<usize> {
        self.rows.iter().map(|r| r.index).collect()
    }

    /// All values of a column, top to bottom.
    pub fn column(&self, name: &str) -> Option<Vec<&Value>> {
        let idx = self.column_index(name)?;
        Some(self.rows.iter().map(|r| &r.values[idx]).collect())
    }

    /// The value at a row position and column name.
    pub fn get(&self, row: usize, column: &str) -> Option<&Value> {
        let idx = self.column_index(column)?;
        self.rows.get(row).map(|r| &r.values[idx])
    }

    /// Replace the value at a row position and column name.
    pub fn set(&mut self, row: usize, column: &str, value: Value) -> Result<()> {
        let idx = self
            .column_index(column)
            .ok_or_else(|| DatapackError::validation(format!("no column named '{column}'")))?;
        let height = self.rows.len();
        let target = self.rows.get_mut(row).ok_or_else(|| {
            DatapackError::validation(format!("row {row} out of range (height {height})"))
        })?;
        target.values[idx] = value;
        Ok(())
    }

    /// Replace a whole column. `values` must have one entry per row.
    pub fn set_column(&mut self, column: &str, values: Vec<Value>) -> Result<()> {
        let idx = self
            .column_index(column)
            .ok_or_else(|| DatapackError::validation(format!("no column named '{column}'")))?;
        if values.len() != self.rows.len() {
            return Err(DatapackError::validation(format!(
                "column '{column}' replacement has {} values for {} rows",
                values.len(),
                self.rows.len()
            )));
        }
        for (row, value) in self.rows.iter_mut().zip(values) {
            row.values[idx] = value;
        }
        Ok(())
    }

    /// Drop rows by their source index.
    pub fn drop_rows(&mut self, indices: &BTreeSet<usize>) {
        self.rows.retain(|r| !indices.contains(&r.index));
    }

    /// Serialize the manifest back to CSV.
    pub fn to_csv_bytes(&self) -> Result<Vec<u8>> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer
            .write_record(&self.columns)
            .map_err(|e| DatapackError::Csv(e.to_string()))?;
        for row in &self.rows {
            writer
                .write_record(row.values.iter().map(|v| v.to_string()))
                .map_err(|e| DatapackError::Csv(e.to_string()))?;
        }
        writer
            .into_inner()
            .map_err(|e| DatapackError::Csv(e.to_string()))
    }

    /// Write the manifest as CSV to `path`.
    pub fn write_csv(&self, path: &Path) -> Result<()> {
        let bytes = self.to_csv_bytes()?;
        std::fs::write(path, bytes).map_err(|e| DatapackError::io(path, e))
    }
}

fn check_unique_columns(columns: &[String]) -> Result<()> {
    let mut seen = BTreeSet::new();
    for col in columns {
        if !seen.insert(col.as_str()) {
            return Err(DatapackError::validation(format!(
                "duplicate column name '{col}'"
            )));
        }
    }
    Ok(())
}

/// Coerce raw CSV cells of one column to a single type.
///
/// Empty cells become `Null`. Then the first of int, float, bool that every
/// non-empty cell parses as wins; otherwise the column stays text.
fn coerce_column(cells: &[String]) -> Vec<Value> {
    let present: Vec<&str> = cells
        .iter()
        .map(String::as_str)
        .filter(|c| !c.is_empty())
        .collect();

    let parse = |f: &dyn Fn(&str) -> Option<Value>| -> Vec<Value> {
        cells
            .iter()
            .map(|c| {
                if c.is_empty() {
                    Value::Null
                } else {
                    f(c.as_str()).unwrap_or(Value::Null)
                }
            })
            .collect()
    };

    if present.is_empty() {
        return vec![Value::Null; cells.len()];
    }
    if present.iter().all(|c| c.parse::<i64>().is_ok()) {
        return parse(&|c| c.parse::<i64>().ok().map(Value::Int));
    }
    if present.iter().all(|c| c.parse::<f64>().is_ok()) {
        return parse(&|c| c.parse::<f64>().ok().map(Value::Float));
    }
    if present.iter().all(|c| parse_bool(c).is_some()) {
        return parse(&|c| parse_bool(c).map(Value::Bool));
    }
    parse(&|c| Some(Value::Str(c.to_string())))
}

pub(crate) fn parse_bool(s: &str) -> Option<bool> {
    if s.eq_ignore_ascii_case("true") {
        Some(true)
    } else if s.eq_ignore_ascii_case("false") {
        Some(false)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CSV: &str = "\
CellId,Structure,Score,Passed,2dReadPath
1,lysosome,0.5,true,/data/a.png
2,golgi,1,False,/data/b.png
3,,2.25,TRUE,
";

    fn load() -> Manifest {
        Manifest::from_csv_reader(CSV.as_bytes()).expect("parse csv")
    }

    #[test]
    fn csv_columns_are_coerced() {
        let m = load();
        assert_eq!(m.height(), 3);
        assert_eq!(m.width(), 5);
        assert_eq!(m.get(0, "CellId"), Some(&Value::Int(1)));
        assert_eq!(m.get(1, "Score"), Some(&Value::Float(1.0)));
        assert_eq!(m.get(1, "Passed"), Some(&Value::Bool(false)));
        assert_eq!(m.get(2, "Structure"), Some(&Value::Null));
        assert_eq!(m.get(0, "2dReadPath"), Some(&Value::Str("/data/a.png".into())));
        assert_eq!(m.get(2, "2dReadPath"), Some(&Value::Null));
    }

    #[test]
    fn mixed_numeric_and_text_stays_text() {
        let m = Manifest::from_csv_reader("a\n1\nx\n".as_bytes()).unwrap();
        assert_eq!(m.get(0, "a"), Some(&Value::Str("1".into())));
    }

    #[test]
    fn new_rejects_ragged_rows() {
        let err = Manifest::new(
            vec!["a".into(), "b".into()],
            vec![vec![Value::Int(1)]],
        )
        .unwrap_err();
        assert!(err.to_string().contains("row 0 has 1 values"));
    }

    #[test]
    fn new_rejects_duplicate_columns() {
        let err = Manifest::new(vec!["a".into(), "a".into()], vec![]).unwrap_err();
        assert!(err.to_string().contains("duplicate column"));
    }

    #[test]
    fn drop_rows_uses_source_index() {
        let mut m = load();
        m.drop_rows(&BTreeSet::from([1]));
        assert_eq!(m.height(), 2);
        assert_eq!(m.row_indices(), vec![0, 2]);
        assert_eq!(m.get(1, "CellId"), Some(&Value::Int(3)));
    }

    #[test]
    fn csv_write_keeps_float_and_null_shapes() {
        let m = load();
        let text = String::from_utf8(m.to_csv_bytes().unwrap()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "CellId,Structure,Score,Passed,2dReadPath");
        assert_eq!(lines[2], "2,golgi,1.0,False,/data/b.png");
        assert_eq!(lines[3], "3,,2.25,True,");
    }

    #[test]
    fn set_and_set_column() {
        let mut m = load();
        m.set(0, "Structure", Value::from("er")).unwrap();
        assert_eq!(m.get(0, "Structure"), Some(&Value::Str("er".into())));

        m.set_column("CellId", vec![Value::Int(7), Value::Int(8), Value::Int(9)])
            .unwrap();
        assert_eq!(m.column("CellId").unwrap()[2], &Value::Int(9));

        assert!(m.set_column("CellId", vec![]).is_err());
        assert!(m.set(10, "CellId", Value::Null).is_err());
    }

    #[test]
    fn from_csv_path_rejects_directory_and_missing() {
        let dir = std::env::temp_dir();
        assert!(Manifest::from_csv_path(&dir).is_err());
        let err = Manifest::from_csv_path("/no/such/manifest.csv").unwrap_err();
        assert!(matches!(err, DatapackError::FileNotFound { .. }));
    }

    #[test]
    fn from_csv_path_reads_file() {
        let path = std::env::temp_dir().join(format!("dp-table-{}.csv", uuid::Uuid::now_v7()));
        std::fs::write(&path, CSV).unwrap();
        let m = Manifest::from_csv_path(&path).unwrap();
        assert_eq!(m.height(), 3);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn value_json_forms() {
        assert_eq!(Value::Int(3).to_json(), Some(serde_json::json!(3)));
        assert_eq!(Value::Null.to_json(), Some(serde_json::Value::Null));
        assert_eq!(Value::Float(f64::NAN).to_json(), Some(serde_json::Value::Null));
        assert!(Value::Path("/a".into()).to_json().is_none());
    }
}
