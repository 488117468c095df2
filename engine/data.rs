//! # Marker Table Loading and Validation
//!
//! Exclusive entry point for user-provided marker data. Reads the
//! semicolon-delimited CSV dialect used by Y-STR databases, expands
//! multi-valued palindromic markers into positional columns, coerces
//! non-numeric cells, and yields the numeric matrix plus the feature schema
//! the rest of the engine is keyed by.
//!
//! - Multi-copy markers (DYS385, DYS464, ...) arrive as a single delimited
//!   cell (`"11-14"`) and are split into `DYS385_1`, `DYS385_2`, ... columns,
//!   values sorted ascending, absent copies filled with `0`.
//! - Any cell that fails numeric parsing becomes `0`; the missing sentinel
//!   (`-1`) is only introduced by callers that know a marker was skipped.
//! - Failures are assumed to be user-input errors and reported accordingly.

use crate::types::FeatureSchema;
use ndarray::Array2;
use std::path::Path;
use thiserror::Error;

/// Multi-copy markers and the number of positional columns each expands to.
const MULTI_VALUE_MARKERS: &[(&str, usize)] = &[
    ("DYS385", 2),
    ("DYS464", 4),
    ("DYF395S1", 2),
    ("CDY", 2),
    ("YCAII", 2),
    ("DYS413", 2),
    ("DYS459", 2),
];

/// A validated marker table ready for training.
#[derive(Debug)]
pub struct MarkerTable {
    /// Numeric marker matrix, shape `[n_samples, n_features]`.
    pub x: Array2<f64>,
    /// Haplogroup label per row (empty when loaded without a label column).
    pub labels: Vec<String>,
    /// Ordered feature names matching the matrix columns.
    pub schema: FeatureSchema,
}

#[derive(Error, Debug)]
pub enum DataError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV parsing error: {0}")]
    Csv(#[from] csv::Error),
    #[error("The required label column '{0}' was not found in the input file.")]
    LabelColumnNotFound(String),
    #[error("The input file contains a header but no data rows.")]
    EmptyTable,
    #[error("Row {row} has {found} fields, expected {expected}.")]
    RaggedRow {
        row: usize,
        expected: usize,
        found: usize,
    },
}

/// Splits a multi-copy marker cell on the separators seen in the wild
/// (`-`, `,`, `/`, whitespace) and returns the numeric copies sorted
/// ascending. Unparseable fragments are skipped.
pub fn parse_multi_values(cell: &str) -> Vec<f64> {
    let mut values: Vec<f64> = cell
        .split(|c: char| c == '-' || c == ',' || c == '/' || c.is_whitespace())
        .filter(|t| !t.is_empty())
        .filter_map(|t| t.trim().parse::<i64>().ok())
        .map(|v| v as f64)
        .collect();
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    values
}

fn parse_plain(cell: &str) -> f64 {
    cell.trim().parse::<f64>().unwrap_or(0.0)
}

fn multi_value_width(name: &str) -> Option<usize> {
    MULTI_VALUE_MARKERS
        .iter()
        .find(|(m, _)| *m == name)
        .map(|(_, n)| *n)
}

/// Loads a training table: every column except the label column becomes one
/// or more numeric features.
pub fn load_marker_table(path: &Path, label_column: &str) -> Result<MarkerTable, DataError> {
    let table = read_table(path, Some(label_column))?;
    log::info!(
        "Loaded {} samples with {} markers from {}",
        table.x.nrows(),
        table.schema.len(),
        path.display()
    );
    Ok(table)
}

/// Loads a query table (no label column required); rows are marker vectors
/// declared by the file's own header schema.
pub fn load_query_table(path: &Path) -> Result<MarkerTable, DataError> {
    read_table(path, None)
}

fn read_table(path: &Path, label_column: Option<&str>) -> Result<MarkerTable, DataError> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b';')
        .flexible(true)
        .from_path(path)?;

    let headers: Vec<String> = reader.headers()?.iter().map(|h| h.to_string()).collect();
    let label_idx = match label_column {
        Some(name) => Some(
            headers
                .iter()
                .position(|h| h == name)
                .ok_or_else(|| DataError::LabelColumnNotFound(name.to_string()))?,
        ),
        None => None,
    };

    // The output schema: plain markers map to one column, multi-copy markers
    // expand in place to their positional columns.
    let mut feature_names = Vec::new();
    for (idx, header) in headers.iter().enumerate() {
        if Some(idx) == label_idx {
            continue;
        }
        match multi_value_width(header) {
            Some(n) => {
                for copy in 1..=n {
                    feature_names.push(format!("{header}_{copy}"));
                }
            }
            None => feature_names.push(header.clone()),
        }
    }

    let n_features = feature_names.len();
    let mut values: Vec<f64> = Vec::new();
    let mut labels: Vec<String> = Vec::new();

    for (row_idx, record) in reader.records().enumerate() {
        let record = record?;
        if record.len() != headers.len() {
            return Err(DataError::RaggedRow {
                row: row_idx + 1,
                expected: headers.len(),
                found: record.len(),
            });
        }
        for (col_idx, cell) in record.iter().enumerate() {
            if Some(col_idx) == label_idx {
                labels.push(cell.trim().to_string());
                continue;
            }
            match multi_value_width(&headers[col_idx]) {
                Some(n) => {
                    let copies = parse_multi_values(cell);
                    for i in 0..n {
                        values.push(copies.get(i).copied().unwrap_or(0.0));
                    }
                }
                None => values.push(parse_plain(cell)),
            }
        }
    }

    let n_samples = if n_features == 0 {
        0
    } else {
        values.len() / n_features
    };
    if n_samples == 0 {
        return Err(DataError::EmptyTable);
    }

    let x = Array2::from_shape_vec((n_samples, n_features), values)
        .map_err(|_| DataError::EmptyTable)?;

    Ok(MarkerTable {
        x,
        labels,
        schema: FeatureSchema::new(feature_names),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn multi_values_split_and_sort() {
        assert_eq!(parse_multi_values("14-11"), vec![11.0, 14.0]);
        assert_eq!(parse_multi_values("15,15"), vec![15.0, 15.0]);
        assert_eq!(parse_multi_values("12/13 14"), vec![12.0, 13.0, 14.0]);
        assert_eq!(parse_multi_values("??"), Vec::<f64>::new());
    }

    #[test]
    fn loads_table_with_multi_copy_expansion() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.csv");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "Haplogroup;DYS393;DYS385").unwrap();
        writeln!(f, "R1b;13;11-14").unwrap();
        writeln!(f, "I1;14;13-13").unwrap();
        drop(f);

        let table = load_marker_table(&path, "Haplogroup").unwrap();
        assert_eq!(
            table.schema.names,
            vec!["DYS393", "DYS385_1", "DYS385_2"]
        );
        assert_eq!(table.labels, vec!["R1b", "I1"]);
        assert_eq!(table.x[[0, 0]], 13.0);
        assert_eq!(table.x[[0, 1]], 11.0);
        assert_eq!(table.x[[0, 2]], 14.0);
    }

    #[test]
    fn missing_label_column_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.csv");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "DYS393;DYS390").unwrap();
        writeln!(f, "13;24").unwrap();
        drop(f);

        let err = load_marker_table(&path, "Haplogroup").unwrap_err();
        assert!(matches!(err, DataError::LabelColumnNotFound(_)));
    }

    #[test]
    fn unparseable_cells_become_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("q.csv");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "DYS393;DYS390").unwrap();
        writeln!(f, "13;n/a").unwrap();
        drop(f);

        let table = load_query_table(&path).unwrap();
        assert_eq!(table.x[[0, 1]], 0.0);
        assert!(table.labels.is_empty());
    }
}
