//! Loading observations from headerless, tab-separated files.
//!
//! Each row is one point and each column one dimension. The loader returns the
//! D×N layout the estimator works with, one point per column.

use ndarray::Array2;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DataError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to read tab-separated records: {0}")]
    Csv(#[from] csv::Error),
    #[error("The input file contains no observations.")]
    Empty,
    #[error("Row {row} has {found} columns, but the first row has {expected}.")]
    RaggedRow {
        row: usize,
        expected: usize,
        found: usize,
    },
    #[error(
        "Non-finite value ({value}) at row {row}, column {column}. All observations must be finite."
    )]
    NonFinite { row: usize, column: usize, value: f64 },
    #[error("Could not parse '{field}' at row {row}, column {column} as a number.")]
    Parse {
        row: usize,
        column: usize,
        field: String,
    },
}

/// Reads a tab-separated file of points into a D×N matrix.
pub fn load_observations<P: AsRef<Path>>(path: P) -> Result<Array2<f64>, DataError> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .trim(csv::Trim::All)
        .flexible(true)
        .comment(Some(b'#'))
        .from_path(path)?;

    let mut rows: Vec<Vec<f64>> = Vec::new();
    let mut num_columns = None;

    for (row, record) in reader.records().enumerate() {
        let record = record?;
        let expected = *num_columns.get_or_insert(record.len());
        if record.len() != expected {
            return Err(DataError::RaggedRow {
                row,
                expected,
                found: record.len(),
            });
        }

        let mut point = Vec::with_capacity(expected);
        for (column, field) in record.iter().enumerate() {
            let value: f64 = field.parse().map_err(|_| DataError::Parse {
                row,
                column,
                field: field.to_string(),
            })?;
            if !value.is_finite() {
                return Err(DataError::NonFinite { row, column, value });
            }
            point.push(value);
        }
        rows.push(point);
    }

    let num_columns = match num_columns {
        Some(columns) if columns > 0 => columns,
        _ => return Err(DataError::Empty),
    };

    let num_rows = rows.len();
    log::debug!("Loaded {num_rows} points in {num_columns} dimensions");

    // Rows are points on disk; the estimator wants points as columns.
    Ok(Array2::from_shape_fn((num_columns, num_rows), |(i, a)| {
        rows[a][i]
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use std::io::{self, Write};
    use tempfile::NamedTempFile;

    fn create_test_tsv(content: &str) -> io::Result<NamedTempFile> {
        let mut file = NamedTempFile::new()?;
        write!(file, "{content}")?;
        file.flush()?;
        Ok(file)
    }

    #[test]
    fn loads_points_as_columns() {
        let file = create_test_tsv("1.0\t2.0\n3.0\t4.0\n5.0\t6.0\n").unwrap();
        let data = load_observations(file.path()).unwrap();
        assert_eq!(data, array![[1.0, 3.0, 5.0], [2.0, 4.0, 6.0]]);
        assert!(data.is_standard_layout());
    }

    #[test]
    fn skips_comment_lines() {
        let file = create_test_tsv("# two points\n1.0\t2.0\n3.0\t4.0\n").unwrap();
        let data = load_observations(file.path()).unwrap();
        assert_eq!(data.dim(), (2, 2));
    }

    #[test]
    fn rejects_ragged_rows() {
        let file = create_test_tsv("1.0\t2.0\n3.0\n").unwrap();
        match load_observations(file.path()) {
            Err(DataError::RaggedRow {
                row,
                expected,
                found,
            }) => assert_eq!((row, expected, found), (1, 2, 1)),
            other => panic!("Expected RaggedRow, got {other:?}"),
        }
    }

    #[test]
    fn rejects_non_finite_values() {
        let file = create_test_tsv("1.0\tNaN\n").unwrap();
        match load_observations(file.path()) {
            Err(DataError::NonFinite { row, column, value }) => {
                assert_eq!((row, column), (0, 1));
                assert!(value.is_nan());
            }
            other => panic!("Expected NonFinite, got {other:?}"),
        }
    }

    #[test]
    fn rejects_text_fields() {
        let file = create_test_tsv("1.0\tabc\n").unwrap();
        match load_observations(file.path()) {
            Err(DataError::Parse { field, .. }) => assert_eq!(field, "abc"),
            other => panic!("Expected Parse, got {other:?}"),
        }
    }

    #[test]
    fn rejects_empty_files() {
        let file = create_test_tsv("").unwrap();
        assert!(matches!(load_observations(file.path()), Err(DataError::Empty)));
    }

    #[test]
    fn missing_file_is_io_or_csv_error() {
        let result = load_observations("/definitely/not/here.tsv");
        assert!(matches!(result, Err(DataError::Csv(_)) | Err(DataError::Io(_))));
    }
}
