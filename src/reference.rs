//! Vendor reference-export reader
//!
//! The instrument's desktop software can export its own computed backscatter
//! as CSV, one row per ping with a handful of leading metadata columns. This
//! reader loads such an export into a plain numeric matrix so conversions can
//! be validated against the vendor's numbers.

use std::path::{Path, PathBuf};

/// Metadata columns preceding the sample values in a vendor export row.
pub const DEFAULT_SKIP_COLS: usize = 6;

/// Errors raised while reading a vendor export
#[derive(Debug, thiserror::Error)]
pub enum ReferenceError {
    /// CSV read failure
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// A sample cell failed to parse as a number
    #[error("{file}: row {row}, column {column}: not a number: {value:?}")]
    BadValue {
        /// The export file
        file: PathBuf,
        /// One-based data row
        row: usize,
        /// Zero-based column
        column: usize,
        /// The offending cell text
        value: String,
    },

    /// Rows disagree on the sample count
    #[error("{file}: row {row} has {actual} samples, expected {expected}")]
    RaggedRow {
        /// The export file
        file: PathBuf,
        /// One-based data row
        row: usize,
        /// Sample count of the first row
        expected: usize,
        /// Sample count of the offending row
        actual: usize,
    },
}

/// Read a vendor power export into a ping-major matrix.
///
/// The first row is a header and is discarded; each remaining row drops its
/// first `skip_cols` metadata columns and parses the rest as `f64` samples.
/// Every data row must carry the same sample count.
pub fn read_power_export(
    path: impl AsRef<Path>,
    skip_cols: usize,
) -> Result<Vec<Vec<f64>>, ReferenceError> {
    let path = path.as_ref();
    // flexible: vendor exports occasionally vary the metadata column count,
    // which surfaces as a RaggedRow error below rather than a CSV error.
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)?;

    let mut rows: Vec<Vec<f64>> = Vec::new();
    for (i, record) in reader.records().enumerate() {
        let record = record?;
        let row = i + 1;
        let mut samples = Vec::with_capacity(record.len().saturating_sub(skip_cols));
        for (column, cell) in record.iter().enumerate().skip(skip_cols) {
            let value =
                cell.trim()
                    .parse::<f64>()
                    .map_err(|_| ReferenceError::BadValue {
                        file: path.to_path_buf(),
                        row,
                        column,
                        value: cell.to_string(),
                    })?;
            samples.push(value);
        }
        if let Some(first) = rows.first() {
            if samples.len() != first.len() {
                return Err(ReferenceError::RaggedRow {
                    file: path.to_path_buf(),
                    row,
                    expected: first.len(),
                    actual: samples.len(),
                });
            }
        }
        rows.push(samples);
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn export(content: &str) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f
    }

    #[test]
    fn skips_header_and_metadata_columns() {
        let f = export(
            "Ping,Date,Time,Tilt,Temp,Batt,S1,S2,S3\n\
             1,2017-08-21,17:00:00,2.1,8.3,12.1,-60.5,-61.0,-62.5\n\
             2,2017-08-21,17:00:01,2.2,8.3,12.1,-60.0,-61.5,-63.0\n",
        );
        let rows = read_power_export(f.path(), DEFAULT_SKIP_COLS).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], vec![-60.5, -61.0, -62.5]);
        assert_eq!(rows[1], vec![-60.0, -61.5, -63.0]);
    }

    #[test]
    fn non_numeric_sample_is_reported_with_position() {
        let f = export("h1,h2,s1\n1,x,oops\n");
        let err = read_power_export(f.path(), 2).unwrap_err();
        match err {
            ReferenceError::BadValue { row, column, value, .. } => {
                assert_eq!((row, column), (1, 2));
                assert_eq!(value, "oops");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn ragged_rows_are_rejected() {
        let f = export("h,s1,s2\n1,-60.0,-61.0\n2,-60.0\n");
        let err = read_power_export(f.path(), 1).unwrap_err();
        assert!(matches!(
            err,
            ReferenceError::RaggedRow { row: 2, expected: 2, actual: 1, .. }
        ));
    }

    #[test]
    fn empty_export_yields_no_rows() {
        let f = export("h1,h2\n");
        assert!(read_power_export(f.path(), 2).unwrap().is_empty());
    }
}
