//! CSV persistence for stage tables.
//!
//! Every stage boundary is a flat table, so a batch run can be checkpointed
//! and inspected with ordinary spreadsheet tooling. Writers always emit a
//! header row; readers deserialize by header name, so column order in a
//! hand-edited file does not matter.

use crate::error::{PipelineError, VoucherError};
use crate::run::PipelineOutput;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::Path;
use tracing::{info, warn};

/// Write one stage table as CSV with a header row.
pub fn write_table<T: Serialize>(path: impl AsRef<Path>, rows: &[T]) -> Result<(), PipelineError> {
    let path = path.as_ref();
    let mut writer = csv::Writer::from_path(path).map_err(|source| {
        PipelineError::TableWriteFailed {
            path: path.to_path_buf(),
            source,
        }
    })?;
    for row in rows {
        writer
            .serialize(row)
            .map_err(|source| PipelineError::TableWriteFailed {
                path: path.to_path_buf(),
                source,
            })?;
    }
    writer
        .flush()
        .map_err(|e| PipelineError::TableWriteFailed {
            path: path.to_path_buf(),
            source: csv::Error::from(e),
        })?;
    Ok(())
}

/// Read one stage table, deserializing by header name.
pub fn read_table<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<Vec<T>, PipelineError> {
    let path = path.as_ref();
    let mut reader =
        csv::Reader::from_path(path).map_err(|source| PipelineError::TableReadFailed {
            path: path.to_path_buf(),
            source,
        })?;
    reader
        .deserialize()
        .collect::<Result<Vec<T>, _>>()
        .map_err(|source| PipelineError::TableReadFailed {
            path: path.to_path_buf(),
            source,
        })
}

/// Read a stage table that is allowed to be absent.
///
/// A missing file logs a warning and yields an empty table; any other
/// failure is still an error.
pub fn read_table_opt<T: DeserializeOwned>(
    path: impl AsRef<Path>,
) -> Result<Vec<T>, PipelineError> {
    let path = path.as_ref();
    if !path.exists() {
        warn!(path = %path.display(), "stage table missing, treating as empty");
        return Ok(Vec::new());
    }
    read_table(path)
}

/// Flat projection of a [`VoucherError`] for the errors table. CSV cannot
/// carry the enum's structure, so the row keeps the voucher id and the
/// rendered message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, serde::Deserialize)]
pub struct ErrorRow {
    pub voucher: String,
    pub error: String,
}

impl From<&VoucherError> for ErrorRow {
    fn from(e: &VoucherError) -> Self {
        Self {
            voucher: e.voucher().to_string(),
            error: e.to_string(),
        }
    }
}

/// Persist every table of a batch run into `dir`, creating it if needed.
///
/// File names are stable so consecutive runs overwrite their predecessors:
/// `predictions.csv`, `verdicts.csv`, `vat_lines.csv`, `consensus.csv`,
/// `postings.csv`, `errors.csv`.
pub fn write_run(dir: impl AsRef<Path>, output: &PipelineOutput) -> Result<(), PipelineError> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir).map_err(|source| PipelineError::OutputDirFailed {
        path: dir.to_path_buf(),
        source,
    })?;

    write_table(dir.join("predictions.csv"), &output.predictions)?;
    write_table(dir.join("verdicts.csv"), &output.verdicts)?;
    write_table(dir.join("vat_lines.csv"), &output.vat_lines)?;
    write_table(dir.join("consensus.csv"), &output.consensus)?;
    write_table(dir.join("postings.csv"), &output.postings)?;
    let error_rows: Vec<ErrorRow> = output.errors.iter().map(ErrorRow::from).collect();
    write_table(dir.join("errors.csv"), &error_rows)?;

    info!(dir = %dir.display(), postings = output.postings.len(), "stage tables written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AccountValue, PostingRow, VatLineRow};

    fn posting(voucher: &str, account: AccountValue, amount: f64) -> PostingRow {
        PostingRow {
            voucher: voucher.into(),
            account,
            department: "D1".into(),
            vat_type: "1".into(),
            amount,
            description: "Rent".into(),
        }
    }

    #[test]
    fn postings_survive_a_write_read_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("postings.csv");
        let rows = vec![
            posting("V1", AccountValue::Text("A-41".into()), 80.32),
            posting("V2", AccountValue::Number(4300), -50.0),
        ];

        write_table(&path, &rows).unwrap();
        let back: Vec<PostingRow> = read_table(&path).unwrap();

        assert_eq!(back.len(), 2);
        // CSV has no types; digit-only account values come back numeric.
        assert_eq!(back[0].account, AccountValue::Text("A-41".into()));
        assert_eq!(back[1].account, AccountValue::Number(4300));
        assert_eq!(back[1].amount, -50.0);
    }

    #[test]
    fn vat_lines_keep_the_renamed_vat_type_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vat_lines.csv");
        let rows = vec![VatLineRow {
            voucher: "V1".into(),
            date: "2025-02-01".into(),
            general_description: "Rent".into(),
            payable_gross_amount: 100.40,
            vat_type: "1".into(),
            net_amount: 80.32,
        }];

        write_table(&path, &rows).unwrap();
        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.lines().next().unwrap().contains("vatType"));

        let back: Vec<VatLineRow> = read_table(&path).unwrap();
        assert_eq!(back, rows);
    }

    #[test]
    fn missing_optional_table_is_empty_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let rows: Vec<PostingRow> = read_table_opt(dir.path().join("absent.csv")).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn missing_required_table_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_table::<PostingRow>(dir.path().join("absent.csv")).unwrap_err();
        assert!(matches!(err, PipelineError::TableReadFailed { .. }));
    }
}
