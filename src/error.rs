//! Error types for the voucherflow library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`PipelineError`] — **Fatal**: the batch cannot proceed at all
//!   (invalid configuration, unusable oracle endpoint, unreadable stage
//!   table). Returned as `Err(PipelineError)` from the top-level entry
//!   points.
//!
//! * [`VoucherError`] — **Non-fatal**: a single voucher failed somewhere in
//!   the pipeline (unverified supplier, unparsable oracle output, missing
//!   upstream record) but every other voucher is fine. Collected in
//!   [`crate::run::PipelineOutput`] so callers can inspect partial success
//!   rather than losing the whole batch to one bad invoice.
//!
//! The separation lets callers decide their own tolerance: abort on the
//! first voucher failure, log and continue, or collect all errors for a
//! post-run report. The pipeline itself always continues.

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the voucherflow library.
///
/// Voucher-level failures use [`VoucherError`] and are stored in
/// [`crate::run::PipelineOutput`] rather than propagated here.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// No extraction oracle could be constructed (missing API key etc.).
    #[error("Extraction oracle is not configured.\n{hint}")]
    OracleNotConfigured { hint: String },

    /// A stage table could not be read from disk.
    #[error("Failed to read stage table '{path}': {source}")]
    TableReadFailed {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    /// A stage table could not be written to disk.
    #[error("Failed to write stage table '{path}': {source}")]
    TableWriteFailed {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    /// Could not create the output directory for stage tables.
    #[error("Failed to create output directory '{path}': {source}")]
    OutputDirFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// The pipeline stage a voucher-scoped failure occurred in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Supplier,
    Vat,
    Classify,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::Supplier => "supplier",
            Stage::Vat => "vat",
            Stage::Classify => "classify",
        };
        f.write_str(s)
    }
}

/// A non-fatal error scoped to a single voucher.
///
/// Stored in [`crate::run::PipelineOutput::errors`] when a voucher drops out
/// of the pipeline. The overall batch run continues regardless.
#[derive(Debug, Clone, Error, serde::Serialize, serde::Deserialize)]
pub enum VoucherError {
    /// OCR failed for the source document.
    #[error("Voucher {voucher}: OCR failed: {detail}")]
    OcrFailed { voucher: String, detail: String },

    /// An oracle call failed after all transport retries.
    #[error("Voucher {voucher}: {stage} oracle call failed after {retries} retries: {detail}")]
    OracleFailed {
        voucher: String,
        stage: Stage,
        retries: u32,
        detail: String,
    },

    /// The oracle responded but the response could not be coerced into the
    /// expected JSON shape.
    #[error("Voucher {voucher}: {stage} response unparsable: {detail}")]
    ParseFailed {
        voucher: String,
        stage: Stage,
        detail: String,
    },

    /// The correctness gate returned `uncertain`; the voucher is excluded
    /// from downstream stages.
    #[error("Voucher {voucher}: supplier prediction not verified")]
    Unverified { voucher: String },

    /// No single unambiguous supplier match was found.
    #[error("Voucher {voucher}: no unambiguous supplier match")]
    NoSupplierMatch { voucher: String },

    /// The VAT-line gross/net balance check failed even after re-extraction.
    ///
    /// The lines are still emitted; reconciliation surfaces the discrepancy.
    #[error(
        "Voucher {voucher}: gross {declared} does not balance derived {derived} (tolerance {tolerance})"
    )]
    BalanceMismatch {
        voucher: String,
        declared: f64,
        derived: f64,
        tolerance: f64,
    },

    /// A required upstream record (invoice text or prior-stage row) is absent.
    #[error("Voucher {voucher}: missing upstream input: {what}")]
    MissingUpstream { voucher: String, what: String },
}

impl VoucherError {
    /// The voucher this error is scoped to.
    pub fn voucher(&self) -> &str {
        match self {
            VoucherError::OcrFailed { voucher, .. }
            | VoucherError::OracleFailed { voucher, .. }
            | VoucherError::ParseFailed { voucher, .. }
            | VoucherError::Unverified { voucher }
            | VoucherError::NoSupplierMatch { voucher }
            | VoucherError::BalanceMismatch { voucher, .. }
            | VoucherError::MissingUpstream { voucher, .. } => voucher,
        }
    }
}
