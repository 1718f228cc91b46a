//! # voucherflow
//!
//! Staged extraction of accounting postings from OCR'd supplier invoices,
//! driven by a generative extraction oracle and reduced to bookable rows by
//! unanimity consensus.
//!
//! ## Pipeline
//!
//! ```text
//! invoice text
//!     │
//!     ▼
//! supplier resolution ──► correctness gate ──► VAT-line decomposition
//!                                                      │
//!                                                      ▼
//!                         ensemble classification (N runs, unanimity)
//!                                                      │
//!                                                      ▼
//!                          account normalization ──► reconciliation
//! ```
//!
//! Each stage boundary is a flat table (CSV on disk via [`store`]), so a
//! run can be checkpointed, inspected and resumed per stage. Failures are
//! voucher-scoped: one bad invoice never takes down the batch.
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use voucherflow::{
//!     GeminiOracle, Invoice, LookupContext, PipelineConfig, run_pipeline,
//! };
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let config = PipelineConfig::builder()
//!     .own_company("Nordlys Eiendom AS")
//!     .build()?;
//! let ctx = LookupContext::from_csv_dir("context/")?;
//! let oracle = Arc::new(GeminiOracle::from_env(&config)?);
//!
//! let invoices = vec![Invoice::new("F-1042", "Faktura ...")];
//! let output = run_pipeline(&invoices, &ctx, oracle, &config).await?;
//!
//! println!(
//!     "{} of {} vouchers booked",
//!     output.stats.classified, output.stats.total_vouchers
//! );
//! # Ok(())
//! # }
//! ```
//!
//! ## Design notes
//!
//! * **Unanimity, not majority.** The classification ensemble only keeps an
//!   account or department when every run agrees; any disagreement leaves
//!   the field empty for human review. See [`stages::classify`].
//! * **Gates fail closed.** An ambiguous supplier match or an `uncertain`
//!   verdict stops the voucher; it is never guessed past a gate.
//! * **The oracle is a trait.** [`ExtractionOracle`] is the only seam to
//!   the model provider; [`GeminiOracle`] is the production implementation
//!   and tests substitute scripted oracles.

pub mod config;
pub mod context;
pub mod error;
pub mod model;
pub mod ocr;
pub mod oracle;
pub mod parse;
pub mod prompts;
pub mod run;
pub mod stages;
pub mod store;

pub use config::{PipelineConfig, PipelineConfigBuilder, SupplierStrategy};
pub use context::{LookupContext, SupplierRecord};
pub use error::{PipelineError, Stage, VoucherError};
pub use model::{
    AccountValue, ConsensusLine, Invoice, PostingGroup, PostingRow, SupplierPrediction,
    VatLineRow, Verdict, VerdictStatus,
};
pub use ocr::{extract_dir, HttpOcrService, OcrBatch, OcrService};
pub use oracle::{ExtractionOracle, GeminiOracle, OracleError};
pub use run::{run_pipeline, PipelineOutput, PipelineStats};
pub use stages::reconcile::{reconcile, DiffStatus, ReconDiff, ReconciliationReport};
