//! Batch orchestration: drive every voucher through the staged pipeline.
//!
//! Processing is per-voucher embarrassingly parallel — each voucher
//! depends only on the read-only lookup context and its own upstream
//! records — so vouchers run through a bounded-concurrency stream. Results
//! are identical at any concurrency level.
//!
//! Failures are voucher-scoped and non-fatal: a voucher that stalls at a
//! gate (ambiguous supplier, `uncertain` verdict, unparsable ensemble) is
//! dropped from later stages but stays in the earlier tables, and the
//! batch always completes with per-stage survivor counts.

use crate::config::PipelineConfig;
use crate::context::LookupContext;
use crate::error::{PipelineError, Stage, VoucherError};
use crate::model::{
    ConsensusLine, Invoice, PostingRow, SupplierPrediction, VatLineRow, Verdict, VerdictStatus,
};
use crate::oracle::ExtractionOracle;
use crate::stages::reconcile::{reconcile, ReconciliationReport};
use crate::stages::{classify, normalize, supplier, vat, verify};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Per-stage survivor counts for one batch run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    /// Vouchers entering the pipeline.
    pub total_vouchers: usize,
    /// Vouchers with a non-empty supplier prediction.
    pub suppliers_resolved: usize,
    /// Vouchers passing the correctness gate.
    pub verified_correct: usize,
    /// Vouchers with at least one VAT line.
    pub vat_extracted: usize,
    /// Vouchers with at least one consensus line.
    pub classified: usize,
    /// Wall-clock duration of the whole batch.
    pub duration_ms: u64,
}

/// Everything a batch run produces: the stage tables, survivor stats and
/// the voucher-scoped error list.
#[derive(Debug, Default)]
pub struct PipelineOutput {
    pub predictions: Vec<SupplierPrediction>,
    pub verdicts: Vec<Verdict>,
    pub vat_lines: Vec<VatLineRow>,
    pub consensus: Vec<ConsensusLine>,
    /// Normalized predicted postings, ready for reconciliation.
    pub postings: Vec<PostingRow>,
    pub stats: PipelineStats,
    pub errors: Vec<VoucherError>,
}

impl PipelineOutput {
    /// Group this run's postings against actual postings for the period.
    pub fn reconcile_against(&self, actual: &[PostingRow]) -> ReconciliationReport {
        reconcile(&self.postings, actual)
    }
}

/// What one voucher contributed before assembly into the batch tables.
#[derive(Debug, Default)]
struct VoucherOutcome {
    prediction: Option<SupplierPrediction>,
    verdict: Option<Verdict>,
    vat_rows: Vec<VatLineRow>,
    consensus: Vec<ConsensusLine>,
    /// Voucher-scoped errors; a balance mismatch can accompany emitted
    /// rows, so this is a list rather than a single stopping reason.
    errors: Vec<VoucherError>,
}

/// Run the full staged pipeline over a batch of OCR'd invoices.
///
/// Always returns `Ok` with however many vouchers succeeded per stage;
/// `Err` is reserved for fatal problems, which the pipeline itself does
/// not produce once configured.
pub async fn run_pipeline(
    invoices: &[Invoice],
    ctx: &LookupContext,
    oracle: Arc<dyn ExtractionOracle>,
    config: &PipelineConfig,
) -> Result<PipelineOutput, PipelineError> {
    let start = Instant::now();
    info!(vouchers = invoices.len(), concurrency = config.concurrency, "starting pipeline run");

    let mut outcomes: Vec<(String, VoucherOutcome)> =
        stream::iter(invoices.iter().map(|invoice| {
            let oracle = Arc::clone(&oracle);
            async move {
                let outcome = process_voucher(invoice, ctx, &oracle, config).await;
                (invoice.voucher.clone(), outcome)
            }
        }))
        .buffer_unordered(config.concurrency)
        .collect()
        .await;

    // Deterministic table order regardless of completion order.
    outcomes.sort_by(|a, b| a.0.cmp(&b.0));

    let mut output = PipelineOutput {
        stats: PipelineStats {
            total_vouchers: invoices.len(),
            ..Default::default()
        },
        ..Default::default()
    };

    for (_, outcome) in outcomes {
        if let Some(prediction) = outcome.prediction {
            if !prediction.is_empty() {
                output.stats.suppliers_resolved += 1;
            }
            output.predictions.push(prediction);
        }
        if let Some(verdict) = outcome.verdict {
            if verdict.status == VerdictStatus::Correct {
                output.stats.verified_correct += 1;
            }
            output.verdicts.push(verdict);
        }
        if !outcome.vat_rows.is_empty() {
            output.stats.vat_extracted += 1;
        }
        output.vat_lines.extend(outcome.vat_rows);
        if !outcome.consensus.is_empty() {
            output.stats.classified += 1;
        }
        output.consensus.extend(outcome.consensus);
        output.errors.extend(outcome.errors);
    }

    let account_map = ctx.account_map();
    output.postings = normalize::normalize_postings(&output.consensus, &output.vat_lines, &account_map);

    output.stats.duration_ms = start.elapsed().as_millis() as u64;
    info!(
        total = output.stats.total_vouchers,
        resolved = output.stats.suppliers_resolved,
        verified = output.stats.verified_correct,
        vat = output.stats.vat_extracted,
        classified = output.stats.classified,
        duration_ms = output.stats.duration_ms,
        "pipeline run complete"
    );

    Ok(output)
}

/// Drive one voucher through the stages, stopping at the first gate it
/// fails. Each stopping point records a voucher-scoped error; nothing here
/// is fatal to the batch.
async fn process_voucher(
    invoice: &Invoice,
    ctx: &LookupContext,
    oracle: &Arc<dyn ExtractionOracle>,
    config: &PipelineConfig,
) -> VoucherOutcome {
    let mut outcome = VoucherOutcome::default();

    if invoice.text.trim().is_empty() {
        warn!(voucher = %invoice.voucher, "invoice text missing, voucher skipped");
        outcome.errors.push(VoucherError::MissingUpstream {
            voucher: invoice.voucher.clone(),
            what: "invoice text".into(),
        });
        return outcome;
    }

    // ── Stage 1: supplier resolution ─────────────────────────────────────
    let prediction = match supplier::resolve_supplier(oracle, invoice, ctx, config).await {
        Ok(prediction) => prediction,
        Err(e) => {
            outcome.prediction = Some(SupplierPrediction::empty(&invoice.voucher));
            outcome.errors.push(e);
            return outcome;
        }
    };
    let empty = prediction.is_empty();
    outcome.prediction = Some(prediction.clone());
    if empty {
        debug!(voucher = %invoice.voucher, "no unambiguous supplier, voucher stops here");
        outcome.errors.push(VoucherError::NoSupplierMatch {
            voucher: invoice.voucher.clone(),
        });
        return outcome;
    }

    // ── Stage 2: correctness gate ────────────────────────────────────────
    let verdict = verify::verify_supplier(oracle, invoice, &prediction, config).await;
    let rejected = verdict.status == VerdictStatus::Uncertain;
    outcome.verdict = Some(verdict);
    if rejected {
        debug!(voucher = %invoice.voucher, "prediction not verified, voucher stops here");
        outcome.errors.push(VoucherError::Unverified {
            voucher: invoice.voucher.clone(),
        });
        return outcome;
    }

    // The gate only passes predictions canonicalised from the master, so
    // the record lookup cannot miss; guard anyway.
    let Some(supplier_record) = ctx.supplier_by_number(&prediction.supplier_number) else {
        outcome.errors.push(VoucherError::MissingUpstream {
            voucher: invoice.voucher.clone(),
            what: format!("supplier master record {}", prediction.supplier_number),
        });
        return outcome;
    };
    let exemplar = ctx.exemplar_for(supplier_record.id);

    // ── Stage 3: VAT-line extraction ─────────────────────────────────────
    let vat = vat::extract_vat_lines(
        oracle,
        invoice,
        supplier_record,
        ctx,
        exemplar.as_ref(),
        config,
    )
    .await;
    // A residual balance mismatch reports alongside its rows; the voucher
    // still proceeds and reconciliation surfaces the discrepancy too.
    if let Some(error) = vat.error {
        outcome.errors.push(error);
    }
    if vat.rows.is_empty() {
        return outcome;
    }
    outcome.vat_rows = vat.rows;

    // ── Stage 4: ensemble classification ─────────────────────────────────
    let consensus = classify::classify_voucher(
        oracle,
        invoice,
        supplier_record,
        &outcome.vat_rows,
        ctx,
        exemplar.as_ref(),
        config,
    )
    .await;
    if consensus.is_empty() {
        outcome.errors.push(VoucherError::ParseFailed {
            voucher: invoice.voucher.clone(),
            stage: Stage::Classify,
            detail: "ensemble consensus invalidated".into(),
        });
        return outcome;
    }
    outcome.consensus = consensus;

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::OracleError;
    use async_trait::async_trait;

    /// Routes canned responses by recognising which stage's instructions
    /// the prompt carries. Stage-agnostic across concurrent vouchers.
    struct Routed {
        supplier: String,
        verdict: String,
        vat: String,
        classify: String,
    }

    #[async_trait]
    impl ExtractionOracle for Routed {
        async fn generate(&self, prompt: &str, _t: f32) -> Result<String, OracleError> {
            if prompt.contains("double-checking supplier data") {
                Ok(self.verdict.clone())
            } else if prompt.contains("group the attached invoice by VAT type") {
                Ok(self.vat.clone())
            } else if prompt.contains("pick the correct **account code**") {
                Ok(self.classify.clone())
            } else {
                Ok(self.supplier.clone())
            }
        }
    }

    fn ctx() -> LookupContext {
        use crate::context::*;
        LookupContext {
            suppliers: vec![SupplierRecord {
                id: 1,
                name: "Acme AS".into(),
                supplier_number: "20045".into(),
                organization_number: "912345678".into(),
            }],
            accounts: vec![Account {
                number: 4200,
                account_id: "A-42".into(),
                description: "Premises".into(),
            }],
            departments: vec![Department {
                code: "D1".into(),
                name: "Operations".into(),
            }],
            vat_codes: vec![VatCode {
                code: "1".into(),
                description: "High rate".into(),
                rate: "25%".into(),
            }],
            ..Default::default()
        }
    }

    fn oracle() -> Arc<dyn ExtractionOracle> {
        Arc::new(Routed {
            supplier: r#"{"supplier_name": "Acme AS", "supplier_number": "20045", "organization_number": "912345678"}"#.into(),
            verdict: r#"{"status": "correct"}"#.into(),
            vat: r#"[{"date": "2025-02-01", "general description": "Rent", "payable_gross_amount": "100.40", "vat_lines": [{"vatType": "1", "net_amount": "80.32"}]}]"#.into(),
            classify: r#"{"vat_lines": [{"vatType": "1", "net_amount": 80.32, "department": "D1", "account": 4200}]}"#.into(),
        })
    }

    fn config() -> PipelineConfig {
        PipelineConfig::builder().retry_backoff_ms(1).concurrency(2).build().unwrap()
    }

    #[tokio::test]
    async fn full_run_books_the_voucher() {
        let invoices = vec![Invoice::new("V1", "Faktura\nAcme AS\nOrg 912345678")];
        let out = run_pipeline(&invoices, &ctx(), oracle(), &config()).await.unwrap();

        assert_eq!(out.stats.total_vouchers, 1);
        assert_eq!(out.stats.suppliers_resolved, 1);
        assert_eq!(out.stats.verified_correct, 1);
        assert_eq!(out.stats.vat_extracted, 1);
        assert_eq!(out.stats.classified, 1);
        assert!(out.errors.is_empty());

        assert_eq!(out.postings.len(), 1);
        // Legacy 4200 was mapped to the canonical id.
        assert_eq!(out.postings[0].account.to_string(), "A-42");
        assert_eq!(out.postings[0].amount, 80.32);
        assert_eq!(out.postings[0].description, "Rent");
    }

    #[tokio::test]
    async fn uncertain_verdict_stops_the_voucher() {
        let routed = Routed {
            supplier: r#"{"supplier_name": "Acme AS", "supplier_number": "20045", "organization_number": "912345678"}"#.into(),
            verdict: r#"{"status": "uncertain"}"#.into(),
            vat: "unused".into(),
            classify: "unused".into(),
        };
        let invoices = vec![Invoice::new("V1", "text")];
        let out = run_pipeline(&invoices, &ctx(), Arc::new(routed), &config()).await.unwrap();

        assert_eq!(out.stats.suppliers_resolved, 1);
        assert_eq!(out.stats.verified_correct, 0);
        assert!(out.vat_lines.is_empty());
        assert!(matches!(out.errors[0], VoucherError::Unverified { .. }));
    }

    #[tokio::test]
    async fn empty_text_is_skipped_not_fatal() {
        let invoices = vec![
            Invoice::new("V0", "   "),
            Invoice::new("V1", "Faktura Acme AS"),
        ];
        let out = run_pipeline(&invoices, &ctx(), oracle(), &config()).await.unwrap();

        assert_eq!(out.stats.total_vouchers, 2);
        assert_eq!(out.stats.classified, 1);
        assert_eq!(out.errors.len(), 1);
        assert!(matches!(out.errors[0], VoucherError::MissingUpstream { .. }));
    }

    #[tokio::test]
    async fn residual_balance_mismatch_lands_in_errors_but_still_books() {
        // Gross 90.00 never balances net 80.32 at 25%, on any attempt.
        let routed = Routed {
            supplier: r#"{"supplier_name": "Acme AS", "supplier_number": "20045", "organization_number": "912345678"}"#.into(),
            verdict: r#"{"status": "correct"}"#.into(),
            vat: r#"[{"date": "2025-02-01", "general description": "Rent", "payable_gross_amount": "90.00", "vat_lines": [{"vatType": "1", "net_amount": "80.32"}]}]"#.into(),
            classify: r#"{"vat_lines": [{"vatType": "1", "net_amount": 80.32, "department": "D1", "account": 4200}]}"#.into(),
        };
        let invoices = vec![Invoice::new("V1", "Faktura Acme AS")];
        let out = run_pipeline(&invoices, &ctx(), Arc::new(routed), &config()).await.unwrap();

        // The voucher still flows all the way through...
        assert_eq!(out.stats.vat_extracted, 1);
        assert_eq!(out.stats.classified, 1);
        assert_eq!(out.postings.len(), 1);
        // ...but the mismatch is in the batch output, not just the log.
        assert_eq!(out.errors.len(), 1);
        match &out.errors[0] {
            VoucherError::BalanceMismatch {
                voucher, declared, derived, ..
            } => {
                assert_eq!(voucher, "V1");
                assert_eq!(*declared, 90.00);
                assert_eq!(*derived, 100.40);
            }
            other => panic!("expected BalanceMismatch, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn tables_sorted_by_voucher_regardless_of_concurrency() {
        let invoices = vec![
            Invoice::new("V3", "Faktura Acme AS"),
            Invoice::new("V1", "Faktura Acme AS"),
            Invoice::new("V2", "Faktura Acme AS"),
        ];
        let out = run_pipeline(&invoices, &ctx(), oracle(), &config()).await.unwrap();
        let order: Vec<&str> = out.predictions.iter().map(|p| p.invoice_number.as_str()).collect();
        assert_eq!(order, vec!["V1", "V2", "V3"]);
    }
}
