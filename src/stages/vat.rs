//! VAT-line decomposition: one invoice → dated line items grouped by VAT
//! type, with a gross/net balance check.
//!
//! The oracle is asked for a JSON **array** of voucher entries; an object
//! response violates the shape contract and counts as a parse failure for
//! this stage. VAT types not present in the supplied code table are
//! dropped. The balance invariant — gross payable equals the sum of
//! net × (1 + rate) — is re-checked here after extraction: on mismatch the
//! extraction is retried a bounded number of times, and a residual mismatch
//! is reported alongside the emitted lines. Blocking is not this stage's
//! job; reconciliation surfaces the discrepancy downstream.

use crate::config::PipelineConfig;
use crate::context::{round2, Exemplar, LookupContext, SupplierRecord};
use crate::error::{Stage, VoucherError};
use crate::model::{Invoice, VatLineRow};
use crate::oracle::{generate_with_retry, ExtractionOracle};
use crate::{parse, prompts};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

/// One parsed voucher entry before flattening into table rows.
#[derive(Debug, Clone, PartialEq)]
pub struct VoucherExtraction {
    pub date: String,
    pub general_description: String,
    pub payable_gross_amount: f64,
    /// (vat_type, net_amount) pairs, already filtered to known codes.
    pub lines: Vec<(String, f64)>,
}

/// Result of VAT extraction for one voucher.
///
/// `rows` and `error` are not mutually exclusive: a residual balance
/// mismatch still emits its rows alongside a
/// [`VoucherError::BalanceMismatch`] report.
#[derive(Debug)]
pub struct VatOutcome {
    pub rows: Vec<VatLineRow>,
    pub error: Option<VoucherError>,
}

/// Extract the VAT lines for one voucher.
///
/// A totally unusable oracle output (transport failure or no parsable
/// entries after all attempts) yields zero rows plus the matching error; a
/// residual balance mismatch yields the rows *and* the mismatch report.
pub async fn extract_vat_lines(
    oracle: &Arc<dyn ExtractionOracle>,
    invoice: &Invoice,
    supplier: &SupplierRecord,
    ctx: &LookupContext,
    exemplar: Option<&Exemplar>,
    config: &PipelineConfig,
) -> VatOutcome {
    let supplier_json = serde_json::to_string_pretty(supplier).unwrap_or_default();
    let prompt = prompts::vat_split(&supplier_json, &ctx.vat_codes, &invoice.text, exemplar, config);

    let mut best: Vec<VoucherExtraction> = Vec::new();
    let mut saw_response = false;
    let mut last_transport: Option<String> = None;

    // First extraction plus up to `balance_retries` re-extractions when the
    // balance check fails.
    for attempt in 0..=config.balance_retries {
        let response =
            match generate_with_retry(oracle, &prompt, config.vat_temperature, config).await {
                Ok(text) => {
                    saw_response = true;
                    text
                }
                Err(e) => {
                    warn!(voucher = %invoice.voucher, error = %e, "VAT oracle call failed");
                    last_transport = Some(e.to_string());
                    continue;
                }
            };

        let entries = parse_entries(&response, invoice, ctx);
        if entries.is_empty() {
            warn!(voucher = %invoice.voucher, attempt, "VAT response yielded no usable entries");
            continue;
        }

        let unbalanced: Vec<&VoucherExtraction> = entries
            .iter()
            .filter(|e| !is_balanced(e, ctx, config.balance_tolerance))
            .collect();

        if unbalanced.is_empty() {
            best = entries;
            break;
        }

        for entry in &unbalanced {
            warn!(
                voucher = %invoice.voucher,
                attempt,
                declared = entry.payable_gross_amount,
                derived = round2(derived_gross(&entry.lines, ctx)),
                "gross/net balance mismatch"
            );
        }
        // Keep the latest extraction; emitted as-is if no attempt balances.
        best = entries;
    }

    if best.is_empty() {
        warn!(voucher = %invoice.voucher, "no VAT lines extracted");
        let error = match last_transport {
            Some(detail) if !saw_response => VoucherError::OracleFailed {
                voucher: invoice.voucher.clone(),
                stage: Stage::Vat,
                retries: config.max_retries,
                detail,
            },
            _ => VoucherError::ParseFailed {
                voucher: invoice.voucher.clone(),
                stage: Stage::Vat,
                detail: "no usable VAT lines in oracle output".into(),
            },
        };
        return VatOutcome {
            rows: Vec::new(),
            error: Some(error),
        };
    }

    let error = best
        .iter()
        .find(|e| !is_balanced(e, ctx, config.balance_tolerance))
        .map(|entry| VoucherError::BalanceMismatch {
            voucher: invoice.voucher.clone(),
            declared: entry.payable_gross_amount,
            derived: round2(derived_gross(&entry.lines, ctx)),
            tolerance: config.balance_tolerance,
        });

    let rows = best
        .into_iter()
        .flat_map(|entry| {
            let VoucherExtraction {
                date,
                general_description,
                payable_gross_amount,
                lines,
            } = entry;
            let voucher = invoice.voucher.clone();
            lines.into_iter().map(move |(vat_type, net_amount)| VatLineRow {
                voucher: voucher.clone(),
                date: date.clone(),
                general_description: general_description.clone(),
                payable_gross_amount,
                vat_type,
                net_amount,
            })
        })
        .collect();

    VatOutcome { rows, error }
}

/// Parse an oracle response into voucher entries. Requires the array shape;
/// non-object elements and unknown VAT types are dropped with a warning.
fn parse_entries(response: &str, invoice: &Invoice, ctx: &LookupContext) -> Vec<VoucherExtraction> {
    let Some(items) = parse::extract_json(response).and_then(parse::expect_array) else {
        return Vec::new();
    };

    items
        .into_iter()
        .filter_map(|item| {
            let Value::Object(obj) = item else {
                return None;
            };
            let date = obj.get("date").map(parse::string_of).unwrap_or_default();
            // The oracle answers with the prompt's "general description"
            // spelling; tolerate the snake_case variant too.
            let general_description = obj
                .get("general description")
                .or_else(|| obj.get("general_description"))
                .map(parse::string_of)
                .unwrap_or_default();
            let payable_gross_amount = obj
                .get("payable_gross_amount")
                .and_then(parse::amount)
                .unwrap_or(0.0);

            let mut lines = Vec::new();
            if let Some(Value::Array(raw_lines)) = obj.get("vat_lines") {
                for raw in raw_lines {
                    let Value::Object(line) = raw else { continue };
                    let vat_type = line.get("vatType").map(parse::string_of).unwrap_or_default();
                    let Some(net) = line.get("net_amount").and_then(parse::amount) else {
                        continue;
                    };
                    if !ctx.knows_vat_code(&vat_type) {
                        warn!(voucher = %invoice.voucher, vat_type, "unknown VAT type dropped");
                        continue;
                    }
                    lines.push((vat_type, net));
                }
            }
            if lines.is_empty() {
                debug!(voucher = %invoice.voucher, "voucher entry without usable VAT lines dropped");
                return None;
            }

            Some(VoucherExtraction {
                date,
                general_description,
                payable_gross_amount,
                lines,
            })
        })
        .collect()
}

/// Gross amount re-derived from net lines: Σ net × (1 + rate).
pub fn derived_gross(lines: &[(String, f64)], ctx: &LookupContext) -> f64 {
    lines
        .iter()
        .map(|(vat_type, net)| net * (1.0 + ctx.vat_rate(vat_type).unwrap_or(0.0)))
        .sum()
}

/// The balance invariant for one voucher entry.
pub fn is_balanced(entry: &VoucherExtraction, ctx: &LookupContext, tolerance: f64) -> bool {
    (entry.payable_gross_amount - derived_gross(&entry.lines, ctx)).abs() <= tolerance
}
