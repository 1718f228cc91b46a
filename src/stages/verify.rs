//! The correctness gate: an independent re-examination of the supplier
//! prediction against the invoice's header and footer.
//!
//! This stage is a checker, not a re-predictor: it never proposes a
//! different supplier, it only emits a binary trust verdict. The priority
//! rule it encodes is that header/footer evidence outranks body evidence —
//! a sender named only in the body, multiple company names anywhere, or any
//! doubt at all yields `uncertain`. Only `correct` vouchers pass the gate.

use crate::config::PipelineConfig;
use crate::model::{Invoice, SupplierPrediction, Verdict, VerdictStatus};
use crate::oracle::{generate_with_retry, ExtractionOracle};
use crate::{parse, prompts};
use std::sync::Arc;
use tracing::{debug, warn};

/// Split invoice text into (header, body, footer).
///
/// Header is the first `header_lines` lines. For texts no longer than the
/// header window the whole text is the header and footer/body are empty;
/// the body only exists once the text exceeds both windows combined.
pub fn split_sections(
    text: &str,
    header_lines: usize,
    footer_lines: usize,
) -> (String, String, String) {
    let lines: Vec<&str> = text.trim().lines().collect();

    let header = if lines.len() > header_lines {
        lines[..header_lines].join("\n")
    } else {
        lines.join("\n")
    };
    let footer = if lines.len() > header_lines {
        lines[lines.len().saturating_sub(footer_lines)..].join("\n")
    } else {
        String::new()
    };
    let body = if lines.len() > header_lines + footer_lines {
        lines[header_lines..lines.len() - footer_lines].join("\n")
    } else {
        String::new()
    };

    (header, body, footer)
}

/// Gate one voucher's supplier prediction.
///
/// An all-empty prediction is `uncertain` without an oracle call: there is
/// nothing to verify. Parse failures and unknown statuses also normalise
/// to `uncertain` — doubt never passes the gate.
pub async fn verify_supplier(
    oracle: &Arc<dyn ExtractionOracle>,
    invoice: &Invoice,
    prediction: &SupplierPrediction,
    config: &PipelineConfig,
) -> Verdict {
    if prediction.is_empty() {
        debug!(voucher = %invoice.voucher, "empty prediction, gate skipped");
        return Verdict {
            invoice_number: invoice.voucher.clone(),
            status: VerdictStatus::Uncertain,
        };
    }

    let (header, body, footer) =
        split_sections(&invoice.text, config.header_lines, config.footer_lines);
    let prediction_json = serde_json::json!({
        "supplier_name": prediction.supplier_name,
        "supplier_number": prediction.supplier_number,
        "organization_number": prediction.organization_number,
    });
    let prompt = prompts::verify_supplier(
        &header,
        &body,
        &footer,
        &serde_json::to_string_pretty(&prediction_json).unwrap_or_default(),
    );

    let status = match generate_with_retry(oracle, &prompt, config.verify_temperature, config).await
    {
        Ok(response) => match parse::extract_json(&response) {
            Some(value) => {
                let status_field = value
                    .get("status")
                    .map(parse::string_of)
                    .unwrap_or_default();
                VerdictStatus::from_oracle(&status_field)
            }
            None => {
                warn!(voucher = %invoice.voucher, "verdict response unparsable, treating as uncertain");
                VerdictStatus::Uncertain
            }
        },
        Err(e) => {
            warn!(voucher = %invoice.voucher, error = %e, "gate oracle call failed, treating as uncertain");
            VerdictStatus::Uncertain
        }
    };

    Verdict {
        invoice_number: invoice.voucher.clone(),
        status,
    }
}
