//! Supplier resolution: invoice text → at most one supplier-master record.
//!
//! The matching *decision* is delegated to the oracle, but the contract is
//! enforced in code regardless of what comes back: a non-empty prediction
//! must correspond to exactly one supplier-master record, matched on
//! supplier number, name, or organization number. Anything ambiguous — no
//! match, several candidate records, duplicate organization numbers in the
//! master itself — collapses to the all-empty prediction. All-empty is a
//! valid result, never an error.

use crate::config::{PipelineConfig, SupplierStrategy};
use crate::context::{LookupContext, SupplierRecord};
use crate::error::{Stage, VoucherError};
use crate::model::{Invoice, SupplierPrediction};
use crate::oracle::{generate_with_retry, ExtractionOracle};
use crate::{parse, prompts};
use std::sync::Arc;
use tracing::{debug, warn};

/// Resolve the supplier for one invoice.
///
/// Parse failures and unverifiable claims yield the all-empty row (a valid
/// "no match" answer; the voucher then stops at the gate). A transport
/// failure that exhausts all retries is a distinct outcome and is returned
/// as [`VoucherError::OracleFailed`].
pub async fn resolve_supplier(
    oracle: &Arc<dyn ExtractionOracle>,
    invoice: &Invoice,
    ctx: &LookupContext,
    config: &PipelineConfig,
) -> Result<SupplierPrediction, VoucherError> {
    let list = prompts::supplier_list(&ctx.suppliers);
    let prompt = match config.supplier_strategy {
        SupplierStrategy::Direct => {
            prompts::supplier_direct(&list, &config.own_company_names, &invoice.text)
        }
        SupplierStrategy::ChainOfThought => {
            prompts::supplier_chain_of_thought(&list, &config.own_company_names, &invoice.text)
        }
    };

    let response =
        match generate_with_retry(oracle, &prompt, config.supplier_temperature, config).await {
            Ok(text) => text,
            Err(e) => {
                warn!(voucher = %invoice.voucher, error = %e, "supplier oracle call failed");
                return Err(VoucherError::OracleFailed {
                    voucher: invoice.voucher.clone(),
                    stage: Stage::Supplier,
                    retries: config.max_retries,
                    detail: e.to_string(),
                });
            }
        };

    let Some(obj) = parse::extract_json(&response).map(parse::object_rows).and_then(|mut rows| {
        if rows.len() == 1 {
            Some(rows.remove(0))
        } else {
            None
        }
    }) else {
        warn!(voucher = %invoice.voucher, "supplier response unparsable");
        return Ok(SupplierPrediction::empty(&invoice.voucher));
    };

    // Reasoning (chain-of-thought strategy) is diagnostic only.
    if let Some(reasoning) = obj.get("reasoning") {
        debug!(voucher = %invoice.voucher, reasoning = %parse::string_of(reasoning), "supplier reasoning");
    }

    let claimed = SupplierPrediction {
        invoice_number: invoice.voucher.clone(),
        supplier_name: parse::string_of(obj.get("supplier_name").unwrap_or(&serde_json::Value::Null)),
        supplier_number: parse::string_of(
            obj.get("supplier_number").unwrap_or(&serde_json::Value::Null),
        ),
        organization_number: parse::string_of(
            obj.get("organization_number").unwrap_or(&serde_json::Value::Null),
        ),
    };

    Ok(enforce_unique_match(claimed, ctx))
}

/// Enforce the uniqueness contract on an oracle-claimed prediction.
///
/// The claim is only accepted when exactly one supplier-master record
/// matches it; the accepted prediction is rewritten from that record so
/// downstream stages always see canonical master values.
pub fn enforce_unique_match(
    claimed: SupplierPrediction,
    ctx: &LookupContext,
) -> SupplierPrediction {
    if claimed.is_empty() {
        return claimed;
    }

    let matches: Vec<&SupplierRecord> = ctx
        .suppliers
        .iter()
        .filter(|s| record_matches(s, &claimed))
        .collect();

    match matches.as_slice() {
        [record] => SupplierPrediction {
            invoice_number: claimed.invoice_number,
            supplier_name: record.name.clone(),
            supplier_number: record.supplier_number.clone(),
            organization_number: record.organization_number.clone(),
        },
        [] => {
            debug!(voucher = %claimed.invoice_number, "claimed supplier not in master, dropping");
            SupplierPrediction::empty(claimed.invoice_number)
        }
        several => {
            debug!(
                voucher = %claimed.invoice_number,
                candidates = several.len(),
                "ambiguous supplier claim, dropping"
            );
            SupplierPrediction::empty(claimed.invoice_number)
        }
    }
}

fn record_matches(record: &SupplierRecord, claimed: &SupplierPrediction) -> bool {
    if !claimed.supplier_number.is_empty()
        && record.supplier_number == claimed.supplier_number.trim()
    {
        return true;
    }
    if !claimed.supplier_name.is_empty()
        && record.name.eq_ignore_ascii_case(claimed.supplier_name.trim())
    {
        return true;
    }
    if !claimed.organization_number.is_empty()
        && normalize_orgnr(&record.organization_number) == normalize_orgnr(&claimed.organization_number)
    {
        return true;
    }
    false
}

/// Organization numbers compare with spaces stripped ("912 345 678" is the
/// same number as "912345678").
fn normalize_orgnr(orgnr: &str) -> String {
    orgnr.chars().filter(|c| !c.is_whitespace()).collect()
}
