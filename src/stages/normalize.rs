//! Account normalization: legacy 4-digit numeric codes → canonical ids.
//!
//! A pure, total function: numeric accounts in [1000, 9999] are looked up
//! in the static mapping and replaced when found; everything else — out of
//! range numbers, text values (even digit strings), unmapped codes —
//! passes through unchanged. It never fails.

use crate::model::{AccountValue, ConsensusLine, PostingRow, VatLineRow};
use std::collections::HashMap;

/// Legacy account code range eligible for rewriting.
const LEGACY_RANGE: std::ops::RangeInclusive<i64> = 1000..=9999;

/// Rewrite one account value through the mapping.
pub fn normalize_account(value: AccountValue, map: &HashMap<i64, String>) -> AccountValue {
    match value {
        AccountValue::Number(n) if LEGACY_RANGE.contains(&n) => match map.get(&n) {
            Some(id) => AccountValue::Text(id.clone()),
            None => AccountValue::Number(n),
        },
        other => other,
    }
}

/// Build posting rows from consensus lines and rewrite their accounts.
///
/// The description is joined in from the voucher's VAT-line table (first
/// row per voucher), since consensus lines carry no description of their
/// own.
pub fn normalize_postings(
    consensus: &[ConsensusLine],
    vat_lines: &[VatLineRow],
    map: &HashMap<i64, String>,
) -> Vec<PostingRow> {
    consensus
        .iter()
        .map(|line| {
            let description = vat_lines
                .iter()
                .find(|v| v.voucher == line.voucher)
                .map(|v| v.general_description.clone())
                .unwrap_or_default();
            PostingRow {
                voucher: line.voucher.clone(),
                account: normalize_account(line.account.clone(), map),
                department: line.department.clone(),
                vat_type: line.vat_type.clone(),
                amount: line.net_amount,
                description,
            }
        })
        .collect()
}
