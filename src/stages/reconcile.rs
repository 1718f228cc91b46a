//! Reconciliation: aggregate predicted and actual postings into aligned,
//! diffable projections.
//!
//! Both tables are grouped independently by (voucher, account, department,
//! VAT type); amounts are summed and the first-seen description per group
//! is retained. Grouping uses a `BTreeMap` so output order is
//! deterministic. The engine itself does not decide what counts as a
//! mismatch — it produces the comparable projections, and [`diff`] is the
//! reference diff policy exercised by tests and the CLI.

use crate::model::{GroupKey, PostingGroup, PostingRow};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Group posting rows by (voucher, account, department, vatType); sum the
/// amount, keep the first description encountered in input order.
pub fn group_postings(rows: &[PostingRow]) -> Vec<PostingGroup> {
    let mut groups: BTreeMap<GroupKey, (f64, String)> = BTreeMap::new();

    for row in rows {
        let key = GroupKey {
            voucher: row.voucher.clone(),
            account: row.account.clone(),
            department: row.department.clone(),
            vat_type: row.vat_type.clone(),
        };
        groups
            .entry(key)
            .and_modify(|(amount, _)| *amount += row.amount)
            .or_insert_with(|| (row.amount, row.description.clone()));
    }

    groups
        .into_iter()
        .map(|(key, (amount, description))| PostingGroup {
            voucher: key.voucher,
            account: key.account,
            department: key.department,
            vat_type: key.vat_type,
            amount,
            description,
        })
        .collect()
}

/// The two aligned grouped projections for one reconciliation pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconciliationReport {
    pub predicted: Vec<PostingGroup>,
    pub actual: Vec<PostingGroup>,
}

/// Group both tables independently, ready for a downstream diff.
pub fn reconcile(predicted: &[PostingRow], actual: &[PostingRow]) -> ReconciliationReport {
    ReconciliationReport {
        predicted: group_postings(predicted),
        actual: group_postings(actual),
    }
}

/// Outcome of comparing one grouping key across the two projections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffStatus {
    /// Key in both tables, amounts equal within tolerance.
    Match,
    /// Key in both tables, amounts differ.
    AmountMismatch,
    /// Key only in the predicted table.
    PredictedOnly,
    /// Key only in the actual table.
    ActualOnly,
}

/// One diffed grouping key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconDiff {
    pub voucher: String,
    pub account: String,
    pub department: String,
    #[serde(rename = "vatType")]
    pub vat_type: String,
    pub predicted_amount: Option<f64>,
    pub actual_amount: Option<f64>,
    pub status: DiffStatus,
}

impl ReconciliationReport {
    /// Merge-join the two sorted projections and classify each key.
    pub fn diff(&self, tolerance: f64) -> Vec<ReconDiff> {
        let predicted: BTreeMap<GroupKey, &PostingGroup> =
            self.predicted.iter().map(|g| (g.key(), g)).collect();
        let actual: BTreeMap<GroupKey, &PostingGroup> =
            self.actual.iter().map(|g| (g.key(), g)).collect();

        let mut keys: Vec<&GroupKey> = predicted.keys().chain(actual.keys()).collect();
        keys.sort();
        keys.dedup();

        keys.into_iter()
            .map(|key| {
                let p = predicted.get(key).map(|g| g.amount);
                let a = actual.get(key).map(|g| g.amount);
                let status = match (p, a) {
                    (Some(p), Some(a)) if (p - a).abs() <= tolerance => DiffStatus::Match,
                    (Some(_), Some(_)) => DiffStatus::AmountMismatch,
                    (Some(_), None) => DiffStatus::PredictedOnly,
                    (None, Some(_)) => DiffStatus::ActualOnly,
                    (None, None) => unreachable!("key came from one of the maps"),
                };
                ReconDiff {
                    voucher: key.voucher.clone(),
                    account: key.account.to_string(),
                    department: key.department.clone(),
                    vat_type: key.vat_type.clone(),
                    predicted_amount: p,
                    actual_amount: a,
                    status,
                }
            })
            .collect()
    }
}
