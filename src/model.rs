//! Row types for the persisted stage tables.
//!
//! Each stage owns and exclusively writes one table; the next stage joins on
//! the voucher id. The structs here are the schema of those tables: serde
//! names match the CSV column headers so a table written by one run can be
//! consumed by a later run (or inspected by hand) without translation.

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// One OCR'd invoice entering the pipeline. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invoice {
    /// The voucher id this invoice will be booked under.
    pub voucher: String,
    /// Plain text extracted by the OCR service.
    pub text: String,
}

impl Invoice {
    pub fn new(voucher: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            voucher: voucher.into(),
            text: text.into(),
        }
    }
}

// ── Supplier prediction table ────────────────────────────────────────────

/// Output row of the supplier resolver.
///
/// Invariant: the three supplier fields are non-empty iff exactly one
/// supplier-master record matched unambiguously. All-empty is a valid
/// "no confident match" result, not an error.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SupplierPrediction {
    pub invoice_number: String,
    pub supplier_name: String,
    pub supplier_number: String,
    pub organization_number: String,
}

impl SupplierPrediction {
    /// The valid "no confident match" result for a voucher.
    pub fn empty(voucher: impl Into<String>) -> Self {
        Self {
            invoice_number: voucher.into(),
            ..Default::default()
        }
    }

    /// True when no supplier was matched.
    pub fn is_empty(&self) -> bool {
        self.supplier_name.is_empty()
            && self.supplier_number.is_empty()
            && self.organization_number.is_empty()
    }
}

// ── Verdict table ────────────────────────────────────────────────────────

/// Binary trust verdict from the correctness gate.
///
/// This is a hard gate, not a score: only `Correct` vouchers propagate to
/// later stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerdictStatus {
    Correct,
    Uncertain,
}

impl VerdictStatus {
    /// Lenient parse of an oracle-supplied status string. Anything that is
    /// not exactly `correct` counts as uncertain.
    pub fn from_oracle(s: &str) -> Self {
        if s.trim().eq_ignore_ascii_case("correct") {
            VerdictStatus::Correct
        } else {
            VerdictStatus::Uncertain
        }
    }
}

/// Output row of the correctness gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub invoice_number: String,
    pub status: VerdictStatus,
}

// ── VAT line table ───────────────────────────────────────────────────────

/// One (VAT type, net amount) bucket of a voucher, flattened for the table.
///
/// The voucher-level fields (date, description, gross) repeat on every line
/// of the same voucher, mirroring the flattened CSV layout downstream tools
/// expect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VatLineRow {
    pub voucher: String,
    pub date: String,
    pub general_description: String,
    pub payable_gross_amount: f64,
    #[serde(rename = "vatType")]
    pub vat_type: String,
    pub net_amount: f64,
}

// ── Account values ───────────────────────────────────────────────────────

/// An account code as produced by the oracle: either a bare number (legacy
/// 4-digit code) or text (canonical id, or empty when consensus failed).
///
/// The distinction matters to the account normalizer, which only rewrites
/// *numeric* values in [1000, 9999]; the string `"4100"` passes through
/// unchanged.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AccountValue {
    Number(i64),
    Text(String),
}

impl AccountValue {
    /// The empty account value (no consensus / not yet classified).
    pub fn none() -> Self {
        AccountValue::Text(String::new())
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, AccountValue::Text(s) if s.is_empty())
    }

    /// Interpret a JSON scalar: integers stay numeric, everything else is
    /// text. Null becomes the empty value.
    pub fn from_json(v: &serde_json::Value) -> Self {
        match v {
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => AccountValue::Number(i),
                None => AccountValue::Text(n.to_string()),
            },
            serde_json::Value::String(s) => AccountValue::Text(s.clone()),
            serde_json::Value::Null => AccountValue::none(),
            other => AccountValue::Text(other.to_string()),
        }
    }
}

impl Default for AccountValue {
    fn default() -> Self {
        AccountValue::none()
    }
}

impl fmt::Display for AccountValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccountValue::Number(n) => write!(f, "{n}"),
            AccountValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for AccountValue {
    fn from(n: i64) -> Self {
        AccountValue::Number(n)
    }
}

impl From<&str> for AccountValue {
    fn from(s: &str) -> Self {
        AccountValue::Text(s.to_string())
    }
}

impl Serialize for AccountValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            AccountValue::Number(n) => serializer.serialize_i64(*n),
            AccountValue::Text(s) => serializer.serialize_str(s),
        }
    }
}

struct AccountValueVisitor;

impl<'de> Visitor<'de> for AccountValueVisitor {
    type Value = AccountValue;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("an account code (integer or string)")
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<AccountValue, E> {
        Ok(AccountValue::Number(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<AccountValue, E> {
        Ok(AccountValue::Number(v as i64))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<AccountValue, E> {
        if v.fract() == 0.0 {
            Ok(AccountValue::Number(v as i64))
        } else {
            Ok(AccountValue::Text(v.to_string()))
        }
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<AccountValue, E> {
        // CSV cells arrive as strings; digit-only cells are numeric codes,
        // matching how the tables were written.
        let t = v.trim();
        if !t.is_empty() && t.chars().all(|c| c.is_ascii_digit()) {
            if let Ok(n) = t.parse::<i64>() {
                return Ok(AccountValue::Number(n));
            }
        }
        Ok(AccountValue::Text(v.to_string()))
    }

    fn visit_unit<E: de::Error>(self) -> Result<AccountValue, E> {
        Ok(AccountValue::none())
    }
}

impl<'de> Deserialize<'de> for AccountValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(AccountValueVisitor)
    }
}

// ── Consensus line table ─────────────────────────────────────────────────

/// Per-run classification of one VAT line (account + department filled in by
/// one oracle attempt). N of these per line reduce to one [`ConsensusLine`].
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifiedLine {
    pub vat_type: String,
    pub net_amount: f64,
    pub account: AccountValue,
    pub department: String,
}

/// Output row of the ensemble classifier after consensus reduction.
///
/// `account` and `department` are populated only when all ensemble attempts
/// agreed exactly; disagreement leaves the field empty for human review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusLine {
    pub voucher: String,
    #[serde(rename = "vatType")]
    pub vat_type: String,
    pub net_amount: f64,
    pub department: String,
    pub account: AccountValue,
}

// ── Posting tables ───────────────────────────────────────────────────────

/// A single ledger-entry candidate: one booked line of a voucher.
///
/// Used both for pipeline-predicted postings (after account normalization)
/// and for actual/ground-truth postings loaded from history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostingRow {
    pub voucher: String,
    pub account: AccountValue,
    pub department: String,
    #[serde(rename = "vatType")]
    pub vat_type: String,
    pub amount: f64,
    pub description: String,
}

/// Grouping key for reconciliation: one ledger bucket.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GroupKey {
    pub voucher: String,
    pub account: AccountValue,
    pub department: String,
    pub vat_type: String,
}

/// One aggregated reconciliation bucket: summed amount and first-seen
/// description for a [`GroupKey`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostingGroup {
    pub voucher: String,
    pub account: AccountValue,
    pub department: String,
    #[serde(rename = "vatType")]
    pub vat_type: String,
    pub amount: f64,
    pub description: String,
}

impl PostingGroup {
    pub fn key(&self) -> GroupKey {
        GroupKey {
            voucher: self.voucher.clone(),
            account: self.account.clone(),
            department: self.department.clone(),
            vat_type: self.vat_type.clone(),
        }
    }
}
