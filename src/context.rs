//! The read-only lookup context shared by every stage.
//!
//! Supplier master, chart of accounts, department list, VAT-code table and
//! historical postings are loaded once at startup and never mutated by the
//! pipeline. Every voucher can therefore read the context concurrently
//! without locking.

use crate::error::PipelineError;
use crate::model::AccountValue;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

/// One supplier-master record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupplierRecord {
    /// Internal id, used to join against historical postings.
    pub id: i64,
    pub name: String,
    pub supplier_number: String,
    pub organization_number: String,
}

/// One row of the chart of accounts.
///
/// `number` is the legacy 4-digit numeric code; `account_id` is the
/// canonical identifier the normalizer rewrites to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub number: i64,
    pub account_id: String,
    pub description: String,
}

/// One department.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Department {
    pub code: String,
    pub name: String,
}

/// One VAT code with its rate as supplied: a percentage string like `"25%"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VatCode {
    pub code: String,
    pub description: String,
    pub rate: String,
}

impl VatCode {
    /// Parse the percentage-string rate into a decimal fraction
    /// (`"25%"` → `0.25`). Returns `None` for malformed rates.
    pub fn rate_fraction(&self) -> Option<f64> {
        let trimmed = self.rate.trim().trim_end_matches('%').trim();
        let pct: f64 = trimmed.replace(',', ".").parse().ok()?;
        Some(pct / 100.0)
    }
}

/// One historical (ground-truth) posting line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricalPosting {
    pub voucher: String,
    pub supplier_id: i64,
    pub date: String,
    pub description: String,
    pub account: AccountValue,
    pub department: String,
    #[serde(rename = "vatType")]
    pub vat_type: String,
    pub amount: f64,
}

/// One VAT line of an exemplar voucher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExemplarLine {
    #[serde(rename = "vatType")]
    pub vat_type: String,
    pub net_amount: f64,
    pub account: AccountValue,
    pub department: String,
}

/// A known-correct historical voucher from the same supplier, used as
/// few-shot guidance for the VAT extractor and the ensemble classifier.
#[derive(Debug, Clone, PartialEq)]
pub struct Exemplar {
    pub voucher: String,
    /// OCR text of the exemplar invoice, when archived.
    pub text: Option<String>,
    pub date: String,
    pub description: String,
    /// Gross payable re-derived from the historical net lines and VAT rates.
    pub payable_gross_amount: f64,
    pub lines: Vec<ExemplarLine>,
}

/// The read-only reference tables supplied to every stage.
#[derive(Debug, Clone, Default)]
pub struct LookupContext {
    pub suppliers: Vec<SupplierRecord>,
    pub accounts: Vec<Account>,
    pub departments: Vec<Department>,
    pub vat_codes: Vec<VatCode>,
    pub postings: Vec<HistoricalPosting>,
    /// Archived OCR text of historical vouchers, keyed by voucher id.
    pub posting_texts: HashMap<String, String>,
}

impl LookupContext {
    /// Decimal VAT rate for a code, or `None` for unknown codes.
    pub fn vat_rate(&self, code: &str) -> Option<f64> {
        self.vat_codes
            .iter()
            .find(|v| v.code == code)
            .and_then(VatCode::rate_fraction)
    }

    /// True if the code exists in the VAT-code table.
    pub fn knows_vat_code(&self, code: &str) -> bool {
        self.vat_codes.iter().any(|v| v.code == code)
    }

    /// Legacy number → canonical account id, for the account normalizer.
    pub fn account_map(&self) -> HashMap<i64, String> {
        self.accounts
            .iter()
            .map(|a| (a.number, a.account_id.clone()))
            .collect()
    }

    /// Look up a supplier-master record by supplier number.
    pub fn supplier_by_number(&self, number: &str) -> Option<&SupplierRecord> {
        self.suppliers.iter().find(|s| s.supplier_number == number)
    }

    /// The earliest historical voucher for a supplier, rebuilt into an
    /// exemplar: its VAT lines, the gross re-derived from nets plus VAT
    /// rates, and the archived invoice text when available.
    ///
    /// Returns `None` when the supplier has no posting history; the stages
    /// then fall back to zero-shot prompts.
    pub fn exemplar_for(&self, supplier_id: i64) -> Option<Exemplar> {
        let mut supplier_rows: Vec<&HistoricalPosting> = self
            .postings
            .iter()
            .filter(|p| p.supplier_id == supplier_id)
            .collect();
        if supplier_rows.is_empty() {
            return None;
        }
        // ISO dates sort lexicographically; earliest voucher wins.
        supplier_rows.sort_by(|a, b| a.date.cmp(&b.date));
        let first = supplier_rows[0];
        let voucher_rows: Vec<&&HistoricalPosting> = supplier_rows
            .iter()
            .filter(|p| p.voucher == first.voucher)
            .collect();

        let mut gross = 0.0;
        let mut lines = Vec::with_capacity(voucher_rows.len());
        for row in &voucher_rows {
            let rate = self.vat_rate(&row.vat_type).unwrap_or(0.0);
            gross += row.amount * (1.0 + rate);
            lines.push(ExemplarLine {
                vat_type: row.vat_type.clone(),
                net_amount: row.amount,
                account: row.account.clone(),
                department: row.department.clone(),
            });
        }

        debug!(
            supplier_id,
            voucher = %first.voucher,
            lines = lines.len(),
            "exemplar voucher selected"
        );

        Some(Exemplar {
            voucher: first.voucher.clone(),
            text: self.posting_texts.get(&first.voucher).cloned(),
            date: first.date.clone(),
            description: first.description.clone(),
            payable_gross_amount: round2(gross),
            lines,
        })
    }

    /// Load the context from a directory of CSV tables.
    ///
    /// Expected files: `suppliers.csv`, `accounts.csv`, `departments.csv`,
    /// `vat_codes.csv`, `supplier_postings.csv`, plus an optional `ocr/`
    /// subdirectory of `<voucher>.txt` files with archived invoice text.
    pub fn from_csv_dir(dir: impl AsRef<Path>) -> Result<Self, PipelineError> {
        let dir = dir.as_ref();
        let suppliers = read_csv(&dir.join("suppliers.csv"))?;
        let accounts = read_csv(&dir.join("accounts.csv"))?;
        let departments = read_csv(&dir.join("departments.csv"))?;
        let vat_codes = read_csv(&dir.join("vat_codes.csv"))?;
        let postings = read_csv(&dir.join("supplier_postings.csv"))?;

        let mut posting_texts = HashMap::new();
        let ocr_dir = dir.join("ocr");
        if ocr_dir.is_dir() {
            for entry in std::fs::read_dir(&ocr_dir)
                .map_err(|e| PipelineError::Internal(format!("reading {ocr_dir:?}: {e}")))?
            {
                let entry =
                    entry.map_err(|e| PipelineError::Internal(format!("reading {ocr_dir:?}: {e}")))?;
                let path = entry.path();
                if path.extension().is_some_and(|ext| ext == "txt") {
                    if let (Some(stem), Ok(text)) =
                        (path.file_stem(), std::fs::read_to_string(&path))
                    {
                        posting_texts.insert(stem.to_string_lossy().into_owned(), text);
                    }
                }
            }
        }

        Ok(Self {
            suppliers,
            accounts,
            departments,
            vat_codes,
            postings,
            posting_texts,
        })
    }
}

fn read_csv<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Vec<T>, PipelineError> {
    let mut reader = csv::Reader::from_path(path).map_err(|e| PipelineError::TableReadFailed {
        path: path.to_path_buf(),
        source: e,
    })?;
    reader
        .deserialize()
        .collect::<Result<Vec<T>, _>>()
        .map_err(|e| PipelineError::TableReadFailed {
            path: path.to_path_buf(),
            source: e,
        })
}

/// Round to two decimals, the precision of the monetary tables.
pub fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}
