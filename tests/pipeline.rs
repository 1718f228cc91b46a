//! End-to-end pipeline tests with a scripted oracle.
//!
//! The oracle routes canned responses by recognising stage instructions in
//! the prompt, so a whole batch flows through every stage without network
//! access. Concurrency is pinned to 1 where response order matters.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use voucherflow::context::{Account, Department, SupplierRecord, VatCode};
use voucherflow::oracle::OracleError;
use voucherflow::stages::reconcile::DiffStatus;
use voucherflow::{
    run_pipeline, store, AccountValue, ExtractionOracle, Invoice, LookupContext, PipelineConfig,
    VerdictStatus, VoucherError,
};

// ── Scripted oracle ──────────────────────────────────────────────────────────

/// Routes responses per stage; classification responses are consumed in
/// order so ensemble runs can be scripted individually.
struct ScriptedOracle {
    supplier: String,
    verdict: String,
    vat: String,
    classify: Mutex<Vec<String>>,
    classify_cursor: AtomicUsize,
}

impl ScriptedOracle {
    fn new(supplier: &str, verdict: &str, vat: &str, classify: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            supplier: supplier.to_string(),
            verdict: verdict.to_string(),
            vat: vat.to_string(),
            classify: Mutex::new(classify.iter().map(|s| s.to_string()).collect()),
            classify_cursor: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl ExtractionOracle for ScriptedOracle {
    async fn generate(&self, prompt: &str, _temperature: f32) -> Result<String, OracleError> {
        if prompt.contains("double-checking supplier data") {
            Ok(self.verdict.clone())
        } else if prompt.contains("group the attached invoice by VAT type") {
            Ok(self.vat.clone())
        } else if prompt.contains("pick the correct **account code**") {
            let scripts = self.classify.lock().unwrap();
            let i = self.classify_cursor.fetch_add(1, Ordering::SeqCst);
            Ok(scripts[i.min(scripts.len() - 1)].clone())
        } else {
            Ok(self.supplier.clone())
        }
    }
}

// ── Fixtures ─────────────────────────────────────────────────────────────────

fn context() -> LookupContext {
    LookupContext {
        suppliers: vec![
            SupplierRecord {
                id: 1,
                name: "Fjordkraft AS".into(),
                supplier_number: "20045".into(),
                organization_number: "912345678".into(),
            },
            SupplierRecord {
                id: 2,
                name: "Byggmakker AS".into(),
                supplier_number: "20046".into(),
                organization_number: "998877665".into(),
            },
        ],
        accounts: vec![
            Account {
                number: 4100,
                account_id: "EL-4100".into(),
                description: "Electricity".into(),
            },
            Account {
                number: 4300,
                account_id: "MAT-4300".into(),
                description: "Materials".into(),
            },
        ],
        departments: vec![Department {
            code: "D1".into(),
            name: "Operations".into(),
        }],
        vat_codes: vec![
            VatCode {
                code: "1".into(),
                description: "High rate".into(),
                rate: "25%".into(),
            },
            VatCode {
                code: "11".into(),
                description: "Food rate".into(),
                rate: "15%".into(),
            },
        ],
        ..Default::default()
    }
}

fn config() -> PipelineConfig {
    PipelineConfig::builder()
        .concurrency(1)
        .retry_backoff_ms(1)
        .build()
        .unwrap()
}

fn invoice_text() -> String {
    let mut lines: Vec<String> = vec![
        "FAKTURA".into(),
        "Fjordkraft AS".into(),
        "Org.nr: 912 345 678".into(),
    ];
    lines.extend((1..=20).map(|i| format!("linje {i}")));
    lines.push("Fjordkraft AS - Postboks 3".into());
    lines.join("\n")
}

const SUPPLIER_OK: &str = r#"{"supplier_name": "Fjordkraft AS", "supplier_number": "20045", "organization_number": "912345678"}"#;
const VERDICT_OK: &str = r#"{"status": "correct"}"#;
const VAT_OK: &str = r#"[{"date": "2025-02-01", "general description": "Strøm februar", "payable_gross_amount": "100.40", "vat_lines": [{"vatType": "1", "net_amount": "80.32"}]}]"#;
const CLASSIFY_OK: &str = r#"{"vat_lines": [{"vatType": "1", "net_amount": 80.32, "department": "D1", "account": "4100"}]}"#;

// ── Tests ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn happy_path_books_and_reconciles() {
    let oracle = ScriptedOracle::new(SUPPLIER_OK, VERDICT_OK, VAT_OK, &[CLASSIFY_OK]);
    let invoices = vec![Invoice::new("F-1042", invoice_text())];

    let output = run_pipeline(&invoices, &context(), oracle, &config()).await.unwrap();

    assert!(output.errors.is_empty(), "errors: {:?}", output.errors);
    assert_eq!(output.predictions.len(), 1);
    assert_eq!(output.predictions[0].supplier_number, "20045");
    assert_eq!(output.verdicts[0].status, VerdictStatus::Correct);

    assert_eq!(output.vat_lines.len(), 1);
    assert_eq!(output.vat_lines[0].net_amount, 80.32);
    assert_eq!(output.vat_lines[0].payable_gross_amount, 100.40);

    // "4100" came back as a digit string; type-sensitive normalization
    // leaves text values alone.
    assert_eq!(output.postings.len(), 1);
    assert_eq!(output.postings[0].account, AccountValue::Text("4100".into()));
    assert_eq!(output.postings[0].description, "Strøm februar");

    // Reconcile against an identical actual table: everything matches.
    let report = output.reconcile_against(&output.postings);
    let diffs = report.diff(0.01);
    assert_eq!(diffs.len(), 1);
    assert_eq!(diffs[0].status, DiffStatus::Match);
}

#[tokio::test]
async fn numeric_account_is_normalized_to_canonical_id() {
    let classify = r#"{"vat_lines": [{"vatType": "1", "net_amount": 80.32, "department": "D1", "account": 4100}]}"#;
    let oracle = ScriptedOracle::new(SUPPLIER_OK, VERDICT_OK, VAT_OK, &[classify]);
    let invoices = vec![Invoice::new("F-1042", invoice_text())];

    let output = run_pipeline(&invoices, &context(), oracle, &config()).await.unwrap();

    assert_eq!(output.postings[0].account, AccountValue::Text("EL-4100".into()));
}

#[tokio::test]
async fn uncertain_verdict_gates_the_voucher() {
    let oracle = ScriptedOracle::new(
        SUPPLIER_OK,
        r#"{"status": "uncertain"}"#,
        VAT_OK,
        &[CLASSIFY_OK],
    );
    let invoices = vec![Invoice::new("F-1042", invoice_text())];

    let output = run_pipeline(&invoices, &context(), oracle, &config()).await.unwrap();

    assert_eq!(output.stats.suppliers_resolved, 1);
    assert_eq!(output.stats.verified_correct, 0);
    assert!(output.vat_lines.is_empty());
    assert!(output.postings.is_empty());
    assert!(matches!(output.errors[0], VoucherError::Unverified { .. }));
}

#[tokio::test]
async fn ambiguous_supplier_stops_before_the_gate() {
    // The oracle names a supplier that is not in the master.
    let oracle = ScriptedOracle::new(
        r#"{"supplier_name": "Ukjent AS", "supplier_number": "99999", "organization_number": "000000000"}"#,
        VERDICT_OK,
        VAT_OK,
        &[CLASSIFY_OK],
    );
    let invoices = vec![Invoice::new("F-1042", invoice_text())];

    let output = run_pipeline(&invoices, &context(), oracle, &config()).await.unwrap();

    assert_eq!(output.stats.suppliers_resolved, 0);
    assert!(output.predictions[0].is_empty());
    assert!(output.verdicts.is_empty());
    assert!(matches!(output.errors[0], VoucherError::NoSupplierMatch { .. }));
}

#[tokio::test]
async fn dissenting_ensemble_run_empties_the_account() {
    let dissent = r#"{"vat_lines": [{"vatType": "1", "net_amount": 80.32, "department": "D1", "account": "4300"}]}"#;
    let oracle = ScriptedOracle::new(
        SUPPLIER_OK,
        VERDICT_OK,
        VAT_OK,
        &[CLASSIFY_OK, CLASSIFY_OK, dissent],
    );
    let invoices = vec![Invoice::new("F-1042", invoice_text())];

    let output = run_pipeline(&invoices, &context(), oracle, &config()).await.unwrap();

    // Unanimity failed on the account; the line survives for review with
    // the agreed department intact.
    assert_eq!(output.consensus.len(), 1);
    assert!(output.consensus[0].account.is_empty());
    assert_eq!(output.consensus[0].department, "D1");
}

#[tokio::test]
async fn unparsable_ensemble_run_invalidates_the_voucher() {
    let oracle = ScriptedOracle::new(
        SUPPLIER_OK,
        VERDICT_OK,
        VAT_OK,
        &[CLASSIFY_OK, "sorry, I cannot help with that", CLASSIFY_OK],
    );
    let invoices = vec![Invoice::new("F-1042", invoice_text())];

    let output = run_pipeline(&invoices, &context(), oracle, &config()).await.unwrap();

    assert!(output.consensus.is_empty());
    assert!(output.postings.is_empty());
    assert!(matches!(output.errors[0], VoucherError::ParseFailed { .. }));
    // Upstream tables are still intact for inspection.
    assert_eq!(output.vat_lines.len(), 1);
}

#[tokio::test]
async fn batch_survives_a_bad_voucher() {
    let oracle = ScriptedOracle::new(SUPPLIER_OK, VERDICT_OK, VAT_OK, &[CLASSIFY_OK]);
    let invoices = vec![
        Invoice::new("F-1042", invoice_text()),
        Invoice::new("F-1043", "   "),
    ];

    let output = run_pipeline(&invoices, &context(), oracle, &config()).await.unwrap();

    assert_eq!(output.stats.total_vouchers, 2);
    assert_eq!(output.stats.classified, 1);
    assert_eq!(output.errors.len(), 1);
    assert_eq!(output.errors[0].voucher(), "F-1043");
}

#[tokio::test]
async fn stage_tables_round_trip_through_csv() {
    let oracle = ScriptedOracle::new(SUPPLIER_OK, VERDICT_OK, VAT_OK, &[CLASSIFY_OK]);
    let invoices = vec![Invoice::new("F-1042", invoice_text())];
    let output = run_pipeline(&invoices, &context(), oracle, &config()).await.unwrap();

    let dir = tempfile::tempdir().unwrap();
    store::write_run(dir.path(), &output).unwrap();

    let postings: Vec<voucherflow::PostingRow> =
        store::read_table(dir.path().join("postings.csv")).unwrap();
    assert_eq!(postings, output.postings);

    let vat: Vec<voucherflow::VatLineRow> =
        store::read_table(dir.path().join("vat_lines.csv")).unwrap();
    assert_eq!(vat, output.vat_lines);
}

#[tokio::test]
async fn credit_note_flows_through_with_negative_amounts() {
    let vat = r#"[{"date": "2025-03-01", "general description": "Kreditnota", "payable_gross_amount": "-100.40", "vat_lines": [{"vatType": "1", "net_amount": "-80.32"}]}]"#;
    let classify = r#"{"vat_lines": [{"vatType": "1", "net_amount": -80.32, "department": "D1", "account": "4100"}]}"#;
    let oracle = ScriptedOracle::new(SUPPLIER_OK, VERDICT_OK, vat, &[classify]);
    let invoices = vec![Invoice::new("F-1044", invoice_text())];

    let output = run_pipeline(&invoices, &context(), oracle, &config()).await.unwrap();

    assert!(output.errors.is_empty(), "errors: {:?}", output.errors);
    assert_eq!(output.postings[0].amount, -80.32);
}
