//! Ensemble classification: N independent oracle runs assign account and
//! department per VAT line; unanimity-only consensus reduces them to one
//! answer per line.
//!
//! The reduction deliberately trades recall for precision. A
//! wrong-but-confident single run cannot corrupt the consensus, but any
//! disagreement yields an empty field ("needs human review") rather than a
//! guess. Majority voting would change the failure semantics exposed to
//! downstream auditing; do not swap it in casually.
//!
//! The N calls are independent and issued concurrently, but reduction is a
//! barrier: it waits for all N before producing anything, and any run that
//! fails to parse invalidates the voucher's entire consensus — a partial
//! ensemble is not a valid quorum.

use crate::config::PipelineConfig;
use crate::context::{Exemplar, LookupContext, SupplierRecord};
use crate::model::{AccountValue, ClassifiedLine, ConsensusLine, Invoice, VatLineRow};
use crate::oracle::{generate_with_retry, ExtractionOracle};
use crate::{parse, prompts};
use futures::future::join_all;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

/// Run the ensemble for one voucher and reduce to consensus lines.
///
/// Returns no lines at all when any of the N runs fails outright.
pub async fn classify_voucher(
    oracle: &Arc<dyn ExtractionOracle>,
    invoice: &Invoice,
    supplier: &SupplierRecord,
    skeleton: &[VatLineRow],
    ctx: &LookupContext,
    exemplar: Option<&Exemplar>,
    config: &PipelineConfig,
) -> Vec<ConsensusLine> {
    if skeleton.is_empty() {
        return Vec::new();
    }

    let supplier_json = serde_json::to_string_pretty(supplier).unwrap_or_default();
    let accounts_json = serde_json::to_string_pretty(&ctx.accounts).unwrap_or_default();
    let departments_json = serde_json::to_string_pretty(&ctx.departments).unwrap_or_default();
    let skeleton_json = prompts::classify_skeleton(skeleton);
    let prompt = prompts::classify(
        &skeleton_json,
        &supplier_json,
        &accounts_json,
        &departments_json,
        &invoice.text,
        exemplar,
    );

    let attempts = (0..config.ensemble_attempts)
        .map(|_| run_once(oracle, &prompt, config))
        .collect::<Vec<_>>();
    let runs: Vec<Option<Vec<ClassifiedLine>>> = join_all(attempts).await;

    let mut parsed = Vec::with_capacity(runs.len());
    for (i, run) in runs.into_iter().enumerate() {
        match run {
            Some(lines) if !lines.is_empty() => parsed.push(lines),
            _ => {
                warn!(
                    voucher = %invoice.voucher,
                    run = i,
                    "ensemble run failed, consensus invalidated"
                );
                return Vec::new();
            }
        }
    }

    consensus(&parsed, &invoice.voucher)
}

/// One ensemble attempt: call the oracle and parse its classified lines.
/// `None` (or an empty vector) means the run failed.
async fn run_once(
    oracle: &Arc<dyn ExtractionOracle>,
    prompt: &str,
    config: &PipelineConfig,
) -> Option<Vec<ClassifiedLine>> {
    let response = generate_with_retry(oracle, prompt, config.classify_temperature, config)
        .await
        .ok()?;
    let rows = parse::object_rows(parse::extract_json(&response)?);

    let mut lines = Vec::new();
    for row in rows {
        let Some(Value::Array(raw_lines)) = row.get("vat_lines") else {
            continue;
        };
        for raw in raw_lines {
            let Value::Object(line) = raw else { continue };
            let vat_type = line.get("vatType").map(parse::string_of).unwrap_or_default();
            let Some(net_amount) = line.get("net_amount").and_then(parse::amount) else {
                continue;
            };
            lines.push(ClassifiedLine {
                vat_type,
                net_amount,
                account: line
                    .get("account")
                    .map(AccountValue::from_json)
                    .unwrap_or_default(),
                department: line.get("department").map(parse::string_of).unwrap_or_default(),
            });
        }
    }

    if lines.is_empty() {
        None
    } else {
        Some(lines)
    }
}

/// Reduce N parsed runs to consensus lines for one voucher.
///
/// Per VAT type: the type is kept only when every run produced a line for
/// it (missing types are dropped, never interpolated). Net amount comes
/// from the first run — it is invariant across runs by construction, since
/// the prompt fixes the VAT lines. Account is kept only when identical in
/// every run; the same rule applies independently to department.
pub fn consensus(runs: &[Vec<ClassifiedLine>], voucher: &str) -> Vec<ConsensusLine> {
    let Some(first_run) = runs.first() else {
        return Vec::new();
    };

    let mut out = Vec::new();
    let mut seen: Vec<&str> = Vec::new();

    for base in first_run {
        if seen.contains(&base.vat_type.as_str()) {
            continue;
        }
        seen.push(&base.vat_type);

        // One line per run for this type, or the type is dropped.
        let per_run: Vec<&ClassifiedLine> = runs
            .iter()
            .filter_map(|run| run.iter().find(|l| l.vat_type == base.vat_type))
            .collect();
        if per_run.len() < runs.len() {
            debug!(voucher, vat_type = %base.vat_type, "VAT type missing from some runs, dropped");
            continue;
        }

        let account = if per_run.iter().all(|l| l.account == per_run[0].account) {
            per_run[0].account.clone()
        } else {
            AccountValue::none()
        };
        let department = if per_run.iter().all(|l| l.department == per_run[0].department) {
            per_run[0].department.clone()
        } else {
            String::new()
        };

        out.push(ConsensusLine {
            voucher: voucher.to_string(),
            vat_type: base.vat_type.clone(),
            net_amount: base.net_amount,
            department,
            account,
        });
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::OracleError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn line(vat_type: &str, net: f64, account: AccountValue, department: &str) -> ClassifiedLine {
        ClassifiedLine {
            vat_type: vat_type.into(),
            net_amount: net,
            account,
            department: department.into(),
        }
    }

    #[test]
    fn unanimous_runs_keep_both_fields() {
        let run = vec![line("1", 80.32, "4200".into(), "D1")];
        let lines = consensus(&[run.clone(), run.clone(), run], "V1");
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].account, AccountValue::Text("4200".into()));
        assert_eq!(lines[0].department, "D1");
        assert_eq!(lines[0].net_amount, 80.32);
    }

    #[test]
    fn two_against_one_empties_account_only() {
        let agree = vec![line("1", 80.32, "4200".into(), "D1")];
        let dissent = vec![line("1", 80.32, "4300".into(), "D1")];
        let lines = consensus(&[agree.clone(), agree, dissent], "V1");
        assert_eq!(lines.len(), 1);
        // Never a majority vote: unanimity or nothing.
        assert!(lines[0].account.is_empty());
        assert_eq!(lines[0].department, "D1");
    }

    #[test]
    fn account_and_department_judged_independently() {
        let a = vec![line("1", 80.32, "4200".into(), "D1")];
        let b = vec![line("1", 80.32, "4200".into(), "D2")];
        let lines = consensus(&[a.clone(), a, b], "V1");
        assert_eq!(lines[0].account, AccountValue::Text("4200".into()));
        assert!(lines[0].department.is_empty());
    }

    #[test]
    fn numeric_and_text_accounts_do_not_agree() {
        let a = vec![line("1", 80.32, AccountValue::Number(4200), "D1")];
        let b = vec![line("1", 80.32, "4200".into(), "D1")];
        let lines = consensus(&[a.clone(), a, b], "V1");
        assert!(lines[0].account.is_empty());
    }

    #[test]
    fn type_missing_from_one_run_is_dropped() {
        let full = vec![
            line("1", 80.32, "4200".into(), "D1"),
            line("11", 40.0, "4300".into(), "D1"),
        ];
        let partial = vec![line("1", 80.32, "4200".into(), "D1")];
        let lines = consensus(&[full.clone(), full, partial], "V1");
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].vat_type, "1");
    }

    #[test]
    fn net_amount_taken_from_first_run() {
        let a = vec![line("1", 80.32, "4200".into(), "D1")];
        let b = vec![line("1", 80.33, "4200".into(), "D1")];
        let lines = consensus(&[a, b.clone(), b], "V1");
        assert_eq!(lines[0].net_amount, 80.32);
    }

    // ── Full ensemble path ──────────────────────────────────────────────

    /// Hands out one response per call, in order of arrival.
    struct Pool {
        responses: Vec<String>,
        cursor: AtomicUsize,
    }

    impl Pool {
        fn new<const N: usize>(responses: [&str; N]) -> Self {
            Self {
                responses: responses.iter().map(|s| s.to_string()).collect(),
                cursor: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ExtractionOracle for Pool {
        async fn generate(&self, _p: &str, _t: f32) -> Result<String, OracleError> {
            let i = self.cursor.fetch_add(1, Ordering::SeqCst);
            Ok(self.responses[i.min(self.responses.len() - 1)].clone())
        }
    }

    fn skeleton() -> Vec<VatLineRow> {
        vec![VatLineRow {
            voucher: "V1".into(),
            date: "2025-02-01".into(),
            general_description: "Rent".into(),
            payable_gross_amount: 100.40,
            vat_type: "1".into(),
            net_amount: 80.32,
        }]
    }

    fn supplier() -> SupplierRecord {
        SupplierRecord {
            id: 1,
            name: "Acme AS".into(),
            supplier_number: "20045".into(),
            organization_number: "912345678".into(),
        }
    }

    fn config() -> PipelineConfig {
        PipelineConfig::builder().retry_backoff_ms(1).build().unwrap()
    }

    const AGREED: &str = r#"{"vat_lines": [{"vatType": "1", "net_amount": 80.32, "department": "D1", "account": "4200"}]}"#;

    #[tokio::test]
    async fn all_runs_agree() {
        let oracle: Arc<dyn ExtractionOracle> = Arc::new(Pool::new([AGREED]));
        let lines = classify_voucher(
            &oracle,
            &Invoice::new("V1", "invoice"),
            &supplier(),
            &skeleton(),
            &LookupContext::default(),
            None,
            &config(),
        )
        .await;
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].account, AccountValue::Text("4200".into()));
    }

    #[tokio::test]
    async fn one_garbage_run_invalidates_voucher() {
        let oracle: Arc<dyn ExtractionOracle> =
            Arc::new(Pool::new([AGREED, AGREED, "not json at all"]));
        let lines = classify_voucher(
            &oracle,
            &Invoice::new("V1", "invoice"),
            &supplier(),
            &skeleton(),
            &LookupContext::default(),
            None,
            &config(),
        )
        .await;
        assert!(lines.is_empty());
    }

    #[tokio::test]
    async fn python_literal_run_still_parses() {
        let pythonish =
            r#"{'vat_lines': [{'vatType': '1', 'net_amount': 80.32, 'department': 'D1', 'account': '4200'}]}"#;
        let oracle: Arc<dyn ExtractionOracle> = Arc::new(Pool::new([AGREED, AGREED, pythonish]));
        let lines = classify_voucher(
            &oracle,
            &Invoice::new("V1", "invoice"),
            &supplier(),
            &skeleton(),
            &LookupContext::default(),
            None,
            &config(),
        )
        .await;
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].account, AccountValue::Text("4200".into()));
    }

    #[tokio::test]
    async fn empty_skeleton_skips_oracle() {
        let oracle: Arc<dyn ExtractionOracle> = Arc::new(Pool::new(["should never be used"]));
        let lines = classify_voucher(
            &oracle,
            &Invoice::new("V1", "invoice"),
            &supplier(),
            &[],
            &LookupContext::default(),
            None,
            &config(),
        )
        .await;
        assert!(lines.is_empty());
    }
}
