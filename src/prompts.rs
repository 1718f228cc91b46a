//! Oracle instruction text for every stage.
//!
//! Centralising every prompt here serves two purposes:
//!
//! 1. **Single source of truth** — changing how a stage phrases its task
//!    (e.g. tightening the uniqueness rules) requires editing exactly one
//!    place.
//!
//! 2. **Testability** — unit tests can inspect the rendered instructions
//!    directly without calling a real oracle, making prompt regressions
//!    easy to catch.
//!
//! The builders take pre-serialised context (supplier list, code tables,
//! exemplar JSON) so the prompt layer stays free of lookup logic.

use crate::config::PipelineConfig;
use crate::context::{Exemplar, SupplierRecord, VatCode};
use crate::model::VatLineRow;
use serde_json::json;
use std::fmt::Write;

/// Render the supplier master as one `name, number, orgnr` line per record.
pub fn supplier_list(suppliers: &[SupplierRecord]) -> String {
    suppliers
        .iter()
        .map(|s| format!("{}, {}, {}", s.name, s.supplier_number, s.organization_number))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Direct-answer supplier resolution.
pub fn supplier_direct(supplier_list: &str, own_companies: &[String], invoice_text: &str) -> String {
    let own = if own_companies.is_empty() {
        "our own company".to_string()
    } else {
        own_companies.join(" and ")
    };
    format!(
        r#"Choose the correct supplier number from the supplier list based on invoice text.
- Ignore {own}. That's our company.
- If there are several suppliers mentioned, return empty values.
- If you can't find a perfect match for either the supplier name or the organization number, return empty values.
- If you can't find the supplier in the supplier list, return empty values.
- If there are several potential matches from the supplier list, return empty values.

Empty values = the JSON below with no added content.

Supplier List:
{supplier_list}

Invoice Text:
{invoice_text}

Return the result in JSON format:
{{
  "supplier_name": "",
  "supplier_number": "",
  "organization_number": ""
}}"#
    )
}

/// Step-by-step supplier resolution with a diagnostic `reasoning` field.
pub fn supplier_chain_of_thought(
    supplier_list: &str,
    own_companies: &[String],
    invoice_text: &str,
) -> String {
    let own = if own_companies.is_empty() {
        "our own company".to_string()
    } else {
        own_companies.join(" and ")
    };
    format!(
        r#"Choose the correct supplier number from the supplier list based on invoice text.
Let's solve this step by step.

Step 1: Read the invoice text and extract all names that could be suppliers.
Step 2: Remove any names that are our own company: {own}.
Step 3: Try to find a perfect match for either the supplier name or organization number in the supplier list.
Step 4: If there are several possible matches or no clear match, return empty values.
Step 5: All suppliers in the supplier list have supplier numbers, make sure you find and return the supplier number of the identified supplier.
Step 6: If you find a perfect match, return the JSON below with the supplier name, supplier number, organization number and reasoning.
Step 7: Remove any text outside of the JSON.

Supplier List:
{supplier_list}

Invoice Text:
{invoice_text}

{{
  "supplier_name": "...",
  "supplier_number": "...",
  "organization_number": "...",
  "reasoning": "Step-by-step explanation of how the result was determined or why it was left empty."
}}"#
    )
}

/// Correctness-gate check of an existing supplier prediction against the
/// header/footer/body split of the invoice.
pub fn verify_supplier(header: &str, body: &str, footer: &str, prediction_json: &str) -> String {
    format!(
        r#"You are tasked with double-checking supplier data extracted from an invoice.

### Instructions:
1. Focus on the sender information in the header or footer.
2. If the sender is clearly stated in the header or footer, return "correct."
3. If the sender appears only in the body, return "uncertain."
4. If multiple company names are mentioned, return "uncertain."
5. If you cannot confidently verify the extracted supplier, return "uncertain."
6. Do NOT suggest a new supplier — only evaluate the existing prediction.

### Hierarchy of Importance:
- The company name in the header or footer takes priority over mentions in the body.
- If the extracted supplier does not align with the header or footer, return "uncertain."

### Header:
{header}

### Invoice Body:
{body}

### Footer:
{footer}

### Extracted Data:
{prediction_json}

### Return the result in JSON format:
{{
  "status": ""
}}
"status" must be "correct" or "uncertain"."#
    )
}

/// VAT-line decomposition of an invoice, optionally guided by an exemplar
/// voucher from the same supplier.
pub fn vat_split(
    supplier_json: &str,
    vat_codes: &[VatCode],
    invoice_text: &str,
    exemplar: Option<&Exemplar>,
    config: &PipelineConfig,
) -> String {
    let codes_json = serde_json::to_string_pretty(vat_codes).unwrap_or_default();
    let food = &config.import_food_vat;
    let nonfood = &config.import_nonfood_vat;

    let mut prompt = format!(
        r#"Please find the sum payable and group the attached invoice by VAT type.
- The payable amount should be a gross amount, i.e. should include VAT
- The sum per VAT type should be net, i.e. should not include VAT
- Only use the attached VAT codes.
- If there is supplier context, please adhere to it
- Use . as decimal separator and no group separator. (Ex: 12473.47)
- Negative amounts are for credit notes. Positive amounts are for costs.
- If the invoice mentions "credit note", multiply the amounts by -1. (100 becomes -100).
- If the invoice is from abroad, it's import and the VAT type should be {food} for food items and {nonfood} for non-food items (0% VAT).
- Before answering, add VAT back onto your net sums and check that they total the gross payable amount. If they do not, redo the grouping from the start.

### Supplier:
{supplier_json}

### VAT Codes:
{codes_json}

### Invoice Text:
{invoice_text}

### Return the result as RAW JSON:
- Do NOT format the JSON in markdown.
- Do NOT use backticks.
- Return raw JSON directly, like this:
[
    {{
        "date": "",
        "general description": "",
        "payable_gross_amount": "",
        "vat_lines":
            [
                {{
                    "vatType": "",
                    "net_amount": ""
                }}
            ]
    }}
]"#
    );

    if let Some(ex) = exemplar {
        let answer = json!([{
            "date": ex.date,
            "general description": ex.description,
            "payable_gross_amount": ex.payable_gross_amount,
            "vat_lines": ex.lines.iter().map(|l| json!({
                "vatType": l.vat_type,
                "net_amount": l.net_amount,
            })).collect::<Vec<_>>(),
        }]);
        let _ = write!(
            prompt,
            r#"

Below is an old invoice and the correct return value for it. Use it to understand how to solve the task above.

### The old invoice:
{}

### The return value for the old invoice:
{}"#,
            ex.text.as_deref().unwrap_or("N/A"),
            serde_json::to_string_pretty(&answer).unwrap_or_default(),
        );
    }

    prompt
}

/// Render the skeleton VAT lines the classifier must fill in (account and
/// department blank, type and amount fixed).
pub fn classify_skeleton(lines: &[VatLineRow]) -> String {
    let skeleton = json!({
        "vat_lines": lines.iter().map(|l| json!({
            "vatType": l.vat_type,
            "net_amount": l.net_amount,
            "department": "",
            "account": "",
        })).collect::<Vec<_>>(),
    });
    serde_json::to_string_pretty(&skeleton).unwrap_or_default()
}

/// Account/department assignment for fixed VAT lines, optionally guided by
/// an exemplar voucher with its known-correct assignment.
#[allow(clippy::too_many_arguments)]
pub fn classify(
    skeleton_json: &str,
    supplier_json: &str,
    accounts_json: &str,
    departments_json: &str,
    invoice_text: &str,
    exemplar: Option<&Exemplar>,
) -> String {
    let mut prompt = format!(
        r#"You are a Norwegian accountant following Norwegian accounting standards.
- I have an invoice and the VAT lines for that invoice. For each VAT line, pick the correct **account code** and **department**.
- Keep the VAT lines. They are correct.
- If there is supplier context, adhere to it.
- Always use double quotes - never single quotes.

### Supplier
{supplier_json}

### Chart of accounts
{accounts_json}

### Departments
{departments_json}

### Invoice text
{invoice_text}

### Return RAW JSON (no markdown, no backticks) ***exactly*** in this format:
{skeleton_json}"#
    );

    if let Some(ex) = exemplar {
        let question = json!({
            "vat_lines": ex.lines.iter().map(|l| json!({
                "vatType": l.vat_type,
                "net_amount": l.net_amount,
                "account": "",
                "department": "",
            })).collect::<Vec<_>>(),
        });
        let answer = json!({
            "vat_lines": ex.lines.iter().map(|l| json!({
                "vatType": l.vat_type,
                "net_amount": l.net_amount,
                "account": l.account,
                "department": l.department,
            })).collect::<Vec<_>>(),
        });
        let _ = write!(
            prompt,
            r#"

Below is an **old invoice** from the same supplier. Use it as an example.

### Old invoice text
{}

### VAT lines for the old invoice
{}

### Correct return value for the old invoice
{}"#,
            ex.text.as_deref().unwrap_or("N/A"),
            serde_json::to_string_pretty(&question).unwrap_or_default(),
            serde_json::to_string_pretty(&answer).unwrap_or_default(),
        );
    }

    prompt
}
