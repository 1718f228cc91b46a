//! CLI binary for voucherflow.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `PipelineConfig`, runs a batch, and prints results.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use voucherflow::stages::reconcile::{DiffStatus, ReconDiff};
use voucherflow::{
    extract_dir, reconcile, store, GeminiOracle, HttpOcrService, Invoice, LookupContext,
    PipelineConfig, PostingRow, SupplierStrategy,
};

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # OCR a directory of scanned invoices into plain text
  voucherflow ocr --endpoint https://ocr.example.com/v1/extract \
      --input scans/ --out invoices/

  # Process every invoice text in a directory
  voucherflow run --context context/ --input invoices/ --out out/

  # Restrict who counts as "us" during supplier matching
  voucherflow run --context context/ --input invoices/ --out out/ \
      --own-company "Nordlys Eiendom AS"

  # Step-by-step supplier resolution with logged reasoning
  voucherflow run --context context/ --input invoices/ --out out/ \
      --supplier-strategy chain-of-thought --verbose

  # Compare a finished run against the bookkeeping system's postings
  voucherflow reconcile --predicted out/postings.csv --actual actual.csv

CONTEXT DIRECTORY:
  suppliers.csv           supplier master (id, name, supplier_number, organization_number)
  accounts.csv            chart of accounts (number, account_id, description)
  departments.csv         departments (code, name)
  vat_codes.csv           VAT codes (code, description, rate)
  supplier_postings.csv   historical postings used for exemplars
  ocr/<voucher>.txt       optional invoice texts for exemplar vouchers

ENVIRONMENT VARIABLES:
  GEMINI_API_KEY    Google Gemini API key (required for `run`)
  GEMINI_MODEL      Override model ID (default: gemini-2.0-flash)
  OCR_API_KEY       Bearer token for the OCR service (`ocr` only)

SETUP:
  1. Set API key:   export GEMINI_API_KEY=...
  2. OCR scans:     voucherflow ocr --endpoint ... --input scans/ --out invoices/
  3. Run:           voucherflow run --context context/ --input invoices/ --out out/
"#;

/// Extract accounting postings from OCR'd supplier invoices.
#[derive(Parser, Debug)]
#[command(
    name = "voucherflow",
    version,
    about = "Extract accounting postings from OCR'd supplier invoices",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "VOUCHERFLOW_VERBOSE", global = true)]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "VOUCHERFLOW_QUIET", global = true)]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Extract text from scanned invoices into the layout `run` expects.
    Ocr(OcrArgs),
    /// Run the full pipeline over a directory of invoice texts.
    Run(RunArgs),
    /// Group and diff predicted postings against actual postings.
    Reconcile(ReconcileArgs),
}

#[derive(clap::Args, Debug)]
struct OcrArgs {
    /// OCR service endpoint URL.
    #[arg(long, env = "VOUCHERFLOW_OCR_ENDPOINT")]
    endpoint: String,

    /// Directory of scanned documents, one `<voucher>.pdf` per voucher.
    #[arg(long, env = "VOUCHERFLOW_INPUT")]
    input: PathBuf,

    /// Output directory for the extracted `<voucher>.txt` files.
    #[arg(long, env = "VOUCHERFLOW_OUT")]
    out: PathBuf,

    /// Bearer token for the OCR service.
    #[arg(long, env = "OCR_API_KEY")]
    api_key: Option<String>,

    /// Per-document OCR timeout in seconds.
    #[arg(long, default_value_t = 120)]
    timeout: u64,
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// Directory with the lookup CSVs (suppliers, accounts, departments,
    /// VAT codes, historical postings).
    #[arg(long, env = "VOUCHERFLOW_CONTEXT")]
    context: PathBuf,

    /// Directory of invoice texts, one `<voucher>.txt` per voucher.
    #[arg(long, env = "VOUCHERFLOW_INPUT")]
    input: PathBuf,

    /// Output directory for the stage tables.
    #[arg(long, env = "VOUCHERFLOW_OUT")]
    out: PathBuf,

    /// Company name(s) to ignore during supplier matching. Repeatable.
    #[arg(long = "own-company")]
    own_companies: Vec<String>,

    /// Supplier resolution strategy.
    #[arg(long, value_enum, default_value = "direct")]
    supplier_strategy: StrategyArg,

    /// Number of concurrent vouchers in flight.
    #[arg(short, long, env = "VOUCHERFLOW_CONCURRENCY", default_value_t = 4)]
    concurrency: usize,

    /// Classification ensemble size.
    #[arg(long, env = "VOUCHERFLOW_ENSEMBLE", default_value_t = 3)]
    ensemble: usize,

    /// Retries per oracle call on transient failure.
    #[arg(long, env = "VOUCHERFLOW_MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,

    /// Per-call oracle timeout in seconds.
    #[arg(long, env = "VOUCHERFLOW_API_TIMEOUT", default_value_t = 60)]
    api_timeout: u64,
}

#[derive(clap::Args, Debug)]
struct ReconcileArgs {
    /// Predicted postings CSV (a run's postings.csv).
    #[arg(long)]
    predicted: PathBuf,

    /// Actual postings CSV exported from the bookkeeping system.
    #[arg(long)]
    actual: PathBuf,

    /// Amount tolerance when classifying a group as matching.
    #[arg(long, default_value_t = 0.01)]
    tolerance: f64,
}

#[derive(clap::ValueEnum, Clone, Debug)]
enum StrategyArg {
    Direct,
    ChainOfThought,
}

impl From<StrategyArg> for SupplierStrategy {
    fn from(v: StrategyArg) -> Self {
        match v {
            StrategyArg::Direct => SupplierStrategy::Direct,
            StrategyArg::ChainOfThought => SupplierStrategy::ChainOfThought,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Suppress INFO-level library logs when the spinner is active; the
    // summary provides the feedback that matters.
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "error"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    match cli.command {
        Command::Ocr(args) => ocr(args, cli.quiet).await,
        Command::Run(args) => run(args, cli.quiet).await,
        Command::Reconcile(args) => reconcile_cmd(args, cli.quiet),
    }
}

async fn ocr(args: OcrArgs, quiet: bool) -> Result<()> {
    let service = HttpOcrService::new(&args.endpoint, args.api_key.clone(), args.timeout)
        .context("Failed to build the OCR client")?;
    let batch = extract_dir(&service, &args.input, &args.out)
        .await
        .context("OCR batch failed")?;

    if !quiet {
        eprintln!(
            "{} {} documents extracted  →  {}",
            if batch.errors.is_empty() { green("✔") } else { cyan("⚠") },
            bold(&batch.written.to_string()),
            bold(&args.out.display().to_string()),
        );
        for error in &batch.errors {
            eprintln!("  {} {}", red("✗"), error);
        }
    }
    Ok(())
}

async fn run(args: RunArgs, quiet: bool) -> Result<()> {
    let mut builder = PipelineConfig::builder()
        .concurrency(args.concurrency)
        .ensemble_attempts(args.ensemble)
        .max_retries(args.max_retries)
        .api_timeout_secs(args.api_timeout)
        .supplier_strategy(args.supplier_strategy.into());
    for name in &args.own_companies {
        builder = builder.own_company(name);
    }
    let config = builder.build().context("Invalid configuration")?;

    let ctx = LookupContext::from_csv_dir(&args.context)
        .with_context(|| format!("Failed to load lookup context from {:?}", args.context))?;
    let oracle = Arc::new(
        GeminiOracle::from_env(&config).context("Failed to configure the extraction oracle")?,
    );

    let invoices = load_invoices(&args.input)?;
    if invoices.is_empty() {
        anyhow::bail!("No .txt invoice files found in {:?}", args.input);
    }

    let spinner = if quiet {
        None
    } else {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        bar.set_prefix("Processing");
        bar.set_message(format!("{} vouchers", invoices.len()));
        bar.enable_steady_tick(Duration::from_millis(80));
        Some(bar)
    };

    let output = voucherflow::run_pipeline(&invoices, &ctx, oracle, &config)
        .await
        .context("Pipeline run failed")?;

    if let Some(bar) = spinner {
        bar.finish_and_clear();
    }

    store::write_run(&args.out, &output)
        .with_context(|| format!("Failed to write stage tables to {:?}", args.out))?;

    if !quiet {
        let stats = &output.stats;
        eprintln!(
            "{} {}/{} vouchers booked in {}ms  →  {}",
            if output.errors.is_empty() {
                green("✔")
            } else {
                cyan("⚠")
            },
            bold(&stats.classified.to_string()),
            stats.total_vouchers,
            stats.duration_ms,
            bold(&args.out.display().to_string()),
        );
        eprintln!(
            "   {} resolved  /  {} verified  /  {} with VAT lines  /  {} classified",
            dim(&stats.suppliers_resolved.to_string()),
            dim(&stats.verified_correct.to_string()),
            dim(&stats.vat_extracted.to_string()),
            dim(&stats.classified.to_string()),
        );
        for error in &output.errors {
            eprintln!("  {} {}", red("✗"), error);
        }
    }

    Ok(())
}

fn reconcile_cmd(args: ReconcileArgs, quiet: bool) -> Result<()> {
    let predicted: Vec<PostingRow> = store::read_table(&args.predicted)
        .with_context(|| format!("Failed to read predicted postings {:?}", args.predicted))?;
    let actual: Vec<PostingRow> = store::read_table(&args.actual)
        .with_context(|| format!("Failed to read actual postings {:?}", args.actual))?;

    let diffs = reconcile(&predicted, &actual).diff(args.tolerance);
    let matched = diffs.iter().filter(|d| d.status == DiffStatus::Match).count();

    for diff in &diffs {
        print_diff(diff);
    }

    if !quiet {
        eprintln!(
            "{} {}/{} groups match (tolerance {})",
            if matched == diffs.len() { green("✔") } else { cyan("⚠") },
            bold(&matched.to_string()),
            diffs.len(),
            args.tolerance,
        );
    }

    if matched < diffs.len() {
        std::process::exit(1);
    }
    Ok(())
}

fn print_diff(diff: &ReconDiff) {
    let (mark, detail) = match diff.status {
        DiffStatus::Match => (green("✓"), dim(&format!("{:.2}", diff.predicted_amount.unwrap_or(0.0)))),
        DiffStatus::AmountMismatch => (
            red("✗"),
            red(&format!(
                "predicted {:.2}, actual {:.2}",
                diff.predicted_amount.unwrap_or(0.0),
                diff.actual_amount.unwrap_or(0.0)
            )),
        ),
        DiffStatus::PredictedOnly => (
            red("✗"),
            red(&format!("only predicted ({:.2})", diff.predicted_amount.unwrap_or(0.0))),
        ),
        DiffStatus::ActualOnly => (
            red("✗"),
            red(&format!("only actual ({:.2})", diff.actual_amount.unwrap_or(0.0))),
        ),
    };
    println!(
        "{} {} account {} dept {} vat {}  {}",
        mark, diff.voucher, diff.account, diff.department, diff.vat_type, detail
    );
}

/// Read every `*.txt` file in `dir` as one invoice; the file stem is the
/// voucher id. Sorted for a stable processing order.
fn load_invoices(dir: &PathBuf) -> Result<Vec<Invoice>> {
    let mut invoices = Vec::new();
    let entries =
        std::fs::read_dir(dir).with_context(|| format!("Failed to read input dir {dir:?}"))?;
    for entry in entries {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("txt") {
            continue;
        }
        let Some(voucher) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read invoice text {path:?}"))?;
        invoices.push(Invoice::new(voucher, text));
    }
    invoices.sort_by(|a, b| a.voucher.cmp(&b.voucher));
    Ok(invoices)
}
