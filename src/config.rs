//! Configuration for a pipeline run.
//!
//! All run behaviour is controlled through [`PipelineConfig`], built via its
//! [`PipelineConfigBuilder`]. Keeping every knob in one struct makes it
//! trivial to share configs across vouchers processed concurrently, serialise
//! them for logging, and diff two runs to understand why their outputs differ.
//!
//! The config is built once per run, never mutated, and passed by reference
//! into every stage.

use crate::error::PipelineError;
use serde::{Deserialize, Serialize};

/// How the supplier resolver phrases its oracle request.
///
/// Both strategies honour the same contract (strict, uniqueness-checked
/// match); the chain-of-thought variant additionally returns a free-text
/// `reasoning` field that is logged for diagnostics and never used
/// downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupplierStrategy {
    /// Single direct answer. (default)
    #[default]
    Direct,
    /// Step-by-step justified answer with a diagnostic `reasoning` field.
    ChainOfThought,
}

/// Configuration for a voucher pipeline run.
///
/// Built via [`PipelineConfig::builder()`] or [`PipelineConfig::default()`].
///
/// # Example
/// ```rust
/// use voucherflow::PipelineConfig;
///
/// let config = PipelineConfig::builder()
///     .ensemble_attempts(5)
///     .concurrency(8)
///     .own_company("Acme AS")
///     .build()
///     .unwrap();
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Number of independent oracle runs per voucher in the ensemble
    /// classifier. Default: 3.
    ///
    /// The consensus reducer requires unanimity across all attempts, so
    /// raising this trades recall (more disagreement, more empty fields)
    /// for precision.
    pub ensemble_attempts: usize,

    /// Number of vouchers processed concurrently. Default: 4.
    ///
    /// Vouchers share no mutable state, so results are identical at any
    /// concurrency level; this only bounds in-flight oracle calls.
    pub concurrency: usize,

    /// Sampling temperature for the supplier resolver. Default: 0.5.
    ///
    /// Supplier matching is a lookup task; moderate temperature keeps the
    /// oracle from fixating on a near-miss while staying mostly literal.
    pub supplier_temperature: f32,

    /// Sampling temperature for the VAT-line extractor. Default: 1.0.
    pub vat_temperature: f32,

    /// Sampling temperature for the ensemble classifier. Default: 1.0.
    ///
    /// Deliberately high: the ensemble's value comes from the N runs being
    /// genuinely independent samples, and unanimity filters the noise.
    pub classify_temperature: f32,

    /// Sampling temperature for the correctness gate. Default: 1.0.
    pub verify_temperature: f32,

    /// Maximum absolute difference tolerated between the declared gross
    /// payable amount and the gross re-derived from net VAT lines.
    /// Default: 0.01.
    pub balance_tolerance: f64,

    /// Bounded re-extraction attempts when the balance check fails.
    /// Default: 2.
    ///
    /// After the last attempt the lines are emitted anyway with a logged
    /// mismatch; reconciliation surfaces the discrepancy downstream.
    pub balance_retries: u32,

    /// Lines from the top of the invoice treated as the header by the
    /// correctness gate. Default: 10.
    pub header_lines: usize,

    /// Lines from the bottom of the invoice treated as the footer by the
    /// correctness gate. Default: 10.
    pub footer_lines: usize,

    /// Maximum transport retries per oracle call. Default: 3.
    ///
    /// Covers transient HTTP failures (429/5xx, timeouts). A response that
    /// arrives but fails to parse is *not* retried here; parse failures are
    /// a per-voucher outcome, not a transport problem.
    pub max_retries: u32,

    /// Initial retry delay in milliseconds (exponential backoff).
    /// Default: 500.
    ///
    /// Doubles after each attempt: 500 ms → 1 s → 2 s.
    pub retry_backoff_ms: u64,

    /// Per-oracle-call timeout in seconds. Default: 60.
    pub api_timeout_secs: u64,

    /// Names identifying the invoice recipient (our own company).
    ///
    /// The issuer's own identity must never be a supplier candidate; these
    /// names are excluded in the resolver prompt.
    pub own_company_names: Vec<String>,

    /// Prompting strategy for the supplier resolver. Default: Direct.
    pub supplier_strategy: SupplierStrategy,

    /// VAT type assigned to food items on cross-border (import) invoices.
    /// Default: "22".
    pub import_food_vat: String,

    /// VAT type assigned to non-food items on cross-border (import)
    /// invoices. Default: "21".
    pub import_nonfood_vat: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            ensemble_attempts: 3,
            concurrency: 4,
            supplier_temperature: 0.5,
            vat_temperature: 1.0,
            classify_temperature: 1.0,
            verify_temperature: 1.0,
            balance_tolerance: 0.01,
            balance_retries: 2,
            header_lines: 10,
            footer_lines: 10,
            max_retries: 3,
            retry_backoff_ms: 500,
            api_timeout_secs: 60,
            own_company_names: Vec::new(),
            supplier_strategy: SupplierStrategy::default(),
            import_food_vat: "22".to_string(),
            import_nonfood_vat: "21".to_string(),
        }
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn ensemble_attempts(mut self, n: usize) -> Self {
        self.config.ensemble_attempts = n.max(1);
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.max(1);
        self
    }

    pub fn supplier_temperature(mut self, t: f32) -> Self {
        self.config.supplier_temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn vat_temperature(mut self, t: f32) -> Self {
        self.config.vat_temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn classify_temperature(mut self, t: f32) -> Self {
        self.config.classify_temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn verify_temperature(mut self, t: f32) -> Self {
        self.config.verify_temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn balance_tolerance(mut self, tol: f64) -> Self {
        self.config.balance_tolerance = tol;
        self
    }

    pub fn balance_retries(mut self, n: u32) -> Self {
        self.config.balance_retries = n;
        self
    }

    pub fn header_lines(mut self, n: usize) -> Self {
        self.config.header_lines = n;
        self
    }

    pub fn footer_lines(mut self, n: usize) -> Self {
        self.config.footer_lines = n;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
        self
    }

    /// Add one name identifying our own company (may be called repeatedly).
    pub fn own_company(mut self, name: impl Into<String>) -> Self {
        self.config.own_company_names.push(name.into());
        self
    }

    pub fn supplier_strategy(mut self, s: SupplierStrategy) -> Self {
        self.config.supplier_strategy = s;
        self
    }

    pub fn import_food_vat(mut self, code: impl Into<String>) -> Self {
        self.config.import_food_vat = code.into();
        self
    }

    pub fn import_nonfood_vat(mut self, code: impl Into<String>) -> Self {
        self.config.import_nonfood_vat = code.into();
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, PipelineError> {
        let c = &self.config;
        if c.ensemble_attempts == 0 {
            return Err(PipelineError::InvalidConfig(
                "ensemble_attempts must be ≥ 1".into(),
            ));
        }
        if c.concurrency == 0 {
            return Err(PipelineError::InvalidConfig("concurrency must be ≥ 1".into()));
        }
        if !c.balance_tolerance.is_finite() || c.balance_tolerance < 0.0 {
            return Err(PipelineError::InvalidConfig(format!(
                "balance_tolerance must be a non-negative number, got {}",
                c.balance_tolerance
            )));
        }
        if c.import_food_vat == c.import_nonfood_vat {
            return Err(PipelineError::InvalidConfig(
                "import food and non-food VAT types must differ".into(),
            ));
        }
        Ok(self.config)
    }
}
