//! The extraction oracle: the fallible black box that turns an instruction
//! plus context into (hopefully) structured JSON.
//!
//! The pipeline never reimplements natural-language extraction; it drives
//! the oracle through [`ExtractionOracle`] and treats every response as
//! untrusted input to be coerced by [`crate::parse`]. Keeping the trait
//! this thin makes the whole pipeline testable against scripted mocks.
//!
//! ## Retry Strategy
//!
//! HTTP 429 / 5xx errors from hosted model APIs are transient and frequent
//! under concurrent load. [`generate_with_retry`] applies exponential
//! backoff (`retry_backoff_ms * 2^attempt`): with the 500 ms default and
//! 3 retries the wait sequence is 500 ms → 1 s → 2 s. A response that
//! arrives but fails to *parse* is not retried here — parse failures are a
//! per-voucher outcome handled by each stage.

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

/// Transport-level failure of a single oracle call.
#[derive(Debug, Clone, Error)]
pub enum OracleError {
    /// The API returned a non-success HTTP status.
    #[error("oracle API returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// The request could not be sent or the response not read.
    #[error("oracle transport error: {0}")]
    Transport(String),

    /// The call exceeded the configured timeout.
    #[error("oracle call timed out after {secs}s")]
    Timeout { secs: u64 },

    /// The API answered but produced no candidate text at all.
    #[error("oracle returned no candidates")]
    NoCandidates,
}

impl OracleError {
    /// Whether a retry could plausibly succeed.
    fn is_transient(&self) -> bool {
        match self {
            OracleError::Http { status, .. } => *status == 429 || *status >= 500,
            OracleError::Transport(_) | OracleError::Timeout { .. } => true,
            OracleError::NoCandidates => false,
        }
    }
}

/// A fallible service turning prompt text into best-effort response text.
///
/// Implementations must be safe to share across concurrently processed
/// vouchers (`Send + Sync`); the pipeline holds one `Arc<dyn
/// ExtractionOracle>` per run.
#[async_trait]
pub trait ExtractionOracle: Send + Sync {
    /// One generation call at the given sampling temperature.
    async fn generate(&self, prompt: &str, temperature: f32) -> Result<String, OracleError>;
}

/// Drive one oracle call with transport retries and exponential backoff.
pub async fn generate_with_retry(
    oracle: &Arc<dyn ExtractionOracle>,
    prompt: &str,
    temperature: f32,
    config: &PipelineConfig,
) -> Result<String, OracleError> {
    let mut last_err = OracleError::NoCandidates;

    for attempt in 0..=config.max_retries {
        if attempt > 0 {
            let backoff = config.retry_backoff_ms * 2u64.pow(attempt - 1);
            warn!(attempt, max = config.max_retries, backoff_ms = backoff, "oracle retry");
            sleep(Duration::from_millis(backoff)).await;
        }

        match oracle.generate(prompt, temperature).await {
            Ok(text) => {
                debug!(attempt, response_len = text.len(), "oracle responded");
                return Ok(text);
            }
            Err(e) => {
                let transient = e.is_transient();
                warn!(attempt, error = %e, transient, "oracle call failed");
                last_err = e;
                if !transient {
                    break;
                }
            }
        }
    }

    Err(last_err)
}

/// HTTP client for a Gemini-style `generateContent` endpoint.
///
/// The request carries the whole prompt as a single user part; the response
/// text is the concatenation of the first candidate's parts. An empty
/// candidate list maps to [`OracleError::NoCandidates`].
pub struct GeminiOracle {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    timeout_secs: u64,
}

impl GeminiOracle {
    /// Default endpoint for the given model id.
    pub fn endpoint_for(model: &str) -> String {
        format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{model}:generateContent"
        )
    }

    pub fn new(
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        config: &PipelineConfig,
    ) -> Result<Self, PipelineError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.api_timeout_secs))
            .build()
            .map_err(|e| PipelineError::Internal(format!("building HTTP client: {e}")))?;
        Ok(Self {
            http,
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            timeout_secs: config.api_timeout_secs,
        })
    }

    /// Construct from `GEMINI_API_KEY` (and optional `GEMINI_MODEL`).
    pub fn from_env(config: &PipelineConfig) -> Result<Self, PipelineError> {
        let api_key = std::env::var("GEMINI_API_KEY")
            .ok()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| PipelineError::OracleNotConfigured {
                hint: "Set GEMINI_API_KEY, or construct the oracle explicitly.".into(),
            })?;
        let model =
            std::env::var("GEMINI_MODEL").unwrap_or_else(|_| "gemini-2.0-flash".to_string());
        Self::new(Self::endpoint_for(&model), api_key, config)
    }

    fn candidate_text(body: &Value) -> Option<String> {
        let parts = body
            .get("candidates")?
            .as_array()?
            .first()?
            .get("content")?
            .get("parts")?
            .as_array()?;
        let text: String = parts
            .iter()
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .collect();
        if text.is_empty() {
            None
        } else {
            Some(text)
        }
    }
}

#[async_trait]
impl ExtractionOracle for GeminiOracle {
    async fn generate(&self, prompt: &str, temperature: f32) -> Result<String, OracleError> {
        let request = json!({
            "contents": [{"parts": [{"text": prompt}]}],
            "generationConfig": {"temperature": temperature},
        });

        let response = self
            .http
            .post(&self.endpoint)
            .query(&[("key", self.api_key.as_str())])
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    OracleError::Timeout {
                        secs: self.timeout_secs,
                    }
                } else {
                    OracleError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OracleError::Http {
                status: status.as_u16(),
                body: truncate(&body, 300),
            });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| OracleError::Transport(format!("decoding response body: {e}")))?;

        Self::candidate_text(&body).ok_or(OracleError::NoCandidates)
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &s[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyOracle {
        calls: AtomicU32,
        fail_first: u32,
    }

    #[async_trait]
    impl ExtractionOracle for FlakyOracle {
        async fn generate(&self, _prompt: &str, _t: f32) -> Result<String, OracleError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                Err(OracleError::Http {
                    status: 503,
                    body: "overloaded".into(),
                })
            } else {
                Ok("{}".to_string())
            }
        }
    }

    fn fast_config() -> PipelineConfig {
        PipelineConfig::builder()
            .max_retries(3)
            .retry_backoff_ms(1)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn retry_recovers_from_transient_errors() {
        let oracle: Arc<dyn ExtractionOracle> = Arc::new(FlakyOracle {
            calls: AtomicU32::new(0),
            fail_first: 2,
        });
        let out = generate_with_retry(&oracle, "p", 0.5, &fast_config()).await;
        assert_eq!(out.unwrap(), "{}");
    }

    #[tokio::test]
    async fn retry_gives_up_after_budget() {
        let oracle: Arc<dyn ExtractionOracle> = Arc::new(FlakyOracle {
            calls: AtomicU32::new(0),
            fail_first: 10,
        });
        let out = generate_with_retry(&oracle, "p", 0.5, &fast_config()).await;
        assert!(out.is_err());
    }

    #[tokio::test]
    async fn no_candidates_is_not_retried() {
        struct Empty;
        #[async_trait]
        impl ExtractionOracle for Empty {
            async fn generate(&self, _p: &str, _t: f32) -> Result<String, OracleError> {
                Err(OracleError::NoCandidates)
            }
        }
        let oracle: Arc<dyn ExtractionOracle> = Arc::new(Empty);
        let out = generate_with_retry(&oracle, "p", 0.5, &fast_config()).await;
        assert!(matches!(out, Err(OracleError::NoCandidates)));
    }

    #[test]
    fn candidate_text_concatenates_parts() {
        let body = json!({
            "candidates": [{"content": {"parts": [
                {"text": "{\"a\":"}, {"text": " 1}"}
            ]}}]
        });
        assert_eq!(GeminiOracle::candidate_text(&body).unwrap(), "{\"a\": 1}");
    }

    #[test]
    fn candidate_text_empty_body() {
        assert!(GeminiOracle::candidate_text(&json!({"candidates": []})).is_none());
    }
}
