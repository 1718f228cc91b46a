//! The OCR front door: document bytes in, plain text out.
//!
//! Text extraction itself is an external collaborator; the pipeline only
//! specifies the interface. Callers submit at most the first
//! [`MAX_OCR_PAGES`] pages of the source document — page truncation happens
//! before the bytes reach this interface, since PDF manipulation stays
//! outside the pipeline. Documents longer than the cap are silently
//! truncated, not rejected.

use crate::error::{PipelineError, VoucherError};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Page cap for a single OCR submission.
pub const MAX_OCR_PAGES: usize = 15;

/// Failure of a single OCR request. Voucher-scoped, never batch-fatal.
#[derive(Debug, Clone, Error)]
pub enum OcrError {
    #[error("OCR service returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("OCR transport error: {0}")]
    Transport(String),

    #[error("OCR service returned no text")]
    EmptyText,
}

/// A service extracting plain text from a scanned document.
#[async_trait]
pub trait OcrService: Send + Sync {
    /// Extract text for the whole submitted range (at most the first
    /// [`MAX_OCR_PAGES`] pages of the source document).
    async fn extract_text(&self, document: &[u8]) -> Result<String, OcrError>;
}

#[derive(Deserialize)]
struct OcrResponse {
    text: String,
}

/// HTTP client for a hosted OCR processor: POSTs the raw document bytes
/// and expects `{"text": "..."}` back.
pub struct HttpOcrService {
    http: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpOcrService {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: Option<String>,
        timeout_secs: u64,
    ) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self {
            http,
            endpoint: endpoint.into(),
            api_key,
        })
    }
}

#[async_trait]
impl OcrService for HttpOcrService {
    async fn extract_text(&self, document: &[u8]) -> Result<String, OcrError> {
        let mut request = self
            .http
            .post(&self.endpoint)
            .header("content-type", "application/pdf")
            .body(document.to_vec());
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| OcrError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OcrError::Http {
                status: status.as_u16(),
                body: body.chars().take(300).collect(),
            });
        }

        let parsed: OcrResponse = response
            .json()
            .await
            .map_err(|e| OcrError::Transport(format!("decoding OCR response: {e}")))?;

        if parsed.text.trim().is_empty() {
            return Err(OcrError::EmptyText);
        }
        Ok(parsed.text)
    }
}

/// What a directory-level OCR pass produced.
#[derive(Debug, Default)]
pub struct OcrBatch {
    /// Text files written.
    pub written: usize,
    /// Per-document failures; the batch continues past them.
    pub errors: Vec<VoucherError>,
}

/// Extract text for every `<voucher>.pdf` in `input`, writing one
/// `<voucher>.txt` per document into `out` — the layout the pipeline's
/// invoice loader expects.
///
/// A document the service cannot read is recorded as
/// [`VoucherError::OcrFailed`] and skipped; only filesystem problems are
/// fatal. Documents are processed in filename order.
pub async fn extract_dir(
    service: &dyn OcrService,
    input: &Path,
    out: &Path,
) -> Result<OcrBatch, PipelineError> {
    std::fs::create_dir_all(out).map_err(|source| PipelineError::OutputDirFailed {
        path: out.to_path_buf(),
        source,
    })?;

    let mut documents: Vec<_> = std::fs::read_dir(input)
        .map_err(|e| PipelineError::Internal(format!("reading {}: {e}", input.display())))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().and_then(|e| e.to_str()) == Some("pdf"))
        .collect();
    documents.sort();

    let mut batch = OcrBatch::default();
    for path in documents {
        let Some(voucher) = path.file_stem().and_then(|s| s.to_str()).map(str::to_owned) else {
            continue;
        };
        let document = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(voucher = %voucher, error = %e, "document unreadable, skipped");
                batch.errors.push(VoucherError::OcrFailed {
                    voucher,
                    detail: e.to_string(),
                });
                continue;
            }
        };
        match service.extract_text(&document).await {
            Ok(text) => {
                let target = out.join(format!("{voucher}.txt"));
                tokio::fs::write(&target, text).await.map_err(|e| {
                    PipelineError::Internal(format!("writing {}: {e}", target.display()))
                })?;
                batch.written += 1;
            }
            Err(e) => {
                warn!(voucher = %voucher, error = %e, "OCR failed, document skipped");
                batch.errors.push(VoucherError::OcrFailed {
                    voucher,
                    detail: e.to_string(),
                });
            }
        }
    }

    info!(written = batch.written, failed = batch.errors.len(), "OCR batch complete");
    Ok(batch)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Echoes a marker per document; refuses documents marked unreadable.
    struct Canned;

    #[async_trait]
    impl OcrService for Canned {
        async fn extract_text(&self, document: &[u8]) -> Result<String, OcrError> {
            if document == b"unreadable" {
                Err(OcrError::EmptyText)
            } else {
                Ok(format!("extracted {} bytes", document.len()))
            }
        }
    }

    #[tokio::test]
    async fn batch_writes_one_text_file_per_document() {
        let input = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        std::fs::write(input.path().join("F-1042.pdf"), b"%PDF-1.7 aa").unwrap();
        std::fs::write(input.path().join("F-1043.pdf"), b"%PDF-1.7 b").unwrap();
        std::fs::write(input.path().join("notes.txt"), b"not a document").unwrap();

        let batch = extract_dir(&Canned, input.path(), out.path()).await.unwrap();

        assert_eq!(batch.written, 2);
        assert!(batch.errors.is_empty());
        let text = std::fs::read_to_string(out.path().join("F-1042.txt")).unwrap();
        assert_eq!(text, "extracted 11 bytes");
        assert!(out.path().join("F-1043.txt").exists());
        // Non-PDF entries are not submitted.
        assert!(!out.path().join("notes.txt").exists());
    }

    #[tokio::test]
    async fn unreadable_document_is_recorded_and_skipped() {
        let input = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        std::fs::write(input.path().join("F-1.pdf"), b"unreadable").unwrap();
        std::fs::write(input.path().join("F-2.pdf"), b"fine").unwrap();

        let batch = extract_dir(&Canned, input.path(), out.path()).await.unwrap();

        assert_eq!(batch.written, 1);
        assert_eq!(batch.errors.len(), 1);
        match &batch.errors[0] {
            VoucherError::OcrFailed { voucher, .. } => assert_eq!(voucher, "F-1"),
            other => panic!("expected OcrFailed, got {other:?}"),
        }
        assert!(!out.path().join("F-1.txt").exists());
        assert!(out.path().join("F-2.txt").exists());
    }
}
