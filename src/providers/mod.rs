//! Provider Clients (§4.4): thin typed wrappers over each LLM endpoint.
//!
//! Grounded in `ocr/gemini.rs`'s request/response shape (inline-data vision
//! calls against a `generateContent`-style endpoint) and `ocr/backend.rs`'s
//! trait-based backend abstraction, generalized to the spec's two provider
//! shapes: an image-prompt (vision-only) client and a file-prompt (file-API
//! capable) client, both exposing a common `boost` call.

pub mod file_api;
pub mod processor;
pub mod stages;
pub mod vision;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;

/// Call options threaded through every provider request (§6 Configuration:
/// model name, temperature, max-output-tokens are the only recognized
/// per-call knobs).
#[derive(Debug, Clone)]
pub struct CallOptions {
    pub model: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
}

/// A reference to an uploaded file plus its last observed readiness state
/// (§4.4 file-prompt client state machine: `PROCESSING -> ACTIVE`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRef {
    pub file_id: String,
    pub state: FileState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FileState {
    Processing,
    Active,
    Failed,
}

/// Outcome of `await_ready` (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    Failed,
    TimedOut,
}

/// Common contract every provider exposes (§4.4: "Both clients also expose
/// `boost(text, prompt, opts)`").
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;
    async fn boost(&self, text: &str, prompt: &str, opts: &CallOptions) -> Result<String, ProviderError>;
}

/// The image-prompt client (§4.4, used by the index pipeline).
#[async_trait]
pub trait VisionProvider: Provider {
    async fn extract_image(
        &self,
        base64_image: &str,
        mime: &str,
        prompt: &str,
        opts: &CallOptions,
    ) -> Result<String, ProviderError>;
}

/// The file-prompt client (§4.4, used by the acte pipeline). Only the
/// primary provider is required to implement this (§6: "Fallback LLM
/// provider... same contract minus file API").
#[async_trait]
pub trait FileApiProvider: Provider {
    async fn upload(&self, pdf_bytes: &[u8]) -> Result<FileRef, ProviderError>;
    async fn poll_state(&self, file_ref: &FileRef) -> Result<FileState, ProviderError>;
    async fn extract_file(&self, file_ref: &FileRef, prompt: &str, opts: &CallOptions) -> Result<String, ProviderError>;
    async fn delete_file(&self, file_ref: &FileRef) -> Result<(), ProviderError>;

    /// §4.4: poll `await_ready` with a bounded deadline.
    async fn await_ready(&self, file_ref: &FileRef, timeout: std::time::Duration) -> Result<Readiness, ProviderError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.poll_state(file_ref).await? {
                FileState::Active => return Ok(Readiness::Ready),
                FileState::Failed => return Ok(Readiness::Failed),
                FileState::Processing => {}
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(Readiness::TimedOut);
            }
            tokio::time::sleep(std::time::Duration::from_secs(2)).await;
        }
    }
}

/// Exponential backoff with jitter (§4.5: "retry with exponential backoff +
/// jitter"), the same shape as the teacher's `rate_limit::backoff_delay`
/// with a jitter term added since the spec calls it out explicitly.
pub fn backoff_with_jitter(attempt: u32, base_ms: u64) -> std::time::Duration {
    let delay_ms = base_ms.saturating_mul(2u64.saturating_pow(attempt)).min(30_000);
    let jitter_ms = (std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0)
        % 250) as u64;
    std::time::Duration::from_millis(delay_ms + jitter_ms)
}

/// Classify an HTTP status code into the §7 error taxonomy.
pub fn classify_status(status: u16, retry_after_secs: Option<u64>) -> ProviderError {
    match status {
        429 => ProviderError::RateLimited { retry_after_secs },
        503 => ProviderError::Overloaded,
        500..=599 => ProviderError::Transient(format!("server error {status}")),
        400..=499 => ProviderError::BadRequest(format!("client error {status}")),
        _ => ProviderError::Transient(format!("unexpected status {status}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_status_maps_taxonomy_correctly() {
        assert!(matches!(classify_status(429, Some(5)), ProviderError::RateLimited { .. }));
        assert!(matches!(classify_status(503, None), ProviderError::Overloaded));
        assert!(matches!(classify_status(500, None), ProviderError::Transient(_)));
        assert!(matches!(classify_status(404, None), ProviderError::BadRequest(_)));
    }

    #[test]
    fn backoff_grows_exponentially_with_jitter() {
        let d0 = backoff_with_jitter(0, 1000);
        let d3 = backoff_with_jitter(3, 1000);
        assert!(d3.as_millis() >= d0.as_millis() * 4);
    }
}
