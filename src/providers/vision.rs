//! Image-prompt provider client (§4.4), grounded directly in
//! `ocr/gemini.rs`'s request/response shapes — inline base64 image data
//! alongside a text prompt, posted to a `generateContent`-style endpoint.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::ProviderConfig;
use crate::error::ProviderError;

use super::{classify_status, CallOptions, Provider, VisionProvider};

pub struct HttpVisionClient {
    name: String,
    http: reqwest::Client,
    config: ProviderConfig,
}

impl HttpVisionClient {
    pub fn new(name: impl Into<String>, config: ProviderConfig, timeout: std::time::Duration) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::Transient(format!("building http client: {e}")))?;
        Ok(Self { name: name.into(), http, config })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent?key={}",
            self.config.base_url, self.config.model_name, self.config.api_key
        )
    }

    async fn generate(&self, parts: Vec<GenPart>, opts: &CallOptions) -> Result<String, ProviderError> {
        let body = GenerateRequest {
            contents: vec![GenContent { parts }],
            generation_config: GenerationConfig {
                temperature: opts.temperature,
                max_output_tokens: opts.max_output_tokens,
            },
        };

        let response = self
            .http
            .post(self.endpoint())
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Transient(format!("timeout: {e}"))
                } else {
                    ProviderError::Transient(e.to_string())
                }
            })?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok());
            return Err(classify_status(status, retry_after));
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Transient(format!("parsing response: {e}")))?;

        parsed
            .candidates
            .into_iter()
            .flatten()
            .next()
            .and_then(|c| c.content.parts.into_iter().next())
            .and_then(|p| p.text)
            .ok_or_else(|| ProviderError::BadRequest("provider returned no candidates".to_string()))
    }
}

#[async_trait]
impl Provider for HttpVisionClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn boost(&self, text: &str, prompt: &str, opts: &CallOptions) -> Result<String, ProviderError> {
        let combined = format!("{prompt}\n\n{text}");
        self.generate(vec![GenPart::Text { text: combined }], opts).await
    }
}

#[async_trait]
impl VisionProvider for HttpVisionClient {
    async fn extract_image(&self, base64_image: &str, mime: &str, prompt: &str, opts: &CallOptions) -> Result<String, ProviderError> {
        self.generate(
            vec![
                GenPart::Text { text: prompt.to_string() },
                GenPart::InlineData { inline_data: InlineData { mime_type: mime.to_string(), data: base64_image.to_string() } },
            ],
            opts,
        )
        .await
    }
}

#[derive(Debug, Serialize)]
struct GenerateRequest {
    contents: Vec<GenContent>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct GenContent {
    parts: Vec<GenPart>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum GenPart {
    Text { text: String },
    InlineData { inline_data: InlineData },
}

#[derive(Debug, Serialize)]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
struct GenerationConfig {
    temperature: f32,
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    candidates: Option<Vec<GenCandidate>>,
}

#[derive(Debug, Deserialize)]
struct GenCandidate {
    content: GenResponseContent,
}

#[derive(Debug, Deserialize)]
struct GenResponseContent {
    parts: Vec<GenResponsePart>,
}

#[derive(Debug, Deserialize)]
struct GenResponsePart {
    text: Option<String>,
}
