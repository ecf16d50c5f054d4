//! File-prompt provider client (§4.4): upload a whole PDF, poll readiness,
//! then generate against the file reference. Modeled on the same
//! `generateContent`-style endpoint as [`super::vision`] with a Files API
//! front end, since the primary provider exposes both under one account
//! (§6: "The file-API endpoint must expose upload, status polling, content
//! generation with a file reference, and delete").

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::ProviderConfig;
use crate::error::ProviderError;

use super::{classify_status, CallOptions, FileRef, FileState, Provider};

pub struct HttpFileApiClient {
    name: String,
    http: reqwest::Client,
    config: ProviderConfig,
}

impl HttpFileApiClient {
    pub fn new(name: impl Into<String>, config: ProviderConfig, timeout: std::time::Duration) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::Transient(format!("building http client: {e}")))?;
        Ok(Self { name: name.into(), http, config })
    }

    fn files_endpoint(&self) -> String {
        format!("{}/v1beta/files?key={}", self.config.base_url, self.config.api_key)
    }

    fn file_endpoint(&self, file_id: &str) -> String {
        format!("{}/v1beta/{file_id}?key={}", self.config.base_url, self.config.api_key)
    }

    fn generate_endpoint(&self) -> String {
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
            .post(self.generate_endpoint())
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Transient(e.to_string()))?;

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
impl Provider for HttpFileApiClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn boost(&self, text: &str, prompt: &str, opts: &CallOptions) -> Result<String, ProviderError> {
        let combined = format!("{prompt}\n\n{text}");
        self.generate(vec![GenPart::Text { text: combined }], opts).await
    }
}

#[async_trait]
impl super::FileApiProvider for HttpFileApiClient {
    async fn upload(&self, pdf_bytes: &[u8]) -> Result<FileRef, ProviderError> {
        let part = reqwest::multipart::Part::bytes(pdf_bytes.to_vec())
            .mime_str("application/pdf")
            .map_err(|e| ProviderError::BadRequest(e.to_string()))?;
        let form = reqwest::multipart::Form::new().part("file", part);

        let response = self
            .http
            .post(self.files_endpoint())
            .multipart(form)
            .send()
            .await
            .map_err(|e| ProviderError::Transient(e.to_string()))?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            return Err(classify_status(status, None));
        }

        let parsed: UploadResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Transient(format!("parsing upload response: {e}")))?;

        Ok(FileRef { file_id: parsed.file.name, state: parse_file_state(&parsed.file.state) })
    }

    async fn poll_state(&self, file_ref: &FileRef) -> Result<FileState, ProviderError> {
        let response = self
            .http
            .get(self.file_endpoint(&file_ref.file_id))
            .send()
            .await
            .map_err(|e| ProviderError::Transient(e.to_string()))?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            return Err(classify_status(status, None));
        }

        let parsed: FileStatus = response
            .json()
            .await
            .map_err(|e| ProviderError::Transient(format!("parsing file status: {e}")))?;
        Ok(parse_file_state(&parsed.state))
    }

    async fn extract_file(&self, file_ref: &FileRef, prompt: &str, opts: &CallOptions) -> Result<String, ProviderError> {
        self.generate(
            vec![
                GenPart::Text { text: prompt.to_string() },
                GenPart::FileData { file_data: FileDataRef { mime_type: "application/pdf".to_string(), file_uri: file_ref.file_id.clone() } },
            ],
            opts,
        )
        .await
    }

    async fn delete_file(&self, file_ref: &FileRef) -> Result<(), ProviderError> {
        let response = self
            .http
            .delete(self.file_endpoint(&file_ref.file_id))
            .send()
            .await
            .map_err(|e| ProviderError::Transient(e.to_string()))?;
        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            return Err(classify_status(status, None));
        }
        Ok(())
    }
}

fn parse_file_state(s: &str) -> FileState {
    match s.to_uppercase().as_str() {
        "ACTIVE" => FileState::Active,
        "FAILED" => FileState::Failed,
        _ => FileState::Processing,
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
    FileData { file_data: FileDataRef },
}

#[derive(Debug, Serialize)]
struct FileDataRef {
    mime_type: String,
    file_uri: String,
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

#[derive(Debug, Deserialize)]
struct UploadResponse {
    file: FileStatus,
}

#[derive(Debug, Deserialize)]
struct FileStatus {
    name: String,
    state: String,
}
