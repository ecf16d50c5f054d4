//! Acte Pipeline (§4.7): PDF -> file-API upload -> extract (with
//! continuation) -> boost (with continuation); no sanitize pass, raw and
//! boosted text are both persisted verbatim. The uploaded file is always
//! deleted on the way out, success or failure (§4.7 step 6).

use std::sync::Arc;
use std::time::Duration;

use crate::error::PipelineError;
use crate::models::Job;
use crate::providers::processor::{run_stage, NamedStage, StageBudgets, BOOST_SENTINEL, EXTRACTION_SENTINEL};
use crate::providers::stages::{BoostStage, FileExtractStage};
use crate::providers::{CallOptions, FileApiProvider, FileRef, Provider, Readiness};
use crate::rate_limit::RateBudget;
use crate::storage::ObjectStorage;

use super::estimate_tokens;

#[derive(Clone)]
pub struct ActeProviderHandle {
    pub name: String,
    pub client: Arc<dyn FileApiProvider>,
    pub opts: CallOptions,
}

#[derive(Clone)]
pub struct TextProviderHandle {
    pub name: String,
    pub client: Arc<dyn Provider>,
    pub opts: CallOptions,
}

pub struct ActePrompts {
    pub extract: String,
    pub extract_continuation: String,
    pub boost: String,
    pub boost_continuation: String,
}

pub struct ActeOutput {
    pub raw_text: String,
    pub boosted_text: String,
}

pub struct ActePipeline {
    storage: Arc<dyn ObjectStorage>,
    /// §4.4: only the primary is required to support the file API; the
    /// first entry here is always the one uploaded to.
    file_providers: Vec<ActeProviderHandle>,
    boost_providers: Vec<TextProviderHandle>,
    readiness_timeout: Duration,
    /// §6: extract and boost attempt budgets are independently configurable
    /// knobs (`extraction_attempt_budget`/`boost_attempt_budget`); only the
    /// continuation budget is shared between the two stages.
    extract_budgets: StageBudgets,
    boost_budgets: StageBudgets,
    prompts: ActePrompts,
    rate_budget: RateBudget,
}

impl ActePipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        storage: Arc<dyn ObjectStorage>,
        file_providers: Vec<ActeProviderHandle>,
        boost_providers: Vec<TextProviderHandle>,
        readiness_timeout: Duration,
        extract_budgets: StageBudgets,
        boost_budgets: StageBudgets,
        prompts: ActePrompts,
        rate_budget: RateBudget,
    ) -> Self {
        Self { storage, file_providers, boost_providers, readiness_timeout, extract_budgets, boost_budgets, prompts, rate_budget }
    }

    /// The provider `claim_next` checks against before committing to a job
    /// (§4.9 step 5): the file-api provider `run` always uploads to first.
    pub fn primary_provider_name(&self) -> Option<&str> {
        self.file_providers.first().map(|p| p.name.as_str())
    }

    fn boost_stages(&self, text: &str) -> Vec<NamedStage> {
        self.boost_providers
            .iter()
            .map(|p| NamedStage {
                provider_name: p.name.clone(),
                call: Box::new(BoostStage {
                    provider: p.client.clone(),
                    text: text.to_string(),
                    prompt: self.prompts.boost.clone(),
                    continuation_prompt: self.prompts.boost_continuation.clone(),
                    opts: p.opts.clone(),
                }),
            })
            .collect()
    }

    pub async fn run(&self, job: &Job) -> Result<ActeOutput, PipelineError> {
        let storage_path = job
            .storage_path
            .as_deref()
            .ok_or_else(|| PipelineError::Storage("job has no storage_path".to_string()))?;
        let pdf_bytes = self.storage.download(storage_path).await?;

        let primary = self
            .file_providers
            .first()
            .ok_or_else(|| PipelineError::Storage("no file-api provider configured".to_string()))?;

        let file_ref = primary
            .client
            .upload(&pdf_bytes)
            .await
            .map_err(|e| PipelineError::BothProvidersFailed(e.to_string()))?;

        let extract_estimate = estimate_tokens(pdf_bytes.len());
        let result = self.extract_and_boost(job, primary, &file_ref, extract_estimate).await;

        // §4.7 step 6: the uploaded file is always cleaned up, regardless of
        // how extraction/boosting turned out.
        if let Err(e) = primary.client.delete_file(&file_ref).await {
            tracing::warn!(job_id = job.id, error = %e, "failed to delete uploaded file");
        }

        result
    }

    async fn extract_and_boost(&self, job: &Job, primary: &ActeProviderHandle, file_ref: &FileRef, extract_estimate: u32) -> Result<ActeOutput, PipelineError> {
        match primary.client.await_ready(file_ref, self.readiness_timeout).await.map_err(|e| PipelineError::BothProvidersFailed(e.to_string()))? {
            Readiness::Ready => {}
            Readiness::Failed => return Err(PipelineError::BothProvidersFailed("uploaded file failed processing".to_string())),
            Readiness::TimedOut => return Err(PipelineError::ReadinessTimeout(self.readiness_timeout)),
        }

        let extract_stage = NamedStage {
            provider_name: primary.name.clone(),
            call: Box::new(FileExtractStage {
                provider: primary.client.clone(),
                file_ref: file_ref.clone(),
                prompt: self.prompts.extract.clone(),
                continuation_prompt: self.prompts.extract_continuation.clone(),
                opts: primary.opts.clone(),
            }),
        };
        let extract_outcome = run_stage(std::slice::from_ref(&extract_stage), EXTRACTION_SENTINEL, self.extract_budgets, &self.rate_budget, extract_estimate)
            .await
            .map_err(PipelineError::BothProvidersFailed)?;

        if !extract_outcome.complete {
            tracing::warn!(job_id = job.id, "acte extraction continuation budget exhausted without completion sentinel");
        }

        let boost_estimate = estimate_tokens(extract_outcome.text.len());
        let boost_outcome = run_stage(&self.boost_stages(&extract_outcome.text), BOOST_SENTINEL, self.boost_budgets, &self.rate_budget, boost_estimate)
            .await
            .map_err(PipelineError::BothProvidersFailed)?;

        if !boost_outcome.complete {
            tracing::warn!(job_id = job.id, "acte boost continuation budget exhausted without completion sentinel");
        }

        Ok(ActeOutput { raw_text: extract_outcome.text, boosted_text: boost_outcome.text })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use crate::providers::FileState;
    use crate::rate_limit::InMemoryRateLimitBackend;
    use crate::storage::FsObjectStorage;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    struct StubFileProvider {
        name: String,
        deleted: AtomicBool,
        state_polls: Mutex<Vec<FileState>>,
    }

    #[async_trait]
    impl Provider for StubFileProvider {
        fn name(&self) -> &str {
            &self.name
        }

        async fn boost(&self, _text: &str, _prompt: &str, _opts: &CallOptions) -> Result<String, ProviderError> {
            Ok("boosted BOOST_COMPLETE:".to_string())
        }
    }

    #[async_trait]
    impl FileApiProvider for StubFileProvider {
        async fn upload(&self, _pdf_bytes: &[u8]) -> Result<FileRef, ProviderError> {
            Ok(FileRef { file_id: "file-1".to_string(), state: FileState::Processing })
        }

        async fn poll_state(&self, _file_ref: &FileRef) -> Result<FileState, ProviderError> {
            let mut polls = self.state_polls.lock().unwrap();
            if polls.is_empty() {
                Ok(FileState::Active)
            } else {
                Ok(polls.remove(0))
            }
        }

        async fn extract_file(&self, _file_ref: &FileRef, _prompt: &str, _opts: &CallOptions) -> Result<String, ProviderError> {
            Ok("extracted EXTRACTION_COMPLETE:".to_string())
        }

        async fn delete_file(&self, _file_ref: &FileRef) -> Result<(), ProviderError> {
            self.deleted.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn opts() -> CallOptions {
        CallOptions { model: "test-model".to_string(), temperature: 0.0, max_output_tokens: 1024 }
    }

    fn budgets() -> StageBudgets {
        StageBudgets { attempt_budget: 2, continuation_budget: 2 }
    }

    fn boost_budgets() -> StageBudgets {
        StageBudgets { attempt_budget: 2, continuation_budget: 2 }
    }

    fn rate_budget() -> RateBudget {
        let mut limits = HashMap::new();
        limits.insert("primary".to_string(), (1_000, 1_000_000));
        RateBudget::new(Arc::new(InMemoryRateLimitBackend::new()), limits)
    }

    fn prompts() -> ActePrompts {
        ActePrompts {
            extract: "extract".to_string(),
            extract_continuation: "continue extract".to_string(),
            boost: "boost".to_string(),
            boost_continuation: "continue boost".to_string(),
        }
    }

    fn test_job(storage_path: &str) -> Job {
        let now = chrono::Utc::now();
        Job {
            id: 7,
            document_source: crate::models::DocumentSource::Acte,
            document_number: None,
            document_number_normalized: None,
            circonscription: None,
            cadastre: None,
            designation_secondaire: None,
            status_id: 6,
            storage_path: Some(storage_path.to_string()),
            file_content: None,
            boosted_file_content: None,
            worker_id: None,
            processing_started_at: None,
            attempts: 0,
            max_attempts: 3,
            error_message: None,
            ocr_worker_id: None,
            ocr_started_at: None,
            ocr_completed_at: None,
            ocr_attempts: 1,
            ocr_max_attempts: 3,
            ocr_error: None,
            ocr_last_error_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn primary_provider_name_is_the_uploaded_to_provider() {
        let provider = Arc::new(StubFileProvider {
            name: "primary".to_string(),
            deleted: AtomicBool::new(false),
            state_polls: Mutex::new(vec![]),
        });
        let pipeline = ActePipeline::new(
            Arc::new(FsObjectStorage::new(".")),
            vec![ActeProviderHandle { name: "primary".to_string(), client: provider.clone(), opts: opts() }],
            vec![TextProviderHandle { name: "primary".to_string(), client: provider, opts: opts() }],
            Duration::from_secs(5),
            budgets(),
            boost_budgets(),
            prompts(),
            rate_budget(),
        );
        assert_eq!(pipeline.primary_provider_name(), Some("primary"));
    }

    #[tokio::test]
    async fn successful_run_deletes_uploaded_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("acte.pdf"), b"%PDF-1.4 fake").unwrap();
        let storage = Arc::new(FsObjectStorage::new(dir.path()));

        let provider = Arc::new(StubFileProvider {
            name: "primary".to_string(),
            deleted: AtomicBool::new(false),
            state_polls: Mutex::new(vec![]),
        });

        let pipeline = ActePipeline::new(
            storage,
            vec![ActeProviderHandle { name: "primary".to_string(), client: provider.clone(), opts: opts() }],
            vec![TextProviderHandle { name: "primary".to_string(), client: provider.clone(), opts: opts() }],
            Duration::from_secs(5),
            budgets(),
            boost_budgets(),
            prompts(),
            rate_budget(),
        );

        let output = pipeline.run(&test_job("acte.pdf")).await.unwrap();
        assert!(output.raw_text.contains("EXTRACTION_COMPLETE"));
        assert!(output.boosted_text.contains("BOOST_COMPLETE"));
        assert!(provider.deleted.load(Ordering::SeqCst), "uploaded file must be deleted after a successful run");
    }

    #[tokio::test]
    async fn failed_readiness_still_deletes_uploaded_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("acte.pdf"), b"%PDF-1.4 fake").unwrap();
        let storage = Arc::new(FsObjectStorage::new(dir.path()));

        let provider = Arc::new(StubFileProvider {
            name: "primary".to_string(),
            deleted: AtomicBool::new(false),
            state_polls: Mutex::new(vec![FileState::Failed]),
        });

        let pipeline = ActePipeline::new(
            storage,
            vec![ActeProviderHandle { name: "primary".to_string(), client: provider.clone(), opts: opts() }],
            vec![TextProviderHandle { name: "primary".to_string(), client: provider.clone(), opts: opts() }],
            Duration::from_secs(5),
            budgets(),
            boost_budgets(),
            prompts(),
            rate_budget(),
        );

        let result = pipeline.run(&test_job("acte.pdf")).await;
        assert!(result.is_err());
        assert!(provider.deleted.load(Ordering::SeqCst), "uploaded file must be deleted even when readiness fails");
    }

    #[tokio::test]
    async fn readiness_timeout_surfaces_as_retryable_error_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("acte.pdf"), b"%PDF-1.4 fake").unwrap();
        let storage = Arc::new(FsObjectStorage::new(dir.path()));

        // Always-processing stub never reaches Active before the deadline.
        let polls: Vec<FileState> = std::iter::repeat_n(FileState::Processing, 64).collect();
        let provider = Arc::new(StubFileProvider { name: "primary".to_string(), deleted: AtomicBool::new(false), state_polls: Mutex::new(polls) });

        let pipeline = ActePipeline::new(
            storage,
            vec![ActeProviderHandle { name: "primary".to_string(), client: provider.clone(), opts: opts() }],
            vec![TextProviderHandle { name: "primary".to_string(), client: provider.clone(), opts: opts() }],
            Duration::from_millis(50),
            budgets(),
            boost_budgets(),
            prompts(),
            rate_budget(),
        );

        let result = pipeline.run(&test_job("acte.pdf")).await;
        assert!(matches!(result, Err(PipelineError::ReadinessTimeout(_))));
        assert!(provider.deleted.load(Ordering::SeqCst));
    }
}
