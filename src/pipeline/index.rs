//! Index Pipeline (§4.6): PDF -> per-page OCR -> single boost pass over the
//! concatenated text -> sanitize.

use std::path::Path;
use std::sync::Arc;

use base64::Engine;
use futures::future::join_all;

use crate::error::PipelineError;
use crate::models::Job;
use crate::providers::processor::{run_stage, NamedStage, StageBudgets, BOOST_SENTINEL, EXTRACTION_SENTINEL};
use crate::providers::stages::{BoostStage, VisionExtractStage};
use crate::providers::{CallOptions, Provider, VisionProvider};
use crate::rate_limit::RateBudget;
use crate::storage::ObjectStorage;

use super::{estimate_tokens, pdf_utils, sanitizer};

/// One configured provider plus the call options baked from its config
/// entry (§6: model name, temperature, max-output-tokens are per-provider).
#[derive(Clone)]
pub struct IndexProviderHandle {
    pub name: String,
    pub client: Arc<dyn VisionProvider>,
    pub opts: CallOptions,
}

pub struct IndexPrompts {
    pub extract: String,
    pub extract_continuation: String,
    pub boost: String,
    pub boost_continuation: String,
}

pub struct IndexOutput {
    pub file_content: String,
    pub boosted_file_content: String,
}

pub struct IndexPipeline {
    storage: Arc<dyn ObjectStorage>,
    providers: Vec<IndexProviderHandle>,
    pdf_dpi: u32,
    /// §6: `extraction_attempt_budget` and `boost_attempt_budget` are
    /// separately operator-configurable; only `continuation_budget` is
    /// shared between the two stages.
    extract_budgets: StageBudgets,
    boost_budgets: StageBudgets,
    prompts: IndexPrompts,
    rate_budget: RateBudget,
}

impl IndexPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        storage: Arc<dyn ObjectStorage>,
        providers: Vec<IndexProviderHandle>,
        pdf_dpi: u32,
        extract_budgets: StageBudgets,
        boost_budgets: StageBudgets,
        prompts: IndexPrompts,
        rate_budget: RateBudget,
    ) -> Self {
        Self { storage, providers, pdf_dpi, extract_budgets, boost_budgets, prompts, rate_budget }
    }

    /// The provider `claim_next` checks against before committing to a job
    /// (§4.9 step 5): the first entry in provider order, since that's the
    /// one `run_stage` tries first.
    pub fn primary_provider_name(&self) -> Option<&str> {
        self.providers.first().map(|p| p.name.as_str())
    }

    fn extract_stages(&self, base64_image: &str, mime: &str) -> Vec<NamedStage> {
        self.providers
            .iter()
            .map(|p| NamedStage {
                provider_name: p.name.clone(),
                call: Box::new(VisionExtractStage {
                    provider: p.client.clone(),
                    base64_image: base64_image.to_string(),
                    mime: mime.to_string(),
                    prompt: self.prompts.extract.clone(),
                    continuation_prompt: self.prompts.extract_continuation.clone(),
                    opts: p.opts.clone(),
                }),
            })
            .collect()
    }

    fn boost_stages(&self, text: &str) -> Vec<NamedStage> {
        self.providers
            .iter()
            .map(|p| {
                let provider: Arc<dyn Provider> = p.client.clone();
                NamedStage {
                    provider_name: p.name.clone(),
                    call: Box::new(BoostStage {
                        provider,
                        text: text.to_string(),
                        prompt: self.prompts.boost.clone(),
                        continuation_prompt: self.prompts.boost_continuation.clone(),
                        opts: p.opts.clone(),
                    }),
                }
            })
            .collect()
    }

    /// §4.6: fetch, rasterize, extract per page, boost once, sanitize.
    ///
    /// Step 3 ("Parallel extract") spawns one task per page into a worker
    /// group whose real concurrency is bounded by Rate Budget admissions
    /// (§9 redesign note): every task is launched at once, but each blocks
    /// inside `run_stage` on `rate_budget.admit_blocking` before it ever
    /// reaches the network, so the number of extract calls in flight can
    /// never exceed what the provider's rpm/tpm window allows.
    pub async fn run(self: &Arc<Self>, job: &Job) -> Result<IndexOutput, PipelineError> {
        let storage_path = job
            .storage_path
            .as_deref()
            .ok_or_else(|| PipelineError::Storage("job has no storage_path".to_string()))?;
        let pdf_bytes = self.storage.download(storage_path).await?;

        let temp_dir = tempfile::tempdir().map_err(|e| PipelineError::Storage(e.to_string()))?;
        let pdf_path = temp_dir.path().join("source.pdf");
        tokio::fs::write(&pdf_path, &pdf_bytes)
            .await
            .map_err(|e| PipelineError::Storage(e.to_string()))?;

        let page_count = {
            let pdf_path = pdf_path.clone();
            tokio::task::spawn_blocking(move || pdf_utils::page_count(&pdf_path))
                .await
                .map_err(|e| PipelineError::Storage(e.to_string()))??
        };
        if page_count == 0 {
            // §4.6 boundary case: empty PDF produces an explicitly empty document.
            return Ok(IndexOutput { file_content: r#"{"pages":[]}"#.to_string(), boosted_file_content: String::new() });
        }

        let temp_path = temp_dir.path().to_path_buf();
        let handles = (1..=page_count)
            .map(|page| {
                let pipeline = Arc::clone(self);
                let pdf_path = pdf_path.clone();
                let temp_path = temp_path.clone();
                let job_id = job.id;
                tokio::spawn(async move { (page, pipeline.extract_page(job_id, &pdf_path, page, &temp_path).await) })
            })
            .collect::<Vec<_>>();

        let mut page_texts = vec![String::new(); page_count as usize];
        for result in join_all(handles).await {
            match result {
                Ok((page, text)) => page_texts[(page - 1) as usize] = text,
                Err(e) => tracing::error!(job_id = job.id, error = %e, "page extraction task panicked; recording empty page"),
            }
        }

        let assembled = page_texts
            .iter()
            .enumerate()
            .map(|(i, text)| format!("--- Page {} ---\n{}", i + 1, text))
            .collect::<Vec<_>>()
            .join("\n\n");

        let boost_estimate = estimate_tokens(assembled.len());
        let boost_outcome = run_stage(&self.boost_stages(&assembled), BOOST_SENTINEL, self.boost_budgets, &self.rate_budget, boost_estimate)
            .await
            .map_err(PipelineError::BothProvidersFailed)?;

        if !boost_outcome.complete {
            tracing::warn!(job_id = job.id, "boost continuation budget exhausted without completion sentinel");
        }

        let sanitized = sanitizer::sanitize(&boost_outcome.text);
        let file_content = serde_json::to_string(&sanitized)?;

        Ok(IndexOutput { file_content, boosted_file_content: boost_outcome.text })
    }

    /// A page extract failure (rasterization or both providers) is recorded
    /// as an empty page rather than failing the whole job (§4.6 edge case).
    async fn extract_page(&self, job_id: i64, pdf_path: &Path, page: u32, temp_dir: &Path) -> String {
        let image_path = {
            let pdf_path = pdf_path.to_path_buf();
            let temp_dir = temp_dir.to_path_buf();
            let dpi = self.pdf_dpi;
            let result = tokio::task::spawn_blocking(move || pdf_utils::pdf_page_to_image(&pdf_path, page, dpi, &temp_dir)).await;
            match result {
                Ok(Ok(path)) => path,
                Ok(Err(e)) => {
                    tracing::warn!(job_id, page, error = %e, "page rasterization failed; recording empty page");
                    return String::new();
                }
                Err(e) => {
                    tracing::warn!(job_id, page, error = %e, "rasterization task panicked; recording empty page");
                    return String::new();
                }
            }
        };

        let bytes = match tokio::fs::read(&image_path).await {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(job_id, page, error = %e, "reading rasterized page failed; recording empty page");
                return String::new();
            }
        };
        let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);
        let estimate = estimate_tokens(bytes.len());

        match run_stage(&self.extract_stages(&encoded, "image/png"), EXTRACTION_SENTINEL, self.extract_budgets, &self.rate_budget, estimate).await {
            Ok(outcome) => outcome.text,
            Err(e) => {
                tracing::warn!(job_id, page, error = %e, "page extraction failed on all providers; recording empty page");
                String::new()
            }
        }
    }
}
