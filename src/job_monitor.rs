//! Job Monitor (§4.9): the per-worker main loop. Polls its assigned mode,
//! claims a candidate job, gates on the Rate Budget, dispatches to the
//! matching pipeline, and records the outcome.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rusqlite::Connection;
use tokio::sync::Mutex;

use crate::capacity::CapacityBudget;
use crate::models::{DocumentSource, Job, Worker, WorkerMode};
use crate::pipeline::acte::ActePipeline;
use crate::pipeline::index::IndexPipeline;
use crate::pipeline::estimate_tokens;
use crate::pool_manager::PoolManager;
use crate::rate_limit::{Admission, RateBudget};
use crate::repository;

const CANDIDATE_BATCH_SIZE: u32 = 10;
const DOCUMENT_SIZE_ESTIMATE_BYTES: usize = 65_536;

pub struct JobMonitor {
    worker: Worker,
    conn: Arc<Mutex<Connection>>,
    pool_manager: Arc<PoolManager>,
    rate_budget: RateBudget,
    capacity_budget: CapacityBudget,
    index_pipeline: Arc<IndexPipeline>,
    acte_pipeline: Arc<ActePipeline>,
    poll_interval: Duration,
    idle_close: Duration,
}

impl JobMonitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        worker: Worker,
        conn: Arc<Mutex<Connection>>,
        pool_manager: Arc<PoolManager>,
        rate_budget: RateBudget,
        capacity_budget: CapacityBudget,
        index_pipeline: Arc<IndexPipeline>,
        acte_pipeline: Arc<ActePipeline>,
        poll_interval: Duration,
        idle_close: Duration,
    ) -> Self {
        Self { worker, conn, pool_manager, rate_budget, capacity_budget, index_pipeline, acte_pipeline, poll_interval, idle_close }
    }

    fn class_name(mode: WorkerMode) -> &'static str {
        match mode {
            WorkerMode::Index => "index-ocr",
            WorkerMode::Acte => "acte-ocr",
        }
    }

    /// §4.9: the main loop. Runs until `shutdown` reports true, then drains
    /// (no in-flight job is interrupted — `process` always runs to
    /// completion before the loop re-checks `shutdown`) and releases its
    /// budget reservations.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut idle_since: Option<Instant> = None;
        let mut registered = false;

        while !*shutdown.borrow() {
            let mode = self.pool_manager.mode_of(&self.worker.worker_id).await;

            if !registered {
                if let Err(e) = self.acquire_resources(mode).await {
                    tracing::error!(worker_id = %self.worker.worker_id, error = %e, "resource acquisition failed; retrying next poll");
                    tokio::select! {
                        _ = tokio::time::sleep(self.poll_interval) => {}
                        _ = shutdown.changed() => {}
                    }
                    continue;
                }
                registered = true;
            }

            self.heartbeat(mode).await;

            let document_source = match mode {
                WorkerMode::Index => DocumentSource::Index,
                WorkerMode::Acte => DocumentSource::Acte,
            };

            match self.claim_next(document_source, mode).await {
                Some(job) => {
                    idle_since = None;
                    self.process(job).await;
                }
                None => {
                    let since = *idle_since.get_or_insert_with(Instant::now);
                    if since.elapsed() >= self.idle_close {
                        tracing::info!(worker_id = %self.worker.worker_id, "idle-close: releasing budget reservations");
                        self.release_resources().await;
                        registered = false;
                        idle_since = None;
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(self.poll_interval) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }

        if registered {
            self.release_resources().await;
        }
    }

    async fn acquire_resources(&self, mode: WorkerMode) -> Result<(), String> {
        let class = Self::class_name(mode);
        match self.capacity_budget.check(class).await {
            Ok(crate::capacity::CapacityDecision::Allowed) => {}
            Ok(crate::capacity::CapacityDecision::Denied { reason, .. }) => return Err(reason),
            Err(e) => return Err(e.to_string()),
        }
        self.capacity_budget.allocate(&self.worker.worker_id, class).await.map_err(|e| e.to_string())?;
        self.rate_budget.register_worker(&self.worker.worker_id, mode).await.map_err(|e| e.to_string())?;
        Ok(())
    }

    async fn release_resources(&self) {
        if let Err(e) = self.rate_budget.deregister_worker(&self.worker.worker_id).await {
            tracing::warn!(worker_id = %self.worker.worker_id, error = %e, "failed to deregister from rate budget");
        }
        if let Err(e) = self.capacity_budget.release(&self.worker.worker_id).await {
            tracing::warn!(worker_id = %self.worker.worker_id, error = %e, "failed to release capacity");
        }
    }

    async fn heartbeat(&self, mode: WorkerMode) {
        let conn = self.conn.lock().await;
        if let Err(e) = repository::heartbeats::upsert_heartbeat(&conn, &self.worker.worker_id, mode) {
            tracing::error!(worker_id = %self.worker.worker_id, error = %e, "heartbeat upsert failed");
        }
    }

    /// §4.9 steps 3-5: query candidates, atomically claim the first one this
    /// worker wins, then gate on the Rate Budget — a deferred admission
    /// retries in place rather than re-querying the candidate list.
    async fn claim_next(&self, source: DocumentSource, mode: WorkerMode) -> Option<Job> {
        let candidates = {
            let conn = self.conn.lock().await;
            repository::queue::next_candidates(&conn, source, CANDIDATE_BATCH_SIZE).ok()?
        };

        for candidate in candidates {
            let claimed = {
                let conn = self.conn.lock().await;
                repository::queue::try_claim(&conn, candidate.id, &self.worker.worker_id).ok()?
            };
            let Some(job) = claimed else { continue };

            // §4.1 keys the Rate Budget per LLM provider ("primary"/"fallback"),
            // not per worker class, so this pre-check uses the pipeline's
            // first-in-order provider — the one `run_stage` will actually
            // call first. The real admission happens per call inside
            // `run_stage`/`run_continuations`; this is only a courtesy check
            // to avoid committing a claim the budget clearly can't serve yet.
            let Some(provider) = (match mode {
                WorkerMode::Index => self.index_pipeline.primary_provider_name(),
                WorkerMode::Acte => self.acte_pipeline.primary_provider_name(),
            }) else {
                return Some(job);
            };
            let estimate = estimate_tokens(job.file_content.as_ref().map(|s| s.len()).unwrap_or(DOCUMENT_SIZE_ESTIMATE_BYTES));
            loop {
                match self.rate_budget.try_admit(provider, estimate).await {
                    Ok(Admission::Admitted) => return Some(job),
                    Ok(Admission::Deferred { retry_after_ms }) => {
                        tokio::time::sleep(Duration::from_millis(retry_after_ms.min(30_000))).await;
                    }
                    Err(e) => {
                        tracing::error!(job_id = job.id, error = %e, "rate budget check failed; proceeding without admission");
                        return Some(job);
                    }
                }
            }
        }
        None
    }

    /// §4.9 steps 6-8: dispatch to the pipeline matching the job's document
    /// source, then transition status. Failures are recorded in `ocr_error`
    /// only — the upstream `error_message` column is never touched.
    async fn process(&self, job: Job) {
        let outcome = match job.document_source {
            DocumentSource::Index => self.index_pipeline.run(&job).await.map(|out| (out.file_content, out.boosted_file_content)),
            DocumentSource::Acte => self.acte_pipeline.run(&job).await.map(|out| (out.raw_text, out.boosted_text)),
            DocumentSource::PlanCadastraux => {
                tracing::error!(job_id = job.id, "plan_cadastraux job was claimed by the OCR pool; this should never happen");
                return;
            }
        };

        let conn = self.conn.lock().await;
        match outcome {
            Ok((content, boosted)) => {
                if let Err(e) = repository::queue::complete_job(&conn, job.id, &content, &boosted) {
                    tracing::error!(job_id = job.id, error = %e, "failed to record job completion");
                }
            }
            Err(e) => {
                tracing::warn!(job_id = job.id, error = %e, "ocr pipeline failed");
                if let Err(db_err) = repository::queue::fail_job(&conn, job.id, &e.to_string()) {
                    tracing::error!(job_id = job.id, error = %db_err, "failed to record job failure");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::error::ProviderError;
    use crate::models::DocumentSource as DS;
    use crate::pipeline::acte::{ActePrompts, TextProviderHandle};
    use crate::pipeline::index::{IndexPrompts, IndexProviderHandle};
    use crate::providers::processor::StageBudgets;
    use crate::providers::{CallOptions, FileRef, FileState, Provider, VisionProvider};
    use crate::rate_limit::InMemoryRateLimitBackend;
    use crate::capacity::InMemoryCapacityBackend;
    use async_trait::async_trait;
    use std::collections::HashMap;

    struct StubProvider;

    #[async_trait]
    impl Provider for StubProvider {
        fn name(&self) -> &str {
            "stub"
        }
        async fn boost(&self, _text: &str, _prompt: &str, _opts: &CallOptions) -> Result<String, ProviderError> {
            Ok("boosted BOOST_COMPLETE:".to_string())
        }
    }

    #[async_trait]
    impl VisionProvider for StubProvider {
        async fn extract_image(&self, _b64: &str, _mime: &str, _prompt: &str, _opts: &CallOptions) -> Result<String, ProviderError> {
            Ok("extracted EXTRACTION_COMPLETE:".to_string())
        }
    }

    #[async_trait]
    impl crate::providers::FileApiProvider for StubProvider {
        async fn upload(&self, _bytes: &[u8]) -> Result<FileRef, ProviderError> {
            Ok(FileRef { file_id: "f1".to_string(), state: FileState::Active })
        }
        async fn poll_state(&self, _f: &FileRef) -> Result<FileState, ProviderError> {
            Ok(FileState::Active)
        }
        async fn extract_file(&self, _f: &FileRef, _prompt: &str, _opts: &CallOptions) -> Result<String, ProviderError> {
            Ok("extracted EXTRACTION_COMPLETE:".to_string())
        }
        async fn delete_file(&self, _f: &FileRef) -> Result<(), ProviderError> {
            Ok(())
        }
    }

    fn setup_db() -> (tempfile::TempDir, Arc<Mutex<Connection>>) {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("t.sqlite3");
        repository::run_migrations(&db_path).unwrap();
        let conn = repository::connect(&db_path).unwrap();
        (dir, Arc::new(Mutex::new(conn)))
    }

    fn pipeline_config() -> PipelineConfig {
        PipelineConfig::default()
    }

    #[tokio::test]
    async fn claim_next_admits_and_claims_a_pending_job() {
        let (_dir, conn) = setup_db();
        {
            let c = conn.lock().await;
            let now = chrono::Utc::now();
            repository::queue::insert_job(
                &c,
                &Job {
                    id: 0,
                    document_source: DS::Index,
                    document_number: None,
                    document_number_normalized: None,
                    circonscription: None,
                    cadastre: None,
                    designation_secondaire: None,
                    status_id: 3,
                    storage_path: Some("x.pdf".to_string()),
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
                    ocr_attempts: 0,
                    ocr_max_attempts: 3,
                    ocr_error: None,
                    ocr_last_error_at: None,
                    created_at: now,
                    updated_at: now,
                },
            )
            .unwrap();
        }

        let storage = Arc::new(crate::storage::FsObjectStorage::new("."));
        let stub = Arc::new(StubProvider);
        let opts = CallOptions { model: "m".to_string(), temperature: 0.0, max_output_tokens: 100 };
        let budgets = StageBudgets { attempt_budget: 2, continuation_budget: 2 };

        let mut limits = HashMap::new();
        limits.insert("primary".to_string(), (60, 1_000_000));
        let rate_budget = RateBudget::new(Arc::new(InMemoryRateLimitBackend::new()), limits);

        let index_pipeline = Arc::new(IndexPipeline::new(
            storage.clone(),
            vec![IndexProviderHandle { name: "primary".to_string(), client: stub.clone(), opts: opts.clone() }],
            150,
            budgets,
            budgets,
            IndexPrompts {
                extract: "e".to_string(),
                extract_continuation: "ec".to_string(),
                boost: "b".to_string(),
                boost_continuation: "bc".to_string(),
            },
            rate_budget.clone(),
        ));
        let acte_pipeline = Arc::new(ActePipeline::new(
            storage,
            vec![crate::pipeline::acte::ActeProviderHandle { name: "primary".to_string(), client: stub.clone(), opts: opts.clone() }],
            vec![TextProviderHandle { name: "primary".to_string(), client: stub.clone(), opts }],
            Duration::from_secs(5),
            budgets,
            budgets,
            ActePrompts {
                extract: "e".to_string(),
                extract_continuation: "ec".to_string(),
                boost: "b".to_string(),
                boost_continuation: "bc".to_string(),
            },
            rate_budget.clone(),
        ));

        let pool_manager = Arc::new(PoolManager::new(crate::config::PoolConfig::default()));
        let capacity_budget = CapacityBudget::new(Arc::new(InMemoryCapacityBackend::new()), crate::config::CapacityConfig::default());

        let worker = Worker { worker_id: "w1".to_string(), mode: WorkerMode::Index, temp_dir: std::env::temp_dir() };
        let monitor = JobMonitor::new(worker, conn, pool_manager, rate_budget, capacity_budget, index_pipeline, acte_pipeline, Duration::from_millis(10), Duration::from_secs(300));

        let job = monitor.claim_next(DS::Index, WorkerMode::Index).await;
        assert!(job.is_some());
        let _ = pipeline_config();
    }
}
