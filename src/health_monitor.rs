//! Health Monitor (§4.10): a periodic sweep that reclaims stranded
//! `ocr_in_progress` jobs and marks workers that stopped heartbeating as
//! dead. Safe to run from multiple processes concurrently — both sweeps are
//! plain compare-and-update statements guarded on the stale condition, so a
//! redundant sweep from another instance is a no-op, not a double-reclaim.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rusqlite::Connection;
use tokio::sync::Mutex;

use crate::config::HealthConfig;
use crate::repository;

pub struct HealthMonitor {
    conn: Arc<Mutex<Connection>>,
    config: HealthConfig,
}

impl HealthMonitor {
    pub fn new(conn: Arc<Mutex<Connection>>, config: HealthConfig) -> Self {
        Self { conn, config }
    }

    /// One sweep: reclaim stale in-progress jobs, mark stale workers dead.
    pub async fn sweep(&self) {
        let stale_job_cutoff = Utc::now() - chrono::Duration::milliseconds(self.config.stale_job_threshold_ms as i64);
        let stale_worker_cutoff = Utc::now() - chrono::Duration::milliseconds(self.config.dead_worker_threshold_ms as i64);

        let conn = self.conn.lock().await;

        match repository::queue::reclaim_stranded(&conn, stale_job_cutoff) {
            Ok(reclaimed) if !reclaimed.is_empty() => {
                tracing::info!(count = reclaimed.len(), job_ids = ?reclaimed, "reclaimed stranded jobs");
            }
            Ok(_) => {}
            Err(e) => tracing::error!(error = %e, "stranded-job reclamation failed"),
        }

        match repository::heartbeats::mark_dead_workers(&conn, stale_worker_cutoff) {
            Ok(dead) if !dead.is_empty() => {
                tracing::warn!(worker_ids = ?dead, "marked workers dead");
            }
            Ok(_) => {}
            Err(e) => tracing::error!(error = %e, "dead-worker sweep failed"),
        }
    }

    /// Run `sweep` on a fixed interval until `shutdown` reports true.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let interval = Duration::from_millis(self.config.stale_check_interval_ms);
        while !*shutdown.borrow() {
            self.sweep().await;
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DocumentSource, Job, WorkerMode};

    fn setup() -> (tempfile::TempDir, Arc<Mutex<Connection>>) {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("t.sqlite3");
        repository::run_migrations(&db_path).unwrap();
        let conn = repository::connect(&db_path).unwrap();
        (dir, Arc::new(Mutex::new(conn)))
    }

    fn test_job() -> Job {
        let now = Utc::now();
        Job {
            id: 0,
            document_source: DocumentSource::Index,
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
        }
    }

    #[tokio::test]
    async fn sweep_reclaims_stranded_jobs_and_marks_dead_workers() {
        let (_dir, conn) = setup();
        let job_id = {
            let c = conn.lock().await;
            let id = repository::queue::insert_job(&c, &test_job()).unwrap();
            repository::queue::try_claim(&c, id, "w1").unwrap();
            repository::heartbeats::upsert_heartbeat(&c, "w1", WorkerMode::Index).unwrap();
            id
        };

        let monitor = HealthMonitor::new(
            conn.clone(),
            HealthConfig { stale_check_interval_ms: 1000, stale_job_threshold_ms: 0, dead_worker_threshold_ms: 0 },
        );

        tokio::time::sleep(Duration::from_millis(5)).await;
        monitor.sweep().await;

        let c = conn.lock().await;
        let job = repository::queue::get_job(&c, job_id).unwrap();
        assert_eq!(job.status_id, 3, "stranded job must be reverted to Extracted");

        let dead = repository::heartbeats::mark_dead_workers(&c, Utc::now()).unwrap();
        assert!(dead.is_empty(), "worker was already marked offline by the sweep");
    }
}
