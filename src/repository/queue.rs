//! The atomic claim protocol over the `queue` table (§4.9), modeled on the
//! teacher's `repository/crawl/claim.rs` `BEGIN IMMEDIATE` pattern but with
//! the claim itself expressed as a single compare-and-update `UPDATE ...
//! WHERE status_id = 3 RETURNING *` rather than a separate select+update —
//! the spec calls this out explicitly (§4.9 step 4) as the sole point of
//! synchronous contention.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::{RepositoryError, RepositoryResult};
use crate::models::{DocumentSource, Job};

fn row_to_job(row: &Row) -> rusqlite::Result<Job> {
    let document_source: String = row.get("document_source")?;
    let document_source = document_source
        .parse::<DocumentSource>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, e.into()))?;

    Ok(Job {
        id: row.get("id")?,
        document_source,
        document_number: row.get("document_number")?,
        document_number_normalized: row.get("document_number_normalized")?,
        circonscription: row.get("circonscription")?,
        cadastre: row.get("cadastre")?,
        designation_secondaire: row.get("designation_secondaire")?,
        status_id: row.get("status_id")?,
        storage_path: row.get("storage_path")?,
        file_content: row.get("file_content")?,
        boosted_file_content: row.get("boosted_file_content")?,
        worker_id: row.get("worker_id")?,
        processing_started_at: row.get("processing_started_at")?,
        attempts: row.get("attempts")?,
        max_attempts: row.get("max_attempts")?,
        error_message: row.get("error_message")?,
        ocr_worker_id: row.get("ocr_worker_id")?,
        ocr_started_at: row.get("ocr_started_at")?,
        ocr_completed_at: row.get("ocr_completed_at")?,
        ocr_attempts: row.get("ocr_attempts")?,
        ocr_max_attempts: row.get("ocr_max_attempts")?,
        ocr_error: row.get("ocr_error")?,
        ocr_last_error_at: row.get("ocr_last_error_at")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

/// §4.9 step 3: candidate rows for a worker's assigned mode, FIFO by
/// `created_at`, batched.
pub fn next_candidates(
    conn: &Connection,
    document_source: DocumentSource,
    batch_size: u32,
) -> RepositoryResult<Vec<Job>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT * FROM queue
        WHERE status_id = 3
          AND document_source = ?1
          AND storage_path IS NOT NULL
          AND (file_content IS NULL OR document_source = 'acte')
          AND (ocr_attempts IS NULL OR ocr_attempts < ocr_max_attempts)
        ORDER BY created_at ASC
        LIMIT ?2
        "#,
    )?;

    let jobs = stmt
        .query_map(params![document_source.as_str(), batch_size], row_to_job)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(jobs)
}

/// §4.3 `rebalance`'s queue-depth signal: how many jobs of a given document
/// source are sitting ready to claim right now.
pub fn count_pending(conn: &Connection, document_source: DocumentSource) -> RepositoryResult<u64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM queue WHERE status_id = 3 AND document_source = ?1",
        params![document_source.as_str()],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

/// §4.9 step 4: the compare-and-update claim. Returns `None` if another
/// worker won the race (ClaimLost, §7) and `Some(job)` on a successful claim
/// with `ocr_worker_id`/`ocr_started_at` already reflecting the claim.
pub fn try_claim(conn: &Connection, job_id: i64, worker_id: &str) -> RepositoryResult<Option<Job>> {
    let now = Utc::now();
    let updated = conn.execute(
        r#"
        UPDATE queue SET
            status_id = 6,
            ocr_worker_id = ?1,
            ocr_started_at = ?2,
            ocr_attempts = ocr_attempts + 1,
            updated_at = ?2
        WHERE id = ?3 AND status_id = 3
        "#,
        params![worker_id, now, job_id],
    )?;

    if updated == 0 {
        return Ok(None);
    }

    let job = conn
        .query_row("SELECT * FROM queue WHERE id = ?1", params![job_id], row_to_job)
        .optional()?;
    Ok(job)
}

/// §4.9 step 7: success. Writes outputs and transitions to `5 OcrComplete`.
pub fn complete_job(
    conn: &Connection,
    job_id: i64,
    file_content: &str,
    boosted_file_content: &str,
) -> RepositoryResult<()> {
    let now = Utc::now();
    conn.execute(
        r#"
        UPDATE queue SET
            status_id = 5,
            file_content = ?1,
            boosted_file_content = ?2,
            ocr_completed_at = ?3,
            ocr_error = NULL,
            updated_at = ?3
        WHERE id = ?4
        "#,
        params![file_content, boosted_file_content, now, job_id],
    )?;
    Ok(())
}

/// §4.9 step 8: failure. Transitions to `4 Error` if attempts are exhausted,
/// else back to `3 Extracted` for retry by any worker.
pub fn fail_job(conn: &Connection, job_id: i64, error: &str) -> RepositoryResult<()> {
    let now = Utc::now();
    conn.execute(
        r#"
        UPDATE queue SET
            status_id = CASE WHEN ocr_attempts >= ocr_max_attempts THEN 4 ELSE 3 END,
            ocr_error = ?1,
            ocr_last_error_at = ?2,
            ocr_worker_id = NULL,
            updated_at = ?2
        WHERE id = ?3
        "#,
        params![error, now, job_id],
    )?;
    Ok(())
}

/// §4.10: stranded-job reclamation. Only reverts rows still at `status_id =
/// 6` with a stale `ocr_started_at`; never revives a row whose status
/// changed in between (the `WHERE status_id = 6` guard on the UPDATE is the
/// compare-and-update here too).
pub fn reclaim_stranded(conn: &Connection, stale_before: chrono::DateTime<Utc>) -> RepositoryResult<Vec<i64>> {
    let mut stmt = conn.prepare(
        "SELECT id FROM queue WHERE status_id = 6 AND ocr_started_at < ?1",
    )?;
    let ids: Vec<i64> = stmt
        .query_map(params![stale_before], |row| row.get(0))?
        .collect::<Result<Vec<_>, _>>()?;

    let now = Utc::now();
    let mut reclaimed = Vec::new();
    for id in ids {
        let updated = conn.execute(
            r#"
            UPDATE queue SET
                status_id = 3,
                ocr_worker_id = NULL,
                ocr_error = 'Reset by health monitor',
                ocr_last_error_at = ?1,
                updated_at = ?1
            WHERE id = ?2 AND status_id = 6 AND ocr_started_at < ?3
            "#,
            params![now, id, stale_before],
        )?;
        if updated > 0 {
            reclaimed.push(id);
        }
    }
    Ok(reclaimed)
}

/// Insert a job; used by tests and by seed tooling.
pub fn insert_job(conn: &Connection, job: &Job) -> RepositoryResult<i64> {
    conn.execute(
        r#"
        INSERT INTO queue (
            document_source, document_number, document_number_normalized,
            circonscription, cadastre, designation_secondaire,
            status_id, storage_path, file_content, boosted_file_content,
            attempts, max_attempts, ocr_attempts, ocr_max_attempts,
            created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
        "#,
        params![
            job.document_source.as_str(),
            job.document_number,
            job.document_number_normalized,
            job.circonscription,
            job.cadastre,
            job.designation_secondaire,
            job.status_id,
            job.storage_path,
            job.file_content,
            job.boosted_file_content,
            job.attempts,
            job.max_attempts,
            job.ocr_attempts,
            job.ocr_max_attempts,
            job.created_at,
            job.updated_at,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn get_job(conn: &Connection, job_id: i64) -> RepositoryResult<Job> {
    conn.query_row("SELECT * FROM queue WHERE id = ?1", params![job_id], row_to_job)
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => RepositoryError::NotFound(format!("job {job_id}")),
            other => other.into(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{connect, run_migrations};
    use tempfile::tempdir;

    fn test_job(source: DocumentSource) -> Job {
        let now = Utc::now();
        Job {
            id: 0,
            document_source: source,
            document_number: None,
            document_number_normalized: None,
            circonscription: None,
            cadastre: None,
            designation_secondaire: None,
            status_id: 3,
            storage_path: Some("pdf://x".to_string()),
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

    fn setup() -> (tempfile::TempDir, Connection) {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("t.sqlite3");
        run_migrations(&db_path).unwrap();
        let conn = connect(&db_path).unwrap();
        (dir, conn)
    }

    #[test]
    fn claim_transitions_status_and_sets_worker() {
        let (_dir, conn) = setup();
        let id = insert_job(&conn, &test_job(DocumentSource::Index)).unwrap();

        let candidates = next_candidates(&conn, DocumentSource::Index, 10).unwrap();
        assert_eq!(candidates.len(), 1);

        let claimed = try_claim(&conn, id, "worker-1").unwrap().unwrap();
        assert_eq!(claimed.status_id, 6);
        assert_eq!(claimed.ocr_worker_id.as_deref(), Some("worker-1"));
        assert_eq!(claimed.ocr_attempts, 1);
    }

    #[test]
    fn second_claim_on_already_claimed_row_loses() {
        let (_dir, conn) = setup();
        let id = insert_job(&conn, &test_job(DocumentSource::Index)).unwrap();

        let first = try_claim(&conn, id, "worker-1").unwrap();
        assert!(first.is_some());

        let second = try_claim(&conn, id, "worker-2").unwrap();
        assert!(second.is_none(), "second claimant must observe ClaimLost");
    }

    #[test]
    fn complete_job_sets_ocr_complete_and_outputs() {
        let (_dir, conn) = setup();
        let id = insert_job(&conn, &test_job(DocumentSource::Index)).unwrap();
        try_claim(&conn, id, "worker-1").unwrap();

        complete_job(&conn, id, "{}", "boosted").unwrap();
        let job = get_job(&conn, id).unwrap();
        assert_eq!(job.status_id, 5);
        assert_eq!(job.file_content.as_deref(), Some("{}"));
        assert!(job.ocr_completed_at.is_some());
    }

    #[test]
    fn fail_job_requeues_until_max_attempts_then_errors() {
        let (_dir, conn) = setup();
        let mut job = test_job(DocumentSource::Acte);
        job.ocr_max_attempts = 2;
        let id = insert_job(&conn, &job).unwrap();

        try_claim(&conn, id, "worker-1").unwrap();
        fail_job(&conn, id, "boom").unwrap();
        let after_first = get_job(&conn, id).unwrap();
        assert_eq!(after_first.status_id, 3, "one attempt left, must requeue");

        try_claim(&conn, id, "worker-2").unwrap();
        fail_job(&conn, id, "boom again").unwrap();
        let after_second = get_job(&conn, id).unwrap();
        assert_eq!(after_second.status_id, 4, "attempts exhausted, must error");
        assert_eq!(after_second.ocr_error.as_deref(), Some("boom again"));
    }

    #[test]
    fn reclaim_stranded_only_touches_stale_in_progress_rows() {
        let (_dir, conn) = setup();
        let id = insert_job(&conn, &test_job(DocumentSource::Index)).unwrap();
        try_claim(&conn, id, "worker-1").unwrap();

        let future_cutoff = Utc::now() + chrono::Duration::seconds(60);
        let reclaimed = reclaim_stranded(&conn, future_cutoff).unwrap();
        assert_eq!(reclaimed, vec![id]);

        let job = get_job(&conn, id).unwrap();
        assert_eq!(job.status_id, 3);
        assert!(job.ocr_worker_id.is_none());
    }

    #[test]
    fn count_pending_only_counts_extracted_rows_of_that_source() {
        let (_dir, conn) = setup();
        insert_job(&conn, &test_job(DocumentSource::Index)).unwrap();
        insert_job(&conn, &test_job(DocumentSource::Index)).unwrap();
        let acte_id = insert_job(&conn, &test_job(DocumentSource::Acte)).unwrap();
        try_claim(&conn, acte_id, "worker-1").unwrap();

        assert_eq!(count_pending(&conn, DocumentSource::Index).unwrap(), 2);
        assert_eq!(count_pending(&conn, DocumentSource::Acte).unwrap(), 0, "claimed row is no longer pending");
    }

    #[test]
    fn reclaim_stranded_ignores_fresh_claims() {
        let (_dir, conn) = setup();
        let id = insert_job(&conn, &test_job(DocumentSource::Index)).unwrap();
        try_claim(&conn, id, "worker-1").unwrap();

        let past_cutoff = Utc::now() - chrono::Duration::seconds(600);
        let reclaimed = reclaim_stranded(&conn, past_cutoff).unwrap();
        assert!(reclaimed.is_empty());
    }
}
