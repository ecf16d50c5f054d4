//! Worker heartbeat/mode persistence backing the Pool Manager's
//! `assign_mode` (§4.3 — "persisted so workers recovering from crash resume
//! their last mode") and the Health Monitor's dead-worker sweep (§4.10).

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::RepositoryResult;
use crate::models::WorkerMode;

fn mode_to_str(mode: WorkerMode) -> &'static str {
    match mode {
        WorkerMode::Index => "index",
        WorkerMode::Acte => "acte",
    }
}

fn mode_from_str(s: &str) -> Option<WorkerMode> {
    match s {
        "index" => Some(WorkerMode::Index),
        "acte" => Some(WorkerMode::Acte),
        _ => None,
    }
}

/// Upsert a worker's heartbeat row: last-seen timestamp plus current mode.
/// Idempotent — called once per poll cycle regardless of whether the mode
/// changed.
pub fn upsert_heartbeat(conn: &Connection, worker_id: &str, mode: WorkerMode) -> RepositoryResult<()> {
    let now = Utc::now();
    conn.execute(
        r#"
        INSERT INTO worker_heartbeats (worker_id, mode, last_seen_at, offline)
        VALUES (?1, ?2, ?3, 0)
        ON CONFLICT(worker_id) DO UPDATE SET
            mode = excluded.mode,
            last_seen_at = excluded.last_seen_at,
            offline = 0
        "#,
        params![worker_id, mode_to_str(mode), now],
    )?;
    Ok(())
}

/// The last mode a worker was assigned, if it has ever checked in — used to
/// resume mode across a crash/restart (§4.3).
pub fn last_mode(conn: &Connection, worker_id: &str) -> RepositoryResult<Option<WorkerMode>> {
    let mode: Option<String> = conn
        .query_row(
            "SELECT mode FROM worker_heartbeats WHERE worker_id = ?1",
            params![worker_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(mode.and_then(|m| mode_from_str(&m)))
}

/// §4.10: mark heartbeats older than `dead_worker_threshold` offline.
/// Returns the worker IDs newly marked offline.
pub fn mark_dead_workers(conn: &Connection, stale_before: chrono::DateTime<Utc>) -> RepositoryResult<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT worker_id FROM worker_heartbeats WHERE last_seen_at < ?1 AND offline = 0",
    )?;
    let ids: Vec<String> = stmt
        .query_map(params![stale_before], |row| row.get(0))?
        .collect::<Result<Vec<_>, _>>()?;

    for id in &ids {
        conn.execute(
            "UPDATE worker_heartbeats SET offline = 1 WHERE worker_id = ?1",
            params![id],
        )?;
    }
    Ok(ids)
}
