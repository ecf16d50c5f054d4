//! Schema migrations for the queue table and worker heartbeats, in the
//! teacher's per-migration-function style (`migrations/m0001_initial.rs`).

use cetane::prelude::*;

fn m0001_queue() -> Migration {
    Migration::new("0001_queue").operation(
        RunSql::portable()
            .for_backend(
                "sqlite",
                r#"CREATE TABLE IF NOT EXISTS queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    document_source TEXT NOT NULL,
    document_number TEXT,
    document_number_normalized TEXT,
    circonscription TEXT,
    cadastre TEXT,
    designation_secondaire TEXT,
    status_id INTEGER NOT NULL DEFAULT 1,
    storage_path TEXT,
    file_content TEXT,
    boosted_file_content TEXT,
    worker_id TEXT,
    processing_started_at TEXT,
    attempts INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL DEFAULT 3,
    error_message TEXT,
    ocr_worker_id TEXT,
    ocr_started_at TEXT,
    ocr_completed_at TEXT,
    ocr_attempts INTEGER NOT NULL DEFAULT 0,
    ocr_max_attempts INTEGER NOT NULL DEFAULT 3,
    ocr_error TEXT,
    ocr_last_error_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
)"#,
            )
            .for_backend(
                "postgres",
                r#"CREATE TABLE IF NOT EXISTS queue (
    id SERIAL PRIMARY KEY,
    document_source TEXT NOT NULL,
    document_number TEXT,
    document_number_normalized TEXT,
    circonscription TEXT,
    cadastre TEXT,
    designation_secondaire TEXT,
    status_id INTEGER NOT NULL DEFAULT 1,
    storage_path TEXT,
    file_content TEXT,
    boosted_file_content TEXT,
    worker_id TEXT,
    processing_started_at TIMESTAMPTZ,
    attempts INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL DEFAULT 3,
    error_message TEXT,
    ocr_worker_id TEXT,
    ocr_started_at TIMESTAMPTZ,
    ocr_completed_at TIMESTAMPTZ,
    ocr_attempts INTEGER NOT NULL DEFAULT 0,
    ocr_max_attempts INTEGER NOT NULL DEFAULT 3,
    ocr_error TEXT,
    ocr_last_error_at TIMESTAMPTZ,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL
)"#,
            ),
    )
    // Partial index backing the §4.9 candidate query.
    .operation(
        RunSql::portable()
            .for_backend(
                "sqlite",
                "CREATE INDEX IF NOT EXISTS idx_queue_candidates ON queue \
                 (status_id, document_source, created_at, ocr_attempts) \
                 WHERE status_id = 3 AND storage_path IS NOT NULL",
            )
            .for_backend(
                "postgres",
                "CREATE INDEX IF NOT EXISTS idx_queue_candidates ON queue \
                 (status_id, document_source, created_at, ocr_attempts) \
                 WHERE status_id = 3 AND storage_path IS NOT NULL",
            ),
    )
    // Partial index backing the §4.10 stranded-job scan.
    .operation(
        RunSql::portable()
            .for_backend(
                "sqlite",
                "CREATE INDEX IF NOT EXISTS idx_queue_in_progress ON queue \
                 (status_id, ocr_started_at) WHERE status_id = 6",
            )
            .for_backend(
                "postgres",
                "CREATE INDEX IF NOT EXISTS idx_queue_in_progress ON queue \
                 (status_id, ocr_started_at) WHERE status_id = 6",
            ),
    )
}

fn m0002_worker_heartbeats() -> Migration {
    Migration::new("0002_worker_heartbeats")
        .depends_on(&["0001_queue"])
        .operation(
            RunSql::portable()
                .for_backend(
                    "sqlite",
                    r#"CREATE TABLE IF NOT EXISTS worker_heartbeats (
    worker_id TEXT PRIMARY KEY,
    mode TEXT NOT NULL,
    last_seen_at TEXT NOT NULL,
    offline INTEGER NOT NULL DEFAULT 0
)"#,
                )
                .for_backend(
                    "postgres",
                    r#"CREATE TABLE IF NOT EXISTS worker_heartbeats (
    worker_id TEXT PRIMARY KEY,
    mode TEXT NOT NULL,
    last_seen_at TIMESTAMPTZ NOT NULL,
    offline BOOLEAN NOT NULL DEFAULT FALSE
)"#,
                ),
        )
}

pub fn build_registry() -> MigrationRegistry {
    let mut registry = MigrationRegistry::new();
    registry.register(m0001_queue());
    registry.register(m0002_worker_heartbeats());
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use cetane::backend::Sqlite;
    use cetane::migrator::{InMemoryState, Migrator};

    #[test]
    fn registry_resolves_and_generates_sql() {
        let registry = build_registry();
        let order = registry.resolve_order().unwrap();
        assert_eq!(order, vec!["0001_queue", "0002_worker_heartbeats"]);

        let state = InMemoryState::new();
        let mut migrator = Migrator::new(&registry, &Sqlite, state);
        let sql = migrator.generate_forward_sql().unwrap();
        assert_eq!(sql.len(), 2);
    }

    #[test]
    fn migrates_against_real_sqlite_connection() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let registry = build_registry();
        let state = cetane::state::SqliteMigrationState::new(&conn).unwrap();
        let mut migrator = Migrator::new(&registry, &Sqlite, state);

        let applied = migrator
            .migrate_forward(|sql| conn.execute_batch(sql).map_err(|e| e.to_string()))
            .unwrap();
        assert_eq!(applied.len(), 2);

        let exists: bool = conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type='table' AND name='queue'",
                [],
                |_| Ok(true),
            )
            .unwrap_or(false);
        assert!(exists);
    }
}
