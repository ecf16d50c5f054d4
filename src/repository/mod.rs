//! Repository layer: sqlite connection handling, migrations, and the
//! atomic queue-claim protocol. Hand-written SQL, no ORM — the teacher's
//! own `repository/mod.rs::connect` and `repository/crawl/claim.rs` already
//! work this way for their claim protocol.

pub mod heartbeats;
pub mod migrations;
pub mod queue;

use std::path::Path;

use cetane::backend::Sqlite;
use cetane::migrator::Migrator;
use rusqlite::Connection;

use crate::error::{RepositoryError, RepositoryResult};

/// Open a fresh connection with WAL-mode pragmas tuned for a
/// many-readers/one-writer polling workload. No connection pool: rusqlite
/// connections are cheap to open and cetane's sqlite feature pins us to a
/// specific `rusqlite`/`libsqlite3-sys` pair that a pooling crate would
/// conflict with.
pub fn connect(db_path: &Path) -> RepositoryResult<Connection> {
    let conn = Connection::open(db_path)?;
    conn.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;
        PRAGMA busy_timeout = 30000;
        PRAGMA cache_size = -64000;
        PRAGMA mmap_size = 268435456;
        PRAGMA temp_store = MEMORY;
        PRAGMA page_size = 4096;
    "#,
    )?;
    Ok(conn)
}

/// Apply all pending migrations against the database at `db_path`.
pub fn run_migrations(db_path: &Path) -> RepositoryResult<Vec<String>> {
    let conn = connect(db_path)?;
    let registry = migrations::build_registry();
    let state = cetane::state::SqliteMigrationState::new(&conn)
        .map_err(|e| RepositoryError::NotFound(format!("migration state init failed: {e}")))?;
    let mut migrator = Migrator::new(&registry, &Sqlite, state);

    let applied = migrator
        .migrate_forward(|sql| conn.execute_batch(sql).map_err(|e| e.to_string()))
        .map_err(|e| RepositoryError::NotFound(format!("migration failed: {e}")))?;

    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn connect_enables_wal_mode() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("test.sqlite3");
        let conn = connect(&db_path).unwrap();
        let mode: String = conn.query_row("PRAGMA journal_mode", [], |r| r.get(0)).unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }

    #[test]
    fn run_migrations_creates_queue_table() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("test.sqlite3");
        let applied = run_migrations(&db_path).unwrap();
        assert_eq!(applied.len(), 2);

        let conn = connect(&db_path).unwrap();
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
