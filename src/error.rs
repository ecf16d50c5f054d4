//! Crate-wide error taxonomy.

use thiserror::Error;

/// Errors from the queue-table repository layer.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[cfg(feature = "postgres")]
    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("blocking task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type RepositoryResult<T> = Result<T, RepositoryError>;

/// Errors from the Rate Budget / Capacity Budget backends.
#[derive(Debug, Error)]
pub enum BudgetError {
    #[error("budget store unavailable: {0}")]
    Unavailable(String),

    #[error("budget store error: {0}")]
    Backend(String),
}

pub type BudgetResult<T> = Result<T, BudgetError>;

#[cfg(feature = "redis-backend")]
impl From<redis::RedisError> for BudgetError {
    fn from(e: redis::RedisError) -> Self {
        BudgetError::Backend(e.to_string())
    }
}

/// Errors from a provider client call (§4.4, §7 `ProviderTransient`/`ProviderFatal`).
#[derive(Debug, Error, Clone)]
pub enum ProviderError {
    #[error("rate limited, retry after {retry_after_secs:?}s")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("transient provider error: {0}")]
    Transient(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("provider overloaded")]
    Overloaded,
}

impl ProviderError {
    /// Whether this failure should be retried against the same provider before
    /// falling back to the next one (§4.5 step 2).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimited { .. } | ProviderError::Transient(_) | ProviderError::Overloaded
        )
    }
}

/// Errors surfaced by a type-specific pipeline, collected by the Job Monitor.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("both providers failed: {0}")]
    BothProvidersFailed(String),

    #[error("object storage error: {0}")]
    Storage(String),

    #[error("file-api readiness timed out after {0:?}")]
    ReadinessTimeout(std::time::Duration),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Startup-fatal errors (§7 `FatalStartup`): missing config, KV unreachable,
/// capacity denied. The process exits non-zero immediately on these.
#[derive(Debug, Error)]
pub enum FatalStartupError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("database unreachable: {0}")]
    Database(String),

    #[error("distributed store unreachable: {0}")]
    KvStore(String),

    #[error("capacity denied at startup: {0}")]
    CapacityDenied(String),
}
