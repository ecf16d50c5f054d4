//! Rate Budget (§4.1): a process-wide per-provider requests/min and
//! tokens/min budget shared across all workers via a distributed counter.
//!
//! Grounded in the teacher's `rate_limit/backend.rs` trait-plus-backends
//! split and `rate_limit/redis.rs`'s atomic Lua-script admission, adapted
//! from a per-domain delay model to the spec's windowed rpm/tpm budget.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::BudgetResult;
use crate::models::WorkerMode;

/// Outcome of `try_admit` (§4.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    Deferred { retry_after_ms: u64 },
}

/// `RateLimitBackend`: the storage abstraction for the rpm/tpm window,
/// mirroring the teacher's `RateLimitBackend` trait so an in-memory impl
/// (tests, single-process dev) and a Redis impl (production, multi-process)
/// can be swapped without touching callers.
#[async_trait]
pub trait RateLimitBackend: Send + Sync {
    async fn try_admit(&self, provider: &str, estimated_tokens: u32, rpm_max: u32, tpm_max: u32) -> BudgetResult<Admission>;
    async fn register_worker(&self, worker_id: &str, class: WorkerMode) -> BudgetResult<()>;
    async fn deregister_worker(&self, worker_id: &str) -> BudgetResult<()>;
    async fn active_workers_by_class(&self) -> BudgetResult<HashMap<WorkerMode, u32>>;
    /// Zero `rpm_used`/`tpm_used` at each minute boundary. Safe to call
    /// redundantly from multiple processes (§4.1).
    async fn reset_window_if_elapsed(&self) -> BudgetResult<()>;
}

#[derive(Debug, Default, Clone)]
struct ProviderWindow {
    rpm_used: u32,
    tpm_used: u32,
    window_start: i64,
}

/// In-memory backend: a single process's view of the budget, for tests and
/// single-worker-process deployments. Not distributed.
pub struct InMemoryRateLimitBackend {
    windows: Mutex<HashMap<String, ProviderWindow>>,
    active: Mutex<HashMap<String, WorkerMode>>,
    window_secs: i64,
}

impl InMemoryRateLimitBackend {
    pub fn new() -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            active: Mutex::new(HashMap::new()),
            window_secs: 60,
        }
    }

    fn now_secs() -> i64 {
        chrono::Utc::now().timestamp()
    }
}

impl Default for InMemoryRateLimitBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RateLimitBackend for InMemoryRateLimitBackend {
    async fn try_admit(&self, provider: &str, estimated_tokens: u32, rpm_max: u32, tpm_max: u32) -> BudgetResult<Admission> {
        let mut windows = self.windows.lock().await;
        let now = Self::now_secs();
        let window = windows.entry(provider.to_string()).or_insert_with(|| ProviderWindow {
            rpm_used: 0,
            tpm_used: 0,
            window_start: now,
        });

        if now - window.window_start >= self.window_secs {
            window.rpm_used = 0;
            window.tpm_used = 0;
            window.window_start = now;
        }

        if window.rpm_used < rpm_max && window.tpm_used + estimated_tokens <= tpm_max {
            window.rpm_used += 1;
            window.tpm_used += estimated_tokens;
            Ok(Admission::Admitted)
        } else {
            let elapsed = now - window.window_start;
            let remaining = (self.window_secs - elapsed).max(0) as u64;
            Ok(Admission::Deferred { retry_after_ms: remaining * 1000 })
        }
    }

    async fn register_worker(&self, worker_id: &str, class: WorkerMode) -> BudgetResult<()> {
        self.active.lock().await.insert(worker_id.to_string(), class);
        Ok(())
    }

    async fn deregister_worker(&self, worker_id: &str) -> BudgetResult<()> {
        self.active.lock().await.remove(worker_id);
        Ok(())
    }

    async fn active_workers_by_class(&self) -> BudgetResult<HashMap<WorkerMode, u32>> {
        let active = self.active.lock().await;
        let mut counts = HashMap::new();
        for class in active.values() {
            *counts.entry(*class).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn reset_window_if_elapsed(&self) -> BudgetResult<()> {
        let mut windows = self.windows.lock().await;
        let now = Self::now_secs();
        for window in windows.values_mut() {
            if now - window.window_start >= self.window_secs {
                window.rpm_used = 0;
                window.tpm_used = 0;
                window.window_start = now;
            }
        }
        Ok(())
    }
}

/// Redis-backed budget: atomic admission via a Lua script keyed per
/// provider, TTL'd to the window so a crashed process never leaves a
/// window open. Grounded directly in `rate_limit/redis.rs::acquire`'s
/// Lua-script shape.
#[cfg(feature = "redis-backend")]
pub struct RedisRateLimitBackend {
    conn: redis::aio::ConnectionManager,
}

#[cfg(feature = "redis-backend")]
impl RedisRateLimitBackend {
    pub async fn new(redis_url: &str) -> BudgetResult<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| crate::error::BudgetError::Backend(e.to_string()))?;
        let conn = redis::aio::ConnectionManager::new(client)
            .await
            .map_err(|e| crate::error::BudgetError::Backend(e.to_string()))?;
        Ok(Self { conn })
    }

    fn window_key(provider: &str) -> String {
        format!("ocr-pool:ratebudget:{provider}")
    }
}

#[cfg(feature = "redis-backend")]
#[async_trait]
impl RateLimitBackend for RedisRateLimitBackend {
    async fn try_admit(&self, provider: &str, estimated_tokens: u32, rpm_max: u32, tpm_max: u32) -> BudgetResult<Admission> {
        use redis::Script;

        let script = Script::new(
            r#"
            local key = KEYS[1]
            local rpm_max = tonumber(ARGV[1])
            local tpm_max = tonumber(ARGV[2])
            local tokens = tonumber(ARGV[3])
            local window_secs = tonumber(ARGV[4])

            local rpm = tonumber(redis.call('HGET', key, 'rpm')) or 0
            local tpm = tonumber(redis.call('HGET', key, 'tpm')) or 0

            if rpm + 1 <= rpm_max and tpm + tokens <= tpm_max then
                redis.call('HINCRBY', key, 'rpm', 1)
                redis.call('HINCRBY', key, 'tpm', tokens)
                redis.call('EXPIRE', key, window_secs)
                return 0
            else
                local ttl = redis.call('TTL', key)
                if ttl < 0 then ttl = window_secs end
                return ttl
            end
            "#,
        );

        let mut conn = self.conn.clone();
        let retry_after_secs: i64 = script
            .key(Self::window_key(provider))
            .arg(rpm_max)
            .arg(tpm_max)
            .arg(estimated_tokens)
            .arg(60)
            .invoke_async(&mut conn)
            .await
            .map_err(crate::error::BudgetError::from)?;

        if retry_after_secs == 0 {
            Ok(Admission::Admitted)
        } else {
            Ok(Admission::Deferred { retry_after_ms: retry_after_secs.max(0) as u64 * 1000 })
        }
    }

    async fn register_worker(&self, worker_id: &str, class: WorkerMode) -> BudgetResult<()> {
        use redis::AsyncCommands;
        let mut conn = self.conn.clone();
        let class_str = match class {
            WorkerMode::Index => "index",
            WorkerMode::Acte => "acte",
        };
        let _: () = conn
            .hset("ocr-pool:ratebudget:active-workers", worker_id, class_str)
            .await
            .map_err(crate::error::BudgetError::from)?;
        Ok(())
    }

    async fn deregister_worker(&self, worker_id: &str) -> BudgetResult<()> {
        use redis::AsyncCommands;
        let mut conn = self.conn.clone();
        let _: () = conn
            .hdel("ocr-pool:ratebudget:active-workers", worker_id)
            .await
            .map_err(crate::error::BudgetError::from)?;
        Ok(())
    }

    async fn active_workers_by_class(&self) -> BudgetResult<HashMap<WorkerMode, u32>> {
        use redis::AsyncCommands;
        let mut conn = self.conn.clone();
        let entries: HashMap<String, String> = conn
            .hgetall("ocr-pool:ratebudget:active-workers")
            .await
            .map_err(crate::error::BudgetError::from)?;
        let mut counts = HashMap::new();
        for class_str in entries.values() {
            let class = match class_str.as_str() {
                "index" => WorkerMode::Index,
                "acte" => WorkerMode::Acte,
                _ => continue,
            };
            *counts.entry(class).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn reset_window_if_elapsed(&self) -> BudgetResult<()> {
        // Redis TTL handles expiry automatically; the single periodic tick
        // (§4.1) is a no-op here beyond what `try_admit`'s EXPIRE already does.
        Ok(())
    }
}

/// The handle the Job Monitor holds (§9 "global singletons... process-wide
/// handles passed explicitly"): wraps whichever backend was configured.
#[derive(Clone)]
pub struct RateBudget {
    backend: Arc<dyn RateLimitBackend>,
    limits: Arc<HashMap<String, (u32, u32)>>,
}

impl RateBudget {
    pub fn new(backend: Arc<dyn RateLimitBackend>, limits: HashMap<String, (u32, u32)>) -> Self {
        Self { backend, limits: Arc::new(limits) }
    }

    pub async fn try_admit(&self, provider: &str, estimated_tokens: u32) -> BudgetResult<Admission> {
        let (rpm_max, tpm_max) = self.limits.get(provider).copied().unwrap_or((60, 1_000_000));
        self.backend.try_admit(provider, estimated_tokens, rpm_max, tpm_max).await
    }

    pub async fn register_worker(&self, worker_id: &str, class: WorkerMode) -> BudgetResult<()> {
        self.backend.register_worker(worker_id, class).await
    }

    pub async fn deregister_worker(&self, worker_id: &str) -> BudgetResult<()> {
        self.backend.deregister_worker(worker_id).await
    }

    pub async fn active_workers_by_class(&self) -> BudgetResult<HashMap<WorkerMode, u32>> {
        self.backend.active_workers_by_class().await
    }

    /// Blocks, retrying on `Deferred`, until admission succeeds (§4.1:
    /// "Callers block... rather than queue").
    pub async fn admit_blocking(&self, provider: &str, estimated_tokens: u32) -> BudgetResult<()> {
        loop {
            match self.try_admit(provider, estimated_tokens).await? {
                Admission::Admitted => return Ok(()),
                Admission::Deferred { retry_after_ms } => {
                    tokio::time::sleep(Duration::from_millis(retry_after_ms.min(60_000))).await;
                }
            }
        }
    }
}
