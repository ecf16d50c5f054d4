//! Capacity Budget (§4.2): a server-level CPU/RAM allocation ledger shared
//! across heterogeneous worker classes, admitting or denying worker starts.
//!
//! Structurally the same shape as [`crate::rate_limit`] (a shared-state
//! handle backed by an in-memory or Redis store); the two differ only in
//! what they count — requests/tokens per minute vs. CPU/RAM per worker.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::config::{CapacityConfig, ClassCost};
use crate::error::BudgetResult;

/// Outcome of `check` (§4.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapacityDecision {
    Allowed,
    Denied { reason: String, current_cpu: u32, current_ram: u32, available_cpu: u32, available_ram: u32 },
}

#[async_trait]
pub trait CapacityBackend: Send + Sync {
    async fn allocated(&self) -> BudgetResult<(u32, u32)>;
    async fn allocate(&self, worker_id: &str, cpu: u32, ram: u32) -> BudgetResult<()>;
    async fn release(&self, worker_id: &str) -> BudgetResult<()>;
}

#[derive(Debug, Clone, Copy, Default)]
struct Allocation {
    cpu: u32,
    ram: u32,
}

pub struct InMemoryCapacityBackend {
    allocations: Mutex<HashMap<String, Allocation>>,
}

impl InMemoryCapacityBackend {
    pub fn new() -> Self {
        Self { allocations: Mutex::new(HashMap::new()) }
    }
}

impl Default for InMemoryCapacityBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CapacityBackend for InMemoryCapacityBackend {
    async fn allocated(&self) -> BudgetResult<(u32, u32)> {
        let allocations = self.allocations.lock().await;
        let cpu = allocations.values().map(|a| a.cpu).sum();
        let ram = allocations.values().map(|a| a.ram).sum();
        Ok((cpu, ram))
    }

    async fn allocate(&self, worker_id: &str, cpu: u32, ram: u32) -> BudgetResult<()> {
        self.allocations.lock().await.insert(worker_id.to_string(), Allocation { cpu, ram });
        Ok(())
    }

    async fn release(&self, worker_id: &str) -> BudgetResult<()> {
        self.allocations.lock().await.remove(worker_id);
        Ok(())
    }
}

/// Redis-backed ledger: a hash of `worker_id -> "cpu:ram"`, summed on
/// `allocated()`. Grounded in the same atomic-hash-field pattern as
/// `rate_limit::RedisRateLimitBackend`.
#[cfg(feature = "redis-backend")]
pub struct RedisCapacityBackend {
    conn: redis::aio::ConnectionManager,
}

#[cfg(feature = "redis-backend")]
impl RedisCapacityBackend {
    pub async fn new(redis_url: &str) -> BudgetResult<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| crate::error::BudgetError::Backend(e.to_string()))?;
        let conn = redis::aio::ConnectionManager::new(client)
            .await
            .map_err(|e| crate::error::BudgetError::Backend(e.to_string()))?;
        Ok(Self { conn })
    }

    const KEY: &'static str = "ocr-pool:capacity:allocations";
}

#[cfg(feature = "redis-backend")]
#[async_trait]
impl CapacityBackend for RedisCapacityBackend {
    async fn allocated(&self) -> BudgetResult<(u32, u32)> {
        use redis::AsyncCommands;
        let mut conn = self.conn.clone();
        let entries: HashMap<String, String> = conn.hgetall(Self::KEY).await.map_err(crate::error::BudgetError::from)?;
        let mut cpu_total = 0;
        let mut ram_total = 0;
        for v in entries.values() {
            if let Some((cpu, ram)) = v.split_once(':') {
                cpu_total += cpu.parse::<u32>().unwrap_or(0);
                ram_total += ram.parse::<u32>().unwrap_or(0);
            }
        }
        Ok((cpu_total, ram_total))
    }

    async fn allocate(&self, worker_id: &str, cpu: u32, ram: u32) -> BudgetResult<()> {
        use redis::AsyncCommands;
        let mut conn = self.conn.clone();
        let _: () = conn.hset(Self::KEY, worker_id, format!("{cpu}:{ram}")).await.map_err(crate::error::BudgetError::from)?;
        Ok(())
    }

    async fn release(&self, worker_id: &str) -> BudgetResult<()> {
        use redis::AsyncCommands;
        let mut conn = self.conn.clone();
        let _: () = conn.hdel(Self::KEY, worker_id).await.map_err(crate::error::BudgetError::from)?;
        Ok(())
    }
}

/// The handle passed explicitly to the Job Monitor / worker startup path.
#[derive(Clone)]
pub struct CapacityBudget {
    backend: Arc<dyn CapacityBackend>,
    config: CapacityConfig,
}

impl CapacityBudget {
    pub fn new(backend: Arc<dyn CapacityBackend>, config: CapacityConfig) -> Self {
        Self { backend, config }
    }

    fn class_cost(&self, class: &str) -> ClassCost {
        self.config.class_costs.get(class).copied().unwrap_or(ClassCost { cpu: 1, ram: 1 })
    }

    fn reserved_cpu(&self) -> u32 {
        self.config.server_max_cpu * self.config.server_reserve_cpu_percent / 100
    }

    fn reserved_ram(&self) -> u32 {
        self.config.server_max_ram * self.config.server_reserve_ram_percent / 100
    }

    /// §4.2 `check`: Allowed iff the class's cost fits under remaining
    /// capacity after reservation.
    pub async fn check(&self, class: &str) -> BudgetResult<CapacityDecision> {
        let cost = self.class_cost(class);
        let (allocated_cpu, allocated_ram) = self.backend.allocated().await?;
        let available_cpu = (self.config.server_max_cpu - self.reserved_cpu()).saturating_sub(allocated_cpu);
        let available_ram = (self.config.server_max_ram - self.reserved_ram()).saturating_sub(allocated_ram);

        if cost.cpu <= available_cpu && cost.ram <= available_ram {
            Ok(CapacityDecision::Allowed)
        } else {
            Ok(CapacityDecision::Denied {
                reason: format!("class '{class}' needs cpu={} ram={}", cost.cpu, cost.ram),
                current_cpu: allocated_cpu,
                current_ram: allocated_ram,
                available_cpu,
                available_ram,
            })
        }
    }

    pub async fn allocate(&self, worker_id: &str, class: &str) -> BudgetResult<()> {
        let cost = self.class_cost(class);
        self.backend.allocate(worker_id, cost.cpu, cost.ram).await
    }

    pub async fn release(&self, worker_id: &str) -> BudgetResult<()> {
        self.backend.release(worker_id).await
    }
}
