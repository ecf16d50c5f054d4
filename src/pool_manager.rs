//! Pool Manager (§4.3): owns the fixed pool size and re-balances worker
//! mode assignments between the `index` and `acte` job classes based on
//! observed queue composition, never violating the configured minima.
//!
//! Grounded in `rate_limit::memory`'s state-holder shape (a `Mutex`-guarded
//! map behind a cheaply cloneable handle) — the Pool Manager has no
//! teacher counterpart of its own, so it borrows that structural pattern.

use std::collections::HashMap;

use tokio::sync::Mutex;

use crate::config::PoolConfig;
use crate::models::WorkerMode;
use crate::repository;

/// §4.3 `initial_allocation`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub index: u32,
    pub acte: u32,
}

struct State {
    assignments: HashMap<String, WorkerMode>,
}

/// Shared handle a worker consults at each poll (§4.9 step 2) and the
/// rebalancing task mutates on a timer (§4.3 `rebalance`).
pub struct PoolManager {
    config: PoolConfig,
    state: Mutex<State>,
}

impl PoolManager {
    pub fn new(config: PoolConfig) -> Self {
        Self { config, state: Mutex::new(State { assignments: HashMap::new() }) }
    }

    /// §4.3 `initial_allocation`: flex share distributed toward `index` by
    /// default.
    pub fn initial_allocation(&self) -> Allocation {
        let flex = self.config.pool_size.saturating_sub(self.config.min_index_workers + self.config.min_acte_workers);
        Allocation { index: self.config.min_index_workers + flex, acte: self.config.min_acte_workers }
    }

    /// §4.3 `assign_mode`: persisted via the worker-heartbeats table so a
    /// crashed worker resumes its last mode (caller is responsible for the
    /// DB write; this updates the in-memory view other callers observe).
    pub async fn assign_mode(&self, worker_id: &str, mode: WorkerMode) {
        self.state.lock().await.assignments.insert(worker_id.to_string(), mode);
    }

    /// A worker's current mode, defaulting to `index` if never assigned
    /// (first poll of a brand new worker before `initial_allocation` has
    /// been applied to it).
    pub async fn mode_of(&self, worker_id: &str) -> WorkerMode {
        self.state.lock().await.assignments.get(worker_id).copied().unwrap_or(WorkerMode::Index)
    }

    /// §4.3 `current_allocation`.
    pub async fn current_allocation(&self) -> Allocation {
        let state = self.state.lock().await;
        let index = state.assignments.values().filter(|m| **m == WorkerMode::Index).count() as u32;
        let acte = state.assignments.values().filter(|m| **m == WorkerMode::Acte).count() as u32;
        Allocation { index, acte }
    }

    /// §4.3 `rebalance`: if one class has `>= rebalance_threshold` pending
    /// jobs and the other doesn't, shift one flex worker to the heavier
    /// class without violating either minimum. Returns the worker_id moved,
    /// if any. Mode changes only take effect for a worker at its *next*
    /// claim poll (§4.3, §5) — this method only updates the assignment map;
    /// it never interrupts an in-flight job.
    pub async fn rebalance(&self, pending_index: u64, pending_acte: u64) -> Option<(String, WorkerMode)> {
        let threshold = self.config.rebalance_threshold as u64;

        let (heavy, donor) = if pending_index >= threshold && pending_acte < threshold {
            (WorkerMode::Index, WorkerMode::Acte)
        } else if pending_acte >= threshold && pending_index < threshold {
            (WorkerMode::Acte, WorkerMode::Index)
        } else {
            return None;
        };
        let donor_min = match donor {
            WorkerMode::Index => self.config.min_index_workers,
            WorkerMode::Acte => self.config.min_acte_workers,
        };

        let mut state = self.state.lock().await;
        let donor_count = state.assignments.values().filter(|m| **m == donor).count() as u32;
        if donor_count <= donor_min {
            return None;
        }

        let candidate = state
            .assignments
            .iter()
            .find(|(_, mode)| **mode == donor)
            .map(|(id, _)| id.clone())?;

        state.assignments.insert(candidate.clone(), heavy);
        Some((candidate, heavy))
    }
}

/// Resolve a worker's starting mode: the persisted last-known mode if the
/// worker has checked in before, otherwise the pool's flex-weighted default
/// (§4.3: "workers recovering from crash resume their last mode").
pub fn resolve_initial_mode(
    conn: &rusqlite::Connection,
    worker_id: &str,
    default: WorkerMode,
) -> WorkerMode {
    repository::heartbeats::last_mode(conn, worker_id)
        .ok()
        .flatten()
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> PoolConfig {
        PoolConfig {
            pool_size: 6,
            min_index_workers: 2,
            min_acte_workers: 2,
            rebalance_interval_ms: 1000,
            rebalance_threshold: 5,
            poll_interval_ms: 100,
            idle_close_ms: 1000,
        }
    }

    #[test]
    fn initial_allocation_gives_flex_to_index() {
        let pm = PoolManager::new(config());
        let alloc = pm.initial_allocation();
        assert_eq!(alloc, Allocation { index: 4, acte: 2 });
    }

    #[tokio::test]
    async fn rebalance_never_violates_minima() {
        let pm = PoolManager::new(config());
        for i in 0..2 {
            pm.assign_mode(&format!("idx{i}"), WorkerMode::Index).await;
        }
        for i in 0..2 {
            pm.assign_mode(&format!("acte{i}"), WorkerMode::Acte).await;
        }
        // index is the donor here and sits at its minimum already.
        let moved = pm.rebalance(0, 100).await;
        assert!(moved.is_none(), "donor class is at its minimum, must not go lower");
    }

    #[tokio::test]
    async fn rebalance_moves_flex_worker_to_heavier_class() {
        let pm = PoolManager::new(config());
        for i in 0..2 {
            pm.assign_mode(&format!("idx{i}"), WorkerMode::Index).await;
        }
        for i in 0..4 {
            pm.assign_mode(&format!("acte{i}"), WorkerMode::Acte).await;
        }
        let moved = pm.rebalance(100, 0).await;
        assert!(moved.is_some());
        let (_, to) = moved.unwrap();
        assert_eq!(to, WorkerMode::Index);

        let alloc = pm.current_allocation().await;
        assert!(alloc.acte >= 2, "must never drop below min_acte_workers");
    }

    #[tokio::test]
    async fn mode_of_unassigned_worker_defaults_to_index() {
        let pm = PoolManager::new(config());
        assert_eq!(pm.mode_of("fresh-worker").await, WorkerMode::Index);
    }
}
