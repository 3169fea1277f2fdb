//! The two bounded agent populations.
//!
//! One mutex guards both maps so every capacity check + insert/remove is
//! a single atomic step. Spawning a child happens outside the lock: the
//! coding pool reserves its slot first and rolls back on spawn failure;
//! the testing pool re-checks capacity when inserting a freshly spawned
//! child and reports overflow so the caller can kill it.
//!
//! Coding agents are keyed by feature id (at most one per feature).
//! Testing agents are keyed by child pid: several may re-verify the same
//! feature concurrently, and keying by feature id would overwrite
//! entries and leak processes.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

/// Hard cap on concurrent coding agents, regardless of configuration.
pub const MAX_PARALLEL_AGENTS: usize = 5;

/// Hard cap on concurrent agents of both kinds combined.
pub const MAX_TOTAL_AGENTS: usize = 10;

/// A coding pool slot. `pid` is 0 between reservation and spawn.
#[derive(Debug, Clone)]
pub struct CodingSlot {
    pub pid: u32,
    /// Abort signal observed by the agent's reader/stop path.
    pub abort: CancellationToken,
}

/// A testing pool slot, keyed externally by child pid.
#[derive(Debug, Clone)]
pub struct TestingSlot {
    pub feature_id: i64,
}

#[derive(Debug, Default)]
struct PoolState {
    coding: HashMap<i64, CodingSlot>,
    testing: HashMap<u32, TestingSlot>,
}

/// Why an agent was refused admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionError {
    #[error("feature {0} already has a coding agent")]
    AlreadyRunning(i64),
    #[error("coding pool is at max concurrency ({0})")]
    AtMaxConcurrency(usize),
    #[error("combined agent cap reached ({0})")]
    AtMaxTotal(usize),
}

/// Both agent populations behind a single lock.
#[derive(Debug, Default)]
pub struct AgentPools {
    state: Mutex<PoolState>,
}

impl AgentPools {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// `(coding, testing)` population sizes.
    pub fn counts(&self) -> (usize, usize) {
        let state = self.lock();
        (state.coding.len(), state.testing.len())
    }

    /// Feature ids currently claimed by the coding pool, sorted.
    pub fn coding_ids(&self) -> Vec<i64> {
        let state = self.lock();
        let mut ids: Vec<i64> = state.coding.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Look up a coding slot (pid + abort handle).
    pub fn coding_slot(&self, feature_id: i64) -> Option<CodingSlot> {
        self.lock().coding.get(&feature_id).cloned()
    }

    /// Atomically check capacity and reserve a coding slot for a feature.
    ///
    /// Returns the slot's abort token. The caller spawns the child
    /// outside the lock and then either [`Self::commit_coding`]s the pid
    /// or [`Self::cancel_coding`]s the reservation.
    pub fn reserve_coding(
        &self,
        feature_id: i64,
        max_concurrency: usize,
    ) -> Result<CancellationToken, AdmissionError> {
        let mut state = self.lock();

        if state.coding.contains_key(&feature_id) {
            return Err(AdmissionError::AlreadyRunning(feature_id));
        }
        if state.coding.len() >= max_concurrency {
            return Err(AdmissionError::AtMaxConcurrency(max_concurrency));
        }
        if state.coding.len() + state.testing.len() >= MAX_TOTAL_AGENTS {
            return Err(AdmissionError::AtMaxTotal(MAX_TOTAL_AGENTS));
        }

        let abort = CancellationToken::new();
        state.coding.insert(
            feature_id,
            CodingSlot {
                pid: 0,
                abort: abort.clone(),
            },
        );
        Ok(abort)
    }

    /// Fill in the pid of a reserved coding slot after a successful spawn.
    pub fn commit_coding(&self, feature_id: i64, pid: u32) {
        if let Some(slot) = self.lock().coding.get_mut(&feature_id) {
            slot.pid = pid;
        }
    }

    /// Roll back a coding reservation whose spawn failed.
    pub fn cancel_coding(&self, feature_id: i64) {
        self.lock().coding.remove(&feature_id);
    }

    /// Remove a coding agent on completion. Returns the slot if it was
    /// still present.
    pub fn remove_coding(&self, feature_id: i64) -> Option<CodingSlot> {
        self.lock().coding.remove(&feature_id)
    }

    /// Whether the testing pool has room for one more agent right now.
    ///
    /// The testing population is bounded by the ratio, by the coding
    /// concurrency limit, and by the combined cap.
    pub fn has_testing_capacity(&self, ratio: usize, max_concurrency: usize) -> bool {
        let state = self.lock();
        let cap = ratio.min(max_concurrency);
        state.testing.len() < cap
            && state.coding.len() + state.testing.len() < MAX_TOTAL_AGENTS
    }

    /// Insert a freshly spawned testing agent, re-checking capacity.
    /// Returns false on overflow; the caller must kill the child.
    pub fn insert_testing(
        &self,
        pid: u32,
        feature_id: i64,
        ratio: usize,
        max_concurrency: usize,
    ) -> bool {
        let mut state = self.lock();
        let cap = ratio.min(max_concurrency);
        if state.testing.len() >= cap
            || state.coding.len() + state.testing.len() >= MAX_TOTAL_AGENTS
        {
            return false;
        }
        state.testing.insert(pid, TestingSlot { feature_id });
        true
    }

    /// Remove a testing agent on completion. Returns the slot if it was
    /// still present (it may have been drained by a shutdown already).
    pub fn remove_testing(&self, pid: u32) -> Option<TestingSlot> {
        self.lock().testing.remove(&pid)
    }

    /// Atomically empty the testing pool, returning the drained entries.
    pub fn drain_testing(&self) -> Vec<(u32, TestingSlot)> {
        self.lock().testing.drain().collect()
    }
}
