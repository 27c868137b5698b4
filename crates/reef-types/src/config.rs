//! Tuning sections shared by the planner, recovery and engine crates.
//!
//! Both sections deserialize from TOML with `#[serde(default)]`, so a
//! config file only needs to name the values it overrides.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// `[recovery]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Recovery sessions allowed to transfer data at the same time.
    pub max_concurrent: usize,
    /// Attempts per session before it is reported as failed.
    pub max_attempts: u32,
    /// Backoff before the second attempt; doubles on each retry.
    pub retry_backoff_ms: u64,
    /// Bandwidth ceiling for snapshot transfers.
    pub max_bytes_per_sec: u64,
}

impl RecoveryConfig {
    /// Backoff to wait after `attempt` failed attempts (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(factor))
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 2,
            max_attempts: 3,
            retry_backoff_ms: 50,
            max_bytes_per_sec: 41_943_040, // 40 MB/s
        }
    }
}

/// `[allocation]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocationConfig {
    /// Move STARTED copies when per-node counts drift more than one apart.
    pub rebalance_enabled: bool,
    /// Relocations the planner may start in one pass.
    pub max_concurrent_rebalance: usize,
}

impl Default for AllocationConfig {
    fn default() -> Self {
        Self {
            rebalance_enabled: true,
            max_concurrent_rebalance: 1,
        }
    }
}
