//! Append-only pool metrics snapshots.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::pool::{AgentPool, WindowCounters};

// ---------------------------------------------------------------------------
// PoolMetricsSnapshot
// ---------------------------------------------------------------------------

/// Immutable time-bucketed record of a pool's activity window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolMetricsSnapshot {
    pub id: Uuid,
    pub pool_name: String,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub total_tokens_used: u64,
    pub tokens_per_model: HashMap<String, u64>,
    pub total_requests: u64,
    pub requests_per_model: HashMap<String, u64>,
    pub peak_agent_count: usize,
    pub avg_agent_count: f64,
    pub total_executions: u64,
    pub successful_executions: u64,
    pub failed_executions: u64,
    pub avg_execution_duration_ms: Option<f64>,
}

impl PoolMetricsSnapshot {
    /// Build a snapshot from a drained pool window.
    pub fn from_window(pool_name: &str, window: WindowCounters, period_end: DateTime<Utc>) -> Self {
        let total_tokens_used = window.tokens_per_model.values().sum();
        let total_requests = window.requests_per_model.values().sum();
        let avg_agent_count = if window.agent_count_samples > 0 {
            window.agent_count_sum as f64 / window.agent_count_samples as f64
        } else {
            0.0
        };
        let avg_execution_duration_ms = if window.executions > 0 {
            Some(window.duration_ms_total as f64 / window.executions as f64)
        } else {
            None
        };

        Self {
            id: Uuid::new_v4(),
            pool_name: pool_name.to_string(),
            period_start: window.window_started,
            period_end,
            total_tokens_used,
            tokens_per_model: window.tokens_per_model,
            total_requests,
            requests_per_model: window.requests_per_model,
            peak_agent_count: window.peak_agent_count,
            avg_agent_count,
            total_executions: window.executions,
            successful_executions: window.successes,
            failed_executions: window.failures,
            avg_execution_duration_ms,
        }
    }
}

// ---------------------------------------------------------------------------
// MetricsStore
// ---------------------------------------------------------------------------

/// Append-only store of snapshots, retained by age.
#[derive(Clone, Default)]
pub struct MetricsStore {
    inner: Arc<RwLock<Vec<PoolMetricsSnapshot>>>,
}

impl MetricsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, snapshot: PoolMetricsSnapshot) {
        self.inner.write().unwrap().push(snapshot);
    }

    /// Drain a pool's current window into a stored snapshot.
    pub fn snapshot_pool(&self, pool: &AgentPool) -> PoolMetricsSnapshot {
        let window = pool.drain_window();
        let snapshot = PoolMetricsSnapshot::from_window(pool.name(), window, Utc::now());
        self.append(snapshot.clone());
        snapshot
    }

    /// Snapshots for a pool, newest first.
    pub fn list_for_pool(&self, pool_name: &str, limit: usize) -> Vec<PoolMetricsSnapshot> {
        let mut out: Vec<PoolMetricsSnapshot> = self
            .inner
            .read()
            .unwrap()
            .iter()
            .filter(|s| s.pool_name == pool_name)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.period_start.cmp(&a.period_start));
        out.truncate(limit);
        out
    }

    /// Delete snapshots whose window ended more than `days` ago. Returns the
    /// number removed.
    pub fn cleanup_older_than(&self, days: i64) -> usize {
        let cutoff = Utc::now() - chrono::Duration::days(days);
        let mut snapshots = self.inner.write().unwrap();
        let before = snapshots.len();
        snapshots.retain(|s| s.period_end >= cutoff);
        let removed = before - snapshots.len();
        if removed > 0 {
            tracing::info!(removed, days, "old pool metrics removed");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().unwrap().is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn window() -> WindowCounters {
        let mut w = WindowCounters::default();
        w.tokens_per_model.insert("sonnet".into(), 300);
        w.tokens_per_model.insert("haiku".into(), 100);
        w.requests_per_model.insert("sonnet".into(), 3);
        w.executions = 4;
        w.successes = 3;
        w.failures = 1;
        w.duration_ms_total = 200;
        w.agent_count_sum = 6;
        w.agent_count_samples = 3;
        w.peak_agent_count = 3;
        w
    }

    #[test]
    fn snapshot_aggregates_window() {
        let snapshot = PoolMetricsSnapshot::from_window("dev-pool", window(), Utc::now());
        assert_eq!(snapshot.total_tokens_used, 400);
        assert_eq!(snapshot.total_requests, 3);
        assert_eq!(snapshot.avg_agent_count, 2.0);
        assert_eq!(snapshot.avg_execution_duration_ms, Some(50.0));
        assert_eq!(snapshot.peak_agent_count, 3);
    }

    #[test]
    fn empty_window_has_no_avg_duration() {
        let snapshot =
            PoolMetricsSnapshot::from_window("dev-pool", WindowCounters::default(), Utc::now());
        assert_eq!(snapshot.avg_execution_duration_ms, None);
        assert_eq!(snapshot.avg_agent_count, 0.0);
    }

    #[test]
    fn retention_by_age() {
        let store = MetricsStore::new();
        let mut old = PoolMetricsSnapshot::from_window("p", WindowCounters::default(), Utc::now());
        old.period_end = Utc::now() - chrono::Duration::days(120);
        store.append(old);
        store.append(PoolMetricsSnapshot::from_window(
            "p",
            WindowCounters::default(),
            Utc::now(),
        ));

        assert_eq!(store.cleanup_older_than(90), 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn list_newest_first() {
        let store = MetricsStore::new();
        for days_ago in [3, 1, 2] {
            let mut s =
                PoolMetricsSnapshot::from_window("p", WindowCounters::default(), Utc::now());
            s.period_start = Utc::now() - chrono::Duration::days(days_ago);
            store.append(s);
        }
        let listed = store.list_for_pool("p", 10);
        assert!(listed[0].period_start > listed[1].period_start);
        assert!(listed[1].period_start > listed[2].period_start);
    }
}
