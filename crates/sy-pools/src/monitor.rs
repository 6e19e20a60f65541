//! System-wide agent monitor.
//!
//! Background coordinator over a registry of pools: sleep, collect stats,
//! log, optionally emit a metrics snapshot per pool. The monitor never owns
//! agents; a collection failure is logged and the loop continues.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::metrics::MetricsStore;
use crate::pool::{AgentPool, PoolStats};

pub const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// SystemStats
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct SystemStats {
    pub uptime_seconds: f64,
    pub total_pools: usize,
    pub total_agents: usize,
    pub busy_agents: usize,
    pub idle_agents: usize,
    pub total_executions: u64,
    pub successful_executions: u64,
    pub failed_executions: u64,
    pub success_rate: f64,
    pub utilization: f64,
    pub pools: HashMap<String, PoolStats>,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// AgentMonitor
// ---------------------------------------------------------------------------

pub struct AgentMonitor {
    pools: Mutex<HashMap<String, Arc<AgentPool>>>,
    metrics: Option<MetricsStore>,
    interval: Duration,
    started_at: DateTime<Utc>,
    shutdown: CancellationToken,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl AgentMonitor {
    pub fn new(metrics: Option<MetricsStore>, interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            pools: Mutex::new(HashMap::new()),
            metrics,
            interval,
            started_at: Utc::now(),
            shutdown: CancellationToken::new(),
            task: Mutex::new(None),
        })
    }

    pub fn register_pool(&self, pool: Arc<AgentPool>) {
        self.pools
            .lock()
            .unwrap()
            .insert(pool.name().to_string(), pool);
    }

    pub fn pool(&self, name: &str) -> Option<Arc<AgentPool>> {
        self.pools.lock().unwrap().get(name).cloned()
    }

    pub fn pool_names(&self) -> Vec<String> {
        self.pools.lock().unwrap().keys().cloned().collect()
    }

    /// Aggregate statistics over every registered pool.
    pub fn system_stats(&self) -> SystemStats {
        let pools = self.pools.lock().unwrap().clone();
        let mut stats = SystemStats {
            uptime_seconds: (Utc::now() - self.started_at).num_milliseconds() as f64 / 1000.0,
            total_pools: pools.len(),
            total_agents: 0,
            busy_agents: 0,
            idle_agents: 0,
            total_executions: 0,
            successful_executions: 0,
            failed_executions: 0,
            success_rate: 0.0,
            utilization: 0.0,
            pools: HashMap::new(),
            timestamp: Utc::now(),
        };

        for (name, pool) in pools {
            let pool_stats = pool.stats();
            stats.total_agents += pool_stats.total_agents;
            stats.busy_agents += pool_stats.busy_agents;
            stats.idle_agents += pool_stats.idle_agents;
            stats.total_executions += pool_stats.total_executions;
            stats.successful_executions += pool_stats.successful_executions;
            stats.failed_executions += pool_stats.failed_executions;
            stats.pools.insert(name, pool_stats);
        }

        if stats.total_executions > 0 {
            stats.success_rate =
                stats.successful_executions as f64 / stats.total_executions as f64;
        }
        if stats.total_agents > 0 {
            stats.utilization = stats.busy_agents as f64 / stats.total_agents as f64;
        }
        stats
    }

    /// Start the monitoring loop. Idempotent.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock().unwrap();
        if task.is_some() {
            tracing::warn!("monitor already running");
            return;
        }

        let monitor = Arc::clone(self);
        let shutdown = self.shutdown.clone();
        let interval = self.interval;
        *task = Some(tokio::spawn(async move {
            tracing::info!(interval_secs = interval.as_secs(), "agent monitor started");
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => monitor.tick(),
                }
            }
            tracing::info!("agent monitor stopped");
        }));
    }

    /// One collection cycle: log aggregate stats and emit snapshots.
    pub fn tick(&self) {
        let stats = self.system_stats();
        tracing::info!(
            pools = stats.total_pools,
            agents = stats.total_agents,
            busy = stats.busy_agents,
            idle = stats.idle_agents,
            executions = stats.total_executions,
            success_rate = format!("{:.1}%", stats.success_rate * 100.0),
            utilization = format!("{:.1}%", stats.utilization * 100.0),
            "monitor"
        );

        if let Some(metrics) = &self.metrics {
            let pools: Vec<Arc<AgentPool>> = self.pools.lock().unwrap().values().cloned().collect();
            for pool in pools {
                let snapshot = metrics.snapshot_pool(&pool);
                tracing::debug!(
                    pool = %snapshot.pool_name,
                    tokens = snapshot.total_tokens_used,
                    executions = snapshot.total_executions,
                    "pool metrics snapshot"
                );
            }
        }
    }

    /// Stop the loop. Idempotent.
    pub fn stop(&self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.lock().unwrap().take() {
            task.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{AlwaysHealthy, PoolConfig};
    use sy_core::store::PersonaStore;
    use sy_core::types::AgentRole;

    fn test_pool(name: &str, role: AgentRole) -> Arc<AgentPool> {
        let pool = AgentPool::new(
            PoolConfig::new(name, role)
                .with_max_agents(2)
                .with_health_interval(Duration::from_secs(3600)),
            PersonaStore::new(),
            Arc::new(AlwaysHealthy),
        );
        pool.start();
        pool
    }

    #[tokio::test]
    async fn aggregates_across_pools() {
        let monitor = AgentMonitor::new(None, DEFAULT_MONITOR_INTERVAL);
        let dev = test_pool("dev", AgentRole::Developer);
        let qa = test_pool("qa", AgentRole::Tester);
        monitor.register_pool(dev.clone());
        monitor.register_pool(qa.clone());

        let lease = dev
            .acquire(None, Duration::from_millis(50))
            .await
            .unwrap();
        qa.spawn(None, None).unwrap();

        let stats = monitor.system_stats();
        assert_eq!(stats.total_pools, 2);
        assert_eq!(stats.total_agents, 2);
        assert_eq!(stats.busy_agents, 1);
        assert_eq!(stats.idle_agents, 1);
        assert_eq!(stats.utilization, 0.5);

        lease.complete(true, 3);
        let stats = monitor.system_stats();
        assert_eq!(stats.total_executions, 1);
        assert_eq!(stats.success_rate, 1.0);

        dev.stop();
        qa.stop();
    }

    #[tokio::test]
    async fn tick_emits_metrics_snapshots() {
        let metrics = MetricsStore::new();
        let monitor = AgentMonitor::new(Some(metrics.clone()), DEFAULT_MONITOR_INTERVAL);
        let dev = test_pool("dev", AgentRole::Developer);
        dev.record_usage("sonnet", 500, 5);
        monitor.register_pool(dev.clone());

        monitor.tick();
        let snapshots = metrics.list_for_pool("dev", 10);
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].total_tokens_used, 500);
        dev.stop();
    }

    #[tokio::test]
    async fn start_stop_idempotent() {
        let monitor = AgentMonitor::new(None, Duration::from_millis(10));
        monitor.start();
        monitor.start(); // no-op
        tokio::time::sleep(Duration::from_millis(30)).await;
        monitor.stop();
        monitor.stop(); // no-op
    }
}
