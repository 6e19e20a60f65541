//! Worker pool management for role agents.
//!
//! Typed per-role pools with admission control, health supervision, and
//! metrics snapshots, plus the system-wide monitor that aggregates and logs
//! pool statistics on a cadence.

pub mod metrics;
pub mod monitor;
pub mod pool;

pub use metrics::{MetricsStore, PoolMetricsSnapshot};
pub use monitor::{AgentMonitor, SystemStats, DEFAULT_MONITOR_INTERVAL};
pub use pool::{AgentLease, AgentPool, AlwaysHealthy, HealthProbe, PoolConfig, PoolStats};
