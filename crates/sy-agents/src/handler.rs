//! The common task-handling seam over role agents.
//!
//! Roles are a closed sum ([`sy_core::types::AgentRole`]); dynamic dispatch
//! happens over this trait rather than any inheritance hierarchy. Every
//! invocation produces exactly one [`TaskResult`], including cancellations.

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use sy_core::types::{AgentRole, TaskContext, TaskResult};

#[async_trait::async_trait]
pub trait AgentHandler: Send + Sync {
    fn role(&self) -> AgentRole;

    async fn handle_task(&self, task: TaskContext, cancel: CancellationToken) -> TaskResult;
}

// ---------------------------------------------------------------------------
// ProgressSink
// ---------------------------------------------------------------------------

/// Where role graphs report step progress. The daemon wires this to the task
/// lifecycle queue; agents stay decoupled from the broker.
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, task_id: Uuid, percentage: u8, step: &str, completed: u32, total: u32);
}

pub struct NoopProgress;

impl ProgressSink for NoopProgress {
    fn on_progress(&self, _: Uuid, _: u8, _: &str, _: u32, _: u32) {}
}

/// Collects progress reports in memory; used by tests.
#[derive(Default)]
pub struct RecordingProgress {
    pub reports: std::sync::Mutex<Vec<(u8, String, u32, u32)>>,
}

impl ProgressSink for RecordingProgress {
    fn on_progress(&self, _: Uuid, percentage: u8, step: &str, completed: u32, total: u32) {
        self.reports
            .lock()
            .unwrap()
            .push((percentage, step.to_string(), completed, total));
    }
}
