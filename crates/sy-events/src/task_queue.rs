//! Task lifecycle facade.
//!
//! A thin publisher over the broker that hides envelope plumbing from agents.
//! Lifecycle events for one task are partitioned on the task id, so their
//! order is preserved end to end.

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use sy_core::Result;

use crate::broker::Broker;
use crate::envelope::{topics, EventEnvelope};
use crate::schemas::{
    TaskCancelledEvent, TaskCompletedEvent, TaskFailedEvent, TaskProgressEvent, TaskRef,
    TaskStartedEvent,
};

/// Per-agent handle for publishing task lifecycle events.
#[derive(Clone)]
pub struct TaskLifecycleQueue {
    broker: Arc<dyn Broker>,
    agent_id: Uuid,
    agent_name: String,
    project_id: Option<Uuid>,
}

impl TaskLifecycleQueue {
    pub fn new(
        broker: Arc<dyn Broker>,
        agent_id: Uuid,
        agent_name: impl Into<String>,
        project_id: Option<Uuid>,
    ) -> Self {
        Self {
            broker,
            agent_id,
            agent_name: agent_name.into(),
            project_id,
        }
    }

    fn task_ref(&self, task_id: Uuid, execution_id: Option<Uuid>) -> TaskRef {
        TaskRef {
            task_id,
            agent_id: self.agent_id,
            agent_name: self.agent_name.clone(),
            execution_id,
            project_id: self.project_id,
        }
    }

    fn publish(&self, task_id: Uuid, envelope: EventEnvelope) -> Result<()> {
        self.broker
            .publish(topics::AGENT_TASKS, &task_id.to_string(), envelope)
    }

    pub fn start_task(&self, task_id: Uuid, execution_id: Uuid) -> Result<()> {
        let event = TaskStartedEvent {
            task: self.task_ref(task_id, Some(execution_id)),
            started_at: Utc::now(),
        };
        self.publish(task_id, EventEnvelope::new(TaskStartedEvent::EVENT_TYPE, &event)?)?;
        tracing::info!(task = %task_id, agent = %self.agent_name, "task started");
        Ok(())
    }

    pub fn report_progress(
        &self,
        task_id: Uuid,
        execution_id: Option<Uuid>,
        progress_percentage: u8,
        current_step: impl Into<String>,
        steps_completed: u32,
        total_steps: u32,
    ) -> Result<()> {
        let event = TaskProgressEvent {
            task: self.task_ref(task_id, execution_id),
            progress_percentage: progress_percentage.min(100),
            current_step: current_step.into(),
            steps_completed,
            total_steps,
        };
        self.publish(task_id, EventEnvelope::new(TaskProgressEvent::EVENT_TYPE, &event)?)?;
        tracing::debug!(task = %task_id, progress = event.progress_percentage, "task progress");
        Ok(())
    }

    pub fn complete_task(
        &self,
        task_id: Uuid,
        execution_id: Uuid,
        result: Option<serde_json::Value>,
        duration_seconds: u64,
    ) -> Result<()> {
        let event = TaskCompletedEvent {
            task: self.task_ref(task_id, Some(execution_id)),
            completed_at: Utc::now(),
            duration_seconds,
            result,
            artifacts: None,
        };
        self.publish(task_id, EventEnvelope::new(TaskCompletedEvent::EVENT_TYPE, &event)?)?;
        tracing::info!(
            task = %task_id, agent = %self.agent_name, duration_seconds,
            "task completed"
        );
        Ok(())
    }

    pub fn fail_task(
        &self,
        task_id: Uuid,
        execution_id: Option<Uuid>,
        error_message: impl Into<String>,
        error_type: Option<String>,
        retry_count: u32,
        can_retry: bool,
    ) -> Result<()> {
        let error_message = error_message.into();
        let event = TaskFailedEvent {
            task: self.task_ref(task_id, execution_id),
            failed_at: Utc::now(),
            error_message: error_message.clone(),
            error_type,
            retry_count,
            can_retry,
        };
        self.publish(task_id, EventEnvelope::new(TaskFailedEvent::EVENT_TYPE, &event)?)?;
        tracing::error!(task = %task_id, agent = %self.agent_name, error = %error_message, "task failed");
        Ok(())
    }

    pub fn cancel_task(
        &self,
        task_id: Uuid,
        cancelled_by: impl Into<String>,
        reason: Option<String>,
    ) -> Result<()> {
        let event = TaskCancelledEvent {
            task: self.task_ref(task_id, None),
            cancelled_at: Utc::now(),
            cancelled_by: cancelled_by.into(),
            reason,
        };
        self.publish(task_id, EventEnvelope::new(TaskCancelledEvent::EVENT_TYPE, &event)?)?;
        tracing::info!(task = %task_id, "task cancelled");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InProcessBroker;
    use crate::schemas::LifecycleKind;

    #[test]
    fn lifecycle_events_share_a_partition() {
        let broker = InProcessBroker::shared(4);
        let sub = broker.subscribe(&[topics::AGENT_TASKS], "watcher");
        let queue = TaskLifecycleQueue::new(broker, Uuid::new_v4(), "dev-1", None);

        let task_id = Uuid::new_v4();
        let execution_id = Uuid::new_v4();
        queue.start_task(task_id, execution_id).unwrap();
        queue
            .report_progress(task_id, Some(execution_id), 50, "step 1", 1, 2)
            .unwrap();
        queue
            .complete_task(task_id, execution_id, None, 3)
            .unwrap();

        let mut kinds = Vec::new();
        let mut partitions_hit = 0;
        for (_, _, rx) in &sub.partitions {
            let mut hit = false;
            while let Ok(env) = rx.try_recv() {
                kinds.push(LifecycleKind::from_event_type(&env.event_type).unwrap());
                hit = true;
            }
            if hit {
                partitions_hit += 1;
            }
        }
        assert_eq!(partitions_hit, 1);
        assert_eq!(
            kinds,
            vec![
                LifecycleKind::Started,
                LifecycleKind::Progress,
                LifecycleKind::Completed
            ]
        );
    }

    #[test]
    fn progress_clamps_to_100() {
        let broker = InProcessBroker::shared(1);
        let sub = broker.subscribe(&[topics::AGENT_TASKS], "watcher");
        let queue = TaskLifecycleQueue::new(broker, Uuid::new_v4(), "dev-1", None);

        queue
            .report_progress(Uuid::new_v4(), None, 250, "overshoot", 9, 2)
            .unwrap();

        let env = sub.partitions[0].2.try_recv().unwrap();
        let event: TaskProgressEvent = env.decode().unwrap();
        assert_eq!(event.progress_percentage, 100);
    }
}
