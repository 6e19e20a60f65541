//! Typed payloads for the wire topics.
//!
//! Each event struct carries an `EVENT_TYPE` discriminator used by consumer
//! handler registries, and an `envelope()` constructor that stamps a fresh
//! `event_id` and timestamp.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use sy_core::types::{AgentRole, StoryStatus};
use sy_core::Result;

use crate::envelope::EventEnvelope;

// ---------------------------------------------------------------------------
// user.messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserMessageEvent {
    pub project_id: Uuid,
    pub user_id: Uuid,
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<String>,
}

impl UserMessageEvent {
    pub const EVENT_TYPE: &'static str = "user.message";

    pub fn envelope(&self) -> Result<EventEnvelope> {
        EventEnvelope::new(Self::EVENT_TYPE, self)
    }
}

// ---------------------------------------------------------------------------
// agent.routing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingContext {
    pub message_id: Option<Uuid>,
    pub user_message: String,
    #[serde(default)]
    pub selected_options: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRoutingEvent {
    pub from_agent: String,
    pub to_agent: AgentRole,
    pub project_id: Uuid,
    pub user_id: Option<Uuid>,
    pub reason: String,
    pub context: RoutingContext,
}

impl AgentRoutingEvent {
    pub const EVENT_TYPE: &'static str = "agent.routing";

    pub fn envelope(&self) -> Result<EventEnvelope> {
        EventEnvelope::new(Self::EVENT_TYPE, self)
    }
}

// ---------------------------------------------------------------------------
// agent.tasks — lifecycle family
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleKind {
    Started,
    Progress,
    Completed,
    Failed,
    Cancelled,
}

impl LifecycleKind {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LifecycleKind::Completed | LifecycleKind::Failed | LifecycleKind::Cancelled
        )
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            LifecycleKind::Started => TaskStartedEvent::EVENT_TYPE,
            LifecycleKind::Progress => TaskProgressEvent::EVENT_TYPE,
            LifecycleKind::Completed => TaskCompletedEvent::EVENT_TYPE,
            LifecycleKind::Failed => TaskFailedEvent::EVENT_TYPE,
            LifecycleKind::Cancelled => TaskCancelledEvent::EVENT_TYPE,
        }
    }

    pub fn from_event_type(event_type: &str) -> Option<Self> {
        match event_type {
            TaskStartedEvent::EVENT_TYPE => Some(LifecycleKind::Started),
            TaskProgressEvent::EVENT_TYPE => Some(LifecycleKind::Progress),
            TaskCompletedEvent::EVENT_TYPE => Some(LifecycleKind::Completed),
            TaskFailedEvent::EVENT_TYPE => Some(LifecycleKind::Failed),
            TaskCancelledEvent::EVENT_TYPE => Some(LifecycleKind::Cancelled),
            _ => None,
        }
    }
}

/// Fields common to every lifecycle event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRef {
    pub task_id: Uuid,
    pub agent_id: Uuid,
    pub agent_name: String,
    pub execution_id: Option<Uuid>,
    pub project_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStartedEvent {
    #[serde(flatten)]
    pub task: TaskRef,
    pub started_at: DateTime<Utc>,
}

impl TaskStartedEvent {
    pub const EVENT_TYPE: &'static str = "task.started";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskProgressEvent {
    #[serde(flatten)]
    pub task: TaskRef,
    /// 0..=100.
    pub progress_percentage: u8,
    pub current_step: String,
    pub steps_completed: u32,
    pub total_steps: u32,
}

impl TaskProgressEvent {
    pub const EVENT_TYPE: &'static str = "task.progress";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCompletedEvent {
    #[serde(flatten)]
    pub task: TaskRef,
    pub completed_at: DateTime<Utc>,
    pub duration_seconds: u64,
    pub result: Option<serde_json::Value>,
    pub artifacts: Option<serde_json::Value>,
}

impl TaskCompletedEvent {
    pub const EVENT_TYPE: &'static str = "task.completed";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskFailedEvent {
    #[serde(flatten)]
    pub task: TaskRef,
    pub failed_at: DateTime<Utc>,
    pub error_message: String,
    pub error_type: Option<String>,
    pub retry_count: u32,
    pub can_retry: bool,
}

impl TaskFailedEvent {
    pub const EVENT_TYPE: &'static str = "task.failed";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCancelledEvent {
    #[serde(flatten)]
    pub task: TaskRef,
    pub cancelled_at: DateTime<Utc>,
    pub cancelled_by: String,
    pub reason: Option<String>,
}

impl TaskCancelledEvent {
    pub const EVENT_TYPE: &'static str = "task.cancelled";
}

// ---------------------------------------------------------------------------
// story.events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoryStatusEvent {
    pub story_id: Uuid,
    pub project_id: Uuid,
    pub from_status: StoryStatus,
    pub to_status: StoryStatus,
}

impl StoryStatusEvent {
    pub const EVENT_TYPE: &'static str = "story.status_changed";

    pub fn envelope(&self) -> Result<EventEnvelope> {
        EventEnvelope::new(Self::EVENT_TYPE, self)
    }
}

// ---------------------------------------------------------------------------
// artifacts.events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactEvent {
    pub artifact_id: Uuid,
    pub project_id: Uuid,
    pub status: String,
    pub version: u32,
}

impl ArtifactEvent {
    pub const EVENT_TYPE: &'static str = "artifact.updated";

    pub fn envelope(&self) -> Result<EventEnvelope> {
        EventEnvelope::new(Self::EVENT_TYPE, self)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_kind_round_trips_event_types() {
        for kind in [
            LifecycleKind::Started,
            LifecycleKind::Progress,
            LifecycleKind::Completed,
            LifecycleKind::Failed,
            LifecycleKind::Cancelled,
        ] {
            assert_eq!(LifecycleKind::from_event_type(kind.event_type()), Some(kind));
        }
        assert_eq!(LifecycleKind::from_event_type("user.message"), None);
    }

    #[test]
    fn terminal_kinds() {
        assert!(!LifecycleKind::Started.is_terminal());
        assert!(!LifecycleKind::Progress.is_terminal());
        assert!(LifecycleKind::Completed.is_terminal());
        assert!(LifecycleKind::Failed.is_terminal());
        assert!(LifecycleKind::Cancelled.is_terminal());
    }

    #[test]
    fn routing_event_envelope_carries_discriminator() {
        let event = AgentRoutingEvent {
            from_agent: "team_leader".into(),
            to_agent: AgentRole::Developer,
            project_id: Uuid::new_v4(),
            user_id: None,
            reason: "implementation request".into(),
            context: RoutingContext {
                message_id: None,
                user_message: "build the login form".into(),
                selected_options: Vec::new(),
            },
        };
        let env = event.envelope().unwrap();
        assert_eq!(env.event_type, AgentRoutingEvent::EVENT_TYPE);
        let decoded: AgentRoutingEvent = env.decode().unwrap();
        assert_eq!(decoded.to_agent, AgentRole::Developer);
    }

    #[test]
    fn task_ref_flattens_into_payload() {
        let event = TaskStartedEvent {
            task: TaskRef {
                task_id: Uuid::new_v4(),
                agent_id: Uuid::new_v4(),
                agent_name: "dev-1".into(),
                execution_id: None,
                project_id: None,
            },
            started_at: Utc::now(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert!(value.get("task_id").is_some());
        assert!(value.get("task").is_none());
    }
}
