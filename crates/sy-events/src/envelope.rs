use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use sy_core::{CoreError, Result};

// ---------------------------------------------------------------------------
// Topic
// ---------------------------------------------------------------------------

/// A named event topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Topic(pub &'static str);

impl Topic {
    pub fn as_str(&self) -> &'static str {
        self.0
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0)
    }
}

pub mod topics {
    use super::Topic;

    pub const USER_MESSAGES: Topic = Topic("user.messages");
    pub const AGENT_ROUTING: Topic = Topic("agent.routing");
    pub const AGENT_TASKS: Topic = Topic("agent.tasks");
    pub const STORY_EVENTS: Topic = Topic("story.events");
    pub const ARTIFACT_EVENTS: Topic = Topic("artifacts.events");

    pub const ALL: [Topic; 5] = [
        USER_MESSAGES,
        AGENT_ROUTING,
        AGENT_TASKS,
        STORY_EVENTS,
        ARTIFACT_EVENTS,
    ];
}

// ---------------------------------------------------------------------------
// EventEnvelope
// ---------------------------------------------------------------------------

/// Self-describing wire envelope carried on every topic.
///
/// `event_id` is the idempotency key for consumers; `event_type` selects the
/// handler; the payload is a structured document decoded on demand.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_id: Uuid,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl EventEnvelope {
    pub fn new<T: Serialize>(event_type: impl Into<String>, payload: &T) -> Result<Self> {
        Ok(Self {
            event_id: Uuid::new_v4(),
            event_type: event_type.into(),
            timestamp: Utc::now(),
            payload: serde_json::to_value(payload)
                .map_err(|e| CoreError::Internal(format!("encode event payload: {e}")))?,
        })
    }

    /// Decode the payload into a typed event.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            CoreError::Validation(format!(
                "malformed {} payload (event {}): {e}",
                self.event_type, self.event_id
            ))
        })
    }
}
