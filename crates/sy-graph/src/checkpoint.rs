//! Checkpoint persistence for graph runs.
//!
//! A checkpoint is written at every node boundary, keyed by thread id. When a
//! node raises an interrupt the pending interrupt is recorded alongside the
//! state, and a later resume event re-enters the graph exactly where it
//! stopped.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state::GraphState;

// ---------------------------------------------------------------------------
// Checkpoint types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterruptRecord {
    pub reason: String,
    /// Node to re-enter on resume.
    pub node: String,
    pub raised_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub thread_id: Uuid,
    /// Node the run will execute next (or is suspended at).
    pub node: String,
    pub state: GraphState,
    pub pending_interrupt: Option<InterruptRecord>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Checkpointer
// ---------------------------------------------------------------------------

pub trait Checkpointer: Send + Sync {
    fn save(&self, checkpoint: Checkpoint);
    fn load(&self, thread_id: Uuid) -> Option<Checkpoint>;
    fn remove(&self, thread_id: Uuid);
}

/// Process-local checkpoint store.
#[derive(Default)]
pub struct InMemoryCheckpointer {
    inner: DashMap<Uuid, Checkpoint>,
}

impl InMemoryCheckpointer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl Checkpointer for InMemoryCheckpointer {
    fn save(&self, checkpoint: Checkpoint) {
        self.inner.insert(checkpoint.thread_id, checkpoint);
    }

    fn load(&self, thread_id: Uuid) -> Option<Checkpoint> {
        self.inner.get(&thread_id).map(|c| c.clone())
    }

    fn remove(&self, thread_id: Uuid) {
        self.inner.remove(&thread_id);
    }
}
