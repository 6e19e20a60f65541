//! The graph executor.
//!
//! Drives one thread's node sequence against a shared [`GraphState`],
//! checkpointing at every node boundary. Guarantees: single writer per
//! thread, suspendable runs via interrupts, cancellation that surfaces
//! cleanly, and a global step fuse against non-terminating cycles (loop
//! bounds proper are counters held in state by the nodes that own them).

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use sy_core::{CoreError, Result};

use crate::checkpoint::{Checkpoint, Checkpointer, InterruptRecord};
use crate::graph::{Graph, NodeCtx, NodeOutcome, END};
use crate::state::{keys, GraphState};

// ---------------------------------------------------------------------------
// Config & outcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Hard ceiling on node executions per run segment; a graph that spins
    /// past this is routed to its error node with a terminal error.
    pub max_node_executions: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_node_executions: 256,
        }
    }
}

/// How a run segment ended.
#[derive(Debug)]
pub enum RunOutcome {
    /// The graph reached its sink.
    Completed(GraphState),
    /// A node raised an interrupt; the thread is suspended awaiting a
    /// resume event. `state` is the suspended state as checkpointed.
    Interrupted {
        node: String,
        reason: String,
        state: GraphState,
    },
    /// Cancellation surfaced; the last checkpoint holds the state.
    Cancelled(GraphState),
}

// ---------------------------------------------------------------------------
// GraphExecutor
// ---------------------------------------------------------------------------

pub struct GraphExecutor {
    graph: Arc<Graph>,
    checkpointer: Arc<dyn Checkpointer>,
    config: ExecutorConfig,
    /// Per-thread run locks: node execution for a given thread is strictly
    /// sequential, parallelism is across threads.
    run_locks: DashMap<Uuid, Arc<tokio::sync::Mutex<()>>>,
}

impl GraphExecutor {
    pub fn new(graph: Arc<Graph>, checkpointer: Arc<dyn Checkpointer>) -> Self {
        Self {
            graph,
            checkpointer,
            config: ExecutorConfig::default(),
            run_locks: DashMap::new(),
        }
    }

    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    fn lock_for(&self, thread_id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        self.run_locks
            .entry(thread_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Whether the thread is suspended on an interrupt.
    pub fn pending_interrupt(&self, thread_id: Uuid) -> Option<InterruptRecord> {
        self.checkpointer
            .load(thread_id)?
            .pending_interrupt
    }

    /// Start a fresh run for `thread_id` from the graph entry.
    pub async fn run(
        &self,
        thread_id: Uuid,
        initial: GraphState,
        cancel: CancellationToken,
    ) -> Result<RunOutcome> {
        let lock = self.lock_for(thread_id);
        let _guard = lock.lock().await;

        if let Some(checkpoint) = self.checkpointer.load(thread_id) {
            if checkpoint.pending_interrupt.is_some() {
                return Err(CoreError::Conflict(format!(
                    "thread {thread_id} has a pending interrupt; resume it instead"
                )));
            }
        }

        let entry = self.graph.entry().to_string();
        self.drive(thread_id, entry, initial, cancel).await
    }

    /// Resume a suspended thread: reload the checkpoint, merge the answer
    /// under the well-known key, and re-enter at the interrupting node.
    pub async fn resume(
        &self,
        thread_id: Uuid,
        answer: serde_json::Value,
        cancel: CancellationToken,
    ) -> Result<RunOutcome> {
        let lock = self.lock_for(thread_id);
        let _guard = lock.lock().await;

        let checkpoint = self
            .checkpointer
            .load(thread_id)
            .ok_or_else(|| CoreError::NotFound(format!("no checkpoint for thread {thread_id}")))?;
        let interrupt = checkpoint.pending_interrupt.ok_or_else(|| {
            CoreError::Conflict(format!("thread {thread_id} has no pending interrupt"))
        })?;

        let mut state = checkpoint.state;
        state.set(keys::RESUME_ANSWER, answer);

        // Clear the interrupt before re-entering so a crash mid-resume
        // cannot leave two pending interrupts.
        self.checkpointer.save(Checkpoint {
            thread_id,
            node: interrupt.node.clone(),
            state: state.clone(),
            pending_interrupt: None,
            updated_at: Utc::now(),
        });

        tracing::info!(thread = %thread_id, node = %interrupt.node, "resuming interrupted run");
        self.drive(thread_id, interrupt.node, state, cancel).await
    }

    async fn drive(
        &self,
        thread_id: Uuid,
        mut current: String,
        mut state: GraphState,
        cancel: CancellationToken,
    ) -> Result<RunOutcome> {
        let mut executed = 0usize;
        let mut error_routed = false;

        loop {
            if cancel.is_cancelled() {
                self.save_plain(thread_id, &current, &state);
                tracing::info!(thread = %thread_id, node = %current, "run cancelled");
                return Ok(RunOutcome::Cancelled(state));
            }

            executed += 1;
            if executed > self.config.max_node_executions {
                let message = format!(
                    "step fuse blown after {} node executions",
                    self.config.max_node_executions
                );
                tracing::error!(thread = %thread_id, node = %current, "{message}");
                match self.graph.error_node() {
                    Some(error_node) if !error_routed => {
                        state.set(keys::ERROR, message);
                        current = error_node.to_string();
                        error_routed = true;
                        executed = 0;
                    }
                    _ => return Err(CoreError::Internal(message)),
                }
                continue;
            }

            let node_fn = self.graph.node_fn(&current)?.clone();
            let ctx = NodeCtx {
                thread_id,
                node: current.clone(),
                cancel: cancel.clone(),
            };

            match node_fn(ctx, state.clone()).await {
                Ok(NodeOutcome::Next(next_state)) => {
                    state = next_state;
                    let next = self.graph.next_after(&current, &state)?;
                    tracing::debug!(thread = %thread_id, node = %current, next = %next, "node complete");

                    if next == END {
                        self.checkpointer.remove(thread_id);
                        return Ok(RunOutcome::Completed(state));
                    }
                    self.save_plain(thread_id, &next, &state);
                    current = next;
                }
                Ok(NodeOutcome::Interrupt {
                    reason,
                    state: suspended,
                }) => {
                    state = suspended;
                    self.checkpointer.save(Checkpoint {
                        thread_id,
                        node: current.clone(),
                        state: state.clone(),
                        pending_interrupt: Some(InterruptRecord {
                            reason: reason.clone(),
                            node: current.clone(),
                            raised_at: Utc::now(),
                        }),
                        updated_at: Utc::now(),
                    });
                    tracing::info!(thread = %thread_id, node = %current, reason = %reason, "run interrupted");
                    return Ok(RunOutcome::Interrupted {
                        node: current,
                        reason,
                        state,
                    });
                }
                Err(CoreError::Cancelled) => {
                    self.save_plain(thread_id, &current, &state);
                    tracing::info!(thread = %thread_id, node = %current, "node observed cancellation");
                    return Ok(RunOutcome::Cancelled(state));
                }
                Err(err) => {
                    tracing::error!(thread = %thread_id, node = %current, error = %err, "node failed");
                    state.set(keys::ERROR, err.to_string());
                    match self.graph.error_node() {
                        Some(error_node) if !error_routed && current != error_node => {
                            current = error_node.to_string();
                            error_routed = true;
                            self.save_plain(thread_id, &current, &state);
                        }
                        _ => {
                            self.save_plain(thread_id, &current, &state);
                            return Err(err);
                        }
                    }
                }
            }
        }
    }

    fn save_plain(&self, thread_id: Uuid, node: &str, state: &GraphState) {
        self.checkpointer.save(Checkpoint {
            thread_id,
            node: node.to_string(),
            state: state.clone(),
            pending_interrupt: None,
            updated_at: Utc::now(),
        });
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
