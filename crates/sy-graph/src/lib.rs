//! Graph-based workflow execution for role agents.
//!
//! A graph is a set of string-named nodes with edge and router tables stored
//! as data; a run is a strictly sequential node sequence over a shared
//! [`state::GraphState`], checkpointed at every boundary. Runs can suspend
//! via interrupts and resume later with a user answer, honour cancellation
//! cooperatively, and bound their cycles with counters held in state.

pub mod checkpoint;
pub mod executor;
pub mod graph;
pub mod state;

pub use checkpoint::{Checkpoint, Checkpointer, InMemoryCheckpointer, InterruptRecord};
pub use executor::{ExecutorConfig, GraphExecutor, RunOutcome};
pub use graph::{node, router, Graph, GraphBuilder, NodeCtx, NodeFn, NodeOutcome, NodeResult, RouterFn, END, START};
pub use state::{keys, GraphState};
