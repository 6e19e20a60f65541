//! Graph structure: named nodes with edge and router tables.
//!
//! Nodes are identified by stable string names; edges and routers are stored
//! as data rather than references, so a graph is a value that can be built
//! once and shared across runs. Cycles are permitted — loop bounds live in
//! run state, not in the structure.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use sy_core::{CoreError, Result};

use crate::state::GraphState;

pub const START: &str = "__start__";
pub const END: &str = "__end__";

// ---------------------------------------------------------------------------
// Node plumbing
// ---------------------------------------------------------------------------

/// Per-invocation context handed to a node alongside the state.
#[derive(Debug, Clone)]
pub struct NodeCtx {
    pub thread_id: Uuid,
    pub node: String,
    pub cancel: CancellationToken,
}

impl NodeCtx {
    /// Cooperative cancellation check; nodes call this before and between
    /// I/O-heavy sections.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(CoreError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// What a node hands back to the executor. Interrupts are control flow, not
/// errors; the executor branches on this tag.
#[derive(Debug)]
pub enum NodeOutcome {
    /// Continue to the next node with the updated state.
    Next(GraphState),
    /// Suspend the run; state is checkpointed and the thread waits for a
    /// resume event.
    Interrupt { reason: String, state: GraphState },
}

pub type NodeResult = Result<NodeOutcome>;

pub type NodeFn =
    Arc<dyn Fn(NodeCtx, GraphState) -> Pin<Box<dyn Future<Output = NodeResult> + Send>> + Send + Sync>;

pub type RouterFn = Arc<dyn Fn(&GraphState) -> String + Send + Sync>;

/// Wrap an async closure as a [`NodeFn`].
pub fn node<F, Fut>(f: F) -> NodeFn
where
    F: Fn(NodeCtx, GraphState) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = NodeResult> + Send + 'static,
{
    Arc::new(move |ctx, state| Box::pin(f(ctx, state)))
}

/// Wrap a router closure as a [`RouterFn`].
pub fn router<F>(f: F) -> RouterFn
where
    F: Fn(&GraphState) -> String + Send + Sync + 'static,
{
    Arc::new(f)
}

// ---------------------------------------------------------------------------
// Graph + builder
// ---------------------------------------------------------------------------

pub struct Graph {
    pub name: String,
    nodes: HashMap<String, NodeFn>,
    edges: HashMap<String, String>,
    routers: HashMap<String, RouterFn>,
    entry: String,
    /// Node jumped to when another node fails; usually the terminal respond
    /// node so errors surface to the user.
    error_node: Option<String>,
}

impl Graph {
    pub fn builder(name: impl Into<String>) -> GraphBuilder {
        GraphBuilder {
            name: name.into(),
            nodes: HashMap::new(),
            edges: HashMap::new(),
            routers: HashMap::new(),
            entry: None,
            error_node: None,
        }
    }

    pub fn entry(&self) -> &str {
        &self.entry
    }

    pub fn error_node(&self) -> Option<&str> {
        self.error_node.as_deref()
    }

    pub fn node_fn(&self, name: &str) -> Result<&NodeFn> {
        self.nodes
            .get(name)
            .ok_or_else(|| CoreError::Internal(format!("graph {}: unknown node {name}", self.name)))
    }

    pub fn has_node(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    /// Resolve the node that follows `name` given the current state.
    pub fn next_after(&self, name: &str, state: &GraphState) -> Result<String> {
        if let Some(target) = self.edges.get(name) {
            return Ok(target.clone());
        }
        if let Some(router) = self.routers.get(name) {
            let target = router(state);
            if target != END && !self.nodes.contains_key(&target) {
                return Err(CoreError::Internal(format!(
                    "graph {}: router at {name} chose unknown node {target}",
                    self.name
                )));
            }
            return Ok(target);
        }
        // A node with no outgoing edge is an implicit sink.
        Ok(END.to_string())
    }
}

pub struct GraphBuilder {
    name: String,
    nodes: HashMap<String, NodeFn>,
    edges: HashMap<String, String>,
    routers: HashMap<String, RouterFn>,
    entry: Option<String>,
    error_node: Option<String>,
}

impl GraphBuilder {
    pub fn add_node(mut self, name: impl Into<String>, f: NodeFn) -> Self {
        self.nodes.insert(name.into(), f);
        self
    }

    /// Unconditional edge `from -> to`. An edge from [`START`] sets the entry.
    pub fn add_edge(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        let from = from.into();
        let to = to.into();
        if from == START {
            self.entry = Some(to);
        } else {
            self.edges.insert(from, to);
        }
        self
    }

    /// Router-gated edge: `from -> router(state)`.
    pub fn add_router(mut self, from: impl Into<String>, f: RouterFn) -> Self {
        self.routers.insert(from.into(), f);
        self
    }

    /// Node jumped to when another node errors.
    pub fn on_error(mut self, node: impl Into<String>) -> Self {
        self.error_node = Some(node.into());
        self
    }

    pub fn build(self) -> Result<Graph> {
        let entry = self
            .entry
            .ok_or_else(|| CoreError::Internal(format!("graph {}: no __start__ edge", self.name)))?;
        if !self.nodes.contains_key(&entry) {
            return Err(CoreError::Internal(format!(
                "graph {}: entry node {entry} not registered",
                self.name
            )));
        }
        for (from, to) in &self.edges {
            if !self.nodes.contains_key(from) {
                return Err(CoreError::Internal(format!(
                    "graph {}: edge from unknown node {from}",
                    self.name
                )));
            }
            if to != END && !self.nodes.contains_key(to) {
                return Err(CoreError::Internal(format!(
                    "graph {}: edge {from} -> unknown node {to}",
                    self.name
                )));
            }
        }
        for from in self.routers.keys() {
            if !self.nodes.contains_key(from) {
                return Err(CoreError::Internal(format!(
                    "graph {}: router on unknown node {from}",
                    self.name
                )));
            }
        }
        if let Some(error_node) = &self.error_node {
            if !self.nodes.contains_key(error_node) {
                return Err(CoreError::Internal(format!(
                    "graph {}: error node {error_node} not registered",
                    self.name
                )));
            }
        }

        Ok(Graph {
            name: self.name,
            nodes: self.nodes,
            edges: self.edges,
            routers: self.routers,
            entry,
            error_node: self.error_node,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> NodeFn {
        node(|_ctx, state| async move { Ok(NodeOutcome::Next(state)) })
    }

    #[test]
    fn build_validates_entry_and_edges() {
        let err = Graph::builder("g").add_node("a", noop()).build();
        assert!(err.is_err(), "missing __start__ edge must fail");

        let err = Graph::builder("g")
            .add_node("a", noop())
            .add_edge(START, "a")
            .add_edge("a", "ghost")
            .build();
        assert!(err.is_err(), "dangling edge must fail");
    }

    #[test]
    fn edge_and_router_resolution() {
        let graph = Graph::builder("g")
            .add_node("a", noop())
            .add_node("b", noop())
            .add_node("c", noop())
            .add_edge(START, "a")
            .add_router(
                "a",
                router(|state| {
                    if state.get_bool("flag") {
                        "b".into()
                    } else {
                        "c".into()
                    }
                }),
            )
            .add_edge("b", END)
            .build()
            .unwrap();

        let flagged = GraphState::new().with("flag", true);
        assert_eq!(graph.next_after("a", &flagged).unwrap(), "b");
        let unflagged = GraphState::new();
        assert_eq!(graph.next_after("a", &unflagged).unwrap(), "c");
        // c has no outgoing edge: implicit sink.
        assert_eq!(graph.next_after("c", &unflagged).unwrap(), END);
    }

    #[test]
    fn router_to_unknown_node_is_internal_error() {
        let graph = Graph::builder("g")
            .add_node("a", noop())
            .add_edge(START, "a")
            .add_router("a", router(|_| "ghost".into()))
            .build()
            .unwrap();
        assert!(graph.next_after("a", &GraphState::new()).is_err());
    }
}
