//! Core domain model and shared state for the orchestration control plane.
//!
//! Houses the entities every other crate speaks in (projects, stories,
//! agents, personas, tasks), the platform error taxonomy, the in-memory
//! source-of-truth stores, and the shared per-project context cache.

pub mod context;
pub mod error;
pub mod store;
pub mod types;

pub use error::{CoreError, Result};
