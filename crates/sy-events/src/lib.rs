//! Event plumbing for the control plane.
//!
//! Wire envelopes and topic constants, the broker seam with an in-process
//! implementation, the consumer-group bus client (at-least-once delivery,
//! idempotent dispatch, dead-letter routing), and the task lifecycle facade.

pub mod broker;
pub mod consumer;
pub mod envelope;
pub mod schemas;
pub mod task_queue;

pub use broker::{Broker, DeadLetter, InProcessBroker, Subscription};
pub use consumer::{BusState, BusStats, EventBusClient, EventHandler, RetryPolicy};
pub use envelope::{topics, EventEnvelope, Topic};
pub use task_queue::TaskLifecycleQueue;
