//! Consumer-group event bus client.
//!
//! Delivery contract is at-least-once: a partition worker pulls the next
//! message only after the previous handler returned. Handler errors trigger
//! redelivery with exponential backoff; a message that keeps failing moves to
//! the topic's dead-letter partition. Handlers are deduplicated by
//! `event_id`, so redelivered duplicates are dropped before dispatch.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use sy_core::{CoreError, Result};

use crate::broker::{Broker, DeadLetter};
use crate::envelope::{EventEnvelope, Topic};

// ---------------------------------------------------------------------------
// EventHandler
// ---------------------------------------------------------------------------

/// Handler for one event type. Implementations must be idempotent by
/// `event_id`: the same envelope may be delivered more than once.
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, envelope: &EventEnvelope) -> Result<()>;
}

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff with a deterministic jitter derived from the
    /// event id, so redeliveries of distinct events do not synchronise.
    pub fn delay_for(&self, attempt: u32, event_id: uuid::Uuid) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let raw = self.base_delay.saturating_mul(1u32 << exp);
        let capped = raw.min(self.max_delay);

        let mut hasher = ahash::RandomState::with_seeds(7, 11, 13, 17).build_hasher();
        event_id.hash(&mut hasher);
        let jitter_pct = hasher.finish() % 25; // 0..25% of the capped delay
        capped + capped.mul_f64(jitter_pct as f64 / 100.0)
    }
}

// ---------------------------------------------------------------------------
// BusState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusState {
    Stopped,
    Starting,
    Running,
    Draining,
}

impl BusState {
    fn can_transition_to(&self, target: BusState) -> bool {
        matches!(
            (self, target),
            (BusState::Stopped, BusState::Starting)
                | (BusState::Starting, BusState::Running)
                | (BusState::Starting, BusState::Stopped)
                | (BusState::Running, BusState::Draining)
                | (BusState::Draining, BusState::Stopped)
        )
    }
}

// ---------------------------------------------------------------------------
// SeenSet — bounded event_id dedup ring
// ---------------------------------------------------------------------------

struct SeenSet {
    cap: usize,
    inner: Mutex<(HashSet<uuid::Uuid>, VecDeque<uuid::Uuid>)>,
}

impl SeenSet {
    fn new(cap: usize) -> Self {
        Self {
            cap,
            inner: Mutex::new((HashSet::new(), VecDeque::new())),
        }
    }

    /// Record `id`; returns `false` when it was already present.
    fn insert(&self, id: uuid::Uuid) -> bool {
        let mut guard = self.inner.lock().unwrap();
        let (set, order) = &mut *guard;
        if !set.insert(id) {
            return false;
        }
        order.push_back(id);
        while order.len() > self.cap {
            if let Some(old) = order.pop_front() {
                set.remove(&old);
            }
        }
        true
    }

    fn contains(&self, id: uuid::Uuid) -> bool {
        self.inner.lock().unwrap().0.contains(&id)
    }
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Counters {
    delivered: AtomicU64,
    handled: AtomicU64,
    duplicates: AtomicU64,
    retries: AtomicU64,
    dead_lettered: AtomicU64,
    unhandled_types: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct BusStats {
    pub delivered: u64,
    pub handled: u64,
    pub duplicates: u64,
    pub retries: u64,
    pub dead_lettered: u64,
    pub unhandled_types: u64,
}

// ---------------------------------------------------------------------------
// EventBusClient
// ---------------------------------------------------------------------------

/// Typed consumer-group client over a [`Broker`].
///
/// Register handlers by event type with [`on`](Self::on), then [`start`] over
/// a topic set. One worker task runs per (topic, partition); within a
/// partition messages are handled strictly one at a time.
pub struct EventBusClient {
    broker: Arc<dyn Broker>,
    group_id: String,
    handlers: HashMap<String, Arc<dyn EventHandler>>,
    retry: RetryPolicy,
    drain_timeout: Duration,
    state_tx: watch::Sender<BusState>,
    intake: CancellationToken,
    hard_cancel: CancellationToken,
    workers: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    seen: Arc<SeenSet>,
    counters: Arc<Counters>,
}

impl EventBusClient {
    pub fn new(broker: Arc<dyn Broker>, group_id: impl Into<String>) -> Self {
        let (state_tx, _) = watch::channel(BusState::Stopped);
        Self {
            broker,
            group_id: group_id.into(),
            handlers: HashMap::new(),
            retry: RetryPolicy::default(),
            drain_timeout: Duration::from_secs(10),
            state_tx,
            intake: CancellationToken::new(),
            hard_cancel: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
            seen: Arc::new(SeenSet::new(4096)),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Register a handler for an event type. Last registration wins.
    pub fn on(mut self, event_type: impl Into<String>, handler: Arc<dyn EventHandler>) -> Self {
        self.handlers.insert(event_type.into(), handler);
        self
    }

    pub fn state(&self) -> BusState {
        *self.state_tx.borrow()
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            handled: self.counters.handled.load(Ordering::Relaxed),
            duplicates: self.counters.duplicates.load(Ordering::Relaxed),
            retries: self.counters.retries.load(Ordering::Relaxed),
            dead_lettered: self.counters.dead_lettered.load(Ordering::Relaxed),
            unhandled_types: self.counters.unhandled_types.load(Ordering::Relaxed),
        }
    }

    fn transition(&self, target: BusState) -> Result<()> {
        let current = self.state();
        if !current.can_transition_to(target) {
            return Err(CoreError::Conflict(format!(
                "bus {}: cannot move {current:?} -> {target:?}",
                self.group_id
            )));
        }
        self.state_tx.send_replace(target);
        tracing::debug!(group = %self.group_id, from = ?current, to = ?target, "bus state");
        Ok(())
    }

    /// Subscribe the group and spawn partition workers.
    pub fn start(&self, topics: &[Topic]) -> Result<()> {
        self.transition(BusState::Starting)?;

        let subscription = self.broker.subscribe(topics, &self.group_id);
        let mut workers = self.workers.lock().unwrap();
        for (topic, partition, rx) in subscription.partitions {
            let worker = PartitionWorker {
                broker: self.broker.clone(),
                group_id: self.group_id.clone(),
                topic,
                partition,
                handlers: self.handlers.clone(),
                retry: self.retry.clone(),
                intake: self.intake.clone(),
                hard_cancel: self.hard_cancel.clone(),
                seen: self.seen.clone(),
                counters: self.counters.clone(),
            };
            workers.push(tokio::spawn(worker.run(rx)));
        }

        self.transition(BusState::Running)?;
        tracing::info!(group = %self.group_id, workers = workers.len(), "event bus running");
        Ok(())
    }

    /// Drain in-flight handlers and stop. After `drain_timeout` outstanding
    /// handlers are cancelled.
    pub async fn stop(&self) -> Result<()> {
        self.transition(BusState::Draining)?;
        self.intake.cancel();

        let workers: Vec<_> = std::mem::take(&mut *self.workers.lock().unwrap());
        let drain = async {
            for worker in workers {
                let _ = worker.await;
            }
        };
        if tokio::time::timeout(self.drain_timeout, drain).await.is_err() {
            tracing::warn!(group = %self.group_id, "drain timeout; cancelling in-flight handlers");
            self.hard_cancel.cancel();
        }

        self.transition(BusState::Stopped)?;
        tracing::info!(group = %self.group_id, "event bus stopped");
        Ok(())
    }

    /// Whether this client has already processed `event_id`.
    pub fn has_seen(&self, event_id: uuid::Uuid) -> bool {
        self.seen.contains(event_id)
    }
}

// ---------------------------------------------------------------------------
// PartitionWorker
// ---------------------------------------------------------------------------

struct PartitionWorker {
    broker: Arc<dyn Broker>,
    group_id: String,
    topic: Topic,
    partition: usize,
    handlers: HashMap<String, Arc<dyn EventHandler>>,
    retry: RetryPolicy,
    intake: CancellationToken,
    hard_cancel: CancellationToken,
    seen: Arc<SeenSet>,
    counters: Arc<Counters>,
}

impl PartitionWorker {
    async fn run(self, rx: flume::Receiver<EventEnvelope>) {
        loop {
            let envelope = tokio::select! {
                _ = self.intake.cancelled() => break,
                recv = rx.recv_async() => match recv {
                    Ok(envelope) => envelope,
                    Err(_) => break,
                },
            };
            self.counters.delivered.fetch_add(1, Ordering::Relaxed);
            self.process(envelope).await;
        }
        tracing::debug!(
            group = %self.group_id, topic = %self.topic, partition = self.partition,
            "partition worker exited"
        );
    }

    async fn process(&self, envelope: EventEnvelope) {
        if self.seen.contains(envelope.event_id) {
            self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(event = %envelope.event_id, "duplicate dropped");
            return;
        }

        let Some(handler) = self.handlers.get(&envelope.event_type) else {
            self.counters.unhandled_types.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(event_type = %envelope.event_type, "no handler registered");
            return;
        };

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let outcome = tokio::select! {
                _ = self.hard_cancel.cancelled() => {
                    tracing::warn!(event = %envelope.event_id, "handler cancelled during drain");
                    return;
                }
                res = handler.handle(&envelope) => res,
            };

            match outcome {
                Ok(()) => {
                    self.seen.insert(envelope.event_id);
                    self.counters.handled.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(err) if attempt >= self.retry.max_attempts => {
                    tracing::error!(
                        event = %envelope.event_id, attempts = attempt, error = %err,
                        "poison message routed to dead letters"
                    );
                    self.broker.push_dead_letter(
                        self.topic,
                        DeadLetter {
                            envelope: envelope.clone(),
                            group_id: self.group_id.clone(),
                            attempts: attempt,
                            last_error: err.to_string(),
                            failed_at: Utc::now(),
                        },
                    );
                    self.seen.insert(envelope.event_id);
                    self.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(err) => {
                    let delay = self.retry.delay_for(attempt, envelope.event_id);
                    self.counters.retries.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        event = %envelope.event_id, attempt, delay_ms = delay.as_millis() as u64,
                        error = %err, "handler failed; redelivering"
                    );
                    tokio::select! {
                        _ = self.hard_cancel.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
