//! Broker abstraction and the in-process implementation.
//!
//! The [`Broker`] trait is the seam where a real Kafka client would plug in;
//! the control plane itself only relies on consumer-group fan-out, per-key
//! partition ordering, and a dead-letter sink per topic.

use std::collections::{HashMap, VecDeque};
use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use sy_core::Result;

use crate::envelope::{EventEnvelope, Topic};

pub const DEFAULT_PARTITIONS: usize = 4;
const DEAD_LETTER_CAP: usize = 1024;

// ---------------------------------------------------------------------------
// DeadLetter
// ---------------------------------------------------------------------------

/// A message that exhausted its delivery attempts for some consumer group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub envelope: EventEnvelope,
    pub group_id: String,
    pub attempts: u32,
    pub last_error: String,
    pub failed_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Broker trait
// ---------------------------------------------------------------------------

/// One consumer group's view of a set of topics: a receiver per partition,
/// ordered within each partition.
pub struct Subscription {
    pub group_id: String,
    pub partitions: Vec<(Topic, usize, flume::Receiver<EventEnvelope>)>,
}

pub trait Broker: Send + Sync {
    /// Publish an envelope onto `topic`. Messages sharing a key land on the
    /// same partition and are observed in publish order by each group.
    fn publish(&self, topic: Topic, key: &str, envelope: EventEnvelope) -> Result<()>;

    /// Register a consumer group over `topics`. Each group sees every
    /// message published after subscription; groups consume independently.
    fn subscribe(&self, topics: &[Topic], group_id: &str) -> Subscription;

    /// Route a poisoned message to the topic's dead-letter partition.
    fn push_dead_letter(&self, topic: Topic, letter: DeadLetter);

    /// Inspect the dead-letter partition for a topic (newest last).
    fn dead_letters(&self, topic: Topic) -> Vec<DeadLetter>;
}

// ---------------------------------------------------------------------------
// InProcessBroker
// ---------------------------------------------------------------------------

struct GroupChannels {
    senders: Vec<flume::Sender<EventEnvelope>>,
}

#[derive(Default)]
struct BrokerState {
    /// (topic, group_id) -> per-partition senders.
    groups: HashMap<(&'static str, String), GroupChannels>,
    dead_letters: HashMap<&'static str, VecDeque<DeadLetter>>,
}

/// Partitioned in-process broker built on flume channels.
///
/// Each consumer group gets its own channel set per topic, so groups consume
/// the same stream independently (pub/sub across groups, queue within one).
pub struct InProcessBroker {
    partitions: usize,
    state: Mutex<BrokerState>,
    hasher: ahash::RandomState,
}

impl InProcessBroker {
    pub fn new(partitions: usize) -> Self {
        Self {
            partitions: partitions.max(1),
            state: Mutex::new(BrokerState::default()),
            hasher: ahash::RandomState::new(),
        }
    }

    pub fn shared(partitions: usize) -> Arc<Self> {
        Arc::new(Self::new(partitions))
    }

    fn partition_for(&self, key: &str) -> usize {
        let mut hasher = self.hasher.build_hasher();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % self.partitions
    }
}

impl Default for InProcessBroker {
    fn default() -> Self {
        Self::new(DEFAULT_PARTITIONS)
    }
}

impl Broker for InProcessBroker {
    fn publish(&self, topic: Topic, key: &str, envelope: EventEnvelope) -> Result<()> {
        let partition = self.partition_for(key);
        let mut state = self.state.lock().unwrap();

        // Fan out to every live group on this topic; prune groups whose
        // receivers are gone.
        let mut dead_groups = Vec::new();
        for ((topic_name, group_id), channels) in state.groups.iter() {
            if *topic_name != topic.as_str() {
                continue;
            }
            if channels.senders[partition].send(envelope.clone()).is_err() {
                dead_groups.push((*topic_name, group_id.clone()));
            }
        }
        for key in dead_groups {
            state.groups.remove(&key);
        }

        tracing::trace!(topic = %topic, partition, event = %envelope.event_id, "published");
        Ok(())
    }

    fn subscribe(&self, topics: &[Topic], group_id: &str) -> Subscription {
        let mut state = self.state.lock().unwrap();
        let mut partitions = Vec::new();

        for topic in topics {
            let mut receivers = Vec::with_capacity(self.partitions);
            let mut senders = Vec::with_capacity(self.partitions);
            for _ in 0..self.partitions {
                let (tx, rx) = flume::unbounded();
                senders.push(tx);
                receivers.push(rx);
            }
            state
                .groups
                .insert((topic.as_str(), group_id.to_string()), GroupChannels { senders });
            for (idx, rx) in receivers.into_iter().enumerate() {
                partitions.push((*topic, idx, rx));
            }
        }

        tracing::debug!(group = group_id, topics = topics.len(), "consumer group subscribed");
        Subscription {
            group_id: group_id.to_string(),
            partitions,
        }
    }

    fn push_dead_letter(&self, topic: Topic, letter: DeadLetter) {
        let mut state = self.state.lock().unwrap();
        let queue = state.dead_letters.entry(topic.as_str()).or_default();
        queue.push_back(letter);
        while queue.len() > DEAD_LETTER_CAP {
            queue.pop_front();
        }
    }

    fn dead_letters(&self, topic: Topic) -> Vec<DeadLetter> {
        self.state
            .lock()
            .unwrap()
            .dead_letters
            .get(topic.as_str())
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::topics;

    fn env(n: u32) -> EventEnvelope {
        EventEnvelope::new("test", &serde_json::json!({ "n": n })).unwrap()
    }

    #[test]
    fn same_key_preserves_order_on_one_partition() {
        let broker = InProcessBroker::new(4);
        let sub = broker.subscribe(&[topics::AGENT_TASKS], "g1");

        for n in 0..20 {
            broker.publish(topics::AGENT_TASKS, "task-1", env(n)).unwrap();
        }

        // Exactly one partition received all 20 messages, in order.
        let mut seen = Vec::new();
        for (_, _, rx) in &sub.partitions {
            while let Ok(envelope) = rx.try_recv() {
                seen.push(envelope.payload["n"].as_u64().unwrap());
            }
        }
        assert_eq!(seen, (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn groups_consume_independently() {
        let broker = InProcessBroker::new(1);
        let sub_a = broker.subscribe(&[topics::USER_MESSAGES], "a");
        let sub_b = broker.subscribe(&[topics::USER_MESSAGES], "b");

        broker.publish(topics::USER_MESSAGES, "p1", env(1)).unwrap();

        assert!(sub_a.partitions[0].2.try_recv().is_ok());
        assert!(sub_b.partitions[0].2.try_recv().is_ok());
    }

    #[test]
    fn messages_before_subscription_are_not_replayed() {
        let broker = InProcessBroker::new(1);
        broker.publish(topics::USER_MESSAGES, "p1", env(1)).unwrap();
        let sub = broker.subscribe(&[topics::USER_MESSAGES], "late");
        assert!(sub.partitions[0].2.try_recv().is_err());
    }

    #[test]
    fn dead_letter_ring_is_bounded() {
        let broker = InProcessBroker::new(1);
        for n in 0..(DEAD_LETTER_CAP + 8) {
            broker.push_dead_letter(
                topics::AGENT_TASKS,
                DeadLetter {
                    envelope: env(n as u32),
                    group_id: "g".into(),
                    attempts: 5,
                    last_error: "boom".into(),
                    failed_at: Utc::now(),
                },
            );
        }
        assert_eq!(broker.dead_letters(topics::AGENT_TASKS).len(), DEAD_LETTER_CAP);
    }

    #[test]
    fn dropped_group_is_pruned_on_publish() {
        let broker = InProcessBroker::new(1);
        {
            let _sub = broker.subscribe(&[topics::USER_MESSAGES], "gone");
            // receiver dropped here
        }
        broker.publish(topics::USER_MESSAGES, "k", env(1)).unwrap();
        assert!(broker.state.lock().unwrap().groups.is_empty());
    }
}
