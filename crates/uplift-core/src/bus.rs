//! Append-only message bus
//!
//! Holds every message produced during a run, in `seq` order. Actors never
//! touch the bus directly: they read from a snapshot taken when they start
//! and their writes are committed by the scheduler when they return.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::BusError;

/// One produced instance of a model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Position in the run-wide order, starting at 1
    pub seq: u64,
    /// Model name
    pub model: String,
    /// Producing actor
    pub producer: String,
    /// Phase the producer ran in
    pub phase: String,
    /// Model payload
    pub payload: Value,
}

/// Per-run message store
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Message>", into = "Vec<Message>")]
pub struct MessageBus {
    messages: Arc<Vec<Message>>,
}

impl MessageBus {
    /// Create an empty bus
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a bus from a persisted log
    ///
    /// # Errors
    /// Returns `BusError::OutOfOrder` unless `seq` is strictly increasing
    pub fn from_messages(messages: Vec<Message>) -> Result<Self, BusError> {
        let mut previous = 0;
        for message in &messages {
            if message.seq <= previous {
                return Err(BusError::OutOfOrder {
                    seq: message.seq,
                    previous,
                });
            }
            previous = message.seq;
        }

        Ok(Self {
            messages: Arc::new(messages),
        })
    }

    /// Sequence number the next message will get
    #[must_use]
    pub fn next_seq(&self) -> u64 {
        self.messages.last().map_or(1, |m| m.seq + 1)
    }

    /// Append a message and return its `seq`
    pub fn produce(
        &mut self,
        producer: impl Into<String>,
        phase: impl Into<String>,
        model: impl Into<String>,
        payload: Value,
    ) -> u64 {
        let seq = self.next_seq();
        Arc::make_mut(&mut self.messages).push(Message {
            seq,
            model: model.into(),
            producer: producer.into(),
            phase: phase.into(),
            payload,
        });
        seq
    }

    /// Messages of `model` produced so far, in `seq` order
    ///
    /// The iterator is lazy and bounded by the current state; call again
    /// to re-scan.
    pub fn consume<'a>(&'a self, model: &'a str) -> impl Iterator<Item = &'a Message> + 'a {
        self.messages.iter().filter(move |m| m.model == model)
    }

    /// Earliest message of `model`, if any
    #[must_use]
    pub fn consume_one(&self, model: &str) -> Option<&Message> {
        self.messages.iter().find(|m| m.model == model)
    }

    /// Drop every message after the first `len`
    ///
    /// Only used to discard the output of a phase that did not complete.
    pub(crate) fn truncate(&mut self, len: usize) {
        if len < self.messages.len() {
            Arc::make_mut(&mut self.messages).truncate(len);
        }
    }

    /// Cheap read-only view of the current log
    #[must_use]
    pub fn snapshot(&self) -> Arc<Vec<Message>> {
        Arc::clone(&self.messages)
    }

    /// All messages in `seq` order
    #[must_use]
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Number of messages
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the bus is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

impl TryFrom<Vec<Message>> for MessageBus {
    type Error = BusError;

    fn try_from(messages: Vec<Message>) -> Result<Self, Self::Error> {
        Self::from_messages(messages)
    }
}

impl From<MessageBus> for Vec<Message> {
    fn from(bus: MessageBus) -> Self {
        Arc::unwrap_or_clone(bus.messages)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_produce_assigns_increasing_seq() {
        let mut bus = MessageBus::new();
        assert_eq!(bus.produce("a", "facts", "M1", json!({})), 1);
        assert_eq!(bus.produce("b", "facts", "M2", json!({})), 2);
        assert_eq!(bus.produce("a", "checks", "M1", json!({"n": 2})), 3);

        let seqs: Vec<u64> = bus.consume("M1").map(|m| m.seq).collect();
        assert_eq!(seqs, vec![1, 3]);
        assert_eq!(bus.consume_one("M1").unwrap().producer, "a");
        assert!(bus.consume_one("M3").is_none());
    }

    #[test]
    fn test_snapshot_is_not_affected_by_later_writes() {
        let mut bus = MessageBus::new();
        bus.produce("a", "facts", "M1", json!({}));
        let snapshot = bus.snapshot();

        bus.produce("b", "facts", "M1", json!({}));

        assert_eq!(snapshot.len(), 1);
        assert_eq!(bus.consume("M1").count(), 2);
    }

    #[test]
    fn test_consume_one_returns_earliest_match() {
        let mut bus = MessageBus::new();
        bus.produce("a", "facts", "M2", json!({}));
        bus.produce("b", "facts", "M1", json!({"n": 1}));
        bus.produce("c", "facts", "M1", json!({"n": 2}));

        let model = String::from("M1");
        let first = bus.consume_one(&model).unwrap();
        drop(model);
        assert_eq!(first.seq, 2);
        assert_eq!(first.producer, "b");
    }

    #[test]
    fn test_truncate_rewinds_numbering() {
        let mut bus = MessageBus::new();
        bus.produce("a", "facts", "M1", json!({}));
        let kept = bus.len();
        bus.produce("b", "checks", "M1", json!({}));
        bus.produce("b", "checks", "M2", json!({}));

        bus.truncate(kept);
        assert_eq!(bus.len(), 1);
        assert_eq!(bus.next_seq(), 2);
        assert_eq!(bus.produce("b", "checks", "M1", json!({})), 2);

        bus.truncate(10);
        assert_eq!(bus.len(), 2);
    }

    #[test]
    fn test_restore_continues_numbering() {
        let mut bus = MessageBus::new();
        bus.produce("a", "facts", "M1", json!({}));
        bus.produce("a", "facts", "M1", json!({}));

        let encoded = serde_json::to_string(&bus).unwrap();
        let mut restored: MessageBus = serde_json::from_str(&encoded).unwrap();

        assert_eq!(restored, bus);
        assert_eq!(restored.produce("c", "final", "M1", json!({})), 3);
    }

    #[test]
    fn test_out_of_order_log_rejected() {
        let message = |seq| Message {
            seq,
            model: "M".into(),
            producer: "a".into(),
            phase: "p".into(),
            payload: json!({}),
        };

        let err = MessageBus::from_messages(vec![message(2), message(2)]).unwrap_err();
        assert_eq!(err, BusError::OutOfOrder { seq: 2, previous: 2 });

        let err = serde_json::from_value::<MessageBus>(json!([
            {"seq": 0, "model": "M", "producer": "a", "phase": "p", "payload": {}}
        ]));
        assert!(err.is_err());
    }
}
