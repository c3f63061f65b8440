//! Outstanding-delivery table.
//!
//! `register`, `pop`, `pop_if` and `peek` are the only ways into the map, so the
//! at-most-one-record-per-id invariant is enforced in one place.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::time::Instant;

use crate::core::error::ChannelError;
use crate::core::message::{Message, MessageId};
use crate::core::pqueue::EntryKey;
use crate::core::subscriber::Consumer;

/// A delivered message and the consumer currently responsible for it.
#[derive(Debug, Clone)]
pub struct InFlightRecord {
    pub message: Message,
    pub consumer: Arc<dyn Consumer>,
    pub deadline: Instant,
    /// Key of this delivery's entry in the timeout queue.
    pub timeout_key: EntryKey,
}

impl InFlightRecord {
    pub fn new(message: Message, consumer: Arc<dyn Consumer>, deadline: Instant) -> Self {
        Self {
            message,
            consumer,
            deadline,
            timeout_key: EntryKey::next(),
        }
    }

    #[inline]
    pub fn id(&self) -> MessageId {
        self.message.id
    }
}

#[derive(Debug, Default)]
pub struct InFlightTracker {
    records: RwLock<HashMap<MessageId, InFlightRecord>>,
}

impl InFlightTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: RwLock::new(HashMap::with_capacity(capacity)),
        }
    }

    /// Inserts `record`, failing if its id is already in flight.
    pub fn register(&self, record: InFlightRecord) -> Result<(), ChannelError> {
        let mut records = self.records.write();
        let id = record.id();
        if records.contains_key(&id) {
            return Err(ChannelError::AlreadyInFlight);
        }
        records.insert(id, record);
        Ok(())
    }

    /// Removes and returns the record for `id`.
    pub fn pop(&self, id: &MessageId) -> Result<InFlightRecord, ChannelError> {
        self.records
            .write()
            .remove(id)
            .ok_or(ChannelError::NotInFlight)
    }

    /// Removes the record for `id` only if it still belongs to the delivery
    /// whose timeout entry is `key`. Compare and remove share one write lock.
    pub fn pop_if(&self, id: &MessageId, key: EntryKey) -> Option<InFlightRecord> {
        let mut records = self.records.write();
        match records.get(id) {
            Some(record) if record.timeout_key == key => records.remove(id),
            _ => None,
        }
    }

    /// Returns a copy of the record for `id` without removing it.
    pub fn peek(&self, id: &MessageId) -> Result<InFlightRecord, ChannelError> {
        self.records
            .read()
            .get(id)
            .cloned()
            .ok_or(ChannelError::NotInFlight)
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::message::new_message;
    use crate::core::subscriber::Subscriber;

    fn record(msg: Message) -> InFlightRecord {
        let consumer: Arc<dyn Consumer> = Arc::new(Subscriber::new("c1"));
        InFlightRecord::new(msg, consumer, Instant::now())
    }

    #[test]
    fn second_register_fails() {
        let tracker = InFlightTracker::new();
        let msg = new_message("a");

        tracker.register(record(msg.clone())).unwrap();
        assert!(matches!(
            tracker.register(record(msg.clone())),
            Err(ChannelError::AlreadyInFlight)
        ));
        assert_eq!(tracker.len(), 1);

        // Allowed again once the first delivery is gone.
        tracker.pop(&msg.id).unwrap();
        tracker.register(record(msg)).unwrap();
    }

    #[test]
    fn pop_removes_and_peek_does_not() {
        let tracker = InFlightTracker::new();
        let msg = new_message("a");
        let rec = record(msg.clone());
        let key = rec.timeout_key;
        tracker.register(rec).unwrap();

        assert_eq!(tracker.peek(&msg.id).unwrap().timeout_key, key);
        assert_eq!(tracker.len(), 1);

        let popped = tracker.pop(&msg.id).unwrap();
        assert_eq!(popped.message, msg);
        assert!(tracker.is_empty());
        assert!(matches!(tracker.pop(&msg.id), Err(ChannelError::NotInFlight)));
        assert!(matches!(tracker.peek(&msg.id), Err(ChannelError::NotInFlight)));
    }

    #[test]
    fn pop_if_ignores_a_newer_delivery() {
        let tracker = InFlightTracker::new();
        let msg = new_message("a");
        let first = record(msg.clone());
        let stale_key = first.timeout_key;
        tracker.register(first).unwrap();

        // Requeued and delivered again before the old timeout fired.
        tracker.pop(&msg.id).unwrap();
        let second = record(msg.clone());
        let current_key = second.timeout_key;
        tracker.register(second).unwrap();

        assert!(tracker.pop_if(&msg.id, stale_key).is_none());
        assert_eq!(tracker.len(), 1);
        let popped = tracker.pop_if(&msg.id, current_key).unwrap();
        assert_eq!(popped.timeout_key, current_key);
        assert!(tracker.is_empty());
    }
}
