use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};

/// Unique identifier for a subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriberId(pub String);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SubscriberId {
    fn from(s: &str) -> Self {
        SubscriberId(s.to_owned())
    }
}

impl From<String> for SubscriberId {
    fn from(s: String) -> Self {
        SubscriberId(s)
    }
}

impl AsRef<str> for SubscriberId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Deref for SubscriberId {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// What a channel needs from the connection layer's per-client state.
///
/// The channel calls the lifecycle hooks as a delivery to this consumer
/// starts and ends. Each delivery ends in exactly one of finished, requeued
/// or timed out.
pub trait Consumer: Send + Sync + fmt::Debug {
    /// Identity used for idempotent add/remove.
    fn id(&self) -> &SubscriberId;

    /// A message was put in flight to this consumer.
    fn sending_message(&self) {}

    /// An in-flight message was acknowledged.
    fn finished_message(&self) {}

    /// An in-flight message was handed back for redelivery.
    fn requeued_message(&self) {}

    /// An in-flight message was not finished in time.
    fn timed_out_message(&self);
}

/// Minimal consumer with in-flight bookkeeping.
#[derive(Debug)]
pub struct Subscriber {
    id: SubscriberId,
    in_flight: AtomicU64,
    finished: AtomicU64,
    requeued: AtomicU64,
    timed_out: AtomicU64,
}

impl Subscriber {
    pub fn new(id: impl Into<SubscriberId>) -> Self {
        Self {
            id: id.into(),
            in_flight: AtomicU64::new(0),
            finished: AtomicU64::new(0),
            requeued: AtomicU64::new(0),
            timed_out: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn finished(&self) -> u64 {
        self.finished.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn requeued(&self) -> u64 {
        self.requeued.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn timed_out(&self) -> u64 {
        self.timed_out.load(Ordering::Relaxed)
    }

    fn release(&self, counter: &AtomicU64) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

impl Consumer for Subscriber {
    fn id(&self) -> &SubscriberId {
        &self.id
    }

    fn sending_message(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    fn finished_message(&self) {
        self.release(&self.finished);
    }

    fn requeued_message(&self) {
        self.release(&self.requeued);
    }

    fn timed_out_message(&self) {
        self.release(&self.timed_out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn each_outcome_releases_one_slot() {
        let sub = Subscriber::new("c1");
        for _ in 0..3 {
            sub.sending_message();
        }
        assert_eq!(sub.in_flight(), 3);

        sub.timed_out_message();
        sub.requeued_message();
        sub.finished_message();
        assert_eq!(sub.in_flight(), 0);
        assert_eq!((sub.finished(), sub.requeued(), sub.timed_out()), (1, 1, 1));

        // An unmatched release never wraps.
        sub.finished_message();
        assert_eq!(sub.in_flight(), 0);
    }
}
