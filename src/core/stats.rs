use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Per-channel monotonic counters, read without locking.
#[derive(Debug, Default)]
pub struct ChannelStats {
    pub requeue_count: AtomicU64,
    pub message_count: AtomicU64,
    pub put_count: AtomicU64,
    pub timeout_count: AtomicU64,
}

/// Serializable snapshot of channel statistics plus current depths.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelStatsSnapshot {
    pub topic: String,
    pub channel: String,
    /// Messages requeued (explicitly, deferred, or after a timeout).
    pub requeue_count: u64,
    /// Messages handed to the delivery output.
    pub message_count: u64,
    /// Messages published into the channel.
    pub put_count: u64,
    pub timeout_count: u64,
    pub in_flight_count: u64,
    pub deferred_count: u64,
    pub memory_depth: u64,
    pub backend_depth: u64,
    pub client_count: u64,
}

impl ChannelStats {
    #[inline]
    pub fn inc_requeued(&self) {
        self.requeue_count.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_delivered(&self) {
        self.message_count.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_published(&self) {
        self.put_count.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_timed_out(&self) {
        self.timeout_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Copies the counters into a snapshot; depth fields are left at zero.
    pub fn counters(&self, topic: &str, channel: &str) -> ChannelStatsSnapshot {
        ChannelStatsSnapshot {
            topic: topic.to_owned(),
            channel: channel.to_owned(),
            requeue_count: self.requeue_count.load(Ordering::Relaxed),
            message_count: self.message_count.load(Ordering::Relaxed),
            put_count: self.put_count.load(Ordering::Relaxed),
            timeout_count: self.timeout_count.load(Ordering::Relaxed),
            ..Default::default()
        }
    }
}
