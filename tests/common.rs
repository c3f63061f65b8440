#![allow(dead_code)]

use std::sync::{Arc, Once};
use std::time::Duration;

use driftmq::config::ChannelConfig;
use driftmq::{Channel, MemoryQueue, Message};

pub fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = driftmq::logging::init_logging();
    });
}

pub fn channel_config(mem_queue_size: usize, msg_timeout_ms: u64, worker_wait_ms: u64) -> ChannelConfig {
    ChannelConfig {
        mem_queue_size,
        msg_timeout_ms,
        worker_wait_ms,
    }
}

/// Channel over an in-memory backend; the backend handle is returned for inspection.
pub fn memory_channel(cfg: &ChannelConfig) -> (Channel, Arc<MemoryQueue>) {
    let backend = Arc::new(MemoryQueue::new("test:chan"));
    let channel = Channel::with_backend("test", "chan", cfg, backend.clone(), None);
    (channel, backend)
}

pub async fn next_delivery(channel: &Channel) -> Message {
    tokio::time::timeout(Duration::from_secs(3), channel.client_messages().recv_async())
        .await
        .expect("no message delivered in time")
        .expect("delivery output closed")
}

/// Returns true if nothing is delivered within `wait`.
pub async fn stays_quiet(channel: &Channel, wait: Duration) -> bool {
    tokio::time::timeout(wait, channel.client_messages().recv_async())
        .await
        .is_err()
}
