//! Overflow storage behind a channel's in-memory lane.
//!
//! A channel only ever talks to [`BackendQueue`]. Writes must come back out
//! of [`BackendQueue::read_chan`] in the order they went in.

pub mod disk;
pub mod memory;

use std::fmt::Debug;

use bytes::Bytes;

use crate::core::error::BackendError;

pub use disk::DiskQueue;
pub use memory::MemoryQueue;

pub trait BackendQueue: Send + Sync + Debug {
    /// Appends one encoded message.
    fn put(&self, data: &[u8]) -> Result<(), BackendError>;

    /// Stream of stored messages, one encoded message per element.
    fn read_chan(&self) -> flume::Receiver<Bytes>;

    /// Flushes and stops the queue. Further `put`s fail with `Closed`.
    fn close(&self) -> Result<(), BackendError>;

    /// Number of messages written but not yet read.
    fn depth(&self) -> u64;
}
