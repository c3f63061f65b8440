pub mod backend;
pub mod channel;
pub mod error;
pub mod inflight;
pub mod message;
pub mod pqueue;
pub mod shutdown;
pub mod stats;
pub mod subscriber;
pub mod sweep;
