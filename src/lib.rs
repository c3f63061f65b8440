//! DriftMQ – per-channel delivery core for a topic/channel message queue.
//!
//! This crate exports
//!  * `core`    – channel, in-flight tracking, deadline queues, backends
//!  * `config`  – TOML-driven channel and backend configuration
//!  * `logging` – tracing subscriber setup
//!  * `metrics` – text rendering of channel statistics
//!
//! A connection layer embeds [`Channel`] and drives it with
//! `put_message`, `start_in_flight_timeout`, `finish_message` and
//! `requeue_message`.

pub mod config;
pub mod core;
pub mod logging;
pub mod metrics;

pub use config::{load_config, Config};
pub use core::backend::{BackendQueue, DiskQueue, MemoryQueue};
pub use core::channel::{Channel, ChannelEvent};
pub use core::error::{BackendError, ChannelError};
pub use core::message::{Message, MessageId};
pub use core::subscriber::{Consumer, Subscriber, SubscriberId};
