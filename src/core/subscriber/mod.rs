//! Consumer handles.
//!
//! Provides the `Consumer` trait the channel talks to, the `SubscriberId`
//! used for idempotent membership, and a concrete `Subscriber`.

#[allow(clippy::module_inception)]
pub mod subscriber;

pub use subscriber::{Consumer, Subscriber, SubscriberId};
