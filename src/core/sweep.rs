//! Adaptive-sleep sweeper over a [`DeadlineQueue`].
//!
//! The worker sleeps until roughly the earliest deadline, then drains every
//! entry that is due through the callback before sleeping again. When the
//! queue is empty it falls back to the default wait interval.
//!
//! An entry pushed with a deadline earlier than the one currently being
//! waited on is not noticed until the current sleep ends. Entries are only
//! delayed by this, never lost.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::{sleep, Instant};
use tracing::trace;

use crate::core::pqueue::{DeadlineEntry, DeadlineQueue};
use crate::core::shutdown::ShutdownListener;

/// How long a worker waits when its queue is idle.
pub const DEFAULT_WORKER_WAIT: Duration = Duration::from_millis(250);

/// Floor for the idle wait; a zero wait would spin.
pub const MIN_WORKER_WAIT: Duration = Duration::from_millis(1);

/// Overshoot added to the computed wait so the head is due on wake.
const WAKE_SLACK: Duration = Duration::from_millis(1);

pub type SharedDeadlineQueue<T> = Arc<Mutex<DeadlineQueue<T>>>;

enum Next<T> {
    Due(DeadlineEntry<T>),
    Sleep(Duration),
}

#[derive(Debug)]
pub struct SweepWorker<T> {
    name: &'static str,
    queue: SharedDeadlineQueue<T>,
    default_wait: Duration,
}

impl<T> SweepWorker<T> {
    pub fn new(name: &'static str, queue: SharedDeadlineQueue<T>, default_wait: Duration) -> Self {
        Self {
            name,
            queue,
            default_wait: default_wait.max(MIN_WORKER_WAIT),
        }
    }

    /// Runs until `exit` fires, handing each due entry to `on_due`.
    ///
    /// The queue lock is never held while the callback runs.
    pub async fn run<F, Fut>(self, mut exit: ShutdownListener, mut on_due: F)
    where
        F: FnMut(DeadlineEntry<T>) -> Fut,
        Fut: Future<Output = ()>,
    {
        let mut wait = self.default_wait;
        loop {
            tokio::select! {
                _ = sleep(wait) => {}
                _ = exit.wait() => {
                    trace!(target: "driftmq::sweep", worker = self.name, "exiting");
                    return;
                }
            }

            let now = Instant::now();
            loop {
                match self.next(now) {
                    Next::Due(entry) => on_due(entry).await,
                    Next::Sleep(next_wait) => {
                        wait = next_wait;
                        break;
                    }
                }
            }
        }
    }

    fn next(&self, now: Instant) -> Next<T> {
        let mut queue = self.queue.lock();
        let deadline = match queue.peek() {
            Some(head) => head.deadline,
            None => return Next::Sleep(self.default_wait),
        };
        if deadline > now {
            return Next::Sleep(deadline.duration_since(now) + WAKE_SLACK);
        }
        match queue.pop() {
            Some(entry) => Next::Due(entry),
            None => Next::Sleep(self.default_wait),
        }
    }
}
