//! A named subscription stream within a topic.
//!
//! Each channel runs four background tasks:
//! - router: incoming path -> in-memory lane, or the backend when the lane is full
//! - pump: lane + backend read stream -> delivery output
//! - in-flight sweep: requeues deliveries that were not finished in time
//! - deferred sweep: re-injects messages whose requeue delay has elapsed
//!
//! The subscriber list, the in-flight table and the two deadline queues each
//! have their own lock. Nothing holds a lock across an `.await`.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use flume::TrySendError;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::{ChannelConfig, Config};
use crate::core::backend::{BackendQueue, DiskQueue};
use crate::core::error::{BackendError, ChannelError};
use crate::core::inflight::{InFlightRecord, InFlightTracker};
use crate::core::message::{decode_message, encode_message, Message, MessageId};
use crate::core::pqueue::{DeadlineEntry, DeadlineQueue};
use crate::core::shutdown::{Shutdown, ShutdownListener};
use crate::core::stats::{ChannelStats, ChannelStatsSnapshot};
use crate::core::subscriber::Consumer;
use crate::core::sweep::{SharedDeadlineQueue, SweepWorker};

/// Buffer of the incoming path; a full buffer throttles publishers.
pub const INCOMING_BUFFER: usize = 5;

/// Events posted to an optional observer. Delivery is best-effort.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Created { topic: String, channel: String },
}

/// State shared between the public handle and the background tasks.
#[derive(Debug)]
struct Core {
    topic_name: String,
    name: String,
    backend: Arc<dyn BackendQueue>,
    incoming_tx: flume::Sender<Message>,
    in_flight: InFlightTracker,
    in_flight_pq: SharedDeadlineQueue<MessageId>,
    deferred_pq: SharedDeadlineQueue<Message>,
    stats: ChannelStats,
}

#[derive(Debug)]
struct Tasks {
    router: JoinHandle<()>,
    pump: JoinHandle<()>,
    in_flight_sweep: JoinHandle<()>,
    deferred_sweep: JoinHandle<()>,
}

#[derive(Debug)]
pub struct Channel {
    core: Arc<Core>,
    msg_timeout: Duration,
    incoming_rx: Mutex<Option<flume::Receiver<Message>>>,
    memory_rx: flume::Receiver<Message>,
    client_rx: flume::Receiver<Message>,
    clients: RwLock<Vec<Arc<dyn Consumer>>>,
    shutdown: Shutdown,
    tasks: Mutex<Option<Tasks>>,
}

impl Channel {
    /// Creates a channel backed by a [`DiskQueue`] named `"{topic}:{channel}"`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(
        topic_name: impl Into<String>,
        name: impl Into<String>,
        config: &Config,
        notifier: Option<&flume::Sender<ChannelEvent>>,
    ) -> Result<Self, ChannelError> {
        let topic_name = topic_name.into();
        let name = name.into();
        let backend = DiskQueue::open(
            format!("{topic_name}:{name}"),
            config.backend.disk_queue_options(),
        )?;
        Ok(Self::with_backend(
            topic_name,
            name,
            &config.channel,
            Arc::new(backend),
            notifier,
        ))
    }

    /// Creates a channel over an existing backend and starts its tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn with_backend(
        topic_name: impl Into<String>,
        name: impl Into<String>,
        config: &ChannelConfig,
        backend: Arc<dyn BackendQueue>,
        notifier: Option<&flume::Sender<ChannelEvent>>,
    ) -> Self {
        let topic_name = topic_name.into();
        let name = name.into();
        let pq_capacity = config.mem_queue_size / 10;

        let (incoming_tx, incoming_rx) = flume::bounded(INCOMING_BUFFER);
        let (memory_tx, memory_rx) = flume::bounded(config.mem_queue_size);
        let (client_tx, client_rx) = flume::bounded(0);
        let (shutdown, exit) = Shutdown::new();

        let core = Arc::new(Core {
            topic_name,
            name,
            backend: Arc::clone(&backend),
            incoming_tx,
            in_flight: InFlightTracker::with_capacity(pq_capacity),
            in_flight_pq: Arc::new(Mutex::new(DeadlineQueue::with_capacity(pq_capacity))),
            deferred_pq: Arc::new(Mutex::new(DeadlineQueue::with_capacity(pq_capacity))),
            stats: ChannelStats::default(),
        });

        let router = tokio::spawn(router(
            Arc::clone(&core),
            incoming_rx.clone(),
            memory_tx,
            exit.clone(),
        ));
        let pump = tokio::spawn(message_pump(
            Arc::clone(&core),
            memory_rx.clone(),
            backend.read_chan(),
            client_tx,
            exit.clone(),
        ));

        let sweep_core = Arc::clone(&core);
        let in_flight_sweep = tokio::spawn(
            SweepWorker::new("in_flight", Arc::clone(&core.in_flight_pq), config.worker_wait())
                .run(exit.clone(), move |entry| {
                    let core = Arc::clone(&sweep_core);
                    async move { core.process_timeout(entry).await }
                }),
        );

        let sweep_core = Arc::clone(&core);
        let deferred_sweep = tokio::spawn(
            SweepWorker::new("deferred", Arc::clone(&core.deferred_pq), config.worker_wait()).run(
                exit,
                move |entry| {
                    let core = Arc::clone(&sweep_core);
                    async move { core.process_deferred(entry).await }
                },
            ),
        );

        info!(
            target: "driftmq::channel",
            topic = %core.topic_name,
            channel = %core.name,
            mem_queue_size = config.mem_queue_size,
            msg_timeout_ms = config.msg_timeout_ms,
            "created"
        );
        if let Some(notifier) = notifier {
            let _ = notifier.try_send(ChannelEvent::Created {
                topic: core.topic_name.clone(),
                channel: core.name.clone(),
            });
        }

        Self {
            core,
            msg_timeout: config.msg_timeout(),
            incoming_rx: Mutex::new(Some(incoming_rx)),
            memory_rx,
            client_rx,
            clients: RwLock::new(Vec::with_capacity(5)),
            shutdown,
            tasks: Mutex::new(Some(Tasks {
                router,
                pump,
                in_flight_sweep,
                deferred_sweep,
            })),
        }
    }

    pub fn topic_name(&self) -> &str {
        &self.core.topic_name
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn is_exiting(&self) -> bool {
        self.shutdown.is_triggered()
    }

    /// Stream of messages ready for a consumer. Whoever takes a message is
    /// expected to call [`Channel::start_in_flight_timeout`] for it.
    pub fn client_messages(&self) -> flume::Receiver<Message> {
        self.client_rx.clone()
    }

    /// Publishes `msg` into the channel. Waits while the incoming buffer is full.
    pub async fn put_message(&self, msg: Message) -> Result<(), ChannelError> {
        if self.is_exiting() {
            return Err(ChannelError::Exiting);
        }
        self.core
            .incoming_tx
            .send_async(msg)
            .await
            .map_err(|_| ChannelError::Exiting)?;
        self.core.stats.inc_published();
        Ok(())
    }

    /// Marks `msg` as in flight to `consumer` until finished, requeued, or
    /// the message timeout elapses.
    pub fn start_in_flight_timeout(
        &self,
        msg: Message,
        consumer: Arc<dyn Consumer>,
    ) -> Result<(), ChannelError> {
        let deadline = deadline_after(self.msg_timeout, "message timeout")?;
        let record = InFlightRecord::new(msg, Arc::clone(&consumer), deadline);
        let entry = DeadlineEntry {
            key: record.timeout_key,
            deadline,
            value: record.id(),
        };

        self.core.in_flight.register(record)?;
        self.core.in_flight_pq.lock().push(entry);
        consumer.sending_message();
        Ok(())
    }

    /// Acknowledges an in-flight message; it will not be delivered again.
    pub fn finish_message(&self, id: &MessageId) -> Result<(), ChannelError> {
        let record = self.core.in_flight.pop(id).inspect_err(|e| {
            debug!(target: "driftmq::channel", channel = %self.core.name, id = %id, error = %e, "failed to finish message");
        })?;
        self.core.in_flight_pq.lock().remove(record.timeout_key);
        record.consumer.finished_message();
        Ok(())
    }

    /// Returns an in-flight message to the channel.
    ///
    /// A zero `delay` re-injects it immediately; otherwise it is held on the
    /// deferred queue until `delay` has elapsed. Two concurrent requeues of
    /// the same id are not serialized: the loser gets `NotInFlight`.
    ///
    /// Fails without touching the record if the channel is exiting or the
    /// delay cannot be represented as a deadline.
    pub async fn requeue_message(&self, id: &MessageId, delay: Duration) -> Result<(), ChannelError> {
        if self.is_exiting() {
            return Err(ChannelError::Exiting);
        }
        let deadline = if delay.is_zero() {
            None
        } else {
            Some(deadline_after(delay, "requeue delay")?)
        };

        let record = self.core.in_flight.pop(id).inspect_err(|e| {
            debug!(target: "driftmq::channel", channel = %self.core.name, id = %id, error = %e, "failed to requeue message");
        })?;
        self.core.in_flight_pq.lock().remove(record.timeout_key);
        record.consumer.requeued_message();

        let Some(deadline) = deadline else {
            return self.core.requeue(record.message).await;
        };
        self.core
            .deferred_pq
            .lock()
            .push(DeadlineEntry::new(deadline, record.message));
        Ok(())
    }

    pub fn add_client(&self, client: Arc<dyn Consumer>) {
        let mut clients = self.clients.write();
        if clients.iter().any(|c| c.id() == client.id()) {
            return;
        }
        clients.push(client);
    }

    pub fn remove_client(&self, client: &dyn Consumer) {
        let mut clients = self.clients.write();
        clients.retain(|c| c.id() != client.id());
    }

    /// Snapshot of the current subscriber list.
    pub fn clients(&self) -> Vec<Arc<dyn Consumer>> {
        self.clients.read().clone()
    }

    pub fn in_flight_count(&self) -> usize {
        self.core.in_flight.len()
    }

    pub fn deferred_count(&self) -> usize {
        self.core.deferred_pq.lock().len()
    }

    pub fn memory_depth(&self) -> usize {
        self.memory_rx.len()
    }

    pub fn backend_depth(&self) -> u64 {
        self.core.backend.depth()
    }

    pub fn stats(&self) -> ChannelStatsSnapshot {
        ChannelStatsSnapshot {
            in_flight_count: self.in_flight_count() as u64,
            deferred_count: self.deferred_count() as u64,
            memory_depth: self.memory_depth() as u64,
            backend_depth: self.backend_depth(),
            client_count: self.clients.read().len() as u64,
            ..self.core.stats.counters(&self.core.topic_name, &self.core.name)
        }
    }

    /// Stops the background tasks, moves everything still buffered in memory
    /// to the backend, then closes the backend.
    ///
    /// In-flight and deferred messages are not persisted.
    pub async fn close(&self) -> Result<(), ChannelError> {
        if !self.shutdown.trigger() {
            return Err(ChannelError::Exiting);
        }
        info!(target: "driftmq::channel", topic = %self.core.topic_name, channel = %self.core.name, "closing");

        let tasks = self.tasks.lock().take();
        let incoming_rx = self.incoming_rx.lock().take();

        if let Some(tasks) = tasks {
            // The pump may hand a message back to the backend on its way out.
            let _ = tasks.router.await;
            let _ = tasks.pump.await;

            let mut flushed = self.flush_lane(&self.memory_rx);

            // Sweeps finish their current drain before exiting; keep the
            // incoming path moving so requeues do not block them.
            for mut sweep in [tasks.in_flight_sweep, tasks.deferred_sweep] {
                if let Some(incoming_rx) = incoming_rx.as_ref() {
                    loop {
                        tokio::select! {
                            _ = &mut sweep => break,
                            Ok(msg) = incoming_rx.recv_async() => {
                                flushed += self.flush_one(&msg);
                            }
                        }
                    }
                } else {
                    let _ = sweep.await;
                }
            }

            if let Some(incoming_rx) = incoming_rx.as_ref() {
                flushed += self.flush_lane(incoming_rx);
            }
            if flushed > 0 {
                info!(target: "driftmq::channel", channel = %self.core.name, flushed, "flushed buffered messages to backend");
            }
        }
        drop(incoming_rx);

        self.core.backend.close()?;
        Ok(())
    }

    fn flush_lane(&self, lane: &flume::Receiver<Message>) -> usize {
        lane.drain().map(|msg| self.flush_one(&msg)).sum()
    }

    fn flush_one(&self, msg: &Message) -> usize {
        match self.core.write_to_backend(msg) {
            Ok(()) => 1,
            Err(e) => {
                error!(target: "driftmq::channel", channel = %self.core.name, id = %msg.id, error = %e, "failed to flush message to backend");
                0
            }
        }
    }
}

impl Core {
    fn write_to_backend(&self, msg: &Message) -> Result<(), BackendError> {
        self.backend.put(&encode_message(msg))
    }

    /// Sends `msg` back through the router.
    async fn requeue(&self, msg: Message) -> Result<(), ChannelError> {
        self.incoming_tx
            .send_async(msg)
            .await
            .map_err(|_| ChannelError::Exiting)?;
        self.stats.inc_requeued();
        Ok(())
    }

    async fn process_timeout(&self, entry: DeadlineEntry<MessageId>) {
        let id = entry.value;

        // A finished-then-redelivered id carries a new key; leave it alone.
        let Some(record) = self.in_flight.pop_if(&id, entry.key) else {
            return;
        };

        record.consumer.timed_out_message();
        self.stats.inc_timed_out();
        debug!(
            target: "driftmq::channel",
            channel = %self.name,
            id = %id,
            consumer = %record.consumer.id(),
            attempts = record.message.attempts,
            "message timed out"
        );

        if let Err(e) = self.requeue(record.message).await {
            warn!(target: "driftmq::channel", channel = %self.name, id = %id, error = %e, "failed to requeue timed out message");
        }
    }

    async fn process_deferred(&self, entry: DeadlineEntry<Message>) {
        let id = entry.value.id;
        if let Err(e) = self.requeue(entry.value).await {
            warn!(target: "driftmq::channel", channel = %self.name, id = %id, error = %e, "failed to requeue deferred message");
        }
    }
}

fn deadline_after(wait: Duration, what: &'static str) -> Result<Instant, ChannelError> {
    Instant::now()
        .checked_add(wait)
        .ok_or(ChannelError::OutOfRange(what))
}

async fn router(
    core: Arc<Core>,
    incoming_rx: flume::Receiver<Message>,
    memory_tx: flume::Sender<Message>,
    mut exit: ShutdownListener,
) {
    loop {
        let msg = tokio::select! {
            biased;
            _ = exit.wait() => return,
            msg = incoming_rx.recv_async() => match msg {
                Ok(msg) => msg,
                Err(_) => return,
            },
        };

        match memory_tx.try_send(msg) {
            Ok(()) => {}
            Err(TrySendError::Full(msg)) | Err(TrySendError::Disconnected(msg)) => {
                if let Err(e) = core.write_to_backend(&msg) {
                    error!(target: "driftmq::channel", channel = %core.name, id = %msg.id, error = %e, "failed to write message to backend");
                }
            }
        }
    }
}

async fn recv_backend(backend_rx: &Option<flume::Receiver<Bytes>>) -> Result<Bytes, flume::RecvError> {
    match backend_rx {
        Some(rx) => rx.recv_async().await,
        None => std::future::pending().await,
    }
}

async fn message_pump(
    core: Arc<Core>,
    memory_rx: flume::Receiver<Message>,
    backend_rx: flume::Receiver<Bytes>,
    client_tx: flume::Sender<Message>,
    mut exit: ShutdownListener,
) {
    let mut backend_rx = Some(backend_rx);

    loop {
        let mut msg = tokio::select! {
            _ = exit.wait() => return,
            msg = memory_rx.recv_async() => match msg {
                Ok(msg) => msg,
                Err(_) => return,
            },
            buf = recv_backend(&backend_rx) => match buf {
                Ok(buf) => match decode_message(&buf) {
                    Ok(msg) => msg,
                    Err(e) => {
                        error!(target: "driftmq::channel", channel = %core.name, error = %e, "failed to decode message");
                        continue;
                    }
                },
                Err(_) => {
                    warn!(target: "driftmq::channel", channel = %core.name, "backend read stream closed");
                    backend_rx = None;
                    continue;
                }
            },
        };

        msg.attempts = msg.attempts.saturating_add(1);
        let held = msg.clone();

        tokio::select! {
            biased;
            sent = client_tx.send_async(msg) => {
                if sent.is_err() {
                    return;
                }
                core.stats.inc_delivered();
            }
            _ = exit.wait() => {
                // Not delivered: undo the attempt and keep it for the next start.
                let mut held = held;
                held.attempts = held.attempts.saturating_sub(1);
                if let Err(e) = core.write_to_backend(&held) {
                    error!(target: "driftmq::channel", channel = %core.name, id = %held.id, error = %e, "failed to return undelivered message to backend");
                }
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::backend::MemoryQueue;
    use crate::core::message::new_message;
    use crate::core::subscriber::Subscriber;

    fn test_channel(mem_queue_size: usize) -> Channel {
        let cfg = ChannelConfig {
            mem_queue_size,
            msg_timeout_ms: 60_000,
            worker_wait_ms: 20,
        };
        Channel::with_backend("t", "c", &cfg, Arc::new(MemoryQueue::new("t:c")), None)
    }

    async fn recv(ch: &Channel) -> Message {
        tokio::time::timeout(Duration::from_secs(2), ch.client_messages().recv_async())
            .await
            .expect("no delivery")
            .unwrap()
    }

    #[tokio::test]
    async fn clients_are_deduplicated_by_id() {
        let ch = test_channel(10);
        let a: Arc<dyn Consumer> = Arc::new(Subscriber::new("a"));
        let a_again: Arc<dyn Consumer> = Arc::new(Subscriber::new("a"));
        let b: Arc<dyn Consumer> = Arc::new(Subscriber::new("b"));

        ch.add_client(Arc::clone(&a));
        ch.add_client(a_again);
        ch.add_client(Arc::clone(&b));
        assert_eq!(ch.clients().len(), 2);

        ch.remove_client(a.as_ref());
        ch.remove_client(a.as_ref());
        let left = ch.clients();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id().0, "b");
        ch.close().await.unwrap();
    }

    #[tokio::test]
    async fn same_id_cannot_be_in_flight_twice() {
        let ch = test_channel(10);
        let consumer: Arc<dyn Consumer> = Arc::new(Subscriber::new("a"));
        ch.put_message(new_message("x")).await.unwrap();
        let msg = recv(&ch).await;

        ch.start_in_flight_timeout(msg.clone(), Arc::clone(&consumer)).unwrap();
        assert!(matches!(
            ch.start_in_flight_timeout(msg.clone(), consumer),
            Err(ChannelError::AlreadyInFlight)
        ));
        assert_eq!(ch.in_flight_count(), 1);

        ch.finish_message(&msg.id).unwrap();
        assert!(matches!(ch.finish_message(&msg.id), Err(ChannelError::NotInFlight)));
        assert_eq!(ch.in_flight_count(), 0);
        assert!(ch.core.in_flight_pq.lock().is_empty());
        ch.close().await.unwrap();
    }

    #[tokio::test]
    async fn delivery_counts_attempts() {
        let ch = test_channel(10);
        let consumer: Arc<dyn Consumer> = Arc::new(Subscriber::new("a"));
        ch.put_message(new_message("x")).await.unwrap();

        let first = recv(&ch).await;
        assert_eq!(first.attempts, 1);
        ch.start_in_flight_timeout(first.clone(), consumer).unwrap();
        ch.requeue_message(&first.id, Duration::ZERO).await.unwrap();

        let second = recv(&ch).await;
        assert_eq!(second.id, first.id);
        assert_eq!(second.attempts, 2);

        let stats = ch.stats();
        assert_eq!(stats.put_count, 1);
        assert_eq!(stats.requeue_count, 1);
        assert!(stats.message_count >= 1);
        ch.close().await.unwrap();
    }

    #[tokio::test]
    async fn second_close_reports_exiting() {
        let ch = test_channel(10);
        ch.close().await.unwrap();
        assert!(ch.is_exiting());
        assert!(matches!(ch.close().await, Err(ChannelError::Exiting)));
        assert!(matches!(
            ch.put_message(new_message("late")).await,
            Err(ChannelError::Exiting)
        ));
    }
}
