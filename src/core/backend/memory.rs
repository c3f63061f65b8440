use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;

use crate::core::backend::BackendQueue;
use crate::core::error::BackendError;

/// Unbounded, volatile backend. Useful when durability is not wanted and in
/// tests; whatever is still queued after `close` stays readable.
#[derive(Debug)]
pub struct MemoryQueue {
    name: String,
    tx: flume::Sender<Bytes>,
    rx: flume::Receiver<Bytes>,
    closed: AtomicBool,
}

impl MemoryQueue {
    pub fn new(name: impl Into<String>) -> Self {
        let (tx, rx) = flume::unbounded();
        Self {
            name: name.into(),
            tx,
            rx,
            closed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl BackendQueue for MemoryQueue {
    fn put(&self, data: &[u8]) -> Result<(), BackendError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BackendError::Closed);
        }
        self.tx
            .send(Bytes::copy_from_slice(data))
            .map_err(|_| BackendError::Closed)
    }

    fn read_chan(&self) -> flume::Receiver<Bytes> {
        self.rx.clone()
    }

    fn close(&self) -> Result<(), BackendError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    fn depth(&self) -> u64 {
        self.rx.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preserves_write_order() {
        let q = MemoryQueue::new("t:c");
        for i in 0..5u8 {
            q.put(&[i]).unwrap();
        }
        assert_eq!(q.depth(), 5);

        let rx = q.read_chan();
        let got: Vec<u8> = (0..5).map(|_| rx.try_recv().unwrap()[0]).collect();
        assert_eq!(got, vec![0, 1, 2, 3, 4]);
        assert_eq!(q.depth(), 0);
    }

    #[test]
    fn put_after_close_fails_but_data_survives() {
        let q = MemoryQueue::new("t:c");
        q.put(b"kept").unwrap();
        q.close().unwrap();

        assert!(matches!(q.put(b"late"), Err(BackendError::Closed)));
        assert_eq!(q.read_chan().try_recv().unwrap(), Bytes::from_static(b"kept"));
    }
}
