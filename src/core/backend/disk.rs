//! Segmented, append-only on-disk queue.
//!
//! Layout under `data_path`:
//! - `{name}.diskqueue.{n:06}.dat`: segments of records
//!   `[len: u32 BE][crc32: u32 BE][payload]`
//! - `{name}.diskqueue.meta.dat`: depth and read/write positions
//!
//! The writer rolls to a new segment once its position reaches
//! `max_bytes_per_file`. A reader task hands records out over a rendezvous
//! channel and only advances the read position after a record has been
//! taken, so anything not yet consumed is still on disk after `close`.
//!
//! A segment that fails to open or read is renamed to `.bad`. Depth is then
//! recounted from the record headers of the segments still unread.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use crc32fast::Hasher as Crc32Hasher;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::core::backend::BackendQueue;
use crate::core::error::BackendError;
use crate::core::shutdown::{Shutdown, ShutdownListener};

const RECORD_HEADER_LEN: u64 = 4 + 4;

/// Upper bound on a single record; anything larger is treated as corruption.
pub const MAX_RECORD_SIZE: u32 = 64 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct DiskQueueOptions {
    pub data_path: PathBuf,
    pub max_bytes_per_file: u64,
    /// Fsync and persist metadata every N writes (0 disables).
    pub sync_every: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Positions {
    depth: u64,
    read_file_num: u64,
    read_pos: u64,
    write_file_num: u64,
    write_pos: u64,
}

impl Positions {
    #[inline]
    fn has_unread(&self) -> bool {
        self.read_file_num < self.write_file_num || self.read_pos < self.write_pos
    }
}

#[derive(Debug)]
struct DiskState {
    pos: Positions,
    writer: Option<File>,
    writes_since_sync: u64,
    closed: bool,
}

#[derive(Debug)]
struct Inner {
    name: String,
    opts: DiskQueueOptions,
    state: Mutex<DiskState>,
    notify: Notify,
}

#[derive(Debug)]
pub struct DiskQueue {
    inner: Arc<Inner>,
    read_rx: flume::Receiver<Bytes>,
    shutdown: Shutdown,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl DiskQueue {
    /// Opens (or creates) the queue `name` and starts its reader task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(name: impl Into<String>, opts: DiskQueueOptions) -> Result<Self, BackendError> {
        let name = name.into();
        fs::create_dir_all(&opts.data_path)?;

        let inner = Arc::new(Inner {
            state: Mutex::new(DiskState {
                pos: Positions::default(),
                writer: None,
                writes_since_sync: 0,
                closed: false,
            }),
            notify: Notify::new(),
            name,
            opts,
        });

        let pos = inner.load_metadata()?;
        inner.state.lock().pos = pos;
        info!(
            target: "driftmq::diskqueue",
            name = %inner.name,
            depth = pos.depth,
            read = %format!("{}:{}", pos.read_file_num, pos.read_pos),
            write = %format!("{}:{}", pos.write_file_num, pos.write_pos),
            "opened"
        );

        let (read_tx, read_rx) = flume::bounded(0);
        let (shutdown, exit_rx) = Shutdown::new();
        let reader = tokio::spawn(read_loop(Arc::clone(&inner), read_tx, exit_rx));

        Ok(Self {
            inner,
            read_rx,
            shutdown,
            reader: Mutex::new(Some(reader)),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Path of segment `file_num`.
    pub fn segment_path(&self, file_num: u64) -> PathBuf {
        self.inner.segment_path(file_num)
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.inner.metadata_path()
    }
}

impl BackendQueue for DiskQueue {
    fn put(&self, data: &[u8]) -> Result<(), BackendError> {
        let len = u32::try_from(data.len())
            .ok()
            .filter(|len| *len <= MAX_RECORD_SIZE)
            .ok_or_else(|| BackendError::Corruption(format!("record too large: {}", data.len())))?;

        let mut crc = Crc32Hasher::new();
        crc.update(data);

        let mut record = BytesMut::with_capacity(RECORD_HEADER_LEN as usize + data.len());
        record.put_u32(len);
        record.put_u32(crc.finalize());
        record.put_slice(data);

        {
            let mut st = self.inner.state.lock();
            self.inner.write_record(&mut st, &record)?;
        }
        self.inner.notify.notify_one();
        Ok(())
    }

    fn read_chan(&self) -> flume::Receiver<Bytes> {
        self.read_rx.clone()
    }

    fn close(&self) -> Result<(), BackendError> {
        self.shutdown.trigger();
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }

        let mut st = self.inner.state.lock();
        if st.closed {
            return Ok(());
        }
        st.closed = true;

        if let Some(writer) = st.writer.take() {
            writer.sync_all()?;
        }
        self.inner.persist_metadata(&st.pos)?;
        info!(target: "driftmq::diskqueue", name = %self.inner.name, depth = st.pos.depth, "closed");
        Ok(())
    }

    fn depth(&self) -> u64 {
        self.inner.state.lock().pos.depth
    }
}

impl Inner {
    fn segment_path(&self, file_num: u64) -> PathBuf {
        self.opts
            .data_path
            .join(format!("{}.diskqueue.{:06}.dat", self.name, file_num))
    }

    fn metadata_path(&self) -> PathBuf {
        self.opts
            .data_path
            .join(format!("{}.diskqueue.meta.dat", self.name))
    }

    fn write_record(&self, st: &mut DiskState, record: &[u8]) -> Result<(), BackendError> {
        if st.closed {
            return Err(BackendError::Closed);
        }

        if st.writer.is_none() {
            let path = self.segment_path(st.pos.write_file_num);
            let mut file = OpenOptions::new().create(true).write(true).open(&path)?;
            file.seek(SeekFrom::Start(st.pos.write_pos))?;
            debug!(target: "driftmq::diskqueue", name = %self.name, path = %path.display(), "opened segment for writing");
            st.writer = Some(file);
        }

        let writer = st.writer.as_mut().ok_or(BackendError::Closed)?;
        if let Err(e) = writer.write_all(record) {
            // Position is unknown after a partial write; reopen on next put.
            st.writer = None;
            return Err(e.into());
        }

        st.pos.write_pos += record.len() as u64;
        st.pos.depth += 1;
        st.writes_since_sync += 1;

        if self.opts.sync_every > 0 && st.writes_since_sync >= self.opts.sync_every {
            self.sync(st)?;
        }

        if st.pos.write_pos >= self.opts.max_bytes_per_file {
            if let Some(writer) = st.writer.take() {
                writer.sync_all()?;
            }
            st.pos.write_file_num += 1;
            st.pos.write_pos = 0;
            self.persist_metadata(&st.pos)?;
            debug!(target: "driftmq::diskqueue", name = %self.name, file_num = st.pos.write_file_num, "rolled segment");
        }
        Ok(())
    }

    fn sync(&self, st: &mut DiskState) -> Result<(), BackendError> {
        if let Some(writer) = st.writer.as_ref() {
            writer.sync_data()?;
        }
        self.persist_metadata(&st.pos)?;
        st.writes_since_sync = 0;
        Ok(())
    }

    /// Advances the read position past a record that was handed out.
    /// Returns the segment to delete when the record was its last.
    fn commit_read(&self, file_num: u64, next_pos: u64) -> Option<PathBuf> {
        let mut st = self.state.lock();
        if st.pos.read_file_num != file_num {
            // Segment was skipped as bad while the record was in hand.
            return None;
        }
        st.pos.read_pos = next_pos;
        st.pos.depth = st.pos.depth.saturating_sub(1);

        if st.pos.read_pos < self.opts.max_bytes_per_file {
            return None;
        }
        st.pos.read_file_num += 1;
        st.pos.read_pos = 0;
        Some(self.segment_path(file_num))
    }

    /// Moves a corrupt segment aside and continues from the next one.
    fn skip_bad_segment(&self, file_num: u64) {
        let mut st = self.state.lock();
        if st.pos.read_file_num != file_num {
            return;
        }

        let path = self.segment_path(file_num);
        let bad = path.with_extension("bad");
        warn!(target: "driftmq::diskqueue", name = %self.name, from = %path.display(), to = %bad.display(), "moving corrupt segment aside");
        if let Err(e) = fs::rename(&path, &bad) {
            error!(target: "driftmq::diskqueue", name = %self.name, error = %e, "failed to rename corrupt segment");
        }

        if st.pos.read_file_num == st.pos.write_file_num {
            st.writer = None;
            st.pos.write_file_num += 1;
            st.pos.write_pos = 0;
        }
        st.pos.read_file_num += 1;
        st.pos.read_pos = 0;

        let depth = self.count_unread(&st.pos);
        if depth != st.pos.depth {
            warn!(target: "driftmq::diskqueue", name = %self.name, before = st.pos.depth, after = depth, "depth recounted after skipping segment");
        }
        st.pos.depth = depth;
    }

    /// Complete records between the read and write positions.
    fn count_unread(&self, pos: &Positions) -> u64 {
        (pos.read_file_num..=pos.write_file_num)
            .map(|file_num| {
                let start = if file_num == pos.read_file_num { pos.read_pos } else { 0 };
                let end = (file_num == pos.write_file_num).then_some(pos.write_pos);
                self.count_records(file_num, start, end)
            })
            .sum()
    }

    /// Walks record headers from `start` up to `end` (or end of file). Stops
    /// at the first header that cannot describe a whole record.
    fn count_records(&self, file_num: u64, start: u64, end: Option<u64>) -> u64 {
        let Ok(mut file) = File::open(self.segment_path(file_num)) else {
            return 0;
        };
        let end = match end {
            Some(end) => end,
            None => file.metadata().map(|m| m.len()).unwrap_or(0),
        };

        let mut header = [0u8; RECORD_HEADER_LEN as usize];
        let mut pos = start;
        let mut count = 0;
        while pos + RECORD_HEADER_LEN <= end {
            if file.seek(SeekFrom::Start(pos)).is_err() || file.read_exact(&mut header).is_err() {
                break;
            }
            let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
            let next = pos + RECORD_HEADER_LEN + u64::from(len);
            if len > MAX_RECORD_SIZE || next > end {
                break;
            }
            count += 1;
            pos = next;
        }
        count
    }

    fn persist_metadata(&self, pos: &Positions) -> Result<(), BackendError> {
        let path = self.metadata_path();
        let tmp = path.with_extension("tmp");
        {
            let mut f = File::create(&tmp)?;
            write!(
                f,
                "{}\n{},{}\n{},{}\n",
                pos.depth, pos.read_file_num, pos.read_pos, pos.write_file_num, pos.write_pos
            )?;
            f.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn load_metadata(&self) -> Result<Positions, BackendError> {
        let raw = match fs::read_to_string(self.metadata_path()) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Positions::default()),
            Err(e) => return Err(e.into()),
        };
        parse_metadata(&raw).ok_or_else(|| {
            BackendError::Corruption(format!("malformed metadata in {}", self.metadata_path().display()))
        })
    }
}

fn parse_metadata(raw: &str) -> Option<Positions> {
    let mut lines = raw.lines();
    let depth = lines.next()?.trim().parse().ok()?;
    let pair = |line: &str| -> Option<(u64, u64)> {
        let (a, b) = line.trim().split_once(',')?;
        Some((a.parse().ok()?, b.parse().ok()?))
    };
    let (read_file_num, read_pos) = pair(lines.next()?)?;
    let (write_file_num, write_pos) = pair(lines.next()?)?;
    Some(Positions {
        depth,
        read_file_num,
        read_pos,
        write_file_num,
        write_pos,
    })
}

/// Open read handle positioned at the next unread record.
struct ReadCursor {
    file_num: u64,
    pos: u64,
    file: tokio::fs::File,
}

impl ReadCursor {
    async fn open(path: &Path, file_num: u64, pos: u64) -> io::Result<Self> {
        let mut file = tokio::fs::File::open(path).await?;
        file.seek(SeekFrom::Start(pos)).await?;
        Ok(Self { file_num, pos, file })
    }

    async fn read_record(&mut self) -> Result<Bytes, BackendError> {
        let mut header = [0u8; RECORD_HEADER_LEN as usize];
        self.file.read_exact(&mut header).await?;
        let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        let expected = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
        if len > MAX_RECORD_SIZE {
            return Err(BackendError::Corruption(format!(
                "record length {len} at offset {} exceeds limit",
                self.pos
            )));
        }

        let mut payload = vec![0u8; len as usize];
        self.file.read_exact(&mut payload).await?;

        let mut crc = Crc32Hasher::new();
        crc.update(&payload);
        let actual = crc.finalize();
        if actual != expected {
            return Err(BackendError::Corruption(format!(
                "CRC mismatch at offset {}: expected {expected:08x}, got {actual:08x}",
                self.pos
            )));
        }

        self.pos += RECORD_HEADER_LEN + len as u64;
        Ok(Bytes::from(payload))
    }
}

/// Runs the rename and recount off the async workers.
async fn skip_bad_segment(inner: &Arc<Inner>, file_num: u64) {
    let inner = Arc::clone(inner);
    if let Err(e) = tokio::task::spawn_blocking(move || inner.skip_bad_segment(file_num)).await {
        error!(target: "driftmq::diskqueue", error = %e, "segment skip task failed");
    }
}

async fn read_loop(inner: Arc<Inner>, tx: flume::Sender<Bytes>, mut exit: ShutdownListener) {
    let mut cursor: Option<ReadCursor> = None;

    loop {
        let next = {
            let st = inner.state.lock();
            st.pos
                .has_unread()
                .then_some((st.pos.read_file_num, st.pos.read_pos))
        };

        let Some((file_num, pos)) = next else {
            tokio::select! {
                _ = inner.notify.notified() => continue,
                _ = exit.wait() => return,
            }
        };

        let stale = cursor
            .as_ref()
            .map_or(true, |c| c.file_num != file_num || c.pos != pos);
        if stale {
            cursor = match ReadCursor::open(&inner.segment_path(file_num), file_num, pos).await {
                Ok(c) => Some(c),
                Err(e) => {
                    error!(target: "driftmq::diskqueue", name = %inner.name, file_num, error = %e, "failed to open segment for reading");
                    skip_bad_segment(&inner, file_num).await;
                    continue;
                }
            };
        }

        let Some(reader) = cursor.as_mut() else { continue };
        let data = match reader.read_record().await {
            Ok(data) => data,
            Err(e) => {
                error!(target: "driftmq::diskqueue", name = %inner.name, file_num, pos, error = %e, "failed to read record");
                cursor = None;
                skip_bad_segment(&inner, file_num).await;
                continue;
            }
        };
        let next_pos = reader.pos;

        tokio::select! {
            biased;
            sent = tx.send_async(data) => {
                if sent.is_err() {
                    return;
                }
                if let Some(done) = inner.commit_read(file_num, next_pos) {
                    cursor = None;
                    if let Err(e) = tokio::fs::remove_file(&done).await {
                        error!(target: "driftmq::diskqueue", name = %inner.name, path = %done.display(), error = %e, "failed to remove consumed segment");
                    }
                }
            }
            _ = exit.wait() => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn opts(dir: &Path, max_bytes_per_file: u64) -> DiskQueueOptions {
        DiskQueueOptions {
            data_path: dir.to_path_buf(),
            max_bytes_per_file,
            sync_every: 1,
        }
    }

    async fn recv(rx: &flume::Receiver<Bytes>) -> Bytes {
        tokio::time::timeout(Duration::from_secs(2), rx.recv_async())
            .await
            .expect("disk queue did not deliver")
            .unwrap()
    }

    #[tokio::test]
    async fn reads_back_in_write_order() {
        let dir = tempfile::tempdir().unwrap();
        let q = DiskQueue::open("t:c", opts(dir.path(), 1024 * 1024)).unwrap();

        for i in 0..10u8 {
            q.put(&[i; 3]).unwrap();
        }
        let rx = q.read_chan();
        for i in 0..10u8 {
            assert_eq!(recv(&rx).await.as_ref(), &[i; 3]);
        }
        q.close().unwrap();
        assert_eq!(q.depth(), 0);
    }

    #[tokio::test]
    async fn rolls_and_removes_segments() {
        let dir = tempfile::tempdir().unwrap();
        // Each record is 8 + 16 bytes, so every segment holds two.
        let q = DiskQueue::open("roll", opts(dir.path(), 40)).unwrap();
        for i in 0..6u8 {
            q.put(&[i; 16]).unwrap();
        }
        assert!(q.segment_path(0).exists());
        assert!(q.segment_path(2).exists());

        let rx = q.read_chan();
        for i in 0..6u8 {
            assert_eq!(recv(&rx).await[0], i);
        }
        // Give the reader a moment to commit the last hand-off.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!q.segment_path(0).exists());
        assert!(!q.segment_path(1).exists());
        q.close().unwrap();
    }

    #[tokio::test]
    async fn unread_records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let q = DiskQueue::open("persist", opts(dir.path(), 1024)).unwrap();
            q.put(b"one").unwrap();
            q.put(b"two").unwrap();
            q.close().unwrap();
            assert!(matches!(q.put(b"late"), Err(BackendError::Closed)));
        }

        let q = DiskQueue::open("persist", opts(dir.path(), 1024)).unwrap();
        assert_eq!(q.depth(), 2);
        let rx = q.read_chan();
        assert_eq!(recv(&rx).await, Bytes::from_static(b"one"));
        assert_eq!(recv(&rx).await, Bytes::from_static(b"two"));
        q.close().unwrap();
    }

    #[tokio::test]
    async fn corrupt_segment_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let q = DiskQueue::open("bad", opts(dir.path(), 1024 * 1024)).unwrap();
        q.put(b"doomed").unwrap();
        q.close().unwrap();

        // Flip the last payload byte so the CRC no longer matches.
        let seg = q.segment_path(0);
        let mut raw = fs::read(&seg).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xFF;
        fs::write(&seg, raw).unwrap();

        let q = DiskQueue::open("bad", opts(dir.path(), 1024 * 1024)).unwrap();
        let moved = seg.with_extension("bad");
        tokio::time::timeout(Duration::from_secs(2), async {
            while !moved.exists() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("corrupt segment was not moved aside");
        assert_eq!(q.depth(), 0);

        q.put(b"fresh").unwrap();
        let rx = q.read_chan();
        assert_eq!(recv(&rx).await, Bytes::from_static(b"fresh"));
        q.close().unwrap();
    }

    #[tokio::test]
    async fn skipping_a_segment_recounts_depth() {
        let dir = tempfile::tempdir().unwrap();
        // Two 24-byte records per segment.
        {
            let q = DiskQueue::open("multi", opts(dir.path(), 40)).unwrap();
            for i in 0..4u8 {
                q.put(&[i; 16]).unwrap();
            }
            q.close().unwrap();
        }

        let seg = dir.path().join("multi.diskqueue.000000.dat");
        let mut raw = fs::read(&seg).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xFF;
        fs::write(&seg, raw).unwrap();

        let q = DiskQueue::open("multi", opts(dir.path(), 40)).unwrap();
        assert_eq!(q.depth(), 4);
        let rx = q.read_chan();
        assert_eq!(recv(&rx).await[0], 0);

        let moved = seg.with_extension("bad");
        tokio::time::timeout(Duration::from_secs(2), async {
            while !moved.exists() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("corrupt segment was not moved aside");
        assert_eq!(q.depth(), 2);

        assert_eq!(recv(&rx).await[0], 2);
        assert_eq!(recv(&rx).await[0], 3);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(q.depth(), 0);
        q.close().unwrap();
    }

    #[test]
    fn metadata_parses_and_rejects_garbage() {
        let pos = parse_metadata("3\n1,40\n2,16\n").unwrap();
        assert_eq!(
            pos,
            Positions {
                depth: 3,
                read_file_num: 1,
                read_pos: 40,
                write_file_num: 2,
                write_pos: 16,
            }
        );
        assert!(parse_metadata("x\n").is_none());
        assert!(parse_metadata("1\n2\n").is_none());
    }
}
