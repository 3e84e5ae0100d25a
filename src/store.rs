//! Store tier: persists every dispatched packet.
//!
//! On disk the log is a sequence of `[8B createdAt ms BE][frame]` records,
//! where `frame` is the wire encoding of the packet. The index lives in
//! memory and is rebuilt by replaying the file through a read-only mmap.
//! A torn record at the tail is cut off on open.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::{Buf, BufMut, BytesMut};
use memmap2::Mmap;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::codec::{self, HEADER_LEN, LENGTH_PREFIX_LEN};
use crate::config::StoreConfig;
use crate::error::{FrameError, PersistenceError, TransportError};
use crate::monitor::GatewayMonitor;
use crate::packet::Packet;
use crate::queue::{QueueTransport, Subscription, GROUP_DISPATCH_STORE, GROUP_OFFLINE_STORE, TOPIC_DISPATCH, TOPIC_OFFLINE};

pub const RECORD_HEADER_LEN: usize = 8;

/// Persistence seam used by the store service.
pub trait MessageStore: Send + Sync {
    fn save(&self, packet: &Packet) -> Result<(), PersistenceError>;

    /// Saves all packets or, on error, none of them.
    fn save_multi(&self, packets: &[Packet]) -> Result<(), PersistenceError>;

    /// Up to `limit` packets for `rid` with `mid > after_mid`, newest first.
    fn range(&self, rid: i64, after_mid: i64, limit: usize) -> Result<Vec<Packet>, PersistenceError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub created_at: i64,
    pub packet: Packet,
}

struct LogState {
    writer: File,
    reader: File,
    end: u64,
    records: u64,
    /// rid → mid → record offset. A repeated mid keeps its latest offset.
    index: HashMap<i64, BTreeMap<i64, u64>>,
}

pub struct FileMessageStore {
    path: PathBuf,
    state: Mutex<LogState>,
}

impl FileMessageStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut writer = OpenOptions::new().read(true).write(true).create(true).truncate(false).open(&path)?;
        let file_len = writer.metadata()?.len();
        let (index, end, records) = replay(&writer)?;
        if end < file_len {
            warn!("Discarding {} bytes of torn tail in {:?}", file_len - end, path);
            writer.set_len(end)?;
        }
        writer.seek(SeekFrom::Start(end))?;
        let reader = File::open(&path)?;

        info!("Opened message log {:?}: {} records, {} recipients", path, records, index.len());
        Ok(Self {
            path,
            state: Mutex::new(LogState {
                writer,
                reader,
                end,
                records,
                index,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn state(&self) -> MutexGuard<'_, LogState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records appended so far, duplicates included.
    pub fn len(&self) -> u64 {
        self.state().records
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Like [`MessageStore::range`] but keeps the stored timestamp.
    pub fn records(&self, rid: i64, after_mid: i64, limit: usize) -> Result<Vec<MessageRecord>, PersistenceError> {
        let mut state = self.state();
        let offsets: Vec<u64> = match state.index.get(&rid) {
            Some(by_mid) => by_mid
                .range((Bound::Excluded(after_mid), Bound::Unbounded))
                .rev()
                .take(limit)
                .map(|(_, offset)| *offset)
                .collect(),
            None => return Ok(Vec::new()),
        };
        offsets.into_iter().map(|offset| state.read_at(offset)).collect()
    }

    fn append(&self, packets: &[Packet]) -> Result<(), PersistenceError> {
        if packets.is_empty() {
            return Ok(());
        }
        let created_at = chrono::Utc::now().timestamp_millis();

        let mut buf = BytesMut::new();
        let mut placed = Vec::with_capacity(packets.len());
        for packet in packets {
            placed.push((packet.rid, packet.mid, buf.len() as u64));
            buf.put_i64(created_at);
            buf.extend_from_slice(&codec::serialize(packet));
        }

        let mut state = self.state();
        let start = state.end;
        if let Err(e) = state.write_batch(&buf) {
            // leave no partial batch behind
            if let Err(cut) = state.truncate_to(start) {
                error!("Failed to roll back partial write in {:?}: {}", self.path, cut);
            }
            return Err(e.into());
        }

        for (rid, mid, relative) in placed {
            state.index.entry(rid).or_default().insert(mid, start + relative);
        }
        state.end = start + buf.len() as u64;
        state.records += packets.len() as u64;
        Ok(())
    }
}

impl LogState {
    fn write_batch(&mut self, buf: &[u8]) -> std::io::Result<()> {
        self.writer.write_all(buf)?;
        self.writer.flush()?;
        self.writer.sync_data()
    }

    fn truncate_to(&mut self, len: u64) -> std::io::Result<()> {
        self.writer.set_len(len)?;
        self.writer.seek(SeekFrom::Start(len))?;
        Ok(())
    }

    fn read_at(&mut self, offset: u64) -> Result<MessageRecord, PersistenceError> {
        let corrupt = |source: FrameError| PersistenceError::Corrupt { offset, source };

        let mut head = [0u8; RECORD_HEADER_LEN + LENGTH_PREFIX_LEN];
        self.reader.seek(SeekFrom::Start(offset))?;
        self.reader.read_exact(&mut head)?;
        let frame_len = (&head[RECORD_HEADER_LEN..]).get_u32() as usize;

        let mut record = vec![0u8; RECORD_HEADER_LEN + LENGTH_PREFIX_LEN + frame_len];
        record[..head.len()].copy_from_slice(&head);
        self.reader.read_exact(&mut record[head.len()..])?;

        decode_record(&record).map(|(record, _)| record).map_err(corrupt)
    }
}

impl MessageStore for FileMessageStore {
    fn save(&self, packet: &Packet) -> Result<(), PersistenceError> {
        self.append(std::slice::from_ref(packet))
    }

    fn save_multi(&self, packets: &[Packet]) -> Result<(), PersistenceError> {
        self.append(packets)
    }

    fn range(&self, rid: i64, after_mid: i64, limit: usize) -> Result<Vec<Packet>, PersistenceError> {
        Ok(self
            .records(rid, after_mid, limit)?
            .into_iter()
            .map(|record| record.packet)
            .collect())
    }
}

/// Decodes one record from the front of `buf`, returning it and its size.
pub fn decode_record(buf: &[u8]) -> Result<(MessageRecord, usize), FrameError> {
    let min = RECORD_HEADER_LEN + LENGTH_PREFIX_LEN;
    if buf.len() < min {
        return Err(FrameError::Truncated {
            expected: min,
            actual: buf.len(),
        });
    }
    let mut head = buf;
    let created_at = head.get_i64();
    let body_len = head.get_u32() as usize;
    if body_len < HEADER_LEN {
        return Err(FrameError::TooShort(body_len));
    }
    let frame_len = LENGTH_PREFIX_LEN + body_len;
    let frame = &buf[RECORD_HEADER_LEN..];
    if frame.len() < frame_len {
        return Err(FrameError::Truncated {
            expected: frame_len,
            actual: frame.len(),
        });
    }
    let packet = codec::deserialize_with_limit(&frame[..frame_len], u32::MAX as usize)?;
    Ok((MessageRecord { created_at, packet }, RECORD_HEADER_LEN + frame_len))
}

type Replayed = (HashMap<i64, BTreeMap<i64, u64>>, u64, u64);

/// Rebuilds the index. Returns it with the length of the valid prefix and
/// the number of records in it.
fn replay(file: &File) -> Result<Replayed, PersistenceError> {
    let mut index: HashMap<i64, BTreeMap<i64, u64>> = HashMap::new();
    if file.metadata()?.len() == 0 {
        return Ok((index, 0, 0));
    }

    let mmap = unsafe { Mmap::map(file)? };
    let mut offset = 0usize;
    let mut records = 0u64;
    while offset < mmap.len() {
        match decode_record(&mmap[offset..]) {
            Ok((record, used)) => {
                index
                    .entry(record.packet.rid)
                    .or_default()
                    .insert(record.packet.mid, offset as u64);
                offset += used;
                records += 1;
            }
            Err(FrameError::Truncated { .. }) => break,
            Err(source) => {
                return Err(PersistenceError::Corrupt {
                    offset: offset as u64,
                    source,
                })
            }
        }
    }
    Ok((index, offset as u64, records))
}

/// Worker pool draining the dispatch topic (and optionally the offline
/// topic) into a [`MessageStore`] in small batches.
pub struct StoreService {
    config: StoreConfig,
    store: Arc<dyn MessageStore>,
    queue: Arc<dyn QueueTransport>,
    monitor: Arc<GatewayMonitor>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl StoreService {
    pub fn new(
        config: StoreConfig,
        store: Arc<dyn MessageStore>,
        queue: Arc<dyn QueueTransport>,
        monitor: Arc<GatewayMonitor>,
    ) -> Self {
        Self {
            config,
            store,
            queue,
            monitor,
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    pub async fn start(self: &Arc<Self>) -> Result<(), TransportError> {
        let workers = self.config.workers.max(1);
        for worker in 0..workers {
            let dispatch = self.queue.subscribe(TOPIC_DISPATCH, GROUP_DISPATCH_STORE).await?;
            let offline = if self.config.subscribe_offline {
                Some(self.queue.subscribe(TOPIC_OFFLINE, GROUP_OFFLINE_STORE).await?)
            } else {
                None
            };
            self.tasks.spawn(store_worker(Arc::clone(self), worker, dispatch, offline));
        }
        info!("Store service started {} workers", workers);
        Ok(())
    }

    /// Stops the workers; each persists the batch it is holding first.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        info!("Store service stopped");
    }

    /// Writes one batch on the blocking pool. Returns how many packets were stored.
    pub async fn persist(&self, batch: Vec<Packet>) -> usize {
        let count = batch.len();
        if count == 0 {
            return 0;
        }
        let store = Arc::clone(&self.store);
        let written = tokio::task::spawn_blocking(move || match batch.as_slice() {
            [single] => store.save(single),
            many => store.save_multi(many),
        })
        .await
        .map_err(|e| PersistenceError::Worker(e.to_string()))
        .and_then(|result| result);

        match written {
            Ok(()) => {
                self.monitor.stored.fetch_add(count as u64, Ordering::Relaxed);
                debug!(count, "persisted batch");
                count
            }
            Err(e) => {
                self.monitor.persistence_errors.fetch_add(count as u64, Ordering::Relaxed);
                error!(count, error = %e, "failed to persist batch");
                0
            }
        }
    }

    async fn next_packet(&self, dispatch: &Subscription, offline: Option<&Subscription>) -> Option<Packet> {
        loop {
            let bytes = match offline {
                Some(offline) => tokio::select! {
                    biased;
                    _ = self.shutdown.cancelled() => return None,
                    next = dispatch.recv() => next?,
                    next = offline.recv() => next?,
                },
                None => tokio::select! {
                    biased;
                    _ = self.shutdown.cancelled() => return None,
                    next = dispatch.recv() => next?,
                },
            };
            match codec::deserialize(&bytes) {
                Ok(packet) => return Some(packet),
                Err(e) => {
                    self.monitor.protocol_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, "undecodable packet reached the store");
                }
            }
        }
    }
}

async fn store_worker(service: Arc<StoreService>, worker: usize, dispatch: Subscription, offline: Option<Subscription>) {
    let max_batch = service.config.batch_size.max(1);
    let window = Duration::from_millis(service.config.flush_interval_ms);

    loop {
        let Some(first) = service.next_packet(&dispatch, offline.as_ref()).await else {
            break;
        };
        let mut batch = Vec::with_capacity(max_batch);
        batch.push(first);

        let deadline = tokio::time::Instant::now() + window;
        let mut open = true;
        while batch.len() < max_batch {
            match tokio::time::timeout_at(deadline, service.next_packet(&dispatch, offline.as_ref())).await {
                Ok(Some(packet)) => batch.push(packet),
                Ok(None) => {
                    open = false;
                    break;
                }
                Err(_) => break,
            }
        }

        service.persist(batch).await;
        if !open {
            break;
        }
    }
    debug!(worker, "store worker stopped");
}
