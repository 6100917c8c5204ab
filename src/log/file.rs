//! Durable fact log in a single append-only file.
//!
//! Each entry is one frame:
//!
//! ```text
//! magic "FCT\0" | version u8 | flags u8 | sequence u64 | timestamp i64
//! | body length u32 | body (MessagePack fact) | crc32 of body u32
//! ```
//!
//! Integers are little-endian. The index is rebuilt by scanning the file on
//! open; a torn frame at the end of the file is cut off.

use super::{check_new_ids, EntryIter, FactIndex, FactLog, ListenerId, Listeners, LogFilter, PublishListener};
use crate::error::{Result, StoreError};
use crate::tokens::AggregateState;
use crate::types::{Fact, LogEntry, Sequence, Timestamp};
use fs2::FileExt;
use parking_lot::{Mutex, RwLock};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Magic bytes of a frame.
const FRAME_MAGIC: &[u8; 4] = b"FCT\0";

/// Current frame format version.
const FRAME_VERSION: u8 = 1;

/// magic + version + flags + sequence + timestamp + body length
const FRAME_HEADER_SIZE: usize = 4 + 1 + 1 + 8 + 8 + 4;

const LOG_FILE: &str = "facts.log";
const LOCK_FILE: &str = "LOCK";

/// File log configuration.
#[derive(Clone, Debug)]
pub struct FileLogConfig {
    /// Directory holding the log and its lock file.
    pub path: PathBuf,

    /// Sync to disk every N appends. 0 and 1 both sync every append.
    pub sync_interval: u64,

    /// Whether to create the directory if it doesn't exist.
    pub create_if_missing: bool,
}

impl Default for FileLogConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./facts"),
            sync_interval: 100,
            create_if_missing: true,
        }
    }
}

struct Inner {
    /// Frame offset of the entry with sequence `n` at position `n - 1`.
    offsets: Vec<u64>,
    index: FactIndex,
    size: u64,
    writes_since_sync: u64,
}

/// Fact log persisted to disk.
pub struct FileFactLog {
    config: FileLogConfig,
    _lock_file: File,
    file: Mutex<File>,
    inner: RwLock<Inner>,
    write_lock: Mutex<()>,
    listeners: Listeners,
}

impl FileFactLog {
    /// Open the log in `config.path`, creating it if allowed.
    pub fn open(config: FileLogConfig) -> Result<Self> {
        if !config.path.exists() {
            if !config.create_if_missing {
                return Err(StoreError::NotInitialized);
            }
            fs::create_dir_all(&config.path)?;
        }

        let lock_file = Self::acquire_lock(&config.path)?;

        let path = config.path.join(LOG_FILE);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let (offsets, index, size) = Self::scan(&mut file)?;
        let file_len = file.metadata()?.len();
        if file_len > size {
            warn!(
                path = %path.display(),
                valid = size,
                dropped = file_len - size,
                "Truncating torn frame at end of fact log"
            );
            file.set_len(size)?;
        }
        info!(path = %path.display(), entries = offsets.len(), "Opened fact log");

        Ok(Self {
            config,
            _lock_file: lock_file,
            file: Mutex::new(file),
            inner: RwLock::new(Inner {
                offsets,
                index,
                size,
                writes_since_sync: 0,
            }),
            write_lock: Mutex::new(()),
            listeners: Listeners::default(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    pub fn len(&self) -> usize {
        self.inner.read().offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Force pending writes to disk.
    pub fn sync(&self) -> Result<()> {
        self.file.lock().sync_all()?;
        self.inner.write().writes_since_sync = 0;
        Ok(())
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_file = File::create(path.join(LOCK_FILE))?;
        lock_file
            .try_lock_exclusive()
            .map_err(|_| StoreError::Locked)?;
        Ok(lock_file)
    }

    /// Read all complete frames. Returns the end of the last good frame.
    fn scan(file: &mut File) -> Result<(Vec<u64>, FactIndex, u64)> {
        file.seek(SeekFrom::Start(0))?;
        let mut reader = BufReader::new(file);
        let mut offsets = Vec::new();
        let mut index = FactIndex::new();
        let mut offset = 0u64;

        loop {
            match read_frame(&mut reader) {
                Ok((entry, len)) => {
                    let expected = Sequence(offsets.len() as u64 + 1);
                    if entry.sequence != expected {
                        return Err(StoreError::InvalidFormat(format!(
                            "frame at offset {} has sequence {}, expected {}",
                            offset, entry.sequence, expected
                        )));
                    }
                    index.add(&entry.fact, entry.sequence);
                    offsets.push(offset);
                    offset += len;
                }
                Err(StoreError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }
        }

        Ok((offsets, index, offset))
    }

    fn read_at(&self, offset: u64) -> Result<LogEntry> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        let (entry, _) = read_frame(&mut *file)?;
        Ok(entry)
    }

    fn offset_of(&self, sequence: Sequence) -> Option<u64> {
        let pos = (sequence.0 as usize).checked_sub(1)?;
        self.inner.read().offsets.get(pos).copied()
    }
}

impl FactLog for FileFactLog {
    fn append(&self, facts: Vec<Fact>) -> Result<Vec<LogEntry>> {
        let _lock = self.write_lock.lock();

        let (first_sequence, offset) = {
            let inner = self.inner.read();
            check_new_ids(&inner.index, &facts)?;
            (Sequence(inner.offsets.len() as u64 + 1), inner.size)
        };

        let timestamp = Timestamp::now();
        let mut buffer = Vec::new();
        let mut frame_offsets = Vec::with_capacity(facts.len());
        let mut entries = Vec::with_capacity(facts.len());
        let mut sequence = first_sequence;
        for fact in facts {
            frame_offsets.push(offset + buffer.len() as u64);
            let entry = LogEntry {
                sequence,
                timestamp,
                fact: Arc::new(fact),
            };
            write_frame(&mut buffer, &entry)?;
            entries.push(entry);
            sequence = sequence.next();
        }

        {
            let mut file = self.file.lock();
            let sync = self.inner.read().writes_since_sync + 1 >= self.config.sync_interval.max(1);
            write_batch(&mut *file, offset, &buffer, sync)?;

            let mut inner = self.inner.write();
            inner.writes_since_sync = if sync { 0 } else { inner.writes_since_sync + 1 };
            for (entry, frame_offset) in entries.iter().zip(frame_offsets) {
                inner.index.add(&entry.fact, entry.sequence);
                inner.offsets.push(frame_offset);
            }
            inner.size = offset + buffer.len() as u64;
        }

        debug!(count = entries.len(), first = %first_sequence, "Appended facts");
        self.listeners.notify(&entries);
        Ok(entries)
    }

    fn last_fact_id(&self, aggregate_id: Uuid, ns: Option<&str>) -> Result<Option<Uuid>> {
        Ok(self.inner.read().index.last_fact_id(aggregate_id, ns))
    }

    fn state_for(&self, aggregate_ids: &[Uuid], ns: Option<&str>) -> Result<AggregateState> {
        let inner = self.inner.read();
        Ok(aggregate_ids
            .iter()
            .map(|id| (*id, inner.index.last_fact_id(*id, ns)))
            .collect())
    }

    fn facts_after(&self, after: Option<Uuid>, filter: &LogFilter) -> Result<EntryIter<'_>> {
        let inner = self.inner.read();
        let start = match after {
            Some(id) => inner
                .index
                .sequence_of(id)
                .ok_or_else(|| StoreError::InvalidArgument(format!("unknown fact id {}", id)))?
                .0,
            None => 0,
        };
        let end = inner.offsets.len() as u64;
        drop(inner);

        let filter = filter.clone();
        Ok(Box::new((start + 1..=end).filter_map(move |seq| {
            let offset = self.offset_of(Sequence(seq))?;
            match self.read_at(offset) {
                Ok(entry) if filter.matches(&entry.fact) => Some(Ok(entry)),
                Ok(_) => None,
                Err(e) => Some(Err(e)),
            }
        })))
    }

    fn fetch_by_id(&self, id: Uuid) -> Result<Option<LogEntry>> {
        let Some(sequence) = self.inner.read().index.sequence_of(id) else {
            return Ok(None);
        };
        match self.offset_of(sequence) {
            Some(offset) => self.read_at(offset).map(Some),
            None => Ok(None),
        }
    }

    fn head(&self) -> Option<Sequence> {
        let len = self.inner.read().offsets.len() as u64;
        (len > 0).then_some(Sequence(len))
    }

    fn register_listener(&self, listener: Arc<dyn PublishListener>) -> ListenerId {
        self.listeners.register(listener)
    }

    fn unregister_listener(&self, id: ListenerId) -> bool {
        self.listeners.unregister(id)
    }
}

impl Drop for FileFactLog {
    fn drop(&mut self) {
        // Best-effort sync on drop
        let _ = self.sync();
    }
}

/// File operations an append needs beyond plain writes.
trait LogFile: Write + Seek {
    fn sync(&mut self) -> io::Result<()>;
    fn truncate(&mut self, len: u64) -> io::Result<()>;
}

impl LogFile for File {
    fn sync(&mut self) -> io::Result<()> {
        self.sync_all()
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }
}

/// Write a batch of frames at `offset`, syncing if asked.
///
/// On any failure the file is cut back to `offset`, so frames of a failed
/// append are never found by a later scan.
fn write_batch(file: &mut impl LogFile, offset: u64, buffer: &[u8], sync: bool) -> io::Result<()> {
    let result = file
        .seek(SeekFrom::Start(offset))
        .and_then(|_| file.write_all(buffer))
        .and_then(|_| if sync { file.sync() } else { Ok(()) });
    if let Err(e) = result {
        if let Err(truncate) = file.truncate(offset) {
            warn!(offset, error = %truncate, "Failed to cut back log after failed append");
        }
        return Err(e);
    }
    Ok(())
}

fn write_frame(buffer: &mut Vec<u8>, entry: &LogEntry) -> Result<()> {
    let body = rmp_serde::to_vec(entry.fact.as_ref())?;
    let body_len = u32::try_from(body.len()).map_err(|_| {
        StoreError::InvalidArgument(format!("fact {} is too large", entry.fact.id))
    })?;

    buffer.extend_from_slice(FRAME_MAGIC);
    buffer.push(FRAME_VERSION);
    buffer.push(0u8);
    buffer.extend_from_slice(&entry.sequence.0.to_le_bytes());
    buffer.extend_from_slice(&entry.timestamp.0.to_le_bytes());
    buffer.extend_from_slice(&body_len.to_le_bytes());
    buffer.extend_from_slice(&body);
    buffer.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
    Ok(())
}

/// Read one frame, returning the entry and the frame length.
fn read_frame(reader: &mut impl Read) -> Result<(LogEntry, u64)> {
    let mut header = [0u8; FRAME_HEADER_SIZE];
    reader.read_exact(&mut header)?;

    if &header[0..4] != FRAME_MAGIC {
        return Err(StoreError::InvalidFormat("Invalid frame magic".into()));
    }
    if header[4] != FRAME_VERSION {
        return Err(StoreError::InvalidFormat(format!(
            "Unsupported frame version: {}",
            header[4]
        )));
    }

    let sequence = Sequence(u64::from_le_bytes(le_bytes(&header[6..14])));
    let timestamp = Timestamp(i64::from_le_bytes(le_bytes(&header[14..22])));
    let body_len = u32::from_le_bytes(le_bytes(&header[22..26])) as usize;

    let mut body = vec![0u8; body_len];
    reader.read_exact(&mut body)?;

    let mut checksum = [0u8; 4];
    reader.read_exact(&mut checksum)?;
    let stored = u32::from_le_bytes(checksum);
    let computed = crc32fast::hash(&body);
    if stored != computed {
        return Err(StoreError::ChecksumMismatch {
            expected: stored,
            got: computed,
        });
    }

    let fact: Fact = rmp_serde::from_slice(&body)?;
    let len = (FRAME_HEADER_SIZE + body_len + 4) as u64;
    Ok((
        LogEntry {
            sequence,
            timestamp,
            fact: Arc::new(fact),
        },
        len,
    ))
}

fn le_bytes<const N: usize>(slice: &[u8]) -> [u8; N] {
    let mut bytes = [0u8; N];
    bytes.copy_from_slice(slice);
    bytes
}
