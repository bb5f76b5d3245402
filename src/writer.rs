use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::clock::{Clock, QuantaClock};
use crate::header::{RecordHeader, HEADER_SIZE};
use crate::index::{load_index, rebuild_index, scan_segment, IndexState, IndexWriter};
use crate::lock::{FileLock, LockRole};
use crate::log_id::LogId;
use crate::meta::{load_meta, store_meta, LogMeta, Safety};
use crate::segment::segment_path;
use crate::store::Log;
use crate::{Error, Result};

/// Single appender for a log.
///
/// Holds the log's lock for its whole lifetime; a second writer (or an
/// administrator holding [`ExclusiveLock`](crate::ExclusiveLock)) fails with
/// [`Error::LockHeld`].
///
/// Every append writes the record to the open datafile first and the index
/// entry second, and the identifier is only returned once both are written,
/// so readers (which trust the index) never see an identifier whose bytes are
/// missing.
pub struct LogWriter {
    root: PathBuf,
    meta: LogMeta,
    data: File,
    data_len: u64,
    index: IndexWriter,
    last_id: Option<LogId>,
    clock: Box<dyn Clock>,
    _lock: FileLock,
}

impl Log {
    pub fn writer(&self) -> Result<LogWriter> {
        LogWriter::open(self.root())
    }
}

impl LogWriter {
    /// Open the writer on an existing log, recovering the open segment.
    ///
    /// A torn record at the end of the open datafile (crash mid-append) is cut
    /// off and the index rebuilt to match. A segment that was closed but never
    /// followed by its successor (crash mid-rollover) has the rollover finished.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        // Refuse to drop a lock file into a directory that is not a log.
        load_meta(&root)?;
        let lock = FileLock::acquire(&root, LockRole::Writer)?;
        let meta = load_meta(&root)?;

        let segment = meta.current_segment;
        let data_path = segment_path(&root, segment);
        let data = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&data_path)?;

        let scan = scan_segment(&root, segment)?;
        let mut data_len = data.metadata()?.len();
        if let Some((offset, reason)) = scan.error {
            warn!(
                "segment {segment:08x}: {reason} at offset {offset}; truncating {data_len} -> {}",
                scan.valid_len
            );
            data.set_len(scan.valid_len)?;
            data.sync_all()?;
            data_len = scan.valid_len;
        }

        let header = match load_index(&root, segment, data_len)? {
            IndexState::Valid(header)
                if header.message_count as usize == scan.offsets.len()
                    && header.data_len == data_len =>
            {
                header
            }
            state => {
                if !matches!(state, IndexState::Missing) || data_len > 0 {
                    warn!("segment {segment:08x}: index out of date ({state:?}); rebuilding");
                }
                rebuild_index(&root, segment, false)?
            }
        };
        let closed = header.closed;
        let index = IndexWriter::open(&root, header)?;

        let last_id = match header.message_count {
            0 => match Log::open(&root)?.last_log_id() {
                Ok(id) => Some(id),
                Err(Error::EmptyLog) => None,
                Err(err) => return Err(err),
            },
            n => Some(LogId::new(segment, n)),
        };

        let mut writer = Self {
            root,
            meta,
            data,
            data_len,
            index,
            last_id,
            clock: Box::new(QuantaClock::new()),
            _lock: lock,
        };
        if closed {
            warn!("segment {segment:08x} closed without successor; finishing rollover");
            writer.open_next_segment()?;
        }
        Ok(writer)
    }

    /// Replace the timestamp source used by [`append`](Self::append).
    pub fn with_clock(mut self, clock: impl Clock) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Segment currently receiving appends.
    pub fn segment(&self) -> u32 {
        self.meta.current_segment
    }

    pub fn meta(&self) -> &LogMeta {
        &self.meta
    }

    /// Identifier of the last message appended to this log.
    pub fn last_log_id(&self) -> Result<LogId> {
        self.last_id.ok_or(Error::EmptyLog)
    }

    pub fn append(&mut self, payload: &[u8]) -> Result<LogId> {
        let timestamp_ns = self.clock.now();
        self.append_at(payload, timestamp_ns)
    }

    pub fn append_at(&mut self, payload: &[u8], timestamp_ns: u64) -> Result<LogId> {
        let header = RecordHeader::for_payload(payload, timestamp_ns)?;
        if self.needs_roll() {
            self.roll()?;
        }

        let offset = self.data_len;
        let mut record = Vec::with_capacity(HEADER_SIZE + payload.len());
        record.extend_from_slice(&header.to_bytes());
        record.extend_from_slice(payload);
        self.data.write_all_at(&record, offset)?;
        let safe = self.meta.config.safety == Safety::Safe;
        if safe {
            self.data.sync_data()?;
        }
        let data_len = offset + header.record_len();
        self.data_len = data_len;

        let marker = self.index.append(offset, data_len)?;
        if safe {
            self.index.sync()?;
        }
        let id = LogId::new(self.meta.current_segment, marker);
        self.last_id = Some(id);
        Ok(id)
    }

    fn needs_roll(&self) -> bool {
        let count = self.index.header().message_count;
        if count == 0 {
            return false;
        }
        let config = &self.meta.config;
        self.data_len >= config.unit_limit
            || config.max_messages.is_some_and(|max| count >= max)
    }

    /// Close the open segment and start the next one.
    pub fn roll(&mut self) -> Result<()> {
        if self.meta.config.safety != Safety::Unsafe {
            self.data.sync_all()?;
        }
        self.index.close()?;
        self.open_next_segment()
    }

    fn open_next_segment(&mut self) -> Result<()> {
        let closed = self.meta.current_segment;
        let next = closed
            .checked_add(1)
            .ok_or(Error::Unsupported("segment number space exhausted"))?;
        let data = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(segment_path(&self.root, next))?;
        let index = IndexWriter::create(&self.root, next)?;

        // Publishing the new current segment is the commit point of the rollover.
        let mut meta = self.meta;
        meta.current_segment = next;
        store_meta(&self.root, &meta)?;

        self.meta = meta;
        self.data = data;
        self.data_len = 0;
        self.index = index;
        debug!(
            "rolled {}: segment {closed:08x} closed, {next:08x} open",
            self.root.display()
        );
        Ok(())
    }

    /// Force appended data and index entries to stable storage.
    pub fn flush(&mut self) -> Result<()> {
        self.data.sync_data()?;
        self.index.sync()
    }

    /// Change the rollover size threshold for this and future writers.
    pub fn alter_unit_limit(&mut self, unit_limit: u64) -> Result<()> {
        let mut meta = self.meta;
        meta.config.unit_limit = unit_limit;
        self.store_config(meta)
    }

    pub fn alter_max_messages(&mut self, max_messages: Option<u32>) -> Result<()> {
        let mut meta = self.meta;
        meta.config.max_messages = max_messages;
        self.store_config(meta)
    }

    pub fn alter_safety(&mut self, safety: Safety) -> Result<()> {
        let mut meta = self.meta;
        meta.config.safety = safety;
        self.store_config(meta)
    }

    fn store_config(&mut self, meta: LogMeta) -> Result<()> {
        meta.config.validate()?;
        store_meta(&self.root, &meta)?;
        self.meta = meta;
        Ok(())
    }
}
