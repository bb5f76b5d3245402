//! The [`Log`] handle: one log directory and everything derived from it.
//!
//! ```text
//! {log_dir}/
//!   metastore            current segment + configuration
//!   writer.lock          advisory lock held by the writer / administrators
//!   checkpoints/*.cp     one checkpoint per subscriber
//!   00000000             segment 0 datafile (closed)
//!   00000000.idx         segment 0 index
//!   00000001             segment 1 datafile (open)
//!   00000001.idx
//! ```
//!
//! A `Log` holds no cached view of the directory: every query re-reads the
//! metastore, so several handles (in this or other processes) observe the
//! same state without coordinating.

use std::path::{Path, PathBuf};

use log::warn;

use crate::checkpoint::{CheckpointStore, StartPolicy};
use crate::index::{load_index, rebuild_index, scan_segment, IndexHeader, IndexState, IndexWriter};
use crate::lock::ExclusiveLock;
use crate::log_id::LogId;
use crate::meta::{load_meta, meta_path, store_meta, LogConfig, LogMeta, Safety};
use crate::segment::{
    discover_segments, segment_exists, segment_path, segment_paths, stat_segment,
};
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct Log {
    root: PathBuf,
    checkpoints: CheckpointStore,
}

impl Log {
    /// Initialise a new log directory with an empty segment 0.
    pub fn create(root: impl AsRef<Path>, config: LogConfig) -> Result<Self> {
        config.validate()?;
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        if meta_path(&root).exists() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("log already exists: {}", root.display()),
            )));
        }
        let meta = LogMeta::new(config);
        std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(segment_path(&root, meta.current_segment))?;
        IndexWriter::create(&root, meta.current_segment)?;
        // The metastore goes last: its presence is what makes the directory a log.
        store_meta(&root, &meta)?;
        Ok(Self::at(root, config.safety))
    }

    /// Open an existing log. Fails with [`Error::NotALog`] if there is no metastore.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let meta = load_meta(&root)?;
        Ok(Self::at(root, meta.config.safety))
    }

    pub fn open_or_create(root: impl AsRef<Path>, config: LogConfig) -> Result<Self> {
        match Self::open(root.as_ref()) {
            Err(Error::NotALog(_)) => Self::create(root, config),
            other => other,
        }
    }

    fn at(root: PathBuf, safety: Safety) -> Self {
        let checkpoints = CheckpointStore::new(&root, safety != Safety::Unsafe);
        Self { root, checkpoints }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn meta(&self) -> Result<LogMeta> {
        load_meta(&self.root)
    }

    pub fn config(&self) -> Result<LogConfig> {
        Ok(self.meta()?.config)
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    /// Take the log for exclusive administrative use.
    pub fn lock_exclusive(&self) -> Result<ExclusiveLock> {
        ExclusiveLock::acquire(&self.root)
    }

    pub(crate) fn check_lock(&self, lock: &ExclusiveLock) -> Result<()> {
        if lock.covers(&self.root) {
            Ok(())
        } else {
            Err(Error::Unsupported("exclusive lock belongs to another log"))
        }
    }

    // ------------------------------------------------------------------
    // Segments
    // ------------------------------------------------------------------

    /// Segment numbers present in the directory, ascending.
    pub fn segments(&self) -> Result<Vec<u32>> {
        discover_segments(&self.root)
    }

    pub fn segment_paths(&self, segment: u32) -> (PathBuf, PathBuf) {
        segment_paths(&self.root, segment)
    }

    /// Datafile size in bytes.
    pub fn stat(&self, segment: u32) -> Result<u64> {
        stat_segment(&self.root, segment)
    }

    /// A segment is closed once the writer has moved past it.
    pub fn is_closed(&self, segment: u32) -> Result<bool> {
        Ok(segment < self.meta()?.current_segment)
    }

    /// State of a segment's index checked against its datafile.
    pub fn index_state(&self, segment: u32) -> Result<IndexState> {
        let len = self.stat(segment)?;
        load_index(&self.root, segment, len)
    }

    /// Rebuild a segment's index from its datafile.
    pub fn rebuild_index(&self, segment: u32, lock: &ExclusiveLock) -> Result<IndexHeader> {
        self.check_lock(lock)?;
        let closed = self.is_closed(segment)?;
        rebuild_index(&self.root, segment, closed)
    }

    /// Number of messages in a segment.
    ///
    /// Uses the index when it is valid. A closed segment with a missing or
    /// stale index gets its index rebuilt on disk; the open segment belongs to
    /// the writer, so it is counted from the datafile without touching the index.
    pub fn segment_len(&self, segment: u32) -> Result<u32> {
        Ok(self.segment_index(segment)?.message_count)
    }

    pub(crate) fn segment_index(&self, segment: u32) -> Result<IndexHeader> {
        match self.index_state(segment)? {
            IndexState::Valid(header) => Ok(header),
            state => {
                if self.is_closed(segment)? {
                    warn!("segment {segment:08x} index needs rebuild ({state:?}); rebuilding");
                    rebuild_index(&self.root, segment, true)
                } else {
                    let scan = scan_segment(&self.root, segment)?;
                    Ok(IndexHeader {
                        segment,
                        message_count: scan.offsets.len() as u32,
                        closed: false,
                        data_len: scan.valid_len,
                    })
                }
            }
        }
    }

    /// Total bytes across all datafiles.
    pub fn raw_size(&self) -> Result<u64> {
        let mut total = 0u64;
        for segment in self.segments()? {
            match self.stat(segment) {
                Ok(len) => total += len,
                // Reclaimed between listing and stat.
                Err(Error::SegmentUnreadable { .. }) => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(total)
    }

    // ------------------------------------------------------------------
    // Positions
    // ------------------------------------------------------------------

    /// Identifier of the most recently written message.
    pub fn last_log_id(&self) -> Result<LogId> {
        let meta = self.meta()?;
        last_written(self, meta.current_segment)
    }

    /// Identifier of the oldest message still retained.
    pub fn first_log_id(&self) -> Result<LogId> {
        for segment in self.segments()? {
            if self.segment_len(segment)? > 0 {
                return Ok(LogId::new(segment, 1));
            }
        }
        Err(Error::EmptyLog)
    }

    /// Beginning-of-log sentinel: before the first message of the oldest segment.
    pub fn beginning(&self) -> Result<LogId> {
        Ok(self
            .segments()?
            .first()
            .map_or(LogId::default(), |&segment| LogId::segment_start(segment)))
    }

    // ------------------------------------------------------------------
    // Subscribers
    // ------------------------------------------------------------------

    pub fn add_subscriber(&self, name: &str, policy: StartPolicy) -> Result<LogId> {
        let start = match policy {
            StartPolicy::Beginning => self.beginning()?,
            StartPolicy::Tail => match self.last_log_id() {
                Ok(id) => id,
                Err(Error::EmptyLog) => LogId::segment_start(self.meta()?.current_segment),
                Err(err) => return Err(err),
            },
        };
        self.checkpoints.add(name, start)?;
        Ok(start)
    }

    pub fn remove_subscriber(&self, name: &str) -> Result<()> {
        self.checkpoints.remove(name)
    }

    pub fn subscribers(&self) -> Result<Vec<(String, LogId)>> {
        self.checkpoints.list()
    }

    pub fn checkpoint(&self, name: &str) -> Result<LogId> {
        self.checkpoints.get(name)
    }

    /// Acknowledge that `name` has consumed everything up to and including `id`.
    pub fn advance_checkpoint(&self, name: &str, id: LogId) -> Result<()> {
        let current = self.checkpoints.get(name)?;
        if id > current {
            let last = match self.last_log_id() {
                Ok(last) => last,
                Err(Error::EmptyLog) => LogId::default(),
                Err(err) => return Err(err),
            };
            if id > last {
                return Err(Error::CheckpointPastTail { requested: id, last });
            }
        }
        self.checkpoints.advance(name, id)
    }
}

/// Walk back from `current` to the newest segment holding a message.
///
/// A reclaimed segment below `current` means the history was dropped, not
/// that nothing was written; the last identifier is then the start of the
/// segment after it.
fn last_written(log: &Log, current: u32) -> Result<LogId> {
    let mut segment = current;
    loop {
        if !segment_exists(&log.root, segment) {
            if segment < current {
                return Ok(LogId::segment_start(segment + 1));
            }
            return Err(Error::EmptyLog);
        }
        let len = log.segment_len(segment)?;
        if len > 0 {
            return Ok(LogId::new(segment, len));
        }
        if segment == 0 {
            return Err(Error::EmptyLog);
        }
        segment -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_then_open() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("log");
        assert!(matches!(Log::open(&path), Err(Error::NotALog(_))));
        let log = Log::create(&path, LogConfig::default())?;
        assert_eq!(log.segments()?, vec![0]);
        assert_eq!(log.meta()?.current_segment, 0);
        assert!(matches!(Log::create(&path, LogConfig::default()), Err(Error::Io(_))));
        let reopened = Log::open_or_create(&path, LogConfig::default())?;
        assert_eq!(reopened.root(), log.root());
        Ok(())
    }

    #[test]
    fn empty_log_has_no_ids() -> Result<()> {
        let dir = tempdir()?;
        let log = Log::create(dir.path(), LogConfig::default())?;
        assert!(matches!(log.last_log_id(), Err(Error::EmptyLog)));
        assert!(matches!(log.first_log_id(), Err(Error::EmptyLog)));
        assert_eq!(log.beginning()?, LogId::new(0, 0));
        assert_eq!(log.raw_size()?, 0);
        Ok(())
    }

    #[test]
    fn tail_subscriber_on_empty_log_starts_at_open_segment() -> Result<()> {
        let dir = tempdir()?;
        let log = Log::create(dir.path(), LogConfig::default())?;
        assert_eq!(log.add_subscriber("tail", StartPolicy::Tail)?, LogId::new(0, 0));
        assert!(matches!(
            log.advance_checkpoint("tail", LogId::new(0, 1)),
            Err(Error::CheckpointPastTail { .. })
        ));
        Ok(())
    }
}
