//! Segment retention: which segments subscribers still need, and reclaiming
//! the ones nobody does.

use std::fs;

use log::{info, warn};

use crate::lock::ExclusiveLock;
use crate::store::Log;
use crate::{Error, Result};

/// Snapshot of every subscriber's checkpoint segment.
///
/// A segment is pending for a subscriber while the subscriber's checkpoint
/// segment is at or below it. Checkpoint segments are kept sorted so each
/// query is a binary search rather than a pass over all subscribers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingReaders {
    checkpoint_segments: Vec<u32>,
}

impl PendingReaders {
    pub fn from_checkpoints(segments: impl IntoIterator<Item = u32>) -> Self {
        let mut checkpoint_segments: Vec<u32> = segments.into_iter().collect();
        checkpoint_segments.sort_unstable();
        Self {
            checkpoint_segments,
        }
    }

    /// Number of subscribers that have not consumed past `segment`.
    pub fn pending(&self, segment: u32) -> usize {
        self.checkpoint_segments
            .partition_point(|&checkpoint| checkpoint <= segment)
    }

    /// Lowest checkpoint segment, i.e. the oldest segment anyone still needs.
    pub fn min_segment(&self) -> Option<u32> {
        self.checkpoint_segments.first().copied()
    }
}

impl Log {
    pub fn pending_readers(&self) -> Result<PendingReaders> {
        let subscribers = self.subscribers()?;
        Ok(PendingReaders::from_checkpoints(
            subscribers.into_iter().map(|(_, id)| id.segment),
        ))
    }

    /// A segment can be reclaimed once it is closed and no subscriber needs it.
    pub fn reclaim_eligible(&self, segment: u32) -> Result<bool> {
        let closed = self.is_closed(segment)?;
        Ok(closed && self.pending_readers()?.pending(segment) == 0)
    }

    /// Delete a reclaimable segment's datafile and index.
    ///
    /// The index goes first so an interrupted reclaim leaves a datafile
    /// without an index, which is rebuilt on access rather than read as empty.
    pub fn reclaim(&self, segment: u32, lock: &ExclusiveLock) -> Result<()> {
        self.check_lock(lock)?;
        let closed = self.is_closed(segment)?;
        let pending_readers = self.pending_readers()?.pending(segment);
        if !closed || pending_readers > 0 {
            return Err(Error::SegmentNotReclaimable {
                segment,
                pending_readers,
                closed,
            });
        }
        let (data_path, index_path) = self.segment_paths(segment);
        let size = self.stat(segment)?;
        match fs::remove_file(&index_path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        fs::remove_file(&data_path).map_err(|source| Error::SegmentUnreadable { segment, source })?;
        info!(
            "reclaimed segment {segment:08x} of {} ({size} bytes)",
            self.root().display()
        );
        Ok(())
    }

    /// Reclaim every eligible segment, returning the ones removed.
    ///
    /// A segment that fails to delete is logged and skipped.
    pub fn reclaim_all(&self, lock: &ExclusiveLock) -> Result<Vec<u32>> {
        self.check_lock(lock)?;
        let current = self.meta()?.current_segment;
        let pending = self.pending_readers()?;
        let mut reclaimed = Vec::new();
        for segment in self.segments()? {
            if segment >= current || pending.pending(segment) > 0 {
                continue;
            }
            match self.reclaim(segment, lock) {
                Ok(()) => reclaimed.push(segment),
                Err(err) => warn!("segment {segment:08x}: {err}"),
            }
        }
        Ok(reclaimed)
    }
}
