//! Read-only reports over a log directory, as shown by `jlogctl`.
//!
//! Directory-wide scans report per segment: a segment that cannot be
//! inspected yields an error entry and the scan moves on.

use std::fmt;

use crate::index::{load_index, IndexState};
use crate::log_id::LogId;
use crate::reader::Interval;
use crate::retention::PendingReaders;
use crate::segment::segment_filename;
use crate::store::Log;
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct SegmentReport {
    pub segment: u32,
    pub size_bytes: u64,
    pub pending_readers: usize,
}

impl SegmentReport {
    pub fn name(&self) -> String {
        segment_filename(self.segment)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(tag = "state", rename_all = "snake_case"))]
pub enum IndexReport {
    Missing,
    Details { messages: u32, closed: bool },
    Error { reason: String },
}

impl fmt::Display for IndexReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexReport::Missing => f.write_str("none"),
            IndexReport::Details { messages, closed } => write!(
                f,
                "{messages} messages ({messages:08x}), {}",
                if *closed { "closed" } else { "open" }
            ),
            IndexReport::Error { reason } => write!(f, "error ({reason})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct SubscriberReport {
    pub name: String,
    pub checkpoint: LogId,
}

/// A subscriber's perspective: where it is, where the log is, what it can read next.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct IntervalReport {
    pub subscriber: String,
    pub checkpoint: LogId,
    pub last_written: Option<LogId>,
    pub interval: Option<Interval>,
}

/// Size and pending-reader count of every segment, oldest first.
pub fn scan_segments(log: &Log) -> Result<Vec<(u32, Result<SegmentReport>)>> {
    let pending = log.pending_readers()?;
    Ok(log
        .segments()?
        .into_iter()
        .map(|segment| (segment, segment_report(log, &pending, segment)))
        .collect())
}

fn segment_report(log: &Log, pending: &PendingReaders, segment: u32) -> Result<SegmentReport> {
    Ok(SegmentReport {
        segment,
        size_bytes: log.stat(segment)?,
        pending_readers: pending.pending(segment),
    })
}

/// What the on-disk index of `segment` says, without rebuilding it.
pub fn index_report(log: &Log, segment: u32) -> IndexReport {
    let state = log
        .stat(segment)
        .and_then(|len| load_index(log.root(), segment, len));
    match state {
        Ok(IndexState::Missing) => IndexReport::Missing,
        Ok(IndexState::Valid(header)) => IndexReport::Details {
            messages: header.message_count,
            closed: header.closed,
        },
        Ok(IndexState::Stale(reason)) => IndexReport::Error {
            reason: reason.to_string(),
        },
        Err(err) => IndexReport::Error {
            reason: err.to_string(),
        },
    }
}

pub fn subscriber_reports(log: &Log) -> Result<Vec<SubscriberReport>> {
    Ok(log
        .subscribers()?
        .into_iter()
        .map(|(name, checkpoint)| SubscriberReport { name, checkpoint })
        .collect())
}

/// Fails with [`Error::CheckpointBehindRetention`] if the subscriber's unread
/// data has been reclaimed.
pub fn perspective(log: &Log, subscriber: &str) -> Result<IntervalReport> {
    let checkpoint = log.checkpoint(subscriber)?;
    let last_written = match log.last_log_id() {
        Ok(id) => Some(id),
        Err(Error::EmptyLog) => None,
        Err(err) => return Err(err),
    };
    let interval = log.read_interval(subscriber)?;
    Ok(IntervalReport {
        subscriber: subscriber.to_string(),
        checkpoint,
        last_written,
        interval,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::StartPolicy;
    use crate::meta::LogConfig;
    use tempfile::tempdir;

    #[test]
    fn segment_and_index_reports() -> Result<()> {
        let dir = tempdir()?;
        let log = Log::create(
            dir.path(),
            LogConfig {
                max_messages: Some(2),
                ..LogConfig::default()
            },
        )?;
        log.add_subscriber("sub", StartPolicy::Beginning)?;
        {
            let mut writer = log.writer()?;
            for _ in 0..3 {
                writer.append(b"0123456789")?;
            }
        }
        let scan = scan_segments(&log)?;
        assert_eq!(scan.len(), 2);
        let (segment, report) = &scan[0];
        assert_eq!(*segment, 0);
        let Ok(report) = report else {
            panic!("segment 0 should be readable");
        };
        assert_eq!(report.size_bytes, 2 * 34);
        assert_eq!(report.pending_readers, 1);
        assert_eq!(report.name(), "00000000");

        assert_eq!(
            index_report(&log, 0),
            IndexReport::Details {
                messages: 2,
                closed: true
            }
        );
        assert_eq!(index_report(&log, 1).to_string(), "1 messages (00000001), open");
        std::fs::remove_file(log.segment_paths(0).1)?;
        assert_eq!(index_report(&log, 0), IndexReport::Missing);
        assert!(matches!(index_report(&log, 9), IndexReport::Error { .. }));
        Ok(())
    }

    #[test]
    fn perspective_of_fresh_subscriber() -> Result<()> {
        let dir = tempdir()?;
        let log = Log::create(dir.path(), LogConfig::default())?;
        log.add_subscriber("sub1", StartPolicy::Beginning)?;
        let report = perspective(&log, "sub1")?;
        assert_eq!(report.last_written, None);
        assert_eq!(report.interval, None);

        let mut writer = log.writer()?;
        for _ in 0..5 {
            writer.append(b"x")?;
        }
        let report = perspective(&log, "sub1")?;
        assert_eq!(report.checkpoint, LogId::new(0, 0));
        assert_eq!(report.last_written, Some(LogId::new(0, 5)));
        assert_eq!(
            report.interval,
            Some(Interval {
                from: LogId::new(0, 0),
                to: LogId::new(0, 5),
            })
        );
        assert_eq!(
            subscriber_reports(&log)?,
            vec![SubscriberReport {
                name: "sub1".to_string(),
                checkpoint: LogId::new(0, 0),
            }]
        );
        Ok(())
    }
}
