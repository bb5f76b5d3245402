//! Consuming a log: read intervals, message retrieval and subscriber handles.
//!
//! Reading never moves a checkpoint. A consumer reads the interval
//! `(checkpoint, to]`, processes it, then acknowledges with
//! [`LogReader::checkpoint`].

use std::collections::BTreeMap;
use std::fmt;

use crate::header::{RecordHeader, HEADER_SIZE};
use crate::index::{map_segment, read_offset, read_offsets, scan_segment, IndexHeader, IndexState};
use crate::log_id::LogId;
use crate::mmap::MmapFile;
use crate::segment::segment_exists;
use crate::store::Log;
use crate::{Error, Result};

/// Half-open range of identifiers `(from, to]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Interval {
    /// Last consumed position.
    pub from: LogId,
    /// Last readable message.
    pub to: LogId,
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.from, self.to)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: LogId,
    pub timestamp_ns: u64,
    pub payload: Vec<u8>,
}

/// Where a segment's record offsets come from.
enum SegmentOffsets {
    /// The on-disk index is valid.
    Indexed(IndexHeader),
    /// The open segment's index lags its datafile; offsets come from a scan.
    Scanned(Vec<u64>),
}

impl Log {
    /// Next interval `subscriber` can read.
    ///
    /// Returns `Ok(None)` when the subscriber has consumed everything written.
    /// Fails with [`Error::CheckpointBehindRetention`] if the data right after
    /// the checkpoint has been reclaimed.
    pub fn read_interval(&self, subscriber: &str) -> Result<Option<Interval>> {
        let from = self.checkpoint(subscriber)?;
        let last = match self.last_log_id() {
            Ok(last) => last,
            Err(Error::EmptyLog) => return Ok(None),
            Err(err) => return Err(err),
        };
        if from >= last {
            return Ok(None);
        }
        let behind = || Error::CheckpointBehindRetention {
            subscriber: subscriber.to_string(),
            checkpoint: from,
        };
        if !segment_exists(self.root(), from.segment) {
            return Err(behind());
        }

        let mut to = from;
        let mut segment = from.segment;
        loop {
            if segment == last.segment {
                to = last;
                break;
            }
            if !segment_exists(self.root(), segment) {
                break;
            }
            let len = self.segment_len(segment)?;
            if len > 0 {
                to = LogId::new(segment, len);
            }
            segment += 1;
        }
        if to <= from {
            return Err(behind());
        }
        Ok(Some(Interval { from, to }))
    }

    /// Read one message by identifier.
    pub fn read_message(&self, id: LogId) -> Result<Message> {
        if id.marker == 0 {
            return Err(Error::NoSuchMessage(id));
        }
        let offset = match self.resolve_offsets(id.segment)? {
            SegmentOffsets::Indexed(header) => {
                if id.marker > header.message_count {
                    return Err(Error::NoSuchMessage(id));
                }
                read_offset(self.root(), &header, id.marker)?
            }
            SegmentOffsets::Scanned(offsets) => *offsets
                .get(id.marker as usize - 1)
                .ok_or(Error::NoSuchMessage(id))?,
        };
        // Map after resolving so the mapping covers every indexed record.
        let data = map_segment(self.root(), id.segment)?;
        decode_message(id, data.as_slice(), offset)
    }

    /// Read every message in `(from, to]`, crossing segment boundaries.
    pub fn read_interval_messages(&self, interval: &Interval) -> Result<Vec<Message>> {
        let mut segments: BTreeMap<u32, (Vec<u64>, MmapFile)> = BTreeMap::new();
        for segment in interval.from.segment..=interval.to.segment {
            if !segment_exists(self.root(), segment) {
                continue;
            }
            let offsets = self.segment_offsets(segment)?;
            let data = map_segment(self.root(), segment)?;
            segments.insert(segment, (offsets, data));
        }

        let segment_len = |segment: u32| {
            segments
                .get(&segment)
                .map(|(offsets, _)| offsets.len() as u32)
        };
        let mut messages = Vec::new();
        let mut cursor = interval.from;
        while let Some(id) = cursor.advance(interval.to, segment_len) {
            let (offsets, data) = segments.get(&id.segment).ok_or_else(|| {
                Error::SegmentUnreadable {
                    segment: id.segment,
                    source: std::io::ErrorKind::NotFound.into(),
                }
            })?;
            let offset = *offsets
                .get(id.marker as usize - 1)
                .ok_or(Error::NoSuchMessage(id))?;
            messages.push(decode_message(id, data.as_slice(), offset)?);
            cursor = id;
        }
        Ok(messages)
    }

    /// Bind a handle to an existing subscriber.
    pub fn reader(&self, subscriber: &str) -> Result<LogReader> {
        self.checkpoint(subscriber)?;
        Ok(LogReader {
            log: self.clone(),
            subscriber: subscriber.to_string(),
        })
    }

    fn resolve_offsets(&self, segment: u32) -> Result<SegmentOffsets> {
        match self.index_state(segment)? {
            IndexState::Valid(header) => Ok(SegmentOffsets::Indexed(header)),
            _ if self.is_closed(segment)? => {
                Ok(SegmentOffsets::Indexed(self.segment_index(segment)?))
            }
            _ => Ok(SegmentOffsets::Scanned(
                scan_segment(self.root(), segment)?.offsets,
            )),
        }
    }

    fn segment_offsets(&self, segment: u32) -> Result<Vec<u64>> {
        match self.resolve_offsets(segment)? {
            SegmentOffsets::Indexed(header) => read_offsets(self.root(), &header),
            SegmentOffsets::Scanned(offsets) => Ok(offsets),
        }
    }
}

fn decode_message(id: LogId, data: &[u8], offset: u64) -> Result<Message> {
    let start = offset as usize;
    let header_bytes: &[u8; HEADER_SIZE] = data
        .get(start..start + HEADER_SIZE)
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or(Error::Corrupt("record header past end of datafile"))?;
    let header = RecordHeader::from_bytes(header_bytes)?;
    let end = start + header.record_len() as usize;
    let payload = data
        .get(start + HEADER_SIZE..end)
        .ok_or(Error::Corrupt("record payload past end of datafile"))?;
    header.validate_crc(payload)?;
    Ok(Message {
        id,
        timestamp_ns: header.timestamp_ns,
        payload: payload.to_vec(),
    })
}

/// A subscriber's view of a log.
#[derive(Debug, Clone)]
pub struct LogReader {
    log: Log,
    subscriber: String,
}

impl LogReader {
    pub fn subscriber(&self) -> &str {
        &self.subscriber
    }

    pub fn log(&self) -> &Log {
        &self.log
    }

    /// Current checkpoint.
    pub fn position(&self) -> Result<LogId> {
        self.log.checkpoint(&self.subscriber)
    }

    pub fn interval(&self) -> Result<Option<Interval>> {
        self.log.read_interval(&self.subscriber)
    }

    pub fn read(&self, id: LogId) -> Result<Message> {
        self.log.read_message(id)
    }

    /// Messages in the next readable interval, without acknowledging them.
    pub fn poll(&self) -> Result<Option<(Interval, Vec<Message>)>> {
        match self.interval()? {
            Some(interval) => {
                let messages = self.log.read_interval_messages(&interval)?;
                Ok(Some((interval, messages)))
            }
            None => Ok(None),
        }
    }

    /// Acknowledge everything up to and including `id`.
    pub fn checkpoint(&self, id: LogId) -> Result<()> {
        self.log.advance_checkpoint(&self.subscriber, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::StartPolicy;
    use crate::meta::LogConfig;
    use tempfile::tempdir;

    fn small_segments() -> LogConfig {
        LogConfig {
            max_messages: Some(2),
            ..LogConfig::default()
        }
    }

    #[test]
    fn interval_covers_unread_messages() -> Result<()> {
        let dir = tempdir()?;
        let log = Log::create(dir.path(), LogConfig::default())?;
        log.add_subscriber("sub1", StartPolicy::Beginning)?;
        let mut writer = log.writer()?;
        for i in 0..5 {
            writer.append(format!("m{i}").as_bytes())?;
        }
        let interval = log.read_interval("sub1")?.expect("interval");
        assert_eq!(interval.from, LogId::new(0, 0));
        assert_eq!(interval.to, LogId::new(0, 5));
        assert_eq!(interval.to_string(), "[00000000:00000000, 00000000:00000005]");

        log.advance_checkpoint("sub1", interval.to)?;
        assert_eq!(log.read_interval("sub1")?, None);
        Ok(())
    }

    #[test]
    fn empty_log_has_nothing_to_read() -> Result<()> {
        let dir = tempdir()?;
        let log = Log::create(dir.path(), LogConfig::default())?;
        log.add_subscriber("idle", StartPolicy::Beginning)?;
        assert_eq!(log.read_interval("idle")?, None);
        assert!(matches!(log.read_interval("nobody"), Err(Error::UnknownSubscriber(_))));
        Ok(())
    }

    #[test]
    fn interval_spans_closed_segments() -> Result<()> {
        let dir = tempdir()?;
        let log = Log::create(dir.path(), small_segments())?;
        log.add_subscriber("sub", StartPolicy::Beginning)?;
        let mut writer = log.writer()?;
        for i in 0..5u8 {
            writer.append(&[i])?;
        }
        let interval = log.read_interval("sub")?.expect("interval");
        assert_eq!(interval.to, LogId::new(2, 1));

        let messages = log.read_interval_messages(&interval)?;
        let ids: Vec<_> = messages.iter().map(|m| m.id).collect();
        assert_eq!(
            ids,
            vec![
                LogId::new(0, 1),
                LogId::new(0, 2),
                LogId::new(1, 1),
                LogId::new(1, 2),
                LogId::new(2, 1),
            ]
        );
        let payloads: Vec<_> = messages.iter().map(|m| m.payload[0]).collect();
        assert_eq!(payloads, vec![0, 1, 2, 3, 4]);
        Ok(())
    }

    #[test]
    fn read_message_checks_bounds() -> Result<()> {
        let dir = tempdir()?;
        let log = Log::create(dir.path(), LogConfig::default())?;
        let mut writer = log.writer()?;
        let id = writer.append_at(b"payload", 99)?;
        let message = log.read_message(id)?;
        assert_eq!(message.payload, b"payload");
        assert_eq!(message.timestamp_ns, 99);
        assert!(matches!(log.read_message(LogId::new(0, 0)), Err(Error::NoSuchMessage(_))));
        assert!(matches!(log.read_message(LogId::new(0, 2)), Err(Error::NoSuchMessage(_))));
        assert!(matches!(
            log.read_message(LogId::new(7, 1)),
            Err(Error::SegmentUnreadable { segment: 7, .. })
        ));
        Ok(())
    }

    #[test]
    fn missing_closed_index_is_rebuilt_for_reads() -> Result<()> {
        let dir = tempdir()?;
        let log = Log::create(dir.path(), small_segments())?;
        let mut writer = log.writer()?;
        for i in 0..3u8 {
            writer.append(&[i])?;
        }
        let (_, index) = log.segment_paths(0);
        std::fs::remove_file(&index)?;
        assert_eq!(log.read_message(LogId::new(0, 2))?.payload, vec![1]);
        assert!(index.exists());
        Ok(())
    }

    #[test]
    fn reader_polls_then_acknowledges() -> Result<()> {
        let dir = tempdir()?;
        let log = Log::create(dir.path(), LogConfig::default())?;
        let mut writer = log.writer()?;
        writer.append(b"before")?;
        log.add_subscriber("tail", StartPolicy::Tail)?;
        writer.append(b"after")?;

        let reader = log.reader("tail")?;
        let (interval, messages) = reader.poll()?.expect("new data");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].payload, b"after");
        // Polling does not consume.
        assert_eq!(reader.position()?, interval.from);
        reader.checkpoint(interval.to)?;
        assert_eq!(reader.poll()?, None);
        assert!(matches!(log.reader("ghost"), Err(Error::UnknownSubscriber(_))));
        Ok(())
    }
}
