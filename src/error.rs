use std::path::PathBuf;

use thiserror::Error;

use crate::log_id::LogId;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed log identifier: {0:?}")]
    MalformedIdentifier(String),
    #[error("segment {segment:08x} unreadable: {source}")]
    SegmentUnreadable {
        segment: u32,
        #[source]
        source: std::io::Error,
    },
    #[error("log is empty")]
    EmptyLog,
    #[error("no message at {0}")]
    NoSuchMessage(LogId),
    #[error("subscriber '{0}' already exists")]
    DuplicateSubscriber(String),
    #[error("subscriber '{0}' not found, nothing to erase")]
    UnknownSubscriber(String),
    #[error("invalid subscriber name: {0:?}")]
    InvalidSubscriberName(String),
    #[error("checkpoint may not move backward from {current} to {requested}")]
    NonMonotonicCheckpoint { current: LogId, requested: LogId },
    #[error("checkpoint {requested} is past the last written message {last}")]
    CheckpointPastTail { requested: LogId, last: LogId },
    #[error("subscriber '{subscriber}' checkpoint {checkpoint} refers to reclaimed data")]
    CheckpointBehindRetention { subscriber: String, checkpoint: LogId },
    #[error("segment {segment:08x} not reclaimable ({pending_readers} pending readers, closed={closed})")]
    SegmentNotReclaimable {
        segment: u32,
        pending_readers: usize,
        closed: bool,
    },
    #[error("corrupt data: {0}")]
    Corrupt(&'static str),
    #[error("corrupt metadata: {0}")]
    CorruptMetadata(&'static str),
    #[error("unsupported version: {0}")]
    UnsupportedVersion(u32),
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
    #[error("payload too large")]
    PayloadTooLarge,
    #[error("log lock held by another process")]
    LockHeld,
    #[error("not a log directory: {}", .0.display())]
    NotALog(PathBuf),
}

pub type Result<T> = std::result::Result<T, Error>;
