//! Datafile inspection and repair.
//!
//! Inspection walks a segment's records from offset 0 and reports the first
//! place framing breaks. Repair cuts the datafile back to the last valid
//! record and drops the index so it is rebuilt from what remains.

use std::fmt;
use std::fs::{self, OpenOptions};

use log::info;

use crate::header::FrameError;
use crate::index::scan_segment;
use crate::lock::ExclusiveLock;
use crate::store::Log;
use crate::Result;

/// Verdict of walking a datafile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inspection {
    Clean {
        messages: u32,
        len: u64,
    },
    Corrupt {
        /// Start of the first broken frame; everything before it is valid.
        offset: u64,
        reason: FrameError,
        valid_messages: u32,
    },
}

impl Inspection {
    pub fn is_clean(&self) -> bool {
        matches!(self, Inspection::Clean { .. })
    }
}

impl fmt::Display for Inspection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Inspection::Clean { messages, len } => {
                write!(f, "clean ({messages} messages, {len} bytes)")
            }
            Inspection::Corrupt {
                offset,
                reason,
                valid_messages,
            } => write!(
                f,
                "corrupt at offset {offset}: {reason} ({valid_messages} valid messages before it)"
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairOutcome {
    AlreadyClean,
    Truncated { from_len: u64, to_len: u64 },
}

impl fmt::Display for RepairOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RepairOutcome::AlreadyClean => f.write_str("already clean"),
            RepairOutcome::Truncated { from_len, to_len } => {
                write!(f, "truncated {from_len} -> {to_len} bytes")
            }
        }
    }
}

impl Log {
    pub fn inspect(&self, segment: u32) -> Result<Inspection> {
        let scan = scan_segment(self.root(), segment)?;
        let messages = scan.offsets.len() as u32;
        Ok(match scan.error {
            None => Inspection::Clean {
                messages,
                len: scan.valid_len,
            },
            Some((offset, reason)) => Inspection::Corrupt {
                offset,
                reason,
                valid_messages: messages,
            },
        })
    }

    /// Truncate a corrupt datafile to its valid prefix and delete its index.
    ///
    /// A clean segment is left untouched.
    pub fn repair(&self, segment: u32, lock: &ExclusiveLock) -> Result<RepairOutcome> {
        self.check_lock(lock)?;
        let Inspection::Corrupt { offset, reason, .. } = self.inspect(segment)? else {
            return Ok(RepairOutcome::AlreadyClean);
        };
        let (data_path, index_path) = self.segment_paths(segment);
        let from_len = self.stat(segment)?;
        let file = OpenOptions::new().write(true).open(&data_path)?;
        file.set_len(offset)?;
        file.sync_all()?;
        match fs::remove_file(&index_path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        info!(
            "repaired segment {segment:08x} ({reason}): truncated {from_len} -> {offset} bytes, index removed"
        );
        Ok(RepairOutcome::Truncated {
            from_len,
            to_len: offset,
        })
    }
}
