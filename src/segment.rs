//! Segment file naming and discovery.
//!
//! A segment is a datafile named by exactly eight lowercase hex digits (the
//! segment number, zero padded) plus an index file carrying the same name and
//! [`INDEX_EXT`]. Nothing else in the log directory may match the datafile
//! pattern, so discovery is a pure filename filter.

use std::path::{Path, PathBuf};

use crate::{Error, Result};

/// Suffix appended to a datafile name to form its index name.
pub const INDEX_EXT: &str = ".idx";

/// Result of classifying a directory entry name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentName {
    Valid(u32),
    NotASegment,
}

impl SegmentName {
    pub fn parse(name: &str) -> Self {
        let bytes = name.as_bytes();
        if bytes.len() != 8 {
            return SegmentName::NotASegment;
        }
        let mut id = 0u32;
        for &b in bytes {
            let nibble = match b {
                b'0'..=b'9' => b - b'0',
                b'a'..=b'f' => b - b'a' + 10,
                _ => return SegmentName::NotASegment,
            };
            id = (id << 4) | nibble as u32;
        }
        SegmentName::Valid(id)
    }

    pub fn id(self) -> Option<u32> {
        match self {
            SegmentName::Valid(id) => Some(id),
            SegmentName::NotASegment => None,
        }
    }
}

pub fn segment_filename(id: u32) -> String {
    format!("{id:08x}")
}

pub fn index_filename(id: u32) -> String {
    format!("{id:08x}{INDEX_EXT}")
}

pub fn segment_path(root: &Path, id: u32) -> PathBuf {
    root.join(segment_filename(id))
}

pub fn index_path(root: &Path, id: u32) -> PathBuf {
    root.join(index_filename(id))
}

/// Datafile and index paths for a segment.
pub fn segment_paths(root: &Path, id: u32) -> (PathBuf, PathBuf) {
    (segment_path(root, id), index_path(root, id))
}

/// List segment numbers present in `root`, ascending.
pub fn discover_segments(root: &Path) -> Result<Vec<u32>> {
    let mut segments = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if let SegmentName::Valid(id) = SegmentName::parse(name) {
            segments.push(id);
        }
    }
    segments.sort_unstable();
    Ok(segments)
}

/// Size of a segment's datafile in bytes.
pub fn stat_segment(root: &Path, id: u32) -> Result<u64> {
    std::fs::metadata(segment_path(root, id))
        .map(|meta| meta.len())
        .map_err(|source| Error::SegmentUnreadable {
            segment: id,
            source,
        })
}

pub fn segment_exists(root: &Path, id: u32) -> bool {
    segment_path(root, id).is_file()
}
