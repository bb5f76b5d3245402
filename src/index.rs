//! Per-segment offset index.
//!
//! Layout (little-endian):
//!
//! ```text
//! 0          8         10       12         16               20         24           32
//! | magic    | version | flags  | segment  | message_count  | reserved | data_len   | offsets: u64 * message_count
//! ```
//!
//! Entry `i` holds the datafile offset of marker `i + 1`. `data_len` is the
//! datafile length covered by the indexed records. The header is rewritten
//! after each appended entry, so a crash can leave extra entries past
//! `message_count` but never a count that points at missing entries.
//!
//! An index that is absent or fails validation must be rebuilt from the
//! datafile; it never means "zero messages".

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use log::debug;

use crate::header::{scan_frames, FrameScan};
use crate::mmap::MmapFile;
use crate::segment::{index_filename, index_path, segment_path};
use crate::{Error, Result};

pub const INDEX_MAGIC: [u8; 8] = *b"JLOGIDX\0";
pub const INDEX_VERSION: u16 = 1;
pub const INDEX_HEADER_LEN: u64 = 32;
pub const INDEX_FLAG_CLOSED: u16 = 1 << 0;
const ENTRY_LEN: u64 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexHeader {
    pub segment: u32,
    pub message_count: u32,
    pub closed: bool,
    pub data_len: u64,
}

impl IndexHeader {
    pub fn empty(segment: u32) -> Self {
        Self {
            segment,
            message_count: 0,
            closed: false,
            data_len: 0,
        }
    }

    fn encode(&self) -> [u8; INDEX_HEADER_LEN as usize] {
        let mut buf = [0u8; INDEX_HEADER_LEN as usize];
        let flags = if self.closed { INDEX_FLAG_CLOSED } else { 0 };
        buf[0..8].copy_from_slice(&INDEX_MAGIC);
        buf[8..10].copy_from_slice(&INDEX_VERSION.to_le_bytes());
        buf[10..12].copy_from_slice(&flags.to_le_bytes());
        buf[12..16].copy_from_slice(&self.segment.to_le_bytes());
        buf[16..20].copy_from_slice(&self.message_count.to_le_bytes());
        buf[24..32].copy_from_slice(&self.data_len.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8; INDEX_HEADER_LEN as usize]) -> std::result::Result<Self, &'static str> {
        if buf[0..8] != INDEX_MAGIC {
            return Err("index magic mismatch");
        }
        let version = u16::from_le_bytes([buf[8], buf[9]]);
        if version != INDEX_VERSION {
            return Err("index version mismatch");
        }
        let flags = u16::from_le_bytes([buf[10], buf[11]]);
        let segment = u32::from_le_bytes(buf[12..16].try_into().expect("slice length"));
        let message_count = u32::from_le_bytes(buf[16..20].try_into().expect("slice length"));
        let data_len = u64::from_le_bytes(buf[24..32].try_into().expect("slice length"));
        Ok(Self {
            segment,
            message_count,
            closed: flags & INDEX_FLAG_CLOSED != 0,
            data_len,
        })
    }
}

/// What was found on disk for a segment's index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexState {
    Missing,
    Stale(&'static str),
    Valid(IndexHeader),
}

impl IndexState {
    pub fn needs_rebuild(&self) -> bool {
        !matches!(self, IndexState::Valid(_))
    }
}

/// Load and validate a segment's index against its datafile length.
pub fn load_index(root: &Path, segment: u32, datafile_len: u64) -> Result<IndexState> {
    let mut file = match File::open(index_path(root, segment)) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(IndexState::Missing),
        Err(err) => return Err(err.into()),
    };
    let file_len = file.metadata()?.len();
    if file_len < INDEX_HEADER_LEN {
        return Ok(IndexState::Stale("index header truncated"));
    }
    let mut buf = [0u8; INDEX_HEADER_LEN as usize];
    file.read_exact(&mut buf)?;
    let header = match IndexHeader::decode(&buf) {
        Ok(header) => header,
        Err(reason) => return Ok(IndexState::Stale(reason)),
    };
    if header.segment != segment {
        return Ok(IndexState::Stale("index segment mismatch"));
    }
    if file_len < INDEX_HEADER_LEN + header.message_count as u64 * ENTRY_LEN {
        return Ok(IndexState::Stale("index entries truncated"));
    }
    if header.data_len > datafile_len {
        return Ok(IndexState::Stale("datafile shorter than index"));
    }
    if header.closed && header.data_len != datafile_len {
        return Ok(IndexState::Stale("closed datafile length changed"));
    }
    Ok(IndexState::Valid(header))
}

/// Datafile offset of `marker` (1-based) from a validated index.
pub fn read_offset(root: &Path, header: &IndexHeader, marker: u32) -> Result<u64> {
    if marker == 0 || marker > header.message_count {
        return Err(Error::Corrupt("marker outside index"));
    }
    let file = File::open(index_path(root, header.segment))?;
    let mut buf = [0u8; ENTRY_LEN as usize];
    file.read_exact_at(&mut buf, entry_pos(marker - 1))?;
    Ok(u64::from_le_bytes(buf))
}

/// Every datafile offset recorded in a validated index, in marker order.
pub fn read_offsets(root: &Path, header: &IndexHeader) -> Result<Vec<u64>> {
    let file = File::open(index_path(root, header.segment))?;
    let mut buf = vec![0u8; header.message_count as usize * ENTRY_LEN as usize];
    file.read_exact_at(&mut buf, INDEX_HEADER_LEN)?;
    Ok(buf
        .chunks_exact(ENTRY_LEN as usize)
        .map(|entry| u64::from_le_bytes(entry.try_into().expect("entry length")))
        .collect())
}

fn entry_pos(entry: u32) -> u64 {
    INDEX_HEADER_LEN + entry as u64 * ENTRY_LEN
}

/// Map a segment's datafile read-only.
pub fn map_segment(root: &Path, segment: u32) -> Result<MmapFile> {
    MmapFile::open(&segment_path(root, segment)).map_err(|err| match err {
        Error::Io(source) => Error::SegmentUnreadable { segment, source },
        other => other,
    })
}

/// Walk a datafile's frames without touching its index.
pub fn scan_segment(root: &Path, segment: u32) -> Result<FrameScan> {
    let mmap = map_segment(root, segment)?;
    Ok(scan_frames(mmap.as_slice()))
}

/// Rebuild a segment's index from its datafile, replacing any existing index.
///
/// Only structurally valid records are indexed; a damaged tail is left out
/// and stays for the repairer to find.
pub fn rebuild_index(root: &Path, segment: u32, closed: bool) -> Result<IndexHeader> {
    let scan = scan_segment(root, segment)?;
    let header = IndexHeader {
        segment,
        message_count: u32::try_from(scan.offsets.len())
            .map_err(|_| Error::Corrupt("segment holds too many records"))?,
        closed,
        data_len: scan.valid_len,
    };
    let mut buf = Vec::with_capacity(INDEX_HEADER_LEN as usize + scan.offsets.len() * 8);
    buf.extend_from_slice(&header.encode());
    for offset in &scan.offsets {
        buf.extend_from_slice(&offset.to_le_bytes());
    }

    let path = index_path(root, segment);
    let tmp_path = rebuild_tmp_path(root, segment);
    if let Err(err) = write_synced(&tmp_path, &buf) {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(err);
    }
    std::fs::rename(&tmp_path, &path)?;
    // A reclaim may have removed the datafile while we scanned it.
    if !segment_path(root, segment).is_file() {
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        return Err(Error::SegmentUnreadable {
            segment,
            source: std::io::ErrorKind::NotFound.into(),
        });
    }
    debug!(
        "rebuilt index for segment {segment:08x}: {} messages, closed={closed}",
        header.message_count
    );
    Ok(header)
}

/// Per-rebuild temp name, so concurrent readers rebuilding the same index
/// never rename each other's file away.
fn rebuild_tmp_path(root: &Path, segment: u32) -> PathBuf {
    static NEXT: AtomicU64 = AtomicU64::new(0);
    let seq = NEXT.fetch_add(1, Ordering::Relaxed);
    root.join(format!(
        "{}.{}.{seq}.tmp",
        index_filename(segment),
        std::process::id()
    ))
}

fn write_synced(path: &Path, buf: &[u8]) -> Result<()> {
    let mut file = OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(path)?;
    file.write_all(buf)?;
    file.sync_all()?;
    Ok(())
}

/// Append-side handle on the index of the open segment.
pub struct IndexWriter {
    file: File,
    header: IndexHeader,
}

impl IndexWriter {
    /// Start a fresh, empty index for a new segment.
    pub fn create(root: &Path, segment: u32) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(index_path(root, segment))?;
        let header = IndexHeader::empty(segment);
        file.write_all_at(&header.encode(), 0)?;
        Ok(Self { file, header })
    }

    /// Reopen a validated index to continue appending.
    pub fn open(root: &Path, header: IndexHeader) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(index_path(root, header.segment))?;
        Ok(Self { file, header })
    }

    pub fn header(&self) -> &IndexHeader {
        &self.header
    }

    /// Record a message stored at `offset`; `data_len` is the datafile length after it.
    pub fn append(&mut self, offset: u64, data_len: u64) -> Result<u32> {
        if self.header.closed {
            return Err(Error::Unsupported("append to closed index"));
        }
        let marker = self
            .header
            .message_count
            .checked_add(1)
            .ok_or(Error::Unsupported("segment marker space exhausted"))?;
        self.file
            .write_all_at(&offset.to_le_bytes(), entry_pos(self.header.message_count))?;
        self.header.message_count = marker;
        self.header.data_len = data_len;
        self.file.write_all_at(&self.header.encode(), 0)?;
        Ok(marker)
    }

    pub fn close(&mut self) -> Result<()> {
        self.header.closed = true;
        self.file.write_all_at(&self.header.encode(), 0)?;
        self.file.sync_all()?;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}
