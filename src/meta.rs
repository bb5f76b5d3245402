//! The log's metastore: configuration plus the number of the open segment.
//!
//! Stored as a single 32-byte record, replaced atomically via a temp file and
//! rename so readers never observe a half-written store.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crc32fast::Hasher;

use crate::{Error, Result};

pub const META_FILE: &str = "metastore";
pub const META_MAGIC: u32 = 0x4a4c_4d54; // 'JLMT'
pub const META_VERSION: u32 = 1;
const META_LEN: usize = 32;

/// Default segment rollover threshold: 4 MiB.
pub const DEFAULT_UNIT_LIMIT: u64 = 4 * 1024 * 1024;

/// How aggressively writes are forced to stable storage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Safety {
    /// Never fsync; rely on the page cache.
    Unsafe,
    /// fsync indexes and the metastore at rollover and on metadata changes.
    #[default]
    AlmostSafe,
    /// fsync the datafile and index after every append.
    Safe,
}

impl Safety {
    fn to_raw(self) -> u32 {
        match self {
            Safety::Unsafe => 0,
            Safety::AlmostSafe => 1,
            Safety::Safe => 2,
        }
    }

    fn from_raw(raw: u32) -> Result<Self> {
        match raw {
            0 => Ok(Safety::Unsafe),
            1 => Ok(Safety::AlmostSafe),
            2 => Ok(Safety::Safe),
            _ => Err(Error::CorruptMetadata("unknown safety level")),
        }
    }
}

/// Configuration fixed when a log is created and persisted in its metastore.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LogConfig {
    /// Roll to a new segment before the next append once the open datafile
    /// reaches or exceeds this many bytes. The append that crosses the limit
    /// still lands in the current segment.
    pub unit_limit: u64,
    /// Roll to a new segment once the open segment holds this many messages.
    pub max_messages: Option<u32>,
    pub safety: Safety,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            unit_limit: DEFAULT_UNIT_LIMIT,
            max_messages: None,
            safety: Safety::default(),
        }
    }
}

impl LogConfig {
    pub fn validate(&self) -> Result<()> {
        if self.unit_limit == 0 {
            return Err(Error::Unsupported("unit limit must be non-zero"));
        }
        if self.max_messages == Some(0) {
            return Err(Error::Unsupported("message limit must be non-zero"));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LogMeta {
    /// Segment currently open for appends. Every lower-numbered segment is closed.
    pub current_segment: u32,
    pub config: LogConfig,
}

impl LogMeta {
    pub fn new(config: LogConfig) -> Self {
        Self {
            current_segment: 0,
            config,
        }
    }

    fn encode(&self) -> [u8; META_LEN] {
        let mut buf = [0u8; META_LEN];
        buf[0..4].copy_from_slice(&META_MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&META_VERSION.to_le_bytes());
        buf[8..12].copy_from_slice(&self.current_segment.to_le_bytes());
        buf[12..16].copy_from_slice(&self.config.safety.to_raw().to_le_bytes());
        buf[16..24].copy_from_slice(&self.config.unit_limit.to_le_bytes());
        buf[24..28].copy_from_slice(&self.config.max_messages.unwrap_or(0).to_le_bytes());
        let crc = meta_crc(&buf[0..28]);
        buf[28..32].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8; META_LEN]) -> Result<Self> {
        let word = |at: usize| u32::from_le_bytes(buf[at..at + 4].try_into().expect("slice length"));
        if word(0) != META_MAGIC {
            return Err(Error::CorruptMetadata("metastore magic mismatch"));
        }
        if word(4) != META_VERSION {
            return Err(Error::UnsupportedVersion(word(4)));
        }
        if meta_crc(&buf[0..28]) != word(28) {
            return Err(Error::CorruptMetadata("metastore crc mismatch"));
        }
        let max_messages = match word(24) {
            0 => None,
            n => Some(n),
        };
        Ok(Self {
            current_segment: word(8),
            config: LogConfig {
                unit_limit: u64::from_le_bytes(buf[16..24].try_into().expect("slice length")),
                max_messages,
                safety: Safety::from_raw(word(12))?,
            },
        })
    }
}

fn meta_crc(bytes: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(bytes);
    hasher.finalize()
}

pub fn meta_path(root: &Path) -> PathBuf {
    root.join(META_FILE)
}

pub fn load_meta(root: &Path) -> Result<LogMeta> {
    let mut file = match File::open(meta_path(root)) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::NotALog(root.to_path_buf()))
        }
        Err(err) => return Err(err.into()),
    };
    let mut buf = [0u8; META_LEN];
    file.read_exact(&mut buf).map_err(|err| match err.kind() {
        std::io::ErrorKind::UnexpectedEof => Error::CorruptMetadata("metastore truncated"),
        _ => Error::Io(err),
    })?;
    LogMeta::decode(&buf)
}

pub fn store_meta(root: &Path, meta: &LogMeta) -> Result<()> {
    let path = meta_path(root);
    let tmp_path = path.with_extension("tmp");
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp_path)?;
    file.write_all(&meta.encode())?;
    if meta.config.safety != Safety::Unsafe {
        file.sync_all()?;
    }
    std::fs::rename(&tmp_path, &path)?;
    Ok(())
}
