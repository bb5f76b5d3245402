//! Durable per-subscriber checkpoints.
//!
//! Each subscriber owns `checkpoints/<name>.cp`, two 24-byte slots written
//! alternately:
//!
//! ```text
//! | segment: u32 | marker: u32 | generation: u64 | crc32: u32 | reserved: u32 |
//! ```
//!
//! The valid slot with the highest generation is current, so a torn write
//! leaves the previous checkpoint readable.

use std::fs::{File, OpenOptions};
use std::io::Read;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use crc32fast::Hasher;

use crate::log_id::LogId;
use crate::{Error, Result};

pub const CHECKPOINT_DIR: &str = "checkpoints";
const CHECKPOINT_EXT: &str = "cp";
const SLOT_LEN: usize = 24;
const FILE_LEN: usize = SLOT_LEN * 2;
const MAX_NAME_LEN: usize = 200;

/// Where a new subscriber starts reading.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum StartPolicy {
    /// Everything still retained in the log.
    #[default]
    Beginning,
    /// Only messages written after subscribing.
    Tail,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Slot {
    id: LogId,
    generation: u64,
}

/// Checkpoint files of one log.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
    sync: bool,
}

impl CheckpointStore {
    pub fn new(root: &Path, sync: bool) -> Self {
        Self {
            dir: root.join(CHECKPOINT_DIR),
            sync,
        }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.{CHECKPOINT_EXT}"))
    }

    /// Register `name` with an initial checkpoint.
    pub fn add(&self, name: &str, initial: LogId) -> Result<()> {
        validate_name(name)?;
        std::fs::create_dir_all(&self.dir)?;
        let file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(self.path(name))
        {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(Error::DuplicateSubscriber(name.to_string()))
            }
            Err(err) => return Err(err.into()),
        };
        file.set_len(FILE_LEN as u64)?;
        self.write_slot(
            &file,
            Slot {
                id: initial,
                generation: 1,
            },
        )
    }

    pub fn remove(&self, name: &str) -> Result<()> {
        validate_name(name)?;
        match std::fs::remove_file(self.path(name)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::UnknownSubscriber(name.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Subscriber names, sorted.
    pub fn names(&self) -> Result<Vec<String>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut names = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(CHECKPOINT_EXT) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                if validate_name(stem).is_ok() {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort_unstable();
        Ok(names)
    }

    /// Every subscriber with its checkpoint, sorted by name.
    pub fn list(&self) -> Result<Vec<(String, LogId)>> {
        let mut out = Vec::new();
        for name in self.names()? {
            match self.get(&name) {
                Ok(id) => out.push((name, id)),
                // Removed between listing and reading.
                Err(Error::UnknownSubscriber(_)) => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(out)
    }

    pub fn get(&self, name: &str) -> Result<LogId> {
        validate_name(name)?;
        Ok(self.load(name)?.id)
    }

    /// Move `name`'s checkpoint forward to `id`.
    ///
    /// Moving backward fails with [`Error::NonMonotonicCheckpoint`]; storing
    /// the current value again is a no-op.
    pub fn advance(&self, name: &str, id: LogId) -> Result<()> {
        validate_name(name)?;
        let current = self.load(name)?;
        if id < current.id {
            return Err(Error::NonMonotonicCheckpoint {
                current: current.id,
                requested: id,
            });
        }
        if id == current.id {
            return Ok(());
        }
        let file = OpenOptions::new().write(true).open(self.path(name))?;
        self.write_slot(
            &file,
            Slot {
                id,
                generation: current.generation + 1,
            },
        )
    }

    fn load(&self, name: &str) -> Result<Slot> {
        let mut file = match File::open(self.path(name)) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::UnknownSubscriber(name.to_string()))
            }
            Err(err) => return Err(err.into()),
        };
        let mut buf = Vec::with_capacity(FILE_LEN);
        file.read_to_end(&mut buf)?;
        if buf.len() != FILE_LEN {
            return Err(Error::CorruptMetadata("checkpoint file has unexpected size"));
        }
        let slot0 = parse_slot(&buf[..SLOT_LEN]);
        let slot1 = parse_slot(&buf[SLOT_LEN..]);
        match (slot0, slot1) {
            (None, None) => Err(Error::CorruptMetadata("no valid checkpoint slot")),
            (Some(slot), None) | (None, Some(slot)) => Ok(slot),
            (Some(a), Some(b)) => Ok(if b.generation > a.generation { b } else { a }),
        }
    }

    fn write_slot(&self, file: &File, slot: Slot) -> Result<()> {
        let at = (slot.generation % 2) as u64 * SLOT_LEN as u64;
        file.write_all_at(&encode_slot(&slot), at)?;
        if self.sync {
            file.sync_data()?;
        }
        Ok(())
    }
}

/// Subscriber names become file names, so they are restricted to a portable set.
pub fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && !name.starts_with('.')
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'@'));
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidSubscriberName(name.to_string()))
    }
}

fn encode_slot(slot: &Slot) -> [u8; SLOT_LEN] {
    let mut buf = [0u8; SLOT_LEN];
    buf[0..4].copy_from_slice(&slot.id.segment.to_le_bytes());
    buf[4..8].copy_from_slice(&slot.id.marker.to_le_bytes());
    buf[8..16].copy_from_slice(&slot.generation.to_le_bytes());
    let crc = slot_crc(&buf[0..16]);
    buf[16..20].copy_from_slice(&crc.to_le_bytes());
    buf
}

fn parse_slot(buf: &[u8]) -> Option<Slot> {
    let crc = u32::from_le_bytes(buf.get(16..20)?.try_into().ok()?);
    if slot_crc(&buf[0..16]) != crc {
        return None;
    }
    let generation = u64::from_le_bytes(buf[8..16].try_into().ok()?);
    // Generation 0 is never written.
    if generation == 0 {
        return None;
    }
    Some(Slot {
        id: LogId::new(
            u32::from_le_bytes(buf[0..4].try_into().ok()?),
            u32::from_le_bytes(buf[4..8].try_into().ok()?),
        ),
        generation,
    })
}

fn slot_crc(payload: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(payload);
    hasher.finalize()
}
