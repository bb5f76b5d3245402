//! Advisory whole-log locking.
//!
//! A single `writer.lock` file per log is held with `flock(LOCK_EX)` by
//! whoever needs the log to itself: the [`LogWriter`](crate::LogWriter) for
//! its lifetime, and administrative operations through [`ExclusiveLock`].
//! Because both take the same lock, repair and reclaim can never run while a
//! writer is appending. Readers do not lock.
//!
//! The holder writes `pid start_time role` into the file so a failed
//! acquisition can report who is in the way.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use log::warn;

use crate::{Error, Result};

pub const LOCK_FILE: &str = "writer.lock";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockRole {
    Writer,
    Admin,
}

impl LockRole {
    fn as_str(self) -> &'static str {
        match self {
            LockRole::Writer => "writer",
            LockRole::Admin => "admin",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "writer" => Some(LockRole::Writer),
            "admin" => Some(LockRole::Admin),
            _ => None,
        }
    }
}

/// Contents of a lock file as last written by its holder.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockInfo {
    pub pid: u32,
    pub start_time: u64,
    pub role: Option<LockRole>,
}

pub fn lock_path(root: &Path) -> PathBuf {
    root.join(LOCK_FILE)
}

/// Held flock on a log's lock file; released on drop.
#[derive(Debug)]
pub(crate) struct FileLock {
    file: File,
}

impl FileLock {
    pub(crate) fn acquire(root: &Path, role: LockRole) -> Result<Self> {
        let path = lock_path(root);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;
        if !try_lock(&file)? {
            match read_lock_info(root) {
                Ok(Some(info)) => warn!(
                    "{} is locked by pid {} ({}, alive={})",
                    root.display(),
                    info.pid,
                    info.role.map_or("unknown", LockRole::as_str),
                    lock_owner_alive(&info).unwrap_or(false)
                ),
                Ok(None) | Err(_) => warn!("{} is locked by another process", root.display()),
            }
            return Err(Error::LockHeld);
        }
        write_lock_record(&file, role)?;
        Ok(Self { file })
    }
}

/// Proof that the caller holds the log exclusively.
///
/// Required by [`Log::reclaim`](crate::Log::reclaim) and
/// [`Log::repair`](crate::Log::repair). Fails with [`Error::LockHeld`] while a
/// writer (or another administrator) holds the log.
#[derive(Debug)]
pub struct ExclusiveLock {
    root: PathBuf,
    _lock: FileLock,
}

impl ExclusiveLock {
    pub fn acquire(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let lock = FileLock::acquire(&root, LockRole::Admin)?;
        Ok(Self { root, _lock: lock })
    }

    /// Log directory this lock covers.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub(crate) fn covers(&self, root: &Path) -> bool {
        self.root == root
    }
}

fn try_lock(file: &File) -> Result<bool> {
    let res = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if res == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.kind() == std::io::ErrorKind::WouldBlock {
        return Ok(false);
    }
    Err(Error::Io(err))
}

fn write_lock_record(file: &File, role: LockRole) -> Result<()> {
    let pid = std::process::id();
    let start_time = proc_start_time(pid).unwrap_or(0);
    let record = format!("{pid} {start_time} {}\n", role.as_str());
    let mut handle = file.try_clone()?;
    handle.set_len(0)?;
    handle.seek(SeekFrom::Start(0))?;
    handle.write_all(record.as_bytes())?;
    Ok(())
}

/// Read the holder record of a log's lock file, if one exists.
pub fn read_lock_info(root: &Path) -> Result<Option<LockInfo>> {
    let mut contents = String::new();
    match File::open(lock_path(root)) {
        Ok(mut file) => file.read_to_string(&mut contents)?,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let mut parts = contents.split_whitespace();
    let Some(pid) = parts.next().and_then(|p| p.parse::<u32>().ok()) else {
        return Ok(None);
    };
    let start_time = parts.next().and_then(|p| p.parse::<u64>().ok()).unwrap_or(0);
    let role = parts.next().and_then(LockRole::parse);
    Ok(Some(LockInfo {
        pid,
        start_time,
        role,
    }))
}

/// Whether the process named in `info` is still the same running process.
#[cfg(target_os = "linux")]
pub fn lock_owner_alive(info: &LockInfo) -> Result<bool> {
    if info.pid == 0 {
        return Ok(false);
    }
    match proc_start_time(info.pid) {
        Ok(start) => Ok(start == info.start_time),
        Err(Error::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}

#[cfg(not(target_os = "linux"))]
pub fn lock_owner_alive(info: &LockInfo) -> Result<bool> {
    Ok(info.pid != 0)
}

#[cfg(target_os = "linux")]
fn proc_start_time(pid: u32) -> Result<u64> {
    let mut contents = String::new();
    File::open(format!("/proc/{pid}/stat"))?.read_to_string(&mut contents)?;
    let end = contents
        .rfind(')')
        .ok_or(Error::CorruptMetadata("stat parse"))?;
    // starttime is field 22; fields after the command name start at field 3.
    contents[end + 1..]
        .split_whitespace()
        .nth(19)
        .ok_or(Error::CorruptMetadata("stat missing starttime"))?
        .parse::<u64>()
        .map_err(|_| Error::CorruptMetadata("stat starttime invalid"))
}

#[cfg(not(target_os = "linux"))]
fn proc_start_time(_pid: u32) -> Result<u64> {
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn exclusive_lock_excludes_second_holder() -> Result<()> {
        let dir = tempdir()?;
        let first = ExclusiveLock::acquire(dir.path())?;
        assert!(matches!(ExclusiveLock::acquire(dir.path()), Err(Error::LockHeld)));
        let writer = FileLock::acquire(dir.path(), LockRole::Writer);
        assert!(matches!(writer, Err(Error::LockHeld)));
        drop(first);
        let _again = ExclusiveLock::acquire(dir.path())?;
        Ok(())
    }

    #[test]
    fn lock_record_names_holder() -> Result<()> {
        let dir = tempdir()?;
        let _lock = FileLock::acquire(dir.path(), LockRole::Writer)?;
        let info = read_lock_info(dir.path())?.expect("lock record");
        assert_eq!(info.pid, std::process::id());
        assert_eq!(info.role, Some(LockRole::Writer));
        assert!(lock_owner_alive(&info)?);
        Ok(())
    }

    #[test]
    fn no_lock_file_means_no_holder() -> Result<()> {
        let dir = tempdir()?;
        assert_eq!(read_lock_info(dir.path())?, None);
        Ok(())
    }
}
