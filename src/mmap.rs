use std::fs::{File, OpenOptions};
use std::path::Path;

use memmap2::{Mmap, MmapOptions};

use crate::Result;

/// Read-only view of a whole datafile.
///
/// Zero-length files are not mapped; they read as an empty slice.
pub struct MmapFile {
    _file: File,
    map: Option<Mmap>,
}

impl MmapFile {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        let len = file.metadata()?.len() as usize;
        let map = if len == 0 {
            None
        } else {
            // SAFETY: the mapping is read-only and callers treat a concurrently
            // appended tail as unvalidated bytes.
            Some(unsafe { MmapOptions::new().len(len).map(&file)? })
        };
        Ok(Self { _file: file, map })
    }

    pub fn as_slice(&self) -> &[u8] {
        self.map.as_deref().unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
