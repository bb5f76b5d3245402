//! Record framing inside a segment datafile.
//!
//! Every message is stored as a fixed 24-byte header followed by the payload:
//!
//! ```text
//! 0        4              8                 16        20         24
//! | magic  | payload_len  |  timestamp_ns   |  crc32  | reserved |  payload ...
//! ```
//!
//! All integers are little-endian. The crc covers `payload_len`,
//! `timestamp_ns` and the payload bytes, so a torn header and a torn payload
//! are both detected.

use std::fmt;

use crc32fast::Hasher;

use crate::{Error, Result};

pub const RECORD_MAGIC: u32 = 0x4a4c_5231; // 'JLR1'
pub const HEADER_SIZE: usize = 24;
pub const MAX_PAYLOAD_LEN: usize = u32::MAX as usize - HEADER_SIZE;

const MAGIC_OFFSET: usize = 0;
const LEN_OFFSET: usize = 4;
const TIMESTAMP_OFFSET: usize = 8;
const CRC_OFFSET: usize = 16;
const RESERVED_OFFSET: usize = 20;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordHeader {
    pub payload_len: u32,
    pub timestamp_ns: u64,
    pub crc: u32,
}

impl RecordHeader {
    pub fn for_payload(payload: &[u8], timestamp_ns: u64) -> Result<Self> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(Error::PayloadTooLarge);
        }
        let payload_len = payload.len() as u32;
        Ok(Self {
            payload_len,
            timestamp_ns,
            crc: record_crc(payload_len, timestamp_ns, payload),
        })
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[MAGIC_OFFSET..MAGIC_OFFSET + 4].copy_from_slice(&RECORD_MAGIC.to_le_bytes());
        buf[LEN_OFFSET..LEN_OFFSET + 4].copy_from_slice(&self.payload_len.to_le_bytes());
        buf[TIMESTAMP_OFFSET..TIMESTAMP_OFFSET + 8]
            .copy_from_slice(&self.timestamp_ns.to_le_bytes());
        buf[CRC_OFFSET..CRC_OFFSET + 4].copy_from_slice(&self.crc.to_le_bytes());
        buf[RESERVED_OFFSET..RESERVED_OFFSET + 4].copy_from_slice(&0u32.to_le_bytes());
        buf
    }

    pub fn from_bytes(bytes: &[u8; HEADER_SIZE]) -> Result<Self> {
        let magic = u32::from_le_bytes(read4(bytes, MAGIC_OFFSET));
        if magic != RECORD_MAGIC {
            return Err(Error::Corrupt("record magic mismatch"));
        }
        Ok(Self {
            payload_len: u32::from_le_bytes(read4(bytes, LEN_OFFSET)),
            timestamp_ns: u64::from_le_bytes(read8(bytes, TIMESTAMP_OFFSET)),
            crc: u32::from_le_bytes(read4(bytes, CRC_OFFSET)),
        })
    }

    pub fn record_len(&self) -> u64 {
        HEADER_SIZE as u64 + self.payload_len as u64
    }

    pub fn validate_crc(&self, payload: &[u8]) -> Result<()> {
        if record_crc(self.payload_len, self.timestamp_ns, payload) == self.crc {
            Ok(())
        } else {
            Err(Error::Corrupt("crc mismatch"))
        }
    }
}

fn read4(bytes: &[u8; HEADER_SIZE], at: usize) -> [u8; 4] {
    let mut out = [0u8; 4];
    out.copy_from_slice(&bytes[at..at + 4]);
    out
}

fn read8(bytes: &[u8; HEADER_SIZE], at: usize) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(&bytes[at..at + 8]);
    out
}

pub fn record_crc(payload_len: u32, timestamp_ns: u64, payload: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(&payload_len.to_le_bytes());
    hasher.update(&timestamp_ns.to_le_bytes());
    hasher.update(payload);
    hasher.finalize()
}

/// Why a frame failed validation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameError {
    /// Fewer than [`HEADER_SIZE`] bytes remain.
    TruncatedHeader,
    BadMagic,
    /// The declared payload runs past end-of-file.
    TruncatedPayload,
    ChecksumMismatch,
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            FrameError::TruncatedHeader => "truncated record header",
            FrameError::BadMagic => "bad record magic",
            FrameError::TruncatedPayload => "record length runs past end of file",
            FrameError::ChecksumMismatch => "record checksum mismatch",
        };
        f.write_str(msg)
    }
}

/// Outcome of walking the frames of a datafile image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameScan {
    /// Start offset of every structurally valid record, in order.
    pub offsets: Vec<u64>,
    /// End of the last valid record.
    pub valid_len: u64,
    /// First framing violation, if the walk stopped before end of data.
    pub error: Option<(u64, FrameError)>,
}

/// Walk `data` from offset 0 validating every frame.
pub fn scan_frames(data: &[u8]) -> FrameScan {
    let mut offsets = Vec::new();
    let mut offset = 0usize;
    let error = loop {
        if offset == data.len() {
            break None;
        }
        match check_frame(&data[offset..]) {
            Ok(len) => {
                offsets.push(offset as u64);
                offset += len;
            }
            Err(err) => break Some((offset as u64, err)),
        }
    };
    FrameScan {
        offsets,
        valid_len: offset as u64,
        error,
    }
}

/// Validate the frame at the start of `data`, returning its total length.
fn check_frame(data: &[u8]) -> std::result::Result<usize, FrameError> {
    let Some(header_bytes) = data.get(..HEADER_SIZE) else {
        return Err(FrameError::TruncatedHeader);
    };
    let mut buf = [0u8; HEADER_SIZE];
    buf.copy_from_slice(header_bytes);
    let header = RecordHeader::from_bytes(&buf).map_err(|_| FrameError::BadMagic)?;
    let end = HEADER_SIZE + header.payload_len as usize;
    let payload = data
        .get(HEADER_SIZE..end)
        .ok_or(FrameError::TruncatedPayload)?;
    header
        .validate_crc(payload)
        .map_err(|_| FrameError::ChecksumMismatch)?;
    Ok(end)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(payload: &[u8], ts: u64) -> Vec<u8> {
        let header = RecordHeader::for_payload(payload, ts).expect("header");
        let mut out = header.to_bytes().to_vec();
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn header_decodes_what_it_encodes() -> Result<()> {
        let header = RecordHeader::for_payload(b"hello", 1_700_000_000_000)?;
        let decoded = RecordHeader::from_bytes(&header.to_bytes())?;
        assert_eq!(decoded, header);
        decoded.validate_crc(b"hello")?;
        assert!(decoded.validate_crc(b"hellO").is_err());
        assert_eq!(decoded.record_len(), (HEADER_SIZE + 5) as u64);
        Ok(())
    }

    #[test]
    fn clean_scan_reaches_end() {
        let mut data = frame(b"one", 1);
        data.extend(frame(b"", 2));
        data.extend(frame(b"three", 3));
        let scan = scan_frames(&data);
        assert_eq!(scan.offsets, vec![0, 27, 51]);
        assert_eq!(scan.valid_len, data.len() as u64);
        assert_eq!(scan.error, None);
    }

    #[test]
    fn scan_stops_at_truncated_payload() {
        let mut data = frame(b"first", 1);
        let second = frame(b"second record", 2);
        data.extend_from_slice(&second[..second.len() - 4]);
        let scan = scan_frames(&data);
        assert_eq!(scan.offsets, vec![0]);
        assert_eq!(scan.valid_len, 29);
        assert_eq!(scan.error, Some((29, FrameError::TruncatedPayload)));
    }

    #[test]
    fn scan_detects_header_damage() {
        let mut data = frame(b"first", 1);
        data.extend_from_slice(&[0u8; 10]);
        assert_eq!(scan_frames(&data).error, Some((29, FrameError::TruncatedHeader)));

        let mut data = frame(b"first", 1);
        data.extend(frame(b"second", 2));
        data[29] ^= 0xff;
        assert_eq!(scan_frames(&data).error, Some((29, FrameError::BadMagic)));

        let mut data = frame(b"first", 1);
        data.extend(frame(b"second", 2));
        let last = data.len() - 1;
        data[last] ^= 0x01;
        assert_eq!(scan_frames(&data).error, Some((29, FrameError::ChecksumMismatch)));
    }
}
