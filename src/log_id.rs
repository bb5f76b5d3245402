//! Log identifiers.
//!
//! A [`LogId`] addresses one message: the segment it lives in plus its marker
//! inside that segment. Marker `0` is the position before the first message of
//! a segment, so `(n, 0)` reads as "nothing of segment `n` consumed yet".

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// Length of the printed form: 8 hex digits, ':', 8 hex digits.
pub const LOG_ID_STR_LEN: usize = 17;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct LogId {
    pub segment: u32,
    pub marker: u32,
}

impl LogId {
    pub const fn new(segment: u32, marker: u32) -> Self {
        Self { segment, marker }
    }

    /// Position before the first message of `segment`.
    pub const fn segment_start(segment: u32) -> Self {
        Self { segment, marker: 0 }
    }

    /// Step forward by one message, never past `finish`.
    ///
    /// `segment_len` reports how many messages a segment holds; when the
    /// current segment is exhausted the identifier moves to the first message
    /// of the following segment. Returns `None` once `finish` has been reached.
    pub fn advance<F>(self, finish: LogId, mut segment_len: F) -> Option<LogId>
    where
        F: FnMut(u32) -> Option<u32>,
    {
        if self >= finish {
            return None;
        }
        if self.segment == finish.segment {
            return Some(LogId::new(self.segment, self.marker + 1));
        }
        match segment_len(self.segment) {
            Some(len) if self.marker < len => Some(LogId::new(self.segment, self.marker + 1)),
            _ => {
                let mut segment = self.segment + 1;
                // Skip segments that hold nothing; they can only appear after a repair.
                while segment < finish.segment && segment_len(segment) == Some(0) {
                    segment += 1;
                }
                Some(LogId::new(segment, 1))
            }
        }
    }
}

impl Ord for LogId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.segment
            .cmp(&other.segment)
            .then(self.marker.cmp(&other.marker))
    }
}

impl PartialOrd for LogId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}:{:08x}", self.segment, self.marker)
    }
}

impl FromStr for LogId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let malformed = || Error::MalformedIdentifier(s.to_string());
        if s.len() != LOG_ID_STR_LEN {
            return Err(malformed());
        }
        let (segment, rest) = s.split_at(8);
        let marker = rest.strip_prefix(':').ok_or_else(malformed)?;
        Ok(LogId {
            segment: parse_hex_u32(segment).ok_or_else(malformed)?,
            marker: parse_hex_u32(marker).ok_or_else(malformed)?,
        })
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for LogId {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

/// Parse exactly eight hex digits. `u32::from_str_radix` alone accepts a
/// leading '+', which is not part of the identifier format.
pub(crate) fn parse_hex_u32(digits: &str) -> Option<u32> {
    if digits.len() != 8 || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u32::from_str_radix(digits, 16).ok()
}
