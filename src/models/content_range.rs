//! Parsing of the `Content-Range` declaration carried by every chunk.
//!
//! Accepted grammar: an optional `bytes ` unit prefix followed by
//! `<start>-<end>/<total>`. `end` is normally the exclusive end offset of the
//! chunk, so a 9-byte file sent in one request declares `0-9/9`. Some clients
//! send the chunk length there instead (`9-19/28` for 19 bytes at offset 9);
//! that is accepted too, since only `start` and `total` are checked against
//! the upload and the body length decides how far the offset moves.

use std::{fmt, str::FromStr};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid Content-Range `{value}`: {reason}")]
pub struct ContentRangeError {
    pub value: String,
    pub reason: &'static str,
}

/// Where a chunk fits in the final file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: u64,
    pub end: u64,
    pub total: u64,
}

impl ContentRange {
    /// True when this chunk reaches the end of the declared file.
    pub fn is_final(&self) -> bool {
        self.end == self.total
    }
}

impl FromStr for ContentRange {
    type Err = ContentRangeError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let err = |reason| ContentRangeError {
            value: raw.to_string(),
            reason,
        };

        let trimmed = raw.trim();
        let spec = trimmed.strip_prefix("bytes ").unwrap_or(trimmed).trim();

        let (range, total) = spec
            .split_once('/')
            .ok_or_else(|| err("expected `start-end/total`"))?;
        let (start, end) = range
            .split_once('-')
            .ok_or_else(|| err("expected `start-end` before `/`"))?;

        let start = parse_offset(start).ok_or_else(|| err("start is not a byte offset"))?;
        let end = parse_offset(end).ok_or_else(|| err("end is not a byte offset"))?;
        let total = parse_offset(total).ok_or_else(|| err("total is not a byte count"))?;

        if start > end {
            return Err(err("start is past end"));
        }
        if end > total {
            return Err(err("end is past total"));
        }

        Ok(Self { start, end, total })
    }
}

impl fmt::Display for ContentRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bytes {}-{}/{}", self.start, self.end, self.total)
    }
}

/// Digits only; rejects signs and whitespace inside the number.
fn parse_offset(value: &str) -> Option<u64> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    value.parse().ok()
}
