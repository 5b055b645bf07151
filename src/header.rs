//! Excerpt framing inside a segment's data region.
//!
//! Every record starts on an 8-byte boundary with a 4-byte header word followed by a
//! 4-byte CRC32 of the payload:
//!
//! ```text
//! bit 31     in progress (a writer claimed the slot, payload not yet visible)
//! bit 30     metadata (index blocks, padding); skipped by readers
//! bits 0-29  payload length + 1, so a committed empty payload is distinguishable from 0
//! ```
//!
//! A word of `0` is unwritten space. A metadata word with a zero length field is the EOF
//! marker written when a segment is rolled.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::mmap::MmapFile;
use crate::{Error, Result};

pub const RECORD_HEADER_LEN: usize = 8;
pub const RECORD_ALIGN: usize = 8;

pub const IN_PROGRESS_FLAG: u32 = 0x8000_0000;
pub const META_FLAG: u32 = 0x4000_0000;
pub const LEN_MASK: u32 = 0x3FFF_FFFF;
pub const EOF_MARKER: u32 = META_FLAG;

pub const MAX_PAYLOAD_LEN: usize = (LEN_MASK - 1) as usize;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordHeader {
    Unwritten,
    InProgress { len: usize, meta: bool },
    Data { len: usize },
    Meta { len: usize },
    Eof,
}

impl RecordHeader {
    pub fn decode(word: u32) -> Self {
        if word == 0 {
            return RecordHeader::Unwritten;
        }
        let meta = word & META_FLAG != 0;
        let len = ((word & LEN_MASK) as usize).saturating_sub(1);
        if word & IN_PROGRESS_FLAG != 0 {
            return RecordHeader::InProgress { len, meta };
        }
        match (meta, word & LEN_MASK) {
            (true, 0) => RecordHeader::Eof,
            (true, _) => RecordHeader::Meta { len },
            (false, _) => RecordHeader::Data { len },
        }
    }

    pub fn encode(self) -> u32 {
        match self {
            RecordHeader::Unwritten => 0,
            RecordHeader::Eof => EOF_MARKER,
            RecordHeader::InProgress { len, meta } => {
                IN_PROGRESS_FLAG | if meta { META_FLAG } else { 0 } | (len as u32 + 1)
            }
            RecordHeader::Data { len } => len as u32 + 1,
            RecordHeader::Meta { len } => META_FLAG | (len as u32 + 1),
        }
    }

    /// Bytes the record occupies including header and padding, when known.
    pub fn record_size(self) -> Option<usize> {
        match self {
            RecordHeader::InProgress { len, .. }
            | RecordHeader::Data { len }
            | RecordHeader::Meta { len } => Some(record_size(len)),
            RecordHeader::Eof => Some(RECORD_HEADER_LEN),
            RecordHeader::Unwritten => None,
        }
    }
}

pub fn record_size(payload_len: usize) -> usize {
    let raw = RECORD_HEADER_LEN + payload_len;
    (raw + RECORD_ALIGN - 1) & !(RECORD_ALIGN - 1)
}

pub fn crc32(payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(payload);
    hasher.finalize()
}

pub fn header_word(map: &MmapFile, offset: u64) -> Result<&AtomicU32> {
    map.atomic_u32(offset as usize)
}

/// Reads the record header at `offset`.
///
/// Running past the largest size the file may grow to reads as EOF; running past the part
/// the file has grown to so far reads as unwritten.
pub fn read_header(map: &MmapFile, offset: u64) -> Result<RecordHeader> {
    let end = offset as usize + RECORD_HEADER_LEN;
    if end > map.capacity() {
        return Ok(RecordHeader::Eof);
    }
    if !map.covers(end)? {
        return Ok(RecordHeader::Unwritten);
    }
    let word = header_word(map, offset)?.load(Ordering::Acquire);
    Ok(RecordHeader::decode(word))
}

/// Writes a complete record at `offset` and returns the offset following it.
///
/// The slot is first claimed as in-progress (length recorded so a crashed write can be
/// skipped later), then the payload is copied, then the header is committed with release
/// ordering.
pub fn write_record(map: &MmapFile, offset: u64, payload: &[u8], meta: bool) -> Result<u64> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(Error::PayloadTooLarge);
    }
    let size = record_size(payload.len());
    if !map.covers(offset as usize + size)? {
        return Err(Error::Corrupt("record exceeds mapping"));
    }
    let word = header_word(map, offset)?;
    let len = payload.len();
    word.store(RecordHeader::InProgress { len, meta }.encode(), Ordering::Release);
    map.atomic_u32(offset as usize + 4)?
        .store(crc32(payload), Ordering::Relaxed);
    map.write_bytes(offset as usize + RECORD_HEADER_LEN, payload)?;
    let committed = if meta {
        RecordHeader::Meta { len }
    } else {
        RecordHeader::Data { len }
    };
    word.store(committed.encode(), Ordering::Release);
    Ok(offset + size as u64)
}

/// Copies the payload of a committed data record and checks its CRC.
pub fn read_payload(map: &MmapFile, offset: u64, len: usize) -> Result<Vec<u8>> {
    let stored = map
        .atomic_u32(offset as usize + 4)?
        .load(Ordering::Relaxed);
    let payload = map.read_vec(offset as usize + RECORD_HEADER_LEN, len)?;
    if crc32(&payload) != stored {
        return Err(Error::Corrupt("excerpt crc mismatch"));
    }
    Ok(payload)
}

/// Walks forward from `offset` past `count` committed data records, skipping metadata.
///
/// Returns the offset of the data record reached, or `None` when an unwritten, in-progress
/// or EOF header is met first.
pub fn skip_data_records(map: &MmapFile, mut offset: u64, mut count: u64) -> Result<Option<u64>> {
    loop {
        match read_header(map, offset)? {
            RecordHeader::Meta { len } => offset += record_size(len) as u64,
            RecordHeader::Data { len } => {
                if count == 0 {
                    return Ok(Some(offset));
                }
                count -= 1;
                offset += record_size(len) as u64;
            }
            RecordHeader::Unwritten | RecordHeader::InProgress { .. } | RecordHeader::Eof => {
                return Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn header_words_round_trip_through_decode() {
        let cases = [
            RecordHeader::Unwritten,
            RecordHeader::Eof,
            RecordHeader::Data { len: 0 },
            RecordHeader::Data { len: 13 },
            RecordHeader::Meta { len: 128 },
            RecordHeader::InProgress { len: 7, meta: false },
            RecordHeader::InProgress { len: 64, meta: true },
        ];
        for header in cases {
            assert_eq!(RecordHeader::decode(header.encode()), header);
        }
        assert_ne!(RecordHeader::Data { len: 0 }.encode(), 0);
    }

    #[test]
    fn crc_matches_known_payload() {
        assert_eq!(crc32(b"hello"), 0x3610A686);
    }

    #[test]
    fn records_are_aligned() {
        assert_eq!(record_size(0), 8);
        assert_eq!(record_size(1), 16);
        assert_eq!(record_size(8), 16);
        assert_eq!(record_size(9), 24);
    }

    #[test]
    fn skip_passes_over_metadata() {
        let dir = tempdir().expect("tempdir");
        let map = MmapFile::create(&dir.path().join("records"), 4096).expect("create");
        let mut offset = 0;
        offset = write_record(&map, offset, b"first", false).expect("write");
        let second = write_record(&map, offset, &[0u8; 24], true).expect("meta");
        let after = write_record(&map, second, b"second", false).expect("write");

        assert_eq!(skip_data_records(&map, 0, 0).expect("skip"), Some(0));
        assert_eq!(skip_data_records(&map, 0, 1).expect("skip"), Some(second));
        assert_eq!(skip_data_records(&map, 0, 2).expect("skip"), None);
        assert_eq!(read_header(&map, after).expect("header"), RecordHeader::Unwritten);
        assert_eq!(read_payload(&map, second, 6).expect("payload"), b"second");
    }

    #[test]
    fn in_progress_record_blocks_scan() {
        let dir = tempdir().expect("tempdir");
        let map = MmapFile::create(&dir.path().join("records"), 4096).expect("create");
        header_word(&map, 0)
            .expect("word")
            .store(RecordHeader::InProgress { len: 4, meta: false }.encode(), Ordering::Release);
        assert_eq!(skip_data_records(&map, 0, 0).expect("skip"), None);
    }

    #[test]
    fn corrupted_payload_is_detected() {
        let dir = tempdir().expect("tempdir");
        let map = MmapFile::create(&dir.path().join("records"), 4096).expect("create");
        write_record(&map, 0, b"payload", false).expect("write");
        map.write_bytes(RECORD_HEADER_LEN, b"P").expect("flip");
        assert!(matches!(read_payload(&map, 0, 7), Err(Error::Corrupt(_))));
    }
}
