//! One mapped cycle file: header, write position, sparse index and excerpt I/O.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::header::{
    header_word, read_header, read_payload, record_size, write_record, RecordHeader,
    MAX_PAYLOAD_LEN, RECORD_HEADER_LEN,
};
use crate::mmap::MmapFile;
use crate::segment::{
    open_or_create_segment, open_segment, read_segment_header, SegmentHeader, SegmentLayout,
    WritePosition, WRITE_POSITION_AT,
};
use crate::sparse_index::SparseIndex;
use crate::{Error, Result};

/// Cap on records rendered by [`SegmentStore::dump`].
const DUMP_RECORD_LIMIT: usize = 256;

/// Live view of one segment file.
///
/// Any number of processes may hold a `SegmentStore` over the same file. The write path
/// ([`SegmentStore::append`], [`SegmentStore::write_eof`]) must only run while holding the
/// queue lock; everything else is safe from any thread at any time.
pub struct SegmentStore {
    cycle: i32,
    path: PathBuf,
    map: MmapFile,
    header: SegmentHeader,
    index: SparseIndex,
    refs: AtomicUsize,
}

impl SegmentStore {
    pub fn open(path: &Path, cycle: i32) -> Result<Self> {
        Self::from_map(path, cycle, open_segment(path, cycle)?)
    }

    /// Opens the segment or creates it. The flag reports whether this call created it.
    pub fn open_or_create(path: &Path, cycle: i32, layout: &SegmentLayout) -> Result<(Self, bool)> {
        let (map, created) = open_or_create_segment(path, cycle, layout)?;
        Ok((Self::from_map(path, cycle, map)?, created))
    }

    fn from_map(path: &Path, cycle: i32, map: MmapFile) -> Result<Self> {
        let header = read_segment_header(&map)?;
        Ok(Self {
            cycle,
            path: path.to_path_buf(),
            index: SparseIndex::new(&header),
            header,
            map,
            refs: AtomicUsize::new(0),
        })
    }

    pub fn cycle(&self) -> i32 {
        self.cycle
    }

    pub fn file(&self) -> &Path {
        &self.path
    }

    /// The mapped region, for direct access to excerpt bytes.
    pub fn bytes(&self) -> &MmapFile {
        &self.map
    }

    pub fn index(&self) -> &SparseIndex {
        &self.index
    }

    pub fn header(&self) -> &SegmentHeader {
        &self.header
    }

    pub fn data_start(&self) -> u64 {
        self.header.data_start()
    }

    // ============================================================================
    // Reference counting
    // ============================================================================

    /// Registers one more holder and returns the new count.
    pub fn acquire(&self) -> usize {
        self.refs.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Drops one holder and returns the remaining count.
    pub fn release(&self) -> Result<usize> {
        self.refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |refs| refs.checked_sub(1))
            .map(|previous| previous - 1)
            .map_err(|_| {
                Error::InvalidState(format!("segment {} released too often", self.path.display()))
            })
    }

    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    // ============================================================================
    // Write position
    // ============================================================================

    fn position_word(&self) -> Result<&AtomicU64> {
        self.map.atomic_u64(WRITE_POSITION_AT)
    }

    /// Offset and sequence of the next excerpt, as published by the last writer.
    pub fn write_position(&self) -> Result<WritePosition> {
        Ok(WritePosition::unpack(
            self.position_word()?.load(Ordering::Acquire),
        ))
    }

    /// Committed excerpts in this segment.
    pub fn sequence_count(&self) -> Result<u64> {
        Ok(self.write_position()?.sequence)
    }

    /// Moves the write position forward, never backwards.
    fn advance_write_position(&self, next: WritePosition) -> Result<()> {
        let packed = next.pack()?;
        let word = self.position_word()?;
        let mut current = word.load(Ordering::Acquire);
        loop {
            if WritePosition::unpack(current).offset >= next.offset {
                if current != packed {
                    log::warn!(
                        "segment {}: write position moved concurrently to {} while advancing to {}",
                        self.path.display(),
                        WritePosition::unpack(current),
                        next
                    );
                }
                return Ok(());
            }
            match word.compare_exchange(current, packed, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    // ============================================================================
    // Write side (queue lock held)
    // ============================================================================

    /// Replays records a crashed writer left beyond the published write position.
    ///
    /// Committed excerpts are counted (and indexed if their entry is missing); an in-progress
    /// record is turned into metadata padding so readers can step over it.
    pub(crate) fn recover_tail(&self) -> Result<WritePosition> {
        let published = self.write_position()?;
        let mut pos = published;
        loop {
            let header = read_header(&self.map, pos.offset)?;
            let Some(size) = header.record_size() else {
                break;
            };
            if !self.map.covers(pos.offset as usize + size)? {
                break;
            }
            match header {
                RecordHeader::Data { .. } => {
                    if let Err(err) = self.index.record(&self.map, pos.sequence, pos.offset) {
                        log::warn!(
                            "segment {}: could not index recovered excerpt {}: {err}",
                            self.path.display(),
                            pos.sequence
                        );
                    }
                    pos.sequence += 1;
                }
                RecordHeader::Meta { .. } => {}
                RecordHeader::InProgress { len, .. } => {
                    log::warn!(
                        "segment {}: incomplete excerpt of {len} bytes at {} left by a dead writer, \
                         skipping it",
                        self.path.display(),
                        pos.offset
                    );
                    header_word(&self.map, pos.offset)?
                        .store(RecordHeader::Meta { len }.encode(), Ordering::Release);
                }
                RecordHeader::Eof | RecordHeader::Unwritten => break,
            }
            pos.offset += size as u64;
        }
        if pos != published {
            log::warn!(
                "segment {}: recovered write position {} (header had {})",
                self.path.display(),
                pos,
                published
            );
            self.advance_write_position(pos)?;
        }
        Ok(pos)
    }

    /// Grows the file so that `[0, end)` is backed, in steps of the segment's initial size
    /// and never past its max size.
    fn grow_for(&self, end: u64) -> Result<()> {
        if self.map.covers(end as usize)? {
            return Ok(());
        }
        let len = self.map.len() as u64;
        let step = self.header.initial_size;
        let target = (len + (end - len).div_ceil(step) * step).min(self.header.max_size);
        if target > len {
            self.map.grow_to(target as usize)?;
        }
        Ok(())
    }

    /// Appends one excerpt and returns its in-cycle sequence.
    ///
    /// The file grows as needed up to its max size. Returns `None` when the segment already
    /// carries an EOF marker; the caller must roll.
    pub(crate) fn append(&self, payload: &[u8], max_sequence: u64) -> Result<Option<u64>> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(Error::PayloadTooLarge);
        }
        let pos = self.recover_tail()?;
        if read_header(&self.map, pos.offset)? == RecordHeader::Eof {
            return Ok(None);
        }
        if pos.sequence >= max_sequence {
            return Err(Error::CycleFull { cycle: self.cycle });
        }

        // Room for an index page, the excerpt and the EOF marker after it.
        let page = record_size(self.index.index_count() as usize * 8);
        let worst = pos.offset + (page + record_size(payload.len()) + RECORD_HEADER_LEN) as u64;
        self.grow_for(worst)?;

        let offset = self
            .index
            .ensure_page(&self.map, self.cycle, pos.sequence, pos.offset)?;
        let record_end = offset + record_size(payload.len()) as u64;
        // Always leave room for the EOF marker.
        if !self.map.covers(record_end as usize + RECORD_HEADER_LEN)? {
            if offset != pos.offset {
                self.advance_write_position(WritePosition::new(offset, pos.sequence))?;
            }
            return Err(Error::SegmentFull { cycle: self.cycle });
        }
        let next = write_record(&self.map, offset, payload, false)?;
        self.index.record(&self.map, pos.sequence, offset)?;
        self.advance_write_position(WritePosition::new(next, pos.sequence + 1))?;
        Ok(Some(pos.sequence))
    }

    /// Seals the segment with an EOF marker at the write position. Returns `false` if it was
    /// already sealed.
    pub(crate) fn write_eof(&self) -> Result<bool> {
        let pos = self.recover_tail()?;
        if !self.map.covers(pos.offset as usize + RECORD_HEADER_LEN)? {
            return Ok(false);
        }
        let word = header_word(&self.map, pos.offset)?;
        let sealed = word
            .compare_exchange(0, RecordHeader::Eof.encode(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if sealed {
            log::debug!("segment {}: sealed at {}", self.path.display(), pos);
        }
        Ok(sealed)
    }

    pub fn is_sealed(&self) -> Result<bool> {
        let mut offset = self.write_position()?.offset;
        loop {
            match read_header(&self.map, offset)? {
                RecordHeader::Eof => return Ok(true),
                RecordHeader::Unwritten | RecordHeader::InProgress { .. } => return Ok(false),
                header => {
                    offset += header.record_size().unwrap_or(RECORD_HEADER_LEN) as u64;
                }
            }
        }
    }

    // ============================================================================
    // Read side
    // ============================================================================

    pub fn read_header(&self, offset: u64) -> Result<RecordHeader> {
        read_header(&self.map, offset)
    }

    pub fn read_payload(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        read_payload(&self.map, offset, len)
    }

    // ============================================================================
    // Diagnostics
    // ============================================================================

    /// Header and index as text.
    pub fn short_dump(&self) -> Result<String> {
        let mut out = String::new();
        let pos = self.write_position()?;
        let _ = writeln!(out, "--- segment {} (cycle {})", self.path.display(), self.cycle);
        let _ = writeln!(out, "writePosition: {pos}");
        let _ = writeln!(
            out,
            "indexing: {{ indexCount: {}, indexSpacing: {}, index2Index: {}, lastIndex: {} }}",
            self.index.index_count(),
            self.index.index_spacing(),
            self.index.index2index(),
            self.index.last_index(&self.map)?
        );
        for page in 0..self.index.index_count() as u64 {
            let Some(page_offset) = self.index.page_offset(&self.map, page)? else {
                continue;
            };
            let _ = write!(out, "index page {page} @ {page_offset}: [");
            let mut first = true;
            for entry in 0..self.index.index_count() as u64 {
                let value = self
                    .map
                    .atomic_u64((page_offset + entry * 8) as usize)?
                    .load(Ordering::Acquire);
                if value == 0 {
                    break;
                }
                if !first {
                    out.push_str(", ");
                }
                first = false;
                let _ = write!(out, "{value}");
            }
            out.push_str("]\n");
        }
        Ok(out)
    }

    /// Header, index and a listing of the records in the data region.
    pub fn dump(&self) -> Result<String> {
        let mut out = self.short_dump()?;
        let mut offset = self.data_start();
        let mut sequence = 0u64;
        for _ in 0..DUMP_RECORD_LIMIT {
            let header = read_header(&self.map, offset)?;
            match header {
                RecordHeader::Data { len } => {
                    let _ = writeln!(out, "# {offset}: excerpt {sequence}, {len} bytes");
                    sequence += 1;
                }
                RecordHeader::Meta { len } => {
                    let _ = writeln!(out, "# {offset}: metadata, {len} bytes");
                }
                RecordHeader::InProgress { len, .. } => {
                    let _ = writeln!(out, "# {offset}: in progress, {len} bytes");
                    return Ok(out);
                }
                RecordHeader::Eof => {
                    let _ = writeln!(out, "# {offset}: EOF");
                    return Ok(out);
                }
                RecordHeader::Unwritten => {
                    let _ = writeln!(out, "# {offset}: end of data");
                    return Ok(out);
                }
            }
            offset += header.record_size().unwrap_or(RECORD_HEADER_LEN) as u64;
        }
        let _ = writeln!(out, "# ... truncated after {DUMP_RECORD_LIMIT} records");
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sparse_index::{IndexCursor, ScanResult};
    use tempfile::TempDir;

    fn store_with(dir: &TempDir, layout: SegmentLayout) -> SegmentStore {
        let path = dir.path().join("19700101.cq4");
        SegmentStore::open_or_create(&path, 0, &layout)
            .expect("segment")
            .0
    }

    fn store(dir: &TempDir, size: usize, count: u32, spacing: u32) -> SegmentStore {
        store_with(dir, SegmentLayout::fixed(size, count, spacing))
    }

    #[test]
    fn append_advances_position_and_index() {
        let dir = TempDir::new().expect("tempdir");
        let store = store(&dir, 64 * 1024, 16, 4);
        let start = store.data_start();
        for i in 0..10u64 {
            let seq = store
                .append(format!("m{i}").as_bytes(), u64::MAX)
                .expect("append");
            assert_eq!(seq, Some(i));
        }
        let pos = store.write_position().expect("position");
        assert_eq!(pos.sequence, 10);
        assert!(pos.offset > start);
        assert_eq!(store.index().last_index(store.bytes()).expect("last index"), 9);

        let mut cursor = IndexCursor::new();
        assert_eq!(
            store
                .index()
                .move_to_index(store.bytes(), &mut cursor, 7)
                .expect("move"),
            ScanResult::Found
        );
        let (_, offset) = cursor.last().expect("positioned");
        assert_eq!(
            store.read_header(offset).expect("header"),
            RecordHeader::Data { len: 2 }
        );
        assert_eq!(store.read_payload(offset, 2).expect("payload"), b"m7");
    }

    #[test]
    fn eof_seals_the_segment() {
        let dir = TempDir::new().expect("tempdir");
        let store = store(&dir, 64 * 1024, 8, 1);
        store.append(b"one", u64::MAX).expect("append");
        assert!(!store.is_sealed().expect("sealed"));
        assert!(store.write_eof().expect("eof"));
        assert!(!store.write_eof().expect("eof"));
        assert!(store.is_sealed().expect("sealed"));
        assert_eq!(store.append(b"two", u64::MAX).expect("append"), None);
        assert_eq!(store.sequence_count().expect("count"), 1);
    }

    #[test]
    fn file_grows_in_steps_of_its_initial_size() {
        let dir = TempDir::new().expect("tempdir");
        let store = store_with(
            &dir,
            SegmentLayout {
                initial_size: 8 * 1024,
                max_size: 1024 * 1024,
                index_count: 8,
                index_spacing: 4,
            },
        );
        let payload = vec![3u8; 1000];
        for i in 0..100u64 {
            assert_eq!(store.append(&payload, u64::MAX).expect("append"), Some(i));
        }
        let file_len = std::fs::metadata(store.file()).expect("metadata").len();
        assert!(file_len > 100 * 1000);
        assert_eq!(file_len % (8 * 1024), 0);
        assert!(store.write_position().expect("position").offset < file_len);

        let reader = SegmentStore::open(store.file(), 0).expect("reader");
        let mut cursor = IndexCursor::new();
        assert_eq!(
            reader
                .index()
                .move_to_index(reader.bytes(), &mut cursor, 99)
                .expect("move"),
            ScanResult::Found
        );
        let (_, offset) = cursor.last().expect("positioned");
        assert_eq!(reader.read_payload(offset, 1000).expect("payload"), payload);
    }

    #[test]
    fn full_segment_is_reported_at_its_max_size() {
        let dir = TempDir::new().expect("tempdir");
        let store = store_with(
            &dir,
            SegmentLayout {
                initial_size: 4096,
                max_size: 16 * 1024,
                index_count: 8,
                index_spacing: 1,
            },
        );
        let payload = vec![1u8; 1000];
        let mut written = 0;
        let err = loop {
            match store.append(&payload, u64::MAX) {
                Ok(Some(_)) => written += 1,
                Ok(None) => panic!("unexpected seal"),
                Err(err) => break err,
            }
        };
        assert!(matches!(err, Error::SegmentFull { cycle: 0 }));
        assert!(written >= 8);
        assert_eq!(
            std::fs::metadata(store.file()).expect("metadata").len(),
            16 * 1024
        );
        assert!(store.write_eof().expect("eof"));
        assert!(store.is_sealed().expect("sealed"));
    }

    #[test]
    fn cycle_capacity_is_enforced() {
        let dir = TempDir::new().expect("tempdir");
        let store = store(&dir, 64 * 1024, 8, 1);
        store.append(b"a", 2).expect("append");
        store.append(b"b", 2).expect("append");
        assert!(matches!(
            store.append(b"c", 2),
            Err(Error::CycleFull { cycle: 0 })
        ));
    }

    #[test]
    fn recovers_records_past_a_stale_header() {
        let dir = TempDir::new().expect("tempdir");
        let store = store(&dir, 64 * 1024, 8, 2);
        store.append(b"zero", u64::MAX).expect("append");
        let stale = store.write_position().expect("position");

        // A writer that died after committing one excerpt and half-writing another.
        let after = write_record(store.bytes(), stale.offset, b"one", false).expect("record");
        header_word(store.bytes(), after)
            .expect("header word")
            .store(
                RecordHeader::InProgress { len: 5, meta: false }.encode(),
                Ordering::Release,
            );

        assert_eq!(store.append(b"two", u64::MAX).expect("append"), Some(2));
        assert_eq!(store.sequence_count().expect("count"), 3);
        assert_eq!(
            store.read_header(after).expect("header"),
            RecordHeader::Meta { len: 5 }
        );

        let mut cursor = IndexCursor::new();
        store
            .index()
            .move_to_index(store.bytes(), &mut cursor, 2)
            .expect("move");
        let (_, offset) = cursor.last().expect("positioned");
        assert_eq!(store.read_payload(offset, 3).expect("payload"), b"two");
    }

    #[test]
    fn reference_counting() {
        let dir = TempDir::new().expect("tempdir");
        let store = store(&dir, 64 * 1024, 8, 1);
        assert_eq!(store.acquire(), 1);
        assert_eq!(store.acquire(), 2);
        assert_eq!(store.release().expect("release"), 1);
        assert_eq!(store.release().expect("release"), 0);
        assert!(matches!(store.release(), Err(Error::InvalidState(_))));
    }

    #[test]
    fn dump_lists_header_index_and_records() {
        let dir = TempDir::new().expect("tempdir");
        let store = store(&dir, 64 * 1024, 8, 2);
        store.append(b"hello", u64::MAX).expect("append");
        store.append(b"world", u64::MAX).expect("append");
        store.write_eof().expect("eof");
        let short = store.short_dump().expect("short dump");
        assert!(short.contains("indexCount: 8, indexSpacing: 2"));
        assert!(short.contains("index page 0"));
        let dump = store.dump().expect("dump");
        assert!(dump.contains("excerpt 0, 5 bytes"));
        assert!(dump.contains("excerpt 1, 5 bytes"));
        assert!(dump.contains("EOF"));
    }
}
