//! Segment file layout, naming, creation and discovery.
//!
//! Stateless helpers over paths and mappings; [`crate::segment_store::SegmentStore`] layers
//! the live behaviour on top.
//!
//! ```text
//! 0   magic u32          4   version u32
//! 8   cycle i32          12  reserved
//! 16  write position u64 (offset / 8 in the low 32 bits, sequence count in the high 32)
//! 24  last index u64     (sequence after the last indexed excerpt, 0 when none)
//! 32  index2index u64    (offset of the index2index array)
//! 40  index count u32    44  index spacing u32
//! 48  max size u64       (the file grows in place up to this many bytes)
//! 56  initial size u64   (the file grows in steps of this many bytes)
//! 64  index2index record, then index pages and excerpts interleaved, then EOF
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;

use crate::header::{record_size, write_record, RECORD_HEADER_LEN};
use crate::mmap::{publish_file, temp_path_for, MmapFile};
use crate::roll_cycle::RollCycle;
use crate::{Error, Result};

/// Segment magic number ('RQSG')
pub const SEG_MAGIC: u32 = 0x5251_5347;
pub const SEG_VERSION: u32 = 1;
pub const SEG_HEADER_SIZE: usize = 64;

pub(crate) const MAGIC_AT: usize = 0;
pub(crate) const VERSION_AT: usize = 4;
pub(crate) const CYCLE_AT: usize = 8;
pub(crate) const WRITE_POSITION_AT: usize = 16;
pub(crate) const LAST_INDEX_AT: usize = 24;
pub(crate) const INDEX2INDEX_AT: usize = 32;
pub(crate) const INDEX_COUNT_AT: usize = 40;
pub(crate) const INDEX_SPACING_AT: usize = 44;
pub(crate) const MAX_SIZE_AT: usize = 48;
pub(crate) const INITIAL_SIZE_AT: usize = 56;

/// Largest segment whose offsets fit the packed write position.
pub const MAX_SEGMENT_SIZE: usize = (u32::MAX as usize) * 8;

/// Where the next excerpt goes and how many excerpts precede it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WritePosition {
    pub offset: u64,
    pub sequence: u64,
}

impl WritePosition {
    pub fn new(offset: u64, sequence: u64) -> Self {
        Self { offset, sequence }
    }

    pub(crate) fn pack(self) -> Result<u64> {
        if self.offset % 8 != 0 || self.offset / 8 > u32::MAX as u64 {
            return Err(Error::Corrupt("write offset not representable"));
        }
        if self.sequence > u32::MAX as u64 {
            return Err(Error::Corrupt("sequence not representable"));
        }
        Ok((self.sequence << 32) | (self.offset / 8))
    }

    pub(crate) fn unpack(word: u64) -> Self {
        Self {
            offset: (word & u32::MAX as u64) * 8,
            sequence: word >> 32,
        }
    }
}

impl fmt::Display for WritePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.offset, self.sequence)
    }
}

/// Size and index geometry a new segment is created with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SegmentLayout {
    /// Bytes the file starts with.
    pub initial_size: usize,
    /// Bytes the file may grow to; every mapping reserves this much address space.
    pub max_size: usize,
    pub index_count: u32,
    pub index_spacing: u32,
}

impl SegmentLayout {
    /// A layout whose file never grows.
    pub fn fixed(size: usize, index_count: u32, index_spacing: u32) -> Self {
        Self {
            initial_size: size,
            max_size: size,
            index_count,
            index_spacing,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.max_size > MAX_SEGMENT_SIZE {
            return Err(Error::Unsupported("segment size exceeds 32 GiB"));
        }
        if self.initial_size > self.max_size {
            return Err(Error::Unsupported("initial segment size exceeds the maximum"));
        }
        if (self.initial_size as u64) < data_start(self.index_count) + RECORD_HEADER_LEN as u64 {
            return Err(Error::Unsupported("segment size too small for its index"));
        }
        Ok(())
    }
}

/// Static part of a segment header, read once when the file is mapped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SegmentHeader {
    pub cycle: i32,
    pub index_count: u32,
    pub index_spacing: u32,
    pub index2index: u64,
    pub initial_size: u64,
    pub max_size: u64,
}

impl SegmentHeader {
    /// Offset of the first excerpt in a fresh segment.
    pub fn data_start(&self) -> u64 {
        data_start(self.index_count)
    }
}

pub fn data_start(index_count: u32) -> u64 {
    (SEG_HEADER_SIZE + record_size(index_count as usize * 8)) as u64
}

// ============================================================================
// Naming and discovery
// ============================================================================

pub fn segment_path(dir: &Path, roll_cycle: &RollCycle, cycle: i32) -> Result<PathBuf> {
    Ok(dir.join(roll_cycle.file_name(cycle)?))
}

/// Cycles with a segment file in `dir`, ascending. Temp files and foreign names are ignored.
pub fn list_cycles(dir: &Path, roll_cycle: &RollCycle) -> Result<Vec<i32>> {
    let mut cycles = Vec::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(cycles),
        Err(err) => return Err(err.into()),
    };
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if let Some(cycle) = roll_cycle.parse_file_name(name) {
            cycles.push(cycle);
        }
    }
    cycles.sort_unstable();
    cycles.dedup();
    Ok(cycles)
}

// ============================================================================
// Creation and opening
// ============================================================================

/// Opens the segment at `path`, creating and publishing it first when absent.
///
/// Returns the mapping and whether this call created the file. Creation writes the header
/// and the empty index2index block into a temp file and publishes it with a no-replace
/// rename, so other processes never observe a half-initialised segment; losing the race
/// falls back to opening the winner's file.
pub fn open_or_create_segment(
    path: &Path,
    cycle: i32,
    layout: &SegmentLayout,
) -> Result<(MmapFile, bool)> {
    match open_segment(path, cycle) {
        Ok(map) => return Ok((map, false)),
        Err(Error::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }

    let temp = temp_path_for(path);
    let prepared = prepare_segment(&temp, cycle, layout);
    if let Err(err) = prepared {
        let _ = std::fs::remove_file(&temp);
        return Err(err);
    }
    match publish_file(&temp, path) {
        Ok(()) => {
            log::debug!("created segment {} for cycle {cycle}", path.display());
            Ok((open_segment(path, cycle)?, true))
        }
        Err(Error::Io(err)) if err.kind() == std::io::ErrorKind::AlreadyExists => {
            let _ = std::fs::remove_file(&temp);
            Ok((open_segment(path, cycle)?, false))
        }
        Err(err) => {
            let _ = std::fs::remove_file(&temp);
            Err(err)
        }
    }
}

fn prepare_segment(temp: &Path, cycle: i32, layout: &SegmentLayout) -> Result<()> {
    layout.validate()?;
    let start = data_start(layout.index_count);
    let map = MmapFile::create(temp, layout.initial_size)?;
    map.atomic_u32(VERSION_AT)?.store(SEG_VERSION, Ordering::Relaxed);
    map.atomic_u32(CYCLE_AT)?.store(cycle as u32, Ordering::Relaxed);
    map.atomic_u32(INDEX_COUNT_AT)?
        .store(layout.index_count, Ordering::Relaxed);
    map.atomic_u32(INDEX_SPACING_AT)?
        .store(layout.index_spacing, Ordering::Relaxed);
    map.atomic_u64(MAX_SIZE_AT)?
        .store(layout.max_size as u64, Ordering::Relaxed);
    map.atomic_u64(INITIAL_SIZE_AT)?
        .store(layout.initial_size as u64, Ordering::Relaxed);

    let i2i_record = SEG_HEADER_SIZE as u64;
    let index2index = vec![0u8; layout.index_count as usize * 8];
    let after = write_record(&map, i2i_record, &index2index, true)?;
    debug_assert_eq!(after, start);
    map.atomic_u64(INDEX2INDEX_AT)?
        .store(i2i_record + RECORD_HEADER_LEN as u64, Ordering::Relaxed);
    map.atomic_u64(WRITE_POSITION_AT)?
        .store(WritePosition::new(start, 0).pack()?, Ordering::Relaxed);
    map.atomic_u32(MAGIC_AT)?.store(SEG_MAGIC, Ordering::Release);
    map.flush_sync()?;
    Ok(())
}

/// Maps an existing segment, reserving its max size, and validates its header.
pub fn open_segment(path: &Path, cycle: i32) -> Result<MmapFile> {
    let first = MmapFile::open(path)?;
    let header = read_segment_header(&first)?;
    if header.cycle != cycle {
        return Err(Error::Corrupt("segment cycle does not match its file name"));
    }
    if header.max_size as usize <= first.capacity() {
        return Ok(first);
    }
    drop(first);
    let map = MmapFile::open_reserved(path, header.max_size as usize)?;
    read_segment_header(&map)?;
    Ok(map)
}

pub fn read_segment_header(map: &MmapFile) -> Result<SegmentHeader> {
    if map.len() < SEG_HEADER_SIZE {
        return Err(Error::Corrupt("segment too small for header"));
    }
    if map.atomic_u32(MAGIC_AT)?.load(Ordering::Acquire) != SEG_MAGIC {
        return Err(Error::Corrupt("segment magic mismatch"));
    }
    let version = map.atomic_u32(VERSION_AT)?.load(Ordering::Acquire);
    if version != SEG_VERSION {
        return Err(Error::UnsupportedVersion(version));
    }
    let header = SegmentHeader {
        cycle: map.atomic_u32(CYCLE_AT)?.load(Ordering::Acquire) as i32,
        index_count: map.atomic_u32(INDEX_COUNT_AT)?.load(Ordering::Acquire),
        index_spacing: map.atomic_u32(INDEX_SPACING_AT)?.load(Ordering::Acquire),
        index2index: map.atomic_u64(INDEX2INDEX_AT)?.load(Ordering::Acquire),
        initial_size: map.atomic_u64(INITIAL_SIZE_AT)?.load(Ordering::Acquire),
        max_size: map.atomic_u64(MAX_SIZE_AT)?.load(Ordering::Acquire),
    };
    if !header.index_count.is_power_of_two() || !header.index_spacing.is_power_of_two() {
        return Err(Error::Corrupt("segment index geometry is not a power of two"));
    }
    if header.data_start() as usize > map.len() {
        return Err(Error::Corrupt("segment index exceeds file"));
    }
    if header.max_size as usize > MAX_SEGMENT_SIZE || (header.max_size as usize) < map.len() {
        return Err(Error::Corrupt("segment max size does not cover the file"));
    }
    if header.initial_size == 0 || header.initial_size > header.max_size {
        return Err(Error::Corrupt("segment initial size out of range"));
    }
    Ok(header)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn write_position_packs_offset_and_sequence() {
        let pos = WritePosition::new(1 << 20, 12345);
        assert_eq!(WritePosition::unpack(pos.pack().expect("pack")), pos);
        assert!(WritePosition::new(3, 0).pack().is_err());
        assert!(WritePosition::new(8, 1 << 33).pack().is_err());
    }

    #[test]
    fn create_then_open_existing() {
        let dir = TempDir::new().expect("tempdir");
        let path = segment_path(dir.path(), &RollCycle::DAILY, 19_000).expect("path");
        let layout = SegmentLayout {
            initial_size: 64 * 1024,
            max_size: 1024 * 1024,
            index_count: 16,
            index_spacing: 4,
        };

        let (map, created) = open_or_create_segment(&path, 19_000, &layout).expect("create");
        assert!(created);
        let header = read_segment_header(&map).expect("header");
        assert_eq!(header.cycle, 19_000);
        assert_eq!(header.index_count, 16);
        assert_eq!(header.index_spacing, 4);
        assert_eq!(header.index2index, 72);
        assert_eq!(header.initial_size, 64 * 1024);
        assert_eq!(header.max_size, 1024 * 1024);
        assert_eq!(header.data_start(), 64 + 8 + 128);
        let pos = WritePosition::unpack(
            map.atomic_u64(WRITE_POSITION_AT)
                .expect("position")
                .load(Ordering::Acquire),
        );
        assert_eq!(pos, WritePosition::new(header.data_start(), 0));

        let (again, created) = open_or_create_segment(&path, 19_000, &layout).expect("open");
        assert!(!created);
        assert_eq!(again.len(), 64 * 1024);
        assert_eq!(again.capacity(), 1024 * 1024);
    }

    #[test]
    fn wrong_cycle_is_rejected() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("20240101.cq4");
        open_or_create_segment(&path, 7, &SegmentLayout::fixed(64 * 1024, 8, 1)).expect("create");
        assert!(matches!(open_segment(&path, 8), Err(Error::Corrupt(_))));
    }

    #[test]
    fn list_cycles_ignores_foreign_files() {
        let dir = TempDir::new().expect("tempdir");
        let rc = RollCycle::DAILY;
        for cycle in [5, 2, 9] {
            let path = segment_path(dir.path(), &rc, cycle).expect("path");
            open_or_create_segment(&path, cycle, &SegmentLayout::fixed(64 * 1024, 8, 1))
                .expect("create");
        }
        std::fs::write(dir.path().join("queue.meta"), b"x").expect("write");
        std::fs::write(dir.path().join("19700103.cq4.1-0.tmp"), b"x").expect("write");
        assert_eq!(list_cycles(dir.path(), &rc).expect("list"), vec![2, 5, 9]);
        assert!(list_cycles(&dir.path().join("missing"), &rc)
            .expect("list")
            .is_empty());
    }

    #[test]
    fn tiny_or_inverted_layouts_are_refused() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("19700101.cq4");
        assert!(matches!(
            open_or_create_segment(&path, 0, &SegmentLayout::fixed(128, 64, 4)),
            Err(Error::Unsupported(_))
        ));
        let inverted = SegmentLayout {
            max_size: 32 * 1024,
            ..SegmentLayout::fixed(64 * 1024, 8, 1)
        };
        assert!(matches!(
            open_or_create_segment(&path, 0, &inverted),
            Err(Error::Unsupported(_))
        ));
        assert!(!path.exists());
    }
}
