//! Two-level sparse index mapping an in-cycle sequence to the byte offset of its excerpt.
//!
//! The index2index array (allocated with the segment) holds `index_count` pointers to index
//! pages. Page `k` covers sequences `[k * index_count * index_spacing, (k + 1) * ...)` and
//! holds one offset per `index_spacing` excerpts. Pages are allocated lazily by the writer,
//! inside the lock-held section, as metadata records in the data stream. Entries never change
//! once written.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::header::{skip_data_records, write_record, RECORD_HEADER_LEN};
use crate::mmap::MmapFile;
use crate::segment::{SegmentHeader, LAST_INDEX_AT};
use crate::{Error, Result};

/// Outcome of positioning on an index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScanResult {
    /// Landed exactly on the requested excerpt.
    Found,
    /// The excerpt has not been written (yet).
    NotFound,
    /// No segment exists for the requested cycle.
    NoData,
}

/// Per-reader memory of the last resolved position, used to short-circuit short forward
/// moves. Only valid for the segment it was resolved in; reset it when changing cycle.
#[derive(Clone, Debug, Default)]
pub struct IndexCursor {
    last: Option<(u64, u64)>,
    move_count: u64,
}

impl IndexCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequence and offset of the last resolved excerpt.
    pub fn last(&self) -> Option<(u64, u64)> {
        self.last
    }

    /// Number of moves that had to go through the index rather than the short-circuit path.
    pub fn move_count(&self) -> u64 {
        self.move_count
    }

    pub fn reset(&mut self) {
        self.last = None;
    }

    pub(crate) fn set(&mut self, sequence: u64, offset: u64) {
        self.last = Some((sequence, offset));
    }
}

pub struct SparseIndex {
    index_count: u32,
    index_spacing: u32,
    index2index: u64,
    linear_scan_count: AtomicU64,
}

impl SparseIndex {
    pub fn new(header: &SegmentHeader) -> Self {
        Self {
            index_count: header.index_count,
            index_spacing: header.index_spacing,
            index2index: header.index2index,
            linear_scan_count: AtomicU64::new(0),
        }
    }

    pub fn index_count(&self) -> u32 {
        self.index_count
    }

    pub fn index_spacing(&self) -> u32 {
        self.index_spacing
    }

    pub fn index2index(&self) -> u64 {
        self.index2index
    }

    /// Index lookups that had to scan past the indexed excerpt to reach the target.
    pub fn linear_scan_count(&self) -> u64 {
        self.linear_scan_count.load(Ordering::Relaxed)
    }

    /// Sequences covered by one index page.
    pub fn sequences_per_page(&self) -> u64 {
        self.index_count as u64 * self.index_spacing as u64
    }

    fn page_of(&self, sequence: u64) -> u64 {
        sequence / self.sequences_per_page()
    }

    fn entry_of(&self, sequence: u64) -> u64 {
        (sequence / self.index_spacing as u64) % self.index_count as u64
    }

    fn page_slot<'a>(&self, map: &'a MmapFile, page: u64) -> Result<&'a AtomicU64> {
        if page >= self.index_count as u64 {
            return Err(Error::Corrupt("index page beyond index2index"));
        }
        map.atomic_u64((self.index2index + page * 8) as usize)
    }

    /// Offset of the index page array for `page`, if allocated.
    pub fn page_offset(&self, map: &MmapFile, page: u64) -> Result<Option<u64>> {
        if page >= self.index_count as u64 {
            return Ok(None);
        }
        let offset = self.page_slot(map, page)?.load(Ordering::Acquire);
        Ok((offset != 0).then_some(offset))
    }

    /// Recorded offset of the indexed excerpt at or before `sequence`.
    pub fn entry(&self, map: &MmapFile, sequence: u64) -> Result<Option<u64>> {
        let Some(page) = self.page_offset(map, self.page_of(sequence))? else {
            return Ok(None);
        };
        let slot = map.atomic_u64((page + self.entry_of(sequence) * 8) as usize)?;
        let offset = slot.load(Ordering::Acquire);
        Ok((offset != 0).then_some(offset))
    }

    // ============================================================================
    // Write side (queue lock held)
    // ============================================================================

    /// Makes sure the page covering `sequence` exists when `sequence` is to be indexed.
    ///
    /// A missing page is written as a metadata record at `write_offset`; the returned offset is
    /// where the excerpt itself must go.
    pub(crate) fn ensure_page(
        &self,
        map: &MmapFile,
        cycle: i32,
        sequence: u64,
        write_offset: u64,
    ) -> Result<u64> {
        if sequence % self.index_spacing as u64 != 0 {
            return Ok(write_offset);
        }
        let page = self.page_of(sequence);
        if page >= self.index_count as u64 {
            return Err(Error::CycleFull { cycle });
        }
        if self.page_offset(map, page)?.is_some() {
            return Ok(write_offset);
        }
        let payload = vec![0u8; self.index_count as usize * 8];
        let next = write_record(map, write_offset, &payload, true)
            .map_err(|err| match err {
                Error::Corrupt(_) => Error::SegmentFull { cycle },
                other => other,
            })?;
        self.page_slot(map, page)?
            .store(write_offset + RECORD_HEADER_LEN as u64, Ordering::Release);
        log::debug!("cycle {cycle}: allocated index page {page} at {write_offset}");
        Ok(next)
    }

    /// Records `offset` for `sequence` if it falls on the index spacing.
    pub(crate) fn record(&self, map: &MmapFile, sequence: u64, offset: u64) -> Result<()> {
        if sequence % self.index_spacing as u64 != 0 {
            return Ok(());
        }
        let Some(page) = self.page_offset(map, self.page_of(sequence))? else {
            return Err(Error::Corrupt("index page missing for indexed excerpt"));
        };
        let slot = map.atomic_u64((page + self.entry_of(sequence) * 8) as usize)?;
        if slot
            .compare_exchange(0, offset, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            map.atomic_u64(LAST_INDEX_AT)?
                .fetch_max(sequence + 1, Ordering::AcqRel);
        }
        Ok(())
    }

    pub fn last_index(&self, map: &MmapFile) -> Result<u64> {
        Ok(map.atomic_u64(LAST_INDEX_AT)?.load(Ordering::Acquire))
    }

    // ============================================================================
    // Read side
    // ============================================================================

    /// Positions `cursor` on the excerpt with in-cycle `sequence`.
    ///
    /// A forward move of less than `index_spacing` from the cursor's last position scans from
    /// there without touching the index. Anything else (including every backward move) reads
    /// the index entry at or below `sequence` and scans fewer than `index_spacing` excerpts.
    pub fn move_to_index(
        &self,
        map: &MmapFile,
        cursor: &mut IndexCursor,
        sequence: u64,
    ) -> Result<ScanResult> {
        if let Some((last_seq, last_offset)) = cursor.last {
            if sequence >= last_seq && sequence - last_seq < self.index_spacing as u64 {
                return Ok(
                    match skip_data_records(map, last_offset, sequence - last_seq)? {
                        Some(offset) => {
                            cursor.set(sequence, offset);
                            ScanResult::Found
                        }
                        None => ScanResult::NotFound,
                    },
                );
            }
        }

        cursor.move_count += 1;
        let Some(indexed) = self.entry(map, sequence)? else {
            return Ok(ScanResult::NotFound);
        };
        let remainder = sequence % self.index_spacing as u64;
        if remainder > 0 {
            self.linear_scan_count.fetch_add(1, Ordering::Relaxed);
        }
        match skip_data_records(map, indexed, remainder)? {
            Some(offset) => {
                cursor.set(sequence, offset);
                Ok(ScanResult::Found)
            }
            None => Ok(ScanResult::NotFound),
        }
    }
}
