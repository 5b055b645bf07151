//! The reading cursor.
//!
//! A tailer never blocks and never takes the queue lock. It reads committed excerpts straight
//! out of the shared mapping, stopping at the first record that is unwritten or still being
//! written, and crosses to the next cycle when the current one is sealed (or, for a segment
//! whose writer died before sealing it, when a later cycle already holds data).

use std::sync::Arc;

use crate::directory_listing::{NO_MAX_CYCLE, NO_MIN_CYCLE};
use crate::header::{skip_data_records, RecordHeader};
use crate::queue::{Direction, RollingQueue, SegmentHandle};
use crate::sparse_index::{IndexCursor, ScanResult};
use crate::table_store::MappedValue;
use crate::{Error, Result};

pub const TAILER_KEY_PREFIX: &str = "tailer.";
/// Value of a named tailer slot that has never been written.
pub const NO_POSITION: i64 = i64::MIN;

/// One excerpt read from the queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Excerpt {
    index: u64,
    payload: Vec<u8>,
}

impl Excerpt {
    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Position {
    /// Start of the queue, resolved on the next read.
    Start,
    /// Next excerpt to read.
    At { cycle: i32, sequence: u64 },
    /// A backward tailer has consumed the first excerpt of `cycle`.
    BeforeStart { cycle: i32 },
}

/// Segments after `after`, kept mapped while a forward reader waits at the end of an unsealed
/// cycle so that polling does not map and unmap them on every read.
struct LaterCycles {
    after: i32,
    cycles: Arc<Vec<i32>>,
    stores: Vec<SegmentHandle>,
}

pub struct Tailer {
    queue: Arc<RollingQueue>,
    direction: Direction,
    position: Position,
    store: Option<SegmentHandle>,
    later: Option<LaterCycles>,
    cursor: IndexCursor,
    persisted: Option<MappedValue>,
}

impl Tailer {
    pub(crate) fn new(queue: Arc<RollingQueue>, name: Option<&str>) -> Result<Self> {
        let persisted = match name {
            Some(name) => Some(
                queue
                    .table_store()
                    .acquire_value_for(&format!("{TAILER_KEY_PREFIX}{name}"), NO_POSITION)?,
            ),
            None => None,
        };
        let mut tailer = Self {
            queue,
            direction: Direction::Forward,
            position: Position::Start,
            store: None,
            later: None,
            cursor: IndexCursor::new(),
            persisted,
        };
        if let Some(value) = &tailer.persisted {
            let saved = value.get_volatile()?;
            if saved != NO_POSITION {
                tailer.seek(saved as u64)?;
            }
        }
        Ok(tailer)
    }

    pub fn queue(&self) -> &Arc<RollingQueue> {
        &self.queue
    }

    /// Sets the direction of subsequent reads.
    pub fn direction(&mut self, direction: Direction) -> &mut Self {
        self.direction = direction;
        self
    }

    pub fn read_direction(&self) -> Direction {
        self.direction
    }

    /// Index of the next excerpt to read (0 before the first read of an empty queue).
    pub fn index(&self) -> u64 {
        let rc = self.queue.roll_cycle();
        match self.position {
            Position::Start => 0,
            Position::At { cycle, sequence } => rc.to_index(cycle, sequence),
            Position::BeforeStart { cycle } => rc.to_index(cycle, 0).saturating_sub(1),
        }
    }

    /// Cycle the tailer is positioned in, if resolved.
    pub fn cycle(&self) -> Option<i32> {
        match self.position {
            Position::Start => None,
            Position::At { cycle, .. } | Position::BeforeStart { cycle } => Some(cycle),
        }
    }

    /// Moves that had to consult the sparse index.
    pub fn index_move_count(&self) -> u64 {
        self.cursor.move_count()
    }

    /// Positions on the first excerpt of the first cycle.
    pub fn to_start(&mut self) -> Result<&mut Self> {
        self.queue.check_open()?;
        let first = self.queue.first_cycle()?;
        self.position = if first == NO_MIN_CYCLE {
            Position::Start
        } else {
            Position::At {
                cycle: first,
                sequence: 0,
            }
        };
        self.persist()?;
        Ok(self)
    }

    /// Forward: positions after the last committed excerpt. Backward: positions on the last
    /// excerpt, skipping trailing cycles that hold none (e.g. created by a pretoucher).
    pub fn to_end(&mut self) -> Result<&mut Self> {
        self.queue.check_open()?;
        let last = self.queue.last_cycle()?;
        if last == NO_MAX_CYCLE {
            self.position = Position::Start;
            return Ok(self);
        }
        let count = self.queue.sequence_count(last)?.unwrap_or(0);
        self.position = match self.direction {
            Direction::Forward => Position::At {
                cycle: last,
                sequence: count,
            },
            Direction::Backward if count > 0 => Position::At {
                cycle: last,
                sequence: count - 1,
            },
            Direction::Backward => match self.previous_with_data(last)? {
                Some((cycle, sequence)) => Position::At { cycle, sequence },
                None => Position::BeforeStart { cycle: last },
            },
        };
        self.persist()?;
        Ok(self)
    }

    /// Positions on `index`. Returns whether an excerpt exists there; the tailer is positioned
    /// on `index` either way, so a later read picks it up once it is written.
    pub fn move_to_index(&mut self, index: u64) -> Result<bool> {
        self.queue.check_open()?;
        let found = self.seek(index)?;
        self.persist()?;
        Ok(found)
    }

    fn seek(&mut self, index: u64) -> Result<bool> {
        let rc = self.queue.roll_cycle();
        let (cycle, sequence) = (rc.to_cycle(index), rc.to_sequence(index));
        self.position = Position::At { cycle, sequence };
        if !self.switch_to(cycle)? {
            return Ok(false);
        }
        Ok(self.locate(sequence)? == ScanResult::Found)
    }

    /// Reads the next excerpt in the current direction, or `None` when nothing is available.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidState`: the queue is closed
    /// - `Error::Corrupt`: an excerpt failed its CRC check
    pub fn reading_document(&mut self) -> Result<Option<Excerpt>> {
        self.queue.check_open()?;
        let excerpt = match self.direction {
            Direction::Forward => self.read_forward()?,
            Direction::Backward => self.read_backward()?,
        };
        if excerpt.is_some() {
            self.persist()?;
        }
        Ok(excerpt)
    }

    fn read_forward(&mut self) -> Result<Option<Excerpt>> {
        loop {
            let (cycle, sequence) = match self.position {
                Position::Start => {
                    let first = self.queue.first_cycle()?;
                    if first == NO_MIN_CYCLE {
                        return Ok(None);
                    }
                    (first, 0)
                }
                Position::BeforeStart { cycle } => (cycle, 0),
                Position::At { cycle, sequence } => (cycle, sequence),
            };
            self.position = Position::At { cycle, sequence };

            if self.switch_to(cycle)? {
                if let Some(excerpt) = self.read_at(cycle, sequence)? {
                    self.position = Position::At {
                        cycle,
                        sequence: sequence + 1,
                    };
                    return Ok(Some(excerpt));
                }
                if !self.cycle_finished(cycle)? {
                    return Ok(None);
                }
            }
            match self.queue.next_cycle(cycle, Direction::Forward)? {
                Some(next) => {
                    self.position = Position::At {
                        cycle: next,
                        sequence: 0,
                    }
                }
                None => return Ok(None),
            }
        }
    }

    fn read_backward(&mut self) -> Result<Option<Excerpt>> {
        loop {
            let (cycle, sequence) = match self.position {
                Position::Start => {
                    let first = self.queue.first_cycle()?;
                    if first == NO_MIN_CYCLE {
                        return Ok(None);
                    }
                    (first, 0)
                }
                Position::BeforeStart { cycle } => match self.previous_with_data(cycle)? {
                    Some(previous) => previous,
                    None => return Ok(None),
                },
                Position::At { cycle, sequence } => (cycle, sequence),
            };
            self.position = Position::At { cycle, sequence };

            if !self.switch_to(cycle)? {
                self.position = Position::BeforeStart { cycle };
                continue;
            }
            if let Some(excerpt) = self.read_at(cycle, sequence)? {
                self.position = match sequence.checked_sub(1) {
                    Some(sequence) => Position::At { cycle, sequence },
                    None => Position::BeforeStart { cycle },
                };
                return Ok(Some(excerpt));
            }
            let count = self.current_store()?.sequence_count()?;
            if count == 0 {
                self.position = Position::BeforeStart { cycle };
            } else if sequence >= count {
                self.position = Position::At {
                    cycle,
                    sequence: count - 1,
                };
            } else {
                return Ok(None);
            }
        }
    }

    // ============================================================================
    // Segment access
    // ============================================================================

    fn current_store(&self) -> Result<&SegmentHandle> {
        self.store
            .as_ref()
            .ok_or_else(|| Error::InvalidState("tailer has no segment".to_string()))
    }

    /// Makes the segment for `cycle` current. Returns `false` when it does not exist.
    fn switch_to(&mut self, cycle: i32) -> Result<bool> {
        if self.store.as_ref().map(|store| store.cycle()) == Some(cycle) {
            return Ok(true);
        }
        if let Some(previous) = self.store.take() {
            self.queue.release(previous)?;
        }
        self.cursor.reset();
        let watched = self.later.as_mut().and_then(|later| {
            let at = later.stores.iter().position(|store| store.cycle() == cycle)?;
            Some(later.stores.swap_remove(at))
        });
        self.release_later()?;
        self.store = match watched {
            Some(store) => Some(store),
            None => self
                .queue
                .store_for_cycle(cycle, self.queue.epoch(), false)?,
        };
        Ok(self.store.is_some())
    }

    fn release_all(&self, stores: Vec<SegmentHandle>) -> Result<()> {
        let mut first_err = None;
        for store in stores {
            if let Err(err) = self.queue.release(store) {
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    fn release_later(&mut self) -> Result<()> {
        match self.later.take() {
            Some(later) => self.release_all(later.stores),
            None => Ok(()),
        }
    }

    /// Maps every existing cycle after `cycle` into the watch list, unless the list already
    /// covers the current set of cycles.
    fn watch_later(&mut self, cycle: i32) -> Result<()> {
        let cycles = self.queue.cycles()?;
        if let Some(later) = &self.later {
            if later.after == cycle && Arc::ptr_eq(&later.cycles, &cycles) {
                return Ok(());
            }
        }
        self.release_later()?;
        let mut stores = Vec::new();
        for &next in cycles.iter().filter(|&&next| next > cycle) {
            match self.queue.store_for_cycle(next, self.queue.epoch(), false) {
                Ok(Some(store)) => stores.push(store),
                Ok(None) => {}
                Err(err) => {
                    self.release_all(stores)?;
                    return Err(err);
                }
            }
        }
        self.later = Some(LaterCycles {
            after: cycle,
            cycles,
            stores,
        });
        Ok(())
    }

    /// Positions the cursor on `sequence` of the current segment.
    fn locate(&mut self, sequence: u64) -> Result<ScanResult> {
        let Some(store) = self.store.as_ref() else {
            return Ok(ScanResult::NoData);
        };
        let result = store
            .index()
            .move_to_index(store.bytes(), &mut self.cursor, sequence)?;
        if result != ScanResult::NotFound || sequence >= store.sequence_count()? {
            return Ok(result);
        }
        // Committed but not reachable through the index (an entry a crashed writer never
        // filled in): walk from the start of the data.
        match skip_data_records(store.bytes(), store.data_start(), sequence)? {
            Some(offset) => {
                self.cursor.set(sequence, offset);
                Ok(ScanResult::Found)
            }
            None => Ok(ScanResult::NotFound),
        }
    }

    fn read_at(&mut self, cycle: i32, sequence: u64) -> Result<Option<Excerpt>> {
        if self.locate(sequence)? != ScanResult::Found {
            return Ok(None);
        }
        let Some((_, offset)) = self.cursor.last() else {
            return Ok(None);
        };
        let store = self.current_store()?;
        let RecordHeader::Data { len } = store.read_header(offset)? else {
            return Err(Error::Corrupt("index points at a non-data record"));
        };
        Ok(Some(Excerpt {
            index: self.queue.roll_cycle().to_index(cycle, sequence),
            payload: store.read_payload(offset, len)?,
        }))
    }

    /// Whether a forward reader that has consumed every committed excerpt of `cycle` may move
    /// on: the segment is sealed, or a later cycle holds data.
    fn cycle_finished(&mut self, cycle: i32) -> Result<bool> {
        if self.current_store()?.is_sealed()? {
            return Ok(true);
        }
        self.watch_later(cycle)?;
        let Some(later) = &self.later else {
            return Ok(false);
        };
        for store in &later.stores {
            if store.sequence_count()? > 0 {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Last excerpt of the nearest earlier cycle that holds any.
    fn previous_with_data(&self, cycle: i32) -> Result<Option<(i32, u64)>> {
        let mut earlier = cycle;
        while let Some(previous) = self.queue.next_cycle(earlier, Direction::Backward)? {
            let count = self.queue.sequence_count(previous)?.unwrap_or(0);
            if count > 0 {
                return Ok(Some((previous, count - 1)));
            }
            earlier = previous;
        }
        Ok(None)
    }

    fn persist(&self) -> Result<()> {
        if let (Some(value), Position::At { .. }) = (&self.persisted, self.position) {
            value.set_value(self.index() as i64)?;
        }
        Ok(())
    }
}

impl Drop for Tailer {
    fn drop(&mut self) {
        if let Some(store) = self.store.take() {
            if let Err(err) = self.queue.release(store) {
                log::warn!("tailer failed to release segment: {err}");
            }
        }
        if let Err(err) = self.release_later() {
            log::warn!("tailer failed to release watched segments: {err}");
        }
    }
}
