//! Rolling queue: cycle arithmetic, the per-process segment arena and queue-wide shared state.
//!
//! # Design
//!
//! A queue directory holds one segment file per cycle plus the table store:
//! ```text
//! {queue_dir}/
//!   queue.meta       ← lock slot, directory listing bounds, named tailer positions
//!   20240101.cq4     ← cycle 19723
//!   20240102.cq4     ← cycle 19724 (current)
//! ```
//!
//! Every process opens its own `RollingQueue` over the directory. Segments are mapped once per
//! process and shared by all appenders, tailers and pretouchers through [`SegmentHandle`]s;
//! a mapping is dropped when its last handle is released.

use std::collections::HashMap;
use std::fmt;
use std::fmt::Write as _;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::appender::Appender;
use crate::clock::{Clock, SystemClock};
use crate::directory_listing::{DirectoryListing, TableDirectoryListing, NO_MAX_CYCLE};
use crate::mmap::PAGE_SIZE;
use crate::pretoucher::Pretoucher;
use crate::queue_lock::{LockConfig, TableStoreQueueLock};
use crate::roll_cycle::RollCycle;
use crate::segment::{data_start, segment_path, SegmentLayout, MAX_SEGMENT_SIZE};
use crate::segment_store::SegmentStore;
use crate::table_store::TableStore;
use crate::tailer::Tailer;
use crate::{Error, Result};

pub const DEFAULT_SEGMENT_SIZE: usize = 64 * 1024 * 1024;
pub const DEFAULT_MAX_SEGMENT_SIZE: usize = 4 * 1024 * 1024 * 1024;

/// Which way a tailer walks the queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Forward,
    Backward,
}

/// Observer of segment acquisition and release, one call per handle.
pub trait StoreListener: Send + Sync {
    fn on_acquired(&self, _cycle: i32, _file: &Path) {}
    fn on_released(&self, _cycle: i32, _file: &Path) {}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PretouchConfig {
    /// How far ahead of "now" the next cycle is acquired when `early_acquire_next_cycle` is set.
    pub preroll: Duration,
    pub early_acquire_next_cycle: bool,
    /// Bytes beyond the write position kept faulted in.
    pub touch_ahead: usize,
}

impl Default for PretouchConfig {
    fn default() -> Self {
        Self {
            preroll: Duration::from_millis(2_000),
            early_acquire_next_cycle: false,
            touch_ahead: 256 * 1024,
        }
    }
}

#[derive(Clone)]
pub struct QueueConfig {
    pub roll_cycle: RollCycle,
    pub epoch_ms: i64,
    /// Bytes a segment file starts with; it grows in steps of this size as excerpts need
    /// room. Must be a multiple of the page size.
    pub segment_size: usize,
    /// Bytes a segment file may grow to, at most 32 GiB. Every mapping reserves this much
    /// address space; appends beyond it fail with `SegmentFull`.
    pub max_segment_size: usize,
    /// Overrides the roll cycle's default index count.
    pub index_count: Option<u32>,
    /// Overrides the roll cycle's default index spacing.
    pub index_spacing: Option<u32>,
    pub lock: LockConfig,
    pub pretouch: PretouchConfig,
    pub clock: Arc<dyn Clock>,
    pub store_listener: Option<Arc<dyn StoreListener>>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            roll_cycle: RollCycle::DAILY,
            epoch_ms: 0,
            segment_size: DEFAULT_SEGMENT_SIZE,
            max_segment_size: DEFAULT_MAX_SEGMENT_SIZE,
            index_count: None,
            index_spacing: None,
            lock: LockConfig::default(),
            pretouch: PretouchConfig::default(),
            clock: Arc::new(SystemClock),
            store_listener: None,
        }
    }
}

impl fmt::Debug for QueueConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueConfig")
            .field("roll_cycle", &self.roll_cycle.name)
            .field("epoch_ms", &self.epoch_ms)
            .field("segment_size", &self.segment_size)
            .field("max_segment_size", &self.max_segment_size)
            .field("index_count", &self.index_count)
            .field("index_spacing", &self.index_spacing)
            .field("lock", &self.lock)
            .field("pretouch", &self.pretouch)
            .finish_non_exhaustive()
    }
}

impl QueueConfig {
    pub fn index_count(&self) -> u32 {
        self.index_count
            .unwrap_or(self.roll_cycle.default_index_count)
    }

    pub fn index_spacing(&self) -> u32 {
        self.index_spacing
            .unwrap_or(self.roll_cycle.default_index_spacing)
    }

    pub fn segment_layout(&self) -> SegmentLayout {
        SegmentLayout {
            initial_size: self.segment_size,
            max_size: self.max_segment_size,
            index_count: self.index_count(),
            index_spacing: self.index_spacing(),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.roll_cycle.length_ms <= 0 {
            return Err(Error::Unsupported("roll cycle length must be positive"));
        }
        let count = self.index_count();
        let spacing = self.index_spacing();
        if !count.is_power_of_two() || !spacing.is_power_of_two() {
            return Err(Error::Unsupported(
                "index count and spacing must be powers of two",
            ));
        }
        if self.segment_size % PAGE_SIZE != 0 || self.max_segment_size % PAGE_SIZE != 0 {
            return Err(Error::Unsupported(
                "segment sizes must be multiples of the page size",
            ));
        }
        if self.max_segment_size > MAX_SEGMENT_SIZE {
            return Err(Error::Unsupported("segment size exceeds 32 GiB"));
        }
        if self.segment_size > self.max_segment_size {
            return Err(Error::Unsupported(
                "segment size exceeds the max segment size",
            ));
        }
        if (self.segment_size as u64) < data_start(count) + PAGE_SIZE as u64 {
            return Err(Error::Unsupported("segment size too small for its index"));
        }
        if self.lock.timeout.is_zero() {
            return Err(Error::Unsupported("lock timeout must be non-zero"));
        }
        Ok(())
    }
}

/// A counted reference to a mapped segment.
///
/// Obtained from [`RollingQueue::store_for_cycle`] and returned with [`RollingQueue::release`];
/// the mapping is dropped when the last handle for its cycle is released.
#[must_use = "segment handles must be returned with RollingQueue::release"]
pub struct SegmentHandle {
    store: Arc<SegmentStore>,
}

impl Deref for SegmentHandle {
    type Target = SegmentStore;

    fn deref(&self) -> &SegmentStore {
        &self.store
    }
}

impl fmt::Debug for SegmentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentHandle")
            .field("cycle", &self.store.cycle())
            .field("file", &self.store.file())
            .finish()
    }
}

#[derive(Default)]
struct CycleCache {
    mod_count: Option<i64>,
    cycles: Arc<Vec<i32>>,
}

pub struct RollingQueue {
    dir: PathBuf,
    config: QueueConfig,
    table: Arc<TableStore>,
    listing: TableDirectoryListing,
    lock: TableStoreQueueLock,
    stores: Mutex<HashMap<i32, Arc<SegmentStore>>>,
    cycle_cache: Mutex<CycleCache>,
    closed: AtomicBool,
}

impl RollingQueue {
    /// Opens (or creates) the queue in `dir` with a daily roll cycle and the system clock.
    pub fn open(dir: impl AsRef<Path>) -> Result<Arc<Self>> {
        Self::open_with_config(dir, QueueConfig::default())
    }

    /// Opens (or creates) the queue in `dir`.
    ///
    /// # Errors
    ///
    /// - `Error::Unsupported`: invalid configuration
    /// - `Error::Io`: the directory or table store could not be created
    /// - `Error::Corrupt` / `Error::UnsupportedVersion`: the table store is not ours
    pub fn open_with_config(dir: impl AsRef<Path>, config: QueueConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let table = TableStore::open(&dir)?;
        let listing = TableDirectoryListing::new(&dir, config.roll_cycle, &table)?;
        listing.init()?;
        let lock = TableStoreQueueLock::new(&table, config.lock)?;
        log::debug!(
            "opened queue {} ({} cycles, index {}x{})",
            dir.display(),
            config.roll_cycle,
            config.index_count(),
            config.index_spacing()
        );

        Ok(Arc::new(Self {
            dir,
            config,
            table,
            listing,
            lock,
            stores: Mutex::new(HashMap::new()),
            cycle_cache: Mutex::new(CycleCache::default()),
            closed: AtomicBool::new(false),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn roll_cycle(&self) -> &RollCycle {
        &self.config.roll_cycle
    }

    pub fn epoch(&self) -> i64 {
        self.config.epoch_ms
    }

    pub fn index_count(&self) -> u32 {
        self.config.index_count()
    }

    pub fn index_spacing(&self) -> u32 {
        self.config.index_spacing()
    }

    pub fn clock(&self) -> &dyn Clock {
        self.config.clock.as_ref()
    }

    pub fn table_store(&self) -> &Arc<TableStore> {
        &self.table
    }

    pub fn directory_listing(&self) -> &TableDirectoryListing {
        &self.listing
    }

    pub fn queue_lock(&self) -> &TableStoreQueueLock {
        &self.lock
    }

    /// Closes the queue. Mapped segments stay alive until their handles are released, but every
    /// further operation on the queue, its lock or its table store fails with `InvalidState`.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.table.close();
        self.lock_stores().clear();
        log::debug!("closed queue {}", self.dir.display());
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::closed("queue"));
        }
        Ok(())
    }

    // ============================================================================
    // Cycles
    // ============================================================================

    /// Cycle of "now" according to the configured clock.
    pub fn cycle(&self) -> i32 {
        self.cycle_at(self.config.clock.now_ms())
    }

    pub fn cycle_at(&self, time_ms: i64) -> i32 {
        self.config.roll_cycle.cycle_at(time_ms, self.config.epoch_ms)
    }

    /// Lowest cycle with a segment, or `NO_MIN_CYCLE` (`i32::MAX`) when there is none.
    pub fn first_cycle(&self) -> Result<i32> {
        self.check_open()?;
        self.listing.min_created_cycle()
    }

    /// Highest cycle with a segment, or `NO_MAX_CYCLE` (`i32::MIN`) when there is none.
    pub fn last_cycle(&self) -> Result<i32> {
        self.check_open()?;
        self.listing.max_created_cycle()
    }

    /// Every cycle with a segment, ascending. Rescans the directory only when the listing's
    /// modification count has moved since the last call.
    pub fn cycles(&self) -> Result<Arc<Vec<i32>>> {
        self.check_open()?;
        let mod_count = self.listing.mod_count()?;
        let mut cache = self
            .cycle_cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if cache.mod_count != Some(mod_count) {
            cache.cycles = Arc::new(self.listing.cycles()?);
            cache.mod_count = Some(mod_count);
        }
        Ok(Arc::clone(&cache.cycles))
    }

    /// Nearest existing cycle strictly beyond `current` in `direction`. Never creates one.
    pub fn next_cycle(&self, current: i32, direction: Direction) -> Result<Option<i32>> {
        let cycles = self.cycles()?;
        Ok(match direction {
            Direction::Forward => {
                let at = cycles.partition_point(|&cycle| cycle <= current);
                cycles.get(at).copied()
            }
            Direction::Backward => {
                let at = cycles.partition_point(|&cycle| cycle < current);
                at.checked_sub(1).map(|at| cycles[at])
            }
        })
    }

    // ============================================================================
    // Segment arena
    // ============================================================================

    fn lock_stores(&self) -> MutexGuard<'_, HashMap<i32, Arc<SegmentStore>>> {
        self.stores
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns a handle on the segment for `cycle`, mapping it if this process has not already.
    ///
    /// With `create` the segment file is created when absent (callers hold the queue lock);
    /// without it an absent segment yields `None`.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidState`: the queue is closed, or `epoch_ms` is not the queue's epoch
    /// - `Error::Corrupt`: the file exists but is not a valid segment for `cycle`
    pub fn store_for_cycle(
        &self,
        cycle: i32,
        epoch_ms: i64,
        create: bool,
    ) -> Result<Option<SegmentHandle>> {
        self.check_open()?;
        if epoch_ms != self.config.epoch_ms {
            return Err(Error::InvalidState(format!(
                "epoch {epoch_ms} does not match queue epoch {}",
                self.config.epoch_ms
            )));
        }
        let mut stores = self.lock_stores();
        let store = match stores.get(&cycle) {
            Some(store) => Arc::clone(store),
            None => {
                let Some(store) = self.map_store(cycle, create)? else {
                    return Ok(None);
                };
                let store = Arc::new(store);
                stores.insert(cycle, Arc::clone(&store));
                log::debug!("mapped segment {} (cycle {cycle})", store.file().display());
                store
            }
        };
        store.acquire();
        drop(stores);
        if let Some(listener) = &self.config.store_listener {
            listener.on_acquired(cycle, store.file());
        }
        Ok(Some(SegmentHandle { store }))
    }

    fn map_store(&self, cycle: i32, create: bool) -> Result<Option<SegmentStore>> {
        let path = segment_path(&self.dir, &self.config.roll_cycle, cycle)?;
        if !create {
            return match SegmentStore::open(&path, cycle) {
                Ok(store) => Ok(Some(store)),
                Err(Error::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(err) => Err(err),
            };
        }
        let (store, created) =
            SegmentStore::open_or_create(&path, cycle, &self.config.segment_layout())?;
        if created {
            self.listing.on_file_created(&path, cycle)?;
        }
        Ok(Some(store))
    }

    /// Returns a handle; unmaps the segment once no handle for it remains.
    pub fn release(&self, handle: SegmentHandle) -> Result<()> {
        let SegmentHandle { store } = handle;
        let cycle = store.cycle();
        {
            let mut stores = self.lock_stores();
            if store.release()? == 0 {
                if let Some(mapped) = stores.get(&cycle) {
                    if Arc::ptr_eq(mapped, &store) {
                        stores.remove(&cycle);
                        log::debug!("unmapped segment {} (cycle {cycle})", store.file().display());
                    }
                }
            }
        }
        if let Some(listener) = &self.config.store_listener {
            listener.on_released(cycle, store.file());
        }
        Ok(())
    }

    /// Number of segments currently mapped by this process.
    pub fn mapped_segments(&self) -> usize {
        self.lock_stores().len()
    }

    /// Runs `f` on the segment for `cycle` without creating it; `None` when it does not exist.
    pub(crate) fn with_store<T>(
        &self,
        cycle: i32,
        f: impl FnOnce(&SegmentStore) -> Result<T>,
    ) -> Result<Option<T>> {
        let Some(handle) = self.store_for_cycle(cycle, self.config.epoch_ms, false)? else {
            return Ok(None);
        };
        let result = f(&handle);
        self.release(handle)?;
        result.map(Some)
    }

    /// Committed excerpts in `cycle`, or `None` when it has no segment.
    pub fn sequence_count(&self, cycle: i32) -> Result<Option<u64>> {
        self.with_store(cycle, |store| store.sequence_count())
    }

    // ============================================================================
    // Counting and diagnostics
    // ============================================================================

    /// Excerpts between two indices, `from` inclusive and `to` exclusive (swapped if reversed).
    ///
    /// Every cycle strictly between the two is opened to read its count, so spanning many
    /// cycles is expensive.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidState`: a cycle holding `from`, `to` or an intermediate count has no
    ///   segment
    pub fn count_excerpts(&self, from_index: u64, to_index: u64) -> Result<u64> {
        let rc = &self.config.roll_cycle;
        // Raw indices of cycles before the epoch sort above every later cycle.
        let position = |index: u64| (rc.to_cycle(index), rc.to_sequence(index));
        let (from, to) = (position(from_index), position(to_index));
        let ((from_cycle, from_seq), (to_cycle, to_seq)) =
            if from > to { (to, from) } else { (from, to) };
        if from_cycle == to_cycle {
            return Ok(to_seq - from_seq);
        }

        let count_of = |cycle: i32| -> Result<u64> {
            self.sequence_count(cycle)?.ok_or_else(|| {
                Error::InvalidState(format!("cannot count excerpts: no segment for cycle {cycle}"))
            })
        };
        let mut count = count_of(from_cycle)?.saturating_sub(from_seq);
        for &cycle in self.cycles()?.iter() {
            if cycle > from_cycle && cycle < to_cycle {
                count += count_of(cycle)?;
            }
        }
        if self.sequence_count(to_cycle)?.is_none() {
            return Err(Error::InvalidState(format!(
                "cannot count excerpts: no segment for cycle {to_cycle}"
            )));
        }
        Ok(count + to_seq)
    }

    /// Total committed excerpts over all cycles.
    pub fn entry_count(&self) -> Result<u64> {
        let mut total = 0;
        for &cycle in self.cycles()?.iter() {
            total += self.sequence_count(cycle)?.unwrap_or(0);
        }
        Ok(total)
    }

    /// Table store and every segment as text.
    pub fn dump(&self) -> Result<String> {
        let mut out = self.table.dump()?;
        for &cycle in self.cycles()?.iter() {
            if let Some(text) = self.with_store(cycle, |store| store.dump())? {
                out.push_str(&text);
            } else {
                let _ = writeln!(out, "--- cycle {cycle} vanished during dump");
            }
        }
        Ok(out)
    }

    // ============================================================================
    // Cursors
    // ============================================================================

    pub fn acquire_appender(self: &Arc<Self>) -> Result<Appender> {
        self.check_open()?;
        Ok(Appender::new(Arc::clone(self)))
    }

    pub fn create_tailer(self: &Arc<Self>) -> Result<Tailer> {
        self.check_open()?;
        Tailer::new(Arc::clone(self), None)
    }

    /// A tailer whose read position is persisted in the table store under `tailer.<name>`, so
    /// a tailer with the same name resumes where the last one stopped.
    pub fn create_named_tailer(self: &Arc<Self>, name: &str) -> Result<Tailer> {
        self.check_open()?;
        Tailer::new(Arc::clone(self), Some(name))
    }

    pub fn pretoucher(self: &Arc<Self>) -> Result<Pretoucher> {
        self.check_open()?;
        Ok(Pretoucher::new(Arc::clone(self)))
    }

    /// Highest cycle with a segment, if any.
    pub(crate) fn last_cycle_opt(&self) -> Result<Option<i32>> {
        let last = self.last_cycle()?;
        Ok((last != NO_MAX_CYCLE).then_some(last))
    }
}

impl fmt::Debug for RollingQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RollingQueue")
            .field("dir", &self.dir)
            .field("config", &self.config)
            .field("closed", &self.is_closed())
            .finish()
    }
}
