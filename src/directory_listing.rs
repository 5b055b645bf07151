use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::roll_cycle::RollCycle;
use crate::segment::list_cycles;
use crate::table_store::{MappedValue, TableStore};
use crate::Result;

pub const LOWEST_CYCLE_KEY: &str = "listing.lowestCycle";
pub const HIGHEST_CYCLE_KEY: &str = "listing.highestCycle";
pub const MOD_COUNT_KEY: &str = "listing.modCount";

/// Sentinel returned by `min_created_cycle` when no segment exists.
pub const NO_MIN_CYCLE: i32 = i32::MAX;
/// Sentinel returned by `max_created_cycle` when no segment exists.
pub const NO_MAX_CYCLE: i32 = i32::MIN;

/// Tracks the lowest and highest cycle with a segment file without scanning the directory on
/// every query.
pub trait DirectoryListing: Send + Sync {
    /// Full scan of the directory.
    fn init(&self) -> Result<()>;
    /// Re-derives the bounds from the filesystem, bumping the modification count on change.
    fn refresh(&self) -> Result<()>;
    /// Like `refresh`, but always bumps the modification count.
    fn force_refresh(&self) -> Result<()>;
    fn on_file_created(&self, file: &Path, cycle: i32) -> Result<()>;
    fn min_created_cycle(&self) -> Result<i32>;
    fn max_created_cycle(&self) -> Result<i32>;
    fn mod_count(&self) -> Result<i64>;
}

/// Listing whose bounds live in the queue's table store, so every process sees the same values.
pub struct TableDirectoryListing {
    dir: PathBuf,
    roll_cycle: RollCycle,
    lowest: MappedValue,
    highest: MappedValue,
    mod_count: MappedValue,
}

impl TableDirectoryListing {
    pub fn new(dir: &Path, roll_cycle: RollCycle, table: &Arc<TableStore>) -> Result<Self> {
        Ok(Self {
            dir: dir.to_path_buf(),
            roll_cycle,
            lowest: table.acquire_value_for(LOWEST_CYCLE_KEY, NO_MIN_CYCLE as i64)?,
            highest: table.acquire_value_for(HIGHEST_CYCLE_KEY, NO_MAX_CYCLE as i64)?,
            mod_count: table.acquire_value_for(MOD_COUNT_KEY, 0)?,
        })
    }

    /// Every cycle with a segment file, ascending.
    pub fn cycles(&self) -> Result<Vec<i32>> {
        list_cycles(&self.dir, &self.roll_cycle)
    }

    fn rescan(&self, force: bool) -> Result<()> {
        let cycles = self.cycles()?;
        let (min, max) = match (cycles.first(), cycles.last()) {
            (Some(&min), Some(&max)) => (min, max),
            _ => (NO_MIN_CYCLE, NO_MAX_CYCLE),
        };
        let changed = self.lowest.get_volatile()? != min as i64
            || self.highest.get_volatile()? != max as i64;
        self.lowest.set_value(min as i64)?;
        self.highest.set_value(max as i64)?;
        if changed || force {
            self.mod_count.add_atomic(1)?;
        }
        Ok(())
    }
}

impl DirectoryListing for TableDirectoryListing {
    fn init(&self) -> Result<()> {
        self.rescan(false)
    }

    fn refresh(&self) -> Result<()> {
        self.rescan(false)
    }

    fn force_refresh(&self) -> Result<()> {
        self.rescan(true)
    }

    fn on_file_created(&self, file: &Path, cycle: i32) -> Result<()> {
        let cycle = cycle as i64;
        loop {
            let current = self.lowest.get_volatile()?;
            if current <= cycle || self.lowest.compare_and_swap(current, cycle)? {
                break;
            }
        }
        loop {
            let current = self.highest.get_volatile()?;
            if current >= cycle || self.highest.compare_and_swap(current, cycle)? {
                break;
            }
        }
        self.mod_count.add_atomic(1)?;
        log::debug!("listing: {} created for cycle {cycle}", file.display());
        Ok(())
    }

    fn min_created_cycle(&self) -> Result<i32> {
        Ok(self.lowest.get_volatile()? as i32)
    }

    fn max_created_cycle(&self) -> Result<i32> {
        Ok(self.highest.get_volatile()? as i32)
    }

    fn mod_count(&self) -> Result<i64> {
        self.mod_count.get_volatile()
    }
}
