//! Small persisted key → i64 map shared by every process using a queue directory.
//!
//! Backs the write lock, the directory listing bounds and named tailer positions. Each value
//! lives in its own fixed slot of a memory-mapped file, so reads and compare-and-swap on a
//! value are plain atomics on shared memory. Only slot allocation takes an `flock`.

use std::fmt::Write as _;
use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::mmap::{publish_file, temp_path_for, MmapFile};
use crate::{Error, Result};

pub const TABLE_STORE_FILE: &str = "queue.meta";

pub const TABLE_MAGIC: u32 = 0x5251_5453; // 'RQTS'
pub const TABLE_VERSION: u32 = 1;

const HEADER_SIZE: usize = 64;
const SLOT_SIZE: usize = 64;
const KEY_OFFSET: usize = 8;
const VALUE_OFFSET: usize = 56;
pub const MAX_KEY_LEN: usize = VALUE_OFFSET - KEY_OFFSET;
pub const DEFAULT_CAPACITY: u32 = 256;

const MAGIC_AT: usize = 0;
const VERSION_AT: usize = 4;
const CAPACITY_AT: usize = 8;
const USED_AT: usize = 12;

pub struct TableStore {
    path: PathBuf,
    map: MmapFile,
    capacity: u32,
    closed: AtomicBool,
    alloc_guard: Mutex<()>,
}

impl TableStore {
    /// Opens the table store in `dir`, creating it if this is the first process to get there.
    pub fn open(dir: &Path) -> Result<Arc<Self>> {
        Self::open_with_capacity(dir, DEFAULT_CAPACITY)
    }

    pub fn open_with_capacity(dir: &Path, capacity: u32) -> Result<Arc<Self>> {
        let path = dir.join(TABLE_STORE_FILE);
        if !path.exists() {
            create_table_file(&path, capacity)?;
        }
        let map = MmapFile::open(&path)?;
        if map.len() < HEADER_SIZE {
            return Err(Error::Corrupt("table store too small"));
        }
        if map.atomic_u32(MAGIC_AT)?.load(Ordering::Acquire) != TABLE_MAGIC {
            return Err(Error::Corrupt("table store magic mismatch"));
        }
        let version = map.atomic_u32(VERSION_AT)?.load(Ordering::Acquire);
        if version != TABLE_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }
        let capacity = map.atomic_u32(CAPACITY_AT)?.load(Ordering::Acquire);
        if map.len() < HEADER_SIZE + capacity as usize * SLOT_SIZE {
            return Err(Error::Corrupt("table store shorter than its capacity"));
        }
        Ok(Arc::new(Self {
            path,
            map,
            capacity,
            closed: AtomicBool::new(false),
            alloc_guard: Mutex::new(()),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::closed("table store"));
        }
        Ok(())
    }

    /// Returns the value stored under `key`, allocating it with `default` if absent.
    pub fn acquire_value_for(self: &Arc<Self>, key: &str, default: i64) -> Result<MappedValue> {
        self.check_open()?;
        if key.is_empty() || key.len() > MAX_KEY_LEN {
            return Err(Error::InvalidState(format!(
                "table store key must be 1..={MAX_KEY_LEN} bytes: {key:?}"
            )));
        }
        if let Some(slot) = self.find(key)? {
            return Ok(self.value_at(slot));
        }

        let _guard = self
            .alloc_guard
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let _flock = FileLock::exclusive(self.map.file())?;
        if let Some(slot) = self.find(key)? {
            return Ok(self.value_at(slot));
        }
        let used = self.used()?.load(Ordering::Acquire);
        if used >= self.capacity {
            return Err(Error::InvalidState(format!(
                "table store {} is full ({} keys)",
                self.path.display(),
                self.capacity
            )));
        }
        let slot = slot_offset(used);
        self.map.write_bytes(slot + KEY_OFFSET, key.as_bytes())?;
        self.map
            .atomic_i64(slot + VALUE_OFFSET)?
            .store(default, Ordering::Relaxed);
        self.map
            .atomic_u32(slot)?
            .store(key.len() as u32, Ordering::Release);
        self.used()?.store(used + 1, Ordering::Release);
        log::debug!("table store {}: allocated {key}", self.path.display());
        Ok(self.value_at(slot))
    }

    fn value_at(self: &Arc<Self>, slot: usize) -> MappedValue {
        MappedValue {
            store: Arc::clone(self),
            offset: slot + VALUE_OFFSET,
        }
    }

    fn used(&self) -> Result<&AtomicU32> {
        self.map.atomic_u32(USED_AT)
    }

    fn find(&self, key: &str) -> Result<Option<usize>> {
        let used = self.used()?.load(Ordering::Acquire).min(self.capacity);
        for index in 0..used {
            let slot = slot_offset(index);
            let len = self.map.atomic_u32(slot)?.load(Ordering::Acquire) as usize;
            if len != key.len() {
                continue;
            }
            if self.map.read_vec(slot + KEY_OFFSET, len)? == key.as_bytes() {
                return Ok(Some(slot));
            }
        }
        Ok(None)
    }

    /// All keys with their current values, in allocation order.
    pub fn entries(&self) -> Result<Vec<(String, i64)>> {
        let used = self.used()?.load(Ordering::Acquire).min(self.capacity);
        let mut out = Vec::with_capacity(used as usize);
        for index in 0..used {
            let slot = slot_offset(index);
            let len = self.map.atomic_u32(slot)?.load(Ordering::Acquire) as usize;
            if len == 0 || len > MAX_KEY_LEN {
                continue;
            }
            let key = String::from_utf8_lossy(&self.map.read_vec(slot + KEY_OFFSET, len)?)
                .into_owned();
            let value = self
                .map
                .atomic_i64(slot + VALUE_OFFSET)?
                .load(Ordering::Acquire);
            out.push((key, value));
        }
        Ok(out)
    }

    pub fn dump(&self) -> Result<String> {
        let mut out = String::new();
        let _ = writeln!(out, "# {}", self.path.display());
        for (key, value) in self.entries()? {
            let _ = writeln!(out, "{key}: {value}");
        }
        Ok(out)
    }
}

fn slot_offset(index: u32) -> usize {
    HEADER_SIZE + index as usize * SLOT_SIZE
}

fn create_table_file(path: &Path, capacity: u32) -> Result<()> {
    let temp = temp_path_for(path);
    let map = MmapFile::create(&temp, HEADER_SIZE + capacity as usize * SLOT_SIZE)?;
    map.atomic_u32(VERSION_AT)?
        .store(TABLE_VERSION, Ordering::Relaxed);
    map.atomic_u32(CAPACITY_AT)?.store(capacity, Ordering::Relaxed);
    map.atomic_u32(MAGIC_AT)?.store(TABLE_MAGIC, Ordering::Release);
    map.flush_sync()?;
    drop(map);
    match publish_file(&temp, path) {
        Ok(()) => Ok(()),
        Err(Error::Io(err)) if err.kind() == std::io::ErrorKind::AlreadyExists => {
            let _ = std::fs::remove_file(&temp);
            Ok(())
        }
        Err(err) => {
            let _ = std::fs::remove_file(&temp);
            Err(err)
        }
    }
}

struct FileLock<'a> {
    file: &'a File,
}

impl<'a> FileLock<'a> {
    fn exclusive(file: &'a File) -> Result<Self> {
        loop {
            let res = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
            if res == 0 {
                return Ok(Self { file });
            }
            let err = std::io::Error::last_os_error();
            if err.kind() != std::io::ErrorKind::Interrupted {
                return Err(Error::Io(err));
            }
        }
    }
}

impl Drop for FileLock<'_> {
    fn drop(&mut self) {
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

/// Handle on one 64-bit slot of a [`TableStore`].
///
/// Every operation fails with `InvalidState` once the owning store is closed.
#[derive(Clone)]
pub struct MappedValue {
    store: Arc<TableStore>,
    offset: usize,
}

impl MappedValue {
    fn atomic(&self) -> Result<&AtomicI64> {
        self.store.check_open()?;
        self.store.map.atomic_i64(self.offset)
    }

    pub fn get_volatile(&self) -> Result<i64> {
        Ok(self.atomic()?.load(Ordering::Acquire))
    }

    pub fn set_value(&self, value: i64) -> Result<()> {
        self.atomic()?.store(value, Ordering::Release);
        Ok(())
    }

    /// Swaps in `new` only if the slot still holds `expected`.
    pub fn compare_and_swap(&self, expected: i64, new: i64) -> Result<bool> {
        Ok(self
            .atomic()?
            .compare_exchange(expected, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok())
    }

    /// Adds `delta` and returns the new value.
    pub fn add_atomic(&self, delta: i64) -> Result<i64> {
        Ok(self.atomic()?.fetch_add(delta, Ordering::AcqRel) + delta)
    }

    pub fn store(&self) -> &Arc<TableStore> {
        &self.store
    }
}

impl std::fmt::Debug for MappedValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedValue")
            .field("path", &self.store.path)
            .field("offset", &self.offset)
            .finish()
    }
}
