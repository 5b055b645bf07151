use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use memmap2::{Advice, MmapMut, MmapOptions};

use crate::{Error, Result};

pub const PAGE_SIZE: usize = 4096;

/// Shared, writable mapping of a file.
///
/// Several processes (and several `MmapFile`s in one process) may map the same file. All
/// coordination happens through the atomic views returned by `atomic_u32`/`atomic_u64`/
/// `atomic_i64`; plain byte writes are only issued by the holder of the queue lock.
///
/// The mapping may reserve more address space than the file holds (`capacity` vs `len`), so
/// a file can grow in place without remapping. Only the first `len` bytes are ever touched;
/// `len` is refreshed from the file size when an access runs past it.
pub struct MmapFile {
    path: PathBuf,
    file: File,
    map: MmapMut,
    base: *mut u8,
    capacity: usize,
    len: AtomicUsize,
}

// The mapping is shared memory; every mutation goes through atomics or through the
// lock-holding writer.
unsafe impl Send for MmapFile {}
unsafe impl Sync for MmapFile {}

impl MmapFile {
    pub fn create(path: &Path, len: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        Self::map_file(path, file, len)
    }

    /// Creates the file, failing with `AlreadyExists` if it is present.
    pub fn create_new(path: &Path, len: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(path)?;
        Self::map_file(path, file, len)
    }

    pub fn open(path: &Path) -> Result<Self> {
        Self::open_reserved(path, 0)
    }

    /// Maps an existing file, reserving at least `capacity` bytes of address space so later
    /// growth of the file becomes visible without remapping.
    pub fn open_reserved(path: &Path, capacity: usize) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len() as usize;
        if len == 0 {
            return Err(Error::Corrupt("mapped file is empty"));
        }
        Self::map_reserved(path, file, len, capacity.max(len))
    }

    fn map_file(path: &Path, file: File, len: usize) -> Result<Self> {
        if len == 0 {
            return Err(Error::Unsupported("mmap length must be non-zero"));
        }
        file.set_len(len as u64)?;
        Self::map_reserved(path, file, len, len)
    }

    fn map_reserved(path: &Path, file: File, len: usize, capacity: usize) -> Result<Self> {
        let mut map = unsafe { MmapOptions::new().len(capacity).map_mut(&file)? };
        let base = map.as_mut_ptr();
        Ok(Self {
            path: path.to_path_buf(),
            file,
            map,
            base,
            capacity,
            len: AtomicUsize::new(len),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    /// Bytes backed by the file as last observed by this mapping.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Largest length the file can grow to while staying inside this mapping.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Re-reads the file size, picking up growth by another mapping or process.
    pub fn refresh_len(&self) -> Result<usize> {
        let on_disk = (self.file.metadata()?.len() as usize).min(self.capacity);
        Ok(self.len.fetch_max(on_disk, Ordering::AcqRel).max(on_disk))
    }

    /// Whether `[0, end)` is backed by the file, refreshing the length if needed.
    pub fn covers(&self, end: usize) -> Result<bool> {
        if end <= self.len() {
            return Ok(true);
        }
        if end > self.capacity {
            return Ok(false);
        }
        Ok(end <= self.refresh_len()?)
    }

    /// Extends the file so that `[0, end)` is backed, rounding up to whole pages.
    ///
    /// Only ever grows the file. Callers must hold the queue lock.
    pub fn grow_to(&self, end: usize) -> Result<()> {
        if end > self.capacity {
            return Err(Error::Unsupported("file cannot grow beyond its reserved mapping"));
        }
        if self.covers(end)? {
            return Ok(());
        }
        let target = (end.div_ceil(PAGE_SIZE) * PAGE_SIZE).min(self.capacity);
        self.file.set_len(target as u64)?;
        self.len.fetch_max(target, Ordering::AcqRel);
        log::debug!("grew {} to {target} bytes", self.path.display());
        Ok(())
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<()> {
        let end = offset
            .checked_add(len)
            .ok_or(Error::Corrupt("range overflow"))?;
        if !self.covers(end)? {
            return Err(Error::Corrupt("range out of bounds"));
        }
        Ok(())
    }

    fn check_aligned(&self, offset: usize, size: usize) -> Result<()> {
        self.check_range(offset, size)?;
        if offset % size != 0 {
            return Err(Error::Corrupt("misaligned atomic access"));
        }
        Ok(())
    }

    pub fn atomic_u32(&self, offset: usize) -> Result<&AtomicU32> {
        self.check_aligned(offset, 4)?;
        Ok(unsafe { &*(self.base.add(offset) as *const AtomicU32) })
    }

    pub fn atomic_u64(&self, offset: usize) -> Result<&AtomicU64> {
        self.check_aligned(offset, 8)?;
        Ok(unsafe { &*(self.base.add(offset) as *const AtomicU64) })
    }

    pub fn atomic_i64(&self, offset: usize) -> Result<&AtomicI64> {
        self.check_aligned(offset, 8)?;
        Ok(unsafe { &*(self.base.add(offset) as *const AtomicI64) })
    }

    /// Copies `buf.len()` bytes starting at `offset` out of the mapping.
    pub fn read_into(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.check_range(offset, buf.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(self.base.add(offset), buf.as_mut_ptr(), buf.len());
        }
        Ok(())
    }

    pub fn read_vec(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_into(offset, &mut buf)?;
        Ok(buf)
    }

    /// Copies `data` into the mapping. Callers must own the byte range, i.e. hold the queue
    /// lock or be initialising a file nobody else can see yet.
    pub fn write_bytes(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.check_range(offset, data.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.base.add(offset), data.len());
        }
        Ok(())
    }

    pub fn zero(&self, offset: usize, len: usize) -> Result<()> {
        self.check_range(offset, len)?;
        unsafe {
            std::ptr::write_bytes(self.base.add(offset), 0, len);
        }
        Ok(())
    }

    /// Faults in the page containing `offset` for writing without changing its contents.
    pub fn touch_page(&self, offset: usize) -> Result<()> {
        let page = offset - offset % PAGE_SIZE;
        // An atomic no-op write: faults the page in writable and cannot race a real writer.
        self.atomic_u32(page)?.fetch_add(0, Ordering::Relaxed);
        Ok(())
    }

    /// Hints the kernel that `[offset, offset + len)` will be needed soon.
    pub fn advise_will_need(&self, offset: usize, len: usize) -> Result<()> {
        self.check_range(offset, len)?;
        self.map.advise_range(Advice::WillNeed, offset, len)?;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    pub fn flush_async(&self) -> Result<()> {
        self.map.flush_async_range(0, self.len())?;
        Ok(())
    }

    pub fn flush_sync(&self) -> Result<()> {
        self.map.flush_range(0, self.len())?;
        Ok(())
    }
}

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Temp path used while a file is initialised before being published under `path`.
pub fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    let unique = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    name.push(format!(".{}-{unique}.tmp", std::process::id()));
    path.with_file_name(name)
}

/// Renames `temp_path` to `final_path`, failing with `AlreadyExists` instead of replacing.
///
/// Uses `renameat2(RENAME_NOREPLACE)` on Linux so two processes racing to create the same file
/// cannot clobber each other; elsewhere falls back to check-then-rename.
pub fn publish_file(temp_path: &Path, final_path: &Path) -> Result<()> {
    #[cfg(target_os = "linux")]
    {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let temp_c = CString::new(temp_path.as_os_str().as_bytes())
            .map_err(|_| Error::Unsupported("temp path contains null byte"))?;
        let final_c = CString::new(final_path.as_os_str().as_bytes())
            .map_err(|_| Error::Unsupported("path contains null byte"))?;

        let rc = unsafe {
            libc::renameat2(
                libc::AT_FDCWD,
                temp_c.as_ptr(),
                libc::AT_FDCWD,
                final_c.as_ptr(),
                libc::RENAME_NOREPLACE,
            )
        };
        if rc == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ENOSYS) && err.raw_os_error() != Some(libc::EINVAL) {
            return Err(Error::Io(err));
        }
    }

    if final_path.exists() {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            "file already exists",
        )));
    }
    std::fs::rename(temp_path, final_path)?;
    Ok(())
}
