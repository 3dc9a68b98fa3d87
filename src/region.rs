//! Acquisition and release of the memory region under test.
//!
//! A [`Region`] is obtained either by mapping a physical-memory device at a
//! fixed offset or by allocating page-aligned heap memory, and in both cases
//! is locked resident before any test touches it. Test code never sees the
//! backing: it works through [`Window`] views that read and write whole words
//! with volatile semantics, so the compiler cannot cache, reorder or elide
//! the accesses being used to observe the hardware.

use std::alloc::{alloc, dealloc, Layout};
use std::fmt;
use std::fs::OpenOptions;
use std::io;
use std::marker::PhantomData;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::ptr;

use memmap2::{MmapMut, MmapOptions};
use thiserror::Error;

use crate::log_warn_fmt;

/// Size in bytes of the native word all tests operate on.
pub const WORD_BYTES: usize = std::mem::size_of::<usize>();

/// Upper bound on the shrink step used by the heap backoff.
const MAX_SHRINK_STEP: usize = 1 << 20;

#[derive(Debug, Error)]
pub enum AcquireError {
    #[error("failed to open {path:?} for physical memory: {source}")]
    DeviceOpen { path: PathBuf, source: io::Error },
    #[error("failed to map {len} bytes of {path:?} at offset {offset:#x}: {source}")]
    DeviceMap {
        path: PathBuf,
        len: usize,
        offset: u64,
        source: io::Error,
    },
    #[error("failed to lock the {path:?} mapping into RAM: {source}")]
    DeviceLock { path: PathBuf, source: io::Error },
    #[error("no allocatable memory left after backing off from {requested} bytes")]
    Exhausted { requested: usize },
    #[error("failed to lock {len} bytes into RAM (missing CAP_IPC_LOCK or RLIMIT_MEMLOCK too low?): {source}")]
    HeapLock { len: usize, source: io::Error },
}

/// How to acquire the region under test.
#[derive(Debug, Clone)]
pub enum AcquireMode {
    /// Map a physical-memory device (e.g. `/dev/mem`) at the given offset.
    Device { path: PathBuf, phys_base: u64 },
    /// Allocate from the heap, shrinking the request if memory is tight.
    Heap,
}

enum Backing {
    Device { mapping: MmapMut, phys_base: u64 },
    Heap { ptr: *mut u8, layout: Layout },
}

/// An owned span of page-locked memory under test.
pub struct Region {
    backing: Backing,
    len: usize,
}

impl Region {
    /// Acquires `requested` bytes (rounded up to a whole number of pages).
    ///
    /// Device mode is all-or-nothing. Heap mode shrinks the request on
    /// allocation failure, one page at first and doubling the shrink step
    /// after every failed attempt up to 1 MiB, and gives up only when the
    /// request reaches zero. In both modes the memory is locked resident
    /// before it is handed to the caller; a region the kernel may page out
    /// mid-run would make every result meaningless.
    pub fn acquire(requested: usize, mode: &AcquireMode) -> Result<Region, AcquireError> {
        match mode {
            AcquireMode::Device { path, phys_base } => {
                Self::acquire_device(path, requested, *phys_base)
            }
            AcquireMode::Heap => Self::acquire_heap(requested),
        }
    }

    fn acquire_device(path: &Path, requested: usize, phys_base: u64) -> Result<Region, AcquireError> {
        let len = round_up(requested.max(1), page_size());
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_SYNC)
            .open(path)
            .map_err(|source| AcquireError::DeviceOpen {
                path: path.to_path_buf(),
                source,
            })?;
        let mapping = unsafe {
            MmapOptions::new()
                .offset(phys_base)
                .len(len)
                .map_mut(&file)
        }
        .map_err(|source| AcquireError::DeviceMap {
            path: path.to_path_buf(),
            len,
            offset: phys_base,
            source,
        })?;
        mapping.lock().map_err(|source| AcquireError::DeviceLock {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Region {
            backing: Backing::Device { mapping, phys_base },
            len,
        })
    }

    fn acquire_heap(requested: usize) -> Result<Region, AcquireError> {
        let page = page_size();
        let requested = round_up(requested.max(1), page);
        let ((ptr, layout), got) = alloc_with_backoff(requested, page, |len| {
            let layout = Layout::from_size_align(len, page).ok()?;
            let ptr = unsafe { alloc(layout) };
            if ptr.is_null() {
                None
            } else {
                Some((ptr, layout))
            }
        })
        .ok_or(AcquireError::Exhausted { requested })?;
        if got < requested {
            log_warn_fmt!(
                "wanted {} bytes but settled for {} after backoff",
                requested,
                got
            );
        }
        if unsafe { libc::mlock(ptr as *const libc::c_void, layout.size()) } != 0 {
            let source = io::Error::last_os_error();
            unsafe { dealloc(ptr, layout) };
            return Err(AcquireError::HeapLock {
                len: layout.size(),
                source,
            });
        }
        Ok(Region {
            backing: Backing::Heap { ptr, layout },
            len: layout.size(),
        })
    }

    /// Length of the region in bytes. Always a whole number of pages, hence
    /// a multiple of the word size and of two words.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Physical address of the first byte, for device-mapped regions.
    pub fn phys_base(&self) -> Option<u64> {
        match &self.backing {
            Backing::Device { phys_base, .. } => Some(*phys_base),
            Backing::Heap { .. } => None,
        }
    }

    fn base(&mut self) -> *mut u8 {
        match &mut self.backing {
            Backing::Device { mapping, .. } => mapping.as_mut_ptr(),
            Backing::Heap { ptr, .. } => *ptr,
        }
    }

    /// A window over the whole region.
    pub fn window(&mut self) -> Window<'_> {
        let words = self.len / WORD_BYTES;
        let phys_base = self.phys_base();
        Window {
            base: self.base() as *mut usize,
            words,
            byte_offset: 0,
            phys_base,
            _region: PhantomData,
        }
    }

    /// Splits the region into the two equal halves the comparison tests
    /// write in lockstep.
    pub fn split(&mut self) -> (Window<'_>, Window<'_>) {
        let half_words = self.len / WORD_BYTES / 2;
        let phys_base = self.phys_base();
        let base = self.base() as *mut usize;
        let a = Window {
            base,
            words: half_words,
            byte_offset: 0,
            phys_base,
            _region: PhantomData,
        };
        let b = Window {
            base: unsafe { base.add(half_words) },
            words: half_words,
            byte_offset: half_words * WORD_BYTES,
            phys_base,
            _region: PhantomData,
        };
        (a, b)
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        match &mut self.backing {
            // Dropping the mapping unmaps (and thereby unlocks) it.
            Backing::Device { .. } => {}
            Backing::Heap { ptr, layout } => unsafe {
                let _ = libc::munlock(*ptr as *const libc::c_void, layout.size());
                dealloc(*ptr, *layout);
            },
        }
    }
}

/// Where a word lives, for failure reports: a physical address when the
/// region maps a device, a byte index into the region otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    Phys(u64),
    ByteIndex(usize),
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Phys(addr) => write!(f, "physical address {addr:#x}"),
            Location::ByteIndex(off) => write!(f, "byte index {off:#x}"),
        }
    }
}

/// Non-owning word-granularity view into a [`Region`].
///
/// All accesses go through `read_volatile`/`write_volatile`; a `Window` is a
/// view of volatile cells, so writes take `&self` the way a volatile cell
/// type would. Windows handed out together (from [`Region::split`]) never
/// overlap.
pub struct Window<'a> {
    base: *mut usize,
    words: usize,
    byte_offset: usize,
    phys_base: Option<u64>,
    _region: PhantomData<&'a mut Region>,
}

impl<'a> Window<'a> {
    /// Number of words visible through this window.
    pub fn len(&self) -> usize {
        self.words
    }

    /// Volatile load of word `i`.
    #[inline]
    pub fn get(&self, i: usize) -> usize {
        debug_assert!(i < self.words);
        unsafe { ptr::read_volatile(self.base.add(i)) }
    }

    /// Volatile store of word `i`.
    #[inline]
    pub fn set(&self, i: usize, word: usize) {
        debug_assert!(i < self.words);
        unsafe { ptr::write_volatile(self.base.add(i), word) }
    }

    /// Stores word `i` one byte at a time, exercising the narrow write path.
    pub fn set_bytes(&self, i: usize, word: usize) {
        debug_assert!(i < self.words);
        let p = unsafe { self.base.add(i) } as *mut u8;
        for (k, byte) in word.to_ne_bytes().iter().enumerate() {
            unsafe { ptr::write_volatile(p.add(k), *byte) };
        }
    }

    /// Stores word `i` one halfword at a time.
    pub fn set_halfwords(&self, i: usize, word: usize) {
        debug_assert!(i < self.words);
        let p = unsafe { self.base.add(i) } as *mut u16;
        for k in 0..WORD_BYTES / 2 {
            unsafe { ptr::write_volatile(p.add(k), (word >> (16 * k)) as u16) };
        }
    }

    /// Virtual address of cell `i`, the value the stuck-address pattern
    /// encodes into the cell itself.
    #[inline]
    pub fn addr_of(&self, i: usize) -> usize {
        self.base as usize + i * WORD_BYTES
    }

    /// Reportable location of cell `i`.
    pub fn location(&self, i: usize) -> Location {
        let byte = self.byte_offset + i * WORD_BYTES;
        match self.phys_base {
            Some(base) => Location::Phys(base + byte as u64),
            None => Location::ByteIndex(byte),
        }
    }

    #[cfg(test)]
    pub(crate) fn from_slice(buf: &'a mut [usize]) -> Window<'a> {
        Window {
            base: buf.as_mut_ptr(),
            words: buf.len(),
            byte_offset: 0,
            phys_base: None,
            _region: PhantomData,
        }
    }
}

/// Shrinks `requested` until `attempt` succeeds, starting with a one-page
/// step and doubling it after every failure, capped at [`MAX_SHRINK_STEP`].
/// Returns the successful allocation and its size, or `None` once the
/// request reaches zero.
fn alloc_with_backoff<T>(
    requested: usize,
    page: usize,
    mut attempt: impl FnMut(usize) -> Option<T>,
) -> Option<(T, usize)> {
    let mut want = requested;
    let mut step = page;
    while want > 0 {
        if let Some(got) = attempt(want) {
            return Some((got, want));
        }
        want = want.saturating_sub(step);
        step = (step * 2).min(MAX_SHRINK_STEP);
    }
    None
}

fn page_size() -> usize {
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page > 0 {
        page as usize
    } else {
        4096
    }
}

fn round_up(len: usize, page: usize) -> usize {
    (len + page - 1) & !(page - 1)
}
