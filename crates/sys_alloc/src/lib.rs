//! Whole-page virtual memory for collector-internal allocators.
//!
//! Every mapping handed out by this crate is anonymous, readable, writable and
//! a whole multiple of [`page_size`]. Callers either keep the [`Mmap`] owner
//! around (the region is unmapped on drop) or detach it with
//! [`Mmap::into_raw`] and later give the pair back to [`release`].

use std::io;
use std::ptr::NonNull;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as os;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as os;

pub use os::page_size;

/// Rounds `len` up to a whole number of pages.
///
/// Returns `None` if the rounded length overflows `usize`.
#[must_use]
pub fn round_to_pages(len: usize) -> Option<usize> {
    let page = page_size();
    len.checked_add(page - 1).map(|n| n & !(page - 1))
}

/// An owned anonymous memory mapping.
///
/// The region is unmapped when this value is dropped.
pub struct Mmap {
    inner: os::MmapInner,
}

impl Mmap {
    /// Returns a pointer to the start of the mapping.
    pub fn ptr(&self) -> *mut u8 {
        self.inner.ptr()
    }

    /// Returns the length of the mapping in bytes.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if the mapping is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }

    /// Detaches the mapping from this owner without unmapping it.
    ///
    /// The returned pair must eventually be passed to [`release`] or the
    /// region leaks until process exit.
    #[must_use = "the region leaks unless it is released"]
    pub fn into_raw(self) -> (NonNull<u8>, usize) {
        let len = self.inner.len();
        let ptr = self.inner.ptr();
        std::mem::forget(self);
        // SAFETY: a live mapping never starts at address zero.
        (unsafe { NonNull::new_unchecked(ptr) }, len)
    }
}

unsafe impl Send for Mmap {}
unsafe impl Sync for Mmap {}

/// Reserves `len` bytes (rounded up to whole pages) of read/write memory.
///
/// # Errors
///
/// Fails with `InvalidInput` for a zero or overflowing length, and with the
/// OS error when the kernel refuses the mapping.
pub fn reserve(len: usize) -> io::Result<Mmap> {
    if len == 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "length must be greater than 0",
        ));
    }
    let len = round_to_pages(len)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "length overflows"))?;

    // SAFETY: a fresh anonymous mapping aliases nothing.
    let inner = unsafe { os::MmapInner::map_anon(len)? };
    Ok(Mmap { inner })
}

/// Releases a region detached with [`Mmap::into_raw`].
///
/// # Errors
///
/// Returns the OS error if the kernel rejects the release.
///
/// # Safety
///
/// `ptr`/`len` must be a pair produced by `into_raw` that has not been
/// released yet, and nothing may access the region afterwards.
pub unsafe fn release(ptr: NonNull<u8>, len: usize) -> io::Result<()> {
    let inner = unsafe { os::MmapInner::from_raw(ptr.as_ptr(), len) };
    inner.unmap()
}
