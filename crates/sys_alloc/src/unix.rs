use std::io::{self, Error};
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Returns the system page size, cached atomically.
pub fn page_size() -> usize {
    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

    match PAGE_SIZE.load(Ordering::Relaxed) {
        0 => {
            #[allow(clippy::cast_sign_loss)]
            let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
            PAGE_SIZE.store(page_size, Ordering::Relaxed);
            page_size
        }
        page_size => page_size,
    }
}

pub struct MmapInner {
    ptr: *mut libc::c_void,
    len: usize,
}

impl MmapInner {
    /// Creates a new anonymous read/write mapping of `len` bytes.
    ///
    /// # Safety
    ///
    /// `len` must be a non-zero multiple of the page size.
    pub unsafe fn map_anon(len: usize) -> io::Result<Self> {
        let flags = libc::MAP_PRIVATE | libc::MAP_ANON;
        let prot = libc::PROT_READ | libc::PROT_WRITE;

        let ptr = unsafe { libc::mmap(ptr::null_mut(), len, prot, flags, -1, 0) };

        if ptr == libc::MAP_FAILED {
            return Err(Error::last_os_error());
        }

        Ok(Self { ptr, len })
    }

    /// Adopts an existing mapping.
    ///
    /// # Safety
    ///
    /// `ptr`/`len` must describe a live mapping created by `map_anon` that
    /// no other `MmapInner` owns.
    pub const unsafe fn from_raw(ptr: *mut u8, len: usize) -> Self {
        Self {
            ptr: ptr.cast::<libc::c_void>(),
            len,
        }
    }

    pub fn ptr(&self) -> *mut u8 {
        self.ptr.cast::<u8>()
    }

    pub const fn len(&self) -> usize {
        self.len
    }

    /// Unmaps the region, reporting the OS error instead of ignoring it.
    pub fn unmap(mut self) -> io::Result<()> {
        let len = std::mem::replace(&mut self.len, 0);
        if len == 0 {
            return Ok(());
        }
        if unsafe { libc::munmap(self.ptr, len) } == 0 {
            Ok(())
        } else {
            Err(Error::last_os_error())
        }
    }
}

impl Drop for MmapInner {
    fn drop(&mut self) {
        if self.len > 0 {
            unsafe {
                libc::munmap(self.ptr, self.len);
            }
        }
    }
}

unsafe impl Send for MmapInner {}
unsafe impl Sync for MmapInner {}
