use std::io::{self, Error};
use std::mem;
use std::ptr;

#[cfg(not(miri))]
use windows_sys::Win32::System::Memory::{
    VirtualAlloc, VirtualFree, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE,
};
#[cfg(not(miri))]
use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

pub fn page_size() -> usize {
    #[cfg(miri)]
    {
        4096
    }
    #[cfg(not(miri))]
    unsafe {
        let mut info: SYSTEM_INFO = mem::zeroed();
        GetSystemInfo(&mut info);
        let size = info.dwPageSize as usize;
        if size == 0 {
            4096
        } else {
            size
        }
    }
}

pub struct MmapInner {
    ptr: *mut std::ffi::c_void,
    len: usize,
}

impl MmapInner {
    /// Creates a new committed read/write region of `len` bytes.
    ///
    /// # Safety
    ///
    /// `len` must be a non-zero multiple of the page size.
    pub unsafe fn map_anon(len: usize) -> io::Result<Self> {
        #[cfg(miri)]
        {
            use std::alloc::{alloc_zeroed, Layout};
            // Miri doesn't support VirtualAlloc.
            let layout = Layout::from_size_align(len, page_size())
                .map_err(|_| Error::from(io::ErrorKind::InvalidInput))?;
            let ptr = unsafe { alloc_zeroed(layout) };
            if ptr.is_null() {
                return Err(Error::from(io::ErrorKind::OutOfMemory));
            }
            Ok(Self {
                ptr: ptr.cast::<std::ffi::c_void>(),
                len,
            })
        }
        #[cfg(not(miri))]
        {
            // MEM_RESERVE | MEM_COMMIT yields usable memory in one call.
            let ptr = unsafe {
                VirtualAlloc(ptr::null(), len, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE)
            };
            if ptr.is_null() {
                return Err(Error::last_os_error());
            }
            Ok(Self { ptr, len })
        }
    }

    /// Adopts an existing region.
    ///
    /// # Safety
    ///
    /// `ptr`/`len` must describe a live region created by `map_anon` that
    /// no other `MmapInner` owns.
    pub const unsafe fn from_raw(ptr: *mut u8, len: usize) -> Self {
        Self {
            ptr: ptr.cast::<std::ffi::c_void>(),
            len,
        }
    }

    pub const fn ptr(&self) -> *mut u8 {
        self.ptr.cast::<u8>()
    }

    pub const fn len(&self) -> usize {
        self.len
    }

    /// Releases the region, reporting the OS error instead of ignoring it.
    pub fn unmap(mut self) -> io::Result<()> {
        let len = mem::replace(&mut self.len, 0);
        if len == 0 {
            return Ok(());
        }
        if unsafe { free_region(self.ptr, len) } {
            Ok(())
        } else {
            Err(Error::last_os_error())
        }
    }
}

unsafe fn free_region(ptr: *mut std::ffi::c_void, len: usize) -> bool {
    #[cfg(miri)]
    {
        use std::alloc::{dealloc, Layout};
        let layout = Layout::from_size_align_unchecked(len, page_size());
        unsafe { dealloc(ptr.cast::<u8>(), layout) };
        true
    }
    #[cfg(not(miri))]
    {
        let _ = len;
        // MEM_RELEASE requires dwSize to be 0
        unsafe { VirtualFree(ptr, 0, MEM_RELEASE) != 0 }
    }
}

impl Drop for MmapInner {
    fn drop(&mut self) {
        if self.len > 0 {
            unsafe {
                free_region(self.ptr, self.len);
            }
        }
    }
}

unsafe impl Send for MmapInner {}
unsafe impl Sync for MmapInner {}
