//! Fixed-size chunk allocator for collector-internal structures.
//!
//! Chunks come in two size classes (32 and 64 bytes, each aligned to its
//! size). They are carved out of page-multiple regions obtained from a
//! [`BulkMemory`] source and are only handed back to that source when the
//! whole allocator is torn down.
//!
//! # Memory layout
//!
//! ```text
//! region (page aligned, `region_size` bytes)
//! +----------------+---------+---------+-----+---------+
//! | RegionHeader   | chunk 0 | chunk 1 | ... | chunk N |
//! | (64 bytes)     |         |         |     |         |
//! +----------------+---------+---------+-----+---------+
//! ```
//!
//! The header links every region into an intrusive registry used by
//! [`SlabAllocator::teardown`]. While a chunk is free its first word is the
//! link of its class's free list; the rest of a free chunk is undefined. This
//! aliasing of chunk payload and link is confined to this module.
//!
//! The allocator takes `&mut self` for every mutation and is not `Sync`.
//! Callers that share one across threads serialize access themselves (see
//! [`GcContext::with_slab`](crate::GcContext::with_slab)).

use std::fmt;
use std::mem;
use std::ptr::NonNull;

#[cfg(debug_assertions)]
use crate::bitmask::BitMask;
use crate::tracing::internal::{log_slab_exhausted, log_slab_region, log_slab_teardown};

/// Default region size, in pages.
pub const DEFAULT_REGION_PAGES: usize = 4;

/// Chunk size class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SizeClass {
    /// 32-byte chunks.
    Small,
    /// 64-byte chunks (one cache line).
    Large,
}

impl SizeClass {
    /// Both classes, smallest first.
    pub const ALL: [Self; 2] = [Self::Small, Self::Large];

    /// Chunk size (and alignment) in bytes.
    #[must_use]
    pub const fn size(self) -> usize {
        match self {
            Self::Small => 32,
            Self::Large => 64,
        }
    }

    const fn index(self) -> usize {
        self as usize
    }
}

/// A source of whole-page memory regions.
///
/// Sizes passed to both methods are always multiples of
/// [`page_size`](BulkMemory::page_size), and every base returned by
/// [`reserve`](BulkMemory::reserve) must be aligned to it.
pub trait BulkMemory {
    /// Granularity of `reserve`/`release`; a power of two of at least 64.
    fn page_size(&self) -> usize;

    /// Obtains `size` bytes of zeroed, read/write memory, or `None` when the
    /// source is exhausted.
    fn reserve(&self, size: usize) -> Option<NonNull<u8>>;

    /// Returns a region to the source. Returns `false` if the source
    /// rejected the release.
    ///
    /// # Safety
    ///
    /// `base` and `size` must describe exactly one region obtained from
    /// `reserve` on this source and not released since. Nothing may access
    /// the region afterwards.
    unsafe fn release(&self, base: NonNull<u8>, size: usize) -> bool;
}

impl<B: BulkMemory + ?Sized> BulkMemory for &B {
    fn page_size(&self) -> usize {
        (**self).page_size()
    }

    fn reserve(&self, size: usize) -> Option<NonNull<u8>> {
        (**self).reserve(size)
    }

    unsafe fn release(&self, base: NonNull<u8>, size: usize) -> bool {
        // SAFETY: forwarded caller contract.
        unsafe { (**self).release(base, size) }
    }
}

/// [`BulkMemory`] backed by anonymous OS mappings.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsMemory;

impl BulkMemory for OsMemory {
    fn page_size(&self) -> usize {
        sys_alloc::page_size()
    }

    fn reserve(&self, size: usize) -> Option<NonNull<u8>> {
        let mmap = sys_alloc::reserve(size).ok()?;
        debug_assert_eq!(mmap.len(), size, "reserve sizes are page multiples");
        Some(mmap.into_raw().0)
    }

    unsafe fn release(&self, base: NonNull<u8>, size: usize) -> bool {
        // SAFETY: forwarded caller contract; `reserve` produced this pair
        // with `Mmap::into_raw`.
        unsafe { sys_alloc::release(base, size) }.is_ok()
    }
}

/// Registry entry written at the start of every region.
#[repr(C, align(64))]
struct RegionHeader {
    next: Option<NonNull<RegionHeader>>,
    len: usize,
}

const HEADER_SIZE: usize = mem::size_of::<RegionHeader>();

const _: () = assert!(HEADER_SIZE == 64);

/// View of a free chunk: only the link word is meaningful.
#[repr(C)]
struct FreeChunk {
    next: Option<NonNull<FreeChunk>>,
}

const _: () = assert!(mem::size_of::<FreeChunk>() <= 32);

/// Per-region free map kept by debug builds to catch foreign pointers and
/// double frees.
#[cfg(debug_assertions)]
struct RegionMap {
    first_chunk: usize,
    end: usize,
    class: SizeClass,
    free: BitMask,
}

/// Counters reported by [`SlabAllocator::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlabStats {
    /// Regions currently reserved.
    pub regions: usize,
    /// Bytes currently reserved from the bulk source.
    pub reserved_bytes: usize,
    /// Chunks on the small free list.
    pub free_small: usize,
    /// Chunks on the large free list.
    pub free_large: usize,
    /// Small chunks handed out and not yet freed.
    pub in_use_small: usize,
    /// Large chunks handed out and not yet freed.
    pub in_use_large: usize,
}

/// Allocator of 32- and 64-byte chunks over a [`BulkMemory`] source.
pub struct SlabAllocator<B: BulkMemory = OsMemory> {
    source: B,
    region_size: usize,
    free: [Option<NonNull<FreeChunk>>; 2],
    regions: Option<NonNull<RegionHeader>>,
    region_count: usize,
    free_len: [usize; 2],
    carved: [usize; 2],
    #[cfg(debug_assertions)]
    maps: Vec<RegionMap>,
}

// SAFETY: the allocator exclusively owns its regions and every free chunk;
// nothing in it is tied to the creating thread. It is deliberately not
// `Sync`.
unsafe impl<B: BulkMemory + Send> Send for SlabAllocator<B> {}

impl SlabAllocator<OsMemory> {
    /// Creates an allocator over OS pages with the default region size.
    #[must_use]
    pub fn with_os_memory() -> Self {
        Self::new(OsMemory)
    }
}

impl<B: BulkMemory> SlabAllocator<B> {
    /// Creates an allocator reserving regions of [`DEFAULT_REGION_PAGES`]
    /// pages.
    pub fn new(source: B) -> Self {
        let region_size = source.page_size() * DEFAULT_REGION_PAGES;
        Self::with_region_size(source, region_size)
    }

    /// Creates an allocator reserving regions of `bytes`, rounded up to a
    /// whole number of pages and to at least the header plus one large
    /// chunk.
    pub fn with_region_size(source: B, bytes: usize) -> Self {
        let page = source.page_size();
        debug_assert!(page.is_power_of_two() && page >= HEADER_SIZE);
        let wanted = bytes.max(HEADER_SIZE + SizeClass::Large.size());
        let region_size = wanted.div_ceil(page).saturating_mul(page);
        Self {
            source,
            region_size,
            free: [None, None],
            regions: None,
            region_count: 0,
            free_len: [0, 0],
            carved: [0, 0],
            #[cfg(debug_assertions)]
            maps: Vec::new(),
        }
    }

    /// Size of every region requested from the source.
    #[must_use]
    pub const fn region_size(&self) -> usize {
        self.region_size
    }

    /// Chunks of `class` carved from one region.
    #[must_use]
    pub const fn chunks_per_region(&self, class: SizeClass) -> usize {
        (self.region_size - HEADER_SIZE) / class.size()
    }

    /// The backing source.
    pub const fn source(&self) -> &B {
        &self.source
    }

    /// Hands out a chunk of `class`, or `None` once the source is exhausted.
    ///
    /// The chunk is aligned to its size. Its contents are undefined; callers
    /// that need zeroed memory zero it themselves.
    pub fn get_chunk(&mut self, class: SizeClass) -> Option<NonNull<u8>> {
        let chunk = match self.pop(class) {
            Some(chunk) => chunk,
            None => self.refill(class)?,
        };
        #[cfg(debug_assertions)]
        self.debug_mark(chunk.as_ptr() as usize, class, false);
        Some(chunk)
    }

    /// Returns a chunk to its free list.
    ///
    /// # Safety
    ///
    /// `chunk` must have come from [`get_chunk`](Self::get_chunk) with the
    /// same `class` on this allocator, must not have been freed since, and
    /// must not be used afterwards. Debug builds assert this; release builds
    /// do not check.
    pub unsafe fn free_chunk(&mut self, chunk: NonNull<u8>, class: SizeClass) {
        #[cfg(debug_assertions)]
        self.debug_mark(chunk.as_ptr() as usize, class, true);
        self.push(chunk.cast(), class);
    }

    fn pop(&mut self, class: SizeClass) -> Option<NonNull<u8>> {
        let head = self.free[class.index()]?;
        // SAFETY: every pointer on a free list is a free chunk inside a live
        // region, at least one word long and word aligned.
        self.free[class.index()] = unsafe { head.as_ptr().read().next };
        self.free_len[class.index()] -= 1;
        Some(head.cast())
    }

    fn push(&mut self, chunk: NonNull<FreeChunk>, class: SizeClass) {
        let next = self.free[class.index()];
        // SAFETY: the chunk is owned by this allocator and no longer in use,
        // so its first word may be overwritten with the link.
        unsafe { chunk.as_ptr().write(FreeChunk { next }) };
        self.free[class.index()] = Some(chunk);
        self.free_len[class.index()] += 1;
    }

    /// Reserves a region, pushes all but its last chunk and returns the last.
    #[cold]
    fn refill(&mut self, class: SizeClass) -> Option<NonNull<u8>> {
        let len = self.region_size;
        let Some(base) = self.source.reserve(len) else {
            log_slab_exhausted(class, len);
            return None;
        };

        let header = base.cast::<RegionHeader>();
        // SAFETY: `base` is page aligned (so 64-byte aligned) and the region
        // is at least `HEADER_SIZE` bytes and owned by us.
        unsafe {
            header.as_ptr().write(RegionHeader {
                next: self.regions,
                len,
            });
        }
        self.regions = Some(header);
        self.region_count += 1;

        let size = class.size();
        let count = self.chunks_per_region(class);
        // SAFETY: `HEADER_SIZE < len`, so the first chunk is inside the region.
        let first = unsafe { base.add(HEADER_SIZE) };
        self.carved[class.index()] += count;

        #[cfg(debug_assertions)]
        {
            let mut free = BitMask::new(count);
            for i in 0..count {
                free.set(i);
            }
            let first_chunk = first.as_ptr() as usize;
            self.maps.push(RegionMap {
                first_chunk,
                end: first_chunk + count * size,
                class,
                free,
            });
        }

        // Push in reverse so the free list hands chunks out in address order.
        for i in (0..count - 1).rev() {
            // SAFETY: `i < count`, so the chunk lies inside the region.
            let chunk = unsafe { first.add(i * size) };
            self.push(chunk.cast(), class);
        }

        log_slab_region(class, base.as_ptr() as usize, len, count);
        // SAFETY: as above, for the last chunk.
        Some(unsafe { first.add((count - 1) * size) })
    }

    #[cfg(debug_assertions)]
    #[track_caller]
    fn debug_mark(&mut self, addr: usize, class: SizeClass, freeing: bool) {
        let Some(map) = self
            .maps
            .iter_mut()
            .find(|map| (map.first_chunk..map.end).contains(&addr))
        else {
            panic!("SlabAllocator: {addr:#x} is not a chunk of this allocator");
        };
        assert_eq!(map.class, class, "SlabAllocator: chunk {addr:#x} freed with the wrong size class");
        let offset = addr - map.first_chunk;
        assert_eq!(offset % class.size(), 0, "SlabAllocator: {addr:#x} is not a chunk start");
        let index = offset / class.size();
        if freeing {
            assert!(!map.free.set(index), "SlabAllocator: double free of {addr:#x}");
        } else {
            assert!(map.free.clear(index), "SlabAllocator: free list handed out live chunk {addr:#x}");
        }
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> SlabStats {
        let [free_small, free_large] = self.free_len;
        let [carved_small, carved_large] = self.carved;
        SlabStats {
            regions: self.region_count,
            reserved_bytes: self.region_count * self.region_size,
            free_small,
            free_large,
            in_use_small: carved_small - free_small,
            in_use_large: carved_large - free_large,
        }
    }

    /// Releases every region to the source. Outstanding chunks die with
    /// their region.
    ///
    /// The allocator stays usable and reserves fresh regions on demand.
    /// Returns the number of regions the source refused to take back.
    pub fn teardown(&mut self) -> usize {
        let regions = self.region_count;
        let bytes = regions * self.region_size;
        let mut failures = 0;

        let mut cursor = self.regions.take();
        while let Some(header) = cursor {
            // SAFETY: registry entries point at headers of live regions.
            let RegionHeader { next, len } = unsafe { header.as_ptr().read() };
            cursor = next;
            // SAFETY: the header sits at the region base and records the
            // size it was reserved with; nothing references it any more.
            if !unsafe { self.source.release(header.cast(), len) } {
                failures += 1;
            }
        }

        self.free = [None, None];
        self.free_len = [0, 0];
        self.carved = [0, 0];
        self.region_count = 0;
        #[cfg(debug_assertions)]
        self.maps.clear();

        if regions > 0 {
            log_slab_teardown(regions, bytes, failures);
        }
        failures
    }
}

impl<B: BulkMemory> Drop for SlabAllocator<B> {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl<B: BulkMemory> fmt::Debug for SlabAllocator<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlabAllocator")
            .field("region_size", &self.region_size)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
