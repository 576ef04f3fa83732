//! Slab allocator over custom and OS bulk memory sources.

use std::alloc::{self, Layout};
use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::ptr::NonNull;

use gc_substrate::{BulkMemory, SizeClass, SlabAllocator, SlabStats};

const PAGE: usize = 4096;

/// Heap-backed source that records every region it hands out.
#[derive(Default)]
struct HeapPages {
    budget: Cell<Option<usize>>,
    live: RefCell<Vec<(usize, usize)>>,
    released: Cell<usize>,
}

impl HeapPages {
    fn with_budget(regions: usize) -> Self {
        let pages = Self::default();
        pages.budget.set(Some(regions));
        pages
    }
}

impl BulkMemory for HeapPages {
    fn page_size(&self) -> usize {
        PAGE
    }

    fn reserve(&self, size: usize) -> Option<NonNull<u8>> {
        assert_eq!(size % PAGE, 0, "sizes must be page multiples");
        if let Some(budget) = self.budget.get() {
            if budget == 0 {
                return None;
            }
            self.budget.set(Some(budget - 1));
        }
        let layout = Layout::from_size_align(size, PAGE).ok()?;
        let base = NonNull::new(unsafe { alloc::alloc_zeroed(layout) })?;
        self.live.borrow_mut().push((base.as_ptr() as usize, size));
        Some(base)
    }

    unsafe fn release(&self, base: NonNull<u8>, size: usize) -> bool {
        let mut live = self.live.borrow_mut();
        let Some(pos) = live
            .iter()
            .position(|&entry| entry == (base.as_ptr() as usize, size))
        else {
            return false;
        };
        live.swap_remove(pos);
        self.released.set(self.released.get() + 1);
        unsafe { alloc::dealloc(base.as_ptr(), Layout::from_size_align_unchecked(size, PAGE)) };
        true
    }
}

#[test]
fn test_get_free_round_trip_reuses_addresses() {
    let mut slab = SlabAllocator::new(HeapPages::default());
    let n = 50;
    let chunks: Vec<_> = (0..n).map(|_| slab.get_chunk(SizeClass::Small).unwrap()).collect();
    let regions = slab.source().live.borrow().len();

    // Free in an interleaved order.
    for i in (0..n).step_by(2).chain((1..n).step_by(2)) {
        unsafe { slab.free_chunk(chunks[i], SizeClass::Small) };
    }

    let freed: HashSet<_> = chunks.iter().copied().collect();
    let again: Vec<_> = (0..n).map(|_| slab.get_chunk(SizeClass::Small).unwrap()).collect();
    assert!(again.iter().all(|chunk| freed.contains(chunk)));
    assert_eq!(slab.source().live.borrow().len(), regions);
}

#[test]
fn test_chunks_lie_inside_reserved_regions() {
    let mut slab = SlabAllocator::with_region_size(HeapPages::default(), PAGE);
    for class in SizeClass::ALL {
        for _ in 0..2 * slab.chunks_per_region(class) {
            let chunk = slab.get_chunk(class).unwrap().as_ptr() as usize;
            assert_eq!(chunk % class.size(), 0);
            let inside = slab
                .source()
                .live
                .borrow()
                .iter()
                .any(|&(base, len)| chunk >= base + 64 && chunk + class.size() <= base + len);
            assert!(inside, "{chunk:#x} outside every region");
        }
    }
}

#[test]
fn test_chunk_memory_is_usable() {
    let mut slab = SlabAllocator::new(HeapPages::default());
    let a = slab.get_chunk(SizeClass::Large).unwrap();
    let b = slab.get_chunk(SizeClass::Large).unwrap();
    unsafe {
        a.as_ptr().write_bytes(0xAA, 64);
        b.as_ptr().write_bytes(0xBB, 64);
        assert!(std::slice::from_raw_parts(a.as_ptr(), 64).iter().all(|&x| x == 0xAA));
        assert!(std::slice::from_raw_parts(b.as_ptr(), 64).iter().all(|&x| x == 0xBB));
        slab.free_chunk(a, SizeClass::Large);
        slab.free_chunk(b, SizeClass::Large);
    }
}

#[test]
fn test_exhaustion_reports_none_not_panic() {
    let mut slab = SlabAllocator::with_region_size(HeapPages::with_budget(1), PAGE);
    let per_region = slab.chunks_per_region(SizeClass::Small);
    for _ in 0..per_region {
        assert!(slab.get_chunk(SizeClass::Small).is_some());
    }
    assert!(slab.get_chunk(SizeClass::Small).is_none());
    assert!(slab.get_chunk(SizeClass::Large).is_none());
}

#[test]
fn test_drop_releases_everything() {
    let source = HeapPages::default();
    let released = {
        let mut slab = SlabAllocator::new(&source);
        for _ in 0..1000 {
            slab.get_chunk(SizeClass::Large).unwrap();
        }
        slab.stats().regions
    };
    assert!(released > 1);
    assert_eq!(source.released.get(), released);
    assert!(source.live.borrow().is_empty());
}

#[test]
fn test_teardown_resets_stats() {
    let mut slab = SlabAllocator::new(HeapPages::default());
    slab.get_chunk(SizeClass::Small).unwrap();
    slab.get_chunk(SizeClass::Large).unwrap();
    assert_eq!(slab.teardown(), 0);
    assert_eq!(slab.stats(), SlabStats::default());
    assert!(slab.source().live.borrow().is_empty());
}

#[test]
fn test_os_memory_backed_allocator() {
    let mut slab = SlabAllocator::with_os_memory();
    let chunks: Vec<_> = (0..500).map(|_| slab.get_chunk(SizeClass::Small).unwrap()).collect();
    let stats = slab.stats();
    assert_eq!(stats.in_use_small, 500);
    assert_eq!(stats.reserved_bytes, stats.regions * slab.region_size());
    for chunk in chunks {
        unsafe { slab.free_chunk(chunk, SizeClass::Small) };
    }
    assert_eq!(slab.stats().in_use_small, 0);
}
