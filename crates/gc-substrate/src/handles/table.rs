//! Block-structured slot storage behind [`Handle`].
//!
//! Slots live in fixed blocks of [`HANDLES_PER_BLOCK`]. Each block belongs to
//! exactly one [`HandleKind`], so a slot's kind is decided when its block is
//! created and never changes. Blocks are published into a fixed-size
//! directory and stay put until the table is dropped, which is what lets a
//! handle be a plain index.
//!
//! Creating and destroying handles is lock-free and never allocates: each
//! kind keeps a LIFO free list threaded through the free slots themselves.
//! Only growth takes the table's structural [`Lock`], and the block it
//! allocates is the only allocation growth makes.

use std::alloc::{self, Layout};
use std::fmt;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use crossbeam::utils::CachePadded;

use super::{Handle, HandleKind, ObjectRef};
use crate::error::{OomSource, OutOfMemory, SyncError};
use crate::sync::{Lock, LockHolder};
use crate::tracing::internal::{log_handle_block, log_handle_growth_failed, trace_enumerate};

/// Number of slots in one handle block.
pub const HANDLES_PER_BLOCK: usize = 256;

/// Default bound on the number of blocks (one million handles).
pub const DEFAULT_MAX_BLOCKS: usize = 4096;

/// Largest accepted block limit: every slot index plus one fits in a `u32`.
pub const MAX_BLOCKS: usize = (u32::MAX as usize) / HANDLES_PER_BLOCK;

struct Slot {
    referent: AtomicUsize,
    /// Byte size for `SizedRef`, reference count for `Refcounted`.
    extra: AtomicUsize,
    live: AtomicBool,
    /// While free: `index + 1` of the next free slot of the same kind, 0 at
    /// the end of the list.
    next_free: AtomicU32,
}

struct HandleBlock {
    kind: HandleKind,
    slots: [Slot; HANDLES_PER_BLOCK],
}

impl HandleBlock {
    /// Allocates a block of free slots, or `None` if the allocator refuses.
    fn allocate(kind: HandleKind) -> Option<NonNull<Self>> {
        let layout = Layout::new::<Self>();
        // SAFETY: `HandleBlock` is not zero-sized.
        let block = NonNull::new(unsafe { alloc::alloc_zeroed(layout) }.cast::<Self>())?;
        // SAFETY: all-zero bytes are a valid free `Slot` (null referent, zero
        // extra, not live). Only `kind` needs a real value before the block
        // is read as a `HandleBlock`.
        unsafe { ptr::addr_of_mut!((*block.as_ptr()).kind).write(kind) };
        Some(block)
    }

    /// # Safety
    ///
    /// `block` must come from [`HandleBlock::allocate`] and must not be used
    /// afterwards.
    unsafe fn deallocate(block: NonNull<Self>) {
        unsafe { alloc::dealloc(block.as_ptr().cast(), Layout::new::<Self>()) };
    }
}

/// Per-kind free list head.
///
/// The low half of `head` is the first free slot's `index + 1` (0 when
/// empty); the high half is a generation bumped by every update, so a pop
/// that read a stale `next` cannot succeed after the slot was reused.
struct FreeList {
    head: CachePadded<AtomicU64>,
}

#[allow(clippy::cast_possible_truncation)]
const fn link(index: usize) -> u32 {
    // Indices are below `MAX_BLOCKS * HANDLES_PER_BLOCK`.
    (index + 1) as u32
}

#[allow(clippy::cast_possible_truncation)]
const fn first_link(head: u64) -> u32 {
    head as u32
}

fn unlink(head: u64) -> Option<usize> {
    first_link(head).checked_sub(1).map(|index| index as usize)
}

/// New head pointing at the slot linked as `first`, one generation past
/// `previous`.
fn pack(first: u32, previous: u64) -> u64 {
    let generation = (previous >> 32).wrapping_add(1) & u64::from(u32::MAX);
    (generation << 32) | u64::from(first)
}

impl FreeList {
    fn new() -> Self {
        Self {
            head: CachePadded::new(AtomicU64::new(0)),
        }
    }

    fn peek(&self) -> Option<usize> {
        unlink(self.head.load(Ordering::Acquire))
    }

    /// Pushes the already-linked chain starting at slot `first` and ending
    /// at `last`. A single slot is a chain with `first`'s slot as `last`.
    fn push_chain(&self, first: usize, last: &Slot) {
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            last.next_free.store(first_link(head), Ordering::Relaxed);
            match self.head.compare_exchange_weak(
                head,
                pack(link(first), head),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => head = actual,
            }
        }
    }
}

/// Limits for a [`HandleTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleTableConfig {
    /// Maximum number of blocks of [`HANDLES_PER_BLOCK`] slots, capped at
    /// [`MAX_BLOCKS`]. Growth past this fails with [`OutOfMemory`].
    pub max_blocks: usize,
}

impl Default for HandleTableConfig {
    fn default() -> Self {
        Self {
            max_blocks: DEFAULT_MAX_BLOCKS,
        }
    }
}

/// Table of typed, indirect references into the managed heap.
///
/// All operations take `&self` and the table is `Send + Sync`: mutators
/// create, read and destroy handles concurrently while the collector scans
/// them. [`enumerate_by_kind`](Self::enumerate_by_kind) and
/// [`enumerate_roots`](Self::enumerate_roots) are meant for the collector
/// while mutators are suspended. They stay memory-safe without suspension,
/// but a concurrent [`store`](Self::store) may then be overwritten by the
/// visitor's result.
///
/// Using a destroyed handle is a usage error: it panics in debug builds and
/// reads or writes a free (or reused) slot in release builds. A handle that
/// was never produced by this table panics in every build.
pub struct HandleTable {
    blocks: Box<[AtomicPtr<HandleBlock>]>,
    published: AtomicUsize,
    free: [FreeList; HandleKind::COUNT],
    live: [AtomicUsize; HandleKind::COUNT],
    grow_lock: Lock,
}

impl HandleTable {
    /// Creates an empty table with the default limits.
    ///
    /// # Errors
    ///
    /// Fails if the structural lock cannot be created.
    pub fn new() -> Result<Self, SyncError> {
        Self::with_config(HandleTableConfig::default())
    }

    /// Creates an empty table.
    ///
    /// No slot storage is allocated until the first [`create`](Self::create).
    ///
    /// # Errors
    ///
    /// Fails if the structural lock cannot be created.
    pub fn with_config(config: HandleTableConfig) -> Result<Self, SyncError> {
        Ok(Self {
            blocks: (0..config.max_blocks.min(MAX_BLOCKS))
                .map(|_| AtomicPtr::new(ptr::null_mut()))
                .collect(),
            published: AtomicUsize::new(0),
            free: std::array::from_fn(|_| FreeList::new()),
            live: std::array::from_fn(|_| AtomicUsize::new(0)),
            grow_lock: Lock::init(false)?,
        })
    }

    fn block(&self, block_index: usize) -> Option<&HandleBlock> {
        let block = NonNull::new(self.blocks.get(block_index)?.load(Ordering::Acquire))?;
        // SAFETY: published blocks are fully initialized before the release
        // store that publishes them and are freed only in `drop`, which
        // cannot overlap this borrow of `self`.
        Some(unsafe { block.as_ref() })
    }

    fn slot_at(&self, index: usize) -> Option<(HandleKind, &Slot)> {
        let block = self.block(index / HANDLES_PER_BLOCK)?;
        Some((block.kind, &block.slots[index % HANDLES_PER_BLOCK]))
    }

    #[track_caller]
    fn locate(&self, handle: Handle) -> (HandleKind, &Slot) {
        match self.slot_at(handle.index()) {
            Some(found) => found,
            None => panic!("{handle:?} does not belong to this handle table"),
        }
    }

    #[track_caller]
    fn live_slot(&self, handle: Handle) -> (HandleKind, &Slot) {
        let (kind, slot) = self.locate(handle);
        debug_assert!(
            slot.live.load(Ordering::Acquire),
            "{handle:?} used after it was destroyed"
        );
        (kind, slot)
    }

    /// Creates a handle of `kind` referring to `referent`.
    ///
    /// # Errors
    ///
    /// Returns [`OutOfMemory`] if no free slot of `kind` exists and the table
    /// cannot grow (block limit reached or the allocator refused).
    pub fn create(&self, kind: HandleKind, referent: ObjectRef) -> Result<Handle, OutOfMemory> {
        loop {
            if let Some(index) = self.pop_free(kind) {
                return Ok(self.occupy(index, referent));
            }
            self.grow(kind)?;
        }
    }

    fn occupy(&self, index: usize, referent: ObjectRef) -> Handle {
        let (kind, slot) = self
            .slot_at(index)
            .expect("free lists only hold slots of published blocks");
        slot.extra.store(0, Ordering::Relaxed);
        slot.referent.store(referent.0, Ordering::Release);
        let was_live = slot.live.swap(true, Ordering::AcqRel);
        debug_assert!(!was_live, "slot {index} was on the free list while live");
        self.live[kind.index()].fetch_add(1, Ordering::Relaxed);
        Handle::from_index(index)
    }

    fn pop_free(&self, kind: HandleKind) -> Option<usize> {
        let list = &self.free[kind.index()];
        let mut head = list.head.load(Ordering::Acquire);
        loop {
            let index = unlink(head)?;
            let (_, slot) = self.slot_at(index)?;
            // A stale `next` is harmless: the generation in `head` has moved
            // on if this slot was popped meanwhile, so the exchange fails.
            let next = slot.next_free.load(Ordering::Relaxed);
            match list.head.compare_exchange_weak(
                head,
                pack(next, head),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(index),
                Err(actual) => head = actual,
            }
        }
    }

    #[cold]
    fn grow(&self, kind: HandleKind) -> Result<(), OutOfMemory> {
        let _holder = LockHolder::new(&self.grow_lock);

        // Another thread may have grown this kind while we waited.
        if self.free[kind.index()].peek().is_some() {
            return Ok(());
        }

        let block_index = self.published.load(Ordering::Relaxed);
        let block = if block_index < self.blocks.len() {
            HandleBlock::allocate(kind)
        } else {
            None
        };
        let Some(block) = block else {
            log_handle_growth_failed(kind, block_index);
            return Err(OutOfMemory::new(1, OomSource::HandleTable));
        };

        let first = block_index * HANDLES_PER_BLOCK;
        // SAFETY: the block is initialized and not yet visible to anyone else.
        let slots = unsafe { &block.as_ref().slots };
        for (offset, slot) in slots.iter().enumerate().take(HANDLES_PER_BLOCK - 1) {
            slot.next_free.store(link(first + offset + 1), Ordering::Relaxed);
        }

        self.blocks[block_index].store(block.as_ptr(), Ordering::Release);
        self.published.store(block_index + 1, Ordering::Release);

        self.free[kind.index()].push_chain(first, &slots[HANDLES_PER_BLOCK - 1]);
        log_handle_block(kind, block_index);
        Ok(())
    }

    /// Creates `count` handles of the same kind and referent.
    ///
    /// Either all handles are created or none are.
    ///
    /// # Errors
    ///
    /// Returns [`OutOfMemory`] (with `requested == count`) if the table runs
    /// out of slots part way; handles created so far are destroyed again.
    pub fn create_bulk(
        &self,
        kind: HandleKind,
        referent: ObjectRef,
        count: usize,
    ) -> Result<Vec<Handle>, OutOfMemory> {
        let oom = OutOfMemory::new(count, OomSource::HandleTable);
        let mut handles = Vec::new();
        handles.try_reserve_exact(count).map_err(|_| oom)?;
        for _ in 0..count {
            match self.create(kind, referent) {
                Ok(handle) => handles.push(handle),
                Err(_) => {
                    self.destroy_bulk(&handles);
                    return Err(oom);
                }
            }
        }
        Ok(handles)
    }

    /// Destroys `handle`, clearing its referent and returning the slot.
    ///
    /// # Panics
    ///
    /// Panics in debug builds if the handle was already destroyed; release
    /// builds ignore the second destroy.
    #[track_caller]
    pub fn destroy(&self, handle: Handle) {
        let (kind, slot) = self.locate(handle);
        let was_live = slot.live.swap(false, Ordering::AcqRel);
        debug_assert!(was_live, "{handle:?} destroyed twice");
        if !was_live {
            return;
        }
        slot.referent.store(0, Ordering::Release);
        slot.extra.store(0, Ordering::Relaxed);
        self.live[kind.index()].fetch_sub(1, Ordering::Relaxed);
        self.free[kind.index()].push_chain(handle.index(), slot);
    }

    /// Destroys every handle in `handles`.
    #[track_caller]
    pub fn destroy_bulk(&self, handles: &[Handle]) {
        for &handle in handles {
            self.destroy(handle);
        }
    }

    /// Loads the current referent. Null is a normal answer for weak kinds.
    #[must_use]
    #[track_caller]
    pub fn dereference(&self, handle: Handle) -> ObjectRef {
        ObjectRef(self.live_slot(handle).1.referent.load(Ordering::Acquire))
    }

    /// Replaces the referent.
    #[track_caller]
    pub fn store(&self, handle: Handle, referent: ObjectRef) {
        self.live_slot(handle)
            .1
            .referent
            .store(referent.0, Ordering::Release);
    }

    /// Replaces the referent if it still equals `current`.
    ///
    /// # Errors
    ///
    /// Returns the actual referent if it differed from `current`.
    #[track_caller]
    pub fn compare_exchange(
        &self,
        handle: Handle,
        current: ObjectRef,
        new: ObjectRef,
    ) -> Result<ObjectRef, ObjectRef> {
        self.live_slot(handle)
            .1
            .referent
            .compare_exchange(current.0, new.0, Ordering::AcqRel, Ordering::Acquire)
            .map(ObjectRef)
            .map_err(ObjectRef)
    }

    /// Kind the handle was created with.
    #[must_use]
    #[track_caller]
    pub fn kind_of(&self, handle: Handle) -> HandleKind {
        self.live_slot(handle).0
    }

    /// Returns `true` if `handle` names a live slot of this table.
    #[must_use]
    pub fn contains(&self, handle: Handle) -> bool {
        self.slot_at(handle.index())
            .is_some_and(|(_, slot)| slot.live.load(Ordering::Acquire))
    }

    /// Per-slot extra word: byte size for `SizedRef`, count for
    /// `Refcounted`, free for the owner to use otherwise.
    #[must_use]
    #[track_caller]
    pub fn extra(&self, handle: Handle) -> usize {
        self.live_slot(handle).1.extra.load(Ordering::Acquire)
    }

    /// Sets the extra word.
    #[track_caller]
    pub fn set_extra(&self, handle: Handle, extra: usize) {
        self.live_slot(handle).1.extra.store(extra, Ordering::Release);
    }

    /// Approximate byte size recorded on a `SizedRef` handle.
    #[must_use]
    #[track_caller]
    pub fn sized_ref_size(&self, handle: Handle) -> usize {
        debug_assert_eq!(self.kind_of(handle), HandleKind::SizedRef);
        self.extra(handle)
    }

    /// Records the approximate byte size reachable from a `SizedRef` handle.
    #[track_caller]
    pub fn set_sized_ref_size(&self, handle: Handle, bytes: usize) {
        debug_assert_eq!(self.kind_of(handle), HandleKind::SizedRef);
        self.set_extra(handle, bytes);
    }

    /// Increments a `Refcounted` handle's count and returns the new count.
    #[track_caller]
    pub fn add_ref(&self, handle: Handle) -> usize {
        let (kind, slot) = self.live_slot(handle);
        debug_assert_eq!(kind, HandleKind::Refcounted);
        slot.extra.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Decrements a `Refcounted` handle's count and returns the new count.
    /// At zero the handle stops being a root.
    ///
    /// # Panics
    ///
    /// Panics in debug builds if the count is already zero; release builds
    /// leave it at zero.
    #[track_caller]
    pub fn release_ref(&self, handle: Handle) -> usize {
        let (kind, slot) = self.live_slot(handle);
        debug_assert_eq!(kind, HandleKind::Refcounted);
        match slot
            .extra
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        {
            Ok(previous) => previous - 1,
            Err(_) => {
                if cfg!(debug_assertions) {
                    panic!("{handle:?} released below zero");
                }
                0
            }
        }
    }

    /// Visits every live handle of `kind` with a non-null referent.
    ///
    /// `visit` returns the referent to store back: the argument unchanged to
    /// keep it, a new value after relocation, or [`ObjectRef::NULL`] to clear
    /// it. The kind and the slot itself are never changed.
    pub fn enumerate_by_kind<F>(&self, kind: HandleKind, mut visit: F)
    where
        F: FnMut(Handle, ObjectRef) -> ObjectRef,
    {
        let _span = trace_enumerate(kind);
        self.scan(kind, false, &mut visit);
    }

    /// Visits every handle that currently acts as a root: all root kinds,
    /// with `Refcounted` handles only while their count is non-zero.
    pub fn enumerate_roots<F>(&self, mut visit: F)
    where
        F: FnMut(Handle, ObjectRef) -> ObjectRef,
    {
        for kind in HandleKind::ALL.into_iter().filter(|kind| kind.is_root()) {
            let _span = trace_enumerate(kind);
            self.scan(kind, kind == HandleKind::Refcounted, &mut visit);
        }
    }

    fn scan<F>(&self, kind: HandleKind, counted_only: bool, visit: &mut F)
    where
        F: FnMut(Handle, ObjectRef) -> ObjectRef,
    {
        let published = self.published.load(Ordering::Acquire);
        for block_index in 0..published {
            let Some(block) = self.block(block_index) else {
                continue;
            };
            if block.kind != kind {
                continue;
            }
            let base = block_index * HANDLES_PER_BLOCK;
            for (offset, slot) in block.slots.iter().enumerate() {
                if !slot.live.load(Ordering::Acquire) {
                    continue;
                }
                if counted_only && slot.extra.load(Ordering::Acquire) == 0 {
                    continue;
                }
                let current = slot.referent.load(Ordering::Acquire);
                if current == 0 {
                    continue;
                }
                let updated = visit(Handle::from_index(base + offset), ObjectRef(current));
                if updated.0 != current {
                    slot.referent.store(updated.0, Ordering::Release);
                }
            }
        }
    }

    /// Number of live handles.
    #[must_use]
    pub fn len(&self) -> usize {
        self.live.iter().map(|n| n.load(Ordering::Relaxed)).sum()
    }

    /// Returns `true` if no handle is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of live handles of `kind`.
    #[must_use]
    pub fn count(&self, kind: HandleKind) -> usize {
        self.live[kind.index()].load(Ordering::Relaxed)
    }

    /// Number of allocated blocks.
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.published.load(Ordering::Acquire)
    }

    /// Total slots across allocated blocks.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.block_count() * HANDLES_PER_BLOCK
    }

    /// Maximum number of blocks this table may grow to.
    #[must_use]
    pub fn max_blocks(&self) -> usize {
        self.blocks.len()
    }
}

impl Drop for HandleTable {
    fn drop(&mut self) {
        for entry in self.blocks.iter_mut() {
            if let Some(block) = NonNull::new(*entry.get_mut()) {
                *entry.get_mut() = ptr::null_mut();
                // SAFETY: every published pointer came from
                // `HandleBlock::allocate` and `&mut self` excludes readers.
                unsafe { HandleBlock::deallocate(block) };
            }
        }
    }
}

impl fmt::Debug for HandleTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleTable")
            .field("len", &self.len())
            .field("blocks", &self.block_count())
            .field("max_blocks", &self.max_blocks())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    fn obj(addr: usize) -> ObjectRef {
        ObjectRef::from_addr(addr)
    }

    #[test]
    fn test_create_dereference_destroy() {
        let table = HandleTable::new().unwrap();
        assert!(table.is_empty());
        assert_eq!(table.block_count(), 0);

        let h = table.create(HandleKind::Strong, obj(0x1000)).unwrap();
        assert_eq!(table.dereference(h), obj(0x1000));
        assert_eq!(table.kind_of(h), HandleKind::Strong);
        assert!(table.contains(h));
        assert_eq!(table.len(), 1);
        assert_eq!(table.block_count(), 1);

        table.destroy(h);
        assert!(!table.contains(h));
        assert!(table.is_empty());
    }

    #[test]
    fn test_destroyed_slot_is_reused() {
        let table = HandleTable::new().unwrap();
        let first = table.create(HandleKind::Pinned, obj(8)).unwrap();
        let _second = table.create(HandleKind::Pinned, obj(16)).unwrap();
        table.destroy(first);
        let reused: HashSet<_> = (0..HANDLES_PER_BLOCK - 1)
            .map(|_| table.create(HandleKind::Pinned, obj(24)).unwrap())
            .collect();
        assert!(reused.contains(&first));
        assert_eq!(table.block_count(), 1);
        // A reused slot starts from a clean extra word.
        assert_eq!(table.extra(first), 0);
    }

    #[test]
    fn test_each_kind_gets_its_own_block() {
        let table = HandleTable::new().unwrap();
        for kind in HandleKind::ALL {
            let h = table.create(kind, obj(0x40)).unwrap();
            assert_eq!(table.kind_of(h), kind);
        }
        assert_eq!(table.block_count(), HandleKind::COUNT);
        for kind in HandleKind::ALL {
            assert_eq!(table.count(kind), 1);
        }
    }

    #[test]
    fn test_growth_past_one_block() {
        let table = HandleTable::new().unwrap();
        let handles: Vec<_> = (0..HANDLES_PER_BLOCK + 10)
            .map(|i| table.create(HandleKind::Strong, obj(8 * (i + 1))).unwrap())
            .collect();
        assert_eq!(table.block_count(), 2);
        assert_eq!(table.capacity(), 2 * HANDLES_PER_BLOCK);
        for (i, &h) in handles.iter().enumerate() {
            assert_eq!(table.dereference(h), obj(8 * (i + 1)));
        }
    }

    #[test]
    fn test_block_limit_is_out_of_memory() {
        let table = HandleTable::with_config(HandleTableConfig { max_blocks: 1 }).unwrap();
        for _ in 0..HANDLES_PER_BLOCK {
            table.create(HandleKind::Strong, obj(1)).unwrap();
        }
        let err = table.create(HandleKind::Strong, obj(1)).unwrap_err();
        assert_eq!(err.layer, OomSource::HandleTable);

        // The directory is full, so another kind cannot get a block either.
        assert!(table.create(HandleKind::Weak, obj(1)).is_err());
    }

    #[test]
    fn test_create_bulk_rolls_back() {
        let table = HandleTable::with_config(HandleTableConfig { max_blocks: 1 }).unwrap();
        let kept = table.create_bulk(HandleKind::Weak, obj(2), 200).unwrap();
        assert_eq!(kept.len(), 200);

        let err = table.create_bulk(HandleKind::Weak, obj(3), 100).unwrap_err();
        assert_eq!(err.requested, 100);
        assert_eq!(table.len(), 200);

        table.destroy_bulk(&kept);
        assert!(table.is_empty());
        assert_eq!(table.create_bulk(HandleKind::Weak, obj(4), 256).unwrap().len(), 256);
    }

    #[test]
    fn test_weak_cleared_by_enumeration() {
        let table = HandleTable::new().unwrap();
        let weak = table.create(HandleKind::Weak, obj(0x100)).unwrap();
        let strong = table.create(HandleKind::Strong, obj(0x100)).unwrap();

        table.enumerate_by_kind(HandleKind::Weak, |_, _| ObjectRef::NULL);
        assert!(table.dereference(weak).is_null());
        assert_eq!(table.dereference(strong), obj(0x100));

        // Cleared handles are skipped by later scans but stay live.
        let mut visited = 0;
        table.enumerate_by_kind(HandleKind::Weak, |_, r| {
            visited += 1;
            r
        });
        assert_eq!(visited, 0);
        assert!(table.contains(weak));
    }

    #[test]
    fn test_enumeration_relocates() {
        let table = HandleTable::new().unwrap();
        let h = table.create(HandleKind::Strong, obj(0x100)).unwrap();
        table.enumerate_by_kind(HandleKind::Strong, |handle, r| {
            assert_eq!(handle, h);
            ObjectRef::from_addr(r.addr() + 0x1000)
        });
        assert_eq!(table.dereference(h), obj(0x1100));
    }

    #[test]
    fn test_one_handle_per_kind_enumerates_only_that_kind() {
        let table = HandleTable::new().unwrap();
        let target = obj(0xdead_0000);
        let handles: Vec<_> = HandleKind::ALL
            .iter()
            .map(|&kind| (kind, table.create(kind, target).unwrap()))
            .collect();

        for (kind, handle) in &handles {
            let mut seen = Vec::new();
            table.enumerate_by_kind(*kind, |h, r| {
                seen.push((h, r));
                r
            });
            assert_eq!(seen, vec![(*handle, target)], "kind {kind}");
        }
    }

    #[test]
    fn test_enumerate_roots_respects_refcount() {
        let table = HandleTable::new().unwrap();
        let strong = table.create(HandleKind::Strong, obj(1)).unwrap();
        let _weak = table.create(HandleKind::Weak, obj(2)).unwrap();
        let counted = table.create(HandleKind::Refcounted, obj(3)).unwrap();

        let roots = |table: &HandleTable| {
            let mut found = Vec::new();
            table.enumerate_roots(|h, r| {
                found.push(h);
                r
            });
            found
        };

        assert_eq!(roots(&table), vec![strong]);
        assert_eq!(table.add_ref(counted), 1);
        assert_eq!(roots(&table), vec![strong, counted]);
        assert_eq!(table.release_ref(counted), 0);
        assert_eq!(roots(&table), vec![strong]);
    }

    #[test]
    fn test_sized_ref_size() {
        let table = HandleTable::new().unwrap();
        let h = table.create(HandleKind::SizedRef, obj(0x80)).unwrap();
        assert_eq!(table.sized_ref_size(h), 0);
        table.set_sized_ref_size(h, 4096);
        assert_eq!(table.sized_ref_size(h), 4096);
    }

    #[test]
    fn test_store_and_compare_exchange() {
        let table = HandleTable::new().unwrap();
        let h = table.create(HandleKind::Strong, obj(1)).unwrap();
        table.store(h, obj(2));
        assert_eq!(table.compare_exchange(h, obj(1), obj(3)), Err(obj(2)));
        assert_eq!(table.compare_exchange(h, obj(2), obj(3)), Ok(obj(2)));
        assert_eq!(table.dereference(h), obj(3));
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "destroyed twice")]
    fn test_double_destroy_panics() {
        let table = HandleTable::new().unwrap();
        let h = table.create(HandleKind::Strong, obj(1)).unwrap();
        table.destroy(h);
        table.destroy(h);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "used after it was destroyed")]
    fn test_dereference_after_destroy_panics() {
        let table = HandleTable::new().unwrap();
        let h = table.create(HandleKind::Strong, obj(1)).unwrap();
        table.destroy(h);
        let _ = table.dereference(h);
    }

    #[test]
    #[should_panic(expected = "does not belong")]
    fn test_foreign_handle_panics() {
        let table = HandleTable::new().unwrap();
        let stray = Handle::from_raw(10_000).unwrap();
        let _ = table.dereference(stray);
    }

    #[test]
    fn test_free_list_reuses_most_recent_slot() {
        let table = HandleTable::new().unwrap();
        let a = table.create(HandleKind::Strong, obj(1)).unwrap();
        let b = table.create(HandleKind::Strong, obj(2)).unwrap();
        assert_eq!(b.index(), a.index() + 1);

        table.destroy(a);
        table.destroy(b);
        assert_eq!(table.create(HandleKind::Strong, obj(3)).unwrap(), b);
        assert_eq!(table.create(HandleKind::Strong, obj(4)).unwrap(), a);
    }

    #[test]
    fn test_fresh_block_hands_out_every_slot_once() {
        let table = HandleTable::with_config(HandleTableConfig { max_blocks: 2 }).unwrap();
        let weak: HashSet<_> = (0..HANDLES_PER_BLOCK)
            .map(|_| table.create(HandleKind::Weak, obj(8)).unwrap())
            .collect();
        assert_eq!(weak.len(), HANDLES_PER_BLOCK);
        assert_eq!(table.block_count(), 1);

        // The weak list is empty; a second block gets linked in.
        let next = table.create(HandleKind::Weak, obj(8)).unwrap();
        assert_eq!(next.index(), HANDLES_PER_BLOCK);
        assert!(table.create(HandleKind::Strong, obj(8)).is_err());
    }

    #[test]
    fn test_concurrent_churn_keeps_handles_distinct() {
        let table = Arc::new(HandleTable::new().unwrap());
        let threads: Vec<_> = (0..4)
            .map(|t| {
                let table = Arc::clone(&table);
                thread::spawn(move || {
                    for i in 0..2000 {
                        let referent = obj((t + 1) * 1_000_000 + i);
                        let a = table.create(HandleKind::Pinned, referent).unwrap();
                        let b = table.create(HandleKind::Pinned, referent).unwrap();
                        assert_ne!(a, b);
                        assert_eq!(table.dereference(a), referent);
                        assert_eq!(table.dereference(b), referent);
                        table.destroy(a);
                        table.destroy(b);
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        assert!(table.is_empty());
        assert_eq!(table.block_count(), 1);
    }

    #[test]
    fn test_concurrent_create_destroy() {
        let table = Arc::new(HandleTable::new().unwrap());
        let threads: Vec<_> = (0..4)
            .map(|t| {
                let table = Arc::clone(&table);
                thread::spawn(move || {
                    let mut mine = Vec::new();
                    for i in 0..1000 {
                        let referent = obj((t + 1) * 100_000 + i);
                        mine.push((table.create(HandleKind::Strong, referent).unwrap(), referent));
                    }
                    for &(h, referent) in &mine {
                        assert_eq!(table.dereference(h), referent);
                    }
                    mine.into_iter().map(|(h, _)| h).collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all = HashSet::new();
        for thread in threads {
            for h in thread.join().unwrap() {
                assert!(all.insert(h), "{h:?} handed out twice");
            }
        }
        assert_eq!(table.len(), 4000);
        for h in all {
            table.destroy(h);
        }
        assert!(table.is_empty());
    }
}
