//! Per-collector ownership of the substrate components.

use std::cell::UnsafeCell;
use std::fmt;
use std::ptr::NonNull;

use crate::config::GcConfig;
use crate::error::{GcError, OomSource, OutOfMemory};
use crate::governor::HeapGovernor;
use crate::handles::HandleTable;
use crate::slab::{BulkMemory, OsMemory, SizeClass, SlabAllocator, SlabStats};
use crate::sync::{Lock, LockHolder};

/// One collector instance's governor, handle table and slab allocator.
///
/// Nothing here is global: build as many contexts as needed (one per heap,
/// one per test) and share each by reference or `Arc`. The slab allocator
/// is not internally synchronized, so the context guards it with a
/// [`Lock`] and hands it out only inside [`with_slab`](Self::with_slab).
///
/// ```
/// use gc_substrate::{GcConfig, GcContext, SizeClass};
///
/// let ctx = GcContext::new(GcConfig::default()).unwrap();
/// assert!(ctx.governor().try_reserve(1024));
/// let chunk = ctx.get_chunk(SizeClass::Large).unwrap();
/// unsafe { ctx.free_chunk(chunk, SizeClass::Large) };
/// ```
pub struct GcContext<B: BulkMemory = OsMemory> {
    config: GcConfig,
    governor: HeapGovernor,
    handles: HandleTable,
    slab_lock: Lock,
    slab: UnsafeCell<SlabAllocator<B>>,
}

// SAFETY: the only access to `slab` is through `with_slab`, which holds
// `slab_lock` for the whole borrow. `slab_lock` is not reentrant, so two
// `&mut` borrows never coexist.
unsafe impl<B: BulkMemory + Send> Sync for GcContext<B> {}

impl GcContext<OsMemory> {
    /// Builds a context whose slab allocator draws from OS pages.
    ///
    /// # Errors
    ///
    /// Fails on an invalid ceiling combination or if a lock cannot be
    /// created.
    pub fn new(config: GcConfig) -> Result<Self, GcError> {
        Self::with_memory(config, OsMemory)
    }

    /// Builds a context from [`GcConfig::from_env`].
    ///
    /// # Errors
    ///
    /// As [`GcContext::new`], plus any parse error in the environment.
    pub fn from_env() -> Result<Self, GcError> {
        Self::new(GcConfig::from_env()?)
    }
}

impl<B: BulkMemory> GcContext<B> {
    /// Builds a context over a caller-supplied bulk memory source.
    ///
    /// # Errors
    ///
    /// As [`GcContext::new`].
    pub fn with_memory(config: GcConfig, memory: B) -> Result<Self, GcError> {
        let governor = HeapGovernor::from_config(&config)?;
        let handles = HandleTable::with_config(config.handle_table())?;
        let slab = match config.slab_region_size {
            Some(bytes) => SlabAllocator::with_region_size(memory, bytes),
            None => SlabAllocator::new(memory),
        };
        Ok(Self {
            config,
            governor,
            handles,
            slab_lock: Lock::init(false)?,
            slab: UnsafeCell::new(slab),
        })
    }

    /// Configuration the context was built from.
    pub const fn config(&self) -> &GcConfig {
        &self.config
    }

    /// The heap governor.
    pub const fn governor(&self) -> &HeapGovernor {
        &self.governor
    }

    /// Mutable access to the governor, e.g. to install diagnostics.
    pub fn governor_mut(&mut self) -> &mut HeapGovernor {
        &mut self.governor
    }

    /// The handle table.
    pub const fn handles(&self) -> &HandleTable {
        &self.handles
    }

    /// Runs `f` with exclusive access to the slab allocator.
    ///
    /// # Panics
    ///
    /// Calling `with_slab` again from inside `f` panics in debug builds and
    /// deadlocks in release builds.
    pub fn with_slab<R>(&self, f: impl FnOnce(&mut SlabAllocator<B>) -> R) -> R {
        let _holder = LockHolder::new(&self.slab_lock);
        // SAFETY: `_holder` owns `slab_lock` until this call returns, so no
        // other reference to the allocator exists.
        f(unsafe { &mut *self.slab.get() })
    }

    /// Takes a chunk from the slab allocator.
    ///
    /// # Errors
    ///
    /// Returns [`OutOfMemory`] from the bulk memory layer when no chunk is
    /// free and no new region can be reserved.
    pub fn get_chunk(&self, class: SizeClass) -> Result<NonNull<u8>, OutOfMemory> {
        self.with_slab(|slab| slab.get_chunk(class))
            .ok_or_else(|| OutOfMemory::new(class.size(), OomSource::BulkMemory))
    }

    /// Returns a chunk to the slab allocator.
    ///
    /// # Safety
    ///
    /// As [`SlabAllocator::free_chunk`].
    pub unsafe fn free_chunk(&self, chunk: NonNull<u8>, class: SizeClass) {
        // SAFETY: forwarded caller contract.
        self.with_slab(|slab| unsafe { slab.free_chunk(chunk, class) });
    }

    /// Slab allocator counters.
    pub fn slab_stats(&self) -> SlabStats {
        self.with_slab(|slab| slab.stats())
    }
}

impl<B: BulkMemory> fmt::Debug for GcContext<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GcContext")
            .field("governor", &self.governor)
            .field("handles", &self.handles)
            .field("slab_stats", &self.slab_stats())
            .finish_non_exhaustive()
    }
}
