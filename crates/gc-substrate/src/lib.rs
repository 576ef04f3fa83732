//! Support substrate for a tracing, generational garbage collector.
//!
//! `gc-substrate` provides the pieces a collector leans on but that are not
//! collection algorithms themselves:
//!
//! - [`HeapGovernor`]: governed heap accounting against hard and soft
//!   ceilings, and the allowance granted between collections.
//! - [`HandleTable`]: typed, indirect references (strong, weak, pinned, ...)
//!   that code outside the managed heap holds on heap objects.
//! - [`SlabAllocator`]: 32- and 64-byte chunks for collector-internal
//!   structures, carved from whole-page regions.
//! - [`sync`]: the lock and event primitives used to coordinate with
//!   mutator threads.
//!
//! [`GcContext`] owns one of each, so independent collector instances can
//! live side by side in one process.
//!
//! # Quick Start
//!
//! ```
//! use gc_substrate::{GcConfig, GcContext, HandleKind, ObjectRef};
//!
//! let config: GcConfig = "max-heap-size=64m,soft-heap-limit=32m,nursery-size=4m"
//!     .parse()
//!     .unwrap();
//! let ctx = GcContext::new(config).unwrap();
//!
//! // Allocation gate.
//! assert!(ctx.governor().try_reserve(1 << 20));
//!
//! // A durable reference from outside the heap.
//! let obj = ObjectRef::from_addr(0x10_0000);
//! let h = ctx.handles().create(HandleKind::Strong, obj).unwrap();
//! assert_eq!(ctx.handles().dereference(h), obj);
//! ctx.handles().destroy(h);
//! ```
//!
//! # Errors
//!
//! Allocation-path failures ([`OutOfMemory`], a `false` from
//! [`HeapGovernor::try_reserve`], `None` from
//! [`SlabAllocator::get_chunk`]) are ordinary values. Misuse such as
//! destroying a handle twice or leaving a lock you do not own panics in
//! debug builds and is undefined by contract in release builds.
//!
//! # Features
//!
//! - `tracing` (default): spans and events on slow paths via `tracing`.
//! - `owner-tracking`: keep [`sync::Lock`] owner checks in release builds.
//! - `test-util`: export [`test_util`] for downstream tests.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod bitmask;
pub mod config;
mod context;
pub mod error;
pub mod governor;
pub mod handles;
pub mod slab;
pub mod sync;
mod tracing;

pub use bitmask::BitMask;
pub use config::GcConfig;
pub use context::GcContext;
pub use error::{ConfigError, GcError, OomSource, OutOfMemory, SyncError};
pub use governor::{DiagnosticsSink, HeapGovernor, ResourceKind};
pub use handles::{Handle, HandleKind, HandleTable, HandleTableConfig, ObjectRef};
pub use slab::{BulkMemory, OsMemory, SizeClass, SlabAllocator, SlabStats};

#[cfg(any(test, feature = "test-util"))]
#[doc(hidden)]
pub mod test_util {
    use std::ptr::NonNull;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::slab::{BulkMemory, OsMemory};

    /// OS-backed [`BulkMemory`] that counts regions and can run dry.
    #[derive(Debug, Default)]
    pub struct CountingMemory {
        limit: Option<usize>,
        reserved: AtomicUsize,
        released: AtomicUsize,
    }

    impl CountingMemory {
        /// Unlimited source.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Source that refuses after `regions` successful reservations.
        #[must_use]
        pub fn with_limit(regions: usize) -> Self {
            Self {
                limit: Some(regions),
                ..Self::default()
            }
        }

        /// Successful reservations so far.
        pub fn reserved(&self) -> usize {
            self.reserved.load(Ordering::Relaxed)
        }

        /// Releases so far.
        pub fn released(&self) -> usize {
            self.released.load(Ordering::Relaxed)
        }
    }

    impl BulkMemory for CountingMemory {
        fn page_size(&self) -> usize {
            OsMemory.page_size()
        }

        fn reserve(&self, size: usize) -> Option<NonNull<u8>> {
            if self.limit.is_some_and(|limit| self.reserved() >= limit) {
                return None;
            }
            let base = OsMemory.reserve(size)?;
            self.reserved.fetch_add(1, Ordering::Relaxed);
            Some(base)
        }

        unsafe fn release(&self, base: NonNull<u8>, size: usize) -> bool {
            self.released.fetch_add(1, Ordering::Relaxed);
            // SAFETY: forwarded caller contract.
            unsafe { OsMemory.release(base, size) }
        }
    }
}
