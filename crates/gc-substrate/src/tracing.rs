//! Structured logging hooks.
//!
//! When the `tracing` feature is enabled, this module emits spans and events
//! for the slow paths of every component. Hot paths (successful reservations,
//! free-list pops, slot loads) never log.

#[cfg(feature = "tracing")]
pub mod internal {
    use ::tracing::{span, Level};

    use crate::handles::HandleKind;
    use crate::slab::SizeClass;

    /// Span covering a handle-table root scan.
    pub fn trace_enumerate(kind: HandleKind) -> span::EnteredSpan {
        span!(Level::TRACE, "handle_enumerate", kind = ?kind).entered()
    }

    /// A reservation was denied; a collection is due.
    pub fn log_reserve_denied(size: usize, allocated: usize, max: usize) {
        ::tracing::debug!(size, allocated, max, "reserve_denied");
    }

    /// A collection boundary recomputed the allowance.
    pub fn log_allowance(new_heap_size: usize, allowance: usize, trigger: usize) {
        ::tracing::debug!(new_heap_size, allowance, trigger, "allowance_recomputed");
    }

    /// The slab allocator obtained a new bulk region.
    pub fn log_slab_region(class: SizeClass, base: usize, len: usize, chunks: usize) {
        ::tracing::trace!(class = ?class, base, len, chunks, "slab_region_reserved");
    }

    /// The bulk source refused a region.
    pub fn log_slab_exhausted(class: SizeClass, len: usize) {
        ::tracing::warn!(class = ?class, len, "slab_region_exhausted");
    }

    /// All slab regions were handed back.
    pub fn log_slab_teardown(regions: usize, bytes: usize, failures: usize) {
        ::tracing::debug!(regions, bytes, failures, "slab_teardown");
    }

    /// The handle table added a block of slots.
    pub fn log_handle_block(kind: HandleKind, block_index: usize) {
        ::tracing::trace!(kind = ?kind, block_index, "handle_block_added");
    }

    /// The handle table could not grow.
    pub fn log_handle_growth_failed(kind: HandleKind, blocks: usize) {
        ::tracing::warn!(kind = ?kind, blocks, "handle_table_full");
    }
}

#[cfg(not(feature = "tracing"))]
#[allow(clippy::missing_const_for_fn)]
pub mod internal {
    use crate::handles::HandleKind;
    use crate::slab::SizeClass;

    /// Stub guard when tracing is disabled.
    pub struct NoSpan;

    /// Stub function when tracing is disabled.
    pub fn trace_enumerate(_kind: HandleKind) -> NoSpan {
        NoSpan
    }

    /// Stub function when tracing is disabled.
    pub fn log_reserve_denied(_size: usize, _allocated: usize, _max: usize) {}

    /// Stub function when tracing is disabled.
    pub fn log_allowance(_new_heap_size: usize, _allowance: usize, _trigger: usize) {}

    /// Stub function when tracing is disabled.
    pub fn log_slab_region(_class: SizeClass, _base: usize, _len: usize, _chunks: usize) {}

    /// Stub function when tracing is disabled.
    pub fn log_slab_exhausted(_class: SizeClass, _len: usize) {}

    /// Stub function when tracing is disabled.
    pub fn log_slab_teardown(_regions: usize, _bytes: usize, _failures: usize) {}

    /// Stub function when tracing is disabled.
    pub fn log_handle_block(_kind: HandleKind, _block_index: usize) {}

    /// Stub function when tracing is disabled.
    pub fn log_handle_growth_failed(_kind: HandleKind, _blocks: usize) {}
}
