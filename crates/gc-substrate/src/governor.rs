//! Heap-size accounting against hard and soft ceilings.
//!
//! The governor owns one counter, the number of governed heap bytes
//! currently allocated, and answers two questions: may this allocation
//! proceed ([`HeapGovernor::try_reserve`]), and how much may the mutators
//! allocate before the next collection ([`HeapGovernor::collection_end`]).
//!
//! The nursery is always resident, so it is excluded from the budget:
//! with a hard ceiling of `max` bytes the governed budget is
//! `max - nursery_size`.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::utils::CachePadded;

use crate::config::GcConfig;
use crate::error::{ConfigError, OomSource, OutOfMemory};
use crate::tracing::internal::{log_allowance, log_reserve_denied};

/// The hard ceiling must hold at least this many nurseries.
pub const MIN_NURSERY_MULTIPLE: usize = 4;

/// Default `min_allowance / nursery_size` ratio.
pub const DEFAULT_ALLOWANCE_RATIO: f64 = 4.0;

/// Smallest accepted allowance ratio.
pub const MIN_ALLOWANCE_RATIO: f64 = 1.0;

/// Largest accepted allowance ratio.
pub const MAX_ALLOWANCE_RATIO: f64 = 10.0;

/// Fraction of the surviving heap granted as allowance after a collection.
pub const HEAP_GROWTH_RATIO: f64 = 0.33;

/// Resource reported to a [`DiagnosticsSink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// Governed heap bytes.
    GcHeap,
}

impl ResourceKind {
    /// Name used in diagnostics output.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::GcHeap => "GC heap",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Receiver of resource-usage reports.
///
/// Called on the allocation path after every successful reservation, so
/// implementations must be cheap and must not allocate through the governor
/// that calls them.
pub trait DiagnosticsSink: Send + Sync {
    /// `total` is the new amount of `kind` in use.
    fn resource_usage(&self, kind: ResourceKind, total: usize);
}

/// Tracks governed heap bytes and computes collection allowances.
///
/// Every method takes `&self` except the diagnostics setter; share the
/// governor between mutator threads by reference or `Arc`.
pub struct HeapGovernor {
    allocated: CachePadded<AtomicUsize>,
    /// Governed budget; 0 means unbounded.
    max_heap_size: usize,
    /// 0 means unbounded.
    soft_heap_limit: usize,
    nursery_size: usize,
    min_allowance: usize,
    major_trigger_size: AtomicUsize,
    diagnostics: Option<Arc<dyn DiagnosticsSink>>,
}

impl HeapGovernor {
    /// Creates a governor with the default allowance ratio.
    ///
    /// `max_heap_bytes` and `soft_limit_bytes` of 0 mean "no limit".
    ///
    /// # Errors
    ///
    /// With a hard ceiling, fails if it is below the soft limit or below
    /// [`MIN_NURSERY_MULTIPLE`] nurseries.
    pub fn init(
        max_heap_bytes: usize,
        soft_limit_bytes: usize,
        nursery_size: usize,
    ) -> Result<Self, ConfigError> {
        Self::with_allowance_ratio(
            max_heap_bytes,
            soft_limit_bytes,
            nursery_size,
            DEFAULT_ALLOWANCE_RATIO,
        )
    }

    /// Creates a governor from a parsed configuration.
    ///
    /// # Errors
    ///
    /// See [`HeapGovernor::with_allowance_ratio`].
    pub fn from_config(config: &GcConfig) -> Result<Self, ConfigError> {
        Self::with_allowance_ratio(
            config.max_heap_size,
            config.soft_heap_limit,
            config.nursery_size,
            config.allowance_ratio,
        )
    }

    /// Creates a governor whose minimum allowance is
    /// `nursery_size * allowance_ratio`.
    ///
    /// # Errors
    ///
    /// As [`HeapGovernor::init`], plus [`ConfigError::RatioOutOfRange`] if
    /// the ratio is outside
    /// [`MIN_ALLOWANCE_RATIO`]..=[`MAX_ALLOWANCE_RATIO`].
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn with_allowance_ratio(
        max_heap_bytes: usize,
        soft_limit_bytes: usize,
        nursery_size: usize,
        allowance_ratio: f64,
    ) -> Result<Self, ConfigError> {
        if !(MIN_ALLOWANCE_RATIO..=MAX_ALLOWANCE_RATIO).contains(&allowance_ratio) {
            return Err(ConfigError::RatioOutOfRange {
                name: "default-allowance-ratio",
                value: allowance_ratio,
                min: MIN_ALLOWANCE_RATIO,
                max: MAX_ALLOWANCE_RATIO,
            });
        }

        let max_heap_size = if max_heap_bytes == 0 {
            0
        } else {
            if soft_limit_bytes > max_heap_bytes {
                return Err(ConfigError::SoftLimitAboveMax {
                    max: max_heap_bytes,
                    soft: soft_limit_bytes,
                });
            }
            let required = nursery_size.saturating_mul(MIN_NURSERY_MULTIPLE);
            if max_heap_bytes < required {
                return Err(ConfigError::MaxBelowNurseryMultiple {
                    max: max_heap_bytes,
                    nursery: nursery_size,
                    multiple: MIN_NURSERY_MULTIPLE,
                    required,
                });
            }
            max_heap_bytes - nursery_size
        };

        let min_allowance = (nursery_size as f64 * allowance_ratio) as usize;
        Ok(Self {
            allocated: CachePadded::new(AtomicUsize::new(0)),
            max_heap_size,
            soft_heap_limit: soft_limit_bytes,
            nursery_size,
            min_allowance,
            major_trigger_size: AtomicUsize::new(min_allowance),
            diagnostics: None,
        })
    }

    /// Installs the sink told about every successful reservation.
    pub fn set_diagnostics(&mut self, sink: Arc<dyn DiagnosticsSink>) {
        self.diagnostics = Some(sink);
    }

    /// Builder form of [`set_diagnostics`](Self::set_diagnostics).
    #[must_use]
    pub fn with_diagnostics(mut self, sink: Arc<dyn DiagnosticsSink>) -> Self {
        self.set_diagnostics(sink);
        self
    }

    const fn limit(&self) -> usize {
        if self.max_heap_size == 0 {
            usize::MAX
        } else {
            self.max_heap_size
        }
    }

    /// Accounts `size` more governed bytes if they fit under the hard
    /// ceiling.
    ///
    /// A `false` answer changes nothing and means a collection is due. On
    /// success the new total is reported to the diagnostics sink.
    #[inline]
    pub fn try_reserve(&self, size: usize) -> bool {
        let limit = self.limit();
        let reserved = self
            .allocated
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |allocated| {
                let free = limit - allocated.min(limit);
                (size <= free).then(|| allocated + size)
            });
        match reserved {
            Ok(previous) => {
                if let Some(sink) = &self.diagnostics {
                    sink.resource_usage(ResourceKind::GcHeap, previous + size);
                }
                true
            }
            Err(allocated) => {
                log_reserve_denied(size, allocated, limit);
                false
            }
        }
    }

    /// [`try_reserve`](Self::try_reserve) reported as a `Result`.
    ///
    /// # Errors
    ///
    /// Returns [`OutOfMemory`] from the governor layer on denial.
    pub fn reserve(&self, size: usize) -> Result<(), OutOfMemory> {
        if self.try_reserve(size) {
            Ok(())
        } else {
            Err(OutOfMemory::new(size, OomSource::Governor))
        }
    }

    /// Gives back `size` governed bytes.
    ///
    /// # Panics
    ///
    /// Panics in debug builds if more is released than is allocated; release
    /// builds clamp the counter at zero.
    pub fn release(&self, size: usize) {
        let previous = self
            .allocated
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |allocated| {
                Some(allocated.saturating_sub(size))
            })
            .unwrap_or_else(|allocated| allocated);
        debug_assert!(
            previous >= size,
            "HeapGovernor::release: releasing {size} bytes with only {previous} allocated"
        );
    }

    /// Governed bytes currently allocated.
    #[must_use]
    pub fn allocated_heap(&self) -> usize {
        self.allocated.load(Ordering::Acquire)
    }

    /// Governed budget (hard ceiling minus nursery); 0 when unbounded.
    #[must_use]
    pub const fn max_heap_size(&self) -> usize {
        self.max_heap_size
    }

    /// Soft ceiling; 0 when unbounded.
    #[must_use]
    pub const fn soft_heap_limit(&self) -> usize {
        self.soft_heap_limit
    }

    /// Nursery size fixed at construction.
    #[must_use]
    pub const fn nursery_size(&self) -> usize {
        self.nursery_size
    }

    /// Bytes that can still be reserved right now.
    #[must_use]
    pub fn available_free_space(&self) -> usize {
        let limit = self.limit();
        limit - self.allocated_heap().min(limit)
    }

    /// Smallest allowance ever granted between collections.
    #[must_use]
    pub const fn min_allowance(&self) -> usize {
        self.min_allowance
    }

    /// Shrinks `estimated` as `new_heap_size` approaches the soft limit.
    ///
    /// Past the soft limit only [`min_allowance`](Self::min_allowance) is
    /// granted; short of it, the allowance is capped at the remaining
    /// distance. Far from the soft limit (or without one) `estimated` is
    /// returned as is, except that an `estimated` below the minimum is
    /// raised to the minimum. The result is never below the minimum.
    #[must_use]
    pub fn adjust_allowance(&self, estimated: usize, new_heap_size: usize) -> usize {
        let min = self.min_allowance;
        let soft = self.soft_heap_limit;
        if soft != 0 && new_heap_size.saturating_add(estimated) > soft {
            if new_heap_size > soft {
                min
            } else {
                (soft - new_heap_size).max(min)
            }
        } else {
            estimated.max(min)
        }
    }

    /// Allowance for a heap of `new_heap_size` surviving bytes:
    /// [`HEAP_GROWTH_RATIO`] of it, at least the minimum, adjusted for the
    /// soft limit.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn compute_allowance(&self, new_heap_size: usize) -> usize {
        let target = (new_heap_size as f64 * HEAP_GROWTH_RATIO) as usize;
        self.adjust_allowance(target.max(self.min_allowance), new_heap_size)
    }

    /// Records the end of a collection that left `new_heap_size` bytes and
    /// returns the allowance granted until the next major collection.
    pub fn collection_end(&self, new_heap_size: usize) -> usize {
        let allowance = self.compute_allowance(new_heap_size);
        let trigger = new_heap_size.saturating_add(allowance);
        self.major_trigger_size.store(trigger, Ordering::Release);
        log_allowance(new_heap_size, allowance, trigger);
        allowance
    }

    /// Heap size at which the next major collection is due.
    #[must_use]
    pub fn major_trigger_size(&self) -> usize {
        self.major_trigger_size.load(Ordering::Acquire)
    }

    /// Returns `true` if growing `current_heap` by `space_needed` would cross
    /// the major-collection trigger.
    #[must_use]
    pub fn needs_major_collection(&self, current_heap: usize, space_needed: usize) -> bool {
        current_heap.saturating_add(space_needed) > self.major_trigger_size()
    }
}

impl fmt::Debug for HeapGovernor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapGovernor")
            .field("allocated_heap", &self.allocated_heap())
            .field("max_heap_size", &self.max_heap_size)
            .field("soft_heap_limit", &self.soft_heap_limit)
            .field("nursery_size", &self.nursery_size)
            .field("min_allowance", &self.min_allowance)
            .field("major_trigger_size", &self.major_trigger_size())
            .field("diagnostics", &self.diagnostics.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::thread;

    const MB: usize = 1_000_000;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(ResourceKind, usize)>>);

    impl DiagnosticsSink for Recorder {
        fn resource_usage(&self, kind: ResourceKind, total: usize) {
            self.0.lock().push((kind, total));
        }
    }

    #[test]
    fn test_reserve_release_sequence() {
        let gov = HeapGovernor::init(100 * MB, 50 * MB, 4 * MB).unwrap();
        assert_eq!(gov.max_heap_size(), 96 * MB);

        assert!(gov.try_reserve(90 * MB));
        assert!(!gov.try_reserve(10 * MB));
        assert_eq!(gov.allocated_heap(), 90 * MB);

        gov.release(50 * MB);
        assert_eq!(gov.allocated_heap(), 40 * MB);
        assert!(gov.try_reserve(10 * MB));
        assert_eq!(gov.allocated_heap(), 50 * MB);
        assert_eq!(gov.available_free_space(), 46 * MB);
    }

    #[test]
    fn test_reserve_up_to_exact_limit() {
        let gov = HeapGovernor::init(16 * MB, 0, 4 * MB).unwrap();
        assert!(gov.try_reserve(12 * MB));
        assert!(!gov.try_reserve(1));
        assert!(gov.try_reserve(0));
        assert_eq!(gov.available_free_space(), 0);
    }

    #[test]
    fn test_unbounded_governor() {
        let gov = HeapGovernor::init(0, 0, 4 * MB).unwrap();
        assert_eq!(gov.max_heap_size(), 0);
        assert!(gov.try_reserve(usize::MAX / 2));
        assert!(gov.try_reserve(usize::MAX / 2));
        assert!(!gov.try_reserve(usize::MAX / 2));
    }

    #[test]
    fn test_invalid_ceilings() {
        assert_eq!(
            HeapGovernor::init(10 * MB, 20 * MB, MB).unwrap_err(),
            ConfigError::SoftLimitAboveMax {
                max: 10 * MB,
                soft: 20 * MB
            }
        );
        assert!(matches!(
            HeapGovernor::init(15 * MB, 0, 4 * MB).unwrap_err(),
            ConfigError::MaxBelowNurseryMultiple { required, .. } if required == 16 * MB
        ));
        // No hard ceiling: nothing to validate against.
        assert!(HeapGovernor::init(0, 20 * MB, 4 * MB).is_ok());
    }

    #[test]
    fn test_ratio_range() {
        assert!(HeapGovernor::with_allowance_ratio(0, 0, MB, 0.5).is_err());
        assert!(HeapGovernor::with_allowance_ratio(0, 0, MB, 10.5).is_err());
        let gov = HeapGovernor::with_allowance_ratio(0, 0, MB, 2.5).unwrap();
        assert_eq!(gov.min_allowance(), 2_500_000);
        assert_eq!(HeapGovernor::init(0, 0, MB).unwrap().min_allowance(), 4 * MB);
    }

    #[test]
    fn test_adjust_allowance_near_soft_limit() {
        let gov = HeapGovernor::with_allowance_ratio(100 * MB, 50 * MB, 4 * MB, 1.0).unwrap();
        assert_eq!(gov.min_allowance(), 4 * MB);
        assert_eq!(gov.adjust_allowance(20 * MB, 45 * MB), 5 * MB);
        // Past the soft limit: minimum only.
        assert_eq!(gov.adjust_allowance(20 * MB, 60 * MB), 4 * MB);
        // Distance shorter than the minimum.
        assert_eq!(gov.adjust_allowance(20 * MB, 48 * MB), 4 * MB);
        // Well below the limit: unchanged.
        assert_eq!(gov.adjust_allowance(10 * MB, 20 * MB), 10 * MB);
        // Well below the limit but under the minimum: raised.
        assert_eq!(gov.adjust_allowance(MB, 20 * MB), 4 * MB);
    }

    #[test]
    fn test_adjust_allowance_never_below_minimum() {
        let gov = HeapGovernor::with_allowance_ratio(0, 50 * MB, 4 * MB, 1.0).unwrap();
        for estimated in [0, MB, 4 * MB, 30 * MB, usize::MAX] {
            for heap in [0, 10 * MB, 49 * MB, 50 * MB, 51 * MB, usize::MAX] {
                let first = gov.adjust_allowance(estimated, heap);
                assert!(first >= gov.min_allowance());
                assert_eq!(first, gov.adjust_allowance(estimated, heap));
            }
        }
    }

    #[test]
    fn test_collection_end_sets_trigger() {
        let gov = HeapGovernor::init(0, 0, MB).unwrap();
        assert_eq!(gov.major_trigger_size(), 4 * MB);

        // 33% of 100 MB beats the 4 MB minimum.
        let allowance = gov.collection_end(100 * MB);
        assert_eq!(allowance, 33 * MB);
        assert_eq!(gov.major_trigger_size(), 133 * MB);
        assert!(!gov.needs_major_collection(130 * MB, 3 * MB));
        assert!(gov.needs_major_collection(130 * MB, 3 * MB + 1));

        // Small heaps get the minimum.
        assert_eq!(gov.collection_end(MB), 4 * MB);
        assert_eq!(gov.major_trigger_size(), 5 * MB);
    }

    #[test]
    fn test_diagnostics_reports_successful_reserves_only() {
        let recorder = Arc::new(Recorder::default());
        let gov = HeapGovernor::init(20 * MB, 0, 4 * MB)
            .unwrap()
            .with_diagnostics(recorder.clone());
        assert!(gov.try_reserve(MB));
        assert!(gov.try_reserve(2 * MB));
        assert!(!gov.try_reserve(100 * MB));
        assert_eq!(
            *recorder.0.lock(),
            vec![(ResourceKind::GcHeap, MB), (ResourceKind::GcHeap, 3 * MB)]
        );
        assert_eq!(ResourceKind::GcHeap.to_string(), "GC heap");
    }

    #[test]
    fn test_reserve_as_result() {
        let gov = HeapGovernor::init(8 * MB, 0, 2 * MB).unwrap();
        gov.reserve(6 * MB).unwrap();
        let err = gov.reserve(1).unwrap_err();
        assert_eq!(err, OutOfMemory::new(1, OomSource::Governor));
    }

    #[test]
    fn test_concurrent_reserves_never_exceed_limit() {
        let gov = Arc::new(HeapGovernor::init(4000 + 1000, 0, 1000).unwrap());
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let gov = Arc::clone(&gov);
                thread::spawn(move || {
                    let mut won = 0;
                    for _ in 0..1000 {
                        if gov.try_reserve(3) {
                            won += 3;
                        }
                        assert!(gov.allocated_heap() <= gov.max_heap_size());
                    }
                    won
                })
            })
            .collect();
        let total: usize = threads.into_iter().map(|t| t.join().unwrap()).sum();
        assert_eq!(total, gov.allocated_heap());
        assert_eq!(total, 3999);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "releasing")]
    fn test_release_more_than_allocated_panics() {
        let gov = HeapGovernor::init(16 * MB, 0, 4 * MB).unwrap();
        assert!(gov.try_reserve(MB));
        gov.release(2 * MB);
    }

    #[test]
    #[cfg(not(debug_assertions))]
    fn test_release_more_than_allocated_clamps() {
        let gov = HeapGovernor::init(16 * MB, 0, 4 * MB).unwrap();
        assert!(gov.try_reserve(MB));
        gov.release(2 * MB);
        assert_eq!(gov.allocated_heap(), 0);
        assert_eq!(gov.available_free_space(), 12 * MB);
    }

    #[test]
    fn test_release_everything_reaches_zero() {
        let gov = HeapGovernor::init(16 * MB, 0, 4 * MB).unwrap();
        assert!(gov.try_reserve(3 * MB));
        gov.release(3 * MB);
        assert_eq!(gov.allocated_heap(), 0);
        gov.release(0);
        assert_eq!(gov.allocated_heap(), 0);
    }
}
