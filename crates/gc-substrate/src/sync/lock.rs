//! Explicit enter/leave lock and its scoped holder.

#[cfg(any(debug_assertions, feature = "owner-tracking"))]
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::lock_api::{RawMutex as _, RawReentrantMutex};
use parking_lot::{RawMutex, RawThreadId};

use crate::error::SyncError;

enum RawLock {
    Plain(RawMutex),
    Reentrant(RawReentrantMutex<RawMutex, RawThreadId>),
}

/// A mutual-exclusion lock acquired with [`enter`](Lock::enter) and released
/// with [`leave`](Lock::leave).
///
/// Unlike `Mutex<T>` the lock guards no data of its own: it serializes
/// structural changes to things the caller owns (handle-table growth, the
/// slab allocator, the suspend rendezvous). [`LockHolder`] gives the scoped
/// form.
///
/// Blocking in `enter` has no timeout. Reentrant acquisition is only allowed
/// when the lock was created with `reentrant = true`; re-entering a plain
/// lock from the owning thread is a usage error.
pub struct Lock {
    raw: RawLock,
    /// Token of the owning thread, zero while free.
    #[cfg(any(debug_assertions, feature = "owner-tracking"))]
    owner: AtomicUsize,
    #[cfg(any(debug_assertions, feature = "owner-tracking"))]
    depth: AtomicUsize,
}

#[cfg(any(debug_assertions, feature = "owner-tracking"))]
fn current_thread_token() -> usize {
    use parking_lot::lock_api::GetThreadId;
    RawThreadId::INIT.nonzero_thread_id().get()
}

impl Lock {
    /// Creates a lock.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::CreateFailed`] if the platform cannot provide the
    /// lock. The `parking_lot` implementation never fails, but callers on
    /// collector paths must not assume creation is infallible.
    #[allow(clippy::unnecessary_wraps)]
    pub const fn init(reentrant: bool) -> Result<Self, SyncError> {
        let raw = if reentrant {
            RawLock::Reentrant(RawReentrantMutex::INIT)
        } else {
            RawLock::Plain(RawMutex::INIT)
        };
        Ok(Self {
            raw,
            #[cfg(any(debug_assertions, feature = "owner-tracking"))]
            owner: AtomicUsize::new(0),
            #[cfg(any(debug_assertions, feature = "owner-tracking"))]
            depth: AtomicUsize::new(0),
        })
    }

    /// Returns `true` if the lock was created reentrant.
    #[must_use]
    pub const fn is_reentrant(&self) -> bool {
        matches!(self.raw, RawLock::Reentrant(_))
    }

    /// Blocks until the calling thread owns the lock.
    ///
    /// # Panics
    ///
    /// With owner tracking, panics if a plain lock is re-entered by the
    /// thread that already owns it (which would otherwise deadlock).
    pub fn enter(&self) {
        match &self.raw {
            RawLock::Plain(raw) => {
                #[cfg(any(debug_assertions, feature = "owner-tracking"))]
                assert_ne!(
                    self.owner.load(Ordering::Relaxed),
                    current_thread_token(),
                    "Lock::enter: non-reentrant lock re-entered by its owner"
                );
                raw.lock();
            }
            RawLock::Reentrant(raw) => raw.lock(),
        }

        #[cfg(any(debug_assertions, feature = "owner-tracking"))]
        {
            self.owner.store(current_thread_token(), Ordering::Relaxed);
            self.depth.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Acquires the lock if it is free (or, for a reentrant lock, already
    /// owned by the caller). Never blocks.
    pub fn try_enter(&self) -> bool {
        let acquired = match &self.raw {
            RawLock::Plain(raw) => raw.try_lock(),
            RawLock::Reentrant(raw) => raw.try_lock(),
        };

        #[cfg(any(debug_assertions, feature = "owner-tracking"))]
        if acquired {
            self.owner.store(current_thread_token(), Ordering::Relaxed);
            self.depth.fetch_add(1, Ordering::Relaxed);
        }

        acquired
    }

    /// Releases one level of ownership.
    ///
    /// Leaving a lock the caller does not own is a usage error: it panics
    /// with owner tracking and is undefined behavior by contract without it.
    ///
    /// # Panics
    ///
    /// With owner tracking, panics if the calling thread is not the owner.
    pub fn leave(&self) {
        #[cfg(any(debug_assertions, feature = "owner-tracking"))]
        {
            assert_eq!(
                self.owner.load(Ordering::Relaxed),
                current_thread_token(),
                "Lock::leave: called by a thread that does not own the lock"
            );
            // The owner field must be cleared before the raw unlock publishes
            // the lock to the next thread.
            if self.depth.fetch_sub(1, Ordering::Relaxed) == 1 {
                self.owner.store(0, Ordering::Relaxed);
            }
        }

        match &self.raw {
            // SAFETY: the caller owns the lock (checked above when owner
            // tracking is compiled in, caller contract otherwise).
            RawLock::Plain(raw) => unsafe { raw.unlock() },
            // SAFETY: as above.
            RawLock::Reentrant(raw) => unsafe { raw.unlock() },
        }
    }

    /// Returns `true` if any thread holds the lock.
    #[must_use]
    pub fn is_held(&self) -> bool {
        match &self.raw {
            RawLock::Plain(raw) => raw.is_locked(),
            RawLock::Reentrant(raw) => raw.is_locked(),
        }
    }

    /// Returns `true` if the calling thread holds the lock.
    #[cfg(any(debug_assertions, feature = "owner-tracking"))]
    #[must_use]
    pub fn is_held_by_current_thread(&self) -> bool {
        self.owner.load(Ordering::Relaxed) == current_thread_token()
    }

    /// Current recursion depth of the owner (0 while free).
    #[cfg(any(debug_assertions, feature = "owner-tracking"))]
    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    /// Releases the lock's resources.
    ///
    /// # Panics
    ///
    /// Panics in debug builds if the lock is still held.
    pub fn destroy(self) {
        debug_assert!(!self.is_held(), "Lock::destroy: lock is still held");
    }
}

impl std::fmt::Debug for Lock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lock")
            .field("reentrant", &self.is_reentrant())
            .field("held", &self.is_held())
            .finish_non_exhaustive()
    }
}

/// Scoped ownership of a [`Lock`].
///
/// The holder remembers whether it currently owns the lock and releases it
/// on drop only if it does, so early release and deferred acquisition both
/// compose with unwinding.
///
/// ```
/// use gc_substrate::sync::{Lock, LockHolder};
///
/// let lock = Lock::init(false).unwrap();
/// {
///     let mut holder = LockHolder::new(&lock);
///     assert!(lock.is_held());
///     holder.release();
///     assert!(!lock.is_held());
/// }
/// assert!(!lock.is_held());
/// ```
#[must_use = "dropping a LockHolder releases the lock immediately"]
pub struct LockHolder<'a> {
    lock: &'a Lock,
    held: bool,
}

impl<'a> LockHolder<'a> {
    /// Acquires `lock` and returns a holder owning it.
    pub fn new(lock: &'a Lock) -> Self {
        lock.enter();
        Self { lock, held: true }
    }

    /// Returns a holder that does not own `lock` yet.
    pub const fn deferred(lock: &'a Lock) -> Self {
        Self { lock, held: false }
    }

    /// Acquires the lock.
    ///
    /// # Panics
    ///
    /// Panics in debug builds if this holder already owns the lock.
    pub fn acquire(&mut self) {
        debug_assert!(!self.held, "LockHolder::acquire: already held");
        if !self.held {
            self.lock.enter();
            self.held = true;
        }
    }

    /// Releases the lock before the holder goes out of scope.
    ///
    /// # Panics
    ///
    /// Panics in debug builds if this holder does not own the lock.
    pub fn release(&mut self) {
        debug_assert!(self.held, "LockHolder::release: not held");
        if self.held {
            self.held = false;
            self.lock.leave();
        }
    }

    /// Returns `true` while this holder owns the lock.
    #[must_use]
    pub const fn is_held(&self) -> bool {
        self.held
    }
}

impl Drop for LockHolder<'_> {
    fn drop(&mut self) {
        if self.held {
            self.lock.leave();
        }
    }
}
