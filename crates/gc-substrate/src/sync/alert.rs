//! Per-thread interruption of alertable waits.
//!
//! Every thread owns one alert flag. Another thread can raise it through an
//! [`Alerter`]; the target observes it as [`WaitResult::Interrupted`] from its
//! current (or next) alertable [`Event::wait`](super::Event::wait).
//!
//! [`WaitResult::Interrupted`]: super::WaitResult::Interrupted

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::event::EventInner;

#[derive(Default)]
pub(crate) struct AlertState {
    pending: AtomicBool,
    /// Event the owning thread is blocked on in an alertable wait.
    parked_on: Mutex<Option<Arc<EventInner>>>,
}

thread_local! {
    static CURRENT: Arc<AlertState> = Arc::new(AlertState::default());
}

impl AlertState {
    pub(crate) fn current() -> Arc<Self> {
        CURRENT.with(Arc::clone)
    }

    /// Consumes a pending alert.
    pub(crate) fn take(&self) -> bool {
        self.pending.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn park_on(&self, event: &Arc<EventInner>) -> Parked<'_> {
        *self.parked_on.lock() = Some(Arc::clone(event));
        Parked { state: self }
    }
}

pub(crate) struct Parked<'a> {
    state: &'a AlertState,
}

impl Drop for Parked<'_> {
    fn drop(&mut self) {
        *self.state.parked_on.lock() = None;
    }
}

/// Handle that interrupts alertable waits on one particular thread.
///
/// `Alerter` is `Send + Sync + Clone`: obtain it on the target thread with
/// [`Alerter::current`] and hand it to whoever needs to interrupt that
/// thread (typically the suspension coordinator).
#[derive(Clone)]
pub struct Alerter {
    state: Arc<AlertState>,
}

impl Alerter {
    /// Returns the alerter for the calling thread.
    #[must_use]
    pub fn current() -> Self {
        Self {
            state: AlertState::current(),
        }
    }

    /// Raises the target thread's alert.
    ///
    /// If the thread is blocked in an alertable wait it wakes with
    /// `Interrupted`; otherwise the alert stays pending until its next
    /// alertable wait or until [`take_pending_alert`] consumes it.
    pub fn alert(&self) {
        self.state.pending.store(true, Ordering::Release);
        let parked = self.state.parked_on.lock().clone();
        if let Some(event) = parked {
            event.wake_all();
        }
    }

    /// Returns `true` if an alert is pending for the target thread.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.state.pending.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Alerter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Alerter")
            .field("pending", &self.is_pending())
            .finish()
    }
}

/// Consumes a pending alert for the calling thread, returning whether one
/// was pending.
pub fn take_pending_alert() -> bool {
    CURRENT.with(|state| state.take())
}
