//! Manual- and auto-reset events.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::alert::AlertState;
use crate::error::SyncError;

/// Outcome of [`Event::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    /// The event was signaled. For an auto-reset event this waiter consumed
    /// the signal.
    Signaled,
    /// The timeout elapsed first.
    TimedOut,
    /// An alertable wait was interrupted by an [`Alerter`](super::Alerter).
    /// This is not success: re-evaluate the condition being waited for.
    Interrupted,
    /// The wait could not be performed (the deadline is not representable).
    Failed,
}

pub(crate) struct EventInner {
    manual_reset: bool,
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl EventInner {
    /// Wakes every waiter so it re-checks its wake conditions.
    pub(crate) fn wake_all(&self) {
        // Taking the state lock orders this wakeup after any waiter's
        // pre-sleep check.
        let _state = self.signaled.lock();
        self.cond.notify_all();
    }
}

/// A signaled/non-signaled flag threads can block on.
///
/// A manual-reset event stays signaled until [`reset`](Event::reset) and
/// releases every waiter. An auto-reset event releases exactly one waiter
/// per [`set`](Event::set) and resets itself as part of that waiter's
/// success.
pub struct Event {
    inner: Arc<EventInner>,
}

impl Event {
    fn create(manual_reset: bool, initial: bool) -> Self {
        Self {
            inner: Arc::new(EventInner {
                manual_reset,
                signaled: Mutex::new(initial),
                cond: Condvar::new(),
            }),
        }
    }

    /// Creates a manual-reset event.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::CreateFailed`] if the platform cannot provide
    /// the event; never panics.
    #[allow(clippy::unnecessary_wraps)]
    pub fn create_manual(initial: bool) -> Result<Self, SyncError> {
        Ok(Self::create(true, initial))
    }

    /// Creates an auto-reset event.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::CreateFailed`] if the platform cannot provide
    /// the event; never panics.
    #[allow(clippy::unnecessary_wraps)]
    pub fn create_auto(initial: bool) -> Result<Self, SyncError> {
        Ok(Self::create(false, initial))
    }

    /// Returns `true` for a manual-reset event.
    #[must_use]
    pub fn is_manual_reset(&self) -> bool {
        self.inner.manual_reset
    }

    /// Signals the event. Idempotent.
    pub fn set(&self) {
        let mut signaled = self.inner.signaled.lock();
        *signaled = true;
        if self.inner.manual_reset {
            self.inner.cond.notify_all();
        } else {
            self.inner.cond.notify_one();
        }
    }

    /// Clears the event. Idempotent.
    pub fn reset(&self) {
        *self.inner.signaled.lock() = false;
    }

    /// Returns the current state without consuming an auto-reset signal.
    #[must_use]
    pub fn is_set(&self) -> bool {
        *self.inner.signaled.lock()
    }

    /// Blocks until the event is signaled, `timeout` elapses, or (when
    /// `alertable`) the thread is alerted.
    ///
    /// `None` waits forever. A signal takes precedence over a pending alert,
    /// which then stays pending for the next alertable wait.
    pub fn wait(&self, timeout: Option<Duration>, alertable: bool) -> WaitResult {
        let deadline = match timeout {
            None => None,
            Some(timeout) => match Instant::now().checked_add(timeout) {
                Some(deadline) => Some(deadline),
                None => return WaitResult::Failed,
            },
        };

        let alert = alertable.then(AlertState::current);
        let _parked = alert.as_ref().map(|state| state.park_on(&self.inner));

        let mut signaled = self.inner.signaled.lock();
        let mut timed_out = false;
        loop {
            if *signaled {
                if !self.inner.manual_reset {
                    *signaled = false;
                }
                return WaitResult::Signaled;
            }
            if alert.as_ref().is_some_and(|state| state.take()) {
                return WaitResult::Interrupted;
            }
            if timed_out {
                return WaitResult::TimedOut;
            }
            match deadline {
                None => self.inner.cond.wait(&mut signaled),
                Some(deadline) => {
                    timed_out = self.inner.cond.wait_until(&mut signaled, deadline).timed_out();
                }
            }
        }
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event")
            .field("manual_reset", &self.inner.manual_reset)
            .field("signaled", &self.is_set())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::alert::{take_pending_alert, Alerter};
    use std::thread;

    #[test]
    fn test_manual_event_stays_signaled() {
        let event = Event::create_manual(false).unwrap();
        event.set();
        event.set();
        assert_eq!(event.wait(Some(Duration::ZERO), false), WaitResult::Signaled);
        assert_eq!(event.wait(Some(Duration::ZERO), false), WaitResult::Signaled);
        event.reset();
        event.reset();
        assert_eq!(event.wait(Some(Duration::ZERO), false), WaitResult::TimedOut);
    }

    #[test]
    fn test_auto_event_consumed_by_one_wait() {
        let event = Event::create_auto(true).unwrap();
        assert!(event.is_set());
        assert_eq!(event.wait(Some(Duration::ZERO), false), WaitResult::Signaled);
        assert!(!event.is_set());
        assert_eq!(event.wait(Some(Duration::ZERO), false), WaitResult::TimedOut);
    }

    #[test]
    fn test_timeout_elapses() {
        let event = Event::create_manual(false).unwrap();
        let start = Instant::now();
        assert_eq!(event.wait(Some(Duration::from_millis(20)), false), WaitResult::TimedOut);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_unrepresentable_deadline_fails() {
        let event = Event::create_manual(false).unwrap();
        assert_eq!(event.wait(Some(Duration::MAX), false), WaitResult::Failed);
    }

    #[test]
    fn test_set_from_other_thread_wakes_waiter() {
        let event = Arc::new(Event::create_auto(false).unwrap());
        let setter = Arc::clone(&event);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            setter.set();
        });
        assert_eq!(event.wait(None, false), WaitResult::Signaled);
        handle.join().unwrap();
    }

    #[test]
    fn test_pending_alert_interrupts_alertable_wait_only() {
        let event = Event::create_manual(false).unwrap();
        Alerter::current().alert();

        // Non-alertable waits ignore the alert but leave it pending.
        assert_eq!(event.wait(Some(Duration::ZERO), false), WaitResult::TimedOut);
        assert_eq!(event.wait(None, true), WaitResult::Interrupted);
        // Consumed.
        assert!(!take_pending_alert());
    }

    #[test]
    fn test_signal_wins_over_pending_alert() {
        let event = Event::create_manual(true).unwrap();
        let alerter = Alerter::current();
        alerter.alert();
        assert_eq!(event.wait(None, true), WaitResult::Signaled);
        assert!(alerter.is_pending());
        assert!(take_pending_alert());
    }
}
