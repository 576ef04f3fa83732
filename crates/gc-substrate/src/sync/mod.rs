//! Lock and event primitives used by the rest of the crate and by the
//! collector's suspend/resume rendezvous.
//!
//! - [`Lock`]: explicit `enter`/`leave` mutual exclusion, optionally
//!   reentrant, with owner tracking in debug builds (or with the
//!   `owner-tracking` feature).
//! - [`LockHolder`]: scoped ownership with deferred acquisition and early
//!   release.
//! - [`Event`]: manual/auto-reset event with timed, alertable waits.
//! - [`Alerter`]: interrupts another thread's alertable waits.
//!
//! Creation reports failure through `Result` and never panics. Using a
//! primitive incorrectly (leaving a lock you don't hold, destroying a held
//! lock) is a usage error that asserts in debug builds.

mod alert;
mod event;
mod lock;

pub use alert::{take_pending_alert, Alerter};
pub use event::{Event, WaitResult};
pub use lock::{Lock, LockHolder};
