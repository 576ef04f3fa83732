//! Handle kinds and how the collector treats each one.

use std::fmt;

/// The kind of a handle, fixed for the handle's lifetime.
///
/// Kinds are a closed set. A kind never combines with another; pinning
/// variants are distinct enumerators rather than flags on a root kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum HandleKind {
    /// Always a root; keeps the referent alive.
    Strong = 0,
    /// Not a root. Cleared once the referent is unreachable, independent of
    /// finalization.
    Weak = 1,
    /// Cleared before finalizable objects are resurrected for finalization.
    WeakShort = 2,
    /// Cleared only after finalization has run.
    WeakLong = 3,
    /// Root that also forbids relocating the referent.
    Pinned = 4,
    /// Root carrying an approximate byte size in the slot's extra word.
    SizedRef = 5,
    /// Pinned for the duration of an outstanding asynchronous operation.
    AsyncPinned = 6,
    /// Root only while the reference count in the slot's extra word is
    /// non-zero.
    Refcounted = 7,
}

impl HandleKind {
    /// Number of kinds.
    pub const COUNT: usize = 8;

    /// Every kind, in declaration order.
    pub const ALL: [Self; Self::COUNT] = [
        Self::Strong,
        Self::Weak,
        Self::WeakShort,
        Self::WeakLong,
        Self::Pinned,
        Self::SizedRef,
        Self::AsyncPinned,
        Self::Refcounted,
    ];

    /// Dense index in `0..COUNT`.
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Returns `true` if handles of this kind can keep their referent alive.
    ///
    /// [`Refcounted`](Self::Refcounted) is a root only while its count is
    /// non-zero; that is decided per slot during the root scan.
    #[must_use]
    pub const fn is_root(self) -> bool {
        matches!(
            self,
            Self::Strong | Self::Pinned | Self::SizedRef | Self::AsyncPinned | Self::Refcounted
        )
    }

    /// Returns `true` if a moving collector must leave the referent in place.
    #[must_use]
    pub const fn is_pinning(self) -> bool {
        matches!(self, Self::Pinned | Self::AsyncPinned)
    }

    /// Returns `true` for the kinds the collector clears instead of tracing.
    #[must_use]
    pub const fn is_weak(self) -> bool {
        matches!(self, Self::Weak | Self::WeakShort | Self::WeakLong)
    }

    /// Human-readable name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Strong => "strong",
            Self::Weak => "weak",
            Self::WeakShort => "weak-short",
            Self::WeakLong => "weak-long",
            Self::Pinned => "pinned",
            Self::SizedRef => "sized-ref",
            Self::AsyncPinned => "async-pinned",
            Self::Refcounted => "refcounted",
        }
    }
}

impl fmt::Display for HandleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
