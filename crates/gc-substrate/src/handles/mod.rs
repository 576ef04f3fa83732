//! Typed, indirect references into the managed heap for code that lives
//! outside it.
//!
//! A [`Handle`] names a slot in a [`HandleTable`]. The slot holds the
//! referent (an opaque [`ObjectRef`]) and a [`HandleKind`] that tells the
//! collector whether the referent is a root, a weak reference to clear, or
//! something pinned in place.
//!
//! ```
//! use gc_substrate::handles::{HandleKind, HandleTable, ObjectRef};
//!
//! let table = HandleTable::new().unwrap();
//! let obj = ObjectRef::from_addr(0x1000);
//! let weak = table.create(HandleKind::Weak, obj).unwrap();
//! assert_eq!(table.dereference(weak), obj);
//!
//! // The collector found the referent unreachable.
//! table.enumerate_by_kind(HandleKind::Weak, |_, _| ObjectRef::NULL);
//! assert!(table.dereference(weak).is_null());
//! table.destroy(weak);
//! ```

mod kind;
mod table;

pub use kind::HandleKind;
pub use table::{HandleTable, HandleTableConfig, DEFAULT_MAX_BLOCKS, HANDLES_PER_BLOCK, MAX_BLOCKS};

use std::fmt;
use std::num::NonZeroUsize;

/// An opaque, pointer-sized referent value.
///
/// The substrate never interprets the bits beyond comparing with
/// [`ObjectRef::NULL`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct ObjectRef(usize);

impl ObjectRef {
    /// The null referent.
    pub const NULL: Self = Self(0);

    /// Wraps a raw address.
    #[must_use]
    pub const fn from_addr(addr: usize) -> Self {
        Self(addr)
    }

    /// Wraps a pointer.
    #[must_use]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize)
    }

    /// The raw address.
    #[must_use]
    pub const fn addr(self) -> usize {
        self.0
    }

    /// Returns `true` for [`ObjectRef::NULL`].
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectRef({:#x})", self.0)
    }
}

/// Opaque identifier of a handle-table slot.
///
/// `Handle` is `Copy` and pointer-sized, and so is `Option<Handle>`. It
/// carries no lifetime: keeping it valid between
/// [`create`](HandleTable::create) and [`destroy`](HandleTable::destroy) is
/// the owner's job, exactly as with any other manually managed handle.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(NonZeroUsize);

impl Handle {
    pub(crate) const fn from_index(index: usize) -> Self {
        Self(NonZeroUsize::MIN.saturating_add(index))
    }

    pub(crate) const fn index(self) -> usize {
        self.0.get() - 1
    }

    /// Converts the handle to a raw non-zero integer, e.g. to pass it across
    /// an FFI boundary.
    #[must_use]
    pub const fn into_raw(self) -> usize {
        self.0.get()
    }

    /// Rebuilds a handle from [`into_raw`](Self::into_raw) output. Returns
    /// `None` for zero.
    #[must_use]
    pub const fn from_raw(raw: usize) -> Option<Self> {
        match NonZeroUsize::new(raw) {
            Some(raw) => Some(Self(raw)),
            None => None,
        }
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({})", self.index())
    }
}
