use core::cmp::PartialEq;
use core::fmt;
use core::marker::PhantomData;

use crate::counted::{self, CountedPtr};

////////////////////////////////////////////////////////////////////////////////////////////////////
// Copy & Clone
////////////////////////////////////////////////////////////////////////////////////////////////////

impl<T> Clone for CountedPtr<T> {
    #[inline]
    fn clone(&self) -> Self {
        Self::from_raw(self.inner)
    }
}

impl<T> Copy for CountedPtr<T> {}

////////////////////////////////////////////////////////////////////////////////////////////////////
// inherent (const)
////////////////////////////////////////////////////////////////////////////////////////////////////

impl<T> CountedPtr<T> {
    /// Creates a `null` pointer with an external count of zero.
    #[inline]
    pub const fn null() -> Self {
        Self::from_raw(0)
    }

    /// Creates a counted pointer from its integer representation.
    #[inline]
    pub const fn from_raw(raw: u128) -> Self {
        Self { inner: raw, _marker: PhantomData }
    }

    /// Returns the integer representation of the counted pointer.
    #[inline]
    pub const fn into_raw(self) -> u128 {
        self.inner
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// inherent
////////////////////////////////////////////////////////////////////////////////////////////////////

impl<T> CountedPtr<T> {
    /// Composes a new counted pointer from a raw pointer and an external count.
    #[inline]
    pub fn new(node: *mut T, count: u64) -> Self {
        Self::from_raw(counted::compose(node as usize, count))
    }

    /// Returns the raw pointer, stripped of its count.
    #[inline]
    pub fn node(self) -> *mut T {
        counted::decompose_addr(self.inner) as *mut T
    }

    /// Returns the external count.
    #[inline]
    pub fn count(self) -> u64 {
        counted::decompose_count(self.inner)
    }

    /// Returns the same pointer with its count replaced by `count`.
    #[inline]
    pub fn with_count(self, count: u64) -> Self {
        Self::new(self.node(), count)
    }

    /// Returns the same pointer with its count incremented by one.
    #[inline]
    pub fn incremented(self) -> Self {
        let count = self.count();
        debug_assert!(count < u64::max_value(), "external count overflow");
        self.with_count(count + 1)
    }

    /// Returns `true` if both pointers refer to the same node, regardless of
    /// their counts.
    #[inline]
    pub fn same_node(self, other: Self) -> bool {
        self.node() == other.node()
    }

    /// Returns true if the pointer is `null` (regardless of the count).
    #[inline]
    pub fn is_null(self) -> bool {
        self.node().is_null()
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Default
////////////////////////////////////////////////////////////////////////////////////////////////////

impl<T> Default for CountedPtr<T> {
    #[inline]
    fn default() -> Self {
        Self::null()
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Debug
////////////////////////////////////////////////////////////////////////////////////////////////////

impl<T> fmt::Debug for CountedPtr<T> {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CountedPtr").field("node", &self.node()).field("count", &self.count()).finish()
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// PartialEq
////////////////////////////////////////////////////////////////////////////////////////////////////

impl<T> PartialEq for CountedPtr<T> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.inner == other.inner
    }
}

impl<T> Eq for CountedPtr<T> {}
