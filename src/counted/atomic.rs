use core::fmt;
use core::marker::PhantomData;
use core::sync::atomic::Ordering::{self, Acquire, Relaxed};

use crossbeam_utils::Backoff;
use portable_atomic::AtomicU128;

use crate::counted::{AtomicCountedPtr, CountedPtr};

////////////////////////////////////////////////////////////////////////////////////////////////////
// impl inherent (const)
////////////////////////////////////////////////////////////////////////////////////////////////////

impl<T> AtomicCountedPtr<T> {
    /// Creates a new `null` pointer with an external count of zero.
    #[inline]
    pub const fn null() -> Self {
        Self { inner: AtomicU128::new(0), _marker: PhantomData }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// impl inherent
////////////////////////////////////////////////////////////////////////////////////////////////////

impl<T> AtomicCountedPtr<T> {
    /// Creates a new `AtomicCountedPtr`.
    #[inline]
    pub fn new(ptr: CountedPtr<T>) -> Self {
        Self { inner: AtomicU128::new(ptr.into_raw()), _marker: PhantomData }
    }

    /// Returns `true` if operations on this type are natively lock-free on the
    /// current host, i.e. do not go through the global lock fallback of
    /// `portable-atomic`.
    #[inline]
    pub fn is_lock_free() -> bool {
        AtomicU128::is_lock_free()
    }

    /// Loads a value from the pointer.
    ///
    /// # Panics
    ///
    /// Panics if `order` is [`Release`][release] or [`AcqRel`][acq_rel].
    ///
    /// [release]: core::sync::atomic::Ordering::Release
    /// [acq_rel]: core::sync::atomic::Ordering::AcqRel
    #[inline]
    pub fn load(&self, order: Ordering) -> CountedPtr<T> {
        CountedPtr::from_raw(self.inner.load(order))
    }

    /// Stores a value into the pointer, returning the previous value.
    #[inline]
    pub fn swap(&self, ptr: CountedPtr<T>, order: Ordering) -> CountedPtr<T> {
        CountedPtr::from_raw(self.inner.swap(ptr.into_raw(), order))
    }

    /// Stores a value into the pointer if the current value (address *and*
    /// count) is the same as `current`.
    #[inline]
    pub fn compare_exchange(
        &self,
        current: CountedPtr<T>,
        new: CountedPtr<T>,
        success: Ordering,
        failure: Ordering,
    ) -> Result<CountedPtr<T>, CountedPtr<T>> {
        self.inner
            .compare_exchange(current.into_raw(), new.into_raw(), success, failure)
            .map(CountedPtr::from_raw)
            .map_err(CountedPtr::from_raw)
    }

    /// Stores a value into the pointer if the current value (address *and*
    /// count) is the same as `current`.
    ///
    /// Unlike [`compare_exchange`][AtomicCountedPtr::compare_exchange], this
    /// function is allowed to spuriously fail.
    #[inline]
    pub fn compare_exchange_weak(
        &self,
        current: CountedPtr<T>,
        new: CountedPtr<T>,
        success: Ordering,
        failure: Ordering,
    ) -> Result<CountedPtr<T>, CountedPtr<T>> {
        self.inner
            .compare_exchange_weak(current.into_raw(), new.into_raw(), success, failure)
            .map(CountedPtr::from_raw)
            .map_err(CountedPtr::from_raw)
    }

    /// Increments the external count of whatever node is currently stored,
    /// starting from the expectation `current`, and returns the stored value
    /// *after* the increment.
    ///
    /// A successful increment announces that the calling thread is about to
    /// dereference the returned node, which keeps it from being freed until
    /// the thread releases that reference again.
    /// The increment acquires, so the node's contents published by the thread
    /// that stored it are visible to the caller.
    #[inline]
    pub fn increment_external(&self, mut current: CountedPtr<T>) -> CountedPtr<T> {
        let backoff = Backoff::new();
        loop {
            let incremented = current.incremented();
            match self.compare_exchange_weak(current, incremented, Acquire, Relaxed) {
                Ok(_) => return incremented,
                Err(actual) => {
                    current = actual;
                    backoff.spin();
                }
            }
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Default
////////////////////////////////////////////////////////////////////////////////////////////////////

impl<T> Default for AtomicCountedPtr<T> {
    #[inline]
    fn default() -> Self {
        Self::null()
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Debug
////////////////////////////////////////////////////////////////////////////////////////////////////

impl<T> fmt::Debug for AtomicCountedPtr<T> {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let ptr = self.load(Relaxed);
        f.debug_struct("AtomicCountedPtr")
            .field("node", &ptr.node())
            .field("count", &ptr.count())
            .finish()
    }
}
