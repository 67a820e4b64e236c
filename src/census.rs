//! Bookkeeping of node allocations for the unit tests.
//!
//! Every container allocates and frees its nodes through a [`Census`].
//! Outside of `cfg(test)` the type is zero-sized and all of its methods
//! compile to nothing.

#[cfg(test)]
use core::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};

#[derive(Debug, Default)]
pub(crate) struct Census {
    #[cfg(test)]
    live: AtomicIsize,
    #[cfg(test)]
    allocated: AtomicUsize,
}

impl Census {
    #[inline]
    pub fn alloc<T>(&self, node: T) -> *mut T {
        #[cfg(test)]
        {
            self.live.fetch_add(1, Ordering::Relaxed);
            self.allocated.fetch_add(1, Ordering::Relaxed);
        }

        Box::into_raw(Box::new(node))
    }

    /// Drops and de-allocates a node created by [`alloc`][Census::alloc].
    ///
    /// # Safety
    ///
    /// `node` must have been allocated by this census and must not be freed
    /// more than once or while any other thread may still access it.
    #[inline]
    pub unsafe fn free<T>(&self, node: *mut T) {
        #[cfg(test)]
        {
            let prev = self.live.fetch_sub(1, Ordering::Relaxed);
            assert!(prev > 0, "node freed more often than allocated");
        }

        drop(Box::from_raw(node));
    }

    /// The number of nodes currently allocated and not yet freed.
    #[cfg(test)]
    pub fn live(&self) -> isize {
        self.live.load(Ordering::SeqCst)
    }

    /// The total number of nodes ever allocated.
    #[cfg(test)]
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::SeqCst)
    }
}
