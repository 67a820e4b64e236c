use core::fmt;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crossbeam_utils::Backoff;

////////////////////////////////////////////////////////////////////////////////////////////////////
// Retired
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A record for a node that has been unlinked from its container but may not
/// yet be freed, because some hazard slot may still publish it.
pub(crate) struct Retired<T> {
    node: NonNull<T>,
    next: *mut Retired<T>,
}

/********** impl inherent *************************************************************************/

impl<T> Retired<T> {
    #[inline]
    pub fn new(node: NonNull<T>) -> Self {
        Self { node, next: ptr::null_mut() }
    }

    /// Returns the raw pointer to the retired node.
    #[inline]
    pub fn as_ptr(&self) -> *mut T {
        self.node.as_ptr()
    }
}

/********** impl Debug ****************************************************************************/

impl<T> fmt::Debug for Retired<T> {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Retired").field("address", &self.as_ptr()).finish()
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// RetiredList
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A lock-free singly linked list of [`Retired`] records owned by one
/// container.
pub(crate) struct RetiredList<T> {
    head: AtomicPtr<Retired<T>>,
    len: AtomicUsize,
}

/********** impl inherent *************************************************************************/

impl<T> RetiredList<T> {
    #[inline]
    pub const fn new() -> Self {
        Self { head: AtomicPtr::new(ptr::null_mut()), len: AtomicUsize::new(0) }
    }

    /// Returns the approximate number of retired records.
    #[inline]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    /// Appends a new record for `node`.
    #[inline]
    pub fn retire(&self, node: NonNull<T>) {
        self.push(Box::new(Retired::new(node)));
    }

    /// Appends an existing record.
    #[inline]
    pub fn push(&self, record: Box<Retired<T>>) {
        let record = Box::into_raw(record);
        unsafe { self.push_chain(Chain { first: record, last: record, len: 1 }) };
    }

    /// Removes all records at once.
    #[inline]
    pub fn take(&self) -> Chain<T> {
        let first = self.head.swap(ptr::null_mut(), Ordering::Acquire);
        let mut chain = Chain { first, last: first, len: 0 };

        if !first.is_null() {
            chain.len = 1;
            unsafe {
                while !(*chain.last).next.is_null() {
                    chain.last = (*chain.last).next;
                    chain.len += 1;
                }
            }
        }

        self.len.fetch_sub(chain.len, Ordering::Relaxed);
        chain
    }

    /// Re-attaches a previously taken chain of records.
    ///
    /// # Safety
    ///
    /// `chain` must be a valid chain obtained from [`take`][RetiredList::take]
    /// (or a single owned record) whose links have not been modified.
    #[inline]
    pub unsafe fn push_chain(&self, chain: Chain<T>) {
        if chain.first.is_null() {
            return;
        }

        self.len.fetch_add(chain.len, Ordering::Relaxed);

        let backoff = Backoff::new();
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            (*chain.last).next = head;
            match self.head.compare_exchange_weak(
                head,
                chain.first,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => {
                    head = actual;
                    backoff.spin();
                }
            }
        }
    }
}

/********** impl Debug ****************************************************************************/

impl<T> fmt::Debug for RetiredList<T> {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("RetiredList").field("len", &self.len()).finish()
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Chain
////////////////////////////////////////////////////////////////////////////////////////////////////

/// An exclusively owned run of [`Retired`] records taken from a
/// [`RetiredList`].
///
/// The chain must be consumed, either by iterating it or by re-attaching it
/// with [`push_chain`][RetiredList::push_chain], or its records are leaked.
pub(crate) struct Chain<T> {
    first: *mut Retired<T>,
    last: *mut Retired<T>,
    len: usize,
}

impl<T> Chain<T> {
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }
}

impl<T> Iterator for Chain<T> {
    type Item = Box<Retired<T>>;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        if self.first.is_null() {
            return None;
        }

        let mut record = unsafe { Box::from_raw(self.first) };
        self.first = record.next;
        self.len -= 1;
        record.next = ptr::null_mut();

        Some(record)
    }
}
