use core::fmt;
use core::mem::ManuallyDrop;
use core::ptr;
use core::sync::atomic::{
    self, AtomicI64,
    Ordering::{AcqRel, Acquire, Relaxed, Release},
};
use std::iter::FromIterator;

use crossbeam_utils::{Backoff, CachePadded};

use crate::activity::ActivityFlag;
use crate::census::Census;
use crate::counted::{AtomicCountedPtr, CountedPtr};
use crate::Container;

////////////////////////////////////////////////////////////////////////////////////////////////////
// RefCountStack
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A lock-free LIFO stack reclaiming memory with split reference counts.
///
/// The stack is only lock-free if the host natively supports 128-bit
/// compare-exchange, see [`is_lock_free`][RefCountStack::is_lock_free].
pub struct RefCountStack<T> {
    head: CachePadded<AtomicCountedPtr<Node<T>>>,
    activity: ActivityFlag,
    census: Census,
}

unsafe impl<T: Send> Send for RefCountStack<T> {}
unsafe impl<T: Send> Sync for RefCountStack<T> {}

/********** impl inherent *************************************************************************/

impl<T> RefCountStack<T> {
    /// Creates a new empty stack.
    #[inline]
    pub fn new() -> Self {
        Self {
            head: CachePadded::new(AtomicCountedPtr::null()),
            activity: ActivityFlag::new(),
            census: Census::default(),
        }
    }

    /// Returns `true` if the counted head pointer is natively lock-free on the
    /// current host.
    #[inline]
    pub fn is_lock_free() -> bool {
        AtomicCountedPtr::<Node<T>>::is_lock_free()
    }

    fn pop_counted(&self) -> Option<T> {
        let backoff = Backoff::new();
        let mut head = self.head.load(Relaxed);

        loop {
            head = self.head.increment_external(head);
            let node = head.node();
            if node.is_null() {
                return None;
            }

            // the incremented external count keeps the node alive
            let next = unsafe { (*node).next };
            match self.head.compare_exchange(head, next, AcqRel, Relaxed) {
                Ok(_) => unsafe {
                    let elem = Node::take_elem(node);
                    let increase = head.count() as i64 - 2;
                    if (*node).internal.fetch_add(increase, Release) == -increase {
                        atomic::fence(Acquire);
                        self.census.free(node);
                    }

                    return Some(elem);
                },
                Err(actual) => {
                    unsafe { self.release_ref(node) };
                    head = actual;
                    backoff.spin();
                }
            }
        }
    }

    /// Gives up the calling thread's reference to an unlinked or soon to be
    /// unlinked `node`.
    #[inline]
    unsafe fn release_ref(&self, node: *mut Node<T>) {
        if (*node).internal.fetch_sub(1, Relaxed) == 1 {
            atomic::fence(Acquire);
            self.census.free(node);
        }
    }
}

/********** impl Container ************************************************************************/

impl<T: Send> Container<T> for RefCountStack<T> {
    #[inline]
    fn push(&self, elem: T) -> bool {
        if !self.activity.is_active() {
            return false;
        }

        let node = CountedPtr::new(self.census.alloc(Node::new(elem)), 1);
        let backoff = Backoff::new();
        let mut head = self.head.load(Relaxed);

        loop {
            unsafe { (*node.node()).next = head };
            match self.head.compare_exchange_weak(head, node, Release, Relaxed) {
                Ok(_) => return true,
                Err(actual) => {
                    head = actual;
                    backoff.spin();
                }
            }
        }
    }

    #[inline]
    fn pop(&self) -> Option<T> {
        self.pop_counted()
    }

    /// Pops until the stack is empty.
    #[inline]
    fn clear(&self) -> usize {
        let mut count = 0;
        while self.pop_counted().is_some() {
            count += 1;
        }

        count
    }

    #[inline]
    fn is_active(&self) -> bool {
        self.activity.is_active()
    }

    #[inline]
    fn deactivate(&self) {
        self.activity.deactivate();
    }
}

/********** impl Default **************************************************************************/

impl<T> Default for RefCountStack<T> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

/********** impl Extend & FromIterator ************************************************************/

impl<T: Send> Extend<T> for RefCountStack<T> {
    #[inline]
    fn extend<I: IntoIterator<Item = T>>(&mut self, iter: I) {
        for elem in iter {
            self.push(elem);
        }
    }
}

impl<T: Send> FromIterator<T> for RefCountStack<T> {
    #[inline]
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut stack = Self::new();
        stack.extend(iter);
        stack
    }
}

/********** impl Debug ****************************************************************************/

impl<T> fmt::Debug for RefCountStack<T> {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("RefCountStack")
            .field("head", &*self.head)
            .field("activity", &self.activity)
            .finish()
    }
}

/********** impl Drop *****************************************************************************/

impl<T> Drop for RefCountStack<T> {
    #[inline]
    fn drop(&mut self) {
        self.activity.deactivate();

        let mut curr = self.head.load(Relaxed).node();
        while !curr.is_null() {
            unsafe {
                let next = (*curr).next.node();
                drop(Node::take_elem(curr));
                self.census.free(curr);
                curr = next;
            }
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Node
////////////////////////////////////////////////////////////////////////////////////////////////////

struct Node<T> {
    elem: ManuallyDrop<T>,
    internal: AtomicI64,
    next: CountedPtr<Node<T>>,
}

impl<T> Node<T> {
    #[inline]
    fn new(elem: T) -> Self {
        Self { elem: ManuallyDrop::new(elem), internal: AtomicI64::new(0), next: CountedPtr::null() }
    }

    /// # Safety
    ///
    /// Must be called at most once per node and only by the thread that
    /// unlinked it.
    #[inline]
    unsafe fn take_elem(node: *mut Self) -> T {
        ManuallyDrop::into_inner(ptr::read(ptr::addr_of!((*node).elem)))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Barrier};
    use std::thread;

    use super::RefCountStack;
    use crate::Container;

    #[test]
    fn lifo_order() {
        let stack: RefCountStack<_> = (0..8).collect();
        assert_eq!(stack.census.live(), 8);

        let popped: Vec<_> = (0..8).map(|_| stack.pop().unwrap()).collect();
        assert_eq!(popped, (0..8).rev().collect::<Vec<_>>());
        assert_eq!(stack.pop(), None);
        assert_eq!(stack.census.live(), 0);
    }

    #[test]
    fn empty_pop_is_repeatable() {
        let stack = RefCountStack::new();
        assert_eq!(stack.pop(), None);
        assert_eq!(stack.pop(), None);

        assert!(stack.push(1));
        assert_eq!(stack.pop(), Some(1));
        assert_eq!(stack.census.live(), 0);
    }

    #[test]
    fn clear_counts_removed() {
        let stack: RefCountStack<_> = (0..5).map(Box::new).collect();
        assert_eq!(stack.clear(), 5);
        assert_eq!(stack.clear(), 0);
        assert_eq!(stack.census.live(), 0);
    }

    #[test]
    fn lock_freedom_is_reported() {
        // only checks the query itself, the answer depends on the host
        let _ = RefCountStack::<i32>::is_lock_free();
    }

    #[test]
    fn concurrent_nodes_freed_exactly_once() {
        const THREADS: usize = 4;
        const PER_THREAD: usize = 10_000;

        let stack = Arc::new(RefCountStack::new());
        let barrier = Arc::new(Barrier::new(THREADS));

        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let stack = Arc::clone(&stack);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    let mut popped = 0usize;
                    for i in 0..PER_THREAD {
                        stack.push(t * PER_THREAD + i);
                        if stack.pop().is_some() {
                            popped += 1;
                        }
                    }
                    popped
                })
            })
            .collect();

        let popped: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(popped + stack.clear(), THREADS * PER_THREAD);
        assert_eq!(stack.census.allocated(), THREADS * PER_THREAD);
        assert_eq!(stack.census.live(), 0);
    }
}
