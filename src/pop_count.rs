//! A lock-free stack that defers freeing unlinked nodes while more than one
//! pop is in flight.
//!
//! Every pop announces itself in a shared counter.
//! A pop that finds itself the only one in flight may free its own node right
//! away and also frees all nodes deferred by earlier overlapping pops, as long
//! as no new pop has started in between.
//!
//! Deferred nodes are only freed when the counter passes through exactly one.
//! Under sustained overlapping pops the pending list can therefore grow
//! without bound, which can be observed through [`PopCountStack::pending`].

use core::fmt;
use core::mem::ManuallyDrop;
use core::ptr::{self, NonNull};
use core::sync::atomic::{
    AtomicPtr, AtomicUsize,
    Ordering::{Acquire, Relaxed, Release, SeqCst},
};
use std::iter::FromIterator;

use crossbeam_utils::{Backoff, CachePadded};

use crate::activity::ActivityFlag;
use crate::census::Census;
use crate::Container;

////////////////////////////////////////////////////////////////////////////////////////////////////
// PopCountStack
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A lock-free LIFO stack reclaiming memory once no pops overlap.
pub struct PopCountStack<T> {
    head: CachePadded<AtomicPtr<Node<T>>>,
    in_flight: CachePadded<AtomicUsize>,
    pending: AtomicPtr<Node<T>>,
    pending_len: AtomicUsize,
    activity: ActivityFlag,
    census: Census,
}

unsafe impl<T: Send> Send for PopCountStack<T> {}
unsafe impl<T: Send> Sync for PopCountStack<T> {}

/********** impl inherent *************************************************************************/

impl<T> PopCountStack<T> {
    /// Creates a new empty stack.
    #[inline]
    pub fn new() -> Self {
        Self {
            head: CachePadded::new(AtomicPtr::new(ptr::null_mut())),
            in_flight: CachePadded::new(AtomicUsize::new(0)),
            pending: AtomicPtr::new(ptr::null_mut()),
            pending_len: AtomicUsize::new(0),
            activity: ActivityFlag::new(),
            census: Census::default(),
        }
    }

    /// Returns the approximate number of unlinked nodes waiting to be freed.
    #[inline]
    pub fn pending(&self) -> usize {
        self.pending_len.load(Relaxed)
    }

    fn pop_counted(&self) -> Option<T> {
        self.in_flight.fetch_add(1, SeqCst);

        let backoff = Backoff::new();
        let mut head = self.head.load(Acquire);
        while !head.is_null() {
            // nodes are not freed while this pop is counted
            let next = unsafe { (*head).next.load(Relaxed) };
            match self.head.compare_exchange_weak(head, next, Acquire, Acquire) {
                Ok(_) => break,
                Err(actual) => {
                    head = actual;
                    backoff.spin();
                }
            }
        }

        let unlinked = NonNull::new(head);
        let elem = unlinked.map(|node| unsafe { Node::take_elem(node.as_ptr()) });
        self.try_reclaim(unlinked);

        elem
    }

    /// Frees `unlinked` and all deferred nodes if the calling pop is the only
    /// one in flight, otherwise defers `unlinked`, then ends the pop.
    fn try_reclaim(&self, unlinked: Option<NonNull<Node<T>>>) {
        if self.in_flight.load(SeqCst) == 1 {
            let chain = self.pending.swap(ptr::null_mut(), SeqCst);
            let len = self.pending_len.swap(0, Relaxed);

            if self.in_flight.fetch_sub(1, SeqCst) == 1 {
                unsafe { self.free_chain(chain) };
            } else if let Some(first) = NonNull::new(chain) {
                unsafe { self.defer_list(first, len) };
            }

            if let Some(node) = unlinked {
                unsafe { self.census.free(node.as_ptr()) };
            }
        } else {
            // the node's link still points into the stack, so it is deferred on its own
            if let Some(node) = unlinked {
                unsafe { self.defer_chain(node, node, 1) };
            }

            self.in_flight.fetch_sub(1, SeqCst);
        }
    }

    /// Prepends a `null` terminated list of `len` nodes starting at `first`
    /// to the pending list.
    ///
    /// # Safety
    ///
    /// The list must be exclusively owned by the caller.
    unsafe fn defer_list(&self, first: NonNull<Node<T>>, len: usize) {
        let mut last = first.as_ptr();
        loop {
            let next = (*last).next.load(Relaxed);
            if next.is_null() {
                break;
            }

            last = next;
        }

        self.defer_chain(first, NonNull::new_unchecked(last), len);
    }

    /// Prepends the chain of `len` nodes from `first` to `last` to the pending
    /// list, overwriting the link of `last`.
    ///
    /// # Safety
    ///
    /// The chain must be unlinked from the stack and exclusively owned by the
    /// caller.
    unsafe fn defer_chain(&self, first: NonNull<Node<T>>, last: NonNull<Node<T>>, len: usize) {
        let last = last.as_ptr();
        self.pending_len.fetch_add(len, Relaxed);

        let backoff = Backoff::new();
        let mut pending = self.pending.load(Relaxed);
        loop {
            (*last).next.store(pending, Relaxed);
            match self.pending.compare_exchange_weak(pending, first.as_ptr(), Release, Relaxed) {
                Ok(_) => return,
                Err(actual) => {
                    pending = actual;
                    backoff.spin();
                }
            }
        }
    }

    /// Frees a chain of nodes whose elements have already been taken.
    unsafe fn free_chain(&self, mut curr: *mut Node<T>) {
        while !curr.is_null() {
            let next = (*curr).next.load(Relaxed);
            self.census.free(curr);
            curr = next;
        }
    }
}

/********** impl Container ************************************************************************/

impl<T: Send> Container<T> for PopCountStack<T> {
    #[inline]
    fn push(&self, elem: T) -> bool {
        if !self.activity.is_active() {
            return false;
        }

        let node = self.census.alloc(Node::new(elem));
        let backoff = Backoff::new();
        let mut head = self.head.load(Relaxed);

        loop {
            unsafe { (*node).next.store(head, Relaxed) };
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

    /// Unlinks all nodes at once, drops their elements and defers the nodes.
    ///
    /// Elements pushed concurrently may or may not be removed.
    fn clear(&self) -> usize {
        let first = match NonNull::new(self.head.swap(ptr::null_mut(), Acquire)) {
            Some(first) => first,
            None => return 0,
        };

        let mut count = 1;
        let mut last = first.as_ptr();
        unsafe {
            drop(Node::take_elem(last));
            loop {
                let next = (*last).next.load(Relaxed);
                if next.is_null() {
                    break;
                }

                drop(Node::take_elem(next));
                last = next;
                count += 1;
            }

            self.defer_chain(first, NonNull::new_unchecked(last), count);
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

impl<T> Default for PopCountStack<T> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

/********** impl Extend & FromIterator ************************************************************/

impl<T: Send> Extend<T> for PopCountStack<T> {
    #[inline]
    fn extend<I: IntoIterator<Item = T>>(&mut self, iter: I) {
        for elem in iter {
            self.push(elem);
        }
    }
}

impl<T: Send> FromIterator<T> for PopCountStack<T> {
    #[inline]
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut stack = Self::new();
        stack.extend(iter);
        stack
    }
}

/********** impl Debug ****************************************************************************/

impl<T> fmt::Debug for PopCountStack<T> {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PopCountStack")
            .field("head", &self.head.load(Relaxed))
            .field("in_flight", &self.in_flight.load(Relaxed))
            .field("pending", &self.pending())
            .field("activity", &self.activity)
            .finish()
    }
}

/********** impl Drop *****************************************************************************/

impl<T> Drop for PopCountStack<T> {
    fn drop(&mut self) {
        self.activity.deactivate();

        let backoff = Backoff::new();
        while self.in_flight.load(Acquire) != 0 {
            backoff.snooze();
        }

        let mut curr = *self.head.get_mut();
        while !curr.is_null() {
            unsafe {
                let next = (*curr).next.load(Relaxed);
                drop(Node::take_elem(curr));
                self.census.free(curr);
                curr = next;
            }
        }

        let pending = *self.pending.get_mut();
        unsafe { self.free_chain(pending) };
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Node
////////////////////////////////////////////////////////////////////////////////////////////////////

struct Node<T> {
    elem: ManuallyDrop<T>,
    /// The link in the stack, later reused as the link in the pending list.
    next: AtomicPtr<Node<T>>,
}

impl<T> Node<T> {
    #[inline]
    fn new(elem: T) -> Self {
        Self { elem: ManuallyDrop::new(elem), next: AtomicPtr::new(ptr::null_mut()) }
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
    use core::ptr::{self, NonNull};
    use std::sync::atomic::Ordering;
    use std::sync::{Arc, Barrier};
    use std::thread;

    use super::{Node, PopCountStack};
    use crate::Container;

    fn chain_len<T>(mut curr: *mut Node<T>) -> usize {
        let mut len = 0;
        while !curr.is_null() {
            curr = unsafe { (*curr).next.load(Ordering::Relaxed) };
            len += 1;
        }
        len
    }

    #[test]
    fn lifo_order() {
        let stack: PopCountStack<_> = (0..8).collect();
        let popped: Vec<_> = (0..8).map(|_| stack.pop().unwrap()).collect();

        assert_eq!(popped, (0..8).rev().collect::<Vec<_>>());
        assert_eq!(stack.pop(), None);
        assert_eq!(stack.pending(), 0);
        assert_eq!(stack.census.live(), 0);
    }

    #[test]
    fn overlapping_pop_defers() {
        let stack: PopCountStack<_> = (0..4).collect();

        // simulates another pop being in flight
        stack.in_flight.fetch_add(1, Ordering::SeqCst);
        assert_eq!(stack.pop(), Some(3));
        assert_eq!(stack.pop(), Some(2));
        assert_eq!(stack.pending(), 2);
        assert_eq!(stack.census.live(), 4);
        stack.in_flight.fetch_sub(1, Ordering::SeqCst);

        // a lone pop frees its own node and the deferred ones
        assert_eq!(stack.pop(), Some(1));
        assert_eq!(stack.pending(), 0);
        assert_eq!(stack.census.live(), 1);
    }

    #[test]
    fn overlapping_pop_defers_only_its_own_node() {
        let stack: PopCountStack<_> = (0..4).collect();

        stack.in_flight.fetch_add(1, Ordering::SeqCst);
        assert_eq!(stack.pop(), Some(3));
        assert_eq!(chain_len(stack.pending.load(Ordering::SeqCst)), 1);
        assert_eq!(chain_len(stack.head.load(Ordering::SeqCst)), 3);

        assert_eq!(stack.pop(), Some(2));
        assert_eq!(chain_len(stack.pending.load(Ordering::SeqCst)), 2);
        assert_eq!(chain_len(stack.head.load(Ordering::SeqCst)), 2);
        stack.in_flight.fetch_sub(1, Ordering::SeqCst);

        assert_eq!(stack.pop(), Some(1));
        assert_eq!(stack.pop(), Some(0));
        assert_eq!(stack.pop(), None);
        assert!(stack.pending.load(Ordering::SeqCst).is_null());
        assert_eq!(stack.census.live(), 0);
    }

    #[test]
    fn drained_list_is_deferred_again_whole() {
        let stack: PopCountStack<_> = (0..4).collect();
        stack.clear();
        stack.in_flight.fetch_add(1, Ordering::SeqCst);

        // what a lone pop does when another pop starts after it drained the list
        let first = stack.pending.swap(ptr::null_mut(), Ordering::SeqCst);
        let len = stack.pending_len.swap(0, Ordering::Relaxed);
        stack.in_flight.fetch_add(1, Ordering::SeqCst);
        unsafe { stack.defer_list(NonNull::new(first).unwrap(), len) };

        assert_eq!(chain_len(stack.pending.load(Ordering::SeqCst)), 4);
        assert_eq!(stack.pending(), 4);
        stack.in_flight.fetch_sub(2, Ordering::SeqCst);

        assert_eq!(stack.pop(), None);
        assert_eq!(stack.census.live(), 0);
    }

    #[test]
    fn clear_defers_unlinked_nodes() {
        let stack: PopCountStack<_> = (0..5).map(|i| vec![i; 4]).collect();
        assert_eq!(stack.clear(), 5);
        assert_eq!(stack.clear(), 0);
        assert_eq!(stack.pending(), 5);

        // the next lone pop, even on an empty stack, frees them
        assert_eq!(stack.pop(), None);
        assert_eq!(stack.pending(), 0);
        assert_eq!(stack.census.live(), 0);
    }

    #[test]
    fn concurrent_nodes_freed_exactly_once() {
        const THREADS: usize = 4;
        const PER_THREAD: usize = 10_000;

        let stack = Arc::new(PopCountStack::new());
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

        // quiescent now, one lone pop drains every deferred node
        assert_eq!(stack.pop(), None);
        assert_eq!(stack.pending(), 0);
        assert_eq!(stack.census.live(), 0);
    }
}
