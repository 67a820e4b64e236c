//! An experimental lock-free stack whose nodes are reference counted shared
//! pointers, leaving reclamation entirely to [`Arc`].
//!
//! The head is an [`ArcSwapOption`], so loading it yields an owned snapshot
//! that keeps the node alive for as long as the snapshot exists, and swapping
//! it is a single compare-and-swap on the shared pointer.
//! As a node can not be freed and re-allocated while any snapshot of it
//! exists, comparing snapshots by address is free of the ABA problem.

use core::cell::UnsafeCell;
use core::fmt;
use std::iter::FromIterator;
use std::sync::Arc;

use arc_swap::{ArcSwapOption, Guard};
use crossbeam_utils::{Backoff, CachePadded};

use crate::activity::ActivityFlag;
use crate::Container;

type Link<T> = Option<Arc<Node<T>>>;

////////////////////////////////////////////////////////////////////////////////////////////////////
// AtomicOwnedStack
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A lock-free LIFO stack of [`Arc`] allocated nodes.
///
/// # Examples
///
/// ```
/// use reclaim_cds::prelude::*;
///
/// let stack: AtomicOwnedStack<_> = vec!["a", "b"].into_iter().collect();
/// assert_eq!(stack.pop(), Some("b"));
/// assert_eq!(stack.clear(), 1);
/// ```
pub struct AtomicOwnedStack<T> {
    head: CachePadded<ArcSwapOption<Node<T>>>,
    activity: ActivityFlag,
}

/********** impl inherent *************************************************************************/

impl<T> AtomicOwnedStack<T> {
    /// Creates a new empty stack.
    #[inline]
    pub fn new() -> Self {
        Self { head: CachePadded::new(ArcSwapOption::empty()), activity: ActivityFlag::new() }
    }

    fn pop_owned(&self) -> Option<T> {
        let backoff = Backoff::new();
        let mut head = self.head.load_full();

        loop {
            let node = head.as_ref()?;
            let next = node.next.load_full();

            let prev = self.head.compare_and_swap(&head, next);
            if same_node(&*prev, &head) {
                // stale snapshots of `node` must not keep the rest of the stack alive
                node.next.store(None);
                return unsafe { node.take_elem() };
            }

            head = Guard::into_inner(prev);
            backoff.spin();
        }
    }
}

/********** impl Container ************************************************************************/

impl<T: Send> Container<T> for AtomicOwnedStack<T> {
    #[inline]
    fn push(&self, elem: T) -> bool {
        if !self.activity.is_active() {
            return false;
        }

        let node = Arc::new(Node::new(elem));
        let backoff = Backoff::new();
        let mut head = self.head.load_full();

        loop {
            node.next.store(head.clone());

            let prev = self.head.compare_and_swap(&head, Some(Arc::clone(&node)));
            if same_node(&*prev, &head) {
                return true;
            }

            head = Guard::into_inner(prev);
            backoff.spin();
        }
    }

    #[inline]
    fn pop(&self) -> Option<T> {
        self.pop_owned()
    }

    /// Unlinks all nodes at once and drops their elements.
    fn clear(&self) -> usize {
        let mut count = 0;
        let mut curr = self.head.swap(None);

        while let Some(node) = curr {
            curr = node.next.swap(None);
            if let Some(elem) = unsafe { node.take_elem() } {
                drop(elem);
                count += 1;
            }
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

impl<T> Default for AtomicOwnedStack<T> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

/********** impl Extend & FromIterator ************************************************************/

impl<T: Send> Extend<T> for AtomicOwnedStack<T> {
    #[inline]
    fn extend<I: IntoIterator<Item = T>>(&mut self, iter: I) {
        for elem in iter {
            self.push(elem);
        }
    }
}

impl<T: Send> FromIterator<T> for AtomicOwnedStack<T> {
    #[inline]
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut stack = Self::new();
        stack.extend(iter);
        stack
    }
}

/********** impl Debug ****************************************************************************/

impl<T> fmt::Debug for AtomicOwnedStack<T> {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let head = self.head.load_full();
        f.debug_struct("AtomicOwnedStack")
            .field("head", &head.as_ref().map(Arc::as_ptr))
            .field("activity", &self.activity)
            .finish()
    }
}

/********** impl Drop *****************************************************************************/

impl<T> Drop for AtomicOwnedStack<T> {
    #[inline]
    fn drop(&mut self) {
        self.activity.deactivate();

        // unlinks node by node, dropping the head recursively could overflow the stack
        let mut curr = self.head.swap(None);
        while let Some(node) = curr {
            curr = node.next.swap(None);
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Node
////////////////////////////////////////////////////////////////////////////////////////////////////

struct Node<T> {
    elem: UnsafeCell<Option<T>>,
    next: ArcSwapOption<Node<T>>,
}

unsafe impl<T: Send> Send for Node<T> {}
unsafe impl<T: Send> Sync for Node<T> {}

impl<T> Node<T> {
    #[inline]
    fn new(elem: T) -> Self {
        Self { elem: UnsafeCell::new(Some(elem)), next: ArcSwapOption::empty() }
    }

    /// # Safety
    ///
    /// Must only be called by the thread that unlinked the node.
    #[inline]
    unsafe fn take_elem(&self) -> Option<T> {
        (*self.elem.get()).take()
    }
}

#[inline]
fn same_node<T>(a: &Link<T>, b: &Link<T>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        (None, None) => true,
        _ => false,
    }
}
