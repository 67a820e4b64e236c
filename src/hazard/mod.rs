//! A lock-free stack protecting its nodes with hazard pointers.
//!
//! Every thread that pops owns one slot of a fixed-size table of hazard
//! slots.
//! Before dereferencing the current head, a popping thread publishes it in its
//! slot and re-reads the head to validate that the node was not unlinked in
//! between.
//! A thread that unlinks a node only frees it right away if no slot publishes
//! it, otherwise the node is retired and freed by a later scan.

mod registry;
mod retired;

use core::cell::Cell;
use core::fmt;
use core::marker::PhantomData;
use core::mem::ManuallyDrop;
use core::ptr::{self, NonNull};
use core::sync::atomic::{
    AtomicPtr,
    Ordering::{Acquire, Relaxed, Release, SeqCst},
};
use std::iter::FromIterator;
use std::sync::Arc;

use crossbeam_utils::{Backoff, CachePadded};
use typenum::{Unsigned, U100};

use crate::activity::ActivityFlag;
use crate::census::Census;
use crate::config::Config;
use crate::error::RegistrationError;
use crate::Container;

use self::registry::{HazardRegistry, HazardSlot};
use self::retired::RetiredList;

/// The default number of hazard slots.
pub type DefaultHazards = U100;

////////////////////////////////////////////////////////////////////////////////////////////////////
// HazardPointerStack
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A lock-free LIFO stack reclaiming memory with hazard pointers.
///
/// `N` is the number of hazard slots, i.e. the maximum number of threads that
/// can concurrently be registered for popping.
/// A thread is registered implicitly on its first [`pop`][Container::pop] and
/// stays registered until it exits, or explicitly for the lifetime of a
/// [`HazardHandle`] returned by [`register`][HazardPointerStack::register].
///
/// # Examples
///
/// ```
/// use reclaim_cds::prelude::*;
/// use reclaim_cds::typenum::U4;
///
/// let stack = HazardPointerStack::<_, U4>::new();
/// assert!(stack.push(1));
/// assert!(stack.push(2));
///
/// let handle = stack.register().unwrap();
/// assert_eq!(handle.pop(), Some(2));
/// assert_eq!(handle.pop(), Some(1));
/// assert_eq!(handle.pop(), None);
/// ```
pub struct HazardPointerStack<T, N: Unsigned = DefaultHazards> {
    head: CachePadded<AtomicPtr<Node<T>>>,
    retired: RetiredList<Node<T>>,
    registry: Arc<HazardRegistry>,
    activity: ActivityFlag,
    scan_threshold: usize,
    census: Census,
    _marker: PhantomData<(T, N)>,
}

unsafe impl<T: Send, N: Unsigned> Send for HazardPointerStack<T, N> {}
unsafe impl<T: Send, N: Unsigned> Sync for HazardPointerStack<T, N> {}

/********** impl inherent *************************************************************************/

impl<T, N: Unsigned> HazardPointerStack<T, N> {
    /// Creates a new empty stack with the default [`Config`].
    #[inline]
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    /// Creates a new empty stack with the given `config`.
    #[inline]
    pub fn with_config(config: Config) -> Self {
        Self {
            head: CachePadded::new(AtomicPtr::new(ptr::null_mut())),
            retired: RetiredList::new(),
            registry: Arc::new(HazardRegistry::with_capacity(N::USIZE)),
            activity: ActivityFlag::new(),
            scan_threshold: config.scan_threshold(N::USIZE),
            census: Census::default(),
            _marker: PhantomData,
        }
    }

    /// Returns the number of hazard slots.
    #[inline]
    pub fn max_hazards(&self) -> usize {
        N::USIZE
    }

    /// Returns the number of currently owned hazard slots.
    #[inline]
    pub fn registered(&self) -> usize {
        self.registry.registered()
    }

    /// Returns the approximate number of unlinked nodes waiting to be freed.
    #[inline]
    pub fn pending(&self) -> usize {
        self.retired.len()
    }

    /// Claims a hazard slot for the lifetime of the returned handle.
    ///
    /// # Errors
    ///
    /// Fails with [`RegistrationError::Exhausted`] if all `N` slots are owned.
    #[inline]
    pub fn register(&self) -> Result<HazardHandle<'_, T, N>, RegistrationError> {
        let index = self.registry.acquire()?;
        Ok(HazardHandle { stack: self, index, _marker: PhantomData })
    }

    /// Pops the top element using the calling thread's own hazard slot,
    /// registering the thread first if necessary.
    ///
    /// # Errors
    ///
    /// Fails with [`RegistrationError::Exhausted`] if the thread is not yet
    /// registered and all `N` slots are owned.
    #[inline]
    pub fn try_pop(&self) -> Result<Option<T>, RegistrationError> {
        registry::with_local_slot(&self.registry, |slot| self.pop_protected(slot))
    }

    fn pop_protected(&self, slot: &HazardSlot) -> Option<T> {
        let backoff = Backoff::new();
        let mut head = self.head.load(Acquire);

        let unlinked = loop {
            loop {
                slot.protect(head);
                let validated = self.head.load(SeqCst);
                if validated == head {
                    break;
                }

                head = validated;
            }

            if head.is_null() {
                break head;
            }

            // the published and validated head can not be freed until the slot is cleared
            let next = unsafe { (*head).next };
            match self.head.compare_exchange(head, next, SeqCst, Acquire) {
                Ok(_) => break head,
                Err(actual) => {
                    head = actual;
                    backoff.spin();
                }
            }
        };

        slot.clear();
        let unlinked = NonNull::new(unlinked)?;

        let elem = unsafe { Node::take_elem(unlinked.as_ptr()) };
        if self.registry.is_protected(unlinked.as_ptr()) {
            self.retired.retire(unlinked);
        } else {
            unsafe { self.census.free(unlinked.as_ptr()) };
        }

        self.scan(false);
        Some(elem)
    }

    /// Frees retired nodes no longer published in any slot.
    ///
    /// Unless `force` is set, nothing is checked while fewer than
    /// `scan_threshold` nodes are pending.
    /// A forced scan frees *all* pending nodes and must only happen when no
    /// other thread can access the stack.
    fn scan(&self, force: bool) {
        let chain = self.retired.take();
        if chain.len() == 0 {
            return;
        }

        if !force && chain.len() < self.scan_threshold {
            unsafe { self.retired.push_chain(chain) };
            return;
        }

        for record in chain {
            if !force && self.registry.is_protected(record.as_ptr()) {
                self.retired.push(record);
            } else {
                unsafe { self.census.free(record.as_ptr()) };
            }
        }
    }
}

/********** impl Container ************************************************************************/

impl<T: Send, N: Unsigned> Container<T> for HazardPointerStack<T, N> {
    #[inline]
    fn push(&self, elem: T) -> bool {
        if !self.activity.is_active() {
            return false;
        }

        let node = self.census.alloc(Node::new(elem));
        let backoff = Backoff::new();
        let mut head = self.head.load(Relaxed);

        loop {
            unsafe { (*node).next = head };
            match self.head.compare_exchange_weak(head, node, Release, Relaxed) {
                Ok(_) => return true,
                Err(actual) => {
                    head = actual;
                    backoff.spin();
                }
            }
        }
    }

    /// Pops the top element using the calling thread's own hazard slot.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread is not yet registered and all `N` hazard
    /// slots are owned, use [`try_pop`][HazardPointerStack::try_pop] to handle
    /// this case.
    #[inline]
    fn pop(&self) -> Option<T> {
        match self.try_pop() {
            Ok(elem) => elem,
            Err(e) => panic!("{}", e),
        }
    }

    /// Unlinks all nodes at once, drops their elements and retires the nodes.
    ///
    /// Elements pushed concurrently may or may not be removed.
    fn clear(&self) -> usize {
        let mut curr = self.head.swap(ptr::null_mut(), SeqCst);
        let mut count = 0;

        while let Some(node) = NonNull::new(curr) {
            unsafe {
                curr = (*node.as_ptr()).next;
                drop(Node::take_elem(node.as_ptr()));
            }

            self.retired.retire(node);
            count += 1;
        }

        self.scan(false);
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

impl<T, N: Unsigned> Default for HazardPointerStack<T, N> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

/********** impl Extend & FromIterator ************************************************************/

impl<T: Send, N: Unsigned> Extend<T> for HazardPointerStack<T, N> {
    #[inline]
    fn extend<I: IntoIterator<Item = T>>(&mut self, iter: I) {
        for elem in iter {
            self.push(elem);
        }
    }
}

impl<T: Send, N: Unsigned> FromIterator<T> for HazardPointerStack<T, N> {
    #[inline]
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut stack = Self::new();
        stack.extend(iter);
        stack
    }
}

/********** impl Debug ****************************************************************************/

impl<T, N: Unsigned> fmt::Debug for HazardPointerStack<T, N> {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("HazardPointerStack")
            .field("head", &self.head.load(Relaxed))
            .field("activity", &self.activity)
            .field("registry", &self.registry)
            .field("pending", &self.pending())
            .finish()
    }
}

/********** impl Drop *****************************************************************************/

impl<T, N: Unsigned> Drop for HazardPointerStack<T, N> {
    #[inline]
    fn drop(&mut self) {
        self.activity.deactivate();

        let mut curr = *self.head.get_mut();
        while !curr.is_null() {
            unsafe {
                let next = (*curr).next;
                drop(Node::take_elem(curr));
                self.census.free(curr);
                curr = next;
            }
        }

        self.scan(true);
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// HazardHandle
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A scoped registration owning one hazard slot of a [`HazardPointerStack`].
///
/// The slot is released when the handle is dropped.
/// A handle can be sent to other threads but not shared between them.
pub struct HazardHandle<'s, T, N: Unsigned = DefaultHazards> {
    stack: &'s HazardPointerStack<T, N>,
    index: usize,
    _marker: PhantomData<Cell<()>>,
}

/********** impl inherent *************************************************************************/

impl<'s, T, N: Unsigned> HazardHandle<'s, T, N> {
    /// Pops the top element, protecting it through the handle's slot.
    #[inline]
    pub fn pop(&self) -> Option<T> {
        self.stack.pop_protected(self.registry_slot())
    }

    /// Returns the index of the owned slot in the stack's slot table.
    #[inline]
    pub fn slot_index(&self) -> usize {
        self.index
    }

    #[inline]
    fn registry_slot(&self) -> &HazardSlot {
        self.stack.registry.slot(self.index)
    }
}

/********** impl Debug ****************************************************************************/

impl<'s, T, N: Unsigned> fmt::Debug for HazardHandle<'s, T, N> {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("HazardHandle").field("slot", &self.index).finish()
    }
}

/********** impl Drop *****************************************************************************/

impl<'s, T, N: Unsigned> Drop for HazardHandle<'s, T, N> {
    #[inline]
    fn drop(&mut self) {
        self.stack.registry.release(self.index);
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Node
////////////////////////////////////////////////////////////////////////////////////////////////////

struct Node<T> {
    elem: ManuallyDrop<T>,
    next: *mut Node<T>,
}

impl<T> Node<T> {
    #[inline]
    fn new(elem: T) -> Self {
        Self { elem: ManuallyDrop::new(elem), next: ptr::null_mut() }
    }

    /// Moves the element out of the node.
    ///
    /// # Safety
    ///
    /// Must be called at most once per node and only by the thread that
    /// unlinked it.
    /// Other threads may concurrently read the node's `next` field.
    #[inline]
    unsafe fn take_elem(node: *mut Self) -> T {
        ManuallyDrop::into_inner(ptr::read(ptr::addr_of!((*node).elem)))
    }
}
