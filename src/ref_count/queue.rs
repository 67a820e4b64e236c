use core::cell::UnsafeCell;
use core::fmt;
use core::mem::MaybeUninit;
use core::sync::atomic::{
    AtomicBool, AtomicU64,
    Ordering::{AcqRel, Acquire, Relaxed},
};
use std::iter::FromIterator;

use crossbeam_utils::{Backoff, CachePadded};

use crate::activity::ActivityFlag;
use crate::census::Census;
use crate::counted::{AtomicCountedPtr, CountedPtr};
use crate::Container;

////////////////////////////////////////////////////////////////////////////////////////////////////
// RefCountQueue
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A lock-free FIFO queue reclaiming memory with split reference counts.
///
/// The queue always ends in an empty *stub* node, the queue is empty when
/// `head` and `tail` refer to the same node.
/// A producer appends by claiming the stub, filling it and installing a fresh
/// stub behind it.
/// Every node is referenced by two counted locations over its lifetime (first
/// `tail`, then its predecessor's link or `head`), so its counter tracks the
/// number of such locations still outstanding alongside the internal count.
pub struct RefCountQueue<T> {
    head: CachePadded<AtomicCountedPtr<Node<T>>>,
    tail: CachePadded<AtomicCountedPtr<Node<T>>>,
    activity: ActivityFlag,
    census: Census,
}

unsafe impl<T: Send> Send for RefCountQueue<T> {}
unsafe impl<T: Send> Sync for RefCountQueue<T> {}

/********** impl inherent *************************************************************************/

impl<T> RefCountQueue<T> {
    /// Creates a new empty queue.
    #[inline]
    pub fn new() -> Self {
        let census = Census::default();
        let stub = CountedPtr::new(census.alloc(Node::stub()), 1);

        Self {
            head: CachePadded::new(AtomicCountedPtr::new(stub)),
            tail: CachePadded::new(AtomicCountedPtr::new(stub)),
            activity: ActivityFlag::new(),
            census,
        }
    }

    fn pop_counted(&self) -> Option<T> {
        let backoff = Backoff::new();
        let mut head = self.head.load(Relaxed);

        loop {
            head = self.head.increment_external(head);
            let node = head.node();

            if node == self.tail.load(Acquire).node() {
                unsafe { self.release_ref(node) };
                return None;
            }

            // the tail has moved past `node`, so its link is written
            let next = unsafe { *(*node).next.get() };
            match self.head.compare_exchange(head, next, AcqRel, Relaxed) {
                Ok(_) => unsafe {
                    let elem = (*node).elem.get().read().assume_init();
                    self.free_external_counter(head);
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

    /// Gives up the calling thread's reference to `node`.
    #[inline]
    unsafe fn release_ref(&self, node: *mut Node<T>) {
        let prev = (*node).counter.update(NodeCounter::released);
        if prev.released().is_unreferenced() {
            self.census.free(node);
        }
    }

    /// Transfers the external count of `ptr` to its node after the counted
    /// location it was loaded from has been redirected.
    #[inline]
    unsafe fn free_external_counter(&self, ptr: CountedPtr<Node<T>>) {
        let node = ptr.node();
        // counts are only meaningful modulo 2^32 on both sides
        let increase = (ptr.count() as i32).wrapping_sub(2);

        let prev = (*node).counter.update(|counter| counter.transferred(increase));
        if prev.transferred(increase).is_unreferenced() {
            self.census.free(node);
        }
    }
}

/********** impl Container ************************************************************************/

impl<T: Send> Container<T> for RefCountQueue<T> {
    fn push(&self, elem: T) -> bool {
        if !self.activity.is_active() {
            return false;
        }

        let stub = CountedPtr::new(self.census.alloc(Node::stub()), 1);
        let backoff = Backoff::new();
        let mut tail = self.tail.load(Relaxed);

        loop {
            tail = self.tail.increment_external(tail);
            let node = tail.node();

            unsafe {
                if (*node).claim() {
                    (*node).elem.get().write(MaybeUninit::new(elem));
                    *(*node).next.get() = stub;

                    let prev = self.tail.swap(stub, AcqRel);
                    self.free_external_counter(prev);
                    return true;
                }

                self.release_ref(node);
            }

            backoff.snooze();
        }
    }

    #[inline]
    fn pop(&self) -> Option<T> {
        self.pop_counted()
    }

    /// Pops until the queue is empty.
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

impl<T> Default for RefCountQueue<T> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

/********** impl Extend & FromIterator ************************************************************/

impl<T: Send> Extend<T> for RefCountQueue<T> {
    #[inline]
    fn extend<I: IntoIterator<Item = T>>(&mut self, iter: I) {
        for elem in iter {
            self.push(elem);
        }
    }
}

impl<T: Send> FromIterator<T> for RefCountQueue<T> {
    #[inline]
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut queue = Self::new();
        queue.extend(iter);
        queue
    }
}

/********** impl Debug ****************************************************************************/

impl<T> fmt::Debug for RefCountQueue<T> {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("RefCountQueue")
            .field("head", &*self.head)
            .field("tail", &*self.tail)
            .field("activity", &self.activity)
            .finish()
    }
}

/********** impl Drop *****************************************************************************/

impl<T> Drop for RefCountQueue<T> {
    #[inline]
    fn drop(&mut self) {
        self.activity.deactivate();
        while self.pop_counted().is_some() {}

        // only the stub is left, its payload was never written
        unsafe { self.census.free(self.head.load(Relaxed).node()) };
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Node
////////////////////////////////////////////////////////////////////////////////////////////////////

struct Node<T> {
    elem: UnsafeCell<MaybeUninit<T>>,
    next: UnsafeCell<CountedPtr<Node<T>>>,
    counter: AtomicNodeCounter,
    free: AtomicBool,
}

impl<T> Node<T> {
    #[inline]
    fn stub() -> Self {
        Self {
            elem: UnsafeCell::new(MaybeUninit::uninit()),
            next: UnsafeCell::new(CountedPtr::null()),
            counter: AtomicNodeCounter::new(NodeCounter { internal: 0, locations: 2 }),
            free: AtomicBool::new(true),
        }
    }

    /// Claims the stub for a single producer, returns `false` if another
    /// producer got there first.
    #[inline]
    fn claim(&self) -> bool {
        self.free.compare_exchange(true, false, AcqRel, Relaxed).is_ok()
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// NodeCounter
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The reference state of a queue node.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
struct NodeCounter {
    /// The sum of transferred external counts and released references, may be
    /// transiently negative and wraps around.
    internal: i32,
    /// The number of counted locations (`tail`, `head` or a predecessor's
    /// link) that have not yet transferred their external count.
    locations: u32,
}

impl NodeCounter {
    const LOCATIONS_SHIFT: u32 = 32;

    /// Releases a single reference.
    #[inline]
    fn released(self) -> Self {
        Self { internal: self.internal.wrapping_sub(1), ..self }
    }

    /// Adds the `increase` of a counted location that no longer refers to the
    /// node.
    #[inline]
    fn transferred(self, increase: i32) -> Self {
        Self { internal: self.internal.wrapping_add(increase), locations: self.locations - 1 }
    }

    #[inline]
    fn is_unreferenced(self) -> bool {
        self.internal == 0 && self.locations == 0
    }

    #[inline]
    fn into_raw(self) -> u64 {
        ((self.locations as u64) << Self::LOCATIONS_SHIFT) | (self.internal as u32 as u64)
    }

    #[inline]
    fn from_raw(raw: u64) -> Self {
        Self { internal: raw as u32 as i32, locations: (raw >> Self::LOCATIONS_SHIFT) as u32 }
    }
}

/// A [`NodeCounter`] updated as a single atomic word.
struct AtomicNodeCounter(AtomicU64);

impl AtomicNodeCounter {
    #[inline]
    fn new(counter: NodeCounter) -> Self {
        Self(AtomicU64::new(counter.into_raw()))
    }

    /// Applies `f` atomically and returns the previous value.
    #[inline]
    fn update(&self, f: impl Fn(NodeCounter) -> NodeCounter) -> NodeCounter {
        let backoff = Backoff::new();
        let mut curr = self.0.load(Relaxed);

        loop {
            let next = f(NodeCounter::from_raw(curr)).into_raw();
            match self.0.compare_exchange_weak(curr, next, AcqRel, Relaxed) {
                Ok(prev) => return NodeCounter::from_raw(prev),
                Err(actual) => {
                    curr = actual;
                    backoff.spin();
                }
            }
        }
    }
}
