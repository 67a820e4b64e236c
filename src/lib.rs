//! Lock-free concurrent containers, each built on a different strategy for
//! safely reclaiming the memory of unlinked nodes.
//!
//! All containers implement the common [`Container`] trait:
//!
//! - [`HazardPointerStack`]: threads publish the node they are about to
//!   dereference in a fixed-size table of hazard slots, unlinked nodes are only
//!   freed once no slot names them.
//! - [`RefCountStack`] and [`RefCountQueue`]: split reference counting based on
//!   [`AtomicCountedPtr`], a pointer and reference tally updated as a single
//!   128-bit word.
//! - [`PopCountStack`]: unlinked nodes are freed once no other pop is in
//!   flight.
//! - [`AtomicOwnedStack`]: an experimental stack of [`Arc`][std::sync::Arc]
//!   nodes behind an atomically swappable head.
//!
//! Every container carries a one-way activity flag: once
//! [`deactivate`][Container::deactivate]d, pushes are refused while pops keep
//! draining the remaining elements.
//!
//! # Examples
//!
//! ```
//! use std::sync::Arc;
//! use std::thread;
//!
//! use reclaim_cds::prelude::*;
//!
//! let queue = Arc::new(RefCountQueue::new());
//! let producer = {
//!     let queue = Arc::clone(&queue);
//!     thread::spawn(move || (0..100).for_each(|i| assert!(queue.push(i))))
//! };
//!
//! producer.join().unwrap();
//! assert_eq!((0..100).filter_map(|_| queue.pop()).count(), 100);
//!
//! queue.deactivate();
//! assert!(!queue.push(100));
//! ```

#![warn(missing_docs)]

pub use typenum;

mod activity;
mod atomic_owned;
mod census;
mod config;
mod counted;
mod error;
mod hazard;
mod pop_count;
mod ref_count;

pub use crate::activity::Activity;
pub use crate::atomic_owned::AtomicOwnedStack;
pub use crate::config::{Config, ConfigBuilder, DEFAULT_SCAN_FACTOR};
pub use crate::counted::{AtomicCountedPtr, CountedPtr};
pub use crate::error::RegistrationError;
pub use crate::hazard::{DefaultHazards, HazardHandle, HazardPointerStack};
pub use crate::pop_count::PopCountStack;
pub use crate::ref_count::{RefCountQueue, RefCountStack};

/// Re-exports the container types and the [`Container`] trait.
pub mod prelude {
    pub use crate::{
        AtomicOwnedStack, Container, HazardPointerStack, PopCountStack, RefCountQueue,
        RefCountStack,
    };
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Container (trait)
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The operations shared by all lock-free containers of this crate.
///
/// All operations take `&self` and may be called concurrently from any number
/// of threads.
/// `push` and `pop` are linearizable, `clear` is not: elements pushed while a
/// clear is in progress may or may not be removed by it.
pub trait Container<T>: Send + Sync {
    /// Inserts `elem`, unless the container has been deactivated.
    ///
    /// Returns `false` if the container is deactivated, in which case `elem`
    /// is dropped.
    fn push(&self, elem: T) -> bool;

    /// Removes and returns the next element (the most recently pushed for
    /// stacks, the least recently pushed for queues), or `None` if the
    /// container is empty.
    ///
    /// Popping continues to work after deactivation.
    fn pop(&self) -> Option<T>;

    /// Pops the next element into `out` and returns `true`, or leaves `out`
    /// untouched and returns `false` if the container is empty.
    #[inline]
    fn pop_into(&self, out: &mut T) -> bool {
        match self.pop() {
            Some(elem) => {
                *out = elem;
                true
            }
            None => false,
        }
    }

    /// Removes all elements and returns the number of removed elements.
    fn clear(&self) -> usize;

    /// Returns `true` if the container has not yet been deactivated.
    fn is_active(&self) -> bool;

    /// Returns the current [`Activity`] state.
    #[inline]
    fn activity(&self) -> Activity {
        if self.is_active() {
            Activity::Active
        } else {
            Activity::Deactivated
        }
    }

    /// Irreversibly deactivates the container, all subsequent pushes fail.
    fn deactivate(&self);
}
