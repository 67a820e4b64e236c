//! Containers reclaiming their nodes through split reference counting.
//!
//! The shared location referring to a node (`head` or `tail`) carries an
//! *external* count in the same atomic word as the node's address, see
//! [`CountedPtr`][crate::CountedPtr].
//! Every thread that wants to dereference the node first increments that
//! count.
//! The node itself carries an *internal* count, which threads that are done
//! with it decrement.
//! Once the node is unlinked, the winning thread transfers the external count
//! (minus its own and the location's reference) to the internal count, and
//! whichever thread brings the internal count to zero frees the node.

mod queue;
mod stack;

pub use self::queue::RefCountQueue;
pub use self::stack::RefCountStack;
