//! Counted pointers: a node address paired with an external reference tally,
//! both read and written as one atomic unit.
//!
//! The split reference counting containers rely on the fact that a thread can
//! increment the tally of the current head (or tail) without another thread
//! being able to swap the pointer underneath in between.
//! Both halves therefore live in the same 128-bit word, the lower 64 bits
//! holding the address and the upper 64 bits holding the tally.

use core::marker::PhantomData;

use portable_atomic::AtomicU128;

mod atomic;
mod raw;

////////////////////////////////////////////////////////////////////////////////////////////////////
// CountedPtr
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A raw, unsafe pointer type like `*mut T` that carries an additional
/// *external count*, i.e. the number of threads that have announced their
/// intention to dereference the pointer through the shared location it was
/// loaded from.
pub struct CountedPtr<T> {
    inner: u128,
    _marker: PhantomData<*mut T>,
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// AtomicCountedPtr
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A [`CountedPtr`] which can be safely shared between threads.
///
/// Every operation acts on address and count at once, so a compare-exchange
/// fails if *either* half changed since the expected value was loaded.
/// Whether this is natively lock-free depends on the host's support for
/// 128-bit compare-exchange, see [`is_lock_free`][AtomicCountedPtr::is_lock_free].
pub struct AtomicCountedPtr<T> {
    inner: AtomicU128,
    _marker: PhantomData<*mut T>,
}

unsafe impl<T> Send for AtomicCountedPtr<T> {}
unsafe impl<T> Sync for AtomicCountedPtr<T> {}

////////////////////////////////////////////////////////////////////////////////////////////////////
// helper functions
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The number of bits the external count is shifted by.
const COUNT_SHIFT: u32 = 64;

/// Composes the integer representation of a counted pointer from an address
/// and an external count.
#[inline]
const fn compose(addr: usize, count: u64) -> u128 {
    ((count as u128) << COUNT_SHIFT) | (addr as u64 as u128)
}

/// Decomposes the integer representation of a counted pointer into *only* the
/// address.
#[inline]
const fn decompose_addr(raw: u128) -> usize {
    raw as u64 as usize
}

/// Decomposes the integer representation of a counted pointer into *only* the
/// external count.
#[inline]
const fn decompose_count(raw: u128) -> u64 {
    (raw >> COUNT_SHIFT) as u64
}
