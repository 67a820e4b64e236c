//! The fixed-size table of hazard slots and the per-thread registrations
//! owning them.

use std::cell::RefCell;
use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::{Arc, Weak};

use crossbeam_utils::CachePadded;

use crate::error::RegistrationError;

////////////////////////////////////////////////////////////////////////////////////////////////////
// HazardSlot
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A single published "currently dereferencing" marker.
///
/// A slot is owned by at most one registration at a time, only the owner
/// writes its protected pointer while every thread may read it.
pub(crate) struct HazardSlot {
    claimed: AtomicBool,
    protected: AtomicPtr<()>,
}

/********** impl inherent *************************************************************************/

impl HazardSlot {
    #[inline]
    const fn new() -> Self {
        Self { claimed: AtomicBool::new(false), protected: AtomicPtr::new(ptr::null_mut()) }
    }

    /// Publishes `ptr` as hazardous.
    ///
    /// The store is sequentially consistent so that it is ordered before the
    /// owner's subsequent validating re-load of the shared location.
    #[inline]
    pub fn protect<T>(&self, ptr: *mut T) {
        self.protected.store(ptr as *mut (), Ordering::SeqCst);
    }

    /// Removes any published pointer.
    #[inline]
    pub fn clear(&self) {
        self.protected.store(ptr::null_mut(), Ordering::Release);
    }

    #[inline]
    fn protects(&self, ptr: *const ()) -> bool {
        ptr::eq(self.protected.load(Ordering::SeqCst), ptr)
    }

    #[inline]
    fn try_claim(&self) -> bool {
        self.claimed.compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed).is_ok()
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// HazardRegistry
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The slot table of a single container.
///
/// The table is shared through an [`Arc`] so that thread-local registrations
/// can refer to it without borrowing the container.
pub(crate) struct HazardRegistry {
    slots: Box<[CachePadded<HazardSlot>]>,
}

/********** impl inherent *************************************************************************/

impl HazardRegistry {
    pub fn with_capacity(capacity: usize) -> Self {
        Self { slots: (0..capacity).map(|_| CachePadded::new(HazardSlot::new())).collect() }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Claims the first free slot and returns its index.
    ///
    /// # Errors
    ///
    /// Fails if all slots are currently owned.
    pub fn acquire(&self) -> Result<usize, RegistrationError> {
        self.slots
            .iter()
            .position(|slot| slot.try_claim())
            .ok_or(RegistrationError::Exhausted { capacity: self.capacity() })
    }

    /// Clears and releases the slot at `index`.
    #[inline]
    pub fn release(&self, index: usize) {
        let slot = &self.slots[index];
        slot.clear();
        let prev = slot.claimed.swap(false, Ordering::Release);
        debug_assert!(prev, "released a slot that was not claimed");
    }

    #[inline]
    pub fn slot(&self, index: usize) -> &HazardSlot {
        &self.slots[index]
    }

    /// Returns `true` if any slot currently publishes `ptr`.
    #[inline]
    pub fn is_protected<T>(&self, ptr: *const T) -> bool {
        let ptr = ptr as *const ();
        self.slots.iter().any(|slot| slot.protects(ptr))
    }

    /// Returns the number of currently owned slots.
    #[inline]
    pub fn registered(&self) -> usize {
        self.slots.iter().filter(|slot| slot.claimed.load(Ordering::Relaxed)).count()
    }
}

/********** impl Debug ****************************************************************************/

impl fmt::Debug for HazardRegistry {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("HazardRegistry")
            .field("capacity", &self.capacity())
            .field("registered", &self.registered())
            .finish()
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// thread-local registrations
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A slot owned by the current thread for as long as it runs.
///
/// The registration is released by the thread-local destructor when the
/// thread exits, or never if the registry is already gone by then.
struct LocalRegistration {
    registry: Weak<HazardRegistry>,
    index: usize,
}

impl Drop for LocalRegistration {
    #[inline]
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.release(self.index);
        }
    }
}

thread_local! {
    static REGISTRATIONS: RefCell<Vec<LocalRegistration>> = RefCell::new(Vec::new());
}

/// Calls `f` with the slot the current thread owns in `registry`, registering
/// the thread first if it does not own one yet.
///
/// If the thread-local storage is no longer accessible (i.e. during thread
/// teardown), a slot is claimed for the duration of the call only.
///
/// # Errors
///
/// Fails if the thread needs a new slot but all slots are owned.
pub(crate) fn with_local_slot<R>(
    registry: &Arc<HazardRegistry>,
    f: impl FnOnce(&HazardSlot) -> R,
) -> Result<R, RegistrationError> {
    let index = REGISTRATIONS.try_with(|local| local_index(registry, &mut local.borrow_mut()));

    match index {
        Ok(index) => Ok(f(registry.slot(index?))),
        Err(_) => {
            let index = registry.acquire()?;
            let res = f(registry.slot(index));
            registry.release(index);
            Ok(res)
        }
    }
}

fn local_index(
    registry: &Arc<HazardRegistry>,
    local: &mut Vec<LocalRegistration>,
) -> Result<usize, RegistrationError> {
    let target = Arc::as_ptr(registry);
    if let Some(registration) = local.iter().find(|reg| ptr::eq(reg.registry.as_ptr(), target)) {
        return Ok(registration.index);
    }

    // registrations with dropped containers are pruned lazily
    local.retain(|reg| reg.registry.strong_count() > 0);

    let index = registry.acquire()?;
    local.push(LocalRegistration { registry: Arc::downgrade(registry), index });
    Ok(index)
}
