//! The one-way liveness flag shared by all containers.

use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};

////////////////////////////////////////////////////////////////////////////////////////////////////
// Activity
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The state of a container's liveness flag.
#[derive(Copy, Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Activity {
    /// `push` and `pop` operate normally.
    Active,
    /// `push` fails, `pop` keeps draining the remaining elements.
    Deactivated,
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// ActivityFlag
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A flag that transitions exactly once from [`Active`][Activity::Active] to
/// [`Deactivated`][Activity::Deactivated].
///
/// The flag is checked opportunistically at the entry of an operation, it is
/// not a cut-over barrier: a push that has passed its check before the flag
/// flips is still allowed to complete.
pub(crate) struct ActivityFlag {
    active: AtomicBool,
}

/********** impl inherent *************************************************************************/

impl ActivityFlag {
    #[inline]
    pub const fn new() -> Self {
        Self { active: AtomicBool::new(true) }
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    #[inline]
    pub fn state(&self) -> Activity {
        if self.is_active() {
            Activity::Active
        } else {
            Activity::Deactivated
        }
    }

    /// Deactivates the flag, deactivating it again has no effect.
    #[inline]
    pub fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }
}

/********** impl Default **************************************************************************/

impl Default for ActivityFlag {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

/********** impl Debug ****************************************************************************/

impl fmt::Debug for ActivityFlag {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(&self.state(), f)
    }
}
