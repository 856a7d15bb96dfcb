//! Events: a waiter list plus an additive wakeup reason, signaled to wake
//! one thread or broadcast to wake all of them.

use bitflags::bitflags;

use crate::list::List;
use crate::thread::QueueAdapter;

bitflags! {
    /// Why a thread was last woken up. Additive: more than one bit may be
    /// set if, e.g., a timeout and a signal race (see the kernel's
    /// suspension operators).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WakeupReason: u32 {
        const OK              = 1 << 0;
        const TIMEOUT         = 1 << 1;
        /// Reserved for external cancellation; nothing in this crate raises
        /// it itself, but `Kernel::wakeup` accepts it like any other bit.
        const RESET           = 1 << 2;
        const SUBTHREAD_DONE  = 1 << 3;
    }
}

/// A bitmask used to select which event is meant when several events share
/// conceptual purpose; applications are free to leave this as `0`.
pub type EventMask = i32;

/// An event: nothing but a queue of threads waiting on it, plus an
/// application-chosen mask value. Signaling/broadcasting is done through
/// the owning [`crate::kernel::Kernel`], since waking a thread always
/// involves the kernel's ready list too.
pub struct Event {
    pub(crate) waiting: List<QueueAdapter>,
    pub mask: EventMask,
}

impl Event {
    pub const fn new(mask: EventMask) -> Self {
        Self {
            waiting: List::new(),
            mask,
        }
    }

    pub fn has_waiters(&self) -> bool {
        !self.waiting.is_empty()
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new(0)
    }
}
