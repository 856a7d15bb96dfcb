//! Timers: arm/disarm/tick-decrement over anything with a deadline.
//!
//! A bare [`Timer`] is a standalone one-shot alarm for applications that
//! want a callback fired after some number of ticks, independent of any
//! thread. A [`crate::thread::Thread`]'s own self-timeout uses the same
//! decay algorithm without actually nesting a `Timer` value inside `Thread`
//! (that would need a self-referential back-pointer filled in before the
//! thread's own address exists) — instead both implement [`Deadline`] and
//! share one armed list and one tick-decrement routine.

use core::cell::Cell;

use crate::fault::{self, Fault};
use crate::list::{Adapter, Link, List};
use crate::time::{self, Time};

/// Anything that can be armed with a deadline and fired when it elapses.
///
/// Implemented by [`Timer`] and by [`crate::thread::Thread`] (for its own
/// timeout), so both can live on the same armed list and decay together.
pub trait Deadline {
    /// Current deadline, or one of the sentinels in [`crate::time`] if not
    /// armed / already expired.
    fn expiration(&self) -> &Cell<Time>;

    /// This deadline's slot in the kernel's armed list.
    fn deadline_link(&'static self) -> &'static Link<dyn Deadline>;

    /// Called once, outside the kernel lock, when the deadline elapses.
    /// `overrun` is how far past the deadline the tick that caught it landed
    /// (always `>= 0`).
    fn fire(&'static self, overrun: Time);
}

/// Adapter selecting the armed-list link on any `dyn Deadline`.
pub struct ArmedAdapter;

impl Adapter for ArmedAdapter {
    type Element = dyn Deadline;

    fn link(elem: &'static dyn Deadline) -> &'static Link<dyn Deadline> {
        elem.deadline_link()
    }
}

/// A standalone one-shot timer with a static callback, independent of any
/// thread.
pub struct Timer {
    expiration: Cell<Time>,
    link: Link<dyn Deadline>,
    callback: &'static (dyn Fn() + Sync),
}

impl Timer {
    pub const fn new(callback: &'static (dyn Fn() + Sync)) -> Self {
        Self {
            expiration: Cell::new(time::NEVER),
            link: Link::new(),
            callback,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.expiration.get() != time::NEVER
    }
}

impl Deadline for Timer {
    fn expiration(&self) -> &Cell<Time> {
        &self.expiration
    }

    fn deadline_link(&'static self) -> &'static Link<dyn Deadline> {
        &self.link
    }

    fn fire(&'static self, _overrun: Time) {
        (self.callback)();
    }
}

/// Phase 1 of tick-ingress (§ arm/disarm/tick-decrement): walk `armed`,
/// decrementing every deadline by `delta`, moving anything whose deadline
/// has elapsed onto a freshly-built transient list instead of firing it
/// immediately. Run this with the kernel locked; firing callbacks (phase 2)
/// happens after the lock is released, since a callback may re-arm or touch
/// other kernel state.
pub fn detect_expired(armed: &List<ArmedAdapter>, delta: Time) -> List<ArmedAdapter> {
    let expired: List<ArmedAdapter> = List::new();

    armed.for_each(|t| {
        let remaining = t.expiration().get();
        if remaining <= delta {
            t.expiration().set(delta - remaining);
            armed.remove(t);
            expired.push_back(t);
        } else if remaining < time::INFINITE {
            t.expiration().set(remaining - delta);
        }
    });

    expired
}

/// Phase 2: fire every timer on `expired` and reset it to disarmed. Run this
/// without the kernel locked.
pub fn fire_expired(expired: &List<ArmedAdapter>) {
    while let Some(t) = expired.pop_front() {
        let overrun = t.expiration().get();
        t.fire(overrun);
        t.expiration().set(time::NEVER);
    }
}

/// Arm `t` to fire `when` ticks from now. Faults if `t` is already armed.
pub fn arm(armed: &List<ArmedAdapter>, t: &'static dyn Deadline, when: Time) {
    fault::ensure!(t.expiration().get() == time::NEVER, Fault::DoubleArm);
    t.expiration().set(when);
    armed.push_back(t);
}

/// Disarm `t`. A no-op if it wasn't armed.
pub fn disarm(armed: &List<ArmedAdapter>, t: &'static dyn Deadline) {
    armed.remove(t);
    t.expiration().set(time::NEVER);
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicU32, Ordering};
    use std::boxed::Box;

    struct CountingTimer {
        expiration: Cell<Time>,
        link: Link<dyn Deadline>,
        fired: &'static AtomicU32,
    }

    impl Deadline for CountingTimer {
        fn expiration(&self) -> &Cell<Time> {
            &self.expiration
        }
        fn deadline_link(&'static self) -> &'static Link<dyn Deadline> {
            &self.link
        }
        fn fire(&'static self, _overrun: Time) {
            self.fired.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn leak_counter() -> &'static AtomicU32 {
        Box::leak(Box::new(AtomicU32::new(0)))
    }

    fn leak_timer(fired: &'static AtomicU32) -> &'static CountingTimer {
        Box::leak(Box::new(CountingTimer {
            expiration: Cell::new(time::NEVER),
            link: Link::new(),
            fired,
        }))
    }

    #[test]
    fn arm_then_expire_fires_once() {
        let armed: List<ArmedAdapter> = List::new();
        let fired = leak_counter();
        let t = leak_timer(fired);

        arm(&armed, t, 10);
        assert!(t.is_armed());

        let expired = detect_expired(&armed, 10);
        assert!(armed.is_empty());
        fire_expired(&expired);

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!t.is_armed());
    }

    #[test]
    fn partial_tick_only_decrements() {
        let armed: List<ArmedAdapter> = List::new();
        let fired = leak_counter();
        let t = leak_timer(fired);

        arm(&armed, t, 10);
        let expired = detect_expired(&armed, 4);
        assert!(expired.is_empty());
        assert_eq!(t.expiration.get(), 6);

        let expired = detect_expired(&armed, 6);
        fire_expired(&expired);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn disarm_prevents_firing() {
        let armed: List<ArmedAdapter> = List::new();
        let fired = leak_counter();
        let t = leak_timer(fired);

        arm(&armed, t, 5);
        disarm(&armed, t);
        assert!(!t.is_armed());

        let expired = detect_expired(&armed, 100);
        assert!(expired.is_empty());
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    #[should_panic]
    fn double_arm_is_a_fault() {
        crate::fault::set_fault_handler(|_| panic!("fault"));
        let armed: List<ArmedAdapter> = List::new();
        let fired = leak_counter();
        let t = leak_timer(fired);
        arm(&armed, t, 5);
        arm(&armed, t, 5);
    }
}
