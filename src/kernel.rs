//! The scheduler: ready list, armed-timer list, thread registry, and the
//! lock/ISR depth counters that serialize all three against interrupts.
//!
//! Every suspension operator in [`crate::thread`]'s protothread alphabet is
//! implemented here as a `Kernel` method, because every one of them mutates
//! at least one of the three lists the kernel owns, and those mutations must
//! happen under the kernel lock. A `Kernel` does not own the `Thread`,
//! `Timer`, or `Event` values it links together — those are supplied by the
//! application as `'static` objects (statically allocated, or `Box::leak`'d
//! under `std` for tests) and the kernel holds only non-owning references
//! into them, per the ownership model in the data model section.

use core::cell::Cell;

use critical_section::RestoreState;

use crate::event::{Event, WakeupReason};
use crate::fault::{self, Fault};
use crate::list::List;
use crate::thread::{QueueAdapter, RegistryAdapter, ThreadBody, ThreadState};
use crate::time::{self, Time};
use crate::timer::{self, ArmedAdapter, Deadline};

/// The cooperative scheduler. One kernel typically backs one application;
/// see [`crate::KERNEL`] for the usual `static` instance, though nothing
/// here prevents an application (or a test) from instantiating several.
pub struct Kernel {
    ready: List<QueueAdapter>,
    armed: List<ArmedAdapter>,
    registry: List<RegistryAdapter>,
    active: Cell<Option<&'static dyn ThreadBody>>,
    lock_depth: Cell<u32>,
    isr_depth: Cell<u32>,
    restore: Cell<Option<RestoreState>>,
    elapsed: Cell<Time>,
}

// Safety: every field above is `Cell`-based, but `Kernel` is only ever
// mutated while `lock_depth > 0`, which (per the invariant this module
// enforces) implies hardware interrupts are masked — so there is never a
// genuinely concurrent access, only cooperative hand-off of a single
// logical owner. Mirrors the teacher crate's `unsafe impl Sync for
// SchedulerCell` over its own `UnsafeCell`-based scheduler.
unsafe impl Sync for Kernel {}

impl Kernel {
    pub const fn new() -> Self {
        Self {
            ready: List::new(),
            armed: List::new(),
            registry: List::new(),
            active: Cell::new(None),
            lock_depth: Cell::new(0),
            isr_depth: Cell::new(0),
            restore: Cell::new(None),
            elapsed: Cell::new(0),
        }
    }

    /// Total ticks delivered to [`Kernel::expire_timers`] so far. Not part of
    /// the spec's contract; exposed for logging and tests.
    pub fn now(&self) -> Time {
        self.elapsed.get()
    }

    pub fn lock_depth(&self) -> u32 {
        self.lock_depth.get()
    }

    pub fn isr_depth(&self) -> u32 {
        self.isr_depth.get()
    }

    fn in_isr(&self) -> bool {
        self.isr_depth.get() > 0
    }

    fn locked(&self) -> bool {
        self.lock_depth.get() > 0
    }

    // ---- lock family: thread context -------------------------------------

    /// Acquire the kernel lock from ordinary (non-ISR) thread context.
    /// Counting: a second nested `lock()` just bumps the depth: interrupts
    /// are only actually masked on the outermost acquire, and only
    /// unmasked on the matching outermost `unlock()`.
    pub fn lock(&self) {
        fault::ensure!(
            !self.in_isr(),
            Fault::LockMisuse("lock() called from ISR context; use lock_from_isr()")
        );
        let depth = self.lock_depth.get();
        if depth == 0 {
            // Safety: released exactly once below, at the matching
            // depth-1-to-0 transition, with the same token.
            let restore = unsafe { critical_section::acquire() };
            self.restore.set(Some(restore));
        }
        self.lock_depth.set(depth + 1);
    }

    pub fn unlock(&self) {
        fault::ensure!(
            !self.in_isr(),
            Fault::LockMisuse("unlock() called from ISR context; use unlock_from_isr()")
        );
        let depth = self.lock_depth.get();
        fault::ensure!(depth > 0, Fault::LockMisuse("unlock() without a matching lock()"));
        self.lock_depth.set(depth - 1);
        if depth == 1 {
            if let Some(restore) = self.restore.take() {
                // Safety: paired with the acquire() above; depth just hit 0.
                unsafe { critical_section::release(restore) };
            }
        }
    }

    // ---- lock family: ISR context ------------------------------------------

    /// Mark entry into an interrupt handler. Must be balanced by
    /// [`Kernel::leave_isr`] before the handler returns. Faults if an
    /// interrupt fires while the kernel lock is held: `lock()` is supposed to
    /// guarantee interrupts are masked for as long as `lock_depth > 0`, so
    /// reaching here with the lock held means that guarantee has already
    /// been violated by the platform/ISR glue.
    pub fn enter_isr(&self) {
        fault::ensure!(
            !self.locked(),
            Fault::IsrMisuse("interrupt occurred while the kernel lock was held")
        );
        self.isr_depth.set(self.isr_depth.get() + 1);
    }

    pub fn leave_isr(&self) {
        let depth = self.isr_depth.get();
        fault::ensure!(depth > 0, Fault::IsrMisuse("leave_isr() without a matching enter_isr()"));
        self.isr_depth.set(depth - 1);
    }

    /// Acquire the kernel lock from ISR context. Interrupts are already
    /// masked by virtue of running inside a handler on this target class, so
    /// this only needs to track depth, not touch `critical-section` itself.
    pub fn lock_from_isr(&self) {
        fault::ensure!(
            self.in_isr(),
            Fault::IsrMisuse("lock_from_isr() called outside enter_isr()/leave_isr()")
        );
        self.lock_depth.set(self.lock_depth.get() + 1);
    }

    pub fn unlock_from_isr(&self) {
        fault::ensure!(
            self.in_isr(),
            Fault::IsrMisuse("unlock_from_isr() called outside enter_isr()/leave_isr()")
        );
        let depth = self.lock_depth.get();
        fault::ensure!(depth > 0, Fault::LockMisuse("unlock_from_isr() without a matching lock_from_isr()"));
        self.lock_depth.set(depth - 1);
    }

    /// Run `f` with the kernel locked, using whichever lock family matches
    /// the calling context. Suspension operators use this so the same code
    /// works whether a thread body or an ISR invokes them (see §6: ISRs get
    /// `signal_event`/`broadcast_event`/`wakeup` directly, alongside the
    /// lock-family primitives).
    fn with_lock<R>(&self, f: impl FnOnce() -> R) -> R {
        if self.in_isr() {
            self.lock_from_isr();
            let r = f();
            self.unlock_from_isr();
            r
        } else {
            self.lock();
            let r = f();
            self.unlock();
            r
        }
    }

    // ---- registry -----------------------------------------------------------

    /// Register a thread with this kernel, binding its type-erased handle so
    /// later operations starting from a bare `&Thread` (a firing timeout) can
    /// still re-enqueue the owning `dyn ThreadBody`. The thread starts
    /// `Ready` and is placed on the ready list immediately.
    pub fn register(&'static self, body: &'static dyn ThreadBody) {
        self.with_lock(|| {
            body.thread().bind(body, self);
            self.registry.push_back(body);
            body.thread().set_state(ThreadState::Ready);
            self.ready.push_back(body);
            body.thread().current_queue.set(Some(&self.ready));
        });
        log::debug!("registered thread {:?}", body.thread().name);
    }

    fn ensure_registered(&'static self, body: &'static dyn ThreadBody) {
        if body.thread().is_bound() {
            return;
        }
        body.thread().bind(body, self);
        self.registry.push_back(body);
    }

    pub fn active_thread(&self) -> Option<&'static dyn ThreadBody> {
        self.active.get()
    }

    // ---- run loop -------------------------------------------------------------

    /// One scheduler run-step (§4.6): pop the front ready thread, run it to
    /// its next suspension point or completion, then re-queue it if its
    /// post-run state is runnable. Returns whether more work remains.
    pub fn run_once(&'static self) -> bool {
        let popped = self.with_lock(|| {
            let body = self.ready.pop_front()?;
            body.thread().current_queue.set(None);
            self.active.set(Some(body));
            Some(body)
        });

        let Some(body) = popped else {
            return false;
        };

        log::trace!("dispatching {:?}", body.thread().name);
        body.run(self);

        self.with_lock(|| {
            self.active.set(None);
            if body.thread().state().is_runnable() {
                self.ready.push_back(body);
                body.thread().current_queue.set(Some(&self.ready));
            }
            !self.ready.is_empty()
        })
    }

    // ---- suspension operators ---------------------------------------------

    /// YIELD: give up the rest of this run-step; resume next run-step at the
    /// thread's own recorded continuation.
    pub fn yield_now(&'static self, who: &'static dyn ThreadBody) {
        who.thread().set_state(ThreadState::Yielded);
    }

    /// Detach `who` from whatever scheduling queue it currently occupies (the
    /// ready list, or an event's waiter list), per `current_queue`. Every
    /// suspension operator that moves a thread off the ready list calls this
    /// first: `run_once()`'s own pop-before-dispatch already clears it for
    /// the common case of a thread suspending itself mid-`run()`, but a
    /// caller that suspends another thread not currently executing (e.g.
    /// `wait_subthread`'s parent, or any operator invoked before the thread
    /// has ever been dispatched) cannot rely on that, so this is unconditional
    /// rather than assumed.
    fn unschedule(&self, who: &'static dyn ThreadBody) {
        let t = who.thread();
        if let Some(queue) = t.current_queue.take() {
            queue.remove(who);
        }
    }

    /// SLEEP(d): suspend until `d` ticks elapse. `d == IMMEDIATE` is
    /// equivalent to `YIELD` (no timer is armed).
    pub fn sleep(&'static self, who: &'static dyn ThreadBody, ticks: Time) {
        if ticks == time::IMMEDIATE {
            self.yield_now(who);
            return;
        }
        self.with_lock(|| {
            self.unschedule(who);
            let t = who.thread();
            t.set_state(ThreadState::Sleeping);
            timer::arm(&self.armed, t, ticks);
        });
    }

    /// WAIT_EVENT(e, d): park on `event`'s waiter list, optionally bounded by
    /// a timeout. On resumption the thread body must call
    /// [`Kernel::clear_timeout`] (the signal path may have beaten the
    /// timeout, or vice versa).
    pub fn wait_event(&'static self, who: &'static dyn ThreadBody, event: &'static Event, duration: Time) {
        self.with_lock(|| {
            self.unschedule(who);
            let t = who.thread();
            if duration != time::INFINITE {
                timer::arm(&self.armed, t, duration);
            }
            t.set_state(ThreadState::WaitEvent);
            event.waiting.push_back(who);
            t.current_queue.set(Some(&event.waiting));
        });
    }

    /// WAIT_SUBTHREAD(s, d): reset and start `child`, suspending `parent`
    /// until `child` reaches `Final`. Faults if `child` already has a
    /// parent.
    pub fn wait_subthread(
        &'static self,
        parent: &'static dyn ThreadBody,
        child: &'static dyn ThreadBody,
        duration: Time,
    ) {
        self.with_lock(|| {
            fault::ensure!(
                child.thread().parent().is_none(),
                Fault::SubthreadBusy
            );

            self.unschedule(parent);
            let p = parent.thread();
            if duration != time::INFINITE {
                timer::arm(&self.armed, p, duration);
            }
            p.set_state(ThreadState::WaitSubthread);

            self.ensure_registered(child);
            let c = child.thread();
            c.reset();
            c.set_parent(Some(parent));
            c.set_state(ThreadState::Ready);
            self.ready.push_back(child);
            c.current_queue.set(Some(&self.ready));
        });
    }

    /// WAIT_UNTIL(cond, d): re-evaluated by the caller every re-entry.
    /// Returns `true` if `cond` held (the caller should fall through and
    /// keep running this step); `false` if the caller must suspend and
    /// return (the timer is armed at most once, idempotently, across
    /// repeated `false` re-entries).
    pub fn wait_until(&'static self, who: &'static dyn ThreadBody, cond: bool, duration: Time) -> bool {
        self.with_lock(|| {
            let t = who.thread();
            if cond {
                self.clear_timeout_locked(t);
                t.set_state(ThreadState::Ready);
                true
            } else {
                t.set_state(ThreadState::WaitCond);
                if duration != time::INFINITE && t.expiration().get() == time::NEVER {
                    timer::arm(&self.armed, t, duration);
                }
                false
            }
        })
    }

    /// END: mark `who` `Final` and, if it was being awaited, wake its
    /// parent with `SUBTHREAD_DONE`.
    pub fn end(&'static self, who: &'static dyn ThreadBody) {
        self.with_lock(|| {
            let t = who.thread();
            t.set_state(ThreadState::Final);
            t.set_continuation(0);
            if let Some(parent) = t.parent() {
                t.set_parent(None);
                self.wakeup_locked(parent, WakeupReason::SUBTHREAD_DONE);
            }
        });
    }

    /// Disarm `who`'s own timeout if it is currently armed. Thread bodies
    /// call this on resumption from `WAIT_EVENT`/`WAIT_SUBTHREAD`, since the
    /// signal/completion path may have beaten the timeout (or vice versa).
    pub fn clear_timeout(&'static self, who: &'static dyn ThreadBody) {
        self.with_lock(|| self.clear_timeout_locked(who.thread()));
    }

    fn clear_timeout_locked(&self, t: &'static crate::thread::Thread) {
        if t.expiration().get() != time::NEVER {
            timer::disarm(&self.armed, t);
        }
    }

    // ---- events: signal/broadcast/wakeup -----------------------------------

    /// Wake one waiter on `event`, if any, with `WAKEUP_OK | mask`.
    pub fn signal_event(&'static self, event: &'static Event, mask: WakeupReason) {
        self.with_lock(|| self.signal_event_locked(event, mask));
    }

    fn signal_event_locked(&self, event: &'static Event, mask: WakeupReason) {
        if let Some(waiter) = event.waiting.pop_front() {
            waiter.thread().current_queue.set(None);
            log::trace!("signal: waking {:?}", waiter.thread().name);
            self.wakeup_locked(waiter, WakeupReason::OK | mask);
        }
    }

    /// Wake every waiter currently on `event`, each with `WAKEUP_OK | mask`.
    pub fn broadcast_event(&'static self, event: &'static Event, mask: WakeupReason) {
        self.with_lock(|| {
            while event.has_waiters() {
                self.signal_event_locked(event, mask);
            }
        });
    }

    /// Accumulate `reason` into `who`'s wakeup reason and, unless it is
    /// already `Final`, detach it from whatever queue it currently occupies
    /// and re-schedule it onto the ready list.
    pub fn wakeup(&'static self, who: &'static dyn ThreadBody, reason: WakeupReason) {
        self.with_lock(|| self.wakeup_locked(who, reason));
    }

    fn wakeup_locked(&self, who: &'static dyn ThreadBody, reason: WakeupReason) {
        let t = who.thread();
        t.add_wakeup_reason(reason);
        if t.state() == ThreadState::Final {
            return;
        }
        if let Some(queue) = t.current_queue.get() {
            queue.remove(who);
        }
        t.set_state(ThreadState::Ready);
        self.ready.push_back(who);
        t.current_queue.set(Some(&self.ready));
    }

    // ---- tick ingress -------------------------------------------------------

    /// Advance virtual time by `delta` ticks and fire every timer (bare
    /// [`crate::timer::Timer`] or thread self-timeout) whose deadline has
    /// elapsed. Called from the periodic tick interrupt; brackets its own
    /// `lock_from_isr`/`unlock_from_isr` pair, so the caller only needs
    /// `enter_isr()`/`leave_isr()` around it.
    pub fn expire_timers(&'static self, delta: Time) {
        self.lock_from_isr();
        let expired = timer::detect_expired(&self.armed, delta);
        self.elapsed.set(self.elapsed.get().saturating_add(delta));
        self.unlock_from_isr();
        if !expired.is_empty() {
            log::trace!("tick +{}: firing expired timers", delta);
        }
        timer::fire_expired(&expired);
    }
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use crate::thread::Thread;
    use core::sync::atomic::{AtomicU32, Ordering};
    use std::boxed::Box;

    fn leak_kernel() -> &'static Kernel {
        Box::leak(Box::new(Kernel::new()))
    }

    enum Resume {
        Start = 0,
        AfterYield = 1,
    }

    struct Counter {
        thread: Thread,
        runs: AtomicU32,
    }

    impl ThreadBody for Counter {
        fn thread(&self) -> &Thread {
            &self.thread
        }

        fn run(&'static self, kernel: &'static Kernel) {
            self.runs.fetch_add(1, Ordering::SeqCst);
            match self.thread.continuation() {
                0 => {
                    self.thread.set_continuation(Resume::AfterYield as u32);
                    kernel.yield_now(self);
                }
                _ => {
                    kernel.end(self);
                }
            }
        }
    }

    fn leak_counter(name: &'static str) -> &'static Counter {
        Box::leak(Box::new(Counter {
            thread: Thread::new(name),
            runs: AtomicU32::new(0),
        }))
    }

    #[test]
    fn run_once_on_empty_kernel_returns_false() {
        let kernel = leak_kernel();
        assert!(!kernel.run_once());
    }

    #[test]
    fn registered_thread_runs_until_final() {
        let kernel = leak_kernel();
        let t = leak_counter("counter");
        kernel.register(t);

        assert!(kernel.run_once()); // yields
        assert_eq!(t.thread.state(), ThreadState::Ready);
        assert!(!kernel.run_once()); // ends, nothing left
        assert_eq!(t.thread.state(), ThreadState::Final);
        assert_eq!(t.runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn sleep_zero_behaves_like_yield() {
        let kernel = leak_kernel();
        let t = leak_counter("sleeper");
        kernel.register(t);
        kernel.sleep(t, time::IMMEDIATE);
        assert_eq!(t.thread.state(), ThreadState::Yielded);
        assert_eq!(t.thread.expiration().get(), time::NEVER);
    }

    #[test]
    fn signal_wakes_a_single_waiter_fifo() {
        let kernel = leak_kernel();
        let a = leak_counter("a");
        let b = leak_counter("b");
        a.thread.bind(a, kernel);
        b.thread.bind(b, kernel);

        static EVENT: Event = Event::new(0);
        kernel.wait_event(a, &EVENT, time::INFINITE);
        kernel.wait_event(b, &EVENT, time::INFINITE);
        assert!(EVENT.has_waiters());

        kernel.signal_event(&EVENT, WakeupReason::empty());
        assert!(a.thread.wakeup_reason().contains(WakeupReason::OK));
        assert!(!b.thread.wakeup_reason().contains(WakeupReason::OK));
        assert_eq!(a.thread.state(), ThreadState::Ready);
    }

    #[test]
    fn broadcast_wakes_every_waiter() {
        let kernel = leak_kernel();
        let a = leak_counter("a2");
        let b = leak_counter("b2");
        let c = leak_counter("c2");
        a.thread.bind(a, kernel);
        b.thread.bind(b, kernel);
        c.thread.bind(c, kernel);

        static EVENT: Event = Event::new(0);
        kernel.wait_event(a, &EVENT, time::INFINITE);
        kernel.wait_event(b, &EVENT, time::INFINITE);
        kernel.wait_event(c, &EVENT, time::INFINITE);

        kernel.broadcast_event(&EVENT, WakeupReason::empty());
        assert!(!EVENT.has_waiters());
        assert!(a.thread.wakeup_reason().contains(WakeupReason::OK));
        assert!(b.thread.wakeup_reason().contains(WakeupReason::OK));
        assert!(c.thread.wakeup_reason().contains(WakeupReason::OK));
    }

    #[test]
    fn lock_unlock_round_trip_is_idempotent() {
        let kernel = leak_kernel();
        kernel.lock();
        kernel.lock();
        assert_eq!(kernel.lock_depth(), 2);
        kernel.unlock();
        assert_eq!(kernel.lock_depth(), 1);
        kernel.unlock();
        assert_eq!(kernel.lock_depth(), 0);
    }

    #[test]
    #[should_panic]
    fn lock_from_thread_context_inside_isr_is_a_fault() {
        crate::fault::set_fault_handler(|_| panic!("fault"));
        let kernel = leak_kernel();
        kernel.enter_isr();
        kernel.lock();
    }

    #[test]
    #[should_panic]
    fn starting_a_busy_subthread_is_a_fault() {
        crate::fault::set_fault_handler(|_| panic!("fault"));
        let kernel = leak_kernel();
        let parent = leak_counter("parent");
        let other_parent = leak_counter("other");
        let child = leak_counter("child");
        kernel.register(parent);
        kernel.register(other_parent);

        kernel.wait_subthread(parent, child, time::INFINITE);
        kernel.wait_subthread(other_parent, child, time::INFINITE);
    }

    #[test]
    #[should_panic]
    fn unlock_called_from_isr_context_is_a_fault() {
        crate::fault::set_fault_handler(|_| panic!("fault"));
        let kernel = leak_kernel();
        kernel.enter_isr();
        kernel.unlock();
    }

    #[test]
    #[should_panic]
    fn unlock_from_isr_without_lock_from_isr_is_a_fault() {
        crate::fault::set_fault_handler(|_| panic!("fault"));
        let kernel = leak_kernel();
        kernel.unlock_from_isr();
    }

    #[test]
    #[should_panic]
    fn interrupt_while_locked_is_a_fault() {
        crate::fault::set_fault_handler(|_| panic!("fault"));
        let kernel = leak_kernel();
        kernel.lock();
        kernel.enter_isr();
    }

    #[test]
    fn sleep_removes_a_never_dispatched_thread_from_the_ready_list() {
        let kernel = leak_kernel();
        let t = leak_counter("napper");
        kernel.register(t);
        kernel.sleep(t, 1000);

        // `register` put it on the ready list; `sleep` must have taken it
        // back off, or the thread would be both `Sleeping` with an armed
        // timer and still queued to run, violating "a Thread appears on at
        // most one scheduling queue".
        assert_eq!(t.thread.state(), ThreadState::Sleeping);
        assert!(!t.thread.is_queued());
        assert!(kernel.ready.is_empty());
    }
}
