//! Protothreads: resumable thread bodies whose suspension point lives in a
//! few small fields instead of a private call stack.
//!
//! Rust has no computed-goto or Duff's-device equivalent, so a thread body
//! is written as an explicit resume-point enum plus a `match` in its own
//! `run` method — the kernel only ever sees the small set of fields below,
//! and only ever changes `state`/`wakeup_reason`/the timeout fields on the
//! thread's behalf. Suspending is: record your own resume point, ask the
//! kernel to perform the corresponding list/timer transition, and return
//! from `run`. Resuming is: the kernel puts the thread back on the ready
//! list, the scheduler calls `run` again, and the `match` sends control back
//! to wherever it left off.
//!
//! ```ignore
//! enum Resume { Start, AfterSleep }
//!
//! impl ThreadBody for Blinker {
//!     fn thread(&self) -> &Thread { &self.thread }
//!
//!     fn run(&'static self, kernel: &'static Kernel) {
//!         match Resume::from(self.thread.continuation()) {
//!             Resume::Start => {
//!                 // ... turn the LED on ...
//!                 self.thread.set_continuation(Resume::AfterSleep as u32);
//!                 kernel.sleep(self, 100);
//!             }
//!             Resume::AfterSleep => {
//!                 // ... turn the LED off ...
//!                 self.thread.set_continuation(Resume::Start as u32);
//!                 kernel.sleep(self, 100);
//!             }
//!         }
//!     }
//! }
//! ```

use core::cell::Cell;

use crate::event::WakeupReason;
use crate::kernel::Kernel;
use crate::list::{Adapter, Link, List};
use crate::time::{self, Time};
use crate::timer::Deadline;

/// The nine states a thread can be in. [`ThreadState::is_runnable`]
/// identifies the subset the scheduler re-enqueues after a run: a thread
/// that suspended itself into any other state has already been placed
/// wherever it needs to be (an event's waiter list, the armed-timer list,
/// nowhere at all) by the operation that put it there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadState {
    Init = 1,
    Ready = 2,
    Yielded = 4,
    Sleeping = 8,
    WaitCond = 16,
    WaitEvent = 32,
    WaitSubthread = 64,
    Final = 128,
    Reset = 256,
}

impl ThreadState {
    /// Whether the scheduler should put a thread left in this state back on
    /// the ready list after it returns from `run`.
    pub fn is_runnable(self) -> bool {
        matches!(
            self,
            ThreadState::Ready | ThreadState::Yielded | ThreadState::WaitCond
        )
    }
}

/// The type-erased handle the kernel manipulates: an application's thread
/// struct embeds a [`Thread`] and implements this trait so the kernel can
/// re-dispatch into it generically.
pub trait ThreadBody {
    /// Access to the embedded kernel bookkeeping.
    fn thread(&self) -> &Thread;

    /// Run (or resume) this thread's body until it next suspends or
    /// finishes. Called by [`Kernel::run_once`] with the kernel unlocked.
    fn run(&'static self, kernel: &'static Kernel);
}

/// Kernel-owned bookkeeping embedded in every thread struct.
///
/// Everything here is `Cell`-based: the kernel always accesses threads
/// through shared `&'static` references (there is no owning pointer to hand
/// out `&mut` through), and all mutation happens with the kernel locked.
pub struct Thread {
    pub(crate) registry_link: Link<dyn ThreadBody>,
    pub(crate) queue_link: Link<dyn ThreadBody>,
    pub(crate) timeout_link: Link<dyn Deadline>,

    /// Which queue `queue_link` currently belongs to (the ready list, or
    /// some event's waiter list), so a firing timeout knows where to detach
    /// this thread from. `None` when the thread isn't queued anywhere.
    pub(crate) current_queue: Cell<Option<&'static List<QueueAdapter>>>,

    expiration: Cell<Time>,
    state: Cell<ThreadState>,
    continuation: Cell<u32>,
    wakeup_reason: Cell<WakeupReason>,

    /// Set only for subthreads that are currently being awaited: the parent
    /// to wake with `SUBTHREAD_DONE` when this thread reaches `Final`.
    parent: Cell<Option<&'static dyn ThreadBody>>,

    /// Filled in by `Kernel::register`: this thread's own type-erased
    /// handle, needed so operations starting from a bare `&Thread` (notably
    /// a firing timeout) can still re-enqueue the owning `dyn ThreadBody`.
    self_ref: Cell<Option<&'static dyn ThreadBody>>,
    kernel: Cell<Option<&'static Kernel>>,

    pub name: &'static str,
}

impl Thread {
    pub const fn new(name: &'static str) -> Self {
        Self {
            registry_link: Link::new(),
            queue_link: Link::new(),
            timeout_link: Link::new(),
            current_queue: Cell::new(None),
            expiration: Cell::new(time::NEVER),
            state: Cell::new(ThreadState::Init),
            continuation: Cell::new(0),
            wakeup_reason: Cell::new(WakeupReason::empty()),
            parent: Cell::new(None),
            self_ref: Cell::new(None),
            kernel: Cell::new(None),
            name,
        }
    }

    pub fn state(&self) -> ThreadState {
        self.state.get()
    }

    pub(crate) fn set_state(&self, state: ThreadState) {
        self.state.set(state);
    }

    /// The resume-point tag the thread body's own `run` match interprets.
    /// Meaningless to the kernel; never inspected outside the thread's own
    /// code.
    pub fn continuation(&self) -> u32 {
        self.continuation.get()
    }

    pub fn set_continuation(&self, value: u32) {
        self.continuation.set(value);
    }

    pub fn wakeup_reason(&self) -> WakeupReason {
        self.wakeup_reason.get()
    }

    pub(crate) fn set_wakeup_reason(&self, reason: WakeupReason) {
        self.wakeup_reason.set(reason);
    }

    pub(crate) fn add_wakeup_reason(&self, reason: WakeupReason) {
        self.wakeup_reason.set(self.wakeup_reason.get() | reason);
    }

    pub(crate) fn self_ref(&self) -> &'static dyn ThreadBody {
        self.self_ref
            .get()
            .expect("thread used before Kernel::register")
    }

    pub(crate) fn kernel(&self) -> &'static Kernel {
        self.kernel
            .get()
            .expect("thread used before Kernel::register")
    }

    pub(crate) fn bind(&self, body: &'static dyn ThreadBody, kernel: &'static Kernel) {
        self.self_ref.set(Some(body));
        self.kernel.set(Some(kernel));
    }

    /// Whether `bind` has already run for this thread (i.e. it has been
    /// registered with some kernel, directly or as a lazily-started
    /// subthread).
    pub(crate) fn is_bound(&self) -> bool {
        self.self_ref.get().is_some()
    }

    /// Whether this thread is currently linked into its kernel's registry.
    /// True from `Kernel::register` (or the first time it is used as a
    /// subthread) for the rest of its lifetime.
    pub fn is_registered(&self) -> bool {
        self.registry_link.is_linked()
    }

    /// Whether this thread is currently on some scheduling queue (the ready
    /// list, or an event's waiter list) via `queue_link`.
    pub fn is_queued(&self) -> bool {
        self.queue_link.is_linked()
    }

    pub(crate) fn parent(&self) -> Option<&'static dyn ThreadBody> {
        self.parent.get()
    }

    pub(crate) fn set_parent(&self, parent: Option<&'static dyn ThreadBody>) {
        self.parent.set(parent);
    }

    /// Reset a subthread so it can be awaited again: back to `Init`, no
    /// parent, resume point cleared. Per the kernel's composition model,
    /// *any* thread may be used as a subthread and reused this way, not
    /// just a distinct "SubThread" type.
    pub fn reset(&self) {
        self.state.set(ThreadState::Init);
        self.continuation.set(0);
        self.wakeup_reason.set(WakeupReason::empty());
        self.parent.set(None);
    }
}

impl Deadline for Thread {
    fn expiration(&self) -> &Cell<Time> {
        &self.expiration
    }

    fn deadline_link(&'static self) -> &'static Link<dyn Deadline> {
        &self.timeout_link
    }

    fn fire(&'static self, _overrun: Time) {
        let kernel = self.kernel();
        kernel.lock_from_isr();
        self.expiration.set(time::EXPIRED);
        kernel.wakeup(self.self_ref(), WakeupReason::TIMEOUT);
        kernel.unlock_from_isr();
    }
}

/// A thread being awaited by another thread. Structurally identical to
/// [`Thread`] — the only extra state a subthread needs is the `parent`
/// back-pointer, which every `Thread` already carries — so this is a type
/// alias rather than a distinct type, kept for vocabulary parity with the
/// glossary.
pub type SubThread = Thread;

/// Adapter selecting the thread registry's link field.
pub struct RegistryAdapter;
impl Adapter for RegistryAdapter {
    type Element = dyn ThreadBody;
    fn link(elem: &'static dyn ThreadBody) -> &'static Link<dyn ThreadBody> {
        &elem.thread().registry_link
    }
}

/// Adapter selecting the link field used by both the kernel's ready list and
/// every event's waiter list — a thread is on at most one of those at a
/// time, so sharing the field (rather than giving events their own link) is
/// safe and matches the non-Rust original's choice to queue waiting threads
/// on their ordinary ready-list link.
pub struct QueueAdapter;
impl Adapter for QueueAdapter {
    type Element = dyn ThreadBody;
    fn link(elem: &'static dyn ThreadBody) -> &'static Link<dyn ThreadBody> {
        &elem.thread().queue_link
    }
}
