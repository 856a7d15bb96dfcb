//! Contract-violation handling.
//!
//! The kernel does not use a `Result`-based error hierarchy for invariant
//! violations: a broken invariant (double-arming a timer, unlocking without a
//! matching lock, signaling an event while unlocked, ...) means the caller's
//! program is wrong, not that a recoverable condition occurred. `Fault`
//! captures what went wrong; the registered [`FaultHandler`] decides what to
//! do about it.

use core::sync::atomic::{AtomicPtr, Ordering};

/// A contract violation detected by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// `Kernel::lock`/`unlock` called from the wrong context, or unbalanced.
    LockMisuse(&'static str),
    /// `Kernel::enter_isr`/`leave_isr` unbalanced, or a lock held across an
    /// interrupt entry.
    IsrMisuse(&'static str),
    /// A `Timer` (or thread timeout) was armed while already armed.
    DoubleArm,
    /// An intrusive link was inserted into a list while already linked.
    DoubleInsert,
    /// An operation required the kernel to be locked and it was not.
    NotLocked(&'static str),
    /// `Kernel::wait_subthread` targeted a child that already has a parent
    /// awaiting it.
    SubthreadBusy,
}

impl Fault {
    /// A short, static description suitable for logging.
    pub fn message(&self) -> &'static str {
        match self {
            Fault::LockMisuse(m) => m,
            Fault::IsrMisuse(m) => m,
            Fault::DoubleArm => "attempt to arm a timer that is already armed",
            Fault::DoubleInsert => "attempt to insert an element already linked into this list",
            Fault::NotLocked(m) => m,
            Fault::SubthreadBusy => "attempt to wait on a subthread that already has a parent",
        }
    }
}

/// Where the fault occurred, captured by the `ensure!` call site.
#[derive(Debug, Clone, Copy)]
pub struct FaultInfo {
    pub fault: Fault,
    pub file: &'static str,
    pub line: u32,
}

/// A fault handler never returns: the kernel's invariants are no longer
/// trustworthy once one fires, so the only safe continuations are to halt
/// or reset the device.
pub type FaultHandler = fn(FaultInfo) -> !;

fn default_handler(info: FaultInfo) -> ! {
    log::error!(
        "kernel fault at {}:{}: {}",
        info.file,
        info.line,
        info.fault.message()
    );
    loop {
        core::hint::spin_loop();
    }
}

static HANDLER: AtomicPtr<()> = AtomicPtr::new(default_handler as *mut ());

/// Install an application-provided fault handler, replacing the default
/// log-and-spin handler. Mirrors `log::set_logger`: set once, early, before
/// the kernel can run.
pub fn set_fault_handler(handler: FaultHandler) {
    HANDLER.store(handler as *mut (), Ordering::Release);
}

/// Raise a fault, invoking the currently-registered handler. Does not
/// return.
#[cold]
pub fn raise(fault: Fault, file: &'static str, line: u32) -> ! {
    let ptr = HANDLER.load(Ordering::Acquire);
    // Safety: only ever stored from `set_fault_handler` or the default,
    // both of which are `FaultHandler`-typed function pointers.
    let handler: FaultHandler = unsafe { core::mem::transmute(ptr) };
    handler(FaultInfo {
        fault,
        file,
        line,
    })
}

/// Assert a kernel invariant, raising a [`Fault`] through the registered
/// handler if it does not hold.
macro_rules! ensure {
    ($cond:expr, $fault:expr) => {
        if !($cond) {
            crate::fault::raise($fault, file!(), line!());
        }
    };
}

pub(crate) use ensure;
