//! A cooperative microkernel core for small embedded microcontrollers:
//! a single-stack scheduler, a monotonic timer wheel, events, and the
//! protothread discipline that lets many logical "threads" share one native
//! stack. No preemption happens between threads; only hardware interrupts
//! preempt, and only at the narrow critical sections the kernel itself
//! brackets with its lock.
//!
//! Device drivers, byte streams, formatted printing/shell, 2D rendering, and
//! board bring-up are deliberately out of scope — this crate is the
//! scheduler/timer/event/thread quartet and the intrusive list primitives
//! that make it zero-allocation, nothing more.
//!
//! ```ignore
//! use cooperative_kernel::{time, Kernel, ThreadBody, KERNEL};
//!
//! struct Blinker { thread: cooperative_kernel::thread::Thread }
//!
//! impl ThreadBody for Blinker {
//!     fn thread(&self) -> &cooperative_kernel::thread::Thread { &self.thread }
//!     fn run(&'static self, kernel: &'static Kernel) {
//!         // ... turn the LED on ...
//!         kernel.sleep(self, 100);
//!     }
//! }
//!
//! static BLINKER: Blinker = Blinker { thread: cooperative_kernel::thread::Thread::new("blinker") };
//!
//! fn main() {
//!     KERNEL.register(&BLINKER);
//!     while KERNEL.run_once() {}
//! }
//! ```

#![no_std]

pub mod event;
pub mod fault;
pub mod kernel;
pub mod list;
pub mod thread;
pub mod time;
pub mod timer;

#[cfg(test)]
extern crate std;

#[cfg(all(not(test), not(feature = "std")))]
use core::panic::PanicInfo;

#[cfg(all(not(test), not(feature = "std")))]
#[panic_handler]
fn panic(_info: &PanicInfo) -> ! {
    loop {
        core::hint::spin_loop();
    }
}

pub use event::{Event, EventMask, WakeupReason};
pub use fault::{Fault, FaultHandler, FaultInfo};
pub use kernel::Kernel;
pub use list::{Adapter, Link, List};
pub use thread::{SubThread, Thread, ThreadBody, ThreadState};
pub use time::Time;
pub use timer::{Deadline, Timer};

/// The kernel most applications need. `Kernel::new()` is a `const fn`, so
/// this is a zero-cost `static` like the teacher crate's own
/// `SCHEDULER`/`ATOMIC_SCHEDULER` singletons; construct an independent
/// `Kernel` instead (see the `kernel` module's tests) when isolation
/// matters, as in unit tests.
pub static KERNEL: Kernel = Kernel::new();
