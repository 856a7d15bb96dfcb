//! Parent/child composition via `WAIT_SUBTHREAD` (spec scenario 4): a
//! parent blocks on a child subthread that yields a few times before
//! ending, then resumes once the child reaches `Final`.

use cooperative_kernel::event::WakeupReason;
use cooperative_kernel::thread::{Thread, ThreadBody};
use cooperative_kernel::time;
use cooperative_kernel::Kernel;

struct Child {
    thread: Thread,
    yields_left: core::cell::Cell<u32>,
}

impl ThreadBody for Child {
    fn thread(&self) -> &Thread {
        &self.thread
    }

    fn run(&'static self, kernel: &'static Kernel) {
        let left = self.yields_left.get();
        if left == 0 {
            println!("child: done");
            kernel.end(self);
            return;
        }
        println!("child: yield ({} left)", left);
        self.yields_left.set(left - 1);
        kernel.yield_now(self);
    }
}

struct Parent {
    thread: Thread,
    child: &'static Child,
}

impl ThreadBody for Parent {
    fn thread(&self) -> &Thread {
        &self.thread
    }

    fn run(&'static self, kernel: &'static Kernel) {
        match self.thread.continuation() {
            0 => {
                println!("parent: waiting on child");
                self.thread.set_continuation(1);
                kernel.wait_subthread(self, self.child, time::INFINITE);
            }
            _ => {
                kernel.clear_timeout(self);
                let reason = self.thread.wakeup_reason();
                assert!(reason.contains(WakeupReason::SUBTHREAD_DONE));
                println!("parent: child finished, wakeup_reason={:?}", reason);
                kernel.end(self);
            }
        }
    }
}

static CHILD: Child = Child {
    thread: Thread::new("child"),
    yields_left: core::cell::Cell::new(3),
};
static PARENT: Parent = Parent {
    thread: Thread::new("parent"),
    child: &CHILD,
};
static KERNEL: Kernel = Kernel::new();

fn main() {
    KERNEL.register(&PARENT);

    let mut steps = 0;
    while KERNEL.run_once() {
        steps += 1;
        if steps > 20 {
            break;
        }
    }
    println!("scheduler drained after {} run-steps", steps);
}
