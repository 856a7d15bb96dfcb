//! Producer/consumer coordination through an [`Event`], driven by a
//! simulated tick source instead of real hardware.
//!
//! Mirrors the teacher crate's `examples/producer_consumer.rs`, but the
//! coordination primitive is this crate's `Event` rather than a shared
//! queue polled under `yield_thread()` — producer and consumer each park on
//! the event with the protothread operators instead of busy-polling.

use cooperative_kernel::event::WakeupReason;
use cooperative_kernel::thread::{Thread, ThreadBody};
use cooperative_kernel::time;
use cooperative_kernel::{Event, Kernel};

static ITEM_READY: Event = Event::new(0x1);

const PRODUCER_ITEMS: u32 = 6;

struct Producer {
    thread: Thread,
    produced: core::cell::Cell<u32>,
}

impl ThreadBody for Producer {
    fn thread(&self) -> &Thread {
        &self.thread
    }

    fn run(&'static self, kernel: &'static Kernel) {
        if self.produced.get() >= PRODUCER_ITEMS {
            kernel.end(self);
            return;
        }
        self.produced.set(self.produced.get() + 1);
        println!("producer: item {} ready", self.produced.get());
        kernel.signal_event(&ITEM_READY, WakeupReason::empty());
        kernel.sleep(self, 5);
    }
}

struct Consumer {
    thread: Thread,
    consumed: core::cell::Cell<u32>,
}

impl ThreadBody for Consumer {
    fn thread(&self) -> &Thread {
        &self.thread
    }

    fn run(&'static self, kernel: &'static Kernel) {
        match self.thread.continuation() {
            0 => {
                self.thread.set_continuation(1);
                kernel.wait_event(self, &ITEM_READY, time::INFINITE);
            }
            _ => {
                kernel.clear_timeout(self);
                let reason = self.thread.wakeup_reason();
                debug_assert!(reason.contains(WakeupReason::OK));
                self.consumed.set(self.consumed.get() + 1);
                println!("consumer: consumed item {}", self.consumed.get());
                self.thread.set_continuation(0);
                kernel.wait_event(self, &ITEM_READY, time::INFINITE);
            }
        }
    }
}

static PRODUCER: Producer = Producer {
    thread: Thread::new("producer"),
    produced: core::cell::Cell::new(0),
};
static CONSUMER: Consumer = Consumer {
    thread: Thread::new("consumer"),
    consumed: core::cell::Cell::new(0),
};
static KERNEL: Kernel = Kernel::new();

fn main() {
    KERNEL.register(&PRODUCER);
    KERNEL.register(&CONSUMER);

    for tick in 0..200u32 {
        KERNEL.run_once();
        KERNEL.enter_isr();
        KERNEL.expire_timers(1);
        KERNEL.leave_isr();
        let _ = tick;
        if PRODUCER.thread.state() == cooperative_kernel::ThreadState::Final
            && CONSUMER.consumed.get() >= PRODUCER.produced.get()
        {
            break;
        }
    }

    println!(
        "done: produced={} consumed={}",
        PRODUCER.produced.get(),
        CONSUMER.consumed.get()
    );
}
