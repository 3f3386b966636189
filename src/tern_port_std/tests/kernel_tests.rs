//! Kernel scenario tests, driven by the deterministic simulator in
//! `tern_port_std`.
//!
//! Each test module instantiates its own kernel trait type with `use_port!`
//! and its own set of thread records and primitives, boots the kernel, and
//! checks an execution sequence with [`utils::SeqTracker`]. Scenarios end by
//! calling `shutdown` from the last thread standing; `boot` then returns on
//! the test thread, rethrowing any worker panic.

mod utils {
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// An atomic counter for checking an execution sequence.
    pub struct SeqTracker {
        counter: AtomicUsize,
    }

    impl SeqTracker {
        pub const fn new() -> Self {
            Self {
                counter: AtomicUsize::new(0),
            }
        }

        pub fn get(&self) -> usize {
            self.counter.load(Ordering::Relaxed)
        }

        /// Assert that the counter is equal to `old` and then replace it
        /// with `new`.
        #[track_caller]
        pub fn expect_and_replace(&self, old: usize, new: usize) {
            let got = self.counter.load(Ordering::Relaxed);
            log::debug!("seq: {got} (expected: {old}) -> {new}");
            assert_eq!(got, old, "expected sequence {old}, got {got}");
            self.counter.store(new, Ordering::Relaxed);
        }
    }

    /// A fixed-capacity, push-only event log.
    pub struct Trace {
        entries: [AtomicUsize; 16],
        len: AtomicUsize,
    }

    impl Trace {
        #[allow(clippy::declare_interior_mutable_const)]
        const ZERO: AtomicUsize = AtomicUsize::new(0);

        pub const fn new() -> Self {
            Self {
                entries: [Self::ZERO; 16],
                len: AtomicUsize::new(0),
            }
        }

        pub fn push(&self, value: usize) {
            let i = self.len.fetch_add(1, Ordering::Relaxed);
            self.entries[i].store(value, Ordering::Relaxed);
        }

        pub fn snapshot(&self) -> Vec<usize> {
            (0..self.len.load(Ordering::Relaxed))
                .map(|i| self.entries[i].load(Ordering::Relaxed))
                .collect()
        }
    }
}

/// Register a thread with its entry function and priority.
macro_rules! spawn {
    ($Sys:ty, $thread:expr, $entry:expr, $prio:expr) => {
        tern_kernel::System::<$Sys>::spawn(
            $thread,
            tern_kernel::ThreadInfo {
                entry: $entry,
                param: 0,
                priority: $prio,
                stack: None,
            },
        )
        .unwrap()
    };
}

/// Priority preemption across an event (scenario: two waiters, one
/// `notify_all`, release strictly by priority).
///
/// 1. (seq 0) `a` (prio 0) parks on `go`.
/// 2. (seq 1, 2) `b` (prio 1) and `c` (prio 2) block on `evt`.
/// 3. (seq 3) `d` (prio 3) notifies `go`; `a` preempts it immediately.
/// 4. (seq 4) `a` wakes both waiters with `notify_all` and, still being the
///    highest priority, keeps running until it blocks.
/// 5. (seq 5 -> 7) `b`, then `c`, then finally `d` run in priority order.
mod priority_preemption {
    use super::utils::SeqTracker;
    use tern_kernel::{Event, Thread};

    tern_port_std::use_port!(unsafe struct Sys { priorities: 4 });

    static SEQ: SeqTracker = SeqTracker::new();
    static EVT: Event<Sys> = Event::new();
    static GO: Event<Sys> = Event::new();
    static PARK: Event<Sys> = Event::new();
    static THREAD_A: Thread<Sys> = Thread::new();
    static THREAD_B: Thread<Sys> = Thread::new();
    static THREAD_C: Thread<Sys> = Thread::new();
    static THREAD_D: Thread<Sys> = Thread::new();

    fn a_body(_: usize) {
        SEQ.expect_and_replace(0, 1);
        GO.wait();
        // Woken by `d`; both waiters are parked on `evt` by now
        EVT.notify_all();
        SEQ.expect_and_replace(4, 5);
        loop {
            PARK.wait();
        }
    }

    fn b_body(_: usize) {
        SEQ.expect_and_replace(1, 2);
        EVT.wait();
        SEQ.expect_and_replace(5, 6);
        loop {
            PARK.wait();
        }
    }

    fn c_body(_: usize) {
        SEQ.expect_and_replace(2, 3);
        EVT.wait();
        SEQ.expect_and_replace(6, 7);
        loop {
            PARK.wait();
        }
    }

    fn d_body(_: usize) {
        SEQ.expect_and_replace(3, 4);
        GO.notify();
        // Everyone of higher priority has blocked again
        SEQ.expect_and_replace(7, 8);
        tern_port_std::shutdown::<Sys>();
        tern_port_std::halt();
    }

    #[test]
    fn priority_preemption() {
        tern_port_std::boot::<Sys>(|| {
            spawn!(Sys, &THREAD_A, a_body, 0);
            spawn!(Sys, &THREAD_B, b_body, 1);
            spawn!(Sys, &THREAD_C, c_body, 2);
            spawn!(Sys, &THREAD_D, d_body, 3);
        });
        assert_eq!(SEQ.get(), 8);
    }
}

/// Ready-queue FIFO among equal priorities is preserved across yields.
mod fifo_among_equals {
    use super::utils::Trace;
    use tern_kernel::{System, Thread};

    tern_port_std::use_port!(unsafe struct Sys { priorities: 2 });

    static TRACE: Trace = Trace::new();
    static THREAD_1: Thread<Sys> = Thread::new();
    static THREAD_2: Thread<Sys> = Thread::new();
    static THREAD_3: Thread<Sys> = Thread::new();

    fn body(id: usize) {
        for round in 0..2 {
            TRACE.push(id);
            if id == 3 && round == 1 {
                assert_eq!(TRACE.snapshot(), [1, 2, 3, 1, 2, 3]);
                tern_port_std::shutdown::<Sys>();
                tern_port_std::halt();
            }
            System::<Sys>::yield_now();
        }
        tern_port_std::halt();
    }

    #[test]
    fn fifo_among_equals() {
        tern_port_std::boot::<Sys>(|| {
            for (thread, id) in [(&THREAD_1, 1), (&THREAD_2, 2), (&THREAD_3, 3)] {
                System::<Sys>::spawn(
                    thread,
                    tern_kernel::ThreadInfo {
                        entry: body,
                        param: id,
                        priority: 1,
                        stack: None,
                    },
                )
                .unwrap();
            }
        });
    }
}

/// Drift-free periodic waits: 100 periods of 10 ticks elapse in exactly
/// 1000 ticks of the virtual clock, and `delay`/`shift` preserve the stored
/// deadline.
mod periodic_no_drift {
    use tern_kernel::{System, Thread, Timer};

    tern_port_std::use_port!(unsafe struct Sys { priorities: 1 });

    static TIMER: Timer<Sys> = Timer::new();
    static THREAD: Thread<Sys> = Thread::new();

    fn body(_: usize) {
        System::<Sys>::update_deadline(&TIMER);
        let start = TIMER.now();
        for _ in 0..100 {
            TIMER.period(10);
        }
        assert_eq!(TIMER.now().wrapping_sub(start), 1000);

        // `delay` waits relative to "now" and restores the deadline
        let n0 = TIMER.now();
        System::<Sys>::update_deadline(&TIMER);
        TIMER.delay(4);
        assert_eq!(TIMER.now().wrapping_sub(n0), 4);
        assert!(System::<Sys>::deadline_elapsed(&TIMER));

        // A `shift` whose target is already in the past fires on the next
        // tick
        TIMER.shift(2);
        assert_eq!(TIMER.now().wrapping_sub(n0), 5);

        // A bare `wait` blocks until the deadline set beforehand
        System::<Sys>::set_deadline(&TIMER, 3);
        TIMER.wait();
        assert_eq!(TIMER.now().wrapping_sub(n0), 8);
        assert!(System::<Sys>::deadline_elapsed(&TIMER));

        tern_port_std::shutdown::<Sys>();
        tern_port_std::halt();
    }

    #[test]
    fn periodic_no_drift() {
        tern_port_std::boot::<Sys>(|| {
            spawn!(Sys, &THREAD, body, 0);
        });
    }
}

/// Queue backpressure and byte conservation: a producer of 10 bytes against
/// a capacity-4 queue blocks on full, the consumer's reads arrive in order.
mod queue_backpressure {
    use tern_kernel::{Event, Queue, Thread};

    tern_port_std::use_port!(unsafe struct Sys { priorities: 2 });

    static QUEUE: Queue<Sys, 4> = Queue::new();
    static PARK: Event<Sys> = Event::new();
    static PRODUCER: Thread<Sys> = Thread::new();
    static CONSUMER: Thread<Sys> = Thread::new();

    fn producer_body(_: usize) {
        for byte in 0..10u8 {
            QUEUE.put_byte(byte);
        }
        loop {
            PARK.wait();
        }
    }

    fn consumer_body(_: usize) {
        let mut buf = [0u8; 10];
        QUEUE.get(&mut buf);
        assert_eq!(buf, [0, 1, 2, 3, 4, 5, 6, 7, 8, 9]);
        assert!(QUEUE.is_empty());
        tern_port_std::shutdown::<Sys>();
        tern_port_std::halt();
    }

    #[test]
    fn queue_backpressure() {
        tern_port_std::boot::<Sys>(|| {
            spawn!(Sys, &PRODUCER, producer_body, 0);
            spawn!(Sys, &CONSUMER, consumer_body, 1);
        });
    }
}

/// Timed wait, both outcomes: the deadline fires when nobody notifies, and a
/// notification before the deadline wins the race.
///
/// 1. `h` arms a 5-tick wait on `evt`; nobody notifies; the wait reports a
///    timeout on tick 5 exactly.
/// 2. `h` arms another 5-tick wait; `w` wakes up 3 ticks in and notifies;
///    the wait reports success.
mod timed_wait_hit_and_miss {
    use super::utils::SeqTracker;
    use tern_kernel::{Event, System, Thread, Timer};

    tern_port_std::use_port!(unsafe struct Sys { priorities: 2 });

    static SEQ: SeqTracker = SeqTracker::new();
    static TIMER: Timer<Sys> = Timer::new();
    static EVT: Event<Sys> = Event::new();
    static GO: Event<Sys> = Event::new();
    static THREAD_H: Thread<Sys> = Thread::new();
    static THREAD_W: Thread<Sys> = Thread::new();

    fn h_body(_: usize) {
        SEQ.expect_and_replace(0, 1);

        // Miss: the deadline expires
        System::<Sys>::set_deadline(&TIMER, 5);
        assert!(EVT.wait_timed(&TIMER).is_err());
        assert_eq!(TIMER.now(), 5);

        // Hit: `w` notifies at tick 8, two ticks before the deadline
        GO.notify();
        System::<Sys>::set_deadline(&TIMER, 5);
        assert!(EVT.wait_timed(&TIMER).is_ok());
        assert_eq!(TIMER.now(), 8);

        SEQ.expect_and_replace(2, 3);
        tern_port_std::shutdown::<Sys>();
        tern_port_std::halt();
    }

    fn w_body(_: usize) {
        SEQ.expect_and_replace(1, 2);
        GO.wait();
        TIMER.delay(3);
        EVT.notify();
        tern_port_std::halt();
    }

    #[test]
    fn timed_wait_hit_and_miss() {
        tern_port_std::boot::<Sys>(|| {
            spawn!(Sys, &THREAD_H, h_body, 0);
            spawn!(Sys, &THREAD_W, w_body, 1);
        });
        assert_eq!(SEQ.get(), 3);
    }
}

/// Mutex grants alternate between two equal-priority contenders in the FIFO
/// order of their lock attempts.
mod mutex_fifo_fairness {
    use super::utils::Trace;
    use tern_kernel::{Event, Mutex, System, Thread};

    tern_port_std::use_port!(unsafe struct Sys { priorities: 2 });

    static TRACE: Trace = Trace::new();
    static MUTEX: Mutex<Sys> = Mutex::new();
    static PARK: Event<Sys> = Event::new();
    static THREAD_1: Thread<Sys> = Thread::new();
    static THREAD_2: Thread<Sys> = Thread::new();

    fn contender(id: usize) {
        for _ in 0..3 {
            MUTEX.lock();
            TRACE.push(id);
            // Let the peer queue up behind the lock
            System::<Sys>::yield_now();
            MUTEX.unlock();
            // Let the peer take its turn
            System::<Sys>::yield_now();
        }
        if id == 2 {
            assert_eq!(TRACE.snapshot(), [1, 2, 1, 2, 1, 2]);
            tern_port_std::shutdown::<Sys>();
            tern_port_std::halt();
        }
        loop {
            PARK.wait();
        }
    }

    #[test]
    fn mutex_fifo_fairness() {
        tern_port_std::boot::<Sys>(|| {
            for (thread, id) in [(&THREAD_1, 1), (&THREAD_2, 2)] {
                System::<Sys>::spawn(
                    thread,
                    tern_kernel::ThreadInfo {
                        entry: contender,
                        param: id,
                        priority: 1,
                        stack: None,
                    },
                )
                .unwrap();
            }
        });
    }
}

/// An ISR wake of a higher-priority thread: `notify_isr` reports "yield
/// suggested", the epilogue yields, and the woken thread runs before the
/// interrupted one continues.
mod isr_wake_yields {
    use super::utils::SeqTracker;
    use tern_kernel::{Event, System, Thread};

    tern_port_std::use_port!(unsafe struct Sys { priorities: 2 });

    static SEQ: SeqTracker = SeqTracker::new();
    static EVT: Event<Sys> = Event::new();
    static PARK: Event<Sys> = Event::new();
    static THREAD_H: Thread<Sys> = Thread::new();
    static THREAD_L: Thread<Sys> = Thread::new();

    fn isr() {
        // Safety: called in an interrupt context by the simulator
        unsafe {
            if EVT.notify_isr() {
                System::<Sys>::yield_isr();
            }
        }
    }

    fn h_body(_: usize) {
        SEQ.expect_and_replace(0, 1);
        EVT.wait();
        SEQ.expect_and_replace(2, 3);
        loop {
            PARK.wait();
        }
    }

    fn l_body(_: usize) {
        SEQ.expect_and_replace(1, 2);
        tern_port_std::raise_interrupt::<Sys>(isr);
        // `h` ran during the interrupt's epilogue yield
        SEQ.expect_and_replace(3, 4);
        tern_port_std::shutdown::<Sys>();
        tern_port_std::halt();
    }

    #[test]
    fn isr_wake_yields() {
        tern_port_std::boot::<Sys>(|| {
            spawn!(Sys, &THREAD_H, h_body, 0);
            spawn!(Sys, &THREAD_L, l_body, 1);
        });
        assert_eq!(SEQ.get(), 4);
    }
}

/// N critical-section enters followed by N exits restore the interrupt mask,
/// and a blocking wait inside a critical section still gets its tick
/// interrupts serviced.
mod critical_section_nesting {
    use tern_kernel::{PortThreading, System, Thread, Timer};

    tern_port_std::use_port!(unsafe struct Sys { priorities: 1 });

    static TIMER: Timer<Sys> = Timer::new();
    static THREAD: Thread<Sys> = Thread::new();

    fn body(_: usize) {
        assert!(!Sys::is_cpu_lock_active());
        System::<Sys>::enter_critical();
        System::<Sys>::enter_critical();
        System::<Sys>::enter_critical();
        assert!(Sys::is_cpu_lock_active());
        System::<Sys>::exit_critical();
        System::<Sys>::exit_critical();
        assert!(Sys::is_cpu_lock_active());
        System::<Sys>::exit_critical();
        assert!(!Sys::is_cpu_lock_active());

        // A wait inside a critical section: ticks are serviced while the
        // thread is blocked, and the mask is restored when it resumes
        System::<Sys>::enter_critical();
        TIMER.delay(2);
        assert!(Sys::is_cpu_lock_active());
        System::<Sys>::exit_critical();
        assert!(!Sys::is_cpu_lock_active());
        assert_eq!(TIMER.now(), 2);

        tern_port_std::shutdown::<Sys>();
        tern_port_std::halt();
    }

    #[test]
    fn critical_section_nesting() {
        tern_port_std::boot::<Sys>(|| {
            spawn!(Sys, &THREAD, body, 0);
        });
    }
}

/// Waiters are released in priority order, FIFO within a level: arrival
/// order `w0(0), w1a(1), w1b(1), w2(2)`, wake order the same even though
/// the notifier releases them one at a time.
mod notify_in_priority_order {
    use super::utils::SeqTracker;
    use tern_kernel::{Event, Thread};

    tern_port_std::use_port!(unsafe struct Sys { priorities: 4 });

    static SEQ: SeqTracker = SeqTracker::new();
    static EVT: Event<Sys> = Event::new();
    static PARK: Event<Sys> = Event::new();
    static THREAD_W0: Thread<Sys> = Thread::new();
    static THREAD_W1A: Thread<Sys> = Thread::new();
    static THREAD_W1B: Thread<Sys> = Thread::new();
    static THREAD_W2: Thread<Sys> = Thread::new();
    static THREAD_D: Thread<Sys> = Thread::new();

    fn w0_body(_: usize) {
        SEQ.expect_and_replace(0, 1);
        EVT.wait();
        SEQ.expect_and_replace(5, 6);
        loop {
            PARK.wait();
        }
    }

    fn w1a_body(_: usize) {
        SEQ.expect_and_replace(1, 2);
        EVT.wait();
        SEQ.expect_and_replace(6, 7);
        loop {
            PARK.wait();
        }
    }

    fn w1b_body(_: usize) {
        SEQ.expect_and_replace(2, 3);
        EVT.wait();
        SEQ.expect_and_replace(7, 8);
        loop {
            PARK.wait();
        }
    }

    fn w2_body(_: usize) {
        SEQ.expect_and_replace(3, 4);
        EVT.wait();
        SEQ.expect_and_replace(8, 9);
        loop {
            PARK.wait();
        }
    }

    fn d_body(_: usize) {
        SEQ.expect_and_replace(4, 5);
        for _ in 0..4 {
            // Each notify wakes the best remaining waiter, which preempts us
            EVT.notify();
        }
        SEQ.expect_and_replace(9, 10);
        tern_port_std::shutdown::<Sys>();
        tern_port_std::halt();
    }

    #[test]
    fn notify_in_priority_order() {
        tern_port_std::boot::<Sys>(|| {
            spawn!(Sys, &THREAD_W0, w0_body, 0);
            spawn!(Sys, &THREAD_W1A, w1a_body, 1);
            spawn!(Sys, &THREAD_W1B, w1b_body, 1);
            spawn!(Sys, &THREAD_W2, w2_body, 2);
            spawn!(Sys, &THREAD_D, d_body, 3);
        });
        assert_eq!(SEQ.get(), 10);
    }
}

/// Signals coalesce: three notifications with nobody waiting pass exactly
/// one subsequent wait.
mod signal_coalesces {
    use super::utils::SeqTracker;
    use tern_kernel::{Signal, Thread};

    tern_port_std::use_port!(unsafe struct Sys { priorities: 2 });

    static SEQ: SeqTracker = SeqTracker::new();
    static SIGNAL: Signal<Sys> = Signal::new();
    static THREAD_D: Thread<Sys> = Thread::new();
    static THREAD_W: Thread<Sys> = Thread::new();

    fn isr() {
        // Safety: called in an interrupt context by the simulator
        unsafe {
            let _ = SIGNAL.notify_isr();
            let _ = SIGNAL.notify_isr();
            let _ = SIGNAL.notify_isr();
        }
    }

    fn d_body(_: usize) {
        // A fresh signal starts open; the first wait passes through
        SIGNAL.wait();
        assert!(SIGNAL.is_closed());

        tern_port_std::raise_interrupt::<Sys>(isr);
        // The three notifications coalesced into one
        SIGNAL.wait();
        SEQ.expect_and_replace(0, 1);
        SIGNAL.wait(); // blocks: nothing left
        SEQ.expect_and_replace(2, 3);
        tern_port_std::shutdown::<Sys>();
        tern_port_std::halt();
    }

    fn w_body(_: usize) {
        SEQ.expect_and_replace(1, 2);
        SIGNAL.notify();
        tern_port_std::halt();
    }

    #[test]
    fn signal_coalesces() {
        tern_port_std::boot::<Sys>(|| {
            spawn!(Sys, &THREAD_D, d_body, 0);
            spawn!(Sys, &THREAD_W, w_body, 1);
        });
        assert_eq!(SEQ.get(), 3);
    }
}

/// `Timer::abort` cancels another thread's timed wait: the wait reports a
/// timeout, the thread is cleanly off both lists, and a second abort finds
/// nothing to do.
mod timer_abort {
    use super::utils::SeqTracker;
    use tern_kernel::{Event, System, Thread, Timer};

    tern_port_std::use_port!(unsafe struct Sys { priorities: 2 });

    static SEQ: SeqTracker = SeqTracker::new();
    static TIMER: Timer<Sys> = Timer::new();
    static EVT: Event<Sys> = Event::new();
    static PARK: Event<Sys> = Event::new();
    static THREAD_D: Thread<Sys> = Thread::new();
    static THREAD_W: Thread<Sys> = Thread::new();

    fn d_body(_: usize) {
        TIMER.delay(2);
        SEQ.expect_and_replace(1, 2);
        assert!(TIMER.abort(&THREAD_W));
        assert!(!TIMER.abort(&THREAD_W));
        loop {
            PARK.wait();
        }
    }

    fn w_body(_: usize) {
        SEQ.expect_and_replace(0, 1);
        System::<Sys>::set_deadline(&TIMER, 1000);
        assert!(EVT.wait_timed(&TIMER).is_err());
        SEQ.expect_and_replace(2, 3);
        tern_port_std::shutdown::<Sys>();
        tern_port_std::halt();
    }

    #[test]
    fn timer_abort() {
        tern_port_std::boot::<Sys>(|| {
            spawn!(Sys, &THREAD_D, d_body, 0);
            spawn!(Sys, &THREAD_W, w_body, 1);
        });
        assert_eq!(SEQ.get(), 3);
    }
}

/// Timed mutex acquisition: a deadline while the lock is held reports a
/// timeout without taking ownership; a later attempt succeeds once the
/// holder releases.
mod mutex_lock_timed {
    use super::utils::SeqTracker;
    use tern_kernel::{Mutex, System, Thread, Timer};

    tern_port_std::use_port!(unsafe struct Sys { priorities: 2 });

    static SEQ: SeqTracker = SeqTracker::new();
    static TIMER: Timer<Sys> = Timer::new();
    static MUTEX: Mutex<Sys> = Mutex::new();
    static THREAD_H: Thread<Sys> = Thread::new();
    static THREAD_L: Thread<Sys> = Thread::new();

    fn h_body(_: usize) {
        TIMER.delay(1);
        // `l` took the mutex while we slept
        SEQ.expect_and_replace(1, 2);
        assert!(MUTEX.is_locked());

        System::<Sys>::set_deadline(&TIMER, 2);
        assert!(MUTEX.lock_timed(&TIMER).is_err());
        SEQ.expect_and_replace(2, 3);

        System::<Sys>::set_deadline(&TIMER, 100);
        assert!(MUTEX.lock_timed(&TIMER).is_ok());
        SEQ.expect_and_replace(3, 4);
        MUTEX.unlock();
        tern_port_std::shutdown::<Sys>();
        tern_port_std::halt();
    }

    fn l_body(_: usize) {
        MUTEX.lock();
        SEQ.expect_and_replace(0, 1);
        TIMER.delay(5);
        MUTEX.unlock();
        tern_port_std::halt();
    }

    #[test]
    fn mutex_lock_timed() {
        tern_port_std::boot::<Sys>(|| {
            spawn!(Sys, &THREAD_H, h_body, 0);
            spawn!(Sys, &THREAD_L, l_body, 1);
        });
        assert_eq!(SEQ.get(), 4);
    }
}

/// ISR queue accessors: refusal codes on full/empty, data in order, and the
/// threshold variant batching the producer wakeup until enough headroom
/// exists.
mod queue_isr {
    use std::sync::Mutex as StdMutex;

    use tern_kernel::{Event, Queue, System, Thread};

    tern_port_std::use_port!(unsafe struct Sys { priorities: 2 });

    static QUEUE: Queue<Sys, 2> = Queue::new();
    static TX: Queue<Sys, 2> = Queue::new();
    static PARK: Event<Sys> = Event::new();
    static PRODUCER: Thread<Sys> = Thread::new();
    static DRIVER: Thread<Sys> = Thread::new();
    static CODES: StdMutex<Vec<&'static str>> = StdMutex::new(Vec::new());

    fn code(c: &'static str) {
        CODES.lock().unwrap().push(c);
    }

    fn fill_isr() {
        // Safety: interrupt context, courtesy of the simulator
        unsafe {
            code(match QUEUE.put_byte_isr(10) {
                Ok(false) => "put:no-yield",
                Ok(true) => "put:yield",
                Err(_) => "put:full",
            });
            code(match QUEUE.put_byte_isr(20) {
                Ok(false) => "put:no-yield",
                Ok(true) => "put:yield",
                Err(_) => "put:full",
            });
            code(match QUEUE.put_byte_isr(30) {
                Ok(_) => "put:ok",
                Err(_) => "put:full",
            });
            code(match QUEUE.get_byte_isr() {
                Ok((10, false)) => "get:10",
                Ok(_) => "get:other",
                Err(_) => "get:empty",
            });
        }
    }

    fn drain_isr() {
        // Safety: interrupt context, courtesy of the simulator
        unsafe {
            // Two bytes queued, producer blocked on space. Threshold 0:
            // the first drain must not wake it, the second must.
            let (byte, yield_suggested) = TX.get_byte_threshold_isr(0).unwrap();
            assert_eq!(byte, 1);
            assert!(!yield_suggested);
            let (byte, yield_suggested) = TX.get_byte_threshold_isr(0).unwrap();
            assert_eq!(byte, 2);
            assert!(yield_suggested);
            System::<Sys>::yield_isr();
        }
    }

    fn producer_body(_: usize) {
        TX.put(&[1, 2]);
        // Full: this blocks until the drain ISR frees enough space
        TX.put_byte(3);
        loop {
            PARK.wait();
        }
    }

    fn driver_body(_: usize) {
        tern_port_std::raise_interrupt::<Sys>(fill_isr);
        assert_eq!(
            CODES.lock().unwrap().as_slice(),
            ["put:no-yield", "put:no-yield", "put:full", "get:10"],
        );
        assert_eq!(QUEUE.get_byte(), 20);
        assert!(QUEUE.is_empty());

        tern_port_std::raise_interrupt::<Sys>(drain_isr);
        // The producer ran during the epilogue yield and completed its put
        assert_eq!(TX.get_byte(), 3);
        tern_port_std::shutdown::<Sys>();
        tern_port_std::halt();
    }

    #[test]
    fn queue_isr() {
        tern_port_std::boot::<Sys>(|| {
            spawn!(Sys, &PRODUCER, producer_body, 0);
            spawn!(Sys, &DRIVER, driver_body, 1);
        });
    }
}

/// Bare suspend/resume, plus the registration error paths.
mod suspend_resume {
    use super::utils::SeqTracker;
    use tern_kernel::{Event, SpawnError, System, Thread, ThreadInfo};

    tern_port_std::use_port!(unsafe struct Sys { priorities: 2 });

    static SEQ: SeqTracker = SeqTracker::new();
    static PARK: Event<Sys> = Event::new();
    static THREAD_A: Thread<Sys> = Thread::new();
    static THREAD_B: Thread<Sys> = Thread::new();
    static THREAD_X: Thread<Sys> = Thread::new();

    fn a_body(_: usize) {
        SEQ.expect_and_replace(0, 1);
        System::<Sys>::suspend();
        SEQ.expect_and_replace(2, 3);
        loop {
            PARK.wait();
        }
    }

    fn b_body(_: usize) {
        SEQ.expect_and_replace(1, 2);
        // Registration is closed once the scheduler is running
        assert_eq!(
            System::<Sys>::spawn(
                &THREAD_X,
                ThreadInfo {
                    entry: a_body,
                    param: 0,
                    priority: 0,
                    stack: None,
                },
            ),
            Err(SpawnError::BadContext),
        );
        // `a` outranks us and runs as soon as it is resumed
        System::<Sys>::resume(&THREAD_A);
        SEQ.expect_and_replace(3, 4);
        tern_port_std::shutdown::<Sys>();
        tern_port_std::halt();
    }

    #[test]
    fn suspend_resume() {
        tern_port_std::boot::<Sys>(|| {
            // Bad priority and double registration are refused
            assert_eq!(
                System::<Sys>::spawn(
                    &THREAD_A,
                    ThreadInfo {
                        entry: a_body,
                        param: 0,
                        priority: 9,
                        stack: None,
                    },
                ),
                Err(SpawnError::BadParam),
            );
            spawn!(Sys, &THREAD_A, a_body, 0);
            assert_eq!(
                System::<Sys>::spawn(
                    &THREAD_A,
                    ThreadInfo {
                        entry: a_body,
                        param: 0,
                        priority: 0,
                        stack: None,
                    },
                ),
                Err(SpawnError::BadObjectState),
            );
            spawn!(Sys, &THREAD_B, b_body, 1);
        });
        assert_eq!(SEQ.get(), 4);
    }
}

/// NUL-terminated transfers: the terminator travels through the queue and
/// ends the read.
mod queue_cstr {
    use core::ffi::CStr;

    use tern_kernel::{Event, Queue, Thread};

    tern_port_std::use_port!(unsafe struct Sys { priorities: 2 });

    static QUEUE: Queue<Sys, 4> = Queue::new();
    static PARK: Event<Sys> = Event::new();
    static PRODUCER: Thread<Sys> = Thread::new();
    static CONSUMER: Thread<Sys> = Thread::new();

    fn producer_body(_: usize) {
        let msg = CStr::from_bytes_with_nul(b"hello\0").unwrap();
        QUEUE.put_cstr(msg);
        loop {
            PARK.wait();
        }
    }

    fn consumer_body(_: usize) {
        let mut buf = [0xffu8; 16];
        let n = QUEUE.get_cstr(&mut buf);
        assert_eq!(n, 6);
        assert_eq!(&buf[..n], b"hello\0");
        assert!(QUEUE.is_empty());
        tern_port_std::shutdown::<Sys>();
        tern_port_std::halt();
    }

    #[test]
    fn queue_cstr() {
        tern_port_std::boot::<Sys>(|| {
            spawn!(Sys, &PRODUCER, producer_body, 0);
            spawn!(Sys, &CONSUMER, consumer_body, 1);
        });
    }
}

/// A queue get with a deadline: times out on an empty queue, and once the
/// first byte arrives in time the rest of the transfer no longer observes
/// the timer.
mod queue_get_timed {
    use super::utils::SeqTracker;
    use tern_kernel::{Queue, System, Thread, Timer};

    tern_port_std::use_port!(unsafe struct Sys { priorities: 2 });

    static SEQ: SeqTracker = SeqTracker::new();
    static TIMER: Timer<Sys> = Timer::new();
    static QUEUE: Queue<Sys, 4> = Queue::new();
    static CONSUMER: Thread<Sys> = Thread::new();
    static PRODUCER: Thread<Sys> = Thread::new();

    fn consumer_body(_: usize) {
        SEQ.expect_and_replace(0, 1);

        // Nothing arrives: the first byte times out and nothing is consumed
        System::<Sys>::set_deadline(&TIMER, 3);
        let mut buf = [0u8; 4];
        assert!(QUEUE.get_timed(&TIMER, &mut buf).is_err());
        assert_eq!(TIMER.now(), 3);

        // The producer delivers one byte before the deadline; the remaining
        // three arrive later, without any further deadline involved
        System::<Sys>::set_deadline(&TIMER, 100);
        assert!(QUEUE.get_timed(&TIMER, &mut buf).is_ok());
        assert_eq!(buf, [7, 8, 9, 10]);

        SEQ.expect_and_replace(2, 3);
        tern_port_std::shutdown::<Sys>();
        tern_port_std::halt();
    }

    fn producer_body(_: usize) {
        SEQ.expect_and_replace(1, 2);
        TIMER.delay(5);
        QUEUE.put_byte(7);
        TIMER.delay(5);
        QUEUE.put(&[8, 9, 10]);
        tern_port_std::halt();
    }

    #[test]
    fn queue_get_timed() {
        tern_port_std::boot::<Sys>(|| {
            spawn!(Sys, &CONSUMER, consumer_body, 0);
            spawn!(Sys, &PRODUCER, producer_body, 1);
        });
        assert_eq!(SEQ.get(), 3);
    }
}
