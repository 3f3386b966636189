//! Shared scaffolding for the in-crate unit tests: a kernel trait type whose
//! port side is inert, so list and bitmap manipulation can be exercised
//! without a scheduler.

macro_rules! define_test_traits {
    ($name:ident, $prios:literal) => {
        struct $name;

        // Safety: the unit tests are single-threaded and never context-switch,
        // so a no-op "CPU lock" that reports itself as always held is a valid
        // implementation of the contract.
        unsafe impl crate::PortThreading for $name {
            type PortThreadState = ();
            const PORT_THREAD_STATE_INIT: Self::PortThreadState = ();

            unsafe fn enter_cpu_lock() {}
            unsafe fn leave_cpu_lock() {}

            fn is_cpu_lock_active() -> bool {
                true
            }

            fn is_interrupt_context() -> bool {
                false
            }

            unsafe fn initialize_thread_state(_thread: &'static crate::Thread<Self>) {}

            unsafe fn switch_context(
                _prev: &'static crate::Thread<Self>,
                _next: &'static crate::Thread<Self>,
            ) {
                unreachable!("no context switching in unit tests");
            }
        }

        impl crate::PortTimer for $name {}

        // Safety: `state` returns a single static instance.
        unsafe impl crate::KernelCfg for $name {
            const PRIORITIES: usize = $prios;
            type ReadyQueue = crate::thread::readyqueue::ReadyQueue<Self, { $prios + 1 }>;

            fn state() -> &'static crate::State<Self> {
                static STATE: crate::State<$name> = crate::State::new();
                &STATE
            }
        }
    };
}

pub(crate) use define_test_traits;
