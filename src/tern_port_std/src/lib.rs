//! Simulation environment for running the tern kernel on a hosted target.
//!
//! Each kernel thread is backed by a parked host thread; exactly one of them
//! runs at a time, so the simulated machine is single-core. The interrupt
//! mask is a flag, and interrupts raised while it is set are pended and
//! delivered on the running thread at the points where the mask opens — the
//! same points a real CPU would take them. The delivered handler runs in the
//! interrupted thread's context, so an ISR epilogue yield context-switches
//! away mid-handler exactly like hardware does.
//!
//! Time is virtual: while at least one [`Timer`] is armed, the background
//! (idle) loop injects one tick interrupt per idle pass, so time advances
//! only when every application thread is blocked. Scenario tests become
//! fully deterministic: a thread sleeping for N ticks wakes after exactly N
//! injected ticks, regardless of host scheduling.
//!
//! A test drives the simulator like this:
//!
//! ```ignore
//! tern_port_std::use_port!(unsafe struct Sys { priorities: 4 });
//!
//! static THREAD_A: Thread<Sys> = Thread::new();
//!
//! fn a_body(_: usize) {
//!     /* ... */
//!     tern_port_std::shutdown::<Sys>();
//!     tern_port_std::halt();
//! }
//!
//! #[test]
//! fn scenario() {
//!     tern_port_std::boot::<Sys>(|| {
//!         System::<Sys>::spawn(
//!             &THREAD_A,
//!             ThreadInfo { entry: a_body, param: 0, priority: 0, stack: None },
//!         )
//!         .unwrap();
//!     });
//! }
//! ```
#![deny(unsafe_op_in_unsafe_fn)]

use std::cell::Cell;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::ptr;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use tern_kernel::{KernelTraits, PortThreading, System, Thread, Timer};

/// Used by `use_port!`
#[doc(hidden)]
pub extern crate tern_kernel as kernel;

type ThreadKey = usize;

/// Implemented on a kernel trait type by [`use_port!`].
///
/// # Safety
///
/// Only meant to be implemented by [`use_port!`].
pub unsafe trait PortInstance:
    KernelTraits + PortThreading<PortThreadState = ThreadState>
{
    fn port_state() -> &'static State<Self>;
}

/// The per-thread state the port keeps inside each [`Thread`] record.
pub struct ThreadState {
    /// Guarded by a spin mutex because it is only ever touched with the CPU
    /// lock held or before the thread first runs; there is no contention to
    /// speak of and no need to involve the host scheduler.
    tsm: spin::Mutex<Tsm>,
}

impl ThreadState {
    pub const fn new() -> Self {
        Self {
            tsm: spin::Mutex::new(Tsm::Uninit),
        }
    }
}

impl Default for ThreadState {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ThreadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ThreadState")
    }
}

/// Task state machine, from the port's point of view.
#[derive(Clone, Copy, Debug)]
enum Tsm {
    /// `initialize_thread_state` hasn't run.
    Uninit,
    /// Context prepared; no host thread exists yet.
    Dormant { entry: fn(usize), param: usize },
    /// Backed by the host thread identified by the key.
    Running(ThreadKey),
}

/// The role of a host thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ThreadRole {
    Unknown,
    /// The thread that called [`boot`]; doubles as the kernel's background
    /// thread.
    Boot,
    /// The backing thread of an application kernel thread.
    Task,
}

thread_local! {
    static THREAD_ROLE: Cell<ThreadRole> = Cell::new(ThreadRole::Unknown);
    /// The kernel-thread key this host thread backs.
    static CURRENT_KEY: Cell<Option<ThreadKey>> = Cell::new(None);
    /// Whether this host thread is inside a delivered interrupt handler.
    static IN_ISR: Cell<bool> = Cell::new(false);
}

enum PendingInterrupt {
    /// A tick of the virtual clock, delivered to every armed timer.
    Tick,
    /// A device interrupt injected by [`raise_interrupt`].
    Device(fn()),
}

/// The internal state of the port. One instance per kernel trait type,
/// created by [`use_port!`].
pub struct State<Traits: PortThreading> {
    core: Mutex<Core<Traits>>,
    cond: Condvar,
}

struct Core<Traits: PortThreading> {
    /// The emulated interrupt mask.
    cpu_lock: bool,
    /// The key of the kernel thread the simulated CPU is executing.
    current: Option<ThreadKey>,
    next_key: ThreadKey,
    pending: Vec<PendingInterrupt>,
    /// Timers whose tick lists are non-empty; the virtual clock ticks while
    /// this is non-empty.
    armed_timers: Vec<&'static Timer<Traits>>,
    shutdown: bool,
    /// The first panic (or misuse report) from a worker thread, rethrown on
    /// the boot thread.
    failure: Option<Box<dyn std::any::Any + Send>>,
}

#[allow(clippy::missing_safety_doc)]
impl<Traits: PortInstance> State<Traits> {
    pub const fn new() -> Self {
        Self {
            core: Mutex::new(Core {
                cpu_lock: false,
                current: None,
                next_key: 0,
                pending: Vec::new(),
                armed_timers: Vec::new(),
                shutdown: false,
                failure: None,
            }),
            cond: Condvar::new(),
        }
    }

    fn lock_core(&self) -> MutexGuard<'_, Core<Traits>> {
        // A worker panic may poison the lock; the failure is propagated
        // through `Core::failure`, so keep the machinery running.
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait_core<'a>(&self, guard: MutexGuard<'a, Core<Traits>>) -> MutexGuard<'a, Core<Traits>> {
        self.cond.wait(guard).unwrap_or_else(PoisonError::into_inner)
    }

    pub fn enter_cpu_lock(&self) {
        self.lock_core().cpu_lock = true;
    }

    pub fn leave_cpu_lock(&'static self) {
        let mut core = self.lock_core();
        debug_assert!(core.cpu_lock);
        core.cpu_lock = false;
        let in_isr = IN_ISR.with(|c| c.get());
        let on_worker = CURRENT_KEY.with(|c| c.get()).is_some();
        if !in_isr && on_worker {
            // The mask just opened: take pending interrupts now, like
            // hardware would
            self.service_pending(core);
        }
    }

    pub fn is_cpu_lock_active(&self) -> bool {
        self.lock_core().cpu_lock
    }

    pub fn is_interrupt_context(&self) -> bool {
        IN_ISR.with(|c| c.get())
    }

    pub fn initialize_thread_state(&self, thread: &'static Thread<Traits>) {
        let info = thread.info().expect("thread registered without info");
        let mut tsm = thread.port_state.tsm.lock();
        match *tsm {
            Tsm::Uninit | Tsm::Dormant { .. } => {
                *tsm = Tsm::Dormant {
                    entry: info.entry,
                    param: info.param,
                };
            }
            Tsm::Running(_) => panic!("reinitializing a live thread"),
        }
        log::trace!("initialized state for thread {:p}", thread);
    }

    pub fn switch_context(
        &'static self,
        _prev: &'static Thread<Traits>,
        next: &'static Thread<Traits>,
    ) {
        let next_key = {
            let mut tsm = next.port_state.tsm.lock();
            match *tsm {
                Tsm::Running(key) => key,
                Tsm::Dormant { entry, param } => {
                    let key = {
                        let mut core = self.lock_core();
                        let key = core.next_key;
                        core.next_key += 1;
                        key
                    };
                    *tsm = Tsm::Running(key);
                    self.spawn_host_thread(key, entry, param);
                    key
                }
                Tsm::Uninit => panic!("dispatching a thread that was never initialized"),
            }
        };
        let my_key = CURRENT_KEY
            .with(|c| c.get())
            .expect("context switch outside a worker thread");
        log::trace!("switch_context {my_key:?} -> {next_key:?}");

        let mut core = self.lock_core();
        debug_assert!(core.cpu_lock);
        core.current = Some(next_key);
        self.cond.notify_all();
        while core.current != Some(my_key) {
            if core.shutdown {
                if THREAD_ROLE.with(|r| r.get()) == ThreadRole::Boot {
                    // Unwind to the service loop in `boot`, which will
                    // return to the caller. Leave the CPU lock "held" so the
                    // kernel code we unwind through sees the state it
                    // expects.
                    core.cpu_lock = true;
                    drop(core);
                    return;
                }
                drop(core);
                halt();
            }
            core = self.wait_core(core);
        }
        // Scheduled again; the CPU lock is held on our behalf
    }

    fn spawn_host_thread(&'static self, key: ThreadKey, entry: fn(usize), param: usize) {
        std::thread::Builder::new()
            .name(format!("tern-thread-{key}"))
            .spawn(move || {
                CURRENT_KEY.with(|c| c.set(Some(key)));
                THREAD_ROLE.with(|r| r.set(ThreadRole::Task));

                // Block until scheduled for the first time
                {
                    let mut core = self.lock_core();
                    while core.current != Some(key) {
                        if core.shutdown {
                            return;
                        }
                        core = self.wait_core(core);
                    }
                    // The initial context has interrupts enabled: the switch
                    // into a fresh thread opens the mask, as if a saved
                    // status register were restored
                    debug_assert!(core.cpu_lock);
                    core.cpu_lock = false;
                    self.service_pending(core);
                }

                log::trace!("thread {key:?} starts");
                match catch_unwind(AssertUnwindSafe(|| entry(param))) {
                    // Threads have no termination primitive; an entry
                    // function that returns is a scenario bug
                    Ok(()) => self.report_failure(Box::new(format!(
                        "thread {key:?}'s entry function returned"
                    ))),
                    Err(payload) => self.report_failure(payload),
                }
            })
            .unwrap();
    }

    /// Record a worker thread's failure and stop the world; the boot thread
    /// rethrows it.
    fn report_failure(&self, payload: Box<dyn std::any::Any + Send>) {
        let mut core = self.lock_core();
        if core.failure.is_none() {
            core.failure = Some(payload);
        }
        core.shutdown = true;
        self.cond.notify_all();
    }

    /// Deliver pended interrupts on the calling host thread until none are
    /// left, the mask closes, or the world stops. Call with the mask open.
    fn service_pending(&'static self, mut core: MutexGuard<'_, Core<Traits>>) {
        loop {
            if core.shutdown || core.cpu_lock || core.pending.is_empty() {
                return;
            }
            let pending = core.pending.remove(0);
            // Interrupt entry: the hardware masks further interrupts
            core.cpu_lock = true;
            IN_ISR.with(|c| c.set(true));
            let armed = core.armed_timers.clone();
            drop(core);

            match pending {
                PendingInterrupt::Tick => {
                    for timer in armed {
                        // Safety: interrupt context, interrupts masked
                        unsafe {
                            if timer.tick_isr() {
                                System::<Traits>::yield_isr();
                            }
                        }
                    }
                }
                PendingInterrupt::Device(isr) => isr(),
            }

            // Interrupt return (possibly long after an epilogue yield
            // switched us away and back)
            core = self.lock_core();
            IN_ISR.with(|c| c.set(false));
            core.cpu_lock = false;
        }
    }

    pub fn timer_started(&self, timer: &'static Timer<Traits>) {
        let mut core = self.lock_core();
        if !core.armed_timers.iter().any(|t| ptr::eq(*t, timer)) {
            log::trace!("timer {timer:p} armed");
            core.armed_timers.push(timer);
        }
        self.cond.notify_all();
    }

    pub fn timer_stopped(&self, timer: &'static Timer<Traits>) {
        let mut core = self.lock_core();
        core.armed_timers.retain(|t| !ptr::eq(*t, timer));
        log::trace!("timer {timer:p} disarmed");
    }
}

/// Boot the kernel on the calling thread: initialize the scheduler, run
/// `setup` (which registers the application's threads), start scheduling,
/// and then serve as the background thread — the idle loop that advances the
/// virtual clock and delivers interrupts raised from outside.
///
/// Returns when [`shutdown`] is called; panics raised in any kernel thread
/// are rethrown here.
pub fn boot<Traits: PortInstance>(setup: impl FnOnce()) {
    let _ = env_logger::builder().is_test(true).try_init();
    let state = Traits::port_state();

    THREAD_ROLE.with(|r| r.set(ThreadRole::Boot));
    let boot_key = {
        let mut core = state.lock_core();
        assert!(core.current.is_none(), "booted twice");
        let key = core.next_key;
        core.next_key += 1;
        core.current = Some(key);
        key
    };
    CURRENT_KEY.with(|c| c.set(Some(boot_key)));

    System::<Traits>::init();
    // Adopt the boot thread as the backing thread of the kernel's background
    // thread record
    *System::<Traits>::background_thread().port_state.tsm.lock() = Tsm::Running(boot_key);

    setup();
    System::<Traits>::start();
    log::trace!("scheduler started; boot thread is now the idle loop");

    loop {
        let mut core = state.lock_core();
        if let Some(payload) = core.failure.take() {
            drop(core);
            resume_unwind(payload);
        }
        if core.shutdown {
            return;
        }
        // The mask is always open when the idle loop has control
        debug_assert!(!core.cpu_lock);
        if !core.cpu_lock && !core.pending.is_empty() {
            state.service_pending(core);
            continue;
        }
        if !core.cpu_lock && !core.armed_timers.is_empty() {
            // The system is otherwise idle: advance the virtual clock
            core.pending.push(PendingInterrupt::Tick);
            continue;
        }
        // Nothing to do until someone raises an interrupt or shuts down
        let core = state.wait_core(core);
        drop(core);
    }
}

/// Inject a device interrupt. The handler runs in an interrupt context with
/// interrupts masked; it may use the kernel's `*_isr` entry points and
/// should finish with [`System::yield_isr`] when one of them suggested a
/// yield.
///
/// When called from a kernel thread with interrupts unmasked, the handler
/// runs before this function returns, like a real interrupt would.
pub fn raise_interrupt<Traits: PortInstance>(isr: fn()) {
    let state = Traits::port_state();
    let mut core = state.lock_core();
    core.pending.push(PendingInterrupt::Device(isr));
    state.cond.notify_all();

    let on_worker = CURRENT_KEY.with(|c| c.get()).is_some();
    let in_isr = IN_ISR.with(|c| c.get());
    if on_worker && !in_isr && !core.cpu_lock {
        state.service_pending(core);
    }
}

/// Stop the simulated world. [`boot`] returns on its caller; every other
/// backing thread parks.
pub fn shutdown<Traits: PortInstance>() {
    let state = Traits::port_state();
    let mut core = state.lock_core();
    log::trace!("shutdown requested");
    core.shutdown = true;
    state.cond.notify_all();
}

/// Park the calling thread forever. Kernel threads that have finished their
/// part in a scenario end with [`shutdown`] followed by this.
pub fn halt() -> ! {
    loop {
        std::thread::park();
    }
}

/// Implement the port traits on a kernel trait type and instantiate the
/// kernel for it.
#[macro_export]
macro_rules! use_port {
    (unsafe $vis:vis struct $Sys:ident { priorities: $n:literal }) => {
        $vis struct $Sys;

        mod port_std_impl {
            use super::$Sys;
            use $crate::kernel::{
                KernelCfg, PortThreading, PortTimer, ReadyQueue, State as KernelState, Thread,
                Timer,
            };
            use $crate::{PortInstance, State, ThreadState};

            static PORT_STATE: State<$Sys> = State::new();
            static KERNEL_STATE: KernelState<$Sys> = KernelState::new();

            // Safety: the port upholds the threading contract; see the
            // `tern_port_std` crate documentation
            unsafe impl PortThreading for $Sys {
                type PortThreadState = ThreadState;
                #[allow(clippy::declare_interior_mutable_const)]
                const PORT_THREAD_STATE_INIT: Self::PortThreadState = ThreadState::new();

                unsafe fn enter_cpu_lock() {
                    PORT_STATE.enter_cpu_lock()
                }

                unsafe fn leave_cpu_lock() {
                    PORT_STATE.leave_cpu_lock()
                }

                fn is_cpu_lock_active() -> bool {
                    PORT_STATE.is_cpu_lock_active()
                }

                fn is_interrupt_context() -> bool {
                    PORT_STATE.is_interrupt_context()
                }

                unsafe fn initialize_thread_state(thread: &'static Thread<Self>) {
                    PORT_STATE.initialize_thread_state(thread)
                }

                unsafe fn switch_context(
                    prev: &'static Thread<Self>,
                    next: &'static Thread<Self>,
                ) {
                    PORT_STATE.switch_context(prev, next)
                }
            }

            impl PortTimer for $Sys {
                fn timer_started(timer: &'static Timer<Self>) {
                    PORT_STATE.timer_started(timer)
                }

                fn timer_stopped(timer: &'static Timer<Self>) {
                    PORT_STATE.timer_stopped(timer)
                }
            }

            // Safety: `state` returns a single static instance, and the
            // ready queue covers the application levels plus the background
            // level
            unsafe impl KernelCfg for $Sys {
                const PRIORITIES: usize = $n;
                type ReadyQueue = ReadyQueue<$Sys, { $n + 1 }>;
                fn state() -> &'static KernelState<$Sys> {
                    &KERNEL_STATE
                }
            }

            // Safety: implemented by `use_port!`, as required
            unsafe impl PortInstance for $Sys {
                fn port_state() -> &'static State<$Sys> {
                    &PORT_STATE
                }
            }
        }
    };
}
