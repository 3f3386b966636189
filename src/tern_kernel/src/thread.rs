//! Thread records and the scheduler core.
//!
//! The scheduler keeps one FIFO of Ready threads per priority level
//! ([`readyqueue`]) and a pointer to the running thread. Context switches are
//! synchronous: the highest-priority ready thread is popped and the port
//! swaps contexts, with the CPU lock conceptually handed over to the incoming
//! thread. Interrupt delivery while a thread is parked inside the scheduler
//! happens through the brief unmask window in [`check_irq`].
use core::fmt;
use core::ptr;

use crate::{
    error::SpawnError,
    klock::{self, CpuLockCell, CpuLockToken},
    timer::Timer,
    utils::intrusive_list::Link,
    wait::WaitList,
    KernelTraits, PortThreading, Priority, System, UTick,
};

#[cfg(feature = "timed")]
use crate::wait::WakeSource;

pub mod readyqueue;
pub use self::readyqueue::{ReadyQueue, ReadyQueueOps};

/// A thread record: everything the scheduler needs to know about one
/// cooperating execution context. Allocated by the application, normally as a
/// `static`, and registered with [`System::spawn`].
pub struct Thread<Traits: PortThreading> {
    /// The port-owned saved context. Kept as the first field so that
    /// assembler port code can locate it without offset arithmetic.
    pub port_state: Traits::PortThreadState,

    pub(crate) priority: CpuLockCell<Traits, Priority>,

    /// Nested critical-section depth. Interrupts are unmasked on behalf of
    /// this thread only when the depth is zero and the thread is running.
    pub(crate) critical_depth: CpuLockCell<Traits, u32>,

    pub(crate) st: CpuLockCell<Traits, ThreadSt>,

    /// Entry point, parameter, priority, and stack; written once by
    /// [`System::spawn`].
    pub(crate) info: CpuLockCell<Traits, Option<ThreadInfo>>,

    /// Tick deadline for timed waits, compared with wrap-safe arithmetic.
    pub(crate) deadline: CpuLockCell<Traits, UTick>,

    /// Link for priority-sorted wait lists and the ready FIFO (never both at
    /// once).
    pub(crate) link_prio: CpuLockCell<Traits, Option<Link<Traits>>>,

    /// Link for deadline-sorted tick lists.
    pub(crate) link_tick: CpuLockCell<Traits, Option<Link<Traits>>>,

    /// The wait list this thread is blocked on, if any. Lets the timer
    /// expiry path unlink the loser side of a dual-list wait in O(1).
    pub(crate) wait_list: CpuLockCell<Traits, Option<&'static WaitList<Traits>>>,

    /// The timer whose tick list this thread occupies for a timed wait.
    #[cfg(feature = "timed")]
    pub(crate) wait_timer: CpuLockCell<Traits, Option<&'static Timer<Traits>>>,

    /// Which wake path won the race of a timed wait.
    #[cfg(feature = "timed")]
    pub(crate) wake: CpuLockCell<Traits, Option<WakeSource>>,
}

impl<Traits: PortThreading> Thread<Traits> {
    pub const fn new() -> Self {
        Self {
            port_state: Traits::PORT_THREAD_STATE_INIT,
            priority: CpuLockCell::new(0),
            critical_depth: CpuLockCell::new(0),
            st: CpuLockCell::new(ThreadSt::Dormant),
            info: CpuLockCell::new(None),
            deadline: CpuLockCell::new(0),
            link_prio: CpuLockCell::new(None),
            link_tick: CpuLockCell::new(None),
            wait_list: CpuLockCell::new(None),
            #[cfg(feature = "timed")]
            wait_timer: CpuLockCell::new(None),
            #[cfg(feature = "timed")]
            wake: CpuLockCell::new(None),
        }
    }

    /// The properties this record was registered with, or `None` before
    /// [`System::spawn`].
    ///
    /// Intended for port code preparing or dispatching the thread. The value
    /// is written once, under the CPU lock, and is stable from then on.
    pub fn info(&self) -> Option<ThreadInfo> {
        // Safety: see above; after `spawn` this is a read of an unchanging
        // value, and during `spawn` the CPU lock serializes the access
        unsafe { *self.info.as_ptr() }
    }
}

impl<Traits: PortThreading> Default for Thread<Traits> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Traits: PortThreading> fmt::Debug for Thread<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread").field("self", &(self as *const _)).finish()
    }
}

/// Thread state machine. No terminal state: threads are assumed to loop
/// forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ThreadSt {
    /// Not yet registered with the scheduler.
    Dormant,
    /// In a ready FIFO.
    Ready,
    Running,
    /// Blocked in up to one priority wait list and up to one tick list, or
    /// suspended bare ([`System::suspend`]).
    Waiting,
}

/// The registration parameters of a thread: what [`System::spawn`] needs to
/// make a [`Thread`] record runnable.
#[derive(Clone, Copy)]
pub struct ThreadInfo {
    /// The entry function. It must never return.
    pub entry: fn(usize),
    /// The value passed to `entry`.
    pub param: usize,
    /// The initial priority, `0..`[`PRIORITIES`].
    ///
    /// [`PRIORITIES`]: crate::KernelCfg::PRIORITIES
    pub priority: Priority,
    /// The stack region for the thread, for ports that need one supplied.
    /// Hosted ports ignore it.
    pub stack: Option<Stack>,
}

/// A caller-supplied stack region.
#[derive(Clone, Copy, Debug)]
pub struct Stack {
    base: *mut u8,
    size: usize,
}

// Safety: the kernel never dereferences the pointer; it is handed to exactly
// one port-side context initialization.
unsafe impl Send for Stack {}
unsafe impl Sync for Stack {}

impl Stack {
    /// Describe a stack region by its raw parts.
    ///
    /// # Safety
    ///
    /// The region must be valid, writable, suitably aligned for the target,
    /// and used by at most one thread for the lifetime of the scheduler.
    pub const unsafe fn from_raw_parts(base: *mut u8, size: usize) -> Self {
        Self { base, size }
    }

    pub const fn base(&self) -> *mut u8 {
        self.base
    }

    pub const fn size(&self) -> usize {
        self.size
    }
}

// ---------------------------------------------------------------------------
// Scheduler control

impl<Traits: KernelTraits> System<Traits> {
    /// Initialize the scheduler: mask interrupts, install the background
    /// thread as running with critical depth 1 at the reserved lowest
    /// priority, and leave interrupts masked until [`Self::start`].
    pub fn init() {
        // Safety: we are the kernel, bringing the system up
        unsafe { Traits::enter_cpu_lock() };
        // Safety: just masked
        let mut token = unsafe { klock::assume_cpu_lock::<Traits>() };

        let state = Traits::state();
        debug_assert!(
            state.running.get(&token).is_none(),
            "scheduler initialized twice"
        );
        debug_assert_eq!(
            Traits::PRIORITIES + 1,
            <Traits::ReadyQueue as ReadyQueueOps<Traits>>::LEVELS,
            "ready queue must provide one level per application priority plus idle",
        );
        debug_assert!(Traits::PRIORITIES < Priority::MAX as usize);

        let background = &state.background;
        background.priority.set(&mut token, Traits::PRIORITIES as Priority);
        background.critical_depth.set(&mut token, 1);
        background.st.set(&mut token, ThreadSt::Running);
        state.running.set(&mut token, Some(background));
    }

    /// Register a thread. Threads are registered between [`Self::init`] and
    /// [`Self::start`]; they become runnable when the scheduler starts.
    pub fn spawn(thread: &'static Thread<Traits>, info: ThreadInfo) -> Result<(), SpawnError> {
        let mut guard = klock::lock_cpu::<Traits>();
        let token = &mut *guard;
        let state = Traits::state();

        if state.started.get(token) {
            return Err(SpawnError::BadContext);
        }
        if info.priority as usize >= Traits::PRIORITIES {
            return Err(SpawnError::BadParam);
        }
        if thread.st.get(token) != ThreadSt::Dormant {
            return Err(SpawnError::BadObjectState);
        }

        thread.info.set(token, Some(info));
        thread.priority.set(token, info.priority);
        thread.critical_depth.set(token, 0);
        thread.deadline.set(token, 0);

        // Safety: CPU lock active, the thread is Dormant
        unsafe { Traits::initialize_thread_state(thread) };

        log::debug!("spawned thread {:p} at priority {}", thread, info.priority);
        make_ready(token, thread);
        Ok(())
    }

    /// Start the scheduler: yield to the highest-priority ready thread. The
    /// call returns when nothing of higher priority is runnable — the caller
    /// has become the background thread and owns the idle loop from here on.
    pub fn start() {
        // Interrupts have been masked since `init`
        debug_assert!(Traits::is_cpu_lock_active());
        // Safety: see above
        let mut token = unsafe { klock::assume_cpu_lock::<Traits>() };

        let state = Traits::state();
        debug_assert!(!state.started.get(&token), "scheduler started twice");
        state.started.set(&mut token, true);
        log::debug!("starting the scheduler");

        yield_to_ready(&mut token);

        // The background thread was scheduled again; open the door.
        let background = running(&token);
        background.critical_depth.set(&mut token, 0);
        drop(token);
        // Safety: depth is zero, the scheduler is live
        unsafe { Traits::leave_cpu_lock() };
    }

    /// Disable interrupts and open a critical section in the context of the
    /// running thread. Nestable.
    pub fn enter_critical() {
        // Safety: masking is always permissible from a thread context
        unsafe { Traits::enter_cpu_lock() };
        // Safety: just masked
        let mut token = unsafe { klock::assume_cpu_lock::<Traits>() };
        let th = running(&token);
        let depth = th.critical_depth.get(&token);
        th.critical_depth.set(&mut token, depth + 1);
    }

    /// Close one critical-section level; unmask interrupts when the depth
    /// reaches zero.
    pub fn exit_critical() {
        debug_assert!(Traits::is_cpu_lock_active());
        // Safety: the matching `enter_critical` masked interrupts
        let mut token = unsafe { klock::assume_cpu_lock::<Traits>() };
        let th = running(&token);
        let depth = th.critical_depth.get(&token);
        debug_assert!(depth > 0, "unbalanced exit_critical");
        th.critical_depth.set(&mut token, depth - 1);
        drop(token);
        if depth == 1 {
            // Safety: back to depth zero
            unsafe { Traits::leave_cpu_lock() };
        }
    }

    /// Yield the processor to ready threads of greater or equal priority.
    pub fn yield_now() {
        let mut guard = klock::lock_cpu::<Traits>();
        yield_to_ready(&mut guard);
        check_irq::<Traits>(&mut guard);
    }

    /// Yield from an interrupt service routine, when an ISR-safe wake
    /// operation suggested it.
    ///
    /// # Safety
    ///
    /// Must be called from an interrupt context with interrupts masked, as
    /// the last scheduler-relevant action of the ISR.
    pub unsafe fn yield_isr() {
        // Safety: forwarded to the caller
        let mut token = unsafe { klock::assume_cpu_lock::<Traits>() };
        yield_to_ready(&mut token);
    }

    /// Block the running thread until [`Self::resume`] is called on it. The
    /// thread is left on no list.
    pub fn suspend() {
        let mut guard = klock::lock_cpu::<Traits>();
        let token = &mut *guard;
        let th = running(token);
        th.st.set(token, ThreadSt::Waiting);
        switch_to_next(token);
    }

    /// Make a suspended thread ready; yield to it if it has higher priority
    /// than the caller.
    pub fn resume(thread: &'static Thread<Traits>) {
        let mut guard = klock::lock_cpu::<Traits>();
        resume_inner(&mut guard, thread);
    }

    /// The priority of the running thread.
    pub fn current_priority() -> Priority {
        let guard = klock::lock_cpu::<Traits>();
        running(&guard).priority.get(&guard)
    }

    /// Change the running thread's priority, returning the previous value.
    /// Takes effect the next time the thread is enqueued.
    pub fn set_priority(priority: Priority) -> Priority {
        debug_assert!((priority as usize) < Traits::PRIORITIES);
        let mut guard = klock::lock_cpu::<Traits>();
        let token = &mut *guard;
        let th = running(token);
        th.priority.replace(token, priority)
    }

    /// Set the running thread's deadline to `timer`'s current tick
    /// (a "now" timestamp for subsequent [`Timer::shift`]/[`Timer::period`]
    /// waits).
    pub fn update_deadline(timer: &Timer<Traits>) {
        let mut guard = klock::lock_cpu::<Traits>();
        let token = &mut *guard;
        let now = timer.tick.get(token);
        running(token).deadline.set(token, now);
    }

    /// Push the running thread's deadline forward by `ticks`.
    pub fn advance_deadline(ticks: UTick) {
        let mut guard = klock::lock_cpu::<Traits>();
        let token = &mut *guard;
        let th = running(token);
        let deadline = th.deadline.get(token);
        th.deadline.set(token, deadline.wrapping_add(ticks));
    }

    /// Set the running thread's deadline to `timer.now() + ticks`.
    pub fn set_deadline(timer: &Timer<Traits>, ticks: UTick) {
        let mut guard = klock::lock_cpu::<Traits>();
        let token = &mut *guard;
        let deadline = timer.tick.get(token).wrapping_add(ticks);
        running(token).deadline.set(token, deadline);
    }

    /// Whether `timer`'s tick counter has reached the running thread's
    /// deadline.
    pub fn deadline_elapsed(timer: &Timer<Traits>) -> bool {
        let guard = klock::lock_cpu::<Traits>();
        let th = running(&guard);
        crate::timer::tick_over(timer.tick.get(&guard), th.deadline.get(&guard))
    }

    /// The synthetic background thread record. Intended for port code that
    /// needs to adopt the boot context.
    pub fn background_thread() -> &'static Thread<Traits> {
        &Traits::state().background
    }
}

// ---------------------------------------------------------------------------
// Scheduler core (private but contractual)

/// The running thread. Panics before [`System::init`].
pub(crate) fn running<Traits: KernelTraits>(
    token: &CpuLockToken<Traits>,
) -> &'static Thread<Traits> {
    Traits::state()
        .running
        .get(token)
        .expect("scheduler not initialized")
}

/// Pop the highest-priority ready thread and context-switch to it.
pub(crate) fn switch_to_next<Traits: KernelTraits>(token: &mut CpuLockToken<Traits>) {
    let state = Traits::state();
    let next = state
        .ready
        .pop_front(token)
        .expect("no runnable thread");
    next.st.set(token, ThreadSt::Running);
    let prev = state.running.replace(token, Some(next)).unwrap();
    if ptr::eq(prev, next) {
        return;
    }
    // Safety: CPU lock active; `prev` and `next` are distinct
    unsafe { Traits::switch_context(prev, next) };
    // `prev` is running again
}

/// Put the running thread at the tail of its priority's FIFO, then switch.
pub(crate) fn yield_to_ready<Traits: KernelTraits>(token: &mut CpuLockToken<Traits>) {
    let th = running(token);
    make_ready(token, th);
    switch_to_next(token);
}

/// Make `thread` Ready by appending it to the FIFO matching its priority.
pub(crate) fn make_ready<Traits: KernelTraits>(
    token: &mut CpuLockToken<Traits>,
    thread: &'static Thread<Traits>,
) {
    thread.st.set(token, ThreadSt::Ready);
    Traits::state().ready.push_back(token, thread);
}

/// Make `thread` Ready and, if it outranks the running thread, yield to it.
pub(crate) fn resume_inner<Traits: KernelTraits>(
    token: &mut CpuLockToken<Traits>,
    thread: &'static Thread<Traits>,
) {
    make_ready(token, thread);
    if thread.priority.get(token) < running(token).priority.get(token) {
        yield_to_ready(token);
        check_irq::<Traits>(token);
    }
}

/// Briefly unmask and re-mask interrupts so that interrupts pended while the
/// caller was parked inside the scheduler get serviced.
///
/// The caller's token stays alive across the window but is not used; any
/// interrupt handler delivered here operates through its own token.
pub(crate) fn check_irq<Traits: KernelTraits>(_token: &mut CpuLockToken<Traits>) {
    // Safety: this is one of the well-defined points where servicing
    // interrupts inside a critical section is part of the design
    unsafe {
        Traits::leave_cpu_lock();
        Traits::enter_cpu_lock();
    }
}
