//! The tern kernel: a small priority-preemptive real-time kernel for
//! single-core microcontrollers.
//!
//! The kernel multiplexes one CPU across a fixed set of cooperating threads,
//! each with its own stack and priority, and provides the synchronization
//! primitives — [`Event`], [`Mutex`], [`Signal`], [`Timer`] with tick-based
//! waits, and the bounded byte [`Queue`] — that application code and interrupt
//! service routines use to coordinate.
//!
//! # Kernel trait type
//!
//! Like the port layer itself, the kernel is not tied to a particular target.
//! An application (usually through a port-provided `use_port!` macro) defines
//! a *kernel trait type* and implements [`PortThreading`], [`PortTimer`], and
//! [`KernelCfg`] on it. Everything else — thread records, primitives, the
//! kernel [`State`] — is generic over that type, so all cross-references
//! resolve statically and the whole kernel monomorphizes into the
//! application's image.
//!
//! # Contexts
//!
//! Kernel services are callable from two contexts:
//!
//!  - **A thread context.** The safe methods. They may suspend the caller.
//!  - **An interrupt context.** Only the `*_isr` entry points. They are
//!    `unsafe fn`s that assume interrupts are already masked, never block,
//!    and report a *yield suggested* flag that the ISR epilogue acts upon
//!    with [`System::yield_isr`].
//!
//! # Storage
//!
//! The kernel performs no heap allocation. Thread records and primitive
//! structures are supplied by the application, normally as `static` items,
//! and must outlive the scheduler.
#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

use core::marker::PhantomData;

pub mod error;
pub mod event;
#[doc(hidden)]
pub mod klock;
pub mod mutex;
#[cfg(feature = "queue")]
pub mod queue;
#[cfg(feature = "signal")]
pub mod signal;
pub mod thread;
pub mod timer;
pub mod utils;
pub(crate) mod wait;

pub use self::{
    error::{QueueEmptyError, QueueFullError, SpawnError, TimeoutError},
    event::Event,
    mutex::Mutex,
    thread::{readyqueue, ReadyQueue, Stack, Thread, ThreadInfo},
    timer::Timer,
};

#[cfg(feature = "queue")]
pub use self::queue::Queue;
#[cfg(feature = "signal")]
pub use self::signal::Signal;

use self::klock::CpuLockCell;

/// The tick counter type. Deadline comparisons wrap modulo `2³²`
/// ([`timer::tick_over`]), so deadlines may be set up to half the tick range
/// ahead of "now".
pub type UTick = u32;

/// Thread priority. `0` is the highest priority. Applications use the levels
/// `0..`[`KernelCfg::PRIORITIES`]; one more level is reserved for the
/// background (idle) thread.
pub type Priority = u8;

/// Implemented by a port on a kernel trait type to provide interrupt masking
/// and context switching.
///
/// # Safety
///
/// The implementation must uphold the documented contract of each method;
/// the kernel's memory safety depends on it. In particular, `enter_cpu_lock`
/// must establish mutual exclusion against every interrupt handler that calls
/// into the kernel.
pub unsafe trait PortThreading: Sized + 'static {
    /// The port-owned saved context of a thread: stack pointer and
    /// callee-saved registers, or whatever the port needs. Opaque to the
    /// kernel.
    type PortThreadState: Send + Sync + 'static;

    /// The initial value of [`Self::PortThreadState`], used when a
    /// [`Thread`] record is constructed.
    const PORT_THREAD_STATE_INIT: Self::PortThreadState;

    /// Mask interrupts globally. Unconditional; calls do not nest (nesting is
    /// tracked by the kernel on the running thread).
    ///
    /// # Safety
    ///
    /// Only meant to be called by the kernel.
    unsafe fn enter_cpu_lock();

    /// Unmask interrupts globally. Unconditional.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the kernel, at a point where servicing
    /// pending interrupts is permissible.
    unsafe fn leave_cpu_lock();

    /// Whether interrupts are currently masked.
    fn is_cpu_lock_active() -> bool;

    /// Whether the current context is an interrupt context.
    fn is_interrupt_context() -> bool;

    /// Prepare the thread's saved context so that the first context switch
    /// into it starts executing its entry function, with its parameter, on
    /// its stack, with interrupts unmasked. The entry function, parameter,
    /// and stack are available through [`Thread::info`].
    ///
    /// # Safety
    ///
    /// Called by the kernel with the CPU lock active, before the thread is
    /// made ready for the first time.
    unsafe fn initialize_thread_state(thread: &'static Thread<Self>);

    /// Save the running thread's context into `prev` and restore `next`'s.
    /// Returns (in `prev`'s context) when `prev` is next scheduled.
    ///
    /// # Safety
    ///
    /// Called by the kernel with the CPU lock active; the lock remains
    /// conceptually held across the switch and is owned by whichever thread
    /// is running. `prev` and `next` are distinct.
    unsafe fn switch_context(prev: &'static Thread<Self>, next: &'static Thread<Self>);
}

/// Hooks the kernel invokes when a [`Timer`]'s wait list goes from empty to
/// non-empty and back, so the driver can start and stop the hardware periodic
/// interrupt. The default implementations do nothing.
pub trait PortTimer: PortThreading {
    /// A thread started waiting on `timer` and its tick list was empty.
    fn timer_started(timer: &'static Timer<Self>) {
        let _ = timer;
    }

    /// `timer`'s tick list drained.
    fn timer_stopped(timer: &'static Timer<Self>) {
        let _ = timer;
    }
}

/// Static kernel configuration, normally filled in by a port's `use_port!`
/// macro.
///
/// # Safety
///
/// `state` must return the same, exclusive [`State`] instance on every call,
/// and `ReadyQueue` must provide `PRIORITIES + 1` levels.
pub unsafe trait KernelCfg: PortThreading {
    /// The count of application priority levels. Applications use priorities
    /// `0..PRIORITIES`; the kernel reserves the level `PRIORITIES` for the
    /// background thread.
    const PRIORITIES: usize;

    /// The ready queue type, sized by the port to `PRIORITIES + 1` levels.
    type ReadyQueue: readyqueue::ReadyQueueOps<Self> + utils::Init + Send + Sync + 'static;

    /// The kernel state singleton.
    fn state() -> &'static State<Self>;
}

/// The complete kernel trait type bound: every port trait at once.
pub trait KernelTraits: PortThreading + PortTimer + KernelCfg {}
impl<T: PortThreading + PortTimer + KernelCfg> KernelTraits for T {}

/// The kernel-global state: the running-thread pointer, the ready queue, and
/// the synthetic background thread record.
///
/// Alive from [`System::init`] to the end of the program. All access happens
/// with interrupts masked.
pub struct State<Traits: KernelCfg> {
    pub(crate) running: CpuLockCell<Traits, Option<&'static Thread<Traits>>>,
    pub(crate) ready: Traits::ReadyQueue,
    pub(crate) background: Thread<Traits>,
    pub(crate) started: CpuLockCell<Traits, bool>,
}

impl<Traits: KernelCfg> State<Traits> {
    pub const fn new() -> Self {
        Self {
            running: CpuLockCell::new(None),
            ready: <Traits::ReadyQueue as utils::Init>::INIT,
            background: Thread::new(),
            started: CpuLockCell::new(false),
        }
    }
}

impl<Traits: KernelCfg> Default for State<Traits> {
    fn default() -> Self {
        Self::new()
    }
}

/// The facade through which applications drive the scheduler: a type alias
/// of sorts for "the kernel instantiated with `Traits`". All methods are
/// associated functions; the type itself carries no data.
pub struct System<Traits>(PhantomData<Traits>);
