//! Signals: a binary turnstile with auto-reset.
//!
//! Despite the family resemblance this is not a counting semaphore — any
//! number of notifications delivered while nobody waits coalesce into one.
//! A wait passes through an open signal, closing it behind itself.
use crate::{
    klock::{self},
    wait::{self, WaitList},
    KernelTraits, PortThreading,
};

#[cfg(feature = "timed")]
use crate::{error::TimeoutError, timer::Timer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Gate {
    Open,
    Closed,
}

/// A one-slot rendezvous: `{open, closed}` state plus a priority-ordered
/// wait list.
pub struct Signal<Traits: PortThreading> {
    state: klock::CpuLockCell<Traits, Gate>,
    list: WaitList<Traits>,
}

impl<Traits: PortThreading> Signal<Traits> {
    /// A new signal starts open: the first wait passes immediately.
    pub const fn new() -> Self {
        Self {
            state: klock::CpuLockCell::new(Gate::Open),
            list: WaitList::new(),
        }
    }
}

impl<Traits: PortThreading> Default for Signal<Traits> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Traits: KernelTraits> Signal<Traits> {
    /// Pass through the turnstile: block while it is closed, and close it
    /// behind us.
    pub fn wait(&'static self) {
        let mut guard = klock::lock_cpu::<Traits>();
        let token = &mut *guard;
        if self.state.get(token) == Gate::Closed {
            wait::wait_in_prior_list(token, &self.list);
        }
        self.state.set(token, Gate::Closed);
    }

    /// Timed [`Self::wait`]: gives up when `timer` reaches the running
    /// thread's deadline first.
    #[cfg(feature = "timed")]
    pub fn wait_timed(&'static self, timer: &'static Timer<Traits>) -> Result<(), TimeoutError> {
        let mut guard = klock::lock_cpu::<Traits>();
        let token = &mut *guard;
        if self.state.get(token) == Gate::Open
            || wait::wait_in_prior_and_tick_list(token, &self.list, timer)
        {
            self.state.set(token, Gate::Closed);
            Ok(())
        } else {
            Err(TimeoutError)
        }
    }

    /// Open the turnstile and wake the highest-priority waiter, if any.
    /// Notifications coalesce: repeated calls with no waiter are one.
    pub fn notify(&self) {
        let mut guard = klock::lock_cpu::<Traits>();
        let token = &mut *guard;
        self.state.set(token, Gate::Open);
        wait::resume_first(token, &self.list);
    }

    /// ISR-safe [`Self::notify`]; returns the yield-suggested flag.
    ///
    /// # Safety
    ///
    /// Must be called from an interrupt context with interrupts masked.
    pub unsafe fn notify_isr(&self) -> bool {
        // Safety: forwarded to the caller
        let mut token = unsafe { klock::assume_cpu_lock::<Traits>() };
        self.state.set(&mut token, Gate::Open);
        wait::resume_first_isr(&mut token, &self.list)
    }

    /// Whether a wait would block right now.
    pub fn is_closed(&self) -> bool {
        let guard = klock::lock_cpu::<Traits>();
        self.state.get(&guard) == Gate::Closed
    }
}
