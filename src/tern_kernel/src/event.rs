//! Events: a priority-ordered wait list with no state of its own. Waiters
//! block until someone notifies; a notification with no waiter is lost.
use crate::{
    klock::{self},
    wait::{self, WaitList},
    KernelTraits, PortThreading,
};

#[cfg(feature = "timed")]
use crate::{error::TimeoutError, timer::Timer};

/// A stateless signaling primitive. Allocated by the application, normally
/// as a `static`.
pub struct Event<Traits: PortThreading> {
    pub(crate) list: WaitList<Traits>,
}

impl<Traits: PortThreading> Event<Traits> {
    pub const fn new() -> Self {
        Self {
            list: WaitList::new(),
        }
    }
}

impl<Traits: PortThreading> Default for Event<Traits> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Traits: KernelTraits> Event<Traits> {
    /// Block until the event is notified.
    pub fn wait(&'static self) {
        let mut guard = klock::lock_cpu::<Traits>();
        wait::wait_in_prior_list(&mut guard, &self.list);
    }

    /// Block until the event is notified or `timer` reaches the running
    /// thread's deadline, whichever happens first.
    #[cfg(feature = "timed")]
    pub fn wait_timed(&'static self, timer: &'static Timer<Traits>) -> Result<(), TimeoutError> {
        let mut guard = klock::lock_cpu::<Traits>();
        if wait::wait_in_prior_and_tick_list(&mut guard, &self.list, timer) {
            Ok(())
        } else {
            Err(TimeoutError)
        }
    }

    /// Wake the highest-priority waiter, if any, yielding to it if it
    /// outranks the caller.
    pub fn notify(&self) {
        let mut guard = klock::lock_cpu::<Traits>();
        wait::resume_first(&mut guard, &self.list);
    }

    /// Wake every waiter, yielding once if the best of them outranks the
    /// caller.
    pub fn notify_all(&self) {
        let mut guard = klock::lock_cpu::<Traits>();
        wait::resume_all(&mut guard, &self.list);
    }

    /// ISR-safe [`Self::notify`]: never yields; returns whether the ISR
    /// epilogue should ([`System::yield_isr`]).
    ///
    /// [`System::yield_isr`]: crate::System::yield_isr
    ///
    /// # Safety
    ///
    /// Must be called from an interrupt context with interrupts masked.
    pub unsafe fn notify_isr(&self) -> bool {
        // Safety: forwarded to the caller
        let mut token = unsafe { klock::assume_cpu_lock::<Traits>() };
        wait::resume_first_isr(&mut token, &self.list)
    }

    /// ISR-safe [`Self::notify_all`].
    ///
    /// # Safety
    ///
    /// Must be called from an interrupt context with interrupts masked.
    pub unsafe fn notify_all_isr(&self) -> bool {
        // Safety: forwarded to the caller
        let mut token = unsafe { klock::assume_cpu_lock::<Traits>() };
        wait::resume_all_isr(&mut token, &self.list)
    }
}
