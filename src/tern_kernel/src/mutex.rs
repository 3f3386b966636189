//! Mutual exclusion with a known owner.
//!
//! No priority inheritance: a low-priority holder can keep a high-priority
//! waiter blocked for as long as it holds the lock. This is a documented
//! design choice, not an oversight — the kernel targets designs where
//! critical sections guarded by a mutex are short and the priority layout is
//! chosen accordingly.
use core::ptr;

use crate::{
    klock::{self, CpuLockCell, CpuLockToken},
    thread::{self, Thread},
    wait::{self, WaitList},
    KernelTraits, PortThreading, System,
};

#[cfg(feature = "timed")]
use crate::{error::TimeoutError, timer::Timer};

/// A binary ownership token with a priority-ordered wait list.
pub struct Mutex<Traits: PortThreading> {
    /// The current owner. `None` means free; a live owner is never on the
    /// wait list.
    pub(crate) owner: CpuLockCell<Traits, Option<&'static Thread<Traits>>>,
    pub(crate) list: WaitList<Traits>,
}

impl<Traits: PortThreading> Mutex<Traits> {
    pub const fn new() -> Self {
        Self {
            owner: CpuLockCell::new(None),
            list: WaitList::new(),
        }
    }
}

impl<Traits: PortThreading> Default for Mutex<Traits> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Traits: KernelTraits> Mutex<Traits> {
    /// Acquire the mutex, blocking while another thread owns it.
    pub fn lock(&'static self) {
        let mut guard = klock::lock_cpu::<Traits>();
        self.lock_inner(&mut guard);
    }

    fn lock_inner(&'static self, token: &mut CpuLockToken<Traits>) {
        // An unlock wakes only the head waiter; whoever runs first claims
        // ownership here and the rest re-block.
        while self.owner.get(token).is_some() {
            wait::wait_in_prior_list(token, &self.list);
        }
        self.owner.set(token, Some(thread::running(token)));
    }

    /// Release the mutex and wake the highest-priority waiter, if any.
    pub fn unlock(&'static self) {
        let mut guard = klock::lock_cpu::<Traits>();
        let token = &mut *guard;
        debug_assert!(
            matches!(self.owner.get(token), Some(owner) if ptr::eq(owner, thread::running(token))),
            "unlocking a mutex the caller does not own",
        );
        self.owner.set(token, None);
        wait::resume_first(token, &self.list);
    }

    /// Open a critical section and acquire the mutex inside it, so the
    /// guarded body runs with interrupts masked.
    pub fn lock_critical(&'static self) {
        System::<Traits>::enter_critical();
        self.lock();
    }

    /// Release a mutex acquired with [`Self::lock_critical`] and close the
    /// critical section.
    pub fn unlock_critical(&'static self) {
        self.unlock();
        System::<Traits>::exit_critical();
    }

    /// Acquire the mutex, giving up when `timer` reaches the running
    /// thread's deadline first. On timeout, ownership is not taken.
    #[cfg(feature = "timed")]
    pub fn lock_timed(&'static self, timer: &'static Timer<Traits>) -> Result<(), TimeoutError> {
        let mut guard = klock::lock_cpu::<Traits>();
        let token = &mut *guard;
        while self.owner.get(token).is_some() {
            if !wait::wait_in_prior_and_tick_list(token, &self.list, timer) {
                return Err(TimeoutError);
            }
        }
        self.owner.set(token, Some(thread::running(token)));
        Ok(())
    }

    /// [`Self::lock_critical`] with a deadline. The critical section is only
    /// left open on success.
    #[cfg(feature = "timed")]
    pub fn lock_critical_timed(
        &'static self,
        timer: &'static Timer<Traits>,
    ) -> Result<(), TimeoutError> {
        System::<Traits>::enter_critical();
        match self.lock_timed(timer) {
            Ok(()) => Ok(()),
            Err(e) => {
                System::<Traits>::exit_critical();
                Err(e)
            }
        }
    }

    /// Whether some thread currently owns the mutex.
    pub fn is_locked(&self) -> bool {
        let guard = klock::lock_cpu::<Traits>();
        self.owner.get(&guard).is_some()
    }
}
