//! Timers: a monotonic tick counter plus a deadline-sorted list of waiting
//! threads, driven by a hardware tick interrupt through [`Timer::tick_isr`].
use crate::{
    klock::{self, CpuLockCell, CpuLockToken},
    thread::{self, Thread, ThreadSt},
    utils::intrusive_list::{List, TickLink},
    KernelTraits, PortThreading, UTick,
};

#[cfg(feature = "timed")]
use crate::wait::WakeSource;

/// Wrap-safe tick comparison: whether tick `a` has reached tick `b`,
/// i.e. `a ≥ b` modulo `2³²`. Holds iff `(a − b) mod 2³² ≤ 2³¹ − 1`, so
/// deadlines work as long as they are set no further than half the tick
/// range ahead.
#[inline]
pub fn tick_over(a: UTick, b: UTick) -> bool {
    a.wrapping_sub(b) <= UTick::MAX >> 1
}

/// A tick source: the counter incremented by the hardware tick ISR, and the
/// threads waiting for a deadline on it. More than one thread can wait on
/// the same timer.
///
/// The kernel calls the [`PortTimer`] hooks when the wait list goes
/// non-empty/empty so the application can start and stop the hardware
/// interrupt.
pub struct Timer<Traits: PortThreading> {
    pub(crate) tick: CpuLockCell<Traits, UTick>,
    pub(crate) list: List<Traits, TickLink>,
}

impl<Traits: PortThreading> Timer<Traits> {
    pub const fn new() -> Self {
        Self {
            tick: CpuLockCell::new(0),
            list: List::new(),
        }
    }
}

impl<Traits: PortThreading> Default for Timer<Traits> {
    fn default() -> Self {
        Self::new()
    }
}

/// Sort key for tick lists. Equal deadlines put the newest waiter first;
/// they all fire on the same tick anyway.
fn deadline_before<Traits: PortThreading>(
    a: &Thread<Traits>,
    b: &Thread<Traits>,
    token: &CpuLockToken<Traits>,
) -> bool {
    tick_over(b.deadline.get(token), a.deadline.get(token))
}

impl<Traits: KernelTraits> Timer<Traits> {
    /// The current tick count.
    pub fn now(&self) -> UTick {
        let guard = klock::lock_cpu::<Traits>();
        self.tick.get(&guard)
    }

    /// Advance the tick counter by one and move every waiter whose deadline
    /// has been reached to the ready queues. Returns whether a resumed
    /// thread outranks the running thread, in which case the ISR epilogue
    /// must call [`System::yield_isr`].
    ///
    /// [`System::yield_isr`]: crate::System::yield_isr
    ///
    /// # Safety
    ///
    /// Must be called from the tick interrupt handler, with interrupts
    /// masked.
    pub unsafe fn tick_isr(&'static self) -> bool {
        // Safety: forwarded to the caller
        let mut token = unsafe { klock::assume_cpu_lock::<Traits>() };
        let token = &mut token;

        let now = self.tick.get(token).wrapping_add(1);
        self.tick.set(token, now);

        let mut yield_suggested = false;
        let mut drained = false;
        while let Some(head) = self.list.first(token) {
            if !tick_over(now, head.deadline.get(token)) {
                break;
            }
            self.list.remove(token, head);
            drained = self.list.is_empty(token);
            self.detach_waiter(token, head);
            thread::make_ready(token, head);
            yield_suggested |=
                head.priority.get(token) < thread::running(token).priority.get(token);
        }
        if drained {
            Traits::timer_stopped(self);
        }
        yield_suggested
    }

    /// Block the running thread until the tick counter reaches its deadline.
    /// The deadline is set beforehand with [`System::set_deadline`] and
    /// friends.
    ///
    /// [`System::set_deadline`]: crate::System::set_deadline
    pub fn wait(&'static self) {
        let mut guard = klock::lock_cpu::<Traits>();
        self.wait_inner(&mut guard);
    }

    /// Wait `ticks` ticks from now. The thread's stored deadline is
    /// preserved across the call.
    pub fn delay(&'static self, ticks: UTick) {
        let mut guard = klock::lock_cpu::<Traits>();
        let token = &mut *guard;
        let th = thread::running(token);
        let saved = th.deadline.get(token);
        th.deadline
            .set(token, self.tick.get(token).wrapping_add(ticks));
        self.wait_inner(token);
        th.deadline.set(token, saved);
    }

    /// Wait until `ticks` past the thread's stored deadline, then restore
    /// the deadline. For one-shot waits relative to the last scheduled
    /// point.
    pub fn shift(&'static self, ticks: UTick) {
        let mut guard = klock::lock_cpu::<Traits>();
        let token = &mut *guard;
        let th = thread::running(token);
        let saved = th.deadline.get(token);
        th.deadline.set(token, saved.wrapping_add(ticks));
        self.wait_inner(token);
        th.deadline.set(token, saved);
    }

    /// Advance the thread's deadline by `ticks` and wait for it, keeping the
    /// new deadline. Strictly periodic tasks use this in a loop: a late
    /// iteration catches up instead of drifting.
    pub fn period(&'static self, ticks: UTick) {
        let mut guard = klock::lock_cpu::<Traits>();
        let token = &mut *guard;
        let th = thread::running(token);
        let deadline = th.deadline.get(token).wrapping_add(ticks);
        th.deadline.set(token, deadline);
        self.wait_inner(token);
    }

    /// Cancel `thread`'s wait on this timer, resuming it immediately.
    /// Returns whether the thread was actually waiting here. The interrupted
    /// wait reports a timeout.
    pub fn abort(&'static self, thread: &'static Thread<Traits>) -> bool {
        let mut guard = klock::lock_cpu::<Traits>();
        let token = &mut *guard;
        if !self.list.remove(token, thread) {
            return false;
        }
        if self.list.is_empty(token) {
            Traits::timer_stopped(self);
        }
        self.detach_waiter(token, thread);
        thread::resume_inner(token, thread);
        true
    }

    fn wait_inner(&'static self, token: &mut CpuLockToken<Traits>) {
        let th = thread::running(token);
        self.insert_waiter(token, th);
        th.st.set(token, ThreadSt::Waiting);
        thread::switch_to_next(token);
        thread::check_irq::<Traits>(token);
    }

    /// Link `thread` into the tick list; fires the start hook on the
    /// empty→non-empty transition.
    pub(crate) fn insert_waiter(
        &'static self,
        token: &mut CpuLockToken<Traits>,
        thread: &'static Thread<Traits>,
    ) {
        let was_empty = self.list.is_empty(token);
        self.list
            .insert_sorted(token, thread, deadline_before::<Traits>);
        if was_empty {
            Traits::timer_started(self);
        }
    }

    /// Unlink `thread` on behalf of a non-timer wake path.
    #[cfg(feature = "timed")]
    pub(crate) fn remove_waiter(
        &'static self,
        token: &mut CpuLockToken<Traits>,
        thread: &'static Thread<Traits>,
    ) {
        let removed = self.list.remove(token, thread);
        debug_assert!(removed);
        if self.list.is_empty(token) {
            Traits::timer_stopped(self);
        }
    }

    /// Clear the timed-wait state of a thread this timer's side just won:
    /// record the wake source and unlink it from the wait list it may also
    /// occupy.
    fn detach_waiter(
        &'static self,
        token: &mut CpuLockToken<Traits>,
        thread: &'static Thread<Traits>,
    ) {
        #[cfg(feature = "timed")]
        {
            thread.wait_timer.set(token, None);
            thread.wake.set(token, Some(WakeSource::Timer));
        }
        if let Some(list) = thread.wait_list.replace(token, None) {
            let removed = list.remove(token, thread);
            debug_assert!(removed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[test]
    fn tick_over_basics() {
        assert!(tick_over(0, 0));
        assert!(tick_over(1, 0));
        assert!(!tick_over(0, 1));
        // Wrap-around: 0 is "after" a deadline near the top of the range
        assert!(tick_over(0, UTick::MAX));
        assert!(tick_over(5, UTick::MAX - 5));
    }

    #[quickcheck]
    fn tick_over_matches_signed_distance(a: u32, b: u32) -> bool {
        // `a ≥ b` in wrap-safe arithmetic is "the signed distance is
        // non-negative"
        tick_over(a, b) == (a.wrapping_sub(b) as i32 >= 0)
    }

    #[quickcheck]
    fn deadline_first_fires_exactly_at_deadline(start: u32, delta: u16) -> bool {
        // For any deadline within half the tick range of "now", the deadline
        // is not due one tick early and is due at the deadline tick.
        let deadline = start.wrapping_add(delta as u32);
        let due_at = tick_over(deadline, deadline);
        let not_due_before = delta == 0 || !tick_over(deadline.wrapping_sub(1), deadline);
        due_at && not_due_before
    }
}
