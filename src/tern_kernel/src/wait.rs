//! Priority-ordered wait lists and the wake protocol shared by every
//! blocking primitive.
//!
//! A blocked thread sits in the primitive's wait list, sorted by priority
//! with FIFO ties, and — for timed waits — simultaneously in a timer's tick
//! list. Whichever wake path fires first removes the thread from *both*
//! lists under the CPU lock and records itself in the thread's wake-source
//! cell; the other path then has nothing left to see. This replaces the
//! classic trick of encoding "who removed me" in a magic back-pointer value.
use crate::{
    klock::CpuLockToken,
    thread::{self, Thread, ThreadSt},
    utils::intrusive_list::{List, PrioLink},
    KernelTraits, PortThreading,
};

#[cfg(feature = "timed")]
use crate::timer::Timer;

/// A priority-ordered list of waiting threads, embedded in each primitive.
pub(crate) type WaitList<Traits> = List<Traits, PrioLink>;

/// Which side of a timed wait's race fired first.
#[cfg(feature = "timed")]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WakeSource {
    /// The primitive woke the thread before the deadline.
    Event,
    /// The deadline was reached (or the wait was aborted).
    Timer,
}

/// Sort key for wait lists: ascending priority value, ties after existing
/// entries.
fn priority_before<Traits: PortThreading>(
    a: &Thread<Traits>,
    b: &Thread<Traits>,
    token: &CpuLockToken<Traits>,
) -> bool {
    a.priority.get(token) < b.priority.get(token)
}

/// Block the running thread on `list` until a wake path releases it.
pub(crate) fn wait_in_prior_list<Traits: KernelTraits>(
    token: &mut CpuLockToken<Traits>,
    list: &'static WaitList<Traits>,
) {
    let th = thread::running(token);
    list.insert_sorted(token, th, priority_before::<Traits>);
    th.wait_list.set(token, Some(list));
    th.st.set(token, ThreadSt::Waiting);
    thread::switch_to_next(token);
    thread::check_irq::<Traits>(token);
}

/// Block the running thread on `list` and on `timer`'s tick list at once.
/// Returns `true` iff the wake came from the primitive rather than the
/// deadline.
#[cfg(feature = "timed")]
pub(crate) fn wait_in_prior_and_tick_list<Traits: KernelTraits>(
    token: &mut CpuLockToken<Traits>,
    list: &'static WaitList<Traits>,
    timer: &'static Timer<Traits>,
) -> bool {
    let th = thread::running(token);
    list.insert_sorted(token, th, priority_before::<Traits>);
    th.wait_list.set(token, Some(list));
    timer.insert_waiter(token, th);
    th.wait_timer.set(token, Some(timer));
    th.wake.set(token, None);
    th.st.set(token, ThreadSt::Waiting);
    thread::switch_to_next(token);
    thread::check_irq::<Traits>(token);

    debug_assert!(th.wait_list.get(token).is_none());
    debug_assert!(th.wait_timer.get(token).is_none());
    matches!(th.wake.get(token), Some(WakeSource::Event))
}

/// Detach the highest-priority waiter and clean up its timed-wait state, if
/// any. Does not make it ready.
pub(crate) fn take_first<Traits: KernelTraits>(
    token: &mut CpuLockToken<Traits>,
    list: &WaitList<Traits>,
) -> Option<&'static Thread<Traits>> {
    let th = list.pop_front(token)?;
    th.wait_list.set(token, None);
    #[cfg(feature = "timed")]
    if let Some(timer) = th.wait_timer.replace(token, None) {
        timer.remove_waiter(token, th);
        th.wake.set(token, Some(WakeSource::Event));
    }
    Some(th)
}

/// Wake the highest-priority waiter; yield to it if it outranks the caller.
pub(crate) fn resume_first<Traits: KernelTraits>(
    token: &mut CpuLockToken<Traits>,
    list: &WaitList<Traits>,
) {
    if let Some(th) = take_first(token, list) {
        thread::resume_inner(token, th);
    }
}

/// Move every waiter to the ready queues, in priority order; yield once if
/// the best of them outranks the caller.
pub(crate) fn resume_all<Traits: KernelTraits>(
    token: &mut CpuLockToken<Traits>,
    list: &WaitList<Traits>,
) {
    let Some(first) = list.first(token) else {
        return;
    };
    let top = first.priority.get(token);
    while let Some(th) = take_first(token, list) {
        thread::make_ready(token, th);
    }
    if top < thread::running(token).priority.get(token) {
        thread::yield_to_ready(token);
        thread::check_irq::<Traits>(token);
    }
}

/// ISR-safe variant of [`resume_first`]: never yields, reports whether the
/// epilogue should.
pub(crate) fn resume_first_isr<Traits: KernelTraits>(
    token: &mut CpuLockToken<Traits>,
    list: &WaitList<Traits>,
) -> bool {
    match take_first(token, list) {
        None => false,
        Some(th) => {
            thread::make_ready(token, th);
            th.priority.get(token) < thread::running(token).priority.get(token)
        }
    }
}

/// ISR-safe variant of [`resume_all`].
pub(crate) fn resume_all_isr<Traits: KernelTraits>(
    token: &mut CpuLockToken<Traits>,
    list: &WaitList<Traits>,
) -> bool {
    let Some(first) = list.first(token) else {
        return false;
    };
    let top = first.priority.get(token);
    while let Some(th) = take_first(token, list) {
        thread::make_ready(token, th);
    }
    top < thread::running(token).priority.get(token)
}
