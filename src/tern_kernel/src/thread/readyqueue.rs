//! The task ready queue: one FIFO of Ready threads per priority level, plus
//! a bitmap telling which levels are non-empty so the scheduler can find the
//! highest priority in constant time.
use crate::{
    klock::{CpuLockCell, CpuLockToken},
    thread::Thread,
    utils::{
        intrusive_list::{List, PrioLink},
        Init, PrioBitmap,
    },
    PortThreading,
};

/// Operations the scheduler needs from a ready queue.
///
/// This trait is not intended to be implemented on custom types; it exists so
/// that a port can pick the queue's size (the level count) while the kernel
/// stays independent of it.
pub trait ReadyQueueOps<Traits: PortThreading>: private::Sealed {
    /// The number of priority levels, application levels plus the reserved
    /// background level.
    const LEVELS: usize;

    /// Append `thread` to the FIFO of its priority level.
    fn push_back(&self, token: &mut CpuLockToken<Traits>, thread: &'static Thread<Traits>);

    /// Detach the head of the highest-priority non-empty FIFO.
    fn pop_front(&self, token: &mut CpuLockToken<Traits>) -> Option<&'static Thread<Traits>>;
}

/// The ready queue implementation: `LEN` segregated FIFOs and a one-word
/// bitmap.
///
/// Invariant: bit `i` of the bitmap is set iff `queues[i]` is non-empty.
pub struct ReadyQueue<Traits: PortThreading, const LEN: usize> {
    queues: [List<Traits, PrioLink>; LEN],
    bitmap: CpuLockCell<Traits, PrioBitmap>,
}

impl<Traits: PortThreading, const LEN: usize> Init for ReadyQueue<Traits, LEN> {
    const INIT: Self = Self {
        queues: [List::INIT; LEN],
        bitmap: CpuLockCell::new(PrioBitmap::EMPTY),
    };
}

impl<Traits: PortThreading, const LEN: usize> ReadyQueueOps<Traits> for ReadyQueue<Traits, LEN> {
    const LEVELS: usize = LEN;

    #[inline]
    fn push_back(&self, token: &mut CpuLockToken<Traits>, thread: &'static Thread<Traits>) {
        let level = thread.priority.get(token) as usize;
        debug_assert!(level < LEN);
        self.queues[level].push_back(token, thread);
        self.bitmap.write(token).set(level);
    }

    #[inline]
    fn pop_front(&self, token: &mut CpuLockToken<Traits>) -> Option<&'static Thread<Traits>> {
        let level = self.bitmap.get(token).find_set()?;
        // The bitmap invariant guarantees the queue is non-empty
        let thread = self.queues[level].pop_front(token).unwrap();
        if self.queues[level].is_empty(token) {
            self.bitmap.write(token).clear(level);
        }
        Some(thread)
    }
}

mod private {
    pub trait Sealed {}
}

impl<Traits: PortThreading, const LEN: usize> private::Sealed for ReadyQueue<Traits, LEN> {}
