//! Bounded byte queues: a ring buffer with producer/consumer blocking,
//! composed entirely from the kernel's own primitives — two [`Event`]s for
//! "bytes available" / "space available" and two [`Mutex`]es serializing
//! multiple producers and multiple consumers.
//!
//! The per-byte contract: a blocked producer first pokes `input` (a consumer
//! may be parked mid-read waiting for one more byte) and then waits on
//! `output`; on completion it notifies `input` once. Consumers are
//! symmetric.
use core::ffi::CStr;

use crate::{
    error::{QueueEmptyError, QueueFullError},
    event::Event,
    klock::{self, CpuLockToken},
    mutex::Mutex,
    wait, KernelTraits, PortThreading,
};

#[cfg(feature = "timed")]
use crate::{error::TimeoutError, timer::Timer};

/// A bounded single-reader-at-a-time/single-writer-at-a-time byte ring of
/// capacity `N`. Allocated by the application, normally as a `static`; the
/// backing array lives inside the object.
pub struct Queue<Traits: PortThreading, const N: usize> {
    /// Signaled when bytes become available.
    input: Event<Traits>,
    /// Signaled when space becomes available.
    output: Event<Traits>,
    /// Serializes producers.
    putting: Mutex<Traits>,
    /// Serializes consumers.
    getting: Mutex<Traits>,
    first: klock::CpuLockCell<Traits, usize>,
    last: klock::CpuLockCell<Traits, usize>,
    qty: klock::CpuLockCell<Traits, usize>,
    data: klock::CpuLockCell<Traits, [u8; N]>,
}

impl<Traits: PortThreading, const N: usize> Queue<Traits, N> {
    pub const fn new() -> Self {
        Self {
            input: Event::new(),
            output: Event::new(),
            putting: Mutex::new(),
            getting: Mutex::new(),
            first: klock::CpuLockCell::new(0),
            last: klock::CpuLockCell::new(0),
            qty: klock::CpuLockCell::new(0),
            data: klock::CpuLockCell::new([0; N]),
        }
    }

    pub const fn capacity(&self) -> usize {
        N
    }
}

impl<Traits: PortThreading, const N: usize> Default for Queue<Traits, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Traits: KernelTraits, const N: usize> Queue<Traits, N> {
    // -- Ring primitives ----------------------------------------------------

    fn put_inner(&self, token: &mut CpuLockToken<Traits>, byte: u8) -> bool {
        let qty = self.qty.get(token);
        if qty >= N {
            return false;
        }
        let last = self.last.get(token);
        self.data.write(token)[last] = byte;
        self.last.set(token, if last + 1 >= N { 0 } else { last + 1 });
        self.qty.set(token, qty + 1);
        true
    }

    fn get_inner(&self, token: &mut CpuLockToken<Traits>) -> Option<u8> {
        let qty = self.qty.get(token);
        if qty == 0 {
            return None;
        }
        let first = self.first.get(token);
        let byte = self.data.read(token)[first];
        self.first.set(token, if first + 1 >= N { 0 } else { first + 1 });
        self.qty.set(token, qty - 1);
        Some(byte)
    }

    fn try_put(&self, byte: u8) -> bool {
        let mut guard = klock::lock_cpu::<Traits>();
        self.put_inner(&mut guard, byte)
    }

    fn try_get(&self) -> Option<u8> {
        let mut guard = klock::lock_cpu::<Traits>();
        self.get_inner(&mut guard)
    }

    /// Whether the queue is full.
    pub fn is_full(&self) -> bool {
        let guard = klock::lock_cpu::<Traits>();
        self.qty.get(&guard) >= N
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        let guard = klock::lock_cpu::<Traits>();
        self.qty.get(&guard) == 0
    }

    // -- Blocking operations ------------------------------------------------

    /// Append every byte of `src`, blocking while the queue is full.
    pub fn put(&'static self, src: &[u8]) {
        if src.is_empty() {
            return;
        }
        self.putting.lock_critical();
        self.put_loop(src);
        self.putting.unlock_critical();
    }

    /// Append one byte, blocking while the queue is full.
    pub fn put_byte(&'static self, byte: u8) {
        self.put(core::slice::from_ref(&byte));
    }

    /// Append the string including its terminating NUL.
    pub fn put_cstr(&'static self, src: &CStr) {
        self.put(src.to_bytes_with_nul());
    }

    /// Fill `dst` entirely, blocking while the queue is empty.
    pub fn get(&'static self, dst: &mut [u8]) {
        if dst.is_empty() {
            return;
        }
        self.getting.lock_critical();
        self.get_loop(dst);
        self.getting.unlock_critical();
    }

    /// Take one byte, blocking while the queue is empty.
    pub fn get_byte(&'static self) -> u8 {
        let mut byte = [0u8];
        self.get(&mut byte);
        byte[0]
    }

    /// Take bytes into `dst` up to and including a NUL, or until `dst` is
    /// full. Returns the number of bytes stored.
    pub fn get_cstr(&'static self, dst: &mut [u8]) -> usize {
        if dst.is_empty() {
            return 0;
        }
        self.getting.lock_critical();
        let mut n = 0;
        loop {
            let byte = self.get_byte_blocking();
            dst[n] = byte;
            n += 1;
            if byte == 0 || n == dst.len() {
                break;
            }
            if self.is_empty() {
                self.output.notify();
            }
        }
        self.output.notify();
        self.getting.unlock_critical();
        n
    }

    /// The producer body shared by the blocking and (for trailing bytes) the
    /// timed operations. Caller holds `putting`. A no-op slice still
    /// notifies `input` (the timed path relies on it).
    fn put_loop(&'static self, src: &[u8]) {
        for (i, &byte) in src.iter().enumerate() {
            while !self.try_put(byte) {
                self.output.wait();
            }
            if i + 1 == src.len() {
                break;
            }
            if self.is_full() {
                // A consumer may be waiting mid-read for one more byte
                self.input.notify();
            }
        }
        self.input.notify();
    }

    /// Consumer counterpart of [`Self::put_loop`]. Caller holds `getting`.
    /// A no-op slice still notifies `output` (the timed path relies on it).
    fn get_loop(&'static self, dst: &mut [u8]) {
        for i in 0..dst.len() {
            dst[i] = self.get_byte_blocking();
            if i + 1 == dst.len() {
                break;
            }
            if self.is_empty() {
                // A producer may be waiting mid-write for one slot
                self.output.notify();
            }
        }
        self.output.notify();
    }

    fn get_byte_blocking(&'static self) -> u8 {
        loop {
            if let Some(byte) = self.try_get() {
                return byte;
            }
            self.input.wait();
        }
    }

    // -- Timed operations ---------------------------------------------------
    //
    // The deadline gates the serialization mutex and the first byte only;
    // once the first byte has moved, the rest of the transfer blocks without
    // observing the timer.

    /// [`Self::put`] with a deadline on the first byte.
    #[cfg(feature = "timed")]
    pub fn put_timed(
        &'static self,
        timer: &'static Timer<Traits>,
        src: &[u8],
    ) -> Result<(), TimeoutError> {
        if src.is_empty() {
            return Ok(());
        }
        self.putting.lock_critical_timed(timer)?;
        loop {
            if self.try_put(src[0]) {
                break;
            }
            if self.output.wait_timed(timer).is_err() {
                self.putting.unlock_critical();
                return Err(TimeoutError);
            }
        }
        self.put_loop(&src[1..]);
        self.putting.unlock_critical();
        Ok(())
    }

    /// [`Self::put_byte`] with a deadline.
    #[cfg(feature = "timed")]
    pub fn put_byte_timed(
        &'static self,
        timer: &'static Timer<Traits>,
        byte: u8,
    ) -> Result<(), TimeoutError> {
        self.put_timed(timer, core::slice::from_ref(&byte))
    }

    /// [`Self::put_cstr`] with a deadline on the first byte.
    #[cfg(feature = "timed")]
    pub fn put_cstr_timed(
        &'static self,
        timer: &'static Timer<Traits>,
        src: &CStr,
    ) -> Result<(), TimeoutError> {
        self.put_timed(timer, src.to_bytes_with_nul())
    }

    /// [`Self::get`] with a deadline on the first byte.
    #[cfg(feature = "timed")]
    pub fn get_timed(
        &'static self,
        timer: &'static Timer<Traits>,
        dst: &mut [u8],
    ) -> Result<(), TimeoutError> {
        if dst.is_empty() {
            return Ok(());
        }
        self.getting.lock_critical_timed(timer)?;
        dst[0] = match self.get_byte_timed_inner(timer) {
            Ok(byte) => byte,
            Err(e) => {
                self.getting.unlock_critical();
                return Err(e);
            }
        };
        self.get_loop(&mut dst[1..]);
        self.getting.unlock_critical();
        Ok(())
    }

    /// [`Self::get_byte`] with a deadline.
    #[cfg(feature = "timed")]
    pub fn get_byte_timed(&'static self, timer: &'static Timer<Traits>) -> Result<u8, TimeoutError> {
        let mut byte = [0u8];
        self.get_timed(timer, &mut byte)?;
        Ok(byte[0])
    }

    /// [`Self::get_cstr`] with a deadline on the first byte.
    #[cfg(feature = "timed")]
    pub fn get_cstr_timed(
        &'static self,
        timer: &'static Timer<Traits>,
        dst: &mut [u8],
    ) -> Result<usize, TimeoutError> {
        if dst.is_empty() {
            return Ok(0);
        }
        self.getting.lock_critical_timed(timer)?;
        let first = match self.get_byte_timed_inner(timer) {
            Ok(byte) => byte,
            Err(e) => {
                self.getting.unlock_critical();
                return Err(e);
            }
        };
        dst[0] = first;
        let mut n = 1;
        while first != 0 && n < dst.len() {
            let byte = self.get_byte_blocking();
            dst[n] = byte;
            n += 1;
            if byte == 0 {
                break;
            }
            if self.is_empty() {
                self.output.notify();
            }
        }
        self.output.notify();
        self.getting.unlock_critical();
        Ok(n)
    }

    #[cfg(feature = "timed")]
    fn get_byte_timed_inner(&'static self, timer: &'static Timer<Traits>) -> Result<u8, TimeoutError> {
        loop {
            if let Some(byte) = self.try_get() {
                return Ok(byte);
            }
            self.input.wait_timed(timer)?;
        }
    }

    // -- ISR operations -----------------------------------------------------

    /// Non-blocking put for interrupt handlers. `Err` when full; otherwise
    /// the yield-suggested flag from waking a consumer.
    ///
    /// # Safety
    ///
    /// Must be called from an interrupt context with interrupts masked.
    pub unsafe fn put_byte_isr(&self, byte: u8) -> Result<bool, QueueFullError> {
        // Safety: forwarded to the caller
        let mut token = unsafe { klock::assume_cpu_lock::<Traits>() };
        if !self.put_inner(&mut token, byte) {
            return Err(QueueFullError);
        }
        Ok(wait::resume_first_isr(&mut token, &self.input.list))
    }

    /// Non-blocking get for interrupt handlers. `Err` when empty; otherwise
    /// the byte and the yield-suggested flag from waking a producer.
    ///
    /// # Safety
    ///
    /// Must be called from an interrupt context with interrupts masked.
    pub unsafe fn get_byte_isr(&self) -> Result<(u8, bool), QueueEmptyError> {
        // Safety: forwarded to the caller
        let mut token = unsafe { klock::assume_cpu_lock::<Traits>() };
        let byte = self.get_inner(&mut token).ok_or(QueueEmptyError)?;
        Ok((byte, wait::resume_first_isr(&mut token, &self.output.list)))
    }

    /// [`Self::get_byte_isr`] that wakes a producer only once the remaining
    /// count drops to `threshold` or below. TX-drain handlers use this to
    /// batch wakeups instead of signaling on every byte.
    ///
    /// # Safety
    ///
    /// Must be called from an interrupt context with interrupts masked.
    pub unsafe fn get_byte_threshold_isr(
        &self,
        threshold: usize,
    ) -> Result<(u8, bool), QueueEmptyError> {
        // Safety: forwarded to the caller
        let mut token = unsafe { klock::assume_cpu_lock::<Traits>() };
        let byte = self.get_inner(&mut token).ok_or(QueueEmptyError)?;
        let yield_suggested = self.qty.get(&token) <= threshold
            && wait::resume_first_isr(&mut token, &self.output.list);
        Ok((byte, yield_suggested))
    }
}
