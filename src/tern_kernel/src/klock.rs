//! Kernel state locking mechanism.
//!
//! All mutable kernel state lives in [`CpuLockCell`]s. A cell can only be
//! accessed through a [`CpuLockToken`], which witnesses that the CPU lock
//! (the global interrupt mask) is in effect. There is one conceptual token
//! per system; the running thread owns it whenever it has interrupts masked,
//! and it is handed over implicitly across context switches.
//!
//! Unlike a conventional lock, the CPU lock nests: the depth is counted on
//! the *running* thread ([`Thread::critical_depth`]), so a context switch
//! inherently switches the "should interrupts be masked" policy to the new
//! thread's depth.
//!
//! [`Thread::critical_depth`]: crate::thread::Thread
use core::cell::UnsafeCell;
use core::fmt;
use core::marker::PhantomData;

use crate::{utils::Init, KernelTraits, PortThreading};

/// Witness that the CPU lock is active. Zero-sized; neither `Send` nor
/// `Sync`.
pub struct CpuLockToken<Traits: PortThreading> {
    _phantom: PhantomData<(Traits, *mut ())>,
}

impl<Traits: PortThreading> CpuLockToken<Traits> {
    /// Construct a token out of thin air.
    ///
    /// # Safety
    ///
    /// The CPU lock must really be active, and the token must not be used
    /// concurrently with another token's *accesses* (tokens may coexist —
    /// e.g. one belonging to a thread parked inside the scheduler — as long
    /// as only the one owned by the currently executing context touches any
    /// cell).
    #[inline]
    pub unsafe fn new() -> Self {
        Self {
            _phantom: PhantomData,
        }
    }
}

/// Cell type holding kernel state, accessible only while the CPU lock is
/// active.
pub struct CpuLockCell<Traits: PortThreading, T: ?Sized> {
    _phantom: PhantomData<Traits>,
    value: UnsafeCell<T>,
}

// Safety: the pointee is only ever reached through a `CpuLockToken`, i.e.
// with interrupts masked on the single CPU.
unsafe impl<Traits: PortThreading, T: Send> Sync for CpuLockCell<Traits, T> {}

impl<Traits: PortThreading, T> CpuLockCell<Traits, T> {
    pub const fn new(x: T) -> Self {
        Self {
            _phantom: PhantomData,
            value: UnsafeCell::new(x),
        }
    }

    /// Borrow the contents.
    #[inline]
    pub fn read<'a>(&'a self, _token: &'a CpuLockToken<Traits>) -> &'a T {
        // Safety: the token proves the CPU lock is held
        unsafe { &*self.value.get() }
    }

    /// Mutably borrow the contents. The token is mutably borrowed for the
    /// duration, so no second cell can be written at the same time.
    #[inline]
    pub fn write<'a>(&'a self, _token: &'a mut CpuLockToken<Traits>) -> &'a mut T {
        // Safety: ditto, and the `&mut` borrow of the token prevents
        // overlapping access through it
        unsafe { &mut *self.value.get() }
    }

    /// Copy the contents out.
    #[inline]
    pub fn get(&self, token: &CpuLockToken<Traits>) -> T
    where
        T: Copy,
    {
        *self.read(token)
    }

    /// Store a new value.
    #[inline]
    pub fn set(&self, token: &mut CpuLockToken<Traits>, value: T) {
        *self.write(token) = value;
    }

    /// Store a new value, returning the old one.
    #[inline]
    pub fn replace(&self, token: &mut CpuLockToken<Traits>, value: T) -> T {
        core::mem::replace(self.write(token), value)
    }

    /// A raw pointer to the contents, for the rare reader that can prove the
    /// absence of a concurrent writer by other means (e.g. write-once data).
    #[inline]
    pub fn as_ptr(&self) -> *mut T {
        self.value.get()
    }
}

impl<Traits: PortThreading, T: Init> Init for CpuLockCell<Traits, T> {
    const INIT: Self = Self::new(T::INIT);
}

impl<Traits: PortThreading, T> fmt::Debug for CpuLockCell<Traits, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The contents can't be read safely without the token.
        f.write_str("CpuLockCell(..)")
    }
}

/// RAII guard for one level of the CPU lock.
///
/// Construction masks interrupts and increments the running thread's
/// critical-section depth; dropping decrements it and unmasks only when the
/// depth reaches zero. This is the object backing every kernel service entry
/// and the user-facing critical sections.
pub struct CpuLockGuard<Traits: KernelTraits> {
    token: CpuLockToken<Traits>,
}

impl<Traits: KernelTraits> CpuLockGuard<Traits> {
    #[inline]
    pub fn token(&mut self) -> &mut CpuLockToken<Traits> {
        &mut self.token
    }
}

/// Enter one level of the CPU lock and get an RAII guard.
pub fn lock_cpu<Traits: KernelTraits>() -> CpuLockGuard<Traits> {
    // Safety: we are the kernel
    unsafe { Traits::enter_cpu_lock() };
    // Safety: interrupts are now masked and we are the running context
    let mut guard = CpuLockGuard {
        token: unsafe { CpuLockToken::new() },
    };
    if let Some(running) = Traits::state().running.get(&guard.token) {
        let depth = running.critical_depth.get(&guard.token);
        running.critical_depth.set(&mut guard.token, depth + 1);
    }
    guard
}

/// Get a token for an already-active CPU lock, without touching the nesting
/// depth. This is how `*_isr` entry points access kernel state.
///
/// # Safety
///
/// See [`CpuLockToken::new`].
#[inline]
pub unsafe fn assume_cpu_lock<Traits: PortThreading>() -> CpuLockToken<Traits> {
    debug_assert!(Traits::is_cpu_lock_active());
    // Safety: forwarded to the caller
    unsafe { CpuLockToken::new() }
}

impl<Traits: KernelTraits> Drop for CpuLockGuard<Traits> {
    fn drop(&mut self) {
        if let Some(running) = Traits::state().running.get(&self.token) {
            let depth = running.critical_depth.get(&self.token);
            debug_assert!(depth > 0);
            running.critical_depth.set(&mut self.token, depth - 1);
            if depth != 1 {
                return;
            }
        }
        // Safety: the depth reached zero (or no thread is installed yet), so
        // it's our job to unmask
        unsafe { Traits::leave_cpu_lock() };
    }
}

impl<Traits: KernelTraits> core::ops::Deref for CpuLockGuard<Traits> {
    type Target = CpuLockToken<Traits>;
    fn deref(&self) -> &Self::Target {
        &self.token
    }
}

impl<Traits: KernelTraits> core::ops::DerefMut for CpuLockGuard<Traits> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.token
    }
}
