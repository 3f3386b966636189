//! Error types.
//!
//! The kernel's error vocabulary is deliberately small: blocking services
//! cannot fail (they wait), timed services report expiry, ISR-safe queue
//! accessors report bounded-resource refusal, and registration reports
//! misuse instead of leaving it undefined.
use core::fmt;

/// A timed wait expired before the wake condition held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutError;

impl fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("timed out")
    }
}

/// Returned by [`System::spawn`](crate::System::spawn).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnError {
    /// The scheduler has already started.
    BadContext,
    /// The priority is outside `0..PRIORITIES`.
    BadParam,
    /// The thread record is already registered.
    BadObjectState,
}

/// An ISR-side put found the queue full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFullError;

/// An ISR-side get found the queue empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueEmptyError;
