//! A one-word bitmap tracking which priority levels have ready threads.
//!
//! Bit `i` set means level `i` is non-empty. The lowest set bit is the
//! highest priority, so "find highest" is a single count-trailing-zeros
//! instruction on every target this kernel fits on.

/// Bit set over the priority levels `0..usize::BITS`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct PrioBitmap(usize);

impl PrioBitmap {
    pub(crate) const EMPTY: Self = Self(0);

    #[inline]
    pub(crate) fn set(&mut self, level: usize) {
        debug_assert!(level < usize::BITS as usize);
        self.0 |= 1 << level;
    }

    #[inline]
    pub(crate) fn clear(&mut self, level: usize) {
        debug_assert!(level < usize::BITS as usize);
        self.0 &= !(1 << level);
    }

    /// Find the lowest set bit (the highest non-empty priority).
    #[inline]
    pub(crate) fn find_set(self) -> Option<usize> {
        if self.0 == 0 {
            None
        } else {
            Some(self.0.trailing_zeros() as usize)
        }
    }
}

impl crate::utils::Init for PrioBitmap {
    const INIT: Self = Self::EMPTY;
}
