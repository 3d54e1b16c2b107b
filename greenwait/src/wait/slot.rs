//! Interest-set slots carrying a descriptor number and a ready flag.
//!
//! Each slot stores the raw OS descriptor in its low 31 bits and uses the
//! highest-order bit as the "ready" flag, so the dispatcher can report
//! readiness back without a parallel boolean array.

use std::fmt;
use std::os::fd::RawFd;

/// The reserved bit marking a slot as ready.
pub const READY_BIT: u32 = 1 << 31;

/// Mask selecting the raw descriptor portion of a slot.
pub const FD_MASK: u32 = !READY_BIT;

/// One entry of a read, write or except interest set.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FdSlot(u32);

impl FdSlot {
    /// Creates a slot for `fd` with the ready flag cleared.
    ///
    /// # Panics
    ///
    /// Panics if `fd` is negative.
    pub fn new(fd: RawFd) -> Self {
        assert!(fd >= 0, "greenwait: negative file descriptor {fd}");
        Self(fd as u32)
    }

    /// The raw descriptor with the ready flag masked off.
    pub fn fd(self) -> RawFd {
        (self.0 & FD_MASK) as RawFd
    }

    pub fn is_ready(self) -> bool {
        self.0 & READY_BIT != 0
    }

    /// The encoded slot, ready flag included.
    pub fn bits(self) -> u32 {
        self.0
    }

    pub(crate) fn mark_ready(&mut self) {
        self.0 |= READY_BIT;
    }

    pub(crate) fn clear_ready(&mut self) {
        self.0 &= FD_MASK;
    }
}

impl fmt::Debug for FdSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FdSlot")
            .field("fd", &self.fd())
            .field("ready", &self.is_ready())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_slot_is_not_ready() {
        let slot = FdSlot::new(7);
        assert_eq!(slot.fd(), 7);
        assert!(!slot.is_ready());
        assert_eq!(slot.bits(), 7);
    }

    #[test]
    fn ready_flag_does_not_touch_descriptor() {
        let mut slot = FdSlot::new(0x7fff_fffe);
        slot.mark_ready();
        assert!(slot.is_ready());
        assert_eq!(slot.fd(), 0x7fff_fffe);
        assert_eq!(slot.bits(), 0xffff_fffe);

        slot.mark_ready();
        assert_eq!(slot.bits(), 0xffff_fffe);

        slot.clear_ready();
        assert!(!slot.is_ready());
        assert_eq!(slot.fd(), 0x7fff_fffe);
    }

    #[test]
    fn high_descriptor_bits_are_not_readiness() {
        // Every descriptor bit set, ready bit clear.
        let slot = FdSlot::new(i32::MAX);
        assert!(!slot.is_ready());
    }

    #[test]
    #[should_panic(expected = "negative file descriptor")]
    fn negative_descriptor_panics() {
        FdSlot::new(-1);
    }
}
