//! Static and dynamic channel capabilities.
//!
//! Static [`Caps`] are fixed at init time. Dynamic [`DCaps`] change at
//! runtime and every change is announced with a CHANNEL/`UPDATE` message
//! carrying the previous bits, so observers can compute the delta.

use bitflags::bitflags;

bitflags! {
    /// Static capabilities, fixed at initialization.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Caps: u32 {
        /// Channel produces messages.
        const INPUT = 0x4;
        /// Channel accepts posts.
        const OUTPUT = 0x8;
        /// Both directions.
        const INOUT = Self::INPUT.bits() | Self::OUTPUT.bits();
        /// Pass-through wrapping another channel.
        const PROXY = 0x80_0000;
        /// Internally created subchannel, excluded from the name index.
        const CUSTOM = 0x80_0001;
    }
}

bitflags! {
    /// Dynamic capabilities.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DCaps: u32 {
        /// The channel fd wants readability polling.
        const POLLIN = 0x1;
        /// The channel fd wants writability polling.
        const POLLOUT = 0x2;
        /// Both poll bits.
        const POLLMASK = 0x3;
        /// The loop should call `process` when idle.
        const PROCESS = 0x10;
        /// Buffered work not visible through the fd; process without polling.
        const PENDING = 0x20;
        /// Channel is suspended.
        const SUSPEND = 0x40;
        /// Channel is suspended explicitly; resume from a parent skips it.
        const SUSPEND_PERMANENT = 0x80;
    }
}

impl DCaps {
    /// `true` when the loop should call `process`: the PROCESS or PENDING
    /// bit is set and the channel is not suspended.
    #[must_use]
    pub fn need_process(self) -> bool {
        if self.contains(Self::SUSPEND) {
            return false;
        }
        self.intersects(Self::PROCESS | Self::PENDING)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_implies_hidden_bit() {
        assert!(Caps::CUSTOM.bits() != Caps::PROXY.bits());
        assert!(Caps::INOUT.contains(Caps::INPUT));
        assert!(Caps::INOUT.contains(Caps::OUTPUT));
    }

    #[test]
    fn need_process_gates() {
        assert!(!DCaps::empty().need_process());
        assert!(DCaps::PROCESS.need_process());
        assert!(DCaps::PENDING.need_process());
        assert!(!(DCaps::PROCESS | DCaps::SUSPEND).need_process());
        assert!(!(DCaps::PENDING | DCaps::SUSPEND).need_process());
        assert!(!DCaps::POLLIN.need_process());
    }

    #[test]
    fn suspend_bits_are_distinct() {
        assert!(!DCaps::SUSPEND.intersects(DCaps::SUSPEND_PERMANENT));
        assert!(!DCaps::SUSPEND_PERMANENT.intersects(DCaps::POLLMASK | DCaps::PROCESS));
    }
}
