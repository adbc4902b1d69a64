//! The 32-bit message number field that every data packet carries:
//!
//! ```ascii
//! bit 31:     first packet of a message
//! bit 30:     last packet of a message (both set: the message has exactly one packet)
//! bit 29:     message must be delivered in order
//! bits 28-0:  message number (see `MsgNo`)
//! ```

use bitflags::bitflags;
use crate::seq_no::MsgNo;

bitflags! {
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
    pub struct MsgFlags: u32 {
        const FIRST = 0x8000_0000;
        const LAST = 0x4000_0000;
        const IN_ORDER = 0x2000_0000;
    }
}

/// Position of a packet inside its message, with the numeric values used on the wire (bits 31-30)
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PacketBoundary {
    Middle = 0,
    Last = 1,
    First = 2,
    Solo = 3,
}

impl PacketBoundary {
    /// the packet can start a message
    pub fn is_head(&self) -> bool {
        matches!(self, PacketBoundary::First | PacketBoundary::Solo)
    }

    /// the packet can end a message
    pub fn is_tail(&self) -> bool {
        matches!(self, PacketBoundary::Last | PacketBoundary::Solo)
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default)]
pub struct MsgNoField(u32);

impl MsgNoField {
    pub fn new(msg_no: MsgNo, flags: MsgFlags) -> MsgNoField {
        MsgNoField(msg_no.to_raw() | flags.bits())
    }

    pub fn from_raw(value: u32) -> MsgNoField {
        MsgNoField(value)
    }

    pub fn to_raw(&self) -> u32 {
        self.0
    }

    pub fn msg_no(&self) -> MsgNo {
        MsgNo::from_raw(self.0)
    }

    pub fn flags(&self) -> MsgFlags {
        MsgFlags::from_bits_truncate(self.0)
    }

    pub fn with_flags(&self, flags: MsgFlags) -> MsgNoField {
        MsgNoField(self.0 | flags.bits())
    }

    pub fn boundary(&self) -> PacketBoundary {
        match self.0 >> 30 {
            0 => PacketBoundary::Middle,
            1 => PacketBoundary::Last,
            2 => PacketBoundary::First,
            _ => PacketBoundary::Solo,
        }
    }

    pub fn is_in_order(&self) -> bool {
        self.flags().contains(MsgFlags::IN_ORDER)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::middle(MsgFlags::empty(), PacketBoundary::Middle)]
    #[case::last(MsgFlags::LAST, PacketBoundary::Last)]
    #[case::first(MsgFlags::FIRST, PacketBoundary::First)]
    #[case::solo(MsgFlags::FIRST | MsgFlags::LAST, PacketBoundary::Solo)]
    #[case::solo_in_order(MsgFlags::FIRST | MsgFlags::LAST | MsgFlags::IN_ORDER, PacketBoundary::Solo)]
    fn test_boundary(#[case] flags: MsgFlags, #[case] expected: PacketBoundary) {
        let field = MsgNoField::new(MsgNo::from_raw(77), flags);
        assert_eq!(field.boundary(), expected);
        assert_eq!(field.msg_no(), MsgNo::from_raw(77));
        assert_eq!(field.boundary() as u32, field.to_raw() >> 30);
    }

    #[test]
    fn test_wire_layout() {
        let field = MsgNoField::new(MsgNo::from_raw(MsgNo::MASK - 1), MsgFlags::FIRST | MsgFlags::IN_ORDER);
        assert_eq!(field.to_raw(), 0xBFFF_FFFE);
        assert!(field.is_in_order());
        assert!(field.boundary().is_head());
        assert!(!field.boundary().is_tail());

        let field = MsgNoField::from_raw(0x4000_0005);
        assert_eq!(field.msg_no(), MsgNo::from_raw(5));
        assert!(!field.is_in_order());
        assert!(field.boundary().is_tail());
        assert_eq!(field.with_flags(MsgFlags::FIRST).boundary(), PacketBoundary::Solo);
    }
}
