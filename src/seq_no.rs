use std::fmt::{Display, Formatter};

/// A 31-bit packet sequence number. Sequence numbers wrap around, so comparisons are only
///  meaningful for numbers that are less than half the number space apart.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct SeqNo(i32);

impl Display for SeqNo {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SeqNo {
    pub const ZERO: SeqNo = SeqNo(0);
    pub const MAX_RAW: i32 = 0x7FFF_FFFF;

    /// distance below which two sequence numbers are compared without wrap-around
    const THRESHOLD: i32 = 0x3FFF_FFFF;

    pub fn from_raw(value: i32) -> SeqNo {
        SeqNo(value & Self::MAX_RAW)
    }

    pub fn to_raw(&self) -> i32 {
        self.0
    }

    /// Positive if `self` is newer than `other`, negative if it is older, zero if both are equal.
    pub fn seq_cmp(&self, other: SeqNo) -> i32 {
        if (self.0 - other.0).abs() < Self::THRESHOLD {
            self.0 - other.0
        }
        else {
            other.0 - self.0
        }
    }

    /// number of sequence numbers in the inclusive range `self ..= other`
    pub fn seq_len(&self, other: SeqNo) -> i64 {
        let (a, b) = (self.0 as i64, other.0 as i64);
        if a <= b {
            b - a + 1
        }
        else {
            b - a + Self::MAX_RAW as i64 + 2
        }
    }

    /// signed number of steps from `self` to `other`
    pub fn seq_off(&self, other: SeqNo) -> i32 {
        if (self.0 - other.0).abs() < Self::THRESHOLD {
            other.0 - self.0
        }
        else if self.0 < other.0 {
            other.0 - self.0 - Self::MAX_RAW - 1
        }
        else {
            other.0 - self.0 + Self::MAX_RAW + 1
        }
    }

    pub fn incr(&self) -> SeqNo {
        if self.0 == Self::MAX_RAW {
            SeqNo::ZERO
        }
        else {
            SeqNo(self.0 + 1)
        }
    }

    pub fn decr(&self) -> SeqNo {
        if self.0 == 0 {
            SeqNo(Self::MAX_RAW)
        }
        else {
            SeqNo(self.0 - 1)
        }
    }
}

/// A 29-bit message number. Zero is reserved, so numbering starts at 1 and skips zero when
///  wrapping around.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct MsgNo(u32);

impl Display for MsgNo {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl MsgNo {
    pub const FIRST: MsgNo = MsgNo(1);
    pub const MASK: u32 = 0x1FFF_FFFF;

    pub fn from_raw(value: u32) -> MsgNo {
        MsgNo(value & Self::MASK)
    }

    pub fn to_raw(&self) -> u32 {
        self.0
    }

    pub fn incr(&self) -> MsgNo {
        let next = self.0 + 1;
        if next >= Self::MASK {
            MsgNo::FIRST
        }
        else {
            MsgNo(next)
        }
    }
}
