//! Sequence numbers
//!
//! Sequence numbers are 16 bits wide and compared in circular signed
//! difference, so freshness survives wraparound. After `0xFFFF` the
//! counter continues at `0x0100`; `0x0000..=0x00FF` are never produced by
//! incrementing and stand for "unknown".

use serde::{Deserialize, Serialize};
use std::fmt;

/// A 16-bit DYMO sequence number
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct SeqNum(u16);

impl SeqNum {
    /// Unknown/unset sequence number
    pub const UNKNOWN: SeqNum = SeqNum(0);

    /// Initial own sequence number of a node (and its value after loss)
    pub const INITIAL: SeqNum = SeqNum(1);

    /// Value the counter continues at after `0xFFFF`
    pub const WRAP_TO: SeqNum = SeqNum(0x0100);

    pub const fn new(value: u16) -> Self {
        SeqNum(value)
    }

    pub const fn value(self) -> u16 {
        self.0
    }

    /// Whether this is the unknown marker (zero)
    pub const fn is_unknown(self) -> bool {
        self.0 == 0
    }

    /// Next sequence number, skipping the reserved low range on wraparound
    pub const fn next(self) -> SeqNum {
        if self.0 == 0xFFFF {
            Self::WRAP_TO
        } else {
            SeqNum(self.0 + 1)
        }
    }

    /// Advance in place
    pub fn increment(&mut self) {
        *self = self.next();
    }

    /// True exactly when `self` is strictly ahead of `reference`
    ///
    /// At the antipodal point (`self - reference == 0x8000`) the signed
    /// difference is `i16::MIN` in both directions, so both report `true`.
    pub const fn is_fresher_than(self, reference: SeqNum) -> bool {
        (reference.0.wrapping_sub(self.0) as i16) < 0
    }
}

impl From<u16> for SeqNum {
    fn from(value: u16) -> Self {
        SeqNum(value)
    }
}

impl fmt::Debug for SeqNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SeqNum({:#06x})", self.0)
    }
}

impl fmt::Display for SeqNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_increment() {
        assert_eq!(SeqNum::new(0xFFFF).next(), SeqNum::new(0x0100));
        assert_eq!(SeqNum::new(1).next(), SeqNum::new(2));
        assert_eq!(SeqNum::new(0x00FF).next(), SeqNum::new(0x0100));

        let mut s = SeqNum::new(0xFFFE);
        s.increment();
        s.increment();
        assert_eq!(s, SeqNum::WRAP_TO);
    }

    #[test]
    fn test_never_fresher_than_itself() {
        for v in (0..=u16::MAX).step_by(97) {
            let s = SeqNum::new(v);
            assert!(!s.is_fresher_than(s));
        }
    }

    #[test]
    fn test_freshness_is_antisymmetric() {
        let pairs = [(1u16, 2u16), (0xFFF0, 0x0105), (100, 30000), (0x0100, 0xFFFF)];
        for (a, b) in pairs {
            let (a, b) = (SeqNum::new(a), SeqNum::new(b));
            assert_ne!(a.is_fresher_than(b), b.is_fresher_than(a));
        }
        assert!(SeqNum::new(2).is_fresher_than(SeqNum::new(1)));
        // Wraparound: 0x0105 came after 0xFFF0
        assert!(SeqNum::new(0x0105).is_fresher_than(SeqNum::new(0xFFF0)));
    }

    #[test]
    fn test_antipodal_boundary() {
        let a = SeqNum::new(0x0100);
        let b = SeqNum::new(0x8100);
        // Only exception to antisymmetry
        assert!(a.is_fresher_than(b));
        assert!(b.is_fresher_than(a));
    }
}
