//! `SeqNum`: the fabric's logical clock.
//!
//! The wire format fixes this to a big-endian `float64`. Internally we
//! wrap `ordered_float::OrderedFloat<f64>` so sessions, pending-delivery
//! queues and the critic get real `Ord`/`BTreeMap` support instead of
//! hand-rolled float comparison; the wrapper is transparent so encoding
//! round-trips bit-exactly.

use ordered_float::OrderedFloat;
use std::fmt;
use std::ops::Add;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SeqNum(OrderedFloat<f64>);

/// The starting frontier of every entity.
pub const FIRST_SEQ_NUM: SeqNum = SeqNum(OrderedFloat(0.0));

impl SeqNum {
    pub const fn new(value: f64) -> SeqNum {
        SeqNum(OrderedFloat(value))
    }

    pub fn value(self) -> f64 {
        self.0.into_inner()
    }

    pub fn max(self, other: SeqNum) -> SeqNum {
        if self >= other {
            self
        } else {
            other
        }
    }

    pub fn min(self, other: SeqNum) -> SeqNum {
        if self <= other {
            self
        } else {
            other
        }
    }
}

impl From<f64> for SeqNum {
    fn from(value: f64) -> SeqNum {
        SeqNum::new(value)
    }
}

impl Add<f64> for SeqNum {
    type Output = SeqNum;

    fn add(self, rhs: f64) -> SeqNum {
        SeqNum::new(self.value() + rhs)
    }
}

impl fmt::Display for SeqNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_matches_float_ordering() {
        assert!(SeqNum::new(1.0) < SeqNum::new(2.0));
        assert!(SeqNum::new(-1.0) < FIRST_SEQ_NUM);
        assert_eq!(SeqNum::new(3.0).max(SeqNum::new(5.0)), SeqNum::new(5.0));
        assert_eq!(SeqNum::new(3.0).min(SeqNum::new(5.0)), SeqNum::new(3.0));
    }

    #[test]
    fn round_trips_through_bits() {
        let s = SeqNum::new(12345.6789);
        let bits = s.value().to_bits();
        let back = SeqNum::new(f64::from_bits(bits));
        assert_eq!(s, back);
    }
}
