//! I/O readiness directions
//!
//! A descriptor can be armed for reading, writing, or both. The two
//! directions are tracked independently; `Interest` is the combined mask.
//! The runtime maps these bits onto the platform's readiness flags.

use core::fmt;
use core::ops::{BitOr, BitOrAssign};

/// One readiness direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Read,
    Write,
}

impl Direction {
    /// Both directions, read first
    pub const ALL: [Direction; 2] = [Direction::Read, Direction::Write];

    /// The direction as a single-bit mask
    #[inline]
    pub const fn interest(self) -> Interest {
        match self {
            Direction::Read => Interest::READ,
            Direction::Write => Interest::WRITE,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Read => f.write_str("READ"),
            Direction::Write => f.write_str("WRITE"),
        }
    }
}

/// Set of armed directions
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Interest(u8);

impl Interest {
    pub const NONE: Interest = Interest(0);
    pub const READ: Interest = Interest(0b01);
    pub const WRITE: Interest = Interest(0b10);
    pub const BOTH: Interest = Interest(0b11);

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn contains(self, dir: Direction) -> bool {
        self.0 & dir.interest().0 != 0
    }

    /// Mask with `dir` added
    #[inline]
    pub const fn with(self, dir: Direction) -> Interest {
        Interest(self.0 | dir.interest().0)
    }

    /// Mask with `dir` removed
    #[inline]
    pub const fn without(self, dir: Direction) -> Interest {
        Interest(self.0 & !dir.interest().0)
    }

    /// Bits present in both masks
    #[inline]
    pub const fn intersect(self, other: Interest) -> Interest {
        Interest(self.0 & other.0)
    }

    /// Bits of `self` not present in `other`
    #[inline]
    pub const fn difference(self, other: Interest) -> Interest {
        Interest(self.0 & !other.0)
    }

    /// Armed directions, read first
    pub fn directions(self) -> impl Iterator<Item = Direction> {
        Direction::ALL.into_iter().filter(move |d| self.contains(*d))
    }
}

impl From<Direction> for Interest {
    #[inline]
    fn from(dir: Direction) -> Self {
        dir.interest()
    }
}

impl BitOr for Interest {
    type Output = Interest;

    #[inline]
    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

impl BitOrAssign for Interest {
    #[inline]
    fn bitor_assign(&mut self, rhs: Interest) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Interest({})", self)
    }
}

impl fmt::Display for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.contains(Direction::Read), self.contains(Direction::Write)) {
            (false, false) => f.write_str("NONE"),
            (true, false) => f.write_str("READ"),
            (false, true) => f.write_str("WRITE"),
            (true, true) => f.write_str("READ|WRITE"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directions_are_independent() {
        let mask = Interest::NONE.with(Direction::Read);
        assert!(mask.contains(Direction::Read));
        assert!(!mask.contains(Direction::Write));

        let both = mask.with(Direction::Write);
        assert_eq!(both, Interest::BOTH);
        assert_eq!(both.without(Direction::Read), Interest::WRITE);
        assert!(both.without(Direction::Read).without(Direction::Write).is_empty());
    }

    #[test]
    fn test_set_ops() {
        assert_eq!(Interest::BOTH.intersect(Interest::WRITE), Interest::WRITE);
        assert_eq!(Interest::BOTH.difference(Interest::WRITE), Interest::READ);
        assert_eq!(Interest::READ | Interest::WRITE, Interest::BOTH);

        let dirs: Vec<_> = Interest::BOTH.directions().collect();
        assert_eq!(dirs, vec![Direction::Read, Direction::Write]);
        assert_eq!(Interest::NONE.directions().count(), 0);
    }

    #[test]
    fn test_display() {
        assert_eq!(Interest::BOTH.to_string(), "READ|WRITE");
        assert_eq!(Interest::NONE.to_string(), "NONE");
        assert_eq!(Direction::Write.to_string(), "WRITE");
    }
}
