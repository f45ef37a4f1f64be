//! Card transmission protocols

use core::fmt;
use core::ops::{BitAnd, BitOr, BitOrAssign};

/// A card transmission protocol this stack can operate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
pub enum Protocol {
    /// Character oriented half-duplex protocol
    #[display("T=0")]
    T0,
    /// Block oriented half-duplex protocol
    #[display("T=1")]
    T1,
}

impl Protocol {
    /// Map an ISO/IEC 7816-3 protocol number to a known protocol
    ///
    /// Reserved and global numbers (T=2..T=15) yield `None`.
    pub const fn from_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(Self::T0),
            1 => Some(Self::T1),
            _ => None,
        }
    }

    /// The ISO/IEC 7816-3 protocol number
    pub const fn id(self) -> u8 {
        match self {
            Self::T0 => 0,
            Self::T1 => 1,
        }
    }
}

/// A set of protocols, as advertised by a card or a reader
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Protocols(u8);

impl Protocols {
    /// No protocol at all
    pub const NONE: Self = Self(0);
    /// T=0 only
    pub const T0: Self = Self(0x01);
    /// T=1 only
    pub const T1: Self = Self(0x02);
    /// T=0 and T=1
    pub const ALL: Self = Self(0x03);

    /// Build a set from the reader descriptor bit mask (bit 0: T=0, bit 1: T=1)
    pub const fn from_bits_truncate(bits: u32) -> Self {
        Self((bits & 0x03) as u8)
    }

    /// Raw bit mask
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Whether `protocol` is part of the set
    pub const fn contains(self, protocol: Protocol) -> bool {
        self.0 & Self::of(protocol).0 != 0
    }

    const fn of(protocol: Protocol) -> Self {
        match protocol {
            Protocol::T0 => Self::T0,
            Protocol::T1 => Self::T1,
        }
    }

    /// Whether the set is empty
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Iterate the protocols in ascending protocol number order
    pub fn iter(self) -> impl Iterator<Item = Protocol> {
        [Protocol::T0, Protocol::T1]
            .into_iter()
            .filter(move |p| self.contains(*p))
    }
}

impl From<Protocol> for Protocols {
    fn from(protocol: Protocol) -> Self {
        Self::of(protocol)
    }
}

impl BitOr for Protocols {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for Protocols {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Protocols {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl fmt::Debug for Protocols {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl fmt::Display for Protocols {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "none");
        }
        let mut first = true;
        for protocol in self.iter() {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "{protocol}")?;
            first = false;
        }
        Ok(())
    }
}
