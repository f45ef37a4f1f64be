//! Reader capabilities and driver configuration

use std::fmt;
use std::time::Duration;

use crate::protocol::Protocols;

/// Feature flags a reader advertises in its class descriptor
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ReaderFeatures(u32);

impl ReaderFeatures {
    /// No automatic behavior
    pub const NONE: Self = Self(0);
    /// Parameters are configured from the ATR automatically
    pub const AUTO_PARAM_ATR: Self = Self(0x0000_0002);
    /// The card is activated on insertion
    pub const AUTO_ICC_ACTIVATE: Self = Self(0x0000_0004);
    /// Voltage is selected automatically
    pub const AUTO_ICC_VOLTAGE: Self = Self(0x0000_0008);
    /// Clock frequency is changed automatically
    pub const AUTO_ICC_CLOCK: Self = Self(0x0000_0010);
    /// Baud rate is changed automatically from Fi/Di
    pub const AUTO_BAUD: Self = Self(0x0000_0020);
    /// Parameters are negotiated automatically
    pub const AUTO_PARAM_NEG: Self = Self(0x0000_0040);
    /// PPS is performed automatically
    pub const AUTO_PPS: Self = Self(0x0000_0080);
    /// The clock can be stopped
    pub const CLOCK_STOP: Self = Self(0x0000_0100);
    /// A non-zero NAD is accepted
    pub const NAD_NOT_ZERO: Self = Self(0x0000_0200);
    /// The IFSD exchange is performed automatically
    pub const AUTO_IFSD: Self = Self(0x0000_0400);
    /// TPDU level exchanges
    pub const TPDU: Self = Self(0x0001_0000);
    /// Short APDU level exchanges
    pub const SHORT_APDU: Self = Self(0x0002_0000);
    /// Short and extended APDU level exchanges
    pub const EXTENDED_APDU: Self = Self(0x0004_0000);

    const EXCHANGE_MASK: u32 = 0x0007_0000;

    /// Create from the raw descriptor value
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Raw descriptor value
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Whether every flag of `other` is set
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether any flag of `other` is set
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Combine two flag sets
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Exchange level the reader works at
    pub const fn exchange_level(self) -> ExchangeLevel {
        match self.0 & Self::EXCHANGE_MASK {
            0x0001_0000 => ExchangeLevel::Tpdu,
            0x0002_0000 => ExchangeLevel::ShortApdu,
            0x0004_0000 => ExchangeLevel::ExtendedApdu,
            _ => ExchangeLevel::Character,
        }
    }
}

impl std::ops::BitOr for ReaderFeatures {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl fmt::Debug for ReaderFeatures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReaderFeatures({:#010x})", self.0)
    }
}

/// Level at which the reader exchanges data with the card
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum ExchangeLevel {
    /// Individual characters
    #[display("character")]
    Character,
    /// T=0/T=1 transport units, framing is done by the host
    #[display("TPDU")]
    Tpdu,
    /// Short APDUs, framing is done by the reader
    #[display("short APDU")]
    ShortApdu,
    /// Short and extended APDUs, framing is done by the reader
    #[display("extended APDU")]
    ExtendedApdu,
}

/// What the reader hardware can do
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderCapabilities {
    /// Protocols the reader supports
    pub protocols: Protocols,
    /// Automatic behaviors and exchange level
    pub features: ReaderFeatures,
    /// Largest IFSD the reader accepts
    pub max_ifsd: u8,
    /// Number of card slots
    pub slots: u8,
}

impl Default for ReaderCapabilities {
    fn default() -> Self {
        Self {
            protocols: Protocols::ALL,
            features: ReaderFeatures::TPDU,
            max_ifsd: 254,
            slots: 1,
        }
    }
}

impl ReaderCapabilities {
    /// Set the supported protocols
    pub const fn with_protocols(mut self, protocols: Protocols) -> Self {
        self.protocols = protocols;
        self
    }

    /// Set the feature flags
    pub const fn with_features(mut self, features: ReaderFeatures) -> Self {
        self.features = features;
        self
    }

    /// Set the largest IFSD
    pub const fn with_max_ifsd(mut self, max_ifsd: u8) -> Self {
        self.max_ifsd = max_ifsd;
        self
    }

    /// Set the slot count
    pub const fn with_slots(mut self, slots: u8) -> Self {
        self.slots = slots;
        self
    }
}

/// Driver configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderConfig {
    /// Time allowed for the transport to accept a message
    pub submit_timeout: Duration,
    /// Time allowed for a reply to arrive
    pub reply_timeout: Duration,
    /// Retransmissions of a single T=1 block before resynchronizing
    pub t1_max_retries: u8,
    /// Resynchronizations before a T=1 exchange fails
    pub t1_max_resyncs: u8,
    /// Information field size the host offers to the card
    pub ifsd: u8,
    /// Pick T=1 when the card and reader both offer T=0 and T=1
    pub prefer_t1: bool,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            submit_timeout: Duration::from_secs(1),
            reply_timeout: Duration::from_secs(10),
            t1_max_retries: 3,
            t1_max_resyncs: 2,
            ifsd: 254,
            prefer_t1: true,
        }
    }
}

impl ReaderConfig {
    /// Set the submit timeout
    pub const fn with_submit_timeout(mut self, timeout: Duration) -> Self {
        self.submit_timeout = timeout;
        self
    }

    /// Set the reply timeout
    pub const fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    /// Set the T=1 retransmission bound
    pub const fn with_t1_max_retries(mut self, retries: u8) -> Self {
        self.t1_max_retries = retries;
        self
    }

    /// Set the T=1 resynchronization bound
    pub const fn with_t1_max_resyncs(mut self, resyncs: u8) -> Self {
        self.t1_max_resyncs = resyncs;
        self
    }

    /// Set the IFSD offered to the card
    pub const fn with_ifsd(mut self, ifsd: u8) -> Self {
        self.ifsd = ifsd;
        self
    }

    /// Set the protocol preference
    pub const fn with_prefer_t1(mut self, prefer_t1: bool) -> Self {
        self.prefer_t1 = prefer_t1;
        self
    }
}
