//! Answer-to-Reset decoding per ISO/IEC 7816-3
//!
//! An ATR is made of the initial character TS, the format character T0, up to
//! seven groups of interface bytes (TAi, TBi, TCi, TDi), up to fifteen historical
//! bytes and, when any protocol other than T=0 is declared, a check byte TCK.
//!
//! [`AtrRecord::parse`] validates the whole buffer: every byte must be consumed
//! exactly once. Reserved protocol numbers are carried in the record and simply
//! ignored when computing the supported protocols.

pub mod tables;

use core::fmt;

use bytes::Bytes;
use thiserror::Error;

use crate::protocol::{Protocol, Protocols};
pub use tables::{DEFAULT_DI_INDEX, DEFAULT_FI_INDEX};

/// Minimum ATR length (TS and T0)
pub const ATR_LEN_MIN: usize = 2;

/// Maximum ATR length
pub const ATR_LEN_MAX: usize = 33;

/// Maximum number of interface byte groups
pub const ATR_GROUPS_MAX: usize = 7;

/// TS value announcing the direct convention
pub const TS_DIRECT: u8 = 0x3B;

/// TS value announcing the inverse convention
pub const TS_INVERSE: u8 = 0x3F;

/// Protocol number of global interface bytes
pub const PROTOCOL_GLOBAL: u8 = 15;

const MASK_TA: u8 = 0x1;
const MASK_TB: u8 = 0x2;
const MASK_TC: u8 = 0x4;
const MASK_TD: u8 = 0x8;

/// Default T=0 waiting integer
pub const DEFAULT_T0_WI: u8 = 10;

/// Default T=1 information field size for the card
pub const DEFAULT_T1_IFSC: u8 = 32;

/// Default T=1 block waiting integer
pub const DEFAULT_T1_BWI: u8 = 4;

/// Default T=1 character waiting integer
pub const DEFAULT_T1_CWI: u8 = 13;

/// Errors raised while decoding an ATR
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AtrError {
    /// Fewer than two bytes
    #[error("ATR too short")]
    TooShort,

    /// More than 33 bytes
    #[error("ATR too long")]
    TooLong,

    /// TS is neither the direct nor the inverse convention sentinel
    #[error("invalid initial character TS {0:#04x}")]
    InvalidTs(u8),

    /// TD1 declared the global protocol T=15
    #[error("TD1 may not declare T=15")]
    InvalidTd1,

    /// TD7 announced an eighth group of interface bytes
    #[error("ATR declares more than {ATR_GROUPS_MAX} interface byte groups")]
    TooManyGroups,

    /// The declared structure needs more bytes than were received
    #[error("ATR overrun: declared fields exceed the received bytes")]
    Overrun,

    /// Bytes remain after the declared structure
    #[error("ATR underrun: unexpected trailing bytes")]
    Underrun,

    /// The check byte does not XOR the ATR to zero
    #[error("ATR checksum mismatch")]
    ChecksumError,
}

/// Bit ordering and logic levels announced by TS
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
pub enum Convention {
    /// Least significant bit first, high level is one
    #[display("direct")]
    Direct,
    /// Most significant bit first, low level is one
    #[display("inverse")]
    Inverse,
}

/// Clock stop support indicated by the card
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
pub enum ClockStop {
    /// Clock stop is not supported
    #[display("not supported")]
    NotSupported,
    /// The clock may be stopped in state L
    #[display("state L")]
    Low,
    /// The clock may be stopped in state H
    #[display("state H")]
    High,
    /// The clock may be stopped in either state
    #[display("no preference")]
    NoPreference,
}

/// Error detection code used by T=1 blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
pub enum T1Checksum {
    /// Longitudinal redundancy check (one byte XOR)
    #[display("LRC")]
    Lrc,
    /// Cyclic redundancy check (two bytes)
    #[display("CRC")]
    Crc,
}

/// One group of interface bytes
///
/// The protocol of group `i` is declared by TD(i-1); the first group is nominally
/// T=0 and is where global bytes TA1, TB1 and TC1 live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InterfaceGroup {
    /// Protocol number this group applies to
    pub protocol: u8,
    /// TAi
    pub ta: Option<u8>,
    /// TBi
    pub tb: Option<u8>,
    /// TCi
    pub tc: Option<u8>,
}

impl InterfaceGroup {
    const fn presence(&self) -> u8 {
        let mut mask = 0;
        if self.ta.is_some() {
            mask |= MASK_TA;
        }
        if self.tb.is_some() {
            mask |= MASK_TB;
        }
        if self.tc.is_some() {
            mask |= MASK_TC;
        }
        mask
    }
}

/// A decoded Answer-to-Reset
///
/// Records only exist in validated form: construction goes through
/// [`AtrRecord::parse`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AtrRecord {
    convention: Convention,
    groups: Vec<InterfaceGroup>,
    historical: Bytes,
    checksum: Option<u8>,
}

/// Bounds-checked reader over the ATR bytes
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    const fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn next(&mut self) -> Result<u8, AtrError> {
        let byte = *self.buf.get(self.pos).ok_or(AtrError::Overrun)?;
        self.pos += 1;
        Ok(byte)
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], AtrError> {
        let end = self.pos.checked_add(len).ok_or(AtrError::Overrun)?;
        let slice = self.buf.get(self.pos..end).ok_or(AtrError::Overrun)?;
        self.pos = end;
        Ok(slice)
    }

    const fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

impl AtrRecord {
    /// Decode an ATR
    pub fn parse(bytes: &[u8]) -> Result<Self, AtrError> {
        if bytes.len() < ATR_LEN_MIN {
            return Err(AtrError::TooShort);
        }
        if bytes.len() > ATR_LEN_MAX {
            return Err(AtrError::TooLong);
        }

        let mut cursor = Cursor::new(bytes);
        let convention = match cursor.next()? {
            TS_DIRECT => Convention::Direct,
            TS_INVERSE => Convention::Inverse,
            ts => return Err(AtrError::InvalidTs(ts)),
        };

        let t0 = cursor.next()?;
        let nhistorical = usize::from(t0 & 0x0F);
        let mut presence = t0 >> 4;
        let mut protocol = 0;
        let mut groups = Vec::with_capacity(ATR_GROUPS_MAX);
        let mut needs_checksum = false;

        loop {
            let mut group = InterfaceGroup {
                protocol,
                ..Default::default()
            };
            if presence & MASK_TA != 0 {
                group.ta = Some(cursor.next()?);
            }
            if presence & MASK_TB != 0 {
                group.tb = Some(cursor.next()?);
            }
            if presence & MASK_TC != 0 {
                group.tc = Some(cursor.next()?);
            }
            groups.push(group);

            if presence & MASK_TD == 0 {
                break;
            }
            if groups.len() == ATR_GROUPS_MAX {
                return Err(AtrError::TooManyGroups);
            }

            let td = cursor.next()?;
            protocol = td & 0x0F;
            presence = td >> 4;
            if groups.len() == 1 && protocol == PROTOCOL_GLOBAL {
                return Err(AtrError::InvalidTd1);
            }
            if protocol != 0 {
                needs_checksum = true;
            }
        }

        let needed = nhistorical + usize::from(needs_checksum);
        let remaining = cursor.remaining();
        if remaining < needed {
            return Err(AtrError::Overrun);
        }
        if remaining > needed {
            return Err(AtrError::Underrun);
        }

        let historical = Bytes::copy_from_slice(cursor.take(nhistorical)?);
        let checksum = if needs_checksum {
            let tck = cursor.next()?;
            if bytes[1..].iter().fold(0, |acc, b| acc ^ b) != 0 {
                return Err(AtrError::ChecksumError);
            }
            Some(tck)
        } else {
            None
        };

        Ok(Self {
            convention,
            groups,
            historical,
            checksum,
        })
    }

    /// Re-encode the record into ATR bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let ts = match self.convention {
            Convention::Direct => TS_DIRECT,
            Convention::Inverse => TS_INVERSE,
        };
        let mut out = Vec::with_capacity(ATR_LEN_MAX);
        out.push(ts);

        let td_bit = |i: usize| {
            if i + 1 < self.groups.len() {
                MASK_TD
            } else {
                0
            }
        };
        let first_presence = self.groups.first().map_or(0, InterfaceGroup::presence) | td_bit(0);
        out.push((first_presence << 4) | self.historical.len() as u8);

        for (i, group) in self.groups.iter().enumerate() {
            out.extend(group.ta);
            out.extend(group.tb);
            out.extend(group.tc);
            if let Some(next) = self.groups.get(i + 1) {
                let presence = next.presence() | td_bit(i + 1);
                out.push((presence << 4) | next.protocol);
            }
        }
        out.extend_from_slice(&self.historical);
        if self.checksum.is_some() {
            let tck = out[1..].iter().fold(0, |acc, b| acc ^ b);
            out.push(tck);
        }
        out
    }

    /// Convention announced by TS
    pub const fn convention(&self) -> Convention {
        self.convention
    }

    /// Interface byte groups in ATR order
    pub fn groups(&self) -> &[InterfaceGroup] {
        &self.groups
    }

    /// Historical bytes
    pub const fn historical_bytes(&self) -> &Bytes {
        &self.historical
    }

    /// The check byte TCK, if the ATR carries one
    pub const fn checksum(&self) -> Option<u8> {
        self.checksum
    }

    fn ta(&self, group: usize) -> Option<u8> {
        self.groups.get(group).and_then(|g| g.ta)
    }

    /// First group from the third onward that applies to `protocol`
    fn specific_group(&self, protocol: u8) -> Option<&InterfaceGroup> {
        self.groups.iter().skip(2).find(|g| g.protocol == protocol)
    }

    /// Protocols the card declares
    ///
    /// A card without TD1 only speaks T=0. Otherwise every protocol declared from
    /// the second group onward counts; reserved numbers are ignored.
    pub fn supported_protocols(&self) -> Protocols {
        if self.groups.len() < 2 {
            return Protocols::T0;
        }
        self.groups[1..]
            .iter()
            .filter_map(|g| Protocol::from_id(g.protocol))
            .fold(Protocols::NONE, |acc, p| acc | p.into())
    }

    /// Whether the card is in negotiable mode (TA2 absent)
    pub fn params_negotiable(&self) -> bool {
        self.ta(1).is_none()
    }

    /// Whether TA2 says the parameters are implicitly defined rather than by TA1
    pub fn params_implicit(&self) -> bool {
        self.ta(1).is_some_and(|ta2| ta2 & 0x10 != 0)
    }

    /// The protocol the card uses right after reset
    ///
    /// In specific mode this is the protocol TA2 names; otherwise it is the first
    /// protocol TD1 declares, or T=0 without TD1. `None` when that protocol is
    /// not one this stack knows.
    pub fn default_protocol(&self) -> Option<Protocol> {
        match self.ta(1) {
            Some(ta2) => Protocol::from_id(ta2 & 0x0F),
            None => match self.groups.get(1) {
                Some(group) => Protocol::from_id(group.protocol),
                None => Some(Protocol::T0),
            },
        }
    }

    /// Fi index from TA1
    pub fn fi_index(&self) -> u8 {
        self.ta(0).map_or(DEFAULT_FI_INDEX, |ta1| ta1 >> 4)
    }

    /// Di index from TA1
    pub fn di_index(&self) -> u8 {
        self.ta(0).map_or(DEFAULT_DI_INDEX, |ta1| ta1 & 0x0F)
    }

    /// Clock rate conversion factor, `None` if the index is reserved
    pub fn fi_value(&self) -> Option<u16> {
        tables::fi_value(self.fi_index())
    }

    /// Baud rate adjustment factor, `None` if the index is reserved
    pub fn di_value(&self) -> Option<u8> {
        tables::di_value(self.di_index())
    }

    /// Maximum clock frequency in hertz, `None` if the index is reserved
    pub fn max_clock_hz(&self) -> Option<u32> {
        tables::fmax_hz(self.fi_index())
    }

    /// Extra guard time N from TC1
    pub fn extra_guard_time(&self) -> u8 {
        self.groups.first().and_then(|g| g.tc).unwrap_or(0)
    }

    /// T=0 waiting integer from TC2
    pub fn t0_wi(&self) -> u8 {
        self.groups
            .get(1)
            .filter(|g| g.protocol == 0)
            .and_then(|g| g.tc)
            .filter(|wi| *wi != 0)
            .unwrap_or(DEFAULT_T0_WI)
    }

    /// T=1 information field size for the card
    ///
    /// Values 0x00 and 0xFF are reserved and fall back to the default.
    pub fn t1_ifsc(&self) -> u8 {
        self.specific_group(1)
            .and_then(|g| g.ta)
            .filter(|ifsc| *ifsc != 0x00 && *ifsc != 0xFF)
            .unwrap_or(DEFAULT_T1_IFSC)
    }

    /// T=1 block waiting integer
    pub fn t1_bwi(&self) -> u8 {
        self.specific_group(1)
            .and_then(|g| g.tb)
            .map_or(DEFAULT_T1_BWI, |tb| tb >> 4)
    }

    /// T=1 character waiting integer
    pub fn t1_cwi(&self) -> u8 {
        self.specific_group(1)
            .and_then(|g| g.tb)
            .map_or(DEFAULT_T1_CWI, |tb| tb & 0x0F)
    }

    /// T=1 error detection code
    pub fn t1_checksum(&self) -> T1Checksum {
        match self.specific_group(1).and_then(|g| g.tc) {
            Some(tc) if tc & 0x01 != 0 => T1Checksum::Crc,
            _ => T1Checksum::Lrc,
        }
    }

    /// Clock stop indicator from the first TA for T=15
    pub fn clock_stop(&self) -> ClockStop {
        match self.specific_group(PROTOCOL_GLOBAL).and_then(|g| g.ta) {
            Some(ta) => match ta >> 6 {
                0 => ClockStop::NotSupported,
                1 => ClockStop::Low,
                2 => ClockStop::High,
                _ => ClockStop::NoPreference,
            },
            None => ClockStop::NotSupported,
        }
    }
}

impl TryFrom<&[u8]> for AtrRecord {
    type Error = AtrError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        Self::parse(bytes)
    }
}

impl fmt::Display for AtrRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "ATR: {}", hex::encode_upper(self.to_bytes()))?;
        writeln!(f, "  Convention: {}", self.convention)?;
        for (i, group) in self.groups.iter().enumerate() {
            let n = i + 1;
            writeln!(f, "  Group {n} (T={}):", group.protocol)?;
            if let Some(ta) = group.ta {
                writeln!(f, "    TA{n}: {ta:#04x}")?;
            }
            if let Some(tb) = group.tb {
                writeln!(f, "    TB{n}: {tb:#04x}")?;
            }
            if let Some(tc) = group.tc {
                writeln!(f, "    TC{n}: {tc:#04x}")?;
            }
        }
        writeln!(
            f,
            "  Historical bytes ({}): {}",
            self.historical.len(),
            hex::encode_upper(&self.historical)
        )?;
        match self.checksum {
            Some(tck) => writeln!(f, "  Checksum: {tck:#04x}")?,
            None => writeln!(f, "  Checksum: absent")?,
        }
        writeln!(f, "  Supported protocols: {}", self.supported_protocols())?;
        match self.default_protocol() {
            Some(p) => writeln!(f, "  Default protocol: {p}")?,
            None => writeln!(f, "  Default protocol: unknown")?,
        }
        writeln!(
            f,
            "  Mode: {}",
            if self.params_negotiable() {
                "negotiable"
            } else {
                "specific"
            }
        )?;
        write!(
            f,
            "  Fi/Di index: {}/{}, extra guard time: {}, clock stop: {}",
            self.fi_index(),
            self.di_index(),
            self.extra_guard_time(),
            self.clock_stop()
        )
    }
}
