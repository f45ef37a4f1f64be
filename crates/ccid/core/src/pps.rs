//! Protocol and Parameters Selection (ISO/IEC 7816-3 clause 9)
//!
//! A PPS request is `PPSS PPS0 [PPS1] [PPS2] [PPS3] PCK` where PPSS is 0xFF, the
//! low nibble of PPS0 names the protocol and bits 5 to 7 flag the optional
//! parameter bytes. The card answers with the same structure, echoing the
//! parameters it accepts and omitting those it does not.

use thiserror::Error;
use tracing::debug;

use crate::atr::{DEFAULT_DI_INDEX, DEFAULT_FI_INDEX};
use crate::protocol::Protocol;

/// Initial byte of every PPS message
pub const PPSS: u8 = 0xFF;

const PPS0_PPS1: u8 = 0x10;
const PPS0_PPS2: u8 = 0x20;
const PPS0_PPS3: u8 = 0x40;

/// Errors raised while validating a PPS exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PpsError {
    /// The response length does not match the bytes PPS0 announces
    #[error("PPS response length {actual} does not match expected {expected}")]
    Length {
        /// Length announced by PPS0
        expected: usize,
        /// Length received
        actual: usize,
    },

    /// The response does not start with PPSS
    #[error("invalid PPSS {0:#04x}")]
    InvalidPpss(u8),

    /// The card answered for a different protocol
    #[error("PPS protocol mismatch: requested T={requested}, card answered T={answered}")]
    ProtocolMismatch {
        /// Protocol number requested
        requested: u8,
        /// Protocol number answered
        answered: u8,
    },

    /// The card echoed a parameter byte with a different value
    #[error("PPS{index} mismatch: requested {requested:#04x}, card answered {answered:#04x}")]
    ParameterMismatch {
        /// Parameter byte index (1 to 3)
        index: u8,
        /// Requested value
        requested: u8,
        /// Answered value
        answered: u8,
    },

    /// The card answered a parameter byte that was not requested
    #[error("PPS{0} present in response but not requested")]
    UnexpectedParameter(u8),

    /// PCK does not XOR the message to zero
    #[error("PPS checksum mismatch")]
    Checksum,
}

/// PPS request the host sends to the card
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PpsRequest {
    protocol: Protocol,
    fi_di: Option<u8>,
}

impl PpsRequest {
    /// Request `protocol`, optionally proposing a Fi/Di byte (Fi index high nibble)
    pub const fn new(protocol: Protocol, fi_di: Option<u8>) -> Self {
        Self { protocol, fi_di }
    }

    /// Requested protocol
    pub const fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Proposed Fi/Di byte
    pub const fn fi_di(&self) -> Option<u8> {
        self.fi_di
    }

    /// Encode the request including PCK
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut pps0 = self.protocol.id();
        if self.fi_di.is_some() {
            pps0 |= PPS0_PPS1;
        }
        let mut out = Vec::with_capacity(4);
        out.push(PPSS);
        out.push(pps0);
        out.extend(self.fi_di);
        out.push(out.iter().fold(0, |acc, b| acc ^ b));
        out
    }
}

/// PPS response decoded from the card
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PpsResponse {
    /// Protocol number from PPS0
    pub protocol: u8,
    /// PPS1 if present
    pub pps1: Option<u8>,
    /// PPS2 if present
    pub pps2: Option<u8>,
    /// PPS3 if present
    pub pps3: Option<u8>,
}

impl PpsResponse {
    /// Decode and structurally validate a PPS response
    pub fn parse(bytes: &[u8]) -> Result<Self, PpsError> {
        if bytes.len() < 3 {
            return Err(PpsError::Length {
                expected: 3,
                actual: bytes.len(),
            });
        }
        if bytes[0] != PPSS {
            return Err(PpsError::InvalidPpss(bytes[0]));
        }
        let pps0 = bytes[1];
        let optional = [PPS0_PPS1, PPS0_PPS2, PPS0_PPS3]
            .iter()
            .filter(|flag| pps0 & **flag != 0)
            .count();
        let expected = 3 + optional;
        if bytes.len() != expected {
            return Err(PpsError::Length {
                expected,
                actual: bytes.len(),
            });
        }
        if bytes.iter().fold(0, |acc, b| acc ^ b) != 0 {
            return Err(PpsError::Checksum);
        }

        let mut rest = bytes[2..bytes.len() - 1].iter().copied();
        let mut take = |flag: u8| if pps0 & flag != 0 { rest.next() } else { None };
        let pps1 = take(PPS0_PPS1);
        let pps2 = take(PPS0_PPS2);
        let pps3 = take(PPS0_PPS3);

        Ok(Self {
            protocol: pps0 & 0x0F,
            pps1,
            pps2,
            pps3,
        })
    }
}

/// Result of a successful PPS exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PpsOutcome {
    /// Protocol in effect after the exchange
    pub protocol: Protocol,
    /// Fi/Di byte in effect after the exchange
    pub fi_di: u8,
    /// Whether the card accepted the proposed Fi/Di
    pub fi_di_accepted: bool,
}

/// Default Fi/Di byte in effect when PPS1 is absent
pub const DEFAULT_FI_DI: u8 = (DEFAULT_FI_INDEX << 4) | DEFAULT_DI_INDEX;

/// Validate a card response against the request that caused it
///
/// A card that omits PPS1, or answers it with the default Fi/Di, keeps the
/// default rates; that is a successful exchange in which the proposal was
/// declined.
pub fn validate(request: &PpsRequest, response: &[u8]) -> Result<PpsOutcome, PpsError> {
    let response = PpsResponse::parse(response)?;

    let requested = request.protocol.id();
    if response.protocol != requested {
        return Err(PpsError::ProtocolMismatch {
            requested,
            answered: response.protocol,
        });
    }

    let fi_di = match (request.fi_di, response.pps1) {
        (Some(req), Some(ans)) if req == ans => Some(ans),
        (Some(_), Some(DEFAULT_FI_DI)) => None,
        (Some(req), Some(ans)) => {
            return Err(PpsError::ParameterMismatch {
                index: 1,
                requested: req,
                answered: ans,
            });
        }
        (None, Some(_)) => return Err(PpsError::UnexpectedParameter(1)),
        (_, None) => None,
    };
    if response.pps2.is_some() {
        return Err(PpsError::UnexpectedParameter(2));
    }
    if response.pps3.is_some() {
        return Err(PpsError::UnexpectedParameter(3));
    }

    if request.fi_di.is_some() && fi_di.is_none() {
        debug!("Card declined proposed Fi/Di, keeping default rates");
    }

    Ok(PpsOutcome {
        protocol: request.protocol,
        fi_di: fi_di.unwrap_or(DEFAULT_FI_DI),
        fi_di_accepted: fi_di.is_some(),
    })
}
