//! T=1 block framing
//!
//! A block is `NAD PCB LEN INF... LRC`. The two high bits of PCB select the kind:
//! `0x` information, `10` receive-ready, `11` supervisory.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Prologue length (NAD, PCB, LEN)
pub const PROLOGUE_LEN: usize = 3;

/// Node address used for every block
pub const NAD: u8 = 0x00;

const PCB_I_SEQ: u8 = 0x40;
const PCB_I_MORE: u8 = 0x20;
const PCB_R: u8 = 0x80;
const PCB_R_SEQ: u8 = 0x10;
const PCB_S: u8 = 0xC0;
const PCB_S_RESPONSE: u8 = 0x20;

/// Framing errors of a received block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BlockError {
    /// Fewer bytes than prologue plus epilogue
    #[error("block of {0} bytes is too short")]
    Short(usize),

    /// LEN does not match the bytes received
    #[error("block declares {declared} information bytes but carries {actual}")]
    Length {
        /// LEN value
        declared: usize,
        /// Information bytes present
        actual: usize,
    },

    /// LRC mismatch
    #[error("block checksum mismatch")]
    Checksum,

    /// PCB value with no meaning
    #[error("invalid PCB {0:#04x}")]
    Pcb(u8),
}

/// Error status carried by an R-block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RStatus {
    /// Error free acknowledgement
    Ok,
    /// EDC or parity error
    Parity,
    /// Other error
    Other,
}

/// Supervisory function
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum SKind {
    /// Resynchronization
    #[display("RESYNCH")]
    Resync,
    /// Information field size
    #[display("IFS")]
    Ifs,
    /// Chain abort
    #[display("ABORT")]
    Abort,
    /// Waiting time extension
    #[display("WTX")]
    Wtx,
}

impl SKind {
    const fn bits(self) -> u8 {
        match self {
            Self::Resync => 0,
            Self::Ifs => 1,
            Self::Abort => 2,
            Self::Wtx => 3,
        }
    }
}

/// A T=1 block
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Block {
    /// Information block
    Information {
        /// N(S)
        seq: u8,
        /// More data follows
        more: bool,
        /// Information field
        data: Bytes,
    },
    /// Receive-ready block
    ReceiveReady {
        /// N(R), the sequence number expected next
        seq: u8,
        /// Error status
        status: RStatus,
    },
    /// Supervisory block
    Supervisory {
        /// Function
        kind: SKind,
        /// Whether this is the response half of the exchange
        response: bool,
        /// Information field (IFS value or WTX multiplier)
        data: Bytes,
    },
}

impl Block {
    /// I-block
    pub fn information(seq: u8, more: bool, data: impl Into<Bytes>) -> Self {
        Self::Information {
            seq: seq & 1,
            more,
            data: data.into(),
        }
    }

    /// R-block
    pub const fn receive_ready(seq: u8, status: RStatus) -> Self {
        Self::ReceiveReady {
            seq: seq & 1,
            status,
        }
    }

    /// S-block request
    pub fn request(kind: SKind, data: &[u8]) -> Self {
        Self::Supervisory {
            kind,
            response: false,
            data: Bytes::copy_from_slice(data),
        }
    }

    /// S-block response
    pub fn response(kind: SKind, data: &[u8]) -> Self {
        Self::Supervisory {
            kind,
            response: true,
            data: Bytes::copy_from_slice(data),
        }
    }

    /// Protocol control byte
    pub fn pcb(&self) -> u8 {
        match self {
            Self::Information { seq, more, .. } => {
                let mut pcb = 0;
                if *seq != 0 {
                    pcb |= PCB_I_SEQ;
                }
                if *more {
                    pcb |= PCB_I_MORE;
                }
                pcb
            }
            Self::ReceiveReady { seq, status } => {
                let mut pcb = PCB_R;
                if *seq != 0 {
                    pcb |= PCB_R_SEQ;
                }
                pcb | match status {
                    RStatus::Ok => 0,
                    RStatus::Parity => 1,
                    RStatus::Other => 2,
                }
            }
            Self::Supervisory { kind, response, .. } => {
                let mut pcb = PCB_S | kind.bits();
                if *response {
                    pcb |= PCB_S_RESPONSE;
                }
                pcb
            }
        }
    }

    fn information_field(&self) -> &[u8] {
        match self {
            Self::Information { data, .. } | Self::Supervisory { data, .. } => data,
            Self::ReceiveReady { .. } => &[],
        }
    }

    /// Encode with NAD 0 and LRC
    pub fn encode(&self) -> Bytes {
        let inf = self.information_field();
        let mut out = BytesMut::with_capacity(PROLOGUE_LEN + inf.len() + 1);
        out.put_u8(NAD);
        out.put_u8(self.pcb());
        out.put_u8(inf.len() as u8);
        out.put_slice(inf);
        out.put_u8(lrc(&out));
        out.freeze()
    }

    /// Decode and verify a block
    pub fn decode(bytes: &[u8]) -> Result<Self, BlockError> {
        if bytes.len() < PROLOGUE_LEN + 1 {
            return Err(BlockError::Short(bytes.len()));
        }
        let declared = bytes[2] as usize;
        let actual = bytes.len() - PROLOGUE_LEN - 1;
        if declared != actual {
            return Err(BlockError::Length { declared, actual });
        }
        if lrc(bytes) != 0 {
            return Err(BlockError::Checksum);
        }

        let pcb = bytes[1];
        let data = &bytes[PROLOGUE_LEN..PROLOGUE_LEN + declared];
        match pcb & 0xC0 {
            0x00 | 0x40 => Ok(Self::Information {
                seq: u8::from(pcb & PCB_I_SEQ != 0),
                more: pcb & PCB_I_MORE != 0,
                data: Bytes::copy_from_slice(data),
            }),
            PCB_R => {
                let status = match pcb & 0x0F {
                    0 => RStatus::Ok,
                    1 => RStatus::Parity,
                    2 => RStatus::Other,
                    _ => return Err(BlockError::Pcb(pcb)),
                };
                Ok(Self::ReceiveReady {
                    seq: u8::from(pcb & PCB_R_SEQ != 0),
                    status,
                })
            }
            _ => {
                let kind = match pcb & 0x1F {
                    0 => SKind::Resync,
                    1 => SKind::Ifs,
                    2 => SKind::Abort,
                    3 => SKind::Wtx,
                    _ => return Err(BlockError::Pcb(pcb)),
                };
                Ok(Self::Supervisory {
                    kind,
                    response: pcb & PCB_S_RESPONSE != 0,
                    data: Bytes::copy_from_slice(data),
                })
            }
        }
    }
}

/// Longitudinal redundancy check
pub fn lrc(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |acc, b| acc ^ b)
}
