//! Reader wire format
//!
//! Every message starts with a ten byte header:
//!
//! | offset | field                                  |
//! |--------|----------------------------------------|
//! | 0      | message type                           |
//! | 1..5   | payload length, little endian          |
//! | 5      | slot index                             |
//! | 6      | sequence number                        |
//! | 7..10  | message specific bytes                 |
//!
//! Host-to-reader commands are modelled as [`Request`], reader-to-host replies as
//! [`Reply`]. Encoding and decoding happen only here.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::atr::Convention;
use crate::error::Error;
use crate::protocol::Protocol;

/// Length of the common message header
pub const HEADER_LEN: usize = 10;

/// Message type constants
pub mod msg_type {
    /// Power the card and read its ATR
    pub const ICC_POWER_ON: u8 = 0x62;
    /// Power the card off
    pub const ICC_POWER_OFF: u8 = 0x63;
    /// Query slot status
    pub const GET_SLOT_STATUS: u8 = 0x65;
    /// Exchange a block or APDU with the card
    pub const XFR_BLOCK: u8 = 0x6F;
    /// Read the protocol parameters
    pub const GET_PARAMETERS: u8 = 0x6C;
    /// Program the protocol parameters
    pub const SET_PARAMETERS: u8 = 0x61;

    /// Reply carrying card data
    pub const DATA_BLOCK: u8 = 0x80;
    /// Reply carrying slot status only
    pub const SLOT_STATUS: u8 = 0x81;
    /// Reply carrying protocol parameters
    pub const PARAMETERS: u8 = 0x82;
}

/// Errors raised while decoding a reader message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MessageError {
    /// Fewer bytes than the header
    #[error("message of {0} bytes is shorter than the header")]
    Header(usize),

    /// Fewer payload bytes than the header declares
    #[error("message declares {declared} payload bytes but carries {actual}")]
    Short {
        /// Declared payload length
        declared: usize,
        /// Payload bytes present
        actual: usize,
    },

    /// Unknown reply type
    #[error("unknown message type {0:#04x}")]
    UnknownType(u8),

    /// A parameter block that cannot be decoded
    #[error("invalid parameter block for protocol {0}")]
    InvalidParameters(u8),
}

/// Protocol parameter block exchanged with Set/GetParameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterBlock {
    /// T=0 parameters
    T0 {
        /// Fi index in the high nibble, Di index in the low nibble
        fi_di: u8,
        /// Convention
        convention: Convention,
        /// Extra guard time
        guard_time: u8,
        /// Waiting integer
        wi: u8,
        /// Clock stop policy (0 not allowed, 1 high, 2 low, 3 either)
        clock_stop: u8,
    },
    /// T=1 parameters
    T1 {
        /// Fi index in the high nibble, Di index in the low nibble
        fi_di: u8,
        /// Convention
        convention: Convention,
        /// Whether blocks use CRC instead of LRC
        crc: bool,
        /// Extra guard time
        guard_time: u8,
        /// Block waiting integer
        bwi: u8,
        /// Character waiting integer
        cwi: u8,
        /// Clock stop policy (0 not allowed, 1 high, 2 low, 3 either)
        clock_stop: u8,
        /// Information field size of the card
        ifsc: u8,
        /// Node address
        nad: u8,
    },
}

const TCCKS_INVERSE: u8 = 0x02;
const TCCKS_CRC: u8 = 0x01;
const TCCKS_T1: u8 = 0x10;

impl ParameterBlock {
    /// Protocol these parameters apply to
    pub const fn protocol(&self) -> Protocol {
        match self {
            Self::T0 { .. } => Protocol::T0,
            Self::T1 { .. } => Protocol::T1,
        }
    }

    fn encode(&self, out: &mut BytesMut) {
        let convention_bit = |c: &Convention| match c {
            Convention::Direct => 0,
            Convention::Inverse => TCCKS_INVERSE,
        };
        match self {
            Self::T0 {
                fi_di,
                convention,
                guard_time,
                wi,
                clock_stop,
            } => {
                out.put_u8(*fi_di);
                out.put_u8(convention_bit(convention));
                out.put_u8(*guard_time);
                out.put_u8(*wi);
                out.put_u8(*clock_stop);
            }
            Self::T1 {
                fi_di,
                convention,
                crc,
                guard_time,
                bwi,
                cwi,
                clock_stop,
                ifsc,
                nad,
            } => {
                out.put_u8(*fi_di);
                out.put_u8(TCCKS_T1 | convention_bit(convention) | u8::from(*crc));
                out.put_u8(*guard_time);
                out.put_u8((bwi << 4) | (cwi & 0x0F));
                out.put_u8(*clock_stop);
                out.put_u8(*ifsc);
                out.put_u8(*nad);
            }
        }
    }

    /// Decode a parameter block for the protocol number the reply names
    pub fn decode(protocol: u8, data: &[u8]) -> Result<Self, MessageError> {
        let convention = |b: u8| {
            if b & TCCKS_INVERSE != 0 {
                Convention::Inverse
            } else {
                Convention::Direct
            }
        };
        match (protocol, data) {
            (0, [fi_di, tccks, guard_time, wi, clock_stop, ..]) => Ok(Self::T0 {
                fi_di: *fi_di,
                convention: convention(*tccks),
                guard_time: *guard_time,
                wi: *wi,
                clock_stop: *clock_stop,
            }),
            (1, [fi_di, tccks, guard_time, wis, clock_stop, ifsc, nad, ..]) => Ok(Self::T1 {
                fi_di: *fi_di,
                convention: convention(*tccks),
                crc: tccks & TCCKS_CRC != 0,
                guard_time: *guard_time,
                bwi: wis >> 4,
                cwi: wis & 0x0F,
                clock_stop: *clock_stop,
                ifsc: *ifsc,
                nad: *nad,
            }),
            _ => Err(MessageError::InvalidParameters(protocol)),
        }
    }
}

/// Host-to-reader command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Power on the card with automatic voltage selection, the reply carries
    /// the ATR
    IccPowerOn,
    /// Power off the card
    IccPowerOff,
    /// Query the slot status
    GetSlotStatus,
    /// Send data to the card
    XfrBlock {
        /// Block waiting time multiplier, 0 for the default
        bwi: u8,
        /// Payload
        data: Bytes,
    },
    /// Read the current protocol parameters
    GetParameters,
    /// Program the protocol parameters
    SetParameters(ParameterBlock),
}

impl Request {
    /// Message type byte
    pub const fn message_type(&self) -> u8 {
        match self {
            Self::IccPowerOn => msg_type::ICC_POWER_ON,
            Self::IccPowerOff => msg_type::ICC_POWER_OFF,
            Self::GetSlotStatus => msg_type::GET_SLOT_STATUS,
            Self::XfrBlock { .. } => msg_type::XFR_BLOCK,
            Self::GetParameters => msg_type::GET_PARAMETERS,
            Self::SetParameters(_) => msg_type::SET_PARAMETERS,
        }
    }

    /// Short name for logging
    pub const fn name(&self) -> &'static str {
        match self {
            Self::IccPowerOn => "IccPowerOn",
            Self::IccPowerOff => "IccPowerOff",
            Self::GetSlotStatus => "GetSlotStatus",
            Self::XfrBlock { .. } => "XfrBlock",
            Self::GetParameters => "GetParameters",
            Self::SetParameters(_) => "SetParameters",
        }
    }

    /// Encode the command for `slot` with sequence number `seq`
    pub fn encode(&self, slot: u8, seq: u8) -> Bytes {
        let mut payload = BytesMut::new();
        let mut specific = [0u8; 3];
        match self {
            Self::XfrBlock { bwi, data } => {
                specific[0] = *bwi;
                payload.extend_from_slice(data);
            }
            Self::SetParameters(block) => {
                specific[0] = block.protocol().id();
                block.encode(&mut payload);
            }
            Self::IccPowerOn | Self::IccPowerOff | Self::GetSlotStatus | Self::GetParameters => {}
        }

        let mut out = BytesMut::with_capacity(HEADER_LEN + payload.len());
        out.put_u8(self.message_type());
        out.put_u32_le(payload.len() as u32);
        out.put_u8(slot);
        out.put_u8(seq);
        out.put_slice(&specific);
        out.put_slice(&payload);
        out.freeze()
    }
}

/// Presence and power state of the card as seen by the reader
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IccStatus {
    /// Card present and powered
    Active,
    /// Card present but not powered
    Inactive,
    /// No card in the slot
    Absent,
}

/// Outcome of the command as reported by the reader
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    /// Processed without error
    Processed,
    /// Failed, see the error register
    Failed,
    /// The card needs more time, another reply will follow
    TimeExtension,
}

/// Reader error register values
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum ReaderErrorCode {
    /// Command aborted by the host
    #[display("command aborted")]
    Aborted,
    /// The card did not answer
    #[display("card mute")]
    IccMute,
    /// Parity error while talking to the card
    #[display("transfer parity error")]
    XfrParityError,
    /// The card sent more bytes than expected
    #[display("transfer overrun")]
    XfrOverrun,
    /// Reader hardware error
    #[display("hardware error")]
    HardwareError,
    /// The reader rejected TS
    #[display("bad ATR TS")]
    BadAtrTs,
    /// The reader rejected TCK
    #[display("bad ATR TCK")]
    BadAtrTck,
    /// The protocol is not supported
    #[display("protocol not supported")]
    ProtocolNotSupported,
    /// The card class is not supported
    #[display("class not supported")]
    ClassNotSupported,
    /// Procedure byte conflict
    #[display("procedure byte conflict")]
    ProcedureByteConflict,
    /// The protocol is deactivated
    #[display("deactivated protocol")]
    DeactivatedProtocol,
    /// The reader is busy with an automatic sequence
    #[display("busy with auto sequence")]
    BusyWithAutoSequence,
    /// Another command is already running on the slot
    #[display("slot busy")]
    SlotBusy,
    /// The command is not supported
    #[display("command not supported")]
    NotSupported,
    /// The command field at this offset is invalid
    #[display("invalid parameter at offset {_0}")]
    InvalidParameter(u8),
    /// Any other value
    #[display("error {_0:#04x}")]
    Other(u8),
}

impl From<u8> for ReaderErrorCode {
    fn from(value: u8) -> Self {
        match value {
            0xFF => Self::Aborted,
            0xFE => Self::IccMute,
            0xFD => Self::XfrParityError,
            0xFC => Self::XfrOverrun,
            0xFB => Self::HardwareError,
            0xF8 => Self::BadAtrTs,
            0xF7 => Self::BadAtrTck,
            0xF6 => Self::ProtocolNotSupported,
            0xF5 => Self::ClassNotSupported,
            0xF4 => Self::ProcedureByteConflict,
            0xF3 => Self::DeactivatedProtocol,
            0xF2 => Self::BusyWithAutoSequence,
            0xE0 => Self::SlotBusy,
            0x00 => Self::NotSupported,
            0x01..=0x7F => Self::InvalidParameter(value),
            other => Self::Other(other),
        }
    }
}

/// Status bytes common to every reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotStatus {
    /// Card presence
    pub icc: IccStatus,
    /// Command outcome
    pub command: CommandStatus,
    /// Raw error register
    pub error: u8,
}

impl SlotStatus {
    /// Decode bStatus and bError
    pub const fn from_bytes(status: u8, error: u8) -> Self {
        let icc = match status & 0x03 {
            0 => IccStatus::Active,
            1 => IccStatus::Inactive,
            _ => IccStatus::Absent,
        };
        let command = match (status >> 6) & 0x03 {
            0 => CommandStatus::Processed,
            2 => CommandStatus::TimeExtension,
            _ => CommandStatus::Failed,
        };
        Self {
            icc,
            command,
            error,
        }
    }

    /// Encode into bStatus and bError
    pub const fn to_bytes(self) -> (u8, u8) {
        let icc = match self.icc {
            IccStatus::Active => 0,
            IccStatus::Inactive => 1,
            IccStatus::Absent => 2,
        };
        let command = match self.command {
            CommandStatus::Processed => 0,
            CommandStatus::Failed => 1,
            CommandStatus::TimeExtension => 2,
        };
        (icc | (command << 6), self.error)
    }
}

/// Reply payload by reply kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyBody {
    /// Card data (ATR after power on, card response after XfrBlock)
    DataBlock {
        /// Chaining parameter
        chain: u8,
        /// Data
        data: Bytes,
    },
    /// Slot status only
    SlotStatus {
        /// Clock status
        clock: u8,
    },
    /// Protocol parameters
    Parameters {
        /// Protocol number
        protocol: u8,
        /// Raw parameter block
        data: Bytes,
    },
}

/// Reader-to-host reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Slot index
    pub slot: u8,
    /// Sequence number echoed from the command
    pub seq: u8,
    /// Slot and command status
    pub status: SlotStatus,
    /// Payload
    pub body: ReplyBody,
}

impl Reply {
    /// Decode a reply
    pub fn decode(bytes: &[u8]) -> Result<Self, MessageError> {
        if bytes.len() < HEADER_LEN {
            return Err(MessageError::Header(bytes.len()));
        }
        let declared = u32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]) as usize;
        let payload = &bytes[HEADER_LEN..];
        if payload.len() < declared {
            return Err(MessageError::Short {
                declared,
                actual: payload.len(),
            });
        }
        let data = Bytes::copy_from_slice(&payload[..declared]);
        let status = SlotStatus::from_bytes(bytes[7], bytes[8]);
        let specific = bytes[9];

        let body = match bytes[0] {
            msg_type::DATA_BLOCK => ReplyBody::DataBlock {
                chain: specific,
                data,
            },
            msg_type::SLOT_STATUS => ReplyBody::SlotStatus { clock: specific },
            msg_type::PARAMETERS => ReplyBody::Parameters {
                protocol: specific,
                data,
            },
            other => return Err(MessageError::UnknownType(other)),
        };

        Ok(Self {
            slot: bytes[5],
            seq: bytes[6],
            status,
            body,
        })
    }

    /// Encode a reply, used by reader simulations
    pub fn encode(&self) -> Bytes {
        let (message_type, specific, data) = match &self.body {
            ReplyBody::DataBlock { chain, data } => (msg_type::DATA_BLOCK, *chain, data.clone()),
            ReplyBody::SlotStatus { clock } => (msg_type::SLOT_STATUS, *clock, Bytes::new()),
            ReplyBody::Parameters { protocol, data } => {
                (msg_type::PARAMETERS, *protocol, data.clone())
            }
        };
        let (status, error) = self.status.to_bytes();
        let mut out = BytesMut::with_capacity(HEADER_LEN + data.len());
        out.put_u8(message_type);
        out.put_u32_le(data.len() as u32);
        out.put_u8(self.slot);
        out.put_u8(self.seq);
        out.put_u8(status);
        out.put_u8(error);
        out.put_u8(specific);
        out.put_slice(&data);
        out.freeze()
    }

    /// Turn reader-reported failures into errors
    ///
    /// An absent card wins over the command status so callers see the removal.
    pub fn into_result(self) -> Result<Self, Error> {
        if self.status.icc == IccStatus::Absent {
            return Err(Error::CardAbsent);
        }
        match self.status.command {
            CommandStatus::Failed => Err(Error::Command(self.status.error.into())),
            _ => Ok(self),
        }
    }

    /// Data carried by a data block reply
    pub fn into_data(self) -> Result<Bytes, Error> {
        match self.into_result()?.body {
            ReplyBody::DataBlock { data, .. } => Ok(data),
            _ => Err(Error::message("expected a data block reply")),
        }
    }

    /// Parameter block carried by a parameters reply
    pub fn into_parameters(self) -> Result<ParameterBlock, Error> {
        match self.into_result()?.body {
            ReplyBody::Parameters { protocol, data } => {
                Ok(ParameterBlock::decode(protocol, &data)?)
            }
            _ => Err(Error::message("expected a parameters reply")),
        }
    }
}

/// Decode a command header, used by reader simulations
///
/// Returns the message type, slot, sequence number, specific bytes and payload.
pub fn decode_request_header(bytes: &[u8]) -> Result<(u8, u8, u8, [u8; 3], Bytes), MessageError> {
    if bytes.len() < HEADER_LEN {
        return Err(MessageError::Header(bytes.len()));
    }
    let declared = u32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]) as usize;
    let payload = &bytes[HEADER_LEN..];
    if payload.len() < declared {
        return Err(MessageError::Short {
            declared,
            actual: payload.len(),
        });
    }
    Ok((
        bytes[0],
        bytes[5],
        bytes[6],
        [bytes[7], bytes[8], bytes[9]],
        Bytes::copy_from_slice(&payload[..declared]),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xfr_block_encoding() {
        let request = Request::XfrBlock {
            bwi: 2,
            data: Bytes::from_static(&[0x00, 0xA4, 0x04, 0x00]),
        };
        let bytes = request.encode(1, 7);
        assert_eq!(
            bytes.as_ref(),
            &[0x6F, 0x04, 0x00, 0x00, 0x00, 0x01, 0x07, 0x02, 0x00, 0x00, 0x00, 0xA4, 0x04, 0x00]
        );
    }

    #[test]
    fn test_power_on_selects_voltage_automatically() {
        let bytes = Request::IccPowerOn.encode(0, 3);
        assert_eq!(
            bytes.as_ref(),
            &[0x62, 0x00, 0x00, 0x00, 0x00, 0x00, 0x03, 0x00, 0x00, 0x00]
        );
        assert_eq!(Request::IccPowerOn.name(), "IccPowerOn");
    }

    #[test]
    fn test_set_parameters_t1_encoding() {
        let block = ParameterBlock::T1 {
            fi_di: 0x96,
            convention: Convention::Direct,
            crc: false,
            guard_time: 0,
            bwi: 4,
            cwi: 5,
            clock_stop: 0,
            ifsc: 0xFE,
            nad: 0,
        };
        let bytes = Request::SetParameters(block).encode(0, 3);
        assert_eq!(bytes[0], msg_type::SET_PARAMETERS);
        assert_eq!(bytes[1], 7);
        assert_eq!(bytes[7], 1);
        assert_eq!(&bytes[HEADER_LEN..], &[0x96, 0x10, 0x00, 0x45, 0x00, 0xFE, 0x00]);
        assert_eq!(ParameterBlock::decode(1, &bytes[HEADER_LEN..]), Ok(block));
    }

    #[test]
    fn test_reply_decoding() {
        let raw = [0x80, 0x02, 0x00, 0x00, 0x00, 0x00, 0x05, 0x00, 0x00, 0x00, 0x90, 0x00];
        let reply = Reply::decode(&raw).unwrap();
        assert_eq!(reply.seq, 5);
        assert_eq!(reply.status.command, CommandStatus::Processed);
        assert_eq!(reply.into_data().unwrap().as_ref(), &[0x90, 0x00]);
    }

    #[test]
    fn test_short_reply() {
        let raw = [0x80, 0x04, 0x00, 0x00, 0x00, 0x00, 0x05, 0x00, 0x00, 0x00, 0x90];
        assert_eq!(
            Reply::decode(&raw),
            Err(MessageError::Short {
                declared: 4,
                actual: 1
            })
        );
        assert_eq!(Reply::decode(&raw[..4]), Err(MessageError::Header(4)));
    }

    #[test]
    fn test_failed_status() {
        let raw = [0x81, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x40, 0xFE, 0x00];
        let reply = Reply::decode(&raw).unwrap();
        assert_eq!(reply.status.command, CommandStatus::Failed);
        assert_eq!(
            reply.into_result(),
            Err(Error::Command(ReaderErrorCode::IccMute))
        );

        let absent = [0x81, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x42, 0xFE, 0x00];
        assert_eq!(
            Reply::decode(&absent).unwrap().into_result(),
            Err(Error::CardAbsent)
        );
    }

    #[test]
    fn test_time_extension_status() {
        let status = SlotStatus::from_bytes(0x80, 0x01);
        assert_eq!(status.command, CommandStatus::TimeExtension);
        assert_eq!(status.to_bytes(), (0x80, 0x01));
    }
}
