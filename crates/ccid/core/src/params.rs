//! Derivation of operating parameters from an ATR
//!
//! Negotiation runs in two phases. [`plan`] is pure: it intersects what the card
//! and reader support and decides the target protocol, the rates and whether a
//! PPS exchange or explicit parameter programming is needed. [`negotiate`] then
//! carries the plan out over a [`CommandChannel`] and reads back the parameters
//! the reader ended up with.

use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::atr::{
    AtrRecord, ClockStop, Convention, DEFAULT_DI_INDEX, DEFAULT_FI_INDEX, T1Checksum, tables,
};
use crate::config::{ReaderCapabilities, ReaderConfig, ReaderFeatures};
use crate::error::{Error, Result};
use crate::message::{ParameterBlock, Reply, Request};
use crate::pps::{self, PpsRequest};
use crate::protocol::{Protocol, Protocols};

/// Default Fi/Di indices as a pair
pub const DEFAULT_RATES: (u8, u8) = (DEFAULT_FI_INDEX, DEFAULT_DI_INDEX);

/// Reasons negotiation can fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum NegotiationError {
    /// Card and reader share no protocol
    #[error("no protocol supported by both card and reader")]
    NoCommonProtocol,

    /// The reader refused or altered the programmed parameters
    #[error("reader rejected the protocol parameters")]
    DeviceRejectedParameters,

    /// The card requires rates the reader cannot be told to use
    #[error("card requires a clock rate the reader cannot apply")]
    UnsupportedManualClockRate,

    /// The card uses CRC on T=1 blocks
    #[error("T=1 CRC checksum is not supported")]
    UnsupportedChecksum,

    /// The reader's exchange level cannot carry the negotiated protocol
    #[error("reader exchange level cannot carry {0}")]
    UnsupportedExchangeLevel(Protocol),
}

/// Protocol specific operating parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolParams {
    /// T=0
    T0 {
        /// Waiting integer
        wi: u8,
    },
    /// T=1
    T1 {
        /// Block waiting integer
        bwi: u8,
        /// Character waiting integer
        cwi: u8,
        /// Information field size of the card
        ifsc: u8,
        /// Error detection code
        checksum: T1Checksum,
    },
}

/// Parameters the slot operates with after a successful negotiation
///
/// Published as a whole; renegotiation replaces the value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperatingParameters {
    /// Active protocol
    pub protocol: Protocol,
    /// Fi index
    pub fi_index: u8,
    /// Di index
    pub di_index: u8,
    /// Extra guard time
    pub guard_time: u8,
    /// Convention
    pub convention: Convention,
    /// Clock stop policy
    pub clock_stop: ClockStop,
    /// Protocol specific fields
    pub protocol_params: ProtocolParams,
}

impl OperatingParameters {
    /// Fi/Di byte with the Fi index in the high nibble
    pub const fn fi_di(&self) -> u8 {
        (self.fi_index << 4) | (self.di_index & 0x0F)
    }

    /// T=1 information field size of the card, if T=1 is active
    pub const fn ifsc(&self) -> Option<u8> {
        match self.protocol_params {
            ProtocolParams::T1 { ifsc, .. } => Some(ifsc),
            ProtocolParams::T0 { .. } => None,
        }
    }

    /// Block waiting integer for T=1, waiting integer for T=0
    pub const fn waiting_integer(&self) -> u8 {
        match self.protocol_params {
            ProtocolParams::T0 { wi } => wi,
            ProtocolParams::T1 { bwi, .. } => bwi,
        }
    }

    /// Encode as the parameter block for SetParameters
    pub const fn to_block(&self) -> ParameterBlock {
        let clock_stop = clock_stop_value(self.clock_stop);
        match self.protocol_params {
            ProtocolParams::T0 { wi } => ParameterBlock::T0 {
                fi_di: self.fi_di(),
                convention: self.convention,
                guard_time: self.guard_time,
                wi,
                clock_stop,
            },
            ProtocolParams::T1 {
                bwi,
                cwi,
                ifsc,
                checksum,
            } => ParameterBlock::T1 {
                fi_di: self.fi_di(),
                convention: self.convention,
                crc: matches!(checksum, T1Checksum::Crc),
                guard_time: self.guard_time,
                bwi,
                cwi,
                clock_stop,
                ifsc,
                nad: 0,
            },
        }
    }

    /// Decode the parameter block a reader reports
    pub const fn from_block(block: &ParameterBlock) -> Self {
        match *block {
            ParameterBlock::T0 {
                fi_di,
                convention,
                guard_time,
                wi,
                clock_stop,
            } => Self {
                protocol: Protocol::T0,
                fi_index: fi_di >> 4,
                di_index: fi_di & 0x0F,
                guard_time,
                convention,
                clock_stop: clock_stop_policy(clock_stop),
                protocol_params: ProtocolParams::T0 { wi },
            },
            ParameterBlock::T1 {
                fi_di,
                convention,
                crc,
                guard_time,
                bwi,
                cwi,
                clock_stop,
                ifsc,
                ..
            } => Self {
                protocol: Protocol::T1,
                fi_index: fi_di >> 4,
                di_index: fi_di & 0x0F,
                guard_time,
                convention,
                clock_stop: clock_stop_policy(clock_stop),
                protocol_params: ProtocolParams::T1 {
                    bwi,
                    cwi,
                    ifsc,
                    checksum: if crc { T1Checksum::Crc } else { T1Checksum::Lrc },
                },
            },
        }
    }
}

const fn clock_stop_value(policy: ClockStop) -> u8 {
    match policy {
        ClockStop::NotSupported => 0,
        ClockStop::High => 1,
        ClockStop::Low => 2,
        ClockStop::NoPreference => 3,
    }
}

const fn clock_stop_policy(value: u8) -> ClockStop {
    match value & 0x03 {
        0 => ClockStop::NotSupported,
        1 => ClockStop::High,
        2 => ClockStop::Low,
        _ => ClockStop::NoPreference,
    }
}

/// Something commands can be sent through during negotiation
///
/// The slot implements this on top of the command pipeline; tests and the CLI
/// pass closures.
pub trait CommandChannel {
    /// Send a command and wait for its reply
    fn send(&mut self, request: Request) -> Result<Reply>;
}

impl<F> CommandChannel for F
where
    F: FnMut(Request) -> Result<Reply>,
{
    fn send(&mut self, request: Request) -> Result<Reply> {
        self(request)
    }
}

/// Outcome of the pure planning phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiationPlan {
    /// Protocol the card uses right after reset
    pub default_protocol: Option<Protocol>,
    /// Protocols both sides support
    pub common: Protocols,
    /// Protocol to operate with
    pub target: Protocol,
    /// Fi/Di byte to operate with if the card agrees
    pub fi_di: u8,
    /// PPS request to send, if any
    pub pps: Option<PpsRequest>,
    /// Whether the reader needs SetParameters
    pub program: bool,
}

impl NegotiationPlan {
    /// Parameters that will be programmed for a given Fi/Di byte
    pub fn parameters(
        &self,
        atr: &AtrRecord,
        caps: &ReaderCapabilities,
        fi_di: u8,
    ) -> OperatingParameters {
        let clock_stop = if caps.features.contains(ReaderFeatures::CLOCK_STOP) {
            atr.clock_stop()
        } else {
            ClockStop::NotSupported
        };
        let protocol_params = match self.target {
            Protocol::T0 => ProtocolParams::T0 { wi: atr.t0_wi() },
            Protocol::T1 => ProtocolParams::T1 {
                bwi: atr.t1_bwi(),
                cwi: atr.t1_cwi(),
                ifsc: atr.t1_ifsc(),
                checksum: atr.t1_checksum(),
            },
        };
        OperatingParameters {
            protocol: self.target,
            fi_index: fi_di >> 4,
            di_index: fi_di & 0x0F,
            guard_time: atr.extra_guard_time(),
            convention: atr.convention(),
            clock_stop,
            protocol_params,
        }
    }
}

/// Decide how to bring the card into operation without any I/O
pub fn plan(
    atr: &AtrRecord,
    caps: &ReaderCapabilities,
    config: &ReaderConfig,
) -> Result<NegotiationPlan, NegotiationError> {
    let negotiable = atr.params_negotiable();
    let default_protocol = atr.default_protocol();

    let card = if negotiable {
        atr.supported_protocols()
    } else {
        default_protocol.map_or(Protocols::NONE, Protocols::from)
    };
    let common = card & caps.protocols;
    if common.is_empty() {
        debug!(card = %card, reader = %caps.protocols, "No common protocol");
        return Err(NegotiationError::NoCommonProtocol);
    }

    let target = match default_protocol {
        Some(protocol) if !negotiable => protocol,
        _ if config.prefer_t1 && common.contains(Protocol::T1) => Protocol::T1,
        _ if common.contains(Protocol::T0) => Protocol::T0,
        _ => Protocol::T1,
    };
    if target == Protocol::T1 && atr.t1_checksum() == T1Checksum::Crc {
        return Err(NegotiationError::UnsupportedChecksum);
    }

    let default_fi_di = pps::DEFAULT_FI_DI;
    let auto_baud = caps.features.contains(ReaderFeatures::AUTO_BAUD);
    let card_fi_di = if atr.params_implicit()
        || !tables::fi_di_valid(atr.fi_index(), atr.di_index())
    {
        default_fi_di
    } else {
        (atr.fi_index() << 4) | atr.di_index()
    };

    let fi_di = if negotiable {
        if auto_baud { card_fi_di } else { default_fi_di }
    } else if card_fi_di != default_fi_di && !auto_baud {
        return Err(NegotiationError::UnsupportedManualClockRate);
    } else {
        card_fi_di
    };

    let autonomous = caps
        .features
        .intersects(ReaderFeatures::AUTO_PPS | ReaderFeatures::AUTO_PARAM_NEG);
    let pps = if negotiable && !autonomous {
        let rate_change = fi_di != default_fi_di;
        if Some(target) != default_protocol || rate_change {
            Some(PpsRequest::new(target, rate_change.then_some(fi_di)))
        } else {
            None
        }
    } else {
        None
    };

    Ok(NegotiationPlan {
        default_protocol,
        common,
        target,
        fi_di,
        pps,
        program: !caps.features.contains(ReaderFeatures::AUTO_PARAM_NEG),
    })
}

/// Negotiate operating parameters for a freshly reset card
///
/// Returns nothing partial: any failure leaves the caller without parameters.
pub fn negotiate<C>(
    atr: &AtrRecord,
    caps: &ReaderCapabilities,
    config: &ReaderConfig,
    channel: &mut C,
) -> Result<OperatingParameters>
where
    C: CommandChannel + ?Sized,
{
    let plan = plan(atr, caps, config)?;
    debug!(
        target_protocol = %plan.target,
        fi_di = format_args!("{:#04x}", plan.fi_di),
        pps = plan.pps.is_some(),
        program = plan.program,
        "Negotiation plan"
    );

    let mut fi_di = plan.fi_di;
    if let Some(request) = &plan.pps {
        let bytes = request.to_bytes();
        trace!(pps = %hex::encode(&bytes), "Sending PPS request");
        let response = channel
            .send(Request::XfrBlock {
                bwi: 0,
                data: bytes.into(),
            })?
            .into_data()?;
        trace!(pps = %hex::encode(&response), "Received PPS response");
        let outcome = pps::validate(request, &response)?;
        fi_di = outcome.fi_di;
    }

    let wanted = plan.parameters(atr, caps, fi_di);

    if plan.program {
        let reply = channel.send(Request::SetParameters(wanted.to_block()))?;
        match reply.into_result() {
            Ok(_) => {}
            Err(Error::Command(code)) => {
                warn!(error = %code, "Reader rejected SetParameters");
                return Err(NegotiationError::DeviceRejectedParameters.into());
            }
            Err(e) => return Err(e),
        }
    }

    let block = channel.send(Request::GetParameters)?.into_parameters()?;
    let params = OperatingParameters::from_block(&block);
    if plan.program && params.protocol != plan.target {
        warn!(
            wanted = %plan.target,
            reported = %params.protocol,
            "Reader reports a different protocol than programmed"
        );
        return Err(NegotiationError::DeviceRejectedParameters.into());
    }
    if let ProtocolParams::T1 {
        checksum: T1Checksum::Crc,
        ..
    } = params.protocol_params
    {
        return Err(NegotiationError::UnsupportedChecksum.into());
    }

    debug!(
        protocol = %params.protocol,
        fi = params.fi_index,
        di = params.di_index,
        "Negotiated operating parameters"
    );
    Ok(params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ReplyBody, SlotStatus};
    use bytes::{BufMut, Bytes, BytesMut};

    fn reply(body: ReplyBody) -> Reply {
        Reply {
            slot: 0,
            seq: 0,
            status: SlotStatus::from_bytes(0, 0),
            body,
        }
    }

    fn block_bytes(block: &ParameterBlock) -> Bytes {
        let request = Request::SetParameters(*block).encode(0, 0);
        let mut out = BytesMut::new();
        out.put_slice(&request[crate::message::HEADER_LEN..]);
        out.freeze()
    }

    /// Reader simulation that echoes PPS requests and stores parameter blocks
    struct Echo {
        sent: Vec<Request>,
        programmed: Option<ParameterBlock>,
        pps_answer: Option<Vec<u8>>,
    }

    impl Echo {
        fn new() -> Self {
            Self {
                sent: Vec::new(),
                programmed: None,
                pps_answer: None,
            }
        }
    }

    impl CommandChannel for Echo {
        fn send(&mut self, request: Request) -> Result<Reply> {
            self.sent.push(request.clone());
            Ok(match request {
                Request::XfrBlock { data, .. } => reply(ReplyBody::DataBlock {
                    chain: 0,
                    data: self
                        .pps_answer
                        .clone()
                        .map_or(data, Bytes::from),
                }),
                Request::SetParameters(block) => {
                    self.programmed = Some(block);
                    reply(ReplyBody::Parameters {
                        protocol: block.protocol().id(),
                        data: block_bytes(&block),
                    })
                }
                Request::GetParameters => {
                    let block = self.programmed.unwrap_or(ParameterBlock::T0 {
                        fi_di: 0x11,
                        convention: Convention::Direct,
                        guard_time: 0,
                        wi: 10,
                        clock_stop: 0,
                    });
                    reply(ReplyBody::Parameters {
                        protocol: block.protocol().id(),
                        data: block_bytes(&block),
                    })
                }
                _ => reply(ReplyBody::SlotStatus { clock: 0 }),
            })
        }
    }

    fn atr(hex: &str) -> AtrRecord {
        AtrRecord::parse(&hex::decode(hex.replace(' ', "")).unwrap()).unwrap()
    }

    fn with_tck(hex: &str) -> AtrRecord {
        let mut bytes = hex::decode(hex.replace(' ', "")).unwrap();
        let tck = bytes[1..].iter().fold(0, |acc, b| acc ^ b);
        bytes.push(tck);
        AtrRecord::parse(&bytes).unwrap()
    }

    fn caps(features: ReaderFeatures) -> ReaderCapabilities {
        ReaderCapabilities::default().with_features(features)
    }

    #[test]
    fn test_minimal_t0_card() {
        let atr = atr("3B 00");
        let mut reader = Echo::new();
        let params = negotiate(
            &atr,
            &caps(ReaderFeatures::TPDU),
            &ReaderConfig::default(),
            &mut reader,
        )
        .unwrap();
        assert_eq!(params.protocol, Protocol::T0);
        assert_eq!((params.fi_index, params.di_index), DEFAULT_RATES);
        assert_eq!(params.protocol_params, ProtocolParams::T0 { wi: 10 });
        // No PPS needed: default protocol and default rates.
        assert!(matches!(reader.sent[0], Request::SetParameters(_)));
        assert_eq!(reader.sent.len(), 2);
    }

    #[test]
    fn test_t1_pps_declined() {
        // TA1 = 0x96, TD1 announces T=1, TA3 = IFSC 0xFE.
        let atr = with_tck("3B 90 96 81 31 FE 45");
        let features = ReaderFeatures::TPDU | ReaderFeatures::AUTO_BAUD;
        let mut reader = Echo::new();
        reader.pps_answer = Some(vec![0xFF, 0x01, 0xFE]);
        let params =
            negotiate(&atr, &caps(features), &ReaderConfig::default(), &mut reader).unwrap();

        match &reader.sent[0] {
            Request::XfrBlock { data, .. } => {
                assert_eq!(data.as_ref(), &[0xFF, 0x11, 0x96, 0x78]);
            }
            other => panic!("unexpected first request {other:?}"),
        }
        assert_eq!(params.protocol, Protocol::T1);
        assert_eq!(params.fi_di(), 0x11);
        assert_eq!(params.ifsc(), Some(0xFE));
    }

    #[test]
    fn test_t1_pps_echoed_defaults() {
        let atr = with_tck("3B 90 96 81 31 FE 45");
        let features = ReaderFeatures::TPDU | ReaderFeatures::AUTO_BAUD;
        let mut reader = Echo::new();
        // PPS1 answered with the default Fi/Di.
        reader.pps_answer = Some(vec![0xFF, 0x11, 0x11, 0xFF]);
        let params =
            negotiate(&atr, &caps(features), &ReaderConfig::default(), &mut reader).unwrap();

        assert_eq!(params.protocol, Protocol::T1);
        assert_eq!(params.fi_di(), 0x11);
        assert_eq!(params.ifsc(), Some(0xFE));
        assert!(reader.sent.iter().any(|request| matches!(
            request,
            Request::SetParameters(ParameterBlock::T1 { fi_di: 0x11, .. })
        )));
    }

    #[test]
    fn test_t1_pps_accepted() {
        let atr = with_tck("3B 90 96 81 31 FE 45");
        let features = ReaderFeatures::TPDU | ReaderFeatures::AUTO_BAUD;
        let mut reader = Echo::new();
        let params =
            negotiate(&atr, &caps(features), &ReaderConfig::default(), &mut reader).unwrap();
        assert_eq!(params.fi_di(), 0x96);
    }

    #[test]
    fn test_no_common_protocol() {
        let atr = with_tck("3B 80 01");
        let caps = caps(ReaderFeatures::TPDU).with_protocols(Protocols::T0);
        assert_eq!(
            plan(&atr, &caps, &ReaderConfig::default()),
            Err(NegotiationError::NoCommonProtocol)
        );
    }

    #[test]
    fn test_crc_card_rejected() {
        // TD1 -> T=1 group with TC3 = 0x01.
        let atr = with_tck("3B 80 81 41 01");
        assert_eq!(
            plan(&atr, &caps(ReaderFeatures::TPDU), &ReaderConfig::default()),
            Err(NegotiationError::UnsupportedChecksum)
        );
    }

    #[test]
    fn test_specific_mode_needs_auto_baud() {
        // TA1 = 0x96, TA2 = 0x01 (specific mode, T=1, rates from TA1).
        let atr = with_tck("3B 90 96 11 01");
        assert_eq!(
            plan(&atr, &caps(ReaderFeatures::TPDU), &ReaderConfig::default()),
            Err(NegotiationError::UnsupportedManualClockRate)
        );
        let plan = plan(
            &atr,
            &caps(ReaderFeatures::TPDU | ReaderFeatures::AUTO_BAUD),
            &ReaderConfig::default(),
        )
        .unwrap();
        assert_eq!(plan.target, Protocol::T1);
        assert!(plan.pps.is_none());
        assert_eq!(plan.fi_di, 0x96);
    }

    #[test]
    fn test_autonomous_reader_skips_pps() {
        let atr = with_tck("3B 90 96 81 31 FE 45");
        let features = ReaderFeatures::TPDU | ReaderFeatures::AUTO_PPS | ReaderFeatures::AUTO_BAUD;
        let plan = plan(&atr, &caps(features), &ReaderConfig::default()).unwrap();
        assert!(plan.pps.is_none());
        assert!(plan.program);
    }

    #[test]
    fn test_rejected_parameters() {
        let atr = atr("3B 00");
        let mut channel = |request: Request| -> Result<Reply> {
            let mut reply = reply(ReplyBody::SlotStatus { clock: 0 });
            if matches!(request, Request::SetParameters(_)) {
                reply.status = SlotStatus::from_bytes(0x40, 0x0A);
            }
            Ok(reply)
        };
        assert_eq!(
            negotiate(
                &atr,
                &caps(ReaderFeatures::TPDU),
                &ReaderConfig::default(),
                &mut channel
            ),
            Err(Error::Negotiation(NegotiationError::DeviceRejectedParameters))
        );
    }

    #[test]
    fn test_transport_error_propagates() {
        let atr = atr("3B 00");
        let mut channel = |_: Request| -> Result<Reply> {
            Err(crate::transport::TransportError::Timeout.into())
        };
        let err = negotiate(
            &atr,
            &caps(ReaderFeatures::TPDU),
            &ReaderConfig::default(),
            &mut channel,
        )
        .unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_parameter_block_round_trip() {
        let atr = with_tck("3B 90 96 81 31 FE 45");
        let plan = plan(
            &atr,
            &caps(ReaderFeatures::TPDU | ReaderFeatures::CLOCK_STOP),
            &ReaderConfig::default(),
        )
        .unwrap();
        let params = plan.parameters(&atr, &caps(ReaderFeatures::TPDU), 0x96);
        assert_eq!(OperatingParameters::from_block(&params.to_block()), params);
    }
}
