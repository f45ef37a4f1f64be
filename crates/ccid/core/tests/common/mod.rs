//! Scripted reader and card simulation shared by the integration tests
#![allow(dead_code, unreachable_pub)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use nexum_ccid_core::message::{
    ParameterBlock, Reply, ReplyBody, SlotStatus, decode_request_header, msg_type,
};
use nexum_ccid_core::t1::{Block, RStatus, SKind};
use nexum_ccid_core::transport::{ReaderTransport, TransportError};
use nexum_ccid_core::{
    CardEvent, Reader, ReaderCapabilities, ReaderConfig, ReaderEvent, ReaderFeatures,
};
use parking_lot::{Condvar, Mutex, MutexGuard};

/// Install a test subscriber once; `RUST_LOG` selects the level
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Append TCK to an ATR given as hex
pub fn atr_with_tck(hex: &str) -> Vec<u8> {
    let mut bytes = hex::decode(hex.replace(' ', "")).unwrap();
    let tck = bytes[1..].iter().fold(0, |acc, b| acc ^ b);
    bytes.push(tck);
    bytes
}

/// Negotiable T=1 card: TA1 = 0x96, IFSC = 0xFE, BWI/CWI = 4/5
pub fn t1_atr() -> Vec<u8> {
    atr_with_tck("3B 90 96 81 31 FE 45")
}

/// TPDU reader that applies Fi/Di itself
pub fn tpdu_caps() -> ReaderCapabilities {
    ReaderCapabilities::default().with_features(ReaderFeatures::TPDU | ReaderFeatures::AUTO_BAUD)
}

/// Short timeouts so failure paths finish quickly
pub fn test_config() -> ReaderConfig {
    ReaderConfig::default()
        .with_submit_timeout(Duration::from_millis(100))
        .with_reply_timeout(Duration::from_millis(300))
}

/// Answer `90 00` to everything
pub fn ok_response(_: &[u8]) -> Vec<u8> {
    vec![0x90, 0x00]
}

/// Insertion event for `slot`
pub fn inserted(slot: u8) -> ReaderEvent {
    CardEvent::Inserted { slot }.into()
}

/// Removal event for `slot`
pub fn removed(slot: u8) -> ReaderEvent {
    CardEvent::Removed { slot }.into()
}

/// How the card answers a PPS request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PpsMode {
    /// Echo the request
    Echo,
    /// Answer without PPS1
    Decline,
    /// Answer PPS1 with the default Fi/Di
    EchoDefaults,
}

/// A simulated card behind one slot
#[derive(Debug)]
pub struct CardSim {
    pub present: bool,
    pub atr: Vec<u8>,
    pub pps: PpsMode,
    /// XfrBlock payloads are T=1 blocks; otherwise they are APDUs
    pub tpdu_t1: bool,
    pub responder: fn(&[u8]) -> Vec<u8>,
    /// Ask for one waiting time extension before the next response
    pub wtx: Option<u8>,
    /// Corrupt this many upcoming blocks
    pub corrupt: usize,
    /// Never answer XfrBlock
    pub mute: bool,
    pub reject_parameters: bool,

    pub power_ons: usize,
    pub pps_requests: Vec<Vec<u8>>,
    pub set_parameters: Vec<ParameterBlock>,
    pub host_blocks: Vec<Block>,
    pub xfr_bwi: Vec<u8>,

    powered: bool,
    params: Option<(u8, Bytes)>,
    ifsd: usize,
    recv_seq: u8,
    send_seq: u8,
    rx: Vec<u8>,
    tx: VecDeque<Vec<u8>>,
    last: Option<Bytes>,
}

impl CardSim {
    /// Card with the given ATR, T=1 framing and `90 00` responses
    pub fn new(atr: Vec<u8>) -> Self {
        Self {
            present: true,
            atr,
            pps: PpsMode::Echo,
            tpdu_t1: true,
            responder: ok_response,
            wtx: None,
            corrupt: 0,
            mute: false,
            reject_parameters: false,
            power_ons: 0,
            pps_requests: Vec::new(),
            set_parameters: Vec::new(),
            host_blocks: Vec::new(),
            xfr_bwi: Vec::new(),
            powered: false,
            params: None,
            ifsd: 32,
            recv_seq: 0,
            send_seq: 0,
            rx: Vec::new(),
            tx: VecDeque::new(),
            last: None,
        }
    }

    /// The default T=1 card
    pub fn t1() -> Self {
        Self::new(t1_atr())
    }

    /// A T=0 only card spoken to with whole APDUs
    pub fn t0_apdu() -> Self {
        Self {
            tpdu_t1: false,
            ..Self::new(vec![0x3B, 0x00])
        }
    }

    pub fn with_pps(mut self, pps: PpsMode) -> Self {
        self.pps = pps;
        self
    }

    pub fn with_responder(mut self, responder: fn(&[u8]) -> Vec<u8>) -> Self {
        self.responder = responder;
        self
    }

    pub fn absent(mut self) -> Self {
        self.present = false;
        self
    }

    /// I-blocks the host sent, as (N(S), more, length)
    pub fn information_blocks(&self) -> Vec<(u8, bool, usize)> {
        self.host_blocks
            .iter()
            .filter_map(|block| match block {
                Block::Information { seq, more, data } => Some((*seq, *more, data.len())),
                _ => None,
            })
            .collect()
    }

    fn power_on(&mut self) {
        self.powered = true;
        self.power_ons += 1;
        self.params = None;
        self.ifsd = 32;
        self.recv_seq = 0;
        self.send_seq = 0;
        self.rx.clear();
        self.tx.clear();
        self.last = None;
    }

    fn parameters(&self) -> (u8, Bytes) {
        self.params
            .clone()
            .unwrap_or((0, Bytes::from_static(&[0x11, 0x00, 0x00, 0x0A, 0x00])))
    }

    fn on_xfr(&mut self, payload: &[u8]) -> Bytes {
        if payload.first() == Some(&0xFF) {
            return self.on_pps(payload);
        }
        if self.tpdu_t1 {
            self.on_block(payload)
        } else {
            Bytes::from((self.responder)(payload))
        }
    }

    fn on_pps(&mut self, request: &[u8]) -> Bytes {
        self.pps_requests.push(request.to_vec());
        let mut answer = match (self.pps, request) {
            (PpsMode::Echo, _) => return Bytes::copy_from_slice(request),
            (PpsMode::Decline, [ppss, pps0, ..]) => vec![*ppss, pps0 & 0x0F],
            (PpsMode::EchoDefaults, [ppss, pps0, _, ..]) if pps0 & 0x10 != 0 => {
                vec![*ppss, *pps0, 0x11]
            }
            _ => return Bytes::copy_from_slice(request),
        };
        answer.push(answer.iter().fold(0, |acc, b| acc ^ b));
        Bytes::from(answer)
    }

    fn on_block(&mut self, raw: &[u8]) -> Bytes {
        let block = match Block::decode(raw) {
            Ok(block) => block,
            Err(_) => return self.emit(Block::receive_ready(self.recv_seq, RStatus::Parity)),
        };
        self.host_blocks.push(block.clone());

        match block {
            Block::Information { seq, more, data } => {
                if seq != self.recv_seq {
                    return self.resend();
                }
                self.recv_seq ^= 1;
                self.rx.extend_from_slice(&data);
                if more {
                    return self.emit(Block::receive_ready(self.recv_seq, RStatus::Ok));
                }
                let apdu = std::mem::take(&mut self.rx);
                let response = (self.responder)(&apdu);
                self.tx = response.chunks(self.ifsd).map(<[u8]>::to_vec).collect();
                if self.tx.is_empty() {
                    self.tx.push_back(Vec::new());
                }
                if let Some(multiplier) = self.wtx.take() {
                    return self.emit(Block::request(SKind::Wtx, &[multiplier]));
                }
                self.next_chunk()
            }
            Block::ReceiveReady {
                seq,
                status: RStatus::Ok,
            } if seq == self.send_seq && !self.tx.is_empty() => self.next_chunk(),
            Block::ReceiveReady { .. } => self.resend(),
            Block::Supervisory {
                kind: SKind::Ifs,
                response: false,
                data,
            } => {
                self.ifsd = data.first().copied().unwrap_or(32) as usize;
                self.emit(Block::response(SKind::Ifs, &data))
            }
            Block::Supervisory {
                kind: SKind::Resync,
                response: false,
                ..
            } => {
                self.recv_seq = 0;
                self.send_seq = 0;
                self.ifsd = 32;
                self.rx.clear();
                self.tx.clear();
                self.emit(Block::response(SKind::Resync, &[]))
            }
            Block::Supervisory {
                kind: SKind::Wtx,
                response: true,
                ..
            } => self.next_chunk(),
            _ => self.emit(Block::receive_ready(self.recv_seq, RStatus::Other)),
        }
    }

    fn next_chunk(&mut self) -> Bytes {
        let chunk = self.tx.pop_front().unwrap_or_default();
        let more = !self.tx.is_empty();
        let block = Block::information(self.send_seq, more, chunk);
        self.send_seq ^= 1;
        self.emit(block)
    }

    fn emit(&mut self, block: Block) -> Bytes {
        let encoded = block.encode();
        self.last = Some(encoded.clone());
        self.maybe_corrupt(encoded)
    }

    fn resend(&mut self) -> Bytes {
        let last = self.last.clone().unwrap_or_default();
        self.maybe_corrupt(last)
    }

    fn maybe_corrupt(&mut self, block: Bytes) -> Bytes {
        if self.corrupt == 0 || block.is_empty() {
            return block;
        }
        self.corrupt -= 1;
        let mut bytes = block.to_vec();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        Bytes::from(bytes)
    }
}

/// One command as the reader saw it
#[derive(Debug, Clone)]
pub struct Logged {
    pub kind: u8,
    pub slot: u8,
    pub seq: u8,
    pub specific: [u8; 3],
    pub payload: Bytes,
}

/// Reader state behind the mock transport
#[derive(Debug)]
pub struct MockState {
    pub cards: Vec<CardSim>,
    pub log: Vec<Logged>,
    /// Submits that arrived while another command was still unanswered
    pub overlap_violations: usize,
    /// Time extension replies to send before the next reply
    pub time_extensions: u8,
    pub detached: bool,
    replies: VecDeque<Bytes>,
    awaiting: bool,
}

impl MockState {
    fn handle(&mut self, raw: &[u8]) -> Vec<Bytes> {
        let Ok((kind, slot, seq, specific, payload)) = decode_request_header(raw) else {
            return Vec::new();
        };
        self.log.push(Logged {
            kind,
            slot,
            seq,
            specific,
            payload: payload.clone(),
        });

        let reply = |status: SlotStatus, body: ReplyBody| {
            Reply {
                slot,
                seq,
                status,
                body,
            }
            .encode()
        };
        let status_only = ReplyBody::SlotStatus { clock: 0 };

        let Some(card) = self.cards.get_mut(slot as usize) else {
            return vec![reply(SlotStatus::from_bytes(0x42, 0x05), status_only)];
        };
        if !card.present {
            return vec![reply(SlotStatus::from_bytes(0x42, 0xFE), status_only)];
        }

        let body = match kind {
            msg_type::ICC_POWER_ON => {
                card.power_on();
                ReplyBody::DataBlock {
                    chain: 0,
                    data: Bytes::from(card.atr.clone()),
                }
            }
            msg_type::ICC_POWER_OFF => {
                card.powered = false;
                return vec![reply(SlotStatus::from_bytes(0x01, 0x00), status_only)];
            }
            msg_type::XFR_BLOCK => {
                card.xfr_bwi.push(specific[0]);
                if card.mute {
                    return Vec::new();
                }
                if !card.powered {
                    return vec![reply(SlotStatus::from_bytes(0x41, 0xFE), status_only)];
                }
                ReplyBody::DataBlock {
                    chain: 0,
                    data: card.on_xfr(&payload),
                }
            }
            msg_type::SET_PARAMETERS => {
                if card.reject_parameters {
                    return vec![reply(SlotStatus::from_bytes(0x40, 0x0A), status_only)];
                }
                match ParameterBlock::decode(specific[0], &payload) {
                    Ok(block) => {
                        card.set_parameters.push(block);
                        card.params = Some((specific[0], payload.clone()));
                        ReplyBody::Parameters {
                            protocol: specific[0],
                            data: payload,
                        }
                    }
                    Err(_) => return vec![reply(SlotStatus::from_bytes(0x40, 0x0A), status_only)],
                }
            }
            msg_type::GET_PARAMETERS => {
                let (protocol, data) = card.parameters();
                ReplyBody::Parameters { protocol, data }
            }
            msg_type::GET_SLOT_STATUS => status_only,
            _ => return vec![reply(SlotStatus::from_bytes(0x40, 0x00), status_only)],
        };

        let mut out: Vec<Bytes> = (0..self.time_extensions)
            .map(|_| reply(SlotStatus::from_bytes(0x80, 0x01), ReplyBody::SlotStatus { clock: 0 }))
            .collect();
        self.time_extensions = 0;
        out.push(reply(SlotStatus::from_bytes(0x00, 0x00), body));
        out
    }
}

#[derive(Debug)]
struct Shared {
    state: Mutex<MockState>,
    ready: Condvar,
}

/// Transport connected to simulated cards
#[derive(Debug, Clone)]
pub struct MockReader {
    shared: Arc<Shared>,
}

impl MockReader {
    /// One slot per card
    pub fn new(cards: Vec<CardSim>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(MockState {
                    cards,
                    log: Vec::new(),
                    overlap_violations: 0,
                    time_extensions: 0,
                    detached: false,
                    replies: VecDeque::new(),
                    awaiting: false,
                }),
                ready: Condvar::new(),
            }),
        }
    }

    /// Inspect or script the simulation
    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.shared.state.lock()
    }

    /// Pull the reader off the bus
    pub fn detach(&self) {
        self.shared.state.lock().detached = true;
        self.shared.ready.notify_all();
    }
}

impl ReaderTransport for MockReader {
    fn do_submit(&mut self, message: &[u8], _timeout: Duration) -> Result<(), TransportError> {
        let mut state = self.shared.state.lock();
        if state.detached {
            return Err(TransportError::Disconnected);
        }
        if state.awaiting {
            state.overlap_violations += 1;
        }
        let replies = state.handle(message);
        state.awaiting = true;
        state.replies.extend(replies);
        self.shared.ready.notify_all();
        Ok(())
    }

    fn do_receive_reply(&mut self, timeout: Duration) -> Result<Bytes, TransportError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        loop {
            if state.detached {
                return Err(TransportError::Disconnected);
            }
            if let Some(reply) = state.replies.pop_front() {
                // bStatus bit 7 marks a time extension; another reply follows.
                if reply[7] & 0x80 == 0 {
                    state.awaiting = false;
                }
                return Ok(reply);
            }
            if self
                .shared
                .ready
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                state.awaiting = false;
                return Err(TransportError::Timeout);
            }
        }
    }
}

/// Attach a reader over simulated cards with the default TPDU capabilities
pub fn attach(cards: Vec<CardSim>) -> (Reader, MockReader) {
    attach_with(cards, tpdu_caps(), test_config())
}

/// Attach a reader over simulated cards
pub fn attach_with(
    cards: Vec<CardSim>,
    caps: ReaderCapabilities,
    config: ReaderConfig,
) -> (Reader, MockReader) {
    init_tracing();
    let slots = cards.len() as u8;
    let mock = MockReader::new(cards);
    let reader = Reader::attach(mock.clone(), caps.with_slots(slots), config).unwrap();
    (reader, mock)
}
