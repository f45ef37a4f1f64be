//! The T=1 block transmission protocol
//!
//! Used when the reader exchanges TPDUs: the host frames application data into
//! I-blocks, acknowledges chained responses with R-blocks and answers the
//! card's supervisory requests. Every exchange is strictly one block out, one
//! block back.
//!
//! Recovery follows ISO/IEC 7816-3 clause 11.6: a block received in error is
//! answered with an R-block asking for retransmission; once the retry bound is
//! spent the engine resynchronizes and starts the command over. Resynchronization
//! is itself bounded; past that the exchange fails with
//! [`T1Error::ResyncFailed`] and the card should be reset.

pub mod block;

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tracing::{debug, trace, warn};

pub use block::{Block, BlockError, RStatus, SKind};

use crate::error::{Error, Result};
use crate::message::ReaderErrorCode;

/// Largest information field a block can carry
pub const MAX_INFORMATION_FIELD: u8 = 254;

/// T=1 protocol failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum T1Error {
    /// Retries and resynchronizations are exhausted
    #[error("T=1 resynchronization failed")]
    ResyncFailed,

    /// The host tried to change IFSD after I-block traffic started
    #[error("IFSD can only be negotiated before the first exchange")]
    IfsAfterStart,

    /// An information field size outside 1..=254
    #[error("invalid information field size {0}")]
    InvalidIfs(u8),

    /// The card did not confirm the IFSD the host offered
    #[error("card rejected IFSD {0}")]
    IfsRejected(u8),

    /// The card aborted the chain
    #[error("card aborted the exchange")]
    CardAborted,
}

/// Something a block can be sent through
///
/// `wtx` is the waiting time multiplier the card asked for, 0 for the default
/// block waiting time.
pub trait BlockExchange {
    /// Send an encoded block and return the card's answer
    fn exchange(&mut self, block: Bytes, wtx: u8) -> Result<Bytes>;
}

impl<F> BlockExchange for F
where
    F: FnMut(Bytes, u8) -> Result<Bytes>,
{
    fn exchange(&mut self, block: Bytes, wtx: u8) -> Result<Bytes> {
        self(block, wtx)
    }
}

/// Outcome of one attempt at a full command exchange
enum Attempt {
    Done(Bytes),
    Resync,
}

/// Per-slot T=1 state
#[derive(Debug, Clone)]
pub struct T1Engine {
    send_seq: u8,
    recv_seq: u8,
    ifsc: u8,
    /// IFSC from the ATR, restored by resynchronization
    initial_ifsc: u8,
    ifsd: u8,
    started: bool,
    wtx: u8,
    max_retries: u8,
    max_resyncs: u8,
}

impl T1Engine {
    /// Create an engine for a card announcing `ifsc`
    pub const fn new(ifsc: u8, max_retries: u8, max_resyncs: u8) -> Self {
        let ifsc = if ifsc == 0 || ifsc > MAX_INFORMATION_FIELD {
            crate::atr::DEFAULT_T1_IFSC
        } else {
            ifsc
        };
        Self {
            send_seq: 0,
            recv_seq: 0,
            ifsc,
            initial_ifsc: ifsc,
            ifsd: crate::atr::DEFAULT_T1_IFSC,
            started: false,
            wtx: 0,
            max_retries,
            max_resyncs,
        }
    }

    /// N(S) of the next I-block the host sends
    pub const fn send_seq(&self) -> u8 {
        self.send_seq
    }

    /// N(S) expected on the next I-block from the card
    pub const fn recv_seq(&self) -> u8 {
        self.recv_seq
    }

    /// Information field size of the card, used for chunking
    pub const fn ifsc(&self) -> u8 {
        self.ifsc
    }

    /// Information field size the host announced
    pub const fn ifsd(&self) -> u8 {
        self.ifsd
    }

    /// Whether I-block traffic has started
    pub const fn is_started(&self) -> bool {
        self.started
    }

    /// Waiting time multiplier granted for the exchange in progress
    pub const fn pending_wtx(&self) -> u8 {
        self.wtx
    }

    /// Return to the state right after activation
    pub const fn reset(&mut self) {
        self.send_seq = 0;
        self.recv_seq = 0;
        self.started = false;
        self.wtx = 0;
    }

    /// Announce the host's information field size
    ///
    /// Only allowed before the first I-block.
    pub fn negotiate_ifsd<C>(&mut self, channel: &mut C, ifsd: u8) -> Result<()>
    where
        C: BlockExchange + ?Sized,
    {
        if self.started {
            return Err(T1Error::IfsAfterStart.into());
        }
        if ifsd == 0 || ifsd > MAX_INFORMATION_FIELD {
            return Err(T1Error::InvalidIfs(ifsd).into());
        }
        if self.announce_ifsd(channel, ifsd)? {
            Ok(())
        } else {
            Err(T1Error::IfsRejected(ifsd).into())
        }
    }

    /// Offer `ifsd` with S(IFS request), `false` if the card did not confirm it
    fn announce_ifsd<C>(&mut self, channel: &mut C, ifsd: u8) -> Result<bool>
    where
        C: BlockExchange + ?Sized,
    {
        let request = Block::request(SKind::Ifs, &[ifsd]);
        match self.send_block(channel, &request)? {
            Some(Block::Supervisory {
                kind: SKind::Ifs,
                response: true,
                data,
            }) if data[..] == [ifsd] => {
                debug!(ifsd, "IFSD accepted");
                self.ifsd = ifsd;
                Ok(true)
            }
            Some(other) => {
                warn!(block = ?other, "Unexpected answer to S(IFS request)");
                Ok(false)
            }
            None => Err(T1Error::ResyncFailed.into()),
        }
    }

    /// Send an APDU and return the card's complete response
    pub fn transceive<C>(&mut self, channel: &mut C, apdu: &[u8]) -> Result<Bytes>
    where
        C: BlockExchange + ?Sized,
    {
        self.started = true;
        let mut resyncs = 0;
        loop {
            match self.attempt(channel, apdu)? {
                Attempt::Done(response) => return Ok(response),
                Attempt::Resync => {
                    if resyncs >= self.max_resyncs {
                        warn!(resyncs, "Giving up on T=1 exchange");
                        return Err(T1Error::ResyncFailed.into());
                    }
                    resyncs += 1;
                    self.resync(channel)?;
                }
            }
        }
    }

    fn resync<C>(&mut self, channel: &mut C) -> Result<()>
    where
        C: BlockExchange + ?Sized,
    {
        debug!("Resynchronizing T=1");
        match self.send_block(channel, &Block::request(SKind::Resync, &[]))? {
            Some(Block::Supervisory {
                kind: SKind::Resync,
                response: true,
                ..
            }) => {
                self.send_seq = 0;
                self.recv_seq = 0;
                self.ifsc = self.initial_ifsc;
                let announced = std::mem::replace(&mut self.ifsd, crate::atr::DEFAULT_T1_IFSC);
                if announced != self.ifsd && !self.announce_ifsd(channel, announced)? {
                    warn!(ifsd = announced, "IFSD not confirmed after resync");
                }
                Ok(())
            }
            _ => Err(T1Error::ResyncFailed.into()),
        }
    }

    fn attempt<C>(&mut self, channel: &mut C, apdu: &[u8]) -> Result<Attempt>
    where
        C: BlockExchange + ?Sized,
    {
        let chunks: Vec<&[u8]> = if apdu.is_empty() {
            vec![apdu]
        } else {
            apdu.chunks(self.ifsc as usize).collect()
        };

        let mut retries = 0;
        let mut index = 0;
        let first = loop {
            let last = index + 1 == chunks.len();
            let block = Block::information(self.send_seq, !last, chunks[index].to_vec());
            let Some(reply) = self.send_block(channel, &block)? else {
                return Ok(Attempt::Resync);
            };

            match reply {
                Block::ReceiveReady { seq, status: RStatus::Ok }
                    if !last && seq != self.send_seq =>
                {
                    self.send_seq ^= 1;
                    index += 1;
                    retries = 0;
                }
                Block::Information { seq, .. } if last && seq == self.recv_seq => {
                    self.send_seq ^= 1;
                    break reply;
                }
                other => {
                    // Anything else asks for the current chunk again.
                    retries += 1;
                    debug!(block = ?other, retries, "Retransmitting I-block");
                    if retries > self.max_retries {
                        return Ok(Attempt::Resync);
                    }
                }
            }
        };

        let mut response = BytesMut::new();
        let mut current = first;
        loop {
            let Block::Information { more, data, .. } = current else {
                return Ok(Attempt::Resync);
            };
            self.recv_seq ^= 1;
            response.extend_from_slice(&data);
            if !more {
                return Ok(Attempt::Done(response.freeze()));
            }

            let ack = Block::receive_ready(self.recv_seq, RStatus::Ok);
            let mut retries = 0;
            current = loop {
                let Some(reply) = self.send_block(channel, &ack)? else {
                    return Ok(Attempt::Resync);
                };
                match reply {
                    Block::Information { seq, .. } if seq == self.recv_seq => break reply,
                    other => {
                        retries += 1;
                        debug!(block = ?other, retries, "Repeating acknowledgement");
                        if retries > self.max_retries {
                            return Ok(Attempt::Resync);
                        }
                    }
                }
            };
        }
    }

    /// Send one block and return the card's next meaningful block
    ///
    /// Answers WTX and IFS requests from the card, and recovers from corrupted
    /// blocks by asking for retransmission. Returns `None` once the retry bound
    /// is exceeded.
    fn send_block<C>(&mut self, channel: &mut C, block: &Block) -> Result<Option<Block>>
    where
        C: BlockExchange + ?Sized,
    {
        let mut retries = 0;
        let mut outgoing = block.clone();
        loop {
            let wtx = std::mem::take(&mut self.wtx);
            let encoded = outgoing.encode();
            trace!(block = %hex::encode(&encoded), wtx, "Sending T=1 block");

            let status = match channel.exchange(encoded, wtx) {
                Ok(raw) => {
                    trace!(block = %hex::encode(&raw), "Received T=1 block");
                    match Block::decode(&raw) {
                        Ok(received) => Ok(received),
                        Err(BlockError::Checksum) => Err(RStatus::Parity),
                        Err(e) => {
                            debug!(error = %e, "Malformed T=1 block");
                            Err(RStatus::Other)
                        }
                    }
                }
                Err(Error::Command(ReaderErrorCode::XfrParityError)) => Err(RStatus::Parity),
                Err(Error::Command(ReaderErrorCode::IccMute)) => Err(RStatus::Other),
                Err(e) => return Err(e),
            };

            let received = match status {
                Ok(received) => received,
                Err(status) => {
                    retries += 1;
                    if retries > self.max_retries {
                        return Ok(None);
                    }
                    debug!(?status, retries, "Requesting retransmission");
                    outgoing = Block::receive_ready(self.recv_seq, status);
                    continue;
                }
            };

            match received {
                Block::Supervisory {
                    kind: SKind::Wtx,
                    response: false,
                    data,
                } => {
                    let multiplier = data.first().copied().unwrap_or(1);
                    debug!(multiplier, "Card requested waiting time extension");
                    outgoing = Block::response(SKind::Wtx, &data);
                    self.wtx = multiplier;
                }
                Block::Supervisory {
                    kind: SKind::Ifs,
                    response: false,
                    data,
                } => match data.first().copied() {
                    Some(ifsc @ 1..=MAX_INFORMATION_FIELD) => {
                        debug!(ifsc, "Card changed IFSC");
                        self.ifsc = ifsc;
                        outgoing = Block::response(SKind::Ifs, &data);
                    }
                    _ => {
                        retries += 1;
                        if retries > self.max_retries {
                            return Ok(None);
                        }
                        outgoing = Block::receive_ready(self.recv_seq, RStatus::Other);
                    }
                },
                Block::Supervisory {
                    kind: SKind::Abort,
                    response: false,
                    ..
                } => {
                    warn!("Card aborted the chain");
                    let answer = Block::response(SKind::Abort, &[]);
                    if let Err(e) = channel.exchange(answer.encode(), 0) {
                        debug!(error = %e, "Failed to answer S(ABORT request)");
                    }
                    return Err(T1Error::CardAborted.into());
                }
                Block::ReceiveReady {
                    status: RStatus::Parity | RStatus::Other,
                    ..
                } => {
                    // The card did not understand the last block; send it again.
                    retries += 1;
                    if retries > self.max_retries {
                        return Ok(None);
                    }
                    debug!(retries, "Card requested retransmission");
                    self.wtx = wtx;
                }
                other => return Ok(Some(other)),
            }
        }
    }
}
