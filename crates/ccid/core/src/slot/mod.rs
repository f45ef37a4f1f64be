//! Card slots
//!
//! A [`Slot`] tracks card presence, the parsed ATR, the negotiated
//! [`OperatingParameters`], the T=1 engine and the one application exchange that
//! may be in progress. Application access is gated by [`Exclusivity`]: only the
//! owner of the slot's transaction may write, read or end it.
//!
//! The ATR and operating parameters are published as immutable snapshots and
//! replaced, never mutated, when the card is re-activated.

mod exclusive;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
pub use exclusive::Exclusivity;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::atr::AtrRecord;
use crate::config::{ExchangeLevel, ReaderCapabilities, ReaderConfig, ReaderFeatures};
use crate::error::{Error, Result, ResultExt};
use crate::message::Request;
use crate::params::{self, NegotiationError, OperatingParameters};
use crate::pipeline::{CommandPipeline, Completer, Pending, PipelineError, completion};
use crate::protocol::Protocol;
use crate::t1::{T1Engine, T1Error};

/// Slot ownership and I/O errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SlotError {
    /// Held by another owner
    #[error("slot is held by another owner")]
    Busy,

    /// A blocking acquire was interrupted
    #[error("wait for slot interrupted")]
    Interrupted,

    /// The caller does not hold the slot
    #[error("caller does not hold the slot")]
    NotOwner,

    /// The caller already holds the slot
    #[error("caller already holds the slot")]
    AlreadyOwner,

    /// The caller is already queued for the slot
    #[error("caller is already waiting for the slot")]
    AlreadyWaiting,

    /// The card is present but not activated
    #[error("card not activated")]
    NotActivated,

    /// No slot with this index
    #[error("no slot {0}")]
    NoSuchSlot(u8),

    /// An application exchange is already in progress
    #[error("an exchange is already in progress")]
    IoInProgress,

    /// Nothing was written
    #[error("no exchange in progress")]
    NoPendingIo,
}

/// Identity of a slot owner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, derive_more::Display)]
#[display("owner#{_0}")]
pub struct OwnerId(u64);

impl OwnerId {
    /// Wrap a raw identifier
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Raw identifier
    pub const fn get(self) -> u64 {
        self.0
    }
}

/// Externally visible slot state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotState {
    /// No card
    Empty,
    /// A card is present and being activated
    Activating,
    /// A card is present but activation failed; removal is required
    NotActivated(Error),
    /// The card is ready for application I/O
    Active,
}

/// Application exchange in progress
struct UserIo {
    owner: OwnerId,
    completer: Completer<Bytes>,
    pending: Arc<Pending<Bytes>>,
    cancel: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl UserIo {
    /// Fail the exchange now and stop further blocks from going out
    fn abort(&self, error: Error) {
        self.cancel.store(true, Ordering::SeqCst);
        self.completer.complete(Err(error));
    }
}

struct Inner {
    present: bool,
    state: SlotState,
    atr: Option<Arc<AtrRecord>>,
    params: Option<Arc<OperatingParameters>>,
    t1: Option<T1Engine>,
    io: Option<UserIo>,
    /// Exchange failed by card removal, kept until its owner reads it
    orphaned: Option<UserIo>,
    generation: u64,
    gone: bool,
}

impl Inner {
    fn clear_card(&mut self) {
        self.atr = None;
        self.params = None;
        self.t1 = None;
        self.generation += 1;
    }
}

/// One physical card position of a reader
pub struct Slot {
    index: u8,
    pipeline: Arc<CommandPipeline>,
    caps: ReaderCapabilities,
    config: ReaderConfig,
    exclusive: Exclusivity,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slot")
            .field("index", &self.index)
            .field("state", &self.state())
            .field("owner", &self.exclusive.holder())
            .finish_non_exhaustive()
    }
}

impl Slot {
    /// Create an empty slot
    pub fn new(
        index: u8,
        pipeline: Arc<CommandPipeline>,
        caps: ReaderCapabilities,
        config: ReaderConfig,
    ) -> Self {
        Self {
            index,
            pipeline,
            caps,
            config,
            exclusive: Exclusivity::new(),
            inner: Mutex::new(Inner {
                present: false,
                state: SlotState::Empty,
                atr: None,
                params: None,
                t1: None,
                io: None,
                orphaned: None,
                generation: 0,
                gone: false,
            }),
        }
    }

    /// Slot index on the reader
    pub const fn index(&self) -> u8 {
        self.index
    }

    /// Current state
    pub fn state(&self) -> SlotState {
        self.inner.lock().state.clone()
    }

    /// Whether a card is present
    pub fn is_present(&self) -> bool {
        self.inner.lock().present
    }

    /// ATR of the present card, available as soon as it was parsed
    pub fn parsed_atr(&self) -> Option<Arc<AtrRecord>> {
        self.inner.lock().atr.clone()
    }

    /// Parameters negotiated with the present card
    pub fn operating_parameters(&self) -> Option<Arc<OperatingParameters>> {
        self.inner.lock().params.clone()
    }

    /// Snapshot of the T=1 engine, when the slot frames blocks itself
    pub fn t1_engine(&self) -> Option<T1Engine> {
        self.inner.lock().t1.clone()
    }

    /// Current transaction owner
    pub fn owner(&self) -> Option<OwnerId> {
        self.exclusive.holder()
    }

    /// Number of callers blocked in [`Self::begin_transaction`]
    pub fn waiters(&self) -> usize {
        self.exclusive.waiters()
    }

    //
    // Card lifecycle
    //

    /// Handle a card insertion: power on, parse the ATR and negotiate
    pub fn card_inserted(&self) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            if inner.gone {
                return Err(Error::DeviceGone);
            }
            inner.present = true;
        }
        self.activate()
    }

    /// Handle a card removal
    ///
    /// Fails the application exchange in progress with [`Error::CardAbsent`],
    /// drops the per-card state and cancels this slot's queued commands.
    pub fn card_removed(&self) {
        {
            let mut inner = self.inner.lock();
            info!(slot = self.index, "Card removed");
            inner.present = false;
            inner.state = SlotState::Empty;
            inner.clear_card();
            if let Some(io) = inner.io.take() {
                io.abort(Error::CardAbsent);
                inner.orphaned = Some(io);
            }
        }
        self.pipeline.cancel_slot(self.index, &Error::CardAbsent);
    }

    /// Handle removal of the whole reader
    pub fn device_removed(&self) {
        {
            let mut inner = self.inner.lock();
            inner.gone = true;
            inner.present = false;
            inner.state = SlotState::Empty;
            inner.clear_card();
            if let Some(io) = &inner.io {
                io.abort(Error::DeviceGone);
            }
        }
        self.exclusive.close();
    }

    /// Power the card on and bring it into operation
    ///
    /// On failure the slot stays present but reports
    /// [`SlotState::NotActivated`] until the card is removed.
    #[instrument(skip(self), fields(slot = self.index))]
    pub fn activate(&self) -> Result<()> {
        let generation = {
            let mut inner = self.inner.lock();
            if inner.gone {
                return Err(Error::DeviceGone);
            }
            if !inner.present {
                return Err(Error::CardAbsent);
            }
            inner.clear_card();
            inner.state = SlotState::Activating;
            inner.generation
        };

        let result = self.bring_up(generation);

        let mut inner = self.inner.lock();
        if inner.generation != generation || !inner.present {
            // Removed while activating; the removal already reset the state.
            return Err(result.err().unwrap_or(Error::CardAbsent));
        }
        match result {
            Ok((params, t1)) => {
                info!(protocol = %params.protocol, fi_di = params.fi_di(), "Card activated");
                inner.params = Some(Arc::new(params));
                inner.t1 = t1;
                inner.state = SlotState::Active;
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Card activation failed");
                inner.params = None;
                inner.t1 = None;
                inner.state = SlotState::NotActivated(e.clone());
                Err(e)
            }
        }
    }

    fn bring_up(&self, generation: u64) -> Result<(OperatingParameters, Option<T1Engine>)> {
        let atr_bytes = self
            .pipeline
            .send(self.index, Request::IccPowerOn)?
            .into_data()
            .context("power on")?;
        debug!(atr = %hex::encode(&atr_bytes), "Card answered to reset");

        let atr = Arc::new(AtrRecord::parse(&atr_bytes)?);
        {
            let mut inner = self.inner.lock();
            if inner.generation == generation {
                inner.atr = Some(Arc::clone(&atr));
            }
        }

        let pipeline = &self.pipeline;
        let index = self.index;
        let mut channel = |request: Request| pipeline.send(index, request);
        let params = params::negotiate(&atr, &self.caps, &self.config, &mut channel)?;

        let t1 = match (params.protocol, self.caps.features.exchange_level()) {
            (_, ExchangeLevel::ShortApdu | ExchangeLevel::ExtendedApdu) => None,
            (Protocol::T1, ExchangeLevel::Tpdu) => Some(self.start_t1(&params)?),
            (protocol, _) => {
                return Err(NegotiationError::UnsupportedExchangeLevel(protocol).into());
            }
        };
        Ok((params, t1))
    }

    fn start_t1(&self, params: &OperatingParameters) -> Result<T1Engine> {
        let ifsc = params.ifsc().unwrap_or(crate::atr::DEFAULT_T1_IFSC);
        let mut engine = T1Engine::new(
            ifsc,
            self.config.t1_max_retries,
            self.config.t1_max_resyncs,
        );
        if !self.caps.features.contains(ReaderFeatures::AUTO_IFSD) {
            let ifsd = self.config.ifsd.min(self.caps.max_ifsd);
            let mut channel = BlockChannel {
                pipeline: &self.pipeline,
                slot: self.index,
                cancel: None,
            };
            engine.negotiate_ifsd(&mut channel, ifsd).context("IFSD exchange")?;
        }
        Ok(engine)
    }

    //
    // Transactions
    //

    /// Become the exclusive owner of the slot
    pub fn begin_transaction(&self, owner: OwnerId, blocking: bool) -> Result<()> {
        if self.inner.lock().gone {
            return Err(Error::DeviceGone);
        }
        self.exclusive.acquire(owner, blocking)
    }

    /// Cancel a blocking [`Self::begin_transaction`] of `owner`
    pub fn interrupt(&self, owner: OwnerId) -> bool {
        self.exclusive.interrupt(owner)
    }

    /// Give up ownership
    ///
    /// Any exchange still in progress is cancelled and waited for. With `reset`
    /// the card is power cycled and re-activated before the next waiter is
    /// granted; a failed reset is logged and does not block the handoff.
    #[instrument(skip(self), fields(slot = self.index))]
    pub fn end_transaction(&self, owner: OwnerId, reset: bool) -> Result<()> {
        if self.inner.lock().gone {
            self.drain_io(Error::DeviceGone);
            return Err(Error::DeviceGone);
        }
        self.exclusive.begin_release(owner)?;
        self.drain_io(PipelineError::Cancelled.into());

        if reset {
            if let Err(e) = self.reset_card() {
                warn!(error = %e, "Reset at end of transaction failed");
            }
        }

        self.exclusive.finish_release();
        Ok(())
    }

    /// Fail the exchange in progress and wait for its worker
    fn drain_io(&self, error: Error) {
        let (io, orphaned) = {
            let mut inner = self.inner.lock();
            (inner.io.take(), inner.orphaned.take())
        };
        for mut io in io.into_iter().chain(orphaned) {
            io.abort(error.clone());
            if let Some(worker) = io.worker.take()
                && worker.join().is_err()
            {
                warn!(slot = self.index, "Slot I/O worker panicked");
            }
        }
    }

    /// Power cycle the card and activate it again
    pub fn reset_card(&self) -> Result<()> {
        if let Err(e) = self
            .pipeline
            .send(self.index, Request::IccPowerOff)
            .and_then(|reply| reply.into_result())
        {
            debug!(error = %e, "Power off before reset failed");
        }
        self.activate()
    }

    //
    // Application I/O
    //

    fn check_owner(&self, owner: OwnerId) -> Result<()> {
        if self.inner.lock().gone {
            Err(Error::DeviceGone)
        } else if self.exclusive.holds(owner) {
            Ok(())
        } else {
            Err(SlotError::NotOwner.into())
        }
    }

    /// Start sending `apdu` to the card
    ///
    /// Returns as soon as the exchange is started; collect the response with
    /// [`Self::read`].
    pub fn write(self: &Arc<Self>, owner: OwnerId, apdu: impl Into<Bytes>) -> Result<()> {
        self.check_owner(owner)?;
        let apdu = apdu.into();

        let mut inner = self.inner.lock();
        if inner.gone {
            return Err(Error::DeviceGone);
        }
        // Re-checked under the lock so a concurrent release drains what we install.
        if !self.exclusive.holds(owner) {
            return Err(SlotError::NotOwner.into());
        }
        if !inner.present {
            return Err(Error::CardAbsent);
        }
        if inner.state != SlotState::Active {
            return Err(SlotError::NotActivated.into());
        }
        if inner.io.is_some() {
            return Err(SlotError::IoInProgress.into());
        }

        let engine = inner.t1.clone();
        let generation = inner.generation;
        let (completer, pending) = completion();
        let cancel = Arc::new(AtomicBool::new(false));

        let worker = {
            let slot = Arc::clone(self);
            let completer = completer.clone();
            let cancel = Arc::clone(&cancel);
            thread::Builder::new()
                .name(format!("ccid-slot{}-io", self.index))
                .spawn(move || slot.exchange(apdu, engine, generation, &completer, &cancel))
                .map_err(|e| Error::message(format!("failed to start I/O worker: {e}")))?
        };

        inner.t1 = None;
        inner.orphaned = None;
        inner.io = Some(UserIo {
            owner,
            completer,
            pending: Arc::new(pending),
            cancel,
            worker: Some(worker),
        });
        Ok(())
    }

    /// Runs on the I/O worker
    fn exchange(
        &self,
        apdu: Bytes,
        engine: Option<T1Engine>,
        generation: u64,
        completer: &Completer<Bytes>,
        cancel: &Arc<AtomicBool>,
    ) {
        let mut channel = BlockChannel {
            pipeline: &self.pipeline,
            slot: self.index,
            cancel: Some(cancel),
        };
        let (result, engine) = match engine {
            Some(mut engine) => {
                let result = engine.transceive(&mut channel, &apdu);
                (result, Some(engine))
            }
            None => (channel.send(Request::XfrBlock { bwi: 0, data: apdu }), None),
        };

        let resync_failed = matches!(result, Err(Error::T1(T1Error::ResyncFailed)));
        let current = {
            let mut inner = self.inner.lock();
            let current = inner.generation == generation;
            if current && !resync_failed {
                inner.t1 = engine;
            }
            current
        };

        if current && resync_failed {
            warn!(slot = self.index, "T=1 link lost, resetting card");
            if let Err(e) = self.reset_card() {
                warn!(slot = self.index, error = %e, "Card reset failed");
            }
        }
        completer.complete(result);
    }

    /// Collect the response of the exchange started by [`Self::write`]
    ///
    /// Waits at most `timeout`; returns `Ok(None)` while the exchange is still
    /// running. A zero timeout polls.
    pub fn read(&self, owner: OwnerId, timeout: Duration) -> Result<Option<Bytes>> {
        self.check_owner(owner)?;

        let pending = {
            let inner = self.inner.lock();
            match inner.io.as_ref().or(inner.orphaned.as_ref()) {
                Some(io) if io.owner == owner => Arc::clone(&io.pending),
                Some(_) => return Err(SlotError::NotOwner.into()),
                None => return Err(SlotError::NoPendingIo.into()),
            }
        };

        let result = if timeout.is_zero() {
            pending.try_wait()
        } else {
            pending.wait_timeout(timeout)
        };
        let Some(result) = result else {
            return Ok(None);
        };

        let io = {
            let mut inner = self.inner.lock();
            let owns = |io: &Option<UserIo>| {
                io.as_ref()
                    .is_some_and(|io| Arc::ptr_eq(&io.pending, &pending))
            };
            if owns(&inner.io) {
                inner.io.take()
            } else if owns(&inner.orphaned) {
                inner.orphaned.take()
            } else {
                None
            }
        };
        if let Some(worker) = io.and_then(|mut io| io.worker.take())
            && worker.join().is_err()
        {
            warn!(slot = self.index, "Slot I/O worker panicked");
        }
        result.map(Some)
    }

    /// Send `apdu` and wait for the response
    pub fn transmit(self: &Arc<Self>, owner: OwnerId, apdu: impl Into<Bytes>) -> Result<Bytes> {
        self.write(owner, apdu)?;
        loop {
            if let Some(response) = self.read(owner, Duration::from_secs(1))? {
                return Ok(response);
            }
        }
    }
}

/// Carries T=1 blocks and APDUs as XfrBlock commands on one slot
struct BlockChannel<'a> {
    pipeline: &'a CommandPipeline,
    slot: u8,
    cancel: Option<&'a Arc<AtomicBool>>,
}

impl BlockChannel<'_> {
    fn send(&mut self, request: Request) -> Result<Bytes> {
        if self.cancel.is_some_and(|c| c.load(Ordering::SeqCst)) {
            return Err(PipelineError::Cancelled.into());
        }
        self.pipeline.send(self.slot, request)?.into_data()
    }
}

impl crate::t1::BlockExchange for BlockChannel<'_> {
    fn exchange(&mut self, block: Bytes, wtx: u8) -> Result<Bytes> {
        self.send(Request::XfrBlock {
            bwi: wtx,
            data: block,
        })
    }
}
