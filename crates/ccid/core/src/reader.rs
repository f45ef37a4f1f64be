//! The reader device object
//!
//! A [`Reader`] owns the command pipeline of one attached device and its slots.
//! Slot change notifications and bus removal are fed in as [`ReaderEvent`]s.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tracing::{debug, info, warn};

use crate::config::{ReaderCapabilities, ReaderConfig};
use crate::error::{Error, Result};
use crate::event::{CardEvent, ReaderEvent, ReaderEventReceiver};
use crate::pipeline::CommandPipeline;
use crate::slot::{OwnerId, Slot, SlotError};
use crate::transport::ReaderTransport;

/// An attached card reader
#[derive(Debug)]
pub struct Reader {
    caps: ReaderCapabilities,
    config: ReaderConfig,
    pipeline: Arc<CommandPipeline>,
    slots: Vec<Arc<Slot>>,
    next_owner: AtomicU64,
    detached: AtomicBool,
}

impl Reader {
    /// Attach a reader reachable through `transport`
    ///
    /// Starts the pipeline worker and creates one empty slot per reader
    /// position. Cards are activated when their insertion event arrives.
    pub fn attach<T>(transport: T, caps: ReaderCapabilities, config: ReaderConfig) -> Result<Self>
    where
        T: ReaderTransport + 'static,
    {
        let pipeline = Arc::new(CommandPipeline::spawn(transport, config.clone())?);
        let slots = (0..caps.slots.max(1))
            .map(|index| {
                Arc::new(Slot::new(
                    index,
                    Arc::clone(&pipeline),
                    caps.clone(),
                    config.clone(),
                ))
            })
            .collect();
        info!(
            slots = caps.slots.max(1),
            protocols = %caps.protocols,
            level = %caps.features.exchange_level(),
            "Reader attached"
        );

        Ok(Self {
            caps,
            config,
            pipeline,
            slots,
            next_owner: AtomicU64::new(1),
            detached: AtomicBool::new(false),
        })
    }

    /// Reader capabilities
    pub const fn capabilities(&self) -> &ReaderCapabilities {
        &self.caps
    }

    /// Driver configuration
    pub const fn config(&self) -> &ReaderConfig {
        &self.config
    }

    /// The command pipeline shared by all slots
    pub fn pipeline(&self) -> &Arc<CommandPipeline> {
        &self.pipeline
    }

    /// All slots
    pub fn slots(&self) -> &[Arc<Slot>] {
        &self.slots
    }

    /// Slot by index
    pub fn slot(&self, index: u8) -> Result<&Arc<Slot>> {
        self.slots
            .get(index as usize)
            .ok_or(Error::Slot(SlotError::NoSuchSlot(index)))
    }

    /// Allocate an owner identity for transactions
    pub fn new_owner(&self) -> OwnerId {
        OwnerId::new(self.next_owner.fetch_add(1, Ordering::Relaxed))
    }

    /// Whether the reader has been detached
    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::SeqCst)
    }

    /// Apply one event
    ///
    /// Insertion runs the full activation; its error is returned and also
    /// recorded in the slot state.
    pub fn handle_event(&self, event: ReaderEvent) -> Result<()> {
        debug!(?event, "Reader event");
        match event {
            ReaderEvent::Card(CardEvent::Inserted { slot }) => self.slot(slot)?.card_inserted(),
            ReaderEvent::Card(CardEvent::Removed { slot }) => {
                self.slot(slot)?.card_removed();
                Ok(())
            }
            ReaderEvent::Removed => {
                self.detach();
                Ok(())
            }
        }
    }

    /// Apply events until the reader is removed or the channel closes
    pub fn run(&self, events: &ReaderEventReceiver) {
        while let Ok(event) = events.recv() {
            let removed = event == ReaderEvent::Removed;
            if let Err(e) = self.handle_event(event) {
                warn!(?event, error = %e, "Failed to handle reader event");
            }
            if removed {
                break;
            }
        }
    }

    /// Tear the device down
    ///
    /// Fails every queued and in-flight command with [`Error::DeviceGone`],
    /// releases every waiter and refuses later transactions.
    pub fn detach(&self) {
        if self.detached.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Reader detached");
        for slot in &self.slots {
            slot.device_removed();
        }
        self.pipeline.shutdown();
    }
}

impl Drop for Reader {
    fn drop(&mut self) {
        self.detach();
    }
}
