//! Events delivered by the reader's interrupt endpoint and the bus
//!
//! Events are fed to [`Reader::handle_event`](crate::Reader::handle_event) or
//! sent over a channel drained by [`Reader::run`](crate::Reader::run).

use crossbeam_channel::{Receiver, Sender, unbounded};

/// Events related to card insertion/removal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardEvent {
    /// A card was inserted into a slot
    Inserted {
        /// Slot index
        slot: u8,
    },
    /// A card was removed from a slot
    Removed {
        /// Slot index
        slot: u8,
    },
}

impl CardEvent {
    /// Slot the event applies to
    pub const fn slot(&self) -> u8 {
        match self {
            Self::Inserted { slot } | Self::Removed { slot } => *slot,
        }
    }
}

/// Events delivered to a reader
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderEvent {
    /// Slot change notification
    Card(CardEvent),
    /// The reader was disconnected from the bus
    Removed,
}

impl From<CardEvent> for ReaderEvent {
    fn from(event: CardEvent) -> Self {
        Self::Card(event)
    }
}

/// Sender for reader events
pub type ReaderEventSender = Sender<ReaderEvent>;
/// Receiver for reader events
pub type ReaderEventReceiver = Receiver<ReaderEvent>;

/// Create a new unbounded reader event channel
pub fn reader_event_channel() -> (ReaderEventSender, ReaderEventReceiver) {
    unbounded()
}
