//! Core error type for all reader operations
//!
//! Every concern has its own error enum next to the code that produces it. This
//! module gathers them into one [`Error`] so results can bubble up through the
//! stack with `?`. Card absence and device removal are kept as distinct kinds so
//! callers can tell "try again" apart from "the card is gone".

use crate::atr::AtrError;
use crate::message::{MessageError, ReaderErrorCode};
use crate::params::NegotiationError;
use crate::pipeline::PipelineError;
use crate::pps::PpsError;
use crate::slot::SlotError;
use crate::t1::T1Error;
use crate::transport::TransportError;

/// Result alias used throughout the crate
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Core error type that encompasses all possible errors in the crate
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    //
    // Format errors
    //
    /// Malformed Answer-to-Reset
    #[error(transparent)]
    Atr(#[from] AtrError),

    /// Malformed or rejected PPS exchange
    #[error(transparent)]
    Pps(#[from] PpsError),

    /// Malformed reader message
    #[error(transparent)]
    Wire(#[from] MessageError),

    //
    // Negotiation errors
    //
    /// Parameter negotiation failed
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),

    //
    // Transport and pipeline errors
    //
    /// The transport failed to move bytes
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The command pipeline aborted the command
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    /// The reader processed the command and reported a failure
    #[error("Reader reported failure: {0}")]
    Command(ReaderErrorCode),

    //
    // Protocol framing errors
    //
    /// T=1 block protocol failure
    #[error(transparent)]
    T1(#[from] T1Error),

    //
    // Slot errors
    //
    /// Slot ownership or I/O state error
    #[error(transparent)]
    Slot(#[from] SlotError),

    //
    // Absence
    //
    /// The card was removed from the slot
    #[error("Card absent")]
    CardAbsent,

    /// The reader itself has been removed
    #[error("Reader removed")]
    DeviceGone,

    //
    // General errors
    //
    /// Context error with message and source error
    #[error("{context}: {source}")]
    Context {
        /// Contextual message
        context: String,
        /// Source error
        source: Box<Self>,
    },

    /// Generic dynamic error with string message
    #[error("{0}")]
    Message(String),
}

impl Error {
    /// Create a new error with context information
    pub fn with_context<S: Into<String>>(self, context: S) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Create a new error with a dynamic message
    pub fn message<S: Into<String>>(message: S) -> Self {
        Self::Message(message.into())
    }

    /// The innermost error, looking through any context layers
    pub fn root(&self) -> &Self {
        match self {
            Self::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// Whether the card has been removed
    pub fn is_card_absent(&self) -> bool {
        matches!(self.root(), Self::CardAbsent)
    }

    /// Whether the reader has been removed
    pub fn is_device_gone(&self) -> bool {
        matches!(self.root(), Self::DeviceGone)
    }

    /// Whether the failure only affected a single command and may be retried
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.root(),
            Self::Transport(_) | Self::Pipeline(_) | Self::Command(_)
        )
    }
}

/// Extension trait for Result with reader Errors
pub trait ResultExt<T> {
    /// Add context to an error
    fn context<S: Into<String>>(self, context: S) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn context<S: Into<String>>(self, context: S) -> Self {
        self.map_err(|e| e.with_context(context))
    }
}
