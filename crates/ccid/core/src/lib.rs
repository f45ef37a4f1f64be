//! Core of a smart card reader driver stack
//!
//! This crate turns the raw bytes a card reader delivers into structured protocol
//! knowledge, negotiates operating parameters with the inserted card and funnels
//! every command sent to the reader through a single serialized channel.
//!
//! ## Overview
//!
//! - [`atr`]: decoding of the Answer-to-Reset per ISO/IEC 7816-3
//! - [`pps`]: Protocol and Parameters Selection request/response codec
//! - [`params`]: derivation of [`OperatingParameters`] from an ATR and the reader's capabilities
//! - [`t1`]: the block-oriented T=1 transmission protocol
//! - [`message`]: the reader wire format (ten byte header plus payload)
//! - [`pipeline`]: the per-device command queue with one command in flight
//! - [`slot`]: card slots, exclusive transactions and application I/O
//! - [`reader`]: the device object tying slots and pipeline together
//!
//! The physical transport is supplied by the caller through [`ReaderTransport`].
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![forbid(unsafe_code)]
#![warn(missing_docs, rustdoc::missing_crate_level_docs)]

// Re-export bytes for convenience
pub use bytes::{Bytes, BytesMut};

pub mod atr;
pub mod config;
pub mod error;
pub mod event;
pub mod message;
pub mod params;
pub mod pipeline;
pub mod pps;
pub mod protocol;
pub mod reader;
pub mod slot;
pub mod t1;
pub mod transport;

pub use atr::{AtrError, AtrRecord, Convention};
pub use config::{ReaderCapabilities, ReaderConfig, ReaderFeatures};
pub use error::{Error, Result, ResultExt};
pub use event::{CardEvent, ReaderEvent};
pub use params::{NegotiationError, OperatingParameters};
pub use pipeline::{CommandPipeline, Pending};
pub use protocol::{Protocol, Protocols};
pub use reader::Reader;
pub use slot::{OwnerId, Slot, SlotError, SlotState};
pub use t1::{T1Engine, T1Error};
pub use transport::{ReaderTransport, TransportError};

/// Prelude module containing commonly used traits and types
pub mod prelude {
    pub use crate::{
        AtrRecord, Bytes, CardEvent, Error, OperatingParameters, OwnerId, Protocol, Protocols,
        Reader, ReaderCapabilities, ReaderConfig, ReaderEvent, ReaderFeatures, Result, ResultExt,
        Slot, SlotState, transport::ReaderTransport,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reexports() {
        let atr = AtrRecord::parse(&[0x3B, 0x00]).unwrap();
        assert_eq!(atr.convention(), Convention::Direct);
        assert_eq!(atr.supported_protocols(), Protocols::T0);
    }
}
