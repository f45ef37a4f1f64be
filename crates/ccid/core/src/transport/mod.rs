//! Transport traits for talking to a card reader
//!
//! The core treats the bus as an asynchronous byte pipe: a message is submitted,
//! and a reply carrying its own length prefix is later received. Nothing is
//! assumed about the physical medium.

pub mod error;

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
pub use error::TransportError;
use tracing::{debug, trace};

/// Trait for reader transports
///
/// A transport is responsible for moving raw message bytes. It has no knowledge
/// of message structure, sequence numbers or card protocols.
pub trait ReaderTransport: Send + fmt::Debug {
    /// Submit a raw message to the reader
    fn submit(&mut self, message: &[u8], timeout: Duration) -> Result<(), TransportError> {
        trace!(message = %hex::encode(message), "Submitting message");
        let result = self.do_submit(message, timeout);
        if let Err(e) = &result {
            debug!(error = ?e, "Transport error during submit");
        }
        result
    }

    /// Receive the next raw reply from the reader
    fn receive_reply(&mut self, timeout: Duration) -> Result<Bytes, TransportError> {
        let result = self.do_receive_reply(timeout);
        match &result {
            Ok(reply) => trace!(reply = %hex::encode(reply), "Received reply"),
            Err(e) => debug!(error = ?e, "Transport error during receive"),
        }
        result
    }

    /// Internal implementation of submit
    ///
    /// Must return once the reader acknowledged the message or `timeout` expired.
    fn do_submit(&mut self, message: &[u8], timeout: Duration) -> Result<(), TransportError>;

    /// Internal implementation of receive_reply
    fn do_receive_reply(&mut self, timeout: Duration) -> Result<Bytes, TransportError>;
}

impl<T: ReaderTransport + ?Sized> ReaderTransport for Box<T> {
    fn do_submit(&mut self, message: &[u8], timeout: Duration) -> Result<(), TransportError> {
        (**self).do_submit(message, timeout)
    }

    fn do_receive_reply(&mut self, timeout: Duration) -> Result<Bytes, TransportError> {
        (**self).do_receive_reply(timeout)
    }
}
