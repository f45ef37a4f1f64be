//! Per-device command serialization
//!
//! Every command sent to a reader, whether it comes from parameter negotiation
//! or from application I/O, goes through one [`CommandPipeline`]. Commands are
//! dispatched in enqueue order and at most one is outstanding at any time. A
//! dedicated worker thread owns the transport; it submits the head of the
//! queue, waits for the matching reply and completes the command before moving
//! on.
//!
//! ```text
//! Queued -> Dispatched -> AwaitingReply -> Completed
//!                |              |       -> TransportError
//!                +--------------+-----> -> Aborted
//! ```

mod completion;
mod seq;

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

pub use completion::{Completer, Pending, completion};
use parking_lot::{Condvar, Mutex};
pub use seq::{MAX_SEQ, SequencePool};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::config::ReaderConfig;
use crate::error::{Error, Result};
use crate::message::{CommandStatus, MessageError, Reply, Request};
use crate::transport::ReaderTransport;

/// Reasons the pipeline aborts a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PipelineError {
    /// The reply carried another command's sequence number
    #[error("reply sequence {got} does not match command sequence {expected}")]
    SequenceMismatch {
        /// Sequence number of the command in flight
        expected: u8,
        /// Sequence number in the reply
        got: u8,
    },

    /// The reply could not be decoded
    #[error("malformed reply: {0}")]
    Malformed(#[from] MessageError),

    /// Every sequence number is in use
    #[error("no free sequence number")]
    SequenceExhausted,

    /// The command was cancelled before it completed
    #[error("command cancelled")]
    Cancelled,
}

/// Lifecycle of a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum CommandState {
    /// Waiting in the queue
    Queued,
    /// Handed to the transport
    Dispatched,
    /// Submitted, waiting for the reader's reply
    AwaitingReply,
    /// A reply was delivered
    Completed,
    /// The transport failed
    TransportError,
    /// The command was dropped without a valid reply
    Aborted,
}

impl CommandState {
    /// Whether the command has reached a final state
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::TransportError | Self::Aborted
        )
    }
}

/// A queued command
#[derive(Debug)]
struct Command {
    slot: u8,
    seq: u8,
    request: Request,
    completer: Completer<Reply>,
}

/// What the pipeline knows about the command in flight
#[derive(Debug, Clone)]
struct InFlight {
    slot: u8,
    seq: u8,
    state: CommandState,
    completer: Completer<Reply>,
}

#[derive(Debug, Default)]
struct State {
    queue: VecDeque<Command>,
    in_flight: Option<InFlight>,
    pool: SequencePool,
    shutdown: bool,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<State>,
    wake: Condvar,
}

/// Serialized command channel to one reader
#[derive(Debug)]
pub struct CommandPipeline {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CommandPipeline {
    /// Start the worker thread that owns `transport`
    pub fn spawn<T>(transport: T, config: ReaderConfig) -> Result<Self>
    where
        T: ReaderTransport + 'static,
    {
        let shared = Arc::new(Shared::default());
        let worker = Worker {
            shared: Arc::clone(&shared),
            transport: Box::new(transport),
            config,
        };
        let handle = thread::Builder::new()
            .name("ccid-pipeline".into())
            .spawn(move || worker.run())
            .map_err(|e| Error::message(format!("failed to start pipeline worker: {e}")))?;

        Ok(Self {
            shared,
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Queue a command for `slot`
    ///
    /// Does not block; the returned [`Pending`] resolves once the command
    /// reaches a terminal state.
    pub fn enqueue(&self, slot: u8, request: Request) -> Result<Pending<Reply>> {
        let mut state = self.shared.state.lock();
        if state.shutdown {
            return Err(Error::DeviceGone);
        }
        let seq = state
            .pool
            .acquire()
            .ok_or(PipelineError::SequenceExhausted)?;
        let (completer, pending) = completion();
        trace!(slot, seq, command = request.name(), "Queued command");
        state.queue.push_back(Command {
            slot,
            seq,
            request,
            completer,
        });
        self.shared.wake.notify_all();
        Ok(pending)
    }

    /// Queue a command and wait for its reply
    pub fn send(&self, slot: u8, request: Request) -> Result<Reply> {
        self.enqueue(slot, request)?.wait()
    }

    /// Number of commands dispatched but not yet completed (0 or 1)
    pub fn in_flight_count(&self) -> usize {
        usize::from(self.shared.state.lock().in_flight.is_some())
    }

    /// Fail every command of `slot` with `error`
    ///
    /// Queued commands are removed. A command already in flight is completed
    /// now; its reply is discarded when it arrives.
    pub fn cancel_slot(&self, slot: u8, error: &Error) {
        let mut state = self.shared.state.lock();
        let State {
            queue, pool, in_flight, ..
        } = &mut *state;

        queue.retain(|command| {
            if command.slot != slot {
                return true;
            }
            command.completer.complete(Err(error.clone()));
            pool.release(command.seq);
            false
        });

        if let Some(current) = in_flight.as_ref().filter(|c| c.slot == slot)
            && current.completer.complete(Err(error.clone()))
        {
            debug!(
                slot,
                seq = current.seq,
                state = %current.state,
                %error,
                "Cancelled command in flight"
            );
        }
    }

    /// Whether the pipeline has been shut down
    pub fn is_shutdown(&self) -> bool {
        self.shared.state.lock().shutdown
    }

    /// Fail everything with [`Error::DeviceGone`] and stop the worker
    ///
    /// Waits for the worker to return from the transport. Further enqueues are
    /// refused.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            if !state.shutdown {
                state.shutdown = true;
                let State {
                    queue, pool, in_flight, ..
                } = &mut *state;
                for command in queue.drain(..) {
                    command.completer.complete(Err(Error::DeviceGone));
                    pool.release(command.seq);
                }
                if let Some(current) = in_flight.as_ref() {
                    current.completer.complete(Err(Error::DeviceGone));
                }
                debug!("Pipeline shut down");
            }
            self.shared.wake.notify_all();
        }

        let handle = self.worker.lock().take();
        if let Some(handle) = handle
            && handle.thread().id() != thread::current().id()
            && handle.join().is_err()
        {
            warn!("Pipeline worker panicked");
        }
    }
}

impl Drop for CommandPipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// The thread that owns the transport
struct Worker {
    shared: Arc<Shared>,
    transport: Box<dyn ReaderTransport>,
    config: ReaderConfig,
}

impl Worker {
    fn run(mut self) {
        while let Some(command) = self.next_command() {
            let (state, result) = self.dispatch_next(&command);
            self.finish(command, state, result);
        }
        trace!("Pipeline worker exiting");
    }

    /// Block until a command is queued, `None` on shutdown
    fn next_command(&self) -> Option<Command> {
        let mut state = self.shared.state.lock();
        loop {
            if state.shutdown {
                return None;
            }
            if let Some(command) = state.queue.pop_front() {
                state.in_flight = Some(InFlight {
                    slot: command.slot,
                    seq: command.seq,
                    state: CommandState::Dispatched,
                    completer: command.completer.clone(),
                });
                return Some(command);
            }
            self.shared.wake.wait(&mut state);
        }
    }

    fn set_state(&self, new: CommandState) {
        if let Some(current) = self.shared.state.lock().in_flight.as_mut() {
            current.state = new;
        }
    }

    fn is_shutdown(&self) -> bool {
        self.shared.state.lock().shutdown
    }

    /// Drive one command to a terminal state
    fn dispatch_next(&mut self, command: &Command) -> (CommandState, Result<Reply>) {
        let bytes = command.request.encode(command.slot, command.seq);
        debug!(
            slot = command.slot,
            seq = command.seq,
            command = command.request.name(),
            "Dispatching command"
        );

        if let Err(e) = self.transport.submit(&bytes, self.config.submit_timeout) {
            return (CommandState::TransportError, Err(e.into()));
        }
        self.set_state(CommandState::AwaitingReply);

        let reply_timeout = match &command.request {
            Request::XfrBlock { bwi, .. } if *bwi > 1 => {
                self.config.reply_timeout.saturating_mul(u32::from(*bwi))
            }
            _ => self.config.reply_timeout,
        };

        loop {
            if self.is_shutdown() {
                return (CommandState::Aborted, Err(Error::DeviceGone));
            }
            let raw = match self.transport.receive_reply(reply_timeout) {
                Ok(raw) => raw,
                Err(e) => return (CommandState::TransportError, Err(e.into())),
            };
            let reply = match Reply::decode(&raw) {
                Ok(reply) => reply,
                Err(e) => {
                    warn!(error = %e, "Dropping malformed reply");
                    return (
                        CommandState::Aborted,
                        Err(PipelineError::Malformed(e).into()),
                    );
                }
            };
            if reply.seq != command.seq {
                warn!(expected = command.seq, got = reply.seq, "Reply sequence mismatch");
                return (
                    CommandState::Aborted,
                    Err(PipelineError::SequenceMismatch {
                        expected: command.seq,
                        got: reply.seq,
                    }
                    .into()),
                );
            }
            if reply.status.command == CommandStatus::TimeExtension {
                trace!(seq = command.seq, "Reader requested more time");
                continue;
            }
            return (CommandState::Completed, Ok(reply));
        }
    }

    /// Complete, release the sequence number and clear the in-flight slot
    fn finish(&self, command: Command, state: CommandState, result: Result<Reply>) {
        trace!(seq = command.seq, %state, "Command finished");
        {
            let mut shared = self.shared.state.lock();
            shared.pool.release(command.seq);
            shared.in_flight = None;
        }
        if !command.completer.complete(result) {
            trace!(seq = command.seq, "Command was already cancelled");
        }
    }
}
