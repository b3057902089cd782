//! Command dispatch: framing, correlation, timeouts and retry.
//!
//! The [`Dispatcher`] owns the sequence counter of a session. Each call to
//! [`Channel::exchange`] frames one request, hands it to the transport with
//! the timeout of the command's class and checks that the reply answers
//! exactly that request.
//!
//! Retry policy:
//!
//! - a `Timeout` on an idempotent command is retried once with a fresh
//!   sequence number and the full deadline
//! - a `ProtocolError` is never retried; consecutive protocol errors are
//!   counted and the owner fails the session once the limit is reached
//! - controller errors and link failures are returned as they are
//!
//! A reply carrying an older sequence number than the pending request
//! answers an attempt that already timed out. It is dropped and the
//! dispatcher keeps waiting for the current reply until the deadline.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{NcError, Result, TransportError};
use crate::frame::{CommandCode, FrameHeader, OperationClass, Request, Response, KIND_RESPONSE};
use crate::transport::{time_left, Transport};

/// Default timeout for device reads and writes.
pub const DEFAULT_DEVICE_TIMEOUT: Duration = Duration::from_secs(2);

/// Default timeout for status and tool queries.
pub const DEFAULT_STATUS_TIMEOUT: Duration = Duration::from_secs(2);

/// Default timeout for each file or directory exchange.
pub const DEFAULT_FILE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default number of consecutive protocol errors that fails a session.
pub const DEFAULT_PROTOCOL_ERROR_LIMIT: u32 = 2;

/// Sequence distance below which a reply counts as late rather than foreign.
const STALE_WINDOW: u16 = 0x8000;

/// Per-class exchange timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Device reads and writes.
    pub device: Duration,
    /// Status and tool queries.
    pub status: Duration,
    /// File chunk and directory exchanges.
    pub file: Duration,
}

impl Timeouts {
    /// Returns the timeout for `class`.
    pub fn for_class(&self, class: OperationClass) -> Duration {
        match class {
            OperationClass::Device => self.device,
            OperationClass::Status => self.status,
            OperationClass::File => self.file,
        }
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            device: DEFAULT_DEVICE_TIMEOUT,
            status: DEFAULT_STATUS_TIMEOUT,
            file: DEFAULT_FILE_TIMEOUT,
        }
    }
}

/// Cooperative cancellation flag.
///
/// Cloning yields a handle to the same flag, so one clone can be handed to
/// another thread and cancelled from there. Cancellation is observed
/// between exchanges; an exchange already on the wire runs to completion
/// or timeout and its reply is discarded.
///
/// # Example
///
/// ```
/// use m700_nc::CancelToken;
///
/// let token = CancelToken::new();
/// let handle = token.clone();
/// handle.cancel();
/// assert!(token.is_cancelled());
/// ```
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Creates a token that is not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Returns whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(NcError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// The request currently awaiting its reply.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PendingCommand {
    pub(crate) command: CommandCode,
    pub(crate) sequence: u16,
    pub(crate) sent_at: Instant,
    pub(crate) deadline: Instant,
    pub(crate) attempt: u32,
}

/// Per-session dispatch state.
#[derive(Debug)]
pub(crate) struct Dispatcher {
    unit: u8,
    next_sequence: u16,
    timeouts: Timeouts,
    read_retry: bool,
    protocol_error_limit: u32,
    consecutive_protocol_errors: u32,
    pending: Option<PendingCommand>,
}

impl Dispatcher {
    pub(crate) fn new(unit: u8, timeouts: Timeouts, read_retry: bool, protocol_error_limit: u32) -> Self {
        Self {
            unit,
            next_sequence: 1,
            timeouts,
            read_retry,
            protocol_error_limit: protocol_error_limit.max(1),
            consecutive_protocol_errors: 0,
            pending: None,
        }
    }

    pub(crate) fn unit(&self) -> u8 {
        self.unit
    }

    /// Whether enough consecutive protocol errors occurred to fail the session.
    pub(crate) fn protocol_limit_reached(&self) -> bool {
        self.consecutive_protocol_errors >= self.protocol_error_limit
    }

    #[cfg(test)]
    pub(crate) fn pending(&self) -> Option<PendingCommand> {
        self.pending
    }

    fn take_sequence(&mut self) -> u16 {
        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);
        sequence
    }

    /// Sequence of `reply` if it answers an earlier request of this session.
    fn stale_sequence(&self, reply: &[u8], pending: &PendingCommand) -> Option<u16> {
        let header = FrameHeader::from_bytes(reply).ok()?;
        if header.kind != KIND_RESPONSE || header.unit != self.unit {
            return None;
        }
        let age = pending.sequence.wrapping_sub(header.sequence);
        (age != 0 && age < STALE_WINDOW).then_some(header.sequence)
    }

    fn validate(&mut self, reply: &[u8], request: &Request, pending: &PendingCommand) -> Result<Response> {
        let response = Response::from_bytes(reply)?;
        if response.header.unit != self.unit {
            return Err(NcError::protocol(format!(
                "reply for unit {} on session unit {}",
                response.header.unit, self.unit
            )));
        }
        response.check_correlation(pending.command, pending.sequence)?;
        // A well-formed reply, even a failing one, ends a run of protocol errors.
        self.consecutive_protocol_errors = 0;
        response.check_status()?;
        response.check_shape(request.shape)?;
        Ok(response)
    }
}

/// Borrowed view of a connected session used to run exchanges.
pub(crate) struct Channel<'a, T: Transport> {
    dispatcher: &'a mut Dispatcher,
    transport: &'a mut T,
    link: &'a mut T::Link,
}

impl<'a, T: Transport> Channel<'a, T> {
    pub(crate) fn new(dispatcher: &'a mut Dispatcher, transport: &'a mut T, link: &'a mut T::Link) -> Self {
        Self {
            dispatcher,
            transport,
            link,
        }
    }

    pub(crate) fn unit(&self) -> u8 {
        self.dispatcher.unit()
    }

    pub(crate) fn protocol_limit_reached(&self) -> bool {
        self.dispatcher.protocol_limit_reached()
    }

    /// Drops replies to earlier attempts and waits on for the pending one.
    fn skip_late_replies(
        &mut self,
        mut result: std::result::Result<Vec<u8>, TransportError>,
        pending: &PendingCommand,
    ) -> std::result::Result<Vec<u8>, TransportError> {
        while let Ok(reply) = &result {
            let stale = match self.dispatcher.stale_sequence(reply, pending) {
                Some(stale) => stale,
                None => break,
            };
            tracing::debug!(
                command = %pending.command,
                sequence = pending.sequence,
                stale,
                "discarding late reply"
            );
            result = time_left(pending.deadline).and_then(|left| self.transport.receive(self.link, left));
        }
        result
    }

    /// Sends `request` and returns its validated reply.
    ///
    /// # Errors
    ///
    /// - `NcError::Cancelled` if `cancel` is set before sending, between
    ///   attempts, or when the reply arrives (the reply is discarded)
    /// - `NcError::Timeout` if no reply came within the class deadline
    ///   (after the single retry for idempotent commands)
    /// - `NcError::ProtocolError` if the reply does not match the request
    /// - `NcError::ControllerError` if the controller reported a failure
    /// - `NcError::Transport` for any other transport failure
    pub(crate) fn exchange(&mut self, request: &Request, cancel: &CancelToken) -> Result<Response> {
        let command = request.command;
        let timeout = self.dispatcher.timeouts.for_class(command.class());
        let retryable = self.dispatcher.read_retry && command.is_idempotent();
        let mut attempt = 0u32;

        loop {
            cancel.check()?;
            let sequence = self.dispatcher.take_sequence();
            let frame = request.to_bytes(self.dispatcher.unit, sequence)?;
            let now = Instant::now();
            let pending = PendingCommand {
                command,
                sequence,
                sent_at: now,
                deadline: now + timeout,
                attempt,
            };
            self.dispatcher.pending = Some(pending);

            tracing::debug!(
                command = %command,
                sequence,
                attempt = pending.attempt,
                bytes = frame.len(),
                "sending request"
            );
            let result = self.transport.send_and_receive(self.link, &frame, timeout);
            let result = self.skip_late_replies(result, &pending);
            self.dispatcher.pending = None;

            match result {
                Ok(reply) => {
                    tracing::debug!(
                        command = %command,
                        sequence,
                        bytes = reply.len(),
                        elapsed_ms = pending.sent_at.elapsed().as_millis() as u64,
                        late = Instant::now() > pending.deadline,
                        "received reply"
                    );
                    if cancel.is_cancelled() {
                        tracing::debug!(command = %command, sequence, "discarding reply of cancelled request");
                        return Err(NcError::Cancelled);
                    }
                    let validated = self.dispatcher.validate(&reply, request, &pending);
                    if let Err(e @ NcError::ProtocolError { .. }) = &validated {
                        self.dispatcher.consecutive_protocol_errors += 1;
                        tracing::debug!(
                            command = %command,
                            sequence,
                            count = self.dispatcher.consecutive_protocol_errors,
                            error = %e,
                            "protocol error"
                        );
                    }
                    return validated;
                }
                Err(TransportError::Timeout) => {
                    if retryable && attempt == 0 && !cancel.is_cancelled() {
                        tracing::warn!(
                            command = %command,
                            sequence,
                            timeout_ms = timeout.as_millis() as u64,
                            "no reply, retrying once"
                        );
                        attempt += 1;
                        continue;
                    }
                    cancel.check()?;
                    return Err(NcError::Timeout { timeout });
                }
                Err(e) => {
                    tracing::debug!(command = %command, sequence, error = %e, "transport failure");
                    return Err(NcError::Transport(e));
                }
            }
        }
    }
}
