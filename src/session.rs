//! Session with one controller.
//!
//! A [`Session`] owns the link, the dispatcher state and the unit number of
//! one conversation with a controller. All operations go through it.
//!
//! # Lifecycle
//!
//! ```text
//! Disconnected --open()--> Connecting --ok--> Connected --close()--> Closing --> Disconnected
//!                               |                  |
//!                               +------error-------+--link loss / protocol errors--> Failed
//! ```
//!
//! `Failed` is terminal: create a new session to reconnect.
//!
//! # Concurrency
//!
//! A session runs one command at a time. Callers on different threads are
//! served in arrival order; each call returns only after its exchanges have
//! completed or timed out.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::device::{resolve, AccessWidth, DeviceAddress};
use crate::dispatcher::{CancelToken, Channel, Dispatcher, Timeouts, DEFAULT_PROTOCOL_ERROR_LIMIT};
use crate::error::{NcError, Result, TransportError};
use crate::file::{self, FileEntry, DEFAULT_CHUNK_SIZE};
use crate::frame::{CommandCode, PayloadWriter, Request, ResponseShape};
use crate::status::{
    self, AlarmRecord, Axis, ProgramType, RunStatus, SpindleParameter, StatusSnapshot,
    ToolOffsetKind,
};
use crate::transport::{Endpoint, TcpTransport, Transport, DEFAULT_CONNECT_TIMEOUT};
use crate::unit::{UnitGuard, UnitPool};
use crate::value::{decode, encode, DeviceValue, Value, ValueType};

/// Connection state of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// No link. Initial state and the state after `close()`.
    Disconnected,
    /// `open()` is establishing the link.
    Connecting,
    /// Ready for operations.
    Connected,
    /// `close()` is releasing the link.
    Closing,
    /// The link was lost or the controller stopped speaking the protocol.
    Failed,
}

impl SessionState {
    fn to_u8(self) -> u8 {
        match self {
            SessionState::Disconnected => 0,
            SessionState::Connecting => 1,
            SessionState::Connected => 2,
            SessionState::Closing => 3,
            SessionState::Failed => 4,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => SessionState::Disconnected,
            1 => SessionState::Connecting,
            2 => SessionState::Connected,
            3 => SessionState::Closing,
            _ => SessionState::Failed,
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Closing => "closing",
            SessionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Configuration for a [`Session`].
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Controller address.
    pub endpoint: Endpoint,
    /// Fixed unit number, or `None` to take the lowest free one.
    pub unit: Option<u8>,
    /// Per-class exchange timeouts.
    pub timeouts: Timeouts,
    /// Timeout for establishing the link.
    pub connect_timeout: Duration,
    /// Bytes per file chunk.
    pub chunk_size: usize,
    /// Retry idempotent commands once after a timeout.
    pub read_retry: bool,
    /// Consecutive protocol errors that fail the session.
    pub protocol_error_limit: u32,
    /// Longest time a call waits behind other callers, or `None` to wait
    /// as long as it takes.
    pub queue_timeout: Option<Duration>,
}

impl SessionConfig {
    /// Creates a configuration with default timeouts and chunk size.
    ///
    /// # Example
    ///
    /// ```
    /// use m700_nc::SessionConfig;
    ///
    /// let config = SessionConfig::new("192.168.1.20".parse().unwrap());
    /// assert_eq!(config.endpoint.port(), 683);
    /// ```
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            unit: None,
            timeouts: Timeouts::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            chunk_size: DEFAULT_CHUNK_SIZE,
            read_retry: true,
            protocol_error_limit: DEFAULT_PROTOCOL_ERROR_LIMIT,
            queue_timeout: None,
        }
    }

    /// Sets the controller port (default 683).
    pub fn with_port(mut self, port: u16) -> Self {
        self.endpoint = self.endpoint.with_port(port);
        self
    }

    /// Uses a fixed unit number instead of an allocated one.
    pub fn with_unit(mut self, unit: u8) -> Self {
        self.unit = Some(unit);
        self
    }

    /// Sets the device read/write timeout (default 2 seconds).
    pub fn with_device_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.device = timeout;
        self
    }

    /// Sets the status query timeout (default 2 seconds).
    pub fn with_status_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.status = timeout;
        self
    }

    /// Sets the per-chunk file timeout (default 10 seconds).
    ///
    /// # Example
    ///
    /// ```
    /// use m700_nc::SessionConfig;
    /// use std::time::Duration;
    ///
    /// let config = SessionConfig::new("cnc-01".parse().unwrap())
    ///     .with_file_timeout(Duration::from_secs(30))
    ///     .with_chunk_size(512);
    /// ```
    pub fn with_file_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.file = timeout;
        self
    }

    /// Sets the connect timeout (default 5 seconds).
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the file chunk size (default 256 bytes).
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Enables or disables the single timeout retry of idempotent commands.
    pub fn with_read_retry(mut self, enabled: bool) -> Self {
        self.read_retry = enabled;
        self
    }

    /// Sets how many consecutive protocol errors fail the session (default 2).
    pub fn with_protocol_error_limit(mut self, limit: u32) -> Self {
        self.protocol_error_limit = limit;
        self
    }

    /// Bounds how long a call waits for its turn (unbounded by default).
    ///
    /// A call that does not get its turn in time fails with
    /// `NcError::Timeout` without sending anything.
    pub fn with_queue_timeout(mut self, timeout: Duration) -> Self {
        self.queue_timeout = Some(timeout);
        self
    }

    /// Checks the configuration.
    ///
    /// # Errors
    ///
    /// Returns `NcError::InvalidParameter` for a zero unit, a zero timeout,
    /// a chunk size outside `1..=MAX_CHUNK_SIZE` or a zero error limit.
    pub fn validate(&self) -> Result<()> {
        if self.unit == Some(0) {
            return Err(NcError::invalid_parameter("unit", "must be between 1 and 255"));
        }
        let timeouts = [
            ("device_timeout", self.timeouts.device),
            ("status_timeout", self.timeouts.status),
            ("file_timeout", self.timeouts.file),
            ("connect_timeout", self.connect_timeout),
        ];
        for (name, timeout) in timeouts {
            if timeout.is_zero() {
                return Err(NcError::invalid_parameter(name, "must be greater than 0"));
            }
        }
        if self.queue_timeout.is_some_and(|t| t.is_zero()) {
            return Err(NcError::invalid_parameter("queue_timeout", "must be greater than 0"));
        }
        file::check_chunk_size(self.chunk_size)?;
        if self.protocol_error_limit == 0 {
            return Err(NcError::invalid_parameter(
                "protocol_error_limit",
                "must be greater than 0",
            ));
        }
        Ok(())
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new(Endpoint::new("127.0.0.1", crate::transport::DEFAULT_PORT))
    }
}

/// Grants access in strict arrival order.
#[derive(Debug, Default)]
struct TicketGate {
    tickets: Mutex<Tickets>,
    turn: Condvar,
}

#[derive(Debug, Default)]
struct Tickets {
    next: u64,
    serving: u64,
    abandoned: BTreeSet<u64>,
}

impl Tickets {
    fn issue(&mut self) -> u64 {
        let ticket = self.next;
        self.next += 1;
        ticket
    }

    /// Moves to the next ticket still waiting.
    fn advance(&mut self) {
        self.serving += 1;
        while self.abandoned.remove(&self.serving) {
            self.serving += 1;
        }
    }
}

struct GatePass<'a> {
    gate: &'a TicketGate,
}

impl TicketGate {
    fn enter(&self) -> GatePass<'_> {
        let mut tickets = self.tickets.lock().unwrap_or_else(PoisonError::into_inner);
        let ticket = tickets.issue();
        let _turn = self
            .turn
            .wait_while(tickets, |t| t.serving != ticket)
            .unwrap_or_else(PoisonError::into_inner);
        GatePass { gate: self }
    }

    /// Like `enter`, but gives up after `timeout` if one is set.
    ///
    /// A caller that gives up leaves the queue; the callers behind it keep
    /// their order.
    fn enter_within(&self, timeout: Option<Duration>) -> Result<GatePass<'_>> {
        let Some(timeout) = timeout else {
            return Ok(self.enter());
        };
        let mut tickets = self.tickets.lock().unwrap_or_else(PoisonError::into_inner);
        let ticket = tickets.issue();
        let (mut tickets, _) = self
            .turn
            .wait_timeout_while(tickets, timeout, |t| t.serving != ticket)
            .unwrap_or_else(PoisonError::into_inner);
        if tickets.serving != ticket {
            tickets.abandoned.insert(ticket);
            return Err(NcError::Timeout { timeout });
        }
        Ok(GatePass { gate: self })
    }

    #[cfg(test)]
    fn issued(&self) -> u64 {
        self.tickets.lock().unwrap_or_else(PoisonError::into_inner).next
    }
}

impl Drop for GatePass<'_> {
    fn drop(&mut self) {
        let mut tickets = self.gate.tickets.lock().unwrap_or_else(PoisonError::into_inner);
        tickets.advance();
        drop(tickets);
        self.gate.turn.notify_all();
    }
}

struct Inner<T: Transport> {
    transport: T,
    link: Option<T::Link>,
    dispatcher: Option<Dispatcher>,
    unit: Option<UnitGuard<'static>>,
}

impl<T: Transport> Inner<T> {
    fn release(&mut self) {
        if let Some(link) = self.link.take() {
            self.transport.close(link);
        }
        self.dispatcher = None;
        self.unit = None;
    }
}

/// Session with one M700-series controller.
///
/// # Example
///
/// ```no_run
/// use m700_nc::{Session, SessionConfig, Value};
///
/// let config = SessionConfig::new("192.168.1.20:683".parse().unwrap());
/// let session = Session::connect(config).unwrap();
///
/// let flag = session.read_device("M900").unwrap();
/// session.write_device("D100", Value::I16(42)).unwrap();
///
/// let program = session.read_file("M01:/PRG/USER/O1000").unwrap();
/// println!("{} {} bytes", flag, program.len());
///
/// session.close();
/// ```
pub struct Session<T: Transport> {
    config: SessionConfig,
    state: AtomicU8,
    gate: TicketGate,
    inner: Mutex<Inner<T>>,
}

impl Session<TcpTransport> {
    /// Opens a TCP session.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the controller
    /// cannot be reached within the connect timeout.
    pub fn connect(config: SessionConfig) -> Result<Self> {
        let session = Self::new(TcpTransport::new(), config);
        session.open()?;
        Ok(session)
    }
}

impl<T: Transport> Session<T> {
    /// Creates a disconnected session over `transport`.
    pub fn new(transport: T, config: SessionConfig) -> Self {
        Self {
            config,
            state: AtomicU8::new(SessionState::Disconnected.to_u8()),
            gate: TicketGate::default(),
            inner: Mutex::new(Inner {
                transport,
                link: None,
                dispatcher: None,
                unit: None,
            }),
        }
    }

    /// Returns the current state.
    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Returns the unit number while connected.
    pub fn unit(&self) -> Option<u8> {
        let _pass = self.gate.enter();
        self.lock_inner().unit.as_ref().map(UnitGuard::unit)
    }

    fn set_state(&self, state: SessionState) {
        self.state.store(state.to_u8(), Ordering::SeqCst);
    }

    fn lock_inner(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Establishes the link.
    ///
    /// Does nothing if the session is already connected.
    ///
    /// # Errors
    ///
    /// - `NcError::InvalidParameter` for an invalid configuration or when
    ///   no unit number is available
    /// - `NcError::NotConnected` if the session has failed
    /// - `NcError::Timeout` / `NcError::Transport` if the link cannot be
    ///   established; the session is then `Failed`
    /// - `NcError::Timeout` if the configured queue timeout passes before
    ///   other callers are done; the state is unchanged
    pub fn open(&self) -> Result<()> {
        let _pass = self.gate.enter_within(self.config.queue_timeout)?;
        let mut guard = self.lock_inner();
        match self.state() {
            SessionState::Connected => return Ok(()),
            SessionState::Disconnected => {}
            state => return Err(NcError::NotConnected { state }),
        }
        self.config.validate()?;
        let unit = UnitPool::global().acquire(self.config.unit)?;

        self.set_state(SessionState::Connecting);
        tracing::info!(endpoint = %self.config.endpoint, unit = unit.unit(), "connecting");
        let inner = &mut *guard;
        match inner
            .transport
            .connect(&self.config.endpoint, self.config.connect_timeout)
        {
            Ok(link) => {
                inner.link = Some(link);
                inner.dispatcher = Some(Dispatcher::new(
                    unit.unit(),
                    self.config.timeouts,
                    self.config.read_retry,
                    self.config.protocol_error_limit,
                ));
                tracing::info!(endpoint = %self.config.endpoint, unit = unit.unit(), "session open");
                inner.unit = Some(unit);
                self.set_state(SessionState::Connected);
                Ok(())
            }
            Err(e) => {
                let err = match e {
                    TransportError::Timeout => NcError::Timeout {
                        timeout: self.config.connect_timeout,
                    },
                    other => NcError::Transport(other),
                };
                self.set_state(SessionState::Failed);
                tracing::error!(endpoint = %self.config.endpoint, error = %err, "connect failed");
                Err(err)
            }
        }
    }

    /// Releases the link and returns to `Disconnected`.
    ///
    /// A session that is not connected is left as it is.
    pub fn close(&self) {
        let _pass = self.gate.enter();
        let mut inner = self.lock_inner();
        if self.state() != SessionState::Connected {
            return;
        }
        self.set_state(SessionState::Closing);
        inner.release();
        self.set_state(SessionState::Disconnected);
        tracing::info!(endpoint = %self.config.endpoint, "session closed");
    }

    fn fail(&self, inner: &mut Inner<T>, cause: &NcError) {
        self.set_state(SessionState::Failed);
        tracing::error!(endpoint = %self.config.endpoint, error = %cause, "session failed");
        inner.release();
    }

    /// Runs `op` with exclusive use of the link.
    fn run<R>(&self, op: impl FnOnce(&mut Channel<'_, T>) -> Result<R>) -> Result<R> {
        let _pass = self.gate.enter_within(self.config.queue_timeout)?;
        let mut guard = self.lock_inner();
        let state = self.state();
        if state != SessionState::Connected {
            return Err(NcError::NotConnected { state });
        }
        let inner = &mut *guard;
        let (Some(link), Some(dispatcher)) = (inner.link.as_mut(), inner.dispatcher.as_mut()) else {
            return Err(NcError::NotConnected { state });
        };
        let mut channel = Channel::new(dispatcher, &mut inner.transport, link);
        let result = op(&mut channel);
        let exhausted = channel.protocol_limit_reached();
        if let Err(e) = &result {
            if e.is_link_failure() || exhausted {
                self.fail(inner, e);
            }
        }
        result
    }

    // ---- devices -------------------------------------------------------

    fn read_address(
        &self,
        address: DeviceAddress,
        expected: ValueType,
        cancel: &CancelToken,
    ) -> Result<DeviceValue> {
        let payload = PayloadWriter::new()
            .bytes(&address.to_bytes())
            .u8(expected.tag())
            .finish();
        self.run(|channel| {
            let request = Request::new(CommandCode::DeviceRead, payload, ResponseShape::AtLeast(1));
            let response = channel.exchange(&request, cancel)?;
            let value = decode(&response.data, &address)?;
            if value.value().value_type() != expected {
                return Err(NcError::protocol(format!(
                    "requested {} from {} but received {}",
                    expected,
                    address,
                    value.value().value_type()
                )));
            }
            Ok(value)
        })
    }

    /// Reads a device with the kind's default width.
    ///
    /// Bit devices read as [`Value::Bool`], word devices as [`Value::I16`].
    ///
    /// # Errors
    ///
    /// `NcError::InvalidAddress` for an unknown or out-of-range name (no
    /// exchange happens), plus every exchange error.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use m700_nc::{Session, SessionConfig, Value};
    ///
    /// let session = Session::connect(SessionConfig::new("192.168.1.20".parse().unwrap())).unwrap();
    /// let value = session.read_device("M900").unwrap();
    /// assert_eq!(value, Value::Bool(true));
    /// ```
    pub fn read_device(&self, name: &str) -> Result<DeviceValue> {
        self.read_device_with_cancel(name, &CancelToken::new())
    }

    /// [`read_device`](Self::read_device) with cancellation.
    pub fn read_device_with_cancel(&self, name: &str, cancel: &CancelToken) -> Result<DeviceValue> {
        let address = resolve(name)?;
        let expected = match address.width() {
            AccessWidth::Bit => ValueType::Bool,
            AccessWidth::Word => ValueType::I16,
            AccessWidth::DoubleWord => ValueType::I32,
        };
        self.read_address(address, expected, cancel)
    }

    /// Reads a device as a specific type.
    ///
    /// `I32` and `F32` read two consecutive words starting at the address.
    ///
    /// # Errors
    ///
    /// `NcError::TypeMismatch` if the device kind cannot hold the type,
    /// `NcError::InvalidAddress` if the access runs past the device range.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use m700_nc::{Session, SessionConfig, ValueType};
    ///
    /// let session = Session::connect(SessionConfig::new("192.168.1.20".parse().unwrap())).unwrap();
    /// let feed = session.read_device_as("D200", ValueType::F32).unwrap();
    /// ```
    pub fn read_device_as(&self, name: &str, value_type: ValueType) -> Result<DeviceValue> {
        self.read_device_as_with_cancel(name, value_type, &CancelToken::new())
    }

    /// [`read_device_as`](Self::read_device_as) with cancellation.
    pub fn read_device_as_with_cancel(
        &self,
        name: &str,
        value_type: ValueType,
        cancel: &CancelToken,
    ) -> Result<DeviceValue> {
        let address = resolve(name)?;
        if !address.kind().supports_width(value_type.width()) {
            return Err(NcError::type_mismatch(
                address.to_string(),
                format!("{} {}", address.kind(), address.width()),
                value_type.to_string(),
            ));
        }
        let address = address.with_width(value_type.width())?;
        self.read_address(address, value_type, cancel)
    }

    /// Writes a device.
    ///
    /// `I32` and `F32` values written to a word device occupy two
    /// consecutive words starting at the address.
    ///
    /// # Errors
    ///
    /// `NcError::InvalidAddress` or `NcError::TypeMismatch` before any
    /// exchange, plus every exchange error. Writes are never retried.
    pub fn write_device(&self, name: &str, value: impl Into<Value>) -> Result<()> {
        self.write_device_with_cancel(name, value, &CancelToken::new())
    }

    /// [`write_device`](Self::write_device) with cancellation.
    ///
    /// A write cancelled while its exchange is in flight may already have
    /// been applied by the controller.
    pub fn write_device_with_cancel(
        &self,
        name: &str,
        value: impl Into<Value>,
        cancel: &CancelToken,
    ) -> Result<()> {
        let value = value.into();
        let mut address = resolve(name)?;
        if value.value_type().width() == AccessWidth::DoubleWord
            && address.width() == AccessWidth::Word
        {
            address = address.with_width(AccessWidth::DoubleWord)?;
        }
        let encoded = encode(&value, &address)?;
        let payload = PayloadWriter::new()
            .bytes(&address.to_bytes())
            .bytes(&encoded)
            .finish();
        self.run(|channel| {
            channel.exchange(
                &Request::new(CommandCode::DeviceWrite, payload, ResponseShape::Empty),
                cancel,
            )?;
            tracing::debug!(address = %address, value = %value, "device written");
            Ok(())
        })
    }

    // ---- status --------------------------------------------------------

    /// Returns the first drive reported by the controller, e.g. `M01:`.
    pub fn drive_info(&self) -> Result<String> {
        self.run(|ch| status::drive_info(ch, &CancelToken::new()))
    }

    /// Returns the name assigned to common variable `index`.
    pub fn common_variable_name(&self, index: u32) -> Result<String> {
        self.run(|ch| status::common_variable_name(ch, index, &CancelToken::new()))
    }

    /// Returns the system version string.
    pub fn version(&self) -> Result<String> {
        self.run(|ch| status::version(ch, &CancelToken::new()))
    }

    /// Collects drive info, run state, alarms, spindle tool, speed and load.
    pub fn run_status(&self) -> Result<StatusSnapshot> {
        self.run(|ch| status::snapshot(ch, &CancelToken::new()))
    }

    /// Returns only the automatic operation state.
    pub fn run_state(&self) -> Result<RunStatus> {
        self.run(|ch| status::run_status(ch, &CancelToken::new()))
    }

    /// Returns the active alarms.
    pub fn alarms(&self) -> Result<Vec<AlarmRecord>> {
        self.run(|ch| status::alarms(ch, &CancelToken::new()))
    }

    /// Returns the current position of `axis`.
    pub fn current_position(&self, axis: Axis) -> Result<f64> {
        self.run(|ch| status::current_position(ch, axis, &CancelToken::new()))
    }

    /// Returns the spindle speed in rpm.
    pub fn spindle_speed(&self) -> Result<i32> {
        self.run(|ch| status::spindle_monitor(ch, SpindleParameter::Speed, &CancelToken::new()))
    }

    /// Returns the spindle load in percent.
    pub fn spindle_load(&self) -> Result<i32> {
        self.run(|ch| status::spindle_monitor(ch, SpindleParameter::Load, &CancelToken::new()))
    }

    /// Returns the cycle counter.
    pub fn cycle_counter(&self) -> Result<i32> {
        self.run(|ch| {
            status::spindle_monitor(ch, SpindleParameter::CycleCounter, &CancelToken::new())
        })
    }

    /// Returns the number of magazine pots.
    pub fn magazine_size(&self) -> Result<i32> {
        self.run(|ch| status::magazine_size(ch, &CancelToken::new()))
    }

    /// Returns the tool number in the spindle.
    pub fn tool_in_spindle(&self) -> Result<i32> {
        self.run(|ch| status::tool_in_spindle(ch, &CancelToken::new()))
    }

    /// Returns the number of tool offset sets.
    pub fn tool_set_size(&self) -> Result<i32> {
        self.run(|ch| status::tool_set_size(ch, &CancelToken::new()))
    }

    /// Reads a tool offset.
    pub fn tool_offset(&self, kind: ToolOffsetKind, set_no: u32) -> Result<f64> {
        self.run(|ch| status::tool_offset(ch, kind, set_no, &CancelToken::new()))
    }

    /// Writes a tool offset. Never retried.
    pub fn set_tool_offset(&self, kind: ToolOffsetKind, set_no: u32, value: f64) -> Result<()> {
        self.run(|ch| status::set_tool_offset(ch, kind, set_no, value, &CancelToken::new()))
    }

    /// Returns the main or sub program number in search or automatic operation.
    pub fn program_number(&self, program: ProgramType) -> Result<String> {
        self.run(|ch| status::program_number(ch, program, &CancelToken::new()))
    }

    // ---- files ---------------------------------------------------------

    /// Reads a whole controller file.
    ///
    /// # Errors
    ///
    /// `NcError::NotFound` if the file does not exist. Any failure after
    /// the file was opened aborts the transfer before returning.
    pub fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        self.read_file_with_cancel(path, &CancelToken::new())
    }

    /// [`read_file`](Self::read_file) with cancellation between chunks.
    pub fn read_file_with_cancel(&self, path: &str, cancel: &CancelToken) -> Result<Vec<u8>> {
        file::check_path(path)?;
        let chunk_size = self.config.chunk_size;
        self.run(|ch| file::read_file(ch, path, chunk_size, cancel))
    }

    /// Writes a controller file, replacing any existing content.
    ///
    /// # Errors
    ///
    /// `NcError::PermissionDenied` for a protected path. Any failure after
    /// the file was opened aborts the transfer before returning.
    pub fn write_file(&self, path: &str, data: &[u8]) -> Result<()> {
        self.write_file_with_cancel(path, data, &CancelToken::new())
    }

    /// [`write_file`](Self::write_file) with cancellation between chunks.
    ///
    /// Chunks sent before the cancellation may have reached the controller;
    /// the transfer is aborted so they are not committed.
    pub fn write_file_with_cancel(&self, path: &str, data: &[u8], cancel: &CancelToken) -> Result<()> {
        file::check_path(path)?;
        let chunk_size = self.config.chunk_size;
        self.run(|ch| file::write_file(ch, path, data, chunk_size, cancel))
    }

    /// Deletes a controller file.
    ///
    /// # Errors
    ///
    /// `NcError::NotFound` if absent, `NcError::PermissionDenied` if
    /// protected.
    pub fn delete_file(&self, path: &str) -> Result<()> {
        self.delete_file_with_cancel(path, &CancelToken::new())
    }

    /// [`delete_file`](Self::delete_file) with cancellation.
    ///
    /// A delete cancelled while its exchange is in flight may already have
    /// been applied by the controller.
    pub fn delete_file_with_cancel(&self, path: &str, cancel: &CancelToken) -> Result<()> {
        file::check_path(path)?;
        self.run(|ch| file::delete_file(ch, path, cancel))
    }

    /// Lists a directory: subdirectories first, then files, in controller
    /// order.
    ///
    /// A leading `M01` drive alias is replaced by the drive of this
    /// session's unit.
    pub fn list_directory(&self, path: &str) -> Result<Vec<FileEntry>> {
        file::check_path(path)?;
        self.run(|ch| file::list_directory(ch, path, &CancelToken::new()))
    }
}

impl<T: Transport> std::fmt::Debug for Session<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("endpoint", &self.config.endpoint)
            .field("state", &self.state())
            .finish()
    }
}

impl<T: Transport> Drop for Session<T> {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        if inner.link.is_some() {
            tracing::debug!(endpoint = %self.config.endpoint, "releasing link on drop");
        }
        inner.release();
    }
}
