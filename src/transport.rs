//! Transport layer for NC communication.
//!
//! The [`Transport`] trait is the only seam between the protocol core and
//! the network. It moves opaque frames and knows nothing about commands,
//! devices or files. [`TcpTransport`] is the stock implementation.
//!
//! Every call is bounded by its timeout as a whole. Bytes of a reply that
//! arrive after the deadline are kept with the link and delivered by the
//! next [`Transport::receive`].
//!
//! # Constants
//!
//! - [`DEFAULT_PORT`] - Default controller port (683)
//! - [`DEFAULT_CONNECT_TIMEOUT`] - Default connect timeout (5 seconds)
//!
//! # Example
//!
//! ```no_run
//! use m700_nc::{Endpoint, TcpTransport, Transport};
//! use std::time::Duration;
//!
//! let endpoint: Endpoint = "192.168.1.20:683".parse().unwrap();
//! let mut transport = TcpTransport::new();
//! let mut link = transport.connect(&endpoint, Duration::from_secs(5)).unwrap();
//! let request = vec![0x4D, 0x37, 0x01, /* ... rest of frame */];
//! let reply = transport.send_and_receive(&mut link, &request, Duration::from_secs(2));
//! transport.close(link);
//! ```

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::str::FromStr;
use std::time::{Duration, Instant};

use crate::error::{NcError, TransportError};
use crate::frame::{FRAME_HEADER_SIZE, MAGIC, MAX_PAYLOAD_SIZE};

/// Default controller port.
pub const DEFAULT_PORT: u16 = 683;

/// Default timeout for establishing the link.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Network location of a controller.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    /// Creates an endpoint.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Returns the host name or address.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns a copy with a different port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }
}

impl FromStr for Endpoint {
    type Err = NcError;

    /// Parses `"host:port"` or a bare `"host"` (default port).
    ///
    /// Bracketed IPv6 literals such as `"[::1]:683"` are accepted.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(NcError::invalid_parameter("endpoint", "must not be empty"));
        }

        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest.split_once(']').ok_or_else(|| {
                NcError::invalid_parameter("endpoint", format!("unterminated '[' in '{}'", s))
            })?;
            match tail.strip_prefix(':') {
                Some(port) => (host, Some(port)),
                None if tail.is_empty() => (host, None),
                None => {
                    return Err(NcError::invalid_parameter(
                        "endpoint",
                        format!("unexpected '{}' after address", tail),
                    ))
                }
            }
        } else {
            match s.rsplit_once(':') {
                Some((host, port)) if !host.contains(':') => (host, Some(port)),
                _ => (s, None),
            }
        };

        if host.is_empty() {
            return Err(NcError::invalid_parameter("endpoint", "missing host"));
        }
        let port = match port {
            Some(p) => p.parse::<u16>().map_err(|_| {
                NcError::invalid_parameter("endpoint", format!("invalid port '{}'", p))
            })?,
            None => DEFAULT_PORT,
        };
        Ok(Self::new(host, port))
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Byte-level link to a controller.
///
/// Implementations deliver whole request frames and return whole response
/// frames. Every call is bounded by the timeout it is given.
pub trait Transport {
    /// Handle to an open link.
    type Link;

    /// Establishes a link.
    ///
    /// # Errors
    ///
    /// `TransportError::Timeout` if the link is not up within `timeout`,
    /// any other variant for a refused or failed connection.
    fn connect(&mut self, endpoint: &Endpoint, timeout: Duration)
        -> Result<Self::Link, TransportError>;

    /// Sends one request frame.
    ///
    /// # Errors
    ///
    /// `TransportError::Timeout` if the frame could not be written in time.
    /// Any other variant means the link is no longer usable.
    fn send(
        &mut self,
        link: &mut Self::Link,
        request: &[u8],
        timeout: Duration,
    ) -> Result<(), TransportError>;

    /// Waits for the next reply frame.
    ///
    /// A frame that only partly arrived before the timeout is not lost; the
    /// next call continues it.
    ///
    /// # Errors
    ///
    /// `TransportError::Timeout` when no complete frame arrived in time.
    /// Any other variant means the link is no longer usable.
    fn receive(&mut self, link: &mut Self::Link, timeout: Duration)
        -> Result<Vec<u8>, TransportError>;

    /// Sends one frame and waits for the next reply, both within `timeout`.
    fn send_and_receive(
        &mut self,
        link: &mut Self::Link,
        request: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let deadline = Instant::now() + timeout;
        self.send(link, request, timeout)?;
        self.receive(link, time_left(deadline)?)
    }

    /// Releases the link. Never fails; errors are swallowed.
    fn close(&mut self, link: Self::Link);
}

/// Time remaining until `deadline`, or `Timeout` once it has passed.
pub(crate) fn time_left(deadline: Instant) -> Result<Duration, TransportError> {
    let left = deadline.saturating_duration_since(Instant::now());
    if left.is_zero() {
        Err(TransportError::Timeout)
    } else {
        Ok(left)
    }
}

/// TCP transport.
///
/// Reply frames are delimited by the length field in the frame header.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpTransport;

impl TcpTransport {
    /// Creates a TCP transport.
    pub fn new() -> Self {
        Self
    }
}

/// Open TCP link.
///
/// Bytes received past a deadline stay buffered here, so a late or split
/// reply never shifts the frame boundaries of the replies after it.
#[derive(Debug)]
pub struct TcpLink {
    stream: TcpStream,
    buffer: Vec<u8>,
}

impl TcpLink {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            buffer: Vec::new(),
        }
    }

    /// Splits the first complete frame off the buffer.
    fn take_frame(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        if self.buffer.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }
        if self.buffer[..2] != MAGIC {
            // Frame boundaries are lost: everything readable is one bad frame.
            self.drain();
            return Ok(Some(std::mem::take(&mut self.buffer)));
        }
        let length = usize::from(u16::from_le_bytes([self.buffer[8], self.buffer[9]]));
        if length > MAX_PAYLOAD_SIZE {
            return Err(TransportError::Other(format!(
                "reply declares {} payload bytes, limit is {}",
                length, MAX_PAYLOAD_SIZE
            )));
        }
        let total = FRAME_HEADER_SIZE + length;
        if self.buffer.len() < total {
            return Ok(None);
        }
        let rest = self.buffer.split_off(total);
        Ok(Some(std::mem::replace(&mut self.buffer, rest)))
    }

    /// Moves whatever the peer already sent into the buffer without blocking.
    fn drain(&mut self) {
        if self.stream.set_nonblocking(true).is_err() {
            return;
        }
        let mut chunk = [0u8; 512];
        while let Ok(n) = self.stream.read(&mut chunk) {
            if n == 0 {
                break;
            }
            self.buffer.extend_from_slice(&chunk[..n]);
        }
        let _ = self.stream.set_nonblocking(false);
    }
}

impl Transport for TcpTransport {
    type Link = TcpLink;

    fn connect(&mut self, endpoint: &Endpoint, timeout: Duration) -> Result<TcpLink, TransportError> {
        let addrs = (endpoint.host(), endpoint.port()).to_socket_addrs()?;
        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    return Ok(TcpLink::new(stream));
                }
                Err(e) => last_err = Some(e),
            }
        }
        match last_err {
            Some(e) => Err(map_io(e)),
            None => Err(TransportError::Other(format!(
                "no address found for {}",
                endpoint
            ))),
        }
    }

    fn send(&mut self, link: &mut TcpLink, request: &[u8], timeout: Duration) -> Result<(), TransportError> {
        let deadline = Instant::now() + timeout;
        let mut written = 0;
        while written < request.len() {
            link.stream.set_write_timeout(Some(time_left(deadline)?))?;
            match link.stream.write(&request[written..]) {
                Ok(0) => return Err(TransportError::Closed),
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(map_io(e)),
            }
        }
        Ok(())
    }

    fn receive(&mut self, link: &mut TcpLink, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let deadline = Instant::now() + timeout;
        let mut chunk = [0u8; 512];
        loop {
            if let Some(frame) = link.take_frame()? {
                return Ok(frame);
            }
            // Each read only gets what is left of the deadline.
            link.stream.set_read_timeout(Some(time_left(deadline)?))?;
            match link.stream.read(&mut chunk) {
                Ok(0) => return Err(TransportError::Closed),
                Ok(n) => link.buffer.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(map_io(e)),
            }
        }
    }

    fn close(&mut self, link: TcpLink) {
        let _ = link.stream.shutdown(Shutdown::Both);
    }
}

fn map_io(e: io::Error) -> TransportError {
    match e.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => TransportError::Timeout,
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe => TransportError::Closed,
        _ => TransportError::Io(e),
    }
}
