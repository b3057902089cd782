//! Frame layout, command codes and payload helpers.
//!
//! Every request and response starts with a 10-byte header:
//!
//! | Byte | Field | Description |
//! |------|-------|-------------|
//! | 0-1 | MAGIC | `0x4D 0x37` ("M7") |
//! | 2 | KIND | `0x01` request, `0x81` response |
//! | 3 | UNIT | Unit number of the session (1-255) |
//! | 4-5 | CMD | Command code (LE) |
//! | 6-7 | SEQ | Sequence number (LE), echoed by the controller |
//! | 8-9 | LEN | Payload length in bytes (LE) |
//!
//! A response payload starts with a 4-byte status word (LE). Zero means
//! success and is followed by the command-specific data; any other value is
//! a controller error code and nothing follows.
//!
//! # Example
//!
//! ```
//! use m700_nc::{CommandCode, FrameHeader, FRAME_HEADER_SIZE};
//!
//! let header = FrameHeader::request(1, CommandCode::DeviceRead, 7, 7);
//! let bytes = header.to_bytes();
//! assert_eq!(bytes.len(), FRAME_HEADER_SIZE);
//! assert_eq!(FrameHeader::from_bytes(&bytes).unwrap(), header);
//! ```

use crate::error::{NcError, Result};

/// Frame header size in bytes.
pub const FRAME_HEADER_SIZE: usize = 10;

/// Size of the status word that opens every response payload.
pub const STATUS_SIZE: usize = 4;

/// Largest payload a single frame may carry.
pub const MAX_PAYLOAD_SIZE: usize = 1024;

/// Largest frame on the wire.
pub const MAX_FRAME_SIZE: usize = FRAME_HEADER_SIZE + MAX_PAYLOAD_SIZE;

pub(crate) const MAGIC: [u8; 2] = [0x4D, 0x37];
pub(crate) const KIND_REQUEST: u8 = 0x01;
pub(crate) const KIND_RESPONSE: u8 = 0x81;

/// Command codes understood by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandCode {
    /// Read one device.
    DeviceRead,
    /// Write one device.
    DeviceWrite,
    /// Drive information string.
    DriveInfo,
    /// System version string.
    Version,
    /// Operating status.
    RunStatus,
    /// Spindle monitor value.
    SpindleMonitor,
    /// Current axis position.
    CurrentPosition,
    /// Active alarm messages.
    Alarms,
    /// Name of a common variable.
    CommonVariableName,
    /// Magazine pot count.
    MagazineSize,
    /// Tool number in a magazine position.
    MagazineReady,
    /// Tool set size.
    ToolSetSize,
    /// Read a tool offset.
    ToolOffsetRead,
    /// Write a tool offset.
    ToolOffsetWrite,
    /// Program number during search or automatic operation.
    ProgramNumber,
    /// Open a file for reading or writing.
    FileOpen,
    /// Read one chunk of the open file.
    FileRead,
    /// Write one chunk of the open file.
    FileWrite,
    /// Close the open file, committing writes.
    FileClose,
    /// Abandon the open file.
    FileAbort,
    /// Delete a file.
    FileDelete,
    /// Start a directory search.
    DirFind,
    /// Next directory search result.
    DirNext,
    /// Reset the directory search.
    DirReset,
}

impl CommandCode {
    /// Returns the wire code.
    pub fn code(self) -> u16 {
        match self {
            CommandCode::DeviceRead => 0x0101,
            CommandCode::DeviceWrite => 0x0102,
            CommandCode::DriveInfo => 0x0201,
            CommandCode::Version => 0x0202,
            CommandCode::RunStatus => 0x0203,
            CommandCode::SpindleMonitor => 0x0204,
            CommandCode::CurrentPosition => 0x0205,
            CommandCode::Alarms => 0x0206,
            CommandCode::CommonVariableName => 0x0207,
            CommandCode::MagazineSize => 0x0301,
            CommandCode::MagazineReady => 0x0302,
            CommandCode::ToolSetSize => 0x0303,
            CommandCode::ToolOffsetRead => 0x0304,
            CommandCode::ToolOffsetWrite => 0x0305,
            CommandCode::ProgramNumber => 0x0306,
            CommandCode::FileOpen => 0x0401,
            CommandCode::FileRead => 0x0402,
            CommandCode::FileWrite => 0x0403,
            CommandCode::FileClose => 0x0404,
            CommandCode::FileAbort => 0x0405,
            CommandCode::FileDelete => 0x0406,
            CommandCode::DirFind => 0x0501,
            CommandCode::DirNext => 0x0502,
            CommandCode::DirReset => 0x0503,
        }
    }

    /// Looks up a command by wire code.
    pub fn from_code(code: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.code() == code)
    }

    /// All command codes.
    pub const ALL: [CommandCode; 24] = [
        CommandCode::DeviceRead,
        CommandCode::DeviceWrite,
        CommandCode::DriveInfo,
        CommandCode::Version,
        CommandCode::RunStatus,
        CommandCode::SpindleMonitor,
        CommandCode::CurrentPosition,
        CommandCode::Alarms,
        CommandCode::CommonVariableName,
        CommandCode::MagazineSize,
        CommandCode::MagazineReady,
        CommandCode::ToolSetSize,
        CommandCode::ToolOffsetRead,
        CommandCode::ToolOffsetWrite,
        CommandCode::ProgramNumber,
        CommandCode::FileOpen,
        CommandCode::FileRead,
        CommandCode::FileWrite,
        CommandCode::FileClose,
        CommandCode::FileAbort,
        CommandCode::FileDelete,
        CommandCode::DirFind,
        CommandCode::DirNext,
        CommandCode::DirReset,
    ];

    /// Returns whether repeating the command has no additional effect.
    ///
    /// Only idempotent commands are retried after a timeout. A chunk read
    /// names its chunk index, so repeating it is safe; a chunk write is not.
    pub fn is_idempotent(self) -> bool {
        matches!(
            self,
            CommandCode::DeviceRead
                | CommandCode::DriveInfo
                | CommandCode::Version
                | CommandCode::RunStatus
                | CommandCode::SpindleMonitor
                | CommandCode::CurrentPosition
                | CommandCode::Alarms
                | CommandCode::CommonVariableName
                | CommandCode::MagazineSize
                | CommandCode::MagazineReady
                | CommandCode::ToolSetSize
                | CommandCode::ToolOffsetRead
                | CommandCode::ProgramNumber
                | CommandCode::FileRead
                | CommandCode::DirFind
        )
    }

    /// Returns the timeout class of the command.
    pub fn class(self) -> OperationClass {
        match self {
            CommandCode::DeviceRead | CommandCode::DeviceWrite => OperationClass::Device,
            CommandCode::FileOpen
            | CommandCode::FileRead
            | CommandCode::FileWrite
            | CommandCode::FileClose
            | CommandCode::FileAbort
            | CommandCode::FileDelete
            | CommandCode::DirFind
            | CommandCode::DirNext
            | CommandCode::DirReset => OperationClass::File,
            _ => OperationClass::Status,
        }
    }
}

impl std::fmt::Display for CommandCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}(0x{:04X})", self, self.code())
    }
}

/// Timeout class of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationClass {
    /// Device reads and writes.
    Device,
    /// Status and tool queries.
    Status,
    /// File and directory operations.
    File,
}

/// Frame header (10 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// `0x01` for requests, `0x81` for responses.
    pub kind: u8,
    /// Unit number of the session.
    pub unit: u8,
    /// Raw command code.
    pub command: u16,
    /// Sequence number used to match responses with requests.
    pub sequence: u16,
    /// Payload length in bytes.
    pub length: u16,
}

impl FrameHeader {
    /// Creates a request header.
    pub fn request(unit: u8, command: CommandCode, sequence: u16, length: u16) -> Self {
        Self {
            kind: KIND_REQUEST,
            unit,
            command: command.code(),
            sequence,
            length,
        }
    }

    /// Creates a response header.
    pub fn response(unit: u8, command: u16, sequence: u16, length: u16) -> Self {
        Self {
            kind: KIND_RESPONSE,
            unit,
            command,
            sequence,
            length,
        }
    }

    /// Serializes the header to bytes.
    pub fn to_bytes(self) -> [u8; FRAME_HEADER_SIZE] {
        let command = self.command.to_le_bytes();
        let sequence = self.sequence.to_le_bytes();
        let length = self.length.to_le_bytes();
        [
            MAGIC[0],
            MAGIC[1],
            self.kind,
            self.unit,
            command[0],
            command[1],
            sequence[0],
            sequence[1],
            length[0],
            length[1],
        ]
    }

    /// Parses a header from bytes.
    ///
    /// # Errors
    ///
    /// Returns `NcError::ProtocolError` if the slice is too short or the
    /// magic bytes are wrong.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < FRAME_HEADER_SIZE {
            return Err(NcError::protocol(format!(
                "header too short: expected {} bytes, got {}",
                FRAME_HEADER_SIZE,
                data.len()
            )));
        }
        if data[..2] != MAGIC {
            return Err(NcError::protocol(format!(
                "bad magic 0x{:02X}{:02X}",
                data[0], data[1]
            )));
        }
        Ok(Self {
            kind: data[2],
            unit: data[3],
            command: u16::from_le_bytes([data[4], data[5]]),
            sequence: u16::from_le_bytes([data[6], data[7]]),
            length: u16::from_le_bytes([data[8], data[9]]),
        })
    }
}

/// Shape a response payload must have to be accepted.
///
/// Sizes exclude the status word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseShape {
    /// No data after the status word.
    Empty,
    /// Exactly this many data bytes.
    Exact(usize),
    /// At least this many data bytes.
    AtLeast(usize),
}

impl ResponseShape {
    fn accepts(self, len: usize) -> bool {
        match self {
            ResponseShape::Empty => len == 0,
            ResponseShape::Exact(n) => len == n,
            ResponseShape::AtLeast(n) => len >= n,
        }
    }
}

/// A command ready to be framed and sent.
#[derive(Debug, Clone)]
pub struct Request {
    /// Command to run.
    pub command: CommandCode,
    /// Command-specific payload.
    pub payload: Vec<u8>,
    /// Shape the successful response must have.
    pub shape: ResponseShape,
}

impl Request {
    /// Creates a request.
    pub fn new(command: CommandCode, payload: Vec<u8>, shape: ResponseShape) -> Self {
        Self {
            command,
            payload,
            shape,
        }
    }

    /// Frames the request with the given unit and sequence.
    ///
    /// # Errors
    ///
    /// Returns `NcError::InvalidParameter` if the payload is too large.
    pub fn to_bytes(&self, unit: u8, sequence: u16) -> Result<Vec<u8>> {
        if self.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(NcError::invalid_parameter(
                "payload",
                format!(
                    "{} bytes exceeds the {} byte frame limit",
                    self.payload.len(),
                    MAX_PAYLOAD_SIZE
                ),
            ));
        }
        let header = FrameHeader::request(unit, self.command, sequence, self.payload.len() as u16);
        let mut bytes = Vec::with_capacity(FRAME_HEADER_SIZE + self.payload.len());
        bytes.extend_from_slice(&header.to_bytes());
        bytes.extend_from_slice(&self.payload);
        Ok(bytes)
    }
}

/// Parsed response frame.
#[derive(Debug, Clone)]
pub struct Response {
    /// Response header.
    pub header: FrameHeader,
    /// Status word (0 = success).
    pub status: u32,
    /// Data after the status word.
    pub data: Vec<u8>,
}

impl Response {
    /// Parses a response frame.
    ///
    /// # Errors
    ///
    /// Returns `NcError::ProtocolError` if the frame is truncated, is not a
    /// response, or its declared length disagrees with the bytes received.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let header = FrameHeader::from_bytes(data)?;
        if header.kind != KIND_RESPONSE {
            return Err(NcError::protocol(format!(
                "expected response kind 0x{:02X}, got 0x{:02X}",
                KIND_RESPONSE, header.kind
            )));
        }
        let payload = &data[FRAME_HEADER_SIZE..];
        if payload.len() != usize::from(header.length) {
            return Err(NcError::protocol(format!(
                "declared payload length {} but received {} bytes",
                header.length,
                payload.len()
            )));
        }
        let (status, rest) = payload
            .split_first_chunk::<STATUS_SIZE>()
            .ok_or_else(|| NcError::protocol("response payload lacks a status word"))?;
        Ok(Self {
            header,
            status: u32::from_le_bytes(*status),
            data: rest.to_vec(),
        })
    }

    /// Checks that this response answers `command` / `sequence`.
    ///
    /// # Errors
    ///
    /// Returns `NcError::ProtocolError` on a command or sequence mismatch.
    pub fn check_correlation(&self, command: CommandCode, sequence: u16) -> Result<()> {
        if self.header.command != command.code() {
            return Err(NcError::protocol(format!(
                "response to command 0x{:04X} while waiting for {}",
                self.header.command, command
            )));
        }
        if self.header.sequence != sequence {
            return Err(NcError::protocol(format!(
                "sequence mismatch: expected {}, received {}",
                sequence, self.header.sequence
            )));
        }
        Ok(())
    }

    /// Returns an error if the controller reported a failure.
    pub fn check_status(&self) -> Result<()> {
        if self.status == 0 {
            Ok(())
        } else {
            Err(NcError::controller(self.status))
        }
    }

    /// Checks the data against the expected shape.
    pub fn check_shape(&self, shape: ResponseShape) -> Result<()> {
        if shape.accepts(self.data.len()) {
            Ok(())
        } else {
            Err(NcError::protocol(format!(
                "unexpected response size {} for shape {:?}",
                self.data.len(),
                shape
            )))
        }
    }

    /// Returns a reader over the response data.
    pub fn reader(&self) -> PayloadReader<'_> {
        PayloadReader::new(&self.data)
    }
}

/// Little-endian payload builder.
#[derive(Debug, Default)]
pub struct PayloadWriter {
    buf: Vec<u8>,
}

impl PayloadWriter {
    /// Creates an empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a byte.
    pub fn u8(mut self, v: u8) -> Self {
        self.buf.push(v);
        self
    }

    /// Appends a `u16`.
    pub fn u16(mut self, v: u16) -> Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    /// Appends a `u32`.
    pub fn u32(mut self, v: u32) -> Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    /// Appends an `i32`.
    pub fn i32(mut self, v: i32) -> Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    /// Appends an `f64`.
    pub fn f64(mut self, v: f64) -> Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    /// Appends a `u16` length followed by the UTF-8 bytes.
    pub fn str(mut self, s: &str) -> Self {
        self.buf.extend_from_slice(&(s.len() as u16).to_le_bytes());
        self.buf.extend_from_slice(s.as_bytes());
        self
    }

    /// Appends raw bytes.
    pub fn bytes(mut self, b: &[u8]) -> Self {
        self.buf.extend_from_slice(b);
        self
    }

    /// Returns the built payload.
    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Little-endian payload reader; every shortfall is a protocol error.
#[derive(Debug)]
pub struct PayloadReader<'a> {
    data: &'a [u8],
}

impl<'a> PayloadReader<'a> {
    /// Creates a reader over `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.data.len() < n {
            return Err(NcError::protocol(format!(
                "truncated payload: needed {} more byte(s), {} left",
                n,
                self.data.len()
            )));
        }
        let (head, tail) = self.data.split_at(n);
        self.data = tail;
        Ok(head)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    /// Reads a byte.
    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    /// Reads a `u16`.
    pub fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    /// Reads a `u32`.
    pub fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    /// Reads an `i32`.
    pub fn i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.array()?))
    }

    /// Reads a `u64`.
    pub fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    /// Reads an `f64`.
    pub fn f64(&mut self) -> Result<f64> {
        Ok(f64::from_le_bytes(self.array()?))
    }

    /// Reads a length-prefixed UTF-8 string.
    pub fn str(&mut self) -> Result<String> {
        let len = usize::from(self.u16()?);
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes)
            .map(str::to_string)
            .map_err(|e| NcError::protocol(format!("string is not UTF-8: {}", e)))
    }

    /// Returns every remaining byte.
    pub fn rest(&mut self) -> &'a [u8] {
        std::mem::take(&mut self.data)
    }

    /// Fails if unread bytes remain.
    pub fn finish(self) -> Result<()> {
        if self.data.is_empty() {
            Ok(())
        } else {
            Err(NcError::protocol(format!(
                "{} trailing byte(s) in payload",
                self.data.len()
            )))
        }
    }
}
