//! Error types for the NC protocol.

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::session::SessionState;

/// Result type alias for NC operations.
pub type Result<T> = std::result::Result<T, NcError>;

/// Errors raised by a [`Transport`](crate::Transport) implementation.
///
/// The core treats these opaquely, except that a timeout is reported as
/// [`NcError::Timeout`] and everything else is considered a link failure.
#[derive(Debug, Error)]
pub enum TransportError {
    /// No reply arrived within the deadline handed to the transport.
    #[error("transport timed out")]
    Timeout,

    /// The peer closed the link.
    #[error("link closed by peer")]
    Closed,

    /// I/O error on the underlying link.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Any other adapter-specific failure.
    #[error("{0}")]
    Other(String),
}

/// Errors that can occur while talking to the controller.
#[derive(Debug, Error)]
pub enum NcError {
    /// The symbolic device name could not be resolved.
    #[error("Invalid address '{address}': {reason}")]
    InvalidAddress {
        /// The name as given by the caller.
        address: String,
        /// Description of the problem.
        reason: String,
    },

    /// The value's type cannot be stored at the target address.
    #[error("Type mismatch at {address}: {found} cannot be stored as {expected}")]
    TypeMismatch {
        /// Target address.
        address: String,
        /// Representation the address accepts.
        expected: String,
        /// Representation that was supplied.
        found: String,
    },

    /// Invalid parameter provided.
    #[error("Invalid parameter '{parameter}': {reason}")]
    InvalidParameter {
        /// Name of the invalid parameter.
        parameter: String,
        /// Description of why the parameter is invalid.
        reason: String,
    },

    /// The session is not in the `Connected` state.
    #[error("Session not connected (state: {state})")]
    NotConnected {
        /// State the session was in when the call was made.
        state: SessionState,
    },

    /// No response within the configured deadline.
    #[error("Communication timeout after {timeout:?}")]
    Timeout {
        /// Deadline that elapsed.
        timeout: Duration,
    },

    /// The reply does not match the request that was sent.
    #[error("Protocol error: {reason}")]
    ProtocolError {
        /// Description of the mismatch.
        reason: String,
    },

    /// The controller answered with an error code.
    #[error("Controller error 0x{code:08X} ({category}): {}", controller_error_description(*code).unwrap_or("unknown error"))]
    ControllerError {
        /// Raw error code reported by the controller.
        code: u32,
        /// Classification of the code.
        category: ErrorCategory,
    },

    /// The controller reports that the path does not exist.
    #[error("Not found: {path} (code 0x{code:08X})")]
    NotFound {
        /// Controller-resident path.
        path: String,
        /// Raw error code reported by the controller.
        code: u32,
    },

    /// The controller refuses the operation on a protected path.
    #[error("Permission denied: {path} (code 0x{code:08X})")]
    PermissionDenied {
        /// Controller-resident path.
        path: String,
        /// Raw error code reported by the controller.
        code: u32,
    },

    /// The caller cancelled the operation.
    #[error("Operation cancelled")]
    Cancelled,

    /// Error propagated from the transport adapter.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

impl NcError {
    /// Creates a new `InvalidAddress` error.
    ///
    /// # Example
    ///
    /// ```
    /// use m700_nc::NcError;
    ///
    /// let err = NcError::invalid_address("M99999", "index exceeds 10239");
    /// ```
    pub fn invalid_address(address: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidAddress {
            address: address.into(),
            reason: reason.into(),
        }
    }

    /// Creates a new `TypeMismatch` error.
    pub fn type_mismatch(
        address: impl Into<String>,
        expected: impl Into<String>,
        found: impl Into<String>,
    ) -> Self {
        Self::TypeMismatch {
            address: address.into(),
            expected: expected.into(),
            found: found.into(),
        }
    }

    /// Creates a new `InvalidParameter` error.
    ///
    /// # Example
    ///
    /// ```
    /// use m700_nc::NcError;
    ///
    /// let err = NcError::invalid_parameter("chunk_size", "must be greater than 0");
    /// ```
    pub fn invalid_parameter(parameter: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            parameter: parameter.into(),
            reason: reason.into(),
        }
    }

    /// Creates a new `ProtocolError`.
    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::ProtocolError {
            reason: reason.into(),
        }
    }

    /// Creates a `ControllerError` with the category derived from `code`.
    ///
    /// # Example
    ///
    /// ```
    /// use m700_nc::{ErrorCategory, NcError};
    ///
    /// let err = NcError::controller(0x8003_0242);
    /// assert_eq!(err.category(), Some(ErrorCategory::NotFound));
    /// ```
    pub fn controller(code: u32) -> Self {
        Self::ControllerError {
            code,
            category: ErrorCategory::from_code(code),
        }
    }

    /// Returns the category of a `ControllerError`.
    pub fn category(&self) -> Option<ErrorCategory> {
        match self {
            Self::ControllerError { category, .. } => Some(*category),
            _ => None,
        }
    }

    /// Returns the raw controller code for errors that carry one.
    pub fn controller_code(&self) -> Option<u32> {
        match self {
            Self::ControllerError { code, .. }
            | Self::NotFound { code, .. }
            | Self::PermissionDenied { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Returns whether the error means the link to the controller is gone.
    ///
    /// A transport failure other than a timeout, or a controller code that
    /// reports the communication line as closed, is a link failure.
    pub fn is_link_failure(&self) -> bool {
        match self {
            Self::Transport(TransportError::Timeout) => false,
            Self::Transport(_) => true,
            Self::ControllerError { category, .. } => *category == ErrorCategory::LinkDown,
            _ => false,
        }
    }

    /// Maps path-related controller errors onto `NotFound` / `PermissionDenied`.
    pub(crate) fn for_path(self, path: &str) -> Self {
        match self {
            Self::ControllerError {
                code,
                category: ErrorCategory::NotFound,
            } => Self::NotFound {
                path: path.to_string(),
                code,
            },
            Self::ControllerError {
                code,
                category: ErrorCategory::WriteProtected,
            } => Self::PermissionDenied {
                path: path.to_string(),
                code,
            },
            other => other,
        }
    }
}

/// Broad classification of controller error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// File, directory, drive or data does not exist.
    NotFound,
    /// Target is protected, read-only or password locked.
    WriteProtected,
    /// The controller is busy (operation in progress, file open, copying).
    DeviceBusy,
    /// Address or data range out of bounds.
    AddressOutOfRange,
    /// Malformed argument (type, format, name).
    InvalidArgument,
    /// The communication line is not open or not connected.
    LinkDown,
    /// The controller-side communication timed out.
    Timeout,
    /// File system level failure.
    FileSystem,
    /// The command is not supported by this controller.
    NotSupported,
    /// Code not classified.
    Unknown,
}

impl ErrorCategory {
    /// Classifies a controller error code.
    ///
    /// # Example
    ///
    /// ```
    /// use m700_nc::ErrorCategory;
    ///
    /// assert_eq!(ErrorCategory::from_code(0x8003_024A), ErrorCategory::WriteProtected);
    /// assert_eq!(ErrorCategory::from_code(0x8202_000A), ErrorCategory::LinkDown);
    /// assert_eq!(ErrorCategory::from_code(0x1234_5678), ErrorCategory::Unknown);
    /// ```
    pub fn from_code(code: u32) -> Self {
        match code {
            0x80A0_0101 | 0x8202_000A | 0x8202_0002 | 0x8002_0102 => Self::LinkDown,
            0x8202_0014 => Self::Timeout,

            0x80B0_020C | 0x80B0_0401 | 0x8003_0191 | 0x8003_019B | 0x8003_01A1 | 0x8003_01A2
            | 0x8003_01A8 | 0x8003_0242 | 0x8003_0291 | 0x8003_029B | 0x8003_02A1
            | 0x8003_02A2 | 0x8003_02A8 | 0x8003_0342 | 0x8003_0442 | 0x8003_04A1
            | 0x8003_04A2 | 0x8003_04A8 | 0x8007_0742 | 0x8007_079B | 0x8007_0842
            | 0x8007_0A91 | 0x8007_0B91 | 0x8004_01A3 => Self::NotFound,

            0x8003_024A | 0x8003_034A | 0x8003_044A | 0x8003_044D | 0x8004_024D | 0x8004_029B
            | 0x8004_049B | 0x8007_0549 | 0x80B0_0208 | 0x8003_0201 | 0x8003_0202 => {
                Self::WriteProtected
            }

            0x8003_0247 | 0x8003_0347 | 0x8003_0446 | 0x8003_0447 | 0x8003_044C | 0x8007_0147
            | 0x8007_0347 | 0x8007_0747 | 0x8007_0792 | 0x8007_0892 | 0x80B0_0204
            | 0x8007_0192 | 0x8007_0199 => Self::DeviceBusy,

            0x80A0_0106 | 0x8004_0490 | 0x8004_019A | 0x8004_029A | 0x8004_1195 | 0x8006_0090
            | 0x8006_009A | 0x8003_0103 => Self::AddressOutOfRange,

            0x80A0_0105 | 0x80A0_010A | 0x80A0_010B | 0x80B0_020E | 0x8003_0198 | 0x8003_0298
            | 0x8003_0148 | 0x8003_0248 | 0x8004_0197 | 0x8004_0297 | 0x8006_0097
            | 0xF000_00FF => Self::InvalidArgument,

            0x8003_0143 | 0x8003_0243 | 0x8003_0443 | 0x8007_0595 | 0x8007_0994 | 0x8007_0995 => {
                Self::FileSystem
            }

            0x80A0_0107 | 0x8007_0149 | 0x8007_0349 | 0x8007_0749 | 0x8007_0944 => {
                Self::NotSupported
            }

            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NotFound => "not found",
            Self::WriteProtected => "write protected",
            Self::DeviceBusy => "device busy",
            Self::AddressOutOfRange => "address out of range",
            Self::InvalidArgument => "invalid argument",
            Self::LinkDown => "link down",
            Self::Timeout => "timeout",
            Self::FileSystem => "file system error",
            Self::NotSupported => "not supported",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Returns the description of a known controller error code.
///
/// # Example
///
/// ```
/// use m700_nc::controller_error_description;
///
/// assert_eq!(controller_error_description(0x8003_0242), Some("File does not exist"));
/// assert_eq!(controller_error_description(0x0000_0001), None);
/// ```
pub fn controller_error_description(code: u32) -> Option<&'static str> {
    let text = match code {
        0x80A0_0101 => "Communication line not open",
        0x80A0_0104 => "Double open error",
        0x80A0_0105 => "Incorrect data type of argument",
        0x80A0_0106 => "Invalid data range of argument",
        0x80A0_0107 => "Not supported",
        0x80A0_0109 => "Cannot open communication line",
        0x80A0_010A => "The argument is a null pointer",
        0x80A0_010B => "Invalid data for argument",
        0x80B0_0101 => "Cannot reserve memory",
        0x80B0_0201 => "Incorrect mode",
        0x80B0_0202 => "File not open",
        0x80B0_0203 => "File already exists",
        0x80B0_0204 => "File already open",
        0x80B0_0206 => "File is not open in write mode",
        0x80B0_0207 => "Incorrect write data size",
        0x80B0_0208 => "Cannot write",
        0x80B0_0209 => "File not opened in read mode",
        0x80B0_020A => "Unreadable state",
        0x80B0_020C => "File does not exist (read mode)",
        0x80B0_020D => "Cannot open file",
        0x80B0_020E => "Invalid file path",
        0x80B0_020F => "The read file is invalid",
        0x80B0_0210 => "Invalid write file",
        0x80B0_0302 => "TCP/IP communication is not set",
        0x80B0_0303 => "Cannot set because communication is in progress",
        0x80B0_0401 => "Data does not exist",
        0x80B0_0402 => "Data duplication",
        0x8002_0102 => "The device has not been opened",
        0x8002_0132 => "Invalid command",
        0x8002_0133 => "Invalid communication parameter data range",
        0x8003_0101 => "Another directory is already open",
        0x8003_0103 => "Data size over",
        0x8003_0143 => "There is a problem with the file system",
        0x8003_0148 => "Long file name",
        0x8003_0191 => "The directory does not exist",
        0x8003_0198 => "Invalid file name format",
        0x8003_019B => "The drive does not exist",
        0x8003_01A1 => "File does not exist",
        0x8003_01A2 => "Directory does not exist",
        0x8003_01A8 => "The drive does not exist",
        0x8003_0201 => "Cannot delete files",
        0x8003_0202 => "Cannot delete files",
        0x8003_0242 => "File does not exist",
        0x8003_0243 => "There is a problem with the file system",
        0x8003_0247 => "Cannot delete (during operation)",
        0x8003_0248 => "Long file name",
        0x8003_024A => "The file cannot be deleted (protected)",
        0x8003_0291 => "Directory does not exist",
        0x8003_0298 => "Invalid file name format",
        0x8003_029B => "The drive does not exist",
        0x8003_02A1 => "File does not exist",
        0x8003_02A2 => "Directory does not exist",
        0x8003_02A8 => "The drive does not exist",
        0x8003_0342 => "File does not exist",
        0x8003_0347 => "Cannot rename (during operation)",
        0x8003_034A => "Cannot rename (protected)",
        0x8003_0442 => "File does not exist",
        0x8003_0443 => "There is a problem with the file system",
        0x8003_0446 => "Cannot copy (PLC in operation)",
        0x8003_0447 => "Cannot copy (during operation)",
        0x8003_044A => "Cannot copy (protected)",
        0x8003_044C => "Copying files",
        0x8003_044D => "Secure password locked",
        0x8003_04A1 => "File does not exist",
        0x8003_04A2 => "Directory does not exist",
        0x8003_04A8 => "The drive does not exist",
        0x8004_0197 => "Invalid data type",
        0x8004_019A => "Invalid read data range",
        0x8004_01A3 => "No read data",
        0x8004_024D => "Secure password locked",
        0x8004_0297 => "Incorrect data type",
        0x8004_029A => "Invalid write data range",
        0x8004_029B => "Read only data",
        0x8004_0490 => "Incorrect address",
        0x8004_049B => "Read only data",
        0x8004_1195 => "Setting data range over",
        0x8006_0090 => "Incorrect address",
        0x8006_0097 => "Incorrect data type",
        0x8006_009A => "Invalid data range",
        0x8007_0147 => "The file cannot be opened (during operation)",
        0x8007_0149 => "Not supported (CF not supported)",
        0x8007_0192 => "Already open",
        0x8007_0199 => "The maximum number of open files has been exceeded",
        0x8007_0347 => "File cannot be created (during operation)",
        0x8007_0349 => "Not supported (CF not supported)",
        0x8007_0549 => "Not writable",
        0x8007_0595 => "File write error",
        0x8007_0742 => "File does not exist",
        0x8007_0747 => "The file cannot be deleted (during operation)",
        0x8007_0749 => "Not supported (CF not supported)",
        0x8007_0792 => "File is open",
        0x8007_079B => "The drive does not exist",
        0x8007_0842 => "File does not exist",
        0x8007_0892 => "The file is open",
        0x8007_0944 => "Invalid command (not supported)",
        0x8007_0994 => "Read error",
        0x8007_0995 => "Write error",
        0x8007_0A91 => "Directory does not exist",
        0x8007_0B91 => "Directory does not exist",
        0x8202_0001 => "Already open",
        0x8202_0002 => "Not opened",
        0x8202_000A => "Not connected",
        0x8202_0014 => "Timeout",
        0x8202_0015 => "Invalid data",
        0x8202_0016 => "Canceled due to cancel request",
        0x8202_0017 => "Incorrect packet size",
        0xF000_00FF => "Invalid argument",
        0xFFFF_FFFF => "Data cannot be read / written",
        _ => return None,
    };
    Some(text)
}
