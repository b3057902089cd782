//! # M700 NC Client Library
//!
//! A Rust library for talking to Mitsubishi M700-series CNC controllers:
//! device reads and writes, status queries and chunked file transfer over
//! one session.
//!
//! ## Features
//!
//! - **Typed devices** - symbolic names like `"M900"` or `"D100"` resolve to
//!   checked addresses; values are [`Value`]s, never loose variants
//! - **Checked before sending** - bad addresses and mismatched types fail
//!   before anything reaches the controller
//! - **Bounded** - every call completes or times out; reads are retried once
//!   on timeout, writes never
//! - **Safe transfers** - a failed file transfer is aborted on the controller
//! - **No panics** - all errors returned as `Result<T, NcError>`
//! - **Pluggable transport** - TCP built in, anything else via [`Transport`]
//!
//! ## Quick Start
//!
//! ```no_run
//! use m700_nc::{Session, SessionConfig, Value, ValueType};
//!
//! fn main() -> m700_nc::Result<()> {
//!     let config = SessionConfig::new("192.168.1.20".parse()?);
//!     let session = Session::connect(config)?;
//!
//!     // M devices are bits
//!     let running = session.read_device("M900")?;
//!     println!("{}", running);
//!
//!     // D devices are words; 32-bit values span two words
//!     session.write_device("D100", Value::I16(1200))?;
//!     session.write_device("D200", Value::F32(12.5))?;
//!     let feed = session.read_device_as("D200", ValueType::F32)?;
//!     println!("{}", feed);
//!
//!     session.close();
//!     Ok(())
//! }
//! ```
//!
//! ## Devices
//!
//! | Kind | Description | Access | Range |
//! |------|-------------|:------:|------:|
//! | `X` / `Y` | Input / output | bit | 0-8191 |
//! | `M` | Internal relay | bit | 0-10239 |
//! | `L` | Latch relay | bit | 0-511 |
//! | `F` | Annunciator | bit | 0-127 |
//! | `B` | Link relay | bit | 0-8191 |
//! | `SB` / `SM` | Special link relay / special relay | bit | 0-511 / 0-127 |
//! | `D` / `R` / `W` | Data / file / link register | word | 0-8191 |
//! | `SW` / `SD` | Special link / special register | word | 0-511 / 0-127 |
//!
//! ## Files
//!
//! ```no_run
//! # use m700_nc::{Session, SessionConfig};
//! # let session = Session::connect(SessionConfig::new("192.168.1.20".parse().unwrap())).unwrap();
//! let program = session.read_file("M01:/PRG/USER/O1000")?;
//! session.write_file("M01:/PRG/USER/O1001", &program)?;
//!
//! for entry in session.list_directory("M01:/PRG/USER/")? {
//!     println!("{} {} {}", entry.name, entry.size, entry.comment);
//! }
//!
//! session.delete_file("M01:/PRG/USER/O1001")?;
//! # Ok::<(), m700_nc::NcError>(())
//! ```
//!
//! ## Status
//!
//! ```no_run
//! # use m700_nc::{Axis, Session, SessionConfig};
//! # let session = Session::connect(SessionConfig::new("192.168.1.20".parse().unwrap())).unwrap();
//! let status = session.run_status()?;
//! println!("{} / {} rpm / tool {}", status.run_status, status.spindle_speed, status.tool_number);
//! for alarm in &status.alarms {
//!     println!("alarm {}", alarm);
//! }
//! let x = session.current_position(Axis::X)?;
//! # Ok::<(), m700_nc::NcError>(())
//! ```
//!
//! ## Error Handling
//!
//! ```no_run
//! use m700_nc::{ErrorCategory, NcError, Session, SessionConfig};
//!
//! let session = Session::connect(SessionConfig::new("192.168.1.20".parse()?))?;
//!
//! match session.read_file("M01:/PRG/USER/O9999") {
//!     Ok(data) => println!("{} bytes", data.len()),
//!     Err(NcError::NotFound { path, .. }) => println!("{} does not exist", path),
//!     Err(NcError::Timeout { timeout }) => println!("no answer within {:?}", timeout),
//!     Err(e) if e.category() == Some(ErrorCategory::DeviceBusy) => println!("busy: {}", e),
//!     Err(e) => println!("Error: {}", e),
//! }
//! # Ok::<(), NcError>(())
//! ```
//!
//! ## Cancellation
//!
//! Long transfers take a [`CancelToken`]. Cancellation is checked between
//! exchanges, so a write or delete cancelled mid-exchange may still have
//! been applied by the controller.
//!
//! ## Logging
//!
//! The library emits [`tracing`] events (connect, close, per-exchange
//! debug, retry and abort warnings). It never installs a subscriber.

#![warn(clippy::all)]
#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

mod device;
mod dispatcher;
mod error;
mod file;
mod frame;
mod session;
mod status;
mod transport;
mod unit;
mod value;

#[cfg(test)]
mod testing;

// Public re-exports
pub use device::{resolve, AccessWidth, DeviceAddress, DeviceKind};
pub use dispatcher::{
    CancelToken, Timeouts, DEFAULT_DEVICE_TIMEOUT, DEFAULT_FILE_TIMEOUT,
    DEFAULT_PROTOCOL_ERROR_LIMIT, DEFAULT_STATUS_TIMEOUT,
};
pub use error::{controller_error_description, ErrorCategory, NcError, Result, TransportError};
pub use file::{FileEntry, FileKind, DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE, MAX_PATH_LEN};
pub use frame::{
    CommandCode, FrameHeader, OperationClass, PayloadReader, PayloadWriter, Request, Response,
    ResponseShape, FRAME_HEADER_SIZE, MAX_FRAME_SIZE, MAX_PAYLOAD_SIZE, STATUS_SIZE,
};
pub use session::{Session, SessionConfig, SessionState};
pub use status::{AlarmRecord, Axis, ProgramType, RunStatus, StatusSnapshot, ToolOffsetKind};
pub use transport::{Endpoint, TcpLink, TcpTransport, Transport, DEFAULT_CONNECT_TIMEOUT, DEFAULT_PORT};
pub use unit::{MAX_UNIT, MIN_UNIT};
pub use value::{decode, encode, DeviceValue, Value, ValueType, MAX_STRING_BYTES};
