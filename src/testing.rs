//! In-memory controller used by the unit tests.
//!
//! [`SimController`] implements [`Transport`] by decoding each request frame
//! and answering it from a small model of a controller: devices, files,
//! directories, status values and tool offsets. Faults can be injected per
//! command, and every request that reaches the transport is logged.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::device::{DeviceAddress, DeviceKind};
use crate::dispatcher::CancelToken;
use crate::error::TransportError;
use crate::frame::{CommandCode, FrameHeader, PayloadReader, PayloadWriter, FRAME_HEADER_SIZE};
use crate::transport::{Endpoint, Transport};
use crate::value::{decode, encode, Value, ValueType};

const ERR_NOT_FOUND: u32 = 0x8003_0242;
const ERR_PROTECTED: u32 = 0x8003_024A;
const ERR_BUSY: u32 = 0x8003_0447;
const ERR_NOT_OPEN: u32 = 0x8003_0143;
const ERR_BAD_DATA: u32 = 0x80A0_0105;

/// Scripted misbehaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Fault {
    /// Never answer; every exchange times out.
    Silent,
    /// Do not answer the first request of this command.
    SilentOnce(CommandCode),
    /// Answer every request with bytes that are not a frame.
    Garbage,
    /// Answer the first request of this command with garbage.
    GarbageOnce(CommandCode),
    /// Echo a sequence number that was not sent.
    WrongSequence,
    /// Answer this command with a controller error code.
    Status(CommandCode, u32),
    /// Drop the link on the next exchange.
    Disconnect,
    /// Drop the link after this many chunk writes succeeded.
    FailAfterWrites(usize),
    /// Answer every chunk read with chunk 0.
    RepeatChunk,
    /// Refuse connections.
    RefuseConnect,
    /// Hold back the reply to the first request of this command until the
    /// next request arrives.
    LateOnce(CommandCode),
}

/// One request as seen by the controller.
#[derive(Debug, Clone)]
pub(crate) struct LoggedRequest {
    pub(crate) unit: u8,
    pub(crate) command: CommandCode,
    pub(crate) sequence: u16,
    pub(crate) payload: Vec<u8>,
}

#[derive(Debug)]
struct OpenFile {
    path: String,
    writing: bool,
    buffer: Vec<u8>,
    next_index: u32,
}

/// Controller model. Fields are public to let tests seed them.
#[derive(Debug)]
pub(crate) struct SimState {
    pub(crate) devices: HashMap<(DeviceKind, u32), Value>,
    pub(crate) files: BTreeMap<String, Vec<u8>>,
    pub(crate) protected: HashSet<String>,
    pub(crate) dirs: HashMap<String, (Vec<String>, Vec<String>)>,
    pub(crate) drive_info: String,
    pub(crate) version: String,
    pub(crate) program_main: String,
    pub(crate) program_sub: String,
    pub(crate) run_status: u8,
    pub(crate) alarms: Vec<(u32, String)>,
    pub(crate) spindle_speed: i32,
    pub(crate) spindle_load: i32,
    pub(crate) cycle_counter: i32,
    pub(crate) positions: [f64; 3],
    pub(crate) magazine_size: i32,
    pub(crate) tool_in_spindle: i32,
    pub(crate) tool_set_size: i32,
    pub(crate) tool_offsets: HashMap<(u16, u32), f64>,
    pub(crate) var_names: HashMap<u32, String>,
    pub(crate) connects: usize,
    pub(crate) closes: usize,
    faults: Vec<Fault>,
    cancel_hooks: Vec<(CommandCode, usize, CancelToken)>,
    seen: HashMap<CommandCode, usize>,
    requests: Vec<LoggedRequest>,
    open: Option<OpenFile>,
    search: VecDeque<String>,
    link_dead: bool,
    writes_done: usize,
    outbox: VecDeque<Vec<u8>>,
    held: Option<Vec<u8>>,
}

impl Default for SimState {
    fn default() -> Self {
        Self {
            devices: HashMap::new(),
            files: BTreeMap::new(),
            protected: HashSet::new(),
            dirs: HashMap::new(),
            drive_info: "M01:\r\nM02:\r\n".to_string(),
            version: "BND-1005W000-A3".to_string(),
            program_main: "O1000".to_string(),
            program_sub: "O9001".to_string(),
            run_status: 0,
            alarms: Vec::new(),
            spindle_speed: 0,
            spindle_load: 0,
            cycle_counter: 0,
            positions: [0.0; 3],
            magazine_size: 0,
            tool_in_spindle: 0,
            tool_set_size: 0,
            tool_offsets: HashMap::new(),
            var_names: HashMap::new(),
            connects: 0,
            closes: 0,
            faults: Vec::new(),
            cancel_hooks: Vec::new(),
            seen: HashMap::new(),
            requests: Vec::new(),
            open: None,
            search: VecDeque::new(),
            link_dead: false,
            writes_done: 0,
            outbox: VecDeque::new(),
            held: None,
        }
    }
}

/// Link handle of the simulated controller.
#[derive(Debug)]
pub(crate) struct SimLink;

/// Simulated controller. Clones share the same model.
#[derive(Debug, Clone, Default)]
pub(crate) struct SimController {
    state: Arc<Mutex<SimState>>,
}

type Reply = std::result::Result<Vec<u8>, u32>;

impl SimController {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A link for driving the transport without `connect`.
    pub(crate) fn link(&self) -> SimLink {
        SimLink
    }

    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut SimState) -> R) -> R {
        f(&mut self.lock())
    }

    pub(crate) fn inject(&self, fault: Fault) {
        self.lock().faults.push(fault);
    }

    pub(crate) fn clear_faults(&self) {
        let mut state = self.lock();
        state.faults.clear();
        state.link_dead = false;
    }

    /// Cancels `token` while serving the `nth` (0-based) request of `command`.
    pub(crate) fn cancel_during(&self, command: CommandCode, nth: usize, token: CancelToken) {
        self.lock().cancel_hooks.push((command, nth, token));
    }

    pub(crate) fn requests(&self) -> Vec<LoggedRequest> {
        self.lock().requests.clone()
    }

    pub(crate) fn set_device(&self, name: &str, value: Value) {
        if let Ok(address) = crate::device::resolve(name) {
            self.lock().devices.insert((address.kind(), address.index()), value);
        }
    }

    pub(crate) fn device(&self, name: &str) -> Option<Value> {
        let address = crate::device::resolve(name).ok()?;
        self.lock().devices.get(&(address.kind(), address.index())).cloned()
    }

    pub(crate) fn put_file(&self, path: &str, content: Vec<u8>) {
        self.lock().files.insert(path.to_string(), content);
    }

    pub(crate) fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.lock().files.get(path).cloned()
    }

    pub(crate) fn put_dir(&self, path: &str, dirs: &[&str], files: &[(&str, u64, &str)]) {
        let dirs = dirs.iter().map(|d| d.to_string()).collect();
        let files = files
            .iter()
            .map(|(name, size, comment)| format!("{}\t{}\t{}", name, size, comment))
            .collect();
        self.lock().dirs.insert(path.to_string(), (dirs, files));
    }
}

impl SimState {
    fn take_once(&mut self, matcher: impl Fn(&Fault) -> bool) -> bool {
        match self.faults.iter().position(matcher) {
            Some(pos) => {
                self.faults.remove(pos);
                true
            }
            None => false,
        }
    }

    fn has(&self, fault: Fault) -> bool {
        self.faults.contains(&fault)
    }

    fn status_fault(&self, command: CommandCode) -> Option<u32> {
        self.faults.iter().find_map(|f| match f {
            Fault::Status(c, code) if *c == command => Some(*code),
            _ => None,
        })
    }

    fn handle(&mut self, command: CommandCode, payload: &[u8]) -> Reply {
        let mut r = PayloadReader::new(payload);
        match command {
            CommandCode::DeviceRead => {
                let address = DeviceAddress::from_bytes(payload.get(..6).ok_or(ERR_BAD_DATA)?)
                    .map_err(|_| ERR_BAD_DATA)?;
                let requested = payload
                    .get(6)
                    .and_then(|t| ValueType::from_tag(*t))
                    .ok_or(ERR_BAD_DATA)?;
                let stored = self
                    .devices
                    .get(&(address.kind(), address.index()))
                    .filter(|v| v.value_type() == requested)
                    .cloned();
                let value = stored.unwrap_or(match requested {
                    ValueType::Bool => Value::Bool(false),
                    ValueType::I16 => Value::I16(0),
                    ValueType::I32 => Value::I32(0),
                    ValueType::F32 => Value::F32(0.0),
                    ValueType::String => Value::String(" ".to_string()),
                });
                encode(&value, &address).map_err(|_| ERR_BAD_DATA)
            }
            CommandCode::DeviceWrite => {
                let address = DeviceAddress::from_bytes(payload.get(..6).ok_or(ERR_BAD_DATA)?)
                    .map_err(|_| ERR_BAD_DATA)?;
                let value = decode(&payload[6..], &address).map_err(|_| ERR_BAD_DATA)?;
                self.devices
                    .insert((address.kind(), address.index()), value.into_value());
                Ok(Vec::new())
            }
            CommandCode::DriveInfo => Ok(PayloadWriter::new().str(&self.drive_info).finish()),
            CommandCode::Version => Ok(PayloadWriter::new().str(&self.version).finish()),
            CommandCode::RunStatus => Ok(vec![self.run_status]),
            CommandCode::SpindleMonitor => {
                let value = match r.u16().map_err(|_| ERR_BAD_DATA)? {
                    2 => self.spindle_speed,
                    3 => self.spindle_load,
                    10 => self.cycle_counter,
                    _ => return Err(ERR_BAD_DATA),
                };
                Ok(value.to_le_bytes().to_vec())
            }
            CommandCode::CurrentPosition => {
                let axis = r.u16().map_err(|_| ERR_BAD_DATA)?;
                let position = self
                    .positions
                    .get(usize::from(axis).wrapping_sub(1))
                    .ok_or(ERR_BAD_DATA)?;
                Ok(position.to_le_bytes().to_vec())
            }
            CommandCode::Alarms => {
                let max = usize::from(r.u16().map_err(|_| ERR_BAD_DATA)?);
                let shown: Vec<_> = self.alarms.iter().take(max).collect();
                let mut w = PayloadWriter::new().u16(shown.len() as u16);
                for (code, message) in shown {
                    w = w.u32(*code).str(message);
                }
                Ok(w.finish())
            }
            CommandCode::CommonVariableName => {
                let index = r.u32().map_err(|_| ERR_BAD_DATA)?;
                let name = self.var_names.get(&index).ok_or(ERR_NOT_FOUND)?;
                Ok(PayloadWriter::new().str(name).finish())
            }
            CommandCode::MagazineSize => Ok(self.magazine_size.to_le_bytes().to_vec()),
            CommandCode::MagazineReady => Ok(self.tool_in_spindle.to_le_bytes().to_vec()),
            CommandCode::ToolSetSize => Ok(self.tool_set_size.to_le_bytes().to_vec()),
            CommandCode::ToolOffsetRead => {
                let _type = r.u16().map_err(|_| ERR_BAD_DATA)?;
                let kind = r.u16().map_err(|_| ERR_BAD_DATA)?;
                let set = r.u32().map_err(|_| ERR_BAD_DATA)?;
                let value = self.tool_offsets.get(&(kind, set)).copied().unwrap_or(0.0);
                Ok(value.to_le_bytes().to_vec())
            }
            CommandCode::ToolOffsetWrite => {
                let _type = r.u16().map_err(|_| ERR_BAD_DATA)?;
                let kind = r.u16().map_err(|_| ERR_BAD_DATA)?;
                let set = r.u32().map_err(|_| ERR_BAD_DATA)?;
                let value = r.f64().map_err(|_| ERR_BAD_DATA)?;
                self.tool_offsets.insert((kind, set), value);
                Ok(Vec::new())
            }
            CommandCode::ProgramNumber => {
                let program = match r.u16().map_err(|_| ERR_BAD_DATA)? {
                    0 => &self.program_main,
                    _ => &self.program_sub,
                };
                Ok(PayloadWriter::new().str(program).finish())
            }
            CommandCode::FileOpen => {
                let mode = r.u8().map_err(|_| ERR_BAD_DATA)?;
                let path = r.str().map_err(|_| ERR_BAD_DATA)?;
                if self.open.is_some() {
                    return Err(ERR_BUSY);
                }
                let open = match mode {
                    1 => OpenFile {
                        buffer: self.files.get(&path).cloned().ok_or(ERR_NOT_FOUND)?,
                        path,
                        writing: false,
                        next_index: 0,
                    },
                    2 | 3 if self.protected.contains(&path) => return Err(ERR_PROTECTED),
                    2 | 3 => OpenFile {
                        path,
                        writing: true,
                        buffer: Vec::new(),
                        next_index: 0,
                    },
                    _ => return Err(ERR_BAD_DATA),
                };
                self.open = Some(open);
                Ok(Vec::new())
            }
            CommandCode::FileRead => {
                let index = r.u32().map_err(|_| ERR_BAD_DATA)?;
                let max = usize::from(r.u16().map_err(|_| ERR_BAD_DATA)?);
                let repeat = self.has(Fault::RepeatChunk);
                let file = self.open.as_ref().filter(|f| !f.writing).ok_or(ERR_NOT_OPEN)?;
                let index = if repeat { 0 } else { index };
                let start = (index as usize * max).min(file.buffer.len());
                let end = (start + max).min(file.buffer.len());
                let eof = index as usize * max + max >= file.buffer.len();
                Ok(PayloadWriter::new()
                    .u32(index)
                    .u8(u8::from(eof))
                    .bytes(&file.buffer[start..end])
                    .finish())
            }
            CommandCode::FileWrite => {
                let index = r.u32().map_err(|_| ERR_BAD_DATA)?;
                let data = r.rest();
                let file = self.open.as_mut().filter(|f| f.writing).ok_or(ERR_NOT_OPEN)?;
                if index != file.next_index {
                    return Err(ERR_BAD_DATA);
                }
                file.buffer.extend_from_slice(data);
                file.next_index += 1;
                self.writes_done += 1;
                Ok(index.to_le_bytes().to_vec())
            }
            CommandCode::FileClose => {
                let file = self.open.take().ok_or(ERR_NOT_OPEN)?;
                if file.writing {
                    self.files.insert(file.path, file.buffer);
                }
                Ok(Vec::new())
            }
            CommandCode::FileAbort => {
                self.open = None;
                Ok(Vec::new())
            }
            CommandCode::FileDelete => {
                let path = r.str().map_err(|_| ERR_BAD_DATA)?;
                if self.protected.contains(&path) {
                    return Err(ERR_PROTECTED);
                }
                self.files.remove(&path).map(|_| Vec::new()).ok_or(ERR_NOT_FOUND)
            }
            CommandCode::DirFind => {
                let mode = r.i32().map_err(|_| ERR_BAD_DATA)?;
                let path = r.str().map_err(|_| ERR_BAD_DATA)?;
                let (dirs, files) = self.dirs.get(&path).ok_or(ERR_NOT_FOUND)?;
                let entries = if mode == -1 { dirs } else { files };
                self.search = entries.iter().cloned().collect();
                Ok(self.next_entry())
            }
            CommandCode::DirNext => Ok(self.next_entry()),
            CommandCode::DirReset => {
                self.search.clear();
                Ok(Vec::new())
            }
        }
    }

    fn next_entry(&mut self) -> Vec<u8> {
        match self.search.pop_front() {
            Some(entry) => PayloadWriter::new().u8(1).str(&entry).finish(),
            None => vec![0],
        }
    }
}

impl Transport for SimController {
    type Link = SimLink;

    fn connect(&mut self, _endpoint: &Endpoint, _timeout: Duration) -> Result<SimLink, TransportError> {
        let mut state = self.lock();
        if state.has(Fault::RefuseConnect) {
            return Err(TransportError::Io(std::io::Error::from(
                std::io::ErrorKind::ConnectionRefused,
            )));
        }
        state.connects += 1;
        state.link_dead = false;
        state.outbox.clear();
        state.held = None;
        Ok(SimLink)
    }

    fn send(&mut self, _link: &mut SimLink, request: &[u8], _timeout: Duration) -> Result<(), TransportError> {
        let mut state = self.lock();
        let header = FrameHeader::from_bytes(request)
            .map_err(|e| TransportError::Other(e.to_string()))?;
        let command = CommandCode::from_code(header.command)
            .ok_or_else(|| TransportError::Other(format!("unknown command {:04X}", header.command)))?;
        let payload = request[FRAME_HEADER_SIZE..].to_vec();
        state.requests.push(LoggedRequest {
            unit: header.unit,
            command,
            sequence: header.sequence,
            payload: payload.clone(),
        });
        let nth = {
            let seen = state.seen.entry(command).or_insert(0);
            *seen += 1;
            *seen - 1
        };
        for (hook_command, hook_nth, token) in &state.cancel_hooks {
            if *hook_command == command && *hook_nth == nth {
                token.cancel();
            }
        }
        if let Some(late) = state.held.take() {
            state.outbox.push_back(late);
        }

        if state.link_dead || state.has(Fault::Disconnect) {
            state.link_dead = true;
            return Err(TransportError::Closed);
        }
        if state.has(Fault::Silent) || state.take_once(|f| *f == Fault::SilentOnce(command)) {
            return Ok(());
        }
        if state.has(Fault::Garbage) || state.take_once(|f| *f == Fault::GarbageOnce(command)) {
            state.outbox.push_back(vec![0xDE, 0xAD, 0xBE, 0xEF]);
            return Ok(());
        }
        if command == CommandCode::FileWrite {
            let limit = state.faults.iter().find_map(|f| match f {
                Fault::FailAfterWrites(n) => Some(*n),
                _ => None,
            });
            if limit.is_some_and(|n| state.writes_done >= n) {
                state.link_dead = true;
                return Err(TransportError::Closed);
            }
        }

        let reply = match state.status_fault(command) {
            Some(code) => Err(code),
            None => state.handle(command, &payload),
        };
        let (status, data) = match reply {
            Ok(data) => (0u32, data),
            Err(code) => (code, Vec::new()),
        };

        let sequence = if state.has(Fault::WrongSequence) {
            header.sequence.wrapping_add(100)
        } else {
            header.sequence
        };
        let body = PayloadWriter::new().u32(status).bytes(&data).finish();
        let response = FrameHeader::response(header.unit, header.command, sequence, body.len() as u16);
        let mut frame = response.to_bytes().to_vec();
        frame.extend_from_slice(&body);
        if state.take_once(|f| *f == Fault::LateOnce(command)) {
            state.held = Some(frame);
        } else {
            state.outbox.push_back(frame);
        }
        Ok(())
    }

    fn receive(&mut self, _link: &mut SimLink, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let mut state = self.lock();
        if let Some(frame) = state.outbox.pop_front() {
            return Ok(frame);
        }
        if state.link_dead {
            return Err(TransportError::Closed);
        }
        drop(state);
        std::thread::sleep(timeout);
        Err(TransportError::Timeout)
    }

    fn close(&mut self, _link: SimLink) {
        self.lock().closes += 1;
    }
}
