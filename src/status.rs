//! Status, spindle and tool queries.
//!
//! Each query is a single idempotent exchange, except
//! [`set_tool_offset`] which writes and is never retried.

use std::time::SystemTime;

use crate::dispatcher::{CancelToken, Channel};
use crate::error::{NcError, Result};
use crate::frame::{CommandCode, PayloadWriter, Request, ResponseShape};
use crate::transport::Transport;

/// Tool offset table type used by machining-center controllers (type II).
const TOOL_OFFSET_TYPE: u16 = 4;

/// Number of alarm messages requested per query.
const ALARM_LINES: u16 = 3;

/// Spindle addressed by the spindle monitor queries.
const SPINDLE_NO: u16 = 1;

/// Operating status reported by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RunStatus {
    /// Not in automatic operation.
    NotAutoRun,
    /// Automatic operation in progress.
    AutoRun,
}

impl RunStatus {
    fn from_byte(b: u8) -> Result<Self> {
        match b {
            0 => Ok(RunStatus::NotAutoRun),
            1 => Ok(RunStatus::AutoRun),
            other => Err(NcError::protocol(format!("unknown run status {}", other))),
        }
    }

    /// Returns `true` during automatic operation.
    pub fn is_running(self) -> bool {
        self == RunStatus::AutoRun
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::NotAutoRun => write!(f, "not in automatic operation"),
            RunStatus::AutoRun => write!(f, "automatic operation"),
        }
    }
}

/// Machine axis for position queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Axis {
    /// First axis.
    X,
    /// Second axis.
    Y,
    /// Third axis.
    Z,
}

impl Axis {
    fn number(self) -> u16 {
        match self {
            Axis::X => 1,
            Axis::Y => 2,
            Axis::Z => 3,
        }
    }
}

/// Which program number to query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProgramType {
    /// Main program.
    Main,
    /// Sub program.
    Sub,
}

impl ProgramType {
    fn code(self) -> u16 {
        match self {
            ProgramType::Main => 0,
            ProgramType::Sub => 1,
        }
    }
}

/// Tool offset entry kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolOffsetKind {
    /// Tool length.
    Length,
    /// Tool length wear.
    LengthWear,
    /// Tool diameter.
    Diameter,
    /// Tool diameter wear.
    DiameterWear,
}

impl ToolOffsetKind {
    fn code(self) -> u16 {
        match self {
            ToolOffsetKind::Length => 0,
            ToolOffsetKind::LengthWear => 1,
            ToolOffsetKind::Diameter => 2,
            ToolOffsetKind::DiameterWear => 3,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum SpindleParameter {
    Speed,
    Load,
    CycleCounter,
}

impl SpindleParameter {
    fn code(self) -> u16 {
        match self {
            SpindleParameter::Speed => 2,
            SpindleParameter::Load => 3,
            SpindleParameter::CycleCounter => 10,
        }
    }
}

/// One active alarm.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AlarmRecord {
    /// Alarm number.
    pub code: u32,
    /// Alarm text as shown on the controller.
    pub message: String,
}

impl std::fmt::Display for AlarmRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04} {}", self.code, self.message)
    }
}

/// Operating status collected in one call.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StatusSnapshot {
    /// First drive reported by the controller.
    pub drive_info: String,
    /// Automatic operation state.
    pub run_status: RunStatus,
    /// Active alarms.
    pub alarms: Vec<AlarmRecord>,
    /// Tool number in the spindle.
    pub tool_number: i32,
    /// Spindle speed in rpm.
    pub spindle_speed: i32,
    /// Spindle load in percent.
    pub spindle_load: i32,
    /// When the snapshot was taken.
    pub captured_at: SystemTime,
}

fn query<T: Transport>(
    channel: &mut Channel<'_, T>,
    command: CommandCode,
    payload: Vec<u8>,
    shape: ResponseShape,
    cancel: &CancelToken,
) -> Result<crate::frame::Response> {
    channel.exchange(&Request::new(command, payload, shape), cancel)
}

fn query_str<T: Transport>(
    channel: &mut Channel<'_, T>,
    command: CommandCode,
    payload: Vec<u8>,
    cancel: &CancelToken,
) -> Result<String> {
    let response = query(channel, command, payload, ResponseShape::AtLeast(2), cancel)?;
    let mut reader = response.reader();
    let s = reader.str()?;
    reader.finish()?;
    Ok(s)
}

fn query_i32<T: Transport>(
    channel: &mut Channel<'_, T>,
    command: CommandCode,
    payload: Vec<u8>,
    cancel: &CancelToken,
) -> Result<i32> {
    let response = query(channel, command, payload, ResponseShape::Exact(4), cancel)?;
    response.reader().i32()
}

fn query_f64<T: Transport>(
    channel: &mut Channel<'_, T>,
    command: CommandCode,
    payload: Vec<u8>,
    cancel: &CancelToken,
) -> Result<f64> {
    let response = query(channel, command, payload, ResponseShape::Exact(8), cancel)?;
    response.reader().f64()
}

/// First drive of the controller's drive list, e.g. `M01:`.
pub(crate) fn drive_info<T: Transport>(channel: &mut Channel<'_, T>, cancel: &CancelToken) -> Result<String> {
    let list = query_str(channel, CommandCode::DriveInfo, Vec::new(), cancel)?;
    Ok(first_drive(&list).to_string())
}

fn first_drive(list: &str) -> &str {
    list.split(|c: char| c == '\r' || c == '\n')
        .map(|entry| entry.trim_end_matches(|c: char| c == '\0' || c.is_whitespace()))
        .find(|entry| !entry.is_empty())
        .unwrap_or("")
}

pub(crate) fn version<T: Transport>(channel: &mut Channel<'_, T>, cancel: &CancelToken) -> Result<String> {
    query_str(channel, CommandCode::Version, Vec::new(), cancel)
}

pub(crate) fn run_status<T: Transport>(
    channel: &mut Channel<'_, T>,
    cancel: &CancelToken,
) -> Result<RunStatus> {
    let response = query(channel, CommandCode::RunStatus, Vec::new(), ResponseShape::Exact(1), cancel)?;
    RunStatus::from_byte(response.reader().u8()?)
}

pub(crate) fn spindle_monitor<T: Transport>(
    channel: &mut Channel<'_, T>,
    parameter: SpindleParameter,
    cancel: &CancelToken,
) -> Result<i32> {
    let payload = PayloadWriter::new()
        .u16(parameter.code())
        .u16(SPINDLE_NO)
        .finish();
    query_i32(channel, CommandCode::SpindleMonitor, payload, cancel)
}

pub(crate) fn current_position<T: Transport>(
    channel: &mut Channel<'_, T>,
    axis: Axis,
    cancel: &CancelToken,
) -> Result<f64> {
    let payload = PayloadWriter::new().u16(axis.number()).finish();
    query_f64(channel, CommandCode::CurrentPosition, payload, cancel)
}

pub(crate) fn alarms<T: Transport>(
    channel: &mut Channel<'_, T>,
    cancel: &CancelToken,
) -> Result<Vec<AlarmRecord>> {
    let payload = PayloadWriter::new().u16(ALARM_LINES).u16(0).finish();
    let response = query(channel, CommandCode::Alarms, payload, ResponseShape::AtLeast(2), cancel)?;
    let mut reader = response.reader();
    let count = reader.u16()?;
    let mut records = Vec::with_capacity(usize::from(count));
    for _ in 0..count {
        let code = reader.u32()?;
        let message = reader.str()?;
        records.push(AlarmRecord { code, message });
    }
    reader.finish()?;
    Ok(records)
}

pub(crate) fn common_variable_name<T: Transport>(
    channel: &mut Channel<'_, T>,
    index: u32,
    cancel: &CancelToken,
) -> Result<String> {
    let payload = PayloadWriter::new().u32(index).finish();
    query_str(channel, CommandCode::CommonVariableName, payload, cancel)
}

pub(crate) fn magazine_size<T: Transport>(channel: &mut Channel<'_, T>, cancel: &CancelToken) -> Result<i32> {
    query_i32(channel, CommandCode::MagazineSize, Vec::new(), cancel)
}

/// Tool number at the spindle (magazine 1, standby position 0).
pub(crate) fn tool_in_spindle<T: Transport>(channel: &mut Channel<'_, T>, cancel: &CancelToken) -> Result<i32> {
    let payload = PayloadWriter::new().u16(1).u16(0).finish();
    query_i32(channel, CommandCode::MagazineReady, payload, cancel)
}

pub(crate) fn tool_set_size<T: Transport>(channel: &mut Channel<'_, T>, cancel: &CancelToken) -> Result<i32> {
    query_i32(channel, CommandCode::ToolSetSize, Vec::new(), cancel)
}

fn check_set_no(set_no: u32) -> Result<()> {
    if set_no == 0 {
        return Err(NcError::invalid_parameter("set_no", "tool sets are numbered from 1"));
    }
    Ok(())
}

pub(crate) fn tool_offset<T: Transport>(
    channel: &mut Channel<'_, T>,
    kind: ToolOffsetKind,
    set_no: u32,
    cancel: &CancelToken,
) -> Result<f64> {
    check_set_no(set_no)?;
    let payload = PayloadWriter::new()
        .u16(TOOL_OFFSET_TYPE)
        .u16(kind.code())
        .u32(set_no)
        .finish();
    query_f64(channel, CommandCode::ToolOffsetRead, payload, cancel)
}

pub(crate) fn set_tool_offset<T: Transport>(
    channel: &mut Channel<'_, T>,
    kind: ToolOffsetKind,
    set_no: u32,
    value: f64,
    cancel: &CancelToken,
) -> Result<()> {
    check_set_no(set_no)?;
    if !value.is_finite() {
        return Err(NcError::invalid_parameter("value", "tool offset must be finite"));
    }
    let payload = PayloadWriter::new()
        .u16(TOOL_OFFSET_TYPE)
        .u16(kind.code())
        .u32(set_no)
        .f64(value)
        .finish();
    query(channel, CommandCode::ToolOffsetWrite, payload, ResponseShape::Empty, cancel)?;
    Ok(())
}

pub(crate) fn program_number<T: Transport>(
    channel: &mut Channel<'_, T>,
    program: ProgramType,
    cancel: &CancelToken,
) -> Result<String> {
    let payload = PayloadWriter::new().u16(program.code()).finish();
    query_str(channel, CommandCode::ProgramNumber, payload, cancel)
}

pub(crate) fn snapshot<T: Transport>(
    channel: &mut Channel<'_, T>,
    cancel: &CancelToken,
) -> Result<StatusSnapshot> {
    Ok(StatusSnapshot {
        drive_info: drive_info(channel, cancel)?,
        run_status: run_status(channel, cancel)?,
        alarms: alarms(channel, cancel)?,
        tool_number: tool_in_spindle(channel, cancel)?,
        spindle_speed: spindle_monitor(channel, SpindleParameter::Speed, cancel)?,
        spindle_load: spindle_monitor(channel, SpindleParameter::Load, cancel)?,
        captured_at: SystemTime::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::{Dispatcher, Timeouts};
    use crate::testing::{Fault, SimController};

    fn with_channel<R>(sim: &mut SimController, f: impl FnOnce(&mut Channel<'_, SimController>) -> R) -> R {
        let mut link = sim.link();
        let mut dispatcher = Dispatcher::new(1, Timeouts::default(), true, 2);
        let mut channel = Channel::new(&mut dispatcher, sim, &mut link);
        f(&mut channel)
    }

    #[test]
    fn test_run_status_decoding() {
        assert_eq!(RunStatus::from_byte(0).unwrap(), RunStatus::NotAutoRun);
        assert_eq!(RunStatus::from_byte(1).unwrap(), RunStatus::AutoRun);
        assert!(RunStatus::from_byte(2).is_err());
        assert!(RunStatus::AutoRun.is_running());
    }

    #[test]
    fn test_string_queries() {
        let mut sim = SimController::new();
        let cancel = CancelToken::new();
        with_channel(&mut sim, |ch| {
            assert_eq!(drive_info(ch, &cancel).unwrap(), "M01:");
            assert_eq!(version(ch, &cancel).unwrap(), "BND-1005W000-A3");
            assert_eq!(program_number(ch, ProgramType::Main, &cancel).unwrap(), "O1000");
            assert_eq!(program_number(ch, ProgramType::Sub, &cancel).unwrap(), "O9001");
        });
    }

    #[test]
    fn test_spindle_and_position() {
        let mut sim = SimController::new();
        sim.with_state(|s| {
            s.spindle_speed = 12000;
            s.spindle_load = 35;
            s.cycle_counter = 42;
            s.positions = [100.5, -20.25, 3.0];
        });
        let cancel = CancelToken::new();
        with_channel(&mut sim, |ch| {
            assert_eq!(spindle_monitor(ch, SpindleParameter::Speed, &cancel).unwrap(), 12000);
            assert_eq!(spindle_monitor(ch, SpindleParameter::Load, &cancel).unwrap(), 35);
            assert_eq!(spindle_monitor(ch, SpindleParameter::CycleCounter, &cancel).unwrap(), 42);
            assert_eq!(current_position(ch, Axis::X, &cancel).unwrap(), 100.5);
            assert_eq!(current_position(ch, Axis::Y, &cancel).unwrap(), -20.25);
            assert_eq!(current_position(ch, Axis::Z, &cancel).unwrap(), 3.0);
        });
    }

    #[test]
    fn test_alarms() {
        let mut sim = SimController::new();
        sim.with_state(|s| {
            s.alarms = vec![
                (3, "M01 OPERATION ERROR 0005".to_string()),
                (1007, "S02 SERVO ALARM".to_string()),
            ];
        });
        let records = with_channel(&mut sim, |ch| alarms(ch, &CancelToken::new())).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].code, 3);
        assert_eq!(records[1].message, "S02 SERVO ALARM");
        assert_eq!(records[0].to_string(), "0003 M01 OPERATION ERROR 0005");
    }

    #[test]
    fn test_tool_offsets() {
        let mut sim = SimController::new();
        let cancel = CancelToken::new();
        with_channel(&mut sim, |ch| {
            set_tool_offset(ch, ToolOffsetKind::Length, 3, 125.375, &cancel).unwrap();
            set_tool_offset(ch, ToolOffsetKind::DiameterWear, 3, -0.02, &cancel).unwrap();
            assert_eq!(tool_offset(ch, ToolOffsetKind::Length, 3, &cancel).unwrap(), 125.375);
            assert_eq!(tool_offset(ch, ToolOffsetKind::DiameterWear, 3, &cancel).unwrap(), -0.02);
            assert_eq!(tool_offset(ch, ToolOffsetKind::Diameter, 3, &cancel).unwrap(), 0.0);
        });
    }

    #[test]
    fn test_tool_offset_validation_before_exchange() {
        let mut sim = SimController::new();
        let cancel = CancelToken::new();
        with_channel(&mut sim, |ch| {
            assert!(matches!(
                tool_offset(ch, ToolOffsetKind::Length, 0, &cancel),
                Err(NcError::InvalidParameter { .. })
            ));
            assert!(matches!(
                set_tool_offset(ch, ToolOffsetKind::Length, 1, f64::NAN, &cancel),
                Err(NcError::InvalidParameter { .. })
            ));
        });
        assert!(sim.requests().is_empty());
    }

    #[test]
    fn test_tool_offset_write_not_retried() {
        let mut sim = SimController::new();
        sim.inject(Fault::Silent);
        let mut link = sim.link();
        let timeouts = Timeouts {
            status: std::time::Duration::from_millis(20),
            ..Timeouts::default()
        };
        let mut dispatcher = Dispatcher::new(1, timeouts, true, 2);
        let mut channel = Channel::new(&mut dispatcher, &mut sim, &mut link);
        let err = set_tool_offset(&mut channel, ToolOffsetKind::Length, 1, 1.0, &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, NcError::Timeout { .. }));
        assert_eq!(sim.requests().len(), 1);
    }

    #[test]
    fn test_snapshot() {
        let mut sim = SimController::new();
        sim.with_state(|s| {
            s.run_status = 1;
            s.tool_in_spindle = 12;
            s.spindle_speed = 8000;
            s.spindle_load = 20;
        });
        let snapshot = with_channel(&mut sim, |ch| snapshot(ch, &CancelToken::new())).unwrap();
        assert_eq!(snapshot.drive_info, "M01:");
        assert_eq!(snapshot.run_status, RunStatus::AutoRun);
        assert!(snapshot.alarms.is_empty());
        assert_eq!(snapshot.tool_number, 12);
        assert_eq!(snapshot.spindle_speed, 8000);
        assert_eq!(snapshot.spindle_load, 20);
    }

    #[test]
    fn test_magazine_queries() {
        let mut sim = SimController::new();
        sim.with_state(|s| {
            s.magazine_size = 30;
            s.tool_set_size = 200;
        });
        let cancel = CancelToken::new();
        with_channel(&mut sim, |ch| {
            assert_eq!(magazine_size(ch, &cancel).unwrap(), 30);
            assert_eq!(tool_set_size(ch, &cancel).unwrap(), 200);
        });
    }

    #[test]
    fn test_first_drive_of_list() {
        assert_eq!(first_drive("M01:\r\nM02:\r\n"), "M01:");
        assert_eq!(first_drive("M01:\0\0"), "M01:");
        assert_eq!(first_drive("\r\nM03:"), "M03:");
        assert_eq!(first_drive(""), "");
    }

    #[test]
    fn test_drive_info_single_drive() {
        let mut sim = SimController::new();
        sim.with_state(|s| s.drive_info = "M01:".to_string());
        let info = with_channel(&mut sim, |ch| drive_info(ch, &CancelToken::new())).unwrap();
        assert_eq!(info, "M01:");
    }

    #[test]
    fn test_common_variable_name() {
        let mut sim = SimController::new();
        sim.with_state(|s| {
            s.var_names.insert(100, "WORK_COUNT".to_string());
        });
        let cancel = CancelToken::new();
        with_channel(&mut sim, |ch| {
            assert_eq!(common_variable_name(ch, 100, &cancel).unwrap(), "WORK_COUNT");
            let err = common_variable_name(ch, 101, &cancel).unwrap_err();
            assert!(err.controller_code().is_some());
        });
        let log = sim.requests();
        assert_eq!(log[0].command, CommandCode::CommonVariableName);
        assert_eq!(log[0].payload, 100u32.to_le_bytes().to_vec());
    }
}
