//! Example: Reading and writing devices and status
//!
//! Run with: cargo run --example read_devices -- 192.168.1.20
//!
//! This example demonstrates:
//! - Session configuration with custom timeouts
//! - Bit and word device access
//! - 32-bit values spanning two words
//! - Status snapshot and tool queries
//! - Error handling patterns

use m700_nc::{
    Axis, NcError, ProgramType, Session, SessionConfig, ToolOffsetKind, Value, ValueType,
};
use std::time::Duration;

fn main() -> m700_nc::Result<()> {
    let host = std::env::args().nth(1).unwrap_or_else(|| "192.168.1.20".to_string());

    // =========================================================================
    // Connect
    // =========================================================================

    let config = SessionConfig::new(host.parse()?)
        .with_device_timeout(Duration::from_secs(1))
        .with_connect_timeout(Duration::from_secs(3));
    let session = Session::connect(config)?;
    println!("Connected as unit {:?}", session.unit());

    // =========================================================================
    // Devices
    // =========================================================================

    println!("\n=== Devices ===\n");

    let flag = session.read_device("M900")?;
    println!("{}", flag);

    session.write_device("D100", Value::I16(1200))?;
    println!("{}", session.read_device("D100")?);

    // I32/F32 values written to a word device occupy D200 and D201
    session.write_device("D200", Value::F32(12.5))?;
    println!("{}", session.read_device_as("D200", ValueType::F32)?);

    // Type errors are caught before anything is sent
    match session.write_device("M900", "text") {
        Err(NcError::TypeMismatch { address, expected, found }) => {
            println!("{}: expected {}, got {}", address, expected, found)
        }
        other => println!("unexpected: {:?}", other),
    }

    // =========================================================================
    // Status
    // =========================================================================

    println!("\n=== Status ===\n");

    let status = session.run_status()?;
    println!("Drive:   {}", status.drive_info);
    println!("State:   {}", status.run_status);
    println!("Spindle: {} rpm, {}% load", status.spindle_speed, status.spindle_load);
    println!("Tool:    {}", status.tool_number);
    for alarm in &status.alarms {
        println!("Alarm:   {}", alarm);
    }

    println!("Version: {}", session.version()?);
    println!("Main program: {}", session.program_number(ProgramType::Main)?);
    for axis in [Axis::X, Axis::Y, Axis::Z] {
        println!("{:?} = {:.3}", axis, session.current_position(axis)?);
    }
    println!(
        "Tool 1 length: {:.3}",
        session.tool_offset(ToolOffsetKind::Length, 1)?
    );

    session.close();
    Ok(())
}
