//! Example: Transferring NC programs
//!
//! Run with: cargo run --example file_transfer -- 192.168.1.20
//!
//! This example demonstrates:
//! - Directory listing
//! - Reading and writing programs in chunks
//! - Cancelling a transfer from another thread
//! - Mapping file errors

use m700_nc::{CancelToken, NcError, Session, SessionConfig};
use std::thread;
use std::time::Duration;

fn main() -> m700_nc::Result<()> {
    let host = std::env::args().nth(1).unwrap_or_else(|| "192.168.1.20".to_string());
    let config = SessionConfig::new(host.parse()?).with_chunk_size(512);
    let session = Session::connect(config)?;

    // =========================================================================
    // Listing
    // =========================================================================

    println!("=== M01:/PRG/USER/ ===\n");
    for entry in session.list_directory("M01:/PRG/USER/")? {
        let marker = if entry.is_dir() { "<DIR>" } else { "" };
        println!("{:<12} {:>8} {:<6} {}", entry.name, entry.size, marker, entry.comment);
    }

    // =========================================================================
    // Copy a program
    // =========================================================================

    let program = session.read_file("M01:/PRG/USER/O1000")?;
    println!("\nRead O1000: {} bytes", program.len());

    session.write_file("M01:/PRG/USER/O1001", &program)?;
    println!("Wrote O1001");

    // =========================================================================
    // Cancellation
    // =========================================================================

    let cancel = CancelToken::new();
    let handle = cancel.clone();
    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        handle.cancel();
    });
    let large = program.repeat(64);
    match session.write_file_with_cancel("M01:/PRG/USER/O1002", &large, &cancel) {
        Ok(()) => println!("O1002 finished before cancellation"),
        Err(NcError::Cancelled) => println!("O1002 cancelled and aborted"),
        Err(e) => return Err(e),
    }
    let _ = canceller.join();

    // =========================================================================
    // Errors
    // =========================================================================

    session.delete_file("M01:/PRG/USER/O1001")?;
    match session.delete_file("M01:/PRG/USER/O1001") {
        Err(NcError::NotFound { path, code }) => println!("{} already gone (0x{:08X})", path, code),
        Err(NcError::PermissionDenied { path, .. }) => println!("{} is protected", path),
        other => println!("unexpected: {:?}", other),
    }

    session.close();
    Ok(())
}
