//! Chunked file transfer and directory listing.
//!
//! Transfers run as open, a series of indexed chunk exchanges, then close.
//! Once a file is open, any failure (timeout, controller error, link loss,
//! protocol error or cancellation) is followed by a best-effort abort so the
//! controller does not keep the file locked. The abort never replaces the
//! original error; if it fails too, that is only logged.

use crate::dispatcher::{CancelToken, Channel};
use crate::error::{NcError, Result};
use crate::frame::{CommandCode, PayloadWriter, Request, ResponseShape, MAX_PAYLOAD_SIZE};
use crate::transport::Transport;

/// Default chunk size in bytes.
pub const DEFAULT_CHUNK_SIZE: usize = 256;

/// Largest chunk that fits in one frame next to the chunk index.
pub const MAX_CHUNK_SIZE: usize = MAX_PAYLOAD_SIZE - 8;

/// Longest controller path accepted.
pub const MAX_PATH_LEN: usize = 255;

/// Guard against a controller that never ends a directory search.
const MAX_DIRECTORY_ENTRIES: usize = 10_000;

const DIRECTORY_PASS: i32 = -1;
const FILE_PASS: i32 = 5;

/// Open mode of a controller file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpenMode {
    Read,
    Overwrite,
}

impl OpenMode {
    pub(crate) fn code(self) -> u8 {
        match self {
            OpenMode::Read => 1,
            OpenMode::Overwrite => 3,
        }
    }
}

/// Kind of a directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FileKind {
    /// Regular file.
    File,
    /// Directory.
    Directory,
}

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FileEntry {
    /// Full controller path of the entry.
    pub path: String,
    /// Entry name as reported by the controller.
    pub name: String,
    /// File or directory.
    pub kind: FileKind,
    /// Size in bytes; zero when the controller reports none.
    pub size: u64,
    /// Comment attached to the entry.
    pub comment: String,
}

impl FileEntry {
    /// Returns `true` for directories.
    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }
}

pub(crate) fn check_path(path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(NcError::invalid_parameter("path", "must not be empty"));
    }
    if path.len() > MAX_PATH_LEN {
        return Err(NcError::invalid_parameter(
            "path",
            format!("{} bytes exceeds {}", path.len(), MAX_PATH_LEN),
        ));
    }
    if path.contains('\0') {
        return Err(NcError::invalid_parameter("path", "contains a NUL byte"));
    }
    Ok(())
}

pub(crate) fn check_chunk_size(chunk_size: usize) -> Result<()> {
    if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
        return Err(NcError::invalid_parameter(
            "chunk_size",
            format!("must be between 1 and {}", MAX_CHUNK_SIZE),
        ));
    }
    Ok(())
}

/// Rewrites the `M01` drive alias to the drive of `unit`.
fn rewrite_drive_alias(path: &str, unit: u8) -> String {
    match path.strip_prefix("M01") {
        Some(rest) if rest.is_empty() || rest.starts_with(':') => format!("M{:02X}{}", unit, rest),
        _ => path.to_string(),
    }
}

fn join_path(dir: &str, name: &str) -> String {
    if dir.ends_with('/') || dir.ends_with(':') {
        format!("{}{}", dir, name)
    } else {
        format!("{}/{}", dir, name)
    }
}

fn open<T: Transport>(channel: &mut Channel<'_, T>, path: &str, mode: OpenMode, cancel: &CancelToken) -> Result<()> {
    let payload = PayloadWriter::new().u8(mode.code()).str(path).finish();
    channel
        .exchange(&Request::new(CommandCode::FileOpen, payload, ResponseShape::Empty), cancel)
        .map(|_| ())
        .map_err(|e| e.for_path(path))
}

fn close<T: Transport>(channel: &mut Channel<'_, T>, cancel: &CancelToken) -> Result<()> {
    channel.exchange(
        &Request::new(CommandCode::FileClose, Vec::new(), ResponseShape::Empty),
        cancel,
    )?;
    Ok(())
}

/// Abandons the open file. Failures are logged, not returned.
fn abort<T: Transport>(channel: &mut Channel<'_, T>, path: &str, cause: &NcError) {
    let request = Request::new(CommandCode::FileAbort, Vec::new(), ResponseShape::Empty);
    match channel.exchange(&request, &CancelToken::new()) {
        Ok(_) => tracing::debug!(path, cause = %cause, "transfer aborted"),
        Err(e) => tracing::warn!(path, error = %e, cause = %cause, "abort failed"),
    }
}

fn read_chunks<T: Transport>(
    channel: &mut Channel<'_, T>,
    chunk_size: usize,
    cancel: &CancelToken,
) -> Result<Vec<u8>> {
    let mut content = Vec::new();
    let mut index: u32 = 0;
    loop {
        let payload = PayloadWriter::new().u32(index).u16(chunk_size as u16).finish();
        let response = channel.exchange(
            &Request::new(CommandCode::FileRead, payload, ResponseShape::AtLeast(5)),
            cancel,
        )?;
        let mut reader = response.reader();
        let echoed = reader.u32()?;
        if echoed != index {
            return Err(NcError::protocol(format!(
                "requested chunk {} but received chunk {}",
                index, echoed
            )));
        }
        let eof = match reader.u8()? {
            0 => false,
            1 => true,
            other => return Err(NcError::protocol(format!("invalid end-of-file flag {}", other))),
        };
        let data = reader.rest();
        if data.len() > chunk_size {
            return Err(NcError::protocol(format!(
                "chunk {} carries {} bytes, requested at most {}",
                index,
                data.len(),
                chunk_size
            )));
        }
        if data.is_empty() && !eof {
            return Err(NcError::protocol(format!("empty chunk {} before end of file", index)));
        }
        content.extend_from_slice(data);
        if eof {
            return Ok(content);
        }
        index = index
            .checked_add(1)
            .ok_or_else(|| NcError::protocol("chunk index overflow"))?;
    }
}

fn write_chunks<T: Transport>(
    channel: &mut Channel<'_, T>,
    data: &[u8],
    chunk_size: usize,
    cancel: &CancelToken,
) -> Result<()> {
    for (index, chunk) in data.chunks(chunk_size).enumerate() {
        let index = u32::try_from(index)
            .map_err(|_| NcError::invalid_parameter("data", "too many chunks"))?;
        let payload = PayloadWriter::new().u32(index).bytes(chunk).finish();
        let response = channel.exchange(
            &Request::new(CommandCode::FileWrite, payload, ResponseShape::Exact(4)),
            cancel,
        )?;
        let acked = response.reader().u32()?;
        if acked != index {
            return Err(NcError::protocol(format!(
                "chunk {} acknowledged as {}",
                index, acked
            )));
        }
    }
    Ok(())
}

pub(crate) fn read_file<T: Transport>(
    channel: &mut Channel<'_, T>,
    path: &str,
    chunk_size: usize,
    cancel: &CancelToken,
) -> Result<Vec<u8>> {
    check_path(path)?;
    check_chunk_size(chunk_size)?;
    open(channel, path, OpenMode::Read, cancel)?;

    match read_chunks(channel, chunk_size, cancel) {
        Ok(content) => {
            if let Err(e) = close(channel, &CancelToken::new()) {
                tracing::warn!(path, error = %e, "close after read failed");
            }
            tracing::debug!(path, bytes = content.len(), "file read");
            Ok(content)
        }
        Err(e) => {
            abort(channel, path, &e);
            Err(e)
        }
    }
}

pub(crate) fn write_file<T: Transport>(
    channel: &mut Channel<'_, T>,
    path: &str,
    data: &[u8],
    chunk_size: usize,
    cancel: &CancelToken,
) -> Result<()> {
    check_path(path)?;
    check_chunk_size(chunk_size)?;
    open(channel, path, OpenMode::Overwrite, cancel)?;

    let result = write_chunks(channel, data, chunk_size, cancel).and_then(|()| close(channel, cancel));
    match result {
        Ok(()) => {
            tracing::debug!(path, bytes = data.len(), "file written");
            Ok(())
        }
        Err(e) => {
            abort(channel, path, &e);
            Err(e.for_path(path))
        }
    }
}

pub(crate) fn delete_file<T: Transport>(channel: &mut Channel<'_, T>, path: &str, cancel: &CancelToken) -> Result<()> {
    check_path(path)?;
    let payload = PayloadWriter::new().str(path).finish();
    channel
        .exchange(&Request::new(CommandCode::FileDelete, payload, ResponseShape::Empty), cancel)
        .map_err(|e| e.for_path(path))?;
    tracing::debug!(path, "file deleted");
    Ok(())
}

fn parse_entry(dir: &str, raw: &str, kind: FileKind) -> Result<FileEntry> {
    let mut fields = raw.split('\t');
    let name = fields.next().unwrap_or_default().trim();
    if name.is_empty() {
        return Err(NcError::protocol(format!("directory entry without a name: {:?}", raw)));
    }
    let size = match fields.next().map(str::trim) {
        None | Some("") => 0,
        Some(s) => s
            .parse::<u64>()
            .map_err(|_| NcError::protocol(format!("invalid size {:?} for {}", s, name)))?,
    };
    let comment = fields.next().unwrap_or_default().trim().to_string();
    Ok(FileEntry {
        path: join_path(dir, name),
        name: name.to_string(),
        kind,
        size,
        comment,
    })
}

fn decode_search_reply(response: &crate::frame::Response) -> Result<Option<String>> {
    let mut reader = response.reader();
    match reader.u8()? {
        0 => {
            reader.finish()?;
            Ok(None)
        }
        1 => {
            let entry = reader.str()?;
            reader.finish()?;
            Ok(Some(entry))
        }
        other => Err(NcError::protocol(format!("invalid search flag {}", other))),
    }
}

fn scan<T: Transport>(
    channel: &mut Channel<'_, T>,
    dir: &str,
    mode: i32,
    kind: FileKind,
    entries: &mut Vec<FileEntry>,
    cancel: &CancelToken,
) -> Result<()> {
    let payload = PayloadWriter::new().i32(mode).str(dir).finish();
    let response = channel
        .exchange(&Request::new(CommandCode::DirFind, payload, ResponseShape::AtLeast(1)), cancel)
        .map_err(|e| e.for_path(dir))?;
    let mut next = decode_search_reply(&response)?;

    while let Some(raw) = next {
        if entries.len() >= MAX_DIRECTORY_ENTRIES {
            return Err(NcError::protocol(format!(
                "directory search exceeded {} entries",
                MAX_DIRECTORY_ENTRIES
            )));
        }
        entries.push(parse_entry(dir, &raw, kind)?);
        let response = channel.exchange(
            &Request::new(CommandCode::DirNext, Vec::new(), ResponseShape::AtLeast(1)),
            cancel,
        )?;
        next = decode_search_reply(&response)?;
    }
    Ok(())
}

fn reset_search<T: Transport>(channel: &mut Channel<'_, T>) -> Result<()> {
    channel.exchange(
        &Request::new(CommandCode::DirReset, Vec::new(), ResponseShape::Empty),
        &CancelToken::new(),
    )?;
    Ok(())
}

fn list_passes<T: Transport>(
    channel: &mut Channel<'_, T>,
    dir: &str,
    cancel: &CancelToken,
) -> Result<Vec<FileEntry>> {
    let mut entries = Vec::new();
    scan(channel, dir, DIRECTORY_PASS, FileKind::Directory, &mut entries, cancel)?;
    reset_search(channel)?;
    scan(channel, dir, FILE_PASS, FileKind::File, &mut entries, cancel)?;
    Ok(entries)
}

pub(crate) fn list_directory<T: Transport>(
    channel: &mut Channel<'_, T>,
    path: &str,
    cancel: &CancelToken,
) -> Result<Vec<FileEntry>> {
    check_path(path)?;
    let dir = rewrite_drive_alias(path, channel.unit());
    let result = list_passes(channel, &dir, cancel);
    if let Err(e) = reset_search(channel) {
        tracing::warn!(path = %dir, error = %e, "directory reset failed");
    }
    result
}
