//! On-disk segment framing: `[len:u32][crc32:u32][payload]`, all big-endian.
//!
//! Grounded on `harborgrid-justin-rusty-db`'s `storage/checksum.rs` (CRC
//! helper extracted to avoid duplication) and `storage/disk.rs` (plain
//! `std::fs` + `sync_all` for durability, no async I/O). The frame layout
//! itself is authoritative per `original_source/pspf/log/local_log.py`.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{FluxError, Result};
use crate::record::{self, Record};

pub const HEADER_LEN: u64 = 8;

pub fn segment_path(data_dir: &Path, partition: u32, start_offset: u64) -> PathBuf {
    data_dir.join(format!("partition_{partition}_{start_offset}.bin"))
}

/// `(start_offset, path)` for every segment of a partition, ascending.
pub fn list_segments(data_dir: &Path, partition: u32) -> std::io::Result<Vec<(u64, PathBuf)>> {
    let prefix = format!("partition_{partition}_");
    let mut segments = Vec::new();
    if !data_dir.exists() {
        return Ok(segments);
    }
    for entry in std::fs::read_dir(data_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let Some(stem) = name.strip_suffix(".bin") else {
            continue;
        };
        let Some(rest) = stem.strip_prefix(&prefix) else {
            continue;
        };
        if let Ok(start_offset) = rest.parse::<u64>() {
            segments.push((start_offset, entry.path()));
        } else {
            tracing::warn!(file = %name, "ignoring malformed segment filename");
        }
    }
    segments.sort_by_key(|(start, _)| *start);
    Ok(segments)
}

/// Appends one framed record to `file` and fsyncs before returning.
pub fn write_frame(file: &mut File, payload: &[u8]) -> std::io::Result<()> {
    let mut header = [0u8; HEADER_LEN as usize];
    header[0..4].copy_from_slice(&(payload.len() as u32).to_be_bytes());
    header[4..8].copy_from_slice(&crc32fast::hash(payload).to_be_bytes());
    file.write_all(&header)?;
    file.write_all(payload)?;
    file.sync_all()
}

/// Result of scanning one segment's frames from the start.
pub struct ScanOutcome {
    /// Count of complete, CRC-valid frames encountered before truncation/EOF.
    pub valid_records: u64,
    /// Byte offset immediately after the last valid frame; the point at
    /// which a corrupt or torn tail should be truncated.
    pub valid_end: u64,
}

/// Scans a segment file from the start, validating every frame's CRC.
/// Stops at the first short header, short payload, CRC mismatch, or
/// zero-length frame (treated as an EOF marker per the corruption edge
/// cases) without raising: the caller decides whether to truncate.
pub fn scan_segment(path: &Path) -> std::io::Result<ScanOutcome> {
    let mut file = File::open(path)?;
    let mut valid_records = 0u64;
    let mut valid_end = 0u64;
    loop {
        let pos = file.stream_position()?;
        let mut header = [0u8; HEADER_LEN as usize];
        match file.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        }
        let length = u32::from_be_bytes(header[0..4].try_into().unwrap());
        let stored_crc = u32::from_be_bytes(header[4..8].try_into().unwrap());
        if length == 0 {
            // Zero-length frame is an EOF marker, not a record.
            break;
        }
        let mut payload = vec![0u8; length as usize];
        match file.read_exact(&mut payload) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        }
        if crc32fast::hash(&payload) != stored_crc {
            break;
        }
        valid_records += 1;
        valid_end = pos + HEADER_LEN + length as u64;
    }
    Ok(ScanOutcome {
        valid_records,
        valid_end,
    })
}

/// Truncates `path` to `len` bytes (frame-boundary truncation on recovery).
pub fn truncate_to(path: &Path, len: u64) -> std::io::Result<()> {
    let file = OpenOptions::new().write(true).open(path)?;
    file.set_len(len)
}

/// Reads every complete frame from `path`, starting counting offsets at
/// `segment_start`. Frames whose offset is `< from_offset` are skipped
/// byte-wise without CRC verification or deserialization (matching the
/// reference implementation's read-path optimization); frames `>=
/// from_offset` are verified and decoded. A mid-file CRC mismatch at or past
/// `from_offset` is reported as [`FluxError::LogCorruption`] and halts the
/// scan; mismatches purely in the skipped prefix never surface because that
/// region is never checked.
pub fn read_frames_from(
    path: &Path,
    partition: u32,
    segment_start: u64,
    from_offset: u64,
) -> Result<Vec<Record>> {
    let mut file = File::open(path)?;
    let mut out = Vec::new();
    let mut current_offset = segment_start;
    loop {
        let mut header = [0u8; HEADER_LEN as usize];
        match file.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(FluxError::StorageIo(e)),
        }
        let length = u32::from_be_bytes(header[0..4].try_into().unwrap());
        let stored_crc = u32::from_be_bytes(header[4..8].try_into().unwrap());
        if length == 0 {
            break;
        }
        let mut payload = vec![0u8; length as usize];
        match file.read_exact(&mut payload) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(FluxError::StorageIo(e)),
        }
        if current_offset >= from_offset {
            if crc32fast::hash(&payload) != stored_crc {
                return Err(FluxError::LogCorruption {
                    partition,
                    offset: current_offset,
                    reason: "CRC mismatch reading committed segment".into(),
                });
            }
            match record::decode(&payload) {
                Ok(record) => out.push(record),
                Err(e) => {
                    tracing::warn!(
                        partition,
                        offset = current_offset,
                        error = %e,
                        "skipping record that failed to deserialize"
                    );
                }
            }
        }
        current_offset += 1;
    }
    Ok(out)
}

/// Seeks past the current contents of `file`, positioning for append.
pub fn seek_to_end(file: &mut File) -> std::io::Result<u64> {
    file.seek(SeekFrom::End(0))
}

pub fn open_append(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}
