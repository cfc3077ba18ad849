//! The partitioned append-only log (§4.1, component C1).
//!
//! Grounded on `harborgrid-justin-rusty-db`'s `storage` module for the
//! CRC/durability idiom and on `original_source/pspf/log/local_log.py` for
//! the authoritative recovery algorithm: older segments are trusted as
//! immutable, only the active segment is scanned and truncated at the first
//! bad frame boundary.

mod segment;

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;

use crate::error::{FluxError, Result};
use crate::record::Record;

#[derive(Debug)]
struct PartitionState {
    active_start: u64,
    next_offset: u64,
}

/// An append-only, CRC-framed, segmented log shared by every partition.
#[derive(Debug)]
pub struct PartitionedLog {
    data_dir: PathBuf,
    num_partitions: u32,
    max_segment_size: u64,
    partitions: Vec<Mutex<PartitionState>>,
}

impl PartitionedLog {
    /// Opens (and recovers) the log rooted at `data_dir`.
    pub fn open(data_dir: impl Into<PathBuf>, num_partitions: u32, max_segment_size: u64) -> Result<Self> {
        let data_dir = data_dir.into();
        std::fs::create_dir_all(&data_dir)?;
        let mut partitions = Vec::with_capacity(num_partitions as usize);
        for p in 0..num_partitions {
            partitions.push(Mutex::new(Self::recover_partition(&data_dir, p)?));
        }
        Ok(Self {
            data_dir,
            num_partitions,
            max_segment_size,
            partitions,
        })
    }

    fn recover_partition(data_dir: &Path, partition: u32) -> Result<PartitionState> {
        let segments = segment::list_segments(data_dir, partition)?;

        if segments.is_empty() {
            let path = segment::segment_path(data_dir, partition, 0);
            segment::open_append(&path)?;
            tracing::info!(partition, "initialized empty partition at offset 0");
            return Ok(PartitionState {
                active_start: 0,
                next_offset: 0,
            });
        }

        // All but the last segment are trusted as immutable and valid (the
        // spec's fast path: O(tail), not O(log), startup). A closed
        // segment's record count is derived from where the next segment
        // starts -- never by re-reading and CRC-checking its contents.
        // Segment starts must still be strictly increasing; anything else
        // means two segments claim the same or overlapping offset range.
        for window in segments.windows(2) {
            let (start, _) = window[0];
            let (next_start, _) = window[1];
            if next_start <= start {
                return Err(FluxError::LogCorruption {
                    partition,
                    offset: start,
                    reason: format!("segment starts are not strictly increasing: {start} then {next_start}"),
                });
            }
        }

        // Only the active (last) segment may hold a torn tail from a crash
        // mid-write, so it is the only one actually scanned.
        let (active_start, active_path) = segments.last().unwrap();
        let active_start = *active_start;
        let outcome = segment::scan_segment(active_path)?;
        if outcome.valid_end < file_len(active_path)? {
            tracing::warn!(
                partition,
                file = %active_path.display(),
                "truncating corrupt or torn tail at byte {}",
                outcome.valid_end
            );
            segment::truncate_to(active_path, outcome.valid_end)?;
        }
        let next_offset = active_start + outcome.valid_records;

        tracing::info!(partition, next_offset, "partition recovered");
        Ok(PartitionState {
            active_start,
            next_offset,
        })
    }

    pub fn partitions(&self) -> u32 {
        self.num_partitions
    }

    pub fn high_watermark(&self, partition: u32) -> u64 {
        self.partitions[partition as usize].lock().next_offset
    }

    /// Assigns a partition (`crc32(key) mod P`) and offset, frames, and
    /// durably appends `record`. Returns the record with those fields
    /// filled in.
    pub fn append(&self, mut record: Record) -> Result<Record> {
        let partition = crate::config::hash_partition(&record.key, self.num_partitions);
        let mut state = self.partitions[partition as usize].lock();

        let mut active_path = segment::segment_path(&self.data_dir, partition, state.active_start);
        if file_len(&active_path)? >= self.max_segment_size {
            state.active_start = state.next_offset;
            active_path = segment::segment_path(&self.data_dir, partition, state.active_start);
            segment::open_append(&active_path)?;
            tracing::info!(partition, new_start = state.active_start, "rotated segment");
        }

        let offset = state.next_offset;
        record.partition = partition;
        record.offset = offset;

        let payload = crate::record::encode(&record)?;
        let mut file = segment::open_append(&active_path)?;
        segment::seek_to_end(&mut file)?;
        segment::write_frame(&mut file, &payload)?;

        state.next_offset += 1;
        Ok(record)
    }

    /// Follower-side append (§4.8): writes `record` at the offset and
    /// partition the leader already assigned, instead of reassigning them
    /// from this node's own high watermark. A record whose offset has
    /// already been applied is treated as a duplicate delivery and skipped;
    /// one that arrives ahead of this node's watermark cannot be placed
    /// without violating gap-freeness and is rejected for the caller to log.
    pub fn append_at(&self, record: Record) -> Result<()> {
        let mut state = self.partitions[record.partition as usize].lock();
        if record.offset < state.next_offset {
            tracing::debug!(partition = record.partition, offset = record.offset, "duplicate follower append, already applied");
            return Ok(());
        }
        if record.offset > state.next_offset {
            return Err(FluxError::LogCorruption {
                partition: record.partition,
                offset: state.next_offset,
                reason: format!("follower received offset {} ahead of local watermark {}", record.offset, state.next_offset),
            });
        }

        let mut active_path = segment::segment_path(&self.data_dir, record.partition, state.active_start);
        if file_len(&active_path)? >= self.max_segment_size {
            state.active_start = state.next_offset;
            active_path = segment::segment_path(&self.data_dir, record.partition, state.active_start);
            segment::open_append(&active_path)?;
            tracing::info!(partition = record.partition, new_start = state.active_start, "rotated segment");
        }

        let payload = crate::record::encode(&record)?;
        let mut file = segment::open_append(&active_path)?;
        segment::seek_to_end(&mut file)?;
        segment::write_frame(&mut file, &payload)?;

        state.next_offset += 1;
        Ok(())
    }

    /// Returns every record with `offset >= from_offset` currently on disk
    /// for `partition`, in ascending order. An empty result means "caught
    /// up"; the caller is responsible for polling again.
    pub fn read(&self, partition: u32, from_offset: u64) -> Result<Vec<Record>> {
        let segments = segment::list_segments(&self.data_dir, partition)?;
        let mut out = Vec::new();
        for (idx, (start, path)) in segments.iter().enumerate() {
            let next_start = segments.get(idx + 1).map(|(s, _)| *s).unwrap_or(u64::MAX);
            if from_offset >= next_start {
                continue;
            }
            let records = segment::read_frames_from(path, partition, *start, from_offset)?;
            out.extend(records);
        }
        Ok(out)
    }

    /// Deletes closed segments whose mtime is older than `retention`. Never
    /// touches the active segment of any partition.
    pub fn delete_expired_segments(&self, retention: Duration) -> Result<()> {
        let now = SystemTime::now();
        for partition in 0..self.num_partitions {
            let segments = segment::list_segments(&self.data_dir, partition)?;
            let Some((_, active_path)) = segments.last() else {
                continue;
            };
            for (_, path) in &segments {
                if path == active_path {
                    continue;
                }
                let modified = std::fs::metadata(path)?.modified()?;
                if now.duration_since(modified).unwrap_or_default() > retention {
                    tracing::info!(file = %path.display(), "deleting expired segment");
                    std::fs::remove_file(path)?;
                }
            }
        }
        Ok(())
    }
}

fn file_len(path: &Path) -> std::io::Result<u64> {
    match std::fs::metadata(path) {
        Ok(meta) => Ok(meta.len()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Record;

    fn rec(key: &str, value: &str) -> Record {
        Record::new(key.as_bytes().to_vec(), value.as_bytes().to_vec(), "t", 0)
    }

    #[test]
    fn s1_write_read_single_partition() {
        let dir = tempfile::tempdir().unwrap();
        let log = PartitionedLog::open(dir.path(), 1, 100 * 1024 * 1024).unwrap();

        let a = log.append(rec("k", "A")).unwrap();
        let b = log.append(rec("k", "B")).unwrap();
        let c = log.append(rec("k", "C")).unwrap();

        assert_eq!((a.offset, b.offset, c.offset), (0, 1, 2));
        assert_eq!(log.high_watermark(0), 3);

        let records = log.read(0, 0).unwrap();
        let values: Vec<_> = records.iter().map(|r| r.value.clone()).collect();
        assert_eq!(values, vec![b"A".to_vec(), b"B".to_vec(), b"C".to_vec()]);
    }

    #[test]
    fn s2_crash_recovery_truncates_torn_tail() {
        let dir = tempfile::tempdir().unwrap();
        {
            let log = PartitionedLog::open(dir.path(), 1, 100 * 1024 * 1024).unwrap();
            log.append(rec("k", "A")).unwrap();
            log.append(rec("k", "B")).unwrap();
            log.append(rec("k", "C")).unwrap();
        }

        let path = segment::segment_path(dir.path(), 0, 0);
        let len = std::fs::metadata(&path).unwrap().len();
        let truncated = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        truncated.set_len(len - 2).unwrap();
        drop(truncated);

        let log = PartitionedLog::open(dir.path(), 1, 100 * 1024 * 1024).unwrap();
        assert_eq!(log.high_watermark(0), 2);
        let records = log.read(0, 0).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].value, b"B".to_vec());

        let d = log.append(rec("k", "D")).unwrap();
        assert_eq!(d.offset, 2);
        assert_eq!(log.high_watermark(0), 3);
    }

    #[test]
    fn non_increasing_segment_starts_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path()).unwrap();
        std::fs::File::create(segment::segment_path(dir.path(), 0, 5)).unwrap();
        // Differently-formatted filename parsing to the same numeric start
        // as the segment above: two segments can never legitimately claim
        // the same starting offset.
        std::fs::File::create(dir.path().join("partition_0_05.bin")).unwrap();

        let err = PartitionedLog::open(dir.path(), 1, 100 * 1024 * 1024).unwrap_err();
        assert!(matches!(err, FluxError::LogCorruption { .. }));
    }

    #[test]
    fn closed_segments_are_trusted_without_content_scanning() {
        let dir = tempfile::tempdir().unwrap();
        {
            let log = PartitionedLog::open(dir.path(), 1, 16).unwrap();
            for i in 0..5 {
                log.append(rec("k", &format!("v{i}"))).unwrap();
            }
        }
        let segments = segment::list_segments(dir.path(), 0).unwrap();
        assert!(segments.len() > 1, "need multiple segments for this test to be meaningful");
        let (_, first_segment_path) = &segments[0];

        // Corrupt a byte inside the closed (non-active) first segment. If
        // recovery CRC-checked this segment's contents it would detect the
        // corruption; the fast path trusts it and derives its record count
        // from where the next segment starts instead.
        let mut bytes = std::fs::read(first_segment_path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        std::fs::write(first_segment_path, bytes).unwrap();

        let log = PartitionedLog::open(dir.path(), 1, 16).unwrap();
        assert_eq!(log.high_watermark(0), 5, "closed segment record count must come from the next segment's start, not a re-scan");
    }

    #[test]
    fn rotates_segment_past_max_size() {
        let dir = tempfile::tempdir().unwrap();
        let log = PartitionedLog::open(dir.path(), 1, 16).unwrap();
        for i in 0..5 {
            log.append(rec("k", &format!("v{i}"))).unwrap();
        }
        let segments = segment::list_segments(dir.path(), 0).unwrap();
        assert!(segments.len() > 1, "expected rotation to have occurred");
    }

    #[test]
    fn retention_sweep_preserves_active_segment() {
        let dir = tempfile::tempdir().unwrap();
        let log = PartitionedLog::open(dir.path(), 1, 16).unwrap();
        for i in 0..5 {
            log.append(rec("k", &format!("v{i}"))).unwrap();
        }
        log.delete_expired_segments(Duration::from_secs(0)).unwrap();
        // The active segment must still be readable.
        assert!(log.high_watermark(0) >= 1);
    }
}
