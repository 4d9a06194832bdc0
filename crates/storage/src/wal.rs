//! The write-ahead log.
//!
//! One record per committed transaction, carrying every write across all
//! column families. Frames are `[len: u32 LE][crc32: u32 LE][payload]`
//! with a bincode-encoded payload. The reader stops at the first torn or
//! corrupt frame and truncates the file there, which is exactly the
//! "replay up to the last durable barrier, discard partial batches"
//! contract.

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use themis_core::error::{Result, ThemisError};
use tracing::warn;

/// One write inside a WAL record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalOp {
    /// Column family name.
    pub cf: String,
    /// Storage key.
    pub key: Vec<u8>,
    /// New value; `None` is a tombstone.
    pub value: Option<Vec<u8>>,
}

/// One committed transaction in the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalRecord {
    /// Commit sequence assigned to every op in the record.
    pub seq: u64,
    /// The transaction's writes, in application order.
    pub ops: Vec<WalOp>,
}

/// Append-only WAL writer over a single file.
#[derive(Debug)]
pub struct Wal {
    file: File,
    path: PathBuf,
    len: u64,
}

impl Wal {
    /// Open (or create) the WAL at `path`, positioned for appending.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)?;
        let len = file.metadata()?.len();
        Ok(Wal {
            file,
            path: path.to_path_buf(),
            len,
        })
    }

    /// Append one record; `sync` forces an fsync before returning.
    pub fn append(&mut self, record: &WalRecord, sync: bool) -> Result<()> {
        let payload = bincode::serialize(record)?;
        let mut frame = vec![0u8; 8 + payload.len()];
        LittleEndian::write_u32(&mut frame[0..4], payload.len() as u32);
        LittleEndian::write_u32(&mut frame[4..8], crc32fast::hash(&payload));
        frame[8..].copy_from_slice(&payload);
        self.file.write_all(&frame)?;
        if sync {
            self.file.sync_data()?;
        }
        self.len += frame.len() as u64;
        Ok(())
    }

    /// Current file length in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// True when the log holds no records.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Truncate the log to empty (after a snapshot rewrite).
    pub fn reset(&mut self) -> Result<()> {
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::End(0))?;
        self.file.sync_data()?;
        self.len = 0;
        Ok(())
    }

    /// Path of the underlying file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Read every intact record from a WAL file. A torn tail (short frame or
/// CRC mismatch) ends the read; the file is truncated to the last intact
/// frame so subsequent appends continue from a clean barrier.
pub fn read_and_repair(path: &Path) -> Result<Vec<WalRecord>> {
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;

    let mut records = Vec::new();
    let mut offset = 0usize;
    let mut intact_end = 0usize;
    while offset + 8 <= buf.len() {
        let len = LittleEndian::read_u32(&buf[offset..offset + 4]) as usize;
        let crc = LittleEndian::read_u32(&buf[offset + 4..offset + 8]);
        let payload_start = offset + 8;
        let payload_end = payload_start + len;
        if payload_end > buf.len() {
            break;
        }
        let payload = &buf[payload_start..payload_end];
        if crc32fast::hash(payload) != crc {
            break;
        }
        match bincode::deserialize::<WalRecord>(payload) {
            Ok(record) => records.push(record),
            Err(_) => break,
        }
        offset = payload_end;
        intact_end = offset;
    }

    if intact_end < buf.len() {
        warn!(
            discarded = buf.len() - intact_end,
            "discarding torn tail of write-ahead log"
        );
        let file = OpenOptions::new().write(true).open(path)?;
        file.set_len(intact_end as u64)?;
        file.sync_data()?;
    }

    // Sequences must be monotonic; a regression means the file was
    // assembled from mismatched pieces.
    for pair in records.windows(2) {
        if pair[1].seq <= pair[0].seq {
            return Err(ThemisError::storage(format!(
                "WAL sequence regression: {} after {}",
                pair[1].seq, pair[0].seq
            )));
        }
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(seq: u64) -> WalRecord {
        WalRecord {
            seq,
            ops: vec![WalOp {
                cf: "entities".into(),
                key: format!("users:{}", seq).into_bytes(),
                value: Some(vec![seq as u8]),
            }],
        }
    }

    #[test]
    fn test_append_and_read_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wal.log");
        {
            let mut wal = Wal::open(&path).unwrap();
            for seq in 1..=5 {
                wal.append(&record(seq), false).unwrap();
            }
        }
        let records = read_and_repair(&path).unwrap();
        assert_eq!(records.len(), 5);
        assert_eq!(records[4], record(5));
    }

    #[test]
    fn test_missing_file_reads_empty() {
        let dir = TempDir::new().unwrap();
        let records = read_and_repair(&dir.path().join("absent.log")).unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn test_torn_tail_discarded_and_truncated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wal.log");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&record(1), true).unwrap();
            wal.append(&record(2), true).unwrap();
        }
        // Simulate a crash mid-append: chop the last frame in half.
        let full_len = std::fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(full_len - 5).unwrap();
        drop(file);

        let records = read_and_repair(&path).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].seq, 1);

        // The file was repaired: appending after replay yields a clean log.
        let mut wal = Wal::open(&path).unwrap();
        wal.append(&record(3), true).unwrap();
        let records = read_and_repair(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].seq, 3);
    }

    #[test]
    fn test_corrupt_crc_ends_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wal.log");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&record(1), true).unwrap();
            wal.append(&record(2), true).unwrap();
        }
        // Flip a payload byte in the second frame.
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let records = read_and_repair(&path).unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn test_reset_empties_log() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wal.log");
        let mut wal = Wal::open(&path).unwrap();
        wal.append(&record(1), false).unwrap();
        assert!(!wal.is_empty());
        wal.reset().unwrap();
        assert!(wal.is_empty());
        assert!(read_and_repair(&path).unwrap().is_empty());
    }

    #[test]
    fn test_sequence_regression_is_storage_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wal.log");
        let mut wal = Wal::open(&path).unwrap();
        wal.append(&record(5), false).unwrap();
        wal.append(&record(3), false).unwrap();
        drop(wal);
        assert!(matches!(
            read_and_repair(&path),
            Err(ThemisError::StorageUnavailable { .. })
        ));
    }
}
