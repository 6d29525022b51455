use std::{
    fs::{File, OpenOptions, create_dir_all, rename},
    io::{BufRead, BufReader, ErrorKind, Write},
    path::{Path, PathBuf},
};

use fs2::FileExt;
use schema::{BatchId, Citizen};
use serde::{Deserialize, Serialize};

use crate::StoreError;

const SNAPSHOT_HEADER: &str = "CENSUS-SNAP\t1";

/// One committed mutation. Each record is one JSON line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WalRecord {
    CreateBatch {
        batch_id: BatchId,
        citizens: Vec<Citizen>,
    },
    UpdateCitizens {
        batch_id: BatchId,
        citizens: Vec<Citizen>,
    },
}

impl WalRecord {
    pub fn batch_id(&self) -> BatchId {
        match self {
            Self::CreateBatch { batch_id, .. } | Self::UpdateCitizens { batch_id, .. } => *batch_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CheckpointPolicy {
    pub max_wal_records: Option<usize>,
    pub max_wal_bytes: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalCheckpointStats {
    pub snapshot_records: usize,
    pub truncated_wal_records: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WalReplayStats {
    pub snapshot_records: usize,
    pub wal_records: usize,
    pub skipped_torn_records: usize,
}

/// Append-only log of committed mutations plus an optional snapshot file
/// written at checkpoint time. Every append is synced before it returns.
///
/// The log belongs to one process at a time: `open` takes an exclusive
/// advisory lock on it that is held until the `FileWal` is dropped.
#[derive(Debug)]
pub struct FileWal {
    path: PathBuf,
    wal_records: usize,
    torn_records: usize,
    _owner: File,
}

impl FileWal {
    /// Opens the log, creating it if needed. A torn final record left by a
    /// crash mid-append is cut off here, so later appends start on a clean
    /// line. Fails with [`StoreError::WalLocked`] while another `FileWal`
    /// holds the same path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            create_dir_all(parent)?;
        }
        let owner = OpenOptions::new().create(true).append(true).open(&path)?;
        if let Err(err) = owner.try_lock_exclusive() {
            return Err(match err.kind() {
                ErrorKind::WouldBlock => StoreError::WalLocked(path.display().to_string()),
                _ => err.into(),
            });
        }
        let tail = scan_log(&path)?;
        let torn_records = match tail.torn_bytes {
            0 => 0,
            torn_bytes => {
                tracing::warn!(
                    path = %path.display(),
                    torn_bytes,
                    "truncating torn trailing wal record"
                );
                owner.set_len(tail.good_len)?;
                owner.sync_all()?;
                1
            }
        };
        Ok(Self {
            path,
            wal_records: tail.records,
            torn_records,
            _owner: owner,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot_path(&self) -> PathBuf {
        let mut path = self.path.clone().into_os_string();
        path.push(".snapshot");
        PathBuf::from(path)
    }

    pub fn wal_record_count(&self) -> usize {
        self.wal_records
    }

    pub fn wal_size_bytes(&self) -> Result<u64, StoreError> {
        Ok(std::fs::metadata(&self.path)?.len())
    }

    /// Appends and syncs one record. On failure the file is cut back to its
    /// previous length so a torn line never precedes later records.
    pub fn append(&mut self, record: &WalRecord) -> Result<(), StoreError> {
        let line = serde_json::to_string(record).map_err(|e| StoreError::Parse(e.to_string()))?;
        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        let previous_len = file.metadata()?.len();
        let written = writeln!(file, "{line}").and_then(|()| file.sync_data());
        if let Err(err) = written {
            if let Err(truncate_err) = file.set_len(previous_len) {
                tracing::error!(
                    path = %self.path.display(),
                    error = %truncate_err,
                    "failed to roll back partial wal append"
                );
            }
            return Err(err.into());
        }
        self.wal_records += 1;
        Ok(())
    }

    pub fn should_checkpoint(&self, policy: &CheckpointPolicy) -> Result<bool, StoreError> {
        if let Some(max_wal_records) = policy.max_wal_records
            && self.wal_records >= max_wal_records
        {
            return Ok(true);
        }
        if let Some(max_wal_bytes) = policy.max_wal_bytes
            && self.wal_size_bytes()? >= max_wal_bytes
        {
            return Ok(true);
        }
        Ok(false)
    }

    pub fn replay(&self) -> Result<(Vec<WalRecord>, WalReplayStats), StoreError> {
        let snapshot_records = self.replay_snapshot_records()?;
        let (wal_records, skipped_torn_records) = self.replay_wal_records()?;
        let stats = WalReplayStats {
            snapshot_records: snapshot_records.len(),
            wal_records: wal_records.len(),
            skipped_torn_records,
        };
        let mut out = snapshot_records;
        out.extend(wal_records);
        Ok((out, stats))
    }

    /// Replaces the snapshot with `snapshot_records` and truncates the log.
    /// A crash between the two steps leaves records in the log that the
    /// snapshot already covers; replay must treat them as idempotent.
    pub fn compact_with_snapshot(
        &mut self,
        snapshot_records: &[WalRecord],
    ) -> Result<WalCheckpointStats, StoreError> {
        let truncated_wal_records = self.wal_records;
        self.write_snapshot_records(snapshot_records)?;
        File::create(&self.path)?.sync_all()?;
        self.wal_records = 0;
        Ok(WalCheckpointStats {
            snapshot_records: snapshot_records.len(),
            truncated_wal_records,
        })
    }

    fn replay_snapshot_records(&self) -> Result<Vec<WalRecord>, StoreError> {
        let snapshot_path = self.snapshot_path();
        if !snapshot_path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(File::open(snapshot_path)?);
        let mut lines = reader.lines();
        let header = loop {
            match lines.next() {
                Some(line) => {
                    let line = line?;
                    if line.trim().is_empty() {
                        continue;
                    }
                    break line;
                }
                None => return Err(StoreError::Parse("snapshot file is empty".to_string())),
            }
        };
        if header != SNAPSHOT_HEADER {
            return Err(StoreError::Parse(
                "snapshot file has invalid header".to_string(),
            ));
        }

        let mut out = Vec::new();
        for line in lines {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            out.push(parse_record(&line)?);
        }
        Ok(out)
    }

    fn replay_wal_records(&self) -> Result<(Vec<WalRecord>, usize), StoreError> {
        let reader = BufReader::new(File::open(&self.path)?);
        let mut out = Vec::with_capacity(self.wal_records);
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            out.push(parse_record(&line)?);
        }
        Ok((out, self.torn_records))
    }

    fn write_snapshot_records(&self, records: &[WalRecord]) -> Result<(), StoreError> {
        let snapshot_path = self.snapshot_path();
        let mut tmp_path = snapshot_path.clone().into_os_string();
        tmp_path.push(".tmp");
        let tmp_path = PathBuf::from(tmp_path);

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        writeln!(file, "{SNAPSHOT_HEADER}")?;
        for record in records {
            let line =
                serde_json::to_string(record).map_err(|e| StoreError::Parse(e.to_string()))?;
            writeln!(file, "{line}")?;
        }
        file.sync_all()?;
        rename(tmp_path, snapshot_path)?;
        Ok(())
    }
}

fn parse_record(line: &str) -> Result<WalRecord, StoreError> {
    serde_json::from_str(line).map_err(|e| StoreError::Parse(format!("invalid wal record: {e}")))
}

struct LogTail {
    records: usize,
    good_len: u64,
    torn_bytes: u64,
}

/// Finds where the last complete, parseable record ends. Only the final
/// line may be torn; damage anywhere before it is an error.
fn scan_log(path: &Path) -> Result<LogTail, StoreError> {
    let bytes = std::fs::read(path)?;
    let mut records = 0;
    let mut good_len = 0;
    let mut start = 0;
    while start < bytes.len() {
        let (line, next, terminated) = match bytes[start..].iter().position(|b| *b == b'\n') {
            Some(offset) => (&bytes[start..start + offset], start + offset + 1, true),
            None => (&bytes[start..], bytes.len(), false),
        };
        let parsed = std::str::from_utf8(line)
            .map_err(|e| StoreError::Parse(format!("invalid wal record: {e}")))
            .and_then(|text| match text.trim() {
                "" => Ok(false),
                text => parse_record(text).map(|_| true),
            });
        match parsed {
            Ok(is_record) if terminated => {
                records += usize::from(is_record);
                good_len = next;
            }
            Ok(_) => break,
            Err(_) if next == bytes.len() => break,
            Err(err) => return Err(err),
        }
        start = next;
    }
    Ok(LogTail {
        records,
        good_len: good_len as u64,
        torn_bytes: (bytes.len() - good_len) as u64,
    })
}
