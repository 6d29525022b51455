use std::{
    fs::{self, File, OpenOptions, create_dir_all},
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::{LeaseBackend, LeaseError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct LeaseRecord {
    holder: String,
    expires_at_ms: u64,
}

/// Leases stored as files in a directory shared by every process that must
/// exclude each other. Each key has a `<key>.lease` record and a `<key>.guard`
/// file; the record is only read or written while holding an exclusive
/// advisory lock on the guard, so an expired record is replaced by exactly
/// one claimant. Expiry is wall-clock based, so the sharing hosts need
/// roughly synchronized clocks.
#[derive(Debug, Clone)]
pub struct FileLeaseBackend {
    dir: PathBuf,
}

impl FileLeaseBackend {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, LeaseError> {
        let dir = dir.as_ref().to_path_buf();
        create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, key: &str) -> PathBuf {
        self.dir
            .join(format!("{}.lease", sanitize_path_component(key)))
    }

    fn guard_path(&self, key: &str) -> PathBuf {
        self.dir
            .join(format!("{}.guard", sanitize_path_component(key)))
    }

    fn with_guard<T>(
        &self,
        key: &str,
        f: impl FnOnce(&Path) -> Result<T, LeaseError>,
    ) -> Result<T, LeaseError> {
        let guard = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(self.guard_path(key))?;
        guard.lock_exclusive()?;
        let out = f(&self.record_path(key));
        if let Err(err) = FileExt::unlock(&guard) {
            tracing::warn!(key, error = %err, "failed to unlock lease guard file");
        }
        out
    }
}

impl LeaseBackend for FileLeaseBackend {
    fn try_claim(
        &self,
        key: &str,
        holder: &str,
        lease_duration: Duration,
    ) -> Result<bool, LeaseError> {
        self.with_guard(key, |record_path| {
            let now = unix_timestamp_millis();
            if let Some(current) = read_record(key, record_path)? {
                if current.expires_at_ms > now {
                    return Ok(false);
                }
                tracing::info!(
                    key,
                    previous_holder = %current.holder,
                    "taking over expired lease"
                );
            }
            let record = LeaseRecord {
                holder: holder.to_string(),
                expires_at_ms: now.saturating_add(lease_duration.as_millis() as u64),
            };
            write_record(record_path, &record)?;
            Ok(true)
        })
    }

    fn release(&self, key: &str, holder: &str) -> Result<bool, LeaseError> {
        self.with_guard(key, |record_path| match read_record(key, record_path)? {
            Some(current) if current.holder == holder => {
                fs::remove_file(record_path)?;
                Ok(true)
            }
            _ => Ok(false),
        })
    }
}

fn read_record(key: &str, path: &Path) -> Result<Option<LeaseRecord>, LeaseError> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    serde_json::from_str(&raw)
        .map(Some)
        .map_err(|err| LeaseError::Corrupt {
            key: key.to_string(),
            reason: err.to_string(),
        })
}

fn write_record(path: &Path, record: &LeaseRecord) -> Result<(), LeaseError> {
    let body = serde_json::to_string(record).map_err(|err| LeaseError::Io(err.to_string()))?;
    let mut tmp_path = path.to_path_buf().into_os_string();
    tmp_path.push(".tmp");
    let tmp_path = PathBuf::from(tmp_path);
    let mut file = File::create(&tmp_path)?;
    file.write_all(body.as_bytes())?;
    file.sync_data()?;
    fs::rename(tmp_path, path)?;
    Ok(())
}

fn sanitize_path_component(raw: &str) -> String {
    let mut out: String = raw
        .chars()
        .map(|ch| match ch {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => ch,
            _ => '_',
        })
        .collect();
    if out.is_empty() {
        out.push('_');
    }
    out
}

fn unix_timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|value| value.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const LONG: Duration = Duration::from_secs(30);

    #[test]
    fn claim_writes_record_and_release_removes_it() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileLeaseBackend::open(dir.path()).unwrap();

        assert!(backend.try_claim("import-7", "a", LONG).unwrap());
        let record_path = backend.record_path("import-7");
        let record = read_record("import-7", &record_path).unwrap().unwrap();
        assert_eq!(record.holder, "a");

        assert!(!backend.try_claim("import-7", "b", LONG).unwrap());
        assert!(!backend.release("import-7", "b").unwrap());
        assert!(backend.release("import-7", "a").unwrap());
        assert!(!record_path.exists());
    }

    #[test]
    fn expired_record_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileLeaseBackend::open(dir.path()).unwrap();
        assert!(backend.try_claim("k", "crashed", Duration::ZERO).unwrap());
        std::thread::sleep(Duration::from_millis(5));
        assert!(backend.try_claim("k", "b", LONG).unwrap());
        assert!(!backend.release("k", "crashed").unwrap());
    }

    #[test]
    fn corrupt_record_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileLeaseBackend::open(dir.path()).unwrap();
        fs::write(backend.record_path("k"), "not json").unwrap();
        let err = backend.try_claim("k", "a", LONG).unwrap_err();
        assert!(matches!(err, LeaseError::Corrupt { .. }));
    }

    #[test]
    fn keys_are_sanitized_into_file_names() {
        assert_eq!(sanitize_path_component("../batch 1"), "___batch_1");
        assert_eq!(sanitize_path_component(""), "_");
    }
}
