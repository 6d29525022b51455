use std::{path::PathBuf, str::FromStr, time::Duration};

const DEFAULT_BIND: &str = "127.0.0.1:8080";
const DEFAULT_HTTP_WORKERS: usize = 4;
const DEFAULT_LEASE_DURATION_MS: u64 = 60_000;
const DEFAULT_LEASE_WAIT_MS: u64 = 10_000;
const DEFAULT_CACHE_TTL_SECS: u64 = 300;

/// Process settings, resolved once at startup from `CENSUS_*` variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CensusConfig {
    pub bind_addr: String,
    pub http_workers: usize,
    /// Unset keeps every batch in memory only.
    pub wal_path: Option<PathBuf>,
    /// Compact the WAL into a snapshot once it holds this many records.
    pub wal_checkpoint_records: Option<usize>,
    /// Unset confines leases to this process.
    pub lease_dir: Option<PathBuf>,
    pub lease_duration: Duration,
    pub lease_wait: Duration,
    pub cache_ttl: Duration,
}

impl Default for CensusConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND.to_string(),
            http_workers: DEFAULT_HTTP_WORKERS,
            wal_path: None,
            wal_checkpoint_records: None,
            lease_dir: None,
            lease_duration: Duration::from_millis(DEFAULT_LEASE_DURATION_MS),
            lease_wait: Duration::from_millis(DEFAULT_LEASE_WAIT_MS),
            cache_ttl: Duration::from_secs(DEFAULT_CACHE_TTL_SECS),
        }
    }
}

impl CensusConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            bind_addr: non_empty(&lookup, "CENSUS_BIND").unwrap_or(defaults.bind_addr),
            http_workers: parse_positive(&lookup, "CENSUS_HTTP_WORKERS")
                .unwrap_or(defaults.http_workers),
            wal_path: non_empty(&lookup, "CENSUS_WAL_PATH").map(PathBuf::from),
            wal_checkpoint_records: parse_positive(&lookup, "CENSUS_WAL_CHECKPOINT_RECORDS"),
            lease_dir: non_empty(&lookup, "CENSUS_LEASE_DIR").map(PathBuf::from),
            lease_duration: parse_positive(&lookup, "CENSUS_LEASE_DURATION_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.lease_duration),
            lease_wait: parse_positive(&lookup, "CENSUS_LEASE_WAIT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.lease_wait),
            cache_ttl: parse_positive(&lookup, "CENSUS_CACHE_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.cache_ttl),
        }
    }
}

fn non_empty(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(key)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Parses a strictly positive number. Anything else is logged and ignored so
/// the caller falls back to its default.
fn parse_positive<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T>
where
    T: FromStr + PartialOrd + Default,
{
    let raw = non_empty(lookup, key)?;
    match raw.parse::<T>() {
        Ok(value) if value > T::default() => Some(value),
        _ => {
            tracing::warn!(key, value = %raw, "ignoring invalid setting (expected positive integer)");
            None
        }
    }
}
