mod wal;

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, RwLock},
};

use schema::{BatchId, Citizen, CitizenId};

pub use wal::{CheckpointPolicy, FileWal, WalCheckpointStats, WalRecord, WalReplayStats};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("batch {0} not found")]
    BatchNotFound(BatchId),
    #[error("citizen {citizen_id} not found in batch {batch_id}")]
    CitizenNotFound {
        batch_id: BatchId,
        citizen_id: CitizenId,
    },
    #[error("batch {0} already exists")]
    BatchExists(BatchId),
    #[error("citizen {citizen_id} appears twice in write to batch {batch_id}")]
    DuplicateCitizen {
        batch_id: BatchId,
        citizen_id: CitizenId,
    },
    #[error("io error: {0}")]
    Io(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("wal {0} is already open in another store")]
    WalLocked(String),
    #[error("store state lock poisoned")]
    Poisoned,
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::BatchNotFound(_) | Self::CitizenNotFound { .. })
    }
}

impl From<std::io::Error> for StoreError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

/// Immutable view of one batch. Citizens are kept in an arena keyed by
/// citizen id, so the relative relation is plain id sets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    batch_id: BatchId,
    citizens: BTreeMap<CitizenId, Citizen>,
}

impl Batch {
    fn from_citizens(batch_id: BatchId, citizens: Vec<Citizen>) -> Result<Self, StoreError> {
        let mut arena = BTreeMap::new();
        for citizen in citizens {
            let citizen_id = citizen.citizen_id;
            if arena.insert(citizen_id, citizen).is_some() {
                return Err(StoreError::DuplicateCitizen {
                    batch_id,
                    citizen_id,
                });
            }
        }
        Ok(Self {
            batch_id,
            citizens: arena,
        })
    }

    pub fn batch_id(&self) -> BatchId {
        self.batch_id
    }

    pub fn len(&self) -> usize {
        self.citizens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.citizens.is_empty()
    }

    pub fn citizen(&self, citizen_id: CitizenId) -> Option<&Citizen> {
        self.citizens.get(&citizen_id)
    }

    pub fn citizens(&self) -> impl Iterator<Item = &Citizen> {
        self.citizens.values()
    }

    pub fn arena(&self) -> &BTreeMap<CitizenId, Citizen> {
        &self.citizens
    }

    pub fn to_citizens(&self) -> Vec<Citizen> {
        self.citizens.values().cloned().collect()
    }

    /// Copy of `self` with `updates` replacing existing members. Fails if an
    /// update names a citizen that is not in the batch.
    fn with_updates(&self, updates: &[Citizen]) -> Result<Self, StoreError> {
        let mut next = self.clone();
        for citizen in updates {
            let slot = next.citizens.get_mut(&citizen.citizen_id).ok_or(
                StoreError::CitizenNotFound {
                    batch_id: self.batch_id,
                    citizen_id: citizen.citizen_id,
                },
            )?;
            *slot = citizen.clone();
        }
        Ok(next)
    }
}

/// Keyed document store holding batches. Every call is atomic: readers see
/// a whole batch before or after a write, never part of one.
pub trait BatchStore: Send + Sync {
    /// Reserves a batch id never handed out before by this store.
    fn next_batch_id(&self) -> Result<BatchId, StoreError>;
    fn create_batch(&self, batch_id: BatchId, citizens: Vec<Citizen>) -> Result<(), StoreError>;
    fn get_batch(&self, batch_id: BatchId) -> Result<Arc<Batch>, StoreError>;
    fn get_citizen(&self, batch_id: BatchId, citizen_id: CitizenId)
    -> Result<Citizen, StoreError>;
    fn update_citizens(&self, batch_id: BatchId, citizens: Vec<Citizen>)
    -> Result<(), StoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StoreLoadStats {
    pub replay: WalReplayStats,
    pub batches_loaded: usize,
    pub citizen_updates_loaded: usize,
}

#[derive(Debug, Default)]
struct StoreState {
    batches: HashMap<BatchId, Arc<Batch>>,
    last_batch_id: BatchId,
}

struct Persistence {
    wal: FileWal,
    checkpoint_policy: CheckpointPolicy,
}

/// Copy-on-write batch map. Writes swap in a whole new `Arc<Batch>`, so a
/// snapshot handed to a reader never changes underneath it. With a WAL
/// attached, each write is logged and synced before it becomes visible.
#[derive(Default)]
pub struct InMemoryBatchStore {
    state: RwLock<StoreState>,
    persistence: Option<Mutex<Persistence>>,
}

impl InMemoryBatchStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open_persistent(
        wal: FileWal,
        checkpoint_policy: CheckpointPolicy,
    ) -> Result<(Self, StoreLoadStats), StoreError> {
        let (records, replay) = wal.replay()?;
        let mut state = StoreState::default();
        let mut stats = StoreLoadStats {
            replay,
            ..StoreLoadStats::default()
        };
        for record in records {
            match record {
                WalRecord::CreateBatch { .. } => stats.batches_loaded += 1,
                WalRecord::UpdateCitizens { .. } => stats.citizen_updates_loaded += 1,
            }
            let batch = state.prepare_replay(&record)?;
            state.install(batch);
        }
        Ok((
            Self {
                state: RwLock::new(state),
                persistence: Some(Mutex::new(Persistence {
                    wal,
                    checkpoint_policy,
                })),
            },
            stats,
        ))
    }

    pub fn batches_len(&self) -> usize {
        self.state.read().map(|state| state.batches.len()).unwrap_or(0)
    }

    /// Writes every batch into the snapshot file and truncates the log.
    /// Returns `None` for a store without a WAL.
    pub fn checkpoint_and_compact(&self) -> Result<Option<WalCheckpointStats>, StoreError> {
        let Some(persistence) = self.persistence.as_ref() else {
            return Ok(None);
        };
        let state = self.state.read().map_err(|_| StoreError::Poisoned)?;
        let mut persistence = persistence.lock().map_err(|_| StoreError::Poisoned)?;
        let records = state.snapshot_records();
        persistence.wal.compact_with_snapshot(&records).map(Some)
    }

    /// Validates `record` against the current state, logs it when
    /// persistent, then swaps in the new batch. Nothing is logged or changed
    /// when validation fails.
    fn commit(&self, record: WalRecord) -> Result<(), StoreError> {
        let mut state = self.state.write().map_err(|_| StoreError::Poisoned)?;
        let next = state.prepare(&record)?;
        let Some(persistence) = self.persistence.as_ref() else {
            state.install(next);
            return Ok(());
        };

        let mut persistence = persistence.lock().map_err(|_| StoreError::Poisoned)?;
        persistence.wal.append(&record)?;
        state.install(next);
        let checkpoint_due = persistence
            .wal
            .should_checkpoint(&persistence.checkpoint_policy);
        match checkpoint_due {
            Ok(false) => {}
            Ok(true) => {
                let records = state.snapshot_records();
                match persistence.wal.compact_with_snapshot(&records) {
                    Ok(stats) => tracing::info!(
                        snapshot_records = stats.snapshot_records,
                        truncated_wal_records = stats.truncated_wal_records,
                        "batch store checkpoint written"
                    ),
                    // The write is already durable in the log; compaction is
                    // retried on the next commit.
                    Err(err) => tracing::error!(error = %err, "batch store checkpoint failed"),
                }
            }
            Err(err) => tracing::warn!(error = %err, "batch store checkpoint check failed"),
        }
        Ok(())
    }
}

impl StoreState {
    fn prepare(&self, record: &WalRecord) -> Result<Batch, StoreError> {
        match record {
            WalRecord::CreateBatch { batch_id, citizens } => {
                if self.batches.contains_key(batch_id) {
                    return Err(StoreError::BatchExists(*batch_id));
                }
                Batch::from_citizens(*batch_id, citizens.clone())
            }
            WalRecord::UpdateCitizens { batch_id, citizens } => {
                check_unique(*batch_id, citizens)?;
                self.batches
                    .get(batch_id)
                    .ok_or(StoreError::BatchNotFound(*batch_id))?
                    .with_updates(citizens)
            }
        }
    }

    /// Like `prepare`, except a create for a batch that already exists
    /// replaces it. A crash between writing a snapshot and truncating the log
    /// replays records the snapshot already holds. Updates carry whole
    /// citizen records, so applying them again in order converges on the
    /// same state.
    fn prepare_replay(&self, record: &WalRecord) -> Result<Batch, StoreError> {
        match record {
            WalRecord::CreateBatch { batch_id, citizens } => {
                if self.batches.contains_key(batch_id) {
                    tracing::debug!(batch_id, "replacing batch already restored from snapshot");
                }
                Batch::from_citizens(*batch_id, citizens.clone())
            }
            WalRecord::UpdateCitizens { .. } => self.prepare(record),
        }
    }

    fn install(&mut self, batch: Batch) {
        self.last_batch_id = self.last_batch_id.max(batch.batch_id);
        self.batches.insert(batch.batch_id, Arc::new(batch));
    }

    fn snapshot_records(&self) -> Vec<WalRecord> {
        let mut batch_ids: Vec<BatchId> = self.batches.keys().copied().collect();
        batch_ids.sort_unstable();
        batch_ids
            .into_iter()
            .filter_map(|batch_id| self.batches.get(&batch_id))
            .map(|batch| WalRecord::CreateBatch {
                batch_id: batch.batch_id,
                citizens: batch.to_citizens(),
            })
            .collect()
    }
}

fn check_unique(batch_id: BatchId, citizens: &[Citizen]) -> Result<(), StoreError> {
    let mut seen = std::collections::HashSet::with_capacity(citizens.len());
    for citizen in citizens {
        if !seen.insert(citizen.citizen_id) {
            return Err(StoreError::DuplicateCitizen {
                batch_id,
                citizen_id: citizen.citizen_id,
            });
        }
    }
    Ok(())
}

impl BatchStore for InMemoryBatchStore {
    fn next_batch_id(&self) -> Result<BatchId, StoreError> {
        let mut state = self.state.write().map_err(|_| StoreError::Poisoned)?;
        state.last_batch_id += 1;
        Ok(state.last_batch_id)
    }

    fn create_batch(&self, batch_id: BatchId, citizens: Vec<Citizen>) -> Result<(), StoreError> {
        self.commit(WalRecord::CreateBatch { batch_id, citizens })
    }

    fn get_batch(&self, batch_id: BatchId) -> Result<Arc<Batch>, StoreError> {
        let state = self.state.read().map_err(|_| StoreError::Poisoned)?;
        state
            .batches
            .get(&batch_id)
            .cloned()
            .ok_or(StoreError::BatchNotFound(batch_id))
    }

    fn get_citizen(
        &self,
        batch_id: BatchId,
        citizen_id: CitizenId,
    ) -> Result<Citizen, StoreError> {
        self.get_batch(batch_id)?
            .citizen(citizen_id)
            .cloned()
            .ok_or(StoreError::CitizenNotFound {
                batch_id,
                citizen_id,
            })
    }

    fn update_citizens(
        &self,
        batch_id: BatchId,
        citizens: Vec<Citizen>,
    ) -> Result<(), StoreError> {
        self.commit(WalRecord::UpdateCitizens { batch_id, citizens })
    }
}
