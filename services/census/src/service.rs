use std::{collections::BTreeMap, sync::Arc, time::Duration};

use cache::ResultCache;
use chrono::{NaiveDate, Utc};
use graph::{RelativeGraph, apply_relatives_change, validate_symmetric};
use lease::{FileLeaseBackend, LeaseLock};
use schema::{
    BatchId, Citizen, CitizenId, CitizenPatch, CitizenPatchPayload, CitizenPayload,
    ValidationError, validate_import, validate_patch,
};
use serde::Serialize;
use stats::{AggregateKind, GiftMonths, TownAgePercentiles, age_percentiles, gift_months};
use store::{BatchStore, CheckpointPolicy, FileWal, InMemoryBatchStore, StoreError};

use crate::{CensusConfig, CensusError};

/// Source of "today" for birth-date validation and age computation.
pub trait Clock: Send + Sync {
    fn today(&self) -> NaiveDate;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn today(&self) -> NaiveDate {
        Utc::now().date_naive()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub NaiveDate);

impl Clock for FixedClock {
    fn today(&self) -> NaiveDate {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceSettings {
    pub lease_duration: Duration,
    pub lease_wait: Duration,
    pub cache_ttl: Duration,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        let config = CensusConfig::default();
        Self::from(&config)
    }
}

impl From<&CensusConfig> for ServiceSettings {
    fn from(config: &CensusConfig) -> Self {
        Self {
            lease_duration: config.lease_duration,
            lease_wait: config.lease_wait,
            cache_ttl: config.cache_ttl,
        }
    }
}

/// A computed aggregate as held in the result cache.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Aggregate {
    GiftMonths(Arc<GiftMonths>),
    AgePercentiles(Arc<Vec<TownAgePercentiles>>),
}

impl Aggregate {
    pub fn kind(&self) -> AggregateKind {
        match self {
            Self::GiftMonths(_) => AggregateKind::GiftMonths,
            Self::AgePercentiles(_) => AggregateKind::AgePercentiles,
        }
    }
}

/// The mutation-and-aggregation core. Shared by every request handler of a
/// process; all methods take `&self`.
pub struct CensusService {
    store: Arc<dyn BatchStore>,
    leases: LeaseLock,
    cache: ResultCache<AggregateKind, Aggregate>,
    clock: Arc<dyn Clock>,
    settings: ServiceSettings,
}

impl CensusService {
    pub fn new(
        store: Arc<dyn BatchStore>,
        leases: LeaseLock,
        clock: Arc<dyn Clock>,
        settings: ServiceSettings,
    ) -> Self {
        Self {
            store,
            leases,
            cache: ResultCache::new(settings.cache_ttl),
            clock,
            settings,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(InMemoryBatchStore::new()),
            LeaseLock::in_memory(),
            Arc::new(SystemClock),
            ServiceSettings::default(),
        )
    }

    /// Wires the store and lease backends named by `config`.
    pub fn from_config(config: &CensusConfig) -> Result<Self, CensusError> {
        let store: Arc<dyn BatchStore> = match &config.wal_path {
            Some(wal_path) => {
                let wal = FileWal::open(wal_path).map_err(CensusError::Persistence)?;
                let policy = CheckpointPolicy {
                    max_wal_records: config.wal_checkpoint_records,
                    max_wal_bytes: None,
                };
                let (store, stats) = InMemoryBatchStore::open_persistent(wal, policy)
                    .map_err(CensusError::Persistence)?;
                tracing::info!(
                    path = %wal_path.display(),
                    batches = stats.batches_loaded,
                    citizen_updates = stats.citizen_updates_loaded,
                    skipped_torn_records = stats.replay.skipped_torn_records,
                    "batch store replayed"
                );
                Arc::new(store)
            }
            None => Arc::new(InMemoryBatchStore::new()),
        };
        let leases = match &config.lease_dir {
            Some(dir) => {
                let backend = FileLeaseBackend::open(dir).map_err(CensusError::Lease)?;
                LeaseLock::new(Arc::new(backend))
            }
            None => LeaseLock::in_memory(),
        };
        Ok(Self::new(
            store,
            leases,
            Arc::new(SystemClock),
            ServiceSettings::from(config),
        ))
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn settings(&self) -> ServiceSettings {
        self.settings
    }

    pub fn today(&self) -> NaiveDate {
        self.clock.today()
    }

    // -----------------------------------------------------------------------
    // Mutations
    // -----------------------------------------------------------------------

    pub fn ingest_payload(&self, payload: Vec<CitizenPayload>) -> Result<BatchId, CensusError> {
        let citizens = validate_import(payload, self.today())?;
        self.ingest(citizens)
    }

    /// Stores `citizens` as a new batch and returns its id. The relative
    /// graph must already be symmetric; it is never repaired here.
    pub fn ingest(&self, citizens: Vec<Citizen>) -> Result<BatchId, CensusError> {
        if citizens.is_empty() {
            return Err(ValidationError::EmptyImport.into());
        }
        validate_symmetric(&citizens)?;

        let batch_id = self.store.next_batch_id()?;
        let citizen_count = citizens.len();
        self.store.create_batch(batch_id, citizens)?;
        self.cache.invalidate(batch_id);
        tracing::info!(batch_id, citizens = citizen_count, "batch imported");
        Ok(batch_id)
    }

    pub fn patch_payload(
        &self,
        batch_id: BatchId,
        citizen_id: CitizenId,
        payload: CitizenPatchPayload,
    ) -> Result<Citizen, CensusError> {
        let patch = validate_patch(citizen_id, payload, self.today())?;
        self.patch(batch_id, citizen_id, patch)
    }

    /// Applies `patch` to one citizen while holding the batch lease. When the
    /// relative set changes, every gained or lost relative is rewritten in
    /// the same store call, so the graph is never observed half-updated.
    pub fn patch(
        &self,
        batch_id: BatchId,
        citizen_id: CitizenId,
        patch: CitizenPatch,
    ) -> Result<Citizen, CensusError> {
        if patch.is_empty() {
            return Err(ValidationError::EmptyPatch.into());
        }

        let holder = uuid::Uuid::new_v4().to_string();
        let guard = self
            .leases
            .acquire(
                &lease_key(batch_id),
                &holder,
                self.settings.lease_duration,
                self.settings.lease_wait,
            )
            .map_err(|err| {
                tracing::warn!(batch_id, citizen_id, error = %err, "patch could not take batch lease");
                CensusError::from_lease(batch_id, err)
            })?;

        let batch = self.store.get_batch(batch_id)?;
        let mut patched = batch
            .citizen(citizen_id)
            .cloned()
            .ok_or(StoreError::CitizenNotFound {
                batch_id,
                citizen_id,
            })?;
        patch.apply_scalar_fields(&mut patched);

        let mut records = BTreeMap::from([(citizen_id, patched)]);
        let mut touched = 1;
        if let Some(next_relatives) = &patch.relatives {
            let delta = RelativeGraph::from_citizens(batch.citizens())
                .plan_relatives_change(citizen_id, next_relatives)?;
            for relative_id in delta.counterparts() {
                if let Some(relative) = batch.citizen(relative_id) {
                    records.insert(relative_id, relative.clone());
                }
            }
            touched = apply_relatives_change(&mut records, &delta)?.len();
        }
        let patched = records
            .get(&citizen_id)
            .cloned()
            .ok_or_else(|| CensusError::Internal(format!("patched citizen {citizen_id} lost")))?;

        if guard.is_expired() {
            tracing::warn!(batch_id, citizen_id, "batch lease expired mid-patch; aborting");
            return Err(CensusError::LeaseExpired { batch_id });
        }
        self.store
            .update_citizens(batch_id, records.into_values().collect())
            .inspect_err(|err| {
                tracing::error!(batch_id, citizen_id, error = %err, "patch write failed");
            })?;
        self.cache.invalidate(batch_id);
        tracing::info!(batch_id, citizen_id, touched, "citizen patched");

        if let Err(err) = guard.release() {
            tracing::warn!(batch_id, error = %err, "batch lease release failed; it will expire");
        }
        Ok(patched)
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub fn list_citizens(&self, batch_id: BatchId) -> Result<Vec<Citizen>, CensusError> {
        Ok(self.store.get_batch(batch_id)?.to_citizens())
    }

    pub fn gift_months(&self, batch_id: BatchId) -> Result<Arc<GiftMonths>, CensusError> {
        match self.aggregate(batch_id, AggregateKind::GiftMonths)? {
            Aggregate::GiftMonths(months) => Ok(months),
            other => Err(kind_mismatch(AggregateKind::GiftMonths, &other)),
        }
    }

    pub fn age_percentiles(
        &self,
        batch_id: BatchId,
    ) -> Result<Arc<Vec<TownAgePercentiles>>, CensusError> {
        match self.aggregate(batch_id, AggregateKind::AgePercentiles)? {
            Aggregate::AgePercentiles(towns) => Ok(towns),
            other => Err(kind_mismatch(AggregateKind::AgePercentiles, &other)),
        }
    }

    /// Cached aggregate for a batch. A miss reads the current snapshot
    /// without the lease; a concurrent patch is seen entirely or not at all.
    pub fn aggregate(
        &self,
        batch_id: BatchId,
        kind: AggregateKind,
    ) -> Result<Aggregate, CensusError> {
        self.cache.get_or_compute(batch_id, kind, || -> Result<Aggregate, CensusError> {
            let batch = self.store.get_batch(batch_id)?;
            let citizens = batch.to_citizens();
            let aggregate = match kind {
                AggregateKind::GiftMonths => {
                    Aggregate::GiftMonths(Arc::new(gift_months(&citizens)?))
                }
                AggregateKind::AgePercentiles => Aggregate::AgePercentiles(Arc::new(
                    age_percentiles(&citizens, self.today()),
                )),
            };
            tracing::debug!(batch_id, kind = kind.as_str(), "aggregate computed");
            Ok(aggregate)
        })
    }
}

/// Lease key guarding mutations of one batch.
pub fn lease_key(batch_id: BatchId) -> String {
    format!("batch-{batch_id}")
}

fn kind_mismatch(expected: AggregateKind, found: &Aggregate) -> CensusError {
    CensusError::Internal(format!(
        "cache returned {} for a {} lookup",
        found.kind().as_str(),
        expected.as_str()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn date(day: u32, month: u32, year: i32) -> NaiveDate {
        NaiveDate::from_ymd_opt(year, month, day).unwrap()
    }

    fn service() -> CensusService {
        CensusService::in_memory().with_clock(Arc::new(FixedClock(date(1, 6, 2024))))
    }

    fn citizen(id: CitizenId, birth: NaiveDate, town: &str, relatives: &[CitizenId]) -> Citizen {
        Citizen::new(id, "Citizen", birth, town, relatives.iter().copied())
    }

    fn relatives(ids: &[CitizenId]) -> BTreeSet<CitizenId> {
        ids.iter().copied().collect()
    }

    fn assert_symmetric(citizens: &[Citizen]) {
        assert_eq!(validate_symmetric(citizens), Ok(()));
    }

    #[test]
    fn ingest_rejects_asymmetric_graph_without_creating_a_batch() {
        let service = service();
        let err = service
            .ingest(vec![
                citizen(1, date(1, 1, 1990), "A", &[2]),
                citizen(2, date(1, 2, 1990), "A", &[]),
            ])
            .unwrap_err();
        assert!(matches!(err, CensusError::GraphInconsistency(_)));

        let batch_id = service
            .ingest(vec![citizen(1, date(1, 1, 1990), "A", &[])])
            .unwrap();
        assert_eq!(service.list_citizens(batch_id).unwrap().len(), 1);
    }

    #[test]
    fn ingest_assigns_distinct_ids() {
        let service = service();
        let first = service.ingest(vec![citizen(1, date(1, 1, 1990), "A", &[])]).unwrap();
        let second = service.ingest(vec![citizen(1, date(1, 1, 1990), "A", &[])]).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn patch_scalar_fields_leaves_relatives_alone() {
        let service = service();
        let batch_id = service
            .ingest(vec![
                citizen(1, date(1, 1, 1990), "A", &[2]),
                citizen(2, date(1, 2, 1990), "A", &[1]),
            ])
            .unwrap();
        let patched = service
            .patch(
                batch_id,
                1,
                CitizenPatch {
                    town: Some("B".into()),
                    ..CitizenPatch::default()
                },
            )
            .unwrap();
        assert_eq!(patched.town, "B");
        assert_eq!(patched.relatives, relatives(&[2]));
        assert_symmetric(&service.list_citizens(batch_id).unwrap());
    }

    #[test]
    fn patch_repairs_both_sides_of_added_and_removed_edges() {
        let service = service();
        let batch_id = service
            .ingest(vec![
                citizen(1, date(1, 1, 1990), "A", &[2]),
                citizen(2, date(1, 2, 1990), "A", &[1]),
                citizen(3, date(1, 3, 1990), "A", &[]),
            ])
            .unwrap();

        let patched = service
            .patch(
                batch_id,
                1,
                CitizenPatch {
                    relatives: Some(relatives(&[3])),
                    ..CitizenPatch::default()
                },
            )
            .unwrap();
        assert_eq!(patched.relatives, relatives(&[3]));

        let citizens = service.list_citizens(batch_id).unwrap();
        assert_symmetric(&citizens);
        assert!(citizens[1].relatives.is_empty());
        assert_eq!(citizens[2].relatives, relatives(&[1]));
    }

    #[test]
    fn patch_to_unknown_relative_or_self_changes_nothing() {
        let service = service();
        let batch_id = service
            .ingest(vec![
                citizen(1, date(1, 1, 1990), "A", &[]),
                citizen(2, date(1, 2, 1990), "A", &[]),
            ])
            .unwrap();
        let before = service.list_citizens(batch_id).unwrap();

        for next in [relatives(&[2, 9]), relatives(&[1])] {
            let err = service
                .patch(
                    batch_id,
                    1,
                    CitizenPatch {
                        name: Some("Changed".into()),
                        relatives: Some(next),
                        ..CitizenPatch::default()
                    },
                )
                .unwrap_err();
            assert_eq!(err.status_code(), 400);
        }
        assert_eq!(service.list_citizens(batch_id).unwrap(), before);
    }

    #[test]
    fn patch_unknown_batch_or_citizen_is_not_found() {
        let service = service();
        let batch_id = service
            .ingest(vec![citizen(1, date(1, 1, 1990), "A", &[])])
            .unwrap();
        let patch = CitizenPatch {
            name: Some("X".into()),
            ..CitizenPatch::default()
        };
        let missing_batch = service.patch(batch_id + 10, 1, patch.clone()).unwrap_err();
        assert_eq!(missing_batch.status_code(), 404);
        let missing_citizen = service.patch(batch_id, 42, patch).unwrap_err();
        assert_eq!(missing_citizen.status_code(), 404);
    }

    #[test]
    fn empty_patch_is_rejected() {
        let service = service();
        let err = service.patch(1, 1, CitizenPatch::default()).unwrap_err();
        assert_eq!(err, CensusError::Validation(ValidationError::EmptyPatch));
    }

    #[test]
    fn patch_fails_when_lease_expires_before_commit() {
        let service = CensusService::new(
            Arc::new(InMemoryBatchStore::new()),
            LeaseLock::in_memory(),
            Arc::new(FixedClock(date(1, 6, 2024))),
            ServiceSettings {
                lease_duration: Duration::ZERO,
                ..ServiceSettings::default()
            },
        );
        let batch_id = service
            .ingest(vec![citizen(1, date(1, 1, 1990), "A", &[])])
            .unwrap();
        let err = service
            .patch(
                batch_id,
                1,
                CitizenPatch {
                    name: Some("Late".into()),
                    ..CitizenPatch::default()
                },
            )
            .unwrap_err();
        assert_eq!(err, CensusError::LeaseExpired { batch_id });
        assert_eq!(service.list_citizens(batch_id).unwrap()[0].name, "Citizen");
    }

    #[test]
    fn aggregates_are_cached_until_the_next_patch() {
        let service = service();
        let batch_id = service
            .ingest(vec![
                citizen(1, date(10, 4, 1990), "A", &[2]),
                citizen(2, date(10, 9, 1994), "A", &[1]),
            ])
            .unwrap();

        let first = service.gift_months(batch_id).unwrap();
        let second = service.gift_months(batch_id).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.total_gifts(), 2);

        service
            .patch(
                batch_id,
                1,
                CitizenPatch {
                    relatives: Some(BTreeSet::new()),
                    ..CitizenPatch::default()
                },
            )
            .unwrap();
        let after = service.gift_months(batch_id).unwrap();
        assert_eq!(after.total_gifts(), 0);
    }

    #[test]
    fn age_percentiles_use_clock_date() {
        let service = service();
        let batch_id = service
            .ingest(vec![
                citizen(1, date(2, 6, 2000), "A", &[]),
                citizen(2, date(1, 6, 2000), "A", &[]),
            ])
            .unwrap();
        let towns = service.age_percentiles(batch_id).unwrap();
        assert_eq!(towns.len(), 1);
        // 23 and 24 full years on 2024-06-01.
        assert_eq!(towns[0].p50, 23.5);
    }

    #[test]
    fn aggregates_of_unknown_batch_are_not_found() {
        let service = service();
        assert_eq!(service.gift_months(7).unwrap_err().status_code(), 404);
        assert_eq!(service.age_percentiles(7).unwrap_err().status_code(), 404);
    }

    #[test]
    fn payload_entry_points_validate_first() {
        let service = service();
        let err = service.ingest_payload(Vec::new()).unwrap_err();
        assert_eq!(err, CensusError::Validation(ValidationError::EmptyImport));

        let err = service
            .patch_payload(1, 1, CitizenPatchPayload::default())
            .unwrap_err();
        assert_eq!(err, CensusError::Validation(ValidationError::EmptyPatch));
    }
}
