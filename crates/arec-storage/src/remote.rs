use std::collections::{BTreeMap, HashMap, HashSet};

use arec_catalog::PartitionId;
use arec_core::{CanonicalProgram, CohortKey, NaturalKey, Record, RecordKind};
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("remote partition {partition} unavailable: {reason}")]
    Unavailable { partition: String, reason: String },
    #[error("remote partition {partition} returned an undecodable response: {reason}")]
    Decode { partition: String, reason: String },
}

impl RemoteError {
    pub fn unavailable(partition: &PartitionId, reason: impl Into<String>) -> Self {
        RemoteError::Unavailable {
            partition: partition.to_string(),
            reason: reason.into(),
        }
    }
}

/// Field filter applied to partition queries. Unset parts match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordFilter {
    pub kind: Option<RecordKind>,
    pub program: Option<CanonicalProgram>,
    pub year: Option<u8>,
    pub field: Option<(String, JsonValue)>,
}

impl RecordFilter {
    pub fn cohort(cohort: &CohortKey) -> Self {
        Self {
            program: Some(cohort.program),
            year: Some(cohort.year),
            ..Self::default()
        }
    }

    pub fn with_kind(mut self, kind: RecordKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn field_equals(name: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        Self {
            field: Some((name.into(), value.into())),
            ..Self::default()
        }
    }

    pub fn matches(&self, record: &Record) -> bool {
        if self.kind.is_some_and(|kind| kind != record.kind) {
            return false;
        }
        if let Some(program) = self.program {
            if record.cohort.map(|c| c.program) != Some(program) {
                return false;
            }
        }
        if let Some(year) = self.year {
            if record.cohort.map(|c| c.year) != Some(year) {
                return false;
            }
        }
        match &self.field {
            Some((name, value)) => record.fields.get(name) == Some(value),
            None => true,
        }
    }
}

/// Pull-based document store. Failures reject with [`RemoteError`]; "not found" is
/// `Ok(None)` or an empty result, never an error.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn get(&self, partition: &PartitionId, key: &NaturalKey)
        -> Result<Option<Record>, RemoteError>;

    async fn query(
        &self,
        partition: &PartitionId,
        filter: Option<&RecordFilter>,
    ) -> Result<Vec<Record>, RemoteError>;

    async fn exists(&self, partition: &PartitionId, filter: &RecordFilter)
        -> Result<bool, RemoteError>;

    async fn bulk_upsert(&self, partition: &PartitionId, records: &[Record])
        -> Result<usize, RemoteError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoteCallCounts {
    pub get: usize,
    pub query: usize,
    pub exists: usize,
    pub bulk_upsert: usize,
}

#[derive(Debug, Default)]
struct MemoryState {
    partitions: HashMap<PartitionId, BTreeMap<NaturalKey, Record>>,
    failing: HashSet<PartitionId>,
    unavailable: bool,
    calls: RemoteCallCounts,
}

impl MemoryState {
    fn check(&self, partition: &PartitionId) -> Result<(), RemoteError> {
        if self.unavailable || self.failing.contains(partition) {
            return Err(RemoteError::unavailable(partition, "injected failure"));
        }
        Ok(())
    }
}

/// In-process store with failure injection, used by tests and offline tooling.
#[derive(Debug, Default)]
pub struct MemoryRemoteStore {
    state: Mutex<MemoryState>,
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed(&self, partition: &PartitionId, records: impl IntoIterator<Item = Record>) {
        let mut state = self.state.lock().await;
        let docs = state.partitions.entry(partition.clone()).or_default();
        for record in records {
            docs.insert(record.natural_key.clone(), record);
        }
    }

    /// Drops everything held for `partition` before seeding it with `records`.
    pub async fn replace(&self, partition: &PartitionId, records: impl IntoIterator<Item = Record>) {
        let mut state = self.state.lock().await;
        state.partitions.insert(
            partition.clone(),
            records
                .into_iter()
                .map(|r| (r.natural_key.clone(), r))
                .collect(),
        );
    }

    pub async fn fail_partition(&self, partition: &PartitionId) {
        self.state.lock().await.failing.insert(partition.clone());
    }

    pub async fn heal_partition(&self, partition: &PartitionId) {
        self.state.lock().await.failing.remove(partition);
    }

    pub async fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().await.unavailable = unavailable;
    }

    pub async fn records(&self, partition: &PartitionId) -> Vec<Record> {
        self.state
            .lock()
            .await
            .partitions
            .get(partition)
            .map(|docs| docs.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn calls(&self) -> RemoteCallCounts {
        self.state.lock().await.calls
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn get(
        &self,
        partition: &PartitionId,
        key: &NaturalKey,
    ) -> Result<Option<Record>, RemoteError> {
        let mut state = self.state.lock().await;
        state.calls.get += 1;
        state.check(partition)?;
        Ok(state
            .partitions
            .get(partition)
            .and_then(|docs| docs.get(key))
            .cloned())
    }

    async fn query(
        &self,
        partition: &PartitionId,
        filter: Option<&RecordFilter>,
    ) -> Result<Vec<Record>, RemoteError> {
        let mut state = self.state.lock().await;
        state.calls.query += 1;
        state.check(partition)?;
        Ok(state
            .partitions
            .get(partition)
            .map(|docs| {
                docs.values()
                    .filter(|r| filter.map_or(true, |f| f.matches(r)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn exists(
        &self,
        partition: &PartitionId,
        filter: &RecordFilter,
    ) -> Result<bool, RemoteError> {
        let mut state = self.state.lock().await;
        state.calls.exists += 1;
        state.check(partition)?;
        Ok(state
            .partitions
            .get(partition)
            .is_some_and(|docs| docs.values().any(|r| filter.matches(r))))
    }

    async fn bulk_upsert(
        &self,
        partition: &PartitionId,
        records: &[Record],
    ) -> Result<usize, RemoteError> {
        let mut state = self.state.lock().await;
        state.calls.bulk_upsert += 1;
        state.check(partition)?;
        let docs = state.partitions.entry(partition.clone()).or_default();
        for record in records {
            docs.insert(record.natural_key.clone(), record.clone());
        }
        Ok(records.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arec_catalog::Catalog;

    fn cohort() -> CohortKey {
        CohortKey::new(CanonicalProgram::MtechDs, 1)
    }

    #[test]
    fn filters_match_on_cohort_kind_and_field() {
        let record = Record::student(NaturalKey::registration("R1"), cohort()).with_field("uid", "dev-1");
        assert!(RecordFilter::cohort(&cohort()).matches(&record));
        assert!(RecordFilter::cohort(&cohort())
            .with_kind(RecordKind::Student)
            .matches(&record));
        assert!(!RecordFilter::default()
            .with_kind(RecordKind::Timetable)
            .matches(&record));
        assert!(!RecordFilter::cohort(&CohortKey::new(CanonicalProgram::MtechDs, 2)).matches(&record));
        assert!(RecordFilter::field_equals("uid", "dev-1").matches(&record));
        assert!(!RecordFilter::field_equals("uid", "dev-2").matches(&record));
    }

    #[tokio::test]
    async fn injected_failures_are_errors_not_empty_results() {
        let catalog = Catalog::builtin().unwrap();
        let partition = catalog.resolver.resolve(&cohort()).unwrap().current;
        let store = MemoryRemoteStore::new();
        store
            .seed(&partition, [Record::student(NaturalKey::registration("R1"), cohort())])
            .await;

        assert_eq!(store.query(&partition, None).await.unwrap().len(), 1);
        store.fail_partition(&partition).await;
        assert!(matches!(
            store.query(&partition, None).await,
            Err(RemoteError::Unavailable { .. })
        ));
        store.heal_partition(&partition).await;
        assert!(store
            .get(&partition, &NaturalKey::registration("r1"))
            .await
            .unwrap()
            .is_some());

        let calls = store.calls().await;
        assert_eq!((calls.query, calls.get), (2, 1));
    }
}
