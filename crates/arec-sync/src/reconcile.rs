use std::collections::HashSet;
use std::sync::Arc;

use arec_catalog::{CollectionResolver, PartitionId, ResolvedPartitions};
use arec_core::{CohortKey, NaturalKey, Record, RecordKind, RosterEntry};
use arec_storage::{LocalCache, RecordFilter, RemoteStore};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::SyncError;

/// Where the records handed back by a reconcile call came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordOrigin {
    Cache,
    Remote,
    LegacyFallback,
    /// Both the current and the flat legacy partition failed; records are empty.
    Unavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Refreshed { records: usize },
    Unchanged,
    RemoteEmpty,
    Failed,
}

#[derive(Debug)]
pub struct CohortSnapshot {
    pub cohort: CohortKey,
    pub records: Vec<Record>,
    pub origin: RecordOrigin,
    /// Set when cached records were served; the refresh runs detached from the caller.
    pub refresh: Option<JoinHandle<RefreshOutcome>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub imported: usize,
    pub skipped: usize,
}

/// Merges the local cache with the remote store for a cohort and runs idempotent roster
/// imports. The only writer of cache entries sourced from remote reads.
#[derive(Clone)]
pub struct SyncReconciler {
    cache: Arc<LocalCache>,
    remote: Arc<dyn RemoteStore>,
    resolver: Arc<CollectionResolver>,
}

/// Partition membership defines the cohort of a fetched record.
fn stamp_cohort(mut records: Vec<Record>, cohort: &CohortKey) -> Vec<Record> {
    for record in &mut records {
        record.cohort = Some(*cohort);
    }
    records
}

impl SyncReconciler {
    pub fn new(
        cache: Arc<LocalCache>,
        remote: Arc<dyn RemoteStore>,
        resolver: Arc<CollectionResolver>,
    ) -> Self {
        Self {
            cache,
            remote,
            resolver,
        }
    }

    pub async fn reconcile_cohort(&self, cohort: &CohortKey) -> Result<Vec<Record>, SyncError> {
        Ok(self.reconcile_cohort_detailed(cohort).await?.records)
    }

    pub async fn reconcile_cohort_detailed(
        &self,
        cohort: &CohortKey,
    ) -> Result<CohortSnapshot, SyncError> {
        let partitions = self.resolver.resolve(cohort)?;

        let local = match self.cache.list_by_cohort(cohort).await {
            Ok(local) => local,
            Err(err) => {
                warn!(%cohort, error = %err, "cache read failed; treating as empty");
                Vec::new()
            }
        };

        if !local.is_empty() {
            let refresh = tokio::spawn(
                self.clone()
                    .refresh_in_background(*cohort, partitions.current.clone(), local.len()),
            );
            return Ok(CohortSnapshot {
                cohort: *cohort,
                records: local,
                origin: RecordOrigin::Cache,
                refresh: Some(refresh),
            });
        }

        match self.remote.query(&partitions.current, None).await {
            Ok(remote) => {
                let remote = stamp_cohort(remote, cohort);
                if !remote.is_empty() {
                    if let Err(err) = self.cache.bulk_put(&remote).await {
                        warn!(%cohort, error = %err, "caching remote records failed");
                    }
                }
                debug!(%cohort, records = remote.len(), "served cohort from remote");
                Ok(CohortSnapshot {
                    cohort: *cohort,
                    records: remote,
                    origin: RecordOrigin::Remote,
                    refresh: None,
                })
            }
            Err(err) => {
                warn!(
                    %cohort,
                    partition = %partitions.current,
                    error = %err,
                    "current partition unavailable; scanning flat legacy partition"
                );
                let filter = RecordFilter::cohort(cohort);
                let (records, origin) = match self.remote.query(partitions.flat(), Some(&filter)).await {
                    Ok(found) => (found, RecordOrigin::LegacyFallback),
                    Err(err) => {
                        warn!(%cohort, error = %err, "legacy partition unavailable");
                        (Vec::new(), RecordOrigin::Unavailable)
                    }
                };
                Ok(CohortSnapshot {
                    cohort: *cohort,
                    records,
                    origin,
                    refresh: None,
                })
            }
        }
    }

    /// Record-count comparison is a cheap change heuristic, not an exact diff.
    async fn refresh_in_background(
        self,
        cohort: CohortKey,
        partition: PartitionId,
        local_len: usize,
    ) -> RefreshOutcome {
        let remote = match self.remote.query(&partition, None).await {
            Ok(remote) => remote,
            Err(err) => {
                warn!(%cohort, %partition, error = %err, "background refresh failed");
                return RefreshOutcome::Failed;
            }
        };
        if remote.is_empty() {
            return RefreshOutcome::RemoteEmpty;
        }
        if remote.len() == local_len {
            return RefreshOutcome::Unchanged;
        }
        let remote = stamp_cohort(remote, &cohort);
        match self.cache.bulk_put(&remote).await {
            Ok(()) => {
                info!(%cohort, local_len, remote_len = remote.len(), "cache refreshed from remote");
                RefreshOutcome::Refreshed {
                    records: remote.len(),
                }
            }
            Err(err) => {
                warn!(%cohort, error = %err, "writing refreshed records failed");
                RefreshOutcome::Failed
            }
        }
    }

    /// The current partition first, then every legacy generation. A failure anywhere
    /// aborts: absence cannot be proven.
    async fn exists_remotely(
        &self,
        partitions: &ResolvedPartitions,
        key: &NaturalKey,
    ) -> Result<bool, SyncError> {
        for partition in std::iter::once(&partitions.current).chain(&partitions.legacy) {
            if self.remote.get(partition, key).await?.is_some() {
                debug!(%key, %partition, "roster key already stored");
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub async fn import_roster(
        &self,
        entries: &[RosterEntry],
        cohort: &CohortKey,
    ) -> Result<ImportSummary, SyncError> {
        self.import_roster_as(entries, cohort, RecordKind::Student)
            .await
    }

    /// Creates records only for natural keys found neither locally nor remotely, so
    /// re-running with the same input never duplicates or overwrites anything.
    pub async fn import_roster_as(
        &self,
        entries: &[RosterEntry],
        cohort: &CohortKey,
        kind: RecordKind,
    ) -> Result<ImportSummary, SyncError> {
        let partitions = self.resolver.resolve(cohort)?;
        let run_id = Uuid::new_v4();
        let span = info_span!("import_roster", %run_id, %cohort, entries = entries.len());

        async move {
            let mut seen = HashSet::new();
            let mut fresh = Vec::new();
            let mut skipped = 0usize;

            for entry in entries {
                let key = entry.key();
                if key.is_empty() {
                    warn!(raw = %entry.natural_key, "skipping roster entry without a natural key");
                    skipped += 1;
                    continue;
                }
                if !seen.insert(key.clone()) {
                    skipped += 1;
                    continue;
                }
                let cached = match self.cache.get(&key).await {
                    Ok(found) => found.is_some(),
                    Err(err) => {
                        warn!(%key, error = %err, "cache lookup failed during import");
                        false
                    }
                };
                if cached || self.exists_remotely(&partitions, &key).await? {
                    skipped += 1;
                    continue;
                }
                fresh.push(entry.to_record(kind, *cohort));
            }

            if !fresh.is_empty() {
                self.remote.bulk_upsert(&partitions.current, &fresh).await?;
                if let Err(err) = self.cache.bulk_put(&fresh).await {
                    warn!(error = %err, "imported records were not cached");
                }
            }

            let summary = ImportSummary {
                imported: fresh.len(),
                skipped,
            };
            info!(imported = summary.imported, skipped = summary.skipped, "roster import finished");
            Ok(summary)
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::Harness;
    use arec_core::CanonicalProgram;

    fn btech2() -> CohortKey {
        CohortKey::new(CanonicalProgram::BtechCse, 2)
    }

    fn students(cohort: CohortKey, n: usize) -> Vec<Record> {
        (0..n)
            .map(|i| {
                Record::student(NaturalKey::registration(&format!("B22CS{i:03}")), cohort)
                    .with_field("name", format!("Student {i}"))
            })
            .collect()
    }

    fn roster(prefix: &str, n: usize) -> Vec<RosterEntry> {
        (0..n)
            .map(|i| RosterEntry::new(format!("{prefix}{i:03}")))
            .collect()
    }

    #[tokio::test]
    async fn empty_cache_fetches_remote_and_persists_it() {
        let h = Harness::new();
        let current = h.current(&btech2());
        h.remote.seed(&current, students(btech2(), 11)).await;

        let snapshot = h.reconciler.reconcile_cohort_detailed(&btech2()).await.unwrap();
        assert_eq!(snapshot.origin, RecordOrigin::Remote);
        assert_eq!(snapshot.records.len(), 11);
        assert!(snapshot.refresh.is_none());
        assert_eq!(h.cache.list_by_cohort(&btech2()).await.unwrap().len(), 11);
    }

    #[tokio::test]
    async fn cached_cohort_is_served_locally_and_refreshed_when_counts_differ() {
        let h = Harness::new();
        let current = h.current(&btech2());
        h.cache.bulk_put(&students(btech2(), 3)).await.unwrap();
        h.remote.seed(&current, students(btech2(), 5)).await;

        let snapshot = h.reconciler.reconcile_cohort_detailed(&btech2()).await.unwrap();
        assert_eq!(snapshot.origin, RecordOrigin::Cache);
        assert_eq!(snapshot.records.len(), 3);
        let outcome = snapshot.refresh.unwrap().await.unwrap();
        assert_eq!(outcome, RefreshOutcome::Refreshed { records: 5 });

        let next = h.reconciler.reconcile_cohort(&btech2()).await.unwrap();
        assert_eq!(next.len(), 5);
    }

    #[tokio::test]
    async fn refreshed_entries_replace_cached_ones_without_merging() {
        let h = Harness::new();
        let current = h.current(&btech2());
        h.cache.bulk_put(&students(btech2(), 2)).await.unwrap();

        let key = NaturalKey::registration("B22CS000");
        let mut renamed = Record::student(key.clone(), btech2()).with_field("section", "B");
        renamed.is_active = false;
        let mut remote = students(btech2(), 3);
        remote[0] = renamed.clone();
        h.remote.seed(&current, remote).await;

        let snapshot = h.reconciler.reconcile_cohort_detailed(&btech2()).await.unwrap();
        assert_eq!(
            snapshot.refresh.unwrap().await.unwrap(),
            RefreshOutcome::Refreshed { records: 3 }
        );

        let cached = h.cache.get(&key).await.unwrap().unwrap();
        assert_eq!(cached, renamed);
        assert_eq!(cached.field_str("name"), None);

        let listed = h.reconciler.reconcile_cohort(&btech2()).await.unwrap();
        assert!(listed.contains(&renamed));
    }

    #[tokio::test]
    async fn equal_counts_and_empty_remote_leave_the_cache_alone() {
        let h = Harness::new();
        let current = h.current(&btech2());
        h.cache.bulk_put(&students(btech2(), 4)).await.unwrap();

        let snapshot = h.reconciler.reconcile_cohort_detailed(&btech2()).await.unwrap();
        assert_eq!(snapshot.refresh.unwrap().await.unwrap(), RefreshOutcome::RemoteEmpty);

        h.remote.seed(&current, students(btech2(), 4)).await;
        let snapshot = h.reconciler.reconcile_cohort_detailed(&btech2()).await.unwrap();
        assert_eq!(snapshot.refresh.unwrap().await.unwrap(), RefreshOutcome::Unchanged);

        h.remote.fail_partition(&current).await;
        let snapshot = h.reconciler.reconcile_cohort_detailed(&btech2()).await.unwrap();
        assert_eq!(snapshot.records.len(), 4);
        assert_eq!(snapshot.refresh.unwrap().await.unwrap(), RefreshOutcome::Failed);
    }

    #[tokio::test]
    async fn repeated_calls_never_return_fewer_records_than_were_persisted() {
        let h = Harness::new();
        let current = h.current(&btech2());
        h.remote.seed(&current, students(btech2(), 6)).await;
        assert_eq!(h.reconciler.reconcile_cohort(&btech2()).await.unwrap().len(), 6);

        h.remote.replace(&current, students(btech2(), 2)).await;
        for _ in 0..3 {
            let snapshot = h.reconciler.reconcile_cohort_detailed(&btech2()).await.unwrap();
            assert_eq!(snapshot.origin, RecordOrigin::Cache);
            assert_eq!(snapshot.records.len(), 6);
            snapshot.refresh.unwrap().await.unwrap();
        }
    }

    #[tokio::test]
    async fn failed_current_partition_falls_back_to_flat_legacy_scan() {
        let h = Harness::new();
        let partitions = h.catalog.resolver.resolve(&btech2()).unwrap();
        h.remote.fail_partition(&partitions.current).await;
        let mut legacy = students(btech2(), 2);
        legacy.extend(students(CohortKey::new(CanonicalProgram::BtechCse, 3), 1).into_iter().map(|mut r| {
            r.natural_key = NaturalKey::registration("B21CS999");
            r
        }));
        h.remote.seed(partitions.flat(), legacy).await;

        let snapshot = h.reconciler.reconcile_cohort_detailed(&btech2()).await.unwrap();
        assert_eq!(snapshot.origin, RecordOrigin::LegacyFallback);
        assert_eq!(snapshot.records.len(), 2);
        assert!(h.cache.list_by_cohort(&btech2()).await.unwrap().is_empty());

        h.remote.set_unavailable(true).await;
        let snapshot = h.reconciler.reconcile_cohort_detailed(&btech2()).await.unwrap();
        assert_eq!(snapshot.origin, RecordOrigin::Unavailable);
        assert!(snapshot.records.is_empty());
    }

    #[tokio::test]
    async fn unmapped_cohorts_are_surfaced_not_guessed() {
        let h = Harness::new();
        let err = h
            .reconciler
            .reconcile_cohort(&CohortKey::new(CanonicalProgram::Mca, 4))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::UnmappedCohort(_)));
        assert_eq!(h.remote.calls().await.query, 0);
    }

    #[tokio::test]
    async fn roster_import_is_idempotent() {
        let h = Harness::new();
        let current = h.current(&btech2());
        let entries = roster("B22CS", 20);
        let existing = entries[..5]
            .iter()
            .map(|e| e.to_record(RecordKind::Student, btech2()).with_field("name", "edited"))
            .collect::<Vec<_>>();
        h.remote.seed(&current, existing[..3].to_vec()).await;
        h.cache.bulk_put(&existing[3..]).await.unwrap();

        let first = h.reconciler.import_roster(&entries, &btech2()).await.unwrap();
        assert_eq!(first, ImportSummary { imported: 15, skipped: 5 });
        let after_first = h.remote.records(&current).await;

        let second = h.reconciler.import_roster(&entries, &btech2()).await.unwrap();
        assert_eq!(second, ImportSummary { imported: 0, skipped: 20 });
        assert_eq!(h.remote.records(&current).await, after_first);

        let edited = h
            .remote
            .get(&current, &NaturalKey::registration("B22CS000"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(edited.field_str("name"), Some("edited"));
        assert_eq!(h.cache.list_by_cohort(&btech2()).await.unwrap().len(), 17);
    }

    #[tokio::test]
    async fn duplicate_and_blank_keys_in_one_input_are_skipped() {
        let h = Harness::new();
        let mut entries = roster("B22CS", 3);
        entries.push(RosterEntry::new("b22cs 000"));
        entries.push(RosterEntry::new("   "));
        let summary = h.reconciler.import_roster(&entries, &btech2()).await.unwrap();
        assert_eq!(summary, ImportSummary { imported: 3, skipped: 2 });
    }

    #[tokio::test]
    async fn import_aborts_when_absence_cannot_be_proven() {
        let h = Harness::new();
        h.remote.fail_partition(&h.current(&btech2())).await;
        let err = h
            .reconciler
            .import_roster(&roster("B22CS", 2), &btech2())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Remote(_)));
        assert!(h.cache.list_by_cohort(&btech2()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn keys_held_only_by_legacy_partitions_are_not_imported_again() {
        let h = Harness::new();
        let partitions = h.catalog.resolver.resolve(&btech2()).unwrap();
        let legacy = Record::student(NaturalKey::registration("B22CS001"), btech2())
            .with_field("name", "edited");
        h.remote.seed(partitions.flat(), [legacy.clone()]).await;
        h.remote
            .seed(&partitions.legacy[1], [Record::student(NaturalKey::registration("B22CS002"), btech2())])
            .await;

        let entries = [RosterEntry::new("B22CS001"), RosterEntry::new("B22CS002")];
        let summary = h.reconciler.import_roster(&entries, &btech2()).await.unwrap();
        assert_eq!(summary, ImportSummary { imported: 0, skipped: 2 });
        assert!(h.remote.records(&partitions.current).await.is_empty());
        assert_eq!(h.remote.records(partitions.flat()).await, vec![legacy]);
    }

    #[tokio::test]
    async fn failing_legacy_partition_also_aborts_the_import() {
        let h = Harness::new();
        let partitions = h.catalog.resolver.resolve(&btech2()).unwrap();
        h.remote.fail_partition(partitions.flat()).await;
        let err = h
            .reconciler
            .import_roster(&roster("B22CS", 1), &btech2())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Remote(_)));
        assert_eq!(h.remote.calls().await.bulk_upsert, 0);
    }
}
