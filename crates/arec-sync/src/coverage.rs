use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use arec_catalog::{Catalog, CollectionResolver, Dataset};
use arec_core::{CohortKey, CoverageEntry, CoverageSource, NaturalKey, RecordKind};
use arec_storage::{CacheError, LocalCache, RecordFilter, RemoteStore};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use crate::SyncError;

pub const TIMETABLE_LABEL: &str = "timetable";
pub const ROSTER_LABEL: &str = "roster";

/// Which partition family and record kind back a declared dataset label.
pub fn dataset_for_label(label: &str) -> Option<(Dataset, RecordKind)> {
    match arec_catalog::normalize_label(label).as_str() {
        TIMETABLE_LABEL | "timetables" => Some((Dataset::Timetable, RecordKind::Timetable)),
        ROSTER_LABEL | "students" | "student roster" => Some((Dataset::Roster, RecordKind::Student)),
        _ => None,
    }
}

/// A dataset that should exist for a cohort.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExpectedDataset {
    pub cohort: CohortKey,
    pub label: String,
}

impl ExpectedDataset {
    pub fn timetable(cohort: CohortKey) -> Self {
        Self {
            cohort,
            label: TIMETABLE_LABEL.to_string(),
        }
    }
}

/// Raw `program`/`year` pair as written in `expected_datasets.yaml`.
#[derive(Debug, Clone, Deserialize)]
pub struct DatasetDeclaration {
    pub program: String,
    pub year: JsonValue,
    #[serde(default)]
    pub label: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct DeclarationFile {
    #[serde(default)]
    datasets: Vec<DatasetDeclaration>,
}

impl DatasetDeclaration {
    pub fn resolve(&self, catalog: &Catalog) -> Result<ExpectedDataset, SyncError> {
        let year = arec_catalog::normalize_year_value(&self.year)?;
        let program = catalog.canonicalizer.canonicalize(&self.program);
        Ok(ExpectedDataset {
            cohort: CohortKey::new(program, year),
            label: self
                .label
                .clone()
                .unwrap_or_else(|| TIMETABLE_LABEL.to_string()),
        })
    }
}

pub fn parse_declarations(text: &str) -> Result<Vec<DatasetDeclaration>> {
    let file: DeclarationFile =
        serde_yaml::from_str(text).context("parsing expected dataset declarations")?;
    Ok(file.datasets)
}

pub fn load_declarations(path: impl AsRef<Path>) -> Result<Vec<DatasetDeclaration>> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    parse_declarations(&text).with_context(|| format!("loading {}", path.display()))
}

/// Reports which expected cohort datasets are missing. Read-only: never writes the
/// cache or the remote store.
#[derive(Clone)]
pub struct CoverageTracker {
    cache: Arc<LocalCache>,
    remote: Arc<dyn RemoteStore>,
    resolver: Arc<CollectionResolver>,
}

impl CoverageTracker {
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

    /// Expected cohorts with no timetable in the cache or the remote store.
    pub async fn compute_gaps(&self, expected: &[CohortKey]) -> Vec<CohortKey> {
        let datasets = expected
            .iter()
            .copied()
            .map(ExpectedDataset::timetable)
            .collect::<Vec<_>>();
        self.compute_coverage(&datasets)
            .await
            .into_iter()
            .filter(|entry| !entry.present)
            .map(|entry| entry.cohort)
            .collect()
    }

    /// One row per expected dataset, in input order.
    pub async fn compute_coverage(&self, expected: &[ExpectedDataset]) -> Vec<CoverageEntry> {
        let mut entries = Vec::with_capacity(expected.len());
        for dataset in expected {
            entries.push(self.check(dataset).await);
        }
        entries
    }

    async fn cached(&self, cohort: &CohortKey, kind: RecordKind) -> Result<bool, CacheError> {
        match kind {
            RecordKind::Timetable => Ok(self
                .cache
                .get(&NaturalKey::timetable(cohort))
                .await?
                .is_some_and(|record| record.has_content())),
            _ => Ok(self
                .cache
                .list_by_cohort(cohort)
                .await?
                .iter()
                .any(|record| record.kind == kind)),
        }
    }

    async fn check(&self, dataset: &ExpectedDataset) -> CoverageEntry {
        let cohort = dataset.cohort;
        let missing = |reason: Option<String>| CoverageEntry {
            cohort,
            label: dataset.label.clone(),
            present: false,
            source: CoverageSource::Missing,
            reason,
        };
        let found = |source| CoverageEntry {
            cohort,
            label: dataset.label.clone(),
            present: true,
            source,
            reason: None,
        };

        let Some((target, kind)) = dataset_for_label(&dataset.label) else {
            return missing(Some(format!("no dataset is tracked under label {:?}", dataset.label)));
        };
        let partitions = match self.resolver.resolve_dataset(&cohort, target) {
            Ok(partitions) => partitions,
            Err(err) => return missing(Some(err.to_string())),
        };

        match self.cached(&cohort, kind).await {
            Ok(true) => return found(CoverageSource::Cache),
            Ok(false) => {}
            Err(err) => warn!(%cohort, error = %err, "cache check failed; asking remote"),
        }

        let filter = RecordFilter::cohort(&cohort).with_kind(kind);
        match self.remote.exists(&partitions.current, &filter).await {
            Ok(true) => found(CoverageSource::Remote),
            Ok(false) => {
                debug!(%cohort, label = %dataset.label, "dataset missing");
                missing(None)
            }
            Err(err) => {
                warn!(%cohort, error = %err, "remote existence check failed; counting as gap");
                missing(Some(err.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::Harness;
    use arec_core::{CanonicalProgram, Record};

    fn timetable(cohort: CohortKey) -> Record {
        Record::timetable(cohort).with_field("slots", serde_json::json!([["MON", "09:00", "DBMS"]]))
    }

    #[tokio::test]
    async fn gaps_are_exactly_the_cohorts_found_nowhere() {
        let h = Harness::new();
        let expected = h.catalog.resolver.mapped_cohorts().into_iter().take(11).collect::<Vec<_>>();
        assert_eq!(expected.len(), 11);

        for cohort in &expected[..9] {
            h.cache.put(&timetable(*cohort)).await.unwrap();
        }
        let remote_only = expected[9];
        let timetables = h
            .catalog
            .resolver
            .resolve_dataset(&remote_only, Dataset::Timetable)
            .unwrap();
        h.remote.seed(&timetables.current, [timetable(remote_only)]).await;

        let absent = expected[10];
        let absent_partition = h
            .catalog
            .resolver
            .resolve_dataset(&absent, Dataset::Timetable)
            .unwrap()
            .current;
        h.remote.fail_partition(&absent_partition).await;

        assert_eq!(h.coverage.compute_gaps(&expected).await, vec![absent]);
        assert_eq!(h.remote.calls().await.exists, 2);
    }

    #[tokio::test]
    async fn empty_cached_timetables_do_not_count() {
        let h = Harness::new();
        let cohort = CohortKey::new(CanonicalProgram::MscCs, 1);
        h.cache.put(&Record::timetable(cohort)).await.unwrap();
        let rows = h.coverage.compute_coverage(&[ExpectedDataset::timetable(cohort)]).await;
        assert_eq!(rows.len(), 1);
        assert!(!rows[0].present);
        assert_eq!(rows[0].source, CoverageSource::Missing);
        assert!(rows[0].reason.is_none());
    }

    #[tokio::test]
    async fn unmapped_and_unknown_cohorts_are_gaps_with_a_reason() {
        let h = Harness::new();
        let unmapped = CohortKey::new(CanonicalProgram::Mca, 3);
        let unknown = CohortKey::new(CanonicalProgram::Unknown, 1);
        let rows = h
            .coverage
            .compute_coverage(&[ExpectedDataset::timetable(unmapped), ExpectedDataset::timetable(unknown)])
            .await;
        assert!(rows.iter().all(|r| !r.present && r.reason.is_some()));
        assert_eq!(h.remote.calls().await.exists, 0);
    }

    #[tokio::test]
    async fn coverage_never_writes() {
        let h = Harness::new();
        let cohort = CohortKey::new(CanonicalProgram::BtechCse, 1);
        let partition = h
            .catalog
            .resolver
            .resolve_dataset(&cohort, Dataset::Timetable)
            .unwrap()
            .current;
        h.remote.seed(&partition, [timetable(cohort)]).await;
        let rows = h.coverage.compute_coverage(&[ExpectedDataset::timetable(cohort)]).await;
        assert_eq!(rows[0].source, CoverageSource::Remote);
        assert!(h.cache.get(&NaturalKey::timetable(&cohort)).await.unwrap().is_none());
        assert_eq!(h.remote.calls().await.bulk_upsert, 0);
    }

    #[test]
    fn declarations_resolve_through_the_catalog() {
        let catalog = Catalog::builtin().unwrap();
        let declarations = parse_declarations(
            "datasets:\n  - program: \"M.Tech (Data Science)\"\n    year: \"I\"\n  - program: MCA\n    year: 2\n    label: attendance\n",
        )
        .unwrap();
        let resolved = declarations
            .iter()
            .map(|d| d.resolve(&catalog).unwrap())
            .collect::<Vec<_>>();
        assert_eq!(
            resolved[0],
            ExpectedDataset::timetable(CohortKey::new(CanonicalProgram::MtechDs, 1))
        );
        assert_eq!(resolved[1].label, "attendance");

        let bad: DatasetDeclaration =
            serde_yaml::from_str("program: MCA\nyear: eleventh").unwrap();
        assert!(matches!(bad.resolve(&catalog), Err(SyncError::Normalization(_))));
    }

    #[test]
    fn workspace_declarations_parse() {
        let path = std::path::PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .join("expected_datasets.yaml");
        let catalog = Catalog::builtin().unwrap();
        let declarations = load_declarations(path).unwrap();
        assert!(!declarations.is_empty());
        for declaration in declarations {
            let expected = declaration.resolve(&catalog).unwrap();
            assert!(catalog.resolver.is_mapped(&expected.cohort), "{}", expected.cohort);
        }
    }

    #[tokio::test]
    async fn labels_are_checked_against_their_own_dataset() {
        let h = Harness::new();
        let mca2 = CohortKey::new(CanonicalProgram::Mca, 2);
        h.cache.put(&timetable(mca2)).await.unwrap();

        let attendance = ExpectedDataset {
            cohort: mca2,
            label: "attendance".to_string(),
        };
        let roster = ExpectedDataset {
            cohort: mca2,
            label: "Roster".to_string(),
        };
        let rows = h
            .coverage
            .compute_coverage(&[ExpectedDataset::timetable(mca2), attendance, roster.clone()])
            .await;
        assert_eq!(rows[0].source, CoverageSource::Cache);
        assert!(!rows[1].present);
        assert!(rows[1].reason.as_deref().is_some_and(|r| r.contains("attendance")));
        assert!(!rows[2].present);
        assert!(rows[2].reason.is_none());
        assert_eq!(h.remote.calls().await.exists, 1);

        let students = h.current(&mca2);
        h.remote
            .seed(&students, [Record::student(NaturalKey::registration("23MCA001"), mca2)])
            .await;
        let rows = h.coverage.compute_coverage(&[roster.clone()]).await;
        assert_eq!(rows[0].source, CoverageSource::Remote);

        h.cache
            .put(&Record::student(NaturalKey::registration("23MCA002"), mca2))
            .await
            .unwrap();
        let rows = h.coverage.compute_coverage(&[roster]).await;
        assert_eq!(rows[0].source, CoverageSource::Cache);
    }
}
