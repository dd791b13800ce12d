//! Cache/remote reconciliation, profile lookup and dataset coverage.

mod coverage;
mod profile;
mod reconcile;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use arec_adapters::{deterministic_bundle_id, HttpRemoteStore, RosterBundle};
use arec_catalog::{Catalog, CatalogConfig};
use arec_core::{CohortKey, CoverageEntry, CoverageSource, NaturalKey, NormalizationError, Record, RosterEntry, UnmappedCohortError};
use arec_storage::{CacheError, FileKeyValueStore, HttpClientConfig, LocalCache, RemoteError, RemoteStore};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

pub use coverage::{
    dataset_for_label, load_declarations, parse_declarations, CoverageTracker,
    DatasetDeclaration, ExpectedDataset, ROSTER_LABEL, TIMETABLE_LABEL,
};
pub use profile::{ProfileMatch, ProfileResolver};
pub use reconcile::{CohortSnapshot, ImportSummary, RecordOrigin, RefreshOutcome, SyncReconciler};

pub const CRATE_NAME: &str = "arec-sync";

/// Errors the layer surfaces to callers. Everything else degrades with a warning.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Normalization(#[from] NormalizationError),
    #[error(transparent)]
    UnmappedCohort(#[from] UnmappedCohortError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Cache(#[from] CacheError),
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Document store base URL; `None` runs against an empty in-memory store.
    pub remote_url: Option<String>,
    pub remote_token: Option<String>,
    pub cache_dir: PathBuf,
    pub catalog_path: PathBuf,
    pub expected_path: PathBuf,
    pub reports_dir: PathBuf,
    pub http_timeout_secs: u64,
    pub user_agent: String,
}

fn env_path(name: &str, default: &str) -> PathBuf {
    std::env::var(name)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(default))
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            remote_url: std::env::var("AREC_REMOTE_URL").ok().filter(|v| !v.trim().is_empty()),
            remote_token: std::env::var("AREC_REMOTE_TOKEN").ok().filter(|v| !v.is_empty()),
            cache_dir: env_path("AREC_CACHE_DIR", "./.arec-cache"),
            catalog_path: env_path("AREC_CATALOG_PATH", "./catalog.yaml"),
            expected_path: env_path("AREC_EXPECTED_PATH", "./expected_datasets.yaml"),
            reports_dir: env_path("AREC_REPORTS_DIR", "./reports"),
            http_timeout_secs: std::env::var("AREC_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            user_agent: std::env::var("AREC_USER_AGENT")
                .unwrap_or_else(|_| "arec/0.1".to_string()),
        }
    }

    /// The YAML table when the file exists, the built-in table otherwise.
    pub fn load_catalog(&self) -> Result<Catalog> {
        let config = if self.catalog_path.exists() {
            CatalogConfig::from_yaml_path(&self.catalog_path)?
        } else {
            CatalogConfig::builtin()
        };
        Catalog::from_config(&config)
            .with_context(|| format!("validating catalog {}", self.catalog_path.display()))
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            bearer_token: self.remote_token.clone(),
            ..HttpClientConfig::default()
        }
    }
}

/// Entry point for the UI layer: one canonicalizer, one resolver and one cache shared by
/// the reconciler, the profile resolver and the coverage tracker.
pub struct ReconciliationLayer {
    catalog: Catalog,
    cache: Arc<LocalCache>,
    reconciler: SyncReconciler,
    profiles: ProfileResolver,
    coverage: CoverageTracker,
}

impl ReconciliationLayer {
    pub fn new(catalog: Catalog, cache: Arc<LocalCache>, remote: Arc<dyn RemoteStore>) -> Self {
        let resolver = Arc::new(catalog.resolver.clone());
        Self {
            reconciler: SyncReconciler::new(cache.clone(), remote.clone(), resolver.clone()),
            profiles: ProfileResolver::new(cache.clone(), remote.clone(), resolver.clone()),
            coverage: CoverageTracker::new(cache.clone(), remote, resolver),
            cache,
            catalog,
        }
    }

    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        let catalog = config.load_catalog()?;
        let cache = Arc::new(LocalCache::new(Arc::new(FileKeyValueStore::new(
            config.cache_dir.clone(),
        ))));
        let remote: Arc<dyn RemoteStore> = match &config.remote_url {
            Some(url) => Arc::new(
                HttpRemoteStore::new(
                    url.clone(),
                    config.http_client_config(),
                    catalog.canonicalizer.clone(),
                )
                .context("building remote store client")?,
            ),
            None => Arc::new(arec_storage::MemoryRemoteStore::new()),
        };
        Ok(Self::new(catalog, cache, remote))
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn cache(&self) -> &LocalCache {
        &self.cache
    }

    pub fn reconciler(&self) -> &SyncReconciler {
        &self.reconciler
    }

    pub fn profiles(&self) -> &ProfileResolver {
        &self.profiles
    }

    pub fn coverage(&self) -> &CoverageTracker {
        &self.coverage
    }

    /// Canonicalizes a raw label pair and checks it maps to a partition.
    pub fn cohort_from_labels(&self, program: &str, year: &str) -> Result<CohortKey, SyncError> {
        let cohort = self.catalog.cohort(program, year)?;
        if !self.catalog.resolver.is_mapped(&cohort) {
            return Err(UnmappedCohortError { cohort }.into());
        }
        Ok(cohort)
    }

    pub async fn reconcile_cohort(&self, cohort: &CohortKey) -> Result<Vec<Record>, SyncError> {
        self.reconciler.reconcile_cohort(cohort).await
    }

    pub async fn reconcile_labels(&self, program: &str, year: &str) -> Result<Vec<Record>, SyncError> {
        let cohort = self.cohort_from_labels(program, year)?;
        self.reconcile_cohort(&cohort).await
    }

    pub async fn import_roster(
        &self,
        entries: &[RosterEntry],
        cohort: &CohortKey,
    ) -> Result<ImportSummary, SyncError> {
        self.reconciler.import_roster(entries, cohort).await
    }

    pub async fn import_bundle(&self, bundle: &RosterBundle) -> Result<ImportSummary, SyncError> {
        let cohort = bundle.cohort(&self.catalog.canonicalizer)?;
        let span = info_span!("import_bundle", bundle_id = %deterministic_bundle_id(bundle), %cohort);
        self.reconciler
            .import_roster_as(&bundle.entries, &cohort, bundle.record_kind())
            .instrument(span)
            .await
    }

    /// Registration numbers and emails are told apart by the `@`.
    pub async fn find_by_key(&self, raw_key: &str) -> Option<Record> {
        self.profiles.find_by_key(&NaturalKey::parse(raw_key)).await
    }

    pub async fn compute_gaps(&self, expected: &[CohortKey]) -> Vec<CohortKey> {
        self.coverage.compute_gaps(expected).await
    }

    /// Fails on the first declaration whose year cannot be normalized.
    pub async fn compute_gaps_from_declarations(
        &self,
        declarations: &[DatasetDeclaration],
    ) -> Result<Vec<CoverageEntry>, SyncError> {
        let expected = declarations
            .iter()
            .map(|d| d.resolve(&self.catalog))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(self.coverage.compute_coverage(&expected).await)
    }

    /// Timetable expectations for every mapped cohort.
    pub fn default_expectations(&self) -> Vec<ExpectedDataset> {
        self.catalog
            .resolver
            .mapped_cohorts()
            .into_iter()
            .map(ExpectedDataset::timetable)
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CoverageReport {
    pub run_id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub expected: usize,
    pub gaps: usize,
    pub entries: Vec<CoverageEntry>,
}

impl CoverageReport {
    pub fn new(entries: Vec<CoverageEntry>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            generated_at: Utc::now(),
            expected: entries.len(),
            gaps: entries.iter().filter(|e| !e.present).count(),
            entries,
        }
    }
}

pub fn coverage_markdown(report: &CoverageReport) -> String {
    let mut lines = vec![
        "# Dataset Coverage".to_string(),
        String::new(),
        format!("- Run ID: `{}`", report.run_id),
        format!("- Generated: {}", report.generated_at),
        format!("- Expected datasets: {}", report.expected),
        format!("- Gaps: {}", report.gaps),
        String::new(),
        "| Cohort | Dataset | Status | Note |".to_string(),
        "|---|---|---|---|".to_string(),
    ];
    for entry in &report.entries {
        let status = match entry.source {
            CoverageSource::Cache => "present (cache)",
            CoverageSource::Remote => "present (remote)",
            CoverageSource::Missing => "MISSING",
        };
        lines.push(format!(
            "| {} | {} | {} | {} |",
            entry.cohort,
            entry.label,
            status,
            entry.reason.as_deref().unwrap_or("")
        ));
    }
    lines.push(String::new());
    lines.join("\n")
}

/// Writes `coverage.md` and `coverage.json` under `<reports_root>/<run_id>/`.
pub async fn write_coverage_report(reports_root: &std::path::Path, report: &CoverageReport) -> Result<PathBuf> {
    let reports_dir = reports_root.join(report.run_id.to_string());
    fs::create_dir_all(&reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    fs::write(reports_dir.join("coverage.md"), coverage_markdown(report))
        .await
        .context("writing coverage.md")?;
    let json = serde_json::to_vec_pretty(report).context("serializing coverage report")?;
    fs::write(reports_dir.join("coverage.json"), json)
        .await
        .context("writing coverage.json")?;

    info!(run_id = %report.run_id, gaps = report.gaps, dir = %reports_dir.display(), "coverage report written");
    Ok(reports_dir)
}


#[cfg(test)]
mod tests {
    use super::*;
    use arec_adapters::load_roster_bundle;
    use arec_core::CanonicalProgram;
    use arec_storage::{MemoryKeyValueStore, MemoryRemoteStore};

    fn layer() -> (ReconciliationLayer, Arc<MemoryRemoteStore>) {
        let remote = Arc::new(MemoryRemoteStore::new());
        let cache = Arc::new(LocalCache::new(Arc::new(MemoryKeyValueStore::new())));
        let layer = ReconciliationLayer::new(Catalog::builtin().unwrap(), cache, remote.clone());
        (layer, remote)
    }

    fn fixture(path: &str) -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../..").join(path)
    }

    #[tokio::test]
    async fn label_variants_reconcile_to_one_cohort() {
        let (layer, remote) = layer();
        let cohort = CohortKey::new(CanonicalProgram::MtechDs, 1);
        let partition = layer.catalog().resolver.resolve(&cohort).unwrap().current;
        remote
            .seed(&partition, [Record::student(NaturalKey::registration("24MDS001"), cohort)])
            .await;

        for (program, year) in [("M.Tech DS", "I"), ("MTECH DS & AI", "1"), ("m tech data science", "first year")] {
            assert_eq!(layer.cohort_from_labels(program, year).unwrap(), cohort);
            assert_eq!(layer.reconcile_labels(program, year).await.unwrap().len(), 1);
        }
    }

    #[tokio::test]
    async fn label_errors_are_surfaced() {
        let (layer, _) = layer();
        assert!(matches!(
            layer.cohort_from_labels("MCA", "year seven"),
            Err(SyncError::Normalization(_))
        ));
        assert!(matches!(
            layer.cohort_from_labels("Diploma in Pottery", "I"),
            Err(SyncError::UnmappedCohort(_))
        ));
        assert!(matches!(
            layer.reconcile_labels("MCA", "IV").await,
            Err(SyncError::UnmappedCohort(_))
        ));
    }

    #[tokio::test]
    async fn bundle_import_then_lookup_by_key() {
        let (layer, _) = layer();
        let bundle = load_roster_bundle(fixture("fixtures/rosters/mtech_ds_year1.json")).unwrap();
        let summary = layer.import_bundle(&bundle).await.unwrap();
        assert_eq!(summary, ImportSummary { imported: 6, skipped: 0 });
        assert_eq!(layer.import_bundle(&bundle).await.unwrap().skipped, 6);

        let found = layer.find_by_key(" 24mds003 ").await.unwrap();
        assert_eq!(found.field_str("name"), Some("Chitra N"));
        assert!(layer.find_by_key("nobody@dept.edu").await.is_none());
    }

    #[tokio::test]
    async fn declarations_feed_coverage_rows() {
        let (layer, _) = layer();
        let declarations = parse_declarations(
            "datasets:\n  - program: BCA\n    year: 1\n  - program: MCA\n    year: II\n",
        )
        .unwrap();
        let rows = layer.compute_gaps_from_declarations(&declarations).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| !r.present));
        assert_eq!(rows[0].cohort.program, CanonicalProgram::Unknown);
        assert!(rows[0].reason.is_some());
        assert!(rows[1].reason.is_none());
        assert_eq!(layer.default_expectations().len(), 20);
    }

    #[tokio::test]
    async fn coverage_reports_land_under_run_id() {
        let temp = tempfile::tempdir().unwrap();
        let (layer, _) = layer();
        let cohorts = layer.catalog().resolver.mapped_cohorts();
        let entries = layer
            .coverage()
            .compute_coverage(&[ExpectedDataset::timetable(cohorts[0])])
            .await;
        let report = CoverageReport::new(entries);

        let dir = write_coverage_report(temp.path(), &report).await.unwrap();
        assert!(dir.ends_with(report.run_id.to_string()));
        let markdown = std::fs::read_to_string(dir.join("coverage.md")).unwrap();
        assert!(markdown.contains("| BTECH_CSE/1 | timetable | MISSING |"));
        let json: serde_json::Value =
            serde_json::from_slice(&std::fs::read(dir.join("coverage.json")).unwrap()).unwrap();
        assert_eq!(json["gaps"], 1);
        assert_eq!(json["entries"][0]["source"], "missing");
    }

    #[tokio::test]
    async fn config_builds_a_file_backed_layer_without_a_remote() {
        let temp = tempfile::tempdir().unwrap();
        let config = SyncConfig {
            remote_url: None,
            remote_token: None,
            cache_dir: temp.path().join("cache"),
            catalog_path: fixture("catalog.yaml"),
            expected_path: fixture("expected_datasets.yaml"),
            reports_dir: temp.path().join("reports"),
            http_timeout_secs: 5,
            user_agent: "arec-test".to_string(),
        };
        let layer = ReconciliationLayer::from_config(&config).unwrap();
        let cohort = layer.cohort_from_labels("B.Tech CSE", "II").unwrap();
        let record = Record::student(NaturalKey::registration("B23CS001"), cohort);
        layer.cache().put(&record).await.unwrap();
        let reopened = ReconciliationLayer::from_config(&config).unwrap();
        let snapshot = reopened
            .reconciler()
            .reconcile_cohort_detailed(&cohort)
            .await
            .unwrap();
        assert_eq!(snapshot.origin, RecordOrigin::Cache);
        assert_eq!(snapshot.records, vec![record]);
    }
}
