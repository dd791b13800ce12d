//! Program-name canonicalization and the cohort → partition table.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use anyhow::Context;
use arec_core::{CanonicalProgram, CohortKey, NormalizationError, UnmappedCohortError};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use strsim::jaro_winkler;
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "arec-catalog";

const SUGGESTION_THRESHOLD: f64 = 0.8;
const MAX_YEAR: u8 = 6;

/// Which family of partitions a lookup targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dataset {
    Roster,
    Timetable,
}

impl Dataset {
    fn prefix(self) -> &'static str {
        match self {
            Dataset::Roster => "students",
            Dataset::Timetable => "timetables",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlatPartitions {
    pub roster: String,
    pub timetable: String,
}

impl Default for FlatPartitions {
    fn default() -> Self {
        Self {
            roster: "students".to_string(),
            timetable: "timetables".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramEntry {
    pub program: CanonicalProgram,
    #[serde(default)]
    pub labels: Vec<String>,
    pub partition_slug: String,
    pub years: Vec<u8>,
}

/// Ordered keyword rule; the first rule whose family and keyword both match wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeywordRule {
    pub program: CanonicalProgram,
    pub family_any: Vec<String>,
    #[serde(default)]
    pub contains_any: Vec<String>,
}

/// Finite static table handed to the canonicalizer and resolver at construction time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogConfig {
    #[serde(default)]
    pub flat_partitions: FlatPartitions,
    pub programs: Vec<ProgramEntry>,
    #[serde(default)]
    pub keyword_rules: Vec<KeywordRule>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CatalogError {
    #[error("cohort {0} is mapped more than once")]
    DuplicateCohort(CohortKey),
    #[error("program {program} maps invalid year {year}")]
    InvalidYear { program: CanonicalProgram, year: u8 },
    #[error("program {0} has an empty partition slug")]
    EmptySlug(CanonicalProgram),
    #[error("the UNKNOWN sentinel cannot be mapped to a partition")]
    UnknownMapped,
}

fn entry(program: CanonicalProgram, slug: &str, years: u8, labels: &[&str]) -> ProgramEntry {
    ProgramEntry {
        program,
        labels: labels.iter().map(|l| l.to_string()).collect(),
        partition_slug: slug.to_string(),
        years: (1..=years).collect(),
    }
}

fn rule(program: CanonicalProgram, family_any: &[&str], contains_any: &[&str]) -> KeywordRule {
    KeywordRule {
        program,
        family_any: family_any.iter().map(|s| s.to_string()).collect(),
        contains_any: contains_any.iter().map(|s| s.to_string()).collect(),
    }
}

impl CatalogConfig {
    pub fn builtin() -> Self {
        use CanonicalProgram::*;
        let mtech = ["m tech", "mtech"];
        let msc = ["m sc", "msc", "imsc"];
        Self {
            flat_partitions: FlatPartitions::default(),
            programs: vec![
                entry(BtechCse, "btech_cse", 4, &["B.Tech CSE", "BTech Computer Science"]),
                entry(BscCs, "bsc_cs", 3, &["B.Sc CS", "BSc Computer Science"]),
                entry(
                    MscCsIntegrated,
                    "msc_cs_integrated",
                    5,
                    &["Integrated M.Sc", "Integrated MSc CS", "IMSc"],
                ),
                entry(Mca, "mca", 2, &["MCA", "Master of Computer Applications"]),
                entry(MscCs, "msc_cs", 2, &["M.Sc CS", "MSc Computer Science"]),
                entry(
                    MtechDs,
                    "mtech_ds",
                    2,
                    &[
                        "M.Tech DS",
                        "M.Tech Data Analytics",
                        "MTECH DS & AI",
                        "M.Tech Data Science & AI",
                        "M.Tech Data Science",
                    ],
                ),
                entry(
                    MtechNis,
                    "mtech_nis",
                    2,
                    &["M.Tech NIS", "M.Tech Network & Information Security"],
                ),
            ],
            keyword_rules: vec![
                rule(
                    MtechNis,
                    &mtech,
                    &["nis", "network", "information security", "security", "cyber"],
                ),
                rule(
                    MtechDs,
                    &mtech,
                    &["data science", "data analytics", "analytics", "ds", "ai", "artificial intelligence"],
                ),
                rule(
                    MscCsIntegrated,
                    &msc,
                    &["integrated", "imsc", "5 year", "five year"],
                ),
                rule(MscCs, &msc, &[]),
                rule(MtechDs, &mtech, &[]),
                rule(BtechCse, &["b tech", "btech"], &[]),
                rule(BscCs, &["b sc", "bsc"], &[]),
                rule(Mca, &["mca", "master of computer applications"], &[]),
            ],
        }
    }

    pub fn from_yaml_str(text: &str) -> anyhow::Result<Self> {
        serde_yaml::from_str(text).context("parsing catalog yaml")
    }

    pub fn from_yaml_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

/// Lowercases and collapses every non-alphanumeric run to a single space.
pub fn normalize_label(input: &str) -> String {
    input
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn contains_words(haystack: &str, needle: &str) -> bool {
    let needle = normalize_label(needle);
    if needle.is_empty() {
        return false;
    }
    format!(" {haystack} ").contains(&format!(" {needle} "))
}

#[derive(Debug, Clone)]
pub struct NameCanonicalizer {
    exact: BTreeMap<String, CanonicalProgram>,
    rules: Vec<KeywordRule>,
}

impl NameCanonicalizer {
    pub fn new(config: &CatalogConfig) -> Self {
        let mut exact = BTreeMap::new();
        for program in CanonicalProgram::ALL {
            exact.insert(normalize_label(program.id()), program);
            exact.insert(normalize_label(program.display_label()), program);
        }
        for entry in &config.programs {
            for label in &entry.labels {
                exact.insert(normalize_label(label), entry.program);
            }
        }
        Self {
            exact,
            rules: config.keyword_rules.clone(),
        }
    }

    /// Total and pure: labels that match nothing come back as `Unknown`.
    pub fn canonicalize(&self, raw_label: &str) -> CanonicalProgram {
        let label = normalize_label(raw_label);
        if label.is_empty() {
            return CanonicalProgram::Unknown;
        }
        if let Some(program) = self.exact.get(&label) {
            return *program;
        }
        for rule in &self.rules {
            let in_family = rule.family_any.iter().any(|f| contains_words(&label, f));
            let keyword = rule.contains_any.is_empty()
                || rule.contains_any.iter().any(|k| contains_words(&label, k));
            if in_family && keyword {
                return rule.program;
            }
        }
        debug!(
            raw_label,
            suggestion = self.suggest(raw_label).unwrap_or("<none>"),
            "program label did not canonicalize"
        );
        CanonicalProgram::Unknown
    }

    /// Closest known label by Jaro-Winkler similarity, for operator diagnostics.
    pub fn suggest(&self, raw_label: &str) -> Option<&str> {
        let label = normalize_label(raw_label);
        self.exact
            .keys()
            .map(|known| (known.as_str(), jaro_winkler(&label, known)))
            .filter(|(_, score)| *score >= SUGGESTION_THRESHOLD)
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(known, _)| known)
    }
}

fn ordinal_word(token: &str) -> Option<u8> {
    let n = match token {
        "i" | "first" | "one" => 1,
        "ii" | "second" | "two" => 2,
        "iii" | "third" | "three" => 3,
        "iv" | "fourth" | "four" => 4,
        "v" | "fifth" | "five" => 5,
        "vi" | "sixth" | "six" => 6,
        _ => return None,
    };
    Some(n)
}

fn numeric_token(token: &str) -> Option<u8> {
    let digits = ["st", "nd", "rd", "th"]
        .iter()
        .find_map(|suffix| token.strip_suffix(suffix))
        .unwrap_or(token);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse::<u8>().ok()
}

/// Maps roman numerals I–VI and numeral strings to 1–6. Anything else is an error.
pub fn normalize_year(raw: &str) -> Result<u8, NormalizationError> {
    let normalized = normalize_label(raw);
    let tokens = normalized
        .split(' ')
        .filter(|t| !t.is_empty() && *t != "year" && *t != "yr")
        .collect::<Vec<_>>();
    let year = match tokens.as_slice() {
        [token] => ordinal_word(token).or_else(|| numeric_token(token)),
        _ => None,
    };
    match year {
        Some(year) if (1..=MAX_YEAR).contains(&year) => Ok(year),
        _ => Err(NormalizationError {
            raw: raw.to_string(),
        }),
    }
}

/// Year normalization for document fields that may hold a number or a string.
pub fn normalize_year_value(value: &JsonValue) -> Result<u8, NormalizationError> {
    match value {
        JsonValue::Number(n) => n
            .as_u64()
            .filter(|n| (1..=u64::from(MAX_YEAR)).contains(n))
            .map(|n| n as u8)
            .ok_or_else(|| NormalizationError { raw: n.to_string() }),
        JsonValue::String(s) => normalize_year(s),
        other => Err(NormalizationError {
            raw: other.to_string(),
        }),
    }
}

/// Result of a lenient year lookup; a fallback is always visible to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum YearResolution {
    Exact(u8),
    Defaulted { year: u8, raw: String },
}

impl YearResolution {
    pub fn year(&self) -> u8 {
        match self {
            YearResolution::Exact(year) | YearResolution::Defaulted { year, .. } => *year,
        }
    }

    pub fn is_defaulted(&self) -> bool {
        matches!(self, YearResolution::Defaulted { .. })
    }
}

pub fn resolve_year_or(raw: &str, default: u8) -> YearResolution {
    match normalize_year(raw) {
        Ok(year) => YearResolution::Exact(year),
        Err(err) => {
            warn!(raw, default, error = %err, "year token unresolved; using fallback");
            YearResolution::Defaulted {
                year: default,
                raw: raw.to_string(),
            }
        }
    }
}

/// Opaque name of a physical location in the remote store.
///
/// Only [`CollectionResolver`] constructs these.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct PartitionId(String);

impl PartitionId {
    fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPartitions {
    pub current: PartitionId,
    /// `legacy[0]` is always the flat partition.
    pub legacy: Vec<PartitionId>,
}

impl ResolvedPartitions {
    pub fn flat(&self) -> &PartitionId {
        &self.legacy[0]
    }
}

#[derive(Debug, Clone)]
pub struct CollectionResolver {
    table: BTreeMap<CohortKey, String>,
    flat: FlatPartitions,
}

impl CollectionResolver {
    pub fn new(config: &CatalogConfig) -> Result<Self, CatalogError> {
        let mut table = BTreeMap::new();
        for entry in &config.programs {
            if entry.program.is_unknown() {
                return Err(CatalogError::UnknownMapped);
            }
            if entry.partition_slug.trim().is_empty() {
                return Err(CatalogError::EmptySlug(entry.program));
            }
            for &year in &entry.years {
                if !(1..=MAX_YEAR).contains(&year) {
                    return Err(CatalogError::InvalidYear {
                        program: entry.program,
                        year,
                    });
                }
                let cohort = CohortKey::new(entry.program, year);
                if table.insert(cohort, entry.partition_slug.clone()).is_some() {
                    return Err(CatalogError::DuplicateCohort(cohort));
                }
            }
        }
        Ok(Self {
            table,
            flat: config.flat_partitions.clone(),
        })
    }

    pub fn resolve(&self, cohort: &CohortKey) -> Result<ResolvedPartitions, UnmappedCohortError> {
        self.resolve_dataset(cohort, Dataset::Roster)
    }

    pub fn resolve_dataset(
        &self,
        cohort: &CohortKey,
        dataset: Dataset,
    ) -> Result<ResolvedPartitions, UnmappedCohortError> {
        let slug = self
            .table
            .get(cohort)
            .ok_or(UnmappedCohortError { cohort: *cohort })?;
        let prefix = dataset.prefix();
        Ok(ResolvedPartitions {
            current: PartitionId::new(format!("{prefix}_{slug}_y{}", cohort.year)),
            legacy: vec![
                self.flat_partition(dataset),
                PartitionId::new(format!("{prefix}_{slug}")),
            ],
        })
    }

    pub fn flat_partition(&self, dataset: Dataset) -> PartitionId {
        match dataset {
            Dataset::Roster => PartitionId::new(self.flat.roster.clone()),
            Dataset::Timetable => PartitionId::new(self.flat.timetable.clone()),
        }
    }

    pub fn is_mapped(&self, cohort: &CohortKey) -> bool {
        self.table.contains_key(cohort)
    }

    /// Every mapped cohort: UG before PG, ascending year, then program declaration order.
    pub fn mapped_cohorts(&self) -> Vec<CohortKey> {
        let mut cohorts = self.table.keys().copied().collect::<Vec<_>>();
        cohorts.sort_by_key(|c| (c.program.level(), c.year, c.program));
        cohorts
    }

    /// Current partitions in profile search order.
    pub fn search_order(&self, dataset: Dataset) -> Vec<(CohortKey, PartitionId)> {
        self.mapped_cohorts()
            .into_iter()
            .filter_map(|cohort| {
                self.resolve_dataset(&cohort, dataset)
                    .ok()
                    .map(|resolved| (cohort, resolved.current))
            })
            .collect()
    }
}

/// Canonicalizer and resolver built from one configuration.
#[derive(Debug, Clone)]
pub struct Catalog {
    pub canonicalizer: NameCanonicalizer,
    pub resolver: CollectionResolver,
}

impl Catalog {
    pub fn from_config(config: &CatalogConfig) -> Result<Self, CatalogError> {
        Ok(Self {
            canonicalizer: NameCanonicalizer::new(config),
            resolver: CollectionResolver::new(config)?,
        })
    }

    pub fn builtin() -> Result<Self, CatalogError> {
        Self::from_config(&CatalogConfig::builtin())
    }

    /// Canonicalizes a raw pair. Unknown programs pass through; the resolver reports them.
    pub fn cohort(&self, raw_program: &str, raw_year: &str) -> Result<CohortKey, NormalizationError> {
        let year = normalize_year(raw_year)?;
        Ok(CohortKey::new(self.canonicalizer.canonicalize(raw_program), year))
    }
}
