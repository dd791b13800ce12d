//! Core domain model for academic record reconciliation.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "arec-core";

/// Canonical program identifier that every display-name variant resolves to.
///
/// Declaration order is significant: it is the tie-break order used when cohorts of the
/// same level and year are enumerated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CanonicalProgram {
    BtechCse,
    BscCs,
    MscCsIntegrated,
    Mca,
    MscCs,
    MtechDs,
    MtechNis,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgramLevel {
    Undergraduate,
    Postgraduate,
}

impl CanonicalProgram {
    pub const ALL: [CanonicalProgram; 7] = [
        CanonicalProgram::BtechCse,
        CanonicalProgram::BscCs,
        CanonicalProgram::MscCsIntegrated,
        CanonicalProgram::Mca,
        CanonicalProgram::MscCs,
        CanonicalProgram::MtechDs,
        CanonicalProgram::MtechNis,
    ];

    pub fn id(self) -> &'static str {
        match self {
            CanonicalProgram::BtechCse => "BTECH_CSE",
            CanonicalProgram::BscCs => "BSC_CS",
            CanonicalProgram::MscCsIntegrated => "MSC_CS_INTEGRATED",
            CanonicalProgram::Mca => "MCA",
            CanonicalProgram::MscCs => "MSC_CS",
            CanonicalProgram::MtechDs => "MTECH_DS",
            CanonicalProgram::MtechNis => "MTECH_NIS",
            CanonicalProgram::Unknown => "UNKNOWN",
        }
    }

    pub fn display_label(self) -> &'static str {
        match self {
            CanonicalProgram::BtechCse => "B.Tech Computer Science & Engineering",
            CanonicalProgram::BscCs => "B.Sc Computer Science",
            CanonicalProgram::MscCsIntegrated => "Integrated M.Sc Computer Science",
            CanonicalProgram::Mca => "MCA",
            CanonicalProgram::MscCs => "M.Sc Computer Science",
            CanonicalProgram::MtechDs => "M.Tech Data Science & AI",
            CanonicalProgram::MtechNis => "M.Tech Network & Information Security",
            CanonicalProgram::Unknown => "Unknown program",
        }
    }

    /// Integrated programs admit straight after school and sit with the UG cohorts.
    pub fn level(self) -> ProgramLevel {
        match self {
            CanonicalProgram::BtechCse
            | CanonicalProgram::BscCs
            | CanonicalProgram::MscCsIntegrated => ProgramLevel::Undergraduate,
            CanonicalProgram::Mca
            | CanonicalProgram::MscCs
            | CanonicalProgram::MtechDs
            | CanonicalProgram::MtechNis
            | CanonicalProgram::Unknown => ProgramLevel::Postgraduate,
        }
    }

    pub fn from_id(id: &str) -> Option<Self> {
        let id = id.trim();
        Self::ALL
            .into_iter()
            .chain(std::iter::once(CanonicalProgram::Unknown))
            .find(|p| p.id().eq_ignore_ascii_case(id))
    }

    pub fn is_unknown(self) -> bool {
        self == CanonicalProgram::Unknown
    }
}

impl fmt::Display for CanonicalProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// A (program, year) class group. `year` is always a resolved ordinal, never a raw token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CohortKey {
    pub program: CanonicalProgram,
    pub year: u8,
}

impl CohortKey {
    pub fn new(program: CanonicalProgram, year: u8) -> Self {
        Self { program, year }
    }
}

impl fmt::Display for CohortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.program, self.year)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Student,
    Staff,
    Timetable,
}

/// Stable dedup key that survives schema migrations.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NaturalKey(String);

impl NaturalKey {
    /// Registration numbers compare case-insensitively and ignore embedded whitespace.
    pub fn registration(raw: &str) -> Self {
        Self(
            raw.chars()
                .filter(|c| !c.is_whitespace())
                .collect::<String>()
                .to_ascii_uppercase(),
        )
    }

    pub fn email(raw: &str) -> Self {
        Self(raw.trim().to_ascii_lowercase())
    }

    pub fn timetable(cohort: &CohortKey) -> Self {
        Self(format!("TIMETABLE:{}:{}", cohort.program, cohort.year))
    }

    /// Picks the email or registration normalization from the shape of the input.
    pub fn parse(raw: &str) -> Self {
        if raw.contains('@') {
            Self::email(raw)
        } else {
            Self::registration(raw)
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn default_active() -> bool {
    true
}

/// Canonical record shape shared by every schema generation once decoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub kind: RecordKind,
    pub natural_key: NaturalKey,
    #[serde(default)]
    pub cohort: Option<CohortKey>,
    /// Deactivation is a flag, records are never removed.
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default)]
    pub fields: BTreeMap<String, JsonValue>,
}

impl Record {
    pub fn new(kind: RecordKind, natural_key: NaturalKey, cohort: Option<CohortKey>) -> Self {
        Self {
            kind,
            natural_key,
            cohort,
            is_active: true,
            fields: BTreeMap::new(),
        }
    }

    pub fn student(natural_key: NaturalKey, cohort: CohortKey) -> Self {
        Self::new(RecordKind::Student, natural_key, Some(cohort))
    }

    pub fn timetable(cohort: CohortKey) -> Self {
        Self::new(RecordKind::Timetable, NaturalKey::timetable(&cohort), Some(cohort))
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(|v| v.as_str())
    }

    pub fn has_content(&self) -> bool {
        !self.fields.is_empty()
    }
}

/// One row of an externally supplied roster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterEntry {
    pub natural_key: String,
    #[serde(default)]
    pub display_fields: BTreeMap<String, JsonValue>,
}

impl RosterEntry {
    pub fn new(natural_key: impl Into<String>) -> Self {
        Self {
            natural_key: natural_key.into(),
            display_fields: BTreeMap::new(),
        }
    }

    pub fn key(&self) -> NaturalKey {
        NaturalKey::parse(&self.natural_key)
    }

    pub fn to_record(&self, kind: RecordKind, cohort: CohortKey) -> Record {
        Record {
            kind,
            natural_key: self.key(),
            cohort: Some(cohort),
            is_active: true,
            fields: self.display_fields.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoverageSource {
    Cache,
    Remote,
    Missing,
}

/// Transient per-query coverage row; never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageEntry {
    pub cohort: CohortKey,
    pub label: String,
    pub present: bool,
    pub source: CoverageSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Raised when a year token cannot be mapped to an ordinal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unrecognized year token {raw:?}")]
pub struct NormalizationError {
    pub raw: String,
}

/// Raised when the partition table has no entry for a cohort.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("no partition mapped for cohort {cohort}")]
pub struct UnmappedCohortError {
    pub cohort: CohortKey,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn program_ids_round_trip_through_from_id() {
        for program in CanonicalProgram::ALL {
            assert_eq!(CanonicalProgram::from_id(program.id()), Some(program));
        }
        assert_eq!(CanonicalProgram::from_id("mtech_ds"), Some(CanonicalProgram::MtechDs));
        assert_eq!(CanonicalProgram::from_id("M.Tech"), None);
    }

    #[test]
    fn program_serializes_as_screaming_id() {
        let json = serde_json::to_string(&CanonicalProgram::MscCsIntegrated).unwrap();
        assert_eq!(json, "\"MSC_CS_INTEGRATED\"");
    }

    #[test]
    fn natural_keys_normalize_by_shape() {
        assert_eq!(NaturalKey::parse(" 2023 mds 014 ").as_str(), "2023MDS014");
        assert_eq!(NaturalKey::parse(" Asha.K@Dept.EDU ").as_str(), "asha.k@dept.edu");
        let cohort = CohortKey::new(CanonicalProgram::Mca, 2);
        assert_eq!(NaturalKey::timetable(&cohort).as_str(), "TIMETABLE:MCA:2");
    }

    #[test]
    fn records_default_to_active_when_flag_absent() {
        let record: Record = serde_json::from_str(
            r#"{"kind":"student","natural_key":"R1","cohort":{"program":"MCA","year":1}}"#,
        )
        .unwrap();
        assert!(record.is_active);
        assert!(!record.has_content());
    }

    #[test]
    fn roster_entry_uses_camel_case_wire_names() {
        let entry: RosterEntry =
            serde_json::from_str(r#"{"naturalKey":"21bcs07","displayFields":{"name":"Anu"}}"#)
                .unwrap();
        let record = entry.to_record(RecordKind::Student, CohortKey::new(CanonicalProgram::BscCs, 1));
        assert_eq!(record.natural_key.as_str(), "21BCS07");
        assert_eq!(record.field_str("name"), Some("Anu"));
    }

    #[test]
    fn integrated_program_is_undergraduate() {
        assert_eq!(CanonicalProgram::MscCsIntegrated.level(), ProgramLevel::Undergraduate);
        assert_eq!(CanonicalProgram::MtechDs.level(), ProgramLevel::Postgraduate);
    }
}
