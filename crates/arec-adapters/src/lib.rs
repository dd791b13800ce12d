//! Remote-store adapters: schema-generation decoding, the REST document-store client,
//! and static roster bundle loading.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use arec_catalog::{normalize_year_value, NameCanonicalizer};
use arec_core::{
    CanonicalProgram, CohortKey, NaturalKey, NormalizationError, Record, RecordKind, RosterEntry,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

mod http_store;

pub use http_store::HttpRemoteStore;

pub const CRATE_NAME: &str = "arec-adapters";
pub const CURRENT_SCHEMA_VERSION: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaGeneration {
    /// First-generation single collection keyed by `regNo`/`email` with a free-form `course`.
    Flat,
    /// Intermediate per-program collections keyed by `registrationNumber`.
    ProgramScoped,
    /// Per-program-per-year partitions with an explicit `schemaVersion`.
    Current,
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("document matches no known schema generation: {0}")]
    Shape(#[from] serde_json::Error),
    #[error("unsupported schema version {0}")]
    UnsupportedVersion(u32),
    #[error(transparent)]
    Year(#[from] NormalizationError),
    #[error("document has an empty natural key")]
    EmptyKey,
    #[error("timetable document has no program/year")]
    TimetableWithoutCohort,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CurrentDocument {
    schema_version: u32,
    kind: RecordKind,
    #[serde(default)]
    natural_key: Option<String>,
    #[serde(default)]
    program: Option<String>,
    #[serde(default)]
    year: Option<JsonValue>,
    #[serde(default = "default_true")]
    is_active: bool,
    #[serde(default)]
    fields: BTreeMap<String, JsonValue>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProgramScopedDocument {
    registration_number: String,
    program: String,
    year: JsonValue,
    #[serde(flatten)]
    extra: BTreeMap<String, JsonValue>,
}

#[derive(Debug, Deserialize)]
struct FlatStudentDocument {
    #[serde(rename = "regNo")]
    reg_no: String,
    course: String,
    year: JsonValue,
    #[serde(flatten)]
    extra: BTreeMap<String, JsonValue>,
}

#[derive(Debug, Deserialize)]
struct LegacyTimetableDocument {
    course: String,
    year: JsonValue,
    timetable: JsonValue,
    #[serde(flatten)]
    extra: BTreeMap<String, JsonValue>,
}

#[derive(Debug, Deserialize)]
struct LegacyStaffDocument {
    email: String,
    #[serde(flatten)]
    extra: BTreeMap<String, JsonValue>,
}

/// Every document shape the store has held, tried newest first.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireDocument {
    Current(CurrentDocument),
    ProgramScoped(ProgramScopedDocument),
    FlatStudent(FlatStudentDocument),
    LegacyTimetable(LegacyTimetableDocument),
    LegacyStaff(LegacyStaffDocument),
}

fn program_from(raw: &str, canonicalizer: &NameCanonicalizer) -> CanonicalProgram {
    CanonicalProgram::from_id(raw).unwrap_or_else(|| canonicalizer.canonicalize(raw))
}

fn take_active_flag(extra: &mut BTreeMap<String, JsonValue>) -> bool {
    extra
        .remove("isActive")
        .and_then(|v| v.as_bool())
        .unwrap_or(true)
}

fn keyed(key: NaturalKey) -> Result<NaturalKey, DecodeError> {
    if key.is_empty() {
        Err(DecodeError::EmptyKey)
    } else {
        Ok(key)
    }
}

impl WireDocument {
    fn generation(&self) -> SchemaGeneration {
        match self {
            WireDocument::Current(_) => SchemaGeneration::Current,
            WireDocument::ProgramScoped(_) => SchemaGeneration::ProgramScoped,
            WireDocument::FlatStudent(_)
            | WireDocument::LegacyTimetable(_)
            | WireDocument::LegacyStaff(_) => SchemaGeneration::Flat,
        }
    }

    fn into_record(self, canonicalizer: &NameCanonicalizer) -> Result<Record, DecodeError> {
        match self {
            WireDocument::Current(doc) => {
                if doc.schema_version != CURRENT_SCHEMA_VERSION {
                    return Err(DecodeError::UnsupportedVersion(doc.schema_version));
                }
                let cohort = match (&doc.program, &doc.year) {
                    (Some(program), Some(year)) => Some(CohortKey::new(
                        program_from(program, canonicalizer),
                        normalize_year_value(year)?,
                    )),
                    _ => None,
                };
                let raw_key = doc.natural_key.unwrap_or_default();
                let natural_key = match doc.kind {
                    RecordKind::Student => keyed(NaturalKey::registration(&raw_key))?,
                    RecordKind::Staff => keyed(NaturalKey::email(&raw_key))?,
                    RecordKind::Timetable => NaturalKey::timetable(
                        cohort.as_ref().ok_or(DecodeError::TimetableWithoutCohort)?,
                    ),
                };
                Ok(Record {
                    kind: doc.kind,
                    natural_key,
                    cohort,
                    is_active: doc.is_active,
                    fields: doc.fields,
                })
            }
            WireDocument::ProgramScoped(mut doc) => {
                let cohort = CohortKey::new(
                    program_from(&doc.program, canonicalizer),
                    normalize_year_value(&doc.year)?,
                );
                Ok(Record {
                    kind: RecordKind::Student,
                    natural_key: keyed(NaturalKey::registration(&doc.registration_number))?,
                    cohort: Some(cohort),
                    is_active: take_active_flag(&mut doc.extra),
                    fields: doc.extra,
                })
            }
            WireDocument::FlatStudent(mut doc) => {
                let cohort = CohortKey::new(
                    canonicalizer.canonicalize(&doc.course),
                    normalize_year_value(&doc.year)?,
                );
                Ok(Record {
                    kind: RecordKind::Student,
                    natural_key: keyed(NaturalKey::registration(&doc.reg_no))?,
                    cohort: Some(cohort),
                    is_active: take_active_flag(&mut doc.extra),
                    fields: doc.extra,
                })
            }
            WireDocument::LegacyTimetable(mut doc) => {
                let cohort = CohortKey::new(
                    canonicalizer.canonicalize(&doc.course),
                    normalize_year_value(&doc.year)?,
                );
                let is_active = take_active_flag(&mut doc.extra);
                doc.extra.insert("timetable".to_string(), doc.timetable);
                Ok(Record {
                    kind: RecordKind::Timetable,
                    natural_key: NaturalKey::timetable(&cohort),
                    cohort: Some(cohort),
                    is_active,
                    fields: doc.extra,
                })
            }
            WireDocument::LegacyStaff(mut doc) => Ok(Record {
                kind: RecordKind::Staff,
                natural_key: keyed(NaturalKey::email(&doc.email))?,
                cohort: None,
                is_active: take_active_flag(&mut doc.extra),
                fields: doc.extra,
            }),
        }
    }
}

/// Normalizes any stored document shape into the canonical [`Record`].
pub fn decode_document(
    value: JsonValue,
    canonicalizer: &NameCanonicalizer,
) -> Result<(Record, SchemaGeneration), DecodeError> {
    let wire: WireDocument = serde_json::from_value(value)?;
    let generation = wire.generation();
    Ok((wire.into_record(canonicalizer)?, generation))
}

/// Writes always use the current generation.
pub fn encode_document(record: &Record) -> JsonValue {
    let mut doc = serde_json::json!({
        "schemaVersion": CURRENT_SCHEMA_VERSION,
        "kind": record.kind,
        "naturalKey": record.natural_key,
        "isActive": record.is_active,
        "fields": record.fields,
    });
    if let Some(cohort) = &record.cohort {
        doc["program"] = JsonValue::String(cohort.program.id().to_string());
        doc["year"] = JsonValue::from(cohort.year);
    }
    doc
}

/// Static reference roster supplied at build time for one program/year.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterBundle {
    pub program: String,
    pub year: JsonValue,
    #[serde(default)]
    pub kind: Option<RecordKind>,
    pub entries: Vec<RosterEntry>,
}

impl RosterBundle {
    pub fn cohort(&self, canonicalizer: &NameCanonicalizer) -> Result<CohortKey, NormalizationError> {
        Ok(CohortKey::new(
            canonicalizer.canonicalize(&self.program),
            normalize_year_value(&self.year)?,
        ))
    }

    pub fn record_kind(&self) -> RecordKind {
        self.kind.unwrap_or(RecordKind::Student)
    }
}

pub fn load_roster_bundle(path: impl AsRef<Path>) -> Result<RosterBundle> {
    read_json_file(path)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

/// Stable id for a bundle's contents, used to correlate repeated imports in logs.
pub fn deterministic_bundle_id(bundle: &RosterBundle) -> Uuid {
    let keys = bundle
        .entries
        .iter()
        .map(|e| e.key().to_string())
        .collect::<Vec<_>>()
        .join(",");
    let source = format!("{}:{}:{}", bundle.program, bundle.year, keys);
    Uuid::new_v5(&Uuid::NAMESPACE_URL, source.as_bytes())
}
