use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use arec_core::{CohortKey, NaturalKey, Record};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::KeyValueStore;

const ENVELOPE_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache entry {key} is corrupted: {reason}")]
    Corruption { key: String, reason: String },
    #[error("cache persistence failed for {key}: {source}")]
    Persistence {
        key: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct RecordEnvelope {
    version: u32,
    cached_at: DateTime<Utc>,
    record: Record,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CohortIndex {
    version: u32,
    keys: BTreeSet<NaturalKey>,
}

fn record_key(key: &NaturalKey) -> String {
    format!("record:{key}")
}

fn index_key(cohort: &CohortKey) -> String {
    format!("cohort:{}:{}", cohort.program, cohort.year)
}

fn decode_envelope(key: &str, text: &str) -> Result<Record, CacheError> {
    let envelope: RecordEnvelope =
        serde_json::from_str(text).map_err(|err| CacheError::Corruption {
            key: key.to_string(),
            reason: err.to_string(),
        })?;
    if envelope.version != ENVELOPE_VERSION {
        return Err(CacheError::Corruption {
            key: key.to_string(),
            reason: format!("unsupported envelope version {}", envelope.version),
        });
    }
    Ok(envelope.record)
}

fn decode_index(key: &str, text: &str) -> Result<CohortIndex, CacheError> {
    serde_json::from_str(text).map_err(|err| CacheError::Corruption {
        key: key.to_string(),
        reason: err.to_string(),
    })
}

/// Device-local record cache. Never authoritative; last write wins per natural key.
///
/// Records are stored one per key; each cohort additionally has an index entry listing
/// the keys written under it. Index updates only ever add keys, so a cohort listing never
/// shrinks until the cohort is cleared.
pub struct LocalCache {
    store: Arc<dyn KeyValueStore>,
    index_lock: Mutex<()>,
}

impl LocalCache {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            index_lock: Mutex::new(()),
        }
    }

    async fn read(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.store
            .get_item(key)
            .await
            .map_err(|source| CacheError::Persistence {
                key: key.to_string(),
                source,
            })
    }

    async fn write(&self, key: &str, value: String) -> Result<(), CacheError> {
        self.store
            .set_item(key, value)
            .await
            .map_err(|source| CacheError::Persistence {
                key: key.to_string(),
                source,
            })
    }

    async fn remove(&self, key: &str) -> Result<(), CacheError> {
        self.store
            .remove_item(key)
            .await
            .map_err(|source| CacheError::Persistence {
                key: key.to_string(),
                source,
            })
    }

    /// Corrupted entries read as a miss; the next write for the key replaces them.
    pub async fn get(&self, key: &NaturalKey) -> Result<Option<Record>, CacheError> {
        let storage_key = record_key(key);
        let Some(text) = self.read(&storage_key).await? else {
            return Ok(None);
        };
        match decode_envelope(&storage_key, &text) {
            Ok(record) => Ok(Some(record)),
            Err(err) => {
                warn!(error = %err, "treating corrupted cache entry as a miss");
                Ok(None)
            }
        }
    }

    pub async fn contains(&self, key: &NaturalKey) -> Result<bool, CacheError> {
        Ok(self.get(key).await?.is_some())
    }

    async fn write_record(&self, record: &Record) -> Result<(), CacheError> {
        let storage_key = record_key(&record.natural_key);
        let envelope = RecordEnvelope {
            version: ENVELOPE_VERSION,
            cached_at: Utc::now(),
            record: record.clone(),
        };
        let text = serde_json::to_string(&envelope).map_err(|err| CacheError::Corruption {
            key: storage_key.clone(),
            reason: err.to_string(),
        })?;
        self.write(&storage_key, text).await
    }

    async fn read_index(&self, cohort: &CohortKey) -> Result<CohortIndex, CacheError> {
        let key = index_key(cohort);
        let Some(text) = self.read(&key).await? else {
            return Ok(CohortIndex::default());
        };
        match decode_index(&key, &text) {
            Ok(index) => Ok(index),
            Err(err) => {
                warn!(error = %err, "treating corrupted cohort index as empty");
                Ok(CohortIndex::default())
            }
        }
    }

    async fn extend_index(
        &self,
        cohort: &CohortKey,
        keys: impl IntoIterator<Item = NaturalKey>,
    ) -> Result<(), CacheError> {
        let _guard = self.index_lock.lock().await;
        let mut index = self.read_index(cohort).await?;
        let before = index.keys.len();
        index.keys.extend(keys);
        if index.keys.len() == before && before > 0 {
            return Ok(());
        }
        index.version = ENVELOPE_VERSION;
        let key = index_key(cohort);
        let text = serde_json::to_string(&index).map_err(|err| CacheError::Corruption {
            key: key.clone(),
            reason: err.to_string(),
        })?;
        self.write(&key, text).await
    }

    pub async fn put(&self, record: &Record) -> Result<(), CacheError> {
        self.write_record(record).await?;
        if let Some(cohort) = &record.cohort {
            self.extend_index(cohort, [record.natural_key.clone()]).await?;
        }
        Ok(())
    }

    pub async fn bulk_put(&self, records: &[Record]) -> Result<(), CacheError> {
        let mut by_cohort: BTreeMap<CohortKey, Vec<NaturalKey>> = BTreeMap::new();
        for record in records {
            self.write_record(record).await?;
            if let Some(cohort) = record.cohort {
                by_cohort
                    .entry(cohort)
                    .or_default()
                    .push(record.natural_key.clone());
            }
        }
        for (cohort, keys) in by_cohort {
            self.extend_index(&cohort, keys).await?;
        }
        debug!(records = records.len(), "cache bulk write complete");
        Ok(())
    }

    /// Records currently cached under `cohort`, in natural-key order.
    pub async fn list_by_cohort(&self, cohort: &CohortKey) -> Result<Vec<Record>, CacheError> {
        let index = self.read_index(cohort).await?;
        let mut out = Vec::with_capacity(index.keys.len());
        for key in &index.keys {
            if let Some(record) = self.get(key).await? {
                if record.cohort.as_ref() == Some(cohort) {
                    out.push(record);
                }
            }
        }
        Ok(out)
    }

    /// Drops every record indexed under `cohort` and the index itself.
    pub async fn clear_cohort(&self, cohort: &CohortKey) -> Result<usize, CacheError> {
        let _guard = self.index_lock.lock().await;
        let index = self.read_index(cohort).await?;
        let mut removed = 0usize;
        for key in &index.keys {
            if let Some(record) = self.get(key).await? {
                if record.cohort.as_ref() == Some(cohort) {
                    self.remove(&record_key(key)).await?;
                    removed += 1;
                }
            }
        }
        self.remove(&index_key(cohort)).await?;
        Ok(removed)
    }
}
