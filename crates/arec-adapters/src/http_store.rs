use arec_catalog::{NameCanonicalizer, PartitionId};
use arec_core::{NaturalKey, Record};
use arec_storage::{
    FetchError, HttpClientConfig, HttpFetcher, RecordFilter, RemoteError, RemoteStore, Url,
};
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use crate::{decode_document, encode_document};

/// REST client for the managed document store.
///
/// Filters are applied client-side after decoding: legacy partitions spell program and
/// year differently, so the server cannot be trusted to evaluate them.
pub struct HttpRemoteStore {
    base_url: String,
    http: HttpFetcher,
    canonicalizer: NameCanonicalizer,
}

fn remote_error(partition: &PartitionId, err: FetchError) -> RemoteError {
    match err {
        FetchError::Body { .. } => RemoteError::Decode {
            partition: partition.to_string(),
            reason: err.to_string(),
        },
        other => RemoteError::unavailable(partition, other.to_string()),
    }
}

impl HttpRemoteStore {
    pub fn new(
        base_url: impl Into<String>,
        config: HttpClientConfig,
        canonicalizer: NameCanonicalizer,
    ) -> Result<Self, FetchError> {
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: HttpFetcher::new(config)?,
            canonicalizer,
        })
    }

    fn documents_url(&self, partition: &PartitionId) -> String {
        format!("{}/v1/partitions/{}/documents", self.base_url, partition)
    }

    /// The key travels as one percent-encoded path segment.
    fn document_url(&self, partition: &PartitionId, key: &NaturalKey) -> Result<Url, RemoteError> {
        let mut url = Url::parse(&self.documents_url(partition)).map_err(|err| {
            RemoteError::unavailable(partition, format!("invalid document url: {err}"))
        })?;
        url.path_segments_mut()
            .map_err(|()| RemoteError::unavailable(partition, "base url cannot carry a path"))?
            .push(key.as_str());
        Ok(url)
    }

    fn decode_all(&self, partition: &PartitionId, body: JsonValue) -> Result<Vec<Record>, RemoteError> {
        let documents = match body {
            JsonValue::Array(items) => items,
            JsonValue::Object(mut map) => match map.remove("documents") {
                Some(JsonValue::Array(items)) => items,
                Some(JsonValue::Null) | None => Vec::new(),
                Some(other) => {
                    return Err(RemoteError::Decode {
                        partition: partition.to_string(),
                        reason: format!("`documents` is not an array: {other}"),
                    })
                }
            },
            JsonValue::Null => Vec::new(),
            other => {
                return Err(RemoteError::Decode {
                    partition: partition.to_string(),
                    reason: format!("unexpected response body: {other}"),
                })
            }
        };

        let mut records = Vec::with_capacity(documents.len());
        for document in documents {
            match decode_document(document, &self.canonicalizer) {
                Ok((record, generation)) => {
                    debug!(%partition, key = %record.natural_key, ?generation, "decoded document");
                    records.push(record);
                }
                Err(err) => warn!(%partition, error = %err, "skipping undecodable document"),
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn get(
        &self,
        partition: &PartitionId,
        key: &NaturalKey,
    ) -> Result<Option<Record>, RemoteError> {
        let url = self.document_url(partition, key)?;
        let Some(body) = self
            .http
            .get_json(url.as_str())
            .await
            .map_err(|e| remote_error(partition, e))?
        else {
            return Ok(None);
        };
        let (record, _) = decode_document(body, &self.canonicalizer).map_err(|err| {
            RemoteError::Decode {
                partition: partition.to_string(),
                reason: err.to_string(),
            }
        })?;
        Ok(Some(record))
    }

    async fn query(
        &self,
        partition: &PartitionId,
        filter: Option<&RecordFilter>,
    ) -> Result<Vec<Record>, RemoteError> {
        let body = self
            .http
            .get_json(&self.documents_url(partition))
            .await
            .map_err(|e| remote_error(partition, e))?;
        let Some(body) = body else {
            return Ok(Vec::new());
        };
        let mut records = self.decode_all(partition, body)?;
        if let Some(filter) = filter {
            records.retain(|r| filter.matches(r));
        }
        Ok(records)
    }

    async fn exists(
        &self,
        partition: &PartitionId,
        filter: &RecordFilter,
    ) -> Result<bool, RemoteError> {
        Ok(!self.query(partition, Some(filter)).await?.is_empty())
    }

    async fn bulk_upsert(
        &self,
        partition: &PartitionId,
        records: &[Record],
    ) -> Result<usize, RemoteError> {
        if records.is_empty() {
            return Ok(0);
        }
        let url = format!("{}:batchUpsert", self.documents_url(partition));
        let body = serde_json::json!({
            "documents": records.iter().map(encode_document).collect::<Vec<_>>(),
        });
        let response = self
            .http
            .post_json(&url, &body)
            .await
            .map_err(|e| remote_error(partition, e))?;
        let upserted = response
            .get("upserted")
            .and_then(|v| v.as_u64())
            .map(|n| n as usize)
            .unwrap_or(records.len());
        Ok(upserted)
    }
}
