use std::sync::Arc;

use arec_catalog::{CollectionResolver, Dataset, PartitionId};
use arec_core::{NaturalKey, Record};
use arec_storage::{LocalCache, RecordFilter, RemoteStore};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct ProfileMatch {
    pub partition: PartitionId,
    pub record: Record,
}

/// Finds one person's record across every partition generation.
///
/// Lookups never fail: partitions that error are logged and skipped, and a key found
/// nowhere comes back as `None`.
#[derive(Clone)]
pub struct ProfileResolver {
    cache: Arc<LocalCache>,
    remote: Arc<dyn RemoteStore>,
    resolver: Arc<CollectionResolver>,
}

impl ProfileResolver {
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

    /// Flat legacy partition first, then every cohort partition in search order.
    pub fn search_partitions(&self) -> Vec<PartitionId> {
        let mut partitions = vec![self.resolver.flat_partition(Dataset::Roster)];
        partitions.extend(
            self.resolver
                .search_order(Dataset::Roster)
                .into_iter()
                .map(|(_, partition)| partition),
        );
        partitions
    }

    pub async fn find_by_key(&self, key: &NaturalKey) -> Option<Record> {
        if key.is_empty() {
            return None;
        }
        for partition in self.search_partitions() {
            match self.remote.get(&partition, key).await {
                Ok(Some(record)) => {
                    debug!(%key, %partition, "profile found");
                    return Some(record);
                }
                Ok(None) => {}
                Err(err) => warn!(%key, %partition, error = %err, "skipping partition"),
            }
        }
        match self.cache.get(key).await {
            Ok(found) => found,
            Err(err) => {
                warn!(%key, error = %err, "cache lookup failed");
                None
            }
        }
    }

    /// Same search order as [`find_by_key`](Self::find_by_key), matching on the `uid` field.
    pub async fn find_by_account_id(&self, uid: &str) -> Option<Record> {
        let filter = RecordFilter::field_equals("uid", JsonValue::from(uid));
        for partition in self.search_partitions() {
            match self.remote.query(&partition, Some(&filter)).await {
                Ok(mut found) if !found.is_empty() => return Some(found.swap_remove(0)),
                Ok(_) => {}
                Err(err) => warn!(uid, %partition, error = %err, "skipping partition"),
            }
        }
        None
    }

    /// Every partition holding `key`, in search order. Used to diagnose duplicates.
    pub async fn find_all_by_key(&self, key: &NaturalKey) -> Vec<ProfileMatch> {
        let mut matches = Vec::new();
        for partition in self.search_partitions() {
            match self.remote.get(&partition, key).await {
                Ok(Some(record)) => matches.push(ProfileMatch { partition, record }),
                Ok(None) => {}
                Err(err) => warn!(%key, %partition, error = %err, "skipping partition"),
            }
        }
        matches
    }
}
