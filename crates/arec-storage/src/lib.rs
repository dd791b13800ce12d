//! Client-side persistence: the key-value layer, the record cache on top of it,
//! and the remote document-store contract.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

mod cache;
mod http;
mod remote;

pub use cache::{CacheError, LocalCache};
pub use http::{FetchError, HttpClientConfig, HttpFetcher};
pub use reqwest::Url;
pub use remote::{MemoryRemoteStore, RecordFilter, RemoteCallCounts, RemoteError, RemoteStore};

pub const CRATE_NAME: &str = "arec-storage";

/// Text key-value persistence the cache is layered on.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get_item(&self, key: &str) -> std::io::Result<Option<String>>;
    async fn set_item(&self, key: &str, value: String) -> std::io::Result<()>;
    async fn remove_item(&self, key: &str) -> std::io::Result<()>;
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// One file per key under `root`, named by the key's hash and replaced atomically.
#[derive(Debug, Clone)]
pub struct FileKeyValueStore {
    root: PathBuf,
}

impl FileKeyValueStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.json", sha256_hex(key.as_bytes())))
    }
}

#[async_trait]
impl KeyValueStore for FileKeyValueStore {
    async fn get_item(&self, key: &str) -> std::io::Result<Option<String>> {
        match fs::read(self.path_for(key)).await {
            // Invalid UTF-8 is passed through lossily and rejected by the decoder above.
            Ok(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn set_item(&self, key: &str, value: String) -> std::io::Result<()> {
        fs::create_dir_all(&self.root).await?;
        let target = self.path_for(key);
        let temp_path = self
            .root
            .join(format!(".{}.{}.tmp", Uuid::new_v4(), value.len()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await?;
        file.write_all(value.as_bytes()).await?;
        file.flush().await?;
        drop(file);

        match fs::rename(&temp_path, &target).await {
            Ok(()) => Ok(()),
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err)
            }
        }
    }

    async fn remove_item(&self, key: &str) -> std::io::Result<()> {
        match fs::remove_file(self.path_for(key)).await {
            Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(err),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryKeyValueStore {
    items: Mutex<BTreeMap<String, String>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn get_item(&self, key: &str) -> std::io::Result<Option<String>> {
        Ok(self.items.lock().await.get(key).cloned())
    }

    async fn set_item(&self, key: &str, value: String) -> std::io::Result<()> {
        self.items.lock().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> std::io::Result<()> {
        self.items.lock().await.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn key_hashing_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn file_store_overwrites_atomically_and_reads_back() {
        let dir = tempdir().expect("tempdir");
        let store = FileKeyValueStore::new(dir.path().join("cache"));

        assert_eq!(store.get_item("record:R1").await.unwrap(), None);
        store.set_item("record:R1", "first".into()).await.unwrap();
        store.set_item("record:R1", "second".into()).await.unwrap();
        assert_eq!(
            store.get_item("record:R1").await.unwrap().as_deref(),
            Some("second")
        );

        let leftovers = std::fs::read_dir(store.root())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);

        store.remove_item("record:R1").await.unwrap();
        store.remove_item("record:R1").await.unwrap();
        assert_eq!(store.get_item("record:R1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn file_store_passes_invalid_utf8_through() {
        let dir = tempdir().expect("tempdir");
        let store = FileKeyValueStore::new(dir.path());
        std::fs::write(store.path_for("k"), [0xff, 0xfe, b'x']).unwrap();
        let text = store.get_item("k").await.unwrap().unwrap();
        assert!(text.ends_with('x'));
    }
}
