//! Blob-store contract and its backends.
//!
//! Workers only see [`BlobStore`]. [`s3::S3Storage`] talks to S3 or MinIO,
//! [`memory::MemoryStorage`] keeps objects in process for tests and local runs.

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

pub mod config;
pub mod memory;
pub mod s3;

pub use memory::MemoryStorage;
pub use s3::S3Storage;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub key: String,
    pub size: i64,
    pub last_modified: DateTime<Utc>,
}

/// A presigned request a client replays verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PresignedRequest {
    pub url: String,
    pub method: String,
    pub headers: BTreeMap<String, String>,
}

#[async_trait]
pub trait BlobStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Bytes>;

    async fn put(&self, key: &str, data: Bytes, content_type: Option<&str>) -> Result<()>;

    async fn copy(&self, source: &str, dest: &str) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Metadata of the object, `None` when it does not exist.
    async fn head(&self, key: &str) -> Result<Option<ObjectMeta>>;

    /// Every object under `prefix`, following pagination to the end.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>>;

    async fn presign_get(
        &self,
        key: &str,
        expires_in: Duration,
        content_type: Option<&str>,
    ) -> Result<String>;

    async fn presign_upload(&self, key: &str, expires_in: Duration) -> Result<PresignedRequest>;

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.head(key).await?.is_some())
    }

    /// Copy to the new key, then delete the source.
    async fn move_object(&self, source: &str, dest: &str) -> Result<()> {
        self.copy(source, dest).await?;
        self.delete(source).await
    }

    /// Delete the object if present and report whether it was.
    ///
    /// Upload transactions use this as their commit point. The default is
    /// head-then-delete, so racing callers must hold the key's claim lock
    /// (see [`crate::pipeline::completeness::ClaimLocks`]); backends that can
    /// remove atomically override it.
    async fn delete_existing(&self, key: &str) -> Result<bool> {
        if self.head(key).await?.is_none() {
            return Ok(false);
        }
        self.delete(key).await?;
        Ok(true)
    }
}

/// Read and parse a JSON object, `None` when the key does not exist.
pub async fn read_json<T: DeserializeOwned>(store: &dyn BlobStore, key: &str) -> Result<Option<T>> {
    if !store.exists(key).await? {
        return Ok(None);
    }
    let data = store.get(key).await?;
    let value = serde_json::from_slice(&data)
        .with_context(|| format!("Failed to parse JSON document {}", key))?;
    Ok(Some(value))
}

pub async fn write_json<T: Serialize + Sync>(store: &dyn BlobStore, key: &str, value: &T) -> Result<()> {
    let data = serde_json::to_vec(value).context("Failed to serialize JSON document")?;
    store
        .put(key, Bytes::from(data), Some("application/json"))
        .await
}

/// Keys under `prefix` in lexical order.
pub async fn list_keys(store: &dyn BlobStore, prefix: &str) -> Result<Vec<String>> {
    let mut keys: Vec<String> = store
        .list(prefix)
        .await?
        .into_iter()
        .map(|o| o.key)
        .collect();
    keys.sort();
    Ok(keys)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_json_helpers() {
        let store = MemoryStorage::new();
        assert!(read_json::<serde_json::Value>(&store, "metadata/x.json")
            .await
            .unwrap()
            .is_none());

        write_json(&store, "metadata/x.json", &json!({"a": 1}))
            .await
            .unwrap();
        let value: serde_json::Value = read_json(&store, "metadata/x.json").await.unwrap().unwrap();
        assert_eq!(value, json!({"a": 1}));
    }

    #[tokio::test]
    async fn test_move_and_delete_existing() {
        let store = MemoryStorage::new();
        store.put("latest/a", Bytes::from_static(b"1"), None).await.unwrap();

        store.move_object("latest/a", "last_valid/a").await.unwrap();
        assert!(!store.exists("latest/a").await.unwrap());
        assert!(store.exists("last_valid/a").await.unwrap());

        assert!(store.delete_existing("last_valid/a").await.unwrap());
        assert!(!store.delete_existing("last_valid/a").await.unwrap());
    }

    #[tokio::test]
    async fn test_list_keys_sorted() {
        let store = MemoryStorage::new();
        for key in ["a/2", "a/1", "b/1"] {
            store.put(key, Bytes::new(), None).await.unwrap();
        }
        assert_eq!(list_keys(&store, "a/").await.unwrap(), vec!["a/1", "a/2"]);
    }
}
