//! In-process blob store.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use super::{BlobStore, ObjectMeta, PresignedRequest};

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    last_modified: DateTime<Utc>,
}

/// Blob store backed by an ordered map. Clones share the same objects.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    objects: Arc<RwLock<BTreeMap<String, StoredObject>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override an object's modification time.
    pub async fn set_last_modified(&self, key: &str, at: DateTime<Utc>) -> Result<()> {
        let mut objects = self.objects.write().await;
        let object = objects
            .get_mut(key)
            .ok_or_else(|| anyhow!("No such key: {}", key))?;
        object.last_modified = at;
        Ok(())
    }

    /// Every stored key in lexical order.
    pub async fn keys(&self) -> Vec<String> {
        self.objects.read().await.keys().cloned().collect()
    }
}

#[async_trait]
impl BlobStore for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Bytes> {
        self.objects
            .read()
            .await
            .get(key)
            .map(|o| o.data.clone())
            .ok_or_else(|| anyhow!("No such key: {}", key))
    }

    async fn put(&self, key: &str, data: Bytes, _content_type: Option<&str>) -> Result<()> {
        self.objects.write().await.insert(
            key.to_string(),
            StoredObject {
                data,
                last_modified: Utc::now(),
            },
        );
        Ok(())
    }

    async fn copy(&self, source: &str, dest: &str) -> Result<()> {
        let mut objects = self.objects.write().await;
        let data = objects
            .get(source)
            .map(|o| o.data.clone())
            .ok_or_else(|| anyhow!("No such key: {}", source))?;
        objects.insert(
            dest.to_string(),
            StoredObject {
                data,
                last_modified: Utc::now(),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.objects.write().await.remove(key);
        Ok(())
    }

    async fn head(&self, key: &str) -> Result<Option<ObjectMeta>> {
        Ok(self.objects.read().await.get(key).map(|o| ObjectMeta {
            key: key.to_string(),
            size: o.data.len() as i64,
            last_modified: o.last_modified,
        }))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        Ok(self
            .objects
            .read()
            .await
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, o)| ObjectMeta {
                key: k.clone(),
                size: o.data.len() as i64,
                last_modified: o.last_modified,
            })
            .collect())
    }

    async fn presign_get(
        &self,
        key: &str,
        expires_in: Duration,
        content_type: Option<&str>,
    ) -> Result<String> {
        let mut url = format!("memory:///{}?expires={}", key, expires_in.as_secs());
        if let Some(ct) = content_type {
            url.push_str("&response-content-type=");
            url.push_str(ct);
        }
        Ok(url)
    }

    async fn presign_upload(&self, key: &str, expires_in: Duration) -> Result<PresignedRequest> {
        Ok(PresignedRequest {
            url: format!("memory:///{}?expires={}", key, expires_in.as_secs()),
            method: "PUT".to_string(),
            headers: BTreeMap::new(),
        })
    }

    async fn delete_existing(&self, key: &str) -> Result<bool> {
        Ok(self.objects.write().await.remove(key).is_some())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_list_respects_prefix_boundaries() {
        let store = MemoryStorage::new();
        for key in ["flat/a/1", "flat/a/2", "flat/ab/1", "latest/a/1"] {
            store.put(key, Bytes::from_static(b"x"), None).await.unwrap();
        }
        let keys: Vec<_> = store
            .list("flat/a/")
            .await
            .unwrap()
            .into_iter()
            .map(|o| o.key)
            .collect();
        assert_eq!(keys, vec!["flat/a/1", "flat/a/2"]);
    }

    #[tokio::test]
    async fn test_copy_refreshes_timestamp() {
        let store = MemoryStorage::new();
        store.put("a", Bytes::from_static(b"x"), None).await.unwrap();
        let old = DateTime::from_timestamp(0, 0).unwrap();
        store.set_last_modified("a", old).await.unwrap();

        store.copy("a", "b").await.unwrap();
        let b = store.head("b").await.unwrap().unwrap();
        assert!(b.last_modified > old);
        assert!(store.get("missing").await.is_err());
    }
}
