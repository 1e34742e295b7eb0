use anyhow::Result;
use cumulus_common::keys::Subbucket;

use crate::storage::{list_keys, BlobStore};

/// CSV and parquet artifacts under a subbucket.
pub async fn list_artifacts(store: &dyn BlobStore, subbucket: Subbucket) -> Result<Vec<String>> {
    Ok(list_keys(store, &subbucket.prefix())
        .await?
        .into_iter()
        .filter(|k| k.ends_with(".csv") || k.ends_with(".parquet"))
        .collect())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_only_tabular_artifacts_listed() {
        let store = MemoryStorage::new();
        for key in [
            "aggregates/s/s__dp/s__dp__099/s__dp__aggregate.csv",
            "aggregates/s/s__dp/s__dp__099/s__dp__aggregate.parquet",
            "aggregates/s/s__dp/s__dp__099/notes.txt",
            "last_valid/s/s__dp/site_a/099/s__dp.cube.parquet",
        ] {
            store.put(key, Bytes::from_static(b"x"), None).await.unwrap();
        }
        let aggregates = list_artifacts(&store, Subbucket::Aggregates).await.unwrap();
        assert_eq!(aggregates.len(), 2);
        assert!(aggregates.iter().all(|k| k.starts_with("aggregates/")));
    }
}
