use anyhow::Result;
use cumulus_common::metadata::DataPackageRecord;

use super::load_catalog;
use crate::storage::BlobStore;

/// One cached data package by id.
pub async fn get(store: &dyn BlobStore, id: &str) -> Result<Option<DataPackageRecord>> {
    Ok(load_catalog(store).await?.into_iter().find(|r| r.id == id))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::super::fixtures::record;
    use super::*;
    use crate::storage::{write_json, MemoryStorage};
    use cumulus_common::metadata::DATA_PACKAGES_KEY;

    #[tokio::test]
    async fn test_get_by_id() {
        let store = MemoryStorage::new();
        assert!(get(&store, "core__a__099").await.unwrap().is_none());

        write_json(&store, DATA_PACKAGES_KEY, &vec![record("core__a__099", "a")])
            .await
            .unwrap();
        assert_eq!(get(&store, "core__a__099").await.unwrap().unwrap().name, "a");
        assert!(get(&store, "core__c__099").await.unwrap().is_none());
    }
}
