//! Every cached data package, optionally narrowed to one name.

use anyhow::Result;
use cumulus_common::metadata::DataPackageRecord;

use super::load_catalog;
use crate::storage::BlobStore;

pub async fn list(store: &dyn BlobStore, name: Option<&str>) -> Result<Vec<DataPackageRecord>> {
    let mut records = load_catalog(store).await?;
    if let Some(name) = name {
        records.retain(|r| r.name == name);
    }
    Ok(records)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::super::fixtures::record;
    use super::*;
    use crate::storage::{write_json, MemoryStorage};
    use cumulus_common::metadata::DATA_PACKAGES_KEY;

    #[tokio::test]
    async fn test_list_filters_by_name() {
        let store = MemoryStorage::new();
        assert!(list(&store, None).await.unwrap().is_empty());

        write_json(
            &store,
            DATA_PACKAGES_KEY,
            &vec![record("core__a__099", "a"), record("core__b__099", "b")],
        )
        .await
        .unwrap();

        let filtered = list(&store, Some("b")).await.unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].id, "core__b__099");
        assert_eq!(list(&store, None).await.unwrap().len(), 2);
    }
}
