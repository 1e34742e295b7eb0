pub mod get;
pub mod list;

use anyhow::Result;
use cumulus_common::metadata::{DataPackageRecord, DATA_PACKAGES_KEY};

use crate::storage::{read_json, BlobStore};

pub use get::get;
pub use list::list;

/// The cached catalog, empty before the first cache build.
pub async fn load_catalog(store: &dyn BlobStore) -> Result<Vec<DataPackageRecord>> {
    Ok(read_json(store, DATA_PACKAGES_KEY).await?.unwrap_or_default())
}
