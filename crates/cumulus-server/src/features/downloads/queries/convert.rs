//! `/from-parquet` conversion.

use bytes::Bytes;
use cumulus_common::keys::Subbucket;
use serde::Deserialize;

use crate::pipeline::frame::{batches_to_delimited, batches_to_json, read_batches};
use crate::pipeline::PipelineError;

/// Subbuckets `/from-parquet` may read from.
pub const CONVERTIBLE: [Subbucket; 3] = [Subbucket::Aggregates, Subbucket::Flat, Subbucket::LastValid];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Csv,
    Tsv,
    Json,
}

impl ExportFormat {
    pub fn content_type(self) -> &'static str {
        match self {
            ExportFormat::Csv => "text/csv",
            ExportFormat::Tsv => "text/tab-separated-values",
            ExportFormat::Json => "application/json",
        }
    }
}

/// Whether `key` is a parquet inside one of the [`CONVERTIBLE`] subbuckets.
pub fn is_convertible(key: &str) -> bool {
    key.ends_with(".parquet")
        && !key.split('/').any(|segment| segment == ".." || segment.is_empty())
        && CONVERTIBLE
            .iter()
            .any(|s| key.starts_with(&s.prefix()))
}

/// Re-encode a parquet file as delimited text or a JSON array.
pub fn convert(data: Bytes, format: ExportFormat) -> Result<Bytes, PipelineError> {
    let (schema, batches) = read_batches(data)?;
    match format {
        ExportFormat::Csv => batches_to_delimited(schema, &batches, b','),
        ExportFormat::Tsv => batches_to_delimited(schema, &batches, b'\t'),
        ExportFormat::Json => batches_to_json(&batches),
    }
}
