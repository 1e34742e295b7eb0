//! Canonical metadata documents and the partial updates that target them.

use crate::error::Result;
use crate::keys::SEPARATOR;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Map, Number, Value};
use std::fmt;
use std::str::FromStr;

pub const TRANSACTIONS_KEY: &str = "metadata/transactions.json";
pub const STUDY_PERIODS_KEY: &str = "metadata/study_periods.json";
pub const COLUMN_TYPES_KEY: &str = "metadata/column_types.json";
pub const DATA_PACKAGES_KEY: &str = "cache/data_packages.json";

/// Folder holding one in-flight transaction document per `(site, study)`.
pub const UPLOAD_TRANSACTIONS_PREFIX: &str = "metadata/transactions/";

pub const TRANSACTION_FORMAT_VERSION: u32 = 2;
pub const STUDY_PERIOD_FORMAT_VERSION: u32 = 2;
pub const COLUMN_TYPES_FORMAT_VERSION: u32 = 2;

pub fn upload_transaction_key(site: &str, study: &str) -> String {
    format!("{UPLOAD_TRANSACTIONS_PREFIX}{site}{SEPARATOR}{study}.json")
}

/// `transactions[site][study][dp][package_id]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionEntry {
    pub transaction_format_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_upload: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_data_update: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_aggregation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for TransactionEntry {
    fn default() -> Self {
        Self {
            transaction_format_version: TRANSACTION_FORMAT_VERSION,
            last_upload: None,
            last_data_update: None,
            last_aggregation: None,
            last_error: None,
            deleted: None,
            extra: Map::new(),
        }
    }
}

/// `study_periods[site][study][package_id]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudyPeriodEntry {
    pub study_period_format_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub earliest_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_data_update: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for StudyPeriodEntry {
    fn default() -> Self {
        Self {
            study_period_format_version: STUDY_PERIOD_FORMAT_VERSION,
            earliest_date: None,
            latest_date: None,
            last_data_update: None,
            extra: Map::new(),
        }
    }
}

/// Dashboard-facing type tag of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Year,
    Month,
    Week,
    Day,
    Integer,
    Float,
    Double,
    Boolean,
    String,
}

impl ColumnType {
    pub fn as_str(self) -> &'static str {
        match self {
            ColumnType::Year => "year",
            ColumnType::Month => "month",
            ColumnType::Week => "week",
            ColumnType::Day => "day",
            ColumnType::Integer => "integer",
            ColumnType::Float => "float",
            ColumnType::Double => "double",
            ColumnType::Boolean => "boolean",
            ColumnType::String => "string",
        }
    }

    /// Date granularities
    pub fn is_date(self) -> bool {
        matches!(
            self,
            ColumnType::Year | ColumnType::Month | ColumnType::Week | ColumnType::Day
        )
    }

    pub fn is_numeric(self) -> bool {
        matches!(
            self,
            ColumnType::Integer | ColumnType::Float | ColumnType::Double
        )
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ColumnType {
    type Err = crate::CumulusError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "year" => ColumnType::Year,
            "month" => ColumnType::Month,
            "week" => ColumnType::Week,
            "day" => ColumnType::Day,
            "integer" => ColumnType::Integer,
            "float" => ColumnType::Float,
            "double" => ColumnType::Double,
            "boolean" => ColumnType::Boolean,
            "string" => ColumnType::String,
            other => {
                return Err(crate::CumulusError::InvalidFilter(format!(
                    "unknown column type '{other}'"
                )))
            }
        })
    }
}

/// Ordered `{column: type}` map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnTypes(pub Vec<(String, ColumnType)>);

impl ColumnTypes {
    pub fn get(&self, column: &str) -> Option<ColumnType> {
        self.0
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, tag)| *tag)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(name, _)| name.as_str())
    }

    pub fn tags(&self) -> impl Iterator<Item = ColumnType> + '_ {
        self.0.iter().map(|(_, tag)| *tag)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Serialize for ColumnTypes {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, tag) in &self.0 {
            map.serialize_entry(name, tag)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for ColumnTypes {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        // serde_json's map keeps insertion order, so the column order survives.
        let map = Map::<String, Value>::deserialize(deserializer)?;
        map.into_iter()
            .map(|(name, tag)| {
                serde_json::from_value::<ColumnType>(tag)
                    .map(|tag| (name, tag))
                    .map_err(serde::de::Error::custom)
            })
            .collect::<std::result::Result<Vec<_>, _>>()
            .map(ColumnTypes)
    }
}

/// `column_types[study][dp or dp__site][package_id]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnTypesEntry {
    pub column_types_format_version: u32,
    #[serde(default)]
    pub columns: ColumnTypes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_data_update: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<Number>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for ColumnTypesEntry {
    fn default() -> Self {
        Self {
            column_types_format_version: COLUMN_TYPES_FORMAT_VERSION,
            columns: ColumnTypes::default(),
            last_data_update: None,
            s3_path: None,
            total: None,
            extra: Map::new(),
        }
    }
}

/// One row of `cache/data_packages.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPackageRecord {
    pub id: String,
    pub study: String,
    pub name: String,
    pub version: String,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub package_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site: Option<String>,
    pub columns: ColumnTypes,
    pub total: Option<Number>,
    pub last_data_update: Option<String>,
    pub s3_path: Option<String>,
}

/// In-flight manifest of one zip upload, removed once every child has landed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadTransaction {
    pub id: String,
    pub uploaded_at: String,
    pub version: String,
    #[serde(default)]
    pub cube: Vec<String>,
    #[serde(default)]
    pub flat: Vec<String>,
    #[serde(default)]
    pub annotated_cube: Vec<String>,
}

/// A partial update addressed to one canonical document, as carried on the
/// metadata queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataDelta {
    pub key: String,
    pub updates: Value,
}

impl MetadataDelta {
    pub fn transaction(
        site: &str,
        study: &str,
        data_package: &str,
        package_id: &str,
        entry: &TransactionEntry,
    ) -> Result<Self> {
        Ok(Self {
            key: TRANSACTIONS_KEY.to_string(),
            updates: json!({ site: { study: { data_package: { package_id: serde_json::to_value(entry)? } } } }),
        })
    }

    pub fn study_period(
        site: &str,
        study: &str,
        package_id: &str,
        entry: &StudyPeriodEntry,
    ) -> Result<Self> {
        Ok(Self {
            key: STUDY_PERIODS_KEY.to_string(),
            updates: json!({ site: { study: { package_id: serde_json::to_value(entry)? } } }),
        })
    }

    /// `package_key` is the data package name, or `dp__site` for flat tables.
    pub fn column_types(
        study: &str,
        package_key: &str,
        package_id: &str,
        entry: &ColumnTypesEntry,
    ) -> Result<Self> {
        Ok(Self {
            key: COLUMN_TYPES_KEY.to_string(),
            updates: json!({ study: { package_key: { package_id: serde_json::to_value(entry)? } } }),
        })
    }
}

/// Walk nested objects by key.
pub fn lookup<'a>(document: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter()
        .try_fold(document, |node, segment| node.as_object()?.get(*segment))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_delta_is_partial() {
        let entry = TransactionEntry {
            last_upload: Some("2026-01-01T00:00:00+00:00".into()),
            ..Default::default()
        };
        let delta =
            MetadataDelta::transaction("site_a", "study", "dp", "study__dp__099", &entry).unwrap();
        assert_eq!(delta.key, TRANSACTIONS_KEY);
        assert_eq!(
            delta.updates,
            json!({"site_a": {"study": {"dp": {"study__dp__099": {
                "transaction_format_version": 2,
                "last_upload": "2026-01-01T00:00:00+00:00"
            }}}}})
        );
    }

    #[test]
    fn test_column_types_keep_order() {
        let raw = r#"{"column_types_format_version":2,"columns":{"cnt":"integer","sex":"string","visit_month":"month"},"total":18}"#;
        let entry: ColumnTypesEntry = serde_json::from_str(raw).unwrap();
        assert_eq!(
            entry.columns.names().collect::<Vec<_>>(),
            vec!["cnt", "sex", "visit_month"]
        );
        assert_eq!(entry.columns.get("visit_month"), Some(ColumnType::Month));
        assert_eq!(serde_json::to_string(&entry).unwrap(), raw);
    }

    #[test]
    fn test_unknown_fields_pass_through() {
        let raw = json!({"transaction_format_version": 2, "legacy_flag": true});
        let entry: TransactionEntry = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(entry.extra.get("legacy_flag"), Some(&json!(true)));
        assert_eq!(serde_json::to_value(&entry).unwrap(), raw);
    }

    #[test]
    fn test_lookup() {
        let doc = json!({"a": {"b": {"c": 1}}});
        assert_eq!(lookup(&doc, &["a", "b", "c"]), Some(&json!(1)));
        assert_eq!(lookup(&doc, &["a", "x"]), None);
        assert_eq!(upload_transaction_key("site_a", "core"), "metadata/transactions/site_a__core.json");
    }
}
