//! Chart queries over one aggregate table.

use arrow_csv::reader::Format;
use cumulus_common::keys::{encode, sibling, Subbucket};
use cumulus_common::metadata::{lookup, ColumnTypes, ColumnTypesEntry, COLUMN_TYPES_KEY};
use cumulus_common::PackageMetadata;
use serde::Serialize;
use serde_json::{Map, Number, Value};

use super::filters::{compile, CompiledFilter, FilterTarget};
use crate::catalog::postgres::quote_ident;
use crate::catalog::{QueryResult, SqlCatalog};
use crate::error::{AppError, AppResult};
use crate::pipeline::powerset::COUNT_COLUMN;
use crate::storage::{read_json, BlobStore};

#[derive(Debug, Clone, Default)]
pub struct ChartRequest {
    pub column: String,
    pub stratifier: Option<String>,
    /// One entry per filter group.
    pub filters: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChartSeries {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stratifier: Option<Value>,
    /// `[value, count]` pairs.
    pub rows: Vec<(Value, Value)>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartData {
    pub column: String,
    pub filters: Vec<String>,
    pub row_count: usize,
    pub total_count: Number,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stratifier: Option<String>,
    /// Total per stratifier value, keyed by its rendered form.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub counts: Option<Map<String, Value>>,
    pub data: Vec<ChartSeries>,
}

/// Column names from the first line of the aggregate's CSV sibling.
pub async fn read_header(store: &dyn BlobStore, csv_key: &str) -> anyhow::Result<Vec<String>> {
    let bytes = store.get(csv_key).await?;
    let (schema, _) = Format::default()
        .with_header(true)
        .infer_schema(&bytes[..], Some(0))?;
    Ok(schema
        .fields()
        .iter()
        .map(|f| f.name().trim().to_string())
        .filter(|c| !c.is_empty())
        .collect())
}

/// Render the grouped count query.
///
/// Every dimension that is neither charted nor filtered is pinned to NULL so
/// the powerset row holding the subtotal is selected.
pub fn build_sql(
    database: &str,
    table: &str,
    columns: &[String],
    request: &ChartRequest,
    filter: &CompiledFilter,
) -> String {
    let column = quote_ident(&request.column);
    let count = quote_ident(COUNT_COLUMN);
    let mut selected = vec![column.clone()];
    let mut conditions = vec![format!("{column} IS NOT NULL")];
    if let Some(stratifier) = &request.stratifier {
        let stratifier = quote_ident(stratifier);
        conditions.push(format!("{stratifier} IS NOT NULL"));
        selected.push(stratifier);
    }
    for other in columns.iter().filter(|c| {
        c.as_str() != COUNT_COLUMN
            && **c != request.column
            && Some(c.as_str()) != request.stratifier.as_deref()
            && !filter.columns.contains(c.as_str())
    }) {
        conditions.push(format!("{} IS NULL", quote_ident(other)));
    }
    if let Some(predicate) = filter.predicate() {
        conditions.push(predicate);
    }

    let group = selected.join(", ");
    format!(
        "SELECT {group}, CAST(SUM({count}) AS BIGINT) AS {count} FROM {}.{} WHERE {} GROUP BY {group} ORDER BY {group}",
        quote_ident(database),
        quote_ident(table),
        conditions.join(" AND ")
    )
}

fn render_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn add_counts(a: &Value, b: &Value) -> Value {
    if let Some(sum) = a.as_i64().zip(b.as_i64()).and_then(|(x, y)| x.checked_add(y)) {
        return Value::from(sum);
    }
    Number::from_f64(a.as_f64().unwrap_or(0.0) + b.as_f64().unwrap_or(0.0))
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

/// Shape catalog rows (`column[, stratifier], count`) into the response body.
pub fn shape(request: &ChartRequest, result: QueryResult) -> ChartData {
    let row_count = result.rows.len();
    let mut total = Value::from(0);
    let mut data: Vec<ChartSeries> = Vec::new();
    let mut counts = Map::new();

    for row in result.rows {
        let mut cells = row.into_iter();
        let value = cells.next().unwrap_or(Value::Null);
        let (stratum, count) = if request.stratifier.is_some() {
            let stratum = cells.next().unwrap_or(Value::Null);
            (Some(stratum), cells.next().unwrap_or(Value::Null))
        } else {
            (None, cells.next().unwrap_or(Value::Null))
        };
        total = add_counts(&total, &count);

        if let Some(stratum) = &stratum {
            let key = render_key(stratum);
            let running = counts.get(&key).cloned().unwrap_or(Value::from(0));
            counts.insert(key, add_counts(&running, &count));
        }
        match data.iter_mut().find(|s| s.stratifier == stratum) {
            Some(series) => series.rows.push((value, count)),
            None => data.push(ChartSeries {
                stratifier: stratum,
                rows: vec![(value, count)],
            }),
        }
    }

    ChartData {
        column: request.column.clone(),
        filters: request.filters.clone(),
        row_count,
        total_count: match total {
            Value::Number(n) => n,
            _ => Number::from(0),
        },
        stratifier: request.stratifier.clone(),
        counts: request.stratifier.as_ref().map(|_| counts),
        data,
    }
}

/// Run a chart query against a cube's catalog table.
pub async fn chart_data(
    store: &dyn BlobStore,
    catalog: &dyn SqlCatalog,
    package_id: &str,
    request: &ChartRequest,
) -> AppResult<ChartData> {
    let meta = PackageMetadata::from_package_id(package_id)
        .map_err(|_| AppError::NotFound(format!("data package {package_id}")))?;
    if meta.site.is_some() {
        return Err(AppError::BadRequest(format!("{package_id} is not a cube")));
    }
    let data_package = meta.data_package()?.to_string();
    let aggregate = encode(
        Subbucket::Aggregates,
        &PackageMetadata::aggregate(&meta.study, &data_package, &meta.version),
    )?;
    let csv_key = sibling(&aggregate, "csv");
    if !store.exists(&csv_key).await? {
        return Err(AppError::NotFound(format!("data package {package_id}")));
    }

    let columns = read_header(store, &csv_key).await?;
    for requested in std::iter::once(&request.column).chain(request.stratifier.as_ref()) {
        if requested == COUNT_COLUMN || !columns.contains(requested) {
            return Err(AppError::BadRequest(format!("unknown column '{requested}'")));
        }
    }

    let column_types: Option<ColumnTypes> = read_json::<Value>(store, COLUMN_TYPES_KEY)
        .await?
        .and_then(|doc| {
            lookup(&doc, &[&meta.study, &data_package, package_id])
                .and_then(|entry| serde_json::from_value::<ColumnTypesEntry>(entry.clone()).ok())
        })
        .map(|entry| entry.columns);

    let filter = compile(
        &request.filters,
        &FilterTarget {
            dialect: catalog.dialect(),
            columns: &columns,
            column_types: column_types.as_ref(),
            selected: &request.column,
        },
    )?;
    let sql = build_sql(catalog.database(), package_id, &columns, request, &filter);
    tracing::debug!(package_id, %sql, "Running chart query");
    let result = catalog.query(&sql).await?;
    Ok(shape(request, result))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::catalog::SqlDialect;
    use crate::storage::MemoryStorage;
    use bytes::Bytes;
    use serde_json::json;

    fn columns() -> Vec<String> {
        ["cnt", "sex", "age", "site"].into_iter().map(String::from).collect()
    }

    fn compiled(groups: &[&str], columns: &[String], selected: &str) -> CompiledFilter {
        let groups: Vec<String> = groups.iter().map(|g| g.to_string()).collect();
        compile(
            &groups,
            &FilterTarget {
                dialect: SqlDialect::Athena,
                columns,
                column_types: None,
                selected,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_sql_pins_unused_dimensions() {
        let columns = columns();
        let request = ChartRequest {
            column: "sex".into(),
            ..Default::default()
        };
        let sql = build_sql("cumulus", "core__count__099", &columns, &request, &CompiledFilter::default());
        assert_eq!(
            sql,
            "SELECT \"sex\", CAST(SUM(\"cnt\") AS BIGINT) AS \"cnt\" \
             FROM \"cumulus\".\"core__count__099\" \
             WHERE \"sex\" IS NOT NULL AND \"age\" IS NULL AND \"site\" IS NULL \
             GROUP BY \"sex\" ORDER BY \"sex\""
        );
    }

    #[test]
    fn test_sql_with_stratifier_and_filter() {
        let columns = columns();
        let request = ChartRequest {
            column: "sex".into(),
            stratifier: Some("site".into()),
            filters: vec!["age:gte:18".into()],
        };
        let filter = compiled(&["age:gte:18"], &columns, "sex");
        let sql = build_sql("cumulus", "core__count__099", &columns, &request, &filter);
        assert!(sql.starts_with("SELECT \"sex\", \"site\", CAST"));
        assert!(sql.contains("\"site\" IS NOT NULL"));
        assert!(!sql.contains("\"age\" IS NULL"));
        assert!(sql.contains("AND ((\"age\" >= 18))"));
        assert!(sql.ends_with("GROUP BY \"sex\", \"site\" ORDER BY \"sex\", \"site\""));
    }

    #[test]
    fn test_shape_groups_by_stratifier() {
        let request = ChartRequest {
            column: "sex".into(),
            stratifier: Some("site".into()),
            filters: vec![],
        };
        let result = QueryResult {
            columns: vec!["sex".into(), "site".into(), "cnt".into()],
            rows: vec![
                vec![json!("F"), json!("site_a"), json!(5)],
                vec![json!("M"), json!("site_a"), json!(10)],
                vec![json!("M"), json!("site_b"), json!(3)],
            ],
        };
        let body = serde_json::to_value(shape(&request, result)).unwrap();
        assert_eq!(body["rowCount"], json!(3));
        assert_eq!(body["totalCount"], json!(18));
        assert_eq!(body["counts"], json!({"site_a": 15, "site_b": 3}));
        assert_eq!(body["data"][0]["stratifier"], json!("site_a"));
        assert_eq!(body["data"][0]["rows"], json!([["F", 5], ["M", 10]]));
        assert_eq!(body["data"][1]["rows"], json!([["M", 3]]));
    }

    #[test]
    fn test_shape_without_stratifier_omits_optional_fields() {
        let request = ChartRequest {
            column: "sex".into(),
            ..Default::default()
        };
        let result = QueryResult {
            columns: vec!["sex".into(), "cnt".into()],
            rows: vec![vec![json!("M"), json!(13)]],
        };
        let body = serde_json::to_value(shape(&request, result)).unwrap();
        assert!(body.get("stratifier").is_none());
        assert!(body.get("counts").is_none());
        assert_eq!(body["data"], json!([{"rows": [["M", 13]]}]));
    }

    #[tokio::test]
    async fn test_read_header() {
        let store = MemoryStorage::new();
        store
            .put("a.csv", Bytes::from_static(b"cnt,sex,\"age\"\n10,M,\n"), None)
            .await
            .unwrap();
        assert_eq!(read_header(&store, "a.csv").await.unwrap(), vec!["cnt", "sex", "age"]);

        store
            .put("b.csv", Bytes::from_static(b"cnt,\"dx, primary\",site\n"), None)
            .await
            .unwrap();
        assert_eq!(
            read_header(&store, "b.csv").await.unwrap(),
            vec!["cnt", "dx, primary", "site"]
        );
    }

    #[test]
    fn test_large_counts_fall_back_to_float() {
        assert_eq!(add_counts(&json!(2), &json!(3)), json!(5));
        let sum = add_counts(&json!(i64::MAX), &json!(1));
        assert_eq!(sum.as_f64(), Some(i64::MAX as f64 + 1.0));
        assert!(sum.as_i64().is_none());
    }
}
