//! Powerset merge.
//!
//! Every site upload is added twice: once with `site = NULL` and once with
//! `site = <name>`. Grouping on every other column with NULLs as equal keys
//! then sums counts into cross-site marginals without losing the per-site
//! rows. The running aggregate is a single record batch; grouping keys are
//! arrow row-format encodings of the dimension columns.

use arrow::array::{new_null_array, Array, ArrayRef, AsArray, Float64Array, Int64Array, StringArray, UInt64Array};
use arrow::compute::{cast, concat_batches, lexsort_to_indices, take, SortColumn, SortOptions};
use arrow::datatypes::{DataType, Field, Float64Type, Int64Type, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use arrow::row::{Row, RowConverter, SortField};
use cumulus_common::CumulusError;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::warn;

use super::frame::{columns_of, Column, ColumnKind, Frame};
use super::PipelineError;

pub const COUNT_COLUMN: &str = "cnt";
pub const SITE_COLUMN: &str = "site";

/// Running cross-site aggregate.
#[derive(Debug, Clone, Default)]
pub struct PowersetMerge {
    aggregate: Option<RecordBatch>,
    expected_columns: Option<BTreeSet<String>>,
}

impl PowersetMerge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Column set (without `site`) the first upload must match. Later
    /// uploads are checked against the running aggregate instead.
    pub fn with_expected_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.expected_columns = Some(
            columns
                .into_iter()
                .map(Into::into)
                .filter(|c: &String| c != SITE_COLUMN)
                .collect(),
        );
        self
    }

    pub fn is_empty(&self) -> bool {
        self.aggregate.as_ref().map_or(true, |b| b.num_rows() == 0)
    }

    pub fn batch(&self) -> Option<&RecordBatch> {
        self.aggregate.as_ref()
    }

    pub fn into_batch(self) -> Option<RecordBatch> {
        self.aggregate
    }

    /// Row view of the aggregate.
    pub fn to_frame(&self) -> Result<Frame, PipelineError> {
        match &self.aggregate {
            Some(batch) => Frame::from_batch(batch),
            None => Ok(Frame::default()),
        }
    }

    /// Merge one site's upload, a batch widened by
    /// [`read_table`](super::frame::read_table). On error the aggregate is
    /// left untouched.
    pub fn add_site(
        &mut self,
        upload: RecordBatch,
        site: &str,
        path: &str,
    ) -> Result<(), PipelineError> {
        if upload.num_rows() == 0 {
            return Err(CumulusError::EmptyUpload(path.to_string()).into());
        }
        let upload = without_column(upload, SITE_COLUMN)?;
        let schema = upload.schema();

        let Ok(upload_cnt) = schema.index_of(COUNT_COLUMN) else {
            warn!(path, "Upload has no count column");
            return Err(CumulusError::SchemaDrift(path.to_string()).into());
        };
        let cnt_kind = ColumnKind::from_data_type(schema.field(upload_cnt).data_type());
        if !matches!(cnt_kind, ColumnKind::Int | ColumnKind::Float)
            && !is_all_null(upload.column(upload_cnt))
        {
            warn!(path, kind = ?cnt_kind, "Count column is not numeric");
            return Err(CumulusError::SchemaDrift(path.to_string()).into());
        }

        let incoming: BTreeSet<String> = schema.fields().iter().map(|f| f.name().clone()).collect();
        let reference = match &self.aggregate {
            None => self.expected_columns.clone(),
            Some(aggregate) => Some(
                aggregate
                    .schema()
                    .fields()
                    .iter()
                    .map(|f| f.name().clone())
                    .filter(|name| name != SITE_COLUMN)
                    .collect(),
            ),
        };
        if let Some(reference) = reference {
            if reference != incoming {
                warn!(
                    path,
                    expected = ?reference,
                    found = ?incoming,
                    "Upload columns differ from the aggregate"
                );
                return Err(CumulusError::SchemaDrift(path.to_string()).into());
            }
        }

        let layout = self.layout_for(&schema);
        let site_pos = layout.len() - 1;
        let cnt_pos = layout
            .iter()
            .position(|c| c.name == COUNT_COLUMN)
            .unwrap_or_default();
        // Index into the upload for every layout column but `site`.
        let mapping: Vec<Option<usize>> = layout
            .iter()
            .map(|c| schema.index_of(&c.name).ok())
            .collect();

        let kinds: Vec<ColumnKind> = layout
            .iter()
            .zip(&mapping)
            .enumerate()
            .map(|(j, (column, source))| {
                let Some(i) = source else {
                    return column.kind;
                };
                let upload_kind = ColumnKind::from_data_type(schema.field(*i).data_type());
                match &self.aggregate {
                    None => upload_kind,
                    Some(aggregate) if is_all_null(aggregate.column(j)) => upload_kind,
                    Some(_) if is_all_null(upload.column(*i)) => column.kind,
                    Some(_) => column.kind.unify(upload_kind),
                }
            })
            .collect();
        let merged_schema: SchemaRef = Arc::new(Schema::new(
            layout
                .iter()
                .zip(&kinds)
                .map(|(column, kind)| Field::new(column.name.as_str(), kind.arrow_type(), true))
                .collect::<Vec<_>>(),
        ));

        let mut parts = Vec::with_capacity(3);
        if let Some(aggregate) = &self.aggregate {
            let arrays = aggregate
                .columns()
                .iter()
                .zip(&kinds)
                .map(|(array, kind)| cast(array, &kind.arrow_type()))
                .collect::<Result<Vec<_>, _>>()?;
            parts.push(RecordBatch::try_new(merged_schema.clone(), arrays)?);
        }
        let rows = upload.num_rows();
        let site_values: [ArrayRef; 2] = [
            new_null_array(&DataType::Utf8, rows),
            Arc::new(StringArray::from(vec![site; rows])),
        ];
        for site_value in site_values {
            let arrays = mapping
                .iter()
                .zip(&kinds)
                .map(|(source, kind)| match source {
                    Some(i) => cast(upload.column(*i), &kind.arrow_type()),
                    None => Ok(site_value.clone()),
                })
                .collect::<Result<Vec<_>, _>>()?;
            parts.push(RecordBatch::try_new(merged_schema.clone(), arrays)?);
        }

        let union = concat_batches(&merged_schema, &parts)?;
        let grouped = group_sum(&union, cnt_pos)?;
        self.aggregate = Some(sort_by_count(&grouped, cnt_pos, site_pos)?);
        Ok(())
    }

    /// Column order of the aggregate: `cnt`, the dimensions, then `site`.
    fn layout_for(&self, upload: &Schema) -> Vec<Column> {
        if let Some(aggregate) = &self.aggregate {
            return columns_of(&aggregate.schema());
        }
        let columns = columns_of(upload);
        let mut layout: Vec<Column> = columns
            .iter()
            .filter(|c| c.name == COUNT_COLUMN)
            .cloned()
            .collect();
        layout.extend(columns.into_iter().filter(|c| c.name != COUNT_COLUMN));
        layout.push(Column::new(SITE_COLUMN, ColumnKind::Str));
        layout
    }
}

fn is_all_null(array: &ArrayRef) -> bool {
    array.null_count() == array.len()
}

fn without_column(batch: RecordBatch, name: &str) -> Result<RecordBatch, PipelineError> {
    let schema = batch.schema();
    let keep: Vec<usize> = (0..schema.fields().len())
        .filter(|i| schema.field(*i).name() != name)
        .collect();
    Ok(batch.project(&keep)?)
}

/// Sum `cnt` over rows equal in every other column, keeping first-seen order.
fn group_sum(batch: &RecordBatch, cnt_pos: usize) -> Result<RecordBatch, PipelineError> {
    let keys: Vec<ArrayRef> = batch
        .columns()
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != cnt_pos)
        .map(|(_, array)| Arc::clone(array))
        .collect();
    let converter = RowConverter::new(
        keys.iter()
            .map(|k| SortField::new(k.data_type().clone()))
            .collect(),
    )?;
    let rows = converter.convert_columns(&keys)?;

    let mut index: HashMap<Row<'_>, usize> = HashMap::with_capacity(rows.num_rows());
    let mut first_seen: Vec<u64> = Vec::new();
    let mut group_of: Vec<usize> = Vec::with_capacity(rows.num_rows());
    for (i, row) in rows.iter().enumerate() {
        let next = first_seen.len();
        let group = *index.entry(row).or_insert(next);
        if group == next {
            first_seen.push(i as u64);
        }
        group_of.push(group);
    }

    let counts = sum_groups(batch.column(cnt_pos), &group_of, first_seen.len());
    let first_seen = UInt64Array::from(first_seen);
    let arrays = batch
        .columns()
        .iter()
        .enumerate()
        .map(|(i, array)| {
            if i == cnt_pos {
                Ok(Arc::clone(&counts))
            } else {
                take(array.as_ref(), &first_seen, None)
            }
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(RecordBatch::try_new(batch.schema(), arrays)?)
}

/// Per-group totals. NULL contributes nothing; integers stay integral.
fn sum_groups(counts: &ArrayRef, group_of: &[usize], groups: usize) -> ArrayRef {
    match counts.data_type() {
        DataType::Int64 => {
            let values = counts.as_primitive::<Int64Type>();
            let mut sums: Vec<Option<i64>> = vec![None; groups];
            for (row, group) in group_of.iter().enumerate() {
                if values.is_valid(row) {
                    let value = values.value(row);
                    sums[*group] = Some(sums[*group].map_or(value, |s| s.saturating_add(value)));
                }
            }
            Arc::new(Int64Array::from(sums))
        }
        DataType::Float64 => {
            let values = counts.as_primitive::<Float64Type>();
            let mut sums: Vec<Option<f64>> = vec![None; groups];
            for (row, group) in group_of.iter().enumerate() {
                if values.is_valid(row) {
                    let value = values.value(row);
                    sums[*group] = Some(sums[*group].map_or(value, |s| s + value));
                }
            }
            Arc::new(Float64Array::from(sums))
        }
        other => new_null_array(other, groups),
    }
}

/// Largest count first, then `site` descending with NULL first. Ties keep
/// their grouped order.
fn sort_by_count(
    batch: &RecordBatch,
    cnt_pos: usize,
    site_pos: usize,
) -> Result<RecordBatch, PipelineError> {
    let position: ArrayRef = Arc::new(UInt64Array::from_iter_values(0..batch.num_rows() as u64));
    let indices = lexsort_to_indices(
        &[
            SortColumn {
                values: Arc::clone(batch.column(cnt_pos)),
                options: Some(SortOptions {
                    descending: true,
                    nulls_first: false,
                }),
            },
            SortColumn {
                values: Arc::clone(batch.column(site_pos)),
                options: Some(SortOptions {
                    descending: true,
                    nulls_first: true,
                }),
            },
            SortColumn {
                values: position,
                options: None,
            },
        ],
        None,
    )?;
    let arrays = batch
        .columns()
        .iter()
        .map(|array| take(array.as_ref(), &indices, None))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(RecordBatch::try_new(batch.schema(), arrays)?)
}
