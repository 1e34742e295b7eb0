//! Parquet tables and a row view over them.
//!
//! [`read_table`] decodes a parquet file into one record batch whose columns
//! are widened to one of six logical kinds. Merging stays columnar; workers
//! that inspect individual values take a [`Frame`] of [`Cell`]s instead.

use arrow::array::{
    Array, ArrayRef, AsArray, BooleanArray, Date32Array, Float64Array, Int64Array, StringArray,
    TimestampMicrosecondArray,
};
use arrow::compute::{cast, concat_batches};
use arrow::datatypes::{
    DataType, Date32Type, Field, Float64Type, Int64Type, Schema, SchemaRef, TimeUnit,
    TimestampMicrosecondType,
};
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use serde_json::{json, Value};
use std::sync::Arc;

use super::PipelineError;

/// Days between 0001-01-01 and 1970-01-01.
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

/// Logical column type after widening.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnKind {
    Int,
    Float,
    Bool,
    Str,
    Date,
    Timestamp,
}

impl ColumnKind {
    pub fn from_data_type(data_type: &DataType) -> Self {
        match data_type {
            DataType::Int8
            | DataType::Int16
            | DataType::Int32
            | DataType::Int64
            | DataType::UInt8
            | DataType::UInt16
            | DataType::UInt32
            | DataType::UInt64 => ColumnKind::Int,
            DataType::Float16
            | DataType::Float32
            | DataType::Float64
            | DataType::Decimal128(_, _)
            | DataType::Decimal256(_, _) => ColumnKind::Float,
            DataType::Boolean => ColumnKind::Bool,
            DataType::Date32 | DataType::Date64 => ColumnKind::Date,
            DataType::Timestamp(_, _) => ColumnKind::Timestamp,
            DataType::Dictionary(_, value) => ColumnKind::from_data_type(value),
            _ => ColumnKind::Str,
        }
    }

    pub fn arrow_type(self) -> DataType {
        match self {
            ColumnKind::Int => DataType::Int64,
            ColumnKind::Float => DataType::Float64,
            ColumnKind::Bool => DataType::Boolean,
            ColumnKind::Str => DataType::Utf8,
            ColumnKind::Date => DataType::Date32,
            ColumnKind::Timestamp => DataType::Timestamp(TimeUnit::Microsecond, None),
        }
    }

    /// Smallest kind both sides convert into without loss of meaning.
    pub fn unify(self, other: ColumnKind) -> ColumnKind {
        use ColumnKind::*;
        match (self, other) {
            (a, b) if a == b => a,
            (Int, Float) | (Float, Int) => Float,
            (Date, Timestamp) | (Timestamp, Date) => Timestamp,
            _ => Str,
        }
    }
}

/// One value. Floats compare by bit pattern.
#[derive(Debug, Clone)]
pub enum Cell {
    Null,
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    /// Days since the Unix epoch
    Date(i32),
    /// Microseconds since the Unix epoch
    Timestamp(i64),
}

impl PartialEq for Cell {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Cell::Null, Cell::Null) => true,
            (Cell::Int(a), Cell::Int(b)) => a == b,
            (Cell::Float(a), Cell::Float(b)) => a.to_bits() == b.to_bits(),
            (Cell::Bool(a), Cell::Bool(b)) => a == b,
            (Cell::Str(a), Cell::Str(b)) => a == b,
            (Cell::Date(a), Cell::Date(b)) => a == b,
            (Cell::Timestamp(a), Cell::Timestamp(b)) => a == b,
            _ => false,
        }
    }
}

impl Cell {
    pub fn is_null(&self) -> bool {
        matches!(self, Cell::Null)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Cell::Int(v) => Some(*v as f64),
            Cell::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Cell::Date(days) => {
                NaiveDate::from_num_days_from_ce_opt(days.checked_add(UNIX_EPOCH_DAYS_FROM_CE)?)
            }
            _ => None,
        }
    }

    pub fn as_datetime(&self) -> Option<NaiveDateTime> {
        match self {
            Cell::Timestamp(micros) => DateTime::from_timestamp_micros(*micros).map(|d| d.naive_utc()),
            _ => None,
        }
    }

    /// Text form, `None` for NULL. Dates render as ISO-8601.
    pub fn render(&self) -> Option<String> {
        match self {
            Cell::Null => None,
            Cell::Int(v) => Some(v.to_string()),
            Cell::Float(v) => Some(v.to_string()),
            Cell::Bool(v) => Some(v.to_string()),
            Cell::Str(v) => Some(v.clone()),
            Cell::Date(_) => self.as_date().map(|d| d.format("%Y-%m-%d").to_string()),
            Cell::Timestamp(_) => self
                .as_datetime()
                .map(|d| d.format("%Y-%m-%dT%H:%M:%S%.f").to_string()),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Cell::Null => Value::Null,
            Cell::Int(v) => json!(v),
            Cell::Float(v) => json!(v),
            Cell::Bool(v) => json!(v),
            other => other.render().map(Value::String).unwrap_or(Value::Null),
        }
    }

    /// JSON number for numeric cells.
    pub fn to_number(&self) -> Option<serde_json::Number> {
        match self {
            Cell::Int(v) => Some((*v).into()),
            Cell::Float(v) => serde_json::Number::from_f64(*v),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub kind: ColumnKind,
}

impl Column {
    pub fn new(name: impl Into<String>, kind: ColumnKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Frame {
    pub columns: Vec<Column>,
    pub rows: Vec<Vec<Cell>>,
}

impl Frame {
    pub fn new(columns: Vec<Column>, rows: Vec<Vec<Cell>>) -> Self {
        Self { columns, rows }
    }

    pub fn from_parquet(data: Bytes) -> Result<Self, PipelineError> {
        Self::from_batch(&read_table(data)?)
    }

    pub fn from_batch(batch: &RecordBatch) -> Result<Self, PipelineError> {
        let columns = columns_of(&batch.schema());
        let arrays = columns
            .iter()
            .zip(batch.columns())
            .map(|(column, array)| {
                let array = cast(array, &column.kind.arrow_type())?;
                Ok(cells(&array, column.kind))
            })
            .collect::<Result<Vec<_>, PipelineError>>()?;

        let rows = (0..batch.num_rows())
            .map(|row| arrays.iter().map(|col| col[row].clone()).collect())
            .collect();
        Ok(Self { columns, rows })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    /// Value at `row` in the named column.
    pub fn value(&self, row: usize, column: &str) -> Option<&Cell> {
        let index = self.column_index(column)?;
        self.rows.get(row)?.get(index)
    }

    pub fn to_record_batch(&self) -> Result<RecordBatch, PipelineError> {
        let fields: Vec<Field> = self
            .columns
            .iter()
            .map(|c| Field::new(c.name.as_str(), c.kind.arrow_type(), true))
            .collect();
        let schema = Arc::new(Schema::new(fields));

        let arrays: Vec<ArrayRef> = self
            .columns
            .iter()
            .enumerate()
            .map(|(i, column)| self.column_array(i, column.kind))
            .collect();

        Ok(RecordBatch::try_new(schema, arrays)?)
    }

    fn column_array(&self, index: usize, kind: ColumnKind) -> ArrayRef {
        let values = self.rows.iter().map(|row| &row[index]);
        match kind {
            ColumnKind::Int => Arc::new(
                values
                    .map(|c| match c {
                        Cell::Int(v) => Some(*v),
                        _ => None,
                    })
                    .collect::<Int64Array>(),
            ),
            ColumnKind::Float => {
                Arc::new(values.map(|c| c.as_f64()).collect::<Float64Array>())
            }
            ColumnKind::Bool => Arc::new(
                values
                    .map(|c| match c {
                        Cell::Bool(v) => Some(*v),
                        _ => None,
                    })
                    .collect::<BooleanArray>(),
            ),
            ColumnKind::Str => Arc::new(values.map(|c| c.render()).collect::<StringArray>()),
            ColumnKind::Date => Arc::new(
                values
                    .map(|c| match c {
                        Cell::Date(v) => Some(*v),
                        _ => None,
                    })
                    .collect::<Date32Array>(),
            ),
            ColumnKind::Timestamp => Arc::new(
                values
                    .map(|c| match c {
                        Cell::Timestamp(v) => Some(*v),
                        _ => None,
                    })
                    .collect::<TimestampMicrosecondArray>(),
            ),
        }
    }

    pub fn to_parquet(&self) -> Result<Bytes, PipelineError> {
        batch_to_parquet(&self.to_record_batch()?)
    }

    /// CSV with a header row; NULL is an empty field.
    pub fn to_csv(&self) -> Result<Bytes, PipelineError> {
        let batch = self.to_record_batch()?;
        batches_to_delimited(batch.schema(), &[batch], b',')
    }
}

fn cells(array: &ArrayRef, kind: ColumnKind) -> Vec<Cell> {
    let len = array.len();
    match kind {
        ColumnKind::Int => {
            let a = array.as_primitive::<Int64Type>();
            (0..len)
                .map(|i| if a.is_null(i) { Cell::Null } else { Cell::Int(a.value(i)) })
                .collect()
        }
        ColumnKind::Float => {
            let a = array.as_primitive::<Float64Type>();
            (0..len)
                .map(|i| if a.is_null(i) { Cell::Null } else { Cell::Float(a.value(i)) })
                .collect()
        }
        ColumnKind::Bool => {
            let a = array.as_boolean();
            (0..len)
                .map(|i| if a.is_null(i) { Cell::Null } else { Cell::Bool(a.value(i)) })
                .collect()
        }
        ColumnKind::Str => {
            let a = array.as_string::<i32>();
            (0..len)
                .map(|i| {
                    if a.is_null(i) {
                        Cell::Null
                    } else {
                        Cell::Str(a.value(i).to_string())
                    }
                })
                .collect()
        }
        ColumnKind::Date => {
            let a = array.as_primitive::<Date32Type>();
            (0..len)
                .map(|i| if a.is_null(i) { Cell::Null } else { Cell::Date(a.value(i)) })
                .collect()
        }
        ColumnKind::Timestamp => {
            let a = array.as_primitive::<TimestampMicrosecondType>();
            (0..len)
                .map(|i| {
                    if a.is_null(i) {
                        Cell::Null
                    } else {
                        Cell::Timestamp(a.value(i))
                    }
                })
                .collect()
        }
    }
}

/// Logical columns of a widened schema.
pub fn columns_of(schema: &Schema) -> Vec<Column> {
    schema
        .fields()
        .iter()
        .map(|f| Column::new(f.name().clone(), ColumnKind::from_data_type(f.data_type())))
        .collect()
}

/// Cast every column to the arrow type of its logical kind.
pub fn widen(batch: &RecordBatch) -> Result<RecordBatch, PipelineError> {
    let columns = columns_of(&batch.schema());
    let fields: Vec<Field> = columns
        .iter()
        .map(|c| Field::new(c.name.as_str(), c.kind.arrow_type(), true))
        .collect();
    let arrays = columns
        .iter()
        .zip(batch.columns())
        .map(|(column, array)| cast(array, &column.kind.arrow_type()))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)?)
}

/// Decode a parquet file into a single widened batch.
pub fn read_table(data: Bytes) -> Result<RecordBatch, PipelineError> {
    let (schema, batches) = read_batches(data)?;
    widen(&concat_batches(&schema, &batches)?)
}

/// Value of one cell of a widened batch.
pub fn cell_at(batch: &RecordBatch, row: usize, column: &str) -> Option<Cell> {
    let array = batch.column_by_name(column)?;
    if row >= array.len() {
        return None;
    }
    let kind = ColumnKind::from_data_type(array.data_type());
    let value = cast(&array.slice(row, 1), &kind.arrow_type()).ok()?;
    cells(&value, kind).pop()
}

pub fn batch_to_parquet(batch: &RecordBatch) -> Result<Bytes, PipelineError> {
    let mut buffer = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buffer, batch.schema(), None)?;
    writer.write(batch)?;
    writer.close()?;
    Ok(Bytes::from(buffer))
}

/// Decode a parquet file into its schema and record batches.
pub fn read_batches(data: Bytes) -> Result<(SchemaRef, Vec<RecordBatch>), PipelineError> {
    let builder = ParquetRecordBatchReaderBuilder::try_new(data)?;
    let schema = builder.schema().clone();
    let batches = builder.build()?.collect::<Result<Vec<_>, _>>()?;
    Ok((schema, batches))
}

/// Column names of a parquet file without decoding its rows.
pub fn parquet_columns(data: Bytes) -> Result<Vec<String>, PipelineError> {
    let builder = ParquetRecordBatchReaderBuilder::try_new(data)?;
    Ok(builder
        .schema()
        .fields()
        .iter()
        .map(|f| f.name().clone())
        .collect())
}

/// Delimited text with a header row, written even when there are no rows.
pub fn batches_to_delimited(
    schema: SchemaRef,
    batches: &[RecordBatch],
    delimiter: u8,
) -> Result<Bytes, PipelineError> {
    let mut writer = arrow_csv::WriterBuilder::new()
        .with_header(true)
        .with_delimiter(delimiter)
        .build(Vec::new());
    if batches.is_empty() {
        writer.write(&RecordBatch::new_empty(schema))?;
    }
    for batch in batches {
        writer.write(batch)?;
    }
    Ok(Bytes::from(writer.into_inner()))
}

/// A JSON array with one object per row.
pub fn batches_to_json(batches: &[RecordBatch]) -> Result<Bytes, PipelineError> {
    let mut writer = arrow_json::ArrayWriter::new(Vec::new());
    let refs: Vec<&RecordBatch> = batches.iter().collect();
    writer.write_batches(&refs)?;
    writer.finish()?;
    let mut body = writer.into_inner();
    if body.is_empty() {
        body.extend_from_slice(b"[]");
    }
    Ok(Bytes::from(body))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn sample() -> Frame {
        Frame::new(
            vec![
                Column::new("cnt", ColumnKind::Int),
                Column::new("sex", ColumnKind::Str),
                Column::new("admit_month", ColumnKind::Date),
            ],
            vec![
                vec![Cell::Int(10), Cell::Str("M".into()), Cell::Date(18262)],
                vec![Cell::Int(5), Cell::Null, Cell::Null],
            ],
        )
    }

    #[test]
    fn test_parquet_round_trip_keeps_nulls() {
        let frame = sample();
        let decoded = Frame::from_parquet(frame.to_parquet().unwrap()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_narrow_types_widen_on_read() {
        let schema = Arc::new(Schema::new(vec![
            Field::new("cnt", DataType::Int32, false),
            Field::new("ratio", DataType::Float32, true),
        ]));
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(arrow::array::Int32Array::from(vec![3, 4])),
                Arc::new(arrow::array::Float32Array::from(vec![Some(0.5), None])),
            ],
        )
        .unwrap();
        let mut buffer = Vec::new();
        let mut writer = ArrowWriter::try_new(&mut buffer, schema, None).unwrap();
        writer.write(&batch).unwrap();
        writer.close().unwrap();

        let frame = Frame::from_parquet(Bytes::from(buffer)).unwrap();
        assert_eq!(frame.columns[0].kind, ColumnKind::Int);
        assert_eq!(frame.rows[1][0], Cell::Int(4));
        assert_eq!(frame.rows[0][1], Cell::Float(0.5));
        assert!(frame.rows[1][1].is_null());
    }

    #[test]
    fn test_csv_renders_dates_and_empty_nulls() {
        let csv = String::from_utf8(sample().to_csv().unwrap().to_vec()).unwrap();
        let mut lines = csv.lines();
        assert_eq!(lines.next(), Some("cnt,sex,admit_month"));
        assert_eq!(lines.next(), Some("10,M,2020-01-01"));
        assert_eq!(lines.next(), Some("5,,"));
    }

    #[test]
    fn test_read_table_concatenates_and_widens() {
        let schema = Arc::new(Schema::new(vec![Field::new("cnt", DataType::Int32, false)]));
        let mut buffer = Vec::new();
        let mut writer = ArrowWriter::try_new(&mut buffer, schema.clone(), None).unwrap();
        for values in [vec![1, 2], vec![3]] {
            let batch = RecordBatch::try_new(
                schema.clone(),
                vec![Arc::new(arrow::array::Int32Array::from(values))],
            )
            .unwrap();
            writer.write(&batch).unwrap();
            writer.flush().unwrap();
        }
        writer.close().unwrap();

        let table = read_table(Bytes::from(buffer)).unwrap();
        assert_eq!(table.num_rows(), 3);
        assert_eq!(table.schema().field(0).data_type(), &DataType::Int64);
        assert_eq!(cell_at(&table, 2, "cnt"), Some(Cell::Int(3)));
        assert_eq!(cell_at(&table, 3, "cnt"), None);
        assert_eq!(cell_at(&table, 0, "sex"), None);
    }

    #[test]
    fn test_empty_frame_json_is_array() {
        let frame = Frame::new(vec![Column::new("cnt", ColumnKind::Int)], vec![]);
        let batch = frame.to_record_batch().unwrap();
        assert_eq!(batches_to_json(&[batch]).unwrap(), Bytes::from_static(b"[]"));
    }

    #[test]
    fn test_cell_rendering_and_kinds() {
        assert_eq!(Cell::Date(0).render().unwrap(), "1970-01-01");
        assert_eq!(Cell::Timestamp(1_500_000).render().unwrap(), "1970-01-01T00:00:01.500");
        assert_eq!(Cell::Int(7).to_json(), json!(7));
        assert!(Cell::Null.render().is_none());
        assert_eq!(ColumnKind::Int.unify(ColumnKind::Float), ColumnKind::Float);
        assert_eq!(ColumnKind::Date.unify(ColumnKind::Timestamp), ColumnKind::Timestamp);
        assert_eq!(ColumnKind::Bool.unify(ColumnKind::Int), ColumnKind::Str);
    }
}
