//! Reading the columnar metadata table (`metadata.parquet`).
//!
//! Only the five index columns are projected; everything else in the table
//! (source paths, transcripts, …) is left on disk.  Integer columns of any
//! width are cast to `Int64` so producers are free to pick their own types.

use std::fs::File;
use std::path::Path;

use arrow::array::{Array, ArrayRef, Int64Array};
use arrow::compute::cast;
use arrow::datatypes::DataType;
use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ProjectionMask;

use super::{IndexError, MetadataRow};

pub const COL_SHARD: &str = "bin_index";
pub const COL_OFFSET: &str = "start_byte_offset";
pub const COL_SIZE: &str = "file_size_bytes";
pub const COL_SAMPLE_RATE: &str = "sample_rate";
pub const COL_CHANNELS: &str = "channels";

const REQUIRED: [&str; 3] = [COL_SHARD, COL_OFFSET, COL_SIZE];
const OPTIONAL: [&str; 2] = [COL_SAMPLE_RATE, COL_CHANNELS];

/// Read every row of the metadata table at `path`.
///
/// # Errors
///
/// - [`IndexError::MetadataNotFound`]: `path` does not exist.
/// - [`IndexError::MissingColumn`]: a required column is absent.
/// - [`IndexError::NullValue`]: a required cell is null.
/// - [`IndexError::Parquet`] / [`IndexError::Arrow`]: unreadable file.
pub fn read_metadata(path: &Path) -> Result<Vec<MetadataRow>, IndexError> {
    if !path.exists() {
        return Err(IndexError::MetadataNotFound(path.to_path_buf()));
    }
    let file = File::open(path).map_err(|source| IndexError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let builder = ParquetRecordBatchReaderBuilder::try_new(file)?;
    let schema = builder.schema().clone();

    let mut roots = Vec::with_capacity(REQUIRED.len() + OPTIONAL.len());
    for name in REQUIRED {
        let idx = schema
            .index_of(name)
            .map_err(|_| IndexError::MissingColumn(name))?;
        roots.push(idx);
    }
    for name in OPTIONAL {
        if let Ok(idx) = schema.index_of(name) {
            roots.push(idx);
        }
    }

    let mask = ProjectionMask::roots(builder.parquet_schema(), roots);
    let reader = builder.with_projection(mask).build()?;

    let mut rows = Vec::new();
    let mut row_base = 0usize;
    for batch in reader {
        let batch = batch?;
        append_batch(&batch, row_base, &mut rows)?;
        row_base += batch.num_rows();
    }

    log::debug!("metadata: {} rows from {}", rows.len(), path.display());
    Ok(rows)
}

fn append_batch(
    batch: &RecordBatch,
    row_base: usize,
    out: &mut Vec<MetadataRow>,
) -> Result<(), IndexError> {
    let shard = required_column(batch, COL_SHARD)?;
    let offset = required_column(batch, COL_OFFSET)?;
    let size = required_column(batch, COL_SIZE)?;
    let sample_rate = optional_column(batch, COL_SAMPLE_RATE)?;
    let channels = optional_column(batch, COL_CHANNELS)?;

    for i in 0..batch.num_rows() {
        let row = row_base + i;
        out.push(MetadataRow {
            shard_index: required_value(&shard, COL_SHARD, i, row)?,
            byte_offset: required_value(&offset, COL_OFFSET, i, row)?,
            byte_size: required_value(&size, COL_SIZE, i, row)?,
            sample_rate: sample_rate.as_ref().and_then(|c| optional_value(c, i)),
            channels: channels.as_ref().and_then(|c| optional_value(c, i)),
        });
    }
    Ok(())
}

fn required_column(batch: &RecordBatch, name: &'static str) -> Result<Int64Array, IndexError> {
    let column = batch
        .column_by_name(name)
        .ok_or(IndexError::MissingColumn(name))?;
    as_int64(column, name)
}

fn optional_column(
    batch: &RecordBatch,
    name: &'static str,
) -> Result<Option<Int64Array>, IndexError> {
    batch
        .column_by_name(name)
        .map(|column| as_int64(column, name))
        .transpose()
}

fn as_int64(column: &ArrayRef, name: &'static str) -> Result<Int64Array, IndexError> {
    let casted = cast(column, &DataType::Int64)?;
    casted
        .as_any()
        .downcast_ref::<Int64Array>()
        .cloned()
        .ok_or_else(|| IndexError::ColumnType {
            column: name,
            found: column.data_type().clone(),
        })
}

fn required_value(
    column: &Int64Array,
    name: &'static str,
    i: usize,
    row: usize,
) -> Result<i64, IndexError> {
    if column.is_null(i) {
        return Err(IndexError::NullValue { column: name, row });
    }
    Ok(column.value(i))
}

fn optional_value(column: &Int64Array, i: usize) -> Option<i64> {
    (!column.is_null(i)).then(|| column.value(i))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
