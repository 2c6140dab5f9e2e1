//! Parquet sink for depth records
//!
//! Converts record slices to Arrow `RecordBatch`es and writes them either
//! through a long-lived [`IncrementalWriter`] (one row group per append) or
//! as a complete single-shot file. Files are always created with
//! `create_new`, so an existing file is never truncated or appended to.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{
    ArrayRef, Float64Array, Int32Array, StringArray, TimestampMicrosecondArray,
    TimestampMillisecondArray, TimestampNanosecondArray,
};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;
use parquet::file::properties::WriterProperties;
use serde::{Deserialize, Serialize};

use super::record::Record;
use crate::clock::TimestampUnit;
use crate::error::RecorderError;

pub const PARQUET_EXT: &str = "parquet";
const TIMESTAMP_TZ: &str = "UTC";

// =============================================================================
// Compression
// =============================================================================

/// Parquet compression codec
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    /// No compression
    None,
    /// Snappy compression (fast, moderate ratio)
    Snappy,
    /// LZ4 compression (very fast, lower ratio)
    Lz4,
    /// Zstd compression (slower, best ratio)
    #[default]
    Zstd,
}

impl Compression {
    pub fn to_parquet(self) -> parquet::basic::Compression {
        match self {
            Self::None => parquet::basic::Compression::UNCOMPRESSED,
            Self::Snappy => parquet::basic::Compression::SNAPPY,
            Self::Lz4 => parquet::basic::Compression::LZ4,
            Self::Zstd => parquet::basic::Compression::ZSTD(Default::default()),
        }
    }

    fn writer_properties(self) -> WriterProperties {
        WriterProperties::builder()
            .set_compression(self.to_parquet())
            .build()
    }
}

// =============================================================================
// Schema
// =============================================================================

/// `{timestamp, instrument_id, side, price, quantity}`
pub fn depth_schema(unit: TimestampUnit) -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new(
            "timestamp",
            DataType::Timestamp(unit.to_arrow(), Some(TIMESTAMP_TZ.into())),
            false,
        ),
        Field::new("instrument_id", DataType::Utf8, false),
        Field::new("side", DataType::Utf8, false),
        Field::new("price", DataType::Float64, false),
        Field::new("quantity", DataType::Int32, false),
    ]))
}

pub fn records_to_batch(
    records: &[Record],
    schema: &SchemaRef,
    unit: TimestampUnit,
) -> Result<RecordBatch, ArrowError> {
    let timestamps: Vec<i64> = records.iter().map(|r| r.timestamp).collect();
    let timestamp: ArrayRef = match unit {
        TimestampUnit::Nanos => {
            Arc::new(TimestampNanosecondArray::from(timestamps).with_timezone(TIMESTAMP_TZ))
        }
        TimestampUnit::Micros => {
            Arc::new(TimestampMicrosecondArray::from(timestamps).with_timezone(TIMESTAMP_TZ))
        }
        TimestampUnit::Millis => {
            Arc::new(TimestampMillisecondArray::from(timestamps).with_timezone(TIMESTAMP_TZ))
        }
    };

    let instrument: ArrayRef = Arc::new(StringArray::from_iter_values(
        records.iter().map(|r| r.instrument_id.as_str()),
    ));
    let side: ArrayRef = Arc::new(StringArray::from_iter_values(
        records.iter().map(|r| r.side.as_str()),
    ));
    let price: ArrayRef = Arc::new(Float64Array::from_iter_values(records.iter().map(|r| r.price)));
    let quantity: ArrayRef =
        Arc::new(Int32Array::from_iter_values(records.iter().map(|r| r.quantity)));

    RecordBatch::try_new(
        Arc::clone(schema),
        vec![timestamp, instrument, side, price, quantity],
    )
}

// =============================================================================
// File naming
// =============================================================================

/// First of `stem.parquet`, `stem.1.parquet`, `stem.2.parquet`, … not on disk.
pub fn next_free_path(dir: &Path, stem: &str) -> PathBuf {
    let first = dir.join(format!("{}.{}", stem, PARQUET_EXT));
    if !first.exists() {
        return first;
    }
    let mut part = 1u32;
    loop {
        let candidate = dir.join(format!("{}.{}.{}", stem, part, PARQUET_EXT));
        if !candidate.exists() {
            return candidate;
        }
        part += 1;
    }
}

fn create_new_file(path: &Path) -> Result<File, RecorderError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            RecorderError::Write(format!("create directory {}: {}", parent.display(), e))
        })?;
    }
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| RecorderError::Write(format!("create {}: {}", path.display(), e)))
}

// =============================================================================
// Writers
// =============================================================================

/// A Parquet file kept open across flush ticks.
pub struct IncrementalWriter {
    path: PathBuf,
    writer: ArrowWriter<File>,
    rows: u64,
}

impl IncrementalWriter {
    /// Create a new file at `path`; fails if it already exists.
    pub fn create(
        path: &Path,
        schema: SchemaRef,
        compression: Compression,
    ) -> Result<Self, RecorderError> {
        let file = create_new_file(path)?;
        let writer = ArrowWriter::try_new(file, schema, Some(compression.writer_properties()))?;
        Ok(Self {
            path: path.to_path_buf(),
            writer,
            rows: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    /// Write one batch and flush it to the file as its own row group.
    pub fn append(&mut self, batch: &RecordBatch) -> Result<(), RecorderError> {
        self.writer.write(batch)?;
        self.writer.flush()?;
        self.rows += batch.num_rows() as u64;
        Ok(())
    }

    /// Write the footer and close the file. Returns total rows written.
    pub fn close(self) -> Result<u64, RecorderError> {
        self.writer.close()?;
        Ok(self.rows)
    }
}

/// Write `batch` as a complete new file at `path`.
pub fn write_file(
    path: &Path,
    batch: &RecordBatch,
    compression: Compression,
) -> Result<u64, RecorderError> {
    let file = create_new_file(path)?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(compression.writer_properties()))?;
    writer.write(batch)?;
    writer.close()?;
    Ok(batch.num_rows() as u64)
}

/// Row count from a Parquet file's footer.
pub fn count_rows(path: &Path) -> Result<i64, RecorderError> {
    use parquet::file::reader::{FileReader, SerializedFileReader};

    let file = File::open(path)?;
    let reader = SerializedFileReader::new(file)?;
    Ok(reader.metadata().file_metadata().num_rows())
}
