//! Random-access audio store.
//!
//! # Architecture
//!
//! ```text
//!  metadata.parquet ──read_metadata──▶ Vec<MetadataRow>
//!                                          │ build_index (sort by shard, offset)
//!                                          ▼
//!                                      ShardIndex  (id → ShardRecord)
//!                                          │
//!  arkive_0.bin ┐                          │ fetch(record)
//!  arkive_1.bin ├─▶ ShardStore (mmap) ◀────┘
//!  arkive_N.bin ┘        │
//!                        ▼
//!                   &[u8] view, borrowed from the store
//! ```
//!
//! The index is rebuilt from the metadata table at every start; it is never
//! persisted.  The store is opened once, shared behind an `Arc`, and read
//! without locking because the mapped regions never change during a run.

pub mod metadata;
pub mod record;
pub mod shard;

use std::path::PathBuf;

use thiserror::Error;

// ---------------------------------------------------------------------------
// Public re-exports
// ---------------------------------------------------------------------------

pub use metadata::read_metadata;
pub use record::{build_index, MetadataRow, ShardIndex, ShardRecord};
pub use shard::{discover_shards, ShardStore};

// ---------------------------------------------------------------------------
// StoreError
// ---------------------------------------------------------------------------

/// Errors from opening or reading the shard set.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No shard file matched, or an empty path list was given.
    #[error("no shard files matching {pattern:?} in {dir}")]
    NoShards { dir: PathBuf, pattern: String },

    #[error("cannot open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot map {path}: {source}")]
    Map {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The record names a shard that is not part of the mapped set.
    #[error("record {id} names shard {shard} but only {shard_count} shards are mapped")]
    UnknownShard { id: u64, shard: u32, shard_count: usize },

    /// The record's byte range runs past the end of its shard.
    #[error("record {id} range {offset}+{size} exceeds shard {shard} length {shard_len}")]
    OutOfBounds {
        id: u64,
        shard: u32,
        offset: u64,
        size: u64,
        shard_len: u64,
    },
}

impl StoreError {
    /// `true` when the index and the shard files disagree.
    pub fn is_corrupt_index(&self) -> bool {
        matches!(self, StoreError::UnknownShard { .. } | StoreError::OutOfBounds { .. })
    }
}

// ---------------------------------------------------------------------------
// IndexError
// ---------------------------------------------------------------------------

/// Errors from reading the metadata table or building the index.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("metadata table not found: {0}")]
    MetadataNotFound(PathBuf),

    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("metadata table has no {0:?} column")]
    MissingColumn(&'static str),

    #[error("column {column:?} has unsupported type {found}")]
    ColumnType {
        column: &'static str,
        found: arrow::datatypes::DataType,
    },

    #[error("column {column:?} is null at row {row}")]
    NullValue { column: &'static str, row: usize },

    #[error("invalid metadata row {row}: {reason}")]
    InvalidRow { row: usize, reason: String },
}
