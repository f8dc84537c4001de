//! Durable per-attempt ledger.
//!
//! # Architecture
//!
//! ```text
//!  workers ──LedgerEntry──▶ mpsc ──▶ LedgerWriter ──▶ captions.jsonl (+ .tsv)
//!                                                         │
//!                        next run: ResumeState::load ◀────┘
//!                                        │
//!                                        ▼
//!                        residual(range, max_retries) ──▶ WorkPlan
//! ```
//!
//! The JSONL file is the only durable state of a job.  Every attempt adds
//! one line; nothing is rewritten in place.  [`ResumeState`] replays it at
//! startup to decide what still needs doing, and the offline tools
//! ([`merge_ledgers`], [`LedgerSummary`]) read the same format.

pub mod entry;
pub mod merge;
pub mod resume;
pub mod summary;
pub mod writer;

use std::path::PathBuf;

use thiserror::Error;

// ---------------------------------------------------------------------------
// Public re-exports
// ---------------------------------------------------------------------------

pub use entry::{truncate_error, tsv_line, LedgerEntry, Status, TRUNCATION_MARKER};
pub use merge::{merge_ledgers, MergeReport};
pub use resume::{ResumeState, WorkItem, WorkPlan};
pub use summary::LedgerSummary;
pub use writer::LedgerWriter;

// ---------------------------------------------------------------------------
// LedgerError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("cannot open ledger file {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("ledger read failed: {0}")]
    Read(#[source] std::io::Error),

    #[error("ledger write failed: {0}")]
    Write(#[source] std::io::Error),

    #[error("cannot serialise ledger entry: {0}")]
    Serialize(#[from] serde_json::Error),
}
