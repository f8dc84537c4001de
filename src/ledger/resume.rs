//! Ledger replay and residual work computation.
//!
//! The ledger is scanned oldest line first.  An `ok` line marks its id done
//! for good: later `fail` lines for that id are ignored, so the outcome does
//! not depend on how retries of the same id were ordered in the file.  A
//! `fail` line sets the id's retry count to its `retry_attempt`, or to the
//! previous count plus one when the field is missing.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufRead, BufReader, ErrorKind};
use std::ops::Range;
use std::path::Path;

use serde::Deserialize;

use super::entry::Status;
use super::LedgerError;

/// The subset of a ledger line that replay needs.
#[derive(Debug, Deserialize)]
struct ReplayLine {
    #[serde(alias = "idx")]
    id: u64,
    status: Status,
    #[serde(default)]
    retry_attempt: Option<u32>,
}

// ---------------------------------------------------------------------------
// ResumeState
// ---------------------------------------------------------------------------

/// Which ids are done and how often the others have failed.
#[derive(Debug, Clone, Default)]
pub struct ResumeState {
    done: HashSet<u64>,
    retry_count: HashMap<u64, u32>,
    lines: u64,
    skipped_lines: u64,
}

impl ResumeState {
    /// Replay a ledger from `reader`.
    ///
    /// Lines that are not valid UTF-8 JSON, lack an id, or carry an unknown
    /// status are counted in [`skipped_lines`](Self::skipped_lines) and
    /// otherwise ignored.  Blank lines are not counted at all.
    pub fn replay<R: BufRead>(mut reader: R) -> Result<Self, LedgerError> {
        let mut state = Self::default();
        let mut buf = Vec::new();
        let mut line_no: u64 = 0;

        loop {
            buf.clear();
            let n = reader.read_until(b'\n', &mut buf).map_err(LedgerError::Read)?;
            if n == 0 {
                break;
            }
            line_no += 1;
            if buf.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match serde_json::from_slice::<ReplayLine>(&buf) {
                Ok(line) => state.apply(line),
                Err(e) => {
                    state.skipped_lines += 1;
                    log::warn!("ledger: skipping line {line_no}: {e}");
                }
            }
        }
        Ok(state)
    }

    /// Replay the ledger at `path`; a missing file is an empty ledger.
    pub fn load(path: &Path) -> Result<Self, LedgerError> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                log::info!("ledger: {} not found, starting fresh", path.display());
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(LedgerError::Open {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        let state = Self::replay(BufReader::new(file))?;
        log::info!(
            "ledger: replayed {} lines from {} ({} done, {} with failures, {} skipped)",
            state.lines,
            path.display(),
            state.done_count(),
            state.retry_count.len(),
            state.skipped_lines
        );
        Ok(state)
    }

    fn apply(&mut self, line: ReplayLine) {
        self.lines += 1;
        match line.status {
            Status::Ok => {
                self.done.insert(line.id);
                self.retry_count.remove(&line.id);
            }
            Status::Fail => {
                if self.done.contains(&line.id) {
                    return;
                }
                let count = self.retry_count.entry(line.id).or_insert(0);
                *count = line.retry_attempt.unwrap_or(*count + 1);
            }
        }
    }

    pub fn is_done(&self, id: u64) -> bool {
        self.done.contains(&id)
    }

    /// Failed attempts recorded for `id`; zero for unseen or done ids.
    pub fn retry_count(&self, id: u64) -> u32 {
        self.retry_count.get(&id).copied().unwrap_or(0)
    }

    /// Attempt number a new try of `id` should carry.
    pub fn next_attempt(&self, id: u64) -> u32 {
        self.retry_count(id) + 1
    }

    pub fn done_count(&self) -> usize {
        self.done.len()
    }

    /// Parsed ledger lines (excluding skipped and blank ones).
    pub fn lines(&self) -> u64 {
        self.lines
    }

    pub fn skipped_lines(&self) -> u64 {
        self.skipped_lines
    }

    /// Ids in `range` that are neither done nor out of retries.
    pub fn residual(&self, range: Range<u64>, max_retries: u32) -> WorkPlan {
        let mut plan = WorkPlan {
            range: range.clone(),
            ..WorkPlan::default()
        };
        for id in range {
            if self.is_done(id) {
                plan.already_done += 1;
            } else if self.retry_count(id) >= max_retries {
                plan.exhausted += 1;
            } else {
                plan.items.push(WorkItem {
                    id,
                    attempt: self.next_attempt(id),
                });
            }
        }
        plan
    }
}

// ---------------------------------------------------------------------------
// WorkPlan
// ---------------------------------------------------------------------------

/// One id to dispatch, with the attempt number fixed at planning time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkItem {
    pub id: u64,
    pub attempt: u32,
}

/// Residual work set for one run, in ascending id order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkPlan {
    pub range: Range<u64>,
    pub items: Vec<WorkItem>,
    /// Ids in range skipped because they already succeeded.
    pub already_done: u64,
    /// Ids in range skipped because they hit the retry limit.
    pub exhausted: u64,
}

impl WorkPlan {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn ids(&self) -> Vec<u64> {
        self.items.iter().map(|item| item.id).collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
