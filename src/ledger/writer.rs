//! Append-only ledger writer.
//!
//! Both sinks sit behind one mutex, so an entry's JSON line and its TSV
//! projection are written as a unit and two lines can never interleave,
//! no matter how many tasks share the writer.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use super::entry::{tsv_line, LedgerEntry};
use super::LedgerError;

struct Sinks {
    jsonl: BufWriter<File>,
    tsv: Option<BufWriter<File>>,
    since_flush: u64,
    written: u64,
}

impl Sinks {
    fn flush(&mut self) -> std::io::Result<()> {
        self.jsonl.flush()?;
        if let Some(tsv) = self.tsv.as_mut() {
            tsv.flush()?;
        }
        self.since_flush = 0;
        Ok(())
    }
}

/// Appends [`LedgerEntry`] lines to a JSONL file and, for `ok` entries, a
/// TSV projection.  Buffers are flushed every `flush_every` entries and on
/// drop.
pub struct LedgerWriter {
    path: PathBuf,
    flush_every: u64,
    sinks: Mutex<Sinks>,
}

impl LedgerWriter {
    /// Open (creating if needed) `jsonl` and optionally `tsv` in append
    /// mode.  Missing parent directories are created.
    pub fn open(jsonl: &Path, tsv: Option<&Path>, flush_every: u64) -> Result<Self, LedgerError> {
        let jsonl_file = open_append(jsonl)?;
        let tsv_file = tsv.map(open_append).transpose()?;
        log::info!(
            "ledger: appending to {}{}",
            jsonl.display(),
            tsv.map(|p| format!(" and {}", p.display())).unwrap_or_default()
        );

        Ok(Self {
            path: jsonl.to_path_buf(),
            flush_every: flush_every.max(1),
            sinks: Mutex::new(Sinks {
                jsonl: BufWriter::new(jsonl_file),
                tsv: tsv_file.map(BufWriter::new),
                since_flush: 0,
                written: 0,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry.
    pub fn append(&self, entry: &LedgerEntry) -> Result<(), LedgerError> {
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');

        let mut sinks = self.sinks.lock().unwrap_or_else(PoisonError::into_inner);
        sinks
            .jsonl
            .write_all(line.as_bytes())
            .map_err(LedgerError::Write)?;
        if let (Some(tsv), Some(caption)) = (sinks.tsv.as_mut(), entry.caption.as_deref()) {
            if entry.is_ok() {
                writeln!(tsv, "{}", tsv_line(entry.id, caption)).map_err(LedgerError::Write)?;
            }
        }

        sinks.written += 1;
        sinks.since_flush += 1;
        if sinks.since_flush >= self.flush_every {
            sinks.flush().map_err(LedgerError::Write)?;
        }
        Ok(())
    }

    pub fn flush(&self) -> Result<(), LedgerError> {
        self.sinks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .flush()
            .map_err(LedgerError::Write)
    }

    /// Entries appended through this writer.
    pub fn written(&self) -> u64 {
        self.sinks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .written
    }
}

impl Drop for LedgerWriter {
    fn drop(&mut self) {
        let sinks = self.sinks.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = sinks.flush() {
            log::error!("ledger: final flush of {} failed: {e}", self.path.display());
        }
    }
}

fn open_append(path: &Path) -> Result<File, LedgerError> {
    let open_err = |source| LedgerError::Open {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(open_err)?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(path)
        .map_err(open_err)?;
    if ends_mid_line(&mut file).map_err(open_err)? {
        log::warn!("ledger: {} ends in a torn line; terminating it", path.display());
        file.write_all(b"\n").map_err(open_err)?;
    }
    Ok(file)
}

/// `true` when a non-empty file does not end with a newline, as left behind
/// by a crash in the middle of a write.
fn ends_mid_line(file: &mut File) -> std::io::Result<bool> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::Start(len - 1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
