//! Merge several ledgers into one canonical, id-sorted ledger.
//!
//! Per id the first `ok` entry wins; an id that never succeeded keeps its
//! last attempt.  Inputs are read in the order given.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, ErrorKind, Write};
use std::path::Path;

use super::entry::{tsv_line, LedgerEntry};
use super::LedgerError;

/// Totals reported after a merge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub files_read: usize,
    pub files_missing: usize,
    pub entries_read: u64,
    pub unparseable: u64,
    pub unique_ids: usize,
    pub ok: usize,
    pub failed: usize,
    pub duplicates_resolved: u64,
}

impl MergeReport {
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "Files merged: {} ({} missing)\n",
            self.files_read, self.files_missing
        ));
        out.push_str(&format!("Entries read: {}\n", self.entries_read));
        out.push_str(&format!("Unique ids: {}\n", self.unique_ids));
        out.push_str(&format!("  Successful: {}\n", self.ok));
        out.push_str(&format!("  Failed: {}\n", self.failed));
        out.push_str(&format!("Duplicates resolved: {}\n", self.duplicates_resolved));
        if self.unparseable > 0 {
            out.push_str(&format!("Unparseable lines skipped: {}\n", self.unparseable));
        }
        out
    }
}

/// Merge `inputs` into `output` (and optionally a TSV projection).
///
/// Missing input files are skipped with a warning; unparseable lines are
/// counted and skipped.  Output files are overwritten.
pub fn merge_ledgers<P: AsRef<Path>>(
    inputs: &[P],
    output: &Path,
    tsv: Option<&Path>,
) -> Result<MergeReport, LedgerError> {
    let mut report = MergeReport::default();
    let mut merged: BTreeMap<u64, LedgerEntry> = BTreeMap::new();

    for input in inputs {
        let path = input.as_ref();
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                log::warn!("merge: {} does not exist, skipping", path.display());
                report.files_missing += 1;
                continue;
            }
            Err(source) => {
                return Err(LedgerError::Open {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        report.files_read += 1;

        for (n, line) in BufReader::new(file).split(b'\n').enumerate() {
            let line = line.map_err(LedgerError::Read)?;
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            let entry: LedgerEntry = match serde_json::from_slice(&line) {
                Ok(entry) => entry,
                Err(e) => {
                    log::warn!("merge: {}:{}: {e}", path.display(), n + 1);
                    report.unparseable += 1;
                    continue;
                }
            };
            report.entries_read += 1;

            match merged.get(&entry.id) {
                None => {
                    merged.insert(entry.id, entry);
                }
                Some(kept) => {
                    report.duplicates_resolved += 1;
                    if !kept.is_ok() {
                        merged.insert(entry.id, entry);
                    }
                }
            }
        }
    }

    write_merged(&merged, output, tsv)?;

    report.unique_ids = merged.len();
    report.ok = merged.values().filter(|e| e.is_ok()).count();
    report.failed = report.unique_ids - report.ok;
    log::info!(
        "merge: wrote {} ids to {} ({} ok, {} failed)",
        report.unique_ids,
        output.display(),
        report.ok,
        report.failed
    );
    Ok(report)
}

fn write_merged(
    merged: &BTreeMap<u64, LedgerEntry>,
    output: &Path,
    tsv: Option<&Path>,
) -> Result<(), LedgerError> {
    let mut jsonl = BufWriter::new(create(output)?);
    for entry in merged.values() {
        serde_json::to_writer(&mut jsonl, entry)?;
        jsonl.write_all(b"\n").map_err(LedgerError::Write)?;
    }
    jsonl.flush().map_err(LedgerError::Write)?;

    if let Some(tsv_path) = tsv {
        let mut out = BufWriter::new(create(tsv_path)?);
        for entry in merged.values().filter(|e| e.is_ok()) {
            let caption = entry.caption.as_deref().unwrap_or("");
            writeln!(out, "{}", tsv_line(entry.id, caption)).map_err(LedgerError::Write)?;
        }
        out.flush().map_err(LedgerError::Write)?;
    }
    Ok(())
}

fn create(path: &Path) -> Result<File, LedgerError> {
    let open_err = |source| LedgerError::Open {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(open_err)?;
    }
    File::create(path).map_err(open_err)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
