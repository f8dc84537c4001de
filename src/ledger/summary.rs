//! Offline ledger statistics for the `summary` subcommand.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use super::entry::LedgerEntry;
use super::LedgerError;

/// Errors are grouped by this many leading characters.
const ERROR_KEY_CHARS: usize = 100;
/// Error groups listed by [`LedgerSummary::render`].
const TOP_ERRORS: usize = 5;

#[derive(Debug, Clone, Default)]
pub struct LedgerSummary {
    pub lines: u64,
    pub unparseable: u64,
    pub unique_ids: usize,
    pub ok_ids: usize,
    /// Ids with at least one failure and no success.
    pub failed_only_ids: usize,
    /// Entry count per `retry_attempt` value.
    pub attempts: BTreeMap<u32, u64>,
    /// Most frequent error prefixes, most common first.
    pub top_errors: Vec<(String, u64)>,
    pub distinct_errors: usize,
    pub processing_seconds: f64,
    pub audio_seconds: f64,
    pub entries_with_duration: u64,
}

impl LedgerSummary {
    pub fn scan<R: BufRead>(reader: R) -> Result<Self, LedgerError> {
        let mut summary = Self::default();
        let mut seen: HashSet<u64> = HashSet::new();
        let mut ok: HashSet<u64> = HashSet::new();
        let mut errors: HashMap<String, u64> = HashMap::new();

        for line in reader.split(b'\n') {
            let line = line.map_err(LedgerError::Read)?;
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            let Ok(entry) = serde_json::from_slice::<LedgerEntry>(&line) else {
                summary.unparseable += 1;
                continue;
            };
            summary.lines += 1;
            seen.insert(entry.id);
            *summary.attempts.entry(entry.retry_attempt).or_insert(0) += 1;

            if entry.is_ok() {
                ok.insert(entry.id);
            } else {
                let message = entry.error.as_deref().unwrap_or("unknown error");
                let key: String = message.chars().take(ERROR_KEY_CHARS).collect();
                *errors.entry(key).or_insert(0) += 1;
            }

            if entry.processing_time > 0.0 {
                summary.processing_seconds += entry.processing_time;
            }
            if let Some(d) = entry.audio_duration.filter(|d| *d > 0.0) {
                summary.audio_seconds += d;
                summary.entries_with_duration += 1;
            }
        }

        summary.unique_ids = seen.len();
        summary.ok_ids = ok.len();
        summary.failed_only_ids = seen.len() - ok.len();
        summary.distinct_errors = errors.len();

        let mut ranked: Vec<(String, u64)> = errors.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(TOP_ERRORS);
        summary.top_errors = ranked;
        Ok(summary)
    }

    pub fn load(path: &Path) -> Result<Self, LedgerError> {
        let file = File::open(path).map_err(|source| LedgerError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        Self::scan(BufReader::new(file))
    }

    /// Mean seconds per attempt, if any processing time was recorded.
    pub fn mean_processing_seconds(&self) -> Option<f64> {
        (self.lines > 0 && self.processing_seconds > 0.0)
            .then(|| self.processing_seconds / self.lines as f64)
    }

    /// Fraction of `total` ids that have succeeded.
    pub fn progress(&self, total: u64) -> Option<f64> {
        (total > 0).then(|| self.ok_ids as f64 / total as f64)
    }

    pub fn render(&self, total: Option<u64>) -> String {
        let pct = |n: usize| 100.0 * n as f64 / self.unique_ids.max(1) as f64;
        let mut out = String::new();

        out.push_str(&format!("Unique ids: {}\n", self.unique_ids));
        out.push_str(&format!("  Successful: {} ({:.1}%)\n", self.ok_ids, pct(self.ok_ids)));
        out.push_str(&format!(
            "  Failed: {} ({:.1}%)\n",
            self.failed_only_ids,
            pct(self.failed_only_ids)
        ));
        out.push_str(&format!("Ledger lines: {} (includes retries)\n", self.lines));
        if self.unparseable > 0 {
            out.push_str(&format!("Unparseable lines: {}\n", self.unparseable));
        }

        if let Some(total) = total {
            if let Some(frac) = self.progress(total) {
                out.push_str(&format!(
                    "Progress: {}/{} ({:.1}%), {} remaining\n",
                    self.ok_ids,
                    total,
                    frac * 100.0,
                    total.saturating_sub(self.ok_ids as u64)
                ));
            }
        }

        if !self.attempts.is_empty() {
            out.push_str("Attempts:\n");
            for (attempt, count) in &self.attempts {
                out.push_str(&format!("  #{attempt}: {count}\n"));
            }
        }

        if let Some(mean) = self.mean_processing_seconds() {
            let rate = 1.0 / mean;
            out.push_str(&format!(
                "Throughput: {mean:.2}s/item, {rate:.2} items/s, {:.0} items/h (per worker)\n",
                rate * 3600.0
            ));
        }
        if self.entries_with_duration > 0 {
            out.push_str(&format!(
                "Audio with duration: {:.2} h over {} entries\n",
                self.audio_seconds / 3600.0,
                self.entries_with_duration
            ));
        }

        if !self.top_errors.is_empty() {
            out.push_str(&format!("Errors ({} distinct):\n", self.distinct_errors));
            for (i, (message, count)) in self.top_errors.iter().enumerate() {
                out.push_str(&format!("  {}. [{count}x] {message}\n", i + 1));
            }
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
