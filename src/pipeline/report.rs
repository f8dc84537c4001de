//! Human-readable checkpoint lines and the end-of-run report.

use std::time::Duration;

use super::tracker::ThroughputSnapshot;

/// Reference corpus size used for the "hours for N h of audio" projection.
pub const REFERENCE_AUDIO_HOURS: f64 = 960.0;

/// Projections computed from the tracker at the end of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Projection {
    /// Hours to process the whole id range at the observed item rate.
    pub range_hours: Option<f64>,
    /// Hours to process [`REFERENCE_AUDIO_HOURS`] of audio at the observed RTF.
    pub reference_hours: Option<f64>,
}

// ---------------------------------------------------------------------------
// RunSummary
// ---------------------------------------------------------------------------

/// Outcome of one [`Scheduler::run`](super::Scheduler::run).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    /// Ids in the clamped range.
    pub range_len: u64,
    /// Ids dispatchable at the start of the run.
    pub planned: u64,
    pub already_done: u64,
    pub exhausted: u64,
    pub ok: u64,
    pub failed: u64,
    /// Ctrl-C stopped dispatch before the plan was drained.
    pub interrupted: bool,
    pub snapshot: Option<ThroughputSnapshot>,
    pub projection: Projection,
}

impl RunSummary {
    pub fn processed(&self) -> u64 {
        self.ok + self.failed
    }

    pub fn nothing_to_process(&self) -> bool {
        self.planned == 0
    }

    /// Planned ids that never got a ledger entry.
    pub fn undispatched(&self) -> u64 {
        self.planned.saturating_sub(self.processed())
    }

    pub fn render(&self) -> String {
        let rule = "=".repeat(60);
        let mut out = String::new();
        out.push_str(&rule);
        out.push('\n');

        if self.nothing_to_process() {
            out.push_str("Nothing to process.\n");
            out.push_str(&format!(
                "Range: {} ids ({} done, {} out of retries)\n",
                self.range_len, self.already_done, self.exhausted
            ));
            out.push_str(&rule);
            out.push('\n');
            return out;
        }

        out.push_str(if self.interrupted {
            "RUN INTERRUPTED\n"
        } else {
            "RUN COMPLETE\n"
        });
        out.push_str(&format!(
            "Processed: {} of {} planned (ok: {}, fail: {})\n",
            self.processed(),
            self.planned,
            self.ok,
            self.failed
        ));
        if self.interrupted {
            out.push_str(&format!(
                "Not dispatched: {} (picked up by the next run)\n",
                self.undispatched()
            ));
        }
        out.push_str(&format!(
            "Skipped: {} already done, {} out of retries\n",
            self.already_done, self.exhausted
        ));

        if let Some(snap) = &self.snapshot {
            out.push_str(&format!("Elapsed: {}\n", format_duration(snap.elapsed)));
            out.push_str(&format!(
                "Throughput: {:.2} items/s ({:.0} items/h)\n",
                snap.items_per_second,
                snap.items_per_hour()
            ));
            if let Some(rtf) = snap.real_time_factor {
                out.push_str(&format!(
                    "Audio: {:.2} h estimated from {} sampled clips, RTF {rtf:.1}x\n",
                    snap.total_audio_hours(),
                    snap.samples_with_duration
                ));
            }
        }
        if let Some(hours) = self.projection.range_hours {
            out.push_str(&format!(
                "Est. for full range ({} ids): {hours:.2} h\n",
                self.range_len
            ));
        }
        if let Some(hours) = self.projection.reference_hours {
            out.push_str(&format!(
                "Est. for {REFERENCE_AUDIO_HOURS:.0} h of audio: {hours:.1} h\n"
            ));
        }

        out.push_str(&rule);
        out.push('\n');
        out
    }
}

// ---------------------------------------------------------------------------
// Checkpoint line
// ---------------------------------------------------------------------------

/// One-line progress report emitted at every checkpoint boundary.
pub fn checkpoint_line(
    done: u64,
    planned: u64,
    ok: u64,
    failed: u64,
    snapshot: Option<&ThroughputSnapshot>,
) -> String {
    let mut line = format!("[checkpoint] {done}/{planned} (ok {ok}, fail {failed})");
    if let Some(snap) = snapshot {
        line.push_str(&format!(
            " | {:.2} items/s, {:.0}/h",
            snap.items_per_second,
            snap.items_per_hour()
        ));
        if let Some(rtf) = snap.real_time_factor {
            line.push_str(&format!(" | RTF {rtf:.1}x"));
        }
        if let Some(eta) = snap.eta(planned.saturating_sub(done)) {
            line.push_str(&format!(" | ETA {}", format_duration(eta)));
        }
    }
    line
}

/// Minutes below an hour, hours below a day, days beyond.
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs_f64();
    let hours = secs / 3600.0;
    if secs < 60.0 {
        format!("{secs:.0} s")
    } else if hours < 1.0 {
        format!("{:.0} min", secs / 60.0)
    } else if hours < 24.0 {
        format!("{hours:.1} h")
    } else {
        format!("{:.1} days ({hours:.1} h)", hours / 24.0)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
