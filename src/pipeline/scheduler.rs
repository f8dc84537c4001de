//! Worker pool that drains a [`WorkPlan`] into the ledger.
//!
//! `N` tokio tasks claim items from a shared cursor over the plan, run one
//! attempt each (fetch → caption → optional duration probe) and send the
//! resulting [`LedgerEntry`] over a bounded channel.  The task that called
//! [`Scheduler::run`] is the only one touching the [`LedgerWriter`]; it
//! also counts outcomes and logs checkpoint lines.
//!
//! Attempts never propagate errors: every failure becomes a `fail` entry.
//! Only setup problems (bad range, unreadable ledger) and ledger write
//! failures end a run with an error.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::mpsc;

use crate::audio::{detect_mime, select_decoder};
use crate::client::{Caption, CaptionError, Captioner, RateLimiter};
use crate::config::{JobConfig, OutputConfig, SchedulerConfig};
use crate::ledger::{
    truncate_error, LedgerEntry, LedgerError, LedgerWriter, ResumeState, WorkItem, WorkPlan,
};
use crate::store::{IndexError, ShardIndex, ShardRecord, ShardStore, StoreError};

use super::report::{checkpoint_line, Projection, RunSummary, REFERENCE_AUDIO_HOURS};
use super::state::ItemState;
use super::tracker::{DurationSampler, ThroughputTracker, Workload};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that end a run.
#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("id range [{start}, {end}) is empty for an index of {len} records")]
    InvalidRange { start: u64, end: u64, len: usize },
}

/// Why a single attempt failed.  Always recorded, never propagated.
#[derive(Debug, Error)]
pub enum AttemptError {
    #[error("id {0} is not in the index")]
    UnknownId(u64),

    #[error(transparent)]
    Fetch(#[from] StoreError),

    #[error(transparent)]
    Caption(#[from] CaptionError),
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Runs one captioning job over a range of the index.
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use batch_captioner::client::ApiCaptioner;
/// use batch_captioner::config::JobConfig;
/// use batch_captioner::pipeline::Scheduler;
/// use batch_captioner::store::{build_index, read_metadata, ShardStore};
///
/// # async fn example() -> anyhow::Result<()> {
/// let config = JobConfig::load()?;
/// let index = build_index(read_metadata(&config.store.metadata_path())?)?;
/// let store = ShardStore::open_dir(
///     &config.store.arkive_dir,
///     &config.store.shard_prefix,
///     &config.store.shard_suffix,
/// )?;
/// let captioner = Arc::new(ApiCaptioner::from_config(&config.endpoint)?);
///
/// let scheduler = Scheduler::new(index, Arc::new(store), captioner, &config)?;
/// let summary = scheduler.run().await?;
/// println!("{}", summary.render());
/// # Ok(())
/// # }
/// ```
pub struct Scheduler {
    index: Arc<ShardIndex>,
    store: Arc<ShardStore>,
    captioner: Arc<dyn Captioner>,
    limiter: Arc<RateLimiter>,
    sampler: Option<Arc<DurationSampler>>,
    config: SchedulerConfig,
    output: OutputConfig,
    backoff: Duration,
    shutdown: Arc<AtomicBool>,
}

impl Scheduler {
    /// Wire a scheduler from `config`.
    ///
    /// With `store.validate_index` set, every record is checked against the
    /// mapped shards first and the first mismatch is returned as an error.
    pub fn new(
        index: ShardIndex,
        store: Arc<ShardStore>,
        captioner: Arc<dyn Captioner>,
        config: &JobConfig,
    ) -> Result<Self, JobError> {
        if config.store.validate_index {
            store.validate(&index)?;
            log::info!(
                "store: {} records validated against {} shards",
                index.len(),
                store.shard_count()
            );
        }

        let sampler = (config.sampling.probability > 0.0).then(|| {
            Arc::new(DurationSampler::new(
                config.sampling.probability,
                select_decoder(config.sampling.decoder),
            ))
        });

        Ok(Self {
            index: Arc::new(index),
            store,
            captioner,
            limiter: Arc::new(RateLimiter::from_config(&config.throttle, &config.endpoint)),
            sampler,
            config: config.scheduler.clone(),
            output: config.output.clone(),
            backoff: Duration::from_millis(config.throttle.backoff_ms),
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Replace the rate limiter built from config.
    pub fn with_limiter(mut self, limiter: RateLimiter) -> Self {
        self.limiter = Arc::new(limiter);
        self
    }

    /// Replace (or remove) the duration sampler built from config.
    pub fn with_sampler(mut self, sampler: Option<DurationSampler>) -> Self {
        self.sampler = sampler.map(Arc::new);
        self
    }

    /// Flag that stops dispatch of new items once set.  In-flight attempts
    /// still finish and are written.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Residual work for the configured range.
    pub fn plan(&self) -> Result<WorkPlan, JobError> {
        let range = self.index.clamp_range(self.config.start, self.config.end);
        if range.start >= range.end {
            return Err(JobError::InvalidRange {
                start: range.start,
                end: range.end,
                len: self.index.len(),
            });
        }

        let resume = if self.config.resume {
            ResumeState::load(&self.output.jsonl)?
        } else {
            log::info!("resume disabled: every id in range runs as attempt 1");
            ResumeState::default()
        };
        Ok(resume.residual(range, self.config.max_retries))
    }

    /// Plan, dispatch and drain the whole job.
    pub async fn run(&self) -> Result<RunSummary, JobError> {
        let plan = self.plan()?;
        let mut summary = RunSummary {
            range_len: plan.range.end - plan.range.start,
            planned: plan.len() as u64,
            already_done: plan.already_done,
            exhausted: plan.exhausted,
            ..RunSummary::default()
        };
        log::info!(
            "plan: ids [{}, {}): {} to process, {} already done, {} out of retries",
            plan.range.start,
            plan.range.end,
            plan.len(),
            plan.already_done,
            plan.exhausted
        );
        if plan.is_empty() {
            log::info!("Nothing to process.");
            return Ok(summary);
        }

        let tsv = Some(self.output.tsv.as_path()).filter(|p| !p.as_os_str().is_empty());
        let writer = LedgerWriter::open(&self.output.jsonl, tsv, self.output.flush_every)?;

        let tracker = Arc::new(ThroughputTracker::new());
        let items: Arc<[WorkItem]> = plan.items.into();
        let cursor = Arc::new(AtomicUsize::new(0));
        let workers = self.config.workers.clamp(1, items.len());
        let (tx, mut rx) = mpsc::channel::<LedgerEntry>(workers * 2);

        let worker = Arc::new(Worker {
            index: Arc::clone(&self.index),
            store: Arc::clone(&self.store),
            captioner: Arc::clone(&self.captioner),
            limiter: Arc::clone(&self.limiter),
            sampler: self.sampler.clone(),
            tracker: Arc::clone(&tracker),
            backoff: self.backoff,
            max_error_chars: self.output.max_error_chars,
            shutdown: Arc::clone(&self.shutdown),
        });
        let handles: Vec<_> = (0..workers)
            .map(|n| {
                tokio::spawn(Arc::clone(&worker).run(
                    n,
                    Arc::clone(&items),
                    Arc::clone(&cursor),
                    tx.clone(),
                ))
            })
            .collect();
        drop(tx);
        log::info!("run: {workers} workers started on {} items", items.len());

        let interval = self.config.checkpoint_interval.max(1);
        let mut write_error = None;
        while let Some(entry) = rx.recv().await {
            if let Err(e) = writer.append(&entry) {
                log::error!("ledger: append to {} failed: {e}", writer.path().display());
                self.shutdown.store(true, Ordering::SeqCst);
                write_error = Some(e);
                break;
            }
            if entry.is_ok() {
                summary.ok += 1;
            } else {
                summary.failed += 1;
            }
            let done = summary.processed();
            if done % interval == 0 {
                log::info!(
                    "{}",
                    checkpoint_line(
                        done,
                        summary.planned,
                        summary.ok,
                        summary.failed,
                        tracker.snapshot().as_ref()
                    )
                );
            }
        }
        drop(rx);

        for handle in handles {
            if let Err(e) = handle.await {
                log::error!("run: worker task ended abnormally: {e}");
            }
        }
        if let Some(e) = write_error {
            return Err(JobError::Ledger(e));
        }
        writer.flush()?;

        summary.interrupted =
            self.shutdown.load(Ordering::SeqCst) && summary.processed() < summary.planned;
        summary.snapshot = tracker.snapshot();
        summary.projection = Projection {
            range_hours: tracker.estimate(Workload::Items(summary.range_len)),
            reference_hours: tracker.estimate(Workload::AudioHours(REFERENCE_AUDIO_HOURS)),
        };
        log::info!(
            "run: finished with {} ok, {} failed{}",
            summary.ok,
            summary.failed,
            if summary.interrupted { " (interrupted)" } else { "" }
        );
        Ok(summary)
    }

    /// Ledger file the run appends to.
    pub fn ledger_path(&self) -> &Path {
        &self.output.jsonl
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// Everything one attempt needs, shared by all worker tasks.
struct Worker {
    index: Arc<ShardIndex>,
    store: Arc<ShardStore>,
    captioner: Arc<dyn Captioner>,
    limiter: Arc<RateLimiter>,
    sampler: Option<Arc<DurationSampler>>,
    tracker: Arc<ThroughputTracker>,
    backoff: Duration,
    max_error_chars: usize,
    shutdown: Arc<AtomicBool>,
}

impl Worker {
    async fn run(
        self: Arc<Self>,
        n: usize,
        items: Arc<[WorkItem]>,
        cursor: Arc<AtomicUsize>,
        tx: mpsc::Sender<LedgerEntry>,
    ) {
        loop {
            if self.stopping() {
                break;
            }
            let slot = cursor.fetch_add(1, Ordering::SeqCst);
            let Some(&item) = items.get(slot) else {
                break;
            };

            while self.limiter.should_throttle().await {
                if self.stopping() {
                    break;
                }
                tokio::time::sleep(self.backoff).await;
            }
            // Claimed but not attempted: no ledger entry, so the next run picks it up.
            if self.stopping() {
                break;
            }

            let entry = self.attempt(item).await;
            if tx.send(entry).await.is_err() {
                break;
            }
        }
        log::debug!("worker {n}: done");
    }

    fn stopping(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// One attempt, always yielding a ledger entry.
    async fn attempt(&self, item: WorkItem) -> LedgerEntry {
        let mut state = ItemState::Pending;
        advance(&mut state, ItemState::InFlight);

        let started = Instant::now();
        let result = self.call(item.id).await;
        let elapsed = started.elapsed();

        let entry = match result {
            Ok((record, mime, caption)) => {
                advance(&mut state, ItemState::Succeeded);
                let duration = self.sample_duration(record, mime).await;
                let weight = self.sampler.as_ref().map_or(1.0, |s| s.weight());
                self.tracker.record(elapsed, duration, weight);

                let mut entry =
                    LedgerEntry::success(item.id, item.attempt, elapsed.as_secs_f64(), caption);
                entry.audio_duration = duration;
                entry.sample_rate = record.declared_sample_rate;
                entry.mime_type = Some(mime.to_string());
                entry.compressed_size = Some(record.byte_size);
                entry
            }
            Err(err) => {
                advance(&mut state, ItemState::Failed);
                match &err {
                    AttemptError::Fetch(e) if e.is_corrupt_index() => {
                        log::error!("item {}: index does not match shards: {e}", item.id)
                    }
                    _ => log::debug!("item {}: attempt {} failed: {err}", item.id, item.attempt),
                }
                self.tracker.record(elapsed, None, 1.0);
                LedgerEntry::failure(
                    item.id,
                    item.attempt,
                    elapsed.as_secs_f64(),
                    truncate_error(&err.to_string(), self.max_error_chars),
                )
            }
        };
        log::debug!(
            "item {} attempt {}: {} in {:.2}s",
            item.id,
            item.attempt,
            state.label(),
            elapsed.as_secs_f64()
        );
        entry
    }

    async fn call(&self, id: u64) -> Result<(ShardRecord, &'static str, Caption), AttemptError> {
        let record = *self.index.get(id).ok_or(AttemptError::UnknownId(id))?;
        let bytes = self.store.fetch(&record)?;
        let mime = detect_mime(bytes);
        let caption = self.captioner.caption(bytes, mime).await?;
        Ok((record, mime, caption))
    }

    /// Decode the clip on the blocking pool when the sampler picks it.
    async fn sample_duration(&self, record: ShardRecord, mime: &'static str) -> Option<f64> {
        let sampler = self.sampler.as_ref()?;
        if !sampler.should_sample() {
            return None;
        }
        let sampler = Arc::clone(sampler);
        let store = Arc::clone(&self.store);
        let probe = tokio::task::spawn_blocking(move || {
            let bytes = store.fetch(&record).ok()?;
            sampler.probe(bytes, mime)
        });
        match probe.await {
            Ok(duration) => duration,
            Err(e) => {
                log::warn!("sampling: probe task for item {} failed: {e}", record.id);
                None
            }
        }
    }
}

fn advance(state: &mut ItemState, next: ItemState) {
    debug_assert!(
        state.can_transition_to(next),
        "illegal transition {} -> {}",
        state.label(),
        next.label()
    );
    *state = next;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{AudioDecoder, DecodeError};
    use crate::client::{LoadSignal, SignalError};
    use crate::ledger::{Status, TRUNCATION_MARKER};
    use crate::store::{build_index, MetadataRow};
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::TempDir;

    // -----------------------------------------------------------------------
    // Test doubles
    // -----------------------------------------------------------------------

    /// Captions every clip with its own bytes; fails for clips listed in
    /// `fail_on`.
    #[derive(Default)]
    struct EchoCaptioner {
        fail_on: HashSet<Vec<u8>>,
        error_body: String,
        calls: AtomicUsize,
        delay: Duration,
    }

    #[async_trait]
    impl Captioner for EchoCaptioner {
        async fn caption(&self, audio: &[u8], _mime: &str) -> Result<Caption, CaptionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail_on.contains(audio) {
                return Err(CaptionError::Status {
                    status: 503,
                    body: self.error_body.clone(),
                });
            }
            Ok(Caption {
                text: format!("heard {}", String::from_utf8_lossy(audio)),
                usage: Default::default(),
            })
        }
    }

    struct FixedLength(f64);

    impl AudioDecoder for FixedLength {
        fn name(&self) -> &'static str {
            "fixed"
        }
        fn duration_secs(&self, _: &[u8], _: &str) -> Result<f64, DecodeError> {
            Ok(self.0)
        }
    }

    /// Busy for the first `busy_polls` polls, idle afterwards.
    struct BusyThenIdle {
        busy_polls: usize,
        polls: AtomicUsize,
    }

    #[async_trait]
    impl LoadSignal for BusyThenIdle {
        async fn queue_depth(&self) -> Result<f64, SignalError> {
            let n = self.polls.fetch_add(1, Ordering::SeqCst);
            Ok(if n < self.busy_polls { 1000.0 } else { 0.0 })
        }
    }

    // -----------------------------------------------------------------------
    // Fixture
    // -----------------------------------------------------------------------

    /// `clips` are laid out back to back over two shards, first half in
    /// shard 0, so id `i` is `clips[i]`.  Returns the temp dir, index and
    /// store.
    fn fixture(clips: &[&[u8]]) -> (TempDir, ShardIndex, Arc<ShardStore>) {
        let dir = tempfile::tempdir().unwrap();
        let mut shards: [Vec<u8>; 2] = [Vec::new(), Vec::new()];
        let mut rows = Vec::new();
        let split = clips.len().div_ceil(2);
        for (i, clip) in clips.iter().enumerate() {
            let shard_no = usize::from(i >= split);
            let shard = &mut shards[shard_no];
            rows.push(MetadataRow {
                shard_index: shard_no as i64,
                byte_offset: shard.len() as i64,
                byte_size: clip.len() as i64,
                sample_rate: Some(16_000),
                channels: Some(1),
            });
            shard.extend_from_slice(clip);
        }
        let paths: Vec<PathBuf> = shards
            .iter()
            .enumerate()
            .map(|(i, bytes)| {
                let path = dir.path().join(format!("arkive_{i}.bin"));
                fs::write(&path, bytes).unwrap();
                path
            })
            .collect();
        let store = Arc::new(ShardStore::open(&paths).unwrap());
        (dir, build_index(rows).unwrap(), store)
    }

    fn job_config(dir: &Path, workers: usize) -> JobConfig {
        let mut config = JobConfig::default();
        config.store.arkive_dir = dir.to_path_buf();
        config.endpoint.model = "test".into();
        config.scheduler.workers = workers;
        config.scheduler.max_retries = 2;
        config.scheduler.checkpoint_interval = 2;
        config.output.jsonl = dir.join("out/captions.jsonl");
        config.output.tsv = dir.join("out/captions.tsv");
        config
    }

    fn ledger(path: &Path) -> Vec<LedgerEntry> {
        fs::read_to_string(path)
            .unwrap_or_default()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    fn clip_names(n: usize) -> Vec<Vec<u8>> {
        (0..n).map(|i| format!("clip-{i:04}").into_bytes()).collect()
    }

    // -----------------------------------------------------------------------
    // Tests
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn captions_every_planned_item() {
        let (dir, index, store) = fixture(&[b"aa", b"bbb", b"c"]);
        let config = job_config(dir.path(), 2);
        let scheduler =
            Scheduler::new(index, store, Arc::new(EchoCaptioner::default()), &config).unwrap();

        let summary = scheduler.run().await.unwrap();
        assert_eq!(summary.planned, 3);
        assert_eq!(summary.ok, 3);
        assert!(!summary.interrupted);

        let mut entries = ledger(&config.output.jsonl);
        entries.sort_by_key(|e| e.id);
        let captions: Vec<_> = entries.iter().map(|e| e.caption.clone().unwrap()).collect();
        assert_eq!(captions, ["heard aa", "heard bbb", "heard c"]);
        assert!(entries.iter().all(|e| e.retry_attempt == 1));
        assert_eq!(entries[1].compressed_size, Some(3));
        assert_eq!(entries[1].sample_rate, Some(16_000));
        assert_eq!(entries[1].mime_type.as_deref(), Some("audio/wav"));

        let tsv = fs::read_to_string(&config.output.tsv).unwrap();
        assert_eq!(tsv.lines().count(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn many_workers_write_one_intact_line_per_attempt() {
        let names = clip_names(300);
        let clips: Vec<&[u8]> = names.iter().map(Vec::as_slice).collect();
        let (dir, index, store) = fixture(&clips);
        let mut config = job_config(dir.path(), 16);
        config.output.flush_every = 7;
        let captioner = EchoCaptioner {
            fail_on: names.iter().step_by(10).cloned().collect(),
            error_body: "x".repeat(2000),
            delay: Duration::from_millis(1),
            ..EchoCaptioner::default()
        };
        let scheduler = Scheduler::new(index, store, Arc::new(captioner), &config).unwrap();

        let summary = scheduler.run().await.unwrap();
        assert_eq!(summary.ok, 270);
        assert_eq!(summary.failed, 30);

        let entries = ledger(&config.output.jsonl);
        assert_eq!(entries.len(), 300);
        let ids: HashSet<u64> = entries.iter().map(|e| e.id).collect();
        assert_eq!(ids, (0..300).collect());
    }

    #[tokio::test]
    async fn failures_are_recorded_with_truncated_errors() {
        let (dir, index, store) = fixture(&[b"good", b"bad"]);
        let mut config = job_config(dir.path(), 1);
        config.output.max_error_chars = 40;
        let captioner = EchoCaptioner {
            fail_on: [b"bad".to_vec()].into_iter().collect(),
            error_body: "stack frame\n".repeat(100),
            ..EchoCaptioner::default()
        };
        let scheduler = Scheduler::new(index, store, Arc::new(captioner), &config).unwrap();

        let summary = scheduler.run().await.unwrap();
        assert_eq!((summary.ok, summary.failed), (1, 1));

        let failed = ledger(&config.output.jsonl)
            .into_iter()
            .find(|e| e.status == Status::Fail)
            .unwrap();
        assert_eq!(failed.id, 1);
        let error = failed.error.unwrap();
        assert!(error.starts_with("endpoint returned HTTP 503"));
        assert!(error.ends_with(TRUNCATION_MARKER));
        assert_eq!(error.chars().count(), 40 + TRUNCATION_MARKER.chars().count());
        assert!(failed.caption.is_none());
    }

    #[tokio::test]
    async fn corrupt_record_fails_only_that_item() {
        let (dir, index, store) = fixture(&[b"aa", b"bb"]);
        let mut rows: Vec<MetadataRow> = index
            .iter()
            .map(|r| MetadataRow {
                shard_index: r.shard_index as i64,
                byte_offset: r.byte_offset as i64,
                byte_size: r.byte_size as i64,
                sample_rate: None,
                channels: None,
            })
            .collect();
        rows[1].byte_size = 4096;
        let corrupt = build_index(rows).unwrap();

        let mut config = job_config(dir.path(), 2);
        config.store.validate_index = false;
        let scheduler = Scheduler::new(
            corrupt,
            store,
            Arc::new(EchoCaptioner::default()),
            &config,
        )
        .unwrap();

        let summary = scheduler.run().await.unwrap();
        assert_eq!((summary.ok, summary.failed), (1, 1));
        let entries = ledger(&config.output.jsonl);
        let bad = entries.iter().find(|e| e.id == 1).unwrap();
        assert!(bad.error.as_deref().unwrap().contains("exceeds shard"));
    }

    #[test]
    fn validation_rejects_corrupt_index_up_front() {
        let (dir, _, store) = fixture(&[b"aa", b"bb"]);
        let corrupt = build_index(vec![MetadataRow {
            shard_index: 1,
            byte_offset: 1,
            byte_size: 10,
            sample_rate: None,
            channels: None,
        }])
        .unwrap();
        let config = job_config(dir.path(), 1);

        let err = Scheduler::new(corrupt, store, Arc::new(EchoCaptioner::default()), &config)
            .err()
            .unwrap();
        assert!(matches!(err, JobError::Store(StoreError::OutOfBounds { .. })));
    }

    #[test]
    fn empty_range_is_rejected() {
        let (dir, index, store) = fixture(&[b"a", b"b"]);
        let mut config = job_config(dir.path(), 1);
        config.scheduler.start = 5;
        let scheduler =
            Scheduler::new(index, store, Arc::new(EchoCaptioner::default()), &config).unwrap();

        assert!(matches!(
            scheduler.plan(),
            Err(JobError::InvalidRange { start: 5, end: 2, len: 2 })
        ));
    }

    #[tokio::test]
    async fn range_end_is_clamped_and_respected() {
        let (dir, index, store) = fixture(&[b"a", b"b", b"c", b"d"]);
        let mut config = job_config(dir.path(), 2);
        config.scheduler.start = 1;
        config.scheduler.end = Some(3);
        let scheduler =
            Scheduler::new(index, store, Arc::new(EchoCaptioner::default()), &config).unwrap();

        scheduler.run().await.unwrap();
        let mut ids: Vec<u64> = ledger(&config.output.jsonl).iter().map(|e| e.id).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2]);
    }

    #[tokio::test]
    async fn shutdown_before_run_dispatches_nothing() {
        let (dir, index, store) = fixture(&[b"a", b"b", b"c"]);
        let config = job_config(dir.path(), 2);
        let captioner = Arc::new(EchoCaptioner::default());
        let scheduler = Scheduler::new(index, store, captioner.clone(), &config).unwrap();

        scheduler.shutdown_flag().store(true, Ordering::SeqCst);
        let summary = scheduler.run().await.unwrap();

        assert!(summary.interrupted);
        assert_eq!(summary.processed(), 0);
        assert_eq!(summary.undispatched(), 3);
        assert_eq!(captioner.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn resume_disabled_reruns_done_ids_as_first_attempt() {
        let (dir, index, store) = fixture(&[b"a", b"b"]);
        let mut config = job_config(dir.path(), 1);
        fs::create_dir_all(dir.path().join("out")).unwrap();
        fs::write(
            &config.output.jsonl,
            "{\"id\":0,\"status\":\"ok\",\"caption\":\"old\"}\n\
             {\"id\":1,\"status\":\"fail\",\"error\":\"e\",\"retry_attempt\":1}\n",
        )
        .unwrap();

        config.scheduler.resume = false;
        let scheduler =
            Scheduler::new(index, store, Arc::new(EchoCaptioner::default()), &config).unwrap();
        let plan = scheduler.plan().unwrap();
        assert_eq!(plan.ids(), vec![0, 1]);
        assert!(plan.items.iter().all(|item| item.attempt == 1));

        scheduler.run().await.unwrap();
        assert_eq!(ledger(&config.output.jsonl).len(), 4);
    }

    #[tokio::test]
    async fn sampled_durations_reach_the_ledger() {
        let (dir, index, store) = fixture(&[b"a", b"b", b"c"]);
        let config = job_config(dir.path(), 2);
        let scheduler = Scheduler::new(index, store, Arc::new(EchoCaptioner::default()), &config)
            .unwrap()
            .with_sampler(Some(DurationSampler::new(1.0, Arc::new(FixedLength(4.5)))));

        scheduler.run().await.unwrap();
        let entries = ledger(&config.output.jsonl);
        assert!(entries.iter().all(|e| e.audio_duration == Some(4.5)));
    }

    #[tokio::test]
    async fn throttled_workers_wait_then_proceed() {
        let (dir, index, store) = fixture(&[b"a", b"b"]);
        let mut config = job_config(dir.path(), 1);
        config.throttle.backoff_ms = 1;
        let signal = Arc::new(BusyThenIdle {
            busy_polls: 3,
            polls: AtomicUsize::new(0),
        });
        let scheduler = Scheduler::new(index, store, Arc::new(EchoCaptioner::default()), &config)
            .unwrap()
            .with_limiter(RateLimiter::new(signal.clone(), 10.0, Duration::ZERO));

        let summary = scheduler.run().await.unwrap();
        assert_eq!(summary.ok, 2);
        assert!(signal.polls.load(Ordering::SeqCst) >= 4);
    }

    #[tokio::test]
    async fn shutdown_while_throttled_sends_nothing() {
        let (dir, index, store) = fixture(&[b"a", b"b", b"c", b"d"]);
        let mut config = job_config(dir.path(), 4);
        config.throttle.backoff_ms = 1;
        let always_busy = Arc::new(BusyThenIdle {
            busy_polls: usize::MAX,
            polls: AtomicUsize::new(0),
        });
        let captioner = Arc::new(EchoCaptioner::default());
        let scheduler = Scheduler::new(index, store, captioner.clone(), &config)
            .unwrap()
            .with_limiter(RateLimiter::new(always_busy, 10.0, Duration::ZERO));

        let stop = scheduler.shutdown_flag();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stop.store(true, Ordering::SeqCst);
        });

        let summary = scheduler.run().await.unwrap();
        assert!(summary.interrupted);
        assert_eq!(summary.processed(), 0);
        assert_eq!(summary.undispatched(), 4);
        assert_eq!(captioner.calls.load(Ordering::SeqCst), 0);
        assert!(ledger(&config.output.jsonl).is_empty());
    }
}
