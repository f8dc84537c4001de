//! Resumable worker pool for batch captioning.
//!
//! # Architecture
//!
//! ```text
//! ResumeState::load(ledger) ──residual(range)──▶ WorkPlan
//!        │
//!        ▼
//! Scheduler::run()
//!        ├─ worker 0..N  (tokio tasks, shared cursor over the plan)
//!        │     ├─ RateLimiter::should_throttle   → back off while busy
//!        │     ├─ ShardStore::fetch              → zero-copy &[u8]
//!        │     ├─ Captioner::caption             → ok / fail
//!        │     ├─ DurationSampler (p, 1/p)       → spawn_blocking probe
//!        │     └─ ThroughputTracker::record
//!        │              │ LedgerEntry (mpsc)
//!        ▼              ▼
//!   writer loop ──▶ LedgerWriter (jsonl + tsv) ──▶ checkpoint lines
//!        │
//!        ▼
//!   RunSummary
//! ```
//!
//! Each item moves `Pending → InFlight → {Succeeded, Failed}` exactly once
//! per run ([`ItemState`]).  There is no in-process retry; a failed id is
//! picked up again by the next run until it reaches `max_retries`.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use batch_captioner::client::ApiCaptioner;
//! use batch_captioner::config::JobConfig;
//! use batch_captioner::pipeline::Scheduler;
//! use batch_captioner::store::{build_index, read_metadata, ShardStore};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = JobConfig::load()?;
//!     let index = build_index(read_metadata(&config.store.metadata_path())?)?;
//!     let store = Arc::new(ShardStore::open_dir(
//!         &config.store.arkive_dir,
//!         &config.store.shard_prefix,
//!         &config.store.shard_suffix,
//!     )?);
//!     let captioner = Arc::new(ApiCaptioner::from_config(&config.endpoint)?);
//!
//!     let scheduler = Scheduler::new(index, store, captioner, &config)?;
//!     let stop = scheduler.shutdown_flag();
//!     tokio::spawn(async move {
//!         let _ = tokio::signal::ctrl_c().await;
//!         stop.store(true, std::sync::atomic::Ordering::SeqCst);
//!     });
//!
//!     println!("{}", scheduler.run().await?.render());
//!     Ok(())
//! }
//! ```

pub mod report;
pub mod scheduler;
pub mod state;
pub mod tracker;

// ---------------------------------------------------------------------------
// Public re-exports
// ---------------------------------------------------------------------------

pub use report::{checkpoint_line, format_duration, Projection, RunSummary, REFERENCE_AUDIO_HOURS};
pub use scheduler::{AttemptError, JobError, Scheduler};
pub use state::ItemState;
pub use tracker::{DurationSampler, ThroughputSnapshot, ThroughputTracker, Workload};
