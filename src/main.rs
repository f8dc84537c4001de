//! Command-line entry point for batch-captioner.
//!
//! # Subcommands
//!
//! * `run`     load the job file, apply flag overrides, caption the
//!   residual id range and print the run report.
//! * `merge`   combine several ledgers into one id-sorted ledger.
//! * `summary` print statistics for an existing ledger.
//!
//! # Startup sequence (`run`)
//!
//! 1. Initialise logging.
//! 2. Load [`JobConfig`] (defaults when the file is missing) and apply
//!    command-line overrides, then validate.
//! 3. Read the metadata table and build the [`ShardIndex`](batch_captioner::store::ShardIndex).
//! 4. Map the shard files.
//! 5. Build the HTTP captioner and the [`Scheduler`].
//! 6. Install the Ctrl-C handler (first press drains, second aborts).
//! 7. Run to completion and print the report.

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use batch_captioner::{
    client::ApiCaptioner,
    config::{DecoderChoice, JobConfig, JobPaths},
    ledger::{merge_ledgers, LedgerSummary},
    pipeline::Scheduler,
    store::{build_index, read_metadata, ShardStore},
};

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

/// Resumable concurrent batch captioning of sharded audio datasets.
#[derive(Parser, Debug)]
#[command(
    name = "batch-captioner",
    version,
    about = "Resumable concurrent batch captioning of sharded audio datasets",
    after_help = "EXAMPLES:\n    \
        batch-captioner run --arkive-dir /data/arkive --model qwen2-audio -w 64\n    \
        batch-captioner run --config job.toml --start 0 --end 100000\n    \
        batch-captioner merge part_a.jsonl part_b.jsonl -o merged.jsonl --tsv merged.tsv\n    \
        batch-captioner summary captions.jsonl --total 250000"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Caption every id in the range that is not done and not out of retries
    Run(RunArgs),

    /// Merge several ledgers, keeping the first ok entry per id
    Merge(MergeArgs),

    /// Print statistics for a ledger
    Summary(SummaryArgs),
}

/// Flags for `run`.  Every flag overrides the matching job-file value.
#[derive(Args, Debug, Default)]
struct RunArgs {
    /// Job file (defaults to the platform config dir)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Directory holding the shard files and the metadata table
    #[arg(long, value_name = "DIR")]
    arkive_dir: Option<PathBuf>,

    /// Metadata table file name inside the arkive dir
    #[arg(long, value_name = "FILE")]
    metadata_file: Option<String>,

    /// Skip the pre-run check of index records against shard lengths
    #[arg(long)]
    no_validate: bool,

    /// Base URL of the OpenAI-compatible endpoint (including /v1)
    #[arg(long, value_name = "URL")]
    base_url: Option<String>,

    /// Model identifier sent with every request
    #[arg(short, long)]
    model: Option<String>,

    /// Bearer token for the endpoint
    #[arg(long, env = "CAPTIONER_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Per-call timeout in seconds
    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,

    #[arg(long)]
    temperature: Option<f32>,

    #[arg(long)]
    max_tokens: Option<u32>,

    /// Number of concurrent workers
    #[arg(short, long)]
    workers: Option<usize>,

    /// Skip ids with this many recorded failures
    #[arg(long)]
    max_retries: Option<u32>,

    /// Log a checkpoint line every N completed attempts
    #[arg(long, value_name = "N")]
    checkpoint_interval: Option<u64>,

    /// First id of the range (inclusive)
    #[arg(long)]
    start: Option<u64>,

    /// End of the range (exclusive); clamped to the index length
    #[arg(long)]
    end: Option<u64>,

    /// Ignore the existing ledger and run every id in range as attempt 1
    #[arg(long)]
    no_resume: bool,

    /// Probability of decoding a clip to sample its duration (0 disables)
    #[arg(long, value_name = "P")]
    sample_prob: Option<f64>,

    /// Duration decoder: auto, symphonia or wav
    #[arg(long)]
    decoder: Option<DecoderChoice>,

    /// Back off while the endpoint's queue gauge is above the threshold
    #[arg(long)]
    throttle: bool,

    /// Metrics URL (derived from --base-url when omitted)
    #[arg(long, value_name = "URL")]
    metrics_url: Option<String>,

    #[arg(long, value_name = "DEPTH")]
    queue_threshold: Option<f64>,

    /// JSONL ledger path
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// TSV projection path; an empty string disables it
    #[arg(long, value_name = "FILE")]
    tsv: Option<PathBuf>,

    /// Write the effective configuration to this file and exit
    #[arg(long, value_name = "FILE")]
    save_config: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct MergeArgs {
    /// Input ledgers, in priority order for ties
    #[arg(required = true, value_name = "LEDGER")]
    inputs: Vec<PathBuf>,

    /// Merged JSONL ledger
    #[arg(short, long, value_name = "FILE")]
    output: PathBuf,

    /// Also write the TSV projection of the merged ledger
    #[arg(long, value_name = "FILE")]
    tsv: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct SummaryArgs {
    /// Ledger to summarise
    #[arg(value_name = "LEDGER")]
    ledger: PathBuf,

    /// Total ids in the dataset, for the progress line
    #[arg(long)]
    total: Option<u64>,
}

// ---------------------------------------------------------------------------
// Overrides
// ---------------------------------------------------------------------------

impl RunArgs {
    /// Copy every flag that was given onto `config`.
    fn apply(&self, config: &mut JobConfig) {
        if let Some(dir) = &self.arkive_dir {
            config.store.arkive_dir = dir.clone();
        }
        if let Some(file) = &self.metadata_file {
            config.store.metadata_file = file.clone();
        }
        if self.no_validate {
            config.store.validate_index = false;
        }

        if let Some(url) = &self.base_url {
            config.endpoint.base_url = url.clone();
        }
        if let Some(model) = &self.model {
            config.endpoint.model = model.clone();
        }
        if let Some(key) = &self.api_key {
            config.endpoint.api_key = Some(key.clone());
        }
        if let Some(secs) = self.timeout {
            config.endpoint.timeout_secs = secs;
        }
        if let Some(t) = self.temperature {
            config.endpoint.temperature = t;
        }
        if let Some(n) = self.max_tokens {
            config.endpoint.max_tokens = n;
        }

        if let Some(n) = self.workers {
            config.scheduler.workers = n;
        }
        if let Some(n) = self.max_retries {
            config.scheduler.max_retries = n;
        }
        if let Some(n) = self.checkpoint_interval {
            config.scheduler.checkpoint_interval = n;
        }
        if let Some(start) = self.start {
            config.scheduler.start = start;
        }
        if self.end.is_some() {
            config.scheduler.end = self.end;
        }
        if self.no_resume {
            config.scheduler.resume = false;
        }

        if let Some(p) = self.sample_prob {
            config.sampling.probability = p;
        }
        if let Some(decoder) = self.decoder {
            config.sampling.decoder = decoder;
        }

        if self.throttle {
            config.throttle.enabled = true;
        }
        if let Some(url) = &self.metrics_url {
            config.throttle.metrics_url = Some(url.clone());
        }
        if let Some(depth) = self.queue_threshold {
            config.throttle.queue_threshold = depth;
        }

        if let Some(path) = &self.output {
            config.output.jsonl = path.clone();
        }
        if let Some(path) = &self.tsv {
            config.output.tsv = path.clone();
        }
    }
}

// ---------------------------------------------------------------------------
// Subcommands
// ---------------------------------------------------------------------------

async fn run(args: RunArgs) -> Result<()> {
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| JobPaths::new().config_file);
    let mut config = JobConfig::load_from(&config_path)?;
    log::info!("Config loaded from {}", config_path.display());
    args.apply(&mut config);

    if let Some(path) = &args.save_config {
        config
            .save_to(path)
            .with_context(|| format!("writing {}", path.display()))?;
        println!("Configuration written to {}", path.display());
        return Ok(());
    }
    config.validate().context("invalid job configuration")?;

    let metadata_path = config.store.metadata_path();
    let rows = read_metadata(&metadata_path)
        .with_context(|| format!("reading metadata {}", metadata_path.display()))?;
    let index = build_index(rows).context("building shard index")?;
    log::info!("Index: {} records", index.len());

    let store = Arc::new(
        ShardStore::open_dir(
            &config.store.arkive_dir,
            &config.store.shard_prefix,
            &config.store.shard_suffix,
        )
        .with_context(|| format!("opening shards in {}", config.store.arkive_dir.display()))?,
    );

    let captioner = Arc::new(
        ApiCaptioner::from_config(&config.endpoint).context("building endpoint client")?,
    );
    log::info!(
        "Endpoint: {} (model {})",
        config.endpoint.base_url,
        config.endpoint.model
    );

    let scheduler = Scheduler::new(index, Arc::clone(&store), captioner, &config)?;

    let stop = scheduler.shutdown_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        log::warn!("Interrupt received; finishing in-flight items (Ctrl-C again to abort)");
        stop.store(true, Ordering::SeqCst);

        if tokio::signal::ctrl_c().await.is_ok() {
            log::error!("Second interrupt; aborting without draining");
            std::process::exit(130);
        }
    });

    let summary = scheduler.run().await?;
    println!("{}", summary.render());
    log::info!("Ledger: {}", scheduler.ledger_path().display());

    drop(scheduler);
    if let Ok(store) = Arc::try_unwrap(store) {
        store.close();
    }
    Ok(())
}

fn merge(args: MergeArgs) -> Result<()> {
    let report = merge_ledgers(&args.inputs, &args.output, args.tsv.as_deref())
        .context("merging ledgers")?;
    print!("{}", report.render());
    println!("Merged ledger written to {}", args.output.display());
    Ok(())
}

fn summary(args: SummaryArgs) -> Result<()> {
    let summary = LedgerSummary::load(&args.ledger)
        .with_context(|| format!("reading {}", args.ledger.display()))?;
    print!("{}", summary.render(args.total));
    Ok(())
}

// ---------------------------------------------------------------------------
// main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run(args).await,
        Command::Merge(args) => merge(args),
        Command::Summary(args) => summary(args),
    }
}
