//! Job settings structs, defaults, validation and TOML persistence.
//!
//! All structs implement `Serialize`, `Deserialize`, `Default` and `Clone`
//! so they can be round-tripped through TOML files and shared across tasks.
//! Every section is `#[serde(default)]`, so a job file only needs to name
//! the values it changes.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::JobPaths;

// ---------------------------------------------------------------------------
// ConfigError
// ---------------------------------------------------------------------------

/// A configuration value that would make the job meaningless or unsafe.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("scheduler.workers must be at least 1")]
    NoWorkers,

    #[error("scheduler.max_retries must be at least 1")]
    NoRetries,

    #[error("scheduler.checkpoint_interval must be at least 1")]
    NoCheckpointInterval,

    #[error("sampling.probability must be within [0, 1], got {0}")]
    SampleProbability(f64),

    #[error("endpoint.model must not be empty")]
    MissingModel,

    #[error("store.arkive_dir must be set")]
    MissingArkiveDir,
}

// ---------------------------------------------------------------------------
// StoreConfig
// ---------------------------------------------------------------------------

/// Location and naming of the shard files and their metadata table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding `arkive_<n>.bin` shards and `metadata.parquet`.
    pub arkive_dir: PathBuf,
    /// File-name prefix shared by every shard.
    pub shard_prefix: String,
    /// File-name suffix shared by every shard.
    pub shard_suffix: String,
    /// Metadata table file name, relative to `arkive_dir`.
    pub metadata_file: String,
    /// Check every index record against its shard length before the run.
    pub validate_index: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            arkive_dir: PathBuf::new(),
            shard_prefix: "arkive_".into(),
            shard_suffix: ".bin".into(),
            metadata_file: "metadata.parquet".into(),
            validate_index: true,
        }
    }
}

impl StoreConfig {
    /// Full path of the metadata table.
    pub fn metadata_path(&self) -> PathBuf {
        self.arkive_dir.join(&self.metadata_file)
    }
}

// ---------------------------------------------------------------------------
// EndpointConfig
// ---------------------------------------------------------------------------

/// Connection details for the remote captioning endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Base URL of the OpenAI-compatible API, including the `/v1` segment.
    pub base_url: String,
    /// Model identifier sent with every request.
    pub model: String,
    /// Bearer token; `None` for unauthenticated local servers.
    pub api_key: Option<String>,
    /// Sampling temperature.
    pub temperature: f32,
    /// Upper bound on generated tokens per caption.
    pub max_tokens: u32,
    /// Per-call timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8901/v1".into(),
            model: String::new(),
            api_key: None,
            temperature: 0.2,
            max_tokens: 400,
            timeout_secs: 180,
        }
    }
}

// ---------------------------------------------------------------------------
// SchedulerConfig
// ---------------------------------------------------------------------------

/// Worker pool sizing, retry policy and processing range.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Number of concurrent workers.
    pub workers: usize,
    /// Ids with this many recorded failures are skipped.
    pub max_retries: u32,
    /// Emit a checkpoint summary every N completed attempts.
    pub checkpoint_interval: u64,
    /// First id of the processing range (inclusive).
    pub start: u64,
    /// End of the processing range (exclusive); `None` means the whole index.
    pub end: Option<u64>,
    /// Replay the ledger before planning the run.
    pub resume: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_retries: 3,
            checkpoint_interval: 100,
            start: 0,
            end: None,
            resume: true,
        }
    }
}

// ---------------------------------------------------------------------------
// SamplingConfig
// ---------------------------------------------------------------------------

/// Which decoder backs duration probing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecoderChoice {
    /// symphonia first, WAV header parsing when symphonia cannot read it.
    #[default]
    Auto,
    /// symphonia only.
    Symphonia,
    /// WAV header parsing only.
    Wav,
}

impl std::str::FromStr for DecoderChoice {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "symphonia" => Ok(Self::Symphonia),
            "wav" => Ok(Self::Wav),
            other => Err(format!("unknown decoder '{other}' (expected auto, symphonia or wav)")),
        }
    }
}

/// Probabilistic audio-duration sampling for the real-time-factor estimate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Probability in `[0, 1]` that an item is decoded; `0` disables decoding.
    pub probability: f64,
    /// Decoder backing the probe.
    pub decoder: DecoderChoice,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            probability: 0.0,
            decoder: DecoderChoice::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// ThrottleConfig
// ---------------------------------------------------------------------------

/// Advisory throttling driven by the endpoint's queue-depth gauge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    pub enabled: bool,
    /// Metrics exposition URL; derived from `endpoint.base_url` when unset.
    pub metrics_url: Option<String>,
    /// Minimum delay between two gauge polls.
    pub poll_interval_ms: u64,
    /// Throttle when the gauge reaches this value.
    pub queue_threshold: f64,
    /// How long a throttled worker waits before asking again.
    pub backoff_ms: u64,
    /// Gauge name in the exposition text.
    pub gauge: String,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            metrics_url: None,
            poll_interval_ms: 2_000,
            queue_threshold: 256.0,
            backoff_ms: 500,
            gauge: "vllm:num_requests_waiting".into(),
        }
    }
}

impl ThrottleConfig {
    /// The metrics URL to poll: the explicit one, or `<base_url minus /v1>/metrics`.
    pub fn resolve_metrics_url(&self, base_url: &str) -> String {
        if let Some(url) = &self.metrics_url {
            return url.clone();
        }
        let trimmed = base_url.trim_end_matches('/');
        let root = trimmed.strip_suffix("/v1").unwrap_or(trimmed);
        format!("{root}/metrics")
    }
}

// ---------------------------------------------------------------------------
// OutputConfig
// ---------------------------------------------------------------------------

/// Ledger and projection output files.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Append-only JSONL ledger.
    pub jsonl: PathBuf,
    /// Tab-separated `id<TAB>caption` projection of successful entries.
    pub tsv: PathBuf,
    /// Flush both files after this many appended entries.
    pub flush_every: u64,
    /// Error messages longer than this are truncated before being written.
    pub max_error_chars: usize,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            jsonl: PathBuf::from("captions.jsonl"),
            tsv: PathBuf::from("captions.tsv"),
            flush_every: 10,
            max_error_chars: 1_000,
        }
    }
}

// ---------------------------------------------------------------------------
// JobConfig  (top-level)
// ---------------------------------------------------------------------------

/// Top-level job configuration, serialised as `job.toml`.
///
/// ```rust,no_run
/// use batch_captioner::config::JobConfig;
///
/// let mut config = JobConfig::load().unwrap();
/// config.scheduler.workers = 64;
/// config.validate().unwrap();
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    pub store: StoreConfig,
    pub endpoint: EndpointConfig,
    pub scheduler: SchedulerConfig,
    pub sampling: SamplingConfig,
    pub throttle: ThrottleConfig,
    pub output: OutputConfig,
}

impl JobConfig {
    /// Load from the platform-default `job.toml`; missing file yields defaults.
    pub fn load() -> Result<Self> {
        Self::load_from(&JobPaths::new().config_file)
    }

    /// Load from an explicit path.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Self =
            toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }

    /// Save to an explicit path, creating parent directories as needed.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject settings the scheduler cannot run with.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.store.arkive_dir.as_os_str().is_empty() {
            return Err(ConfigError::MissingArkiveDir);
        }
        if self.endpoint.model.trim().is_empty() {
            return Err(ConfigError::MissingModel);
        }
        if self.scheduler.workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if self.scheduler.max_retries == 0 {
            return Err(ConfigError::NoRetries);
        }
        if self.scheduler.checkpoint_interval == 0 {
            return Err(ConfigError::NoCheckpointInterval);
        }
        let p = self.sampling.probability;
        if !(0.0..=1.0).contains(&p) {
            return Err(ConfigError::SampleProbability(p));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
