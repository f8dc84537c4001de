//! Throughput and real-time-factor accounting.
//!
//! [`ThroughputTracker`] is the single aggregate every worker reports to.
//! It exposes only [`record`](ThroughputTracker::record) and
//! [`snapshot`](ThroughputTracker::snapshot); the counters live behind one
//! mutex and are never handed out.
//!
//! Audio duration is optional per attempt.  When only a fraction `p` of
//! items is decoded ([`DurationSampler`]), each sampled duration is weighted
//! by `1/p` so the accumulated total stays an unbiased estimate of the real
//! total.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::audio::AudioDecoder;

/// Snapshots taken earlier than this after start are too noisy to report.
pub const MIN_ELAPSED: Duration = Duration::from_millis(100);

/// Projections need at least this many recorded attempts.
pub const MIN_ESTIMATE_SAMPLES: u64 = 10;

/// Smallest probability used when deriving a sample weight.
const MIN_PROBABILITY: f64 = 1e-8;

// ---------------------------------------------------------------------------
// ThroughputSnapshot
// ---------------------------------------------------------------------------

/// Point-in-time view of a [`ThroughputTracker`].
#[derive(Debug, Clone, PartialEq)]
pub struct ThroughputSnapshot {
    pub elapsed: Duration,
    pub processed: u64,
    pub items_per_second: f64,
    /// Weighted audio seconds per wall-clock second; `None` until at least
    /// one duration has been recorded.
    pub real_time_factor: Option<f64>,
    /// Weighted estimate of the audio seconds processed so far.
    pub total_audio_seconds: f64,
    pub samples_with_duration: u64,
    /// Sum of per-attempt processing times (exceeds `elapsed` with N > 1).
    pub busy_seconds: f64,
}

impl ThroughputSnapshot {
    pub fn items_per_hour(&self) -> f64 {
        self.items_per_second * 3600.0
    }

    pub fn total_audio_hours(&self) -> f64 {
        self.total_audio_seconds / 3600.0
    }

    /// Time left for `remaining` items at the current rate.
    pub fn eta(&self, remaining: u64) -> Option<Duration> {
        (self.items_per_second > 0.0)
            .then(|| Duration::from_secs_f64(remaining as f64 / self.items_per_second))
    }
}

// ---------------------------------------------------------------------------
// Workload
// ---------------------------------------------------------------------------

/// Amount of work to project processing time for.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Workload {
    /// A number of items, projected from the item rate.
    Items(u64),
    /// Hours of audio, projected from the real-time factor.
    AudioHours(f64),
}

// ---------------------------------------------------------------------------
// ThroughputTracker
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Inner {
    start: Instant,
    processed: u64,
    busy_seconds: f64,
    audio_seconds: f64,
    samples_with_duration: u64,
}

/// Thread-safe running aggregate of completed attempts.
#[derive(Debug)]
pub struct ThroughputTracker {
    inner: Mutex<Inner>,
}

impl Default for ThroughputTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ThroughputTracker {
    /// Start the wall clock now.
    pub fn new() -> Self {
        Self::started_at(Instant::now())
    }

    /// Tracker whose wall clock began at `start`.
    pub fn started_at(start: Instant) -> Self {
        Self {
            inner: Mutex::new(Inner {
                start,
                processed: 0,
                busy_seconds: 0.0,
                audio_seconds: 0.0,
                samples_with_duration: 0,
            }),
        }
    }

    /// Record one finished attempt, successful or not.
    ///
    /// `audio_duration` is in seconds and is scaled by `sample_weight`.
    pub fn record(&self, processing_time: Duration, audio_duration: Option<f64>, sample_weight: f64) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.processed += 1;
        inner.busy_seconds += processing_time.as_secs_f64();
        if let Some(secs) = audio_duration {
            inner.audio_seconds += secs * sample_weight;
            inner.samples_with_duration += 1;
        }
    }

    /// Current rates, or `None` within [`MIN_ELAPSED`] of the start.
    pub fn snapshot(&self) -> Option<ThroughputSnapshot> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let elapsed = inner.start.elapsed();
        if elapsed < MIN_ELAPSED {
            return None;
        }
        let secs = elapsed.as_secs_f64();
        Some(ThroughputSnapshot {
            elapsed,
            processed: inner.processed,
            items_per_second: inner.processed as f64 / secs,
            real_time_factor: (inner.samples_with_duration > 0).then(|| inner.audio_seconds / secs),
            total_audio_seconds: inner.audio_seconds,
            samples_with_duration: inner.samples_with_duration,
            busy_seconds: inner.busy_seconds,
        })
    }

    /// Weighted estimate of the audio seconds processed so far.
    pub fn total_audio_seconds(&self) -> f64 {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .audio_seconds
    }

    pub fn processed(&self) -> u64 {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .processed
    }

    /// Wall-clock hours needed for `workload` at the observed rates.
    ///
    /// `None` before [`MIN_ESTIMATE_SAMPLES`] attempts, or for
    /// [`Workload::AudioHours`] when no duration has been sampled.
    pub fn estimate(&self, workload: Workload) -> Option<f64> {
        let snap = self.snapshot()?;
        if snap.processed < MIN_ESTIMATE_SAMPLES {
            return None;
        }
        match workload {
            Workload::Items(n) => {
                (snap.items_per_second > 0.0).then(|| n as f64 / snap.items_per_second / 3600.0)
            }
            Workload::AudioHours(hours) => snap
                .real_time_factor
                .filter(|rtf| *rtf > 0.0)
                .map(|rtf| hours / rtf),
        }
    }
}

// ---------------------------------------------------------------------------
// DurationSampler
// ---------------------------------------------------------------------------

/// Decides which items get decoded for their duration, and decodes them.
pub struct DurationSampler {
    probability: f64,
    decoder: Arc<dyn AudioDecoder>,
    rng: Mutex<StdRng>,
}

impl DurationSampler {
    pub fn new(probability: f64, decoder: Arc<dyn AudioDecoder>) -> Self {
        Self::with_rng(probability, decoder, StdRng::from_entropy())
    }

    /// Sampler with a caller-supplied generator (seeded in tests).
    pub fn with_rng(probability: f64, decoder: Arc<dyn AudioDecoder>, rng: StdRng) -> Self {
        Self {
            probability: probability.clamp(0.0, 1.0),
            decoder,
            rng: Mutex::new(rng),
        }
    }

    pub fn probability(&self) -> f64 {
        self.probability
    }

    pub fn is_enabled(&self) -> bool {
        self.probability > 0.0
    }

    /// Weight applied to every sampled duration.
    pub fn weight(&self) -> f64 {
        1.0 / self.probability.max(MIN_PROBABILITY)
    }

    pub fn should_sample(&self) -> bool {
        if self.probability <= 0.0 {
            return false;
        }
        if self.probability >= 1.0 {
            return true;
        }
        let draw: f64 = self
            .rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .gen();
        draw < self.probability
    }

    /// Duration of the clip, or `None` when decoding fails.  Blocking.
    pub fn probe(&self, bytes: &[u8], mime: &str) -> Option<f64> {
        match self.decoder.duration_secs(bytes, mime) {
            Ok(secs) => Some(secs),
            Err(e) => {
                log::warn!("sampling: {} could not decode clip: {e}", self.decoder.name());
                None
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
