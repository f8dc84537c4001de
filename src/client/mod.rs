//! Remote endpoint clients.
//!
//! This module provides:
//! * [`Captioner`]: async trait implemented by every captioning backend.
//! * [`ApiCaptioner`]: OpenAI-compatible chat-completions backend that
//!   sends the clip as a base64 `audio_url` part.
//! * [`RateLimiter`]: advisory throttle fed by a [`LoadSignal`]; the
//!   production signal is [`MetricsSignal`], which scrapes one gauge from
//!   the endpoint's metrics page.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use batch_captioner::client::{ApiCaptioner, Captioner, RateLimiter};
//! use batch_captioner::config::JobConfig;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = JobConfig::default();
//!     let captioner = ApiCaptioner::from_config(&config.endpoint).unwrap();
//!     let limiter = RateLimiter::from_config(&config.throttle, &config.endpoint);
//!
//!     if !limiter.should_throttle().await {
//!         let bytes = std::fs::read("clip.flac").unwrap();
//!         let caption = captioner.caption(&bytes, "audio/flac").await.unwrap();
//!         println!("{}", caption.text);
//!     }
//! }
//! ```

pub mod captioner;
pub mod throttle;

// ---------------------------------------------------------------------------
// Public re-exports
// ---------------------------------------------------------------------------

pub use captioner::{parse_completion, ApiCaptioner, Caption, CaptionError, Captioner};
pub use throttle::{parse_gauge, LoadSignal, MetricsSignal, RateLimiter, SignalError};
