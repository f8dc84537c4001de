//! Advisory rate limiting from the endpoint's queue-depth gauge.
//!
//! [`RateLimiter::should_throttle`] polls a [`LoadSignal`] at most once per
//! poll interval and reuses the last decision in between.  The first time
//! the signal cannot be read the limiter turns itself off for the rest of
//! the run and answers `false` from then on.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;

use crate::config::{EndpointConfig, ThrottleConfig};

/// The metrics scrape gets its own short timeout, independent of captioning.
const METRICS_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// SignalError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("metrics request failed: {0}")]
    Request(String),

    #[error("metrics endpoint returned HTTP {0}")]
    Status(u16),

    #[error("gauge {0:?} not present in metrics output")]
    MissingGauge(String),
}

impl From<reqwest::Error> for SignalError {
    fn from(e: reqwest::Error) -> Self {
        SignalError::Request(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// LoadSignal trait
// ---------------------------------------------------------------------------

/// Source of the remote "requests waiting" figure.
#[async_trait]
pub trait LoadSignal: Send + Sync {
    async fn queue_depth(&self) -> Result<f64, SignalError>;
}

/// Scrapes one gauge from a plain-text metrics exposition endpoint.
pub struct MetricsSignal {
    client: reqwest::Client,
    url: String,
    gauge: String,
}

impl MetricsSignal {
    pub fn new(url: impl Into<String>, gauge: impl Into<String>) -> Result<Self, SignalError> {
        let client = reqwest::Client::builder()
            .timeout(METRICS_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
            gauge: gauge.into(),
        })
    }
}

#[async_trait]
impl LoadSignal for MetricsSignal {
    async fn queue_depth(&self) -> Result<f64, SignalError> {
        let response = self.client.get(&self.url).send().await?;
        if !response.status().is_success() {
            return Err(SignalError::Status(response.status().as_u16()));
        }
        let text = response.text().await?;
        parse_gauge(&text, &self.gauge).ok_or_else(|| SignalError::MissingGauge(self.gauge.clone()))
    }
}

/// Value of gauge `name` in exposition-format `text`.
///
/// Label sets are ignored and the values of every matching sample are
/// summed.  Returns `None` when no sample of `name` parses.
///
/// ```
/// use batch_captioner::client::parse_gauge;
///
/// let text = "# HELP vllm:num_requests_waiting waiting\n\
///             vllm:num_requests_waiting{model_name=\"m\"} 12.0\n";
/// assert_eq!(parse_gauge(text, "vllm:num_requests_waiting"), Some(12.0));
/// ```
pub fn parse_gauge(text: &str, name: &str) -> Option<f64> {
    let mut total: Option<f64> = None;
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let metric_end = line
            .find(|c: char| c == '{' || c.is_whitespace())
            .unwrap_or(line.len());
        if &line[..metric_end] != name {
            continue;
        }
        let value = line
            .rsplit(|c: char| c.is_whitespace() || c == '}')
            .find(|tok| !tok.is_empty())
            .and_then(|tok| tok.parse::<f64>().ok());
        if let Some(v) = value {
            total = Some(total.unwrap_or(0.0) + v);
        }
    }
    total
}

// ---------------------------------------------------------------------------
// RateLimiter
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct PollState {
    last_poll: Option<Instant>,
    throttled: bool,
}

/// Advisory throttle shared by every worker.
pub struct RateLimiter {
    signal: Option<Arc<dyn LoadSignal>>,
    threshold: f64,
    poll_interval: Duration,
    disabled: AtomicBool,
    state: Mutex<PollState>,
}

impl RateLimiter {
    pub fn new(signal: Arc<dyn LoadSignal>, threshold: f64, poll_interval: Duration) -> Self {
        Self {
            signal: Some(signal),
            threshold,
            poll_interval,
            disabled: AtomicBool::new(false),
            state: Mutex::new(PollState::default()),
        }
    }

    /// A limiter that never throttles.
    pub fn disabled() -> Self {
        Self {
            signal: None,
            threshold: f64::INFINITY,
            poll_interval: Duration::ZERO,
            disabled: AtomicBool::new(true),
            state: Mutex::new(PollState::default()),
        }
    }

    /// Build from config; a disabled section or an unbuildable HTTP client
    /// yields [`RateLimiter::disabled`].
    pub fn from_config(throttle: &ThrottleConfig, endpoint: &EndpointConfig) -> Self {
        if !throttle.enabled {
            return Self::disabled();
        }
        let url = throttle.resolve_metrics_url(&endpoint.base_url);
        match MetricsSignal::new(url.clone(), throttle.gauge.clone()) {
            Ok(signal) => {
                log::info!(
                    "throttle: polling {url} every {} ms, threshold {}",
                    throttle.poll_interval_ms,
                    throttle.queue_threshold
                );
                Self::new(
                    Arc::new(signal),
                    throttle.queue_threshold,
                    Duration::from_millis(throttle.poll_interval_ms),
                )
            }
            Err(e) => {
                log::warn!("throttle: metrics client unavailable ({e}); throttling off");
                Self::disabled()
            }
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Relaxed)
    }

    /// `true` when the last observed queue depth is at or above the threshold.
    ///
    /// Polls the signal only when the previous poll is older than the poll
    /// interval; concurrent callers inside the interval share one decision.
    pub async fn should_throttle(&self) -> bool {
        if self.is_disabled() {
            return false;
        }
        let Some(signal) = &self.signal else {
            return false;
        };

        {
            let mut st = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(last) = st.last_poll {
                if last.elapsed() < self.poll_interval {
                    return st.throttled;
                }
            }
            st.last_poll = Some(Instant::now());
        }

        match signal.queue_depth().await {
            Ok(depth) => {
                let throttled = depth >= self.threshold;
                self.state
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .throttled = throttled;
                if throttled {
                    log::debug!("throttle: queue depth {depth} >= {}", self.threshold);
                }
                throttled
            }
            Err(e) => {
                if !self.disabled.swap(true, Ordering::Relaxed) {
                    log::warn!("throttle: load signal unavailable ({e}); disabled for this run");
                }
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    // -----------------------------------------------------------------------
    // Test doubles
    // -----------------------------------------------------------------------

    /// Reports a fixed depth and counts polls.
    struct FixedDepth {
        depth: f64,
        polls: AtomicUsize,
    }

    impl FixedDepth {
        fn new(depth: f64) -> Arc<Self> {
            Arc::new(Self {
                depth,
                polls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl LoadSignal for FixedDepth {
        async fn queue_depth(&self) -> Result<f64, SignalError> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            Ok(self.depth)
        }
    }

    /// Always fails and counts polls.
    #[derive(Default)]
    struct Unreachable {
        polls: AtomicUsize,
    }

    #[async_trait]
    impl LoadSignal for Unreachable {
        async fn queue_depth(&self) -> Result<f64, SignalError> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            Err(SignalError::Request("connection refused".into()))
        }
    }

    // -----------------------------------------------------------------------
    // parse_gauge
    // -----------------------------------------------------------------------

    #[test]
    fn parse_gauge_reads_labelled_and_bare_samples() {
        let text = "\
# HELP vllm:num_requests_waiting Number of requests waiting.
# TYPE vllm:num_requests_waiting gauge
vllm:num_requests_running{model_name=\"a\"} 40.0
vllm:num_requests_waiting{model_name=\"a\"} 3.0
vllm:num_requests_waiting{model_name=\"b\"} 4.0
";
        assert_eq!(parse_gauge(text, "vllm:num_requests_waiting"), Some(7.0));
        assert_eq!(parse_gauge(text, "vllm:num_requests_running"), Some(40.0));
        assert_eq!(parse_gauge("queue_depth 9\n", "queue_depth"), Some(9.0));
    }

    #[test]
    fn parse_gauge_ignores_prefix_matches_and_garbage() {
        let text = "vllm:num_requests_waiting_total 100\nvllm:num_requests_waiting NaNx\n";
        assert_eq!(parse_gauge(text, "vllm:num_requests_waiting"), None);
        assert_eq!(parse_gauge("", "anything"), None);
    }

    // -----------------------------------------------------------------------
    // RateLimiter
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn throttles_at_or_above_threshold() {
        let at = RateLimiter::new(FixedDepth::new(10.0), 10.0, Duration::ZERO);
        assert!(at.should_throttle().await);

        let below = RateLimiter::new(FixedDepth::new(9.0), 10.0, Duration::ZERO);
        assert!(!below.should_throttle().await);
    }

    #[tokio::test]
    async fn polls_at_most_once_per_interval() {
        let signal = FixedDepth::new(50.0);
        let limiter = RateLimiter::new(signal.clone(), 10.0, Duration::from_secs(3600));

        for _ in 0..5 {
            assert!(limiter.should_throttle().await);
        }
        assert_eq!(signal.polls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unavailable_signal_disables_permanently() {
        let signal = Arc::new(Unreachable::default());
        let limiter = RateLimiter::new(signal.clone(), 1.0, Duration::ZERO);

        assert!(!limiter.should_throttle().await);
        assert!(limiter.is_disabled());
        for _ in 0..3 {
            assert!(!limiter.should_throttle().await);
        }
        assert_eq!(signal.polls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn disabled_limiter_never_throttles() {
        let limiter = RateLimiter::disabled();
        assert!(limiter.is_disabled());
        assert!(!limiter.should_throttle().await);
    }

    #[test]
    fn from_config_respects_enabled_flag() {
        let endpoint = EndpointConfig::default();
        let off = RateLimiter::from_config(&ThrottleConfig::default(), &endpoint);
        assert!(off.is_disabled());

        let on = ThrottleConfig {
            enabled: true,
            ..ThrottleConfig::default()
        };
        assert!(!RateLimiter::from_config(&on, &endpoint).is_disabled());
    }

    // -----------------------------------------------------------------------
    // MetricsSignal over HTTP
    // -----------------------------------------------------------------------

    const GAUGE: &str = "vllm:num_requests_waiting";

    /// Serve one canned HTTP response on a local port; returns its URL.
    async fn serve_once(status: &'static str, body: &'static str) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }
            let response = format!(
                "HTTP/1.1 {status}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
        });
        format!("http://{addr}/metrics")
    }

    #[tokio::test]
    async fn metrics_signal_sums_gauge_from_exposition() {
        let url = serve_once(
            "200 OK",
            "# TYPE vllm:num_requests_waiting gauge\n\
             vllm:num_requests_waiting{model_name=\"a\"} 3.0\n\
             vllm:num_requests_waiting{model_name=\"b\"} 4.0\n",
        )
        .await;
        let signal = MetricsSignal::new(url, GAUGE).unwrap();
        assert_eq!(signal.queue_depth().await.unwrap(), 7.0);
    }

    #[tokio::test]
    async fn metrics_signal_reports_error_status() {
        let url = serve_once("503 Service Unavailable", "overloaded").await;
        let signal = MetricsSignal::new(url, GAUGE).unwrap();
        assert!(matches!(
            signal.queue_depth().await,
            Err(SignalError::Status(503))
        ));
    }

    #[tokio::test]
    async fn metrics_signal_reports_missing_gauge() {
        let url = serve_once("200 OK", "vllm:num_requests_running 2.0\n").await;
        let signal = MetricsSignal::new(url, GAUGE).unwrap();
        match signal.queue_depth().await {
            Err(SignalError::MissingGauge(name)) => assert_eq!(name, GAUGE),
            other => panic!("expected missing gauge, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_gauge_disables_limiter() {
        let url = serve_once("200 OK", "# nothing here\n").await;
        let signal = Arc::new(MetricsSignal::new(url, GAUGE).unwrap());
        let limiter = RateLimiter::new(signal, 1.0, Duration::ZERO);
        assert!(!limiter.should_throttle().await);
        assert!(limiter.is_disabled());
    }
}
