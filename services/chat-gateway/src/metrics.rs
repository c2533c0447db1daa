//! Prometheus metrics exposition and request accounting
//!
//! - `chat_requests_total` (counter): labels `status`, `stream`
//! - `chat_request_duration_seconds` (histogram): label `status`
//! - `chat_upstream_errors_total` (counter): label `error_type`
//! - `chat_retries_total` (counter)
//! - `token_pool_active`, `token_pool_quarantined` (gauges, set by the pool)

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Instant;

use bytes::Bytes;
use futures_util::Stream;
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};
use pin_project_lite::pin_project;

const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

fn builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new().set_buckets_for_metric(
        Matcher::Full("chat_request_duration_seconds".to_string()),
        DURATION_BUCKETS,
    )
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// `chat_request_duration_seconds` gets explicit buckets so it renders as a
/// histogram rather than a summary.
pub fn install_recorder() -> anyhow::Result<PrometheusHandle> {
    Ok(builder()?.install_recorder()?)
}

/// Record a finished chat request.
pub fn record_request(status: u16, stream: bool, duration_secs: f64) {
    let status_str = status.to_string();
    metrics::counter!("chat_requests_total", "status" => status_str.clone(), "stream" => stream.to_string())
        .increment(1);
    metrics::histogram!("chat_request_duration_seconds", "status" => status_str)
        .record(duration_secs);
}

/// Record a failed upstream attempt.
pub fn record_upstream_error(error_type: &str) {
    metrics::counter!("chat_upstream_errors_total", "error_type" => error_type.to_string())
        .increment(1);
}

pub fn record_retry() {
    metrics::counter!("chat_retries_total").increment(1);
}

/// Process-wide counters for the health endpoint.
#[derive(Clone)]
pub struct ServiceCounters {
    pub requests_total: Arc<AtomicU64>,
    pub errors_total: Arc<AtomicU64>,
    /// Requests currently being served, streams included until they end.
    pub in_flight: Arc<AtomicU64>,
    pub started_at: Instant,
}

impl ServiceCounters {
    pub fn new() -> Self {
        Self {
            requests_total: Arc::new(AtomicU64::new(0)),
            errors_total: Arc::new(AtomicU64::new(0)),
            in_flight: Arc::new(AtomicU64::new(0)),
            started_at: Instant::now(),
        }
    }

    /// Count a new request and hold it in flight until the guard drops.
    pub fn begin(&self) -> InFlightGuard {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            in_flight: self.in_flight.clone(),
        }
    }

    pub fn record_error(&self) {
        self.errors_total.fetch_add(1, Ordering::Relaxed);
    }
}

/// Decrements the in-flight counter on drop.
pub struct InFlightGuard {
    in_flight: Arc<AtomicU64>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

pin_project! {
    /// SSE body that stays in flight until it ends or the caller goes away,
    /// then records the request.
    pub struct TrackedStream<S> {
        #[pin]
        inner: S,
        guard: Option<InFlightGuard>,
        started: Instant,
    }

    impl<S> PinnedDrop for TrackedStream<S> {
        fn drop(this: Pin<&mut Self>) {
            let this = this.project();
            if let Some(guard) = this.guard.take() {
                record_request(200, true, this.started.elapsed().as_secs_f64());
                drop(guard);
            }
        }
    }
}

impl<S> TrackedStream<S> {
    pub fn new(inner: S, guard: InFlightGuard, started: Instant) -> Self {
        Self {
            inner,
            guard: Some(guard),
            started,
        }
    }
}

impl<S: Stream<Item = Bytes>> Stream for TrackedStream<S> {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.project().inner.poll_next(cx).map(|item| item.map(Ok))
    }
}
