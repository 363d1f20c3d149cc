//! Prometheus metrics for proxied traffic.
//!
//! Handles are registered on a recorder owned by [`GatewayMetrics`] rather than
//! a process-global one, so every server instance (and every test) gets its own
//! registry.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{Request, State};
use axum::http::header::CONTENT_TYPE;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use metrics::{Counter, Gauge, Histogram, Unit};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

use crate::errors::GateError;

pub const REQUEST_TOTAL: &str = "http_request_total";
pub const REQUEST_DURATION: &str = "http_request_duration_seconds";
pub const REQUEST_DENIED: &str = "http_request_denied_total";
pub const REQUEST_IN_FLIGHT: &str = "http_request_in_flight";

const DURATION_BUCKETS: &[f64] = &[0.25, 0.5, 1.0, 2.5, 5.0, 10.0];
const UPKEEP_INTERVAL: Duration = Duration::from_secs(5);

pub struct GatewayMetrics {
    handle: PrometheusHandle,
    total: Counter,
    duration: Histogram,
    denied: Counter,
    in_flight: Gauge,
}

impl std::fmt::Debug for GatewayMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayMetrics").finish_non_exhaustive()
    }
}

impl GatewayMetrics {
    pub fn new() -> Result<Self, GateError> {
        let recorder = PrometheusBuilder::new()
            .set_buckets_for_metric(Matcher::Full(REQUEST_DURATION.to_string()), DURATION_BUCKETS)?
            .build_recorder();
        let handle = recorder.handle();

        let (total, duration, denied, in_flight) = metrics::with_local_recorder(&recorder, || {
            metrics::describe_counter!(REQUEST_TOTAL, "Total number of HTTP requests received");
            metrics::describe_histogram!(
                REQUEST_DURATION,
                Unit::Seconds,
                "Time taken to answer an HTTP request"
            );
            metrics::describe_counter!(
                REQUEST_DENIED,
                "Requests rejected by a policy, either denied or failed to evaluate"
            );
            metrics::describe_gauge!(REQUEST_IN_FLIGHT, "HTTP requests currently being served");
            (
                metrics::counter!(REQUEST_TOTAL),
                metrics::histogram!(REQUEST_DURATION),
                metrics::counter!(REQUEST_DENIED),
                metrics::gauge!(REQUEST_IN_FLIGHT),
            )
        });

        Ok(Self {
            handle,
            total,
            duration,
            denied,
            in_flight,
        })
    }

    /// Count the request and track it as in flight until the guard drops.
    pub fn start_request(&self) -> RequestTimer<'_> {
        self.total.increment(1);
        self.in_flight.increment(1.0);
        RequestTimer {
            metrics: self,
            started: Instant::now(),
        }
    }

    pub fn record_denied(&self) {
        self.denied.increment(1);
    }

    /// Prometheus text exposition of every registered metric.
    pub fn render(&self) -> String {
        self.handle.render()
    }

    /// Drain histogram buckets periodically so memory stays bounded.
    pub async fn run_upkeep(self: Arc<Self>) {
        let mut interval = tokio::time::interval(UPKEEP_INTERVAL);
        loop {
            interval.tick().await;
            self.handle.run_upkeep();
        }
    }
}

/// Records duration and leaves the in-flight gauge on drop, including when the
/// request future is cancelled.
pub struct RequestTimer<'a> {
    metrics: &'a GatewayMetrics,
    started: Instant,
}

impl Drop for RequestTimer<'_> {
    fn drop(&mut self) {
        self.metrics
            .duration
            .record(self.started.elapsed().as_secs_f64());
        self.metrics.in_flight.decrement(1.0);
    }
}

/// Middleware wrapping every request the proxy listener serves, 404s included.
pub async fn track_requests(
    State(metrics): State<Arc<GatewayMetrics>>,
    request: Request,
    next: Next,
) -> Response {
    let _timer = metrics.start_request();
    next.run(request).await
}

async fn scrape(State(metrics): State<Arc<GatewayMetrics>>) -> impl IntoResponse {
    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics.render(),
    )
}

pub fn router(metrics: Arc<GatewayMetrics>) -> Router {
    Router::new()
        .route("/metrics", get(scrape))
        .with_state(metrics)
}
