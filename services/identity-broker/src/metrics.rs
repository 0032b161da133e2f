//! Prometheus metrics exposition
//!
//! Broker-level metrics:
//!
//! - `broker_requests_total` (counter): labels `route`, `status`
//! - `broker_request_duration_seconds` (histogram): label `route`
//!
//! Pool metrics (`identity_pool_*`) are emitted by the pool crate and exported
//! through the same recorder.

use std::time::Instant;

use anyhow::Context;
use axum::extract::{MatchedPath, Request};
use axum::middleware::Next;
use axum::response::Response;
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

const DURATION_METRIC: &str = "broker_request_duration_seconds";

/// Bucket boundaries from 5ms to 120s; acquisitions may block while waiting
/// for an identity to free up or be created.
const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0,
];

fn builder() -> anyhow::Result<PrometheusBuilder> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Full(DURATION_METRIC.to_string()), DURATION_BUCKETS)
        .context("failed to set histogram buckets")
}

/// Install the global Prometheus recorder and return a handle for rendering.
pub fn install_recorder() -> anyhow::Result<PrometheusHandle> {
    builder()?
        .install_recorder()
        .context("failed to install Prometheus recorder")
}

/// Record a completed request against its route template.
pub fn record_request(route: &str, status: u16, duration_secs: f64) {
    metrics::counter!(
        "broker_requests_total",
        "route" => route.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    metrics::histogram!(DURATION_METRIC, "route" => route.to_string()).record(duration_secs);
}

/// Middleware timing every request. Routes are labelled by their template
/// (`/pools/{pool}/acquire`), never by concrete ids.
pub async fn track_requests(request: Request, next: Next) -> Response {
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_owned())
        .unwrap_or_else(|| "unmatched".to_owned());
    let method = request.method().clone();
    let started = Instant::now();

    let response = next.run(request).await;

    let elapsed = started.elapsed();
    let status = response.status().as_u16();
    record_request(&route, status, elapsed.as_secs_f64());
    tracing::debug!(
        %method,
        route,
        status,
        duration_ms = elapsed.as_millis() as u64,
        "request completed"
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_exporter_prometheus::PrometheusRecorder;

    fn isolated_recorder() -> (PrometheusRecorder, PrometheusHandle) {
        let recorder = builder().unwrap().build_recorder();
        let handle = recorder.handle();
        (recorder, handle)
    }

    #[test]
    fn record_request_without_recorder_is_noop() {
        record_request("/health", 200, 0.01);
    }

    #[test]
    fn record_request_renders_counter_and_histogram() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        record_request("/pools/{pool}/acquire", 200, 0.042);
        record_request("/pools/{pool}/acquire", 503, 1.5);

        let output = handle.render();
        assert!(output.contains("broker_requests_total"));
        assert!(output.contains("route=\"/pools/{pool}/acquire\""));
        assert!(output.contains("status=\"503\""));
        assert!(
            output.contains("broker_request_duration_seconds_bucket"),
            "histogram must render _bucket lines"
        );
        assert!(output.contains("le=\"120\""), "slow acquisitions need a 120s bucket");
    }
}
