use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Histogram bucket boundaries for latency metrics (seconds).
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

/// Thin handle around the global metrics recorder.
///
/// After `Metrics::install()` the `metrics` crate macros (`counter!`, `gauge!`,
/// `histogram!`) can be used anywhere in the codebase. The `PrometheusHandle`
/// is retained solely for rendering the `/metrics` endpoint.
#[derive(Clone)]
pub struct Metrics {
    handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global Prometheus recorder and register metric
    /// descriptions. Must be called once at startup.
    pub fn install() -> Self {
        let handle = PrometheusBuilder::new()
            .set_buckets_for_metric(
                metrics_exporter_prometheus::Matcher::Suffix("_duration_seconds".to_string()),
                LATENCY_BUCKETS,
            )
            .expect("valid matcher")
            .install_recorder()
            .expect("failed to install metrics recorder");

        describe_counter!(
            "headless_proxy_requests_total",
            Unit::Count,
            "Total requests processed"
        );
        describe_counter!(
            "headless_proxy_upstream_requests_total",
            Unit::Count,
            "Total requests dispatched to the upstream proxy"
        );
        describe_histogram!(
            "headless_proxy_request_duration_seconds",
            Unit::Seconds,
            "Total request duration from client perspective"
        );
        describe_histogram!(
            "headless_proxy_upstream_duration_seconds",
            Unit::Seconds,
            "Upstream round-trip duration"
        );
        describe_counter!(
            "headless_proxy_sessions_created_total",
            Unit::Count,
            "Upstream sessions created"
        );
        describe_counter!(
            "headless_proxy_adblocked_total",
            Unit::Count,
            "Requests rejected by ad-block rules"
        );
        describe_counter!(
            "headless_proxy_upstream_errors_total",
            Unit::Count,
            "Responses carrying an upstream error header"
        );
        describe_counter!(
            "headless_proxy_errors_total",
            Unit::Count,
            "Generic request errors (status >= 400 or transport failure)"
        );
        describe_gauge!(
            "headless_proxy_connections_active",
            Unit::Count,
            "Number of active downstream connections"
        );
        describe_counter!(
            "headless_proxy_connections_total",
            Unit::Count,
            "Total downstream connections accepted"
        );

        Self { handle }
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}
