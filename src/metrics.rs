//! Metrics initialization for the Prometheus exporter.

use metrics::{Unit, describe_counter, describe_histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::config::MetricsConfig;
use crate::error::{Error, Result};

/// Initialize the metrics system based on configuration.
///
/// When metrics are enabled, this starts an HTTP server that exposes
/// a `/metrics` endpoint for Prometheus to scrape.
///
/// When metrics are disabled, this is a no-op. The `metrics` crate
/// handles unregistered metrics gracefully (they become no-ops).
pub fn init(config: &MetricsConfig) -> Result<()> {
    if !config.enabled {
        return Ok(());
    }

    PrometheusBuilder::new()
        .with_http_listener(config.listen)
        .install()
        .map_err(|e| Error::Metrics(e.to_string()))?;

    describe();
    Ok(())
}

fn describe() {
    describe_counter!(
        "dohrelay_bootstrap_lookups_total",
        "Upstream hostname lookups, by source (literal, cache, network)"
    );
    describe_counter!(
        "dohrelay_bootstrap_failures_total",
        "Upstream hostname lookups that failed on every bootstrap server"
    );
    describe_counter!(
        "dohrelay_race_total",
        "Completed races, by outcome (success, fallback, timeout, failed, cancelled)"
    );
    describe_histogram!(
        "dohrelay_race_duration_seconds",
        Unit::Seconds,
        "Time from the start of a race until it settled"
    );
}
