//! Metrics exposition and the periodic statistics updater
//!
//! Request counters are recorded inline on the dial path; this module
//! installs the Prometheus exporter and runs the task that projects
//! the pool snapshot into per-upstream gauges, alongside a periodic
//! human-readable summary line.

use crate::dialer::GatewayMetrics;
use crate::pool::Pool;
use crate::{Error, Result};
use metrics::gauge;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const UPSTREAM_ACTIVE: &str = "sockspool_upstream_active";
const UPSTREAM_RESPONSE_TIME: &str = "sockspool_upstream_response_time_seconds";

/// Install the Prometheus recorder with its HTTP exposition endpoint.
pub fn install_exporter(addr: SocketAddr) -> Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| Error::config(format!("failed to install Prometheus exporter: {}", e)))?;

    info!(listen = %addr, "metrics endpoint serving /metrics");
    Ok(())
}

/// Start the periodic updater: exports per-upstream gauges and logs a
/// summary of the global counters until the scope is cancelled.
pub fn spawn_updater(
    pool: Arc<Pool>,
    metrics: Arc<GatewayMetrics>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if interval.is_zero() {
            debug!("metrics updater disabled (zero interval)");
            return;
        }

        debug!("metrics updater started");
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => update_once(&pool, &metrics).await,
                _ = shutdown.cancelled() => {
                    debug!("metrics updater stopping");
                    return;
                }
            }
        }
    })
}

async fn update_once(pool: &Pool, metrics: &GatewayMetrics) {
    let total = metrics.total_requests();
    let success = metrics.total_success();
    let failed = metrics.total_failed();
    let success_rate = if total > 0 {
        success as f64 / total as f64 * 100.0
    } else {
        0.0
    };
    info!(
        total,
        success,
        failed,
        success_rate = %format!("{:.1}%", success_rate),
        "request totals"
    );

    for snap in pool.snapshot().await {
        gauge!(UPSTREAM_ACTIVE, "upstream" => snap.address.clone())
            .set(if snap.is_active { 1.0 } else { 0.0 });
        gauge!(UPSTREAM_RESPONSE_TIME, "upstream" => snap.address.clone())
            .set(snap.response_time_ms.unwrap_or(0) as f64 / 1000.0);

        let last_check = snap
            .last_check
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "never".to_string());
        info!(
            upstream = %snap.address,
            active = snap.is_active,
            response_time_ms = snap.response_time_ms.unwrap_or(0),
            last_check = %last_check,
            success = snap.success_count,
            fail = snap.fail_count,
            "upstream status"
        );
    }
}
