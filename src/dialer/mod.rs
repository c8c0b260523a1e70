//! Dial orchestrator: glue between a client session and the pool
//!
//! Picks one active upstream, opens a SOCKS5 tunnel through it to the
//! requested target under a hard 15-second cap, and accounts the
//! outcome. No retry and no fallback to another upstream: a failed
//! dial is the caller's problem to report.

use crate::outbound::Socks5Dialer;
use crate::pool::Pool;
use crate::{Error, Result};
use metrics::counter;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Hard cap on one upstream dial, derived from the caller's scope.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(15);

const REQUESTS_TOTAL: &str = "sockspool_socks_requests_total";
const REQUESTS_SUCCESS_TOTAL: &str = "sockspool_socks_requests_success_total";
const REQUESTS_FAILED_TOTAL: &str = "sockspool_socks_requests_failed_total";
const UPSTREAM_SUCCESS_TOTAL: &str = "sockspool_upstream_success_total";
const UPSTREAM_FAIL_TOTAL: &str = "sockspool_upstream_fail_total";

/// Process-wide request totals, readable without locks.
#[derive(Debug, Default)]
pub struct GatewayMetrics {
    total_requests: AtomicU64,
    total_success: AtomicU64,
    total_failed: AtomicU64,
}

impl GatewayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn total_success(&self) -> u64 {
        self.total_success.load(Ordering::Relaxed)
    }

    pub fn total_failed(&self) -> u64 {
        self.total_failed.load(Ordering::Relaxed)
    }

    fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        counter!(REQUESTS_TOTAL).increment(1);
    }

    fn record_success(&self) {
        self.total_success.fetch_add(1, Ordering::Relaxed);
        counter!(REQUESTS_SUCCESS_TOTAL).increment(1);
    }

    fn record_failure(&self) {
        self.total_failed.fetch_add(1, Ordering::Relaxed);
        counter!(REQUESTS_FAILED_TOTAL).increment(1);
    }
}

/// Routes each client dial through one selected upstream.
pub struct Dialer {
    pool: Arc<Pool>,
    metrics: Arc<GatewayMetrics>,
}

impl Dialer {
    pub fn new(pool: Arc<Pool>, metrics: Arc<GatewayMetrics>) -> Self {
        Dialer { pool, metrics }
    }

    pub fn metrics(&self) -> &Arc<GatewayMetrics> {
        &self.metrics
    }

    /// Dial `addr` (`host:port`) through one active upstream.
    ///
    /// The returned connection is owned by the caller. Cancellation of
    /// `scope` pre-empts an in-flight dial and closes its connection.
    pub async fn dial(
        &self,
        scope: &CancellationToken,
        network: &str,
        addr: &str,
    ) -> Result<TcpStream> {
        self.metrics.record_request();

        let upstream = match self.pool.get_active_upstream().await {
            Ok(up) => up,
            Err(e) => {
                self.metrics.record_failure();
                warn!(target = %addr, err = %e, "failed to get active upstream");
                return Err(e);
            }
        };

        let (username, password) = upstream.credentials();
        let dialer = match Socks5Dialer::new(upstream.address(), username, password) {
            Ok(d) => d,
            Err(e) => {
                self.metrics.record_failure();
                upstream.record_failure();
                counter!(UPSTREAM_FAIL_TOTAL, "upstream" => upstream.address().to_string())
                    .increment(1);
                warn!(upstream = %upstream.address(), target = %addr, err = %e, "failed to build SOCKS5 dialer");
                return Err(e);
            }
        };

        let outcome = tokio::select! {
            res = timeout(DIAL_TIMEOUT, dialer.dial(network, addr)) => match res {
                Ok(inner) => inner,
                Err(_) => Err(Error::timeout(format!(
                    "dialing {} via upstream {} exceeded {:?}",
                    addr,
                    upstream.address(),
                    DIAL_TIMEOUT
                ))),
            },
            // Dropping the dial future closes any in-flight connection.
            _ = scope.cancelled() => Err(Error::cancelled(format!(
                "dialing {} via upstream {} was cancelled",
                addr,
                upstream.address()
            ))),
        };

        match outcome {
            Ok(conn) => {
                self.metrics.record_success();
                upstream.record_success();
                counter!(UPSTREAM_SUCCESS_TOTAL, "upstream" => upstream.address().to_string())
                    .increment(1);
                debug!(upstream = %upstream.address(), target = %addr, "connected");
                Ok(conn)
            }
            Err(e) => {
                self.metrics.record_failure();
                upstream.record_failure();
                counter!(UPSTREAM_FAIL_TOTAL, "upstream" => upstream.address().to_string())
                    .increment(1);
                warn!(upstream = %upstream.address(), target = %addr, err = %e, "dial failed");
                Err(e)
            }
        }
    }
}
