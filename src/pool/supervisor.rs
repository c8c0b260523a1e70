//! Per-upstream supervisor task
//!
//! One supervisor runs per live upstream. It probes immediately on
//! start, then on every tick of the check interval, until its own
//! scope or the pool-wide scope is cancelled. After cancellation the
//! task returns and never touches its record again.

use super::probe::check_upstream;
use super::tls::TlsPolicyCell;
use super::upstream::Upstream;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Start the supervisor for `upstream`, installing its cancel handle
/// on the record before the task is spawned.
///
/// Called by the reconciler under the pool write lock; the first probe
/// runs on the spawned task, after the lock has been released.
pub(crate) fn start(
    upstream: Arc<Upstream>,
    parent: &CancellationToken,
    check_interval: Duration,
    probe_timeout: Duration,
    probe_target: String,
    tls: Arc<TlsPolicyCell>,
) {
    let token = parent.child_token();
    upstream.set_cancel(token.clone());

    let handle = tokio::spawn({
        let upstream = upstream.clone();
        async move {
            debug!(upstream = %upstream.address(), "supervisor started");

            check_upstream(&token, &upstream, &probe_target, probe_timeout, &tls).await;

            if check_interval.is_zero() {
                warn!(
                    upstream = %upstream.address(),
                    "invalid check interval, supervisor will not probe periodically"
                );
                token.cancelled().await;
                debug!(upstream = %upstream.address(), "supervisor stopped");
                return;
            }

            let mut ticker = tokio::time::interval(check_interval);
            // The first tick completes immediately; the initial probe
            // already ran, so consume it.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        check_upstream(&token, &upstream, &probe_target, probe_timeout, &tls).await;
                    }
                    _ = token.cancelled() => break,
                }
            }

            debug!(upstream = %upstream.address(), "supervisor stopped");
        }
    });

    upstream.set_task(handle);
}
