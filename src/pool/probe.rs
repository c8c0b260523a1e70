//! Health-check probe: one bounded TLS-over-SOCKS5 liveness check
//!
//! A probe opens a tunnel to the pool-wide probe target through the
//! upstream under test and completes a TLS handshake over it. Success
//! marks the record active with the measured wall time; any failure,
//! timeout or cancellation marks it inactive. Errors are consumed
//! here, never returned.

use super::tls::{probe_client_config, TlsPolicyCell};
use super::upstream::Upstream;
use crate::common::net::split_host_port;
use crate::outbound::Socks5Dialer;
use crate::{Error, Result};
use rustls::ServerName;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub(crate) async fn check_upstream(
    token: &CancellationToken,
    upstream: &Upstream,
    target: &str,
    probe_timeout: Duration,
    tls: &Arc<TlsPolicyCell>,
) {
    let start = Instant::now();

    let (username, password) = upstream.credentials();
    let dialer = match Socks5Dialer::new(upstream.address(), username, password) {
        Ok(d) => d,
        Err(e) => {
            warn!(upstream = %upstream.address(), err = %e, "failed to build SOCKS5 dialer for probe");
            upstream.mark_inactive(&e);
            return;
        }
    };

    // The host part of the target doubles as the SNI unless overridden.
    let host = match split_host_port(target) {
        Ok((host, _)) => host,
        Err(e) => {
            warn!(upstream = %upstream.address(), target = %target, err = %e, "invalid probe target");
            upstream.mark_inactive(&e);
            return;
        }
    };

    let policy = tls.current();
    let sni = policy.sni_override.as_deref().unwrap_or(host);
    let server_name = match ServerName::try_from(sni) {
        Ok(name) => name,
        Err(_) => {
            let e = Error::tls(format!("invalid SNI '{}'", sni));
            warn!(upstream = %upstream.address(), err = %e, "probe aborted");
            upstream.mark_inactive(&e);
            return;
        }
    };

    let connector = TlsConnector::from(Arc::new(probe_client_config(tls)));

    let outcome = tokio::select! {
        res = timeout(
            probe_timeout,
            probe_once(&dialer, &connector, server_name, target),
        ) => match res {
            Ok(inner) => inner,
            Err(_) => Err(Error::timeout(format!(
                "probe of '{}' exceeded {:?}",
                target, probe_timeout
            ))),
        },
        // Dropping the in-flight future closes any half-open tunnel.
        _ = token.cancelled() => Err(Error::cancelled("probe cancelled")),
    };

    match outcome {
        Ok(()) => {
            let elapsed = start.elapsed();
            upstream.mark_active(elapsed);
            debug!(
                upstream = %upstream.address(),
                response_time_ms = elapsed.as_millis() as u64,
                "upstream is active"
            );
        }
        Err(e) => {
            warn!(upstream = %upstream.address(), target = %target, err = %e, "probe failed");
            upstream.mark_inactive(&e);
        }
    }
}

/// Tunnel to the target through the upstream and complete a TLS
/// handshake over it. The stream is dropped immediately afterwards;
/// the probe only cares that the handshake succeeded.
async fn probe_once(
    dialer: &Socks5Dialer,
    connector: &TlsConnector,
    server_name: ServerName,
    target: &str,
) -> Result<()> {
    let stream = dialer.dial("tcp", target).await?;
    let tls_stream = connector
        .connect(server_name, stream)
        .await
        .map_err(|e| Error::tls(format!("TLS handshake failed: {}", e)))?;
    drop(tls_stream);
    Ok(())
}
