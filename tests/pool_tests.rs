//! Integration tests for the upstream pool and the dial path
//!
//! Upstreams are stood in for by local mock SOCKS5 servers; probe
//! targets are never reached, so records are driven to active state
//! through the pool's public surface where a real handshake would be
//! required.

use sockspool::config::DefinitionsManager;
use sockspool::dialer::{Dialer, GatewayMetrics};
use sockspool::pool::Pool;
use sockspool::Error;
use std::future::Future;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const PROBE_TARGET: &str = "tls.example:443";

fn write_definitions(file: &tempfile::NamedTempFile, json: &str) {
    let mut f = std::fs::File::create(file.path()).unwrap();
    f.write_all(json.as_bytes()).unwrap();
    f.flush().unwrap();
}

async fn new_pool(file: &tempfile::NamedTempFile) -> (Arc<DefinitionsManager>, Arc<Pool>) {
    let definitions = Arc::new(DefinitionsManager::new(file.path(), "token"));
    let _ = definitions.load().await;
    let pool = Pool::new(
        definitions.clone(),
        Duration::from_secs(3600),
        Duration::from_secs(1),
        PROBE_TARGET,
    )
    .await;
    (definitions, pool)
}

/// Poll `cond` until it holds or the deadline passes.
async fn wait_for<F, Fut>(what: &str, mut cond: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        while !cond().await {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for: {}", what));
}

/// Minimal SOCKS5 server: no-auth negotiation, unconditional CONNECT
/// success, then echoes the tunneled bytes back.
async fn spawn_mock_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut head = [0u8; 2];
                if stream.read_exact(&mut head).await.is_err() {
                    return;
                }
                let mut methods = vec![0u8; head[1] as usize];
                if stream.read_exact(&mut methods).await.is_err() {
                    return;
                }
                if stream.write_all(&[0x05, 0x00]).await.is_err() {
                    return;
                }

                let mut req = [0u8; 4];
                if stream.read_exact(&mut req).await.is_err() {
                    return;
                }
                let remaining = match req[3] {
                    0x01 => 4 + 2,
                    0x04 => 16 + 2,
                    0x03 => {
                        let mut len = [0u8; 1];
                        if stream.read_exact(&mut len).await.is_err() {
                            return;
                        }
                        len[0] as usize + 2
                    }
                    _ => return,
                };
                let mut addr_bytes = vec![0u8; remaining];
                if stream.read_exact(&mut addr_bytes).await.is_err() {
                    return;
                }

                if stream
                    .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                    .await
                    .is_err()
                {
                    return;
                }

                let mut buf = [0u8; 1024];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

/// SOCKS5 server that actually forwards: parses the CONNECT target,
/// opens the remote connection, and relays bytes both ways.
async fn spawn_forwarding_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut head = [0u8; 2];
                if stream.read_exact(&mut head).await.is_err() {
                    return;
                }
                let mut methods = vec![0u8; head[1] as usize];
                if stream.read_exact(&mut methods).await.is_err() {
                    return;
                }
                if stream.write_all(&[0x05, 0x00]).await.is_err() {
                    return;
                }

                let mut req = [0u8; 4];
                if stream.read_exact(&mut req).await.is_err() {
                    return;
                }
                let target = match req[3] {
                    0x01 => {
                        let mut buf = [0u8; 6];
                        if stream.read_exact(&mut buf).await.is_err() {
                            return;
                        }
                        let port = u16::from_be_bytes([buf[4], buf[5]]);
                        format!("{}.{}.{}.{}:{}", buf[0], buf[1], buf[2], buf[3], port)
                    }
                    0x03 => {
                        let mut len = [0u8; 1];
                        if stream.read_exact(&mut len).await.is_err() {
                            return;
                        }
                        let mut buf = vec![0u8; len[0] as usize + 2];
                        if stream.read_exact(&mut buf).await.is_err() {
                            return;
                        }
                        let domain =
                            String::from_utf8_lossy(&buf[..len[0] as usize]).to_string();
                        let port = u16::from_be_bytes([
                            buf[len[0] as usize],
                            buf[len[0] as usize + 1],
                        ]);
                        format!("{}:{}", domain, port)
                    }
                    _ => return,
                };

                let Ok(mut remote) = tokio::net::TcpStream::connect(&target).await else {
                    let _ = stream
                        .write_all(&[0x05, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                        .await;
                    return;
                };
                if stream
                    .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                    .await
                    .is_err()
                {
                    return;
                }
                let _ = tokio::io::copy_bidirectional(&mut stream, &mut remote).await;
            });
        }
    });
    addr
}

/// TLS 1.2+ listener with a self-signed certificate for `localhost`.
async fn spawn_tls_target() -> SocketAddr {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert_der = cert.serialize_der().unwrap();
    let key_der = cert.serialize_private_key_der();
    let config = rustls::ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(
            vec![rustls::Certificate(cert_der)],
            rustls::PrivateKey(key_der),
        )
        .unwrap();
    let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(config));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                if let Ok(mut tls) = acceptor.accept(stream).await {
                    let mut buf = [0u8; 512];
                    while let Ok(n) = tls.read(&mut buf).await {
                        if n == 0 {
                            break;
                        }
                    }
                }
            });
        }
    });
    addr
}

#[tokio::test]
async fn empty_pool_reports_no_active_proxy() {
    let file = tempfile::NamedTempFile::new().unwrap();
    write_definitions(&file, "[]");
    let (_definitions, pool) = new_pool(&file).await;

    assert!(pool.is_empty().await);
    assert!(matches!(
        pool.get_active_upstream().await,
        Err(Error::NoActiveProxy)
    ));

    let metrics = Arc::new(GatewayMetrics::new());
    let dialer = Dialer::new(pool.clone(), metrics.clone());
    let scope = CancellationToken::new();

    let result = dialer.dial(&scope, "tcp", "x:1").await;
    assert!(matches!(result, Err(Error::NoActiveProxy)));
    assert_eq!(metrics.total_requests(), 1);
    assert_eq!(metrics.total_failed(), 1);
    assert_eq!(metrics.total_success(), 0);

    pool.stop().await;
}

#[tokio::test]
async fn dial_succeeds_through_active_upstream() {
    let upstream_addr = spawn_mock_upstream().await;
    let file = tempfile::NamedTempFile::new().unwrap();
    write_definitions(
        &file,
        &format!(r#"[{{"address": "{}"}}]"#, upstream_addr),
    );
    let (_definitions, pool) = new_pool(&file).await;

    let record = pool
        .get_upstream(&upstream_addr.to_string())
        .await
        .expect("record created by reconciliation");

    // Wait out the initial probe (it fails: the mock cannot speak TLS),
    // then force the record active the way a successful probe would.
    wait_for("initial probe outcome", || {
        let record = record.clone();
        async move { record.snapshot().last_check.is_some() }
    })
    .await;
    record.mark_active(Duration::from_millis(42));

    let selected = pool.get_active_upstream().await.unwrap();
    assert_eq!(selected.address(), upstream_addr.to_string());
    assert_eq!(selected.snapshot().response_time_ms, Some(42));

    let metrics = Arc::new(GatewayMetrics::new());
    let dialer = Dialer::new(pool.clone(), metrics.clone());
    let scope = CancellationToken::new();

    let mut conn = dialer
        .dial(&scope, "tcp", "target.internal:80")
        .await
        .expect("dial through mock upstream");

    conn.write_all(b"ping").await.unwrap();
    let mut reply = [0u8; 4];
    conn.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"ping");

    assert_eq!(metrics.total_requests(), 1);
    assert_eq!(metrics.total_success(), 1);
    assert_eq!(metrics.total_failed(), 0);
    assert_eq!(record.success_count(), 1);
    assert_eq!(record.fail_count(), 0);

    pool.stop().await;
}

#[tokio::test]
async fn probe_succeeds_against_real_tls_target_with_skip_verify() {
    let tls_addr = spawn_tls_target().await;
    let upstream_addr = spawn_forwarding_upstream().await;

    let file = tempfile::NamedTempFile::new().unwrap();
    write_definitions(
        &file,
        &format!(r#"[{{"address": "{}"}}]"#, upstream_addr),
    );

    let definitions = Arc::new(DefinitionsManager::new(file.path(), "token"));
    definitions.load().await.unwrap();
    let pool = Pool::new(
        definitions,
        Duration::from_millis(200),
        Duration::from_secs(5),
        format!("localhost:{}", tls_addr.port()),
    )
    .await;

    // The certificate is self-signed, so full verification would fail;
    // the swapped policy is picked up by in-flight and future probes.
    pool.configure_tls(true, None, None);

    let record = pool
        .get_upstream(&upstream_addr.to_string())
        .await
        .expect("record created by reconciliation");

    wait_for("probe success through TLS target", || {
        let record = record.clone();
        async move { record.is_active() }
    })
    .await;

    let snap = record.snapshot();
    assert!(snap.is_active);
    assert!(snap.last_check.is_some());
    assert!(snap.response_time_ms.is_some());
    // Probe success is not a dial-path success.
    assert_eq!(record.success_count(), 0);

    let selected = pool.get_active_upstream().await.unwrap();
    assert_eq!(selected.address(), upstream_addr.to_string());

    pool.stop().await;
}

#[tokio::test]
async fn credential_rotation_restarts_supervisor_and_resets_counters() {
    let file = tempfile::NamedTempFile::new().unwrap();
    write_definitions(
        &file,
        r#"[{"address": "10.9.9.9:1080", "username": "a", "password": "p1"}]"#,
    );
    let (definitions, pool) = new_pool(&file).await;

    let old = pool.get_upstream("10.9.9.9:1080").await.unwrap();
    old.record_success();
    assert_eq!(old.success_count(), 1);

    write_definitions(
        &file,
        r#"[{"address": "10.9.9.9:1080", "username": "a", "password": "p2"}]"#,
    );
    definitions.load().await.unwrap();
    definitions.trigger_reload();

    wait_for("record replacement after credential rotation", || {
        let pool = pool.clone();
        let old = old.clone();
        async move {
            match pool.get_upstream("10.9.9.9:1080").await {
                Some(current) => !Arc::ptr_eq(&current, &old),
                None => false,
            }
        }
    })
    .await;

    let fresh = pool.get_upstream("10.9.9.9:1080").await.unwrap();
    let (username, password) = fresh.credentials();
    assert_eq!(username, Some("a"));
    assert_eq!(password, Some("p2"));
    assert_eq!(fresh.success_count(), 0);
    assert_eq!(fresh.fail_count(), 0);

    pool.stop().await;
}

#[tokio::test]
async fn tag_reload_updates_metadata_and_restarts() {
    let file = tempfile::NamedTempFile::new().unwrap();
    write_definitions(
        &file,
        r#"[{"address": "10.9.9.9:1080", "tags": ["x"]}]"#,
    );
    let (definitions, pool) = new_pool(&file).await;

    let old = pool.get_upstream("10.9.9.9:1080").await.unwrap();
    old.record_failure();
    assert_eq!(old.snapshot().tags, vec!["x".to_string()]);

    write_definitions(
        &file,
        r#"[{"address": "10.9.9.9:1080", "tags": ["x", "y"]}]"#,
    );
    definitions.load().await.unwrap();
    definitions.trigger_reload();

    wait_for("record replacement after tag change", || {
        let pool = pool.clone();
        let old = old.clone();
        async move {
            match pool.get_upstream("10.9.9.9:1080").await {
                Some(current) => !Arc::ptr_eq(&current, &old),
                None => false,
            }
        }
    })
    .await;

    let fresh = pool.get_upstream("10.9.9.9:1080").await.unwrap();
    let mut tags = fresh.snapshot().tags;
    tags.sort();
    assert_eq!(tags, vec!["x".to_string(), "y".to_string()]);
    // Restart resets counters.
    assert_eq!(fresh.fail_count(), 0);

    pool.stop().await;
}

#[tokio::test]
async fn removed_upstream_leaves_the_pool() {
    let file = tempfile::NamedTempFile::new().unwrap();
    write_definitions(
        &file,
        r#"[{"address": "10.9.9.8:1080"}, {"address": "10.9.9.9:1080"}]"#,
    );
    let (definitions, pool) = new_pool(&file).await;
    assert_eq!(pool.len().await, 2);

    write_definitions(&file, r#"[{"address": "10.9.9.9:1080"}]"#);
    definitions.load().await.unwrap();
    definitions.trigger_reload();

    wait_for("removal of 10.9.9.8:1080", || {
        let pool = pool.clone();
        async move { pool.len().await == 1 }
    })
    .await;
    assert!(pool.get_upstream("10.9.9.8:1080").await.is_none());
    assert!(pool.get_upstream("10.9.9.9:1080").await.is_some());

    pool.stop().await;
}

#[tokio::test]
async fn unreachable_upstream_goes_inactive_without_dial_counters() {
    // Port 1 refuses connections, so the probe fails fast.
    let file = tempfile::NamedTempFile::new().unwrap();
    write_definitions(&file, r#"[{"address": "127.0.0.1:1"}]"#);
    let (_definitions, pool) = new_pool(&file).await;

    let record = pool.get_upstream("127.0.0.1:1").await.unwrap();
    wait_for("probe verdict for refusing upstream", || {
        let record = record.clone();
        async move { record.snapshot().last_check.is_some() }
    })
    .await;

    assert!(!record.is_active());
    // Probe outcomes never touch the dial-path counters.
    assert_eq!(record.fail_count(), 0);
    assert_eq!(record.success_count(), 0);
    assert!(matches!(
        pool.get_active_upstream().await,
        Err(Error::NoActiveProxy)
    ));

    pool.stop().await;
}

#[tokio::test]
async fn tag_routed_selection_filters_by_intersection() {
    let file = tempfile::NamedTempFile::new().unwrap();
    write_definitions(
        &file,
        r#"[
            {"address": "10.9.9.8:1080", "tags": ["dc1"]},
            {"address": "10.9.9.9:1080", "tags": ["dc2", "premium"]}
        ]"#,
    );
    let (_definitions, pool) = new_pool(&file).await;

    for addr in ["10.9.9.8:1080", "10.9.9.9:1080"] {
        let record = pool.get_upstream(addr).await.unwrap();
        wait_for("initial probe verdict", || {
            let record = record.clone();
            async move { record.snapshot().last_check.is_some() }
        })
        .await;
        record.mark_active(Duration::from_millis(5));
    }

    let picked = pool
        .get_active_upstream_with_tags(&["premium".to_string()])
        .await
        .unwrap();
    assert_eq!(picked.address(), "10.9.9.9:1080");

    // Empty tag set applies no filter.
    assert!(pool.get_active_upstream_with_tags(&[]).await.is_ok());

    // No intersection at all.
    assert!(matches!(
        pool.get_active_upstream_with_tags(&["dc3".to_string()]).await,
        Err(Error::NoActiveProxy)
    ));

    pool.stop().await;
}

#[tokio::test]
async fn stop_joins_supervisors_mid_probe() {
    // 203.0.113.0/24 (TEST-NET-3) blackholes, so the probe dial hangs
    // until its deadline; stop must pre-empt it.
    let file = tempfile::NamedTempFile::new().unwrap();
    write_definitions(&file, r#"[{"address": "203.0.113.1:1080"}]"#);

    let definitions = Arc::new(DefinitionsManager::new(file.path(), "token"));
    definitions.load().await.unwrap();
    let pool = Pool::new(
        definitions,
        Duration::from_secs(3600),
        Duration::from_secs(30),
        PROBE_TARGET,
    )
    .await;
    assert_eq!(pool.len().await, 1);

    tokio::time::timeout(Duration::from_secs(5), pool.stop())
        .await
        .expect("stop() must return promptly despite an in-flight probe");

    let record = pool.get_upstream("203.0.113.1:1080").await.unwrap();
    assert!(!record.is_active());

    // A second stop is a no-op.
    tokio::time::timeout(Duration::from_secs(1), pool.stop())
        .await
        .expect("stop() must be idempotent");
}

#[tokio::test]
async fn selector_distributes_over_the_active_set() {
    let file = tempfile::NamedTempFile::new().unwrap();
    write_definitions(
        &file,
        r#"[
            {"address": "10.9.9.7:1080"},
            {"address": "10.9.9.8:1080"},
            {"address": "10.9.9.9:1080"}
        ]"#,
    );
    let (_definitions, pool) = new_pool(&file).await;

    // Only two of three are active.
    for addr in ["10.9.9.7:1080", "10.9.9.9:1080"] {
        let record = pool.get_upstream(addr).await.unwrap();
        wait_for("initial probe verdict", || {
            let record = record.clone();
            async move { record.snapshot().last_check.is_some() }
        })
        .await;
        record.mark_active(Duration::from_millis(5));
    }

    let mut seen = std::collections::HashSet::new();
    for _ in 0..200 {
        let picked = pool.get_active_upstream().await.unwrap();
        assert_ne!(picked.address(), "10.9.9.8:1080");
        seen.insert(picked.address().to_string());
    }
    assert_eq!(seen.len(), 2, "uniform selection should hit both actives");

    pool.stop().await;
}
