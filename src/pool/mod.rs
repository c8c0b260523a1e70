//! Upstream pool: reconciled, health-checked fleet of SOCKS5 proxies
//!
//! The pool owns one record per upstream address and one supervisor
//! task per record. A reconciliation pass diffs the desired definition
//! snapshot against the live set under the pool write lock, so a
//! concurrent selection sees either the pre-state or the post-state,
//! never a mix.

mod probe;
mod supervisor;
pub mod tls;
pub mod upstream;

pub use tls::{default_root_store, TlsPolicy, TlsPolicyCell};
pub use upstream::{Upstream, UpstreamSnapshot};

use crate::config::{DefinitionsManager, UpstreamDefinition};
use crate::{Error, Result};
use rand::Rng;
use rustls::RootCertStore;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Pool of upstream SOCKS5 proxies with per-upstream health checking.
pub struct Pool {
    upstreams: RwLock<HashMap<String, Arc<Upstream>>>,
    definitions: Arc<DefinitionsManager>,
    check_interval: Duration,
    probe_timeout: Duration,
    probe_target: String,
    shutdown: CancellationToken,
    tls: Arc<TlsPolicyCell>,
    reload_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Pool {
    /// Build the pool, run the initial reconciliation, and start the
    /// reload listener.
    ///
    /// An initial definitions snapshot that cannot be applied leaves
    /// the pool empty; supervisors report on their upstreams once the
    /// definitions are reloaded.
    pub async fn new(
        definitions: Arc<DefinitionsManager>,
        check_interval: Duration,
        probe_timeout: Duration,
        probe_target: impl Into<String>,
    ) -> Arc<Self> {
        let pool = Arc::new(Pool {
            upstreams: RwLock::new(HashMap::new()),
            definitions,
            check_interval,
            probe_timeout,
            probe_target: probe_target.into(),
            shutdown: CancellationToken::new(),
            tls: Arc::new(TlsPolicyCell::default()),
            reload_task: parking_lot::Mutex::new(None),
        });

        pool.reconcile().await;

        let listener = tokio::spawn({
            let pool = pool.clone();
            async move {
                pool.reload_listener().await;
            }
        });
        *pool.reload_task.lock() = Some(listener);

        pool
    }

    /// Wait for reload notifications and reconcile on each.
    async fn reload_listener(&self) {
        debug!("upstream pool reload listener started");
        loop {
            tokio::select! {
                _ = self.definitions.reload_requested() => {
                    info!("received reload signal, reconciling upstreams");
                    self.reconcile().await;
                }
                _ = self.shutdown.cancelled() => {
                    debug!("upstream pool reload listener stopping");
                    return;
                }
            }
        }
    }

    /// Apply the current definitions snapshot to the live set.
    ///
    /// Holds the pool write lock for the entire pass: removals cancel
    /// and join their supervisors, credential or metadata changes
    /// recreate the record (resetting its counters), additions start
    /// fresh supervisors. Metadata is always overwritten in place
    /// first so surviving records never expose a stale tag set.
    pub async fn reconcile(&self) {
        let snapshot = self.definitions.definitions();

        let mut live = self.upstreams.write().await;

        let mut desired: HashMap<String, UpstreamDefinition> = HashMap::with_capacity(snapshot.len());
        for def in snapshot {
            desired.insert(def.address.clone(), def);
        }

        let removed: Vec<String> = live
            .keys()
            .filter(|addr| !desired.contains_key(*addr))
            .cloned()
            .collect();
        for addr in removed {
            if let Some(up) = live.remove(&addr) {
                info!(upstream = %addr, "upstream removed, stopping its supervisor");
                teardown_supervisor(&up).await;
            }
        }

        for (addr, def) in &desired {
            match live.get(addr).cloned() {
                Some(existing) => {
                    let credentials_changed = !existing.credentials_equal(def);
                    let metadata_changed = !existing.metadata_equal(def);
                    existing.update_metadata(&def.tags, &def.description);

                    if credentials_changed || metadata_changed {
                        info!(
                            upstream = %addr,
                            credentials_changed,
                            "upstream definition changed, restarting its supervisor"
                        );
                        live.remove(addr);
                        teardown_supervisor(&existing).await;

                        let fresh = Arc::new(Upstream::new(def));
                        self.start_supervisor(&fresh);
                        live.insert(addr.clone(), fresh);
                    }
                }
                None => {
                    info!(upstream = %addr, "new upstream added, starting its supervisor");
                    let up = Arc::new(Upstream::new(def));
                    self.start_supervisor(&up);
                    live.insert(addr.clone(), up);
                }
            }
        }

        info!(count = live.len(), "upstreams reconciled");
    }

    fn start_supervisor(&self, upstream: &Arc<Upstream>) {
        supervisor::start(
            upstream.clone(),
            &self.shutdown,
            self.check_interval,
            self.probe_timeout,
            self.probe_target.clone(),
            self.tls.clone(),
        );
    }

    /// Pick one active upstream uniformly at random.
    pub async fn get_active_upstream(&self) -> Result<Arc<Upstream>> {
        self.get_active_upstream_with_tags(&[]).await
    }

    /// Pick one active upstream whose tag set intersects `allowed`.
    /// An empty `allowed` slice applies no tag filter.
    pub async fn get_active_upstream_with_tags(
        &self,
        allowed: &[String],
    ) -> Result<Arc<Upstream>> {
        let live = self.upstreams.read().await;

        let active: Vec<Arc<Upstream>> = live
            .values()
            .filter(|up| up.is_active() && up.has_any_tag(allowed))
            .cloned()
            .collect();

        if active.is_empty() {
            return Err(Error::NoActiveProxy);
        }
        let idx = rand::thread_rng().gen_range(0..active.len());
        Ok(active[idx].clone())
    }

    /// Look up one live record by upstream address.
    pub async fn get_upstream(&self, address: &str) -> Option<Arc<Upstream>> {
        self.upstreams.read().await.get(address).cloned()
    }

    /// Copies of every record's state, for metrics and the admin API.
    pub async fn snapshot(&self) -> Vec<UpstreamSnapshot> {
        let live = self.upstreams.read().await;
        live.values().map(|up| up.snapshot()).collect()
    }

    /// Number of live upstream records (active or not).
    pub async fn len(&self) -> usize {
        self.upstreams.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.upstreams.read().await.is_empty()
    }

    /// Replace the TLS verification policy used by probes. The swap is
    /// wait-free and observed by the next handshake of every upstream.
    pub fn configure_tls(
        &self,
        skip_verify: bool,
        roots: Option<RootCertStore>,
        sni_override: Option<String>,
    ) {
        let roots = match roots {
            Some(store) => Arc::new(store),
            None => Arc::new(default_root_store()),
        };
        self.tls.store(TlsPolicy {
            skip_verify,
            roots,
            sni_override,
        });
    }

    /// Cancel the pool-wide scope and join every supervisor task.
    /// Safe to call more than once.
    pub async fn stop(&self) {
        info!("upstream pool stopping all operations");
        self.shutdown.cancel();

        let reload = self.reload_task.lock().take();
        if let Some(task) = reload {
            let _ = task.await;
        }

        let handles: Vec<JoinHandle<()>> = {
            let live = self.upstreams.read().await;
            live.values()
                .filter_map(|up| {
                    up.take_cancel();
                    up.take_task()
                })
                .collect()
        };
        futures::future::join_all(handles).await;

        info!("upstream pool stopped");
    }
}

/// Cancel an upstream's supervisor and wait for the task to finish.
/// Clearing the handle first keeps a second teardown from double-joining.
async fn teardown_supervisor(upstream: &Arc<Upstream>) {
    if let Some(cancel) = upstream.take_cancel() {
        cancel.cancel();
    }
    if let Some(task) = upstream.take_task() {
        if let Err(e) = task.await {
            warn!(upstream = %upstream.address(), err = %e, "supervisor task join failed");
        }
    }
}
