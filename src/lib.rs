//! sockspool - SOCKS5 gateway over a health-checked upstream pool
//!
//! Multiplexes authenticated client connections over a dynamically
//! managed fleet of upstream SOCKS5 proxies:
//! - per-upstream TLS-over-SOCKS5 liveness probes
//! - live reconciliation of the upstream set against a definitions file
//! - uniform random selection over the active set
//! - Prometheus metrics and an admin reload endpoint
//!
//! # Architecture
//!
//! ```text
//!  +-----------+     +----------+     +-----------+
//!  | inbound/  | --> | dialer/  | --> | outbound/ |
//!  | (SOCKS5)  |     | (orchestr)|    | (SOCKS5   |
//!  +-----+-----+     +----+-----+     |  client)  |
//!        |                |           +-----+-----+
//!  +-----v-----+     +----v-----+           |
//!  |   auth/   |     |  pool/   | <---------+
//!  +-----------+     | (records,|
//!                    |  probes, |     +-----------+
//!  +-----------+     |  reconcile) <--|  config/  |
//!  |  hub/     | --> +----------+     | (defs)    |
//!  +-----------+                      +-----------+
//! ```

pub mod auth;
pub mod common;
pub mod config;
pub mod dialer;
pub mod hub;
pub mod inbound;
pub mod outbound;
pub mod pool;
pub mod statistic;

pub use common::error::{Error, Result};
pub use config::Config;

use auth::UserStore;
use config::DefinitionsManager;
use dialer::{Dialer, GatewayMetrics};
use inbound::{InboundListener, Socks5Listener};
use pool::Pool;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Gateway instance managing all components
pub struct Gateway {
    config: Config,
    users: Arc<UserStore>,
    definitions: Arc<DefinitionsManager>,
    pool: Arc<Pool>,
    dialer: Arc<Dialer>,
    inbound: Arc<dyn InboundListener>,
    shutdown: CancellationToken,
}

impl Gateway {
    /// Create a new Gateway from configuration
    pub async fn new(config: Config) -> Result<Self> {
        info!("initializing sockspool v{}", VERSION);

        // Client credential store
        let users = Arc::new(UserStore::new());
        match config.users_file_path.as_deref() {
            Some(path) => {
                let loaded = auth::load_users_from_file(path)?;
                info!(count = loaded.len(), path = %path, "users loaded");
                users.set_users(loaded);
            }
            None => {
                let generated = auth::generate_default_user();
                users.add_client(&generated.username, &generated.password, true);
            }
        }

        // Upstream definitions source
        let definitions = Arc::new(DefinitionsManager::new(
            &config.proxies.config_file_path,
            config.server.reload_token.clone().unwrap_or_default(),
        ));
        if let Err(e) = definitions.load().await {
            warn!(err = %e, "initial upstream definitions load failed, pool starts empty");
        }

        // Upstream pool
        let pool = Pool::new(
            definitions.clone(),
            config.check_interval(),
            config.check_timeout(),
            config.proxies.health_check_target.clone(),
        )
        .await;
        if config.tls.skip_verify || config.tls.sni_override.is_some() {
            pool.configure_tls(config.tls.skip_verify, None, config.tls.sni_override.clone());
        }

        // Dial path
        let metrics = Arc::new(GatewayMetrics::new());
        let dialer = Arc::new(Dialer::new(pool.clone(), metrics));

        let shutdown = CancellationToken::new();
        let inbound: Arc<dyn InboundListener> = Arc::new(Socks5Listener::new(
            config.server.listen.clone(),
            users.clone(),
            dialer.clone(),
            shutdown.child_token(),
        ));

        Ok(Gateway {
            config,
            users,
            definitions,
            pool,
            dialer,
            inbound,
            shutdown,
        })
    }

    /// Start all services and block until a shutdown signal arrives.
    pub async fn run(&self) -> Result<()> {
        info!("starting gateway");

        let mut handles = Vec::new();

        // Metrics exposition + updater
        if let Some(listen) = self.config.metrics.listen.as_deref().filter(|l| !l.is_empty()) {
            let addr: SocketAddr = listen
                .parse()
                .map_err(|e| Error::config(format!("invalid metrics.listen '{}': {}", listen, e)))?;
            statistic::install_exporter(addr)?;
        }
        handles.push(statistic::spawn_updater(
            self.pool.clone(),
            self.dialer.metrics().clone(),
            self.config.metrics_log_interval(),
            self.shutdown.child_token(),
        ));

        // Admin endpoint
        if let Some(listen) = self.config.server.reload_listen.as_deref().filter(|l| !l.is_empty()) {
            let addr: SocketAddr = listen.parse().map_err(|e| {
                Error::config(format!("invalid server.reload_listen '{}': {}", listen, e))
            })?;
            let state = hub::AppState {
                definitions: self.definitions.clone(),
                pool: self.pool.clone(),
            };
            handles.push(tokio::spawn(async move {
                if let Err(e) = hub::start_server(state, addr).await {
                    warn!(err = %e, "admin server error");
                }
            }));
        }

        // SOCKS5 front end
        {
            let inbound = self.inbound.clone();
            handles.push(tokio::spawn(async move {
                if let Err(e) = inbound.start().await {
                    warn!(err = %e, "inbound listener error");
                }
            }));
        }

        tokio::signal::ctrl_c().await?;
        info!("received shutdown signal");

        self.stop().await;
        for handle in handles {
            handle.abort();
        }

        info!("gateway stopped");
        Ok(())
    }

    /// Cancel all tasks and join the pool's supervisors. Idempotent.
    pub async fn stop(&self) {
        let _ = self.inbound.stop().await;
        self.shutdown.cancel();
        self.pool.stop().await;
    }

    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    pub fn dialer(&self) -> &Arc<Dialer> {
        &self.dialer
    }

    pub fn users(&self) -> &Arc<UserStore> {
        &self.users
    }

    pub fn definitions(&self) -> &Arc<DefinitionsManager> {
        &self.definitions
    }
}
