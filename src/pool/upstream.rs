//! Per-upstream record: liveness state, latency, counters, supervisor handle

use crate::config::UpstreamDefinition;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Mutable metadata block, guarded by the record's own lock.
#[derive(Debug)]
struct Status {
    is_active: bool,
    last_check: Option<DateTime<Utc>>,
    response_time: Option<Duration>,
    tags: Vec<String>,
    description: String,
}

/// One upstream SOCKS5 proxy tracked by the pool.
///
/// A record is created by the reconciler from a definition entry and
/// freshly recreated whenever the definition's credentials or routing
/// metadata change; counters therefore start from zero after every
/// restart. Activity, last-check and latency are written only by the
/// record's supervisor; the dial path touches the counters alone.
pub struct Upstream {
    address: String,
    username: Option<String>,
    password: Option<String>,
    status: RwLock<Status>,
    success_count: AtomicU64,
    fail_count: AtomicU64,
    // Guarded separately so the reconciler can tear the supervisor down
    // without contending with the status lock.
    cancel: Mutex<Option<CancellationToken>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Upstream {
    pub fn new(def: &UpstreamDefinition) -> Self {
        Upstream {
            address: def.address.clone(),
            username: def.username.clone().filter(|u| !u.is_empty()),
            password: def.password.clone(),
            status: RwLock::new(Status {
                is_active: false,
                last_check: None,
                response_time: None,
                tags: def.tags.clone(),
                description: def.description.clone(),
            }),
            success_count: AtomicU64::new(0),
            fail_count: AtomicU64::new(0),
            cancel: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Credentials snapshot for building a dialer
    pub fn credentials(&self) -> (Option<&str>, Option<&str>) {
        (self.username.as_deref(), self.password.as_deref())
    }

    /// Record a successful probe: activity, last-check and latency.
    pub fn mark_active(&self, response_time: Duration) {
        let mut status = self.status.write();
        status.is_active = true;
        status.last_check = Some(Utc::now());
        status.response_time = Some(response_time);
    }

    /// Record a failed probe. The error detail is logged, not stored.
    pub fn mark_inactive(&self, err: &dyn std::fmt::Display) {
        debug!(upstream = %self.address, err = %err, "marking inactive");
        let mut status = self.status.write();
        status.is_active = false;
        status.last_check = Some(Utc::now());
    }

    pub fn is_active(&self) -> bool {
        self.status.read().is_active
    }

    pub fn record_success(&self) {
        self.success_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.fail_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn success_count(&self) -> u64 {
        self.success_count.load(Ordering::Relaxed)
    }

    pub fn fail_count(&self) -> u64 {
        self.fail_count.load(Ordering::Relaxed)
    }

    /// Overwrite routing metadata under the record lock.
    pub fn update_metadata(&self, tags: &[String], description: &str) {
        let mut status = self.status.write();
        status.tags = tags.to_vec();
        status.description = description.to_string();
    }

    /// Whether the stored credentials match the definition's.
    pub fn credentials_equal(&self, def: &UpstreamDefinition) -> bool {
        let def_username = def.username.as_deref().filter(|u| !u.is_empty());
        self.username.as_deref() == def_username
            && self.password.as_deref() == def.password.as_deref()
    }

    /// Whether tags (order-insensitive, multiplicity-sensitive) and
    /// description match the definition's.
    pub fn metadata_equal(&self, def: &UpstreamDefinition) -> bool {
        let status = self.status.read();
        status.description == def.description && tags_equal(&status.tags, &def.tags)
    }

    /// Whether the record's tag set intersects `allowed`. An empty
    /// `allowed` set is treated as "no filter".
    pub fn has_any_tag(&self, allowed: &[String]) -> bool {
        if allowed.is_empty() {
            return true;
        }
        let status = self.status.read();
        status.tags.iter().any(|t| allowed.contains(t))
    }

    pub(crate) fn set_cancel(&self, token: CancellationToken) {
        *self.cancel.lock() = Some(token);
    }

    pub(crate) fn take_cancel(&self) -> Option<CancellationToken> {
        self.cancel.lock().take()
    }

    pub(crate) fn set_task(&self, handle: JoinHandle<()>) {
        *self.task.lock() = Some(handle);
    }

    pub(crate) fn take_task(&self) -> Option<JoinHandle<()>> {
        self.task.lock().take()
    }

    /// Copy of the record's observable state, for metrics and the admin API.
    pub fn snapshot(&self) -> UpstreamSnapshot {
        let status = self.status.read();
        UpstreamSnapshot {
            address: self.address.clone(),
            is_active: status.is_active,
            last_check: status.last_check,
            response_time_ms: status.response_time.map(|d| d.as_millis() as u64),
            success_count: self.success_count(),
            fail_count: self.fail_count(),
            tags: status.tags.clone(),
            description: status.description.clone(),
        }
    }
}

impl std::fmt::Debug for Upstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = self.status.read();
        f.debug_struct("Upstream")
            .field("address", &self.address)
            .field("is_active", &status.is_active)
            .field("last_check", &status.last_check)
            .field("response_time", &status.response_time)
            .finish()
    }
}

/// Order-insensitive, multiplicity-sensitive tag comparison:
/// `[a, b]` equals `[b, a]` but not `[a, a, b]`.
fn tags_equal(a: &[String], b: &[String]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut a: Vec<&str> = a.iter().map(String::as_str).collect();
    let mut b: Vec<&str> = b.iter().map(String::as_str).collect();
    a.sort_unstable();
    b.sort_unstable();
    a == b
}

/// Point-in-time copy of one record's state.
#[derive(Debug, Clone, Serialize)]
pub struct UpstreamSnapshot {
    pub address: String,
    pub is_active: bool,
    pub last_check: Option<DateTime<Utc>>,
    pub response_time_ms: Option<u64>,
    pub success_count: u64,
    pub fail_count: u64,
    pub tags: Vec<String>,
    pub description: String,
}
