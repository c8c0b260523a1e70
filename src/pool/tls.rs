//! Hot-swappable TLS verification policy for the health-check probe

use arc_swap::ArcSwap;
use rustls::client::{ServerCertVerified, ServerCertVerifier, WebPkiVerifier};
use rustls::{Certificate, ClientConfig, OwnedTrustAnchor, RootCertStore, ServerName};
use std::sync::Arc;
use tracing::warn;

/// Trust configuration applied to probe TLS handshakes.
#[derive(Clone)]
pub struct TlsPolicy {
    /// Disable chain verification entirely. Every handshake under this
    /// policy logs a warning.
    pub skip_verify: bool,
    /// Trust anchors used for chain verification.
    pub roots: Arc<RootCertStore>,
    /// SNI sent instead of the probe target's host part.
    pub sni_override: Option<String>,
}

impl Default for TlsPolicy {
    fn default() -> Self {
        TlsPolicy {
            skip_verify: false,
            roots: Arc::new(default_root_store()),
            sni_override: None,
        }
    }
}

/// Build a root store from the bundled webpki roots.
pub fn default_root_store() -> RootCertStore {
    let mut roots = RootCertStore::empty();
    roots.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
        OwnedTrustAnchor::from_subject_spki_name_constraints(
            ta.subject.as_ref(),
            ta.spki.as_ref(),
            ta.name_constraints.as_deref(),
        )
    }));
    roots
}

/// Atomically swappable policy cell.
///
/// Reads are wait-free; the probe loads the cell once to configure the
/// handshake and the installed verifier loads it again at verification
/// time, so a swap is picked up by every probe already in flight.
pub struct TlsPolicyCell {
    inner: ArcSwap<TlsPolicy>,
}

impl TlsPolicyCell {
    pub fn new(policy: TlsPolicy) -> Self {
        TlsPolicyCell {
            inner: ArcSwap::from_pointee(policy),
        }
    }

    pub fn current(&self) -> Arc<TlsPolicy> {
        self.inner.load_full()
    }

    pub fn store(&self, policy: TlsPolicy) {
        if policy.skip_verify {
            warn!("TLS certificate verification DISABLED for health-check probes");
        }
        self.inner.store(Arc::new(policy));
    }
}

impl Default for TlsPolicyCell {
    fn default() -> Self {
        TlsPolicyCell::new(TlsPolicy::default())
    }
}

/// Certificate verifier that re-reads the policy cell on every
/// verification, so hot updates apply without rebuilding connectors.
struct PolicyVerifier {
    cell: Arc<TlsPolicyCell>,
}

impl ServerCertVerifier for PolicyVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &Certificate,
        intermediates: &[Certificate],
        server_name: &ServerName,
        scts: &mut dyn Iterator<Item = &[u8]>,
        ocsp_response: &[u8],
        now: std::time::SystemTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let policy = self.cell.current();

        if policy.skip_verify {
            warn!("skipping TLS certificate verification (skip_verify enabled)");
            return Ok(ServerCertVerified::assertion());
        }

        let verifier = WebPkiVerifier::new((*policy.roots).clone(), None);
        verifier.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            scts,
            ocsp_response,
            now,
        )
    }
}

/// Client config for probe handshakes: TLS 1.2+, policy-driven verification.
pub(crate) fn probe_client_config(cell: &Arc<TlsPolicyCell>) -> ClientConfig {
    ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(Arc::new(PolicyVerifier { cell: cell.clone() }))
        .with_no_client_auth()
}
