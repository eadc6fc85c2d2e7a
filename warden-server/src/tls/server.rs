//! TLS server configuration.
//!
//! Uses rustls 0.23 builder patterns. The node API accepts any client
//! certificate chaining to a root in the server's own trust bundle; client
//! certificates are optional at the TLS layer so that unattested nodes can
//! reach `Attest`, and the authorizer enforces presence per method.

use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use std::sync::Arc;
use x509_parser::prelude::{FromDer, X509Certificate};

use super::TlsIdentity;

/// TLS server configuration wrapper.
pub struct TlsServerConfig {
    pub config: Arc<ServerConfig>,
}

impl TlsServerConfig {
    pub fn into_rustls_config(self) -> Arc<ServerConfig> {
        self.config
    }

    /// Node API config: server SVID plus optional client SVIDs verified
    /// against the given bundle roots.
    pub fn new_node_api(
        identity: &TlsIdentity,
        bundle_roots: Vec<Vec<u8>>,
    ) -> Result<Self, TlsConfigError> {
        let mut root_store = RootCertStore::empty();
        let mut skipped = 0;
        for root_der in bundle_roots {
            match verify_certificate_validity(&root_der) {
                Ok(()) => {
                    root_store
                        .add(CertificateDer::from(root_der))
                        .map_err(|e| TlsConfigError::InvalidCert(e.to_string()))?;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping invalid bundle root");
                    skipped += 1;
                }
            }
        }
        if skipped > 0 {
            tracing::info!(skipped, valid = root_store.len(), "Bundle root validity check completed");
        }

        if root_store.is_empty() {
            return Err(TlsConfigError::EmptyBundle);
        }

        // Client certs stay optional at the TLS layer: Attest is reachable
        // without one, Fetch* methods enforce presence in the authorizer.
        let client_verifier = WebPkiClientVerifier::builder(Arc::new(root_store))
            .allow_unauthenticated()
            .build()
            .map_err(|e| TlsConfigError::Verifier(e.to_string()))?;

        let chain: Vec<CertificateDer> = identity
            .cert_chain
            .iter()
            .map(|der| CertificateDer::from(der.clone()))
            .collect();
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(identity.key_der.clone()));

        let config = ServerConfig::builder()
            .with_client_cert_verifier(client_verifier)
            .with_single_cert(chain, key)
            .map_err(|e| TlsConfigError::Config(e.to_string()))?;

        Ok(Self {
            config: Arc::new(config),
        })
    }
}

/// Reject roots that are expired or not yet valid before they enter the
/// verifier's store.
fn verify_certificate_validity(cert_der: &[u8]) -> Result<(), TlsConfigError> {
    let (_, cert) = X509Certificate::from_der(cert_der)
        .map_err(|e| TlsConfigError::InvalidCert(format!("failed to parse certificate: {e}")))?;

    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_err(|_| TlsConfigError::InvalidCert("system time error".to_string()))?
        .as_secs() as i64;

    let validity = cert.validity();
    if now < validity.not_before.timestamp() {
        return Err(TlsConfigError::InvalidCert("certificate not yet valid".into()));
    }
    if now > validity.not_after.timestamp() {
        return Err(TlsConfigError::InvalidCert("certificate expired".into()));
    }
    Ok(())
}

/// Errors that can occur during TLS configuration.
#[derive(Debug, thiserror::Error)]
pub enum TlsConfigError {
    #[error("invalid certificate: {0}")]
    InvalidCert(String),
    #[error("failed to build verifier: {0}")]
    Verifier(String),
    #[error("failed to build config: {0}")]
    Config(String),
    #[error("trust bundle has no valid roots")]
    EmptyBundle,
}
