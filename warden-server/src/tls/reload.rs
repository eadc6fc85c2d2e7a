//! Dynamic TLS acceptor with hot-reload support.
//!
//! Uses arc-swap for lock-free atomic swapping of the TlsAcceptor when the
//! CA rotates and the trust bundle gains a new root.

use super::{TlsConfigError, TlsIdentity, TlsServerConfig};
use crate::ca::CaKeystore;
use arc_swap::ArcSwap;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

/// TLS acceptor that can be atomically reloaded when the bundle changes.
///
/// Reads are lock-free, so connection acceptance never blocks on a reload.
pub struct ReloadableTlsAcceptor {
    acceptor: ArcSwap<TlsAcceptor>,
    server_identity: Arc<TlsIdentity>,
}

impl ReloadableTlsAcceptor {
    pub fn new(initial_acceptor: TlsAcceptor, server_identity: Arc<TlsIdentity>) -> Arc<Self> {
        Arc::new(Self {
            acceptor: ArcSwap::from_pointee(initial_acceptor),
            server_identity,
        })
    }

    /// The current acceptor, safe to call from hot paths.
    pub fn current(&self) -> arc_swap::Guard<Arc<TlsAcceptor>> {
        self.acceptor.load()
    }

    /// Rebuild the acceptor with the keystore's current bundle roots. If the
    /// rebuild fails the previous configuration is retained.
    ///
    /// Returns the number of roots in the new configuration.
    pub fn reload(&self, ca: &CaKeystore) -> Result<usize, TlsConfigError> {
        let roots = ca
            .bundle()
            .map(|b| b.root_cas)
            .ok_or(TlsConfigError::EmptyBundle)?;
        let root_count = roots.len();

        let config = TlsServerConfig::new_node_api(&self.server_identity, roots)?;
        self.acceptor
            .store(Arc::new(TlsAcceptor::from(config.into_rustls_config())));

        Ok(root_count)
    }
}
