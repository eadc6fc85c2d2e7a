//! Server certificate authority.
//!
//! The keystore mints every identity the server issues: agent and workload
//! X.509-SVIDs, JWT-SVIDs, and the CSR used to request a signed intermediate
//! from an upstream CA.

mod jwt;
mod keystore;

pub use jwt::JwtSvidClaims;
pub use keystore::{CaKeystore, SignedJwtSvid, SignedX509Svid};

use async_trait::async_trait;

/// Errors produced by CA operations.
#[derive(Debug, thiserror::Error)]
pub enum CaError {
    #[error("no signing certificate loaded")]
    NotInitialized,
    #[error("invalid CSR: {0}")]
    InvalidCsr(String),
    #[error("certificate public key does not match the signing key")]
    KeyMismatch,
    #[error("signing failed: {0}")]
    Signing(String),
    #[error("CA keypair persistence: {0}")]
    Persistence(String),
    #[error("data store: {0}")]
    DataStore(#[from] crate::datastore::DataStoreError),
    #[error("upstream CA: {0}")]
    Upstream(String),
}

/// An upstream authority that signs the server CA's own CSR.
#[async_trait]
pub trait UpstreamCa: Send + Sync {
    /// Submit a DER-encoded CSR and receive the signed certificate DER.
    async fn submit_csr(&self, csr_der: &[u8]) -> Result<Vec<u8>, CaError>;
}
