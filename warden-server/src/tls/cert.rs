//! Server TLS identity.
//!
//! The server presents its own CA-signed X.509-SVID with URI SAN
//! `<trust_domain>/spire/server`, minted from the keystore like any other
//! SVID but with a key held only in process memory.

use crate::ca::{CaError, CaKeystore};
use rcgen::{CertificateParams, KeyPair, SanType};

/// Server SVID lifetime. Regenerated on restart, so kept short.
const SERVER_SVID_TTL_SECS: i32 = 24 * 3600;

/// TLS identity bundle: certificate chain plus private key, DER.
#[derive(Clone)]
pub struct TlsIdentity {
    /// DER certificates, leaf first.
    pub cert_chain: Vec<Vec<u8>>,
    /// Private key in PKCS#8 DER format.
    pub key_der: Vec<u8>,
    /// The SPIFFE ID the leaf carries.
    pub spiffe_id: String,
}

impl std::fmt::Debug for TlsIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsIdentity")
            .field("spiffe_id", &self.spiffe_id)
            .field("chain_len", &self.cert_chain.len())
            .finish()
    }
}

/// Mint the server's own TLS SVID from the keystore.
pub fn server_svid_identity(ca: &CaKeystore) -> Result<TlsIdentity, CaError> {
    let spiffe_id = ca
        .trust_domain()
        .id_with_path("/spire/server")
        .map_err(|e| CaError::Signing(e.to_string()))?;

    let key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
        .map_err(|e| CaError::Signing(format!("server key generation failed: {e}")))?;

    let mut params = CertificateParams::new(vec![])
        .map_err(|e| CaError::Signing(format!("failed to create params: {e}")))?;
    let san = rcgen::string::Ia5String::try_from(spiffe_id.to_string())
        .map_err(|e| CaError::Signing(format!("invalid server SAN: {e}")))?;
    params.subject_alt_names = vec![SanType::URI(san)];

    let csr = params
        .serialize_request(&key)
        .map_err(|e| CaError::Signing(format!("server CSR failed: {e}")))?;

    let svid = ca.sign_x509_svid(csr.der(), SERVER_SVID_TTL_SECS)?;

    Ok(TlsIdentity {
        cert_chain: svid.cert_chain,
        key_der: key.serialize_der(),
        spiffe_id: spiffe_id.to_string(),
    })
}
