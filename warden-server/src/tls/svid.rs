//! Peer SVID extraction.

use warden_core::SpiffeId;
use x509_parser::extensions::{GeneralName, ParsedExtension};
use x509_parser::prelude::{FromDer, X509Certificate};

/// Identity facts taken from a verified peer leaf certificate.
#[derive(Debug, Clone)]
pub struct PeerSvid {
    pub spiffe_id: SpiffeId,
    /// Hex-encoded certificate serial.
    pub serial: String,
    /// Leaf expiry, Unix seconds.
    pub not_after: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum SvidParseError {
    #[error("failed to parse certificate: {0}")]
    Malformed(String),
    #[error("certificate has no URI SAN")]
    NoUriSan,
    #[error("certificate has {0} URI SANs, expected exactly one")]
    MultipleUriSans(usize),
    #[error("URI SAN is not a SPIFFE ID: {0}")]
    NotSpiffe(#[from] warden_core::IdError),
}

/// Parse an X.509-SVID leaf: exactly one URI SAN holding a SPIFFE ID.
pub fn svid_from_cert(cert_der: &[u8]) -> Result<PeerSvid, SvidParseError> {
    let (_, cert) = X509Certificate::from_der(cert_der)
        .map_err(|e| SvidParseError::Malformed(e.to_string()))?;

    let mut uris = Vec::new();
    for ext in cert.extensions() {
        if let ParsedExtension::SubjectAlternativeName(san) = ext.parsed_extension() {
            for name in &san.general_names {
                if let GeneralName::URI(uri) = name {
                    uris.push(uri.to_string());
                }
            }
        }
    }

    let uri = match uris.as_slice() {
        [single] => single,
        [] => return Err(SvidParseError::NoUriSan),
        many => return Err(SvidParseError::MultipleUriSans(many.len())),
    };

    Ok(PeerSvid {
        spiffe_id: SpiffeId::parse(uri)?,
        serial: hex::encode(cert.raw_serial()),
        not_after: cert.validity().not_after.timestamp(),
    })
}
