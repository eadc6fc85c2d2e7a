//! TLS connection info for SVID authentication checks.

use std::net::SocketAddr;

/// Connection info extracted from TLS streams.
///
/// Made available via `request.extensions()` in gRPC handlers, allowing the
/// authorizer to read the verified peer leaf certificate. Absent entirely on
/// local (non-TLS) listeners.
#[derive(Debug, Clone)]
pub struct TlsConnectInfo {
    pub remote_addr: Option<SocketAddr>,
    /// The peer's verified leaf certificate, DER; `None` when the client
    /// presented no certificate.
    pub peer_cert_der: Option<Vec<u8>>,
}

impl TlsConnectInfo {
    pub fn new(remote_addr: Option<SocketAddr>, peer_cert_der: Option<Vec<u8>>) -> Self {
        Self {
            remote_addr,
            peer_cert_der,
        }
    }
}
