//! TLS transport for the node API.
//!
//! Provides the server's SVID-based TLS identity, rustls server
//! configuration that verifies client SVIDs against the own-trust-domain
//! bundle, the `Connected` wrapper that surfaces the peer certificate to
//! handlers, and acceptor hot-reload for CA rotation.

mod cert;
mod conn;
mod connect_info;
mod reload;
mod server;
mod svid;

pub use cert::{server_svid_identity, TlsIdentity};
pub use conn::TlsConnection;
pub use connect_info::TlsConnectInfo;
pub use reload::ReloadableTlsAcceptor;
pub use server::{TlsConfigError, TlsServerConfig};
pub use svid::{svid_from_cert, PeerSvid, SvidParseError};
