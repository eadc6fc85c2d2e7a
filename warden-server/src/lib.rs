//! Warden control-plane server.
//!
//! The server side of the workload-identity fabric: it turns node
//! attestation evidence into signed agent identities and serves every
//! attested agent the workload SVIDs and trust bundles it is entitled to
//! cache and forward.
//!
//! ## Modules
//!
//! - [`datastore`] - Transactional persistence facade (SQLite default)
//! - [`ca`] - The server CA: X.509 and JWT SVID signing, rotation
//! - [`resolver`] - Registration-entry closure computation
//! - [`bundles`] - Trust-bundle map assembly
//! - [`limits`] - Per-stream rate limiting
//! - [`attest`] - Node attestor / resolver / upstream-CA plugin seams
//! - [`tls`] - SVID-based transport
//! - [`services`] - The node and registration gRPC handlers
//! - [`metrics`] - Fire-and-forget telemetry sink

pub mod attest;
pub mod bundles;
pub mod ca;
pub mod convert;
pub mod datastore;
pub mod limits;
pub mod metrics;
pub mod resolver;
pub mod services;
pub mod tls;
