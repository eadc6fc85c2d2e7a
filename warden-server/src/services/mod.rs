//! gRPC service implementations.
//!
//! The node service turns attestation evidence into agent identities and
//! serves SVID updates; the registration service owns the policy records the
//! node service reads. Both map the domain error taxonomy onto gRPC codes
//! here, at the edge.

mod node;
mod registration;

pub use node::{
    AgentCaller, NodeAuthorizer, NodeService, SvidAuthorizer, METHOD_ATTEST,
    METHOD_FETCH_JWT_SVID, METHOD_FETCH_X509_SVID,
};
pub use registration::RegistrationService;

use crate::attest::AttestError;
use crate::ca::CaError;
use crate::datastore::DataStoreError;
use tonic::Status;

/// Data-store taxonomy onto gRPC codes. Driver failures are transient from
/// the caller's point of view, so they surface as `Unavailable`.
pub(crate) fn status_from_datastore(e: DataStoreError) -> Status {
    match e {
        DataStoreError::NotFound => Status::not_found("record not found"),
        DataStoreError::AlreadyExists => Status::already_exists("record already exists"),
        DataStoreError::Malformed(m) => Status::internal(format!("malformed record: {m}")),
        DataStoreError::Database(e) => Status::unavailable(format!("data store unavailable: {e}")),
    }
}

pub(crate) fn status_from_ca(e: CaError) -> Status {
    match e {
        CaError::InvalidCsr(m) => Status::invalid_argument(format!("invalid CSR: {m}")),
        CaError::NotInitialized => Status::internal("no signing certificate loaded"),
        CaError::KeyMismatch => {
            Status::internal("certificate public key does not match the signing key")
        }
        CaError::Signing(m) => Status::internal(format!("signing failed: {m}")),
        CaError::Persistence(m) => Status::internal(format!("CA persistence failed: {m}")),
        CaError::DataStore(e) => status_from_datastore(e),
        CaError::Upstream(m) => Status::unavailable(format!("upstream CA unavailable: {m}")),
    }
}

pub(crate) fn status_from_attest(e: AttestError) -> Status {
    match e {
        AttestError::Rejected(m) => Status::permission_denied(m),
        AttestError::Incomplete => {
            Status::internal("attestor closed before emitting a result")
        }
        AttestError::Plugin(m) => Status::unavailable(format!("attestor plugin failure: {m}")),
        AttestError::DataStore(e) => status_from_datastore(e),
    }
}
