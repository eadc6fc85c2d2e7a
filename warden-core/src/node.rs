//! Attested node records.

use crate::id::SpiffeId;
use serde::{Deserialize, Serialize};

/// Record of a node that has completed attestation.
///
/// Created on first successful attestation, updated on every agent SVID
/// rotation to carry the new serial and expiry, deleted on administrative
/// ban. At most one record exists per SPIFFE ID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestedNode {
    /// The agent identity minted at attestation.
    pub spiffe_id: SpiffeId,
    /// The attestor type that admitted the node (e.g. `join_token`).
    pub attestation_type: String,
    /// Hex-encoded serial of the most recently issued agent SVID. A caller
    /// presenting any other serial has been rotated out and must re-attest.
    pub cert_serial: String,
    /// Unix seconds at which the current agent SVID expires.
    pub cert_not_after: i64,
}
