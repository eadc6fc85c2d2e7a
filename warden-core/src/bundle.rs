//! Trust bundles.

use serde::{Deserialize, Serialize};

/// The trust anchors of one trust domain: an ordered list of root CA
/// certificates in DER form.
///
/// The bundle for the server's own trust domain is maintained by the CA
/// keystore across rotations; federated bundles are installed by the
/// operator through the registration API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bundle {
    /// Trust-domain ID, e.g. `spiffe://example.org`.
    pub trust_domain_id: String,
    /// Root CA certificates, DER-encoded, oldest first.
    pub root_cas: Vec<Vec<u8>>,
}

impl Bundle {
    pub fn new(trust_domain_id: impl Into<String>, root_cas: Vec<Vec<u8>>) -> Self {
        Self {
            trust_domain_id: trust_domain_id.into(),
            root_cas,
        }
    }

    /// Append roots not already present, preserving order.
    pub fn append(&mut self, roots: &[Vec<u8>]) {
        for root in roots {
            if !self.root_cas.contains(root) {
                self.root_cas.push(root.clone());
            }
        }
    }
}
