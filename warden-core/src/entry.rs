//! Registration entries.
//!
//! A registration entry is the policy record stating "a workload identified
//! by this parent/selector pair is entitled to this SPIFFE ID with this
//! TTL". Entries are created and mutated only through the registration API
//! and deleted explicitly.

use crate::id::{IdError, SpiffeId};
use crate::selector::{self, Selector};
use serde::{Deserialize, Serialize};

/// Path marking an entry as parented on the server itself. Such entries
/// describe identities assigned directly to nodes by selector match, so they
/// must carry a non-empty selector set.
pub const SERVER_PARENT_PATH: &str = "/spire/server";

/// Errors produced by entry validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EntryError {
    #[error("invalid parent ID: {0}")]
    InvalidParentId(#[source] IdError),
    #[error("invalid SPIFFE ID: {0}")]
    InvalidSpiffeId(#[source] IdError),
    #[error("invalid federated trust-domain ID: {0}")]
    InvalidFederatedId(#[source] IdError),
    #[error("federated trust-domain ID {0} must not have a path")]
    FederatedIdHasPath(String),
    #[error("duplicate selector {0}")]
    DuplicateSelector(Selector),
    #[error("an entry parented on the server must have at least one selector")]
    MissingSelectors,
}

/// A registration entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationEntry {
    /// Stable opaque identifier, assigned at creation.
    pub entry_id: String,
    /// The identity entitled to request SVIDs for `spiffe_id`, or a
    /// server-parented ID (see [`SERVER_PARENT_PATH`]).
    pub parent_id: SpiffeId,
    /// The workload identity minted to matching callers.
    pub spiffe_id: SpiffeId,
    /// Selectors a workload (or node) must present to match this entry.
    pub selectors: Vec<Selector>,
    /// SVID TTL in seconds; zero means the server default.
    pub ttl: i32,
    /// Trust domains whose bundles are federated to this workload.
    pub federates_with: Vec<SpiffeId>,
    /// Callers holding this identity may drive the registration API.
    pub admin: bool,
    /// The identity is a downstream signing authority.
    pub downstream: bool,
    /// Unix seconds after which the entry no longer matches, zero for never.
    pub expires_at: i64,
    /// DNS SANs copied into SVIDs minted for this entry.
    pub dns_names: Vec<String>,
}

impl RegistrationEntry {
    /// Validate the invariants that hold for every stored entry: valid IDs,
    /// unique selectors, trust-domain-only federation references, and a
    /// non-empty selector set for server-parented entries.
    pub fn validate(&self) -> Result<(), EntryError> {
        for federated in &self.federates_with {
            if !federated.is_trust_domain_id() {
                return Err(EntryError::FederatedIdHasPath(federated.to_string()));
            }
        }

        let mut seen = std::collections::BTreeSet::new();
        for s in &self.selectors {
            if !seen.insert(s) {
                return Err(EntryError::DuplicateSelector(s.clone()));
            }
        }

        if self.parent_id.path() == SERVER_PARENT_PATH && self.selectors.is_empty() {
            return Err(EntryError::MissingSelectors);
        }

        Ok(())
    }

    /// True when `other` registers the same identity: same SPIFFE ID, same
    /// parent, same selector set. Used for duplicate detection at creation.
    pub fn same_identity(&self, other: &RegistrationEntry) -> bool {
        if self.spiffe_id != other.spiffe_id || self.parent_id != other.parent_id {
            return false;
        }
        let mut a = self.selectors.clone();
        let mut b = other.selectors.clone();
        selector::normalize(&mut a);
        selector::normalize(&mut b);
        a == b
    }
}

/// Sort entries by `(spiffe_id, entry_id)` and drop duplicates, giving
/// callers stable diffs across responses.
pub fn sort_and_dedup(entries: &mut Vec<RegistrationEntry>) {
    entries.sort_by(|a, b| {
        a.spiffe_id
            .cmp(&b.spiffe_id)
            .then_with(|| a.entry_id.cmp(&b.entry_id))
    });
    entries.dedup_by(|a, b| a.entry_id == b.entry_id);
}
