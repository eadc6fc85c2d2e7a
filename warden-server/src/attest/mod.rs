//! Node attestation plugins.
//!
//! Plugin polymorphism is a capability trait plus a name lookup: the server
//! holds registries keyed by attestor type string. An attestor session owns
//! one challenge/response exchange; the node API handler relays its
//! challenges to the agent and feeds the answers back.

mod join_token;

pub use join_token::JoinTokenAttestor;

use crate::datastore::DataStoreError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use warden_core::{Selector, SpiffeId};

/// Errors surfaced by attestor and resolver plugins.
#[derive(Debug, thiserror::Error)]
pub enum AttestError {
    /// The node's evidence was rejected. Maps to `PermissionDenied`.
    #[error("{0}")]
    Rejected(String),
    /// The attestor ended the exchange without a result.
    #[error("attestor closed before emitting a result")]
    Incomplete,
    #[error("attestor plugin failure: {0}")]
    Plugin(String),
    #[error("data store: {0}")]
    DataStore(#[from] DataStoreError),
}

/// Outcome of a completed attestation exchange.
#[derive(Debug, Clone)]
pub struct AttestationResult {
    /// The agent identity the evidence proves.
    pub base_spiffe_id: SpiffeId,
    /// Selectors the attestor attributes to the node.
    pub selectors: Vec<Selector>,
    /// Whether the evidence was accepted.
    pub valid: bool,
}

/// One step of the exchange, as emitted by the attestor.
#[derive(Debug)]
pub enum AttestorStep {
    /// Relay this challenge to the agent and feed back its response.
    Challenge(Vec<u8>),
    /// The exchange is over.
    Result(AttestationResult),
}

/// A single in-flight attestation exchange, exclusively owned by the handler
/// invocation that opened it.
#[async_trait]
pub trait AttestorSession: Send {
    /// Advance the exchange. `response` carries the agent's answer to the
    /// previous challenge and is `None` on the first call.
    async fn step(&mut self, response: Option<Vec<u8>>) -> Result<AttestorStep, AttestError>;
}

/// A node attestor plugin, registered under a type string.
#[async_trait]
pub trait NodeAttestor: Send + Sync {
    /// The `attestation_data.type` this plugin serves.
    fn attestor_type(&self) -> &str;

    /// Whether a node already attested by this plugin may attest again.
    fn can_reattest(&self) -> bool;

    /// Start an exchange for the given attestation payload.
    async fn open(&self, payload: Vec<u8>) -> Result<Box<dyn AttestorSession>, AttestError>;
}

/// An optional selector resolver, keyed by the attestor type that admitted
/// the node.
#[async_trait]
pub trait NodeResolver: Send + Sync {
    /// Additional selectors for each of the given agent identities.
    async fn resolve(
        &self,
        ids: &[SpiffeId],
    ) -> Result<HashMap<SpiffeId, Vec<Selector>>, AttestError>;
}

/// Type-keyed plugin registries.
#[derive(Default)]
pub struct PluginRegistry {
    attestors: HashMap<String, Arc<dyn NodeAttestor>>,
    resolvers: HashMap<String, Arc<dyn NodeResolver>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_attestor(&mut self, attestor: Arc<dyn NodeAttestor>) {
        self.attestors
            .insert(attestor.attestor_type().to_string(), attestor);
    }

    pub fn register_resolver(&mut self, attestor_type: impl Into<String>, resolver: Arc<dyn NodeResolver>) {
        self.resolvers.insert(attestor_type.into(), resolver);
    }

    pub fn attestor(&self, attestor_type: &str) -> Option<Arc<dyn NodeAttestor>> {
        self.attestors.get(attestor_type).cloned()
    }

    pub fn resolver(&self, attestor_type: &str) -> Option<Arc<dyn NodeResolver>> {
        self.resolvers.get(attestor_type).cloned()
    }
}
