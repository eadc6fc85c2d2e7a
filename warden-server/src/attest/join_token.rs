//! Join-token node attestor.
//!
//! The evidence is a pre-shared single-use token. The token is consumed the
//! moment it is presented: the store's atomic delete guarantees a concurrent
//! presentation of the same token loses the race and is rejected.

use super::{AttestError, AttestationResult, AttestorSession, AttestorStep, NodeAttestor};
use crate::datastore::{DataStore, DataStoreError};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use warden_core::TrustDomain;

pub const ATTESTOR_TYPE: &str = "join_token";

pub struct JoinTokenAttestor {
    datastore: Arc<dyn DataStore>,
    trust_domain: TrustDomain,
}

impl JoinTokenAttestor {
    pub fn new(datastore: Arc<dyn DataStore>, trust_domain: TrustDomain) -> Self {
        Self {
            datastore,
            trust_domain,
        }
    }
}

#[async_trait]
impl NodeAttestor for JoinTokenAttestor {
    fn attestor_type(&self) -> &str {
        ATTESTOR_TYPE
    }

    fn can_reattest(&self) -> bool {
        false
    }

    async fn open(&self, payload: Vec<u8>) -> Result<Box<dyn AttestorSession>, AttestError> {
        let token = String::from_utf8(payload)
            .map_err(|_| AttestError::Rejected("join token is not valid UTF-8".into()))?;
        let token = token.trim().to_string();
        if token.is_empty() {
            return Err(AttestError::Rejected("join token is empty".into()));
        }

        let consumed = match self.datastore.consume_join_token(&token).await {
            Ok(t) => t,
            Err(DataStoreError::NotFound) => {
                tracing::warn!("Join token not found or already used");
                return Err(AttestError::Rejected(
                    "join token does not exist or has already been used".into(),
                ));
            }
            Err(e) => return Err(e.into()),
        };

        if consumed.is_expired(Utc::now().timestamp()) {
            return Err(AttestError::Rejected("join token expired".into()));
        }

        let base_spiffe_id = self
            .trust_domain
            .id_with_path(&format!("/spire/agent/join_token/{token}"))
            .map_err(|e| AttestError::Rejected(format!("token does not form a valid ID: {e}")))?;

        Ok(Box::new(JoinTokenSession {
            result: Some(AttestationResult {
                base_spiffe_id,
                selectors: vec![],
                valid: true,
            }),
        }))
    }
}

/// Join tokens need no challenges; the session emits its result immediately.
struct JoinTokenSession {
    result: Option<AttestationResult>,
}

#[async_trait]
impl AttestorSession for JoinTokenSession {
    async fn step(&mut self, _response: Option<Vec<u8>>) -> Result<AttestorStep, AttestError> {
        match self.result.take() {
            Some(result) => Ok(AttestorStep::Result(result)),
            None => Err(AttestError::Incomplete),
        }
    }
}
