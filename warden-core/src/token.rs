//! Join tokens.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A pre-shared single-use secret used as bootstrap attestation evidence.
///
/// Consumed the first time it is presented to the `join_token` attestor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinToken {
    pub token: String,
    /// Unix seconds after which the token is no longer accepted.
    pub expires_at: i64,
}

impl JoinToken {
    /// Generate a fresh random token expiring `ttl_seconds` from now.
    pub fn generate(ttl_seconds: i64) -> Self {
        Self::with_token(Uuid::new_v4().to_string(), ttl_seconds)
    }

    /// Wrap an operator-supplied token value expiring `ttl_seconds` from now.
    pub fn with_token(token: impl Into<String>, ttl_seconds: i64) -> Self {
        Self {
            token: token.into(),
            expires_at: Utc::now().timestamp() + ttl_seconds,
        }
    }

    pub fn is_expired(&self, now: i64) -> bool {
        now > self.expires_at
    }
}
