//! Trust domains and SPIFFE IDs.
//!
//! A SPIFFE ID is a URI of the form `spiffe://<trust_domain>/<path>`. IDs are
//! case-sensitive and compared exactly; parsing canonicalizes nothing beyond
//! rejecting malformed input, so two IDs are equal iff their strings are.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// URI scheme prefix shared by all SPIFFE IDs.
const SCHEME_PREFIX: &str = "spiffe://";

/// Characters permitted in a trust-domain name.
fn valid_domain_char(c: char) -> bool {
    c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '-' | '_')
}

/// Characters permitted in a path segment.
fn valid_path_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_')
}

/// Errors produced while parsing identifiers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    #[error("ID must begin with {SCHEME_PREFIX}")]
    MissingScheme,
    #[error("trust domain is empty")]
    EmptyTrustDomain,
    #[error("invalid character {0:?} in trust domain")]
    InvalidDomainChar(char),
    #[error("empty path segment")]
    EmptySegment,
    #[error("invalid character {0:?} in path")]
    InvalidPathChar(char),
    #[error("expected a trust-domain ID but {0} has a path")]
    UnexpectedPath(String),
}

/// The name of a trust domain, e.g. `example.org`.
///
/// Stored without the `spiffe://` prefix. All server-issued SPIFFE IDs are
/// rooted at exactly one trust domain, fixed at startup.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrustDomain(String);

impl TrustDomain {
    /// Parse a bare trust-domain name (no scheme, no path).
    pub fn new(name: impl Into<String>) -> Result<Self, IdError> {
        let name = name.into();
        if name.is_empty() {
            return Err(IdError::EmptyTrustDomain);
        }
        if let Some(c) = name.chars().find(|c| !valid_domain_char(*c)) {
            return Err(IdError::InvalidDomainChar(c));
        }
        Ok(Self(name))
    }

    /// Parse a trust-domain ID of the form `spiffe://<name>` (empty path).
    pub fn from_id_string(s: &str) -> Result<Self, IdError> {
        let id = SpiffeId::parse(s)?;
        if !id.path().is_empty() {
            return Err(IdError::UnexpectedPath(s.to_string()));
        }
        Ok(id.trust_domain().clone())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The trust-domain SPIFFE ID, `spiffe://<name>`.
    pub fn id_string(&self) -> String {
        format!("{SCHEME_PREFIX}{}", self.0)
    }

    /// The SPIFFE ID of this domain with the given path appended.
    pub fn id_with_path(&self, path: &str) -> Result<SpiffeId, IdError> {
        SpiffeId::parse(&format!("{SCHEME_PREFIX}{}{path}", self.0))
    }
}

impl fmt::Display for TrustDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A SPIFFE ID: a trust domain plus a path.
///
/// A "workload" ID has a non-empty path; a "trust-domain" ID has an empty
/// path. The path, when present, always begins with `/`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SpiffeId {
    trust_domain: TrustDomain,
    path: String,
}

impl SpiffeId {
    /// Parse a full SPIFFE URI, e.g. `spiffe://example.org/spire/agent/x`.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        let rest = s.strip_prefix(SCHEME_PREFIX).ok_or(IdError::MissingScheme)?;

        let (domain, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, ""),
        };

        let trust_domain = TrustDomain::new(domain)?;

        if !path.is_empty() {
            for segment in path[1..].split('/') {
                if segment.is_empty() {
                    return Err(IdError::EmptySegment);
                }
                if let Some(c) = segment.chars().find(|c| !valid_path_char(*c)) {
                    return Err(IdError::InvalidPathChar(c));
                }
            }
        }

        Ok(Self {
            trust_domain,
            path: path.to_string(),
        })
    }

    pub fn trust_domain(&self) -> &TrustDomain {
        &self.trust_domain
    }

    /// The path component, empty for a trust-domain ID.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// True when this names a trust domain rather than a workload or node.
    pub fn is_trust_domain_id(&self) -> bool {
        self.path.is_empty()
    }

    /// True when this ID lives inside `domain`.
    pub fn is_member_of(&self, domain: &TrustDomain) -> bool {
        &self.trust_domain == domain
    }
}

impl fmt::Display for SpiffeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{SCHEME_PREFIX}{}{}", self.trust_domain.0, self.path)
    }
}

impl FromStr for SpiffeId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for SpiffeId {
    type Error = IdError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<SpiffeId> for String {
    fn from(id: SpiffeId) -> String {
        id.to_string()
    }
}
