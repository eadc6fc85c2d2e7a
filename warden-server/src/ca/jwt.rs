//! JWT-SVID claims and key identification.

use base64::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Claims carried by a JWT-SVID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JwtSvidClaims {
    /// The SPIFFE ID the token speaks for.
    pub sub: String,
    /// Intended audiences.
    pub aud: Vec<String>,
    /// Expiry, Unix seconds.
    pub exp: i64,
    /// Issued-at, Unix seconds.
    pub iat: i64,
}

/// RFC 7638 JWK thumbprint of a P-256 public key, used as the `kid` header.
///
/// `spki_der` is the DER SubjectPublicKeyInfo; the trailing 65 bytes are the
/// uncompressed curve point `0x04 || x || y`.
pub fn jwk_thumbprint_p256(spki_der: &[u8]) -> Option<String> {
    if spki_der.len() < 65 {
        return None;
    }
    let point = &spki_der[spki_der.len() - 65..];
    if point[0] != 0x04 {
        return None;
    }
    let x = BASE64_URL_SAFE_NO_PAD.encode(&point[1..33]);
    let y = BASE64_URL_SAFE_NO_PAD.encode(&point[33..65]);

    // Thumbprint input is the canonical JWK: required members only, in
    // lexicographic order.
    let jwk = format!(r#"{{"crv":"P-256","kty":"EC","x":"{x}","y":"{y}"}}"#);
    let digest = Sha256::digest(jwk.as_bytes());
    Some(BASE64_URL_SAFE_NO_PAD.encode(digest))
}
