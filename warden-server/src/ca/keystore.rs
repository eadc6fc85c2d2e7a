//! CA keystore: signing key, certificate chain and rotation.
//!
//! The keystore owns a single P-256 signing key for the lifetime of the
//! process and a rotating signing certificate. Certificate state is an
//! immutable tuple behind an atomic swap: signs take the tuple by value for
//! the duration of one operation, loads serialize behind a mutex and publish
//! the new tuple atomically, so readers never observe a torn `(key, cert)`
//! pair and writers never block readers.

use super::jwt::{jwk_thumbprint_p256, JwtSvidClaims};
use super::{CaError, UpstreamCa};
use crate::datastore::DataStore;
use arc_swap::ArcSwapOption;
use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use rcgen::{
    BasicConstraints, CertificateParams, CertificateSigningRequestParams, DistinguishedName,
    DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, PublicKeyData, SanType,
    SerialNumber,
};
use rand::rngs::OsRng;
use rand::RngCore;
use std::path::PathBuf;
use std::sync::Arc;
use time::{Duration as TimeDuration, OffsetDateTime};
use tokio::sync::Mutex;
use warden_core::{Bundle, SpiffeId, TrustDomain};
use x509_parser::certification_request::X509CertificationRequest;
use x509_parser::extensions::{GeneralName, ParsedExtension};
use x509_parser::prelude::{FromDer, X509Certificate};

/// Default X509-SVID lifetime when an entry requests `ttl = 0`.
const DEFAULT_X509_TTL_SECS: i64 = 3600;

/// Default JWT-SVID lifetime when the request carries `ttl = 0`.
const DEFAULT_JWT_TTL_SECS: i64 = 300;

/// Validity of a self-signed root when no upstream CA is configured.
const SELF_SIGNED_VALIDITY_DAYS: i64 = 365;

/// Leaf `NotBefore` backdate tolerating clock skew between server and agents.
const BACKDATE_SECS: i64 = 10;

/// An issued X.509-SVID: the signed chain plus the facts recorded about it.
#[derive(Debug, Clone)]
pub struct SignedX509Svid {
    /// DER certificates, leaf first, signing cert second.
    pub cert_chain: Vec<Vec<u8>>,
    /// The SPIFFE ID carried by the leaf's URI SAN.
    pub spiffe_id: SpiffeId,
    /// Hex-encoded leaf serial.
    pub serial: String,
    /// Leaf expiry, Unix seconds.
    pub expires_at: i64,
}

/// An issued JWT-SVID.
#[derive(Debug, Clone)]
pub struct SignedJwtSvid {
    /// Compact JWS serialization.
    pub token: String,
    pub issued_at: i64,
    pub expires_at: i64,
}

/// Immutable certificate state published as a unit on every load.
struct SigningState {
    /// Current signing certificate, DER.
    cert_der: Vec<u8>,
    /// Signing certificate expiry, Unix seconds; caps every issued SVID.
    cert_not_after: i64,
    /// Root certificates still within validity, `(der, not_after)`, oldest
    /// first. Old roots linger until the last SVID they signed has expired.
    roots: Vec<(Vec<u8>, i64)>,
    /// Rotation epoch, incremented per load.
    epoch: u64,
}

/// The server CA.
pub struct CaKeystore {
    trust_domain: TrustDomain,
    datastore: Arc<dyn DataStore>,
    key: KeyPair,
    jwt_encoding_key: EncodingKey,
    jwt_kid: String,
    state: ArcSwapOption<SigningState>,
    load_lock: Mutex<()>,
    keypair_path: Option<PathBuf>,
}

impl CaKeystore {
    /// Create a keystore with a fresh signing key, or the key read from
    /// `keypair_path` when the file exists. A persisted certificate is
    /// installed immediately; a persisted key whose certificate does not
    /// match fails with [`CaError::KeyMismatch`].
    pub async fn open(
        trust_domain: TrustDomain,
        datastore: Arc<dyn DataStore>,
        keypair_path: Option<PathBuf>,
    ) -> Result<Self, CaError> {
        let persisted = match &keypair_path {
            Some(path) if path.exists() => Some(read_keypair_file(path)?),
            _ => None,
        };

        let key = match &persisted {
            Some((key_der, _)) => KeyPair::try_from(key_der.as_slice())
                .map_err(|e| CaError::Persistence(format!("failed to load signing key: {e}")))?,
            None => KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
                .map_err(|e| CaError::Signing(format!("key generation failed: {e}")))?,
        };

        let key_pem = key.serialize_pem();
        let jwt_encoding_key = EncodingKey::from_ec_pem(key_pem.as_bytes())
            .map_err(|e| CaError::Signing(format!("JWT key setup failed: {e}")))?;
        let jwt_kid = jwk_thumbprint_p256(&key.subject_public_key_info())
            .ok_or_else(|| CaError::Signing("unsupported signing key shape".to_string()))?;

        let keystore = Self {
            trust_domain,
            datastore,
            key,
            jwt_encoding_key,
            jwt_kid,
            state: ArcSwapOption::const_empty(),
            load_lock: Mutex::new(()),
            keypair_path,
        };

        if let Some((_, cert_der)) = persisted {
            keystore.load_certificate(&cert_der).await?;
        }

        Ok(keystore)
    }

    pub fn trust_domain(&self) -> &TrustDomain {
        &self.trust_domain
    }

    /// The `kid` placed in JWT-SVID headers.
    pub fn jwt_kid(&self) -> &str {
        &self.jwt_kid
    }

    /// The current signing certificate DER, `None` before the first load.
    pub fn fetch_certificate(&self) -> Option<Vec<u8>> {
        self.state.load().as_ref().map(|s| s.cert_der.clone())
    }

    /// The current own-trust-domain bundle, `None` before the first load.
    pub fn bundle(&self) -> Option<Bundle> {
        self.state.load().as_ref().map(|s| {
            Bundle::new(
                self.trust_domain.id_string(),
                s.roots.iter().map(|(der, _)| der.clone()).collect(),
            )
        })
    }

    /// Produce a CSR for the server CA's own key, URI SAN = the trust
    /// domain. Used to request a signed intermediate from an upstream CA.
    pub fn generate_csr(&self) -> Result<Vec<u8>, CaError> {
        let mut params = CertificateParams::new(vec![])
            .map_err(|e| CaError::Signing(format!("failed to create params: {e}")))?;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "Warden Server CA");
        params.distinguished_name = dn;

        let san = rcgen::string::Ia5String::try_from(self.trust_domain.id_string())
            .map_err(|e| CaError::Signing(format!("invalid CA SAN: {e}")))?;
        params.subject_alt_names = vec![SanType::URI(san)];
        params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

        let csr = params
            .serialize_request(&self.key)
            .map_err(|e| CaError::Signing(format!("CSR serialization failed: {e}")))?;
        Ok(csr.der().to_vec())
    }

    /// Bootstrap without an upstream CA: self-sign a root for the trust
    /// domain and install it.
    pub async fn bootstrap_self_signed(&self) -> Result<(), CaError> {
        let mut params = CertificateParams::new(vec![])
            .map_err(|e| CaError::Signing(format!("failed to create params: {e}")))?;

        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            format!("Warden Root CA - {}", self.trust_domain),
        );
        dn.push(DnType::OrganizationName, "Warden");
        params.distinguished_name = dn;

        let now = OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + TimeDuration::days(SELF_SIGNED_VALIDITY_DAYS);
        params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

        let san = rcgen::string::Ia5String::try_from(self.trust_domain.id_string())
            .map_err(|e| CaError::Signing(format!("invalid CA SAN: {e}")))?;
        params.subject_alt_names = vec![SanType::URI(san)];

        let cert = params
            .self_signed(&self.key)
            .map_err(|e| CaError::Signing(format!("root generation failed: {e}")))?;

        self.load_certificate(cert.der()).await
    }

    /// Bootstrap against an upstream CA: submit our CSR and install the
    /// returned intermediate.
    pub async fn bootstrap_upstream(&self, upstream: &dyn UpstreamCa) -> Result<(), CaError> {
        let csr = self.generate_csr()?;
        let cert_der = upstream.submit_csr(&csr).await?;
        self.load_certificate(&cert_der).await
    }

    /// Atomically install a freshly signed certificate for the stored key.
    ///
    /// The certificate's public key must equal the stored key's, else
    /// [`CaError::KeyMismatch`]. The own-trust-domain bundle gains the new
    /// root; previous roots are retained until their `NotAfter` has passed.
    /// On failure the previous chain stays intact.
    pub async fn load_certificate(&self, cert_der: &[u8]) -> Result<(), CaError> {
        let _guard = self.load_lock.lock().await;

        let (_, cert) = X509Certificate::from_der(cert_der)
            .map_err(|e| CaError::Signing(format!("failed to parse certificate: {e}")))?;

        if cert.public_key().raw != self.key.subject_public_key_info().as_slice() {
            return Err(CaError::KeyMismatch);
        }
        let cert_not_after = cert.validity().not_after.timestamp();

        let now = Utc::now().timestamp();
        let previous = self.state.load_full();
        let mut roots: Vec<(Vec<u8>, i64)> = previous
            .as_ref()
            .map(|s| {
                s.roots
                    .iter()
                    .filter(|(_, not_after)| *not_after >= now)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        if !roots.iter().any(|(der, _)| der == cert_der) {
            roots.push((cert_der.to_vec(), cert_not_after));
        }
        let epoch = previous.as_ref().map(|s| s.epoch + 1).unwrap_or(0);

        let state = SigningState {
            cert_der: cert_der.to_vec(),
            cert_not_after,
            roots,
            epoch,
        };

        let bundle = Bundle::new(
            self.trust_domain.id_string(),
            state.roots.iter().map(|(der, _)| der.clone()).collect(),
        );

        self.state.store(Some(Arc::new(state)));
        self.datastore.append_bundle(bundle).await?;

        if let Some(path) = &self.keypair_path {
            write_keypair_file(path, &self.key, cert_der)?;
        }

        tracing::info!(
            trust_domain = %self.trust_domain,
            epoch,
            not_after = cert_not_after,
            "Signing certificate installed"
        );
        Ok(())
    }

    /// Sign a workload or agent CSR.
    ///
    /// The CSR must carry exactly one URI SAN naming a SPIFFE ID inside the
    /// server's trust domain; all other requested subject fields are
    /// ignored. `NotBefore` is backdated ten seconds; `NotAfter` is
    /// `min(now + ttl, signing_cert.NotAfter)`; `ttl = 0` means the default.
    pub fn sign_x509_svid(&self, csr_der: &[u8], ttl: i32) -> Result<SignedX509Svid, CaError> {
        let state = self.state.load_full().ok_or(CaError::NotInitialized)?;

        let spiffe_id = self.validate_csr(csr_der)?;

        let mut csr_params =
            CertificateSigningRequestParams::from_der(&csr_der.to_vec().into())
                .map_err(|e| CaError::InvalidCsr(format!("failed to decode CSR: {e}")))?;

        let ttl = if ttl <= 0 {
            DEFAULT_X509_TTL_SECS
        } else {
            ttl as i64
        };
        let now = Utc::now().timestamp();
        let expires_at = (now + ttl).min(state.cert_not_after);

        let serial = new_serial();

        let params = &mut csr_params.params;
        params.distinguished_name = DistinguishedName::new();
        params.not_before = OffsetDateTime::from_unix_timestamp(now - BACKDATE_SECS)
            .map_err(|e| CaError::Signing(e.to_string()))?;
        params.not_after = OffsetDateTime::from_unix_timestamp(expires_at)
            .map_err(|e| CaError::Signing(e.to_string()))?;
        params.serial_number = Some(SerialNumber::from(serial.clone()));
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];

        let issuer =
            rcgen::Issuer::from_ca_cert_der(&state.cert_der.as_slice().into(), &self.key)
                .map_err(|e| CaError::Signing(format!("failed to derive issuer: {e}")))?;
        let cert = csr_params
            .signed_by(&issuer)
            .map_err(|e| CaError::Signing(format!("certificate signing failed: {e}")))?;

        Ok(SignedX509Svid {
            cert_chain: vec![cert.der().to_vec(), state.cert_der.clone()],
            spiffe_id,
            serial: hex::encode(serial),
            expires_at,
        })
    }

    /// Sign a JWT-SVID for `spiffe_id` with the given audiences.
    ///
    /// `exp = now + ttl` capped by the signing certificate's expiry;
    /// `ttl = 0` means the default.
    pub fn sign_jwt_svid(
        &self,
        spiffe_id: &SpiffeId,
        audiences: &[String],
        ttl: i32,
    ) -> Result<SignedJwtSvid, CaError> {
        let state = self.state.load_full().ok_or(CaError::NotInitialized)?;

        let ttl = if ttl <= 0 {
            DEFAULT_JWT_TTL_SECS
        } else {
            ttl as i64
        };
        let iat = Utc::now().timestamp();
        let exp = (iat + ttl).min(state.cert_not_after);

        let claims = JwtSvidClaims {
            sub: spiffe_id.to_string(),
            aud: audiences.to_vec(),
            exp,
            iat,
        };

        let mut header = Header::new(Algorithm::ES256);
        header.kid = Some(self.jwt_kid.clone());

        let token = jsonwebtoken::encode(&header, &claims, &self.jwt_encoding_key)
            .map_err(|e| CaError::Signing(format!("JWT signing failed: {e}")))?;

        Ok(SignedJwtSvid {
            token,
            issued_at: iat,
            expires_at: exp,
        })
    }

    /// Parse and validate a CSR: well-formed DER, valid self-signature, and
    /// exactly one URI SAN naming a workload ID inside our trust domain.
    fn validate_csr(&self, csr_der: &[u8]) -> Result<SpiffeId, CaError> {
        let (_, csr) = X509CertificationRequest::from_der(csr_der)
            .map_err(|e| CaError::InvalidCsr(format!("failed to parse CSR: {e}")))?;

        csr.verify_signature()
            .map_err(|e| CaError::InvalidCsr(format!("signature verification failed: {e}")))?;

        let mut uris = Vec::new();
        if let Some(extensions) = csr.requested_extensions() {
            for ext in extensions {
                if let ParsedExtension::SubjectAlternativeName(san) = ext {
                    for name in &san.general_names {
                        if let GeneralName::URI(uri) = name {
                            uris.push(uri.to_string());
                        }
                    }
                }
            }
        }

        let uri = match uris.as_slice() {
            [single] => single,
            [] => return Err(CaError::InvalidCsr("CSR has no URI SAN".to_string())),
            _ => {
                return Err(CaError::InvalidCsr(format!(
                    "CSR has {} URI SANs, expected exactly one",
                    uris.len()
                )))
            }
        };

        let spiffe_id = SpiffeId::parse(uri)
            .map_err(|e| CaError::InvalidCsr(format!("CSR SAN is not a SPIFFE ID: {e}")))?;
        if !spiffe_id.is_member_of(&self.trust_domain) {
            return Err(CaError::InvalidCsr(format!(
                "{spiffe_id} is not a member of trust domain {}",
                self.trust_domain
            )));
        }
        if spiffe_id.is_trust_domain_id() {
            return Err(CaError::InvalidCsr(
                "CSR SAN names the trust domain, not a workload".to_string(),
            ));
        }
        Ok(spiffe_id)
    }
}

/// Random 16-byte serial with the top bit clear, so the DER encoding equals
/// the generated bytes and the hex form can be compared against parsed
/// certificates byte-for-byte.
fn new_serial() -> Vec<u8> {
    let mut serial = [0u8; 16];
    OsRng.fill_bytes(&mut serial);
    serial[0] &= 0x7f;
    serial.to_vec()
}

/// Read the persisted keypair file: one PKCS#8 private-key block followed by
/// one certificate block.
fn read_keypair_file(path: &std::path::Path) -> Result<(Vec<u8>, Vec<u8>), CaError> {
    let raw = std::fs::read(path)
        .map_err(|e| CaError::Persistence(format!("failed to read {}: {e}", path.display())))?;
    let blocks = pem::parse_many(&raw)
        .map_err(|e| CaError::Persistence(format!("failed to parse {}: {e}", path.display())))?;

    let key = blocks
        .iter()
        .find(|b| b.tag() == "PRIVATE KEY")
        .ok_or_else(|| CaError::Persistence("keypair file has no PRIVATE KEY block".into()))?;
    let cert = blocks
        .iter()
        .find(|b| b.tag() == "CERTIFICATE")
        .ok_or_else(|| CaError::Persistence("keypair file has no CERTIFICATE block".into()))?;

    Ok((key.contents().to_vec(), cert.contents().to_vec()))
}

/// Atomically persist the keypair file: write a temp file next to the
/// target, then rename over it.
fn write_keypair_file(
    path: &std::path::Path,
    key: &KeyPair,
    cert_der: &[u8],
) -> Result<(), CaError> {
    let mut contents = key.serialize_pem();
    contents.push_str(&pem::encode(&pem::Pem::new("CERTIFICATE", cert_der.to_vec())));

    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, contents.as_bytes())
        .map_err(|e| CaError::Persistence(format!("failed to write {}: {e}", tmp.display())))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))
            .map_err(|e| CaError::Persistence(e.to_string()))?;
    }
    std::fs::rename(&tmp, path)
        .map_err(|e| CaError::Persistence(format!("failed to install {}: {e}", path.display())))?;
    Ok(())
}
