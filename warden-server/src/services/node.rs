//! Node gRPC service implementation.
//!
//! Three methods: `Attest` turns attestation evidence into an agent SVID
//! over a challenge/response stream, `FetchX509Svid` serves the workload
//! SVIDs an attested agent is entitled to cache, and `FetchJwtSvid` signs
//! JWT-SVIDs. Every method runs through the [`NodeAuthorizer`] first.

use super::{status_from_attest, status_from_ca, status_from_datastore};
use crate::attest::{AttestorStep, PluginRegistry};
use crate::bundles::BundleAssembler;
use crate::ca::CaKeystore;
use crate::convert::{bundle_to_proto, entry_to_proto};
use crate::datastore::{DataStore, DataStoreError};
use crate::limits::{MessageClass, RateLimits};
use crate::metrics::Metrics;
use crate::resolver::{merge_selectors, EntryResolver};
use crate::tls::{svid_from_cert, TlsConnectInfo};
use async_trait::async_trait;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_stream::Stream;
use tonic::{Request, Response, Status, Streaming};
use warden_core::{AttestedNode, Bundle, RegistrationEntry, SpiffeId, TrustDomain};
use warden_proto::node::v1::{
    attest_response, node_server::Node, AttestRequest, AttestResponse, FetchJwtSvidRequest,
    FetchJwtSvidResponse, FetchX509SvidRequest, FetchX509SvidResponse, JwtSvid, SvidUpdate,
    X509Svid,
};
use x509_parser::certification_request::X509CertificationRequest;
use x509_parser::extensions::{GeneralName, ParsedExtension};
use x509_parser::prelude::FromDer;

pub const METHOD_ATTEST: &str = "/warden.node.v1.Node/Attest";
pub const METHOD_FETCH_X509_SVID: &str = "/warden.node.v1.Node/FetchX509Svid";
pub const METHOD_FETCH_JWT_SVID: &str = "/warden.node.v1.Node/FetchJwtSvid";

/// Bound on the attestation challenge loop.
const ATTEST_DEADLINE: Duration = Duration::from_secs(5 * 60);

/// The verified caller attached to a request by the authorizer.
#[derive(Debug, Clone)]
pub struct AgentCaller {
    pub spiffe_id: SpiffeId,
    /// Hex serial of the presented agent SVID.
    pub serial: String,
}

/// Per-method authorization, invoked before every node API method.
#[async_trait]
pub trait NodeAuthorizer: Send + Sync {
    /// `Ok(None)` for methods that need no caller identity (`Attest`),
    /// `Ok(Some(_))` with the verified caller otherwise.
    async fn authorize(
        &self,
        method: &str,
        extensions: &tonic::Extensions,
    ) -> Result<Option<AgentCaller>, Status>;
}

/// Production authorizer: the client's verified TLS leaf must carry exactly
/// one URI SAN naming a SPIFFE ID in the server's trust domain, and must
/// match an attested-node record whose stored serial equals the presented
/// serial. A mismatched serial means the agent was rotated out and must
/// re-attest.
pub struct SvidAuthorizer {
    trust_domain: TrustDomain,
    datastore: Arc<dyn DataStore>,
}

impl SvidAuthorizer {
    pub fn new(trust_domain: TrustDomain, datastore: Arc<dyn DataStore>) -> Self {
        Self {
            trust_domain,
            datastore,
        }
    }
}

#[async_trait]
impl NodeAuthorizer for SvidAuthorizer {
    async fn authorize(
        &self,
        method: &str,
        extensions: &tonic::Extensions,
    ) -> Result<Option<AgentCaller>, Status> {
        match method {
            METHOD_ATTEST => Ok(None),
            METHOD_FETCH_X509_SVID | METHOD_FETCH_JWT_SVID => {
                let cert_der = extensions
                    .get::<TlsConnectInfo>()
                    .and_then(|info| info.peer_cert_der.clone())
                    .ok_or_else(|| Status::permission_denied("agent SVID required"))?;

                let svid = svid_from_cert(&cert_der)
                    .map_err(|e| Status::permission_denied(format!("invalid agent SVID: {e}")))?;
                if !svid.spiffe_id.is_member_of(&self.trust_domain) {
                    return Err(Status::permission_denied(format!(
                        "agent SVID is not a member of trust domain {}",
                        self.trust_domain
                    )));
                }

                let node = match self.datastore.fetch_attested_node(&svid.spiffe_id).await {
                    Ok(node) => node,
                    Err(DataStoreError::NotFound) => {
                        return Err(Status::permission_denied("agent is not attested"))
                    }
                    Err(e) => return Err(status_from_datastore(e)),
                };
                if node.cert_serial != svid.serial {
                    return Err(Status::permission_denied(
                        "agent SVID serial mismatch; node must re-attest",
                    ));
                }

                Ok(Some(AgentCaller {
                    spiffe_id: svid.spiffe_id,
                    serial: svid.serial,
                }))
            }
            other => Err(Status::permission_denied(format!(
                "authorization not implemented for method {other:?}"
            ))),
        }
    }
}

/// The node API handler.
#[derive(Clone)]
pub struct NodeService {
    trust_domain: TrustDomain,
    datastore: Arc<dyn DataStore>,
    ca: Arc<CaKeystore>,
    resolver: EntryResolver,
    bundles: BundleAssembler,
    limits: Arc<dyn RateLimits>,
    plugins: Arc<PluginRegistry>,
    authorizer: Arc<dyn NodeAuthorizer>,
    metrics: Arc<dyn Metrics>,
}

impl NodeService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        trust_domain: TrustDomain,
        datastore: Arc<dyn DataStore>,
        ca: Arc<CaKeystore>,
        limits: Arc<dyn RateLimits>,
        plugins: Arc<PluginRegistry>,
        authorizer: Arc<dyn NodeAuthorizer>,
        metrics: Arc<dyn Metrics>,
    ) -> Self {
        Self {
            resolver: EntryResolver::new(datastore.clone()),
            bundles: BundleAssembler::new(datastore.clone(), trust_domain.clone()),
            trust_domain,
            datastore,
            ca,
            limits,
            plugins,
            authorizer,
            metrics,
        }
    }

    /// Build the update served by `FetchX509Svid` for one request.
    async fn build_fetch_update(
        &self,
        caller: &AgentCaller,
        csrs: &[Vec<u8>],
    ) -> Result<SvidUpdate, Status> {
        let node_selectors = self
            .datastore
            .get_node_selectors(&caller.spiffe_id)
            .await
            .map_err(status_from_datastore)?;
        let entries = self
            .resolver
            .resolve(&caller.spiffe_id, &node_selectors)
            .await
            .map_err(status_from_datastore)?;

        let mut svids = HashMap::new();
        for csr in csrs {
            let id = match csr_spiffe_id(csr) {
                Ok(id) => id,
                Err(e) => {
                    tracing::warn!(caller = %caller.spiffe_id, error = %e, "Skipping unparseable CSR");
                    continue;
                }
            };

            if id == caller.spiffe_id {
                // Agent rotation: the record must carry the new serial
                // before the response leaves, or the next call would be
                // rejected by the authorizer.
                match self.ca.sign_x509_svid(csr, 0) {
                    Ok(svid) => {
                        self.datastore
                            .update_attested_node(&caller.spiffe_id, &svid.serial, svid.expires_at)
                            .await
                            .map_err(status_from_datastore)?;
                        tracing::info!(agent = %caller.spiffe_id, serial = %svid.serial, "Agent SVID rotated");
                        svids.insert(
                            id.to_string(),
                            X509Svid {
                                cert_chain: svid.cert_chain,
                                expires_at: svid.expires_at,
                            },
                        );
                    }
                    Err(e) => {
                        tracing::warn!(caller = %caller.spiffe_id, error = %e, "Skipping agent CSR that failed to sign");
                    }
                }
                continue;
            }

            let Some(entry) = entries.iter().find(|e| e.spiffe_id == id) else {
                tracing::warn!(spiffe_id = %id, caller = %caller.spiffe_id, "Skipping CSR for unauthorized SPIFFE ID");
                continue;
            };

            match self.ca.sign_x509_svid(csr, entry.ttl) {
                Ok(svid) => {
                    svids.insert(
                        id.to_string(),
                        X509Svid {
                            cert_chain: svid.cert_chain,
                            expires_at: svid.expires_at,
                        },
                    );
                }
                Err(e) => {
                    tracing::warn!(spiffe_id = %id, error = %e, "Skipping CSR that failed to sign");
                }
            }
        }

        let bundles = self
            .bundles
            .assemble(&entries)
            .await
            .map_err(status_from_datastore)?;
        Ok(build_svid_update(
            svids,
            &entries,
            &bundles,
            &self.trust_domain.id_string(),
        ))
    }
}

type ResponseStream<T> = Pin<Box<dyn Stream<Item = Result<T, Status>> + Send + 'static>>;

#[tonic::async_trait]
impl Node for NodeService {
    type AttestStream = ResponseStream<AttestResponse>;
    type FetchX509SvidStream = ResponseStream<FetchX509SvidResponse>;

    async fn attest(
        &self,
        request: Request<Streaming<AttestRequest>>,
    ) -> Result<Response<Self::AttestStream>, Status> {
        self.authorizer
            .authorize(METHOD_ATTEST, request.extensions())
            .await?;
        let mut inbound = request.into_inner();
        let this = self.clone();

        let output = async_stream::try_stream! {
            let started = Instant::now();
            let deadline = started + ATTEST_DEADLINE;
            let limiter = this.limits.new_stream();
            limiter
                .limit(MessageClass::Attest, 1)
                .map_err(|e| Status::resource_exhausted(e.to_string()))?;

            let first = recv_or_deadline(&mut inbound, deadline)
                .await?
                .ok_or_else(|| Status::invalid_argument("request expected"))?;

            let data = first
                .attestation_data
                .clone()
                .ok_or_else(|| Status::invalid_argument("request missing attestation data"))?;
            if data.r#type.is_empty() {
                deny(Status::invalid_argument("request missing attestation data type"))?;
            }

            let attestor = this.plugins.attestor(&data.r#type).ok_or_else(|| {
                Status::unimplemented(format!("could not find node attestor type {:?}", data.r#type))
            })?;

            let mut session = attestor
                .open(data.data)
                .await
                .map_err(|e| {
                    this.metrics.incr_counter("node_api.attest.rejected", 1);
                    status_from_attest(e)
                })?;

            // Challenge relay loop: forward each attestor challenge to the
            // agent and feed its answer back, until the attestor produces a
            // result or the deadline expires.
            let mut response: Option<Vec<u8>> = None;
            let result = loop {
                let step = tokio::time::timeout_at(deadline, session.step(response.take()))
                    .await
                    .map_err(|_| Status::deadline_exceeded("attestation deadline exceeded"))?
                    .map_err(status_from_attest)?;

                match step {
                    AttestorStep::Challenge(challenge) => {
                        yield AttestResponse {
                            step: Some(attest_response::Step::Challenge(challenge)),
                        };
                        let next = recv_or_deadline(&mut inbound, deadline)
                            .await?
                            .ok_or_else(|| {
                                Status::aborted("agent closed the stream mid-challenge")
                            })?;
                        response = Some(next.response);
                    }
                    AttestorStep::Result(result) => break result,
                }
            };

            if !result.valid {
                this.metrics.incr_counter("node_api.attest.rejected", 1);
                deny(Status::permission_denied("node attestation was rejected"))?;
            }
            let base_id = result.base_spiffe_id.clone();

            let existing = match this.datastore.fetch_attested_node(&base_id).await {
                Ok(node) => Some(node),
                Err(DataStoreError::NotFound) => None,
                Err(e) => Err(status_from_datastore(e))?,
            };
            if existing.is_some() && !attestor.can_reattest() {
                this.metrics.incr_counter("node_api.attest.rejected", 1);
                deny(Status::permission_denied(format!(
                    "node {base_id} has already attested"
                )))?;
            }

            // Selector attribution: attestor output unioned with the node
            // resolver registered for this attestation type, if any.
            let resolved = match this.plugins.resolver(&data.r#type) {
                Some(resolver) => resolver
                    .resolve(std::slice::from_ref(&base_id))
                    .await
                    .map_err(status_from_attest)?
                    .remove(&base_id)
                    .unwrap_or_default(),
                None => vec![],
            };
            let selectors = merge_selectors(result.selectors, resolved);
            this.datastore
                .set_node_selectors(&base_id, selectors.clone())
                .await
                .map_err(status_from_datastore)?;

            let mut svids = HashMap::new();
            if !first.csr.is_empty() {
                let svid = this.ca.sign_x509_svid(&first.csr, 0).map_err(status_from_ca)?;
                if svid.spiffe_id != base_id {
                    deny(Status::invalid_argument(format!(
                        "CSR SPIFFE ID {} does not match attested identity {base_id}",
                        svid.spiffe_id
                    )))?;
                }
                match &existing {
                    Some(_) => this
                        .datastore
                        .update_attested_node(&base_id, &svid.serial, svid.expires_at)
                        .await
                        .map_err(status_from_datastore)?,
                    None => this
                        .datastore
                        .create_attested_node(AttestedNode {
                            spiffe_id: base_id.clone(),
                            attestation_type: data.r#type.clone(),
                            cert_serial: svid.serial.clone(),
                            cert_not_after: svid.expires_at,
                        })
                        .await
                        .map_err(status_from_datastore)?,
                }
                svids.insert(
                    base_id.to_string(),
                    X509Svid {
                        cert_chain: svid.cert_chain,
                        expires_at: svid.expires_at,
                    },
                );
            } else if existing.is_none() {
                deny(Status::invalid_argument("request missing CSR"))?;
            }

            let entries = this
                .resolver
                .resolve(&base_id, &selectors)
                .await
                .map_err(status_from_datastore)?;
            let bundles = this
                .bundles
                .assemble(&entries)
                .await
                .map_err(status_from_datastore)?;

            this.metrics.incr_counter("node_api.attest.success", 1);
            this.metrics.timing("node_api.attest.duration", started.elapsed());
            tracing::info!(agent = %base_id, attestor = %data.r#type, "Node attested");

            yield AttestResponse {
                step: Some(attest_response::Step::SvidUpdate(build_svid_update(
                    svids,
                    &entries,
                    &bundles,
                    &this.trust_domain.id_string(),
                ))),
            };
        };

        Ok(Response::new(Box::pin(output)))
    }

    async fn fetch_x509_svid(
        &self,
        request: Request<Streaming<FetchX509SvidRequest>>,
    ) -> Result<Response<Self::FetchX509SvidStream>, Status> {
        let caller = self
            .authorizer
            .authorize(METHOD_FETCH_X509_SVID, request.extensions())
            .await?
            .ok_or_else(|| Status::internal("authorizer attached no caller identity"))?;
        let mut inbound = request.into_inner();
        let this = self.clone();

        let output = async_stream::try_stream! {
            let limiter = this.limits.new_stream();
            // Responses are emitted in request order: each request is fully
            // served before the next is read.
            while let Some(req) = inbound.message().await? {
                limiter
                    .limit(MessageClass::Csr, req.csrs.len() as u32)
                    .map_err(|e| Status::resource_exhausted(e.to_string()))?;

                let update = this.build_fetch_update(&caller, &req.csrs).await?;
                yield FetchX509SvidResponse {
                    svid_update: Some(update),
                };
            }
        };

        Ok(Response::new(Box::pin(output)))
    }

    async fn fetch_jwt_svid(
        &self,
        request: Request<FetchJwtSvidRequest>,
    ) -> Result<Response<FetchJwtSvidResponse>, Status> {
        let caller = self
            .authorizer
            .authorize(METHOD_FETCH_JWT_SVID, request.extensions())
            .await?
            .ok_or_else(|| Status::internal("authorizer attached no caller identity"))?;

        let jsr = request
            .into_inner()
            .jsr
            .ok_or_else(|| Status::invalid_argument("request missing JSR"))?;
        if jsr.spiffe_id.is_empty() {
            return Err(Status::invalid_argument("request missing SPIFFE ID"));
        }
        if jsr.audience.is_empty() {
            return Err(Status::invalid_argument("request missing audience"));
        }

        self.limits
            .new_stream()
            .limit(MessageClass::Jsr, 1)
            .map_err(|e| Status::resource_exhausted(e.to_string()))?;

        let target = SpiffeId::parse(&jsr.spiffe_id)
            .map_err(|e| Status::invalid_argument(format!("invalid SPIFFE ID: {e}")))?;

        let node_selectors = self
            .datastore
            .get_node_selectors(&caller.spiffe_id)
            .await
            .map_err(status_from_datastore)?;
        let entries = self
            .resolver
            .resolve(&caller.spiffe_id, &node_selectors)
            .await
            .map_err(status_from_datastore)?;

        let authorized =
            target == caller.spiffe_id || entries.iter().any(|e| e.spiffe_id == target);
        if !authorized {
            self.metrics.incr_counter("node_api.jwt.unauthorized", 1);
            return Err(Status::permission_denied(format!(
                "caller \"{}\" is not authorized for \"{}\"",
                caller.spiffe_id, target
            )));
        }

        let svid = self
            .ca
            .sign_jwt_svid(&target, &jsr.audience, jsr.ttl)
            .map_err(status_from_ca)?;

        Ok(Response::new(FetchJwtSvidResponse {
            svid: Some(JwtSvid {
                token: svid.token,
                issued_at: svid.issued_at,
                expires_at: svid.expires_at,
            }),
        }))
    }
}

/// Fail the surrounding stream with `status`. Shaped as a `Result` so the
/// generator's `?` carries the error into the response stream.
fn deny(status: Status) -> Result<(), Status> {
    Err(status)
}

/// Receive the next inbound message or fail the stream deadline.
async fn recv_or_deadline<T>(
    stream: &mut Streaming<T>,
    deadline: Instant,
) -> Result<Option<T>, Status> {
    tokio::time::timeout_at(deadline, stream.message())
        .await
        .map_err(|_| Status::deadline_exceeded("attestation deadline exceeded"))?
}

/// The SPIFFE ID a CSR asks for: its single URI SAN.
fn csr_spiffe_id(csr_der: &[u8]) -> Result<SpiffeId, Status> {
    let (_, csr) = X509CertificationRequest::from_der(csr_der)
        .map_err(|e| Status::invalid_argument(format!("failed to parse CSR: {e}")))?;

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

    match uris.as_slice() {
        [single] => SpiffeId::parse(single)
            .map_err(|e| Status::invalid_argument(format!("CSR SAN is not a SPIFFE ID: {e}"))),
        _ => Err(Status::invalid_argument(
            "CSR must carry exactly one URI SAN",
        )),
    }
}

/// Assemble the wire update. The deprecated flat bundle carries the own
/// domain roots concatenated, alongside the modern map.
fn build_svid_update(
    svids: HashMap<String, X509Svid>,
    entries: &[RegistrationEntry],
    bundles: &HashMap<String, Bundle>,
    own_trust_domain_id: &str,
) -> SvidUpdate {
    let deprecated_bundle = bundles
        .get(own_trust_domain_id)
        .map(|b| b.root_cas.concat())
        .unwrap_or_default();

    SvidUpdate {
        svids,
        registration_entries: entries.iter().map(entry_to_proto).collect(),
        bundles: bundles
            .iter()
            .map(|(td, bundle)| (td.clone(), bundle_to_proto(bundle)))
            .collect(),
        deprecated_bundle,
    }
}
