//! Test harness for node and registration API tests.
//!
//! Uses tonic's pattern of passing the server directly to the client (no
//! network): the gRPC client is constructed over the in-process service
//! stack, with an in-memory SQLite store behind it.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use warden_core::{JoinToken, RegistrationEntry, Selector, SpiffeId, TrustDomain};
use warden_proto::node::v1::node_client::NodeClient;
use warden_proto::node::v1::node_server::NodeServer;
use warden_proto::registration::v1::registration_client::RegistrationClient;
use warden_proto::registration::v1::registration_server::RegistrationServer;
use warden_server::attest::{
    AttestError, AttestationResult, AttestorSession, AttestorStep, JoinTokenAttestor,
    NodeAttestor, PluginRegistry,
};
use warden_server::ca::CaKeystore;
use warden_server::datastore::{DataStore, SqliteDataStore};
use warden_server::limits::{MessageClass, RateLimited, RateLimits, StreamLimiter};
use warden_server::metrics::NoopMetrics;
use warden_server::services::{
    AgentCaller, NodeAuthorizer, NodeService, RegistrationService, METHOD_ATTEST,
};

pub type TestNodeClient = NodeClient<NodeServer<NodeService>>;
pub type TestRegistrationClient = RegistrationClient<RegistrationServer<RegistrationService>>;

/// In-process server fixture: in-memory store plus a bootstrapped CA.
pub struct TestServer {
    pub trust_domain: TrustDomain,
    pub datastore: Arc<dyn DataStore>,
    pub ca: Arc<CaKeystore>,
}

impl TestServer {
    pub async fn new() -> Self {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:")
            .await
            .expect("failed to create in-memory database");
        let datastore: Arc<dyn DataStore> = Arc::new(
            SqliteDataStore::with_pool(pool)
                .await
                .expect("failed to initialize store"),
        );

        let trust_domain = TrustDomain::new("example.org").unwrap();
        let ca = Arc::new(
            CaKeystore::open(trust_domain.clone(), datastore.clone(), None)
                .await
                .expect("failed to open keystore"),
        );
        ca.bootstrap_self_signed().await.expect("failed to bootstrap CA");

        Self {
            trust_domain,
            datastore,
            ca,
        }
    }

    /// A node client over the in-process service stack.
    pub fn node_client(
        &self,
        authorizer: Arc<dyn NodeAuthorizer>,
        limits: Arc<dyn RateLimits>,
        extra_attestors: Vec<Arc<dyn NodeAttestor>>,
    ) -> TestNodeClient {
        let mut plugins = PluginRegistry::new();
        plugins.register_attestor(Arc::new(JoinTokenAttestor::new(
            self.datastore.clone(),
            self.trust_domain.clone(),
        )));
        for attestor in extra_attestors {
            plugins.register_attestor(attestor);
        }

        let service = NodeService::new(
            self.trust_domain.clone(),
            self.datastore.clone(),
            self.ca.clone(),
            limits,
            Arc::new(plugins),
            authorizer,
            Arc::new(NoopMetrics),
        );
        NodeClient::new(NodeServer::new(service))
    }

    /// A registration client over the in-process service stack. No TLS
    /// extension is attached, so the caller is implicitly admin.
    pub fn registration_client(&self) -> TestRegistrationClient {
        let service = RegistrationService::new(self.trust_domain.clone(), self.datastore.clone());
        RegistrationClient::new(RegistrationServer::new(service))
    }

    pub async fn preload_token(&self, token: &str, ttl: i64) {
        self.datastore
            .create_join_token(JoinToken::with_token(token, ttl))
            .await
            .expect("failed to preload token");
    }

    pub async fn create_entry(&self, entry: RegistrationEntry) -> RegistrationEntry {
        self.datastore
            .create_entry(entry)
            .await
            .expect("failed to create entry")
    }
}

/// Build a CSR for `uri` with a fresh key, as an agent would.
pub fn csr_for(uri: &str) -> Vec<u8> {
    let key = rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).unwrap();
    let mut params = rcgen::CertificateParams::new(vec![]).unwrap();
    params.subject_alt_names = vec![rcgen::SanType::URI(
        rcgen::string::Ia5String::try_from(uri.to_string()).unwrap(),
    )];
    params.serialize_request(&key).unwrap().der().to_vec()
}

/// A domain entry with sensible defaults.
pub fn entry(parent: &str, spiffe: &str, selectors: Vec<Selector>) -> RegistrationEntry {
    RegistrationEntry {
        entry_id: String::new(),
        parent_id: SpiffeId::parse(parent).unwrap(),
        spiffe_id: SpiffeId::parse(spiffe).unwrap(),
        selectors,
        ttl: 1800,
        federates_with: vec![],
        admin: false,
        downstream: false,
        expires_at: 0,
        dns_names: vec![],
    }
}

// ============================================================================
// Fakes
// ============================================================================

/// Authorizer returning a fixed caller for every `Fetch*` method.
pub struct FixedCallerAuthorizer {
    pub caller: AgentCaller,
}

impl FixedCallerAuthorizer {
    pub fn new(spiffe_id: &str, serial: &str) -> Arc<Self> {
        Arc::new(Self {
            caller: AgentCaller {
                spiffe_id: SpiffeId::parse(spiffe_id).unwrap(),
                serial: serial.to_string(),
            },
        })
    }
}

#[async_trait]
impl NodeAuthorizer for FixedCallerAuthorizer {
    async fn authorize(
        &self,
        method: &str,
        _extensions: &tonic::Extensions,
    ) -> Result<Option<AgentCaller>, tonic::Status> {
        if method == METHOD_ATTEST {
            Ok(None)
        } else {
            Ok(Some(self.caller.clone()))
        }
    }
}

/// Pass-through authorizer for attest-only tests.
pub struct PermissiveAuthorizer;

#[async_trait]
impl NodeAuthorizer for PermissiveAuthorizer {
    async fn authorize(
        &self,
        _method: &str,
        _extensions: &tonic::Extensions,
    ) -> Result<Option<AgentCaller>, tonic::Status> {
        Ok(None)
    }
}

/// Counting rate limiter: records every `limit` call and optionally fails a
/// chosen class.
#[derive(Default)]
pub struct CountingLimits {
    pub calls: Arc<Mutex<Vec<(MessageClass, u32)>>>,
    pub fail_class: Option<MessageClass>,
}

impl CountingLimits {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing(class: MessageClass) -> Arc<Self> {
        Arc::new(Self {
            calls: Arc::default(),
            fail_class: Some(class),
        })
    }

    pub fn recorded(&self) -> Vec<(MessageClass, u32)> {
        self.calls.lock().unwrap().clone()
    }
}

impl RateLimits for CountingLimits {
    fn new_stream(&self) -> Box<dyn StreamLimiter> {
        Box::new(CountingStreamLimiter {
            calls: self.calls.clone(),
            fail_class: self.fail_class,
        })
    }
}

struct CountingStreamLimiter {
    calls: Arc<Mutex<Vec<(MessageClass, u32)>>>,
    fail_class: Option<MessageClass>,
}

impl StreamLimiter for CountingStreamLimiter {
    fn limit(&self, class: MessageClass, count: u32) -> Result<(), RateLimited> {
        self.calls.lock().unwrap().push((class, count));
        if self.fail_class == Some(class) {
            Err(RateLimited { class })
        } else {
            Ok(())
        }
    }
}

/// Scripted attestor: emits a fixed challenge sequence, checks the agent's
/// answers, then emits the configured result.
pub struct ScriptedAttestor {
    attestor_type: String,
    challenges: Vec<(Vec<u8>, Vec<u8>)>,
    result: AttestationResult,
    reattest: bool,
}

impl ScriptedAttestor {
    pub fn new(
        attestor_type: &str,
        challenges: &[(&str, &str)],
        base_spiffe_id: &str,
        selectors: Vec<Selector>,
        reattest: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            attestor_type: attestor_type.to_string(),
            challenges: challenges
                .iter()
                .map(|(c, r)| (c.as_bytes().to_vec(), r.as_bytes().to_vec()))
                .collect(),
            result: AttestationResult {
                base_spiffe_id: SpiffeId::parse(base_spiffe_id).unwrap(),
                selectors,
                valid: true,
            },
            reattest,
        })
    }
}

#[async_trait]
impl NodeAttestor for ScriptedAttestor {
    fn attestor_type(&self) -> &str {
        &self.attestor_type
    }

    fn can_reattest(&self) -> bool {
        self.reattest
    }

    async fn open(&self, _payload: Vec<u8>) -> Result<Box<dyn AttestorSession>, AttestError> {
        Ok(Box::new(ScriptedSession {
            script: self.challenges.clone().into(),
            expected: None,
            result: Some(self.result.clone()),
        }))
    }
}

struct ScriptedSession {
    script: VecDeque<(Vec<u8>, Vec<u8>)>,
    expected: Option<Vec<u8>>,
    result: Option<AttestationResult>,
}

#[async_trait]
impl AttestorSession for ScriptedSession {
    async fn step(&mut self, response: Option<Vec<u8>>) -> Result<AttestorStep, AttestError> {
        if let Some(expected) = self.expected.take() {
            if response.unwrap_or_default() != expected {
                let mut result = self.result.take().ok_or(AttestError::Incomplete)?;
                result.valid = false;
                return Ok(AttestorStep::Result(result));
            }
        }

        match self.script.pop_front() {
            Some((challenge, expected)) => {
                self.expected = Some(expected);
                Ok(AttestorStep::Challenge(challenge))
            }
            None => {
                let result = self.result.take().ok_or(AttestError::Incomplete)?;
                Ok(AttestorStep::Result(result))
            }
        }
    }
}

/// Attestor whose session closes without ever emitting a result.
pub struct BrokenAttestor;

#[async_trait]
impl NodeAttestor for BrokenAttestor {
    fn attestor_type(&self) -> &str {
        "broken"
    }

    fn can_reattest(&self) -> bool {
        true
    }

    async fn open(&self, _payload: Vec<u8>) -> Result<Box<dyn AttestorSession>, AttestError> {
        Ok(Box::new(BrokenSession))
    }
}

struct BrokenSession;

#[async_trait]
impl AttestorSession for BrokenSession {
    async fn step(&mut self, _response: Option<Vec<u8>>) -> Result<AttestorStep, AttestError> {
        Err(AttestError::Incomplete)
    }
}

/// Sender-driven request stream for interactive bidi calls: the test holds
/// the sender and pushes requests as responses arrive.
pub struct RequestPipe<T> {
    tx: tokio::sync::mpsc::Sender<T>,
}

impl<T: Send + 'static> RequestPipe<T> {
    pub fn new() -> (Self, tokio_stream::wrappers::ReceiverStream<T>) {
        let (tx, rx) = tokio::sync::mpsc::channel(8);
        (Self { tx }, tokio_stream::wrappers::ReceiverStream::new(rx))
    }

    pub async fn send(&self, item: T) {
        self.tx.send(item).await.expect("server hung up");
    }
}

/// Guard against tests dead-locking on a stream that never ends.
pub async fn within<T, F: std::future::Future<Output = T>>(fut: F) -> T {
    tokio::time::timeout(std::time::Duration::from_secs(10), fut)
        .await
        .expect("test timed out")
}
