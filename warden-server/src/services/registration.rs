//! Registration gRPC service implementation.
//!
//! Admin surface owning registration entries, federated bundles and join
//! tokens. Callers on the local listener are implicitly admin; callers
//! presenting an SVID must match a registration entry with `admin == true`.

use super::status_from_datastore;
use crate::convert::{bundle_to_proto, entry_from_proto, entry_to_proto, selector_from_proto};
use crate::datastore::{DataStore, DataStoreError, EntryFilter};
use crate::tls::{svid_from_cert, TlsConnectInfo};
use std::sync::Arc;
use tonic::{Request, Response, Status};
use warden_core::entry::sort_and_dedup;
use warden_core::{JoinToken, RegistrationEntry, SelectorMatch, SpiffeId, TrustDomain};
use warden_proto::registration::v1::{
    registration_server::Registration, FederatedBundleId, FederatedBundles, JoinToken as JoinTokenMsg,
    ParentId, RegistrationEntryId, SpiffeId as SpiffeIdMsg,
};
use warden_proto::types::v1::{
    Bundle as BundleMsg, Empty, RegistrationEntries, RegistrationEntry as RegistrationEntryMsg,
    Selector as SelectorMsg,
};

pub struct RegistrationService {
    trust_domain: TrustDomain,
    datastore: Arc<dyn DataStore>,
}

impl RegistrationService {
    pub fn new(trust_domain: TrustDomain, datastore: Arc<dyn DataStore>) -> Self {
        Self {
            trust_domain,
            datastore,
        }
    }

    /// Authorize the caller: implicit admin on the local transport (no TLS
    /// peer), otherwise the presented SVID must match an admin entry.
    async fn require_admin<T>(&self, request: &Request<T>) -> Result<(), Status> {
        let Some(info) = request.extensions().get::<TlsConnectInfo>() else {
            return Ok(());
        };
        let Some(cert_der) = &info.peer_cert_der else {
            return Ok(());
        };

        let svid = svid_from_cert(cert_der)
            .map_err(|e| Status::permission_denied(format!("invalid caller SVID: {e}")))?;
        let entries = self
            .datastore
            .list_entries(&EntryFilter::by_spiffe_id(svid.spiffe_id.clone()))
            .await
            .map_err(status_from_datastore)?;

        if entries.iter().any(|e| e.admin) {
            Ok(())
        } else {
            Err(Status::permission_denied(format!(
                "caller {} is not authorized for the registration API",
                svid.spiffe_id
            )))
        }
    }

    /// Shared validation for create and update.
    fn validate_entry(&self, entry: &RegistrationEntry) -> Result<(), Status> {
        entry
            .validate()
            .map_err(|e| Status::invalid_argument(e.to_string()))?;
        for federated in &entry.federates_with {
            if federated.trust_domain() == &self.trust_domain {
                return Err(Status::invalid_argument(
                    "entry cannot federate with the server trust domain",
                ));
            }
        }
        Ok(())
    }

    /// A federated-bundle trust-domain ID: valid, path-free, and never the
    /// server's own domain.
    fn validate_federated_id(&self, trust_domain_id: &str) -> Result<String, Status> {
        let id = SpiffeId::parse(trust_domain_id)
            .map_err(|e| Status::invalid_argument(format!("invalid trust-domain ID: {e}")))?;
        if !id.is_trust_domain_id() {
            return Err(Status::invalid_argument(
                "federated trust-domain ID must not have a path",
            ));
        }
        if id.trust_domain() == &self.trust_domain {
            return Err(Status::invalid_argument(
                "federated bundle id cannot match server trust domain",
            ));
        }
        Ok(id.to_string())
    }

    async fn list_with_filter(&self, filter: EntryFilter) -> Result<RegistrationEntries, Status> {
        let mut entries = self
            .datastore
            .list_entries(&filter)
            .await
            .map_err(status_from_datastore)?;
        sort_and_dedup(&mut entries);
        Ok(RegistrationEntries {
            entries: entries.iter().map(entry_to_proto).collect(),
        })
    }
}

#[tonic::async_trait]
impl Registration for RegistrationService {
    async fn create_entry(
        &self,
        request: Request<RegistrationEntryMsg>,
    ) -> Result<Response<RegistrationEntryId>, Status> {
        self.require_admin(&request).await?;
        let mut entry = entry_from_proto(request.into_inner())?;
        entry.entry_id = String::new();
        self.validate_entry(&entry)?;

        // Same spiffe_id + parent_id + selector set is a duplicate.
        let siblings = self
            .datastore
            .list_entries(&EntryFilter {
                by_parent_id: Some(entry.parent_id.clone()),
                by_spiffe_id: Some(entry.spiffe_id.clone()),
                by_selectors: None,
            })
            .await
            .map_err(status_from_datastore)?;
        if siblings.iter().any(|e| e.same_identity(&entry)) {
            return Err(Status::already_exists("entry already exists"));
        }

        let created = self
            .datastore
            .create_entry(entry)
            .await
            .map_err(status_from_datastore)?;
        tracing::info!(entry_id = %created.entry_id, spiffe_id = %created.spiffe_id, "Registration entry created");

        Ok(Response::new(RegistrationEntryId {
            id: created.entry_id,
        }))
    }

    async fn fetch_entry(
        &self,
        request: Request<RegistrationEntryId>,
    ) -> Result<Response<RegistrationEntryMsg>, Status> {
        self.require_admin(&request).await?;
        let entry = self
            .datastore
            .fetch_entry(&request.into_inner().id)
            .await
            .map_err(status_from_datastore)?;
        Ok(Response::new(entry_to_proto(&entry)))
    }

    async fn update_entry(
        &self,
        request: Request<RegistrationEntryMsg>,
    ) -> Result<Response<RegistrationEntryMsg>, Status> {
        self.require_admin(&request).await?;
        let entry = entry_from_proto(request.into_inner())?;
        if entry.entry_id.is_empty() {
            return Err(Status::invalid_argument("entry ID is required"));
        }
        self.validate_entry(&entry)?;

        let updated = self
            .datastore
            .update_entry(entry)
            .await
            .map_err(status_from_datastore)?;
        Ok(Response::new(entry_to_proto(&updated)))
    }

    async fn delete_entry(
        &self,
        request: Request<RegistrationEntryId>,
    ) -> Result<Response<RegistrationEntryMsg>, Status> {
        self.require_admin(&request).await?;
        let deleted = self
            .datastore
            .delete_entry(&request.into_inner().id)
            .await
            .map_err(status_from_datastore)?;
        tracing::info!(entry_id = %deleted.entry_id, "Registration entry deleted");
        Ok(Response::new(entry_to_proto(&deleted)))
    }

    async fn list_by_parent_id(
        &self,
        request: Request<ParentId>,
    ) -> Result<Response<RegistrationEntries>, Status> {
        self.require_admin(&request).await?;
        let parent = SpiffeId::parse(&request.into_inner().id)
            .map_err(|e| Status::invalid_argument(format!("invalid parent ID: {e}")))?;
        let entries = self.list_with_filter(EntryFilter::by_parent_id(parent)).await?;
        Ok(Response::new(entries))
    }

    async fn list_by_spiffe_id(
        &self,
        request: Request<SpiffeIdMsg>,
    ) -> Result<Response<RegistrationEntries>, Status> {
        self.require_admin(&request).await?;
        let spiffe_id = SpiffeId::parse(&request.into_inner().id)
            .map_err(|e| Status::invalid_argument(format!("invalid SPIFFE ID: {e}")))?;
        let entries = self
            .list_with_filter(EntryFilter::by_spiffe_id(spiffe_id))
            .await?;
        Ok(Response::new(entries))
    }

    async fn list_by_selector(
        &self,
        request: Request<SelectorMsg>,
    ) -> Result<Response<RegistrationEntries>, Status> {
        self.require_admin(&request).await?;
        let selector = selector_from_proto(request.into_inner());
        // Entries whose selector set contains the queried selector.
        let entries = self
            .list_with_filter(EntryFilter::by_selectors(
                vec![selector],
                SelectorMatch::Superset,
            ))
            .await?;
        Ok(Response::new(entries))
    }

    async fn create_federated_bundle(
        &self,
        request: Request<BundleMsg>,
    ) -> Result<Response<Empty>, Status> {
        self.require_admin(&request).await?;
        let bundle = request.into_inner();
        let td = self.validate_federated_id(&bundle.trust_domain_id)?;

        self.datastore
            .create_bundle(warden_core::Bundle::new(td.clone(), bundle.root_cas))
            .await
            .map_err(status_from_datastore)?;
        tracing::info!(trust_domain = %td, "Federated bundle created");
        Ok(Response::new(Empty {}))
    }

    async fn fetch_federated_bundle(
        &self,
        request: Request<FederatedBundleId>,
    ) -> Result<Response<BundleMsg>, Status> {
        self.require_admin(&request).await?;
        let td = self.validate_federated_id(&request.into_inner().trust_domain_id)?;
        let bundle = self
            .datastore
            .fetch_bundle(&td)
            .await
            .map_err(status_from_datastore)?;
        Ok(Response::new(bundle_to_proto(&bundle)))
    }

    async fn update_federated_bundle(
        &self,
        request: Request<BundleMsg>,
    ) -> Result<Response<Empty>, Status> {
        self.require_admin(&request).await?;
        let bundle = request.into_inner();
        let td = self.validate_federated_id(&bundle.trust_domain_id)?;

        self.datastore
            .update_bundle(warden_core::Bundle::new(td, bundle.root_cas))
            .await
            .map_err(status_from_datastore)?;
        Ok(Response::new(Empty {}))
    }

    async fn delete_federated_bundle(
        &self,
        request: Request<FederatedBundleId>,
    ) -> Result<Response<Empty>, Status> {
        self.require_admin(&request).await?;
        let td = self.validate_federated_id(&request.into_inner().trust_domain_id)?;
        self.datastore
            .delete_bundle(&td)
            .await
            .map_err(status_from_datastore)?;
        tracing::info!(trust_domain = %td, "Federated bundle deleted");
        Ok(Response::new(Empty {}))
    }

    async fn list_federated_bundles(
        &self,
        request: Request<Empty>,
    ) -> Result<Response<FederatedBundles>, Status> {
        self.require_admin(&request).await?;
        let own_id = self.trust_domain.id_string();
        let bundles = self
            .datastore
            .list_bundles()
            .await
            .map_err(status_from_datastore)?;

        Ok(Response::new(FederatedBundles {
            bundles: bundles
                .iter()
                .filter(|b| b.trust_domain_id != own_id)
                .map(bundle_to_proto)
                .collect(),
        }))
    }

    async fn create_join_token(
        &self,
        request: Request<JoinTokenMsg>,
    ) -> Result<Response<JoinTokenMsg>, Status> {
        self.require_admin(&request).await?;
        let req = request.into_inner();
        if req.ttl <= 0 {
            return Err(Status::invalid_argument("ttl must be positive"));
        }

        let token = if req.token.is_empty() {
            JoinToken::generate(req.ttl as i64)
        } else {
            JoinToken::with_token(req.token, req.ttl as i64)
        };

        self.datastore
            .create_join_token(token.clone())
            .await
            .map_err(status_from_datastore)?;
        tracing::info!(expires_at = token.expires_at, "Join token created");

        Ok(Response::new(JoinTokenMsg {
            token: token.token,
            ttl: req.ttl,
            expires_at: token.expires_at,
        }))
    }

    async fn fetch_bundle(&self, request: Request<Empty>) -> Result<Response<BundleMsg>, Status> {
        self.require_admin(&request).await?;
        let bundle = self
            .datastore
            .fetch_bundle(&self.trust_domain.id_string())
            .await
            .map_err(|e| match e {
                DataStoreError::NotFound => Status::not_found("bundle not found"),
                e => status_from_datastore(e),
            })?;
        Ok(Response::new(bundle_to_proto(&bundle)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::SqliteDataStore;
    use rcgen::{CertificateParams, KeyPair, SanType};
    use sqlx::SqlitePool;
    use warden_core::Selector;

    async fn service() -> (RegistrationService, Arc<dyn DataStore>) {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let store: Arc<dyn DataStore> = Arc::new(SqliteDataStore::with_pool(pool).await.unwrap());
        (
            RegistrationService::new(TrustDomain::new("example.org").unwrap(), store.clone()),
            store,
        )
    }

    fn entry_msg(parent: &str, spiffe: &str, selectors: &[(&str, &str)]) -> RegistrationEntryMsg {
        RegistrationEntryMsg {
            entry_id: String::new(),
            parent_id: parent.into(),
            spiffe_id: spiffe.into(),
            selectors: selectors
                .iter()
                .map(|(t, v)| SelectorMsg {
                    r#type: t.to_string(),
                    value: v.to_string(),
                })
                .collect(),
            ttl: 1800,
            federates_with: vec![],
            admin: false,
            downstream: false,
            expires_at: 0,
            dns_names: vec![],
        }
    }

    const AGENT: &str = "spiffe://example.org/spire/agent/join_token/token";

    #[tokio::test]
    async fn create_then_fetch_returns_same_entry() {
        let (svc, _) = service().await;
        let msg = entry_msg(AGENT, "spiffe://example.org/web", &[("unix", "uid:0")]);

        let id = svc
            .create_entry(Request::new(msg.clone()))
            .await
            .unwrap()
            .into_inner()
            .id;
        assert!(!id.is_empty());

        let fetched = svc
            .fetch_entry(Request::new(RegistrationEntryId { id: id.clone() }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(fetched.entry_id, id);
        assert_eq!(fetched.parent_id, msg.parent_id);
        assert_eq!(fetched.spiffe_id, msg.spiffe_id);
        assert_eq!(fetched.selectors, msg.selectors);
        assert_eq!(fetched.ttl, msg.ttl);
    }

    #[tokio::test]
    async fn duplicate_entry_is_rejected() {
        let (svc, _) = service().await;
        let msg = entry_msg(AGENT, "spiffe://example.org/web", &[("unix", "uid:0")]);

        svc.create_entry(Request::new(msg.clone())).await.unwrap();
        let err = svc.create_entry(Request::new(msg)).await.unwrap_err();
        assert_eq!(err.code(), tonic::Code::AlreadyExists);
    }

    #[tokio::test]
    async fn entry_federating_with_own_domain_is_rejected() {
        let (svc, _) = service().await;
        let mut msg = entry_msg(AGENT, "spiffe://example.org/web", &[]);
        msg.federates_with = vec!["spiffe://example.org".into()];

        let err = svc.create_entry(Request::new(msg)).await.unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn update_fetch_is_a_fixed_point() {
        let (svc, _) = service().await;
        let id = svc
            .create_entry(Request::new(entry_msg(AGENT, "spiffe://example.org/web", &[])))
            .await
            .unwrap()
            .into_inner()
            .id;

        let mut updated = entry_msg(AGENT, "spiffe://example.org/web", &[]);
        updated.entry_id = id.clone();
        updated.ttl = 60;

        let after_update = svc
            .update_entry(Request::new(updated))
            .await
            .unwrap()
            .into_inner();
        let fetched = svc
            .fetch_entry(Request::new(RegistrationEntryId { id }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(after_update, fetched);
        assert_eq!(fetched.ttl, 60);
    }

    #[tokio::test]
    async fn delete_returns_entry_and_removes_it() {
        let (svc, _) = service().await;
        let id = svc
            .create_entry(Request::new(entry_msg(AGENT, "spiffe://example.org/web", &[])))
            .await
            .unwrap()
            .into_inner()
            .id;

        let deleted = svc
            .delete_entry(Request::new(RegistrationEntryId { id: id.clone() }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(deleted.entry_id, id);

        let err = svc
            .fetch_entry(Request::new(RegistrationEntryId { id }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::NotFound);
    }

    #[tokio::test]
    async fn listings_filter_and_sort() {
        let (svc, _) = service().await;
        svc.create_entry(Request::new(entry_msg(
            AGENT,
            "spiffe://example.org/b",
            &[("t", "v")],
        )))
        .await
        .unwrap();
        svc.create_entry(Request::new(entry_msg(AGENT, "spiffe://example.org/a", &[])))
            .await
            .unwrap();
        svc.create_entry(Request::new(entry_msg(
            "spiffe://example.org/other",
            "spiffe://example.org/c",
            &[("t", "v"), ("u", "w")],
        )))
        .await
        .unwrap();

        let by_parent = svc
            .list_by_parent_id(Request::new(ParentId { id: AGENT.into() }))
            .await
            .unwrap()
            .into_inner();
        let ids: Vec<&str> = by_parent.entries.iter().map(|e| e.spiffe_id.as_str()).collect();
        assert_eq!(ids, vec!["spiffe://example.org/a", "spiffe://example.org/b"]);

        let by_spiffe = svc
            .list_by_spiffe_id(Request::new(SpiffeIdMsg {
                id: "spiffe://example.org/c".into(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(by_spiffe.entries.len(), 1);

        let by_selector = svc
            .list_by_selector(Request::new(SelectorMsg {
                r#type: "t".into(),
                value: "v".into(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(by_selector.entries.len(), 2);
    }

    #[tokio::test]
    async fn federated_bundle_rejects_server_trust_domain() {
        let (svc, _) = service().await;
        let err = svc
            .create_federated_bundle(Request::new(BundleMsg {
                trust_domain_id: "spiffe://example.org".into(),
                root_cas: vec![vec![1]],
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
        assert_eq!(
            err.message(),
            "federated bundle id cannot match server trust domain"
        );
    }

    #[tokio::test]
    async fn federated_bundle_rejects_path_ids() {
        let (svc, _) = service().await;
        let err = svc
            .create_federated_bundle(Request::new(BundleMsg {
                trust_domain_id: "spiffe://peer.org/path".into(),
                root_cas: vec![],
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn federated_bundle_crud_and_listing() {
        let (svc, store) = service().await;
        svc.create_federated_bundle(Request::new(BundleMsg {
            trust_domain_id: "spiffe://peer.org".into(),
            root_cas: vec![vec![1]],
        }))
        .await
        .unwrap();

        // The server's own bundle never shows up in the federated list.
        store
            .append_bundle(warden_core::Bundle::new("spiffe://example.org", vec![vec![9]]))
            .await
            .unwrap();

        let err = svc
            .create_federated_bundle(Request::new(BundleMsg {
                trust_domain_id: "spiffe://peer.org".into(),
                root_cas: vec![],
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::AlreadyExists);

        svc.update_federated_bundle(Request::new(BundleMsg {
            trust_domain_id: "spiffe://peer.org".into(),
            root_cas: vec![vec![2]],
        }))
        .await
        .unwrap();

        let fetched = svc
            .fetch_federated_bundle(Request::new(FederatedBundleId {
                trust_domain_id: "spiffe://peer.org".into(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(fetched.root_cas, vec![vec![2]]);

        let listed = svc
            .list_federated_bundles(Request::new(Empty {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(listed.bundles.len(), 1);
        assert_eq!(listed.bundles[0].trust_domain_id, "spiffe://peer.org");

        svc.delete_federated_bundle(Request::new(FederatedBundleId {
            trust_domain_id: "spiffe://peer.org".into(),
        }))
        .await
        .unwrap();
        let err = svc
            .fetch_federated_bundle(Request::new(FederatedBundleId {
                trust_domain_id: "spiffe://peer.org".into(),
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::NotFound);
    }

    #[tokio::test]
    async fn join_token_requires_positive_ttl() {
        let (svc, _) = service().await;
        for ttl in [0, -5] {
            let err = svc
                .create_join_token(Request::new(JoinTokenMsg {
                    token: String::new(),
                    ttl,
                    expires_at: 0,
                }))
                .await
                .unwrap_err();
            assert_eq!(err.code(), tonic::Code::InvalidArgument);
        }
    }

    #[tokio::test]
    async fn join_token_generates_value_when_empty() {
        let (svc, store) = service().await;
        let created = svc
            .create_join_token(Request::new(JoinTokenMsg {
                token: String::new(),
                ttl: 60,
                expires_at: 0,
            }))
            .await
            .unwrap()
            .into_inner();

        assert!(!created.token.is_empty());
        assert!(created.expires_at > 0);
        store.fetch_join_token(&created.token).await.unwrap();
    }

    #[tokio::test]
    async fn fetch_bundle_is_not_found_before_ca_load() {
        let (svc, store) = service().await;
        let err = svc.fetch_bundle(Request::new(Empty {})).await.unwrap_err();
        assert_eq!(err.code(), tonic::Code::NotFound);

        store
            .append_bundle(warden_core::Bundle::new("spiffe://example.org", vec![vec![7]]))
            .await
            .unwrap();
        let bundle = svc
            .fetch_bundle(Request::new(Empty {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(bundle.root_cas, vec![vec![7]]);
    }

    fn cert_with_uri(uri: &str) -> Vec<u8> {
        let key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).unwrap();
        let mut params = CertificateParams::new(vec![]).unwrap();
        params.subject_alt_names = vec![SanType::URI(
            rcgen::string::Ia5String::try_from(uri.to_string()).unwrap(),
        )];
        params.self_signed(&key).unwrap().der().to_vec()
    }

    fn request_with_cert<T>(msg: T, cert_der: Vec<u8>) -> Request<T> {
        let mut request = Request::new(msg);
        request
            .extensions_mut()
            .insert(TlsConnectInfo::new(None, Some(cert_der)));
        request
    }

    #[tokio::test]
    async fn non_admin_svid_is_denied() {
        let (svc, _) = service().await;
        let request = request_with_cert(
            entry_msg(AGENT, "spiffe://example.org/web", &[]),
            cert_with_uri("spiffe://example.org/not-admin"),
        );
        let err = svc.create_entry(request).await.unwrap_err();
        assert_eq!(err.code(), tonic::Code::PermissionDenied);
    }

    #[tokio::test]
    async fn admin_svid_is_allowed() {
        let (svc, store) = service().await;

        // An entry grants spiffe://example.org/admin the admin flag.
        let mut admin_entry = crate::convert::entry_from_proto(entry_msg(
            AGENT,
            "spiffe://example.org/admin",
            &[("unix", "uid:0")],
        ))
        .unwrap();
        admin_entry.admin = true;
        store.create_entry(admin_entry).await.unwrap();

        let request = request_with_cert(
            entry_msg(AGENT, "spiffe://example.org/web", &[]),
            cert_with_uri("spiffe://example.org/admin"),
        );
        svc.create_entry(request).await.unwrap();
    }
}
