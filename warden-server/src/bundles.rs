//! Bundle assembler.
//!
//! Builds the trust-bundle map returned with every SVID update: the server's
//! own bundle plus the federated bundle of every trust domain named by the
//! entry set's `federates_with` references.

use crate::datastore::{DataStore, DataStoreError};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use warden_core::{Bundle, RegistrationEntry, TrustDomain};

#[derive(Clone)]
pub struct BundleAssembler {
    datastore: Arc<dyn DataStore>,
    trust_domain: TrustDomain,
}

impl BundleAssembler {
    pub fn new(datastore: Arc<dyn DataStore>, trust_domain: TrustDomain) -> Self {
        Self {
            datastore,
            trust_domain,
        }
    }

    /// `{own_trust_domain: own_bundle} ∪ {td: bundle}` for each federated
    /// trust domain referenced by `entries`.
    ///
    /// The own bundle is always present. A federated bundle the operator has
    /// not installed yet is omitted silently, keeping the response correct
    /// across bundle-publication races.
    pub async fn assemble(
        &self,
        entries: &[RegistrationEntry],
    ) -> Result<HashMap<String, Bundle>, DataStoreError> {
        let own_id = self.trust_domain.id_string();
        let mut bundles = HashMap::new();

        let own = self.datastore.fetch_bundle(&own_id).await?;
        bundles.insert(own_id.clone(), own);

        let federated: BTreeSet<String> = entries
            .iter()
            .flat_map(|e| e.federates_with.iter().map(|td| td.to_string()))
            .filter(|td| *td != own_id)
            .collect();

        for td in federated {
            match self.datastore.fetch_bundle(&td).await {
                Ok(bundle) => {
                    bundles.insert(td, bundle);
                }
                Err(DataStoreError::NotFound) => {
                    tracing::debug!(trust_domain = %td, "Federated bundle not installed, omitting");
                }
                Err(e) => return Err(e),
            }
        }

        Ok(bundles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::SqliteDataStore;
    use sqlx::SqlitePool;
    use warden_core::{Selector, SpiffeId};

    async fn test_store() -> Arc<dyn DataStore> {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        Arc::new(SqliteDataStore::with_pool(pool).await.unwrap())
    }

    fn entry_federating_with(tds: &[&str]) -> RegistrationEntry {
        RegistrationEntry {
            entry_id: "e".into(),
            parent_id: SpiffeId::parse("spiffe://example.org/agent").unwrap(),
            spiffe_id: SpiffeId::parse("spiffe://example.org/web").unwrap(),
            selectors: vec![Selector::new("t", "v")],
            ttl: 0,
            federates_with: tds.iter().map(|td| SpiffeId::parse(td).unwrap()).collect(),
            admin: false,
            downstream: false,
            expires_at: 0,
            dns_names: vec![],
        }
    }

    #[tokio::test]
    async fn own_bundle_always_present() {
        let store = test_store().await;
        store
            .create_bundle(Bundle::new("spiffe://example.org", vec![vec![1]]))
            .await
            .unwrap();

        let assembler =
            BundleAssembler::new(store, TrustDomain::new("example.org").unwrap());
        let bundles = assembler.assemble(&[]).await.unwrap();
        assert_eq!(bundles.len(), 1);
        assert_eq!(bundles["spiffe://example.org"].root_cas, vec![vec![1]]);
    }

    #[tokio::test]
    async fn federated_bundles_joined_missing_omitted() {
        let store = test_store().await;
        store
            .create_bundle(Bundle::new("spiffe://example.org", vec![vec![1]]))
            .await
            .unwrap();
        store
            .create_bundle(Bundle::new("spiffe://peer.org", vec![vec![2]]))
            .await
            .unwrap();

        let assembler =
            BundleAssembler::new(store, TrustDomain::new("example.org").unwrap());
        let entries = vec![entry_federating_with(&[
            "spiffe://peer.org",
            "spiffe://not-installed.org",
        ])];
        let bundles = assembler.assemble(&entries).await.unwrap();

        assert_eq!(bundles.len(), 2);
        assert!(bundles.contains_key("spiffe://example.org"));
        assert_eq!(bundles["spiffe://peer.org"].root_cas, vec![vec![2]]);
        assert!(!bundles.contains_key("spiffe://not-installed.org"));
    }
}
