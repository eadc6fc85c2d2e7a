//! Entry resolver.
//!
//! Given a caller identity and the node selectors attributed to it, computes
//! the transitive set of registration entries the caller is authorized to
//! receive. The correctness of this closure determines who can impersonate
//! whom, so the expansion is bounded by a visited set and the output order
//! is deterministic.

use crate::datastore::{DataStore, DataStoreError, EntryFilter};
use chrono::Utc;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use warden_core::entry::sort_and_dedup;
use warden_core::{selector, RegistrationEntry, Selector, SelectorMatch, SpiffeId};

/// Computes registration-entry closures over the data store.
#[derive(Clone)]
pub struct EntryResolver {
    datastore: Arc<dyn DataStore>,
}

impl EntryResolver {
    pub fn new(datastore: Arc<dyn DataStore>) -> Self {
        Self { datastore }
    }

    /// The de-duplicated, `(spiffe_id, entry_id)`-ordered set of entries the
    /// caller may receive.
    ///
    /// The frontier is seeded with entries parented on the caller and with
    /// entries whose selector set is a subset of the caller's node
    /// selectors, then expanded along parent edges
    /// (`child.parent_id == frontier.spiffe_id`) to a fixed point.
    pub async fn resolve(
        &self,
        caller: &SpiffeId,
        node_selectors: &[Selector],
    ) -> Result<Vec<RegistrationEntry>, DataStoreError> {
        let now = Utc::now().timestamp();
        let mut visited: HashSet<String> = HashSet::new();
        let mut frontier: VecDeque<RegistrationEntry> = VecDeque::new();
        let mut closure: Vec<RegistrationEntry> = Vec::new();

        let parented = self
            .datastore
            .list_entries(&EntryFilter::by_parent_id(caller.clone()))
            .await?;

        // Entries selected directly onto the node. An entry with no
        // selectors never matches here: the empty set is a subset of every
        // node's selectors and would leak the identity to all agents.
        let selected = self
            .datastore
            .list_entries(&EntryFilter::by_selectors(
                node_selectors.to_vec(),
                SelectorMatch::Subset,
            ))
            .await?
            .into_iter()
            .filter(|e| !e.selectors.is_empty());

        for entry in parented.into_iter().chain(selected) {
            if Self::admit(&entry, now) && visited.insert(entry.entry_id.clone()) {
                frontier.push_back(entry);
            }
        }

        while let Some(entry) = frontier.pop_front() {
            let children = self
                .datastore
                .list_entries(&EntryFilter::by_parent_id(entry.spiffe_id.clone()))
                .await?;
            closure.push(entry);

            for child in children {
                if Self::admit(&child, now) && visited.insert(child.entry_id.clone()) {
                    frontier.push_back(child);
                }
            }
        }

        sort_and_dedup(&mut closure);
        Ok(closure)
    }

    /// Whether an entry may appear in any closure: structurally valid and
    /// not expired. Invalid entries cannot be returned because the resolver
    /// does not know whether they are authorized.
    fn admit(entry: &RegistrationEntry, now: i64) -> bool {
        if let Err(e) = entry.validate() {
            tracing::warn!(entry_id = %entry.entry_id, error = %e, "Skipping malformed registration entry");
            return false;
        }
        if entry.expires_at != 0 && entry.expires_at < now {
            tracing::debug!(entry_id = %entry.entry_id, "Skipping expired registration entry");
            return false;
        }
        true
    }
}

/// Union of attestor-returned and resolver-returned selectors, normalized.
pub fn merge_selectors(mut attested: Vec<Selector>, resolved: Vec<Selector>) -> Vec<Selector> {
    attested.extend(resolved);
    selector::normalize(&mut attested);
    attested
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::SqliteDataStore;
    use sqlx::SqlitePool;

    async fn test_store() -> Arc<dyn DataStore> {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        Arc::new(SqliteDataStore::with_pool(pool).await.unwrap())
    }

    fn entry(parent: &str, spiffe: &str, selectors: Vec<Selector>) -> RegistrationEntry {
        RegistrationEntry {
            entry_id: String::new(),
            parent_id: SpiffeId::parse(parent).unwrap(),
            spiffe_id: SpiffeId::parse(spiffe).unwrap(),
            selectors,
            ttl: 0,
            federates_with: vec![],
            admin: false,
            downstream: false,
            expires_at: 0,
            dns_names: vec![],
        }
    }

    const AGENT: &str = "spiffe://example.org/spire/agent/join_token/token";

    #[tokio::test]
    async fn closure_follows_parent_chain_and_selectors() {
        let store = test_store().await;
        let resolver = EntryResolver::new(store.clone());

        // E1 parented on the agent, E2 parented on E1's identity, E3
        // selected directly onto the node.
        let e1 = store
            .create_entry(entry(AGENT, "spiffe://example.org/a", vec![]))
            .await
            .unwrap();
        let e2 = store
            .create_entry(entry(
                "spiffe://example.org/a",
                "spiffe://example.org/b",
                vec![],
            ))
            .await
            .unwrap();
        let e3 = store
            .create_entry(entry(
                "spiffe://example.org/other-parent",
                "spiffe://example.org/c",
                vec![Selector::new("t", "v")],
            ))
            .await
            .unwrap();
        // Unrelated entry: different parent, selectors not on the node.
        store
            .create_entry(entry(
                "spiffe://example.org/elsewhere",
                "spiffe://example.org/d",
                vec![Selector::new("t", "other")],
            ))
            .await
            .unwrap();

        let caller = SpiffeId::parse(AGENT).unwrap();
        let result = resolver
            .resolve(&caller, &[Selector::new("t", "v")])
            .await
            .unwrap();

        let ids: Vec<&str> = result.iter().map(|e| e.entry_id.as_str()).collect();
        // Output is sorted by (spiffe_id, entry_id): .../a, .../b, .../c.
        assert_eq!(
            ids,
            vec![
                e1.entry_id.as_str(),
                e2.entry_id.as_str(),
                e3.entry_id.as_str()
            ]
        );
        let spiffe_ids: Vec<String> = result.iter().map(|e| e.spiffe_id.to_string()).collect();
        assert_eq!(
            spiffe_ids,
            vec![
                "spiffe://example.org/a",
                "spiffe://example.org/b",
                "spiffe://example.org/c"
            ]
        );
    }

    #[tokio::test]
    async fn cycles_terminate() {
        let store = test_store().await;
        let resolver = EntryResolver::new(store.clone());

        store
            .create_entry(entry(AGENT, "spiffe://example.org/a", vec![]))
            .await
            .unwrap();
        // a -> b -> a
        store
            .create_entry(entry(
                "spiffe://example.org/a",
                "spiffe://example.org/b",
                vec![],
            ))
            .await
            .unwrap();
        store
            .create_entry(entry(
                "spiffe://example.org/b",
                "spiffe://example.org/a",
                vec![],
            ))
            .await
            .unwrap();

        let caller = SpiffeId::parse(AGENT).unwrap();
        let result = resolver.resolve(&caller, &[]).await.unwrap();
        assert_eq!(result.len(), 3);
    }

    #[tokio::test]
    async fn empty_selector_entries_are_not_selected_onto_nodes() {
        let store = test_store().await;
        let resolver = EntryResolver::new(store.clone());

        store
            .create_entry(entry(
                "spiffe://example.org/unrelated",
                "spiffe://example.org/floating",
                vec![],
            ))
            .await
            .unwrap();

        let caller = SpiffeId::parse(AGENT).unwrap();
        let result = resolver
            .resolve(&caller, &[Selector::new("t", "v")])
            .await
            .unwrap();
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn expired_entries_are_skipped() {
        let store = test_store().await;
        let resolver = EntryResolver::new(store.clone());

        let mut expired = entry(AGENT, "spiffe://example.org/old", vec![]);
        expired.expires_at = Utc::now().timestamp() - 60;
        store.create_entry(expired).await.unwrap();

        let caller = SpiffeId::parse(AGENT).unwrap();
        let result = resolver.resolve(&caller, &[]).await.unwrap();
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn resolving_twice_is_stable() {
        let store = test_store().await;
        let resolver = EntryResolver::new(store.clone());

        store
            .create_entry(entry(AGENT, "spiffe://example.org/a", vec![]))
            .await
            .unwrap();
        store
            .create_entry(entry(
                "spiffe://example.org/a",
                "spiffe://example.org/b",
                vec![],
            ))
            .await
            .unwrap();

        let caller = SpiffeId::parse(AGENT).unwrap();
        let first = resolver.resolve(&caller, &[]).await.unwrap();
        let second = resolver.resolve(&caller, &[]).await.unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn merge_selectors_unions_and_dedups() {
        let merged = merge_selectors(
            vec![Selector::new("a", "1"), Selector::new("b", "2")],
            vec![Selector::new("b", "2"), Selector::new("c", "3")],
        );
        assert_eq!(
            merged,
            vec![
                Selector::new("a", "1"),
                Selector::new("b", "2"),
                Selector::new("c", "3")
            ]
        );
    }
}
