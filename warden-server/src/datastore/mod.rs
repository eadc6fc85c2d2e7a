//! Data store facade.
//!
//! The sole mutator of persisted state. Every other component holds the
//! store as an injected `Arc<dyn DataStore>`; the default implementation is
//! SQLite via sqlx ([`sqlite::SqliteDataStore`]).

mod sqlite;

pub use sqlite::SqliteDataStore;

use async_trait::async_trait;
use warden_core::{AttestedNode, Bundle, JoinToken, RegistrationEntry, Selector, SelectorMatch, SpiffeId};

/// Errors surfaced by store operations.
///
/// `NotFound` and `AlreadyExists` are part of each operation's contract;
/// `Database` wraps transient driver failures and maps to `Unavailable` at
/// the RPC edge; `Malformed` marks a stored row that no longer parses.
#[derive(Debug, thiserror::Error)]
pub enum DataStoreError {
    #[error("record not found")]
    NotFound,
    #[error("record already exists")]
    AlreadyExists,
    #[error("malformed record: {0}")]
    Malformed(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type Result<T> = std::result::Result<T, DataStoreError>;

/// Filter predicates for entry list operations. All present predicates must
/// match; an empty filter lists everything.
#[derive(Debug, Clone, Default)]
pub struct EntryFilter {
    pub by_parent_id: Option<SpiffeId>,
    pub by_spiffe_id: Option<SpiffeId>,
    pub by_selectors: Option<(Vec<Selector>, SelectorMatch)>,
}

impl EntryFilter {
    pub fn by_parent_id(parent_id: SpiffeId) -> Self {
        Self {
            by_parent_id: Some(parent_id),
            ..Self::default()
        }
    }

    pub fn by_spiffe_id(spiffe_id: SpiffeId) -> Self {
        Self {
            by_spiffe_id: Some(spiffe_id),
            ..Self::default()
        }
    }

    pub fn by_selectors(selectors: Vec<Selector>, mode: SelectorMatch) -> Self {
        Self {
            by_selectors: Some((selectors, mode)),
            ..Self::default()
        }
    }
}

/// Transactional CRUD over bundles, registration entries, attested nodes,
/// node-selector sets and join tokens.
///
/// `create_*` fails with [`DataStoreError::AlreadyExists`] on a unique-key
/// collision; `fetch_*`/`update_*`/`delete_*` fail with
/// [`DataStoreError::NotFound`] when the key is absent.
#[async_trait]
pub trait DataStore: Send + Sync {
    // -- Registration entries ------------------------------------------------

    /// Persist a new entry, assigning its `entry_id`. Returns the stored
    /// entry.
    async fn create_entry(&self, entry: RegistrationEntry) -> Result<RegistrationEntry>;
    async fn fetch_entry(&self, entry_id: &str) -> Result<RegistrationEntry>;
    /// Replace the entry with `entry.entry_id`, returning the stored form.
    async fn update_entry(&self, entry: RegistrationEntry) -> Result<RegistrationEntry>;
    /// Remove and return the entry.
    async fn delete_entry(&self, entry_id: &str) -> Result<RegistrationEntry>;
    async fn list_entries(&self, filter: &EntryFilter) -> Result<Vec<RegistrationEntry>>;

    // -- Bundles -------------------------------------------------------------

    async fn create_bundle(&self, bundle: Bundle) -> Result<()>;
    async fn fetch_bundle(&self, trust_domain_id: &str) -> Result<Bundle>;
    async fn update_bundle(&self, bundle: Bundle) -> Result<()>;
    /// Create the bundle or merge new roots into the existing one. Used by
    /// the CA keystore on every rotation.
    async fn append_bundle(&self, bundle: Bundle) -> Result<()>;
    async fn delete_bundle(&self, trust_domain_id: &str) -> Result<()>;
    async fn list_bundles(&self) -> Result<Vec<Bundle>>;

    // -- Attested nodes ------------------------------------------------------

    async fn create_attested_node(&self, node: AttestedNode) -> Result<()>;
    async fn fetch_attested_node(&self, spiffe_id: &SpiffeId) -> Result<AttestedNode>;
    /// Rewrite the serial and expiry carried by an existing record.
    async fn update_attested_node(
        &self,
        spiffe_id: &SpiffeId,
        cert_serial: &str,
        cert_not_after: i64,
    ) -> Result<()>;
    async fn delete_attested_node(&self, spiffe_id: &SpiffeId) -> Result<()>;

    // -- Node selectors ------------------------------------------------------

    /// Atomically replace the selector set attributed to an agent.
    async fn set_node_selectors(&self, spiffe_id: &SpiffeId, selectors: Vec<Selector>)
        -> Result<()>;
    /// The selector set attributed to an agent; empty when none recorded.
    async fn get_node_selectors(&self, spiffe_id: &SpiffeId) -> Result<Vec<Selector>>;

    // -- Join tokens ---------------------------------------------------------

    async fn create_join_token(&self, token: JoinToken) -> Result<()>;
    async fn fetch_join_token(&self, token: &str) -> Result<JoinToken>;
    async fn delete_join_token(&self, token: &str) -> Result<()>;
    /// Atomically fetch and remove a token. `NotFound` when absent or when a
    /// concurrent caller consumed it first.
    async fn consume_join_token(&self, token: &str) -> Result<JoinToken>;
}
