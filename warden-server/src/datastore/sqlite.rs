//! SQLite-backed data store.
//!
//! Wraps SQLite access via sqlx. Structured fields (selector sets, root CA
//! lists) are stored as JSON columns; single-use token consumption is a
//! single atomic statement so concurrent callers cannot double-spend.

use super::{DataStore, DataStoreError, EntryFilter, Result};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use uuid::Uuid;
use warden_core::{AttestedNode, Bundle, JoinToken, RegistrationEntry, Selector, SpiffeId};

/// Data store over a SQLite connection pool.
#[derive(Clone)]
pub struct SqliteDataStore {
    pool: SqlitePool,
}

impl SqliteDataStore {
    /// Open or create a database at the given path and ensure the schema.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DataStoreError::Database(sqlx::Error::Configuration(
                    format!("failed to create db directory: {e}").into(),
                ))
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            // WAL mode for better concurrent read performance
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1) // SQLite performs best with a single writer
            .connect_with(options)
            .await?;

        Self::with_pool(pool).await
    }

    /// Wrap an existing pool (tests use `sqlite::memory:`).
    pub async fn with_pool(pool: SqlitePool) -> Result<Self> {
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS registration_entries (
                entry_id TEXT PRIMARY KEY,
                parent_id TEXT NOT NULL,
                spiffe_id TEXT NOT NULL,
                selectors TEXT NOT NULL,
                ttl INTEGER NOT NULL,
                federates_with TEXT NOT NULL,
                admin INTEGER NOT NULL,
                downstream INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                dns_names TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bundles (
                trust_domain_id TEXT PRIMARY KEY,
                root_cas TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS attested_nodes (
                spiffe_id TEXT PRIMARY KEY,
                attestation_type TEXT NOT NULL,
                cert_serial TEXT NOT NULL,
                cert_not_after INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS node_selectors (
                spiffe_id TEXT PRIMARY KEY,
                selectors TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS join_tokens (
                token TEXT PRIMARY KEY,
                expires_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[cfg(test)]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Map an insert error, turning unique-key violations into AlreadyExists.
fn map_insert_err(e: sqlx::Error) -> DataStoreError {
    if let sqlx::Error::Database(ref db) = e {
        if db.is_unique_violation() {
            return DataStoreError::AlreadyExists;
        }
    }
    DataStoreError::Database(e)
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| DataStoreError::Malformed(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T> {
    serde_json::from_str(raw).map_err(|e| DataStoreError::Malformed(e.to_string()))
}

fn parse_entry_row(row: &sqlx::sqlite::SqliteRow) -> Result<RegistrationEntry> {
    let parent_id: String = row.try_get("parent_id")?;
    let spiffe_id: String = row.try_get("spiffe_id")?;
    let selectors: String = row.try_get("selectors")?;
    let federates_with: String = row.try_get("federates_with")?;
    let dns_names: String = row.try_get("dns_names")?;

    Ok(RegistrationEntry {
        entry_id: row.try_get("entry_id")?,
        parent_id: SpiffeId::parse(&parent_id)
            .map_err(|e| DataStoreError::Malformed(e.to_string()))?,
        spiffe_id: SpiffeId::parse(&spiffe_id)
            .map_err(|e| DataStoreError::Malformed(e.to_string()))?,
        selectors: from_json(&selectors)?,
        ttl: row.try_get::<i64, _>("ttl")? as i32,
        federates_with: from_json(&federates_with)?,
        admin: row.try_get::<i64, _>("admin")? != 0,
        downstream: row.try_get::<i64, _>("downstream")? != 0,
        expires_at: row.try_get("expires_at")?,
        dns_names: from_json(&dns_names)?,
    })
}

#[async_trait]
impl DataStore for SqliteDataStore {
    // -- Registration entries ------------------------------------------------

    async fn create_entry(&self, mut entry: RegistrationEntry) -> Result<RegistrationEntry> {
        if entry.entry_id.is_empty() {
            entry.entry_id = Uuid::new_v4().to_string();
        }

        sqlx::query(
            r#"
            INSERT INTO registration_entries (
                entry_id, parent_id, spiffe_id, selectors, ttl,
                federates_with, admin, downstream, expires_at, dns_names
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
        )
        .bind(&entry.entry_id)
        .bind(entry.parent_id.to_string())
        .bind(entry.spiffe_id.to_string())
        .bind(to_json(&entry.selectors)?)
        .bind(entry.ttl as i64)
        .bind(to_json(&entry.federates_with)?)
        .bind(entry.admin as i64)
        .bind(entry.downstream as i64)
        .bind(entry.expires_at)
        .bind(to_json(&entry.dns_names)?)
        .execute(&self.pool)
        .await
        .map_err(map_insert_err)?;

        Ok(entry)
    }

    async fn fetch_entry(&self, entry_id: &str) -> Result<RegistrationEntry> {
        let row = sqlx::query("SELECT * FROM registration_entries WHERE entry_id = ?")
            .bind(entry_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(DataStoreError::NotFound)?;
        parse_entry_row(&row)
    }

    async fn update_entry(&self, entry: RegistrationEntry) -> Result<RegistrationEntry> {
        let result = sqlx::query(
            r#"
            UPDATE registration_entries SET
                parent_id = ?2, spiffe_id = ?3, selectors = ?4, ttl = ?5,
                federates_with = ?6, admin = ?7, downstream = ?8,
                expires_at = ?9, dns_names = ?10
            WHERE entry_id = ?1
            "#,
        )
        .bind(&entry.entry_id)
        .bind(entry.parent_id.to_string())
        .bind(entry.spiffe_id.to_string())
        .bind(to_json(&entry.selectors)?)
        .bind(entry.ttl as i64)
        .bind(to_json(&entry.federates_with)?)
        .bind(entry.admin as i64)
        .bind(entry.downstream as i64)
        .bind(entry.expires_at)
        .bind(to_json(&entry.dns_names)?)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DataStoreError::NotFound);
        }
        Ok(entry)
    }

    async fn delete_entry(&self, entry_id: &str) -> Result<RegistrationEntry> {
        let entry = self.fetch_entry(entry_id).await?;
        let result = sqlx::query("DELETE FROM registration_entries WHERE entry_id = ?")
            .bind(entry_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DataStoreError::NotFound);
        }
        Ok(entry)
    }

    async fn list_entries(&self, filter: &EntryFilter) -> Result<Vec<RegistrationEntry>> {
        // Equality predicates are pushed into SQL; selector matching needs
        // set semantics over the JSON column, so it is applied after fetch.
        let rows = match (&filter.by_parent_id, &filter.by_spiffe_id) {
            (Some(parent), Some(spiffe)) => {
                sqlx::query(
                    "SELECT * FROM registration_entries WHERE parent_id = ? AND spiffe_id = ?",
                )
                .bind(parent.to_string())
                .bind(spiffe.to_string())
                .fetch_all(&self.pool)
                .await?
            }
            (Some(parent), None) => {
                sqlx::query("SELECT * FROM registration_entries WHERE parent_id = ?")
                    .bind(parent.to_string())
                    .fetch_all(&self.pool)
                    .await?
            }
            (None, Some(spiffe)) => {
                sqlx::query("SELECT * FROM registration_entries WHERE spiffe_id = ?")
                    .bind(spiffe.to_string())
                    .fetch_all(&self.pool)
                    .await?
            }
            (None, None) => {
                sqlx::query("SELECT * FROM registration_entries")
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        let mut entries = Vec::with_capacity(rows.len());
        for row in &rows {
            match parse_entry_row(row) {
                Ok(entry) => entries.push(entry),
                // A row that no longer parses cannot be returned; surface it
                // in the log and keep listing.
                Err(e) => tracing::warn!(error = %e, "Skipping malformed registration entry"),
            }
        }

        if let Some((selectors, mode)) = &filter.by_selectors {
            entries.retain(|e| mode.matches(&e.selectors, selectors));
        }

        Ok(entries)
    }

    // -- Bundles -------------------------------------------------------------

    async fn create_bundle(&self, bundle: Bundle) -> Result<()> {
        sqlx::query("INSERT INTO bundles (trust_domain_id, root_cas) VALUES (?, ?)")
            .bind(&bundle.trust_domain_id)
            .bind(to_json(&bundle.root_cas)?)
            .execute(&self.pool)
            .await
            .map_err(map_insert_err)?;
        Ok(())
    }

    async fn fetch_bundle(&self, trust_domain_id: &str) -> Result<Bundle> {
        let row = sqlx::query("SELECT root_cas FROM bundles WHERE trust_domain_id = ?")
            .bind(trust_domain_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(DataStoreError::NotFound)?;
        let raw: String = row.try_get("root_cas")?;
        Ok(Bundle::new(trust_domain_id, from_json(&raw)?))
    }

    async fn update_bundle(&self, bundle: Bundle) -> Result<()> {
        let result = sqlx::query("UPDATE bundles SET root_cas = ?2 WHERE trust_domain_id = ?1")
            .bind(&bundle.trust_domain_id)
            .bind(to_json(&bundle.root_cas)?)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DataStoreError::NotFound);
        }
        Ok(())
    }

    async fn append_bundle(&self, bundle: Bundle) -> Result<()> {
        match self.fetch_bundle(&bundle.trust_domain_id).await {
            Ok(mut existing) => {
                existing.append(&bundle.root_cas);
                self.update_bundle(existing).await
            }
            Err(DataStoreError::NotFound) => self.create_bundle(bundle).await,
            Err(e) => Err(e),
        }
    }

    async fn delete_bundle(&self, trust_domain_id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM bundles WHERE trust_domain_id = ?")
            .bind(trust_domain_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DataStoreError::NotFound);
        }
        Ok(())
    }

    async fn list_bundles(&self) -> Result<Vec<Bundle>> {
        let rows = sqlx::query("SELECT trust_domain_id, root_cas FROM bundles")
            .fetch_all(&self.pool)
            .await?;
        let mut bundles = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.try_get("trust_domain_id")?;
            let raw: String = row.try_get("root_cas")?;
            bundles.push(Bundle::new(id, from_json(&raw)?));
        }
        Ok(bundles)
    }

    // -- Attested nodes ------------------------------------------------------

    async fn create_attested_node(&self, node: AttestedNode) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO attested_nodes (spiffe_id, attestation_type, cert_serial, cert_not_after)
            VALUES (?1, ?2, ?3, ?4)
            "#,
        )
        .bind(node.spiffe_id.to_string())
        .bind(&node.attestation_type)
        .bind(&node.cert_serial)
        .bind(node.cert_not_after)
        .execute(&self.pool)
        .await
        .map_err(map_insert_err)?;
        Ok(())
    }

    async fn fetch_attested_node(&self, spiffe_id: &SpiffeId) -> Result<AttestedNode> {
        let row = sqlx::query(
            "SELECT attestation_type, cert_serial, cert_not_after FROM attested_nodes WHERE spiffe_id = ?",
        )
        .bind(spiffe_id.to_string())
        .fetch_optional(&self.pool)
        .await?
        .ok_or(DataStoreError::NotFound)?;

        Ok(AttestedNode {
            spiffe_id: spiffe_id.clone(),
            attestation_type: row.try_get("attestation_type")?,
            cert_serial: row.try_get("cert_serial")?,
            cert_not_after: row.try_get("cert_not_after")?,
        })
    }

    async fn update_attested_node(
        &self,
        spiffe_id: &SpiffeId,
        cert_serial: &str,
        cert_not_after: i64,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE attested_nodes SET cert_serial = ?2, cert_not_after = ?3 WHERE spiffe_id = ?1",
        )
        .bind(spiffe_id.to_string())
        .bind(cert_serial)
        .bind(cert_not_after)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(DataStoreError::NotFound);
        }
        Ok(())
    }

    async fn delete_attested_node(&self, spiffe_id: &SpiffeId) -> Result<()> {
        let result = sqlx::query("DELETE FROM attested_nodes WHERE spiffe_id = ?")
            .bind(spiffe_id.to_string())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DataStoreError::NotFound);
        }
        Ok(())
    }

    // -- Node selectors ------------------------------------------------------

    async fn set_node_selectors(
        &self,
        spiffe_id: &SpiffeId,
        selectors: Vec<Selector>,
    ) -> Result<()> {
        sqlx::query("INSERT OR REPLACE INTO node_selectors (spiffe_id, selectors) VALUES (?, ?)")
            .bind(spiffe_id.to_string())
            .bind(to_json(&selectors)?)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_node_selectors(&self, spiffe_id: &SpiffeId) -> Result<Vec<Selector>> {
        let row = sqlx::query("SELECT selectors FROM node_selectors WHERE spiffe_id = ?")
            .bind(spiffe_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let raw: String = row.try_get("selectors")?;
                from_json(&raw)
            }
            None => Ok(vec![]),
        }
    }

    // -- Join tokens ---------------------------------------------------------

    async fn create_join_token(&self, token: JoinToken) -> Result<()> {
        sqlx::query("INSERT INTO join_tokens (token, expires_at) VALUES (?, ?)")
            .bind(&token.token)
            .bind(token.expires_at)
            .execute(&self.pool)
            .await
            .map_err(map_insert_err)?;
        Ok(())
    }

    async fn fetch_join_token(&self, token: &str) -> Result<JoinToken> {
        let row = sqlx::query("SELECT expires_at FROM join_tokens WHERE token = ?")
            .bind(token)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(DataStoreError::NotFound)?;
        Ok(JoinToken {
            token: token.to_string(),
            expires_at: row.try_get("expires_at")?,
        })
    }

    async fn delete_join_token(&self, token: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM join_tokens WHERE token = ?")
            .bind(token)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DataStoreError::NotFound);
        }
        Ok(())
    }

    async fn consume_join_token(&self, token: &str) -> Result<JoinToken> {
        let fetched = self.fetch_join_token(token).await?;
        // The DELETE is the single atomic consume; a concurrent caller that
        // loses the race observes zero affected rows.
        let result = sqlx::query("DELETE FROM join_tokens WHERE token = ?")
            .bind(token)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DataStoreError::NotFound);
        }
        Ok(fetched)
    }
}
