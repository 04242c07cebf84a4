//! SQLite delta store
//!
//! One row per delta, keyed `(company_id, seq)`; the body column is the
//! JSON wire form. Cursor assignment happens inside the append transaction
//! so concurrent pushes to the same company serialize on the database.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use uuid::Uuid;

use common::keyring::KeyringBundle;
use common::record::Epoch;
use common::sync::{Cursor, EncryptedDelta, GrantWindow};

use super::{DeltaStore, DeltaStoreError, RawPage};

#[derive(Debug, Clone)]
pub struct SqliteDeltaStore {
    pool: SqlitePool,
}

impl SqliteDeltaStore {
    /// Open (or create) a relay database at the given path
    pub async fn new(path: &Path) -> Result<Self, DeltaStoreError<sqlx::Error>> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DeltaStoreError::Codec(format!("create {:?}: {}", parent, e)))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// An in-memory database, handy in tests
    pub async fn in_memory() -> Result<Self, DeltaStoreError<sqlx::Error>> {
        let options = SqliteConnectOptions::new().filename(":memory:");
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), DeltaStoreError<sqlx::Error>> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| DeltaStoreError::Codec(format!("migration failed: {}", e)))?;
        Ok(())
    }
}

fn decode_delta(body: &str) -> Result<EncryptedDelta, DeltaStoreError<sqlx::Error>> {
    serde_json::from_str(body).map_err(|e| DeltaStoreError::Codec(e.to_string()))
}

#[async_trait]
impl DeltaStore for SqliteDeltaStore {
    type Error = sqlx::Error;

    async fn append(
        &self,
        company_id: Uuid,
        deltas: Vec<EncryptedDelta>,
    ) -> Result<Cursor, DeltaStoreError<Self::Error>> {
        let company = company_id.to_string();
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT COALESCE(MAX(seq), 0) AS seq FROM deltas WHERE company_id = ?")
            .bind(&company)
            .fetch_one(&mut *tx)
            .await?;
        let mut seq: i64 = row.try_get("seq")?;

        for delta in &deltas {
            seq += 1;
            let body =
                serde_json::to_string(delta).map_err(|e| DeltaStoreError::Codec(e.to_string()))?;
            sqlx::query(
                r#"
                INSERT INTO deltas (company_id, seq, kind, key_epoch, body)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(&company)
            .bind(seq)
            .bind(delta.kind.as_str())
            .bind(delta.key_epoch.0 as i64)
            .bind(body)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(Cursor(seq as u64))
    }

    async fn page(
        &self,
        company_id: Uuid,
        after: Option<Cursor>,
        limit: usize,
    ) -> Result<RawPage, DeltaStoreError<Self::Error>> {
        let company = company_id.to_string();
        let after = after.unwrap_or_default().0 as i64;

        // Fetch one extra row to learn whether the stream continues
        let rows = sqlx::query(
            r#"
            SELECT seq, body FROM deltas
            WHERE company_id = ? AND seq > ?
            ORDER BY seq
            LIMIT ?
            "#,
        )
        .bind(&company)
        .bind(after)
        .bind(limit as i64 + 1)
        .fetch_all(&self.pool)
        .await?;

        let more = rows.len() > limit;
        let mut entries = Vec::with_capacity(rows.len().min(limit));
        for row in rows.into_iter().take(limit) {
            let seq: i64 = row.try_get("seq")?;
            let body: String = row.try_get("body")?;
            entries.push((Cursor(seq as u64), decode_delta(&body)?));
        }
        Ok(RawPage { entries, more })
    }

    async fn delta_count(
        &self,
        company_id: Uuid,
    ) -> Result<u64, DeltaStoreError<Self::Error>> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM deltas WHERE company_id = ?")
            .bind(company_id.to_string())
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n as u64)
    }

    async fn window(
        &self,
        company_id: Uuid,
        principal: &str,
    ) -> Result<Option<GrantWindow>, DeltaStoreError<Self::Error>> {
        let row = sqlx::query(
            r#"
            SELECT from_epoch, revoked FROM grant_windows
            WHERE company_id = ? AND principal = ?
            "#,
        )
        .bind(company_id.to_string())
        .bind(principal)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            None => Ok(None),
            Some(row) => {
                let from_epoch: i64 = row.try_get("from_epoch")?;
                let revoked: bool = row.try_get("revoked")?;
                Ok(Some(GrantWindow {
                    from_epoch: Epoch(from_epoch as u64),
                    revoked,
                }))
            }
        }
    }

    async fn put_window(
        &self,
        company_id: Uuid,
        principal: &str,
        window: GrantWindow,
    ) -> Result<(), DeltaStoreError<Self::Error>> {
        sqlx::query(
            r#"
            INSERT INTO grant_windows (company_id, principal, from_epoch, revoked, updated_at)
            VALUES (?, ?, ?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(company_id, principal) DO UPDATE SET
                from_epoch = excluded.from_epoch,
                revoked = excluded.revoked,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(company_id.to_string())
        .bind(principal)
        .bind(window.from_epoch.0 as i64)
        .bind(window.revoked)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn windows(
        &self,
        company_id: Uuid,
    ) -> Result<BTreeMap<String, GrantWindow>, DeltaStoreError<Self::Error>> {
        let rows = sqlx::query(
            "SELECT principal, from_epoch, revoked FROM grant_windows WHERE company_id = ?",
        )
        .bind(company_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        let mut windows = BTreeMap::new();
        for row in rows {
            let principal: String = row.try_get("principal")?;
            let from_epoch: i64 = row.try_get("from_epoch")?;
            let revoked: bool = row.try_get("revoked")?;
            windows.insert(
                principal,
                GrantWindow {
                    from_epoch: Epoch(from_epoch as u64),
                    revoked,
                },
            );
        }
        Ok(windows)
    }

    async fn put_keyring(
        &self,
        company_id: Uuid,
        bundle: KeyringBundle,
    ) -> Result<(), DeltaStoreError<Self::Error>> {
        let body =
            serde_json::to_string(&bundle).map_err(|e| DeltaStoreError::Codec(e.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO keyrings (company_id, bundle, updated_at)
            VALUES (?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(company_id) DO UPDATE SET
                bundle = excluded.bundle,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(company_id.to_string())
        .bind(body)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_keyring(
        &self,
        company_id: Uuid,
    ) -> Result<Option<KeyringBundle>, DeltaStoreError<Self::Error>> {
        let row = sqlx::query("SELECT bundle FROM keyrings WHERE company_id = ?")
            .bind(company_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            None => Ok(None),
            Some(row) => {
                let body: String = row.try_get("bundle")?;
                serde_json::from_str(&body)
                    .map(Some)
                    .map_err(|e| DeltaStoreError::Codec(e.to_string()))
            }
        }
    }

    async fn ready(&self) -> Result<(), DeltaStoreError<Self::Error>> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
