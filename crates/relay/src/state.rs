//! Relay policy layer
//!
//! Everything the relay decides, it decides from plaintext: a company's
//! first push bootstraps it, after that only principals with an active
//! grant window may push; data deltas are served only inside the caller's
//! window; ledger deltas always flow so a revoked principal can still
//! observe its own revocation. Grant windows are replayed from the
//! plaintext index fields of access-ledger deltas as they arrive.

use std::fmt::{Debug, Display};

use uuid::Uuid;

use common::crypto::PublicKey;
use common::keyring::KeyringBundle;
use common::record::{EntityKind, Epoch, IndexValue};
use common::sync::{Cursor, DeltaPage, EncryptedDelta, GrantWindow};

use crate::store::{DeltaStore, DeltaStoreError};

#[derive(thiserror::Error, Debug)]
pub enum RelayStateError<T: Display + Debug> {
    #[error(transparent)]
    Store(#[from] DeltaStoreError<T>),
    #[error("principal {0} is not granted on company {1}")]
    NotGranted(PublicKey, Uuid),
}

/// Shared state behind the HTTP handlers: one store, all companies
#[derive(Debug, Clone)]
pub struct RelayState<S: DeltaStore> {
    store: S,
}

impl<S: DeltaStore> RelayState<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Append a batch to a company's stream
    ///
    /// The first push to a company bootstraps it; afterwards the caller
    /// needs an active grant window. Ledger deltas in the batch update the
    /// windows before anything later in the stream is served.
    pub async fn push(
        &self,
        principal: PublicKey,
        company_id: Uuid,
        deltas: Vec<EncryptedDelta>,
    ) -> Result<Cursor, RelayStateError<S::Error>> {
        if self.store.delta_count(company_id).await? > 0 {
            match self.store.window(company_id, &principal.to_hex()).await? {
                Some(window) if !window.revoked => {}
                _ => return Err(RelayStateError::NotGranted(principal, company_id)),
            }
        }

        for delta in &deltas {
            if delta.kind == EntityKind::AccessEntry {
                self.observe_ledger_delta(company_id, delta).await?;
            }
        }

        let cursor = self.store.append(company_id, deltas).await?;
        tracing::debug!(company = %company_id, %cursor, "accepted push");
        Ok(cursor)
    }

    /// Deltas after the cursor that the caller may see
    pub async fn pull(
        &self,
        principal: PublicKey,
        company_id: Uuid,
        after: Option<Cursor>,
        limit: usize,
    ) -> Result<DeltaPage, RelayStateError<S::Error>> {
        let window = self.store.window(company_id, &principal.to_hex()).await?;
        let page = self.store.page(company_id, after, limit).await?;

        let mut next = after.unwrap_or_default();
        let mut deltas = Vec::new();
        for (cursor, delta) in page.entries {
            if visible(window, &delta) {
                deltas.push(delta);
            }
            next = cursor;
        }
        Ok(DeltaPage {
            deltas,
            next,
            more: page.more,
        })
    }

    pub async fn put_keyring(
        &self,
        company_id: Uuid,
        bundle: KeyringBundle,
    ) -> Result<(), RelayStateError<S::Error>> {
        Ok(self.store.put_keyring(company_id, bundle).await?)
    }

    pub async fn get_keyring(
        &self,
        company_id: Uuid,
    ) -> Result<Option<KeyringBundle>, RelayStateError<S::Error>> {
        Ok(self.store.get_keyring(company_id).await?)
    }

    /// What the relay currently believes about a company's principals
    pub async fn grant_windows(
        &self,
        company_id: Uuid,
    ) -> Result<Vec<(String, GrantWindow)>, RelayStateError<S::Error>> {
        Ok(self.store.windows(company_id).await?.into_iter().collect())
    }

    /// Fold one access-ledger delta's index fields into the grant windows
    ///
    /// A revoked window never reopens (a fresh grant is a new ledger entry
    /// for a new window only once the old one is gone; the relay keeps the
    /// terminal state per principal, matching the ledger's own state
    /// machine).
    async fn observe_ledger_delta(
        &self,
        company_id: Uuid,
        delta: &EncryptedDelta,
    ) -> Result<(), RelayStateError<S::Error>> {
        let Some(IndexValue::Str(event)) = delta.index_fields.get("event") else {
            return Ok(());
        };
        let Some(IndexValue::Str(principal)) = delta.index_fields.get("principal") else {
            return Ok(());
        };

        match event.as_str() {
            "GRANTED" => {
                let from_epoch = match delta.index_fields.get("epoch") {
                    Some(IndexValue::Int(e)) if *e >= 0 => Epoch(*e as u64),
                    _ => Epoch::GENESIS,
                };
                let window = match self.store.window(company_id, principal).await? {
                    Some(window) if window.revoked => window,
                    Some(window) => GrantWindow {
                        from_epoch: window.from_epoch.min(from_epoch),
                        revoked: false,
                    },
                    None => GrantWindow {
                        from_epoch,
                        revoked: false,
                    },
                };
                self.store.put_window(company_id, principal, window).await?;
            }
            "REVOKED" => {
                if let Some(window) = self.store.window(company_id, principal).await? {
                    self.store
                        .put_window(
                            company_id,
                            principal,
                            GrantWindow {
                                revoked: true,
                                ..window
                            },
                        )
                        .await?;
                    tracing::info!(company = %company_id, principal, "grant window closed");
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// Ledger deltas always flow; data deltas need an active window covering
/// the delta's epoch
fn visible(window: Option<GrantWindow>, delta: &EncryptedDelta) -> bool {
    if delta.kind == EntityKind::AccessEntry {
        return true;
    }
    match window {
        Some(window) => !window.revoked && delta.key_epoch >= window.from_epoch,
        None => false,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::store::MemoryDeltaStore;
    use chrono::Utc;
    use common::crypto::SecretKey;
    use common::record::{ReplicaId, VersionVector};
    use std::collections::BTreeMap;

    fn state() -> RelayState<MemoryDeltaStore> {
        RelayState::new(MemoryDeltaStore::new())
    }

    fn data_delta(company: Uuid, epoch: Epoch) -> EncryptedDelta {
        let origin = ReplicaId::generate();
        let mut vv = VersionVector::new();
        vv.increment(origin);
        EncryptedDelta {
            record_id: Uuid::new_v4(),
            company_id: company,
            kind: EntityKind::Transaction,
            key_epoch: epoch,
            version_vector: vv,
            index_fields: BTreeMap::new(),
            payload: vec![1, 2, 3],
            origin,
            updated_at: Utc::now(),
            deleted_at: None,
        }
    }

    fn ledger_delta(
        company: Uuid,
        event: &str,
        principal: &PublicKey,
        epoch: Option<Epoch>,
    ) -> EncryptedDelta {
        let origin = ReplicaId::generate();
        let mut vv = VersionVector::new();
        vv.increment(origin);
        let mut index_fields = BTreeMap::from([
            (
                "type".to_string(),
                IndexValue::Str(EntityKind::AccessEntry.as_str().to_string()),
            ),
            ("event".to_string(), IndexValue::Str(event.to_string())),
            (
                "principal".to_string(),
                IndexValue::Str(principal.to_hex()),
            ),
        ]);
        if let Some(epoch) = epoch {
            index_fields.insert("epoch".to_string(), IndexValue::Int(epoch.0 as i64));
        }
        EncryptedDelta {
            record_id: Uuid::new_v4(),
            company_id: company,
            kind: EntityKind::AccessEntry,
            key_epoch: Epoch::GENESIS,
            version_vector: vv,
            index_fields,
            payload: vec![9],
            origin,
            updated_at: Utc::now(),
            deleted_at: None,
        }
    }

    #[tokio::test]
    async fn test_bootstrap_then_granted_only() {
        let state = state();
        let owner = SecretKey::generate().public();
        let stranger = SecretKey::generate().public();
        let company = Uuid::new_v4();

        // first push bootstraps the company
        state
            .push(
                owner,
                company,
                vec![ledger_delta(company, "GRANTED", &owner, Some(Epoch::GENESIS))],
            )
            .await
            .unwrap();

        // a principal without a window may not push afterwards
        let denied = state
            .push(stranger, company, vec![data_delta(company, Epoch::GENESIS)])
            .await;
        assert!(matches!(denied, Err(RelayStateError::NotGranted(_, _))));

        state
            .push(owner, company, vec![data_delta(company, Epoch::GENESIS)])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_revoked_sees_ledger_only() {
        let state = state();
        let owner = SecretKey::generate().public();
        let advisor = SecretKey::generate().public();
        let company = Uuid::new_v4();

        state
            .push(
                owner,
                company,
                vec![
                    ledger_delta(company, "GRANTED", &owner, Some(Epoch::GENESIS)),
                    ledger_delta(company, "GRANTED", &advisor, Some(Epoch::GENESIS)),
                    data_delta(company, Epoch::GENESIS),
                ],
            )
            .await
            .unwrap();
        let page = state.pull(advisor, company, None, 10).await.unwrap();
        assert_eq!(page.deltas.len(), 3);

        state
            .push(
                owner,
                company,
                vec![
                    ledger_delta(company, "REVOKED", &advisor, None),
                    data_delta(company, Epoch(1)),
                ],
            )
            .await
            .unwrap();

        let after = state
            .pull(advisor, company, Some(page.next), 10)
            .await
            .unwrap();
        assert_eq!(after.deltas.len(), 1);
        assert_eq!(after.deltas[0].kind, EntityKind::AccessEntry);

        let denied = state
            .push(advisor, company, vec![data_delta(company, Epoch::GENESIS)])
            .await;
        assert!(matches!(denied, Err(RelayStateError::NotGranted(_, _))));
    }

    #[tokio::test]
    async fn test_window_filters_epochs_below_grant() {
        let state = state();
        let owner = SecretKey::generate().public();
        let advisor = SecretKey::generate().public();
        let company = Uuid::new_v4();

        state
            .push(
                owner,
                company,
                vec![
                    ledger_delta(company, "GRANTED", &owner, Some(Epoch::GENESIS)),
                    data_delta(company, Epoch::GENESIS),
                    ledger_delta(company, "GRANTED", &advisor, Some(Epoch(2))),
                    data_delta(company, Epoch(2)),
                ],
            )
            .await
            .unwrap();

        let page = state.pull(advisor, company, None, 10).await.unwrap();
        let data: Vec<_> = page
            .deltas
            .iter()
            .filter(|d| d.kind != EntityKind::AccessEntry)
            .collect();
        assert_eq!(data.len(), 1);
        assert_eq!(data[0].key_epoch, Epoch(2));
    }

    #[tokio::test]
    async fn test_next_cursor_advances_past_filtered_deltas() {
        let state = state();
        let owner = SecretKey::generate().public();
        let viewer = SecretKey::generate().public();
        let company = Uuid::new_v4();

        state
            .push(
                owner,
                company,
                vec![
                    ledger_delta(company, "GRANTED", &owner, Some(Epoch::GENESIS)),
                    data_delta(company, Epoch::GENESIS),
                ],
            )
            .await
            .unwrap();

        // viewer has no window: sees the ledger delta only, but its
        // checkpoint still moves to the end of the scanned range
        let page = state.pull(viewer, company, None, 10).await.unwrap();
        assert_eq!(page.deltas.len(), 1);
        assert_eq!(page.next, Cursor(2));
        assert!(!page.more);
    }
}
