//! Relay transport
//!
//! The relay is an untrusted, always-on mailbox: it stores deltas blind,
//! assigns each one a monotone cursor per company, and serves them back to
//! devices by cursor. It never holds key material; the only policy it can
//! enforce comes from the plaintext index fields of access-ledger deltas,
//! which let it derive per-principal grant windows and stop shipping data
//! deltas to revoked principals.
//!
//! [`RelayTransport`] is the device-side seam: the in-memory implementation
//! here backs the testkit, the HTTP client in the relay crate backs real
//! deployments.

use std::collections::HashMap;
use std::fmt::{Debug, Display};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use uuid::Uuid;

use super::delta::{Cursor, EncryptedDelta};
use crate::crypto::PublicKey;
use crate::keyring::KeyringBundle;
use crate::record::{EntityKind, Epoch, IndexValue};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError<T> {
    #[error("unhandled relay provider error: {0}")]
    Provider(#[from] T),
    /// The relay could not be reached; the caller should back off and retry
    #[error("relay unavailable: {0}")]
    Unavailable(String),
    /// The calling principal has no active grant window for this company
    #[error("principal {0} is not granted on company {1}")]
    NotGranted(PublicKey, Uuid),
}

/// One page of a company's delta stream
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct DeltaPage {
    pub deltas: Vec<EncryptedDelta>,
    /// Checkpoint to persist once every delta in the page is applied
    pub next: Cursor,
    /// True if more deltas were available beyond this page
    pub more: bool,
}

/// Device-side handle to a relay, authenticated as one principal
#[async_trait]
pub trait RelayTransport: Send + Sync + Debug + Clone + 'static {
    type Error: Display + Debug + Send;

    /// Append deltas to a company's stream; returns the cursor assigned to
    /// the last one
    async fn push(
        &self,
        company_id: Uuid,
        deltas: Vec<EncryptedDelta>,
    ) -> Result<Cursor, RelayError<Self::Error>>;

    /// Deltas after the given cursor that the calling principal may see
    async fn pull(
        &self,
        company_id: Uuid,
        after: Option<Cursor>,
        limit: usize,
    ) -> Result<DeltaPage, RelayError<Self::Error>>;

    /// Replace the stored keyring bundle for a company
    async fn put_keyring(
        &self,
        company_id: Uuid,
        bundle: KeyringBundle,
    ) -> Result<(), RelayError<Self::Error>>;

    /// Fetch the stored keyring bundle, if any
    async fn get_keyring(
        &self,
        company_id: Uuid,
    ) -> Result<Option<KeyringBundle>, RelayError<Self::Error>>;
}

/// What the relay knows about one principal, derived from ledger deltas
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrantWindow {
    pub from_epoch: Epoch,
    pub revoked: bool,
}

#[derive(Debug, Default)]
struct CompanyStream {
    /// Deltas in cursor order; cursor = index + 1
    deltas: Vec<EncryptedDelta>,
    /// principal hex -> window, replayed from ledger delta index fields
    windows: HashMap<String, GrantWindow>,
    keyring: Option<KeyringBundle>,
}

impl CompanyStream {
    /// Update grant windows from an access-ledger delta's index fields
    ///
    /// Only plaintext fields are consulted; the relay cannot read the entry
    /// body and does not try to.
    fn observe_ledger_delta(&mut self, delta: &EncryptedDelta) {
        let Some(IndexValue::Str(event)) = delta.index_fields.get("event") else {
            return;
        };
        let Some(IndexValue::Str(principal)) = delta.index_fields.get("principal") else {
            return;
        };
        match event.as_str() {
            "GRANTED" => {
                let from_epoch = match delta.index_fields.get("epoch") {
                    Some(IndexValue::Int(e)) if *e >= 0 => Epoch(*e as u64),
                    _ => Epoch::GENESIS,
                };
                let window = self
                    .windows
                    .entry(principal.clone())
                    .or_insert(GrantWindow {
                        from_epoch,
                        revoked: false,
                    });
                if !window.revoked && from_epoch < window.from_epoch {
                    window.from_epoch = from_epoch;
                }
            }
            "REVOKED" => {
                if let Some(window) = self.windows.get_mut(principal) {
                    window.revoked = true;
                }
            }
            _ => {}
        }
    }

    fn window(&self, principal: &PublicKey) -> Option<GrantWindow> {
        self.windows.get(&principal.to_hex()).copied()
    }

    /// True if the principal may see this delta
    ///
    /// Ledger deltas always flow (a revoked principal must still learn it
    /// was revoked); data deltas require an active window covering the
    /// delta's epoch.
    fn visible(&self, principal: &PublicKey, delta: &EncryptedDelta) -> bool {
        if delta.kind == EntityKind::AccessEntry {
            return true;
        }
        match self.window(principal) {
            Some(window) => !window.revoked && delta.key_epoch >= window.from_epoch,
            None => false,
        }
    }
}

#[derive(Debug, Default)]
struct MemoryRelayInner {
    streams: HashMap<Uuid, CompanyStream>,
}

/// In-process relay shared by testkit replicas
#[derive(Debug, Clone, Default)]
pub struct MemoryRelay {
    inner: Arc<RwLock<MemoryRelayInner>>,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryRelayError {
    #[error("memory relay error: {0}")]
    Internal(String),
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport handle authenticated as the given principal
    pub fn client(&self, principal: PublicKey) -> MemoryRelayClient {
        MemoryRelayClient {
            relay: self.clone(),
            principal,
        }
    }
}

/// [`RelayTransport`] over a shared [`MemoryRelay`]
#[derive(Debug, Clone)]
pub struct MemoryRelayClient {
    relay: MemoryRelay,
    principal: PublicKey,
}

fn lock_err(e: impl Display) -> RelayError<MemoryRelayError> {
    RelayError::Provider(MemoryRelayError::Internal(format!(
        "failed to acquire lock: {}",
        e
    )))
}

#[async_trait]
impl RelayTransport for MemoryRelayClient {
    type Error = MemoryRelayError;

    async fn push(
        &self,
        company_id: Uuid,
        deltas: Vec<EncryptedDelta>,
    ) -> Result<Cursor, RelayError<Self::Error>> {
        let mut inner = self.relay.inner.write().map_err(lock_err)?;
        let stream = inner.streams.entry(company_id).or_default();

        // First contact with a company bootstraps it; afterwards only
        // principals with an active window may push.
        if !stream.deltas.is_empty() {
            match stream.window(&self.principal) {
                Some(window) if !window.revoked => {}
                _ => return Err(RelayError::NotGranted(self.principal, company_id)),
            }
        }

        for delta in deltas {
            if delta.kind == EntityKind::AccessEntry {
                stream.observe_ledger_delta(&delta);
            }
            stream.deltas.push(delta);
        }
        Ok(Cursor(stream.deltas.len() as u64))
    }

    async fn pull(
        &self,
        company_id: Uuid,
        after: Option<Cursor>,
        limit: usize,
    ) -> Result<DeltaPage, RelayError<Self::Error>> {
        let inner = self.relay.inner.read().map_err(lock_err)?;
        let Some(stream) = inner.streams.get(&company_id) else {
            return Ok(DeltaPage {
                deltas: Vec::new(),
                next: after.unwrap_or_default(),
                more: false,
            });
        };

        let start = after.unwrap_or_default().0 as usize;
        let mut deltas = Vec::new();
        let mut next = after.unwrap_or_default();
        let mut more = false;
        for (offset, delta) in stream.deltas.iter().enumerate().skip(start) {
            if deltas.len() >= limit {
                more = true;
                break;
            }
            if stream.visible(&self.principal, delta) {
                deltas.push(delta.clone());
            }
            next = Cursor(offset as u64 + 1);
        }
        Ok(DeltaPage { deltas, next, more })
    }

    async fn put_keyring(
        &self,
        company_id: Uuid,
        bundle: KeyringBundle,
    ) -> Result<(), RelayError<Self::Error>> {
        let mut inner = self.relay.inner.write().map_err(lock_err)?;
        inner.streams.entry(company_id).or_default().keyring = Some(bundle);
        Ok(())
    }

    async fn get_keyring(
        &self,
        company_id: Uuid,
    ) -> Result<Option<KeyringBundle>, RelayError<Self::Error>> {
        let inner = self.relay.inner.read().map_err(lock_err)?;
        Ok(inner
            .streams
            .get(&company_id)
            .and_then(|stream| stream.keyring.clone()))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crypto::SecretKey;
    use crate::record::{ReplicaId, VersionVector};
    use chrono::Utc;
    use std::collections::BTreeMap;

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
    async fn test_cursors_are_monotone() {
        let relay = MemoryRelay::new();
        let owner = SecretKey::generate().public();
        let client = relay.client(owner);
        let company = Uuid::new_v4();

        let c1 = client
            .push(
                company,
                vec![ledger_delta(company, "GRANTED", &owner, Some(Epoch::GENESIS))],
            )
            .await
            .unwrap();
        let c2 = client
            .push(company, vec![data_delta(company, Epoch::GENESIS)])
            .await
            .unwrap();
        assert!(c2 > c1);
    }

    #[tokio::test]
    async fn test_pull_resumes_from_cursor() {
        let relay = MemoryRelay::new();
        let owner = SecretKey::generate().public();
        let client = relay.client(owner);
        let company = Uuid::new_v4();

        client
            .push(
                company,
                vec![ledger_delta(company, "GRANTED", &owner, Some(Epoch::GENESIS))],
            )
            .await
            .unwrap();
        client
            .push(
                company,
                vec![
                    data_delta(company, Epoch::GENESIS),
                    data_delta(company, Epoch::GENESIS),
                ],
            )
            .await
            .unwrap();

        let page = client.pull(company, None, 10).await.unwrap();
        assert_eq!(page.deltas.len(), 3);
        assert!(!page.more);

        // nothing new after the checkpoint
        let empty = client.pull(company, Some(page.next), 10).await.unwrap();
        assert!(empty.deltas.is_empty());

        client
            .push(company, vec![data_delta(company, Epoch::GENESIS)])
            .await
            .unwrap();
        let tail = client.pull(company, Some(page.next), 10).await.unwrap();
        assert_eq!(tail.deltas.len(), 1);
    }

    #[tokio::test]
    async fn test_revoked_principal_gets_ledger_only() {
        let relay = MemoryRelay::new();
        let owner_key = SecretKey::generate();
        let advisor_key = SecretKey::generate();
        let owner = relay.client(owner_key.public());
        let advisor = relay.client(advisor_key.public());
        let company = Uuid::new_v4();

        let owner_pub = owner_key.public();
        let advisor_pub = advisor_key.public();
        owner
            .push(
                company,
                vec![
                    ledger_delta(company, "GRANTED", &owner_pub, Some(Epoch::GENESIS)),
                    ledger_delta(company, "GRANTED", &advisor_pub, Some(Epoch::GENESIS)),
                    data_delta(company, Epoch::GENESIS),
                ],
            )
            .await
            .unwrap();

        let page = advisor.pull(company, None, 10).await.unwrap();
        assert_eq!(page.deltas.len(), 3);

        owner
            .push(
                company,
                vec![
                    ledger_delta(company, "REVOKED", &advisor_pub, None),
                    data_delta(company, Epoch(1)),
                ],
            )
            .await
            .unwrap();

        // the revocation entry still flows; the data delta does not
        let after = advisor.pull(company, Some(page.next), 10).await.unwrap();
        assert_eq!(after.deltas.len(), 1);
        assert_eq!(after.deltas[0].kind, EntityKind::AccessEntry);

        // and the revoked principal can no longer push
        let denied = advisor
            .push(company, vec![data_delta(company, Epoch::GENESIS)])
            .await;
        assert!(matches!(denied, Err(RelayError::NotGranted(_, _))));
    }

    #[tokio::test]
    async fn test_grant_window_filters_old_epochs() {
        let relay = MemoryRelay::new();
        let owner_key = SecretKey::generate();
        let advisor_key = SecretKey::generate();
        let owner = relay.client(owner_key.public());
        let advisor = relay.client(advisor_key.public());
        let company = Uuid::new_v4();

        let owner_pub = owner_key.public();
        let advisor_pub = advisor_key.public();
        owner
            .push(
                company,
                vec![
                    ledger_delta(company, "GRANTED", &owner_pub, Some(Epoch::GENESIS)),
                    data_delta(company, Epoch::GENESIS),
                    ledger_delta(company, "GRANTED", &advisor_pub, Some(Epoch(2))),
                    data_delta(company, Epoch(2)),
                ],
            )
            .await
            .unwrap();

        let page = advisor.pull(company, None, 10).await.unwrap();
        let data: Vec<_> = page
            .deltas
            .iter()
            .filter(|d| d.kind != EntityKind::AccessEntry)
            .collect();
        assert_eq!(data.len(), 1);
        assert_eq!(data[0].key_epoch, Epoch(2));
    }
}
