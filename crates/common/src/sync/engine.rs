//! Sync engine
//!
//! Ties the pieces together on one device: local writes (encrypt, stamp,
//! index), delta application (merge, verify, quarantine), checkpointed
//! pulls, and the background sync loop. One engine serves one company on
//! one replica.
//!
//! Application order inside a batch matters only for access-ledger deltas:
//! they are applied first, because they can change which epochs this device
//! may decrypt for the data deltas that follow.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::{watch, Mutex};
use uuid::Uuid;

use super::delta::{CorruptDelta, Cursor, EncryptedDelta};
use super::relay::{RelayError, RelayTransport};
use crate::crypto::CipherError;
use crate::keyring::rotation::{RotationDriver, RotationProgress};
use crate::keyring::{Keyring, KeyringError};
use crate::ledger::{LedgerEntry, LedgerError, Scope};
use crate::merge::{merge, InvariantCollision};
use crate::record::{
    EntityKind, PlainPayload, Record, RecordError, ReplicaId, VersionVector,
};
use crate::store::{RecordStore, RecordStoreError};

/// Deltas requested per pull page
pub const PULL_PAGE_SIZE: usize = 256;

/// Ceiling for the sync loop's retry backoff
pub const MAX_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum SyncError<SE, TE> {
    #[error(transparent)]
    Store(#[from] RecordStoreError<SE>),
    #[error("transport error: {0}")]
    Transport(#[from] RelayError<TE>),
    #[error(transparent)]
    Keyring(#[from] KeyringError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Record(#[from] RecordError),
    #[error("encryption error: {0}")]
    Cipher(#[from] CipherError),
    /// A local write would duplicate a uniqueness key held by another
    /// active record; local writes refuse where merges only surface
    #[error("duplicate uniqueness key on {}", .0.record_ids[1])]
    Duplicate(InvariantCollision),
    #[error("record not found: {0}")]
    NotFound(Uuid),
}

/// What happened to one batch of incoming deltas
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplyReport {
    /// Deltas that changed the local record set
    pub applied: usize,
    /// Deltas already covered by local state
    pub already_current: usize,
    /// Deltas stored as opaque ciphertext (no key for their epoch)
    pub stored_opaque: usize,
    /// Deltas quarantined after failing authenticated decryption
    pub skipped_corrupt: usize,
    /// Uniqueness-key collisions surfaced by this batch
    pub collisions: Vec<InvariantCollision>,
}

impl ApplyReport {
    fn absorb(&mut self, other: ApplyReport) {
        self.applied += other.applied;
        self.already_current += other.already_current;
        self.stored_opaque += other.stored_opaque;
        self.skipped_corrupt += other.skipped_corrupt;
        self.collisions.extend(other.collisions);
    }
}

enum ApplyOutcome {
    Applied,
    AlreadyCurrent,
    StoredOpaque,
    SkippedCorrupt,
}

/// Replication engine for one company on one replica
pub struct SyncEngine<S: RecordStore, T: RelayTransport> {
    store: S,
    relay: T,
    /// Checkpoint key for this relay in the store
    relay_name: String,
    keyring: Arc<RwLock<Keyring>>,
    replica: ReplicaId,
    /// Record ids with local changes not yet pushed
    ///
    /// Shared with the background re-encryption task, which stages rotated
    /// records here once its pass completes.
    dirty: Arc<parking_lot::Mutex<BTreeSet<Uuid>>>,
    /// Collisions surfaced so far, deduplicated
    collisions: parking_lot::Mutex<Vec<InvariantCollision>>,
    /// Per-record write locks; read-merge-write cycles serialize per id,
    /// never across the whole store. Entries are kept for the record's
    /// lifetime, so the map is bounded by the record set.
    locks: parking_lot::Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl<S: RecordStore, T: RelayTransport> SyncEngine<S, T> {
    pub fn new(store: S, relay: T, keyring: Keyring, replica: ReplicaId) -> Self {
        Self {
            store,
            relay,
            relay_name: "relay".to_string(),
            keyring: Arc::new(RwLock::new(keyring)),
            replica,
            dirty: Arc::new(parking_lot::Mutex::new(BTreeSet::new())),
            collisions: parking_lot::Mutex::new(Vec::new()),
            locks: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    pub fn replica(&self) -> ReplicaId {
        self.replica
    }

    pub fn company_id(&self) -> Uuid {
        self.keyring.read().company_id()
    }

    pub fn keyring(&self) -> Arc<RwLock<Keyring>> {
        self.keyring.clone()
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Collisions surfaced on this device so far
    pub fn collisions(&self) -> Vec<InvariantCollision> {
        self.collisions.lock().clone()
    }

    fn record_lock(&self, id: Uuid) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn record_collision(&self, collision: InvariantCollision) -> bool {
        let mut collisions = self.collisions.lock();
        if collisions.contains(&collision) {
            return false;
        }
        collisions.push(collision);
        true
    }

    /// Check an active record against its kind's uniqueness key
    async fn find_duplicates(
        &self,
        record: &Record,
    ) -> Result<Vec<InvariantCollision>, SyncError<S::Error, T::Error>> {
        let Some(key) = record.uniqueness_key() else {
            return Ok(Vec::new());
        };
        if record.is_deleted() {
            return Ok(Vec::new());
        }
        let peers = self
            .store
            .query_uniqueness_key(record.company_id, record.kind, &key)
            .await?;
        Ok(peers
            .into_iter()
            .filter(|peer| peer.id != record.id && !peer.is_deleted())
            .map(|peer| {
                InvariantCollision::new(
                    record.company_id,
                    record.kind,
                    key.clone(),
                    record.id,
                    peer.id,
                )
            })
            .collect())
    }

    /// Encrypt and store a new record
    pub async fn create_record(
        &self,
        payload: PlainPayload,
    ) -> Result<Record, SyncError<S::Error, T::Error>> {
        self.write_record(Uuid::new_v4(), payload, true).await
    }

    /// Encrypt and store a new version of an existing record
    pub async fn update_record(
        &self,
        id: Uuid,
        payload: PlainPayload,
    ) -> Result<Record, SyncError<S::Error, T::Error>> {
        self.write_record(id, payload, false).await
    }

    async fn write_record(
        &self,
        id: Uuid,
        payload: PlainPayload,
        create: bool,
    ) -> Result<Record, SyncError<S::Error, T::Error>> {
        let lock = self.record_lock(id);
        let _guard = lock.lock().await;
        let company_id = self.company_id();

        let existing = self.store.get(company_id, id).await?;
        let mut version_vector = match (&existing, create) {
            (Some(record), _) => record.version_vector.clone(),
            (None, true) => VersionVector::new(),
            (None, false) => return Err(SyncError::NotFound(id)),
        };
        version_vector.increment(self.replica);

        let (epoch, ciphertext) = {
            let keyring = self.keyring.read();
            let epoch = keyring.current_epoch();
            let key = keyring.data_key(epoch)?;
            (epoch, key.encrypt(&payload.encode()?)?)
        };

        let record = Record {
            id,
            company_id,
            kind: payload.kind,
            index_fields: payload.index_fields(),
            payload: ciphertext,
            key_epoch: epoch,
            version_vector,
            origin: self.replica,
            updated_at: Utc::now(),
            deleted_at: None,
        };

        // Local writes enforce uniqueness upfront; only merges may surface
        // collisions after the fact.
        if let Some(collision) = self.find_duplicates(&record).await?.into_iter().next() {
            return Err(SyncError::Duplicate(collision));
        }

        self.store.put(record.clone()).await?;
        self.dirty.lock().insert(id);
        Ok(record)
    }

    /// Tombstone a record
    ///
    /// The ciphertext stays in place so a later restore still has the
    /// payload; the tombstone is the version, not the absence.
    pub async fn delete_record(
        &self,
        id: Uuid,
    ) -> Result<Record, SyncError<S::Error, T::Error>> {
        let lock = self.record_lock(id);
        let _guard = lock.lock().await;
        let company_id = self.company_id();
        let mut record = self
            .store
            .get(company_id, id)
            .await?
            .ok_or(SyncError::NotFound(id))?;

        record.version_vector.increment(self.replica);
        record.origin = self.replica;
        record.updated_at = Utc::now();
        record.deleted_at = Some(record.updated_at);

        self.store.put(record.clone()).await?;
        self.dirty.lock().insert(id);
        Ok(record)
    }

    /// Lift a tombstone as an explicit new version
    ///
    /// Causally later than the tombstone, so it dominates everywhere
    /// instead of racing the deletion.
    pub async fn restore_record(
        &self,
        id: Uuid,
    ) -> Result<Record, SyncError<S::Error, T::Error>> {
        let lock = self.record_lock(id);
        let _guard = lock.lock().await;
        let company_id = self.company_id();
        let mut record = self
            .store
            .get(company_id, id)
            .await?
            .ok_or(SyncError::NotFound(id))?;

        record.version_vector.increment(self.replica);
        record.origin = self.replica;
        record.updated_at = Utc::now();
        record.deleted_at = None;

        self.store.put(record.clone()).await?;
        self.dirty.lock().insert(id);
        Ok(record)
    }

    /// Decrypt a record's payload
    pub async fn read_record(
        &self,
        id: Uuid,
    ) -> Result<Option<PlainPayload>, SyncError<S::Error, T::Error>> {
        let company_id = self.company_id();
        let Some(record) = self.store.get(company_id, id).await? else {
            return Ok(None);
        };
        let key = self.keyring.read().data_key(record.key_epoch)?;
        let plaintext = key.decrypt(&record.payload)?;
        Ok(Some(PlainPayload::decode(&plaintext)?))
    }

    /// Store and stage a signed ledger entry for replication
    pub async fn append_ledger_entry(
        &self,
        entry: LedgerEntry,
    ) -> Result<Record, SyncError<S::Error, T::Error>> {
        let mut version_vector = VersionVector::new();
        version_vector.increment(self.replica);
        let record = entry.to_record(self.replica, version_vector)?;
        self.store.put(record.clone()).await?;
        self.dirty.lock().insert(record.id);
        Ok(record)
    }

    /// Grant a principal view access and stage the ledger entry
    pub async fn grant_view(
        &self,
        principal: crate::crypto::PublicKey,
        scope: Scope,
    ) -> Result<(), SyncError<S::Error, T::Error>> {
        let entry = self.keyring.write().grant_view(principal, scope, Utc::now())?;
        self.append_ledger_entry(entry).await?;
        Ok(())
    }

    /// Revoke a principal and stage the ledger entries
    ///
    /// Full revocation rotates the epoch and schedules background
    /// re-encryption of the backlog; the returned channel reports its
    /// progress and closes when the pass ends.
    pub async fn revoke(
        &self,
        principal: crate::crypto::PublicKey,
        full: bool,
    ) -> Result<Option<watch::Receiver<RotationProgress>>, SyncError<S::Error, T::Error>> {
        let entries = self.keyring.write().revoke(principal, full, Utc::now())?;
        for entry in entries {
            self.append_ledger_entry(entry).await?;
        }
        Ok(full.then(|| self.spawn_reencryption()))
    }

    /// Mint the next key epoch, stage the ledger entry, and schedule
    /// background re-encryption of the backlog
    pub async fn rotate(
        &self,
    ) -> Result<watch::Receiver<RotationProgress>, SyncError<S::Error, T::Error>> {
        let (_, entry) = self.keyring.write().rotate(Utc::now())?;
        self.append_ledger_entry(entry).await?;
        Ok(self.spawn_reencryption())
    }

    /// Re-encrypt the backlog below the current epoch on a background task
    ///
    /// Rotated records are staged for the next push once the pass
    /// completes, so peers receive the rewritten ciphertext. The returned
    /// channel reports progress and closes when the pass ends.
    pub fn spawn_reencryption(&self) -> watch::Receiver<RotationProgress> {
        let (driver, progress) = RotationDriver::new(self.store.clone(), self.company_id());
        let keyring = self.keyring.clone();
        let dirty = self.dirty.clone();
        tokio::spawn(async move {
            let (_shutdown_tx, shutdown_rx) = watch::channel(());
            match driver.run(&keyring, shutdown_rx).await {
                Ok(ids) => {
                    dirty.lock().extend(ids);
                }
                Err(e) => {
                    tracing::error!(error = %e, "background re-encryption failed");
                }
            }
        });
        progress
    }

    /// Apply a batch of incoming deltas
    ///
    /// Ledger deltas go first. A delta that fails is logged and counted,
    /// never aborts the batch: one bad delta must not stall replication.
    pub async fn apply_deltas(
        &self,
        source: &str,
        deltas: Vec<EncryptedDelta>,
    ) -> Result<ApplyReport, SyncError<S::Error, T::Error>> {
        let mut report = ApplyReport::default();

        let (ledger, data): (Vec<_>, Vec<_>) = deltas
            .into_iter()
            .partition(|d| d.kind == EntityKind::AccessEntry);

        let mut touched = BTreeSet::new();
        for delta in ledger.into_iter().chain(data) {
            let record_id = delta.record_id;
            touched.insert((delta.company_id, record_id));
            match self.apply_one(source, delta).await {
                Ok(ApplyOutcome::Applied) => report.applied += 1,
                Ok(ApplyOutcome::AlreadyCurrent) => report.already_current += 1,
                Ok(ApplyOutcome::StoredOpaque) => report.stored_opaque += 1,
                Ok(ApplyOutcome::SkippedCorrupt) => report.skipped_corrupt += 1,
                Err(e) => {
                    tracing::error!(record = %record_id, error = %e, "failed to apply delta");
                }
            }
        }

        // Collision scan covers only the records this batch touched, and
        // runs after the whole batch so both colliding records are present
        // regardless of arrival order.
        for (company_id, id) in touched {
            let Some(record) = self.store.get(company_id, id).await? else {
                continue;
            };
            for collision in self.find_duplicates(&record).await? {
                if self.record_collision(collision.clone()) {
                    tracing::warn!(
                        kind = %collision.kind,
                        ids = ?collision.record_ids,
                        "uniqueness collision surfaced by merge"
                    );
                    report.collisions.push(collision);
                }
            }
        }

        Ok(report)
    }

    async fn apply_one(
        &self,
        source: &str,
        mut delta: EncryptedDelta,
    ) -> Result<ApplyOutcome, SyncError<S::Error, T::Error>> {
        let lock = self.record_lock(delta.record_id);
        let _guard = lock.lock().await;

        if delta.kind == EntityKind::AccessEntry {
            // Ledger payloads are signed plaintext; a bad signature is the
            // ledger's analogue of failed decryption.
            let incoming = delta.clone().into_record();
            let incoming = match LedgerEntry::from_record(&incoming).and_then(|entry| {
                entry.verify()?;
                Ok(entry)
            }) {
                Ok(entry) => {
                    // Rebuild the record from the verified entry itself, so
                    // routing fields reflect what was signed rather than
                    // what the delta envelope claims.
                    let rebuilt =
                        entry.to_record(incoming.origin, incoming.version_vector.clone())?;
                    self.keyring.write().merge_entry(entry)?;
                    rebuilt
                }
                Err(e) => {
                    self.quarantine(source, delta, format!("ledger entry rejected: {}", e))
                        .await?;
                    return Ok(ApplyOutcome::SkippedCorrupt);
                }
            };
            return self.merge_into_store(incoming, false).await;
        }

        // Authenticated decryption doubles as integrity verification when
        // this device holds the epoch key, and the decrypted payload is
        // what the index fields are derived from: the delta envelope's
        // claims are only trusted where the ciphertext cannot be opened.
        let opaque = {
            let data_key = self.keyring.read().data_key(delta.key_epoch);
            match data_key {
                Ok(key) => match key.decrypt(&delta.payload) {
                    Ok(plaintext) => match PlainPayload::decode(&plaintext) {
                        Ok(payload) if payload.kind == delta.kind => {
                            delta.index_fields = payload.index_fields();
                            false
                        }
                        Ok(payload) => {
                            self.quarantine(
                                source,
                                delta,
                                format!("payload kind {} does not match envelope", payload.kind),
                            )
                            .await?;
                            return Ok(ApplyOutcome::SkippedCorrupt);
                        }
                        Err(e) => {
                            self.quarantine(source, delta, format!("payload malformed: {}", e))
                                .await?;
                            return Ok(ApplyOutcome::SkippedCorrupt);
                        }
                    },
                    Err(CipherError::Unauthenticated) => {
                        self.quarantine(
                            source,
                            delta,
                            "payload failed authenticated decryption".to_string(),
                        )
                        .await?;
                        return Ok(ApplyOutcome::SkippedCorrupt);
                    }
                    Err(e) => return Err(e.into()),
                },
                Err(KeyringError::EpochKeyUnavailable(_))
                | Err(KeyringError::UnauthorizedKey(_)) => true,
                Err(e) => return Err(e.into()),
            }
        };

        self.merge_into_store(delta.into_record(), opaque).await
    }

    async fn merge_into_store(
        &self,
        incoming: Record,
        opaque: bool,
    ) -> Result<ApplyOutcome, SyncError<S::Error, T::Error>> {
        let local = self.store.get(incoming.company_id, incoming.id).await?;
        let outcome = match local {
            None => {
                self.store.put(incoming).await?;
                ApplyOutcome::Applied
            }
            Some(local) => {
                let merged = merge(&local, &incoming);
                if merged.changed_local() {
                    self.store.put(merged.record).await?;
                    ApplyOutcome::Applied
                } else {
                    ApplyOutcome::AlreadyCurrent
                }
            }
        };
        Ok(match (outcome, opaque) {
            (ApplyOutcome::Applied, true) => ApplyOutcome::StoredOpaque,
            (outcome, _) => outcome,
        })
    }

    async fn quarantine(
        &self,
        source: &str,
        delta: EncryptedDelta,
        reason: String,
    ) -> Result<(), SyncError<S::Error, T::Error>> {
        tracing::warn!(
            record = %delta.record_id,
            source,
            reason,
            "quarantining corrupt delta"
        );
        self.store
            .quarantine(CorruptDelta {
                delta,
                source: source.to_string(),
                received_at: Utc::now(),
                reason,
            })
            .await?;
        Ok(())
    }

    /// Push locally-changed records (and the keyring bundle) to the relay
    pub async fn push(&self) -> Result<usize, SyncError<S::Error, T::Error>> {
        let company_id = self.company_id();
        let ids: Vec<Uuid> = {
            let mut dirty = self.dirty.lock();
            let ids = dirty.iter().copied().collect();
            dirty.clear();
            ids
        };
        let mut deltas = Vec::with_capacity(ids.len());
        for id in &ids {
            if let Some(record) = self.store.get(company_id, *id).await? {
                deltas.push(EncryptedDelta::from(record));
            }
        }

        let pushed = deltas.len();
        if pushed > 0 {
            if let Err(e) = self.relay.push(company_id, deltas).await {
                // put the batch back so the next push retries it
                self.dirty.lock().extend(ids);
                return Err(e.into());
            }
        }

        let bundle = self.keyring.read().bundle();
        self.relay.put_keyring(company_id, bundle).await?;

        tracing::debug!(company = %company_id, pushed, "pushed deltas");
        Ok(pushed)
    }

    /// Pull and apply everything new from the relay
    ///
    /// The checkpoint only advances after a whole page is applied or
    /// quarantined, so a crash mid-page replays the page instead of
    /// skipping it.
    pub async fn pull(&self) -> Result<ApplyReport, SyncError<S::Error, T::Error>> {
        let company_id = self.company_id();
        let mut report = ApplyReport::default();

        // Envelopes first: deltas in this round may already be encrypted at
        // an epoch whose key only the fresh bundle carries.
        if let Some(bundle) = self.relay.get_keyring(company_id).await? {
            self.keyring.write().merge_bundle(&bundle);
        }

        let mut checkpoint = self.store.checkpoint(company_id, &self.relay_name).await?;

        loop {
            let page = self
                .relay
                .pull(company_id, checkpoint, PULL_PAGE_SIZE)
                .await?;
            let empty = page.deltas.is_empty();
            if !empty {
                report.absorb(self.apply_deltas(&self.relay_name, page.deltas).await?);
            }
            if page.next != checkpoint.unwrap_or(Cursor(0)) {
                self.store
                    .set_checkpoint(company_id, &self.relay_name, page.next)
                    .await?;
                checkpoint = Some(page.next);
            }
            if !page.more {
                break;
            }
        }

        Ok(report)
    }

    /// One push/pull round trip
    pub async fn sync_once(&self) -> Result<ApplyReport, SyncError<S::Error, T::Error>> {
        self.push().await?;
        self.pull().await
    }

    /// Background sync loop with backoff on transport failure
    ///
    /// Runs until the shutdown channel fires. Transport failures back off
    /// exponentially up to [`MAX_BACKOFF`]; any other error is logged and
    /// the loop keeps going.
    pub async fn run(&self, interval: Duration, mut shutdown_rx: watch::Receiver<()>) {
        let mut delay = interval;
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    tracing::info!(company = %self.company_id(), "sync loop shutting down");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            match self.sync_once().await {
                Ok(report) => {
                    delay = interval;
                    if report.applied > 0 || report.skipped_corrupt > 0 {
                        tracing::debug!(
                            applied = report.applied,
                            corrupt = report.skipped_corrupt,
                            "sync round complete"
                        );
                    }
                }
                Err(SyncError::Transport(RelayError::Unavailable(msg))) => {
                    delay = (delay * 2).min(MAX_BACKOFF);
                    tracing::warn!(error = %msg, retry_in = ?delay, "relay unavailable");
                }
                Err(e) => {
                    delay = interval;
                    tracing::error!(error = %e, "sync round failed");
                }
            }
        }
    }
}
