//! Resumable re-encryption after a key rotation
//!
//! Minting a new epoch is instant; re-encrypting every existing ciphertext
//! under it is not. The driver walks the store in bounded batches so the
//! process survives restarts: each record is decrypted under its old epoch
//! key, encrypted under the current one, and re-put atomically, so at any
//! kill point every record is wholly at one epoch or the other and a fresh
//! driver picks up exactly where the dead one stopped.
//!
//! Re-encryption never changes the logical version: the version vector,
//! timestamps, and index fields pass through untouched. Replicas adopt the
//! rewritten ciphertext through the equal-vector resolution in
//! [`merge`](crate::merge::merge), which prefers the higher key epoch.

use parking_lot::RwLock;
use tokio::sync::watch;
use uuid::Uuid;

use super::{Keyring, KeyringError};
use crate::record::{EntityKind, Epoch};
use crate::store::{RecordStore, RecordStoreError};

/// Records re-encrypted per store round-trip
pub const DEFAULT_BATCH_SIZE: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum RotationError<T> {
    #[error(transparent)]
    Store(#[from] RecordStoreError<T>),
    #[error(transparent)]
    Keyring(#[from] KeyringError),
    /// A local record failed authenticated decryption under its own epoch
    /// key; the store needs operator attention before rotation can finish
    #[error("record {0} is corrupt under epoch {1}")]
    Corrupt(Uuid, Epoch),
}

/// Progress of one rotation pass, observable over a watch channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RotationProgress {
    /// Epoch being rotated to
    pub epoch: Epoch,
    /// Backlog size when the pass started
    pub total: u64,
    /// Records re-encrypted by this pass so far
    pub done: u64,
}

/// Drives re-encryption of a company's backlog toward the current epoch
pub struct RotationDriver<S: RecordStore> {
    store: S,
    company_id: Uuid,
    batch_size: usize,
    progress_tx: watch::Sender<RotationProgress>,
}

impl<S: RecordStore> RotationDriver<S> {
    pub fn new(store: S, company_id: Uuid) -> (Self, watch::Receiver<RotationProgress>) {
        let (progress_tx, progress_rx) = watch::channel(RotationProgress::default());
        (
            Self {
                store,
                company_id,
                batch_size: DEFAULT_BATCH_SIZE,
                progress_tx,
            },
            progress_rx,
        )
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Re-encrypt up to `max_records` records below the current epoch
    ///
    /// Returns the ids of the records actually moved; an empty batch means
    /// the backlog is drained. Safe to call again after any interruption.
    /// The keyring lock is only held around key lookups, never across a
    /// store round-trip.
    pub async fn advance(
        &self,
        keyring: &RwLock<Keyring>,
        max_records: usize,
    ) -> Result<Vec<Uuid>, RotationError<S::Error>> {
        let target = keyring.read().current_epoch();
        let batch = self
            .store
            .records_below_epoch(self.company_id, target, max_records)
            .await?;

        let mut moved = Vec::with_capacity(batch.len());
        for mut record in batch {
            // Ledger entries are signed plaintext; re-stamp without touching
            // the payload so the backlog still drains to zero.
            if record.kind != EntityKind::AccessEntry {
                let (old_key, new_key) = {
                    let keyring = keyring.read();
                    (keyring.data_key(record.key_epoch)?, keyring.data_key(target)?)
                };
                let plaintext = old_key.decrypt(&record.payload).map_err(|_| {
                    RotationError::Corrupt(record.id, record.key_epoch)
                })?;
                record.payload = new_key
                    .encrypt(&plaintext)
                    .map_err(|e| KeyringError::from(anyhow::Error::from(e)))?;
            }
            record.key_epoch = target;
            let id = record.id;
            self.store.put(record).await?;
            moved.push(id);
        }
        Ok(moved)
    }

    /// Re-encrypt the whole backlog, reporting progress as it goes
    ///
    /// Returns the ids of every record moved, so the caller can stage them
    /// for replication. Stops early (without error) when the shutdown
    /// channel fires; the next run resumes from whatever the store says is
    /// still below the current epoch.
    pub async fn run(
        &self,
        keyring: &RwLock<Keyring>,
        mut shutdown_rx: watch::Receiver<()>,
    ) -> Result<Vec<Uuid>, RotationError<S::Error>> {
        let target = keyring.read().current_epoch();
        let total = self
            .store
            .count_below_epoch(self.company_id, target)
            .await?;
        let mut done: Vec<Uuid> = Vec::new();
        let _ = self.progress_tx.send(RotationProgress {
            epoch: target,
            total,
            done: 0,
        });

        tracing::info!(
            company = %self.company_id,
            epoch = %target,
            backlog = total,
            "starting rotation pass"
        );

        loop {
            let moved = tokio::select! {
                _ = shutdown_rx.changed() => {
                    tracing::info!(
                        company = %self.company_id,
                        epoch = %target,
                        done = done.len(),
                        "rotation pass interrupted"
                    );
                    return Ok(done);
                }
                result = self.advance(keyring, self.batch_size) => result?,
            };

            if moved.is_empty() {
                break;
            }
            done.extend(moved);
            let _ = self.progress_tx.send(RotationProgress {
                epoch: target,
                total,
                done: done.len() as u64,
            });
        }

        tracing::info!(
            company = %self.company_id,
            epoch = %target,
            done = done.len(),
            "rotation pass complete"
        );
        Ok(done)
    }
}
