//! # Record store
//!
//! Storage provider abstraction for the encrypted record set of a device.
//! The store only ever sees ciphertext payloads plus the plaintext routing
//! envelope; it maintains the secondary indexes over the whitelisted index
//! fields, holds per-peer sync checkpoints, and keeps the quarantine of
//! deltas that failed authenticated decryption.

mod memory;

pub use memory::{MemoryRecordStore, MemoryRecordStoreError};

use std::fmt::{Debug, Display};

use async_trait::async_trait;
use uuid::Uuid;

use crate::record::{EntityKind, Epoch, IndexValue, Record};
use crate::sync::{CorruptDelta, Cursor};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordStoreError<T> {
    #[error("unhandled record store provider error: {0}")]
    Provider(#[from] T),
    #[error("record not found: {0}")]
    NotFound(Uuid),
}

/// Storage provider for one device's replicated state
///
/// `put` must be atomic per record: a reader never observes a record with
/// its indexes half-updated. Everything else is plain lookup.
#[async_trait]
pub trait RecordStore: Send + Sync + Debug + Clone + 'static {
    type Error: Display + Debug + Send;

    /// Fetch one record by id
    async fn get(
        &self,
        company_id: Uuid,
        id: Uuid,
    ) -> Result<Option<Record>, RecordStoreError<Self::Error>>;

    /// Upsert a record and its index entries atomically
    async fn put(&self, record: Record) -> Result<(), RecordStoreError<Self::Error>>;

    /// All records of a company, tombstones included
    async fn list(&self, company_id: Uuid) -> Result<Vec<Record>, RecordStoreError<Self::Error>>;

    /// Records of a company whose index field equals the given value
    ///
    /// Matches on the plaintext secondary index only; payloads stay
    /// ciphertext. Pass field `"type"` to select by kind.
    async fn query_index(
        &self,
        company_id: Uuid,
        field: &str,
        value: &IndexValue,
    ) -> Result<Vec<Record>, RecordStoreError<Self::Error>>;

    /// Records of a kind sharing a uniqueness key value
    async fn query_uniqueness_key(
        &self,
        company_id: Uuid,
        kind: EntityKind,
        key: &[(String, IndexValue)],
    ) -> Result<Vec<Record>, RecordStoreError<Self::Error>>;

    /// Up to `limit` records still encrypted below the given epoch
    ///
    /// The rotation driver drains this until empty; any deterministic
    /// order is fine.
    async fn records_below_epoch(
        &self,
        company_id: Uuid,
        epoch: Epoch,
        limit: usize,
    ) -> Result<Vec<Record>, RecordStoreError<Self::Error>>;

    /// How many records remain below the given epoch
    async fn count_below_epoch(
        &self,
        company_id: Uuid,
        epoch: Epoch,
    ) -> Result<u64, RecordStoreError<Self::Error>>;

    /// Last fully-applied relay cursor for a peer
    async fn checkpoint(
        &self,
        company_id: Uuid,
        peer: &str,
    ) -> Result<Option<Cursor>, RecordStoreError<Self::Error>>;

    /// Advance the checkpoint for a peer
    ///
    /// Callers only advance after every delta in the batch is applied or
    /// quarantined, so a crash replays the batch instead of skipping it.
    async fn set_checkpoint(
        &self,
        company_id: Uuid,
        peer: &str,
        cursor: Cursor,
    ) -> Result<(), RecordStoreError<Self::Error>>;

    /// Park a delta that failed authenticated decryption
    async fn quarantine(
        &self,
        corrupt: CorruptDelta,
    ) -> Result<(), RecordStoreError<Self::Error>>;

    /// Quarantined deltas of a company, oldest first
    async fn list_quarantine(
        &self,
        company_id: Uuid,
    ) -> Result<Vec<CorruptDelta>, RecordStoreError<Self::Error>>;
}
