//! Delta storage providers for the relay
//!
//! The relay stores delta streams blind: the body column is the JSON wire
//! form of an [`EncryptedDelta`], never opened beyond its plaintext
//! envelope. Providers also persist the per-principal grant windows the
//! policy layer replays from ledger deltas, and the latest keyring bundle
//! per company.

mod memory;
mod sqlite;

pub use memory::{MemoryDeltaStore, MemoryDeltaStoreError};
pub use sqlite::SqliteDeltaStore;

use std::collections::BTreeMap;
use std::fmt::{Debug, Display};

use async_trait::async_trait;
use uuid::Uuid;

use common::keyring::KeyringBundle;
use common::sync::{Cursor, EncryptedDelta, GrantWindow};

#[derive(thiserror::Error, Debug)]
pub enum DeltaStoreError<T> {
    #[error("unhandled delta store provider error: {0}")]
    Provider(#[from] T),
    /// A stored row no longer parses as the wire type it was written as
    #[error("stored value could not be decoded: {0}")]
    Codec(String),
}

/// One raw page of a company's stream, unfiltered
///
/// Entries carry their assigned cursor so the policy layer can report a
/// `next` checkpoint even when it filters every delta out.
#[derive(Debug, Clone, PartialEq)]
pub struct RawPage {
    pub entries: Vec<(Cursor, EncryptedDelta)>,
    pub more: bool,
}

/// Storage provider for the relay
///
/// `append` must assign cursors contiguously per company and be atomic for
/// the whole batch; a reader never observes a partially-appended batch.
#[async_trait]
pub trait DeltaStore: Send + Sync + Debug + Clone + 'static {
    type Error: Display + Debug + Send;

    /// Append a batch to a company's stream; returns the last cursor used
    async fn append(
        &self,
        company_id: Uuid,
        deltas: Vec<EncryptedDelta>,
    ) -> Result<Cursor, DeltaStoreError<Self::Error>>;

    /// Up to `limit` deltas strictly after the given cursor, in order
    async fn page(
        &self,
        company_id: Uuid,
        after: Option<Cursor>,
        limit: usize,
    ) -> Result<RawPage, DeltaStoreError<Self::Error>>;

    /// Number of deltas stored for a company
    async fn delta_count(&self, company_id: Uuid)
        -> Result<u64, DeltaStoreError<Self::Error>>;

    /// Grant window for one principal (hex public key)
    async fn window(
        &self,
        company_id: Uuid,
        principal: &str,
    ) -> Result<Option<GrantWindow>, DeltaStoreError<Self::Error>>;

    /// Upsert a principal's grant window
    async fn put_window(
        &self,
        company_id: Uuid,
        principal: &str,
        window: GrantWindow,
    ) -> Result<(), DeltaStoreError<Self::Error>>;

    /// All grant windows for a company, keyed by principal hex
    async fn windows(
        &self,
        company_id: Uuid,
    ) -> Result<BTreeMap<String, GrantWindow>, DeltaStoreError<Self::Error>>;

    /// Replace the stored keyring bundle
    async fn put_keyring(
        &self,
        company_id: Uuid,
        bundle: KeyringBundle,
    ) -> Result<(), DeltaStoreError<Self::Error>>;

    /// The stored keyring bundle, if any
    async fn get_keyring(
        &self,
        company_id: Uuid,
    ) -> Result<Option<KeyringBundle>, DeltaStoreError<Self::Error>>;

    /// Cheap liveness probe for the readiness endpoint
    async fn ready(&self) -> Result<(), DeltaStoreError<Self::Error>>;
}
