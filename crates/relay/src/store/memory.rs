//! In-memory delta store, for tests and ephemeral relays

use std::collections::{BTreeMap, HashMap};
use std::convert::Infallible;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use uuid::Uuid;

use common::keyring::KeyringBundle;
use common::sync::{Cursor, EncryptedDelta, GrantWindow};

use super::{DeltaStore, DeltaStoreError, RawPage};

/// Never constructed; the memory store cannot fail
pub type MemoryDeltaStoreError = Infallible;

#[derive(Debug, Default)]
struct CompanyStream {
    /// Cursor of entry at index i is i + 1
    deltas: Vec<EncryptedDelta>,
    windows: BTreeMap<String, GrantWindow>,
    keyring: Option<KeyringBundle>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryDeltaStore {
    streams: Arc<RwLock<HashMap<Uuid, CompanyStream>>>,
}

impl MemoryDeltaStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeltaStore for MemoryDeltaStore {
    type Error = MemoryDeltaStoreError;

    async fn append(
        &self,
        company_id: Uuid,
        deltas: Vec<EncryptedDelta>,
    ) -> Result<Cursor, DeltaStoreError<Self::Error>> {
        let mut streams = self.streams.write();
        let stream = streams.entry(company_id).or_default();
        stream.deltas.extend(deltas);
        Ok(Cursor(stream.deltas.len() as u64))
    }

    async fn page(
        &self,
        company_id: Uuid,
        after: Option<Cursor>,
        limit: usize,
    ) -> Result<RawPage, DeltaStoreError<Self::Error>> {
        let streams = self.streams.read();
        let Some(stream) = streams.get(&company_id) else {
            return Ok(RawPage {
                entries: Vec::new(),
                more: false,
            });
        };
        let start = after.unwrap_or_default().0 as usize;
        let entries: Vec<(Cursor, EncryptedDelta)> = stream
            .deltas
            .iter()
            .enumerate()
            .skip(start)
            .take(limit)
            .map(|(offset, delta)| (Cursor(offset as u64 + 1), delta.clone()))
            .collect();
        let more = start + entries.len() < stream.deltas.len();
        Ok(RawPage { entries, more })
    }

    async fn delta_count(
        &self,
        company_id: Uuid,
    ) -> Result<u64, DeltaStoreError<Self::Error>> {
        let streams = self.streams.read();
        Ok(streams
            .get(&company_id)
            .map(|stream| stream.deltas.len() as u64)
            .unwrap_or(0))
    }

    async fn window(
        &self,
        company_id: Uuid,
        principal: &str,
    ) -> Result<Option<GrantWindow>, DeltaStoreError<Self::Error>> {
        let streams = self.streams.read();
        Ok(streams
            .get(&company_id)
            .and_then(|stream| stream.windows.get(principal).copied()))
    }

    async fn put_window(
        &self,
        company_id: Uuid,
        principal: &str,
        window: GrantWindow,
    ) -> Result<(), DeltaStoreError<Self::Error>> {
        let mut streams = self.streams.write();
        streams
            .entry(company_id)
            .or_default()
            .windows
            .insert(principal.to_string(), window);
        Ok(())
    }

    async fn windows(
        &self,
        company_id: Uuid,
    ) -> Result<BTreeMap<String, GrantWindow>, DeltaStoreError<Self::Error>> {
        let streams = self.streams.read();
        Ok(streams
            .get(&company_id)
            .map(|stream| stream.windows.clone())
            .unwrap_or_default())
    }

    async fn put_keyring(
        &self,
        company_id: Uuid,
        bundle: KeyringBundle,
    ) -> Result<(), DeltaStoreError<Self::Error>> {
        let mut streams = self.streams.write();
        streams.entry(company_id).or_default().keyring = Some(bundle);
        Ok(())
    }

    async fn get_keyring(
        &self,
        company_id: Uuid,
    ) -> Result<Option<KeyringBundle>, DeltaStoreError<Self::Error>> {
        let streams = self.streams.read();
        Ok(streams
            .get(&company_id)
            .and_then(|stream| stream.keyring.clone()))
    }

    async fn ready(&self) -> Result<(), DeltaStoreError<Self::Error>> {
        Ok(())
    }
}
