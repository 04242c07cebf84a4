use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use uuid::Uuid;

use super::{RecordStore, RecordStoreError};
use crate::record::{EntityKind, Epoch, IndexValue, Record};
use crate::sync::{CorruptDelta, Cursor};

/// In-memory record store using HashMaps
///
/// The reference provider: tests and single-process replicas use it
/// directly, and it documents the semantics a persistent provider must
/// reproduce.
#[derive(Debug, Clone, Default)]
pub struct MemoryRecordStore {
    inner: Arc<RwLock<MemoryRecordStoreInner>>,
}

#[derive(Debug, Default)]
struct MemoryRecordStoreInner {
    /// company_id -> record_id -> record
    records: HashMap<Uuid, HashMap<Uuid, Record>>,
    /// (company_id, field, value) -> record ids
    index: HashMap<(Uuid, String, IndexValue), BTreeSet<Uuid>>,
    /// (company_id, peer) -> last applied cursor
    checkpoints: HashMap<(Uuid, String), Cursor>,
    /// company_id -> quarantined deltas, in arrival order
    quarantine: HashMap<Uuid, Vec<CorruptDelta>>,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryRecordStoreError {
    #[error("memory store error: {0}")]
    Internal(String),
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MemoryRecordStoreInner {
    fn unindex(&mut self, record: &Record) {
        for (field, value) in &record.index_fields {
            if let Some(ids) = self
                .index
                .get_mut(&(record.company_id, field.clone(), value.clone()))
            {
                ids.remove(&record.id);
            }
        }
    }

    fn index(&mut self, record: &Record) {
        for (field, value) in &record.index_fields {
            self.index
                .entry((record.company_id, field.clone(), value.clone()))
                .or_default()
                .insert(record.id);
        }
    }
}

fn lock_err(e: impl std::fmt::Display) -> RecordStoreError<MemoryRecordStoreError> {
    RecordStoreError::Provider(MemoryRecordStoreError::Internal(format!(
        "failed to acquire lock: {}",
        e
    )))
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    type Error = MemoryRecordStoreError;

    async fn get(
        &self,
        company_id: Uuid,
        id: Uuid,
    ) -> Result<Option<Record>, RecordStoreError<Self::Error>> {
        let inner = self.inner.read().map_err(lock_err)?;
        Ok(inner
            .records
            .get(&company_id)
            .and_then(|records| records.get(&id))
            .cloned())
    }

    async fn put(&self, record: Record) -> Result<(), RecordStoreError<Self::Error>> {
        let mut inner = self.inner.write().map_err(lock_err)?;

        if let Some(previous) = inner
            .records
            .get(&record.company_id)
            .and_then(|records| records.get(&record.id))
            .cloned()
        {
            inner.unindex(&previous);
        }
        inner.index(&record);
        inner
            .records
            .entry(record.company_id)
            .or_default()
            .insert(record.id, record);
        Ok(())
    }

    async fn list(&self, company_id: Uuid) -> Result<Vec<Record>, RecordStoreError<Self::Error>> {
        let inner = self.inner.read().map_err(lock_err)?;
        Ok(inner
            .records
            .get(&company_id)
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn query_index(
        &self,
        company_id: Uuid,
        field: &str,
        value: &IndexValue,
    ) -> Result<Vec<Record>, RecordStoreError<Self::Error>> {
        let inner = self.inner.read().map_err(lock_err)?;
        let Some(ids) = inner
            .index
            .get(&(company_id, field.to_string(), value.clone()))
        else {
            return Ok(Vec::new());
        };
        let Some(records) = inner.records.get(&company_id) else {
            return Ok(Vec::new());
        };
        Ok(ids
            .iter()
            .filter_map(|id| records.get(id))
            .cloned()
            .collect())
    }

    async fn query_uniqueness_key(
        &self,
        company_id: Uuid,
        kind: EntityKind,
        key: &[(String, IndexValue)],
    ) -> Result<Vec<Record>, RecordStoreError<Self::Error>> {
        let inner = self.inner.read().map_err(lock_err)?;
        let Some(records) = inner.records.get(&company_id) else {
            return Ok(Vec::new());
        };
        Ok(records
            .values()
            .filter(|r| {
                r.kind == kind
                    && key.iter().all(|(field, value)| {
                        r.index_fields.get(field) == Some(value)
                    })
            })
            .cloned()
            .collect())
    }

    async fn records_below_epoch(
        &self,
        company_id: Uuid,
        epoch: Epoch,
        limit: usize,
    ) -> Result<Vec<Record>, RecordStoreError<Self::Error>> {
        let inner = self.inner.read().map_err(lock_err)?;
        let Some(records) = inner.records.get(&company_id) else {
            return Ok(Vec::new());
        };
        let mut below: Vec<Record> = records
            .values()
            .filter(|r| r.key_epoch < epoch)
            .cloned()
            .collect();
        below.sort_by_key(|r| r.id);
        below.truncate(limit);
        Ok(below)
    }

    async fn count_below_epoch(
        &self,
        company_id: Uuid,
        epoch: Epoch,
    ) -> Result<u64, RecordStoreError<Self::Error>> {
        let inner = self.inner.read().map_err(lock_err)?;
        Ok(inner
            .records
            .get(&company_id)
            .map(|records| records.values().filter(|r| r.key_epoch < epoch).count() as u64)
            .unwrap_or(0))
    }

    async fn checkpoint(
        &self,
        company_id: Uuid,
        peer: &str,
    ) -> Result<Option<Cursor>, RecordStoreError<Self::Error>> {
        let inner = self.inner.read().map_err(lock_err)?;
        Ok(inner.checkpoints.get(&(company_id, peer.to_string())).copied())
    }

    async fn set_checkpoint(
        &self,
        company_id: Uuid,
        peer: &str,
        cursor: Cursor,
    ) -> Result<(), RecordStoreError<Self::Error>> {
        let mut inner = self.inner.write().map_err(lock_err)?;
        inner
            .checkpoints
            .insert((company_id, peer.to_string()), cursor);
        Ok(())
    }

    async fn quarantine(
        &self,
        corrupt: CorruptDelta,
    ) -> Result<(), RecordStoreError<Self::Error>> {
        let mut inner = self.inner.write().map_err(lock_err)?;
        inner
            .quarantine
            .entry(corrupt.delta.company_id)
            .or_default()
            .push(corrupt);
        Ok(())
    }

    async fn list_quarantine(
        &self,
        company_id: Uuid,
    ) -> Result<Vec<CorruptDelta>, RecordStoreError<Self::Error>> {
        let inner = self.inner.read().map_err(lock_err)?;
        Ok(inner.quarantine.get(&company_id).cloned().unwrap_or_default())
    }
}
