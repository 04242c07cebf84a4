//! Wire types for replication
//!
//! A delta is the only thing that ever leaves a device: ciphertext plus the
//! plaintext routing envelope (ids, kind, epoch, version vector, index
//! fields). The relay stores and forwards deltas without any key material.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::{base64::Base64, serde_as};
use uuid::Uuid;

use crate::record::{EntityKind, Epoch, IndexValue, Record, ReplicaId, VersionVector};

/// Relay-assigned position in a company's delta stream
///
/// Cursors are opaque to devices: monotone per company, comparable only
/// against cursors from the same relay. A checkpoint is just the last
/// cursor a device has fully applied.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct Cursor(pub u64);

impl Cursor {
    pub fn next(&self) -> Cursor {
        Cursor(self.0 + 1)
    }
}

impl std::fmt::Display for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One replicated record change
///
/// Field-for-field the same shape as [`Record`]; the split exists so the
/// wire format (base64 payload in JSON, explicit delta vocabulary) can
/// evolve apart from local storage.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncryptedDelta {
    pub record_id: Uuid,
    pub company_id: Uuid,
    pub kind: EntityKind,
    pub key_epoch: Epoch,
    pub version_vector: VersionVector,
    /// Plaintext index fields, whitelisted per kind
    pub index_fields: BTreeMap<String, IndexValue>,
    /// AEAD ciphertext of the record payload
    #[serde_as(as = "Base64")]
    pub payload: Vec<u8>,
    /// Replica that produced this version (LWW tie-break)
    pub origin: ReplicaId,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl From<Record> for EncryptedDelta {
    fn from(record: Record) -> Self {
        Self {
            record_id: record.id,
            company_id: record.company_id,
            kind: record.kind,
            key_epoch: record.key_epoch,
            version_vector: record.version_vector,
            index_fields: record.index_fields,
            payload: record.payload,
            origin: record.origin,
            updated_at: record.updated_at,
            deleted_at: record.deleted_at,
        }
    }
}

impl EncryptedDelta {
    pub fn into_record(self) -> Record {
        Record {
            id: self.record_id,
            company_id: self.company_id,
            kind: self.kind,
            index_fields: self.index_fields,
            payload: self.payload,
            key_epoch: self.key_epoch,
            version_vector: self.version_vector,
            origin: self.origin,
            updated_at: self.updated_at,
            deleted_at: self.deleted_at,
        }
    }
}

/// A delta that failed authenticated decryption
///
/// Quarantined verbatim instead of applied: the ciphertext did not match
/// its epoch key, so either the relay or a peer handed us garbage. Kept
/// for operator inspection, never merged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorruptDelta {
    pub delta: EncryptedDelta,
    /// Peer or relay identifier the delta arrived from
    pub source: String,
    pub received_at: DateTime<Utc>,
    pub reason: String,
}
