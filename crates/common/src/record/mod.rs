//! # Records
//!
//! The record is the unit of replication: one transaction, one invoice, one
//! class, one access-ledger entry. A record carries:
//!
//! - **Identity**: stable UUID plus the owning company
//! - **Ciphertext**: the encrypted payload, tagged with the key epoch that
//!   produced it
//! - **Plaintext index fields**: a small, per-kind whitelist of scalars used
//!   for query routing without decryption
//! - **Causality**: a version vector plus the origin replica of the latest
//!   write, and the wall-clock `updated_at` used only for tie-breaking
//! - **Tombstone**: `deleted_at` marks soft deletion; tombstones replicate
//!   like any other update and are never physically removed
//!
//! ## Index-field boundary
//!
//! Index fields are recomputed from the decrypted payload at the boundary
//! where a device holds a valid key. Each [`EntityKind`] maps to a fixed
//! whitelist; anything not on the list stays inside the ciphertext.

mod version_vector;

pub use version_vector::{Causality, ReplicaId, VersionVector};

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Errors that can occur while encoding or decoding record payloads
#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("payload encode error: {0}")]
    Encode(String),
    #[error("payload decode error: {0}")]
    Decode(String),
}

/// A generation of the data-encryption key
///
/// Every ciphertext is tagged with the epoch that produced it. Epoch 0 is
/// the company's genesis epoch; rotation mints the next one.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct Epoch(pub u64);

impl Epoch {
    pub const GENESIS: Epoch = Epoch(0);

    pub fn next(&self) -> Epoch {
        Epoch(self.0 + 1)
    }
}

impl std::fmt::Display for Epoch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A plaintext index scalar
///
/// The only value shapes the relay and the local secondary indexes ever see.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum IndexValue {
    Str(String),
    Int(i64),
    Bool(bool),
    Id(Uuid),
}

impl std::fmt::Display for IndexValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IndexValue::Str(s) => write!(f, "{}", s),
            IndexValue::Int(i) => write!(f, "{}", i),
            IndexValue::Bool(b) => write!(f, "{}", b),
            IndexValue::Id(id) => write!(f, "{}", id),
        }
    }
}

/// Closed set of replicated record kinds
///
/// The original product's ad-hoc entity unions become an explicit tagged
/// enumeration here; the kind is itself a plaintext routing field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityKind {
    Transaction,
    Invoice,
    Bill,
    Contact,
    Account,
    Category,
    Class,
    ClassAssignment,
    /// Access-ledger entries replicate through the same machinery as data
    AccessEntry,
}

impl EntityKind {
    /// The plaintext index fields this kind is allowed to publish
    ///
    /// This is the explicit variant-to-index mapping table; it is enforced
    /// at the boundary where index fields are computed from a decrypted
    /// payload. `type` is implicit on every record.
    pub fn allowed_index_fields(&self) -> &'static [&'static str] {
        match self {
            EntityKind::Transaction => &["active", "account_id", "posted_on"],
            EntityKind::Invoice => &["active", "status", "contact_id"],
            EntityKind::Bill => &["active", "status", "contact_id"],
            EntityKind::Contact => &["active", "contact_type"],
            EntityKind::Account => &["active", "account_type"],
            EntityKind::Category => &["active", "parent_id"],
            EntityKind::Class => &["active", "parent_id"],
            EntityKind::ClassAssignment => &["active", "entity_type", "entity_id"],
            EntityKind::AccessEntry => &["event", "principal", "epoch"],
        }
    }

    /// The application-level uniqueness key for this kind, if any
    ///
    /// Uniqueness is *not* enforced by the merge algorithm; concurrent
    /// offline creation can violate it, and the sync engine reports the
    /// violation as an [`InvariantCollision`](crate::merge::InvariantCollision)
    /// for the feature layer to reconcile.
    pub fn uniqueness_key(&self) -> Option<&'static [&'static str]> {
        match self {
            EntityKind::ClassAssignment => Some(&["entity_type", "entity_id"]),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Transaction => "TRANSACTION",
            EntityKind::Invoice => "INVOICE",
            EntityKind::Bill => "BILL",
            EntityKind::Contact => "CONTACT",
            EntityKind::Account => "ACCOUNT",
            EntityKind::Category => "CATEGORY",
            EntityKind::Class => "CLASS",
            EntityKind::ClassAssignment => "CLASS_ASSIGNMENT",
            EntityKind::AccessEntry => "ACCESS_ENTRY",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The decrypted form of a record payload
///
/// Encoded with bincode before encryption. `fields` holds the typed scalar
/// fields (a subset of which becomes the plaintext index per the kind's
/// whitelist); `body` carries whatever else the feature layer stores (line
/// items, memos, amounts) as opaque bytes the sync core never interprets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlainPayload {
    pub kind: EntityKind,
    pub fields: BTreeMap<String, IndexValue>,
    pub body: Vec<u8>,
}

impl PlainPayload {
    pub fn new(kind: EntityKind) -> Self {
        Self {
            kind,
            fields: BTreeMap::new(),
            body: Vec::new(),
        }
    }

    /// Set a typed scalar field
    pub fn with_field(mut self, name: impl Into<String>, value: IndexValue) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    /// Set the opaque application body
    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    /// Encode for encryption
    pub fn encode(&self) -> Result<Vec<u8>, RecordError> {
        bincode::serialize(self).map_err(|e| RecordError::Encode(e.to_string()))
    }

    /// Decode a decrypted payload
    pub fn decode(bytes: &[u8]) -> Result<Self, RecordError> {
        bincode::deserialize(bytes).map_err(|e| RecordError::Decode(e.to_string()))
    }

    /// Compute the plaintext index fields for this payload
    ///
    /// Applies the kind's whitelist: only allowed fields cross the
    /// encryption boundary. Always includes `type`.
    pub fn index_fields(&self) -> BTreeMap<String, IndexValue> {
        let allowed = self.kind.allowed_index_fields();
        let mut index: BTreeMap<String, IndexValue> = self
            .fields
            .iter()
            .filter(|(name, _)| allowed.contains(&name.as_str()))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        index.insert(
            "type".to_string(),
            IndexValue::Str(self.kind.as_str().to_string()),
        );
        index
    }
}

/// The unit of replication
///
/// Immutable once written: updates are new versions (bumped version vector,
/// new ciphertext), never in-place mutation. Deletion is a tombstone state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Stable UUID, assigned at creation, never reused
    pub id: Uuid,
    /// The owning company
    pub company_id: Uuid,
    /// Record kind (also published as the `type` index field)
    pub kind: EntityKind,
    /// Plaintext index fields per the kind's whitelist
    pub index_fields: BTreeMap<String, IndexValue>,
    /// Encrypted payload (opaque to the relay and to the local index)
    pub payload: Vec<u8>,
    /// Which key generation encrypted this payload
    pub key_epoch: Epoch,
    /// Causal history of this record
    pub version_vector: VersionVector,
    /// Replica that produced the latest version (tie-break total order)
    pub origin: ReplicaId,
    /// Wall-clock write time; tie-break only, never the primary ordering
    pub updated_at: DateTime<Utc>,
    /// Soft-delete tombstone
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Record {
    /// True if this version carries a tombstone
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// The uniqueness-key projection of this record's index fields, if its
    /// kind declares one and all key fields are present
    pub fn uniqueness_key(&self) -> Option<Vec<(String, IndexValue)>> {
        let key_fields = self.kind.uniqueness_key()?;
        let mut key = Vec::with_capacity(key_fields.len());
        for field in key_fields {
            key.push(((*field).to_string(), self.index_fields.get(*field)?.clone()));
        }
        Some(key)
    }
}
