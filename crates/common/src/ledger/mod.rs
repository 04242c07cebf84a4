//! # Access ledger
//!
//! An append-only, locally-mergeable log of grants, revocations, and key
//! rotations. Every device replays the ledger to know which key epoch it
//! may decrypt and which principals currently hold access.
//!
//! Entries replicate through the same record machinery as data (they carry
//! version vectors and merge with the same resolver), with two deliberate
//! differences:
//!
//! - entries are **signed plaintext**, not ciphertext: they carry no
//!   financial data, and a freshly-granted principal must be able to replay
//!   the ledger before it holds any epoch key
//! - entries are **immutable once written**: revocation supersedes a grant,
//!   it never rewrites one
//!
//! State machine per grant instance: `NONE → GRANTED → REVOKED`, with
//! `REVOKED` terminal. A new grant for the same principal is a new instance,
//! never an un-revoke.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::{PublicKey, SecretKey};
use crate::record::{EntityKind, Epoch, IndexValue, Record, ReplicaId, VersionVector};

/// Errors that can occur while recording or replaying ledger entries
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("ledger error: {0}")]
    Default(#[from] anyhow::Error),
    /// Entry signature does not verify against its issuer key
    #[error("entry {0} failed signature verification")]
    BadSignature(Uuid),
    /// The requester lacks authority for the requested scope
    #[error("scope too broad: {0}")]
    ScopeTooBroad(String),
    #[error("record error: {0}")]
    Record(#[from] crate::record::RecordError),
}

/// What a grant covers
///
/// `Full` is owner-level access to everything. Scoped grants limit by
/// record kind or by time; both narrow what gets decrypted, not what gets
/// replicated (ciphertext still syncs everywhere).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Scope {
    Full,
    Kinds(BTreeSet<EntityKind>),
    From(DateTime<Utc>),
}

impl Scope {
    pub fn is_full(&self) -> bool {
        matches!(self, Scope::Full)
    }

    /// True if the scope covers records of the given kind
    pub fn covers_kind(&self, kind: &EntityKind) -> bool {
        match self {
            Scope::Full | Scope::From(_) => true,
            Scope::Kinds(kinds) => kinds.contains(kind),
        }
    }
}

/// One access-control fact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LedgerEvent {
    /// A principal was granted decrypt access from an epoch onward
    Granted {
        principal: PublicKey,
        scope: Scope,
        epoch_from: Epoch,
    },
    /// A principal's access was revoked. `full` revocations cover every
    /// scope and trigger an automatic rotation; partial revocations only
    /// narrow future grants.
    Revoked { principal: PublicKey, full: bool },
    /// A new key epoch was minted
    Rotated { new_epoch: Epoch },
}

impl LedgerEvent {
    fn label(&self) -> &'static str {
        match self {
            LedgerEvent::Granted { .. } => "GRANTED",
            LedgerEvent::Revoked { .. } => "REVOKED",
            LedgerEvent::Rotated { .. } => "ROTATED",
        }
    }

    fn principal(&self) -> Option<&PublicKey> {
        match self {
            LedgerEvent::Granted { principal, .. } | LedgerEvent::Revoked { principal, .. } => {
                Some(principal)
            }
            LedgerEvent::Rotated { .. } => None,
        }
    }

    fn epoch(&self) -> Option<Epoch> {
        match self {
            LedgerEvent::Granted { epoch_from, .. } => Some(*epoch_from),
            LedgerEvent::Rotated { new_epoch } => Some(*new_epoch),
            LedgerEvent::Revoked { .. } => None,
        }
    }
}

/// A signed, append-only ledger entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub company_id: Uuid,
    /// The principal that issued (and signed) this entry
    pub issuer: PublicKey,
    pub event: LedgerEvent,
    pub created_at: DateTime<Utc>,
    /// Detached Ed25519 signature over the entry body
    pub signature: Vec<u8>,
}

impl LedgerEntry {
    /// Canonical bytes covered by the signature
    fn signable_bytes(
        id: &Uuid,
        company_id: &Uuid,
        issuer: &PublicKey,
        event: &LedgerEvent,
        created_at: &DateTime<Utc>,
    ) -> Result<Vec<u8>, LedgerError> {
        bincode::serialize(&(id, company_id, issuer, event, created_at))
            .map_err(|e| anyhow::anyhow!("ledger entry encode error: {}", e).into())
    }

    /// Create and sign a new entry
    pub fn sign(
        company_id: Uuid,
        issuer: &SecretKey,
        event: LedgerEvent,
        created_at: DateTime<Utc>,
    ) -> Result<Self, LedgerError> {
        let id = Uuid::new_v4();
        let issuer_pub = issuer.public();
        let bytes = Self::signable_bytes(&id, &company_id, &issuer_pub, &event, &created_at)?;
        let signature = issuer.sign(&bytes).to_bytes().to_vec();
        Ok(Self {
            id,
            company_id,
            issuer: issuer_pub,
            event,
            created_at,
            signature,
        })
    }

    /// Verify the entry signature against its issuer key
    pub fn verify(&self) -> Result<(), LedgerError> {
        let bytes = Self::signable_bytes(
            &self.id,
            &self.company_id,
            &self.issuer,
            &self.event,
            &self.created_at,
        )?;
        let sig_bytes: [u8; 64] = self
            .signature
            .as_slice()
            .try_into()
            .map_err(|_| LedgerError::BadSignature(self.id))?;
        let signature = ed25519_dalek::Signature::from_bytes(&sig_bytes);
        self.issuer
            .verify(&bytes, &signature)
            .map_err(|_| LedgerError::BadSignature(self.id))
    }

    /// Wrap this entry as a replicable record
    ///
    /// The payload is the bincode-encoded entry (plaintext; integrity comes
    /// from the signature). The index fields expose event kind, principal,
    /// and epoch so the relay can derive grant windows without any key.
    pub fn to_record(&self, origin: ReplicaId, version_vector: VersionVector) -> Result<Record, LedgerError> {
        let payload = bincode::serialize(self)
            .map_err(|e| anyhow::anyhow!("ledger entry encode error: {}", e))?;

        let mut index_fields = BTreeMap::new();
        index_fields.insert(
            "type".to_string(),
            IndexValue::Str(EntityKind::AccessEntry.as_str().to_string()),
        );
        index_fields.insert(
            "event".to_string(),
            IndexValue::Str(self.event.label().to_string()),
        );
        if let Some(principal) = self.event.principal() {
            index_fields.insert(
                "principal".to_string(),
                IndexValue::Str(principal.to_hex()),
            );
        }
        if let Some(epoch) = self.event.epoch() {
            index_fields.insert("epoch".to_string(), IndexValue::Int(epoch.0 as i64));
        }

        Ok(Record {
            id: self.id,
            company_id: self.company_id,
            kind: EntityKind::AccessEntry,
            index_fields,
            payload,
            key_epoch: Epoch::GENESIS,
            version_vector,
            origin,
            updated_at: self.created_at,
            deleted_at: None,
        })
    }

    /// Decode an entry from a replicated record
    pub fn from_record(record: &Record) -> Result<Self, LedgerError> {
        bincode::deserialize(&record.payload)
            .map_err(|e| anyhow::anyhow!("ledger entry decode error: {}", e).into())
    }
}

/// State of one grant instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GrantState {
    Granted,
    Revoked,
}

/// A view-key grant as derived from the ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewKeyGrant {
    /// The ledger entry that created this grant instance
    pub entry_id: Uuid,
    pub principal: PublicKey,
    pub scope: Scope,
    pub granted_epoch_from: Epoch,
    pub granted_at: DateTime<Utc>,
    /// Null while active; set by the revocation entry that superseded it
    pub revoked_at: Option<DateTime<Utc>>,
}

impl ViewKeyGrant {
    pub fn state(&self) -> GrantState {
        if self.revoked_at.is_some() {
            GrantState::Revoked
        } else {
            GrantState::Granted
        }
    }

    /// True if this grant currently permits decrypting records at `epoch`
    pub fn covers_epoch(&self, epoch: Epoch) -> bool {
        self.revoked_at.is_none() && epoch >= self.granted_epoch_from
    }
}

/// The replayed access-control state of one company
#[derive(Debug, Clone, Default)]
pub struct AccessState {
    /// All grant instances, in replay order
    pub grants: Vec<ViewKeyGrant>,
    /// Rotation history, in replay order
    pub rotations: Vec<Epoch>,
    /// Entries that failed verification or authorization, by id
    pub rejected: Vec<Uuid>,
}

impl AccessState {
    /// Principals holding an active full-scope grant
    pub fn owners(&self) -> BTreeSet<PublicKey> {
        self.grants
            .iter()
            .filter(|g| g.revoked_at.is_none() && g.scope.is_full())
            .map(|g| g.principal)
            .collect()
    }

    /// True if the principal may decrypt records at the given epoch
    pub fn can_decrypt(&self, principal: &PublicKey, epoch: Epoch) -> bool {
        self.grants
            .iter()
            .any(|g| g.principal == *principal && g.covers_epoch(epoch))
    }

    /// Active (non-revoked) grants for a principal
    pub fn active_grants(&self, principal: &PublicKey) -> Vec<&ViewKeyGrant> {
        self.grants
            .iter()
            .filter(|g| g.principal == *principal && g.revoked_at.is_none())
            .collect()
    }
}

/// Build a signed revocation request for a principal
///
/// Any device can sign a request; whether it takes effect is decided by
/// replay authorization like every other entry. Owner devices revoking
/// through the keyring additionally withhold future epoch keys, which a
/// bare ledger entry cannot do.
pub fn request_revocation(
    company_id: Uuid,
    issuer: &SecretKey,
    principal: PublicKey,
    full: bool,
    requested_at: DateTime<Utc>,
) -> Result<LedgerEntry, LedgerError> {
    LedgerEntry::sign(
        company_id,
        issuer,
        LedgerEvent::Revoked { principal, full },
        requested_at,
    )
}

/// The mergeable access ledger of one company
///
/// Entries are keyed by id; merging two ledgers is a set union, because an
/// entry is immutable once written. Replay is deterministic: entries are
/// ordered by `(created_at, issuer, id)` before application, so every
/// replica derives the same [`AccessState`] from the same entry set.
#[derive(Debug, Clone, Default)]
pub struct AccessLedger {
    entries: BTreeMap<Uuid, LedgerEntry>,
}

impl AccessLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entry if unseen, verifying its signature first
    ///
    /// Returns true if the entry was new. Entries with bad signatures are
    /// rejected; the caller decides whether to quarantine.
    pub fn insert(&mut self, entry: LedgerEntry) -> Result<bool, LedgerError> {
        entry.verify()?;
        Ok(self.entries.insert(entry.id, entry).is_none())
    }

    pub fn entries(&self) -> impl Iterator<Item = &LedgerEntry> {
        self.entries.values()
    }

    /// Every grant instance with its replayed state, in replay order
    ///
    /// The admin surface over the ledger: who holds (or held) access, under
    /// what scope, from which epoch, revoked when.
    pub fn list_grants(&self) -> Vec<ViewKeyGrant> {
        self.replay().grants
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Replay the ledger into an access state
    ///
    /// Authorization rules applied during replay, in deterministic order:
    /// - the first grant of an empty ledger must be self-issued
    ///   (`issuer == principal`, full scope): the company genesis
    /// - later grants and all revocations/rotations must be issued by a
    ///   principal holding an active full-scope grant at that point
    /// - unauthorized entries are skipped and recorded in `rejected`
    pub fn replay(&self) -> AccessState {
        let mut ordered: Vec<&LedgerEntry> = self.entries.values().collect();
        ordered.sort_by(|a, b| {
            (a.created_at, a.issuer, a.id).cmp(&(b.created_at, b.issuer, b.id))
        });

        let mut state = AccessState::default();

        for entry in ordered {
            let owners = state.owners();
            let is_genesis = state.grants.is_empty() && owners.is_empty();
            let authorized = match &entry.event {
                LedgerEvent::Granted { principal, scope, .. } => {
                    if is_genesis {
                        entry.issuer == *principal && scope.is_full()
                    } else {
                        owners.contains(&entry.issuer)
                    }
                }
                _ => owners.contains(&entry.issuer),
            };

            if !authorized {
                tracing::warn!(
                    entry = %entry.id,
                    issuer = %entry.issuer,
                    "skipping unauthorized ledger entry"
                );
                state.rejected.push(entry.id);
                continue;
            }

            match &entry.event {
                LedgerEvent::Granted {
                    principal,
                    scope,
                    epoch_from,
                } => {
                    state.grants.push(ViewKeyGrant {
                        entry_id: entry.id,
                        principal: *principal,
                        scope: scope.clone(),
                        granted_epoch_from: *epoch_from,
                        granted_at: entry.created_at,
                        revoked_at: None,
                    });
                }
                LedgerEvent::Revoked { principal, full } => {
                    for grant in state
                        .grants
                        .iter_mut()
                        .filter(|g| g.principal == *principal && g.revoked_at.is_none())
                    {
                        // Partial revocation narrows everything that is not
                        // a full-scope grant; full revocation ends them all.
                        if *full || !grant.scope.is_full() {
                            grant.revoked_at = Some(entry.created_at);
                        }
                    }
                }
                LedgerEvent::Rotated { new_epoch } => {
                    state.rotations.push(*new_epoch);
                }
            }
        }

        state
    }
}
