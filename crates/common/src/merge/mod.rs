//! Conflict resolution for record replication
//!
//! Given a local and an incoming version of the same logical record, this
//! module produces the merged version every replica will converge to.
//!
//! # Algorithm
//!
//! 1. Compare version vectors. If one side dominates, it wins outright —
//!    that version is causally later and no resolution is needed.
//! 2. If the vectors are equal but the content differs (re-encryption after
//!    a key rotation rewrites ciphertext without minting a new version),
//!    the higher key epoch wins, ties broken by payload byte order, so
//!    every replica converges on the same ciphertext.
//! 3. If the versions are concurrent:
//!    - the merged version vector is the pointwise-maximum union
//!    - the payload is decided last-write-wins on `updated_at`, ties broken
//!      by the fixed total order on the origin [`ReplicaId`], so every
//!      replica picks the same winner regardless of merge order
//!    - tombstones are sticky: a concurrent plaintext write that does not
//!      postdate the tombstone loses to it; a strictly newer write
//!      un-deletes the record (explicit restore semantics)
//!
//! Resolution is whole-payload: concurrent edits to different logical
//! fields of one record are not merged field-by-field, because the payload
//! is ciphertext everywhere except on a device that holds the epoch key.
//!
//! Application-level uniqueness invariants (e.g. one class assignment per
//! entity) are *not* enforced here; see [`InvariantCollision`] for how the
//! sync engine surfaces them.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::record::{Causality, EntityKind, IndexValue, Record};

/// Which side supplied the surviving payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Winner {
    Local,
    Incoming,
}

/// How a merge was decided
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeDecision {
    /// The incoming version is causally equal to or older than the local
    /// one; the local record is already current.
    AlreadyCurrent,
    /// The incoming version causally dominates; taken wholesale.
    FastForward,
    /// The versions were concurrent and resolved deterministically.
    Resolved {
        winner: Winner,
        /// True when the sticky-tombstone rule overrode last-write-wins
        tombstone_won: bool,
    },
}

/// Result of merging an incoming version against the local one
#[derive(Debug, Clone)]
pub struct Merged {
    pub record: Record,
    pub decision: MergeDecision,
}

impl Merged {
    /// True if the merge changed the locally stored version
    pub fn changed_local(&self) -> bool {
        !matches!(self.decision, MergeDecision::AlreadyCurrent)
    }
}

/// A merge outcome where two causally-concurrent records each satisfy an
/// application-level uniqueness rule but jointly violate it
///
/// E.g. two offline devices both create a `ClassAssignment` for the same
/// `(entity_type, entity_id)`. Both records are kept; the collision is
/// surfaced as data for the feature layer to reconcile (keep the causally
/// later assignment, tombstone the other). Never thrown as an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvariantCollision {
    pub company_id: Uuid,
    pub kind: EntityKind,
    /// The uniqueness-key fields both records share
    pub key: Vec<(String, IndexValue)>,
    /// Both colliding record ids, sorted for determinism
    pub record_ids: [Uuid; 2],
}

impl InvariantCollision {
    pub fn new(
        company_id: Uuid,
        kind: EntityKind,
        key: Vec<(String, IndexValue)>,
        a: Uuid,
        b: Uuid,
    ) -> Self {
        let record_ids = if a <= b { [a, b] } else { [b, a] };
        Self {
            company_id,
            kind,
            key,
            record_ids,
        }
    }
}

/// Compare two concurrent versions for last-write-wins
///
/// Lexicographic on `(updated_at, origin)`. The origin replica id supplies
/// the fixed total order for identical timestamps.
fn incoming_wins_lww(local: &Record, incoming: &Record) -> bool {
    (incoming.updated_at, incoming.origin) > (local.updated_at, local.origin)
}

/// Merge an incoming record version against the local version
///
/// Both records must share the same `id`; the caller (sync engine) is
/// responsible for routing. The returned record carries the union version
/// vector, so it dominates both inputs (merge is monotone) and re-merging
/// either input is a no-op (merge is idempotent).
pub fn merge(local: &Record, incoming: &Record) -> Merged {
    debug_assert_eq!(local.id, incoming.id);

    match local.version_vector.causality(&incoming.version_vector) {
        Causality::Equal => resolve_equal(local, incoming),
        Causality::LeftDominates => Merged {
            record: local.clone(),
            decision: MergeDecision::AlreadyCurrent,
        },
        Causality::RightDominates => {
            let mut record = incoming.clone();
            record.version_vector = local.version_vector.merge(&incoming.version_vector);
            Merged {
                record,
                decision: MergeDecision::FastForward,
            }
        }
        Causality::Concurrent => resolve_concurrent(local, incoming),
    }
}

/// Resolve two versions with equal vectors but different bytes
///
/// Normally equal vectors mean an identical record. The exception is
/// re-encryption after a key rotation, which rewrites the ciphertext in
/// place; the rewritten copy carries a higher key epoch and must replace
/// the stale ciphertext on every replica. Byte order breaks the remaining
/// ties so the pick is the same regardless of which side is local.
fn resolve_equal(local: &Record, incoming: &Record) -> Merged {
    if (incoming.key_epoch, &incoming.payload) > (local.key_epoch, &local.payload) {
        Merged {
            record: incoming.clone(),
            decision: MergeDecision::Resolved {
                winner: Winner::Incoming,
                tombstone_won: false,
            },
        }
    } else {
        Merged {
            record: local.clone(),
            decision: MergeDecision::AlreadyCurrent,
        }
    }
}

fn resolve_concurrent(local: &Record, incoming: &Record) -> Merged {
    let union = local.version_vector.merge(&incoming.version_vector);

    let (mut winner, mut loser) = if incoming_wins_lww(local, incoming) {
        (Winner::Incoming, Winner::Local)
    } else {
        (Winner::Local, Winner::Incoming)
    };

    // Sticky tombstone: if the losing side is deleted and the winning write
    // does not postdate the deletion, the tombstone survives. A strictly
    // newer write restores the record.
    let mut tombstone_won = false;
    let (winner_rec, loser_rec) = match winner {
        Winner::Local => (local, incoming),
        Winner::Incoming => (incoming, local),
    };
    if !winner_rec.is_deleted() {
        if let Some(deleted_at) = loser_rec.deleted_at {
            if winner_rec.updated_at <= deleted_at {
                std::mem::swap(&mut winner, &mut loser);
                tombstone_won = true;
            }
        }
    }

    let mut record = match winner {
        Winner::Local => local.clone(),
        Winner::Incoming => incoming.clone(),
    };
    record.version_vector = union;

    Merged {
        record,
        decision: MergeDecision::Resolved {
            winner,
            tombstone_won,
        },
    }
}
