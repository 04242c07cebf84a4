pub mod crypto;
/**
 * Key epoch management.
 *  Envelopes of wrapped data keys per epoch,
 *  rotation, and the resumable re-encryption
 *  driver.
 */
pub mod keyring;
/**
 * The append-only access ledger.
 *  Signed grant/revoke/rotate entries and their
 *  deterministic replay into access state.
 */
pub mod ledger;
/**
 * Conflict resolution.
 *  Version-vector dominance, last-write-wins
 *  tie-break, sticky tombstones, and uniqueness
 *  collision surfacing.
 */
pub mod merge;
/**
 * Common record types: version vectors, key
 *  epochs, entity kinds and their index-field
 *  whitelists, encrypted records.
 */
pub mod record;
/**
 * Storage layer abstraction for encrypted
 *  records, secondary indexes, checkpoints,
 *  and the quarantine.
 */
pub mod store;
/**
 * Delta replication through an untrusted relay.
 */
pub mod sync;
/**
 * In-process fixtures for integration tests.
 */
pub mod testkit;

pub mod prelude {
    pub use crate::crypto::{DataKey, MasterKey, PublicKey, SecretKey};
    pub use crate::keyring::{Keyring, KeyringBundle, KeyringError};
    pub use crate::ledger::{AccessLedger, LedgerEntry, LedgerEvent, Scope};
    pub use crate::merge::{merge, InvariantCollision, MergeDecision};
    pub use crate::record::{
        EntityKind, Epoch, IndexValue, PlainPayload, Record, ReplicaId, VersionVector,
    };
    pub use crate::store::{MemoryRecordStore, RecordStore};
    pub use crate::sync::{EncryptedDelta, MemoryRelay, RelayTransport, SyncEngine};
}
