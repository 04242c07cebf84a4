//! Test fixtures: in-process replicas wired to a shared memory relay
//!
//! A [`TestNetwork`] is one company with one shared relay; each
//! [`TestReplica`] is an independent device (own keypair, own store, own
//! replica id) syncing through it. Owner devices share the company master
//! key, viewers hold only their keypair.

use chrono::Utc;
use uuid::Uuid;

use crate::crypto::{MasterKey, PublicKey, SecretKey, MASTER_KEY_SIZE};
use crate::keyring::{Keyring, KeyringBundle};
use crate::ledger::AccessLedger;
use crate::record::{EntityKind, IndexValue, PlainPayload, ReplicaId};
use crate::store::{MemoryRecordStore, RecordStore};
use crate::sync::{EncryptedDelta, MemoryRelay, MemoryRelayClient, SyncEngine};

/// One company on one shared in-process relay
pub struct TestNetwork {
    pub relay: MemoryRelay,
    pub company_id: Uuid,
    master: MasterKey,
}

/// One device participating in a [`TestNetwork`]
pub struct TestReplica {
    pub device: SecretKey,
    pub engine: SyncEngine<MemoryRecordStore, MemoryRelayClient>,
}

impl TestReplica {
    pub fn public(&self) -> PublicKey {
        self.device.public()
    }

    /// Snapshot every local record as a delta, for direct device-to-device
    /// exchange in permutation tests
    pub async fn all_deltas(&self) -> Vec<EncryptedDelta> {
        self.engine
            .store()
            .list(self.engine.company_id())
            .await
            .unwrap()
            .into_iter()
            .map(EncryptedDelta::from)
            .collect()
    }
}

impl TestNetwork {
    pub fn new() -> Self {
        Self {
            relay: MemoryRelay::new(),
            company_id: Uuid::new_v4(),
            master: MasterKey::from([7u8; MASTER_KEY_SIZE]),
        }
    }

    fn engine_for(&self, device: SecretKey, keyring: Keyring) -> TestReplica {
        let client = self.relay.client(device.public());
        let engine = SyncEngine::new(
            MemoryRecordStore::new(),
            client,
            keyring,
            ReplicaId::generate(),
        );
        TestReplica { device, engine }
    }

    /// The device that creates the company: genesis epoch, genesis grant
    pub async fn founder(&self) -> TestReplica {
        let device = SecretKey::generate();
        let (keyring, genesis) =
            Keyring::create(self.company_id, device.clone(), self.master.clone(), Utc::now())
                .unwrap();
        let replica = self.engine_for(device, keyring);
        replica.engine.append_ledger_entry(genesis).await.unwrap();
        replica
    }

    /// Another owner device; it learns envelopes and ledger by pulling
    ///
    /// Grant it full scope from an existing owner before it can pull data
    /// deltas through the relay.
    pub fn owner_device(&self) -> TestReplica {
        let device = SecretKey::generate();
        let keyring = Keyring::open_owner(
            self.company_id,
            device.clone(),
            self.master.clone(),
            KeyringBundle::default(),
            AccessLedger::new(),
        );
        self.engine_for(device, keyring)
    }

    /// A view-only device; it can decrypt only epochs it holds shares for
    pub fn viewer_device(&self) -> TestReplica {
        let device = SecretKey::generate();
        let keyring = Keyring::open_view(
            self.company_id,
            device.clone(),
            KeyringBundle::default(),
            AccessLedger::new(),
        );
        self.engine_for(device, keyring)
    }
}

impl Default for TestNetwork {
    fn default() -> Self {
        Self::new()
    }
}

/// A minimal transaction payload
pub fn transaction_payload(account_id: Uuid, posted_on: &str, memo: &str) -> PlainPayload {
    PlainPayload::new(EntityKind::Transaction)
        .with_field("active", IndexValue::Bool(true))
        .with_field("account_id", IndexValue::Id(account_id))
        .with_field("posted_on", IndexValue::Str(posted_on.to_string()))
        .with_body(memo.as_bytes().to_vec())
}

/// A class assignment payload; `(entity_type, entity_id)` is the
/// uniqueness key
pub fn class_assignment_payload(entity_type: &str, entity_id: Uuid, class: &str) -> PlainPayload {
    PlainPayload::new(EntityKind::ClassAssignment)
        .with_field("active", IndexValue::Bool(true))
        .with_field("entity_type", IndexValue::Str(entity_type.to_string()))
        .with_field("entity_id", IndexValue::Id(entity_id))
        .with_body(class.as_bytes().to_vec())
}

/// A contact payload
pub fn contact_payload(name: &str, contact_type: &str) -> PlainPayload {
    PlainPayload::new(EntityKind::Contact)
        .with_field("active", IndexValue::Bool(true))
        .with_field("contact_type", IndexValue::Str(contact_type.to_string()))
        .with_body(name.as_bytes().to_vec())
}
