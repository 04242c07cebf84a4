//! Integration tests for multi-device convergence
//!
//! Replicas that see the same set of deltas must hold the same records,
//! regardless of arrival order, duplication, or which device wrote what.

use common::record::IndexValue;
use common::store::RecordStore;
use common::sync::RelayTransport;
use common::testkit::{contact_payload, transaction_payload, TestNetwork, TestReplica};
use rand::seq::SliceRandom;
use rand::{rngs::StdRng, SeedableRng};
use uuid::Uuid;

/// Sorted snapshot of a replica's full record set
async fn snapshot(replica: &TestReplica) -> Vec<common::record::Record> {
    let mut records = replica
        .engine
        .store()
        .list(replica.engine.company_id())
        .await
        .unwrap();
    records.sort_by_key(|r| r.id);
    records
}

/// Like [`snapshot`] but data records only; devices that joined at
/// different times legitimately hold different sets of grant entries
async fn data_snapshot(replica: &TestReplica) -> Vec<common::record::Record> {
    snapshot(replica)
        .await
        .into_iter()
        .filter(|r| r.kind != common::record::EntityKind::AccessEntry)
        .collect()
}

async fn join_owner(network: &TestNetwork, founder: &TestReplica) -> TestReplica {
    let device = network.owner_device();
    founder
        .engine
        .grant_view(device.public(), common::ledger::Scope::Full)
        .await
        .unwrap();
    founder.engine.push().await.unwrap();
    device.engine.pull().await.unwrap();
    device
}

// =============================================================================
// SCENARIO: Two owner devices edit different records offline
// =============================================================================

#[tokio::test]
async fn scenario_disjoint_edits_converge() {
    let network = TestNetwork::new();
    let laptop = network.founder().await;
    let phone = join_owner(&network, &laptop).await;

    let account = Uuid::new_v4();
    laptop
        .engine
        .create_record(transaction_payload(account, "2024-03-01", "rent"))
        .await
        .unwrap();
    phone
        .engine
        .create_record(transaction_payload(account, "2024-03-02", "utilities"))
        .await
        .unwrap();

    // two sync rounds: each device pushes its write, then picks up the other's
    laptop.engine.sync_once().await.unwrap();
    phone.engine.sync_once().await.unwrap();
    laptop.engine.sync_once().await.unwrap();

    let a = snapshot(&laptop).await;
    let b = snapshot(&phone).await;
    assert_eq!(a, b);
    // genesis grant, the phone's grant, and the two transactions
    assert_eq!(a.len(), 4);
}

// =============================================================================
// SCENARIO: Both devices edit the SAME record offline
// =============================================================================

/// Concurrent edits to one record resolve by last-write-wins; both devices
/// land on the same winner and the merged version dominates both inputs.
#[tokio::test]
async fn scenario_concurrent_edit_same_record() {
    let network = TestNetwork::new();
    let laptop = network.founder().await;
    let phone = join_owner(&network, &laptop).await;

    let account = Uuid::new_v4();
    let record = laptop
        .engine
        .create_record(transaction_payload(account, "2024-03-01", "draft"))
        .await
        .unwrap();
    laptop.engine.sync_once().await.unwrap();
    phone.engine.sync_once().await.unwrap();

    // both edit offline
    laptop
        .engine
        .update_record(record.id, transaction_payload(account, "2024-03-01", "laptop edit"))
        .await
        .unwrap();
    phone
        .engine
        .update_record(record.id, transaction_payload(account, "2024-03-01", "phone edit"))
        .await
        .unwrap();

    laptop.engine.sync_once().await.unwrap();
    phone.engine.sync_once().await.unwrap();
    laptop.engine.sync_once().await.unwrap();

    let a = snapshot(&laptop).await;
    let b = snapshot(&phone).await;
    assert_eq!(a, b);

    // the surviving version is readable and is one of the two edits
    let payload = laptop.engine.read_record(record.id).await.unwrap().unwrap();
    let body = String::from_utf8(payload.body).unwrap();
    assert!(body == "laptop edit" || body == "phone edit");

    // union version vector covers both writers
    let merged = laptop
        .engine
        .store()
        .get(network.company_id, record.id)
        .await
        .unwrap()
        .unwrap();
    assert!(merged.version_vector.get(&laptop.engine.replica()) >= 1);
    assert!(merged.version_vector.get(&phone.engine.replica()) >= 1);
}

// =============================================================================
// SCENARIO: Delta application order does not matter
// =============================================================================

/// Apply the same delta set to fresh replicas in shuffled orders; every
/// permutation must produce the identical record set.
#[tokio::test]
async fn scenario_permutation_independence() {
    let network = TestNetwork::new();
    let founder = network.founder().await;

    let account = Uuid::new_v4();
    let record = founder
        .engine
        .create_record(transaction_payload(account, "2024-03-01", "v1"))
        .await
        .unwrap();
    founder
        .engine
        .update_record(record.id, transaction_payload(account, "2024-03-01", "v2"))
        .await
        .unwrap();
    for i in 0..8 {
        founder
            .engine
            .create_record(contact_payload(&format!("contact {}", i), "vendor"))
            .await
            .unwrap();
    }
    let deltas = founder.all_deltas().await;

    let mut rng = StdRng::seed_from_u64(42);
    let mut reference: Option<Vec<common::record::Record>> = None;
    for _ in 0..5 {
        let replica = join_owner(&network, &founder).await;
        let mut shuffled = deltas.clone();
        shuffled.shuffle(&mut rng);
        replica
            .engine
            .apply_deltas("shuffle", shuffled)
            .await
            .unwrap();

        let state = data_snapshot(&replica).await;
        match &reference {
            None => reference = Some(state),
            Some(expected) => assert_eq!(&state, expected),
        }
    }
}

// =============================================================================
// SCENARIO: Re-applying deltas is a no-op
// =============================================================================

#[tokio::test]
async fn scenario_apply_is_idempotent() {
    let network = TestNetwork::new();
    let founder = network.founder().await;

    let account = Uuid::new_v4();
    founder
        .engine
        .create_record(transaction_payload(account, "2024-03-01", "once"))
        .await
        .unwrap();
    founder.engine.push().await.unwrap();
    let deltas = founder.all_deltas().await;

    // a device that holds the key envelopes but has never pulled a delta
    let replica = network.owner_device();
    let bundle = network
        .relay
        .client(replica.public())
        .get_keyring(network.company_id)
        .await
        .unwrap()
        .unwrap();
    replica.engine.keyring().write().merge_bundle(&bundle);

    let first = replica
        .engine
        .apply_deltas("dup", deltas.clone())
        .await
        .unwrap();
    assert!(first.applied > 0);
    assert_eq!(first.already_current, 0);
    let before = snapshot(&replica).await;

    let second = replica.engine.apply_deltas("dup", deltas).await.unwrap();
    assert_eq!(second.applied, 0);
    assert_eq!(second.already_current, first.applied);
    assert_eq!(snapshot(&replica).await, before);
}

// =============================================================================
// SCENARIO: Concurrent local writes serialize per record
// =============================================================================

/// Two tasks updating the same record at once must both land: the final
/// version carries one increment per write, never a lost update. Writes to
/// unrelated records proceed independently.
#[tokio::test]
async fn scenario_concurrent_writes_never_lose_an_update() {
    let network = TestNetwork::new();
    let founder = network.founder().await;
    let account = Uuid::new_v4();

    let target = founder
        .engine
        .create_record(transaction_payload(account, "2024-03-01", "v1"))
        .await
        .unwrap();
    let other = founder
        .engine
        .create_record(contact_payload("acme", "vendor"))
        .await
        .unwrap();

    let (a, b, c) = tokio::join!(
        founder
            .engine
            .update_record(target.id, transaction_payload(account, "2024-03-01", "v2")),
        founder
            .engine
            .update_record(target.id, transaction_payload(account, "2024-03-01", "v3")),
        founder
            .engine
            .update_record(other.id, contact_payload("acme corp", "vendor")),
    );
    a.unwrap();
    b.unwrap();
    c.unwrap();

    let merged = founder
        .engine
        .store()
        .get(network.company_id, target.id)
        .await
        .unwrap()
        .unwrap();
    // create + two updates, each a distinct increment
    assert_eq!(merged.version_vector.get(&founder.engine.replica()), 3);
    let unrelated = founder
        .engine
        .store()
        .get(network.company_id, other.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(unrelated.version_vector.get(&founder.engine.replica()), 2);
}

// =============================================================================
// SCENARIO: Index fields answer queries without decryption
// =============================================================================

#[tokio::test]
async fn scenario_plaintext_index_query() {
    let network = TestNetwork::new();
    let founder = network.founder().await;

    let checking = Uuid::new_v4();
    let savings = Uuid::new_v4();
    founder
        .engine
        .create_record(transaction_payload(checking, "2024-03-01", "groceries"))
        .await
        .unwrap();
    founder
        .engine
        .create_record(transaction_payload(checking, "2024-03-02", "fuel"))
        .await
        .unwrap();
    founder
        .engine
        .create_record(transaction_payload(savings, "2024-03-02", "transfer"))
        .await
        .unwrap();

    let hits = founder
        .engine
        .store()
        .query_index(network.company_id, "account_id", &IndexValue::Id(checking))
        .await
        .unwrap();
    assert_eq!(hits.len(), 2);

    // the account id is indexed; the memo is not, and stays ciphertext
    for record in &hits {
        assert!(!record.index_fields.contains_key("memo"));
        assert_ne!(record.payload, b"groceries".to_vec());
    }
}
