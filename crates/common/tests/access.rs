//! Integration tests for grants, revocation, and epoch confinement
//!
//! What a principal can decrypt is bounded by the epochs its grant covers;
//! what the relay will even ship is bounded by the grant window it derives
//! from the plaintext ledger stream.

use common::keyring::KeyringError;
use common::ledger::Scope;
use common::record::{EntityKind, Epoch, IndexValue};
use common::store::RecordStore;
use common::sync::EncryptedDelta;
use common::testkit::{transaction_payload, TestNetwork};
use chrono::Utc;
use uuid::Uuid;

// =============================================================================
// SCENARIO: A viewer granted mid-history decrypts only from its epoch on
// =============================================================================

#[tokio::test]
async fn scenario_epoch_confinement() {
    let network = TestNetwork::new();
    let founder = network.founder().await;
    let account = Uuid::new_v4();

    // history: one record per epoch, rotating in between
    let before = founder
        .engine
        .create_record(transaction_payload(account, "2024-01-01", "old"))
        .await
        .unwrap();
    founder.engine.sync_once().await.unwrap();
    // mint the epoch without draining the re-encryption backlog: the old
    // record stays ciphertext at epoch 0, which is all the relay has
    let (_, rotation) = founder.engine.keyring().write().rotate(Utc::now()).unwrap();
    founder.engine.append_ledger_entry(rotation).await.unwrap();

    let advisor = network.viewer_device();
    founder
        .engine
        .grant_view(advisor.public(), Scope::From(Utc::now()))
        .await
        .unwrap();
    let after = founder
        .engine
        .create_record(transaction_payload(account, "2024-02-01", "new"))
        .await
        .unwrap();
    founder.engine.sync_once().await.unwrap();

    advisor.engine.pull().await.unwrap();

    // the post-grant record is present and readable
    let payload = advisor.engine.read_record(after.id).await.unwrap().unwrap();
    assert_eq!(payload.body, b"new".to_vec());

    // the pre-grant record never arrived through the relay
    assert!(advisor
        .engine
        .store()
        .get(network.company_id, before.id)
        .await
        .unwrap()
        .is_none());

    // and even with the ciphertext in hand, the old epoch stays sealed
    let keyring = advisor.engine.keyring();
    assert!(matches!(
        keyring.read().data_key(Epoch(0)),
        Err(KeyringError::UnauthorizedKey(_) | KeyringError::EpochKeyUnavailable(_))
    ));
}

// =============================================================================
// SCENARIO: Revocation stops the relay from serving new data deltas
// =============================================================================

#[tokio::test]
async fn scenario_revocation_cuts_off_pull() {
    let network = TestNetwork::new();
    let founder = network.founder().await;
    let account = Uuid::new_v4();

    let advisor = network.viewer_device();
    founder
        .engine
        .grant_view(advisor.public(), Scope::From(Utc::now()))
        .await
        .unwrap();
    founder
        .engine
        .create_record(transaction_payload(account, "2024-03-01", "visible"))
        .await
        .unwrap();
    founder.engine.sync_once().await.unwrap();
    advisor.engine.pull().await.unwrap();
    assert_eq!(
        advisor
            .engine
            .store()
            .query_index(
                network.company_id,
                "account_id",
                &common::record::IndexValue::Id(account),
            )
            .await
            .unwrap()
            .len(),
        1
    );

    // full revocation: ledger entry plus automatic rotation
    founder.engine.revoke(advisor.public(), true).await.unwrap();
    founder
        .engine
        .create_record(transaction_payload(account, "2024-03-02", "hidden"))
        .await
        .unwrap();
    founder.engine.sync_once().await.unwrap();

    let report = advisor.engine.pull().await.unwrap();
    assert_eq!(report.stored_opaque, 0);

    // the revocation itself arrived; the new data did not
    let records = advisor
        .engine
        .store()
        .list(network.company_id)
        .await
        .unwrap();
    let new_data: Vec<_> = records
        .iter()
        .filter(|r| r.kind != EntityKind::AccessEntry && r.key_epoch > Epoch(0))
        .collect();
    assert!(new_data.is_empty());
    let state = advisor.engine.keyring().read().ledger().replay();
    assert!(!state.can_decrypt(&advisor.public(), Epoch(1)));

    // and the new epoch key was never shared with the revoked principal
    assert!(matches!(
        advisor.engine.keyring().read().data_key(Epoch(1)),
        Err(KeyringError::UnauthorizedKey(_) | KeyringError::EpochKeyUnavailable(_))
    ));
}

// =============================================================================
// SCENARIO: Revocation plus rotation seals future history completely
// =============================================================================

/// After revoke + rotate + re-encrypt, everything the company writes or
/// rewrites is under an epoch the revoked principal never received.
#[tokio::test]
async fn scenario_revoked_principal_loses_future_history() {
    let network = TestNetwork::new();
    let founder = network.founder().await;
    let account = Uuid::new_v4();

    let advisor = network.viewer_device();
    founder
        .engine
        .grant_view(advisor.public(), Scope::From(Utc::now()))
        .await
        .unwrap();
    let record = founder
        .engine
        .create_record(transaction_payload(account, "2024-03-01", "ledger line"))
        .await
        .unwrap();
    founder.engine.sync_once().await.unwrap();
    advisor.engine.pull().await.unwrap();

    let mut progress = founder
        .engine
        .revoke(advisor.public(), true)
        .await
        .unwrap()
        .expect("full revocation schedules re-encryption");
    // wait for the background pass to drain the backlog and stage the
    // rewritten records
    while progress.changed().await.is_ok() {}
    founder.engine.sync_once().await.unwrap();

    // the advisor keeps its stale epoch-0 copy and can still read it (key
    // material already held cannot be clawed back), but the re-encrypted
    // version never reaches it
    let stale = advisor
        .engine
        .store()
        .get(network.company_id, record.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stale.key_epoch, Epoch(0));
    advisor.engine.pull().await.unwrap();
    let still_stale = advisor
        .engine
        .store()
        .get(network.company_id, record.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(still_stale.key_epoch, Epoch(0));
}

// =============================================================================
// SCENARIO: A scoped grant cannot come from a view-only device
// =============================================================================

#[tokio::test]
async fn scenario_viewer_cannot_mint_grants() {
    let network = TestNetwork::new();
    let founder = network.founder().await;

    let advisor = network.viewer_device();
    founder
        .engine
        .grant_view(advisor.public(), Scope::From(Utc::now()))
        .await
        .unwrap();
    founder.engine.push().await.unwrap();
    advisor.engine.pull().await.unwrap();

    let accomplice = common::crypto::SecretKey::generate();
    let denied = advisor
        .engine
        .grant_view(accomplice.public(), Scope::From(Utc::now()))
        .await;
    assert!(denied.is_err());

    // even a hand-signed grant is rejected on replay by every other device
    let forged = common::ledger::LedgerEntry::sign(
        network.company_id,
        &advisor.device,
        common::ledger::LedgerEvent::Granted {
            principal: accomplice.public(),
            scope: Scope::Full,
            epoch_from: Epoch(0),
        },
        Utc::now(),
    )
    .unwrap();
    advisor.engine.append_ledger_entry(forged).await.unwrap();
    advisor.engine.push().await.unwrap();

    founder.engine.pull().await.unwrap();
    let state = founder.engine.keyring().read().ledger().replay();
    assert!(!state.can_decrypt(&accomplice.public(), Epoch(0)));
    assert_eq!(state.rejected.len(), 1);
}
// =============================================================================
// SCENARIO: Index fields come from the payload, not the delta envelope
// =============================================================================

/// A relay (or any peer) can rewrite the plaintext envelope of a delta it
/// forwards. A device holding the epoch key must index the record by what
/// the authenticated payload says, not by what the envelope claims.
#[tokio::test]
async fn scenario_envelope_index_claims_are_rederived() {
    let network = TestNetwork::new();
    let founder = network.founder().await;

    let phone = network.owner_device();
    founder
        .engine
        .grant_view(phone.public(), Scope::Full)
        .await
        .unwrap();
    founder.engine.push().await.unwrap();
    phone.engine.pull().await.unwrap();

    let account = Uuid::new_v4();
    let record = founder
        .engine
        .create_record(transaction_payload(account, "2024-03-01", "memo"))
        .await
        .unwrap();

    // the envelope claims a different account than the ciphertext carries
    let bogus = Uuid::new_v4();
    let mut delta = EncryptedDelta::from(record.clone());
    delta
        .index_fields
        .insert("account_id".to_string(), IndexValue::Id(bogus));

    let report = phone.engine.apply_deltas("peer", vec![delta]).await.unwrap();
    assert_eq!(report.applied, 1);

    let by_real = phone
        .engine
        .store()
        .query_index(network.company_id, "account_id", &IndexValue::Id(account))
        .await
        .unwrap();
    assert_eq!(by_real.len(), 1);
    assert_eq!(by_real[0].id, record.id);

    let by_claimed = phone
        .engine
        .store()
        .query_index(network.company_id, "account_id", &IndexValue::Id(bogus))
        .await
        .unwrap();
    assert!(by_claimed.is_empty());
}
