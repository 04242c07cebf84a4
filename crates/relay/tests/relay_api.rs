//! End-to-end tests: real sync engines talking to the relay over HTTP
//!
//! Same flows the common crate drives through its in-memory relay, here
//! exercised through the axum router, the JSON wire format, and the
//! reqwest transport in one piece.

use std::collections::BTreeMap;

use chrono::Utc;
use reqwest::Url;
use uuid::Uuid;

use common::crypto::{MasterKey, PublicKey, SecretKey, MASTER_KEY_SIZE};
use common::keyring::Keyring;
use common::ledger::Scope;
use common::record::{EntityKind, Epoch, IndexValue, ReplicaId, VersionVector};
use common::store::{MemoryRecordStore, RecordStore};
use common::sync::{EncryptedDelta, RelayError, RelayTransport, SyncEngine};
use common::testkit::transaction_payload;

use relay::http::build_router;
use relay::store::MemoryDeltaStore;
use relay::{HttpRelay, RelayState};

/// One relay process on a loopback port
async fn spawn_relay() -> Url {
    let router = build_router(RelayState::new(MemoryDeltaStore::new()));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    Url::parse(&format!("http://{}/", addr)).unwrap()
}

struct HttpReplica {
    device: SecretKey,
    engine: SyncEngine<MemoryRecordStore, HttpRelay>,
}

impl HttpReplica {
    fn public(&self) -> PublicKey {
        self.device.public()
    }
}

/// One company's devices, all pointed at the same HTTP relay
struct HttpNetwork {
    url: Url,
    company_id: Uuid,
    master: MasterKey,
}

impl HttpNetwork {
    async fn new() -> Self {
        Self {
            url: spawn_relay().await,
            company_id: Uuid::new_v4(),
            master: MasterKey::from([3u8; MASTER_KEY_SIZE]),
        }
    }

    fn engine_for(&self, device: SecretKey, keyring: Keyring) -> HttpReplica {
        let relay = HttpRelay::new(&self.url, device.public()).unwrap();
        let engine = SyncEngine::new(
            MemoryRecordStore::new(),
            relay,
            keyring,
            ReplicaId::generate(),
        );
        HttpReplica { device, engine }
    }

    async fn founder(&self) -> HttpReplica {
        let device = SecretKey::generate();
        let (keyring, genesis) = Keyring::create(
            self.company_id,
            device.clone(),
            self.master.clone(),
            Utc::now(),
        )
        .unwrap();
        let replica = self.engine_for(device, keyring);
        replica.engine.append_ledger_entry(genesis).await.unwrap();
        replica
    }

    fn viewer_device(&self) -> HttpReplica {
        let device = SecretKey::generate();
        let keyring = Keyring::open_view(
            self.company_id,
            device.clone(),
            Default::default(),
            common::ledger::AccessLedger::new(),
        );
        self.engine_for(device, keyring)
    }
}

fn raw_data_delta(company: Uuid) -> EncryptedDelta {
    let origin = ReplicaId::generate();
    let mut vv = VersionVector::new();
    vv.increment(origin);
    EncryptedDelta {
        record_id: Uuid::new_v4(),
        company_id: company,
        kind: EntityKind::Transaction,
        key_epoch: Epoch::GENESIS,
        version_vector: vv,
        index_fields: BTreeMap::from([("active".to_string(), IndexValue::Bool(true))]),
        payload: vec![0xde, 0xad],
        origin,
        updated_at: Utc::now(),
        deleted_at: None,
    }
}

// =============================================================================
// SCENARIO: Two devices converge through the HTTP relay
// =============================================================================

#[tokio::test]
async fn scenario_devices_converge_over_http() {
    let network = HttpNetwork::new().await;
    let founder = network.founder().await;
    let account = Uuid::new_v4();

    let advisor = network.viewer_device();
    founder
        .engine
        .grant_view(advisor.public(), Scope::Full)
        .await
        .unwrap();
    let record = founder
        .engine
        .create_record(transaction_payload(account, "2024-05-01", "office rent"))
        .await
        .unwrap();
    founder.engine.sync_once().await.unwrap();

    advisor.engine.pull().await.unwrap();

    let payload = advisor
        .engine
        .read_record(record.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(payload.body, b"office rent".to_vec());

    // merge is idempotent across repeated pulls
    let report = advisor.engine.pull().await.unwrap();
    assert_eq!(report.applied, 0);
}

// =============================================================================
// SCENARIO: A principal without a grant window cannot push
// =============================================================================

#[tokio::test]
async fn scenario_stranger_push_is_forbidden() {
    let network = HttpNetwork::new().await;
    let founder = network.founder().await;
    founder.engine.sync_once().await.unwrap();

    let stranger = SecretKey::generate();
    let relay = HttpRelay::new(&network.url, stranger.public()).unwrap();
    let denied = relay
        .push(network.company_id, vec![raw_data_delta(network.company_id)])
        .await;
    assert!(matches!(denied, Err(RelayError::NotGranted(_, _))));
}

// =============================================================================
// SCENARIO: Revocation stops new data deltas at the relay
// =============================================================================

#[tokio::test]
async fn scenario_revocation_cuts_off_pull_over_http() {
    let network = HttpNetwork::new().await;
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
        .create_record(transaction_payload(account, "2024-05-01", "visible"))
        .await
        .unwrap();
    founder.engine.sync_once().await.unwrap();
    advisor.engine.pull().await.unwrap();

    founder.engine.revoke(advisor.public(), true).await.unwrap();
    founder
        .engine
        .create_record(transaction_payload(account, "2024-05-02", "hidden"))
        .await
        .unwrap();
    founder.engine.sync_once().await.unwrap();

    advisor.engine.pull().await.unwrap();
    let records = advisor
        .engine
        .store()
        .list(network.company_id)
        .await
        .unwrap();
    let hidden: Vec<_> = records
        .iter()
        .filter(|r| r.kind != EntityKind::AccessEntry && r.key_epoch > Epoch::GENESIS)
        .collect();
    assert!(hidden.is_empty());

    // the relay reports the closed window
    let relay = HttpRelay::new(&network.url, founder.public()).unwrap();
    let grants = relay.grants(network.company_id).await.unwrap();
    let advisor_window = grants
        .windows
        .iter()
        .find(|w| w.principal == advisor.public().to_hex())
        .unwrap();
    assert!(advisor_window.revoked);

    // and the revoked principal can no longer push
    let advisor_relay = HttpRelay::new(&network.url, advisor.public()).unwrap();
    let denied = advisor_relay
        .push(network.company_id, vec![raw_data_delta(network.company_id)])
        .await;
    assert!(matches!(denied, Err(RelayError::NotGranted(_, _))));
}

// =============================================================================
// SCENARIO: Keyring bundles round-trip through the relay
// =============================================================================

#[tokio::test]
async fn scenario_keyring_bundle_round_trip() {
    let network = HttpNetwork::new().await;
    let founder = network.founder().await;
    founder.engine.sync_once().await.unwrap();

    let relay = HttpRelay::new(&network.url, founder.public()).unwrap();
    let bundle = relay.get_keyring(network.company_id).await.unwrap().unwrap();
    assert!(bundle.envelopes.contains_key(&Epoch::GENESIS));
}

// =============================================================================
// Plumbing: auth header, health probes, transport failure mapping
// =============================================================================

#[tokio::test]
async fn test_missing_principal_header_is_unauthorized() {
    let url = spawn_relay().await;
    let client = reqwest::Client::new();
    let response = client
        .post(url.join("/api/v0/sync/pull").unwrap())
        .json(&serde_json::json!({"company_id": Uuid::new_v4()}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_health_endpoints() {
    let url = spawn_relay().await;
    let client = reqwest::Client::new();

    let healthz = client
        .get(url.join("/_status/healthz").unwrap())
        .send()
        .await
        .unwrap();
    assert_eq!(healthz.status(), reqwest::StatusCode::OK);

    let readyz = client
        .get(url.join("/_status/readyz").unwrap())
        .send()
        .await
        .unwrap();
    assert_eq!(readyz.status(), reqwest::StatusCode::OK);
}

#[tokio::test]
async fn test_unreachable_relay_maps_to_unavailable() {
    // nothing listens on port 1
    let url = Url::parse("http://127.0.0.1:1/").unwrap();
    let relay = HttpRelay::new(&url, SecretKey::generate().public()).unwrap();
    let result = relay.pull(Uuid::new_v4(), None, 10).await;
    assert!(matches!(result, Err(RelayError::Unavailable(_))));
}
