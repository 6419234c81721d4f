//! End-to-end replay scenarios: a till works offline, then reconnects.

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use tillsync_common::{
    ConnectivityFlag, EntityPayload, EntityType, EventStatus, ManualClock, MutationStatus,
    Operation, Product, Sale, SaleLine,
};
use tillsync_remote::testing::{Reply, ScriptedTransport};
use tillsync_remote::{CircuitState, ClientConfig, Method, ResilientClient, RetryConfig};
use tillsync_store::{LocalStore, MutationPatch, SqliteStore};
use tillsync_sync::{EventLog, EventLogConfig, RunOutcome, SkipReason, SyncConfig, SyncEngine};

struct Till {
    engine: SyncEngine,
    events: EventLog,
    store: Arc<SqliteStore>,
    transport: Arc<ScriptedTransport>,
    client: Arc<ResilientClient>,
    clock: Arc<ManualClock>,
    online: Arc<ConnectivityFlag>,
}

fn till(store: SqliteStore) -> Till {
    let store = Arc::new(store);
    let transport = Arc::new(ScriptedTransport::new());
    let clock = Arc::new(ManualClock::default());
    let online = Arc::new(ConnectivityFlag::default());
    let client = Arc::new(
        ResilientClient::new(transport.clone(), &ClientConfig::default(), clock.clone()).with_retry(
            RetryConfig::new(1)
                .with_initial_delay(Duration::ZERO)
                .with_max_jitter(Duration::ZERO),
        ),
    );
    let config = SyncConfig {
        backoff_base_ms: 0,
        ..SyncConfig::default()
    };
    let engine = SyncEngine::new(
        store.clone(),
        client.clone(),
        clock.clone(),
        online.clone(),
        config,
    );
    let events = EventLog::new(
        store.clone(),
        client.clone(),
        clock.clone(),
        online.clone(),
        EventLogConfig::default(),
    );
    Till {
        engine,
        events,
        store,
        transport,
        client,
        clock,
        online,
    }
}

fn product(id: &str, quantity: i64) -> EntityPayload {
    EntityPayload::Products(Product {
        id: id.to_string(),
        server_id: None,
        name: "Espresso beans".to_string(),
        sku: Some("BEAN-1".to_string()),
        category: Some("Coffee".to_string()),
        price: 12.0,
        quantity,
        updated_at: Utc::now(),
    })
}

fn sale(product_id: &str) -> Sale {
    Sale {
        lines: vec![SaleLine {
            product_id: product_id.to_string(),
            quantity: 1,
            unit_price: 12.0,
        }],
        total: 12.0,
        payment_method: "cash".to_string(),
    }
}

#[tokio::test]
async fn offline_changes_replay_in_order_after_reconnect() {
    let t = till(SqliteStore::in_memory().unwrap());
    t.online.set_online(false);

    t.engine.enqueue(Operation::Update, product("p1", 5)).unwrap();
    t.events.record_sale(&sale("p1")).unwrap();
    t.engine.enqueue(Operation::Update, product("p1", 3)).unwrap();
    t.events.record_sale(&sale("p1")).unwrap();

    assert_eq!(
        t.engine.run().await.unwrap(),
        RunOutcome::Skipped(SkipReason::Offline)
    );
    assert_eq!(t.events.sync_pending().await.unwrap().skipped, Some(SkipReason::Offline));
    assert_eq!(t.transport.call_count(), 0);

    t.online.set_online(true);
    t.transport
        .always(Method::PUT, "products/p1", Reply::ok(json!({"id": "p1"})));
    t.transport
        .always(Method::POST, "events", Reply::ok(json!({"transactionId": "tx-1"})));

    let outcome = t.engine.run().await.unwrap();
    assert_eq!(outcome.summary().unwrap().synced, 2);
    let puts = t.transport.calls_to(&Method::PUT, "products/p1");
    let quantities: Vec<_> = puts
        .iter()
        .map(|call| call.body.as_ref().unwrap()["quantity"].clone())
        .collect();
    assert_eq!(quantities, vec![json!(5), json!(3)]);

    let summary = t.events.sync_pending().await.unwrap();
    assert_eq!(summary.synced, 2);
    assert_eq!(t.events.pending_count().unwrap(), 0);

    let cached = t
        .store
        .cached_entity(EntityType::Products, "p1")
        .unwrap()
        .unwrap();
    assert_eq!(cached.data["quantity"], json!(3));
    assert!(t.store.mutations().unwrap().is_empty());
}

#[tokio::test]
async fn lost_event_response_is_replayed_with_same_key() {
    let t = till(SqliteStore::in_memory().unwrap());
    let event_id = t.events.record_sale(&sale("p1")).unwrap();

    t.transport.push(Method::POST, "events", Reply::Timeout);
    let first = t.events.sync_pending().await.unwrap();
    assert_eq!(first.deferred, 1);
    assert_eq!(t.events.pending_count().unwrap(), 1);

    t.transport
        .push(Method::POST, "events", Reply::ok(json!({"transactionId": "tx-9"})));
    let second = t.events.sync_pending().await.unwrap();
    assert_eq!(second.synced, 1);

    let keys: Vec<_> = t
        .transport
        .calls_to(&Method::POST, "events")
        .into_iter()
        .map(|call| call.idempotency_key)
        .collect();
    assert_eq!(
        keys,
        vec![
            Some(event_id.as_str().to_string()),
            Some(event_id.as_str().to_string())
        ]
    );
    let synced = t.events.events(EventStatus::Synced).unwrap();
    assert_eq!(synced[0].transaction_id.as_deref(), Some("tx-9"));
}

#[tokio::test]
async fn breaker_blocks_calls_during_cooldown_then_recovers() {
    let t = till(SqliteStore::in_memory().unwrap());
    t.engine.enqueue(Operation::Update, product("p1", 2)).unwrap();
    for _ in 0..5 {
        t.transport
            .push(Method::PUT, "products/p1", Reply::status(503, "unavailable"));
    }
    t.transport
        .always(Method::PUT, "products/p1", Reply::ok(json!({})));

    for _ in 0..5 {
        t.engine.run().await.unwrap();
    }
    assert_eq!(t.client.circuit_state(), CircuitState::Open);
    assert_eq!(t.transport.call_count(), 5);

    let halted = t.engine.run().await.unwrap();
    assert!(halted.summary().unwrap().halted);
    assert_eq!(t.transport.call_count(), 5);
    let item = &t.store.pending_mutations().unwrap()[0];
    assert_eq!(item.attempts, 5);

    t.clock.advance(ChronoDuration::seconds(31));
    let recovered = t.engine.run().await.unwrap();
    assert_eq!(recovered.summary().unwrap().synced, 1);
    assert_eq!(t.client.circuit_state(), CircuitState::Closed);
}

#[tokio::test]
async fn persistent_failure_marks_item_failed_after_ceiling() {
    let t = till(SqliteStore::in_memory().unwrap());
    t.engine.enqueue(Operation::Update, product("p1", 2)).unwrap();
    t.transport
        .always(Method::PUT, "products/p1", Reply::status(422, "sku taken"));

    for _ in 0..5 {
        t.engine.run().await.unwrap();
        let item = &t.store.mutations().unwrap()[0];
        assert_eq!(item.status, MutationStatus::Pending);
    }
    t.engine.run().await.unwrap();

    let item = &t.store.mutations().unwrap()[0];
    assert_eq!(item.status, MutationStatus::Failed);
    assert_eq!(item.attempts, 6);
    assert_eq!(t.client.circuit_state(), CircuitState::Closed);
}

#[tokio::test]
async fn interrupted_item_resumes_after_restart() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("till.db");

    {
        let t = till(SqliteStore::open(&path).unwrap());
        let id = t.engine.enqueue(Operation::Update, product("p1", 7)).unwrap();
        t.store
            .update_mutation(id, &MutationPatch::status(MutationStatus::Syncing))
            .unwrap();
    }

    let t = till(SqliteStore::open(&path).unwrap());
    let pending = t.store.pending_mutations().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].status, MutationStatus::Pending);

    t.transport
        .always(Method::PUT, "products/p1", Reply::ok(json!({})));
    let outcome = t.engine.run().await.unwrap();
    assert_eq!(outcome.summary().unwrap().synced, 1);
    assert!(t.store.mutations().unwrap().is_empty());
}
