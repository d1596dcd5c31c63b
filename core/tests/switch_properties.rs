//! End-to-end properties of the switch aggregate against the SQLite store:
//! exactly-once claiming under contention, monotonic terminal, counters
//! recomputed from the ledger, and durability across a reopen.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;

use chrono::Duration;
use chrono::Utc;
use vigil_core::SwitchService;
use vigil_core::config::VigilConfig;
use vigil_core::gateway::StubPublisher;
use vigil_core::ledger::NewLedgerEntry;
use vigil_core::machine::derive_phase;
use vigil_core::store::SqliteStore;
use vigil_core::store::SwitchStore;
use vigil_protocol::BroadcastOutcome;
use vigil_protocol::BroadcastPayload;
use vigil_protocol::LedgerKind;
use vigil_protocol::Phase;

fn test_config() -> VigilConfig {
    let mut config = VigilConfig::default();
    config.timer.reset_window_seconds = 600;
    config.timer.grace_window_seconds = 60;
    config.broadcast.candidates = vec![BroadcastPayload {
        text: "the operators have gone silent".to_string(),
        url: "https://example.com/last-words".to_string(),
    }];
    config
}

fn sqlite_service(
    store: Arc<SqliteStore>,
    publisher: Arc<StubPublisher>,
) -> Arc<SwitchService> {
    Arc::new(SwitchService::new(store, publisher, &test_config()))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_claims_publish_exactly_once() {
    let now = Utc::now();
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let publisher = Arc::new(StubPublisher::succeeding());
    let service = sqlite_service(store.clone(), publisher.clone());
    service.bootstrap(now).unwrap();

    // A grace cycle that lapsed a second ago.
    store.set_primary_expiry(now - Duration::seconds(90), now).unwrap();
    service.start_grace("mara", None, now - Duration::seconds(61)).unwrap();

    let mut handles = Vec::new();
    for _ in 0..16 {
        let service = Arc::clone(&service);
        handles.push(tokio::spawn(
            async move { service.claim_and_publish(Utc::now()).await },
        ));
    }
    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap().unwrap().is_some() {
            winners += 1;
        }
    }

    assert_eq!(winners, 1);
    assert_eq!(publisher.publish_count(), 1);
    let entries = service.recent_ledger(50).unwrap();
    let sent = entries
        .iter()
        .filter(|e| matches!(e.kind, LedgerKind::Sent | LedgerKind::Failed))
        .count();
    assert_eq!(sent, 1);
    assert!(service.state(Utc::now()).unwrap().terminal);
}

#[tokio::test]
async fn lifecycle_survives_a_store_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("vigil.db");
    let now = Utc::now();

    {
        let store = Arc::new(SqliteStore::open(&db_path).unwrap());
        let publisher = Arc::new(StubPublisher::succeeding());
        let service = sqlite_service(store.clone(), publisher.clone());
        service.bootstrap(now).unwrap();

        service.reset("mara", None, None, now).unwrap();
        service
            .reset("kim", Some("handover".to_string()), None, now + Duration::seconds(1))
            .unwrap();

        store
            .set_primary_expiry(now - Duration::seconds(1), now)
            .unwrap();
        service
            .start_grace("mara", None, now + Duration::seconds(2))
            .unwrap();

        let due = now + Duration::seconds(90);
        let outcome = service.claim_and_publish(due).await.unwrap();
        assert!(matches!(outcome, Some(BroadcastOutcome::Sent { .. })));
    }

    // A fresh process: reopen, bootstrap again, and the history must hold.
    let store = Arc::new(SqliteStore::open(&db_path).unwrap());
    let service = sqlite_service(store, Arc::new(StubPublisher::succeeding()));
    service.bootstrap(Utc::now()).unwrap();

    let state = service.state(Utc::now()).unwrap();
    assert_eq!(state.phase, Phase::Terminal);
    assert!(state.terminal);
    assert_eq!(state.counters.total, 2);

    // Newest first: sent, sending, schedule, reset, reset.
    let kinds: Vec<LedgerKind> = service
        .recent_ledger(10)
        .unwrap()
        .into_iter()
        .map(|e| e.kind)
        .collect();
    assert_eq!(
        kinds,
        vec![
            LedgerKind::Sent,
            LedgerKind::Sending,
            LedgerKind::Schedule,
            LedgerKind::Reset,
            LedgerKind::Reset,
        ]
    );

    // Still frozen after the restart.
    assert!(
        service
            .reset("mara", None, None, Utc::now())
            .unwrap_err()
            .is_frozen()
    );
}

#[tokio::test]
async fn terminal_refuses_every_mutation_and_claim() {
    let now = Utc::now();
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let publisher = Arc::new(StubPublisher::succeeding());
    let service = sqlite_service(store.clone(), publisher.clone());
    service.bootstrap(now).unwrap();

    store.set_primary_expiry(now - Duration::seconds(1), now).unwrap();
    service.start_grace("mara", None, now).unwrap();
    let due = now + Duration::seconds(61);
    service.claim_and_publish(due).await.unwrap();

    let before = store.primary().unwrap();
    assert!(service.reset("mara", None, None, due).unwrap_err().is_frozen());
    assert!(service.start_grace("mara", None, due).unwrap_err().is_frozen());
    assert!(service.claim_and_publish(due).await.unwrap().is_none());

    // Refused mutations leave the record byte-for-byte alone.
    assert_eq!(store.primary().unwrap(), before);
    assert_eq!(publisher.publish_count(), 1);
}

#[test]
fn counters_always_reflect_the_ledger() {
    let now = Utc::now();
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let service = sqlite_service(store.clone(), Arc::new(StubPublisher::succeeding()));
    service.bootstrap(now).unwrap();

    service.reset("mara", None, None, now).unwrap();
    assert_eq!(service.state(now).unwrap().counters.total, 1);

    // An entry written behind the service's back is still counted: nothing
    // is cached between observations.
    store
        .append(&NewLedgerEntry::new(
            LedgerKind::Reset,
            "kim",
            now - Duration::hours(30),
        ))
        .unwrap();
    let counters = service.state(now).unwrap().counters;
    assert_eq!(counters.total, 2);
    assert_eq!(counters.last_24h, 1);
}

#[test]
fn phases_are_derived_never_stored() {
    let now = Utc::now();
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let service = sqlite_service(store.clone(), Arc::new(StubPublisher::succeeding()));
    service.bootstrap(now).unwrap();

    // The same stored records read as Active before the deadline and
    // Expired after it, with no write in between.
    let primary = store.primary().unwrap();
    let grace = store.grace().unwrap();
    assert_eq!(derive_phase(now, &primary, &grace), Phase::Active);
    assert_eq!(
        derive_phase(primary.target_expiry, &primary, &grace),
        Phase::Expired
    );
    assert_eq!(
        service.state(primary.target_expiry + Duration::seconds(1)).unwrap().phase,
        Phase::Expired
    );
}

#[tokio::test]
async fn events_reach_every_subscriber() {
    let now = Utc::now();
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let service = sqlite_service(store.clone(), Arc::new(StubPublisher::succeeding()));
    service.bootstrap(now).unwrap();

    let mut first = service.subscribe_events();
    let mut second = service.subscribe_events();

    service.reset("mara", None, None, now).unwrap();
    store.set_primary_expiry(now - Duration::seconds(1), now).unwrap();
    service.start_grace("mara", None, now).unwrap();
    service
        .claim_and_publish(now + Duration::seconds(61))
        .await
        .unwrap();

    for rx in [&mut first, &mut second] {
        assert_eq!(rx.try_recv().unwrap().name(), "reset");
        assert_eq!(rx.try_recv().unwrap().name(), "grace-started");
        assert_eq!(rx.try_recv().unwrap().name(), "terminal");
    }
}
