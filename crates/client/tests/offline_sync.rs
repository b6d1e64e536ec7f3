use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use countsync_client::remote::wire;
use countsync_client::{ApplyResponse, RemoteSession};
use countsync_core::{ClientEventId, LockId};
use countsync_counting::{EventType, ManifestMeta, RemoteState, ZoneLock};
use serde_json::{Value, json};

use countsync_client::{
    ConnectivityState, CountingSession, EngineConfig, ErrorClass, InMemoryRemote, LockError, RemoteError,
    RemoteService, SessionError, SubmitOutcome, SyncError, SyncOutcome,
};
use countsync_core::{UserId, WarehouseId};
use countsync_counting::{
    CountEvent, CountResult, CountUpsert, ManifestItem, Profile, ReviewResolve, ReviewStatus, Role, Stage, derive,
};

fn cd() -> WarehouseId {
    WarehouseId::new(2)
}

fn item(zone: &str, address: &str, code: u64, expected: u32) -> ManifestItem {
    ManifestItem {
        warehouse: cd(),
        zone: zone.into(),
        address: address.into(),
        product_code: code,
        description: format!("PRODUTO {code}"),
        expected_qty: expected,
    }
}

fn manifest() -> Vec<ManifestItem> {
    vec![
        item("A", "R01", 1, 10),
        item("A", "R02", 2, 5),
        item("B", "R03", 3, 7),
    ]
}

fn profile(name: &str, role: Role) -> Profile {
    Profile {
        user_id: UserId::new(),
        badge: name.to_uppercase(),
        name: name.into(),
        role,
        default_warehouse: Some(cd()),
    }
}

fn server() -> InMemoryRemote {
    countsync_observability::init_for_tests();
    let server = InMemoryRemote::new();
    server.publish_manifest(cd(), "hash-1", manifest()).unwrap();
    server
}

async fn open(server: &InMemoryRemote, name: &str, role: Role) -> CountingSession {
    open_with(server, profile(name, role), EngineConfig::default()).await
}

async fn open_with(server: &InMemoryRemote, profile: Profile, config: EngineConfig) -> CountingSession {
    let remote: Arc<dyn RemoteService> = Arc::new(server.as_user(&profile));
    let session = CountingSession::open(config, profile, remote).await.unwrap();
    session.sync_now(false).await.unwrap();
    session
}

fn count(session: &CountingSession, item: &ManifestItem, stage: Stage, qty: u32) -> CountEvent {
    CountUpsert::for_item(item, session.cycle_date(), stage, qty).into()
}

fn surplus(session: &CountingSession, item: &ManifestItem, stage: Stage, qty: u32) -> CountEvent {
    CountUpsert::for_item(item, session.cycle_date(), stage, qty)
        .with_barcode("7891234")
        .into()
}

async fn row(session: &CountingSession, code: u64) -> countsync_counting::Row {
    session
        .rows()
        .await
        .unwrap()
        .into_iter()
        .find(|row| row.key.product_code == code)
        .unwrap()
}

fn completed(outcome: SyncOutcome) -> countsync_client::SyncResult {
    match outcome {
        SyncOutcome::Completed(result) => result,
        SyncOutcome::Skipped => panic!("sync was skipped"),
    }
}

#[tokio::test]
async fn stage_two_agreement_closes_the_item_without_review() {
    let server = server();
    let ana = open(&server, "ana", Role::Auditor).await;
    let bia = open(&server, "bia", Role::Auditor).await;
    let target = &manifest()[0].clone();

    assert_eq!(ana.submit(surplus(&ana, target, Stage::First, 12)).await.unwrap(), SubmitOutcome::Applied);
    let after_first = row(&ana, 1).await;
    assert_eq!(after_first.first.as_ref().unwrap().result, CountResult::Surplus);
    assert!(!after_first.is_final);
    assert!(after_first.awaits_second());

    bia.sync_now(false).await.unwrap();
    assert_eq!(bia.submit(surplus(&bia, target, Stage::Second, 12)).await.unwrap(), SubmitOutcome::Applied);
    let closed = row(&bia, 1).await;
    assert!(closed.is_final);
    assert!(closed.review.is_none());
}

#[tokio::test]
async fn stage_two_disagreement_waits_for_review_resolution() {
    let server = server();
    let ana = open(&server, "ana", Role::Auditor).await;
    let bia = open(&server, "bia", Role::Auditor).await;
    let boss = open(&server, "carla", Role::Admin).await;
    let target = &manifest()[0].clone();

    ana.submit(surplus(&ana, target, Stage::First, 12)).await.unwrap();
    bia.sync_now(false).await.unwrap();
    bia.submit(count(&bia, target, Stage::Second, 9)).await.unwrap();

    let disputed = row(&bia, 1).await;
    assert_eq!(disputed.review.as_ref().unwrap().status, ReviewStatus::Pending);
    assert!(!disputed.is_final);

    boss.sync_now(false).await.unwrap();
    let resolve = ReviewResolve::for_item(target, boss.cycle_date(), 10);
    assert_eq!(boss.submit(resolve.into()).await.unwrap(), SubmitOutcome::Applied);
    let resolved = row(&boss, 1).await;
    assert!(resolved.is_final);
    assert_eq!(resolved.review.unwrap().final_result, Some(CountResult::Correct));
}

#[tokio::test]
async fn second_count_by_the_first_counter_is_refused_locally() {
    let server = server();
    let ana = open(&server, "ana", Role::Auditor).await;
    let target = &manifest()[0].clone();

    ana.submit(surplus(&ana, target, Stage::First, 12)).await.unwrap();
    let err = ana.submit(count(&ana, target, Stage::Second, 12)).await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::Policy);
    assert_eq!(server.effect_count(), 1);
}

#[tokio::test]
async fn offline_submit_is_queued_and_visible_immediately() {
    let server = server();
    let ana = open(&server, "ana", Role::Auditor).await;
    let target = &manifest()[1].clone();

    ana.set_connectivity(ConnectivityState::Offline);
    let outcome = ana.submit(count(&ana, target, Stage::First, 5)).await.unwrap();

    assert_eq!(outcome, SubmitOutcome::Queued);
    assert_eq!(ana.pending_count(), 1);
    let row = row(&ana, 2).await;
    assert_eq!(row.first.as_ref().unwrap().counted_qty, 5);
    assert!(row.is_final);
    assert_eq!(server.effect_count(), 0);
}

#[tokio::test]
async fn terminal_rejection_on_drain_drops_the_entry_silently() {
    let server = server();
    let ana = open(&server, "ana", Role::Auditor).await;
    let target = &manifest()[1].clone();

    ana.set_connectivity(ConnectivityState::Offline);
    ana.submit(count(&ana, target, Stage::First, 4)).await.unwrap();
    assert_eq!(ana.pending_count(), 1);

    server.close_cycle(cd(), ana.cycle_date()).unwrap();
    ana.set_connectivity(ConnectivityState::Online);
    let result = completed(ana.sync_now(false).await.unwrap());

    assert_eq!((result.sent, result.discarded, result.failed), (0, 1, 0));
    assert_eq!(ana.pending_count(), 0);
    assert_eq!(ana.error_count().await.unwrap(), 0);
    // The optimistic count is reconciled away by the pull.
    assert!(row(&ana, 2).await.first.is_none());
}

#[tokio::test]
async fn outbox_drains_in_order_and_a_failure_does_not_block() {
    let server = server();
    let ana = open(&server, "ana", Role::Auditor).await;
    let user = ana.profile().user_id;

    ana.set_connectivity(ConnectivityState::Offline);
    for (target, qty) in manifest().iter().zip([10, 5, 7]) {
        ana.submit(count(&ana, target, Stage::First, qty)).await.unwrap();
    }
    let queued: Vec<_> = ana
        .store()
        .outbox_list(user, cd(), ana.cycle_date())
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.client_event_id)
        .collect();
    assert_eq!(queued.len(), 3);

    server.fail_product(2, Some(RemoteError::Network("timeout".into()))).unwrap();
    ana.set_connectivity(ConnectivityState::Online);
    let result = completed(ana.sync_now(false).await.unwrap());

    assert_eq!(server.apply_log(), queued);
    assert_eq!((result.sent, result.discarded, result.failed), (2, 0, 1));
    assert_eq!(ana.pending_count(), 1);

    let failed = ana.store().outbox_get(user, queued[1]).await.unwrap().unwrap();
    assert_eq!(failed.attempt_count, 1);
    assert!(failed.error_message.unwrap().contains("timeout"));
    assert_eq!(ana.error_count().await.unwrap(), 1);

    server.fail_product(2, None).unwrap();
    let retry = completed(ana.sync_now(false).await.unwrap());
    assert_eq!(retry.sent, 1);
    assert_eq!(ana.pending_count(), 0);
}

#[tokio::test]
async fn replayed_outbox_entry_has_a_single_effect() {
    let server = server();
    let ana = open(&server, "ana", Role::Auditor).await;
    let user = ana.profile().user_id;

    ana.set_connectivity(ConnectivityState::Offline);
    ana.submit(count(&ana, &manifest()[0], Stage::First, 10)).await.unwrap();
    let entry = ana.store().outbox_list(user, cd(), ana.cycle_date()).await.unwrap().remove(0);

    // An earlier attempt reached the server but its answer was lost.
    server
        .as_user(ana.profile())
        .apply_event(entry.event_type, &entry.payload, entry.client_event_id)
        .await
        .unwrap();

    ana.set_connectivity(ConnectivityState::Online);
    let result = completed(ana.sync_now(false).await.unwrap());
    assert_eq!(result.sent, 1);
    assert_eq!(server.effect_count(), 1);
    assert_eq!(server.apply_log(), vec![entry.client_event_id, entry.client_event_id]);
}

#[tokio::test]
async fn optimistic_row_matches_the_confirmed_row() {
    let server = server();
    let ana = open(&server, "ana", Role::Auditor).await;
    let target = &manifest()[0].clone();

    ana.set_connectivity(ConnectivityState::Offline);
    ana.submit(surplus(&ana, target, Stage::First, 13)).await.unwrap();
    let optimistic = row(&ana, 1).await;

    ana.set_connectivity(ConnectivityState::Online);
    ana.sync_now(false).await.unwrap();
    let confirmed = row(&ana, 1).await;

    let direct = derive(&manifest(), &server.snapshot(cd(), ana.cycle_date()));
    assert_eq!(direct[0].first, confirmed.first);
    assert_eq!(server.snapshot(cd(), ana.cycle_date()).counts.len(), 1);

    let (a, b) = (optimistic.first.unwrap(), confirmed.first.unwrap());
    assert_eq!((a.counted_qty, a.result, a.barcode, a.counted_by), (b.counted_qty, b.result, b.barcode, b.counted_by));
    assert_eq!(optimistic.is_final, confirmed.is_final);
}

#[tokio::test]
async fn zone_lease_is_exclusive_until_it_expires() {
    let server = server();
    let ana = open(&server, "ana", Role::Auditor).await;
    let bia = open(&server, "bia", Role::Auditor).await;

    ana.enter_zone("a", Stage::First).await.unwrap();
    let err = bia.enter_zone("A", Stage::First).await.unwrap_err();
    assert!(matches!(err, SessionError::Lock(LockError::HeldByOther(_))));
    bia.enter_zone("A", Stage::Second).await.unwrap();

    server.advance(chrono::Duration::minutes(16));
    let lease = bia.enter_zone("A", Stage::First).await.unwrap();
    assert_eq!(lease.holder.name, "bia");
}

#[tokio::test]
async fn manifest_follows_the_remote_fingerprint() {
    let server = server();
    let ana = open(&server, "ana", Role::Auditor).await;

    let unchanged = completed(ana.sync_now(false).await.unwrap());
    assert!(!unchanged.manifest_refreshed);
    assert!(completed(ana.sync_now(true).await.unwrap()).manifest_refreshed);

    let mut next = manifest();
    next.push(item("C", "R09", 9, 1));
    server.publish_manifest(cd(), "hash-2", next).unwrap();
    assert!(completed(ana.sync_now(false).await.unwrap()).manifest_refreshed);
    assert_eq!(ana.zones().await.unwrap(), vec!["A", "B", "C"]);
}

#[tokio::test]
async fn incomplete_manifest_keeps_the_previous_snapshot() {
    let server = server();
    let ana = open(&server, "ana", Role::Auditor).await;

    server.publish_manifest(cd(), "hash-2", vec![item("Z", "R01", 8, 1)]).unwrap();
    server.misreport_row_count(cd(), 4).unwrap();

    let err = ana.sync_now(false).await.unwrap_err();
    assert!(matches!(
        err,
        SessionError::Sync(SyncError::IncompleteManifest { expected: 4, fetched: 1 })
    ));
    assert_eq!(ana.rows().await.unwrap().len(), 3);
}

#[tokio::test]
async fn overlapping_syncs_collapse_into_one() {
    let server = server();
    let ana = open(&server, "ana", Role::Auditor).await;

    let (a, b) = tokio::join!(ana.sync_now(false), ana.sync_now(false));
    let outcomes = [a.unwrap(), b.unwrap()];
    assert_eq!(outcomes.iter().filter(|o| **o == SyncOutcome::Skipped).count(), 1);
}

#[tokio::test]
async fn viewer_cannot_queue_counts() {
    let server = server();
    let vera = open(&server, "vera", Role::Viewer).await;
    vera.set_connectivity(ConnectivityState::Offline);

    let err = vera.submit(count(&vera, &manifest()[0], Stage::First, 1)).await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::Policy);
    assert_eq!(vera.pending_count(), 0);
}

#[tokio::test]
async fn worker_drains_the_outbox_on_reconnect() {
    let server = server();
    let config = EngineConfig::default().with_sync_interval(Duration::from_secs(3600));
    let ana = open_with(&server, profile("ana", Role::Auditor), config).await;
    let worker = ana.spawn_worker();

    ana.set_connectivity(ConnectivityState::Offline);
    ana.submit(count(&ana, &manifest()[2], Stage::First, 7)).await.unwrap();
    let mut pending = ana.subscribe_pending();
    assert_eq!(*pending.borrow_and_update(), 1);

    ana.set_connectivity(ConnectivityState::Online);
    tokio::time::timeout(Duration::from_secs(5), pending.wait_for(|n| *n == 0))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(server.effect_count(), 1);

    worker.shutdown().await;
}

#[tokio::test]
async fn preferences_are_persisted_per_user() {
    let server = server();
    let ana = profile("ana", Role::Auditor);
    let remote: Arc<dyn RemoteService> = Arc::new(server.as_user(&ana));

    let session = CountingSession::open(EngineConfig::default(), ana.clone(), remote).await.unwrap();
    assert_eq!(session.scope().unwrap().warehouse, cd());

    session.select_warehouse(WarehouseId::new(7)).await.unwrap();
    session.set_prefer_offline(true).await.unwrap();
    let prefs = session.store().preferences(ana.user_id).await.unwrap();
    assert_eq!(prefs.active_warehouse, Some(WarehouseId::new(7)));
    assert!(prefs.prefer_offline);
    assert!(session.offline().should_queue());

    session.logout().await.unwrap();
}

/// Delegates to the in-memory service but can answer pulls with a garbled body.
struct GarbledPull {
    inner: RemoteSession,
    garbled: AtomicBool,
}

#[async_trait]
impl RemoteService for GarbledPull {
    async fn manifest_meta(&self, warehouse: WarehouseId) -> Result<ManifestMeta, RemoteError> {
        self.inner.manifest_meta(warehouse).await
    }

    async fn manifest_items_page(
        &self,
        warehouse: WarehouseId,
        offset: u32,
        limit: u32,
    ) -> Result<Vec<ManifestItem>, RemoteError> {
        self.inner.manifest_items_page(warehouse, offset, limit).await
    }

    async fn sync_pull(
        &self,
        warehouse: WarehouseId,
        cycle_date: NaiveDate,
        since: Option<DateTime<Utc>>,
    ) -> Result<RemoteState, RemoteError> {
        if self.garbled.load(Ordering::SeqCst) {
            return wire::sync_pull(&json!([{ "counts": "nope", "reviews": [], "locks": [] }]), cycle_date);
        }
        self.inner.sync_pull(warehouse, cycle_date, since).await
    }

    async fn apply_event(
        &self,
        event_type: EventType,
        payload: &Value,
        client_event_id: ClientEventId,
    ) -> Result<ApplyResponse, RemoteError> {
        self.inner.apply_event(event_type, payload, client_event_id).await
    }

    async fn acquire_lock(
        &self,
        warehouse: WarehouseId,
        cycle_date: NaiveDate,
        zone: &str,
        stage: Stage,
        ttl: Duration,
    ) -> Result<ZoneLock, RemoteError> {
        self.inner.acquire_lock(warehouse, cycle_date, zone, stage, ttl).await
    }

    async fn heartbeat_lock(&self, lock_id: LockId, ttl: Duration) -> Result<ZoneLock, RemoteError> {
        self.inner.heartbeat_lock(lock_id, ttl).await
    }

    async fn release_lock(&self, lock_id: LockId) -> Result<bool, RemoteError> {
        self.inner.release_lock(lock_id).await
    }
}

#[tokio::test]
async fn malformed_pull_keeps_the_cached_rows() {
    let server = server();
    let ana_profile = profile("ana", Role::Auditor);
    let remote = Arc::new(GarbledPull {
        inner: server.as_user(&ana_profile),
        garbled: AtomicBool::new(false),
    });
    let ana = CountingSession::open(EngineConfig::default(), ana_profile, remote.clone())
        .await
        .unwrap();
    ana.sync_now(false).await.unwrap();

    let exact = &manifest()[0].clone();
    assert_eq!(ana.submit(count(&ana, exact, Stage::First, 10)).await.unwrap(), SubmitOutcome::Applied);
    assert!(row(&ana, 1).await.is_final);

    remote.garbled.store(true, Ordering::SeqCst);
    let err = ana.sync_now(false).await.unwrap_err();
    assert!(matches!(err, SessionError::Sync(SyncError::Remote(RemoteError::Malformed(_)))));

    let kept = row(&ana, 1).await;
    assert_eq!(kept.first.as_ref().unwrap().counted_qty, 10);
    assert!(kept.is_final);

    // An online submit whose follow-up pull is garbled still shows the accepted count.
    let short = &manifest()[1].clone();
    assert_eq!(ana.submit(count(&ana, short, Stage::First, 3)).await.unwrap(), SubmitOutcome::Applied);
    assert_eq!(row(&ana, 2).await.first.unwrap().result, CountResult::Short);
    assert!(row(&ana, 1).await.first.is_some());
    assert_eq!(server.effect_count(), 2);

    remote.garbled.store(false, Ordering::SeqCst);
    completed(ana.sync_now(false).await.unwrap());
    assert_eq!(row(&ana, 2).await.first.unwrap().counted_qty, 3);
}
