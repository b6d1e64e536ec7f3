//! In-memory reconciliation service.
//!
//! Intended for tests/dev. Implements the authoritative rules the engine relies
//! on: idempotent event application, stage rules, review creation on
//! disagreement, cycle closing and lease exclusivity with expiry. The clock
//! and connectivity are controllable.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use countsync_core::{ClientEventId, LockId, WarehouseId};
use countsync_counting::{
    CountEvent, CountRecord, CountResult, CountUpsert, EventType, ItemKey, ManifestItem, ManifestMeta, Profile,
    RemoteState, ReviewReason, ReviewRecord, ReviewResolve, ReviewStatus, Stage, ZoneLock, normalize_zone,
};
use serde_json::{Value, json};

use super::{ApplyResponse, BarcodeCatalog, RemoteError, RemoteService};

type CountKey = (WarehouseId, NaiveDate, ItemKey, Stage);
type ReviewKey = (WarehouseId, NaiveDate, ItemKey);

#[derive(Debug, Default)]
struct ServerState {
    manifests: HashMap<WarehouseId, (ManifestMeta, Vec<ManifestItem>)>,
    counts: BTreeMap<CountKey, CountRecord>,
    reviews: BTreeMap<ReviewKey, ReviewRecord>,
    locks: HashMap<LockId, ZoneLock>,
    applied: HashMap<ClientEventId, ApplyResponse>,
    closed_cycles: HashSet<(WarehouseId, NaiveDate)>,
    barcodes: HashMap<String, u64>,
    failing_products: HashMap<u64, RemoteError>,
    apply_log: Vec<ClientEventId>,
    effects: usize,
    offline: bool,
    fixed_now: Option<DateTime<Utc>>,
}

impl ServerState {
    fn now(&self) -> DateTime<Utc> {
        self.fixed_now.unwrap_or_else(Utc::now)
    }

    fn ensure_online(&self) -> Result<(), RemoteError> {
        if self.offline {
            return Err(RemoteError::Network("remote service unreachable".into()));
        }
        Ok(())
    }

    fn ensure_open(&self, warehouse: WarehouseId, cycle_date: NaiveDate) -> Result<(), RemoteError> {
        if self.closed_cycles.contains(&(warehouse, cycle_date)) {
            return Err(RemoteError::rejected("CICLO_ENCERRADO"));
        }
        Ok(())
    }

    fn manifest_item(&self, warehouse: WarehouseId, key: &ItemKey) -> Result<ManifestItem, RemoteError> {
        self.manifests
            .get(&warehouse)
            .and_then(|(_, items)| items.iter().find(|item| &item.key() == key))
            .cloned()
            .ok_or_else(|| RemoteError::rejected("ITEM_NAO_ENCONTRADO"))
    }

    fn purge_expired_locks(&mut self) {
        let now = self.now();
        self.locks.retain(|_, lock| lock.is_live_at(now));
    }

    fn check_barcode(&self, barcode: Option<&str>, product_code: u64) -> Result<(), RemoteError> {
        match barcode {
            None => Err(RemoteError::rejected("BARRAS_INVALIDA_CODDV: barcode required")),
            Some(code) => match self.barcodes.get(code) {
                Some(&registered) if registered != product_code => {
                    Err(RemoteError::rejected("BARRAS_INVALIDA_CODDV"))
                }
                _ => Ok(()),
            },
        }
    }

    fn apply_count(&mut self, e: CountUpsert, actor: &Profile) -> Result<(), RemoteError> {
        let key = ItemKey::new(&e.zone, &e.address, e.product_code);
        let item = self.manifest_item(e.warehouse, &key)?;
        let review_key = (e.warehouse, e.cycle_date, key.clone());

        if self.reviews.get(&review_key).is_some_and(|r| r.is_resolved()) {
            return Err(RemoteError::rejected("ITEM_JA_RESOLVIDO"));
        }

        self.purge_expired_locks();
        let held_by_other = self.locks.values().any(|lock| {
            lock.covers(e.warehouse, e.cycle_date, &key.zone, e.stage) && lock.holder.user_id != actor.user_id
        });
        if held_by_other {
            return Err(RemoteError::rejected("ZONA_TRAVADA_OUTRO_USUARIO"));
        }

        let first_key = (e.warehouse, e.cycle_date, key.clone(), Stage::First);
        let second_key = (e.warehouse, e.cycle_date, key.clone(), Stage::Second);
        let first = self.counts.get(&first_key);
        let second = self.counts.get(&second_key);

        match e.stage {
            Stage::First => {
                if second.is_some() {
                    return Err(RemoteError::rejected("ETAPA1_BLOQUEADA_SEGUNDA_EXISTE"));
                }
                if first.is_some_and(|c| c.counted_by.user_id != actor.user_id) {
                    return Err(RemoteError::rejected("ETAPA1_APENAS_AUTOR"));
                }
            }
            Stage::Second => {
                let Some(first) = first else {
                    return Err(RemoteError::rejected("ETAPA1_OBRIGATORIA"));
                };
                if !first.result.is_surplus() {
                    return Err(RemoteError::rejected("ETAPA2_APENAS_QUANDO_SOBRA"));
                }
                match second {
                    None if first.counted_by.user_id == actor.user_id => {
                        return Err(RemoteError::rejected("SEGUNDA_CONTAGEM_EXIGE_USUARIO_DIFERENTE"));
                    }
                    Some(c) if c.counted_by.user_id != actor.user_id => {
                        return Err(RemoteError::rejected("ETAPA2_APENAS_AUTOR"));
                    }
                    _ => {}
                }
            }
        }

        // The manifest is authoritative for the expected quantity.
        let result = CountResult::classify(item.expected_qty, e.counted_qty, e.discarded);
        if result.is_surplus() {
            self.check_barcode(e.barcode.as_deref(), item.product_code)?;
        }

        let now = self.now();
        let record = CountRecord {
            cycle_date: e.cycle_date,
            warehouse: e.warehouse,
            zone: key.zone.clone(),
            address: key.address.clone(),
            product_code: item.product_code,
            description: item.description.clone(),
            expected_qty: item.expected_qty,
            stage: e.stage,
            counted_qty: if e.discarded { 0 } else { e.counted_qty },
            barcode: if result.is_surplus() { e.barcode } else { None },
            result,
            counted_by: actor.counter(),
            updated_at: now,
        };
        self.counts.insert((e.warehouse, e.cycle_date, key, e.stage), record);
        self.refresh_review(&item, review_key, now);
        Ok(())
    }

    /// Raise, refresh or withdraw the no-consensus review of one item.
    fn refresh_review(&mut self, item: &ManifestItem, review_key: ReviewKey, now: DateTime<Utc>) {
        let (warehouse, cycle_date, key) = review_key.clone();
        let first = self.counts.get(&(warehouse, cycle_date, key.clone(), Stage::First));
        let second = self.counts.get(&(warehouse, cycle_date, key, Stage::Second));

        let disagreement = match (first, second) {
            (Some(a), Some(b)) => {
                !a.result.is_discarded() && !b.result.is_discarded() && a.counted_qty != b.counted_qty
            }
            _ => false,
        };

        if disagreement {
            let snapshot = json!({
                "estoque": item.expected_qty,
                "qtd_primeira": first.map(|c| c.counted_qty),
                "qtd_segunda": second.map(|c| c.counted_qty),
            });
            self.reviews.insert(
                review_key,
                ReviewRecord {
                    cycle_date,
                    warehouse,
                    zone: item.key().zone,
                    address: item.key().address,
                    product_code: item.product_code,
                    description: item.description.clone(),
                    expected_qty: item.expected_qty,
                    reason: ReviewReason::NoConsensus,
                    snapshot,
                    status: ReviewStatus::Pending,
                    final_qty: None,
                    final_barcode: None,
                    final_result: None,
                    resolved_by: None,
                    resolved_at: None,
                    updated_at: now,
                },
            );
        } else if self.reviews.get(&review_key).is_some_and(|r| !r.is_resolved()) {
            self.reviews.remove(&review_key);
        }
    }

    fn apply_resolution(&mut self, e: ReviewResolve, actor: &Profile) -> Result<(), RemoteError> {
        if !actor.role.can_edit() {
            return Err(RemoteError::rejected("APENAS_ADMIN"));
        }
        let key = ItemKey::new(&e.zone, &e.address, e.product_code);
        let item = self.manifest_item(e.warehouse, &key)?;
        let result = CountResult::classify(item.expected_qty, e.final_qty, false);
        if result.is_surplus() {
            self.check_barcode(e.final_barcode.as_deref(), item.product_code)?;
        }

        let now = self.now();
        let review = self
            .reviews
            .get_mut(&(e.warehouse, e.cycle_date, key))
            .ok_or_else(|| RemoteError::rejected("REVISAO_NAO_ENCONTRADA"))?;
        if review.is_resolved() {
            return Err(RemoteError::rejected("ITEM_JA_RESOLVIDO"));
        }
        review.status = ReviewStatus::Resolved;
        review.final_qty = Some(e.final_qty);
        review.final_barcode = if result.is_surplus() { e.final_barcode } else { None };
        review.final_result = Some(result);
        review.resolved_by = Some(actor.counter());
        review.resolved_at = Some(now);
        review.updated_at = now;
        Ok(())
    }
}

/// Shared in-memory server. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRemote {
    state: Arc<Mutex<ServerState>>,
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, ServerState>, RemoteError> {
        self.state
            .lock()
            .map_err(|_| RemoteError::Network("server state lock poisoned".into()))
    }

    /// A connection authenticated as `profile`.
    pub fn as_user(&self, profile: &Profile) -> RemoteSession {
        RemoteSession {
            server: self.clone(),
            profile: profile.clone(),
        }
    }

    /// Publish (or replace) a warehouse manifest under `fingerprint`.
    pub fn publish_manifest(
        &self,
        warehouse: WarehouseId,
        fingerprint: &str,
        items: Vec<ManifestItem>,
    ) -> Result<ManifestMeta, RemoteError> {
        let mut state = self.lock()?;
        let zones: HashSet<String> = items.iter().map(|item| item.key().zone).collect();
        let meta = ManifestMeta {
            warehouse,
            row_count: u32::try_from(items.len()).unwrap_or(u32::MAX),
            zone_count: u32::try_from(zones.len()).unwrap_or(u32::MAX),
            fingerprint: fingerprint.to_string(),
            generated_at: state.now(),
            source_run_id: None,
        };
        state.manifests.insert(warehouse, (meta.clone(), items));
        Ok(meta)
    }

    /// Advertise a row count that differs from the published items.
    pub fn misreport_row_count(&self, warehouse: WarehouseId, row_count: u32) -> Result<(), RemoteError> {
        let mut state = self.lock()?;
        if let Some((meta, _)) = state.manifests.get_mut(&warehouse) {
            meta.row_count = row_count;
        }
        Ok(())
    }

    pub fn register_barcode(&self, barcode: &str, product_code: u64) -> Result<(), RemoteError> {
        self.lock()?.barcodes.insert(barcode.trim().to_string(), product_code);
        Ok(())
    }

    pub fn close_cycle(&self, warehouse: WarehouseId, cycle_date: NaiveDate) -> Result<(), RemoteError> {
        self.lock()?.closed_cycles.insert((warehouse, cycle_date));
        Ok(())
    }

    /// Make every event targeting `product_code` fail with `error` (or stop failing).
    pub fn fail_product(&self, product_code: u64, error: Option<RemoteError>) -> Result<(), RemoteError> {
        let mut state = self.lock()?;
        match error {
            Some(error) => state.failing_products.insert(product_code, error),
            None => state.failing_products.remove(&product_code),
        };
        Ok(())
    }

    /// Simulate loss (or return) of connectivity for every session.
    pub fn set_offline(&self, offline: bool) {
        if let Ok(mut state) = self.lock() {
            state.offline = offline;
        }
    }

    /// Freeze the clock at `now`.
    pub fn set_now(&self, now: DateTime<Utc>) {
        if let Ok(mut state) = self.lock() {
            state.fixed_now = Some(now);
        }
    }

    /// Move the clock forward; the clock stays frozen afterwards.
    pub fn advance(&self, by: chrono::Duration) {
        if let Ok(mut state) = self.lock() {
            let now = state.now();
            state.fixed_now = Some(now + by);
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.lock().map(|s| s.now()).unwrap_or_else(|_| Utc::now())
    }

    /// Client event ids in the order they reached `apply_event`, replays included.
    pub fn apply_log(&self) -> Vec<ClientEventId> {
        self.lock().map(|s| s.apply_log.clone()).unwrap_or_default()
    }

    /// Number of mutations that changed server state.
    pub fn effect_count(&self) -> usize {
        self.lock().map(|s| s.effects).unwrap_or_default()
    }

    /// Authoritative state of one cycle.
    pub fn snapshot(&self, warehouse: WarehouseId, cycle_date: NaiveDate) -> RemoteState {
        match self.lock() {
            Ok(mut state) => pull(&mut state, warehouse, cycle_date),
            Err(_) => RemoteState::default(),
        }
    }
}

fn pull(state: &mut ServerState, warehouse: WarehouseId, cycle_date: NaiveDate) -> RemoteState {
    state.purge_expired_locks();
    RemoteState {
        counts: state
            .counts
            .iter()
            .filter(|((cd, cycle, _, _), _)| *cd == warehouse && *cycle == cycle_date)
            .map(|(_, c)| c.clone())
            .collect(),
        reviews: state
            .reviews
            .iter()
            .filter(|((cd, cycle, _), _)| *cd == warehouse && *cycle == cycle_date)
            .map(|(_, r)| r.clone())
            .collect(),
        locks: state
            .locks
            .values()
            .filter(|l| l.warehouse == warehouse && l.cycle_date == cycle_date)
            .cloned()
            .collect(),
        server_time: Some(state.now()),
    }
}

fn ttl_duration(ttl: Duration) -> Result<chrono::Duration, RemoteError> {
    chrono::Duration::from_std(ttl).map_err(|e| RemoteError::Malformed(format!("invalid ttl: {e}")))
}

/// One authenticated connection to an [`InMemoryRemote`].
#[derive(Debug, Clone)]
pub struct RemoteSession {
    server: InMemoryRemote,
    profile: Profile,
}

impl RemoteSession {
    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    pub fn server(&self) -> &InMemoryRemote {
        &self.server
    }
}

#[async_trait]
impl RemoteService for RemoteSession {
    async fn manifest_meta(&self, warehouse: WarehouseId) -> Result<ManifestMeta, RemoteError> {
        let state = self.server.lock()?;
        state.ensure_online()?;
        state
            .manifests
            .get(&warehouse)
            .map(|(meta, _)| meta.clone())
            .ok_or_else(|| RemoteError::Malformed(format!("no manifest for warehouse {warehouse}")))
    }

    async fn manifest_items_page(
        &self,
        warehouse: WarehouseId,
        offset: u32,
        limit: u32,
    ) -> Result<Vec<ManifestItem>, RemoteError> {
        let state = self.server.lock()?;
        state.ensure_online()?;
        let items = state.manifests.get(&warehouse).map(|(_, items)| items.as_slice()).unwrap_or_default();
        Ok(items
            .iter()
            .skip(offset as usize)
            .take(limit.max(1) as usize)
            .cloned()
            .collect())
    }

    /// Always a full snapshot of the cycle; `since` is accepted for interface
    /// compatibility.
    async fn sync_pull(
        &self,
        warehouse: WarehouseId,
        cycle_date: NaiveDate,
        _since: Option<DateTime<Utc>>,
    ) -> Result<RemoteState, RemoteError> {
        let mut state = self.server.lock()?;
        state.ensure_online()?;
        Ok(pull(&mut state, warehouse, cycle_date))
    }

    async fn apply_event(
        &self,
        event_type: EventType,
        payload: &Value,
        client_event_id: ClientEventId,
    ) -> Result<ApplyResponse, RemoteError> {
        let mut state = self.server.lock()?;
        state.ensure_online()?;
        state.apply_log.push(client_event_id);

        if let Some(previous) = state.applied.get(&client_event_id) {
            return Ok(previous.clone());
        }

        let event = CountEvent::from_payload(event_type, payload)
            .map_err(|e| RemoteError::rejected(format!("PAYLOAD_INVALIDO: {e}")))?
            .normalized();

        if let Some(error) = state.failing_products.get(&event.key().product_code) {
            return Err(error.clone());
        }
        if !self.profile.role.can_edit() {
            return Err(RemoteError::rejected("APENAS_ADMIN"));
        }
        state.ensure_open(event.warehouse(), event.cycle_date())?;

        match event {
            CountEvent::CountUpsert(e) => state.apply_count(e, &self.profile)?,
            CountEvent::ReviewResolve(e) => state.apply_resolution(e, &self.profile)?,
        }

        let response = ApplyResponse {
            accepted: true,
            info: "ok".into(),
            updated_at: state.now(),
        };
        state.effects += 1;
        state.applied.insert(client_event_id, response.clone());
        Ok(response)
    }

    async fn acquire_lock(
        &self,
        warehouse: WarehouseId,
        cycle_date: NaiveDate,
        zone: &str,
        stage: Stage,
        ttl: Duration,
    ) -> Result<ZoneLock, RemoteError> {
        let ttl = ttl_duration(ttl)?;
        let mut state = self.server.lock()?;
        state.ensure_online()?;
        state.ensure_open(warehouse, cycle_date)?;
        state.purge_expired_locks();

        let zone = normalize_zone(zone);
        let now = state.now();
        let existing = state
            .locks
            .values_mut()
            .find(|lock| lock.covers(warehouse, cycle_date, &zone, stage));

        match existing {
            Some(lock) if lock.holder.user_id == self.profile.user_id => {
                lock.heartbeat_at = now;
                lock.expires_at = now + ttl;
                Ok(lock.clone())
            }
            Some(lock) => Err(RemoteError::rejected(format!(
                "ZONA_TRAVADA_OUTRO_USUARIO: {} ({})",
                lock.holder.name, lock.holder.badge
            ))),
            None => {
                let lock = ZoneLock {
                    lock_id: LockId::new(),
                    cycle_date,
                    warehouse,
                    zone,
                    stage,
                    holder: self.profile.counter(),
                    heartbeat_at: now,
                    expires_at: now + ttl,
                };
                state.locks.insert(lock.lock_id, lock.clone());
                Ok(lock)
            }
        }
    }

    async fn heartbeat_lock(&self, lock_id: LockId, ttl: Duration) -> Result<ZoneLock, RemoteError> {
        let ttl = ttl_duration(ttl)?;
        let mut state = self.server.lock()?;
        state.ensure_online()?;
        state.purge_expired_locks();
        let now = state.now();
        match state.locks.get_mut(&lock_id) {
            Some(lock) if lock.holder.user_id == self.profile.user_id => {
                lock.heartbeat_at = now;
                lock.expires_at = now + ttl;
                Ok(lock.clone())
            }
            _ => Err(RemoteError::rejected("LOCK_EXPIRADO")),
        }
    }

    async fn release_lock(&self, lock_id: LockId) -> Result<bool, RemoteError> {
        let mut state = self.server.lock()?;
        state.ensure_online()?;
        let owned = state
            .locks
            .get(&lock_id)
            .is_some_and(|lock| lock.holder.user_id == self.profile.user_id);
        if owned {
            state.locks.remove(&lock_id);
        }
        Ok(owned)
    }
}

/// Barcode catalog backed by a map.
///
/// Intended for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryBarcodeCatalog {
    entries: RwLock<HashMap<String, u64>>,
}

impl InMemoryBarcodeCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, barcode: &str, product_code: u64) -> Self {
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(barcode.trim().to_string(), product_code);
        }
        self
    }
}

#[async_trait]
impl BarcodeCatalog for InMemoryBarcodeCatalog {
    async fn product_for(&self, barcode: &str) -> Result<Option<u64>, RemoteError> {
        let entries = self
            .entries
            .read()
            .map_err(|_| RemoteError::Network("catalog lock poisoned".into()))?;
        Ok(entries.get(barcode.trim()).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use countsync_core::UserId;
    use countsync_counting::Role;

    fn profile(name: &str) -> Profile {
        Profile {
            user_id: UserId::new(),
            badge: name.to_uppercase(),
            name: name.into(),
            role: Role::Auditor,
            default_warehouse: None,
        }
    }

    fn cd() -> WarehouseId {
        WarehouseId::new(2)
    }

    fn cycle() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, 10).unwrap()
    }

    fn item() -> ManifestItem {
        ManifestItem {
            warehouse: cd(),
            zone: "A".into(),
            address: "R1".into(),
            product_code: 5,
            description: "P5".into(),
            expected_qty: 10,
        }
    }

    fn server() -> InMemoryRemote {
        let server = InMemoryRemote::new();
        server.set_now(Utc.with_ymd_and_hms(2025, 3, 10, 12, 0, 0).unwrap());
        server.publish_manifest(cd(), "h1", vec![item()]).unwrap();
        server
    }

    fn upsert(stage: Stage, qty: u32) -> Value {
        CountEvent::from(CountUpsert::for_item(&item(), cycle(), stage, qty).with_barcode("789"))
            .to_payload()
            .unwrap()
    }

    #[tokio::test]
    async fn replayed_event_has_a_single_effect() {
        let server = server();
        let ana = server.as_user(&profile("ana"));
        let id = ClientEventId::new();

        let first = ana.apply_event(EventType::CountUpsert, &upsert(Stage::First, 10), id).await.unwrap();
        let again = ana.apply_event(EventType::CountUpsert, &upsert(Stage::First, 10), id).await.unwrap();
        assert_eq!(first, again);
        assert_eq!(server.effect_count(), 1);
        assert_eq!(server.apply_log(), vec![id, id]);
    }

    #[tokio::test]
    async fn disagreement_raises_review_and_agreement_does_not() {
        let server = server();
        let ana = server.as_user(&profile("ana"));
        let bia = server.as_user(&profile("bia"));

        ana.apply_event(EventType::CountUpsert, &upsert(Stage::First, 12), ClientEventId::new()).await.unwrap();
        let err = ana
            .apply_event(EventType::CountUpsert, &upsert(Stage::Second, 12), ClientEventId::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("SEGUNDA_CONTAGEM_EXIGE_USUARIO_DIFERENTE"));

        bia.apply_event(EventType::CountUpsert, &upsert(Stage::Second, 9), ClientEventId::new()).await.unwrap();
        let state = server.snapshot(cd(), cycle());
        assert_eq!(state.reviews.len(), 1);
        assert_eq!(state.reviews[0].status, ReviewStatus::Pending);

        bia.apply_event(EventType::CountUpsert, &upsert(Stage::Second, 12), ClientEventId::new()).await.unwrap();
        assert!(server.snapshot(cd(), cycle()).reviews.is_empty());
    }

    #[tokio::test]
    async fn closed_cycle_rejects_terminally() {
        let server = server();
        server.close_cycle(cd(), cycle()).unwrap();
        let err = server
            .as_user(&profile("ana"))
            .apply_event(EventType::CountUpsert, &upsert(Stage::First, 10), ClientEventId::new())
            .await
            .unwrap_err();
        assert!(err.is_terminal());
    }

    #[tokio::test]
    async fn leases_are_exclusive_until_expiry() {
        let server = server();
        let ana = server.as_user(&profile("ana"));
        let bia = server.as_user(&profile("bia"));
        let ttl = Duration::from_secs(900);

        let lease = ana.acquire_lock(cd(), cycle(), "a", Stage::First, ttl).await.unwrap();
        assert_eq!(lease.zone, "A");
        let err = bia.acquire_lock(cd(), cycle(), "A", Stage::First, ttl).await.unwrap_err();
        assert_eq!(err.class(), crate::remote::ErrorClass::Policy);
        assert!(bia.acquire_lock(cd(), cycle(), "A", Stage::Second, ttl).await.is_ok());

        server.advance(chrono::Duration::seconds(901));
        assert!(ana.heartbeat_lock(lease.lock_id, ttl).await.is_err());
        assert!(bia.acquire_lock(cd(), cycle(), "A", Stage::First, ttl).await.is_ok());
        assert!(!ana.release_lock(lease.lock_id).await.unwrap());
    }

    #[tokio::test]
    async fn offline_server_is_a_network_error() {
        let server = server();
        server.set_offline(true);
        let err = server.as_user(&profile("ana")).manifest_meta(cd()).await.unwrap_err();
        assert!(matches!(err, RemoteError::Network(_)));
    }

    #[tokio::test]
    async fn catalog_resolves_trimmed_barcodes() {
        let catalog = InMemoryBarcodeCatalog::new().with("789", 5);
        assert_eq!(catalog.product_for(" 789 ").await.unwrap(), Some(5));
        assert_eq!(catalog.product_for("000").await.unwrap(), None);
    }
}
