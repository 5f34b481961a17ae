use std::io;
use std::path::PathBuf;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;
use crate::wal::Wal;

use super::state::StoreState;
use super::{InsertOutcome, ReplaceError, Store, StoreError};

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type Pending = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Drain every Append already queued behind it.
/// 3. One flush_sync for the whole batch, then answer every sender.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }
        flush_and_respond(&mut wal, batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
    debug!("WAL writer stopped");
}

fn flush_and_respond(wal: &mut Wal, batch: Vec<Pending>) {
    metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = Instant::now();

    let mut result = Ok(());
    for (event, _) in &batch {
        if let Err(e) = wal.append_buffered(event) {
            result = Err(e);
            break;
        }
    }
    // Flush even after an append error so partially buffered bytes
    // don't leak into the next batch.
    let flushed = wal.flush_sync();
    if result.is_ok() {
        result = flushed;
    }
    metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    for (_, tx) in batch {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the caller"),
    }
}

/// Durable store: in-memory state, every change logged to the WAL first.
pub struct WalStore {
    state: StoreState,
    wal_tx: mpsc::Sender<WalCommand>,
    /// Serializes creation of businesses and profiles (check + append + insert).
    create_lock: Mutex<()>,
    /// Writers hold it shared; compaction holds it exclusively so no append
    /// can land between the snapshot and the file swap.
    compaction: RwLock<()>,
}

impl WalStore {
    /// Replay the WAL at `wal_path` and start the writer task.
    /// Must be called inside a tokio runtime.
    pub fn open(wal_path: PathBuf) -> io::Result<Self> {
        let events = Wal::recover(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let store = Self {
            state: StoreState::new(),
            wal_tx,
            create_lock: Mutex::new(()),
            compaction: RwLock::new(()),
        };

        // Sole owner of every lock during replay: try_write never contends.
        for event in &events {
            if store.state.apply_global(event) {
                continue;
            }
            if let Some(business_id) = event.business_id()
                && let Some(shared) = store.state.get_business(&business_id)
                && let Ok(mut guard) = shared.try_write()
            {
                store.state.apply_to_business(&mut guard, event);
            }
        }
        info!(
            "replayed {} events: {} businesses, {} profiles",
            events.len(),
            store.state.business_count(),
            store.state.profile_count()
        );

        Ok(store)
    }

    async fn wal_append(&self, event: &Event) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| StoreError::Unavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Unavailable("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }

    /// Log + apply a business-scoped event under the business write lock.
    async fn persist_business_event(&self, business_id: Ulid, event: Event) -> Result<(), StoreError> {
        let _shared = self.compaction.read().await;
        let shared = self
            .state
            .get_business(&business_id)
            .ok_or(StoreError::NotFound(business_id))?;
        let mut guard = shared.write().await;
        self.wal_append(&event).await?;
        self.state.apply_to_business(&mut guard, &event);
        Ok(())
    }

    /// Rewrite the WAL with the minimal events that recreate the current state.
    pub async fn compact(&self) -> Result<(), StoreError> {
        let _exclusive = self.compaction.write().await;

        let mut events: Vec<Event> = self
            .state
            .profiles()
            .into_iter()
            .map(|profile| Event::ProfileCreated { profile })
            .collect();

        for id in self.state.business_ids() {
            let Some(shared) = self.state.get_business(&id) else { continue };
            let guard = shared.read().await;
            events.push(Event::BusinessCreated { business: guard.business.clone() });
            if !guard.rules.is_empty() {
                events.push(Event::ScheduleReplaced {
                    business_id: id,
                    rules: guard.rules.clone(),
                });
            }
            events.extend(
                guard
                    .bookings
                    .iter()
                    .map(|b| Event::BookingConfirmed { booking: b.clone() }),
            );
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| StoreError::Unavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Unavailable("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

#[async_trait]
impl Store for WalStore {
    async fn business(&self, id: Ulid) -> Result<Option<Business>, StoreError> {
        match self.state.get_business(&id) {
            Some(shared) => Ok(Some(shared.read().await.business.clone())),
            None => Ok(None),
        }
    }

    async fn insert_business(&self, business: Business) -> Result<(), StoreError> {
        let _shared = self.compaction.read().await;
        let _create = self.create_lock.lock().await;
        if self.state.contains_business(&business.id) {
            return Err(StoreError::AlreadyExists(business.id.to_string()));
        }
        if self.state.business_count() >= MAX_BUSINESSES {
            return Err(StoreError::LimitExceeded("too many businesses"));
        }
        let event = Event::BusinessCreated { business };
        self.wal_append(&event).await?;
        self.state.apply_global(&event);
        Ok(())
    }

    async fn businesses(&self, owner_id: Option<&str>) -> Result<Vec<Business>, StoreError> {
        let mut out = Vec::new();
        for id in self.state.business_ids() {
            let Some(shared) = self.state.get_business(&id) else { continue };
            let guard = shared.read().await;
            if owner_id.is_none_or(|o| guard.business.owner_id == o) {
                out.push(guard.business.clone());
            }
        }
        out.sort_by_key(|b| b.id);
        Ok(out)
    }

    async fn profile(&self, user_id: &str) -> Result<Option<Profile>, StoreError> {
        Ok(self.state.get_profile(user_id))
    }

    async fn insert_profile(&self, profile: Profile) -> Result<(), StoreError> {
        let _shared = self.compaction.read().await;
        let _create = self.create_lock.lock().await;
        if self.state.get_profile(&profile.user_id).is_some() {
            return Err(StoreError::AlreadyExists(profile.user_id));
        }
        if self.state.profile_count() >= MAX_PROFILES {
            return Err(StoreError::LimitExceeded("too many profiles"));
        }
        let event = Event::ProfileCreated { profile };
        self.wal_append(&event).await?;
        self.state.apply_global(&event);
        Ok(())
    }

    async fn rules(&self, business_id: Ulid) -> Result<Vec<WeeklyRule>, StoreError> {
        let shared = self
            .state
            .get_business(&business_id)
            .ok_or(StoreError::NotFound(business_id))?;
        let guard = shared.read().await;
        Ok(guard.rules.clone())
    }

    async fn delete_rules(&self, business_id: Ulid) -> Result<(), StoreError> {
        self.persist_business_event(business_id, Event::RulesDeleted { business_id })
            .await
    }

    async fn insert_rules(&self, business_id: Ulid, rules: Vec<WeeklyRule>) -> Result<(), StoreError> {
        self.persist_business_event(business_id, Event::RulesInserted { business_id, rules })
            .await
    }

    /// One WAL record, so readers see either the old week or the new one.
    async fn replace_rules(&self, business_id: Ulid, rules: Vec<WeeklyRule>) -> Result<(), ReplaceError> {
        self.persist_business_event(business_id, Event::ScheduleReplaced { business_id, rules })
            .await
            .map_err(ReplaceError::Store)
    }

    async fn bookings(&self, business_id: Ulid) -> Result<Vec<Booking>, StoreError> {
        let shared = self
            .state
            .get_business(&business_id)
            .ok_or(StoreError::NotFound(business_id))?;
        let guard = shared.read().await;
        Ok(guard.bookings.clone())
    }

    async fn client_bookings(&self, client_id: &str) -> Result<Vec<Booking>, StoreError> {
        Ok(self.state.client_bookings(client_id))
    }

    async fn insert_booking_if_absent(&self, booking: Booking) -> Result<InsertOutcome, StoreError> {
        let _shared = self.compaction.read().await;
        let shared = self
            .state
            .get_business(&booking.business_id)
            .ok_or(StoreError::NotFound(booking.business_id))?;
        // Check and write under the same lock: the uniqueness key is
        // (business_id, start) and this guard covers the whole business.
        let mut guard = shared.write().await;
        if let Some(existing) = guard.booking_at(booking.span.start) {
            return Ok(InsertOutcome::Taken(existing.id));
        }
        if guard.bookings.len() >= MAX_BOOKINGS_PER_BUSINESS {
            return Err(StoreError::LimitExceeded("too many bookings on business"));
        }
        let event = Event::BookingConfirmed { booking: booking.clone() };
        self.wal_append(&event).await?;
        self.state.apply_to_business(&mut guard, &event);
        Ok(InsertOutcome::Inserted(booking))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;
    use std::sync::Arc;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("reserva_test_store");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn business(owner: &str) -> Business {
        Business {
            id: Ulid::new(),
            owner_id: owner.into(),
            name: "Peluquería Sol".into(),
            description: None,
            address: Some("Av. Siempreviva 742".into()),
        }
    }

    fn rule(weekday: WeekdayIndex) -> WeeklyRule {
        WeeklyRule {
            weekday,
            open: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            close: NaiveTime::from_hms_opt(12, 0, 0).unwrap(),
            slot_minutes: 30,
        }
    }

    fn booking(business_id: Ulid, client: &str, start: Ms) -> Booking {
        Booking {
            id: Ulid::new(),
            business_id,
            client_id: client.into(),
            span: Span::new(start, start + 30 * MINUTE_MS),
            status: BookingStatus::Confirmed,
        }
    }

    #[tokio::test]
    async fn duplicate_business_rejected() {
        let store = WalStore::open(test_wal_path("dup_business.wal")).unwrap();
        let b = business("olga");
        store.insert_business(b.clone()).await.unwrap();
        let again = store.insert_business(b.clone()).await;
        assert!(matches!(again, Err(StoreError::AlreadyExists(_))));
        assert_eq!(store.business(b.id).await.unwrap(), Some(b));
    }

    #[tokio::test]
    async fn businesses_filtered_by_owner() {
        let store = WalStore::open(test_wal_path("by_owner.wal")).unwrap();
        store.insert_business(business("olga")).await.unwrap();
        store.insert_business(business("olga")).await.unwrap();
        store.insert_business(business("pablo")).await.unwrap();
        assert_eq!(store.businesses(Some("olga")).await.unwrap().len(), 2);
        assert_eq!(store.businesses(None).await.unwrap().len(), 3);
        assert!(store.businesses(Some("nadie")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rules_on_unknown_business_not_found() {
        let store = WalStore::open(test_wal_path("rules_unknown.wal")).unwrap();
        let id = Ulid::new();
        assert_eq!(store.rules(id).await, Err(StoreError::NotFound(id)));
        assert_eq!(
            store.replace_rules(id, vec![rule(1)]).await,
            Err(ReplaceError::Store(StoreError::NotFound(id)))
        );
    }

    #[tokio::test]
    async fn insert_if_absent_reports_existing() {
        let store = WalStore::open(test_wal_path("if_absent.wal")).unwrap();
        let b = business("olga");
        store.insert_business(b.clone()).await.unwrap();

        let first = booking(b.id, "ana", 1_000_000);
        let outcome = store.insert_booking_if_absent(first.clone()).await.unwrap();
        assert_eq!(outcome, InsertOutcome::Inserted(first.clone()));

        let second = booking(b.id, "bruno", 1_000_000);
        let outcome = store.insert_booking_if_absent(second).await.unwrap();
        assert_eq!(outcome, InsertOutcome::Taken(first.id));
        assert_eq!(store.bookings(b.id).await.unwrap(), vec![first.clone()]);
        assert_eq!(store.client_bookings("ana").await.unwrap(), vec![first]);
        assert!(store.client_bookings("bruno").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn concurrent_inserts_single_winner() {
        let store = Arc::new(WalStore::open(test_wal_path("race.wal")).unwrap());
        let b = business("olga");
        store.insert_business(b.clone()).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            let bk = booking(b.id, &format!("client{i}"), 7_200_000);
            handles.push(tokio::spawn(async move { store.insert_booking_if_absent(bk).await }));
        }
        let mut inserted = 0;
        let mut taken = 0;
        for h in handles {
            match h.await.unwrap().unwrap() {
                InsertOutcome::Inserted(_) => inserted += 1,
                InsertOutcome::Taken(_) => taken += 1,
            }
        }
        assert_eq!(inserted, 1);
        assert_eq!(taken, 15);
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let path = test_wal_path("reopen.wal");
        let b = business("olga");
        let bk = booking(b.id, "ana", 3_600_000);
        {
            let store = WalStore::open(path.clone()).unwrap();
            store
                .insert_profile(Profile { user_id: "ana".into(), email: None, name: Some("Ana".into()), role: Role::Client })
                .await
                .unwrap();
            store.insert_business(b.clone()).await.unwrap();
            store.replace_rules(b.id, vec![rule(1), rule(2)]).await.unwrap();
            store.insert_booking_if_absent(bk.clone()).await.unwrap();
        }

        let store = WalStore::open(path).unwrap();
        assert_eq!(store.business(b.id).await.unwrap(), Some(b.clone()));
        assert_eq!(store.rules(b.id).await.unwrap(), vec![rule(1), rule(2)]);
        assert_eq!(store.bookings(b.id).await.unwrap(), vec![bk]);
        assert_eq!(store.profile("ana").await.unwrap().unwrap().name.as_deref(), Some("Ana"));
    }

    #[tokio::test]
    async fn booking_after_torn_tail_survives_second_restart() {
        use std::io::Write;

        let path = test_wal_path("torn_tail.wal");
        let b = business("olga");
        {
            let store = WalStore::open(path.clone()).unwrap();
            store.insert_business(b.clone()).await.unwrap();
        }
        {
            let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[40u8, 0, 0, 0, 1, 2]).unwrap();
        }

        let bk = booking(b.id, "ana", 5_400_000);
        {
            let store = WalStore::open(path.clone()).unwrap();
            let outcome = store.insert_booking_if_absent(bk.clone()).await.unwrap();
            assert_eq!(outcome, InsertOutcome::Inserted(bk.clone()));
        }
        {
            let store = WalStore::open(path.clone()).unwrap();
            assert_eq!(store.bookings(b.id).await.unwrap(), vec![bk.clone()]);
        }
        let store = WalStore::open(path).unwrap();
        assert_eq!(store.bookings(b.id).await.unwrap(), vec![bk.clone()]);
        let again = booking(b.id, "bruno", 5_400_000);
        assert_eq!(store.insert_booking_if_absent(again).await.unwrap(), InsertOutcome::Taken(bk.id));
    }

    #[tokio::test]
    async fn default_delete_then_insert_path() {
        let path = test_wal_path("delete_insert.wal");
        let b = business("olga");
        {
            let store = WalStore::open(path.clone()).unwrap();
            store.insert_business(b.clone()).await.unwrap();
            store.insert_rules(b.id, vec![rule(4)]).await.unwrap();
            store.delete_rules(b.id).await.unwrap();
            store.insert_rules(b.id, vec![rule(6), rule(0)]).await.unwrap();
            assert_eq!(store.rules(b.id).await.unwrap(), vec![rule(0), rule(6)]);
        }
        let store = WalStore::open(path).unwrap();
        assert_eq!(store.rules(b.id).await.unwrap(), vec![rule(0), rule(6)]);
    }

    #[tokio::test]
    async fn repeated_weekday_insert_replaces_rule() {
        let path = test_wal_path("weekday_replace.wal");
        let b = business("olga");
        let mut afternoon = rule(2);
        afternoon.open = NaiveTime::from_hms_opt(14, 0, 0).unwrap();
        afternoon.close = NaiveTime::from_hms_opt(18, 0, 0).unwrap();
        {
            let store = WalStore::open(path.clone()).unwrap();
            store.insert_business(b.clone()).await.unwrap();
            store.insert_rules(b.id, vec![rule(2), rule(3)]).await.unwrap();
            store.insert_rules(b.id, vec![afternoon]).await.unwrap();
            assert_eq!(store.rules(b.id).await.unwrap(), vec![afternoon, rule(3)]);
        }
        let store = WalStore::open(path).unwrap();
        assert_eq!(store.rules(b.id).await.unwrap(), vec![afternoon, rule(3)]);
    }

    #[tokio::test]
    async fn compact_preserves_state_and_resets_counter() {
        let path = test_wal_path("compact.wal");
        let b = business("olga");
        {
            let store = WalStore::open(path.clone()).unwrap();
            store.insert_business(b.clone()).await.unwrap();
            for day in 0..7 {
                store.replace_rules(b.id, vec![rule(day)]).await.unwrap();
            }
            store.insert_booking_if_absent(booking(b.id, "ana", 9_000_000)).await.unwrap();
            assert_eq!(store.wal_appends_since_compact().await, 9);

            let before = std::fs::metadata(&path).unwrap().len();
            store.compact().await.unwrap();
            let after = std::fs::metadata(&path).unwrap().len();
            assert!(after < before, "compacted WAL should be smaller: {after} < {before}");
            assert_eq!(store.wal_appends_since_compact().await, 0);
        }
        let store = WalStore::open(path).unwrap();
        assert_eq!(store.rules(b.id).await.unwrap(), vec![rule(6)]);
        assert_eq!(store.bookings(b.id).await.unwrap().len(), 1);
    }
}
