use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::model::*;

pub type SharedBusinessState = Arc<RwLock<BusinessState>>;

#[derive(Debug, Clone)]
pub struct BusinessState {
    pub business: Business,
    /// At most one rule per weekday, sorted by weekday.
    pub rules: Vec<WeeklyRule>,
    /// Sorted by `span.start`; starts are unique.
    pub bookings: Vec<Booking>,
}

impl BusinessState {
    pub fn new(business: Business) -> Self {
        Self {
            business,
            rules: Vec::new(),
            bookings: Vec::new(),
        }
    }

    pub fn booking_at(&self, start: Ms) -> Option<&Booking> {
        self.bookings
            .binary_search_by_key(&start, |b| b.span.start)
            .ok()
            .map(|pos| &self.bookings[pos])
    }

    /// Insert keeping sort order. Returns false (and leaves state untouched)
    /// if the start is already booked.
    pub fn insert_booking(&mut self, booking: Booking) -> bool {
        match self
            .bookings
            .binary_search_by_key(&booking.span.start, |b| b.span.start)
        {
            Ok(_) => false,
            Err(pos) => {
                self.bookings.insert(pos, booking);
                true
            }
        }
    }

    fn set_rules(&mut self, mut rules: Vec<WeeklyRule>) {
        rules.sort_by_key(|r| r.weekday);
        self.rules = rules;
    }

    /// At most one rule per weekday; a later rule for a weekday replaces
    /// the earlier one.
    fn append_rules(&mut self, rules: &[WeeklyRule]) {
        let mut merged = std::mem::take(&mut self.rules);
        for rule in rules {
            match merged.iter_mut().find(|r| r.weekday == rule.weekday) {
                Some(existing) => *existing = *rule,
                None => merged.push(*rule),
            }
        }
        self.set_rules(merged);
    }
}

/// In-memory indexed state. Events from the WAL are applied here.
pub struct StoreState {
    businesses: DashMap<Ulid, SharedBusinessState>,
    profiles: DashMap<String, Profile>,
    /// client id → their bookings (copies; bookings are immutable)
    by_client: DashMap<String, Vec<Booking>>,
}

impl Default for StoreState {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreState {
    pub fn new() -> Self {
        Self {
            businesses: DashMap::new(),
            profiles: DashMap::new(),
            by_client: DashMap::new(),
        }
    }

    // ── Businesses ───────────────────────────────────────────

    pub fn business_count(&self) -> usize {
        self.businesses.len()
    }

    pub fn contains_business(&self, id: &Ulid) -> bool {
        self.businesses.contains_key(id)
    }

    pub fn get_business(&self, id: &Ulid) -> Option<SharedBusinessState> {
        self.businesses.get(id).map(|e| e.value().clone())
    }

    pub fn business_ids(&self) -> Vec<Ulid> {
        self.businesses.iter().map(|e| *e.key()).collect()
    }

    // ── Profiles ─────────────────────────────────────────────

    pub fn profile_count(&self) -> usize {
        self.profiles.len()
    }

    pub fn get_profile(&self, user_id: &str) -> Option<Profile> {
        self.profiles.get(user_id).map(|e| e.value().clone())
    }

    pub fn profiles(&self) -> Vec<Profile> {
        self.profiles.iter().map(|e| e.value().clone()).collect()
    }

    pub fn client_bookings(&self, client_id: &str) -> Vec<Booking> {
        self.by_client
            .get(client_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    // ── Event application ────────────────────────────────────

    /// Apply a global event (one that creates an entry in an index).
    /// Returns false for business-scoped events, which go through `apply_to_business`.
    pub fn apply_global(&self, event: &Event) -> bool {
        match event {
            Event::BusinessCreated { business } => {
                let state = BusinessState::new(business.clone());
                self.businesses
                    .insert(business.id, Arc::new(RwLock::new(state)));
                true
            }
            Event::ProfileCreated { profile } => {
                self.profiles.insert(profile.user_id.clone(), profile.clone());
                true
            }
            _ => false,
        }
    }

    /// Apply a business-scoped event. The caller holds the write lock.
    pub fn apply_to_business(&self, bs: &mut BusinessState, event: &Event) {
        match event {
            Event::RulesDeleted { .. } => bs.rules.clear(),
            Event::RulesInserted { rules, .. } => bs.append_rules(rules),
            Event::ScheduleReplaced { rules, .. } => bs.set_rules(rules.clone()),
            Event::BookingConfirmed { booking } => {
                if bs.insert_booking(booking.clone()) {
                    let mut list = self.by_client.entry(booking.client_id.clone()).or_default();
                    let pos = list
                        .binary_search_by_key(&booking.span.start, |b| b.span.start)
                        .unwrap_or_else(|e| e);
                    list.insert(pos, booking.clone());
                }
            }
            Event::BusinessCreated { .. } | Event::ProfileCreated { .. } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;

    fn business() -> Business {
        Business {
            id: Ulid::new(),
            owner_id: "olga".into(),
            name: "Barbería".into(),
            description: None,
            address: None,
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

    fn rule(weekday: WeekdayIndex) -> WeeklyRule {
        WeeklyRule {
            weekday,
            open: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            close: NaiveTime::from_hms_opt(17, 0, 0).unwrap(),
            slot_minutes: 30,
        }
    }

    #[test]
    fn bookings_kept_sorted_and_unique() {
        let b = business();
        let mut bs = BusinessState::new(b.clone());
        assert!(bs.insert_booking(booking(b.id, "c1", 3000)));
        assert!(bs.insert_booking(booking(b.id, "c2", 1000)));
        assert!(bs.insert_booking(booking(b.id, "c3", 2000)));
        assert!(!bs.insert_booking(booking(b.id, "c4", 2000)));
        let starts: Vec<Ms> = bs.bookings.iter().map(|b| b.span.start).collect();
        assert_eq!(starts, vec![1000, 2000, 3000]);
        assert_eq!(bs.booking_at(2000).unwrap().client_id, "c3");
        assert!(bs.booking_at(2500).is_none());
    }

    #[tokio::test]
    async fn apply_schedule_events() {
        let state = StoreState::new();
        let b = business();
        assert!(state.apply_global(&Event::BusinessCreated { business: b.clone() }));
        let shared = state.get_business(&b.id).unwrap();
        let mut guard = shared.write().await;

        state.apply_to_business(&mut guard, &Event::RulesInserted { business_id: b.id, rules: vec![rule(5), rule(1)] });
        assert_eq!(guard.rules.iter().map(|r| r.weekday).collect::<Vec<_>>(), vec![1, 5]);

        state.apply_to_business(&mut guard, &Event::ScheduleReplaced { business_id: b.id, rules: vec![rule(3)] });
        assert_eq!(guard.rules.len(), 1);
        assert_eq!(guard.rules[0].weekday, 3);

        state.apply_to_business(&mut guard, &Event::RulesDeleted { business_id: b.id });
        assert!(guard.rules.is_empty());
    }

    #[tokio::test]
    async fn inserted_rules_keep_one_per_weekday() {
        let state = StoreState::new();
        let b = business();
        assert!(state.apply_global(&Event::BusinessCreated { business: b.clone() }));
        let shared = state.get_business(&b.id).unwrap();
        let mut guard = shared.write().await;

        let mut late = rule(1);
        late.open = NaiveTime::from_hms_opt(12, 0, 0).unwrap();
        state.apply_to_business(&mut guard, &Event::RulesInserted { business_id: b.id, rules: vec![rule(1), rule(2)] });
        state.apply_to_business(&mut guard, &Event::RulesInserted { business_id: b.id, rules: vec![late] });
        assert_eq!(guard.rules, vec![late, rule(2)]);

        let mut later = rule(2);
        later.slot_minutes = 15;
        state.apply_to_business(
            &mut guard,
            &Event::RulesInserted { business_id: b.id, rules: vec![rule(2), later] },
        );
        assert_eq!(guard.rules, vec![late, later]);
    }

    #[tokio::test]
    async fn duplicate_booking_event_not_indexed_twice() {
        let state = StoreState::new();
        let b = business();
        state.apply_global(&Event::BusinessCreated { business: b.clone() });
        let shared = state.get_business(&b.id).unwrap();
        let mut guard = shared.write().await;

        let first = booking(b.id, "c1", 5000);
        let clash = booking(b.id, "c1", 5000);
        state.apply_to_business(&mut guard, &Event::BookingConfirmed { booking: first.clone() });
        state.apply_to_business(&mut guard, &Event::BookingConfirmed { booking: clash });
        assert_eq!(guard.bookings, vec![first.clone()]);
        assert_eq!(state.client_bookings("c1"), vec![first]);
    }

    #[test]
    fn profiles_indexed_by_user() {
        let state = StoreState::new();
        let profile = Profile { user_id: "ana".into(), email: Some("ana@example.com".into()), name: None, role: Role::Client };
        state.apply_global(&Event::ProfileCreated { profile: profile.clone() });
        assert_eq!(state.get_profile("ana"), Some(profile));
        assert_eq!(state.profile_count(), 1);
        assert!(state.get_profile("bob").is_none());
    }
}
