use std::collections::HashMap;

use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;
use crate::store::InsertOutcome;

use super::availability::SlotGrid;
use super::{now_ms, Engine, EngineError};

/// Checks that need no store access, in commit order: expiry first, then
/// timestamp range and duration.
pub fn prepare_booking(
    id: Ulid,
    business_id: Ulid,
    client_id: &str,
    slot_start: Ms,
    duration_minutes: u32,
    now: Ms,
) -> Result<Booking, EngineError> {
    if slot_start <= now {
        return Err(EngineError::SlotExpired { start: slot_start, now });
    }
    if !(MIN_VALID_TIMESTAMP_MS..=MAX_VALID_TIMESTAMP_MS).contains(&slot_start) {
        return Err(EngineError::invalid(format!("slot start {slot_start} out of range")));
    }
    if !(MIN_SLOT_MINUTES..=MAX_SLOT_MINUTES).contains(&duration_minutes) {
        return Err(EngineError::invalid(format!(
            "duration must be between {MIN_SLOT_MINUTES} and {MAX_SLOT_MINUTES} minutes"
        )));
    }
    if client_id.is_empty() || client_id.len() > MAX_USER_ID_LEN {
        return Err(EngineError::invalid("client id empty or too long"));
    }
    let end = slot_start + duration_minutes as Ms * MINUTE_MS;
    Ok(Booking {
        id,
        business_id,
        client_id: client_id.to_string(),
        span: Span::new(slot_start, end),
        status: BookingStatus::Confirmed,
    })
}

impl Engine {
    /// Reserve the slot starting at `slot_start` for the calling client.
    ///
    /// The store's atomic insert decides races: of several commits for the
    /// same start exactly one succeeds and the rest get `Conflict`.
    pub async fn commit_booking(
        &self,
        identity: &Identity,
        id: Ulid,
        business_id: Ulid,
        slot_start: Ms,
        duration_minutes: u32,
    ) -> Result<Booking, EngineError> {
        self.commit_booking_at(identity, id, business_id, slot_start, duration_minutes, now_ms())
            .await
    }

    pub(crate) async fn commit_booking_at(
        &self,
        identity: &Identity,
        id: Ulid,
        business_id: Ulid,
        slot_start: Ms,
        duration_minutes: u32,
        now: Ms,
    ) -> Result<Booking, EngineError> {
        let result = self
            .try_commit(identity, id, business_id, slot_start, duration_minutes, now)
            .await;
        match &result {
            Ok(booking) => {
                metrics::counter!(observability::BOOKINGS_CONFIRMED_TOTAL).increment(1);
                info!(
                    "booking {} confirmed: business {business_id}, client {}, start {slot_start}",
                    booking.id, booking.client_id
                );
            }
            Err(EngineError::Conflict(existing)) => {
                metrics::counter!(observability::BOOKING_CONFLICTS_TOTAL).increment(1);
                debug!("slot {slot_start} of {business_id} already held by {existing}");
            }
            Err(e) => {
                metrics::counter!(observability::BOOKINGS_REJECTED_TOTAL, "reason" => e.kind()).increment(1);
            }
        }
        result
    }

    async fn try_commit(
        &self,
        identity: &Identity,
        id: Ulid,
        business_id: Ulid,
        slot_start: Ms,
        duration_minutes: u32,
        now: Ms,
    ) -> Result<Booking, EngineError> {
        let booking = prepare_booking(id, business_id, &identity.user_id, slot_start, duration_minutes, now)?;

        // The grid check ignores existing bookings: a taken slot must surface
        // as Conflict from the store, not as "not offered".
        let rules = self.store.rules(business_id).await?;
        let date = self
            .locale
            .date_of(slot_start)
            .ok_or_else(|| EngineError::invalid("slot start out of range"))?;
        let grid = SlotGrid::for_date(&rules, date, &self.locale)?
            .ok_or_else(|| EngineError::invalid("business is closed that day"))?;
        if !grid.contains(slot_start) {
            return Err(EngineError::invalid("slot not offered by this business"));
        }
        if booking.span.duration_ms() != grid.step {
            return Err(EngineError::invalid(format!(
                "duration must match the {} minute slot length",
                grid.step / MINUTE_MS
            )));
        }

        match self.store.insert_booking_if_absent(booking).await? {
            InsertOutcome::Inserted(booking) => Ok(booking),
            InsertOutcome::Taken(existing) => Err(EngineError::Conflict(existing)),
        }
    }

    /// All bookings of a business; owner only.
    pub async fn bookings_for_business(
        &self,
        identity: &Identity,
        business_id: Ulid,
    ) -> Result<Vec<Booking>, EngineError> {
        self.require_owner(identity, business_id).await?;
        Ok(self.store.bookings(business_id).await?)
    }

    pub async fn bookings_for_client(&self, identity: &Identity) -> Result<Vec<Booking>, EngineError> {
        Ok(self.store.client_bookings(&identity.user_id).await?)
    }

    /// Pair each booking with its client's profile name. `None` when the
    /// client has no profile or the profile has no name.
    pub async fn with_client_names(&self, bookings: Vec<Booking>) -> Result<Vec<(Booking, Option<String>)>, EngineError> {
        let mut names: HashMap<String, Option<String>> = HashMap::new();
        let mut out = Vec::with_capacity(bookings.len());
        for booking in bookings {
            let name = match names.get(&booking.client_id) {
                Some(name) => name.clone(),
                None => {
                    let name = self.store.profile(&booking.client_id).await?.and_then(|p| p.name);
                    names.insert(booking.client_id.clone(), name.clone());
                    name
                }
            };
            out.push((booking, name));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: Ms = 1_800_000_000_000;

    #[test]
    fn start_equal_to_now_is_expired() {
        let result = prepare_booking(Ulid::new(), Ulid::new(), "ana", NOW, 30, NOW);
        assert_eq!(result, Err(EngineError::SlotExpired { start: NOW, now: NOW }));
    }

    #[test]
    fn start_after_now_accepted() {
        let booking = prepare_booking(Ulid::new(), Ulid::new(), "ana", NOW + 1000, 30, NOW).unwrap();
        assert_eq!(booking.span.duration_ms(), 30 * MINUTE_MS);
        assert_eq!(booking.status, BookingStatus::Confirmed);
        assert_eq!(booking.client_id, "ana");
    }

    #[test]
    fn expiry_checked_before_duration() {
        let result = prepare_booking(Ulid::new(), Ulid::new(), "ana", NOW - 1, 0, NOW);
        assert!(matches!(result, Err(EngineError::SlotExpired { .. })));
    }

    #[test]
    fn bad_duration_rejected() {
        assert!(prepare_booking(Ulid::new(), Ulid::new(), "ana", NOW + 1, 0, NOW).is_err());
        assert!(prepare_booking(Ulid::new(), Ulid::new(), "ana", NOW + 1, MAX_SLOT_MINUTES + 1, NOW).is_err());
    }

    #[test]
    fn far_future_rejected() {
        let result = prepare_booking(Ulid::new(), Ulid::new(), "ana", MAX_VALID_TIMESTAMP_MS + 1, 30, NOW);
        assert!(matches!(result, Err(EngineError::Invalid(_))));
    }
}
