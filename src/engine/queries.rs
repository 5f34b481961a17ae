use std::collections::HashSet;

use chrono::{Days, NaiveDate};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::{available_slots, is_date_selectable};
use super::{now_ms, Engine, EngineError};

impl Engine {
    /// Bookable slots of a business on `date`, as `[start, start + slot)` spans.
    pub async fn compute_available_slots(&self, business_id: Ulid, date: NaiveDate) -> Result<Vec<Span>, EngineError> {
        self.available_slots_at(business_id, date, now_ms()).await
    }

    pub(crate) async fn available_slots_at(
        &self,
        business_id: Ulid,
        date: NaiveDate,
        now: Ms,
    ) -> Result<Vec<Span>, EngineError> {
        let rules = self.store.rules(business_id).await?;
        let bookings = self.store.bookings(business_id).await?;
        let booked: HashSet<Ms> = bookings.iter().map(|b| b.span.start).collect();

        let slots = available_slots(&rules, &booked, date, now, &self.locale)?;
        let step = slots.step();
        Ok(slots.map(|start| Span::new(start, start + step)).collect())
    }

    /// Selectability of every date in `from..=to`.
    pub async fn calendar(
        &self,
        business_id: Ulid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<(NaiveDate, bool)>, EngineError> {
        self.calendar_at(business_id, from, to, now_ms()).await
    }

    pub(crate) async fn calendar_at(
        &self,
        business_id: Ulid,
        from: NaiveDate,
        to: NaiveDate,
        now: Ms,
    ) -> Result<Vec<(NaiveDate, bool)>, EngineError> {
        if from > to {
            return Err(EngineError::invalid("calendar range ends before it starts"));
        }
        if (to - from).num_days() >= MAX_CALENDAR_DAYS {
            return Err(EngineError::LimitExceeded("calendar range too long"));
        }
        let today = self.today_at(now)?;
        let rules = self.store.rules(business_id).await?;

        let mut days = Vec::new();
        let mut date = from;
        while date <= to {
            days.push((date, is_date_selectable(&rules, date, today)));
            match date.checked_add_days(Days::new(1)) {
                Some(next) => date = next,
                None => break,
            }
        }
        Ok(days)
    }
}
