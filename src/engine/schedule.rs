use tracing::{error, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;
use crate::store::ReplaceError;

use super::{Engine, EngineError};

/// Turn submitted opening hours into weekday rules sharing one slot length.
///
/// An empty week is valid (the business becomes fully unavailable) and skips
/// the slot length check.
pub fn validate_schedule(days: &[DayHours], slot_minutes: u32) -> Result<Vec<WeeklyRule>, EngineError> {
    if days.is_empty() {
        return Ok(Vec::new());
    }
    if !(MIN_SLOT_MINUTES..=MAX_SLOT_MINUTES).contains(&slot_minutes) {
        return Err(EngineError::invalid(format!(
            "slot length must be between {MIN_SLOT_MINUTES} and {MAX_SLOT_MINUTES} minutes, got {slot_minutes}"
        )));
    }

    let mut seen = [false; 7];
    let mut rules = Vec::with_capacity(days.len());
    for day in days {
        let slot = seen
            .get_mut(day.weekday as usize)
            .ok_or_else(|| EngineError::invalid(format!("weekday {} outside 0..=6", day.weekday)))?;
        if *slot {
            return Err(EngineError::invalid(format!("weekday {} listed twice", day.weekday)));
        }
        *slot = true;
        if day.open >= day.close {
            return Err(EngineError::invalid(format!(
                "weekday {}: opening {} is not before closing {}",
                day.weekday, day.open, day.close
            )));
        }
        rules.push(WeeklyRule {
            weekday: day.weekday,
            open: day.open,
            close: day.close,
            slot_minutes,
        });
    }
    rules.sort_by_key(|r| r.weekday);
    Ok(rules)
}

impl Engine {
    /// Replace the complete weekly schedule of a business.
    pub async fn set_weekly_schedule(
        &self,
        identity: &Identity,
        business_id: Ulid,
        days: Vec<DayHours>,
        slot_minutes: u32,
    ) -> Result<Vec<WeeklyRule>, EngineError> {
        let rules = validate_schedule(&days, slot_minutes)?;
        self.require_owner(identity, business_id).await?;

        match self.store.replace_rules(business_id, rules.clone()).await {
            Ok(()) => {
                metrics::counter!(observability::SCHEDULE_REPLACEMENTS_TOTAL).increment(1);
                info!("schedule of {business_id} replaced: {} open days", rules.len());
                Ok(rules)
            }
            Err(ReplaceError::Store(e)) => Err(e.into()),
            Err(ReplaceError::Gap(e)) => {
                metrics::counter!(observability::SCHEDULE_GAPS_TOTAL).increment(1);
                error!("schedule of {business_id} deleted but not rewritten: {e}");
                Err(EngineError::ConsistencyGap {
                    business_id,
                    cause: e.to_string(),
                })
            }
        }
    }

    pub async fn weekly_schedule(&self, business_id: Ulid) -> Result<Vec<WeeklyRule>, EngineError> {
        Ok(self.store.rules(business_id).await?)
    }
}
