use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, NaiveTime, Offset, Utc};

use crate::model::{Ms, WeekdayIndex};

/// The single fixed locale every calendar date is interpreted in.
///
/// A fixed offset has no DST gaps or folds: every local wall-clock time maps
/// to exactly one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Locale {
    offset: FixedOffset,
}

impl Locale {
    pub fn utc() -> Self {
        Self { offset: Utc.fix() }
    }

    /// `None` if the offset is outside ±24h.
    pub fn from_offset_minutes(minutes: i32) -> Option<Self> {
        FixedOffset::east_opt(minutes.checked_mul(60)?).map(|offset| Self { offset })
    }

    pub fn offset_minutes(&self) -> i32 {
        self.offset.local_minus_utc() / 60
    }

    /// 0 = Sunday .. 6 = Saturday.
    pub fn weekday(date: NaiveDate) -> WeekdayIndex {
        date.weekday().num_days_from_sunday() as WeekdayIndex
    }

    /// Absolute instant of `date @ time` in this locale.
    pub fn instant(&self, date: NaiveDate, time: NaiveTime) -> Ms {
        let wall = date.and_time(time).and_utc().timestamp_millis();
        wall - self.offset.local_minus_utc() as Ms * 1000
    }

    /// Calendar date of an instant in this locale.
    pub fn date_of(&self, at: Ms) -> Option<NaiveDate> {
        DateTime::from_timestamp_millis(at).map(|utc| utc.with_timezone(&self.offset).date_naive())
    }

    pub fn time_of(&self, at: Ms) -> Option<NaiveTime> {
        DateTime::from_timestamp_millis(at).map(|utc| utc.with_timezone(&self.offset).time())
    }
}
