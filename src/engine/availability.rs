use std::collections::HashSet;

use chrono::NaiveDate;

use crate::locale::Locale;
use crate::model::*;

use super::EngineError;

// ── Slot grid ─────────────────────────────────────────────────────

/// The candidate start times of one business day: `open, open + step, ...`
/// while a whole slot still fits before `close`. A partial trailing slot is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotGrid {
    pub open: Ms,
    pub close: Ms,
    pub step: Ms,
}

impl SlotGrid {
    /// Grid for `date`, or `None` when the business is closed that weekday.
    pub fn for_date(rules: &[WeeklyRule], date: NaiveDate, locale: &Locale) -> Result<Option<Self>, EngineError> {
        let weekday = Locale::weekday(date);
        let Some(rule) = rules.iter().find(|r| r.weekday == weekday) else {
            return Ok(None);
        };
        if rule.slot_minutes == 0 {
            return Err(EngineError::invalid("slot length must be positive"));
        }
        Ok(Some(Self {
            open: locale.instant(date, rule.open),
            close: locale.instant(date, rule.close),
            step: rule.slot_ms(),
        }))
    }

    pub fn contains(&self, start: Ms) -> bool {
        start >= self.open && start + self.step <= self.close && (start - self.open) % self.step == 0
    }
}

/// Lazy sequence of bookable slot starts for one day, in ascending order.
///
/// A clone continues from the same cursor; calling `available_slots` again
/// starts over.
#[derive(Debug, Clone)]
pub struct Slots<'a> {
    cursor: Ms,
    close: Ms,
    step: Ms,
    now: Ms,
    booked: &'a HashSet<Ms>,
}

impl Slots<'_> {
    /// Slot length in ms (0 for a closed day).
    pub fn step(&self) -> Ms {
        self.step
    }
}

impl Iterator for Slots<'_> {
    type Item = Ms;

    fn next(&mut self) -> Option<Ms> {
        if self.step <= 0 {
            return None;
        }
        while self.cursor + self.step <= self.close {
            let candidate = self.cursor;
            self.cursor += self.step;
            if candidate > self.now && !self.booked.contains(&candidate) {
                return Some(candidate);
            }
        }
        None
    }
}

/// Bookable slot starts for `date`.
///
/// Existing bookings are matched by exact start equality, not by overlap: a
/// booking whose start is off the grid (e.g. made under a different slot
/// length) does not remove the grid slots it overlaps.
pub fn available_slots<'a>(
    rules: &[WeeklyRule],
    booked: &'a HashSet<Ms>,
    date: NaiveDate,
    now: Ms,
    locale: &Locale,
) -> Result<Slots<'a>, EngineError> {
    let slots = match SlotGrid::for_date(rules, date, locale)? {
        Some(grid) => Slots {
            cursor: grid.open,
            close: grid.close,
            step: grid.step,
            now,
            booked,
        },
        None => Slots {
            cursor: 0,
            close: 0,
            step: 0,
            now,
            booked,
        },
    };
    Ok(slots)
}

/// Calendar predicate: a date can be picked when its weekday has a rule and it
/// is not before `today`.
pub fn is_date_selectable(rules: &[WeeklyRule], date: NaiveDate, today: NaiveDate) -> bool {
    date >= today && rules.iter().any(|r| r.weekday == Locale::weekday(date))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;

    const M: Ms = MINUTE_MS;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    /// Monday
    fn monday() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 19).unwrap()
    }

    fn rule(weekday: WeekdayIndex, open: NaiveTime, close: NaiveTime, slot_minutes: u32) -> WeeklyRule {
        WeeklyRule { weekday, open, close, slot_minutes }
    }

    fn at(time: NaiveTime) -> Ms {
        Locale::utc().instant(monday(), time)
    }

    fn collect(rules: &[WeeklyRule], booked: &HashSet<Ms>, now: Ms) -> Vec<Ms> {
        available_slots(rules, booked, monday(), now, &Locale::utc())
            .unwrap()
            .collect()
    }

    #[test]
    fn one_hour_half_hour_slots() {
        let rules = [rule(1, t(9, 0), t(10, 0), 30)];
        let slots = collect(&rules, &HashSet::new(), at(t(8, 0)));
        assert_eq!(slots, vec![at(t(9, 0)), at(t(9, 30))]);
    }

    #[test]
    fn partial_trailing_slot_dropped() {
        let rules = [rule(1, t(9, 0), t(10, 0), 45)];
        let slots = collect(&rules, &HashSet::new(), 0);
        assert_eq!(slots, vec![at(t(9, 0))]);
    }

    #[test]
    fn no_rule_for_weekday_is_empty() {
        let rules = [rule(2, t(9, 0), t(17, 0), 30), rule(0, t(9, 0), t(17, 0), 30)];
        assert!(collect(&rules, &HashSet::new(), 0).is_empty());
        assert!(collect(&[], &HashSet::new(), 0).is_empty());
    }

    #[test]
    fn zero_length_day_is_empty() {
        let rules = [rule(1, t(9, 0), t(9, 0), 30)];
        assert!(collect(&rules, &HashSet::new(), 0).is_empty());
    }

    #[test]
    fn zero_slot_length_fails_fast() {
        let rules = [rule(1, t(9, 0), t(10, 0), 0)];
        let booked = HashSet::new();
        let result = available_slots(&rules, &booked, monday(), 0, &Locale::utc());
        assert!(matches!(result, Err(EngineError::Invalid(_))));
    }

    #[test]
    fn past_day_is_empty() {
        let rules = [rule(1, t(9, 0), t(17, 0), 30)];
        assert!(collect(&rules, &HashSet::new(), at(t(23, 59))).is_empty());
    }

    #[test]
    fn slot_equal_to_now_excluded() {
        let rules = [rule(1, t(9, 0), t(11, 0), 30)];
        let slots = collect(&rules, &HashSet::new(), at(t(10, 0)));
        assert_eq!(slots, vec![at(t(10, 30))]);

        let slots = collect(&rules, &HashSet::new(), at(t(10, 0)) - 1000);
        assert_eq!(slots, vec![at(t(10, 0)), at(t(10, 30))]);
    }

    #[test]
    fn booked_subsets_never_returned() {
        let rules = [rule(1, t(9, 0), t(11, 0), 30)];
        let grid: Vec<Ms> = (0..4).map(|i| at(t(9, 0)) + i * 30 * M).collect();
        for mask in 0u32..(1 << grid.len()) {
            let booked: HashSet<Ms> = grid
                .iter()
                .enumerate()
                .filter(|(i, _)| mask & (1 << i) != 0)
                .map(|(_, &s)| s)
                .collect();
            let slots = collect(&rules, &booked, 0);
            let expected: Vec<Ms> = grid.iter().copied().filter(|s| !booked.contains(s)).collect();
            assert_eq!(slots, expected, "mask {mask:04b}");
        }
    }

    #[test]
    fn repeated_calls_identical() {
        let rules = [rule(1, t(8, 0), t(20, 0), 15)];
        let booked: HashSet<Ms> = [at(t(12, 0)), at(t(8, 15))].into_iter().collect();
        let now = at(t(7, 0));
        let first = collect(&rules, &booked, now);
        let second = collect(&rules, &booked, now);
        assert_eq!(first, second);
        assert_eq!(first.len(), 48 - 2);
    }

    #[test]
    fn clone_resumes_from_cursor() {
        let rules = [rule(1, t(9, 0), t(10, 30), 30)];
        let booked = HashSet::new();
        let mut slots = available_slots(&rules, &booked, monday(), 0, &Locale::utc()).unwrap();
        assert_eq!(slots.next(), Some(at(t(9, 0))));
        let rest: Vec<Ms> = slots.clone().collect();
        assert_eq!(rest, vec![at(t(9, 30)), at(t(10, 0))]);
        assert_eq!(slots.collect::<Vec<_>>(), rest);
    }

    #[test]
    fn off_grid_booking_not_excluded() {
        // 09:10 overlaps the 09:00 and 09:30 slots but equals neither start
        let rules = [rule(1, t(9, 0), t(10, 0), 30)];
        let booked: HashSet<Ms> = [at(t(9, 10))].into_iter().collect();
        assert_eq!(collect(&rules, &booked, 0), vec![at(t(9, 0)), at(t(9, 30))]);
    }

    #[test]
    fn locale_offset_shifts_instants() {
        let rules = [rule(1, t(9, 0), t(10, 0), 60)];
        let booked = HashSet::new();
        let art = Locale::from_offset_minutes(-180).unwrap();
        let slots: Vec<Ms> = available_slots(&rules, &booked, monday(), 0, &art).unwrap().collect();
        assert_eq!(slots, vec![at(t(12, 0))]);
    }

    #[test]
    fn grid_contains() {
        let rules = [rule(1, t(9, 0), t(10, 0), 20)];
        let grid = SlotGrid::for_date(&rules, monday(), &Locale::utc()).unwrap().unwrap();
        assert!(grid.contains(at(t(9, 0))));
        assert!(grid.contains(at(t(9, 40))));
        assert!(!grid.contains(at(t(9, 10))));
        assert!(!grid.contains(at(t(10, 0))));
        assert!(!grid.contains(at(t(8, 40))));
        assert!(SlotGrid::for_date(&rules, monday().succ_opt().unwrap(), &Locale::utc()).unwrap().is_none());
    }

    #[test]
    fn selectable_dates() {
        let rules = [rule(1, t(9, 0), t(17, 0), 30)];
        let today = monday();
        assert!(is_date_selectable(&rules, today, today));
        let next_monday = today + chrono::Days::new(7);
        assert!(is_date_selectable(&rules, next_monday, today));
        let last_monday = today - chrono::Days::new(7);
        assert!(!is_date_selectable(&rules, last_monday, today));
        let tuesday = today.succ_opt().unwrap();
        assert!(!is_date_selectable(&rules, tuesday, today));
    }
}
