use crate::model::Ms;

pub const MAX_BUSINESSES: usize = 100_000;
pub const MAX_PROFILES: usize = 1_000_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_DESCRIPTION_LEN: usize = 4096;
pub const MAX_USER_ID_LEN: usize = 128;

pub const MIN_SLOT_MINUTES: u32 = 1;
pub const MAX_SLOT_MINUTES: u32 = 24 * 60;
pub const DEFAULT_SLOT_MINUTES: u32 = 30;

pub const MAX_BOOKINGS_PER_BUSINESS: usize = 500_000;
pub const MAX_CALENDAR_DAYS: i64 = 366;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;
