use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the only instant type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// Day of week, 0 = Sunday .. 6 = Saturday.
pub type WeekdayIndex = u8;

/// Opening hours for one weekday of a business.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeeklyRule {
    pub weekday: WeekdayIndex,
    pub open: NaiveTime,
    pub close: NaiveTime,
    pub slot_minutes: u32,
}

impl WeeklyRule {
    pub fn slot_ms(&self) -> Ms {
        self.slot_minutes as Ms * MINUTE_MS
    }
}

/// Opening hours as submitted by an owner, before the shared slot length is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DayHours {
    pub weekday: WeekdayIndex,
    pub open: NaiveTime,
    pub close: NaiveTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    Confirmed,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Confirmed => "confirmed",
        }
    }
}

/// A reserved slot. Created once by the commit protocol and never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub business_id: Ulid,
    pub client_id: String,
    pub span: Span,
    pub status: BookingStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Business {
    pub id: Ulid,
    pub owner_id: String,
    pub name: String,
    pub description: Option<String>,
    pub address: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Owner,
    Client,
}

impl Role {
    pub fn parse(s: &str) -> Option<Role> {
        match s.to_ascii_lowercase().as_str() {
            "owner" => Some(Role::Owner),
            "client" => Some(Role::Client),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Owner => "owner",
            Role::Client => "client",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub user_id: String,
    pub email: Option<String>,
    pub name: Option<String>,
    pub role: Role,
}

/// The authenticated caller of a single request.
///
/// `name` and `role` are absent when the profile could not be loaded; the
/// session still proceeds with the reduced identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub email: Option<String>,
    pub name: Option<String>,
    pub role: Option<Role>,
}

impl Identity {
    pub fn reduced(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            email: None,
            name: None,
            role: None,
        }
    }

    pub fn from_profile(profile: Profile) -> Self {
        Self {
            user_id: profile.user_id,
            email: profile.email,
            name: profile.name,
            role: Some(profile.role),
        }
    }

    pub fn is_owner(&self) -> bool {
        self.role == Some(Role::Owner)
    }
}

/// Flat event types, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    BusinessCreated {
        business: Business,
    },
    ProfileCreated {
        profile: Profile,
    },
    RulesDeleted {
        business_id: Ulid,
    },
    RulesInserted {
        business_id: Ulid,
        rules: Vec<WeeklyRule>,
    },
    /// Delete + insert in one record.
    ScheduleReplaced {
        business_id: Ulid,
        rules: Vec<WeeklyRule>,
    },
    BookingConfirmed {
        booking: Booking,
    },
}

impl Event {
    pub fn business_id(&self) -> Option<Ulid> {
        match self {
            Event::BusinessCreated { business } => Some(business.id),
            Event::RulesDeleted { business_id }
            | Event::RulesInserted { business_id, .. }
            | Event::ScheduleReplaced { business_id, .. } => Some(*business_id),
            Event::BookingConfirmed { booking } => Some(booking.business_id),
            Event::ProfileCreated { .. } => None,
        }
    }
}
