mod state;
mod wal_store;

pub use state::{BusinessState, StoreState};
pub use wal_store::WalStore;

use async_trait::async_trait;
use ulid::Ulid;

use crate::model::*;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    NotFound(Ulid),
    AlreadyExists(String),
    LimitExceeded(&'static str),
    /// The persistence call itself failed (log write, channel closed, ...).
    Unavailable(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::NotFound(id) => write!(f, "not found: {id}"),
            StoreError::AlreadyExists(key) => write!(f, "already exists: {key}"),
            StoreError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            StoreError::Unavailable(e) => write!(f, "store unavailable: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Result of an insert guarded by the `(business_id, start)` uniqueness key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(Booking),
    /// Another booking already holds this start; carries its id.
    Taken(Ulid),
}

/// Failure of a schedule replace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplaceError {
    /// Nothing was changed.
    Store(StoreError),
    /// The old rules were deleted but the new ones were not written:
    /// the business is left with zero rules.
    Gap(StoreError),
}

/// The persistent-store collaborator.
///
/// `insert_booking_if_absent` is the only double-booking guarantee in the
/// system: among concurrent inserts with the same `(business_id, span.start)`
/// exactly one may return `Inserted`.
#[async_trait]
pub trait Store: Send + Sync {
    async fn business(&self, id: Ulid) -> Result<Option<Business>, StoreError>;
    async fn insert_business(&self, business: Business) -> Result<(), StoreError>;
    async fn businesses(&self, owner_id: Option<&str>) -> Result<Vec<Business>, StoreError>;

    async fn profile(&self, user_id: &str) -> Result<Option<Profile>, StoreError>;
    async fn insert_profile(&self, profile: Profile) -> Result<(), StoreError>;

    async fn rules(&self, business_id: Ulid) -> Result<Vec<WeeklyRule>, StoreError>;
    async fn delete_rules(&self, business_id: Ulid) -> Result<(), StoreError>;
    async fn insert_rules(&self, business_id: Ulid, rules: Vec<WeeklyRule>) -> Result<(), StoreError>;

    /// Delete-then-insert. Stores that can write both halves as one record
    /// should override this.
    async fn replace_rules(&self, business_id: Ulid, rules: Vec<WeeklyRule>) -> Result<(), ReplaceError> {
        self.delete_rules(business_id).await.map_err(ReplaceError::Store)?;
        if rules.is_empty() {
            return Ok(());
        }
        self.insert_rules(business_id, rules).await.map_err(ReplaceError::Gap)
    }

    /// Sorted by start.
    async fn bookings(&self, business_id: Ulid) -> Result<Vec<Booking>, StoreError>;
    /// Sorted by start.
    async fn client_bookings(&self, client_id: &str) -> Result<Vec<Booking>, StoreError>;

    async fn insert_booking_if_absent(&self, booking: Booking) -> Result<InsertOutcome, StoreError>;
}
