use ulid::Ulid;

use crate::model::Ms;
use crate::store::StoreError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(String),
    /// Malformed input (bad weekday, open >= close, zero slot length, ...).
    Invalid(String),
    /// The requested slot starts at or before `now`.
    SlotExpired { start: Ms, now: Ms },
    /// The slot was taken by booking `.0`. An expected outcome, not a fault.
    Conflict(Ulid),
    Forbidden(&'static str),
    LimitExceeded(&'static str),
    /// The store call failed; the caller may retry later.
    Store(String),
    /// Schedule replace deleted the old rules but failed to write the new ones.
    ConsistencyGap { business_id: Ulid, cause: String },
}

impl EngineError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        EngineError::Invalid(msg.into())
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::Invalid(_) | EngineError::SlotExpired { .. } => "validation",
            EngineError::Conflict(_) => "conflict",
            EngineError::Forbidden(_) => "forbidden",
            EngineError::LimitExceeded(_) => "limit",
            EngineError::Store(_) => "store",
            EngineError::ConsistencyGap { .. } => "consistency_gap",
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => EngineError::NotFound(id),
            StoreError::AlreadyExists(key) => EngineError::AlreadyExists(key),
            StoreError::LimitExceeded(msg) => EngineError::LimitExceeded(msg),
            StoreError::Unavailable(msg) => EngineError::Store(msg),
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(key) => write!(f, "already exists: {key}"),
            EngineError::Invalid(msg) => write!(f, "invalid input: {msg}"),
            EngineError::SlotExpired { start, now } => {
                write!(f, "slot expired: starts at {start}, now is {now}")
            }
            EngineError::Conflict(id) => {
                write!(f, "slot already booked (booking {id}); refresh availability and pick another")
            }
            EngineError::Forbidden(msg) => write!(f, "forbidden: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Store(_) => write!(f, "storage temporarily unavailable, retry later"),
            EngineError::ConsistencyGap { business_id, cause } => write!(
                f,
                "schedule of {business_id} was cleared but the new rules were not saved ({cause}); \
                 the business has no opening hours until the schedule is saved again"
            ),
        }
    }
}

impl std::error::Error for EngineError {}
