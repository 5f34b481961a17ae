mod availability;
mod booking;
mod directory;
mod error;
mod queries;
mod schedule;

pub use availability::{available_slots, is_date_selectable, SlotGrid, Slots};
pub use booking::prepare_booking;
pub use error::EngineError;
pub use schedule::validate_schedule;

use std::sync::Arc;

use chrono::NaiveDate;
use ulid::Ulid;

use crate::identity::{self, RetryPolicy};
use crate::locale::Locale;
use crate::model::*;
use crate::store::Store;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// Schedule definition, slot availability and booking commit on top of a `Store`.
///
/// Holds no per-user state: every operation that acts on behalf of someone
/// takes the caller's `Identity`.
pub struct Engine {
    store: Arc<dyn Store>,
    locale: Locale,
    profile_retry: RetryPolicy,
}

impl Engine {
    pub fn new(store: Arc<dyn Store>, locale: Locale) -> Self {
        Self {
            store,
            locale,
            profile_retry: RetryPolicy::default(),
        }
    }

    pub fn with_profile_retry(mut self, policy: RetryPolicy) -> Self {
        self.profile_retry = policy;
        self
    }

    pub fn locale(&self) -> &Locale {
        &self.locale
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Build the request identity for an authenticated user handle.
    pub async fn identify(&self, user_id: &str) -> Identity {
        identity::resolve_identity(self.store.as_ref(), user_id, &self.profile_retry).await
    }

    /// Today's date in the engine's locale.
    pub(crate) fn today_at(&self, now: Ms) -> Result<NaiveDate, EngineError> {
        self.locale
            .date_of(now)
            .ok_or_else(|| EngineError::invalid(format!("timestamp {now} out of range")))
    }

    /// The business, if `identity` owns it.
    pub(super) async fn require_owner(&self, identity: &Identity, business_id: Ulid) -> Result<Business, EngineError> {
        let business = self
            .store
            .business(business_id)
            .await?
            .ok_or(EngineError::NotFound(business_id))?;
        if business.owner_id != identity.user_id {
            return Err(EngineError::Forbidden("only the business owner may do this"));
        }
        Ok(business)
    }
}
