use std::time::Duration;

use tracing::{debug, warn};

use crate::model::Identity;
use crate::store::Store;

/// How long to wait for a profile that may not be written yet.
///
/// A freshly signed-up user can authenticate before their profile insert has
/// landed; the lookup is retried `attempts` times in total, `delay` apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_millis(500),
        }
    }
}

/// Resolve the identity for `user_id`.
///
/// Never fails: a profile that stays missing, or a store error, degrades to
/// the reduced identity (user id only). Store errors are not retried.
pub async fn resolve_identity(store: &dyn Store, user_id: &str, policy: &RetryPolicy) -> Identity {
    let attempts = policy.attempts.max(1);
    for attempt in 1..=attempts {
        match store.profile(user_id).await {
            Ok(Some(profile)) => return Identity::from_profile(profile),
            Ok(None) => {
                debug!("profile of {user_id} not found (attempt {attempt}/{attempts})");
                if attempt < attempts {
                    tokio::time::sleep(policy.delay).await;
                }
            }
            Err(e) => {
                warn!("profile lookup for {user_id} failed: {e}");
                return Identity::reduced(user_id);
            }
        }
    }
    warn!("no profile for {user_id}, continuing with reduced identity");
    Identity::reduced(user_id)
}
