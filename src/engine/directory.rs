use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError};

fn check_text(field: &'static str, value: &str) -> Result<(), EngineError> {
    check_len(field, value, MAX_NAME_LEN)
}

fn check_len(field: &'static str, value: &str, max: usize) -> Result<(), EngineError> {
    if value.len() > max {
        return Err(EngineError::LimitExceeded(field));
    }
    Ok(())
}

impl Engine {
    /// Register a business owned by the caller. Requires the owner role.
    pub async fn create_business(
        &self,
        identity: &Identity,
        id: Ulid,
        name: String,
        description: Option<String>,
        address: Option<String>,
    ) -> Result<Business, EngineError> {
        if !identity.is_owner() {
            return Err(EngineError::Forbidden("only owners can create businesses"));
        }
        if name.trim().is_empty() {
            return Err(EngineError::invalid("business name must not be empty"));
        }
        check_text("business name too long", &name)?;
        if let Some(ref d) = description {
            check_len("description too long", d, MAX_DESCRIPTION_LEN)?;
        }
        if let Some(ref a) = address {
            check_text("address too long", a)?;
        }

        let business = Business {
            id,
            owner_id: identity.user_id.clone(),
            name,
            description,
            address,
        };
        self.store.insert_business(business.clone()).await?;
        info!("business {id} created by {}", business.owner_id);
        Ok(business)
    }

    pub async fn businesses(&self, owner_id: Option<&str>) -> Result<Vec<Business>, EngineError> {
        Ok(self.store.businesses(owner_id).await?)
    }

    /// Store the caller's own profile. A profile can be written once.
    pub async fn register_profile(&self, identity: &Identity, profile: Profile) -> Result<Profile, EngineError> {
        if profile.user_id != identity.user_id {
            return Err(EngineError::Forbidden("profiles can only be registered for yourself"));
        }
        if profile.user_id.is_empty() || profile.user_id.len() > MAX_USER_ID_LEN {
            return Err(EngineError::invalid("user id empty or too long"));
        }
        if let Some(ref email) = profile.email {
            check_text("email too long", email)?;
        }
        if let Some(ref name) = profile.name {
            check_text("name too long", name)?;
        }
        self.store.insert_profile(profile.clone()).await?;
        info!("profile {} registered as {}", profile.user_id, profile.role.as_str());
        Ok(profile)
    }
}
