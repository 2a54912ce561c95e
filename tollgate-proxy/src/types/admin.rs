//! Admin and usage API payloads.

use serde::{Deserialize, Serialize};
use tollgate_core::{ModelUsage, PolicyUpdate, RateLimitPolicy, User, MAX_PRIORITY, MIN_PRIORITY};

/// POST /admin/users
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateUserRequest {
    #[serde(default)]
    pub name: Option<String>,
}

/// Response for POST /admin/users
#[derive(Debug, Clone, Serialize)]
pub struct CreateUserResponse {
    pub id: String,
    pub name: String,
    pub api_key: String,
}

impl From<User> for CreateUserResponse {
    fn from(user: User) -> Self {
        Self { id: user.id, name: user.name, api_key: user.api_key }
    }
}

/// POST /admin/limits
///
/// Fields are optional at the serde level so that missing values surface
/// as a 400 with a readable message instead of a deserializer rejection.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SetLimitsRequest {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub tokens_per_minute: Option<u64>,
    #[serde(default)]
    pub tokens_per_day: Option<u64>,
    #[serde(default)]
    pub tokens_lifetime: Option<u64>,
    #[serde(default)]
    pub priority: Option<i64>,
}

impl SetLimitsRequest {
    /// Validate and turn into a store update
    pub fn into_update(self) -> Result<PolicyUpdate, String> {
        let user_id = match self.user_id {
            Some(id) if !id.trim().is_empty() => id,
            _ => return Err("user_id is required".to_string()),
        };

        let priority = match self.priority {
            None => None,
            Some(p) if (MIN_PRIORITY as i64..=MAX_PRIORITY as i64).contains(&p) => Some(p as u8),
            Some(p) => {
                return Err(format!(
                    "priority must be between {} and {}, got {}",
                    MIN_PRIORITY, MAX_PRIORITY, p
                ))
            }
        };

        Ok(PolicyUpdate {
            user_id,
            tokens_per_minute: self.tokens_per_minute,
            tokens_per_day: self.tokens_per_day,
            tokens_lifetime: self.tokens_lifetime,
            priority,
        })
    }
}

/// Policy as returned by the admin API
#[derive(Debug, Clone, Serialize)]
pub struct LimitsResponse {
    pub user_id: String,
    pub tokens_per_minute: Option<u64>,
    pub tokens_per_day: Option<u64>,
    pub tokens_lifetime: Option<u64>,
    pub priority: u8,
    pub updated_at: String,
}

impl From<RateLimitPolicy> for LimitsResponse {
    fn from(policy: RateLimitPolicy) -> Self {
        Self {
            user_id: policy.user_id,
            tokens_per_minute: policy.tokens_per_minute,
            tokens_per_day: policy.tokens_per_day,
            tokens_lifetime: policy.tokens_lifetime,
            priority: policy.priority,
            updated_at: policy.updated_at.to_rfc3339(),
        }
    }
}

/// GET /v1/usage
#[derive(Debug, Clone, Serialize)]
pub struct UsageResponse {
    pub user_id: String,
    pub usage: Vec<ModelUsage>,
}
