//! Usage ledger, rate-limit policy store and user directory.
//!
//! The gateway core only talks to these traits. [`MemoryStore`] implements
//! all three for single-instance deployments and tests; reads observe every
//! write made earlier by the same process, which is all the core relies on.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::admission::{normalize_priority, DEFAULT_PRIORITY};
use crate::error::{StoreError, StoreResult};

/// Token counts reported by the runtime for one completion
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// An API consumer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct User {
    pub id: String,
    pub name: String,
    pub api_key: String,
    pub created_at: DateTime<Utc>,
}

/// One immutable ledger entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageRecord {
    pub id: Uuid,
    pub user_id: String,
    pub model: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub created_at: DateTime<Utc>,
}

impl UsageRecord {
    /// Build a record stamped with the current time
    pub fn new(user_id: impl Into<String>, model: impl Into<String>, usage: TokenUsage) -> Self {
        Self::at(user_id, model, usage, Utc::now())
    }

    /// Build a record with an explicit timestamp
    pub fn at(
        user_id: impl Into<String>,
        model: impl Into<String>,
        usage: TokenUsage,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            model: model.into(),
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
            created_at,
        }
    }
}

/// Aggregated usage for one model
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ModelUsage {
    pub model: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// Per-user caps. `None` means unlimited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitPolicy {
    pub user_id: String,
    pub tokens_per_minute: Option<u64>,
    pub tokens_per_day: Option<u64>,
    pub tokens_lifetime: Option<u64>,
    pub priority: u8,
    pub updated_at: DateTime<Utc>,
}

/// Upsert payload for a policy. A missing priority resets to the default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PolicyUpdate {
    pub user_id: String,
    #[serde(default)]
    pub tokens_per_minute: Option<u64>,
    #[serde(default)]
    pub tokens_per_day: Option<u64>,
    #[serde(default)]
    pub tokens_lifetime: Option<u64>,
    #[serde(default)]
    pub priority: Option<u8>,
}

/// Append-only usage ledger
#[async_trait::async_trait]
pub trait UsageLedger: Send + Sync {
    /// Append a record
    async fn append(&self, record: UsageRecord) -> StoreResult<()>;

    /// Sum of `total_tokens` for `user_id` with `created_at >= since`
    async fn tokens_since(&self, user_id: &str, since: DateTime<Utc>) -> StoreResult<u64>;

    /// Sum of `total_tokens` for `user_id` over all time
    async fn lifetime_tokens(&self, user_id: &str) -> StoreResult<u64>;

    /// Per-model totals for `user_id`, ordered by model name
    async fn usage_by_model(&self, user_id: &str) -> StoreResult<Vec<ModelUsage>>;
}

/// Rate-limit policy storage, at most one policy per user
#[async_trait::async_trait]
pub trait PolicyStore: Send + Sync {
    async fn policy(&self, user_id: &str) -> StoreResult<Option<RateLimitPolicy>>;

    async fn upsert_policy(&self, update: PolicyUpdate) -> StoreResult<RateLimitPolicy>;
}

/// User accounts and API keys
#[async_trait::async_trait]
pub trait UserDirectory: Send + Sync {
    async fn create_user(&self, name: &str) -> StoreResult<User>;

    async fn find_by_api_key(&self, api_key: &str) -> StoreResult<Option<User>>;

    async fn user(&self, user_id: &str) -> StoreResult<Option<User>>;
}

/// In-memory store (for testing and single-instance deployments)
#[derive(Debug, Default)]
pub struct MemoryStore {
    users: RwLock<HashMap<String, User>>,
    api_keys: RwLock<HashMap<String, String>>,
    policies: RwLock<HashMap<String, RateLimitPolicy>>,
    usage: RwLock<Vec<UsageRecord>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of ledger records
    pub async fn record_count(&self) -> usize {
        self.usage.read().await.len()
    }

    async fn ensure_user(&self, user_id: &str) -> StoreResult<()> {
        if self.users.read().await.contains_key(user_id) {
            Ok(())
        } else {
            Err(StoreError::unknown_user(user_id))
        }
    }
}

#[async_trait::async_trait]
impl UsageLedger for MemoryStore {
    async fn append(&self, record: UsageRecord) -> StoreResult<()> {
        self.ensure_user(&record.user_id).await?;
        self.usage.write().await.push(record);
        Ok(())
    }

    async fn tokens_since(&self, user_id: &str, since: DateTime<Utc>) -> StoreResult<u64> {
        let usage = self.usage.read().await;
        Ok(usage
            .iter()
            .filter(|r| r.user_id == user_id && r.created_at >= since)
            .map(|r| r.total_tokens)
            .sum())
    }

    async fn lifetime_tokens(&self, user_id: &str) -> StoreResult<u64> {
        let usage = self.usage.read().await;
        Ok(usage
            .iter()
            .filter(|r| r.user_id == user_id)
            .map(|r| r.total_tokens)
            .sum())
    }

    async fn usage_by_model(&self, user_id: &str) -> StoreResult<Vec<ModelUsage>> {
        let usage = self.usage.read().await;
        let mut by_model: BTreeMap<&str, ModelUsage> = BTreeMap::new();

        for record in usage.iter().filter(|r| r.user_id == user_id) {
            let entry = by_model.entry(record.model.as_str()).or_insert_with(|| ModelUsage {
                model: record.model.clone(),
                ..Default::default()
            });
            entry.prompt_tokens += record.prompt_tokens;
            entry.completion_tokens += record.completion_tokens;
            entry.total_tokens += record.total_tokens;
        }

        Ok(by_model.into_values().collect())
    }
}

#[async_trait::async_trait]
impl PolicyStore for MemoryStore {
    async fn policy(&self, user_id: &str) -> StoreResult<Option<RateLimitPolicy>> {
        Ok(self.policies.read().await.get(user_id).cloned())
    }

    async fn upsert_policy(&self, update: PolicyUpdate) -> StoreResult<RateLimitPolicy> {
        self.ensure_user(&update.user_id).await?;

        let policy = RateLimitPolicy {
            tokens_per_minute: update.tokens_per_minute,
            tokens_per_day: update.tokens_per_day,
            tokens_lifetime: update.tokens_lifetime,
            priority: update
                .priority
                .map(|p| normalize_priority(p as i64))
                .unwrap_or(DEFAULT_PRIORITY),
            updated_at: Utc::now(),
            user_id: update.user_id,
        };

        self.policies
            .write()
            .await
            .insert(policy.user_id.clone(), policy.clone());
        Ok(policy)
    }
}

#[async_trait::async_trait]
impl UserDirectory for MemoryStore {
    async fn create_user(&self, name: &str) -> StoreResult<User> {
        let user = User {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            api_key: format!("sk-{}", Uuid::new_v4()),
            created_at: Utc::now(),
        };

        let mut api_keys = self.api_keys.write().await;
        if api_keys.contains_key(&user.api_key) {
            return Err(StoreError::conflict("api key already issued"));
        }
        api_keys.insert(user.api_key.clone(), user.id.clone());
        self.users.write().await.insert(user.id.clone(), user.clone());

        Ok(user)
    }

    async fn find_by_api_key(&self, api_key: &str) -> StoreResult<Option<User>> {
        let user_id = match self.api_keys.read().await.get(api_key) {
            Some(id) => id.clone(),
            None => return Ok(None),
        };
        Ok(self.users.read().await.get(&user_id).cloned())
    }

    async fn user(&self, user_id: &str) -> StoreResult<Option<User>> {
        Ok(self.users.read().await.get(user_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn tokens(prompt: u64, completion: u64) -> TokenUsage {
        TokenUsage {
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: prompt + completion,
        }
    }

    #[tokio::test]
    async fn test_create_and_resolve_user() {
        let store = MemoryStore::new();
        let user = store.create_user("alice").await.unwrap();

        assert!(user.api_key.starts_with("sk-"));
        assert_eq!(store.find_by_api_key(&user.api_key).await.unwrap(), Some(user.clone()));
        assert_eq!(store.user(&user.id).await.unwrap(), Some(user));
        assert_eq!(store.find_by_api_key("sk-nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_usage_sums() {
        let store = MemoryStore::new();
        let alice = store.create_user("alice").await.unwrap();
        let bob = store.create_user("bob").await.unwrap();
        let now = Utc::now();

        store
            .append(UsageRecord::at(&alice.id, "llama3.2:3b", tokens(10, 20), now - Duration::hours(3)))
            .await
            .unwrap();
        store
            .append(UsageRecord::at(&alice.id, "llama3.2:3b", tokens(5, 5), now - Duration::seconds(5)))
            .await
            .unwrap();
        store
            .append(UsageRecord::at(&bob.id, "mistral:7b", tokens(100, 100), now))
            .await
            .unwrap();

        let recent = store
            .tokens_since(&alice.id, now - Duration::minutes(1))
            .await
            .unwrap();
        assert_eq!(recent, 10);
        assert_eq!(store.lifetime_tokens(&alice.id).await.unwrap(), 40);
        assert_eq!(store.lifetime_tokens(&bob.id).await.unwrap(), 200);
        assert_eq!(store.lifetime_tokens("ghost").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_usage_by_model() {
        let store = MemoryStore::new();
        let user = store.create_user("carol").await.unwrap();

        store.append(UsageRecord::new(&user.id, "mistral:7b", tokens(1, 2))).await.unwrap();
        store.append(UsageRecord::new(&user.id, "llama3.2:3b", tokens(3, 4))).await.unwrap();
        store.append(UsageRecord::new(&user.id, "mistral:7b", tokens(10, 20))).await.unwrap();

        let usage = store.usage_by_model(&user.id).await.unwrap();
        assert_eq!(
            usage,
            vec![
                ModelUsage {
                    model: "llama3.2:3b".into(),
                    prompt_tokens: 3,
                    completion_tokens: 4,
                    total_tokens: 7,
                },
                ModelUsage {
                    model: "mistral:7b".into(),
                    prompt_tokens: 11,
                    completion_tokens: 22,
                    total_tokens: 33,
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_append_requires_known_user() {
        let store = MemoryStore::new();
        let err = store
            .append(UsageRecord::new("ghost", "m", tokens(1, 1)))
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::unknown_user("ghost"));
        assert_eq!(store.record_count().await, 0);
    }

    #[tokio::test]
    async fn test_policy_upsert_overwrites() {
        let store = MemoryStore::new();
        let user = store.create_user("dave").await.unwrap();

        let first = store
            .upsert_policy(PolicyUpdate {
                user_id: user.id.clone(),
                tokens_per_minute: Some(100),
                priority: Some(8),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(first.priority, 8);

        let second = store
            .upsert_policy(PolicyUpdate {
                user_id: user.id.clone(),
                tokens_per_day: Some(5_000),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(second.tokens_per_minute, None);
        assert_eq!(second.tokens_per_day, Some(5_000));
        assert_eq!(second.priority, DEFAULT_PRIORITY);

        assert_eq!(store.policy(&user.id).await.unwrap(), Some(second));
    }

    #[tokio::test]
    async fn test_policy_for_unknown_user_is_rejected() {
        let store = MemoryStore::new();
        let err = store
            .upsert_policy(PolicyUpdate { user_id: "ghost".into(), ..Default::default() })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UnknownUser(_)));
    }
}
