//! SQLite persistence backend for users, policies and the usage ledger.
//!
//! Enable with the `sqlite` feature flag. Timestamps are stored as Unix
//! milliseconds so window queries compare integers.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tracing::{debug, info};
use uuid::Uuid;

use crate::admission::{normalize_priority, DEFAULT_PRIORITY};
use crate::error::{StoreError, StoreResult};
use crate::store::{
    ModelUsage, PolicyStore, PolicyUpdate, RateLimitPolicy, UsageLedger, UsageRecord, User,
    UserDirectory,
};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS users (
        id         TEXT PRIMARY KEY,
        name       TEXT NOT NULL,
        api_key    TEXT NOT NULL UNIQUE,
        created_at INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_users_api_key ON users (api_key)",
    r#"
    CREATE TABLE IF NOT EXISTS usage_records (
        id                TEXT PRIMARY KEY,
        user_id           TEXT NOT NULL REFERENCES users (id),
        model             TEXT NOT NULL,
        prompt_tokens     INTEGER NOT NULL,
        completion_tokens INTEGER NOT NULL,
        total_tokens      INTEGER NOT NULL,
        created_at        INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_usage_user_model ON usage_records (user_id, model)",
    "CREATE INDEX IF NOT EXISTS idx_usage_user_created ON usage_records (user_id, created_at)",
    r#"
    CREATE TABLE IF NOT EXISTS rate_limits (
        user_id           TEXT PRIMARY KEY REFERENCES users (id),
        tokens_per_minute INTEGER,
        tokens_per_day    INTEGER,
        tokens_lifetime   INTEGER,
        priority          INTEGER NOT NULL DEFAULT 5,
        updated_at        INTEGER NOT NULL
    )
    "#,
];

/// Store backed by a SQLite database file
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path` in WAL mode and
    /// apply the schema.
    pub async fn open(path: &str) -> StoreResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let store = Self::with_pool(pool);
        store.migrate().await?;
        info!(path, "Opened SQLite store");
        Ok(store)
    }

    /// Private in-memory database, mostly for tests
    pub async fn in_memory() -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);

        // every connection would get its own empty database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self::with_pool(pool);
        store.migrate().await?;
        Ok(store)
    }

    /// Create with an existing connection pool. Call [`migrate`](Self::migrate)
    /// before use.
    pub fn with_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        debug!("SQLite schema up to date");
        Ok(())
    }

    /// Close every pooled connection
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn ensure_user(&self, user_id: &str) -> StoreResult<()> {
        let row = sqlx::query("SELECT 1 FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(_) => Ok(()),
            None => Err(StoreError::unknown_user(user_id)),
        }
    }
}

fn to_db(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_db(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> StoreResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::unavailable(format!("timestamp out of range: {}", ms)))
}

/// Current time at the precision the database keeps
fn now() -> StoreResult<DateTime<Utc>> {
    from_millis(to_millis(Utc::now()))
}

fn user_from_row(row: &sqlx::sqlite::SqliteRow) -> StoreResult<User> {
    Ok(User {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        api_key: row.try_get("api_key")?,
        created_at: from_millis(row.try_get("created_at")?)?,
    })
}

#[async_trait::async_trait]
impl UsageLedger for SqliteStore {
    async fn append(&self, record: UsageRecord) -> StoreResult<()> {
        self.ensure_user(&record.user_id).await?;

        sqlx::query(
            r#"
            INSERT INTO usage_records
                (id, user_id, model, prompt_tokens, completion_tokens, total_tokens, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.id.to_string())
        .bind(&record.user_id)
        .bind(&record.model)
        .bind(to_db(record.prompt_tokens))
        .bind(to_db(record.completion_tokens))
        .bind(to_db(record.total_tokens))
        .bind(to_millis(record.created_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn tokens_since(&self, user_id: &str, since: DateTime<Utc>) -> StoreResult<u64> {
        let row = sqlx::query(
            "SELECT COALESCE(SUM(total_tokens), 0) AS total FROM usage_records \
             WHERE user_id = ? AND created_at >= ?",
        )
        .bind(user_id)
        .bind(to_millis(since))
        .fetch_one(&self.pool)
        .await?;

        Ok(from_db(row.try_get("total")?))
    }

    async fn lifetime_tokens(&self, user_id: &str) -> StoreResult<u64> {
        let row = sqlx::query(
            "SELECT COALESCE(SUM(total_tokens), 0) AS total FROM usage_records WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(from_db(row.try_get("total")?))
    }

    async fn usage_by_model(&self, user_id: &str) -> StoreResult<Vec<ModelUsage>> {
        let rows = sqlx::query(
            r#"
            SELECT model,
                   SUM(prompt_tokens)     AS prompt_tokens,
                   SUM(completion_tokens) AS completion_tokens,
                   SUM(total_tokens)      AS total_tokens
            FROM usage_records
            WHERE user_id = ?
            GROUP BY model
            ORDER BY model
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> StoreResult<ModelUsage> {
                Ok(ModelUsage {
                    model: row.try_get("model")?,
                    prompt_tokens: from_db(row.try_get("prompt_tokens")?),
                    completion_tokens: from_db(row.try_get("completion_tokens")?),
                    total_tokens: from_db(row.try_get("total_tokens")?),
                })
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl PolicyStore for SqliteStore {
    async fn policy(&self, user_id: &str) -> StoreResult<Option<RateLimitPolicy>> {
        let row = sqlx::query(
            "SELECT user_id, tokens_per_minute, tokens_per_day, tokens_lifetime, priority, updated_at \
             FROM rate_limits WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        Ok(Some(RateLimitPolicy {
            user_id: row.try_get("user_id")?,
            tokens_per_minute: row.try_get::<Option<i64>, _>("tokens_per_minute")?.map(from_db),
            tokens_per_day: row.try_get::<Option<i64>, _>("tokens_per_day")?.map(from_db),
            tokens_lifetime: row.try_get::<Option<i64>, _>("tokens_lifetime")?.map(from_db),
            priority: normalize_priority(row.try_get("priority")?),
            updated_at: from_millis(row.try_get("updated_at")?)?,
        }))
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
            updated_at: now()?,
            user_id: update.user_id,
        };

        sqlx::query(
            r#"
            INSERT INTO rate_limits
                (user_id, tokens_per_minute, tokens_per_day, tokens_lifetime, priority, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (user_id) DO UPDATE SET
                tokens_per_minute = excluded.tokens_per_minute,
                tokens_per_day    = excluded.tokens_per_day,
                tokens_lifetime   = excluded.tokens_lifetime,
                priority          = excluded.priority,
                updated_at        = excluded.updated_at
            "#,
        )
        .bind(&policy.user_id)
        .bind(policy.tokens_per_minute.map(to_db))
        .bind(policy.tokens_per_day.map(to_db))
        .bind(policy.tokens_lifetime.map(to_db))
        .bind(policy.priority as i64)
        .bind(to_millis(policy.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(policy)
    }
}

#[async_trait::async_trait]
impl UserDirectory for SqliteStore {
    async fn create_user(&self, name: &str) -> StoreResult<User> {
        let user = User {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            api_key: format!("sk-{}", Uuid::new_v4()),
            created_at: now()?,
        };

        sqlx::query("INSERT INTO users (id, name, api_key, created_at) VALUES (?, ?, ?, ?)")
            .bind(&user.id)
            .bind(&user.name)
            .bind(&user.api_key)
            .bind(to_millis(user.created_at))
            .execute(&self.pool)
            .await?;

        Ok(user)
    }

    async fn find_by_api_key(&self, api_key: &str) -> StoreResult<Option<User>> {
        let row = sqlx::query("SELECT id, name, api_key, created_at FROM users WHERE api_key = ?")
            .bind(api_key)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn user(&self, user_id: &str) -> StoreResult<Option<User>> {
        let row = sqlx::query("SELECT id, name, api_key, created_at FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(user_from_row).transpose()
    }
}
