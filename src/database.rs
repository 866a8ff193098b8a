//! SQLite-backed user and challenge store

use crate::models::{CeremonyId, CeremonyKind, ChallengeRecord, Credential, User, UserId};
use crate::store::{ChallengeStore, StoreError, UserStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::debug;
use uuid::Uuid;

/// Open the database and run migrations
pub async fn init_db(database_url: &str) -> Result<SqlitePool, StoreError> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .foreign_keys(true);

    // Every connection to an in-memory database sees its own empty schema
    let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    debug!("SQLite store ready at {}", database_url);

    Ok(pool)
}

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        Ok(Self::new(init_db(database_url).await?))
    }

    async fn user_exists(&self, id: &UserId) -> Result<bool, StoreError> {
        Ok(sqlx::query("SELECT 1 FROM users WHERE id = ?1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?
            .is_some())
    }
}

fn parse_uuid(value: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(value).map_err(|e| StoreError::Corrupt(format!("bad uuid {}: {}", value, e)))
}

fn user_from_row(row: &SqliteRow) -> Result<User, StoreError> {
    let handle: String = row.try_get("handle")?;

    let credential_id: Option<String> = row.try_get("credential_id")?;
    let credential = match credential_id {
        Some(credential_id) => {
            let counter: i64 = row.try_get("counter")?;
            let passkey: String = row.try_get("passkey")?;
            Some(Credential {
                credential_id,
                counter: u32::try_from(counter)
                    .map_err(|_| StoreError::Corrupt(format!("counter out of range: {}", counter)))?,
                passkey: serde_json::from_str(&passkey)?,
                created_at: row.try_get("credential_created_at")?,
                last_used_at: row.try_get("last_used_at")?,
            })
        }
        None => None,
    };

    Ok(User {
        id: UserId::from(row.try_get::<String, _>("id")?),
        handle: parse_uuid(&handle)?,
        username: row.try_get("username")?,
        password_hash: row.try_get("password_hash")?,
        credential,
        created_at: row.try_get("created_at")?,
    })
}

fn challenge_from_row(row: &SqliteRow) -> Result<ChallengeRecord, StoreError> {
    let ceremony_id: String = row.try_get("ceremony_id")?;
    let kind: String = row.try_get("kind")?;
    let state: String = row.try_get("state")?;
    let issued_at: DateTime<Utc> = row.try_get("issued_at")?;

    Ok(ChallengeRecord {
        user_id: UserId::from(row.try_get::<String, _>("user_id")?),
        ceremony_id: CeremonyId::from(parse_uuid(&ceremony_id)?),
        kind: CeremonyKind::parse(&kind)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown ceremony kind: {}", kind)))?,
        state: serde_json::from_str(&state)?,
        issued_at,
    })
}

#[async_trait]
impl UserStore for SqliteStore {
    async fn insert_user(&self, user: User) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO users (id, handle, username, password_hash, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(user.id.as_str())
        .bind(user.handle.to_string())
        .bind(&user.username)
        .bind(&user.password_hash)
        .bind(user.created_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {}
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                return Err(StoreError::Duplicate(user.id));
            }
            Err(e) => return Err(e.into()),
        }

        if let Some(credential) = user.credential {
            self.set_credential(&user.id, credential).await?;
        }

        Ok(())
    }

    async fn get_user(&self, id: &UserId) -> Result<Option<User>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT u.id, u.handle, u.username, u.password_hash, u.created_at,
                   c.credential_id, c.counter, c.passkey,
                   c.created_at AS credential_created_at, c.last_used_at
            FROM users u
            LEFT JOIN credentials c ON c.user_id = u.id
            WHERE u.id = ?1
            "#,
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(user_from_row).transpose()
    }

    async fn set_credential(&self, id: &UserId, credential: Credential) -> Result<(), StoreError> {
        if !self.user_exists(id).await? {
            return Err(StoreError::MissingUser(id.clone()));
        }

        sqlx::query(
            r#"
            INSERT INTO credentials (user_id, credential_id, counter, passkey, created_at, last_used_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(user_id) DO UPDATE SET
                credential_id = excluded.credential_id,
                counter = excluded.counter,
                passkey = excluded.passkey,
                created_at = excluded.created_at,
                last_used_at = excluded.last_used_at
            "#,
        )
        .bind(id.as_str())
        .bind(&credential.credential_id)
        .bind(i64::from(credential.counter))
        .bind(serde_json::to_string(&credential.passkey)?)
        .bind(credential.created_at)
        .bind(credential.last_used_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn advance_credential(
        &self,
        id: &UserId,
        expected_counter: u32,
        credential: Credential,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE credentials
            SET counter = ?1, passkey = ?2, last_used_at = ?3
            WHERE user_id = ?4 AND credential_id = ?5 AND counter = ?6
            "#,
        )
        .bind(i64::from(credential.counter))
        .bind(serde_json::to_string(&credential.passkey)?)
        .bind(credential.last_used_at)
        .bind(id.as_str())
        .bind(&credential.credential_id)
        .bind(i64::from(expected_counter))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        if !self.user_exists(id).await? {
            return Err(StoreError::MissingUser(id.clone()));
        }
        Ok(false)
    }

    async fn user_count(&self) -> Result<usize, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }
}

#[async_trait]
impl ChallengeStore for SqliteStore {
    async fn put_challenge(
        &self,
        record: ChallengeRecord,
    ) -> Result<Option<ChallengeRecord>, StoreError> {
        let mut tx = self.pool.begin().await?;

        let previous = sqlx::query(
            r#"
            SELECT user_id, ceremony_id, kind, state, issued_at
            FROM challenges
            WHERE user_id = ?1
            "#,
        )
        .bind(record.user_id.as_str())
        .fetch_optional(&mut *tx)
        .await?
        .as_ref()
        .map(challenge_from_row)
        .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO challenges (user_id, ceremony_id, kind, state, issued_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(user_id) DO UPDATE SET
                ceremony_id = excluded.ceremony_id,
                kind = excluded.kind,
                state = excluded.state,
                issued_at = excluded.issued_at
            "#,
        )
        .bind(record.user_id.as_str())
        .bind(record.ceremony_id.to_string())
        .bind(record.kind.as_str())
        .bind(serde_json::to_string(&record.state)?)
        .bind(record.issued_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(previous)
    }

    async fn get_challenge(&self, user_id: &UserId) -> Result<Option<ChallengeRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT user_id, ceremony_id, kind, state, issued_at
            FROM challenges
            WHERE user_id = ?1
            "#,
        )
        .bind(user_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(challenge_from_row).transpose()
    }
}
