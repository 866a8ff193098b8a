//! Storage interfaces for users and outstanding challenges

use crate::models::{ChallengeRecord, Credential, User, UserId};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("User already exists: {0}")]
    Duplicate(UserId),

    #[error("User not found: {0}")]
    MissingUser(UserId),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Corrupt(e.to_string())
    }
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn insert_user(&self, user: User) -> Result<(), StoreError>;

    async fn get_user(&self, id: &UserId) -> Result<Option<User>, StoreError>;

    /// Replace the user's credential, fails with `MissingUser` if the id is
    /// unknown.
    async fn set_credential(&self, id: &UserId, credential: Credential) -> Result<(), StoreError>;

    /// Store the credential returned by a login, but only while the stored
    /// credential still has the same id and `expected_counter`. Returns
    /// `false` when a concurrent login already moved it on.
    async fn advance_credential(
        &self,
        id: &UserId,
        expected_counter: u32,
        credential: Credential,
    ) -> Result<bool, StoreError>;

    async fn user_count(&self) -> Result<usize, StoreError>;
}

#[async_trait]
pub trait ChallengeStore: Send + Sync {
    /// Store the record as the user's only outstanding challenge, returning
    /// the one it replaced.
    async fn put_challenge(
        &self,
        record: ChallengeRecord,
    ) -> Result<Option<ChallengeRecord>, StoreError>;

    async fn get_challenge(&self, user_id: &UserId) -> Result<Option<ChallengeRecord>, StoreError>;
}

/// Process-local store, discarded on restart
#[derive(Clone, Default)]
pub struct MemoryStore {
    users: Arc<RwLock<HashMap<UserId, User>>>,
    challenges: Arc<RwLock<HashMap<UserId, ChallengeRecord>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn insert_user(&self, user: User) -> Result<(), StoreError> {
        let mut users = self.users.write().await;
        if users.contains_key(&user.id) {
            return Err(StoreError::Duplicate(user.id));
        }
        users.insert(user.id.clone(), user);
        Ok(())
    }

    async fn get_user(&self, id: &UserId) -> Result<Option<User>, StoreError> {
        Ok(self.users.read().await.get(id).cloned())
    }

    async fn set_credential(&self, id: &UserId, credential: Credential) -> Result<(), StoreError> {
        let mut users = self.users.write().await;
        let user = users
            .get_mut(id)
            .ok_or_else(|| StoreError::MissingUser(id.clone()))?;
        user.credential = Some(credential);
        Ok(())
    }

    async fn advance_credential(
        &self,
        id: &UserId,
        expected_counter: u32,
        credential: Credential,
    ) -> Result<bool, StoreError> {
        let mut users = self.users.write().await;
        let user = users
            .get_mut(id)
            .ok_or_else(|| StoreError::MissingUser(id.clone()))?;

        match &user.credential {
            Some(current)
                if current.credential_id == credential.credential_id
                    && current.counter == expected_counter =>
            {
                user.credential = Some(credential);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn user_count(&self) -> Result<usize, StoreError> {
        Ok(self.users.read().await.len())
    }
}

#[async_trait]
impl ChallengeStore for MemoryStore {
    async fn put_challenge(
        &self,
        record: ChallengeRecord,
    ) -> Result<Option<ChallengeRecord>, StoreError> {
        Ok(self
            .challenges
            .write()
            .await
            .insert(record.user_id.clone(), record))
    }

    async fn get_challenge(&self, user_id: &UserId) -> Result<Option<ChallengeRecord>, StoreError> {
        Ok(self.challenges.read().await.get(user_id).cloned())
    }
}
