//! Passkey registration and login ceremonies

use crate::models::{CeremonyId, CeremonyKind, ChallengeRecord, User, UserId};
use crate::store::{ChallengeStore, StoreError, UserStore};
use crate::webauthn::{CeremonyEngine, EngineError, Verification};
use argon2::password_hash::{rand_core::OsRng, SaltString};
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("User not found: {0}")]
    NotFound(UserId),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("No challenge issued for user {0}")]
    NoChallengeIssued(UserId),

    #[error("No credential enrolled for user {0}")]
    NoCredentialEnrolled(UserId),

    #[error("Malformed client response: {0}")]
    MalformedResponse(String),

    #[error("Hashing error: {0}")]
    Hashing(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Ceremony engine error: {0}")]
    Engine(EngineError),
}

impl From<EngineError> for SessionError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::MalformedResponse(reason) => SessionError::MalformedResponse(reason),
            other => SessionError::Engine(other),
        }
    }
}

/// Challenge options to relay to the client unmodified
#[derive(Debug, Clone)]
pub struct IssuedCeremony {
    pub ceremony_id: CeremonyId,
    pub options: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginOutcome {
    pub verified: bool,
    pub user_id: UserId,
}

/// Owns user/credential state and the one-challenge-per-user rule
#[derive(Clone)]
pub struct SessionCoordinator {
    users: Arc<dyn UserStore>,
    challenges: Arc<dyn ChallengeStore>,
    engine: Arc<dyn CeremonyEngine>,
    argon2: Argon2<'static>,
}

impl SessionCoordinator {
    pub fn new(
        users: Arc<dyn UserStore>,
        challenges: Arc<dyn ChallengeStore>,
        engine: Arc<dyn CeremonyEngine>,
    ) -> Self {
        Self {
            users,
            challenges,
            engine,
            argon2: Argon2::default(),
        }
    }

    pub fn users(&self) -> &Arc<dyn UserStore> {
        &self.users
    }

    async fn require_user(&self, user_id: &UserId) -> Result<User, SessionError> {
        self.users
            .get_user(user_id)
            .await?
            .ok_or_else(|| SessionError::NotFound(user_id.clone()))
    }

    /// Register a new user, returning the generated id
    pub async fn create_user(&self, username: &str, password: &str) -> Result<UserId, SessionError> {
        let username = username.trim();
        if username.is_empty() {
            return Err(SessionError::InvalidInput("username must not be empty".to_string()));
        }

        let salt = SaltString::generate(&mut OsRng);
        let password_hash = self
            .argon2
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| SessionError::Hashing(e.to_string()))?;

        let user = User::new(username, password_hash.to_string());
        let id = user.id.clone();
        self.users.insert_user(user).await?;

        info!("Created user {} ({})", id, username);
        Ok(id)
    }

    /// Check a password against the stored hash
    pub async fn verify_password(&self, user_id: &UserId, password: &str) -> Result<bool, SessionError> {
        let user = self.require_user(user_id).await?;
        let parsed_hash = PasswordHash::new(&user.password_hash)
            .map_err(|e| SessionError::Hashing(e.to_string()))?;

        Ok(self
            .argon2
            .verify_password(password.as_bytes(), &parsed_hash)
            .is_ok())
    }

    async fn issue(
        &self,
        user_id: &UserId,
        kind: CeremonyKind,
        options: Value,
        state: Value,
    ) -> Result<IssuedCeremony, SessionError> {
        let record = ChallengeRecord::new(user_id.clone(), kind, state);
        let ceremony_id = record.ceremony_id;

        if let Some(previous) = self.challenges.put_challenge(record).await? {
            debug!(
                "Challenge {} ({}) for {} superseded by {}",
                previous.ceremony_id,
                previous.kind.as_str(),
                user_id,
                ceremony_id
            );
        }

        Ok(IssuedCeremony { ceremony_id, options })
    }

    /// Look up the outstanding challenge and decide whether it answers this
    /// completion. `Ok(None)` means it was superseded.
    async fn outstanding(
        &self,
        user_id: &UserId,
        kind: CeremonyKind,
        ceremony_id: Option<&CeremonyId>,
    ) -> Result<Option<ChallengeRecord>, SessionError> {
        let record = self
            .challenges
            .get_challenge(user_id)
            .await?
            .ok_or_else(|| SessionError::NoChallengeIssued(user_id.clone()))?;

        if record.matches(kind, ceremony_id) {
            Ok(Some(record))
        } else {
            warn!(
                "Stale {} completion for {}: outstanding ceremony is {} ({})",
                kind.as_str(),
                user_id,
                record.ceremony_id,
                record.kind.as_str()
            );
            Ok(None)
        }
    }

    pub async fn begin_registration(&self, user_id: &UserId) -> Result<IssuedCeremony, SessionError> {
        let user = self.require_user(user_id).await?;

        let exclude: Vec<_> = user.credential.iter().cloned().collect();
        let issued = self.engine.start_registration(&user, &exclude)?;

        let ceremony = self
            .issue(user_id, CeremonyKind::Registration, issued.options, issued.state)
            .await?;
        info!("Registration challenge {} issued for {}", ceremony.ceremony_id, user_id);
        Ok(ceremony)
    }

    /// Verify an attestation. A failed verification leaves both the
    /// challenge and the user untouched.
    pub async fn complete_registration(
        &self,
        user_id: &UserId,
        ceremony_id: Option<&CeremonyId>,
        response: &Value,
    ) -> Result<bool, SessionError> {
        self.require_user(user_id).await?;

        let Some(record) = self
            .outstanding(user_id, CeremonyKind::Registration, ceremony_id)
            .await?
        else {
            return Ok(false);
        };

        match self.engine.finish_registration(&record.state, response)? {
            Verification::Verified(credential) => {
                let credential_id = credential.credential_id.clone();
                self.users.set_credential(user_id, credential).await?;
                info!("Credential {} enrolled for {}", credential_id, user_id);
                Ok(true)
            }
            Verification::Rejected(reason) => {
                warn!("Registration for {} not verified: {}", user_id, reason);
                Ok(false)
            }
        }
    }

    pub async fn begin_authentication(&self, user_id: &UserId) -> Result<IssuedCeremony, SessionError> {
        let user = self.require_user(user_id).await?;
        let credential = user
            .credential
            .ok_or_else(|| SessionError::NoCredentialEnrolled(user_id.clone()))?;

        let issued = self.engine.start_authentication(&credential)?;

        let ceremony = self
            .issue(user_id, CeremonyKind::Authentication, issued.options, issued.state)
            .await?;
        info!("Login challenge {} issued for {}", ceremony.ceremony_id, user_id);
        Ok(ceremony)
    }

    /// Verify an assertion. On success the signature counter is persisted;
    /// no session artifact is issued.
    pub async fn complete_authentication(
        &self,
        user_id: &UserId,
        ceremony_id: Option<&CeremonyId>,
        response: &Value,
    ) -> Result<LoginOutcome, SessionError> {
        let user = self.require_user(user_id).await?;
        let credential = user
            .credential
            .ok_or_else(|| SessionError::NoCredentialEnrolled(user_id.clone()))?;

        let rejected = LoginOutcome {
            verified: false,
            user_id: user_id.clone(),
        };

        let Some(record) = self
            .outstanding(user_id, CeremonyKind::Authentication, ceremony_id)
            .await?
        else {
            return Ok(rejected);
        };

        match self
            .engine
            .finish_authentication(&record.state, response, &credential)?
        {
            Verification::Verified(updated) => {
                debug!("Counter for {} now {}", updated.credential_id, updated.counter);
                if !self
                    .users
                    .advance_credential(user_id, credential.counter, updated)
                    .await?
                {
                    warn!("Login for {} lost a race with a concurrent login", user_id);
                    return Ok(rejected);
                }
                info!("User {} logged in", user_id);
                Ok(LoginOutcome {
                    verified: true,
                    user_id: user_id.clone(),
                })
            }
            Verification::Rejected(reason) => {
                warn!("Login for {} not verified: {}", user_id, reason);
                Ok(rejected)
            }
        }
    }
}
