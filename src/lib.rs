//! Passkey Server - WebAuthn registration and login over HTTP
//!
//! Ceremony cryptography is delegated to `webauthn-rs`; this crate owns the
//! user records and the one-outstanding-challenge-per-user bookkeeping.

pub mod auth;
pub mod config;
pub mod database;
pub mod models;
pub mod rate_limit;
pub mod security;
pub mod store;
pub mod web;
pub mod webauthn;

pub use auth::{IssuedCeremony, LoginOutcome, SessionCoordinator, SessionError};
pub use config::{ServerConfig, StoreKind, WebAuthnConfig};
pub use models::{CeremonyId, Credential, User, UserId};
pub use store::{ChallengeStore, MemoryStore, StoreError, UserStore};
pub use webauthn::{CeremonyEngine, WebAuthnManager};

use database::SqliteStore;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Engine(#[from] webauthn::EngineError),
}

/// Application context shared across handlers
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<ServerConfig>,
    pub coordinator: SessionCoordinator,
}

impl AppContext {
    /// Build the configured store and the `webauthn-rs` engine
    pub async fn new(config: ServerConfig) -> Result<Self, StartupError> {
        config.webauthn.validate()?;
        let engine: Arc<dyn CeremonyEngine> = Arc::new(WebAuthnManager::new(&config.webauthn)?);

        let coordinator = match config.store {
            StoreKind::Memory => {
                let store = Arc::new(MemoryStore::new());
                SessionCoordinator::new(store.clone(), store, engine)
            }
            StoreKind::Sqlite => {
                let store = Arc::new(SqliteStore::connect(&config.database_url).await?);
                SessionCoordinator::new(store.clone(), store, engine)
            }
        };

        Ok(Self {
            config: Arc::new(config),
            coordinator,
        })
    }

    /// Context over a caller-supplied engine and store
    pub fn with_parts<S>(config: ServerConfig, store: Arc<S>, engine: Arc<dyn CeremonyEngine>) -> Self
    where
        S: UserStore + ChallengeStore + 'static,
    {
        Self {
            config: Arc::new(config),
            coordinator: SessionCoordinator::new(store.clone(), store, engine),
        }
    }
}
