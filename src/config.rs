//! Configuration for the passkey server

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use thiserror::Error;
use webauthn_rs::prelude::Url;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] config::ConfigError),

    #[error("Invalid rp_origin {origin}: {reason}")]
    InvalidOrigin { origin: String, reason: String },

    #[error("rp_origin host {host} is not covered by rp_id {rp_id}")]
    Inconsistent { host: String, rp_id: String },
}

/// Which backend holds users and challenges
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Web server host
    pub host: String,

    /// Web server port
    pub port: u16,

    /// Directory holding the browser client
    pub static_dir: String,

    /// Storage backend
    pub store: StoreKind,

    /// Database URL, used by the sqlite store
    pub database_url: String,

    /// Maximum accepted request body in bytes
    pub body_limit: usize,

    /// WebAuthn configuration
    pub webauthn: WebAuthnConfig,

    /// Ceremony endpoint rate limiting
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebAuthnConfig {
    pub rp_id: String,
    pub rp_name: String,
    pub rp_origin: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub max_requests: u32,
    pub window_secs: u64,
    /// Peers whose `X-Forwarded-For` header names the real client
    #[serde(default)]
    pub trusted_proxies: Vec<IpAddr>,
}

impl Default for WebAuthnConfig {
    fn default() -> Self {
        Self {
            rp_id: "localhost".to_string(),
            rp_name: "Localhost Machine".to_string(),
            rp_origin: "http://localhost:3000".to_string(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_requests: 30,
            window_secs: 60,
            trusted_proxies: Vec::new(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            static_dir: "public".to_string(),
            store: StoreKind::Memory,
            database_url: "sqlite://passkeys.db".to_string(),
            body_limit: 1024 * 1024,
            webauthn: WebAuthnConfig::default(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

impl WebAuthnConfig {
    /// The origin's host must be the RP id or a subdomain of it, otherwise
    /// every ceremony fails the origin check.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let origin = Url::parse(&self.rp_origin).map_err(|e| ConfigError::InvalidOrigin {
            origin: self.rp_origin.clone(),
            reason: e.to_string(),
        })?;

        let host = origin.host_str().ok_or_else(|| ConfigError::InvalidOrigin {
            origin: self.rp_origin.clone(),
            reason: "missing host".to_string(),
        })?;

        if host == self.rp_id || host.ends_with(&format!(".{}", self.rp_id)) {
            Ok(())
        } else {
            Err(ConfigError::Inconsistent {
                host: host.to_string(),
                rp_id: self.rp_id.clone(),
            })
        }
    }
}

pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfig {
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder {
            config: ServerConfig::default(),
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Load configuration from defaults, `passkey-server.toml` and the
    /// `PASSKEY_` environment (nested keys use `__`).
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&ServerConfig::default())?);

        if std::path::Path::new("passkey-server.toml").exists() {
            builder = builder.add_source(config::File::with_name("passkey-server"));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("PASSKEY")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: ServerConfig = builder.build()?.try_deserialize()?;
        config.webauthn.validate()?;
        Ok(config)
    }
}

impl ServerConfigBuilder {
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn static_dir(mut self, dir: impl Into<String>) -> Self {
        self.config.static_dir = dir.into();
        self
    }

    pub fn store(mut self, store: StoreKind) -> Self {
        self.config.store = store;
        self
    }

    pub fn database_url(mut self, url: impl Into<String>) -> Self {
        self.config.database_url = url.into();
        self
    }

    pub fn webauthn(mut self, webauthn: WebAuthnConfig) -> Self {
        self.config.webauthn = webauthn;
        self
    }

    pub fn rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.config.rate_limit = rate_limit;
        self
    }

    pub fn build(self) -> ServerConfig {
        self.config
    }
}
