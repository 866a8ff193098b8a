//! User, credential and challenge records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use uuid::Uuid;

/// Public user identifier, `user_<unix-millis>`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

static LAST_ISSUED_MILLIS: AtomicI64 = AtomicI64::new(0);

impl UserId {
    /// Generate a fresh id from the wall clock.
    ///
    /// Two calls within the same millisecond would collide, so the
    /// timestamp is bumped past the last one handed out in this process.
    pub fn generate() -> Self {
        let now = Utc::now().timestamp_millis();
        let mut last = LAST_ISSUED_MILLIS.load(Ordering::Relaxed);
        loop {
            let next = if now > last { now } else { last + 1 };
            match LAST_ISSUED_MILLIS.compare_exchange_weak(
                last,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Self(format!("user_{}", next)),
                Err(observed) => last = observed,
            }
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for UserId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Correlation token handed out with every issued challenge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CeremonyId(Uuid);

impl CeremonyId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CeremonyId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for CeremonyId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl fmt::Display for CeremonyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// An enrolled public-key credential
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    /// Base64url (unpadded) credential ID
    pub credential_id: String,
    /// Signature counter last reported by the authenticator
    pub counter: u32,
    /// Engine-specific serialized key material
    pub passkey: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    /// WebAuthn user handle
    pub handle: Uuid,
    pub username: String,
    /// Argon2 PHC string
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub credential: Option<Credential>,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn new(username: impl Into<String>, password_hash: impl Into<String>) -> Self {
        Self {
            id: UserId::generate(),
            handle: Uuid::new_v4(),
            username: username.into(),
            password_hash: password_hash.into(),
            credential: None,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CeremonyKind {
    Registration,
    Authentication,
}

impl CeremonyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CeremonyKind::Registration => "registration",
            CeremonyKind::Authentication => "authentication",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "registration" => Some(CeremonyKind::Registration),
            "authentication" => Some(CeremonyKind::Authentication),
            _ => None,
        }
    }
}

/// The one outstanding challenge for a user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeRecord {
    pub user_id: UserId,
    pub ceremony_id: CeremonyId,
    pub kind: CeremonyKind,
    /// Engine ceremony state, carries the challenge bytes
    pub state: serde_json::Value,
    pub issued_at: DateTime<Utc>,
}

impl ChallengeRecord {
    pub fn new(user_id: UserId, kind: CeremonyKind, state: serde_json::Value) -> Self {
        Self {
            user_id,
            ceremony_id: CeremonyId::new(),
            kind,
            state,
            issued_at: Utc::now(),
        }
    }

    /// Whether this record answers a `Complete*` call for `kind` carrying
    /// the optional ceremony id.
    pub fn matches(&self, kind: CeremonyKind, ceremony_id: Option<&CeremonyId>) -> bool {
        self.kind == kind && ceremony_id.map_or(true, |id| *id == self.ceremony_id)
    }
}
