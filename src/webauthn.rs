//! WebAuthn ceremony engine
//!
//! The coordinator only sees [`CeremonyEngine`]: options and ceremony state
//! travel as JSON so the stores never depend on `webauthn-rs` types.

use crate::config::WebAuthnConfig;
use crate::models::{Credential, User};
use base64::{engine::general_purpose, Engine as _};
use chrono::Utc;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;
use webauthn_rs::prelude::*;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Malformed client response: {0}")]
    MalformedResponse(String),

    #[error("Invalid WebAuthn configuration: {0}")]
    Configuration(String),

    #[error("Ceremony error: {0}")]
    Ceremony(String),
}

/// Options for the client plus the state kept server side
#[derive(Debug, Clone)]
pub struct IssuedChallenge {
    pub options: Value,
    pub state: Value,
}

#[derive(Debug, Clone)]
pub enum Verification {
    Verified(Credential),
    Rejected(String),
}

pub trait CeremonyEngine: Send + Sync {
    fn start_registration(
        &self,
        user: &User,
        exclude: &[Credential],
    ) -> Result<IssuedChallenge, EngineError>;

    /// Verify an attestation against the stored state. A signature or
    /// challenge mismatch is `Ok(Verification::Rejected)`.
    fn finish_registration(&self, state: &Value, response: &Value)
        -> Result<Verification, EngineError>;

    fn start_authentication(&self, credential: &Credential) -> Result<IssuedChallenge, EngineError>;

    /// On success the returned credential carries the updated counter.
    fn finish_authentication(
        &self,
        state: &Value,
        response: &Value,
        credential: &Credential,
    ) -> Result<Verification, EngineError>;
}

pub struct WebAuthnManager {
    webauthn: Webauthn,
}

impl WebAuthnManager {
    pub fn new(config: &WebAuthnConfig) -> Result<Self, EngineError> {
        let rp_origin = Url::parse(&config.rp_origin).map_err(|e| {
            EngineError::Configuration(format!("invalid rp_origin {}: {}", config.rp_origin, e))
        })?;

        let webauthn = WebauthnBuilder::new(&config.rp_id, &rp_origin)
            .map_err(|e| {
                EngineError::Configuration(format!(
                    "rp_id={} rp_origin={}: {:?}",
                    config.rp_id, rp_origin, e
                ))
            })?
            .rp_name(&config.rp_name)
            .build()
            .map_err(|e| EngineError::Configuration(format!("{:?}", e)))?;

        Ok(Self { webauthn })
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<Value, EngineError> {
    serde_json::to_value(value).map_err(|e| EngineError::Ceremony(e.to_string()))
}

fn parse_state<T: serde::de::DeserializeOwned>(state: &Value) -> Result<T, EngineError> {
    serde_json::from_value(state.clone())
        .map_err(|e| EngineError::Ceremony(format!("unreadable ceremony state: {}", e)))
}

fn parse_response<T: serde::de::DeserializeOwned>(response: &Value) -> Result<T, EngineError> {
    serde_json::from_value(response.clone())
        .map_err(|e| EngineError::MalformedResponse(e.to_string()))
}

fn load_passkey(credential: &Credential) -> Result<Passkey, EngineError> {
    serde_json::from_value(credential.passkey.clone())
        .map_err(|e| EngineError::Ceremony(format!("unreadable stored passkey: {}", e)))
}

impl CeremonyEngine for WebAuthnManager {
    fn start_registration(
        &self,
        user: &User,
        exclude: &[Credential],
    ) -> Result<IssuedChallenge, EngineError> {
        let exclude_ids = exclude
            .iter()
            .map(|c| load_passkey(c).map(|pk| pk.cred_id().clone()))
            .collect::<Result<Vec<CredentialID>, _>>()?;
        let exclude_ids = if exclude_ids.is_empty() { None } else { Some(exclude_ids) };

        let (ccr, reg_state) = self
            .webauthn
            .start_passkey_registration(user.handle, &user.username, &user.username, exclude_ids)
            .map_err(|e| EngineError::Ceremony(format!("start registration failed: {:?}", e)))?;

        Ok(IssuedChallenge {
            options: to_json(&ccr)?,
            state: to_json(&reg_state)?,
        })
    }

    fn finish_registration(
        &self,
        state: &Value,
        response: &Value,
    ) -> Result<Verification, EngineError> {
        let reg_state: PasskeyRegistration = parse_state(state)?;
        let reg: RegisterPublicKeyCredential = parse_response(response)?;

        match self.webauthn.finish_passkey_registration(&reg, &reg_state) {
            Ok(passkey) => {
                let credential_id = general_purpose::URL_SAFE_NO_PAD.encode(passkey.cred_id());
                // The authenticator reports its counter on the first assertion
                Ok(Verification::Verified(Credential {
                    credential_id,
                    counter: 0,
                    passkey: to_json(&passkey)?,
                    created_at: Utc::now(),
                    last_used_at: None,
                }))
            }
            Err(e) => {
                debug!("Registration rejected: {:?}", e);
                Ok(Verification::Rejected(format!("{:?}", e)))
            }
        }
    }

    fn start_authentication(&self, credential: &Credential) -> Result<IssuedChallenge, EngineError> {
        let passkey = load_passkey(credential)?;

        let (rcr, auth_state) = self
            .webauthn
            .start_passkey_authentication(&[passkey])
            .map_err(|e| EngineError::Ceremony(format!("start authentication failed: {:?}", e)))?;

        Ok(IssuedChallenge {
            options: to_json(&rcr)?,
            state: to_json(&auth_state)?,
        })
    }

    fn finish_authentication(
        &self,
        state: &Value,
        response: &Value,
        credential: &Credential,
    ) -> Result<Verification, EngineError> {
        let auth_state: PasskeyAuthentication = parse_state(state)?;
        let assertion: PublicKeyCredential = parse_response(response)?;

        let result = match self.webauthn.finish_passkey_authentication(&assertion, &auth_state) {
            Ok(result) => result,
            Err(e) => {
                debug!("Authentication rejected: {:?}", e);
                return Ok(Verification::Rejected(format!("{:?}", e)));
            }
        };

        // The ceremony state holds the counter from when the challenge was
        // issued; compare against the one persisted since.
        if result.counter() != 0 && result.counter() <= credential.counter {
            return Ok(Verification::Rejected(format!(
                "signature counter {} not above stored {}",
                result.counter(),
                credential.counter
            )));
        }

        let mut passkey = load_passkey(credential)?;
        if passkey.update_credential(&result).is_none() {
            return Ok(Verification::Rejected(
                "assertion was made by a different credential".to_string(),
            ));
        }

        Ok(Verification::Verified(Credential {
            credential_id: credential.credential_id.clone(),
            counter: result.counter(),
            passkey: to_json(&passkey)?,
            created_at: credential.created_at,
            last_used_at: Some(Utc::now()),
        }))
    }
}
