//! Unit tests for the session coordinator

use passkey_server::{SessionError, UserId};
use pretty_assertions::assert_eq;
use std::collections::HashSet;

#[path = "../common/mod.rs"]
mod common;

use common::{forged, signed, test_coordinator};

#[tokio::test]
async fn test_create_user_ids_unique() {
    let (coordinator, _) = test_coordinator();

    let mut ids = HashSet::new();
    for i in 0..50 {
        let id = coordinator
            .create_user(&format!("user{}", i), "x")
            .await
            .unwrap();
        assert!(id.as_str().starts_with("user_"));
        assert!(ids.insert(id));
    }
}

#[tokio::test]
async fn test_create_user_rejects_empty_username() {
    let (coordinator, _) = test_coordinator();

    assert_error_matches!(
        coordinator.create_user("   ", "x").await,
        SessionError::InvalidInput(_)
    );
}

#[tokio::test]
async fn test_password_is_hashed() {
    let (coordinator, _) = test_coordinator();
    let id = coordinator.create_user("alice", "hunter2").await.unwrap();

    let user = coordinator.users().get_user(&id).await.unwrap().unwrap();
    assert!(user.password_hash.starts_with("$argon2"));
    assert!(!user.password_hash.contains("hunter2"));

    assert!(coordinator.verify_password(&id, "hunter2").await.unwrap());
    assert!(!coordinator.verify_password(&id, "wrong").await.unwrap());
}

#[tokio::test]
async fn test_unknown_user_never_reaches_engine() {
    let (coordinator, engine) = test_coordinator();
    let ghost = UserId::from("user_0");
    let response = serde_json::json!({});

    assert_error_matches!(
        coordinator.begin_registration(&ghost).await,
        SessionError::NotFound(_)
    );
    assert_error_matches!(
        coordinator.begin_authentication(&ghost).await,
        SessionError::NotFound(_)
    );
    assert_error_matches!(
        coordinator.complete_registration(&ghost, None, &response).await,
        SessionError::NotFound(_)
    );
    assert_error_matches!(
        coordinator.complete_authentication(&ghost, None, &response).await,
        SessionError::NotFound(_)
    );

    assert_eq!(engine.calls(), 0);
}

#[tokio::test]
async fn test_complete_without_challenge() {
    let (coordinator, _) = test_coordinator();
    let id = coordinator.create_user("alice", "x").await.unwrap();

    assert_error_matches!(
        coordinator
            .complete_registration(&id, None, &serde_json::json!({}))
            .await,
        SessionError::NoChallengeIssued(_)
    );
}

#[tokio::test]
async fn test_registration_then_login() {
    let (coordinator, _) = test_coordinator();
    let id = coordinator.create_user("alice", "x").await.unwrap();

    let reg = coordinator.begin_registration(&id).await.unwrap();
    assert_eq!(reg.options["user"]["name"], "alice");
    let verified = coordinator
        .complete_registration(&id, Some(&reg.ceremony_id), &signed(&reg.options, "cred-1", 0))
        .await
        .unwrap();
    assert!(verified);

    let user = coordinator.users().get_user(&id).await.unwrap().unwrap();
    assert_eq!(user.credential.unwrap().credential_id, "cred-1");

    let login = coordinator.begin_authentication(&id).await.unwrap();
    let outcome = coordinator
        .complete_authentication(&id, Some(&login.ceremony_id), &signed(&login.options, "cred-1", 1))
        .await
        .unwrap();

    assert!(outcome.verified);
    assert_eq!(outcome.user_id, id);

    let credential = coordinator
        .users()
        .get_user(&id)
        .await
        .unwrap()
        .unwrap()
        .credential
        .unwrap();
    assert_eq!(credential.counter, 1);
    assert!(credential.last_used_at.is_some());
}

#[tokio::test]
async fn test_forged_registration_leaves_user_untouched() {
    let (coordinator, _) = test_coordinator();
    let id = coordinator.create_user("alice", "x").await.unwrap();

    let reg = coordinator.begin_registration(&id).await.unwrap();
    let verified = coordinator
        .complete_registration(&id, Some(&reg.ceremony_id), &forged(&reg.options))
        .await
        .unwrap();
    assert!(!verified);

    let user = coordinator.users().get_user(&id).await.unwrap().unwrap();
    assert!(user.credential.is_none());

    // The challenge is retained, so a correct retry still succeeds
    let verified = coordinator
        .complete_registration(&id, Some(&reg.ceremony_id), &signed(&reg.options, "cred-1", 0))
        .await
        .unwrap();
    assert!(verified);
}

#[tokio::test]
async fn test_malformed_response() {
    let (coordinator, _) = test_coordinator();
    let id = coordinator.create_user("alice", "x").await.unwrap();
    coordinator.begin_registration(&id).await.unwrap();

    assert_error_matches!(
        coordinator
            .complete_registration(&id, None, &serde_json::json!("garbage"))
            .await,
        SessionError::MalformedResponse(_)
    );
}

#[tokio::test]
async fn test_login_without_enrollment_fails() {
    let (coordinator, engine) = test_coordinator();
    let id = coordinator.create_user("alice", "x").await.unwrap();

    assert_error_matches!(
        coordinator.begin_authentication(&id).await,
        SessionError::NoCredentialEnrolled(_)
    );
    assert_error_matches!(
        coordinator
            .complete_authentication(&id, None, &serde_json::json!({}))
            .await,
        SessionError::NoCredentialEnrolled(_)
    );
    assert_eq!(engine.calls(), 0);
}

#[tokio::test]
async fn test_reregistration_overwrites_credential_and_excludes_old() {
    let (coordinator, _) = test_coordinator();
    let id = coordinator.create_user("alice", "x").await.unwrap();

    let first = coordinator.begin_registration(&id).await.unwrap();
    assert!(coordinator
        .complete_registration(&id, None, &signed(&first.options, "cred-1", 0))
        .await
        .unwrap());

    let second = coordinator.begin_registration(&id).await.unwrap();
    assert_eq!(second.options["excludeCredentials"][0], "cred-1");
    assert!(coordinator
        .complete_registration(&id, None, &signed(&second.options, "cred-2", 0))
        .await
        .unwrap());

    let user = coordinator.users().get_user(&id).await.unwrap().unwrap();
    assert_eq!(user.credential.unwrap().credential_id, "cred-2");
}
