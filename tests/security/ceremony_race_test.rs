//! Security tests for superseded and replayed ceremonies

use passkey_server::CeremonyId;

#[path = "../common/mod.rs"]
mod common;

use common::{signed, test_coordinator};

#[tokio::test]
async fn test_second_registration_challenge_invalidates_first() {
    let (coordinator, _) = test_coordinator();
    let id = coordinator.create_user("alice", "x").await.unwrap();

    let first = coordinator.begin_registration(&id).await.unwrap();
    let second = coordinator.begin_registration(&id).await.unwrap();
    assert_ne!(first.ceremony_id, second.ceremony_id);

    // First tab finishes late, with and without its ceremony id
    for ceremony in [Some(&first.ceremony_id), None] {
        let verified = coordinator
            .complete_registration(&id, ceremony, &signed(&first.options, "cred-1", 0))
            .await
            .unwrap();
        assert!(!verified);
    }

    let user = coordinator.users().get_user(&id).await.unwrap().unwrap();
    assert!(user.credential.is_none());

    assert!(coordinator
        .complete_registration(&id, Some(&second.ceremony_id), &signed(&second.options, "cred-1", 0))
        .await
        .unwrap());
}

#[tokio::test]
async fn test_login_challenge_invalidates_pending_registration() {
    let (coordinator, _) = test_coordinator();
    let id = coordinator.create_user("alice", "x").await.unwrap();

    let reg = coordinator.begin_registration(&id).await.unwrap();
    coordinator
        .complete_registration(&id, None, &signed(&reg.options, "cred-1", 0))
        .await
        .unwrap();

    let pending = coordinator.begin_registration(&id).await.unwrap();
    let login = coordinator.begin_authentication(&id).await.unwrap();

    // The outstanding challenge is now a login; the registration is stale
    assert!(!coordinator
        .complete_registration(&id, Some(&pending.ceremony_id), &signed(&pending.options, "cred-2", 0))
        .await
        .unwrap());

    let outcome = coordinator
        .complete_authentication(&id, Some(&login.ceremony_id), &signed(&login.options, "cred-1", 1))
        .await
        .unwrap();
    assert!(outcome.verified);

    let user = coordinator.users().get_user(&id).await.unwrap().unwrap();
    assert_eq!(user.credential.unwrap().credential_id, "cred-1");
}

#[tokio::test]
async fn test_unknown_ceremony_id_rejected_before_engine() {
    let (coordinator, engine) = test_coordinator();
    let id = coordinator.create_user("alice", "x").await.unwrap();

    let reg = coordinator.begin_registration(&id).await.unwrap();
    let calls = engine.calls();

    let verified = coordinator
        .complete_registration(&id, Some(&CeremonyId::new()), &signed(&reg.options, "cred-1", 0))
        .await
        .unwrap();

    assert!(!verified);
    assert_eq!(engine.calls(), calls);
}

#[tokio::test]
async fn test_replayed_assertion_rejected_by_counter() {
    let (coordinator, _) = test_coordinator();
    let id = coordinator.create_user("alice", "x").await.unwrap();

    let reg = coordinator.begin_registration(&id).await.unwrap();
    coordinator
        .complete_registration(&id, None, &signed(&reg.options, "cred-1", 0))
        .await
        .unwrap();

    let login = coordinator.begin_authentication(&id).await.unwrap();
    let assertion = signed(&login.options, "cred-1", 5);

    let first = coordinator
        .complete_authentication(&id, Some(&login.ceremony_id), &assertion)
        .await
        .unwrap();
    assert!(first.verified);

    // Challenge is still readable, the stored counter stops the replay
    let replay = coordinator
        .complete_authentication(&id, Some(&login.ceremony_id), &assertion)
        .await
        .unwrap();
    assert!(!replay.verified);
}

#[tokio::test]
async fn test_concurrent_registrations_have_one_winner() {
    let (coordinator, _) = test_coordinator();
    let id = coordinator.create_user("alice", "x").await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let coordinator = coordinator.clone();
        let id = id.clone();
        handles.push(tokio::spawn(async move {
            coordinator.begin_registration(&id).await.unwrap()
        }));
    }

    let mut issued = Vec::new();
    for handle in handles {
        issued.push(handle.await.unwrap());
    }

    let mut winners = 0;
    for ceremony in &issued {
        if coordinator
            .complete_registration(&id, Some(&ceremony.ceremony_id), &signed(&ceremony.options, "cred-1", 0))
            .await
            .unwrap()
        {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn test_concurrent_replay_of_one_assertion_has_one_winner() {
    let (coordinator, _) = test_coordinator();
    let id = coordinator.create_user("alice", "x").await.unwrap();

    let reg = coordinator.begin_registration(&id).await.unwrap();
    coordinator
        .complete_registration(&id, None, &signed(&reg.options, "cred-1", 0))
        .await
        .unwrap();

    let login = coordinator.begin_authentication(&id).await.unwrap();
    let assertion = signed(&login.options, "cred-1", 9);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let coordinator = coordinator.clone();
        let id = id.clone();
        let ceremony_id = login.ceremony_id;
        let assertion = assertion.clone();
        handles.push(tokio::spawn(async move {
            coordinator
                .complete_authentication(&id, Some(&ceremony_id), &assertion)
                .await
                .unwrap()
                .verified
        }));
    }

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);

    let user = coordinator.users().get_user(&id).await.unwrap().unwrap();
    assert_eq!(user.credential.unwrap().counter, 9);
}
