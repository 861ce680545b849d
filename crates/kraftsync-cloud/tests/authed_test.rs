//! Authenticated cloud calls against the fake cloud.

use std::sync::Arc;

use kraftsync_cloud::{AuthedCloud, CloudApi, TokenManager, TokenState};
use kraftsync_core::{CommandAck, Error, RetryPolicy};
use kraftsync_testing::{FakeCloud, MemoryCredentialStore};

fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        initial_delay_ms: 1,
        backoff_multiplier: 1.0,
        max_delay_ms: 1,
    }
}

#[tokio::test]
async fn test_rejected_token_is_refreshed_once() {
    let fake = Arc::new(FakeCloud::new());
    let cloud = fake.authed().await;
    fake.revoke_tokens();

    let page = cloud.fetch_commands(None).await.unwrap();
    assert!(page.commands.is_empty());
    assert_eq!(fake.refresh_calls(), 1);
    assert_eq!(fake.auth_rejections(), 1);

    // the fresh token keeps working
    cloud.fetch_commands(page.cursor.as_deref()).await.unwrap();
    assert_eq!(fake.refresh_calls(), 1);
    assert_eq!(cloud.tokens().refresh_count(), 1);
    assert_eq!(cloud.tokens().state().await, TokenState::Valid);
}

#[tokio::test]
async fn test_second_rejection_needs_reauth() {
    let fake = Arc::new(FakeCloud::new());
    let cloud = fake.authed().await;
    fake.fail_next("fetch_commands", Error::Auth("401".into()));
    fake.fail_next("fetch_commands", Error::Auth("401".into()));

    let err = cloud.fetch_commands(None).await.unwrap_err();
    assert!(matches!(err, Error::Auth(_)));
    assert_eq!(fake.refresh_calls(), 1);
    assert!(cloud.tokens().needs_reauth());
    assert_eq!(cloud.tokens().state().await, TokenState::NeedsReauth);

    // no further calls until a new grant is installed
    let err = cloud.ack_command(&CommandAck::acknowledged("c1")).await.unwrap_err();
    assert!(matches!(err, Error::NeedsReauth(_)));
    assert_eq!(fake.refresh_calls(), 1);

    cloud.tokens().install(FakeCloud::initial_credential()).await.unwrap();
    cloud.ack_command(&CommandAck::acknowledged("c1")).await.unwrap();
    assert_eq!(fake.acks().len(), 1);
}

#[tokio::test]
async fn test_rejected_refresh_surfaces_needs_reauth() {
    let fake = Arc::new(FakeCloud::new());
    let cloud = fake.authed().await;
    fake.revoke_tokens();
    fake.reject_refresh(true);

    let err = cloud.fetch_commands(None).await.unwrap_err();
    assert!(err.is_auth());
    assert!(cloud.tokens().needs_reauth());
}

#[tokio::test]
async fn test_transient_failures_are_retried_within_budget() {
    let fake = Arc::new(FakeCloud::new());
    let tokens = fake.token_manager().await;
    let cloud = AuthedCloud::new(fake.clone(), tokens, fast_retry(2));

    fake.fail_next("fetch_commands", Error::NetworkTransient("503".into()));
    fake.fail_next("fetch_commands", Error::NetworkTransient("timeout".into()));
    cloud.fetch_commands(None).await.unwrap();
    assert_eq!(fake.polls().len(), 1);

    for _ in 0..3 {
        fake.fail_next("fetch_commands", Error::NetworkTransient("503".into()));
    }
    let err = cloud.fetch_commands(None).await.unwrap_err();
    assert!(err.is_transient());
    assert_eq!(fake.polls().len(), 1);
}

#[tokio::test]
async fn test_non_transient_errors_are_not_retried() {
    let fake = Arc::new(FakeCloud::new());
    let tokens = fake.token_manager().await;
    let cloud = AuthedCloud::new(fake.clone(), tokens, fast_retry(3));

    fake.fail_next(
        "ack_command",
        Error::Rejected {
            status: 400,
            message: "bad".into(),
        },
    );
    let err = cloud.ack_command(&CommandAck::acknowledged("c1")).await.unwrap_err();
    assert!(matches!(err, Error::Rejected { status: 400, .. }));
    // the next call is not eaten by a hidden retry
    cloud.ack_command(&CommandAck::acknowledged("c1")).await.unwrap();
    assert_eq!(fake.acks().len(), 1);
}

#[tokio::test]
async fn test_refreshed_credential_is_persisted() {
    let fake = Arc::new(FakeCloud::new());
    let store = Arc::new(MemoryCredentialStore::with_credential(
        "test-site",
        FakeCloud::initial_credential(),
    ));
    let tokens = TokenManager::new("test-site", fake.clone(), chrono::Duration::seconds(60))
        .with_store(store.clone());
    assert!(tokens.load_from_store().await.unwrap());
    let cloud = AuthedCloud::new(fake.clone(), Arc::new(tokens), RetryPolicy::none());

    fake.revoke_tokens();
    cloud.fetch_commands(None).await.unwrap();

    let saved = store.get("test-site").unwrap();
    assert_eq!(saved.access_token, "token-1");
    assert_eq!(store.saves(), 1);
}
