mod common;

use std::sync::Arc;

use common::{eventually, session, MockIdentity, PASSWORD};
use idgate_core::api::ApiError;
use idgate_core::models::{LoginRequest, UserProfile};
use idgate_core::vault::{decrypt, EncryptedBlob};
use idgate_core::{CredentialVault, IdentityClient, KeyValueStore, MemoryStore, RefreshState, SessionStatus};
use tokio::task::JoinHandle;

fn login_request(password: &str) -> LoginRequest {
    LoginRequest {
        username: "ada".to_string(),
        password: password.to_string(),
        totp_code: None,
    }
}

struct Harness {
    mock: Arc<MockIdentity>,
    durable: Arc<MemoryStore>,
    ephemeral: Arc<MemoryStore>,
    client: IdentityClient,
}

impl Harness {
    fn new(mock: Arc<MockIdentity>) -> Self {
        let durable = Arc::new(MemoryStore::new());
        let ephemeral = Arc::new(MemoryStore::new());
        let vault = CredentialVault::new("user_session", durable.clone(), ephemeral.clone());
        let client = IdentityClient::new(session(&mock, vault));
        Self {
            mock,
            durable,
            ephemeral,
            client,
        }
    }

    /// A second client over the same durable scope and a fresh ephemeral
    /// one, like a new process picking up where this one left off
    fn restart(&self) -> IdentityClient {
        let vault = CredentialVault::new("user_session", self.durable.clone(), Arc::new(MemoryStore::new()));
        IdentityClient::new(session(&self.mock, vault))
    }
}

#[tokio::test]
async fn test_login_with_remember_persists_durably() {
    let h = Harness::new(MockIdentity::new());

    let profile = h.client.login(&login_request(PASSWORD), true).await.unwrap();
    assert_eq!(profile.username, "ada");
    assert_eq!(h.client.session().status(), SessionStatus::Authenticated);
    assert!(h.client.current_state().remembered);

    assert_eq!(h.durable.keys().unwrap(), vec!["vault.auth_token"]);
    assert!(h.ephemeral.keys().unwrap().is_empty());

    let profile_call = &h.mock.sent_to("/profile")[0];
    assert_eq!(profile_call.bearer, h.mock.current());

    let restarted = h.restart();
    restarted.session().ready().await;
    assert_eq!(restarted.session().status(), SessionStatus::Authenticated);
    assert_eq!(
        restarted.session().credential().map(|c| c.as_str().to_string()),
        h.mock.current()
    );
}

#[tokio::test]
async fn test_login_without_remember_stays_ephemeral() {
    let h = Harness::new(MockIdentity::new());
    h.client.login(&login_request(PASSWORD), false).await.unwrap();

    assert!(h.durable.keys().unwrap().is_empty());
    assert_eq!(h.ephemeral.keys().unwrap(), vec!["vault.auth_token"]);
    assert!(!h.client.current_state().remembered);

    let restarted = h.restart();
    restarted.session().ready().await;
    assert_eq!(restarted.session().status(), SessionStatus::Unauthenticated);
}

#[tokio::test]
async fn test_remembered_login_replaces_ephemeral_copy() {
    let h = Harness::new(MockIdentity::new());
    h.client.login(&login_request(PASSWORD), false).await.unwrap();
    h.client.login(&login_request(PASSWORD), true).await.unwrap();

    assert!(h.ephemeral.keys().unwrap().is_empty());
    assert_eq!(h.durable.keys().unwrap(), vec!["vault.auth_token"]);
}

#[tokio::test]
async fn test_wrong_password_is_a_client_error() {
    let h = Harness::new(MockIdentity::new());

    let err = h.client.login(&login_request("wrong"), true).await.unwrap_err();
    assert_eq!(
        err,
        ApiError::ClientRequest {
            status: 401,
            message: "Invalid credentials".to_string()
        }
    );

    assert_eq!(h.mock.refreshes(), 0);
    assert_eq!(h.client.session().status(), SessionStatus::Unauthenticated);
    assert!(h.durable.keys().unwrap().is_empty());
    assert!(h.mock.sent_to("/login")[0].bearer.is_none());
}

#[tokio::test]
async fn test_logout_is_idempotent() {
    let h = Harness::new(MockIdentity::new());
    h.client.login(&login_request(PASSWORD), true).await.unwrap();

    h.client.logout().await;
    h.client.logout().await;

    assert_eq!(h.mock.sent_to("/logout").len(), 1);
    assert_eq!(h.client.session().status(), SessionStatus::Unauthenticated);
    assert!(h.client.session().credential().is_none());
    assert!(h.durable.keys().unwrap().is_empty());
    assert!(h.ephemeral.keys().unwrap().is_empty());
}

#[tokio::test]
async fn test_logout_during_refresh_discards_its_result() {
    let h = Harness::new(MockIdentity::gated());
    h.client.login(&login_request(PASSWORD), false).await.unwrap();
    h.mock.expire_current();

    let pending = tokio::spawn({
        let client = h.client.clone();
        async move { client.get_profile().await }
    });
    eventually("profile call suspended", || h.client.session().pending_replays() == 1).await;

    h.client.logout().await;
    let err = pending.await.unwrap().unwrap_err();
    assert!(err.is_authentication_failure());

    h.mock.release_refresh();
    eventually("refresh answered", || h.mock.refreshes_completed() == 1).await;
    // Give the discarded refresh a chance to (wrongly) install its credential
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    assert!(h.client.session().credential().is_none());
    assert_eq!(h.client.session().status(), SessionStatus::Unauthenticated);
    assert!(h.ephemeral.keys().unwrap().is_empty());
    assert!(h.durable.keys().unwrap().is_empty());
}

#[tokio::test]
async fn test_public_endpoints_carry_signing_header() {
    let mock = MockIdentity::new();
    let durable = Arc::new(MemoryStore::new());
    let vault = CredentialVault::new("user_session", durable, Arc::new(MemoryStore::new()));
    let client = IdentityClient::new(session(&mock, vault)).with_signing_secret("api-secret");

    client.login(&login_request(PASSWORD), false).await.unwrap();

    let login = &mock.sent_to("/login")[0];
    let signature = EncryptedBlob::from(login.api_key.clone().unwrap());
    let claim: serde_json::Value = decrypt(&signature, "api-secret").unwrap();
    assert_eq!(claim["digest"].as_str().unwrap().len(), 64);

    let profile = &mock.sent_to("/profile")[0];
    assert!(profile.api_key.is_none());
    assert!(profile.bearer.is_some());
}

/// Suspend a profile call behind a gated refresh, then log in again
async fn login_during_refresh(h: &Harness) -> (JoinHandle<Result<UserProfile, ApiError>>, String) {
    h.client.login(&login_request(PASSWORD), false).await.unwrap();
    h.mock.expire_current();

    let pending = tokio::spawn({
        let client = h.client.clone();
        async move { client.get_profile().await }
    });
    eventually("profile call suspended", || h.client.session().pending_replays() == 1).await;
    eventually("refresh sent", || h.mock.refreshes() == 1).await;

    h.client.login(&login_request(PASSWORD), true).await.unwrap();
    let login_token = h.client.session().credential().unwrap().as_str().to_string();
    (pending, login_token)
}

async fn assert_login_survives(h: &Harness, login_token: &str) {
    eventually("refresh answered", || h.mock.refreshes_completed() == 1).await;
    // Give the superseded refresh a chance to (wrongly) settle the session
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let session = h.client.session();
    assert_eq!(session.credential().unwrap().as_str(), login_token);
    assert_eq!(session.status(), SessionStatus::Authenticated);
    assert!(session.current_state().remembered);
    assert_eq!(h.durable.keys().unwrap(), vec!["vault.auth_token"]);
    assert!(h.ephemeral.keys().unwrap().is_empty());

    let restarted = h.restart();
    restarted.session().ready().await;
    assert_eq!(
        restarted.session().credential().map(|c| c.as_str().to_string()).as_deref(),
        Some(login_token)
    );
}

#[tokio::test]
async fn test_login_during_failing_refresh_keeps_new_session() {
    let h = Harness::new(MockIdentity::gated());
    let (pending, login_token) = login_during_refresh(&h).await;

    let err = pending.await.unwrap().unwrap_err();
    assert!(err.is_authentication_failure());
    assert_eq!(h.client.session().refresh_state(), RefreshState::Idle);

    h.mock.fail_refresh();
    h.mock.release_refresh();
    assert_login_survives(&h, &login_token).await;
}

#[tokio::test]
async fn test_login_during_successful_refresh_keeps_new_session() {
    let h = Harness::new(MockIdentity::gated());
    let (pending, login_token) = login_during_refresh(&h).await;

    let err = pending.await.unwrap().unwrap_err();
    assert!(err.is_authentication_failure());

    h.mock.release_refresh();
    assert_login_survives(&h, &login_token).await;
}

#[tokio::test(start_paused = true)]
async fn test_retried_public_call_is_signed_per_attempt() {
    let mock = MockIdentity::new();
    let vault = CredentialVault::new("user_session", Arc::new(MemoryStore::new()), Arc::new(MemoryStore::new()));
    let client = IdentityClient::new(session(&mock, vault)).with_signing_secret("api-secret");
    mock.fail_path("/recover", 1);

    client.reset_password("ada@example.com").await.unwrap();

    let sends = mock.sent_to("/recover");
    assert_eq!(sends.len(), 2);
    let keys: Vec<String> = sends.iter().map(|s| s.api_key.clone().unwrap()).collect();
    assert_ne!(keys[0], keys[1]);
    for key in &keys {
        let claim: serde_json::Value = decrypt(&EncryptedBlob::from(key.clone()), "api-secret").unwrap();
        assert_eq!(claim["digest"].as_str().unwrap().len(), 64);
    }
}
