//! Typed operations of the identity service.
//!
//! Every call goes through the `SessionManager`, which injects the bearer
//! credential and handles 401s. Login, signup and password recovery are
//! public: they carry no bearer and may carry a signed `X-API-Key` header.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::auth::{CredentialState, SessionManager};
use crate::config::Config;
use crate::models::{
    LoginRequest, LoginResponse, MessageResponse, NewUser, PasswordChange, PasswordResetConfirm,
    PasswordResetRequest, ProfileUpdate, Role, RoleUpdate, ServiceCredential,
    ServiceCredentialInput, SignupRequest, TwoFactorCode, TwoFactorSetup, UserProfile, UsersPage,
};
use crate::vault::{CredentialVault, KeyValueStore};

use super::{ApiError, ApiRequest, ApiResponse, HttpTransport};

/// Client for the identity service.
/// Clone is cheap; clones share the same session.
#[derive(Clone)]
pub struct IdentityClient {
    session: SessionManager,
    signing_secret: Option<Arc<str>>,
}

impl IdentityClient {
    pub fn new(session: SessionManager) -> Self {
        Self {
            session,
            signing_secret: None,
        }
    }

    /// Sign public requests with a value derived from `secret`
    pub fn with_signing_secret(mut self, secret: impl Into<String>) -> Self {
        self.signing_secret = Some(Arc::from(secret.into()));
        self
    }

    /// Wire up the HTTP transport, vault and session manager described by `config`.
    pub fn from_config(
        config: &Config,
        durable: Arc<dyn KeyValueStore>,
        ephemeral: Arc<dyn KeyValueStore>,
    ) -> Result<Self, ApiError> {
        let transport = HttpTransport::new(config.base_url.clone(), config.request_timeout())?;
        let vault = CredentialVault::new(config.vault_passphrase.clone(), durable, ephemeral);
        let session = SessionManager::new(Arc::new(transport), vault, config.session_settings());

        let client = Self::new(session);
        Ok(match config.api_key {
            Some(ref key) => client.with_signing_secret(key.clone()),
            None => client,
        })
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    pub fn current_state(&self) -> CredentialState {
        self.session.current_state()
    }

    /// A public request, signed when a secret is configured
    fn public_request(&self, request: ApiRequest) -> ApiRequest {
        let request = request.public();
        match self.signing_secret {
            Some(ref secret) => request.signed_with(Arc::clone(secret)),
            None => request,
        }
    }

    async fn fetch<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T, ApiError> {
        self.session.execute(request).await?.json()
    }

    /// Execute and accept any 2xx, ignoring the body
    async fn submit(&self, request: ApiRequest) -> Result<(), ApiError> {
        self.session.execute(request).await.map(|_: ApiResponse| ())
    }

    // ========================================================================
    // Authentication
    // ========================================================================

    /// Log in and install the returned credential, in the durable scope when
    /// `remember` is set. Returns the freshly fetched profile.
    pub async fn login(&self, credentials: &LoginRequest, remember: bool) -> Result<UserProfile, ApiError> {
        self.session.ready().await;

        let request = self.public_request(ApiRequest::post("/login").json(credentials)?);
        let response: LoginResponse = self.fetch(request).await?;
        info!(username = %credentials.username, remember, "Logged in");

        self.session.install(response.token, remember).await;
        self.get_profile().await
    }

    pub async fn signup(&self, details: &SignupRequest) -> Result<MessageResponse, ApiError> {
        let request = self.public_request(ApiRequest::post("/signup").json(details)?);
        let response = self.session.execute(request).await?;
        Ok(parse_message(&response))
    }

    /// Tell the service the session is over (best effort) and drop it locally.
    /// Calling it again once logged out does nothing but the local cleanup.
    pub async fn logout(&self) {
        if self.session.credential().is_some() {
            if let Err(e) = self.submit(ApiRequest::post("/logout")).await {
                warn!(error = %e, "Logout request failed, clearing session anyway");
            }
        } else {
            debug!("Logout without a credential, clearing local state only");
        }
        self.session.clear().await;
        info!("Logged out");
    }

    // ========================================================================
    // Profile
    // ========================================================================

    pub async fn get_profile(&self) -> Result<UserProfile, ApiError> {
        self.fetch(ApiRequest::get("/profile")).await
    }

    pub async fn update_profile(&self, update: &ProfileUpdate) -> Result<UserProfile, ApiError> {
        self.fetch(ApiRequest::post("/profile").json(update)?).await
    }

    pub async fn change_password(&self, change: &PasswordChange) -> Result<(), ApiError> {
        self.submit(ApiRequest::post("/profile/password").json(change)?).await
    }

    // ========================================================================
    // Two-factor authentication
    // ========================================================================

    pub async fn setup_2fa(&self) -> Result<TwoFactorSetup, ApiError> {
        self.fetch(ApiRequest::post("/2fa/enable")).await
    }

    pub async fn verify_2fa(&self, code: &str) -> Result<(), ApiError> {
        let body = TwoFactorCode { token: code.to_string() };
        self.submit(ApiRequest::post("/2fa/verify").json(&body)?).await
    }

    pub async fn disable_2fa(&self, code: &str) -> Result<(), ApiError> {
        let body = TwoFactorCode { token: code.to_string() };
        self.submit(ApiRequest::post("/2fa/disable").json(&body)?).await
    }

    // ========================================================================
    // Password recovery
    // ========================================================================

    pub async fn reset_password(&self, email: &str) -> Result<MessageResponse, ApiError> {
        let body = PasswordResetRequest { email: email.to_string() };
        let request = self.public_request(ApiRequest::post("/recover").json(&body)?);
        let response = self.session.execute(request).await?;
        Ok(parse_message(&response))
    }

    pub async fn confirm_password_reset(&self, confirm: &PasswordResetConfirm) -> Result<MessageResponse, ApiError> {
        let request = self.public_request(ApiRequest::post("/recover/confirm").json(confirm)?);
        let response = self.session.execute(request).await?;
        Ok(parse_message(&response))
    }

    // ========================================================================
    // User administration
    // ========================================================================

    pub async fn list_users(&self, page: u32, limit: u32) -> Result<UsersPage, ApiError> {
        self.fetch(ApiRequest::get(format!("/users?page={}&limit={}", page, limit))).await
    }

    pub async fn create_user(&self, user: &NewUser) -> Result<UserProfile, ApiError> {
        self.fetch(ApiRequest::post("/users").json(user)?).await
    }

    pub async fn delete_user(&self, user_id: i64) -> Result<(), ApiError> {
        self.submit(ApiRequest::delete(format!("/users/{}", user_id))).await
    }

    pub async fn update_user_role(&self, user_id: i64, role: Role) -> Result<(), ApiError> {
        let body = RoleUpdate { role };
        self.submit(ApiRequest::post(format!("/users/{}/role", user_id)).json(&body)?).await
    }

    pub async fn toggle_user_enabled(&self, user_id: i64, enabled: bool) -> Result<(), ApiError> {
        let body = serde_json::json!({ "enabled": enabled });
        self.submit(ApiRequest::post(format!("/users/{}/enabled", user_id)).json(&body)?).await
    }

    // ========================================================================
    // Service credentials
    // ========================================================================

    pub async fn service_credentials(&self, user_id: i64) -> Result<Vec<ServiceCredential>, ApiError> {
        self.fetch(ApiRequest::get(format!("/users/{}/credentials", user_id))).await
    }

    pub async fn add_service_credential(
        &self,
        user_id: i64,
        input: &ServiceCredentialInput,
    ) -> Result<ServiceCredential, ApiError> {
        self.fetch(ApiRequest::post(format!("/users/{}/credentials", user_id)).json(input)?).await
    }

    pub async fn update_service_credential(
        &self,
        user_id: i64,
        input: &ServiceCredentialInput,
    ) -> Result<ServiceCredential, ApiError> {
        self.fetch(ApiRequest::put(format!("/users/{}/credentials", user_id)).json(input)?).await
    }

    pub async fn delete_service_credential(&self, user_id: i64, credential_id: i64) -> Result<(), ApiError> {
        self.submit(ApiRequest::delete(format!("/users/{}/credentials/{}", user_id, credential_id)))
            .await
    }
}

/// Acknowledgement bodies are optional; an empty or non-JSON body is no message.
fn parse_message(response: &ApiResponse) -> MessageResponse {
    response.json().unwrap_or_default()
}
