//! In-memory identity service for driving the session layer in tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::Utc;
use parking_lot::Mutex;
use reqwest::StatusCode;
use tokio::sync::Semaphore;
use tokio::time::Instant;

use idgate_core::api::{ApiError, ApiRequest, ApiResponse, Transport};
use idgate_core::{CredentialVault, SessionManager, SessionSettings};

pub const PASSWORD: &str = "correct horse";

/// One request as the service saw it
#[derive(Debug, Clone)]
pub struct Sent {
    pub method: String,
    pub path: String,
    pub bearer: Option<String>,
    pub api_key: Option<String>,
    pub at: Instant,
}

pub struct MockIdentity {
    /// The only token protected endpoints accept
    current: Mutex<Option<String>>,
    /// Every token ever handed out; refresh accepts any of them
    issued: Mutex<HashSet<String>>,
    serial: AtomicU32,
    lifetime: Mutex<chrono::Duration>,
    sent: Mutex<Vec<Sent>>,
    refreshes: AtomicU32,
    refreshes_completed: AtomicU32,
    refresh_gate: Option<Semaphore>,
    fail_refresh: AtomicBool,
    /// Remaining 503 responses per path
    server_errors: Mutex<HashMap<String, u32>>,
}

impl MockIdentity {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::build(None))
    }

    /// Refresh requests block until [`MockIdentity::release_refresh`]
    pub fn gated() -> Arc<Self> {
        Arc::new(Self::build(Some(Semaphore::new(0))))
    }

    fn build(refresh_gate: Option<Semaphore>) -> Self {
        Self {
            current: Mutex::new(None),
            issued: Mutex::new(HashSet::new()),
            serial: AtomicU32::new(0),
            lifetime: Mutex::new(chrono::Duration::hours(1)),
            sent: Mutex::new(Vec::new()),
            refreshes: AtomicU32::new(0),
            refreshes_completed: AtomicU32::new(0),
            refresh_gate,
            fail_refresh: AtomicBool::new(false),
            server_errors: Mutex::new(HashMap::new()),
        }
    }

    /// Lifetime of tokens issued from now on
    pub fn set_lifetime(&self, lifetime: chrono::Duration) {
        *self.lifetime.lock() = lifetime;
    }

    /// Issue a token and make it the accepted one
    pub fn issue(&self) -> String {
        let lifetime = *self.lifetime.lock();
        self.issue_with_lifetime(lifetime)
    }

    pub fn issue_with_lifetime(&self, lifetime: chrono::Duration) -> String {
        let n = self.serial.fetch_add(1, Ordering::SeqCst);
        let exp = (Utc::now() + lifetime).timestamp();
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"sub":"ada","exp":{},"n":{}}}"#, exp, n));
        let token = format!("{}.{}.sig{}", header, payload, n);

        self.issued.lock().insert(token.clone());
        *self.current.lock() = Some(token.clone());
        token
    }

    /// Revoke the accepted token so protected calls start getting 401
    pub fn expire_current(&self) {
        *self.current.lock() = None;
    }

    pub fn current(&self) -> Option<String> {
        self.current.lock().clone()
    }

    pub fn release_refresh(&self) {
        if let Some(ref gate) = self.refresh_gate {
            gate.add_permits(1);
        }
    }

    pub fn fail_refresh(&self) {
        self.fail_refresh.store(true, Ordering::SeqCst);
    }

    /// Answer the next `count` requests to `path` with 503
    pub fn fail_path(&self, path: &str, count: u32) {
        self.server_errors.lock().insert(path.to_string(), count);
    }

    pub fn refreshes(&self) -> u32 {
        self.refreshes.load(Ordering::SeqCst)
    }

    pub fn refreshes_completed(&self) -> u32 {
        self.refreshes_completed.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().clone()
    }

    pub fn sent_to(&self, path: &str) -> Vec<Sent> {
        self.sent.lock().iter().filter(|s| s.path == path).cloned().collect()
    }

    fn take_server_error(&self, path: &str) -> bool {
        let mut errors = self.server_errors.lock();
        match errors.get_mut(path) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }

    async fn refresh(&self, bearer: Option<&str>) -> ApiResponse {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        if let Some(ref gate) = self.refresh_gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }

        let known = bearer.map(|b| self.issued.lock().contains(b)).unwrap_or(false);
        let response = if self.fail_refresh.load(Ordering::SeqCst) || !known {
            ApiResponse::new(StatusCode::UNAUTHORIZED, r#"{"message":"refresh rejected"}"#)
        } else {
            let token = self.issue();
            ApiResponse::new(StatusCode::OK, format!(r#"{{"token":"{}"}}"#, token))
        };
        self.refreshes_completed.fetch_add(1, Ordering::SeqCst);
        response
    }

    fn login(&self, request: &ApiRequest) -> ApiResponse {
        let password = request
            .body
            .as_ref()
            .and_then(|b| b.get("password"))
            .and_then(|p| p.as_str());
        if password != Some(PASSWORD) {
            return ApiResponse::new(StatusCode::UNAUTHORIZED, r#"{"message":"Invalid credentials"}"#);
        }
        let token = self.issue();
        ApiResponse::new(StatusCode::OK, format!(r#"{{"token":"{}"}}"#, token))
    }

    fn protected(&self, request: &ApiRequest, bearer: Option<&str>) -> ApiResponse {
        let accepted = match (bearer, self.current.lock().as_deref()) {
            (Some(sent), Some(current)) => sent == current,
            _ => false,
        };
        if !accepted || request.path == "/always-unauthorized" {
            return ApiResponse::new(StatusCode::UNAUTHORIZED, r#"{"message":"Unauthorized"}"#);
        }

        match request.path.as_str() {
            "/profile" => ApiResponse::new(
                StatusCode::OK,
                r#"{"id":1,"username":"ada","email":"ada@example.com","role":"USER"}"#,
            ),
            path if path.starts_with("/missing") => {
                ApiResponse::new(StatusCode::NOT_FOUND, r#"{"message":"Not found"}"#)
            }
            path => ApiResponse::new(StatusCode::OK, format!(r#"{{"path":"{}"}}"#, path)),
        }
    }
}

#[async_trait]
impl Transport for MockIdentity {
    async fn send(&self, request: &ApiRequest, bearer: Option<&str>) -> Result<ApiResponse, ApiError> {
        let api_key = request
            .headers
            .get("x-api-key")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        self.sent.lock().push(Sent {
            method: request.method.to_string(),
            path: request.path.clone(),
            bearer: bearer.map(str::to_string),
            api_key,
            at: Instant::now(),
        });

        if self.take_server_error(&request.path) {
            return Ok(ApiResponse::new(StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable"));
        }

        Ok(match request.path.as_str() {
            "/login" => self.login(request),
            "/signup" | "/recover" | "/recover/confirm" => ApiResponse::new(StatusCode::OK, r#"{"message":"ok"}"#),
            "/logout" => ApiResponse::new(StatusCode::NO_CONTENT, ""),
            "/auth/refresh" => self.refresh(bearer).await,
            _ => self.protected(request, bearer),
        })
    }
}

pub fn session(mock: &Arc<MockIdentity>, vault: CredentialVault) -> SessionManager {
    SessionManager::new(mock.clone(), vault, SessionSettings::default())
}

/// Poll `condition` until it holds, failing the test after a while
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {}", what);
}
