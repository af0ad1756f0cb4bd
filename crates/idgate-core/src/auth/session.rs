//! Session manager for the identity service's bearer credential.
//!
//! The manager owns the current `Credential` and everything hanging off it:
//! the encrypted copy in the vault, the proactive refresh timer, and the
//! refresh state machine. A 401 on an authenticated call suspends the call
//! on a FIFO replay queue and starts a refresh unless one is already in
//! flight. When the refresh settles the queue is drained in order, either
//! resubmitting every call with the new credential or rejecting them all.
//!
//! All state lives behind one mutex that is never held across an await, so
//! "check idle, mark refreshing" is a single step and two 401s can never
//! both start a refresh. The proactive timer goes through the same step.
//! Status changes are published inside the same locked step as the state
//! change they describe. A refresh counts as settled only once its outcome
//! is in the vault.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, watch, Mutex as AsyncMutex, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::{send_with_backoff, ApiError, ApiRequest, ApiResponse, RetryPolicy, Transport};
use crate::vault::{CredentialVault, Scope};

use super::credential::{Credential, StoredSession};

/// Endpoint that trades the current credential for a new one
const REFRESH_PATH: &str = "/auth/refresh";

/// Refresh this long before the credential expires (5 minutes)
pub const DEFAULT_GUARD_WINDOW_SECS: i64 = 300;

/// Vault key the session is stored under
pub const DEFAULT_STORAGE_KEY: &str = "auth_token";

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub guard_window: Duration,
    pub retry: RetryPolicy,
    pub storage_key: String,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            guard_window: Duration::seconds(DEFAULT_GUARD_WINDOW_SECS),
            retry: RetryPolicy::default(),
            storage_key: DEFAULT_STORAGE_KEY.to_string(),
        }
    }
}

/// Externally visible session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Uninitialized,
    Unauthenticated,
    Authenticated,
    Refreshing,
}

/// Snapshot returned by [`SessionManager::current_state`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CredentialState {
    pub status: SessionStatus,
    pub expires_at: Option<DateTime<Utc>>,
    pub remembered: bool,
}

impl CredentialState {
    pub fn is_authenticated(&self) -> bool {
        matches!(self.status, SessionStatus::Authenticated | SessionStatus::Refreshing)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RefreshState {
    #[default]
    Idle,
    /// `flight` identifies the refresh so a cancelled one can't settle the state later
    Refreshing { flight: u64 },
}

/// Last refresh flight whose outcome has been persisted
#[derive(Debug, Clone, Copy, Default)]
struct Settlement {
    flight: u64,
    ok: bool,
}

/// A call waiting on the in-flight refresh
struct QueuedCall {
    request: ApiRequest,
    responder: oneshot::Sender<Result<ApiResponse, ApiError>>,
}

/// Pending proactive refresh. Dropping it cancels the timer, so replacing
/// or clearing `SessionState::timer` supersedes the old one.
struct RefreshTimer(JoinHandle<()>);

impl Drop for RefreshTimer {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// What a replaced or ended session leaves behind: the refresh it had in
/// flight and the calls suspended on it.
#[derive(Default)]
struct Superseded {
    flight: Option<u64>,
    waiters: VecDeque<QueuedCall>,
}

#[derive(Default)]
struct SessionState {
    credential: Option<Credential>,
    remember: bool,
    refresh: RefreshState,
    last_flight: u64,
    queue: VecDeque<QueuedCall>,
    timer: Option<RefreshTimer>,
}

impl SessionState {
    fn is_flight(&self, flight: u64) -> bool {
        self.refresh == RefreshState::Refreshing { flight }
    }

    /// Detach the in-flight refresh, if any. Its outcome will be discarded.
    fn supersede(&mut self) -> Superseded {
        let flight = match self.refresh {
            RefreshState::Refreshing { flight } => Some(flight),
            RefreshState::Idle => None,
        };
        self.refresh = RefreshState::Idle;
        Superseded {
            flight,
            waiters: std::mem::take(&mut self.queue),
        }
    }

    /// Forget the credential and everything tied to it.
    fn reset(&mut self) -> Superseded {
        self.credential = None;
        self.remember = false;
        self.timer = None;
        self.supersede()
    }
}

/// How a call that got a 401 proceeds
enum Admission {
    /// The credential changed since the call was sent; resubmit right away
    Replay(ApiRequest, Credential),
    /// Suspended until the refresh settles
    Queued(oneshot::Receiver<Result<ApiResponse, ApiError>>),
    /// No credential to refresh
    Rejected,
}

#[derive(Deserialize)]
struct RefreshResponse {
    token: String,
}

/// Owns the current credential and coordinates its refresh.
/// Clone is cheap; clones share the same session.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

struct Inner {
    transport: Arc<dyn Transport>,
    vault: CredentialVault,
    settings: SessionSettings,
    state: Mutex<SessionState>,
    status: watch::Sender<SessionStatus>,
    settled: watch::Sender<Settlement>,
    /// Serializes vault writes so the last write always reflects the latest state
    persist_lock: AsyncMutex<()>,
    init: OnceCell<()>,
}

impl SessionManager {
    pub fn new(transport: Arc<dyn Transport>, vault: CredentialVault, settings: SessionSettings) -> Self {
        let (status, _) = watch::channel(SessionStatus::Uninitialized);
        let (settled, _) = watch::channel(Settlement::default());
        Self {
            inner: Arc::new(Inner {
                transport,
                vault,
                settings,
                state: Mutex::new(SessionState::default()),
                status,
                settled,
                persist_lock: AsyncMutex::new(()),
                init: OnceCell::new(),
            }),
        }
    }

    /// Load the persisted session on first call; later calls wait for that
    /// first load to finish. Requests do not wait for this on their own.
    pub async fn ready(&self) {
        let inner = &self.inner;
        inner.init.get_or_init(|| inner.initialize()).await;
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.inner.status.subscribe()
    }

    pub fn status(&self) -> SessionStatus {
        *self.inner.status.borrow()
    }

    pub fn current_state(&self) -> CredentialState {
        let state = self.inner.state.lock();
        CredentialState {
            status: *self.inner.status.borrow(),
            expires_at: state.credential.as_ref().and_then(Credential::expires_at),
            remembered: state.remember && state.credential.is_some(),
        }
    }

    pub fn credential(&self) -> Option<Credential> {
        self.inner.state.lock().credential.clone()
    }

    pub fn refresh_state(&self) -> RefreshState {
        self.inner.state.lock().refresh
    }

    /// Number of calls suspended behind the in-flight refresh
    pub fn pending_replays(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// Make `token` the current credential, persist it to the durable scope
    /// when `remember` is set (ephemeral otherwise) and schedule its refresh.
    ///
    /// A refresh still in flight for the previous session is discarded and
    /// the calls suspended on it are rejected; they belong to that session.
    pub async fn install(&self, token: impl Into<String>, remember: bool) {
        let credential = Credential::new(token);
        info!(remember, expires_at = ?credential.expires_at(), "Installing credential");

        let superseded = {
            let mut state = self.inner.state.lock();
            state.credential = Some(credential);
            state.remember = remember;
            let superseded = state.supersede();
            self.inner.schedule_refresh(&mut state);
            self.inner.status.send_replace(SessionStatus::Authenticated);
            superseded
        };
        if let Some(flight) = superseded.flight {
            info!(flight, rejected = superseded.waiters.len(), "Discarding refresh of the replaced session");
        }

        self.inner.sync_vault().await;
        self.inner.settle(superseded, true, "session replaced by a new credential");
    }

    /// Refresh now, or join the refresh already in flight, and wait until
    /// its outcome is persisted.
    pub async fn refresh_now(&self) -> Result<(), ApiError> {
        self.inner.refresh_and_wait().await
    }

    /// Drop the session locally: clear the vault, cancel the timer, reset the
    /// refresh state and reject anything still waiting on a refresh.
    /// Safe to call any number of times.
    pub async fn clear(&self) {
        self.inner.teardown("session ended").await;
    }

    /// Send `request`, attaching the current credential when the request is
    /// authenticated. Transient failures are retried with backoff; a 401
    /// suspends the call behind a single shared refresh and resubmits it
    /// once with the new credential.
    pub async fn execute(&self, mut request: ApiRequest) -> Result<ApiResponse, ApiError> {
        let inner = &self.inner;

        if !request.is_authenticated() {
            return inner.dispatch(&request, None).await?.into_result();
        }

        let credential = inner.current_credential();
        let response = inner.dispatch(&request, credential.as_ref()).await?;
        if response.status != StatusCode::UNAUTHORIZED {
            return response.into_result();
        }

        if request.was_retried() {
            return Err(inner.reject_permanently(&request).await);
        }
        request.mark_retried();

        debug!(path = %request.path, "Request got 401, waiting on credential refresh");
        match inner.admit(request, credential.as_ref()) {
            Admission::Replay(request, current) => inner.resubmit(&request, &current).await,
            Admission::Queued(receiver) => receiver.await.unwrap_or_else(|_| {
                Err(ApiError::AuthenticationFailure("credential refresh was abandoned".to_string()))
            }),
            Admission::Rejected => {
                inner.teardown("not authenticated").await;
                Err(ApiError::AuthenticationFailure("not authenticated".to_string()))
            }
        }
    }
}

impl Inner {
    fn current_credential(&self) -> Option<Credential> {
        self.state.lock().credential.clone()
    }

    async fn initialize(self: &Arc<Self>) {
        if self.current_credential().is_some() {
            return;
        }

        let vault = self.vault.clone();
        let key = self.settings.storage_key.clone();
        let loaded = match tokio::task::spawn_blocking(move || load_persisted(&vault, &key)).await {
            Ok(loaded) => loaded,
            Err(e) => {
                warn!(error = %e, "Vault load task failed");
                None
            }
        };

        let Some((stored, remember)) = loaded else {
            debug!("No persisted session");
            let _state = self.state.lock();
            self.status.send_if_modified(|status| {
                let changed = *status == SessionStatus::Uninitialized;
                if changed {
                    *status = SessionStatus::Unauthenticated;
                }
                changed
            });
            return;
        };

        let credential = Credential::new(stored.credential);
        let needs_refresh = credential.is_within_guard(self.settings.guard_window, Utc::now());
        {
            let mut state = self.state.lock();
            if state.credential.is_some() {
                debug!("Credential installed while loading, ignoring persisted session");
                return;
            }
            state.credential = Some(credential);
            state.remember = remember;
            if !needs_refresh {
                self.schedule_refresh(&mut state);
                self.status.send_replace(SessionStatus::Authenticated);
            }
        }

        if needs_refresh {
            info!(remember, "Persisted credential is inside the guard window, refreshing");
            if let Err(e) = self.refresh_and_wait().await {
                warn!(error = %e, "Could not refresh persisted credential");
            }
        } else {
            info!(remember, "Restored persisted session");
        }
    }

    /// Arm the proactive refresh for the current credential, cancelling any
    /// previous timer. Credentials already inside the guard window get none.
    fn schedule_refresh(self: &Arc<Self>, state: &mut SessionState) {
        let delay = state
            .credential
            .as_ref()
            .and_then(|c| c.time_until_refresh(self.settings.guard_window, Utc::now()));

        state.timer = delay.map(|delay| {
            debug!(delay_secs = delay.as_secs(), "Scheduling proactive refresh");
            let weak = Arc::downgrade(self);
            RefreshTimer(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Some(inner) = weak.upgrade() {
                    info!("Proactive refresh due");
                    inner.start_refresh();
                }
            }))
        });
    }

    fn start_refresh(self: &Arc<Self>) -> u64 {
        let mut state = self.state.lock();
        self.start_refresh_locked(&mut state)
    }

    /// The only way into `Refreshing`. Check and set happen under the same
    /// lock as the enqueue that precedes them. Returns the flight to wait on.
    fn start_refresh_locked(self: &Arc<Self>, state: &mut SessionState) -> u64 {
        if let RefreshState::Refreshing { flight } = state.refresh {
            return flight;
        }

        state.last_flight += 1;
        let flight = state.last_flight;
        state.refresh = RefreshState::Refreshing { flight };
        self.status.send_replace(SessionStatus::Refreshing);

        let stale = state.credential.clone();
        let inner = Arc::clone(self);
        debug!(flight, "Starting credential refresh");
        tokio::spawn(async move { inner.run_refresh(flight, stale).await });
        flight
    }

    fn admit(self: &Arc<Self>, request: ApiRequest, sent_with: Option<&Credential>) -> Admission {
        let mut state = self.state.lock();

        if state.refresh == RefreshState::Idle {
            match &state.credential {
                None => return Admission::Rejected,
                Some(current) if Some(current) != sent_with => {
                    return Admission::Replay(request, current.clone());
                }
                Some(_) => {}
            }
        }

        let (responder, receiver) = oneshot::channel();
        state.queue.push_back(QueuedCall { request, responder });
        debug!(queued = state.queue.len(), "Suspended request until refresh completes");
        self.start_refresh_locked(&mut state);
        Admission::Queued(receiver)
    }

    async fn refresh_and_wait(self: &Arc<Self>) -> Result<(), ApiError> {
        let mut settled = self.settled.subscribe();
        let flight = self.start_refresh();
        let outcome = settled.wait_for(|s| s.flight >= flight).await.map(|s| s.ok);

        match outcome {
            Ok(true) => Ok(()),
            _ => Err(ApiError::AuthenticationFailure("credential refresh failed".to_string())),
        }
    }

    fn publish_settlement(&self, flight: u64, ok: bool) {
        self.settled.send_if_modified(|last| {
            let newer = flight > last.flight;
            if newer {
                *last = Settlement { flight, ok };
            }
            newer
        });
    }

    /// Report a superseded flight as settled and reject its suspended calls.
    /// Runs after the vault reflects the state that superseded it.
    fn settle(&self, superseded: Superseded, ok: bool, reason: &str) {
        if let Some(flight) = superseded.flight {
            self.publish_settlement(flight, ok);
        }
        for call in superseded.waiters {
            let _ = call
                .responder
                .send(Err(ApiError::AuthenticationFailure(reason.to_string())));
        }
    }

    async fn run_refresh(self: Arc<Self>, flight: u64, stale: Option<Credential>) {
        let outcome = match stale {
            Some(ref credential) => self.request_refresh(credential).await,
            None => Err(ApiError::AuthenticationFailure("no credential to refresh".to_string())),
        };

        match outcome {
            Ok(fresh) => self.complete_refresh(flight, fresh).await,
            Err(e) => self.fail_refresh(flight, e).await,
        }
    }

    /// Install and persist the refreshed credential, then leave `Refreshing`
    /// and drain the queue. Calls that 401 meanwhile still join this flight.
    async fn complete_refresh(self: &Arc<Self>, flight: u64, fresh: Credential) {
        {
            let mut state = self.state.lock();
            if !state.is_flight(flight) {
                debug!(flight, "Discarding result of cancelled refresh");
                return;
            }
            state.credential = Some(fresh.clone());
        }
        self.sync_vault().await;

        let waiters = {
            let mut state = self.state.lock();
            if !state.is_flight(flight) {
                debug!(flight, "Refresh cancelled while persisting, discarding");
                return;
            }
            state.refresh = RefreshState::Idle;
            self.schedule_refresh(&mut state);
            self.status.send_replace(SessionStatus::Authenticated);
            std::mem::take(&mut state.queue)
        };

        self.publish_settlement(flight, true);
        info!(flight, replays = waiters.len(), "Credential refreshed");
        self.replay(waiters, fresh).await;
    }

    async fn fail_refresh(&self, flight: u64, error: ApiError) {
        let superseded = {
            let mut state = self.state.lock();
            if !state.is_flight(flight) {
                debug!(flight, "Discarding result of cancelled refresh");
                return;
            }
            let superseded = state.reset();
            self.status.send_replace(SessionStatus::Unauthenticated);
            superseded
        };

        warn!(flight, error = %error, rejected = superseded.waiters.len(), "Credential refresh failed, ending session");
        self.finish_teardown(superseded, "credential refresh failed").await;
    }

    async fn request_refresh(&self, credential: &Credential) -> Result<Credential, ApiError> {
        let request = ApiRequest::post(REFRESH_PATH);
        let response = self
            .dispatch(&request, Some(credential))
            .await
            .and_then(ApiResponse::into_result)
            .map_err(|e| ApiError::AuthenticationFailure(format!("credential refresh failed: {}", e)))?;

        let body: RefreshResponse = response.json()?;
        Ok(Credential::new(body.token))
    }

    /// Resubmit every suspended call with `credential`. Calls are dispatched
    /// in the order they were suspended.
    async fn replay(&self, waiters: VecDeque<QueuedCall>, credential: Credential) {
        let credential = &credential;
        let resubmissions = waiters.into_iter().map(|call| async move {
            let outcome = self.resubmit(&call.request, credential).await;
            if call.responder.send(outcome).is_err() {
                debug!(path = %call.request.path, "Caller of replayed request went away");
            }
        });
        join_all(resubmissions).await;
    }

    async fn resubmit(&self, request: &ApiRequest, credential: &Credential) -> Result<ApiResponse, ApiError> {
        let response = self.dispatch(request, Some(credential)).await?;
        if response.status == StatusCode::UNAUTHORIZED {
            return Err(self.reject_permanently(request).await);
        }
        response.into_result()
    }

    /// A second 401 for the same call: the service rejects even a fresh
    /// credential, so the session ends instead of looping on refreshes.
    async fn reject_permanently(&self, request: &ApiRequest) -> ApiError {
        warn!(path = %request.path, "Credential rejected after refresh");
        self.teardown("credential rejected after refresh").await;
        ApiError::AuthenticationFailure("credential rejected after refresh".to_string())
    }

    /// Each attempt is prepared afresh so per-attempt headers are never reused.
    async fn dispatch(&self, request: &ApiRequest, credential: Option<&Credential>) -> Result<ApiResponse, ApiError> {
        let transport = &self.transport;
        let bearer = credential.map(Credential::as_str);
        send_with_backoff(&self.settings.retry, &request.path, move || async move {
            let prepared = request.prepare()?;
            transport.send(&prepared, bearer).await
        })
        .await
    }

    async fn teardown(&self, reason: &str) {
        let superseded = {
            let mut state = self.state.lock();
            let superseded = state.reset();
            self.status.send_replace(SessionStatus::Unauthenticated);
            superseded
        };
        if !superseded.waiters.is_empty() {
            info!(rejected = superseded.waiters.len(), reason, "Rejecting requests suspended behind a cancelled refresh");
        }
        self.finish_teardown(superseded, reason).await;
    }

    async fn finish_teardown(&self, superseded: Superseded, reason: &str) {
        self.sync_vault().await;
        self.settle(superseded, false, reason);
    }

    /// Make the vault mirror the in-memory session: store the current
    /// credential in its scope, or wipe both scopes when there is none.
    async fn sync_vault(&self) {
        let _guard = self.persist_lock.lock().await;
        let snapshot = {
            let state = self.state.lock();
            state.credential.clone().map(|c| (c, state.remember))
        };

        let vault = self.vault.clone();
        let key = self.settings.storage_key.clone();
        let written = tokio::task::spawn_blocking(move || match snapshot {
            Some((credential, remember)) => persist(&vault, &key, &credential, remember),
            None => {
                vault.clear(Scope::Durable);
                vault.clear(Scope::Ephemeral);
                true
            }
        })
        .await;

        match written {
            Ok(true) => {}
            Ok(false) => warn!("Credential could not be persisted, keeping it in memory only"),
            Err(e) => warn!(error = %e, "Vault task failed"),
        }
    }
}

/// Ephemeral scope first: it holds the most recent non-remembered session.
fn load_persisted(vault: &CredentialVault, key: &str) -> Option<(StoredSession, bool)> {
    if let Some(stored) = vault.retrieve_securely::<StoredSession>(Scope::Ephemeral, key) {
        return Some((stored, false));
    }
    vault
        .retrieve_securely::<StoredSession>(Scope::Durable, key)
        .map(|stored| (stored, true))
}

fn persist(vault: &CredentialVault, key: &str, credential: &Credential, remember: bool) -> bool {
    let (target, other) = if remember {
        (Scope::Durable, Scope::Ephemeral)
    } else {
        (Scope::Ephemeral, Scope::Durable)
    };
    vault.remove(other, key);
    vault.store_securely(target, key, &StoredSession::capture(credential))
}
