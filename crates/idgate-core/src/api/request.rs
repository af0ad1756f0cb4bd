//! Transport-neutral description of an outbound call and its response.

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode};
use serde::{de::DeserializeOwned, Serialize};

use crate::vault::derive_api_signing_value;

use super::ApiError;

/// Header carrying the single-use signing value on public endpoints
pub const API_KEY_HEADER: &str = "x-api-key";

/// Secret the `X-API-Key` value is derived from
#[derive(Clone)]
struct SigningSecret(Arc<str>);

impl fmt::Debug for SigningSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SigningSecret(<redacted>)")
    }
}

/// Everything needed to (re)submit a call: method, path relative to the
/// service base URL, optional JSON body and extra headers.
///
/// The bearer credential is not part of the request; it is attached at
/// send time so a replay picks up whatever credential is current.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub body: Option<serde_json::Value>,
    pub headers: HeaderMap,
    authenticated: bool,
    retried: bool,
    signing: Option<SigningSecret>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
            headers: HeaderMap::new(),
            authenticated: true,
            retried: false,
            signing: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    /// Attach a JSON body
    pub fn json<B: Serialize + ?Sized>(mut self, body: &B) -> Result<Self, ApiError> {
        let value = serde_json::to_value(body).map_err(|e| ApiError::InvalidRequest(e.to_string()))?;
        self.body = Some(value);
        Ok(self)
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Send without a bearer credential. A 401 on a public call is the
    /// server's answer, not a cue to refresh.
    pub fn public(mut self) -> Self {
        self.authenticated = false;
        self
    }

    /// Carry an `X-API-Key` derived from `secret`. A fresh value is derived
    /// for every send, retries included.
    pub fn signed_with(mut self, secret: Arc<str>) -> Self {
        self.signing = Some(SigningSecret(secret));
        self
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Whether this call already went through a 401-triggered refresh
    pub fn was_retried(&self) -> bool {
        self.retried
    }

    pub(crate) fn mark_retried(&mut self) {
        self.retried = true;
    }

    /// The request as it goes on the wire for one attempt
    pub(crate) fn prepare(&self) -> Result<Cow<'_, ApiRequest>, ApiError> {
        let Some(SigningSecret(ref secret)) = self.signing else {
            return Ok(Cow::Borrowed(self));
        };

        let method = self.method.to_string();
        let signature = derive_api_signing_value(secret, &[method.as_str(), self.path.as_str()])
            .map_err(|e| ApiError::InvalidRequest(format!("Failed to sign request: {}", e)))?;
        let value =
            HeaderValue::from_str(signature.as_str()).map_err(|e| ApiError::InvalidRequest(e.to_string()))?;

        let mut prepared = self.clone();
        prepared.headers.insert(HeaderName::from_static(API_KEY_HEADER), value);
        Ok(Cow::Owned(prepared))
    }
}

#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub body: String,
}

impl ApiResponse {
    pub fn new(status: StatusCode, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// Ok for 2xx, the classified error otherwise
    pub fn into_result(self) -> Result<Self, ApiError> {
        if self.status.is_success() {
            Ok(self)
        } else {
            Err(ApiError::from_status(self.status, &self.body))
        }
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ApiError> {
        serde_json::from_str(&self.body)
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to parse JSON response: {}", e)))
    }
}
