use std::fmt;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// An opaque bearer token. The expiry is read from the `exp` claim of its
/// payload segment; the signature is never checked client side.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    token: String,
    expires_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Deserialize)]
struct Claims {
    exp: i64,
}

fn decode_expiry(token: &str) -> Option<DateTime<Utc>> {
    let mut segments = token.split('.');
    let (_header, payload, _signature) = (segments.next()?, segments.next()?, segments.next()?);
    if segments.next().is_some() {
        return None;
    }
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: Claims = serde_json::from_slice(&bytes).ok()?;
    DateTime::from_timestamp(claims.exp, 0)
}

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        let token = token.into();
        let expires_at = decode_expiry(&token);
        Self { token, expires_at }
    }

    pub fn as_str(&self) -> &str {
        &self.token
    }

    /// `None` when the token carries no readable `exp` claim
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    /// The instant a proactive refresh is due: expiry minus the guard window
    pub fn refresh_at(&self, guard_window: Duration) -> Option<DateTime<Utc>> {
        self.expires_at.map(|exp| exp - guard_window)
    }

    /// True once `now` is inside the guard window. A token whose expiry
    /// cannot be read counts as expired.
    pub fn is_within_guard(&self, guard_window: Duration, now: DateTime<Utc>) -> bool {
        match self.refresh_at(guard_window) {
            Some(refresh_at) => now >= refresh_at,
            None => true,
        }
    }

    /// Time left before the proactive refresh is due, if any
    pub fn time_until_refresh(&self, guard_window: Duration, now: DateTime<Utc>) -> Option<std::time::Duration> {
        let remaining = self.refresh_at(guard_window)? - now;
        remaining.to_std().ok().filter(|d| !d.is_zero())
    }
}

/// What the vault keeps at rest for a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredSession {
    pub credential: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub captured_at: DateTime<Utc>,
}

impl StoredSession {
    pub fn capture(credential: &Credential) -> Self {
        Self {
            credential: credential.as_str().to_string(),
            captured_at: Utc::now(),
        }
    }
}
