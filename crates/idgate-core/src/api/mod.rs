//! REST client plumbing for the identity service.
//!
//! This module provides the `IdentityClient` exposing the service's
//! operations, the `Transport` seam requests go through, the
//! exponential backoff used for transient failures, and the typed
//! `ApiError` every operation fails with.
//!
//! Authenticated calls carry the current bearer credential supplied by
//! the `SessionManager`.

pub mod client;
pub mod error;
pub mod request;
pub mod retry;
pub mod transport;

pub use client::IdentityClient;
pub use error::ApiError;
pub use request::{ApiRequest, ApiResponse};
pub use retry::{send_with_backoff, RetryPolicy};
pub use transport::{HttpTransport, Transport};
