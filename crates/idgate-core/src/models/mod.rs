//! Wire models for the identity service.
//!
//! - `auth`: login, signup, password recovery and 2FA payloads
//! - `user`: profiles, roles and the admin user listing
//! - `credentials`: per-user service credentials managed by admins

pub mod auth;
pub mod credentials;
pub mod user;

pub use auth::{
    LoginRequest, LoginResponse, MessageResponse, PasswordChange, PasswordResetConfirm,
    PasswordResetRequest, SignupRequest, TwoFactorCode, TwoFactorSetup,
};
pub use credentials::{ServiceCredential, ServiceCredentialInput};
pub use user::{NewUser, ProfileUpdate, Role, RoleUpdate, UserProfile, UsersPage};
