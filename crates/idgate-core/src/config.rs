//! Application configuration management.
//!
//! This module handles loading and saving the client configuration: the
//! identity service URL, request timeout, refresh guard window, retry
//! policy and the vault passphrase.
//!
//! Configuration is stored at `~/.config/idgate/config.json`. A few fields
//! can be overridden from the environment (see [`Config::apply_env`]).

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::api::RetryPolicy;
use crate::auth::session::{SessionSettings, DEFAULT_GUARD_WINDOW_SECS, DEFAULT_STORAGE_KEY};

/// Application name used for config/data directory paths
const APP_NAME: &str = "idgate";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Identity service used when nothing else is configured
const DEFAULT_BASE_URL: &str = "http://localhost:8080/api";

/// Request timeout in seconds; a call that takes longer fails like a server error
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;

/// Application-level vault passphrase. Not a user secret.
const DEFAULT_VAULT_PASSPHRASE: &str = "user_session";

pub const ENV_BASE_URL: &str = "IDGATE_API_BASE_URL";
pub const ENV_API_KEY: &str = "IDGATE_API_KEY";
pub const ENV_VAULT_PASSPHRASE: &str = "IDGATE_VAULT_PASSPHRASE";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub base_url: String,
    pub request_timeout_secs: u64,
    pub refresh_guard_secs: i64,
    pub vault_passphrase: String,
    pub storage_key: String,
    pub retry: RetryPolicy,
    /// Secret for the signed `X-API-Key` header on public endpoints
    pub api_key: Option<String>,
    pub last_username: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            refresh_guard_secs: DEFAULT_GUARD_WINDOW_SECS,
            vault_passphrase: DEFAULT_VAULT_PASSPHRASE.to_string(),
            storage_key: DEFAULT_STORAGE_KEY.to_string(),
            retry: RetryPolicy::default(),
            api_key: None,
            last_username: None,
        }
    }
}

impl Config {
    /// Load the config file (defaults if absent) and apply environment overrides
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            serde_json::from_str(&contents)?
        } else {
            Self::default()
        };
        config.apply_env(|name| std::env::var(name).ok());
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Override fields from variables found by `lookup`
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(ENV_BASE_URL).filter(|v| !v.is_empty()) {
            self.base_url = url;
        }
        if let Some(key) = lookup(ENV_API_KEY).filter(|v| !v.is_empty()) {
            self.api_key = Some(key);
        }
        if let Some(passphrase) = lookup(ENV_VAULT_PASSPHRASE).filter(|v| !v.is_empty()) {
            self.vault_passphrase = passphrase;
        }
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Directory holding the durable storage scope
    pub fn data_dir(&self) -> Result<PathBuf> {
        let data_dir = dirs::data_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?;
        Ok(data_dir.join(APP_NAME))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            guard_window: chrono::Duration::seconds(self.refresh_guard_secs),
            retry: self.retry,
            storage_key: self.storage_key.clone(),
        }
    }
}
