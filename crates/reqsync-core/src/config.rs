//! Application configuration management.
//!
//! This module handles loading and saving the configuration: backend
//! location, the requisitions collection path, and the timing knobs of the
//! sync cache.
//!
//! Configuration is stored at `~/.config/reqsync/config.json`. Session
//! credentials are never written to disk; they come from the environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Application name used for config directory paths
const APP_NAME: &str = "reqsync";

/// Config file name
const CONFIG_FILE: &str = "config.json";

pub const DEFAULT_BASE_URL: &str = "http://localhost:8000";
pub const DEFAULT_COLLECTION_PATH: &str = "/api/requisitions/";

/// HTTP request timeout in seconds.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

pub const ENV_BASE_URL: &str = "REQSYNC_BASE_URL";
pub const ENV_SESSION_ID: &str = "REQSYNC_SESSION_ID";
pub const ENV_CSRF_TOKEN: &str = "REQSYNC_CSRF_TOKEN";

/// Timing knobs of the sync cache, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncTimings {
    /// Quiet period that coalesces bursts of refresh requests
    pub debounce_ms: u64,
    /// Minimum gap between unforced fetches
    pub min_refresh_interval_ms: u64,
    /// Wait after a mutating call before signalling invalidation
    pub settle_delay_ms: u64,
    /// Minimum gap between invalidation signals applied by a stable view
    pub stable_throttle_ms: u64,
}

impl Default for SyncTimings {
    fn default() -> Self {
        Self {
            debounce_ms: 300,
            min_refresh_interval_ms: 2000,
            settle_delay_ms: 500,
            stable_throttle_ms: 1000,
        }
    }
}

impl SyncTimings {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn min_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.min_refresh_interval_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn stable_throttle(&self) -> Duration {
        Duration::from_millis(self.stable_throttle_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub base_url: String,
    pub collection_path: String,
    pub request_timeout_secs: u64,
    pub sync: SyncTimings,
    /// HTTP methods whose calls against the collection invalidate the cache
    pub watched_methods: Vec<String>,
    /// Whether a failed mutating call still schedules an invalidation
    pub invalidate_on_failure: bool,
    /// Optional log file, in addition to stderr
    pub log_file: Option<PathBuf>,

    #[serde(skip)]
    pub session_id: Option<String>,
    #[serde(skip)]
    pub csrf_token: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            collection_path: DEFAULT_COLLECTION_PATH.to_string(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            sync: SyncTimings::default(),
            watched_methods: vec!["PATCH".to_string(), "PUT".to_string(), "DELETE".to_string()],
            invalidate_on_failure: true,
            log_file: None,
            session_id: None,
            csrf_token: None,
        }
    }
}

impl Config {
    /// Load from the default location, falling back to defaults when no
    /// file exists, then apply environment overrides.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        let mut config = if path.exists() {
            Self::load_from_path(&path)?
        } else {
            Self::default()
        };
        config.apply_env();
        Ok(config)
    }

    /// Load from an explicit path, which must exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
        }
        let mut config = Self::load_from_path(path)?;
        config.apply_env();
        Ok(config)
    }

    fn load_from_path(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from a key lookup (the process environment in
    /// production). Empty values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = get(ENV_BASE_URL) {
            self.base_url = url;
        }
        if let Some(session_id) = get(ENV_SESSION_ID) {
            self.session_id = Some(session_id);
        }
        if let Some(token) = get(ENV_CSRF_TOKEN) {
            self.csrf_token = Some(token);
        }
    }

    /// Parsed `watched_methods`. Unparseable entries are skipped.
    pub fn watched_methods(&self) -> Vec<Method> {
        self.watched_methods
            .iter()
            .filter_map(|m| match Method::from_bytes(m.trim().to_ascii_uppercase().as_bytes()) {
                Ok(method) => Some(method),
                Err(_) => {
                    warn!(method = %m, "Ignoring invalid HTTP method in watched_methods");
                    None
                }
            })
            .collect()
    }
}
