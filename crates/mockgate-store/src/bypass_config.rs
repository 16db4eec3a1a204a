//! Bypass forwarding configuration.
//!
//! The API key is held as an [`ApiKey`] and only leaves this module in the
//! persisted file. The REST view reports whether a key is configured.

use std::path::PathBuf;
use std::sync::LazyLock;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use mockgate_core::security::ApiKey;
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::error::StoreError;
use crate::persist::write_json_atomic;

static HOST_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[\w.\-]+$").unwrap());

#[derive(Clone, Debug)]
pub struct BypassConfig {
    pub enabled: bool,
    pub target_host: String,
    pub target_port: u16,
    pub target_uri: String,
    pub api_key: Option<ApiKey>,
    pub use_https: bool,
    pub timeout_secs: u64,
    pub updated_at: DateTime<Utc>,
}

impl Default for BypassConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            target_host: "api.openai.com".into(),
            target_port: 443,
            target_uri: "/v1/chat/completions".into(),
            api_key: None,
            use_https: false,
            timeout_secs: 60,
            updated_at: DateTime::<Utc>::UNIX_EPOCH,
        }
    }
}

impl BypassConfig {
    pub fn view(&self) -> BypassConfigView {
        BypassConfigView {
            enabled: self.enabled,
            target_host: self.target_host.clone(),
            target_port: self.target_port,
            target_uri: self.target_uri.clone(),
            use_https: self.use_https,
            timeout: self.timeout_secs,
            api_key_configured: self.api_key.is_some(),
        }
    }
}

/// What the REST API returns. Never carries the key itself.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BypassConfigView {
    pub enabled: bool,
    pub target_host: String,
    pub target_port: u16,
    pub target_uri: String,
    pub use_https: bool,
    pub timeout: u64,
    pub api_key_configured: bool,
}

/// Partial update. Numeric fields are wide so out-of-range values reach
/// validation instead of failing deserialization.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct BypassConfigUpdate {
    pub target_host: Option<String>,
    pub target_port: Option<i64>,
    pub target_uri: Option<String>,
    /// An empty string clears the stored key.
    pub api_key: Option<String>,
    pub use_https: Option<bool>,
    pub timeout: Option<i64>,
}

#[derive(Serialize, Deserialize)]
struct PersistedConfig {
    enabled: bool,
    target_host: String,
    target_port: u16,
    target_uri: String,
    api_key: Option<String>,
    use_https: bool,
    timeout: u64,
    updated_at: DateTime<Utc>,
}

impl From<&BypassConfig> for PersistedConfig {
    fn from(c: &BypassConfig) -> Self {
        Self {
            enabled: c.enabled,
            target_host: c.target_host.clone(),
            target_port: c.target_port,
            target_uri: c.target_uri.clone(),
            api_key: c.api_key.as_ref().map(|k| k.expose().to_string()),
            use_https: c.use_https,
            timeout: c.timeout_secs,
            updated_at: c.updated_at,
        }
    }
}

impl From<PersistedConfig> for BypassConfig {
    fn from(p: PersistedConfig) -> Self {
        Self {
            enabled: p.enabled,
            target_host: p.target_host,
            target_port: p.target_port,
            target_uri: p.target_uri,
            api_key: p.api_key.filter(|k| !k.is_empty()).map(ApiKey::new),
            use_https: p.use_https,
            timeout_secs: p.timeout,
            updated_at: p.updated_at,
        }
    }
}

pub struct BypassConfigStore {
    config: RwLock<BypassConfig>,
    path: Option<PathBuf>,
}

impl BypassConfigStore {
    pub fn in_memory() -> Self {
        Self {
            config: RwLock::new(BypassConfig::default()),
            path: None,
        }
    }

    /// Load from `path` (defaults when missing or unreadable) and persist
    /// every change back to it.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let config = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<PersistedConfig>(&raw) {
                Ok(p) => {
                    info!(path = %path.display(), "loaded bypass config");
                    p.into()
                }
                Err(e) => {
                    error!(path = %path.display(), error = %e, "corrupt bypass config, using defaults");
                    BypassConfig::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "no bypass config file, using defaults");
                BypassConfig::default()
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "failed to read bypass config");
                BypassConfig::default()
            }
        };
        Self {
            config: RwLock::new(config),
            path: Some(path),
        }
    }

    pub fn get(&self) -> BypassConfig {
        self.config.read().clone()
    }

    pub fn is_enabled(&self) -> bool {
        self.config.read().enabled
    }

    /// Apply a partial update. Nothing changes if the result is invalid.
    pub fn update(&self, update: BypassConfigUpdate) -> Result<BypassConfig, StoreError> {
        let mut guard = self.config.write();
        let mut next = guard.clone();

        if let Some(host) = update.target_host {
            next.target_host = host;
        }
        if let Some(port) = update.target_port {
            next.target_port = u16::try_from(port)
                .ok()
                .filter(|p| *p >= 1)
                .ok_or_else(|| {
                    StoreError::InvalidConfig(format!("target_port must be 1-65535, got {port}"))
                })?;
        }
        if let Some(uri) = update.target_uri {
            next.target_uri = uri;
        }
        if let Some(key) = update.api_key {
            next.api_key = (!key.is_empty()).then(|| ApiKey::new(key));
        }
        if let Some(https) = update.use_https {
            next.use_https = https;
        }
        if let Some(timeout) = update.timeout {
            next.timeout_secs = u64::try_from(timeout).map_err(|_| {
                StoreError::InvalidConfig(format!("timeout must be 1-300 seconds, got {timeout}"))
            })?;
        }

        validate(&next)?;
        next.updated_at = next_timestamp(guard.updated_at);
        *guard = next;
        self.persist(&guard);
        info!(
            host = %guard.target_host,
            port = guard.target_port,
            https = guard.use_https,
            "bypass config updated"
        );
        Ok(guard.clone())
    }

    /// Turn forwarding on. Requires a target host and port.
    pub fn enable(&self) -> Result<(), StoreError> {
        let mut guard = self.config.write();
        if guard.target_host.is_empty() {
            return Err(StoreError::InvalidConfig("target_host is required".into()));
        }
        if guard.target_port == 0 {
            return Err(StoreError::InvalidConfig("target_port is required".into()));
        }
        guard.enabled = true;
        guard.updated_at = next_timestamp(guard.updated_at);
        self.persist(&guard);
        info!(host = %guard.target_host, port = guard.target_port, "bypass enabled");
        Ok(())
    }

    pub fn disable(&self) {
        let mut guard = self.config.write();
        guard.enabled = false;
        guard.updated_at = next_timestamp(guard.updated_at);
        self.persist(&guard);
        info!("bypass disabled");
    }

    fn persist(&self, config: &BypassConfig) {
        let Some(path) = &self.path else {
            return;
        };
        let result = serde_json::to_value(PersistedConfig::from(config))
            .map_err(StoreError::from)
            .and_then(|value| write_json_atomic(path, &value));
        if let Err(e) = result {
            error!(path = %path.display(), error = %e, "failed to persist bypass config");
        }
    }
}

pub fn validate(config: &BypassConfig) -> Result<(), StoreError> {
    if config.target_host.is_empty() {
        return Err(StoreError::InvalidConfig("target_host cannot be empty".into()));
    }
    if !HOST_RE.is_match(&config.target_host) {
        return Err(StoreError::InvalidConfig(format!(
            "Invalid target_host format: {}",
            config.target_host
        )));
    }
    if config.target_port == 0 {
        return Err(StoreError::InvalidConfig(
            "target_port must be 1-65535, got 0".into(),
        ));
    }
    if !config.target_uri.starts_with('/') {
        return Err(StoreError::InvalidConfig(
            "target_uri must start with '/'".into(),
        ));
    }
    if !(1..=300).contains(&config.timeout_secs) {
        return Err(StoreError::InvalidConfig(format!(
            "timeout must be 1-300 seconds, got {}",
            config.timeout_secs
        )));
    }
    Ok(())
}

// Strictly increasing even when two updates land in the same clock tick.
fn next_timestamp(prev: DateTime<Utc>) -> DateTime<Utc> {
    let now = Utc::now();
    if now > prev {
        now
    } else {
        prev + ChronoDuration::microseconds(1)
    }
}
