//! Runtime configuration for the sync engine and the HTTP remote.
//!
//! Values come from explicit builders or from `DIARY_*` environment
//! variables. Lookups go through a closure so parsing stays testable.

use std::fmt;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::util::{is_http_url, normalize_text_option};

/// Default per-call timeout for remote operations
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Default interval between periodic drain + reconcile passes
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(60);

pub const ENV_API_BASE_URL: &str = "DIARY_API_BASE_URL";
pub const ENV_ACCESS_TOKEN: &str = "DIARY_ACCESS_TOKEN";
pub const ENV_SYNC_TIMEOUT_SECS: &str = "DIARY_SYNC_TIMEOUT_SECS";
pub const ENV_SYNC_INTERVAL_SECS: &str = "DIARY_SYNC_INTERVAL_SECS";

/// Tuning for the sync engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Upper bound for a single remote call
    pub request_timeout: Duration,
    /// Periodic pass interval; `None` means passes only run on reconnect
    pub sync_interval: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            sync_interval: Some(DEFAULT_SYNC_INTERVAL),
        }
    }
}

impl EngineConfig {
    /// Set the per-call timeout
    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the periodic pass interval
    #[must_use]
    pub const fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = Some(interval);
        self
    }

    /// Disable periodic passes (reconnect-triggered only)
    #[must_use]
    pub const fn without_auto_sync(mut self) -> Self {
        self.sync_interval = None;
        self
    }

    /// Read overrides from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read overrides through `lookup`; unset keys keep their defaults.
    ///
    /// A sync interval of `0` disables periodic passes.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(secs) = parse_secs(&lookup, ENV_SYNC_TIMEOUT_SECS)? {
            if secs == 0 {
                return Err(Error::Config(format!(
                    "{ENV_SYNC_TIMEOUT_SECS} must be greater than zero"
                )));
            }
            config.request_timeout = Duration::from_secs(secs);
        }

        if let Some(secs) = parse_secs(&lookup, ENV_SYNC_INTERVAL_SECS)? {
            config.sync_interval = (secs > 0).then(|| Duration::from_secs(secs));
        }

        Ok(config)
    }
}

/// Connection settings for the diary API
#[derive(Clone, PartialEq, Eq)]
pub struct RemoteConfig {
    /// Base URL without a trailing slash
    pub api_base_url: String,
    /// Bearer token issued by the auth provider
    pub access_token: Option<String>,
}

impl fmt::Debug for RemoteConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("RemoteConfig")
            .field("api_base_url", &self.api_base_url)
            .field(
                "access_token",
                &self.access_token.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

impl RemoteConfig {
    pub fn new(api_base_url: impl Into<String>, access_token: Option<String>) -> Result<Self> {
        let api_base_url = normalize_base_url(api_base_url.into())?;
        Ok(Self {
            api_base_url,
            access_token: normalize_text_option(access_token),
        })
    }

    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let base_url = normalize_text_option(lookup(ENV_API_BASE_URL))
            .ok_or_else(|| Error::Config(format!("{ENV_API_BASE_URL} is not set")))?;
        Self::new(base_url, lookup(ENV_ACCESS_TOKEN))
    }
}

fn parse_secs(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<u64>> {
    let Some(raw) = normalize_text_option(lookup(key)) else {
        return Ok(None);
    };
    raw.parse::<u64>()
        .map(Some)
        .map_err(|_| Error::Config(format!("{key} must be a whole number of seconds, got '{raw}'")))
}

fn normalize_base_url(raw: String) -> Result<String> {
    let base = normalize_text_option(Some(raw))
        .ok_or_else(|| Error::Config("API base URL must not be empty".to_string()))?;
    if !is_http_url(&base) {
        return Err(Error::Config(
            "API base URL must include http:// or https://".to_string(),
        ));
    }
    Ok(base.trim_end_matches('/').to_string())
}
