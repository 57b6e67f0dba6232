//! Configuration resolution for packrun-jo
//!
//! Backend URL priority: CLI → ENV → TOML.
//! API token priority: ENV → TOML.
//! Tuning values come from the TOML `[orchestrator]` section over compiled defaults.

use crate::services::polling_engine::{BackoffPolicy, PollingSettings};
use packrun_common::config::{OrchestratorToml, TomlConfig, ENV_API_TOKEN, ENV_API_URL};
use packrun_common::{Error, Result};
use std::time::Duration;
use tracing::{info, warn};

/// Default partial-billing threshold (processed units)
pub const DEFAULT_PARTIAL_BILLING_THRESHOLD: u64 = 10;
/// Default analysis time estimate per unit
pub const DEFAULT_SECONDS_PER_UNIT: u64 = 60;

/// Every orchestrator tunable
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorSettings {
    pub polling: PollingSettings,
    /// Processed units at or above which a cancel is billed
    pub partial_billing_threshold: u64,
    /// Analysis time estimate per remaining unit
    pub seconds_per_unit: u64,
    /// Session store write coalescing window
    pub session_debounce: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            polling: PollingSettings::default(),
            partial_billing_threshold: DEFAULT_PARTIAL_BILLING_THRESHOLD,
            seconds_per_unit: DEFAULT_SECONDS_PER_UNIT,
            session_debounce: Duration::from_secs(1),
        }
    }
}

impl OrchestratorSettings {
    /// Apply `[orchestrator]` overrides on top of the defaults
    pub fn from_toml(overrides: &OrchestratorToml) -> Self {
        let defaults = Self::default();
        let polling = &defaults.polling;
        let ms = Duration::from_millis;
        let secs = Duration::from_secs;

        let backoff = BackoffPolicy {
            base: overrides.backoff_base_ms.map(ms).unwrap_or(polling.backoff.base),
            multiplier: overrides
                .backoff_multiplier
                .filter(|m| *m >= 1.0)
                .unwrap_or(polling.backoff.multiplier),
            cap: overrides.backoff_cap_ms.map(ms).unwrap_or(polling.backoff.cap),
        };

        if overrides.backoff_multiplier.is_some_and(|m| m < 1.0) {
            warn!("backoff_multiplier below 1.0 ignored, keeping {}", polling.backoff.multiplier);
        }

        Self {
            polling: PollingSettings {
                fast_interval: overrides
                    .fast_poll_interval_ms
                    .map(ms)
                    .unwrap_or(polling.fast_interval),
                slow_interval: overrides
                    .slow_poll_interval_ms
                    .map(ms)
                    .unwrap_or(polling.slow_interval),
                backoff,
                max_consecutive_failures: overrides
                    .max_consecutive_failures
                    .filter(|n| *n > 0)
                    .unwrap_or(polling.max_consecutive_failures),
                extraction_ceiling: overrides
                    .extraction_timeout_secs
                    .map(secs)
                    .unwrap_or(polling.extraction_ceiling),
                analysis_ceiling: overrides
                    .analysis_timeout_secs
                    .map(secs)
                    .unwrap_or(polling.analysis_ceiling),
                background_ceiling: overrides
                    .background_timeout_secs
                    .map(secs)
                    .unwrap_or(polling.background_ceiling),
                status_timeout: overrides
                    .status_request_timeout_secs
                    .map(secs)
                    .unwrap_or(polling.status_timeout),
            },
            partial_billing_threshold: overrides
                .partial_billing_threshold
                .unwrap_or(defaults.partial_billing_threshold),
            seconds_per_unit: overrides
                .seconds_per_unit
                .unwrap_or(defaults.seconds_per_unit),
            session_debounce: overrides
                .session_debounce_ms
                .map(ms)
                .unwrap_or(defaults.session_debounce),
        }
    }
}

/// Backend connection settings
#[derive(Debug, Clone, PartialEq)]
pub struct ApiSettings {
    pub base_url: String,
    pub token: Option<String>,
    /// Timeout for status, credit-check and cancel requests
    pub request_timeout: Duration,
    /// Timeout for the start-analysis submission
    pub submission_timeout: Duration,
}

impl ApiSettings {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token: None,
            request_timeout: Duration::from_secs(30),
            submission_timeout: Duration::from_secs(20 * 60),
        }
    }

    /// Resolve from CLI, environment and TOML
    pub fn resolve(cli_url: Option<&str>, toml_config: &TomlConfig) -> Result<Self> {
        let base_url = resolve_api_base_url(cli_url, toml_config)?;
        let mut settings = Self::new(base_url);
        settings.token = resolve_api_token(toml_config);

        let overrides = &toml_config.orchestrator;
        if let Some(secs) = overrides.status_request_timeout_secs {
            settings.request_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = overrides.submission_timeout_secs {
            settings.submission_timeout = Duration::from_secs(secs);
        }
        Ok(settings)
    }
}

/// Resolve backend base URL
///
/// **Priority:** CLI → ENV → TOML
pub fn resolve_api_base_url(cli_url: Option<&str>, toml_config: &TomlConfig) -> Result<String> {
    if let Some(url) = cli_url.filter(|u| is_valid_value(u)) {
        info!("Backend URL from command line");
        return Ok(normalize_base_url(url));
    }

    if let Ok(url) = std::env::var(ENV_API_URL) {
        if is_valid_value(&url) {
            info!("Backend URL from {}", ENV_API_URL);
            return Ok(normalize_base_url(&url));
        }
    }

    if let Some(url) = toml_config.api_base_url.as_deref().filter(|u| is_valid_value(u)) {
        info!("Backend URL from TOML config");
        return Ok(normalize_base_url(url));
    }

    Err(Error::Config(format!(
        "Backend URL not configured. Use one of:\n\
         1. Command line: --api-url https://api.example.com\n\
         2. Environment: {}=https://api.example.com\n\
         3. TOML config: api_base_url = \"https://api.example.com\"",
        ENV_API_URL
    )))
}

/// Resolve API bearer token
///
/// **Priority:** ENV → TOML. Absence is allowed (unauthenticated backends).
pub fn resolve_api_token(toml_config: &TomlConfig) -> Option<String> {
    let env_token = std::env::var(ENV_API_TOKEN).ok().filter(|t| is_valid_value(t));
    let toml_token = toml_config.api_token.clone().filter(|t| is_valid_value(t));

    if env_token.is_some() && toml_token.is_some() {
        warn!(
            "API token found in both {} and TOML config. Using environment (highest priority).",
            ENV_API_TOKEN
        );
    }

    match (env_token, toml_token) {
        (Some(token), _) => {
            info!("API token loaded from environment variable");
            Some(token)
        }
        (None, Some(token)) => {
            info!("API token loaded from TOML config");
            Some(token)
        }
        (None, None) => {
            warn!("No API token configured; requests will be sent unauthenticated");
            None
        }
    }
}

/// Non-empty, non-whitespace
pub fn is_valid_value(value: &str) -> bool {
    !value.trim().is_empty()
}

fn normalize_base_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}
