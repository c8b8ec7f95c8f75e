//! Configuration types.
//!
//! Everything is read from `CALLFLOW_*` environment variables. A missing
//! variable falls back to the default; a present but malformed one is an error.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{FixedOffset, Offset, Utc};
use secrecy::SecretString;

use crate::error::ConfigError;
use crate::session::model::ContactTimezone;

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Maximum number of sessions `in_progress` at once.
    pub max_concurrent_calls: usize,
    /// How often the dispatch ticker runs a pass.
    pub dispatch_interval: Duration,
    /// How long a worker waits for an answer before treating the question as unanswered.
    pub answer_timeout: Duration,
    /// Re-prompts allowed per question within one attempt.
    pub max_reprompts: u32,
    /// The orchestrator's own timezone, used when the contact's is ignored or unknown.
    pub local_offset: FixedOffset,
    /// Sessions whose next window opens within this horizon get rescheduled to it.
    pub window_horizon: Duration,
    /// Maximum due sessions considered per dispatch pass.
    pub dispatch_batch: usize,
    /// Retry backoff.
    pub backoff: BackoffConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_calls: 10,
            dispatch_interval: Duration::from_secs(15),
            answer_timeout: Duration::from_secs(60),
            max_reprompts: 2,
            local_offset: Utc.fix(),
            window_horizon: Duration::from_secs(72 * 3600), // 3 days
            dispatch_batch: 100,
            backoff: BackoffConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let max_concurrent_calls =
            parse_env("CALLFLOW_MAX_CONCURRENT_CALLS")?.unwrap_or(defaults.max_concurrent_calls);
        if max_concurrent_calls == 0 {
            return Err(invalid("CALLFLOW_MAX_CONCURRENT_CALLS", "must be at least 1"));
        }

        let local_offset = match env_var("CALLFLOW_LOCAL_UTC_OFFSET") {
            Some(raw) => raw
                .parse::<ContactTimezone>()
                .map(|tz| tz.offset())
                .map_err(|e| invalid("CALLFLOW_LOCAL_UTC_OFFSET", e))?,
            None => defaults.local_offset,
        };

        Ok(Self {
            max_concurrent_calls,
            dispatch_interval: secs_env("CALLFLOW_DISPATCH_INTERVAL_SECS")?
                .unwrap_or(defaults.dispatch_interval),
            answer_timeout: secs_env("CALLFLOW_ANSWER_TIMEOUT_SECS")?
                .unwrap_or(defaults.answer_timeout),
            max_reprompts: parse_env("CALLFLOW_MAX_REPROMPTS")?.unwrap_or(defaults.max_reprompts),
            local_offset,
            window_horizon: parse_env::<u64>("CALLFLOW_WINDOW_HORIZON_HOURS")?
                .map(|h| Duration::from_secs(h * 3600))
                .unwrap_or(defaults.window_horizon),
            dispatch_batch: parse_env("CALLFLOW_DISPATCH_BATCH")?.unwrap_or(defaults.dispatch_batch),
            backoff: BackoffConfig::from_env()?,
        })
    }
}

/// Retry backoff configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    /// Delay after the first failed attempt.
    pub initial: Duration,
    /// Upper bound on any single delay.
    pub max: Duration,
    /// Growth factor between consecutive failures.
    pub multiplier: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(300), // 5 minutes
            max: Duration::from_secs(3600),    // 1 hour
            multiplier: 2,
        }
    }
}

impl BackoffConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            initial: secs_env("CALLFLOW_BACKOFF_INITIAL_SECS")?.unwrap_or(defaults.initial),
            max: secs_env("CALLFLOW_BACKOFF_MAX_SECS")?.unwrap_or(defaults.max),
            multiplier: defaults.multiplier,
        };
        if config.max < config.initial {
            return Err(invalid(
                "CALLFLOW_BACKOFF_MAX_SECS",
                "must not be smaller than CALLFLOW_BACKOFF_INITIAL_SECS",
            ));
        }
        Ok(config)
    }
}

/// Control API configuration.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Port the control API listens on.
    pub port: u16,
    /// Bearer credential issued by the identity provider. Unset disables auth.
    pub bearer_token: Option<SecretString>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            bearer_token: None,
        }
    }
}

impl ApiConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            port: parse_env("CALLFLOW_API_PORT")?.unwrap_or(8080),
            bearer_token: env_var("CALLFLOW_API_TOKEN").map(SecretString::from),
        })
    }
}

/// Base URLs of external transport gateways, one per channel kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GatewayConfig {
    pub voice_url: Option<String>,
    pub whatsapp_url: Option<String>,
    pub sms_url: Option<String>,
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        Self {
            voice_url: env_var("CALLFLOW_VOICE_GATEWAY_URL"),
            whatsapp_url: env_var("CALLFLOW_WHATSAPP_GATEWAY_URL"),
            sms_url: env_var("CALLFLOW_SMS_GATEWAY_URL"),
        }
    }
}

/// Everything the daemon needs at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub orchestrator: OrchestratorConfig,
    pub api: ApiConfig,
    pub gateways: GatewayConfig,
    /// libSQL database file.
    pub db_path: PathBuf,
    /// Attach the scripted adapter to every channel kind.
    pub simulate: bool,
    /// Directory for daily-rolling log files, in addition to stderr.
    pub log_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            orchestrator: OrchestratorConfig::default(),
            api: ApiConfig::default(),
            gateways: GatewayConfig::default(),
            db_path: PathBuf::from("./data/callflow.db"),
            simulate: false,
            log_dir: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            orchestrator: OrchestratorConfig::from_env()?,
            api: ApiConfig::from_env()?,
            gateways: GatewayConfig::from_env(),
            db_path: env_var("CALLFLOW_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data/callflow.db")),
            simulate: bool_env("CALLFLOW_SIMULATE")?.unwrap_or(false),
            log_dir: env_var("CALLFLOW_LOG_DIR").map(PathBuf::from),
        })
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn invalid(key: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.into(),
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse()
        .map_err(|e: T::Err| invalid(key, format!("'{raw}': {e}")))
}

fn parse_env<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    env_var(key).map(|raw| parse_value(key, &raw)).transpose()
}

fn secs_env(key: &str) -> Result<Option<Duration>, ConfigError> {
    Ok(parse_env::<u64>(key)?.map(Duration::from_secs))
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(key, format!("'{raw}' is not a boolean"))),
    }
}

fn bool_env(key: &str) -> Result<Option<bool>, ConfigError> {
    env_var(key).map(|raw| parse_bool(key, &raw)).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.orchestrator.max_concurrent_calls, 10);
        assert_eq!(config.orchestrator.answer_timeout, Duration::from_secs(60));
        assert_eq!(config.orchestrator.local_offset.local_minus_utc(), 0);
        assert_eq!(config.orchestrator.backoff.initial, Duration::from_secs(300));
        assert_eq!(config.api.port, 8080);
        assert!(config.api.bearer_token.is_none());
        assert_eq!(config.db_path, PathBuf::from("./data/callflow.db"));
    }

    #[test]
    fn malformed_values_are_rejected() {
        let err = parse_value::<u16>("CALLFLOW_API_PORT", "eighty").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key, .. } if key == "CALLFLOW_API_PORT"));
        assert_eq!(parse_value::<u32>("K", "3").unwrap(), 3);
    }

    #[test]
    fn booleans() {
        assert!(parse_bool("K", "1").unwrap());
        assert!(parse_bool("K", "TRUE").unwrap());
        assert!(!parse_bool("K", "off").unwrap());
        assert!(parse_bool("K", "maybe").is_err());
    }
}
