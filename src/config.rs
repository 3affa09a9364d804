// Process configuration, read from the environment (and an optional .env file)
use crate::checkin::domestic_offset;
use crate::client::{ClientConfig, TlsIdentity};
use crate::retry::{RetryPolicy, SchedulePolicy};
use chrono::{FixedOffset, NaiveTime, TimeDelta};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} environment variable is required")]
    Missing(&'static str),

    #[error("invalid value for {var}: {value}")]
    Invalid { var: &'static str, value: String },

    #[error("SES_CERT_PATH and SES_KEY_PATH must be set together")]
    IncompleteIdentity,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Everything the pipeline needs at start-up.
///
/// Credentials live in `client`, whose `Debug` output is redacted.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub client: ClientConfig,
    pub landlord_code: String,
    pub establishment_code: String,
    pub retry: RetryPolicy,
    pub schedule: SchedulePolicy,
    // offset used to decide which arrivals are "tomorrow"
    pub local_offset: FixedOffset,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    /// Load configuration from environment variables.
    ///
    /// Variables:
    /// - `SES_ENDPOINT_URL`, `SES_USERNAME`, `SES_PASSWORD`, `SES_LANDLORD_CODE` (required)
    /// - `SES_ESTABLISHMENT_CODE` (default: landlord code)
    /// - `SES_CERT_PATH` / `SES_KEY_PATH` (optional, both or neither)
    /// - `SES_TIMEOUT_SECS` (30), `SES_MAX_ATTEMPTS` (3)
    /// - `SES_BACKOFF_BASE_SECS` (30), `SES_BACKOFF_CAP_SECS` (600)
    /// - `SES_SUBMIT_HOUR` (21), `SES_GRACE_MINUTES` (5)
    /// - `SES_LOCAL_OFFSET` (+01:00)
    /// - `SES_LOG_LEVEL` (info)
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &'static str| lookup(key).filter(|v| !v.trim().is_empty());
        let required = |key: &'static str| var(key).ok_or(ConfigError::Missing(key));

        let endpoint = required("SES_ENDPOINT_URL")?;
        if !(endpoint.starts_with("https://") || endpoint.starts_with("http://")) {
            return Err(ConfigError::Invalid {
                var: "SES_ENDPOINT_URL",
                value: endpoint,
            });
        }

        let username = required("SES_USERNAME")?;
        let password = required("SES_PASSWORD")?;
        let landlord_code = required("SES_LANDLORD_CODE")?;
        let establishment_code =
            var("SES_ESTABLISHMENT_CODE").unwrap_or_else(|| landlord_code.clone());

        let identity = match (var("SES_CERT_PATH"), var("SES_KEY_PATH")) {
            (Some(cert), Some(key)) => Some(TlsIdentity {
                cert_path: PathBuf::from(cert),
                key_path: PathBuf::from(key),
            }),
            (None, None) => None,
            _ => return Err(ConfigError::IncompleteIdentity),
        };

        let timeout_secs: u64 = parse_or(&var, "SES_TIMEOUT_SECS", 30)?;
        let max_attempts: u32 = parse_or(&var, "SES_MAX_ATTEMPTS", 3)?;
        let base_secs: u64 = parse_or(&var, "SES_BACKOFF_BASE_SECS", 30)?;
        let cap_secs: u64 = parse_or(&var, "SES_BACKOFF_CAP_SECS", 600)?;
        let submit_hour: u32 = parse_or(&var, "SES_SUBMIT_HOUR", 21)?;
        let grace_minutes: i64 = parse_or(&var, "SES_GRACE_MINUTES", 5)?;
        let local_offset: FixedOffset = parse_or(&var, "SES_LOCAL_OFFSET", domestic_offset())?;

        if max_attempts == 0 {
            return Err(ConfigError::Invalid {
                var: "SES_MAX_ATTEMPTS",
                value: max_attempts.to_string(),
            });
        }
        if grace_minutes <= 0 {
            return Err(ConfigError::Invalid {
                var: "SES_GRACE_MINUTES",
                value: grace_minutes.to_string(),
            });
        }
        let submit_at =
            NaiveTime::from_hms_opt(submit_hour, 0, 0).ok_or_else(|| ConfigError::Invalid {
                var: "SES_SUBMIT_HOUR",
                value: submit_hour.to_string(),
            })?;

        let mut client = ClientConfig::new(endpoint, username, password);
        client.identity = identity;
        client.timeout = Duration::from_secs(timeout_secs);

        Ok(Self {
            client,
            landlord_code,
            establishment_code,
            retry: RetryPolicy {
                max_attempts,
                base_delay: Duration::from_secs(base_secs),
                max_delay: Duration::from_secs(cap_secs.max(base_secs)),
                ..RetryPolicy::default()
            },
            schedule: SchedulePolicy {
                submit_at,
                grace: TimeDelta::minutes(grace_minutes),
            },
            local_offset,
            telemetry: TelemetryConfig {
                log_level: var("SES_LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            },
        })
    }
}

fn parse_or<T, F>(var: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    F: Fn(&'static str) -> Option<String>,
{
    match var(key) {
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid {
            var: key,
            value: raw,
        }),
        None => Ok(default),
    }
}
