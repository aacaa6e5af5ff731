//! Configuration for tenant lifecycle management.
//!
//! Settings come from the connection string. Parameters prefixed with `gmt_`
//! configure retries and are stripped before the URL is handed to the
//! driver:
//!
//! | Parameter | Type | Default |
//! |-----------|------|---------|
//! | `gmt_disable_retry` | bool | `false` |
//! | `gmt_max_retries` | integer | `6` |
//! | `gmt_retry_interval` | duration (`2s`, `500ms`) | `2s` |
//! | `gmt_retry_max_interval` | duration | `30s` |
//!
//! ```
//! use armature_tenancy::TenancyConfig;
//! use std::time::Duration;
//!
//! let config = TenancyConfig::parse(
//!     "postgres://app@localhost/app?sslmode=disable&gmt_max_retries=3&gmt_retry_interval=500ms",
//! )
//! .unwrap();
//!
//! assert_eq!(config.scheme(), "postgres");
//! assert_eq!(config.driver_url(), "postgres://app@localhost/app?sslmode=disable");
//! assert_eq!(config.retry_policy().unwrap().interval, Duration::from_millis(500));
//! ```

use crate::error::{TenancyError, TenancyResult};
use crate::namespace;
use crate::retry::RetryPolicy;
use humantime_serde::re::humantime;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

/// Prefix of the parameters consumed here.
pub const PARAM_PREFIX: &str = "gmt_";

/// Environment variable holding the connection string for [`TenancyConfig::from_env`].
pub const DATABASE_URL_ENV: &str = "DATABASE_URL";

/// Parsed connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenancyConfig {
    /// Lower-cased URL scheme, used to pick the backend.
    pub scheme: String,

    /// Connection string without `gmt_*` parameters.
    pub driver_url: String,

    /// Retry policy for lock acquisition and migrations; `None` disables
    /// retries.
    #[serde(default = "default_retry")]
    pub retry: Option<RetryPolicy>,

    /// Public namespace name.
    #[serde(default = "namespace::public_schema_name")]
    pub public_schema: String,
}

fn default_retry() -> Option<RetryPolicy> {
    Some(RetryPolicy::default())
}

impl TenancyConfig {
    /// Parse a connection string.
    ///
    /// The public namespace is taken from `GMT_PUBLIC_SCHEMA_NAME` (default
    /// `public`) and must be a valid namespace name.
    pub fn parse(dsn: &str) -> TenancyResult<Self> {
        let mut url = Url::parse(dsn)
            .map_err(|e| TenancyError::Config(format!("invalid connection string: {e}")))?;
        let scheme = url.scheme().to_ascii_lowercase();

        let mut retry = RetryPolicy::default();
        let mut disabled = false;
        let mut passthrough = Vec::new();

        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "gmt_disable_retry" => disabled = parse_bool(&key, &value)?,
                "gmt_max_retries" => {
                    retry.max_retries = value.parse().map_err(|_| invalid(&key, &value))?
                }
                "gmt_retry_interval" => retry.interval = parse_duration(&key, &value)?,
                "gmt_retry_max_interval" => retry.max_interval = parse_duration(&key, &value)?,
                other if other.starts_with(PARAM_PREFIX) => {
                    return Err(TenancyError::Config(format!(
                        "unknown connection parameter `{other}`"
                    )));
                }
                _ => passthrough.push((key.into_owned(), value.into_owned())),
            }
        }

        if retry.interval > retry.max_interval {
            return Err(TenancyError::Config(format!(
                "gmt_retry_interval ({}) exceeds gmt_retry_max_interval ({})",
                humantime::format_duration(retry.interval),
                humantime::format_duration(retry.max_interval)
            )));
        }

        if passthrough.is_empty() {
            url.set_query(None);
        } else {
            url.query_pairs_mut().clear().extend_pairs(passthrough);
        }

        let public_schema = namespace::public_schema_name();
        namespace::validate(&public_schema)?;

        Ok(Self {
            scheme,
            driver_url: url.to_string(),
            retry: (!disabled).then_some(retry),
            public_schema,
        })
    }

    /// Parse the connection string in `DATABASE_URL`.
    pub fn from_env() -> TenancyResult<Self> {
        let dsn = std::env::var(DATABASE_URL_ENV)
            .map_err(|_| TenancyError::Config(format!("{DATABASE_URL_ENV} not set")))?;
        Self::parse(&dsn)
    }

    /// Override the public namespace.
    pub fn with_public_schema(mut self, name: impl Into<String>) -> TenancyResult<Self> {
        let name = name.into();
        namespace::validate(&name)?;
        self.public_schema = name;
        Ok(self)
    }

    /// Replace the retry policy. `None` disables retries.
    pub fn with_retry(mut self, retry: Option<RetryPolicy>) -> Self {
        self.retry = retry;
        self
    }

    /// URL scheme.
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Connection string for the driver.
    pub fn driver_url(&self) -> &str {
        &self.driver_url
    }

    /// Retry policy, unless retries are disabled.
    pub fn retry_policy(&self) -> Option<RetryPolicy> {
        self.retry
    }

    /// Public namespace name.
    pub fn public_schema(&self) -> &str {
        &self.public_schema
    }
}

fn invalid(key: &str, value: &str) -> TenancyError {
    TenancyError::Config(format!("invalid value `{value}` for `{key}`"))
}

fn parse_bool(key: &str, value: &str) -> TenancyResult<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "t" | "true" => Ok(true),
        "0" | "f" | "false" => Ok(false),
        _ => Err(invalid(key, value)),
    }
}

fn parse_duration(key: &str, value: &str) -> TenancyResult<Duration> {
    humantime::parse_duration(value).map_err(|_| invalid(key, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TenancyConfig::parse("mysql://root@127.0.0.1:3306/app").unwrap();

        assert_eq!(config.scheme(), "mysql");
        assert_eq!(config.driver_url(), "mysql://root@127.0.0.1:3306/app");
        assert_eq!(config.retry_policy(), Some(RetryPolicy::default()));
    }

    #[test]
    fn test_scheme_is_lowercased() {
        let config = TenancyConfig::parse("PostgreSQL://localhost/app").unwrap();
        assert_eq!(config.scheme(), "postgresql");
    }

    #[test]
    fn test_retry_parameters() {
        let config = TenancyConfig::parse(
            "postgres://localhost/app?gmt_max_retries=2&gmt_retry_interval=100ms&gmt_retry_max_interval=1s",
        )
        .unwrap();

        let retry = config.retry_policy().unwrap();
        assert_eq!(retry.max_retries, 2);
        assert_eq!(retry.interval, Duration::from_millis(100));
        assert_eq!(retry.max_interval, Duration::from_secs(1));
        assert_eq!(config.driver_url(), "postgres://localhost/app");
    }

    #[test]
    fn test_disable_retry() {
        let config =
            TenancyConfig::parse("postgres://localhost/app?gmt_disable_retry=true&sslmode=require")
                .unwrap();

        assert_eq!(config.retry_policy(), None);
        assert_eq!(config.driver_url(), "postgres://localhost/app?sslmode=require");
    }

    #[test]
    fn test_invalid_values() {
        for dsn in [
            "postgres://localhost/app?gmt_max_retries=many",
            "postgres://localhost/app?gmt_retry_interval=soon",
            "postgres://localhost/app?gmt_disable_retry=maybe",
            "postgres://localhost/app?gmt_retry_interval=1m&gmt_retry_max_interval=1s",
            "postgres://localhost/app?gmt_unknown=1",
            "not a url",
        ] {
            assert!(
                matches!(TenancyConfig::parse(dsn), Err(TenancyError::Config(_))),
                "{dsn} should be rejected"
            );
        }
    }

    #[test]
    fn test_public_schema_override() {
        let config = TenancyConfig::parse("postgres://localhost/app")
            .unwrap()
            .with_public_schema("shared")
            .unwrap();
        assert_eq!(config.public_schema(), "shared");

        let err = TenancyConfig::parse("postgres://localhost/app")
            .unwrap()
            .with_public_schema("pg_shared")
            .unwrap_err();
        assert!(matches!(err, TenancyError::ReservedPrefix(_)));
    }

    #[test]
    fn test_serde_roundtrip_uses_humantime() {
        let config = TenancyConfig::parse("postgres://localhost/app?gmt_retry_interval=250ms")
            .unwrap();
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"250ms\""));

        let back: TenancyConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
