//! Engine configuration
//!
//! Every setting has a default suitable for tests and single-process use.
//! `AuthzConfig::from_env()` overrides them from environment variables:
//!
//! | variable | default |
//! |---|---|
//! | `REBAC_MAX_DEPTH` | 32 |
//! | `REBAC_MAX_DISPATCHES` | 4096 |
//! | `REBAC_CHECK_CACHE_TTL_MS` | 500 (0 disables the cache) |
//! | `REBAC_STORE_TIMEOUT_MS` | 5000 |
//! | `REBAC_SCHEMA_PATH` | built-in document-sharing schema |
//! | `DATABASE_URL` | in-memory store |
//! | `REBAC_ORGANIZATION_ID` | nil UUID |

use crate::error::{RebacError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Bounds on the work a single Check or ListObjects call may do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationLimits {
    /// Maximum number of computed, hop and userset steps on one path
    pub max_depth: u32,
    /// Maximum number of sub-checks dispatched by one Check call, shared
    /// across all concurrent branches
    pub max_dispatches: u32,
}

impl Default for EvaluationLimits {
    fn default() -> Self {
        Self {
            max_depth: 32,
            max_dispatches: 4096,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthzConfig {
    pub limits: EvaluationLimits,

    /// How long a cached Check answer stays valid. Zero disables caching.
    /// This is the staleness bound for readers in other processes.
    pub check_cache_ttl: Duration,

    /// Pool acquire timeout for the Postgres store
    pub store_timeout: Duration,

    /// Schema file (YAML or JSON); `None` uses the built-in schema
    pub schema_path: Option<PathBuf>,

    /// Postgres connection string; `None` selects the in-memory store
    pub database_url: Option<String>,

    /// Tenant whose tuples the Postgres store reads and writes
    pub organization_id: Uuid,
}

impl Default for AuthzConfig {
    fn default() -> Self {
        Self {
            limits: EvaluationLimits::default(),
            check_cache_ttl: Duration::from_millis(500),
            store_timeout: Duration::from_secs(5),
            schema_path: None,
            database_url: None,
            organization_id: Uuid::nil(),
        }
    }
}

impl AuthzConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(depth) = parse_var::<u32>("REBAC_MAX_DEPTH")? {
            config.limits.max_depth = depth;
        }
        if let Some(dispatches) = parse_var::<u32>("REBAC_MAX_DISPATCHES")? {
            config.limits.max_dispatches = dispatches;
        }
        if let Some(ttl) = parse_var::<u64>("REBAC_CHECK_CACHE_TTL_MS")? {
            config.check_cache_ttl = Duration::from_millis(ttl);
        }
        if let Some(timeout) = parse_var::<u64>("REBAC_STORE_TIMEOUT_MS")? {
            config.store_timeout = Duration::from_millis(timeout);
        }

        config.schema_path = std::env::var("REBAC_SCHEMA_PATH").ok().map(PathBuf::from);
        config.database_url = std::env::var("DATABASE_URL").ok().filter(|url| !url.is_empty());

        if let Some(organization_id) = parse_var::<Uuid>("REBAC_ORGANIZATION_ID")? {
            config.organization_id = organization_id;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.limits.max_depth == 0 {
            return Err(RebacError::Configuration(
                "max_depth must be at least 1".to_string(),
            ));
        }
        if self.limits.max_dispatches == 0 {
            return Err(RebacError::Configuration(
                "max_dispatches must be at least 1".to_string(),
            ));
        }
        if self.store_timeout.is_zero() {
            return Err(RebacError::Configuration(
                "store timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_var<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| RebacError::Configuration(format!("{} = '{}': {}", name, value, e))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AuthzConfig::default();
        assert_eq!(config.limits.max_depth, 32);
        assert_eq!(config.limits.max_dispatches, 4096);
        assert_eq!(config.check_cache_ttl, Duration::from_millis(500));
        assert!(config.database_url.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_depth_rejected() {
        let mut config = AuthzConfig::default();
        config.limits.max_depth = 0;
        assert!(matches!(config.validate(), Err(RebacError::Configuration(_))));
    }

    #[test]
    fn test_parse_var_reports_bad_values() {
        std::env::set_var("REBAC_TEST_BAD_NUMBER", "lots");
        let err = parse_var::<u32>("REBAC_TEST_BAD_NUMBER").unwrap_err();
        assert!(err.to_string().contains("REBAC_TEST_BAD_NUMBER"));
        std::env::remove_var("REBAC_TEST_BAD_NUMBER");

        assert!(parse_var::<u32>("REBAC_TEST_UNSET_NUMBER").unwrap().is_none());
    }
}
