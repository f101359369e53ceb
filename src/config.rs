//! Run configuration

use crate::errors::StructuralError;
use crate::{RetryPolicy, RewriteTable};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Options a run is started with; persisted in the ledger
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunOptions {
    /// Enumerate and plan only; never create or write the ledger
    pub dry_run: bool,
    /// Concurrent Create calls within one phase (1 = sequential)
    pub parallelism: usize,
    /// Create attempts per object per invocation
    pub max_retry: u32,
    /// Backoff base; delay before retry `n` is `base^n` units
    pub backoff_base: f64,
    /// Length of one backoff unit (milliseconds)
    pub backoff_unit_millis: u64,
    /// Upper bound for a single backoff delay (milliseconds)
    pub max_backoff_millis: u64,
    /// Timeout for one Create call (milliseconds)
    pub create_timeout_millis: u64,
    /// Principal suffix rewrites, most specific first
    pub rewrite: RewriteTable,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            parallelism: 1,
            max_retry: 3,
            backoff_base: 2.0,
            backoff_unit_millis: 1000,
            max_backoff_millis: 300_000,
            create_timeout_millis: 60_000,
            rewrite: RewriteTable::default(),
        }
    }
}

impl RunOptions {
    /// Retry policy described by these options
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_retry,
            base: self.backoff_base,
            unit: Duration::from_millis(self.backoff_unit_millis),
            max_delay: Duration::from_millis(self.max_backoff_millis),
        }
    }

    /// Timeout for one Create call
    pub fn create_timeout(&self) -> Duration {
        Duration::from_millis(self.create_timeout_millis)
    }

    /// Reject options the engine cannot honor
    pub fn validate(&self) -> Result<(), StructuralError> {
        if self.parallelism == 0 {
            return Err(StructuralError::InvalidConfig("parallelism must be at least 1".into()));
        }
        if self.max_retry == 0 {
            return Err(StructuralError::InvalidConfig("max_retry must be at least 1".into()));
        }
        if !(self.backoff_base > 1.0) {
            return Err(StructuralError::InvalidConfig("backoff_base must be greater than 1".into()));
        }
        // The delay after attempt n is unit * base^n and the last retry follows
        // attempt max_retry - 1; past the cap delays would stop growing
        let last_retry = self.max_retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let longest = self.backoff_unit_millis as f64 * self.backoff_base.powi(last_retry);
        if longest > self.max_backoff_millis as f64 {
            return Err(StructuralError::InvalidConfig(format!(
                "retry delays would exceed max_backoff_millis ({} ms) before max_retry {} is reached",
                self.max_backoff_millis, self.max_retry
            )));
        }
        if self.create_timeout_millis == 0 {
            return Err(StructuralError::InvalidConfig("create_timeout_millis must be positive".into()));
        }
        Ok(())
    }
}

/// Everything needed to start a new run
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Source tenant identifier
    pub source_tenant: String,
    /// Destination tenant identifier
    pub destination_tenant: String,
    /// Where the ledger document lives
    pub ledger_path: PathBuf,
    /// Run options
    #[serde(default)]
    pub options: RunOptions,
}

impl RunConfig {
    /// Config with default options
    pub fn new(
        source_tenant: impl Into<String>,
        destination_tenant: impl Into<String>,
        ledger_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            source_tenant: source_tenant.into(),
            destination_tenant: destination_tenant.into(),
            ledger_path: ledger_path.into(),
            options: RunOptions::default(),
        }
    }

    /// Replace the options
    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    /// Parse a JSON config document
    pub fn from_json(json: &str) -> Result<Self, StructuralError> {
        serde_json::from_str(json).map_err(|e| StructuralError::InvalidConfig(e.to_string()))
    }

    /// Reject configs that cannot start a run
    pub fn validate(&self) -> Result<(), StructuralError> {
        if self.source_tenant.trim().is_empty() || self.destination_tenant.trim().is_empty() {
            return Err(StructuralError::InvalidConfig("tenant identifiers must not be empty".into()));
        }
        if self.source_tenant == self.destination_tenant {
            return Err(StructuralError::InvalidConfig(
                "source and destination tenant are the same".into(),
            ));
        }
        self.options.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let config = RunConfig::from_json(
            r#"{
                "source_tenant": "contoso",
                "destination_tenant": "fabrikam",
                "ledger_path": "/tmp/run.json",
                "options": { "parallelism": 4 }
            }"#,
        )
        .unwrap();

        assert_eq!(config.options.parallelism, 4);
        assert_eq!(config.options.max_retry, 3);
        assert!(config.options.rewrite.rules().is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_same_tenant() {
        let config = RunConfig::new("contoso", "contoso", "/tmp/x.json");
        assert!(matches!(config.validate(), Err(StructuralError::InvalidConfig(_))));
    }

    #[test]
    fn test_validate_rejects_bad_options() {
        let zero_workers = RunOptions {
            parallelism: 0,
            ..RunOptions::default()
        };
        assert!(zero_workers.validate().is_err());

        let flat_backoff = RunOptions {
            backoff_base: 1.0,
            ..RunOptions::default()
        };
        assert!(flat_backoff.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_retries_past_backoff_cap() {
        // Defaults: 1s * 2^8 = 256s still fits under 300s
        let nine = RunOptions {
            max_retry: 9,
            ..RunOptions::default()
        };
        assert!(nine.validate().is_ok());
        let policy = nine.retry_policy();
        assert!(policy.delay_for_attempt(8) > policy.delay_for_attempt(7));

        let ten = RunOptions {
            max_retry: 10,
            ..RunOptions::default()
        };
        let err = ten.validate().unwrap_err();
        assert!(err.to_string().contains("max_backoff_millis"));

        let raised_cap = RunOptions {
            max_retry: 10,
            max_backoff_millis: 600_000,
            ..RunOptions::default()
        };
        assert!(raised_cap.validate().is_ok());
    }

    #[test]
    fn test_retry_policy_from_options() {
        let policy = RunOptions::default().retry_policy();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.unit, Duration::from_secs(1));
    }
}
