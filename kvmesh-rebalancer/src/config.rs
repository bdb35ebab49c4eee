//! Rebalancer configuration
//!
//! Configuration loaded from environment variables and command line.

use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Nodes that receive the compensating topology write after a failed commit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackTargets {
    /// Stealer and donor, the same nodes as the forward write
    AffectedNodes,
    /// No node at all; the revert only reaches the local view
    None,
}

impl FromStr for RollbackTargets {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "affected" => Ok(RollbackTargets::AffectedNodes),
            "none" => Ok(RollbackTargets::None),
            other => Err(ConfigError::InvalidValue(
                "REBALANCER_ROLLBACK_TARGETS".to_string(),
                other.to_string(),
            )),
        }
    }
}

/// Rebalancer configuration
#[derive(Debug, Clone)]
pub struct RebalancerConfig {
    /// Number of workers draining the task queue
    pub max_parallel_rebalancing: usize,

    /// Upper bound on waiting for one store migration
    pub migration_timeout: Duration,

    /// Treat identical stealer/donor clocks as agreement instead of an error
    pub accept_identical_clocks: bool,

    /// Where a failed commit sends its compensating write
    pub rollback_targets: RollbackTargets,
}

impl Default for RebalancerConfig {
    fn default() -> Self {
        Self {
            max_parallel_rebalancing: 4,
            migration_timeout: Duration::from_secs(24 * 60 * 60),
            accept_identical_clocks: false,
            rollback_targets: RollbackTargets::AffectedNodes,
        }
    }
}

impl RebalancerConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let max_parallel_rebalancing = parse_env("REBALANCER_MAX_PARALLEL")?
            .unwrap_or(defaults.max_parallel_rebalancing);

        let migration_timeout = parse_env::<u64>("REBALANCER_MIGRATION_TIMEOUT_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.migration_timeout);

        let accept_identical_clocks = std::env::var("REBALANCER_ACCEPT_IDENTICAL_CLOCKS")
            .ok()
            .map(|v| v == "true" || v == "1")
            .unwrap_or(defaults.accept_identical_clocks);

        let rollback_targets = parse_env("REBALANCER_ROLLBACK_TARGETS")?
            .unwrap_or(defaults.rollback_targets);

        let config = Self {
            max_parallel_rebalancing,
            migration_timeout,
            accept_identical_clocks,
            rollback_targets,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values the orchestrator cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_parallel_rebalancing == 0 {
            return Err(ConfigError::InvalidValue(
                "max_parallel_rebalancing".to_string(),
                "0".to_string(),
            ));
        }
        if self.migration_timeout.is_zero() {
            return Err(ConfigError::InvalidValue(
                "migration_timeout".to_string(),
                "0s".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_env<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue(key.to_string(), raw)),
        Err(_) => Ok(None),
    }
}
