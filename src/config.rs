//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Batch sizing for the aggregation pyramid.
#[derive(Debug, Clone)]
pub struct AggregationConfig {
    /// Floor for forming a batch.
    pub min_items_to_aggregate: usize,
    /// Preferred batch size.
    pub target_items_to_aggregate: usize,
    /// Ceiling used only by the final-batch heuristic.
    pub max_items_to_aggregate: usize,
    /// Advisory wait hint returned to agents when no task is available.
    pub max_wait_time: Duration,
    /// Reserved. Not read by the planner.
    pub level_time_multiplier: f64,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            min_items_to_aggregate: 2,
            target_items_to_aggregate: 4,
            max_items_to_aggregate: 6,
            max_wait_time: Duration::from_millis(5 * 60 * 1000),
            level_time_multiplier: 1.5,
        }
    }
}

impl AggregationConfig {
    /// Build from `SWARM_*` environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            min_items_to_aggregate: env_or(
                "SWARM_MIN_ITEMS_TO_AGGREGATE",
                defaults.min_items_to_aggregate,
            )?,
            target_items_to_aggregate: env_or(
                "SWARM_TARGET_ITEMS_TO_AGGREGATE",
                defaults.target_items_to_aggregate,
            )?,
            max_items_to_aggregate: env_or(
                "SWARM_MAX_ITEMS_TO_AGGREGATE",
                defaults.max_items_to_aggregate,
            )?,
            max_wait_time: Duration::from_millis(env_or(
                "SWARM_MAX_WAIT_TIME_MS",
                defaults.max_wait_time.as_millis() as u64,
            )?),
            level_time_multiplier: env_or(
                "SWARM_LEVEL_TIME_MULTIPLIER",
                defaults.level_time_multiplier,
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check the batch-size ordering `2 <= min <= target <= max`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_items_to_aggregate < 2 {
            return Err(ConfigError::InvalidValue {
                key: "SWARM_MIN_ITEMS_TO_AGGREGATE".into(),
                message: format!(
                    "must be at least 2, got {}",
                    self.min_items_to_aggregate
                ),
            });
        }
        if self.target_items_to_aggregate < self.min_items_to_aggregate {
            return Err(ConfigError::InvalidValue {
                key: "SWARM_TARGET_ITEMS_TO_AGGREGATE".into(),
                message: format!(
                    "must be >= min ({}), got {}",
                    self.min_items_to_aggregate, self.target_items_to_aggregate
                ),
            });
        }
        if self.max_items_to_aggregate < self.target_items_to_aggregate {
            return Err(ConfigError::InvalidValue {
                key: "SWARM_MAX_ITEMS_TO_AGGREGATE".into(),
                message: format!(
                    "must be >= target ({}), got {}",
                    self.target_items_to_aggregate, self.max_items_to_aggregate
                ),
            });
        }
        Ok(())
    }
}

/// Service configuration.
#[derive(Debug, Clone)]
pub struct SwarmConfig {
    /// HTTP listen port.
    pub port: u16,
    /// libSQL database file.
    pub db_path: PathBuf,
    /// Prefix for generated agent API keys.
    pub api_key_prefix: String,
    /// Lease after which an unsubmitted task is expired and its claims
    /// released. `None` keeps tasks in progress forever.
    pub task_lease: Option<Duration>,
    pub aggregation: AggregationConfig,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            port: 3001,
            db_path: PathBuf::from("./data/claw-swarm.db"),
            api_key_prefix: "clawswarm_".to_string(),
            task_lease: None,
            aggregation: AggregationConfig::default(),
        }
    }
}

impl SwarmConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let port = env_or("SWARM_PORT", defaults.port)?;
        let db_path = std::env::var("SWARM_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.db_path);
        let task_lease = match std::env::var("SWARM_TASK_LEASE_SECS") {
            Ok(raw) => Some(Duration::from_secs(parse_value(
                "SWARM_TASK_LEASE_SECS",
                &raw,
            )?)),
            Err(_) => None,
        };

        Ok(Self {
            port,
            db_path,
            api_key_prefix: defaults.api_key_prefix,
            task_lease,
            aggregation: AggregationConfig::from_env()?,
        })
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => parse_value(key, &raw),
        Err(_) => Ok(default),
    }
}

fn parse_value<T: FromStr>(key: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("cannot parse {raw:?}"),
    })
}
