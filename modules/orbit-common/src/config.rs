use std::env;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{OrbitError, Result};

const DAY_MILLIS: i64 = 24 * 60 * 60 * 1000;

/// Shape of the spaced-repetition curve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Interval assigned on a first review and after every lapse.
    pub initial_interval_millis: i64,
    /// Multiplier applied to the prior interval on a successful review.
    pub growth_factor: f64,
    /// Intervals never grow past this.
    pub max_interval_millis: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            initial_interval_millis: 5 * DAY_MILLIS,
            growth_factor: 2.0,
            max_interval_millis: 365 * DAY_MILLIS,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.initial_interval_millis <= 0 {
            return Err(OrbitError::InvalidConfig(
                "initial interval must be positive".into(),
            ));
        }
        if !self.growth_factor.is_finite() || self.growth_factor < 1.0 {
            return Err(OrbitError::InvalidConfig(format!(
                "growth factor must be a finite number >= 1, got {}",
                self.growth_factor
            )));
        }
        if self.max_interval_millis < self.initial_interval_millis {
            return Err(OrbitError::InvalidConfig(
                "max interval must not be smaller than the initial interval".into(),
            ));
        }
        Ok(())
    }
}

/// Store configuration loaded from environment variables.
#[derive(Debug, Clone, Default)]
pub struct StoreConfig {
    pub scheduler: SchedulerConfig,
    /// Postgres connection string. None means the caller uses an in-memory store.
    pub database_url: Option<String>,
}

impl StoreConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        let defaults = SchedulerConfig::default();
        let scheduler = SchedulerConfig {
            initial_interval_millis: parsed_env(
                "ORBIT_INITIAL_INTERVAL_MILLIS",
                defaults.initial_interval_millis,
            )?,
            growth_factor: parsed_env("ORBIT_GROWTH_FACTOR", defaults.growth_factor)?,
            max_interval_millis: parsed_env(
                "ORBIT_MAX_INTERVAL_MILLIS",
                defaults.max_interval_millis,
            )?,
        };
        scheduler.validate()?;

        Ok(Self {
            scheduler,
            database_url: env::var("DATABASE_URL").ok(),
        })
    }

    /// Log config without the connection string's credentials.
    pub fn log_redacted(&self) {
        info!(
            initial_interval_millis = self.scheduler.initial_interval_millis,
            growth_factor = self.scheduler.growth_factor,
            max_interval_millis = self.scheduler.max_interval_millis,
            database = if self.database_url.is_some() { "postgres" } else { "memory" },
            "Store config loaded"
        );
    }
}

fn parsed_env<T: FromStr>(key: &str, default: T) -> Result<T> {
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| OrbitError::InvalidConfig(format!("{key} must be a number, got {raw:?}"))),
        Err(_) => Ok(default),
    }
}
