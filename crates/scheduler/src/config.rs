//! Scheduler configuration
//!
//! Lane capacity, tick budget, and the default per-task time quota. A
//! configuration can be built programmatically, loaded from environment
//! variables, or read from a small `key = value` file.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;

/// Default number of priority lanes (priorities `0..10`)
pub const DEFAULT_MAX_PRIORITY_LANES: u32 = 10;

/// Default tick budget.
///
/// 50ms is the point at which a host turn starts to register as a long task
/// and input latency becomes noticeable.
pub const DEFAULT_TICK_BUDGET: Duration = Duration::from_millis(50);

/// Environment variable overriding the lane capacity
pub const ENV_MAX_LANES: &str = "MAPKIT_SCHED_MAX_LANES";
/// Environment variable overriding the tick budget, in milliseconds
pub const ENV_TICK_BUDGET_MS: &str = "MAPKIT_SCHED_TICK_BUDGET_MS";
/// Environment variable setting the default time quota, in milliseconds
pub const ENV_TIME_QUOTA_MS: &str = "MAPKIT_SCHED_TIME_QUOTA_MS";

/// Configuration of one [`crate::TaskManager`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Number of priority lanes; valid priorities are `0..max_priority_lanes`
    pub max_priority_lanes: u32,
    /// Longest host turn the run loop may take, in milliseconds (0 = unbounded)
    pub tick_budget_ms: u64,
    /// Time quota for tasks that do not declare one, in milliseconds
    pub default_time_quota_ms: Option<u64>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_priority_lanes: DEFAULT_MAX_PRIORITY_LANES,
            tick_budget_ms: DEFAULT_TICK_BUDGET.as_millis() as u64,
            default_time_quota_ms: None,
        }
    }
}

impl SchedulerConfig {
    /// Sets the number of priority lanes.
    pub fn with_max_priority_lanes(mut self, lanes: u32) -> Self {
        self.max_priority_lanes = lanes;
        self
    }

    /// Sets the tick budget.
    ///
    /// Budgets are kept in whole milliseconds; fractions round up, so a
    /// non-zero budget never turns into "unbounded".
    pub fn with_tick_budget(mut self, budget: Duration) -> Self {
        self.tick_budget_ms = ceil_millis(budget);
        self
    }

    /// Sets the time quota applied to tasks that do not declare one.
    ///
    /// Rounded up to whole milliseconds like the tick budget.
    pub fn with_default_time_quota(mut self, quota: Duration) -> Self {
        self.default_time_quota_ms = Some(ceil_millis(quota));
        self
    }

    /// The tick budget, or `None` when turns are unbounded
    pub fn tick_budget(&self) -> Option<Duration> {
        (self.tick_budget_ms > 0).then(|| Duration::from_millis(self.tick_budget_ms))
    }

    /// The default time quota, if any
    pub fn default_time_quota(&self) -> Option<Duration> {
        self.default_time_quota_ms.map(Duration::from_millis)
    }

    /// Emits a warning for values that disable time slicing.
    ///
    /// Zero budgets are accepted and mean "run to completion or pause".
    /// Returns the number of warnings emitted.
    pub fn warn_on_unsliced(&self) -> usize {
        let mut warnings = 0;
        if self.tick_budget_ms == 0 {
            tracing::warn!("tick budget is zero: the run loop will not yield between tasks");
            warnings += 1;
        }
        if self.default_time_quota_ms == Some(0) {
            tracing::warn!("default time quota is zero: tasks are bounded by the tick budget only");
            warnings += 1;
        }
        if self.max_priority_lanes == 0 {
            tracing::warn!("scheduler has no priority lanes: every task will be rejected");
            warnings += 1;
        }
        warnings
    }

    /// Loads configuration from environment variables.
    ///
    /// Environment variables:
    /// - `MAPKIT_SCHED_MAX_LANES`: number of priority lanes (default: 10)
    /// - `MAPKIT_SCHED_TICK_BUDGET_MS`: tick budget in ms (default: 50)
    /// - `MAPKIT_SCHED_TIME_QUOTA_MS`: default task quota in ms (default: unset)
    ///
    /// # Errors
    /// Returns an error if any variable contains an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var(ENV_MAX_LANES) {
            config.max_priority_lanes = parse_value(ENV_MAX_LANES, &val)?;
        }

        if let Ok(val) = std::env::var(ENV_TICK_BUDGET_MS) {
            config.tick_budget_ms = parse_value(ENV_TICK_BUDGET_MS, &val)?;
        }

        if let Ok(val) = std::env::var(ENV_TIME_QUOTA_MS) {
            config.default_time_quota_ms = Some(parse_value(ENV_TIME_QUOTA_MS, &val)?);
        }

        Ok(config)
    }

    /// Loads configuration from a file.
    ///
    /// Expected file format:
    /// ```toml
    /// max_priority_lanes = 10
    /// tick_budget_ms = 50
    /// time_quota_ms = 8
    /// ```
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path.as_ref())?;
        Self::parse(&contents)
    }

    /// Parses configuration from `key = value` lines.
    ///
    /// Blank lines and `#` comments are skipped, unknown keys are ignored.
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                return Err(ConfigError::InvalidValue(line.to_string()));
            };
            let key = key.trim();
            let value = value.trim().trim_matches('"');

            match key {
                "max_priority_lanes" => config.max_priority_lanes = parse_value(key, value)?,
                "tick_budget_ms" => config.tick_budget_ms = parse_value(key, value)?,
                "time_quota_ms" => config.default_time_quota_ms = Some(parse_value(key, value)?),
                _ => tracing::debug!(key, "ignoring unknown scheduler config key"),
            }
        }

        Ok(config)
    }

    /// Saves configuration to a file readable by [`SchedulerConfig::from_file`].
    ///
    /// # Errors
    /// Returns an error if the file cannot be written.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        fs::write(path.as_ref(), self.render())?;
        Ok(())
    }

    fn render(&self) -> String {
        let mut out = format!(
            "# Task scheduler configuration\n\
             max_priority_lanes = {}\n\
             tick_budget_ms = {}\n",
            self.max_priority_lanes, self.tick_budget_ms
        );
        if let Some(quota) = self.default_time_quota_ms {
            out.push_str(&format!("time_quota_ms = {quota}\n"));
        }
        out
    }
}

/// Whole milliseconds, rounding any fraction up
fn ceil_millis(duration: Duration) -> u64 {
    let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
    if duration.subsec_nanos() % 1_000_000 == 0 {
        millis
    } else {
        millis.saturating_add(1)
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .parse::<T>()
        .map_err(|_| ConfigError::InvalidValue(key.to_string()))
}

/// Errors that can occur during configuration operations.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Invalid value for a configuration parameter
    #[error("invalid value for configuration key: {0}")]
    InvalidValue(String),

    /// I/O error reading or writing the configuration file
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
