//! Runtime Configuration
//!
//! A [`RuntimeConfig`] sizes the worker pool, sets the fairness budget of
//! each fiber, bounds `Runtime::run`, and controls logging. It comes from the
//! builder, from `FIBRA_*` environment variables, or from a TOML document.
//!
//! # Environment Variables
//!
//! | Variable | Meaning | Default |
//! |----------|---------|---------|
//! | `FIBRA_NUM_WORKERS` | Number of worker threads | CPU count |
//! | `FIBRA_MAX_OPS` | Instructions a fiber runs before yielding | 2048 |
//! | `FIBRA_IDLE_PARK_MS` | How long an idle worker parks, in milliseconds | 1 |
//! | `FIBRA_DEFAULT_TIMEOUT_MS` | Timeout for `Runtime::run` in milliseconds (0 = none) | 0 |
//! | `FIBRA_LOG_LEVEL` | Log level (off/error/warn/info/debug/trace) | info |
//! | `FIBRA_REPORT_UNHANDLED` | Log failures of fibers nobody waits on ("true"/"false") | true |
//!
//! # Example
//!
//! ```rust
//! use fibra_runtime::config::RuntimeConfig;
//!
//! let config = RuntimeConfig::from_env();
//! assert!(config.scheduler.num_workers >= 1);
//!
//! let config = RuntimeConfig::builder()
//!     .num_workers(4)
//!     .max_ops_before_yield(512)
//!     .build()
//!     .unwrap();
//! assert_eq!(config.scheduler.num_workers, 4);
//! ```

use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use tracing::warn;

/// Verbosity of the runtime's own `tracing` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Silence the runtime.
    Off,
    /// Panics escaping a fiber evaluation.
    Error,
    /// Unhandled fiber failures.
    Warn,
    /// Runtime start and stop.
    #[default]
    Info,
    /// Forks, interruption delivery, worker lifecycle.
    Debug,
    /// Every fiber start, end and yield.
    Trace,
}

impl LogLevel {
    /// The matching `tracing` filter.
    pub fn as_filter(self) -> LevelFilter {
        match self {
            LogLevel::Off => LevelFilter::OFF,
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

impl FromStr for LogLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let level = match s.trim().to_ascii_lowercase().as_str() {
            "off" | "none" => LogLevel::Off,
            "error" => LogLevel::Error,
            "warn" | "warning" => LogLevel::Warn,
            "info" => LogLevel::Info,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => {
                return Err(ConfigError::InvalidValue {
                    field: "log.level".into(),
                    message: format!("unknown level '{s}'"),
                })
            }
        };
        Ok(level)
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.as_filter(), f)
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Worker threads fibers run on. Defaults to the available parallelism.
    pub num_workers: usize,

    /// Instructions a fiber may run before it yields its worker (2048).
    pub max_ops_before_yield: usize,

    /// How long an idle worker parks before looking for work again (1ms).
    #[serde(with = "millis")]
    pub idle_park: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            num_workers: num_cpus(),
            max_ops_before_yield: 2048,
            idle_park: Duration::from_millis(1),
        }
    }
}

/// Timeout configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Upper bound on how long `Runtime::run` waits for its fiber. Unbounded
    /// when `None`, the default.
    #[serde(with = "millis_option")]
    pub default_timeout: Option<Duration>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Level used when neither `FIBRA_LOG` nor `RUST_LOG` is set.
    pub level: LogLevel,

    /// Log the cause of fibers that fail while nobody waits on them. On by
    /// default.
    pub report_unhandled: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            report_unhandled: true,
        }
    }
}

/// Everything a `Runtime` needs to start. Every section is optional in
/// TOML and falls back to its defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Worker pool and fairness.
    pub scheduler: SchedulerConfig,
    /// Blocking run limits.
    pub timeout: TimeoutConfig,
    /// Logging.
    pub log: LogConfig,
}

impl RuntimeConfig {
    /// Start from the defaults.
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::new()
    }

    /// Overlay the `FIBRA_*` environment variables on the defaults.
    ///
    /// Unset variables keep their defaults. Malformed ones are skipped with
    /// a warning, and so are values that would fail [`validate`](Self::validate).
    pub fn from_env() -> Self {
        let mut config = Self::default();
        let scheduler = &mut config.scheduler;

        if let Some(n) = env_value::<usize>("FIBRA_NUM_WORKERS").filter(|n| *n > 0) {
            scheduler.num_workers = n;
        }
        if let Some(n) = env_value::<usize>("FIBRA_MAX_OPS").filter(|n| *n > 0) {
            scheduler.max_ops_before_yield = n;
        }
        if let Some(ms) = env_value::<u64>("FIBRA_IDLE_PARK_MS") {
            scheduler.idle_park = Duration::from_millis(ms);
        }
        if let Some(ms) = env_value::<u64>("FIBRA_DEFAULT_TIMEOUT_MS") {
            config.timeout.default_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }
        if let Some(level) = env_value::<LogLevel>("FIBRA_LOG_LEVEL") {
            config.log.level = level;
        }
        if let Some(Switch(on)) = env_value::<Switch>("FIBRA_REPORT_UNHANDLED") {
            config.log.report_unhandled = on;
        }

        config
    }

    /// Parse and validate a TOML document. Missing keys keep their
    /// defaults.
    ///
    /// ```rust
    /// use fibra_runtime::config::RuntimeConfig;
    ///
    /// let config = RuntimeConfig::from_toml_str(
    ///     "[scheduler]\nnum_workers = 2\n\n[log]\nlevel = \"debug\"\n",
    /// )
    /// .unwrap();
    /// assert_eq!(config.scheduler.num_workers, 2);
    /// ```
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: RuntimeConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the runtime cannot start with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.num_workers == 0 {
            return Err(ConfigError::InvalidValue {
                field: "scheduler.num_workers".into(),
                message: "must be at least 1".into(),
            });
        }

        if self.scheduler.max_ops_before_yield == 0 {
            return Err(ConfigError::InvalidValue {
                field: "scheduler.max_ops_before_yield".into(),
                message: "must be at least 1".into(),
            });
        }

        Ok(())
    }
}

/// Why a configuration was rejected.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A setting is out of range.
    #[error("invalid configuration for '{field}': {message}")]
    InvalidValue {
        /// Dotted path of the setting.
        field: String,
        /// What is wrong with it.
        message: String,
    },
    /// The TOML document could not be parsed.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Fluent construction of a [`RuntimeConfig`].
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfigBuilder {
    config: RuntimeConfig,
}

impl RuntimeConfigBuilder {
    /// Same as [`RuntimeConfig::builder`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Size of the worker pool.
    pub fn num_workers(mut self, n: usize) -> Self {
        self.config.scheduler.num_workers = n;
        self
    }

    /// Set the instruction budget per scheduling slice.
    pub fn max_ops_before_yield(mut self, ops: usize) -> Self {
        self.config.scheduler.max_ops_before_yield = ops;
        self
    }

    /// Set how long idle workers park.
    pub fn idle_park(mut self, duration: Duration) -> Self {
        self.config.scheduler.idle_park = duration;
        self
    }

    /// Set the timeout applied by `Runtime::run`.
    pub fn default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.timeout.default_timeout = timeout;
        self
    }

    /// Level for the runtime's own events.
    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.config.log.level = level;
        self
    }

    /// Enable or disable reporting of unobserved fiber failures.
    pub fn report_unhandled(mut self, enabled: bool) -> Self {
        self.config.log.report_unhandled = enabled;
        self
    }

    /// Validate and finish.
    pub fn build(self) -> Result<RuntimeConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }

    /// Finish without validating. `Runtime` clamps zero counts to one.
    pub fn build_unchecked(self) -> RuntimeConfig {
        self.config
    }
}

/// Read and parse one variable, warning when it is set but malformed.
fn env_value<T>(name: &str) -> Option<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    let raw = env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(variable = name, value = %raw, %err, "ignoring malformed setting");
            None
        }
    }
}

/// A boolean switch spelled the way people write them in shells.
struct Switch(bool);

impl FromStr for Switch {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(Switch(true)),
            "false" | "0" | "no" | "off" => Ok(Switch(false)),
            other => Err(format!("expected a boolean, got '{other}'")),
        }
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Durations in TOML are written as integer milliseconds.
mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

mod millis_option {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    /// `0` means no timeout.
    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok((millis > 0).then(|| Duration::from_millis(millis)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::default();
        assert!(config.scheduler.num_workers >= 1);
        assert_eq!(config.scheduler.max_ops_before_yield, 2048);
        assert_eq!(config.scheduler.idle_park, Duration::from_millis(1));
        assert!(config.timeout.default_timeout.is_none());
        assert_eq!(config.log.level, LogLevel::Info);
        assert!(config.log.report_unhandled);
    }

    #[test]
    fn test_builder() {
        let config = RuntimeConfig::builder()
            .num_workers(4)
            .max_ops_before_yield(64)
            .default_timeout(Some(Duration::from_secs(30)))
            .log_level(LogLevel::Debug)
            .report_unhandled(false)
            .build()
            .unwrap();

        assert_eq!(config.scheduler.num_workers, 4);
        assert_eq!(config.scheduler.max_ops_before_yield, 64);
        assert_eq!(config.timeout.default_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.log.level, LogLevel::Debug);
        assert!(!config.log.report_unhandled);
    }

    #[test]
    fn test_builder_validation() {
        assert!(RuntimeConfig::builder().num_workers(0).build().is_err());
        assert!(RuntimeConfig::builder()
            .max_ops_before_yield(0)
            .build()
            .is_err());
        let unchecked = RuntimeConfig::builder().num_workers(0).build_unchecked();
        assert_eq!(unchecked.scheduler.num_workers, 0);
    }

    #[test]
    fn test_log_level_from_str() {
        assert_eq!("off".parse::<LogLevel>().unwrap(), LogLevel::Off);
        assert_eq!("ERROR".parse::<LogLevel>().unwrap(), LogLevel::Error);
        assert_eq!(" warning ".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert_eq!("Trace".parse::<LogLevel>().unwrap(), LogLevel::Trace);
        let err = "loud".parse::<LogLevel>().unwrap_err();
        assert!(err.to_string().contains("unknown level 'loud'"));
    }

    #[test]
    fn test_log_level_filter() {
        assert_eq!(LogLevel::Off.as_filter(), LevelFilter::OFF);
        assert_eq!(LogLevel::Debug.as_filter(), LevelFilter::DEBUG);
        assert_eq!(LogLevel::Warn.to_string(), "warn");
        assert!(LogLevel::Error < LogLevel::Trace);
    }

    #[test]
    fn test_switch_spellings() {
        assert!("on".parse::<Switch>().unwrap().0);
        assert!(!"No".parse::<Switch>().unwrap().0);
        assert!("maybe".parse::<Switch>().is_err());
    }

    #[test]
    fn test_from_toml() {
        let config = RuntimeConfig::from_toml_str(
            r#"
            [scheduler]
            num_workers = 3
            idle_park = 5

            [timeout]
            default_timeout = 250

            [log]
            level = "trace"
            report_unhandled = false
            "#,
        )
        .unwrap();

        assert_eq!(config.scheduler.num_workers, 3);
        assert_eq!(config.scheduler.max_ops_before_yield, 2048);
        assert_eq!(config.scheduler.idle_park, Duration::from_millis(5));
        assert_eq!(config.timeout.default_timeout, Some(Duration::from_millis(250)));
        assert_eq!(config.log.level, LogLevel::Trace);
        assert!(!config.log.report_unhandled);
    }

    #[test]
    fn test_from_toml_rejects_invalid() {
        let err = RuntimeConfig::from_toml_str("[scheduler]\nnum_workers = 0\n").unwrap_err();
        assert!(err.to_string().contains("scheduler.num_workers"));

        let err = RuntimeConfig::from_toml_str("[scheduler\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::InvalidValue {
            field: "num_workers".into(),
            message: "must be positive".into(),
        };
        assert!(err.to_string().contains("num_workers"));
        assert!(err.to_string().contains("must be positive"));
    }

    #[test]
    fn test_from_env_with_no_vars() {
        env::remove_var("FIBRA_NUM_WORKERS");
        env::remove_var("FIBRA_MAX_OPS");

        let config = RuntimeConfig::from_env();
        assert!(config.scheduler.num_workers >= 1);
        assert_eq!(config.scheduler.max_ops_before_yield, 2048);
    }
}
