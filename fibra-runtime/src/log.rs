//! Logging Infrastructure
//!
//! The runtime reports through [`tracing`] events:
//!
//! - `trace`: fiber creation and completion, yields, finalizer runs
//! - `debug`: forks, interruption of suspended fibers, worker lifecycle
//! - `warn`: failures of fibers that nobody waits on, with the full cause
//! - `error`: panics that escape a fiber evaluation
//!
//! Applications that already install a subscriber get these events for
//! free. [`init`] installs a plain `fmt` subscriber for everyone else.
//!
//! # Example
//!
//! ```rust
//! use fibra_runtime::config::LogConfig;
//!
//! fibra_runtime::log::init(&LogConfig::default());
//! ```

use tracing_subscriber::EnvFilter;

use crate::config::{LogConfig, LogLevel};

/// Environment variable consulted before `RUST_LOG`.
pub const LOG_ENV: &str = "FIBRA_LOG";

/// Install a global `fmt` subscriber.
///
/// The filter comes from `FIBRA_LOG`, then `RUST_LOG`, then the configured
/// level. Returns `false` if a global subscriber was already installed.
pub fn init(config: &LogConfig) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(filter(config))
        .with_thread_names(true)
        .try_init()
        .is_ok()
}

/// The filter [`init`] would install.
pub fn filter(config: &LogConfig) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(directive(config.level)))
}

/// Scope the level to this crate so applications keep their own filters.
fn directive(level: LogLevel) -> String {
    match level {
        LogLevel::Off => "off".to_string(),
        level => format!("fibra_runtime={level}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directive_scopes_to_crate() {
        assert_eq!(directive(LogLevel::Off), "off");
        assert_eq!(directive(LogLevel::Debug), "fibra_runtime=debug");
    }

    #[test]
    fn test_init_is_idempotent() {
        let config = LogConfig {
            level: LogLevel::Off,
            ..LogConfig::default()
        };
        init(&config);
        assert!(!init(&config));
    }
}
