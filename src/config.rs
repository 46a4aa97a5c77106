//! Layered configuration.
//!
//! Sources are merged in order of increasing precedence:
//! - Built-in defaults
//! - `vigil.toml` in the working directory, if present
//! - Environment variables prefixed with `VIGIL_`, using double
//!   underscores for nesting: `VIGIL_BUFFER_SIZE=65536`,
//!   `VIGIL_LOGGING__DEFAULT=debug`

use std::collections::HashMap;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::error::WatchError;

/// Read buffer size carried by each watch. The OS queues change records
/// into this buffer between reads, so it bounds how bursty changes can
/// get before an overflow.
const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct WatchConfig {
    /// Per-watch change buffer size in bytes
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Default log level for the crate
    #[serde(default = "default_log_level")]
    pub default: String,

    /// Per-module level overrides, keyed by module path
    #[serde(default)]
    pub modules: HashMap<String, String>,
}

fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

fn default_log_level() -> String {
    "warn".to_string()
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            default: default_log_level(),
            modules: HashMap::new(),
        }
    }
}

impl WatchConfig {
    /// Load configuration from all sources.
    pub fn load() -> Result<Self, WatchError> {
        let config: Self = Figment::new()
            .merge(Serialized::defaults(WatchConfig::default()))
            .merge(Toml::file("vigil.toml"))
            .merge(Env::prefixed("VIGIL_").split("__"))
            .extract()
            .map_err(|err| WatchError::InitFailed {
                reason: format!("invalid configuration: {err}"),
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), WatchError> {
        if self.buffer_size == 0 {
            return Err(WatchError::InitFailed {
                reason: "buffer_size must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = WatchConfig::default();
        assert_eq!(config.buffer_size, 16 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_buffer_size_is_rejected() {
        let config = WatchConfig {
            buffer_size: 0,
            ..WatchConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(WatchError::InitFailed { .. })
        ));
    }

    #[test]
    fn test_env_overrides_toml() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("vigil.toml", "buffer_size = 32768")?;
            jail.set_env("VIGIL_BUFFER_SIZE", "4096");
            let config: WatchConfig = Figment::new()
                .merge(Serialized::defaults(WatchConfig::default()))
                .merge(Toml::file("vigil.toml"))
                .merge(Env::prefixed("VIGIL_").split("__"))
                .extract()?;
            assert_eq!(config.buffer_size, 4096);
            Ok(())
        });
    }

    #[test]
    fn test_toml_overrides_defaults() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "vigil.toml",
                r#"
                buffer_size = 65536

                [logging]
                default = "debug"
                "#,
            )?;
            let config: WatchConfig = Figment::new()
                .merge(Serialized::defaults(WatchConfig::default()))
                .merge(Toml::file("vigil.toml"))
                .extract()?;
            assert_eq!(config.buffer_size, 65536);
            assert_eq!(config.logging.default, "debug");
            Ok(())
        });
    }
}
