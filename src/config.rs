//! Configuration System using Figment
//!
//! Configuration is loaded from:
//! 1. built-in defaults
//! 2. a TOML file (`config/daq_loop.toml` unless another path is given)
//! 3. environment variables prefixed with `DAQ_LOOP_`, nested with `__`
//!    (for example `DAQ_LOOP_POLLER__IDLE_BACKOFF=5ms`)
//!
//! # Example
//! ```no_run
//! use daq_loop::config::LoopConfig;
//!
//! let config = LoopConfig::load_from("config/daq_loop.toml")?;
//! config.validate()?;
//! println!("{} channels", config.channels.len());
//! # Ok::<(), daq_loop::ConfigError>(())
//! ```

use std::collections::HashSet;
use std::path::Path;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::channel::ChannelDescriptor;
use crate::error::{ConfigError, SessionError};
use crate::session::SessionOptions;
use crate::simulated::SimulationConfig;

/// Default configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/daq_loop.toml";

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "DAQ_LOOP_";

/// Accepted `log_level` values.
pub const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoopConfig {
    /// Application settings.
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Session and poller tunables.
    #[serde(default)]
    pub poller: SessionOptions,
    /// Channels to acquire.
    #[serde(default)]
    pub channels: Vec<ChannelDescriptor>,
    /// Behaviour of the simulated device used by the CLI.
    #[serde(default)]
    pub simulation: SimulationConfig,
}

/// Application-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name.
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_name() -> String {
    "daq-loop".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
        }
    }
}

impl LoopConfig {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Load`] if a source cannot be parsed.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file and the environment.
    ///
    /// A missing file is not an error; defaults and environment still apply.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Load`] if a source cannot be parsed.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Ok(Self::figment(path.as_ref()).extract()?)
    }

    /// The layered provider used by [`load_from`](Self::load_from).
    #[must_use]
    pub fn figment(path: &Path) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let level = self.application.log_level.to_lowercase();
        if !LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                LOG_LEVELS.join(", ")
            )));
        }

        if self.poller.read_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "poller.read_timeout must be > 0".to_string(),
            ));
        }

        if self.channels.is_empty() {
            return Err(SessionError::NoChannels.into());
        }

        let mut ids = HashSet::new();
        for channel in &self.channels {
            channel.validate()?;
            if !ids.insert(channel.id) {
                return Err(SessionError::DuplicateChannel(channel.id).into());
            }
        }

        if self.simulation.fail_every == Some(0) {
            return Err(ConfigError::Invalid(
                "simulation.fail_every must be > 0 when set".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelId, ChannelKind};
    use crate::session::SizingErrorPolicy;
    use std::io::Write;
    use std::time::Duration;

    const SAMPLE: &str = r#"
[application]
name = "bench"
log_level = "debug"

[poller]
idle_backoff = "2ms"
read_timeout = "500ms"
sizing_error_policy = "discard"

[[channels]]
id = 1
kind = "analog"
samples_per_chan = 100
buffer_size = 100

[[channels]]
id = 2
kind = "digital"
samples_per_chan = 50
buffer_size = 100
lines = 2
name = "Dev1/port0"
"#;

    fn valid() -> LoopConfig {
        LoopConfig {
            channels: vec![ChannelDescriptor::new(1, ChannelKind::Analog, 10, 10)],
            ..Default::default()
        }
    }

    // Env-reading tests run inside a Jail, which serializes them.

    #[test]
    fn test_load_from_file() {
        figment::Jail::expect_with(|_jail| {
            let mut file = tempfile::NamedTempFile::new().unwrap();
            file.write_all(SAMPLE.as_bytes()).unwrap();

            let config = LoopConfig::load_from(file.path()).unwrap();
            assert_eq!(config.application.name, "bench");
            assert_eq!(config.application.log_level, "debug");
            assert_eq!(config.poller.idle_backoff, Duration::from_millis(2));
            assert_eq!(config.poller.read_timeout, Duration::from_millis(500));
            assert_eq!(config.poller.sizing_error_policy, SizingErrorPolicy::Discard);
            assert_eq!(config.channels.len(), 2);
            assert_eq!(config.channels[0].lines, 1);
            assert_eq!(config.channels[1].lines, 2);
            assert_eq!(config.channels[1].kind, ChannelKind::Digital);
            assert!(config.validate().is_ok());
            Ok(())
        });
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        figment::Jail::expect_with(|_jail| {
            let dir = tempfile::tempdir().unwrap();
            let config = LoopConfig::load_from(dir.path().join("absent.toml")).unwrap();
            assert_eq!(config.application, ApplicationConfig::default());
            assert_eq!(config.poller, SessionOptions::default());
            assert!(config.channels.is_empty());
            Ok(())
        });
    }

    #[test]
    fn test_env_overrides_file() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("daq.toml", SAMPLE)?;
            jail.set_env("DAQ_LOOP_APPLICATION__LOG_LEVEL", "warn");
            jail.set_env("DAQ_LOOP_POLLER__IDLE_BACKOFF", "10ms");

            let config = LoopConfig::figment(Path::new("daq.toml")).extract::<LoopConfig>()?;
            assert_eq!(config.application.log_level, "warn");
            assert_eq!(config.poller.idle_backoff, Duration::from_millis(10));
            assert_eq!(config.poller.read_timeout, Duration::from_millis(500));
            Ok(())
        });
    }

    #[test]
    fn test_validation() {
        assert!(valid().validate().is_ok());

        let mut config = valid();
        config.application.log_level = "verbose".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(m)) if m.contains("verbose")));

        let mut config = valid();
        config.channels.clear();
        assert!(config.validate().is_err());

        let mut config = valid();
        config
            .channels
            .push(ChannelDescriptor::new(1, ChannelKind::Digital, 10, 10));
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains(&ChannelId(1).to_string()));

        let mut config = valid();
        config.poller.read_timeout = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.simulation.fail_every = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_malformed_file_is_load_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"[poller]\nidle_backoff = \"soon\"\n").unwrap();
        assert!(matches!(
            LoopConfig::load_from(file.path()),
            Err(ConfigError::Load(_))
        ));
    }
}
