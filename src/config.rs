//! Configuration management for Warden.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{Result, WardenError};

/// Environment variable that switches every limiter off for the process.
pub const DISABLE_ENV_VAR: &str = "DISABLE_RATE_LIMITING";

/// Prefix for environment overrides, e.g. `WARDEN__SERVER__BIND_ADDR`.
const ENV_PREFIX: &str = "WARDEN";

/// Main configuration for the Warden service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WardenConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Rate limiting configuration.
///
/// Profile policies are fixed; only process-level behaviour is configurable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Turn off enforcement for every profile
    #[serde(default)]
    pub disabled: bool,

    /// Interval between background sweeps of expired windows, in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            disabled: false,
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_sweep_interval() -> u64 {
    60
}

impl RateLimitingConfig {
    /// The sweep interval as a `Duration`.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl WardenConfig {
    /// Load configuration from a YAML file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: WardenConfig = serde_yaml::from_str(yaml)
            .map_err(|e| WardenError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from an optional YAML file layered with
    /// `WARDEN__*` environment variables, then apply `DISABLE_RATE_LIMITING`.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::new(path, config::FileFormat::Yaml).required(true),
            );
        }
        let mut config: WardenConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        if parse_flag(std::env::var(DISABLE_ENV_VAR).ok().as_deref()) {
            config.rate_limiting.disabled = true;
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.rate_limiting.sweep_interval_secs == 0 {
            return Err(WardenError::Config(
                "rate_limiting.sweep_interval_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Interpret an opt-out flag value. Only `true`/`1`/`yes` switch it on.
pub fn parse_flag(value: Option<&str>) -> bool {
    match value {
        Some(v) => matches!(v.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes"),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = WardenConfig::default();
        assert_eq!(config.server.bind_addr, "127.0.0.1:8080".parse().unwrap());
        assert!(!config.rate_limiting.disabled);
        assert_eq!(config.rate_limiting.sweep_interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_from_yaml_partial() {
        let yaml = r#"
rate_limiting:
  disabled: true
"#;
        let config = WardenConfig::from_yaml(yaml).unwrap();
        assert!(config.rate_limiting.disabled);
        assert_eq!(config.rate_limiting.sweep_interval_secs, 60);
        assert_eq!(config.server.bind_addr, default_bind_addr());
    }

    #[test]
    fn test_from_yaml_full() {
        let yaml = r#"
server:
  bind_addr: "0.0.0.0:9000"
rate_limiting:
  disabled: false
  sweep_interval_secs: 5
"#;
        let config = WardenConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.server.bind_addr.port(), 9000);
        assert_eq!(config.rate_limiting.sweep_interval(), Duration::from_secs(5));
    }

    #[test]
    fn test_zero_sweep_interval_rejected() {
        let yaml = r#"
rate_limiting:
  sweep_interval_secs: 0
"#;
        let err = WardenConfig::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, WardenError::Config(_)));
    }

    #[test]
    fn test_invalid_yaml_is_config_error() {
        let err = WardenConfig::from_yaml("server: [not, a, map]").unwrap_err();
        assert!(matches!(err, WardenError::Config(_)));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = WardenConfig::from_file("/nonexistent/warden.yaml").unwrap_err();
        assert!(matches!(err, WardenError::Io(_)));
    }

    #[test]
    fn test_load_applies_env_overrides() {
        let vars = [
            (DISABLE_ENV_VAR, "true"),
            ("WARDEN__RATE_LIMITING__SWEEP_INTERVAL_SECS", "7"),
            ("WARDEN__SERVER__BIND_ADDR", "0.0.0.0:9999"),
        ];
        let saved: Vec<_> = vars
            .iter()
            .map(|(name, _)| (*name, std::env::var(name).ok()))
            .collect();
        for (name, value) in vars {
            std::env::set_var(name, value);
        }

        let loaded = WardenConfig::load(None);

        for (name, value) in saved {
            match value {
                Some(value) => std::env::set_var(name, value),
                None => std::env::remove_var(name),
            }
        }

        let config = loaded.unwrap();
        assert!(config.rate_limiting.disabled);
        assert_eq!(config.rate_limiting.sweep_interval_secs, 7);
        assert_eq!(config.server.bind_addr.port(), 9999);
    }

    #[test]
    fn test_parse_flag() {
        assert!(parse_flag(Some("true")));
        assert!(parse_flag(Some("TRUE")));
        assert!(parse_flag(Some(" 1 ")));
        assert!(parse_flag(Some("yes")));
        assert!(!parse_flag(Some("false")));
        assert!(!parse_flag(Some("")));
        assert!(!parse_flag(None));
    }
}
