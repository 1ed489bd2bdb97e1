//! Connector configuration
//!
//! Loaded from TOML the same way for the CLI and for embedding hosts. Only values are
//! modelled here; deciding what to do with them is up to the provider.

use crate::caching::{CachingConfiguration, CachingStrategy};
use crate::support::ProtocolVersion;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::path::Path;
use thiserror::Error;

/// Complete connector configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConnectorConfig {
    #[serde(default)]
    pub connection: ConnectionSection,
    #[serde(default)]
    pub caching: CachingSection,
}

/// Broker identity and protocol selection
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConnectionSection {
    /// Protocol generation spoken by the configured factory
    #[serde(default)]
    pub protocol_version: ProtocolVersion,
    pub username: Option<String>,
    /// Inline password; prefer `password_env`
    pub password: Option<String>,
    /// Environment variable holding the password
    pub password_env: Option<String>,
    /// Client identifier applied to created connections
    pub client_id: Option<String>,
}

/// Caching strategy selection
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CachingMode {
    #[default]
    Default,
    None,
}

/// Caching strategy and its tunables
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CachingSection {
    #[serde(default)]
    pub strategy: CachingMode,
    /// Number of sessions to cache; omitted means unbounded
    pub session_cache_size: Option<NonZeroUsize>,
    #[serde(default = "default_true")]
    pub cache_producers: bool,
    #[serde(default = "default_true")]
    pub cache_consumers: bool,
}

fn default_true() -> bool {
    true
}

impl Default for CachingSection {
    fn default() -> Self {
        Self {
            strategy: CachingMode::Default,
            session_cache_size: None,
            cache_producers: true,
            cache_consumers: true,
        }
    }
}

impl CachingSection {
    /// Build the strategy this section describes
    pub fn strategy(&self) -> CachingStrategy {
        match self.strategy {
            CachingMode::None => CachingStrategy::None,
            CachingMode::Default => {
                let defaults = CachingConfiguration::default();
                CachingStrategy::Default(CachingConfiguration {
                    session_cache_size: self
                        .session_cache_size
                        .unwrap_or(defaults.session_cache_size),
                    cache_producers: self.cache_producers,
                    cache_consumers: self.cache_consumers,
                })
            }
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ConnectorConfig {
    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: ConnectorConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let connection = &self.connection;

        if connection.password.is_some() && connection.password_env.is_some() {
            return Err(ConfigError::InvalidConfig(
                "password and password_env are mutually exclusive".to_string(),
            ));
        }

        if let Some(client_id) = &connection.client_id {
            if is_blank(Some(client_id)) {
                return Err(ConfigError::InvalidConfig(
                    "client_id must not be blank when present".to_string(),
                ));
            }
        }

        Ok(())
    }

    pub fn username(&self) -> Option<&str> {
        self.connection.username.as_deref()
    }

    /// Resolve the password, reading `password_env` at call time
    pub fn password(&self) -> Result<Option<String>, ConfigError> {
        if let Some(password) = &self.connection.password {
            return Ok(Some(password.clone()));
        }
        match &self.connection.password_env {
            Some(name) => std::env::var(name)
                .map(Some)
                .map_err(|_| ConfigError::EnvVarNotFound(name.clone())),
            None => Ok(None),
        }
    }

    pub fn client_id(&self) -> Option<&str> {
        self.connection.client_id.as_deref()
    }

    /// Copy of the configuration safe to print
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.connection.password.is_some() {
            copy.connection.password = Some("***".to_string());
        }
        copy
    }
}

/// True for `None`, empty and whitespace-only strings
pub fn is_blank(value: Option<&str>) -> bool {
    value.map_or(true, |v| v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_config() {
        let toml_content = r#"
[connection]
protocol_version = "2.0"
username = "app"
password = "secret"
client_id = "orders-connector"

[caching]
strategy = "default"
session_cache_size = 10
cache_producers = false
"#;

        let config = ConnectorConfig::from_toml_str(toml_content).unwrap();
        assert_eq!(config.connection.protocol_version, ProtocolVersion::V20);
        assert_eq!(config.username(), Some("app"));
        assert_eq!(config.password().unwrap().as_deref(), Some("secret"));
        assert_eq!(config.client_id(), Some("orders-connector"));
        assert_eq!(config.caching.session_cache_size, NonZeroUsize::new(10));
        assert!(!config.caching.cache_producers);
        assert!(config.caching.cache_consumers);
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = ConnectorConfig::from_toml_str("").unwrap();
        assert_eq!(config.connection.protocol_version, ProtocolVersion::V11);
        assert_eq!(config.caching.strategy, CachingMode::Default);
        assert_eq!(config.caching.strategy(), CachingStrategy::default());
    }

    #[test]
    fn test_zero_cache_size_rejected() {
        let result = ConnectorConfig::from_toml_str("[caching]\nsession_cache_size = 0\n");
        assert!(matches!(result, Err(ConfigError::TomlParse(_))));
    }

    #[test]
    fn test_none_strategy() {
        let config = ConnectorConfig::from_toml_str("[caching]\nstrategy = \"none\"\n").unwrap();
        assert_eq!(config.caching.strategy(), CachingStrategy::None);
    }

    #[test]
    fn test_password_and_env_are_exclusive() {
        let toml_content = r#"
[connection]
password = "a"
password_env = "B"
"#;
        let result = ConnectorConfig::from_toml_str(toml_content);
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_blank_client_id_rejected() {
        let result = ConnectorConfig::from_toml_str("[connection]\nclient_id = \"  \"\n");
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_missing_password_env_var() {
        let toml_content = r#"
[connection]
password_env = "BROKERPOOL_TEST_PASSWORD_THAT_IS_NOT_SET"
"#;
        let config = ConnectorConfig::from_toml_str(toml_content).unwrap();
        assert!(matches!(
            config.password(),
            Err(ConfigError::EnvVarNotFound(_))
        ));
    }

    #[test]
    fn test_redacted_hides_password() {
        let config =
            ConnectorConfig::from_toml_str("[connection]\nusername = \"u\"\npassword = \"p\"\n")
                .unwrap();
        let redacted = config.redacted();
        assert_eq!(redacted.connection.password.as_deref(), Some("***"));
        assert_eq!(redacted.connection.username.as_deref(), Some("u"));
    }

    #[test]
    fn test_is_blank() {
        assert!(is_blank(None));
        assert!(is_blank(Some("")));
        assert!(is_blank(Some("   ")));
        assert!(!is_blank(Some("user")));
    }
}
