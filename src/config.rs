//! Configuration for the Proscenic cloud client
//!
//! Loads configuration from a TOML file: vendor account credentials,
//! connection timing and logging.

use crate::api::Region;
use crate::connection::ConnectionConfig;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Top-level application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    pub account: AccountConfig,
    pub connection: ConnectionSettings,
    pub logging: LoggingConfig,
}

/// Vendor account credentials and region selection
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AccountConfig {
    /// Proscenic Home account name (usually an email address)
    pub username: String,
    /// Account password, hashed before it leaves the process
    pub password: String,
    /// Regional backend: `us`, `eu` or `cn`
    pub region: Region,
}

/// Socket connection timing
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnectionSettings {
    /// TCP connect timeout in seconds
    pub connect_timeout_secs: u64,

    /// Maximum silence on the telemetry socket before the connection is
    /// treated as dead and reconnected
    pub read_timeout_secs: u64,

    /// Cool-down between full reconnect cycles after both the reconnect
    /// and the token refresh path have been exercised
    pub reconnect_cooldown_secs: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log output (stdout, stderr, or file path)
    pub output: String,
}

impl ConnectionSettings {
    /// Convert to the connection manager's runtime configuration
    pub fn to_connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            read_timeout: Duration::from_secs(self.read_timeout_secs),
            reconnect_cooldown: Duration::from_secs(self.reconnect_cooldown_secs),
        }
    }
}

impl AppConfig {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            account: AccountConfig {
                username: String::new(),
                password: String::new(),
                region: Region::Us,
            },
            connection: ConnectionSettings {
                connect_timeout_secs: 10,
                read_timeout_secs: 90,
                reconnect_cooldown_secs: 60,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                output: "stdout".to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.account.region, Region::Us);
        assert_eq!(config.connection.connect_timeout_secs, 10);
        assert_eq!(config.connection.read_timeout_secs, 90);
        assert_eq!(config.connection.reconnect_cooldown_secs, 60);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_toml_serialization() {
        let config = AppConfig::default();
        let toml_string = toml::to_string_pretty(&config).unwrap();

        assert!(toml_string.contains("[account]"));
        assert!(toml_string.contains("[connection]"));
        assert!(toml_string.contains("[logging]"));
        assert!(toml_string.contains("read_timeout_secs = 90"));
    }

    #[test]
    fn test_toml_deserialization() {
        let toml_content = r#"
[account]
username = "user@example.com"
password = "hunter2"
region = "eu"

[connection]
connect_timeout_secs = 5
read_timeout_secs = 30
reconnect_cooldown_secs = 15

[logging]
level = "debug"
output = "stdout"
"#;

        let config: AppConfig = toml::from_str(toml_content).unwrap();
        assert_eq!(config.account.username, "user@example.com");
        assert_eq!(config.account.region, Region::Eu);
        assert_eq!(config.connection.read_timeout_secs, 30);

        let cc = config.connection.to_connection_config();
        assert_eq!(cc.read_timeout, Duration::from_secs(30));
    }
}
