//! Bridge configuration.
//!
//! Loaded from one TOML file at startup. Every optional field has a
//! serde default; unknown keys are rejected so a typo fails the start
//! instead of silently running with defaults.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no enabled accounts configured")]
    NoAccounts,
    #[error("account {0} has no usable email address")]
    BadEmail(String),
    #[error("account {0} has an empty password")]
    EmptyPassword(String),
    #[error("reconnect_delay_min must be >= 1 and <= reconnect_delay_max")]
    BadReconnectBounds,
    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),
    #[error("output_freshness_window ({window}s) must exceed device_poll_interval ({poll}s)")]
    FreshnessWindowTooShort { window: u64, poll: u64 },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub accounts: Vec<AccountConfig>,
    pub mosquitto: MosquittoConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub cloud: CloudConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AccountConfig {
    pub email: String,
    pub password: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MosquittoConfig {
    #[serde(default = "MosquittoConfig::default_host")]
    pub host: String,
    #[serde(default = "MosquittoConfig::default_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "MosquittoConfig::default_client_id")]
    pub client_id: String,
}

impl MosquittoConfig {
    fn default_host() -> String {
        "localhost".to_string()
    }

    fn default_port() -> u16 {
        1883
    }

    fn default_client_id() -> String {
        "fossibot-bridge".to_string()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    #[serde(default)]
    pub log_level: LogLevel,
    /// Accepted for compatibility; PID handling is the service
    /// supervisor's job.
    #[serde(default)]
    pub pid_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn filter(self) -> log::LevelFilter {
        match self {
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Warning => log::LevelFilter::Warn,
            LogLevel::Error => log::LevelFilter::Error,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BridgeConfig {
    pub status_publish_interval: u64,
    pub device_poll_interval: u64,
    pub reconnect_delay_min: u64,
    pub reconnect_delay_max: u64,
    /// Seconds a command-response output bitfield outranks poll data.
    /// Empirical; must stay above the poll interval.
    pub output_freshness_window: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        BridgeConfig {
            status_publish_interval: 60,
            device_poll_interval: 30,
            reconnect_delay_min: 5,
            reconnect_delay_max: 60,
            output_freshness_window: 35,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CacheConfig {
    pub directory: PathBuf,
    pub token_ttl_safety_margin: u64,
    pub max_token_ttl: u64,
    pub device_list_ttl: u64,
    pub device_refresh_interval: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            directory: PathBuf::from("/var/lib/fossibot-bridge"),
            token_ttl_safety_margin: 300,
            max_token_ttl: 86_400,
            device_list_ttl: 86_400,
            device_refresh_interval: 86_400,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CloudConfig {
    /// Extra root certificate (PEM) for the cloud MQTT endpoint.
    pub ca_file: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Config> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&raw)
            .with_context(|| format!("unable to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let enabled: Vec<_> = self.enabled_accounts().collect();
        if enabled.is_empty() {
            return Err(ConfigError::NoAccounts);
        }
        for account in enabled {
            if account.email.is_empty() || !account.email.contains('@') {
                return Err(ConfigError::BadEmail(account.email.clone()));
            }
            if account.password.is_empty() {
                return Err(ConfigError::EmptyPassword(account.email.clone()));
            }
        }

        let bridge = &self.bridge;
        if bridge.reconnect_delay_min == 0
            || bridge.reconnect_delay_min > bridge.reconnect_delay_max
        {
            return Err(ConfigError::BadReconnectBounds);
        }
        if bridge.status_publish_interval == 0 {
            return Err(ConfigError::ZeroInterval("status_publish_interval"));
        }
        if bridge.device_poll_interval == 0 {
            return Err(ConfigError::ZeroInterval("device_poll_interval"));
        }
        if bridge.output_freshness_window <= bridge.device_poll_interval {
            return Err(ConfigError::FreshnessWindowTooShort {
                window: bridge.output_freshness_window,
                poll: bridge.device_poll_interval,
            });
        }
        if self.cache.device_refresh_interval == 0 {
            return Err(ConfigError::ZeroInterval("device_refresh_interval"));
        }
        Ok(())
    }

    pub fn enabled_accounts(&self) -> impl Iterator<Item = &AccountConfig> {
        self.accounts.iter().filter(|a| a.enabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [[accounts]]
        email = "john@example.com"
        password = "secret"

        [mosquitto]
        host = "127.0.0.1"
    "#;

    #[test]
    fn minimal_config_gets_the_documented_defaults() {
        let config: Config = toml::from_str(MINIMAL).unwrap();
        config.validate().unwrap();
        assert!(config.accounts[0].enabled);
        assert_eq!(config.mosquitto.port, 1883);
        assert_eq!(config.mosquitto.client_id, "fossibot-bridge");
        assert_eq!(config.bridge.status_publish_interval, 60);
        assert_eq!(config.bridge.device_poll_interval, 30);
        assert_eq!(config.bridge.reconnect_delay_min, 5);
        assert_eq!(config.bridge.reconnect_delay_max, 60);
        assert_eq!(config.bridge.output_freshness_window, 35);
        assert_eq!(config.cache.token_ttl_safety_margin, 300);
        assert_eq!(config.cache.max_token_ttl, 86_400);
        assert_eq!(config.cache.device_list_ttl, 86_400);
        assert_eq!(config.daemon.log_level, LogLevel::Info);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let raw = format!("{MINIMAL}\n[bridge]\npol_interval = 10\n");
        assert!(toml::from_str::<Config>(&raw).is_err());
    }

    #[test]
    fn disabled_accounts_do_not_satisfy_validation() {
        let raw = r#"
            [[accounts]]
            email = "john@example.com"
            password = "secret"
            enabled = false

            [mosquitto]
        "#;
        let config: Config = toml::from_str(raw).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::NoAccounts)));
    }

    #[test]
    fn freshness_window_must_exceed_the_poll_interval() {
        let raw = format!(
            "{MINIMAL}\n[bridge]\ndevice_poll_interval = 40\noutput_freshness_window = 35\n"
        );
        let config: Config = toml::from_str(&raw).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::FreshnessWindowTooShort { .. })
        ));
    }

    #[test]
    fn reconnect_bounds_are_checked() {
        let raw = format!(
            "{MINIMAL}\n[bridge]\nreconnect_delay_min = 90\nreconnect_delay_max = 60\n"
        );
        let config: Config = toml::from_str(&raw).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::BadReconnectBounds)
        ));
    }

    #[test]
    fn malformed_email_is_fatal() {
        let raw = r#"
            [[accounts]]
            email = "not-an-email"
            password = "secret"

            [mosquitto]
        "#;
        let config: Config = toml::from_str(raw).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::BadEmail(_))));
    }

    #[test]
    fn log_levels_map_to_filters() {
        assert_eq!(LogLevel::Warning.filter(), log::LevelFilter::Warn);
        let config: Config = toml::from_str(&format!(
            "{MINIMAL}\n[daemon]\nlog_level = \"debug\"\n"
        ))
        .unwrap();
        assert_eq!(config.daemon.log_level, LogLevel::Debug);
    }
}
