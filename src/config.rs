use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::time::Duration;
use thiserror::Error;

use crate::supervisor::SupervisorSettings;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server_host: String,
    pub server_port: u16,
    pub database_path: String,
    pub front_end_url: String,
    pub log_level: String,

    pub mqtt_max_reconnect_attempts: u32,
    pub mqtt_reconnect_interval_ms: u64,
    pub mqtt_reconnect_delay_ms: u64,
    pub mqtt_fallback_delay_ms: u64,
    pub mqtt_keep_alive_secs: u64,
    pub mqtt_connect_timeout_ms: u64,
    pub mqtt_ack_timeout_ms: u64,

    pub store_retry_delay_ms: u64,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Environment variable {0} is missing or invalid.")]
    MissingOrInvalid(String),
    #[error("Parsing error: {0}")]
    ParsingError(String),
}

impl Config {
    /// Validate timeout values and other critical configurations.
    fn validate_timeouts(&self) -> Result<(), ConfigError> {
        const MIN_TIMEOUT: u64 = 100;
        const MAX_TIMEOUT: u64 = 1_000_000;

        let timeouts = [
            ("MQTT_RECONNECT_INTERVAL_MS", self.mqtt_reconnect_interval_ms),
            ("MQTT_RECONNECT_DELAY_MS", self.mqtt_reconnect_delay_ms),
            ("MQTT_FALLBACK_DELAY_MS", self.mqtt_fallback_delay_ms),
            ("MQTT_CONNECT_TIMEOUT_MS", self.mqtt_connect_timeout_ms),
            ("MQTT_ACK_TIMEOUT_MS", self.mqtt_ack_timeout_ms),
            ("STORE_RETRY_DELAY_MS", self.store_retry_delay_ms),
        ];

        for (name, value) in timeouts {
            if !(MIN_TIMEOUT..=MAX_TIMEOUT).contains(&value) {
                return Err(ConfigError::ParsingError(format!(
                    "{} must be between {} and {} ms",
                    name, MIN_TIMEOUT, MAX_TIMEOUT
                )));
            }
        }

        if self.mqtt_max_reconnect_attempts == 0 {
            return Err(ConfigError::ParsingError(
                "MQTT_MAX_RECONNECT_ATTEMPTS must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv().ok(); // Load environment variables from .env file

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| lookup(key).ok_or_else(|| ConfigError::MissingOrInvalid(key.to_string()));
        let with_default = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let number = |key: &str, default: &str| {
            with_default(key, default)
                .parse::<u64>()
                .map_err(|_| ConfigError::ParsingError(format!("{} must be a valid number", key)))
        };

        let server_port = required("SERVER_PORT")?
            .parse::<u16>()
            .map_err(|_| ConfigError::ParsingError("SERVER_PORT must be a valid number".to_string()))?;
        if !(3000..=6000).contains(&server_port) {
            return Err(ConfigError::ParsingError(
                "SERVER_PORT must be between 3000 and 6000".to_string(),
            ));
        }

        let front_end_url = required("FRONT_END_URL")?;
        if !(front_end_url.starts_with("http://") || front_end_url.starts_with("https://")) {
            return Err(ConfigError::MissingOrInvalid("FRONT_END_URL".to_string()));
        }

        let config = Self {
            server_host: with_default("SERVER_HOST", "0.0.0.0"),
            server_port,
            database_path: with_default("DATABASE_PATH", "iot_monitor.db"),
            front_end_url: front_end_url.trim_end_matches('/').to_string(),
            log_level: with_default("LOG_LEVEL", "info"),

            mqtt_max_reconnect_attempts: with_default("MQTT_MAX_RECONNECT_ATTEMPTS", "10")
                .parse::<u32>()
                .map_err(|_| {
                    ConfigError::ParsingError("MQTT_MAX_RECONNECT_ATTEMPTS must be an integer".to_string())
                })?,
            mqtt_reconnect_interval_ms: number("MQTT_RECONNECT_INTERVAL_MS", "10000")?,
            mqtt_reconnect_delay_ms: number("MQTT_RECONNECT_DELAY_MS", "10000")?,
            mqtt_fallback_delay_ms: number("MQTT_FALLBACK_DELAY_MS", "2000")?,
            mqtt_keep_alive_secs: number("MQTT_KEEP_ALIVE_SECS", "60")?,
            mqtt_connect_timeout_ms: number("MQTT_CONNECT_TIMEOUT_MS", "10000")?,
            mqtt_ack_timeout_ms: number("MQTT_ACK_TIMEOUT_MS", "10000")?,

            store_retry_delay_ms: number("STORE_RETRY_DELAY_MS", "5000")?,
        };

        // Validate timeouts after constructing the configuration
        config.validate_timeouts()?;

        Ok(config)
    }

    pub fn supervisor_settings(&self) -> SupervisorSettings {
        SupervisorSettings {
            max_reconnect_attempts: self.mqtt_max_reconnect_attempts,
            reconnect_interval: Duration::from_millis(self.mqtt_reconnect_interval_ms),
            reconnect_delay: Duration::from_millis(self.mqtt_reconnect_delay_ms),
            fallback_delay: Duration::from_millis(self.mqtt_fallback_delay_ms),
            keep_alive: Duration::from_secs(self.mqtt_keep_alive_secs),
            connect_timeout: Duration::from_millis(self.mqtt_connect_timeout_ms),
            ack_timeout: Duration::from_millis(self.mqtt_ack_timeout_ms),
            store_retry_delay: self.store_retry_delay(),
        }
    }

    pub fn store_retry_delay(&self) -> Duration {
        Duration::from_millis(self.store_retry_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_reference_timings() {
        let config = Config::from_lookup(lookup(&[
            ("SERVER_PORT", "3333"),
            ("FRONT_END_URL", "http://localhost:3000/"),
        ]))
        .unwrap();

        assert_eq!(config.front_end_url, "http://localhost:3000");
        let settings = config.supervisor_settings();
        assert_eq!(settings.max_reconnect_attempts, 10);
        assert_eq!(settings.reconnect_interval, Duration::from_secs(10));
        assert_eq!(settings.reconnect_delay, Duration::from_secs(10));
        assert_eq!(settings.fallback_delay, Duration::from_secs(2));
        assert_eq!(settings.keep_alive, Duration::from_secs(60));
        assert_eq!(settings.store_retry_delay, Duration::from_secs(5));
    }

    #[test]
    fn missing_sink_url_is_rejected() {
        let err = Config::from_lookup(lookup(&[("SERVER_PORT", "3333")])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingOrInvalid(key) if key == "FRONT_END_URL"));
    }

    #[test]
    fn server_port_outside_range_is_rejected() {
        let err = Config::from_lookup(lookup(&[
            ("SERVER_PORT", "8080"),
            ("FRONT_END_URL", "http://localhost:3000"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::ParsingError(_)));
    }

    #[test]
    fn too_short_interval_fails_validation() {
        let err = Config::from_lookup(lookup(&[
            ("SERVER_PORT", "3333"),
            ("FRONT_END_URL", "http://localhost:3000"),
            ("MQTT_RECONNECT_INTERVAL_MS", "5"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("MQTT_RECONNECT_INTERVAL_MS"));
    }
}
