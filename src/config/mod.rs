//! Service configuration.
//!
//! Loaded from YAML files and environment variables into a single
//! `DriplineConfig`, then validated into the hub's runtime settings.

use std::time::Duration;

use serde::Deserialize;

use crate::bus::{DEFAULT_ALERTS_EXCHANGE, DEFAULT_REQUESTS_EXCHANGE};
use crate::codec::DEFAULT_MAX_PAYLOAD_SIZE;
use crate::hub::{HubConfig, DEFAULT_BROADCAST_KEY, DEFAULT_HEARTBEAT_ROUTING_KEY};
use crate::routing::RoutePolicy;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "dripline.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "DRIPLINE_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "DRIPLINE";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "DRIPLINE_LOG";

/// Errors loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Options recognized by a Dripline service.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DriplineConfig {
    /// Service identity. Names the service queue and heartbeat key.
    pub service_name: String,
    pub broker_address: String,
    pub broker_port: u16,
    /// Path to the broker credentials file. Carried for front-ends; the
    /// library does not read it.
    pub auth_file_path: Option<String>,
    pub broker_username: Option<String>,
    pub broker_password: Option<String>,
    pub requests_exchange: String,
    pub alerts_exchange: String,
    pub heartbeat_enabled: bool,
    pub heartbeat_interval_seconds: u64,
    pub heartbeat_routing_key: String,
    pub broadcast_key: String,
    pub max_payload_size_bytes: usize,
    /// Default wait for a reply.
    pub receive_timeout_seconds: u64,
    /// Idle time after which an incomplete chunked message is dropped.
    pub message_wait_ms: u64,
    /// Run on the in-process bus instead of a broker.
    pub offline_mode: bool,
    pub route_policy: RoutePolicy,
}

impl Default for DriplineConfig {
    fn default() -> Self {
        Self {
            service_name: "dripline".to_string(),
            broker_address: "localhost".to_string(),
            broker_port: 5672,
            auth_file_path: None,
            broker_username: None,
            broker_password: None,
            requests_exchange: DEFAULT_REQUESTS_EXCHANGE.to_string(),
            alerts_exchange: DEFAULT_ALERTS_EXCHANGE.to_string(),
            heartbeat_enabled: true,
            heartbeat_interval_seconds: 60,
            heartbeat_routing_key: DEFAULT_HEARTBEAT_ROUTING_KEY.to_string(),
            broadcast_key: DEFAULT_BROADCAST_KEY.to_string(),
            max_payload_size_bytes: DEFAULT_MAX_PAYLOAD_SIZE,
            receive_timeout_seconds: 10,
            message_wait_ms: 1000,
            offline_mode: false,
            route_policy: RoutePolicy::default(),
        }
    }
}

impl DriplineConfig {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `dripline.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix and `__`
    ///    separator, e.g. `DRIPLINE__BROKER_PORT=5673`
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// AMQP URL for the configured broker.
    pub fn amqp_url(&self) -> String {
        match (&self.broker_username, &self.broker_password) {
            (Some(user), Some(password)) => format!(
                "amqp://{}:{}@{}:{}",
                user, password, self.broker_address, self.broker_port
            ),
            (Some(user), None) => {
                format!("amqp://{}@{}:{}", user, self.broker_address, self.broker_port)
            }
            _ => format!("amqp://{}:{}", self.broker_address, self.broker_port),
        }
    }

    /// Validate into the hub's runtime settings.
    pub fn hub_config(&self) -> Result<HubConfig, ConfigError> {
        if self.heartbeat_enabled && self.heartbeat_interval_seconds == 0 {
            return Err(ConfigError::Invalid(
                "heartbeat_interval_seconds must be greater than zero".to_string(),
            ));
        }
        if self.receive_timeout_seconds == 0 {
            return Err(ConfigError::Invalid(
                "receive_timeout_seconds must be greater than zero".to_string(),
            ));
        }

        let config = HubConfig {
            service_name: self.service_name.clone(),
            heartbeat_interval: self
                .heartbeat_enabled
                .then(|| Duration::from_secs(self.heartbeat_interval_seconds)),
            heartbeat_routing_key: self.heartbeat_routing_key.clone(),
            broadcast_key: self.broadcast_key.clone(),
            max_payload_size: self.max_payload_size_bytes,
            request_timeout: Duration::from_secs(self.receive_timeout_seconds),
            chunk_idle_timeout: Duration::from_millis(self.message_wait_ms),
            route_policy: self.route_policy,
        };
        config
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Ok(config)
    }
}
