//! Agent configuration

use crate::errors::ConfigError;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::Deserialize;
use std::time::Duration;

pub const DEFAULT_GATEWAY_PORT: u16 = 1994;
pub const DEFAULT_KEEPALIVE_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_REGISTRATION_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_PROVIDER_NAME: &str = "generic";
pub const DEFAULT_POOL_NAME: &str = "external";

/// Agent configuration, immutable after validation
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Registration token from 'machine create'
    #[serde(default)]
    pub token: String,

    /// Machine ID (8 lowercase hex chars)
    #[serde(default)]
    pub machine_id: String,

    /// Pool this machine enrolls into
    #[serde(default = "default_pool_name")]
    pub pool_name: String,

    /// Gateway connection
    #[serde(default = "default_gateway_host")]
    pub gateway_host: String,
    #[serde(default = "default_gateway_port")]
    pub gateway_port: u16,
    #[serde(default = "default_gateway_scheme")]
    pub gateway_scheme: String,

    /// Provider info
    #[serde(default = "default_provider_name")]
    pub provider_name: String,

    /// Advertised reachable address (for the gateway to reach the cluster API)
    #[serde(default)]
    pub hostname: String,

    /// Cluster bearer token handed to the gateway on registration
    #[serde(default)]
    pub k3s_token: String,

    /// Seconds between keepalive ticks
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval: u64,

    /// Seconds allowed for the registration round-trip
    #[serde(default = "default_registration_timeout")]
    pub registration_timeout: u64,

    /// Agent behavior
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub once: bool,
}

fn default_pool_name() -> String {
    DEFAULT_POOL_NAME.to_string()
}

fn default_gateway_host() -> String {
    "localhost".to_string()
}

fn default_gateway_port() -> u16 {
    DEFAULT_GATEWAY_PORT
}

fn default_gateway_scheme() -> String {
    "http".to_string()
}

fn default_provider_name() -> String {
    DEFAULT_PROVIDER_NAME.to_string()
}

fn default_keepalive_interval() -> u64 {
    DEFAULT_KEEPALIVE_INTERVAL_SECS
}

fn default_registration_timeout() -> u64 {
    DEFAULT_REGISTRATION_TIMEOUT_SECS
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            machine_id: String::new(),
            pool_name: default_pool_name(),
            gateway_host: default_gateway_host(),
            gateway_port: default_gateway_port(),
            gateway_scheme: default_gateway_scheme(),
            provider_name: default_provider_name(),
            hostname: String::new(),
            k3s_token: String::new(),
            keepalive_interval: default_keepalive_interval(),
            registration_timeout: default_registration_timeout(),
            debug: false,
            dry_run: false,
            once: false,
        }
    }
}

impl AgentConfig {
    /// Load configuration from `BETA9_*` environment variables
    pub fn from_env() -> Self {
        let loaded = config::Config::builder()
            .add_source(config::Environment::with_prefix("BETA9").try_parsing(true))
            .build()
            .and_then(|c| c.try_deserialize());

        loaded.unwrap_or_default()
    }

    /// Full gateway URL for API calls
    pub fn gateway_url(&self) -> String {
        format!(
            "{}://{}:{}",
            self.gateway_scheme, self.gateway_host, self.gateway_port
        )
    }

    /// Machine registration endpoint
    pub fn register_url(&self) -> String {
        format!("{}/api/v1/machine/register", self.gateway_url())
    }

    /// Machine keepalive endpoint
    pub fn keepalive_url(&self) -> String {
        format!("{}/api/v1/machine/keepalive", self.gateway_url())
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval)
    }

    pub fn registration_timeout(&self) -> Duration {
        Duration::from_secs(self.registration_timeout)
    }

    /// Check configuration for errors
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.token.is_empty() {
            return Err(ConfigError::validation(
                "token",
                "is required (from 'machine create')",
            ));
        }
        if self.machine_id.is_empty() {
            return Err(ConfigError::validation("machine_id", "is required"));
        }
        if self.machine_id.len() != 8 {
            return Err(ConfigError::validation(
                "machine_id",
                format!(
                    "must be exactly 8 hex chars, got {} chars: {}",
                    self.machine_id.len(),
                    self.machine_id
                ),
            ));
        }
        if !is_lower_hex(&self.machine_id) {
            return Err(ConfigError::validation(
                "machine_id",
                format!(
                    "must be lowercase hex characters only, got: {}",
                    self.machine_id
                ),
            ));
        }
        if self.pool_name.is_empty() {
            return Err(ConfigError::validation("pool_name", "is required"));
        }
        if self.gateway_port == 0 {
            return Err(ConfigError::validation(
                "gateway_port",
                "must be 1-65535, got: 0",
            ));
        }
        Ok(())
    }
}

fn is_lower_hex(s: &str) -> bool {
    s.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f'))
}

/// Generate a random 8-character lowercase hex machine ID.
///
/// Falls back to a clock-derived ID if the OS entropy source fails.
pub fn generate_machine_id() -> String {
    let mut bytes = [0u8; 4];
    if OsRng.try_fill_bytes(&mut bytes).is_err() {
        let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
        bytes = (nanos as u32).to_be_bytes();
    }
    format!("{:08x}", u32::from_be_bytes(bytes))
}
