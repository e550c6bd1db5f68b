//! Persistent config file handling
//!
//! Credentials live in a YAML file (`$HOME/.b9agent/config.yaml` by
//! default, `B9AGENT_CONFIG` overrides the path). The file carries the
//! registration token, so it is written 0600 inside a 0700 directory.

use crate::config::{
    AgentConfig, DEFAULT_GATEWAY_PORT, DEFAULT_POOL_NAME, DEFAULT_PROVIDER_NAME,
};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const CONFIG_DIR_NAME: &str = ".b9agent";
const CONFIG_FILE_NAME: &str = "config.yaml";
pub const CONFIG_PATH_ENV: &str = "B9AGENT_CONFIG";

/// On-disk config file structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigFile {
    pub gateway: GatewaySection,
    pub machine: MachineSection,
    #[serde(default)]
    pub pool: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub k3s: Option<K3sSection>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub debug: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GatewaySection {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MachineSection {
    pub id: String,
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct K3sSection {
    #[serde(default)]
    pub token: String,
}

fn is_false(v: &bool) -> bool {
    !*v
}

/// Default config directory path (`$HOME/.b9agent`)
pub fn default_config_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(CONFIG_DIR_NAME),
        None => PathBuf::from(CONFIG_DIR_NAME),
    }
}

/// Default config file path
pub fn default_config_path() -> PathBuf {
    default_config_dir().join(CONFIG_FILE_NAME)
}

/// Resolve the active config path (`B9AGENT_CONFIG` wins)
pub fn config_path() -> PathBuf {
    match std::env::var_os(CONFIG_PATH_ENV) {
        Some(path) if !path.is_empty() => PathBuf::from(path),
        _ => default_config_path(),
    }
}

/// Whether a config file exists at the active path
pub fn config_exists() -> bool {
    config_path().exists()
}

impl ConfigFile {
    /// Load from the active config path
    pub fn load() -> Result<Self> {
        Self::load_from(&config_path())
    }

    /// Load from an explicit path
    pub fn load_from(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let cfg: ConfigFile = serde_yaml::from_str(&data)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        Ok(cfg)
    }

    /// Save to the active config path with restrictive permissions
    pub fn save(&self) -> Result<()> {
        self.save_to(&config_path())
    }

    /// Save to an explicit path with restrictive permissions
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create config directory {}", dir.display()))?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))
                    .with_context(|| "failed to set config directory permissions")?;
            }
        }

        let data = serde_yaml::to_string(self).context("failed to serialize config")?;
        std::fs::write(path, data)
            .with_context(|| format!("failed to write config file {}", path.display()))?;

        // The file holds the token; enforce 0600 even on pre-existing files.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
                .context("failed to set config file permissions")?;
        }

        Ok(())
    }

    /// Convert to a runtime [`AgentConfig`], filling in defaults
    pub fn to_agent_config(&self) -> AgentConfig {
        let port = if self.gateway.port == 0 {
            DEFAULT_GATEWAY_PORT
        } else {
            self.gateway.port
        };

        let pool = if self.pool.is_empty() {
            DEFAULT_POOL_NAME.to_string()
        } else {
            self.pool.clone()
        };

        let provider = self
            .provider
            .clone()
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| DEFAULT_PROVIDER_NAME.to_string());

        AgentConfig {
            token: self.machine.token.clone(),
            machine_id: self.machine.id.clone(),
            pool_name: pool,
            gateway_host: self.gateway.host.clone(),
            gateway_port: port,
            provider_name: provider,
            hostname: self.machine.hostname.clone().unwrap_or_default(),
            k3s_token: self.k3s.clone().map(|k| k.token).unwrap_or_default(),
            debug: self.debug,
            ..AgentConfig::default()
        }
    }

    /// Build a config file from a runtime [`AgentConfig`]
    pub fn from_agent_config(cfg: &AgentConfig) -> Self {
        Self {
            gateway: GatewaySection {
                host: cfg.gateway_host.clone(),
                port: cfg.gateway_port,
            },
            machine: MachineSection {
                id: cfg.machine_id.clone(),
                token: cfg.token.clone(),
                hostname: (!cfg.hostname.is_empty()).then(|| cfg.hostname.clone()),
            },
            pool: cfg.pool_name.clone(),
            provider: Some(cfg.provider_name.clone()),
            k3s: (!cfg.k3s_token.is_empty()).then(|| K3sSection {
                token: cfg.k3s_token.clone(),
            }),
            debug: cfg.debug,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ConfigFile {
        ConfigFile {
            gateway: GatewaySection {
                host: "100.72.101.23".to_string(),
                port: 1994,
            },
            machine: MachineSection {
                id: "abcdef01".to_string(),
                token: "secret-token".to_string(),
                hostname: Some("100.72.101.24".to_string()),
            },
            pool: "external".to_string(),
            provider: Some("generic".to_string()),
            k3s: Some(K3sSection {
                token: "k3s-token".to_string(),
            }),
            debug: false,
        }
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");

        let cfg = sample();
        cfg.save_to(&path).unwrap();
        let loaded = ConfigFile::load_from(&path).unwrap();

        assert_eq!(cfg, loaded);
    }

    #[cfg(unix)]
    #[test]
    fn test_save_sets_restrictive_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.yaml");

        sample().save_to(&path).unwrap();

        let file_mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(file_mode & 0o777, 0o600);

        let dir_mode = std::fs::metadata(path.parent().unwrap())
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(dir_mode & 0o777, 0o700);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ConfigFile::load_from(&dir.path().join("nope.yaml")).is_err());
    }

    #[test]
    fn test_to_agent_config_fills_defaults() {
        let cfg = ConfigFile {
            gateway: GatewaySection {
                host: "gw".to_string(),
                port: 0,
            },
            machine: MachineSection {
                id: "abcdef01".to_string(),
                token: "t".to_string(),
                hostname: None,
            },
            pool: String::new(),
            provider: None,
            k3s: None,
            debug: true,
        };

        let agent = cfg.to_agent_config();
        assert_eq!(agent.gateway_port, 1994);
        assert_eq!(agent.pool_name, "external");
        assert_eq!(agent.provider_name, "generic");
        assert_eq!(agent.hostname, "");
        assert_eq!(agent.k3s_token, "");
        assert!(agent.debug);
    }

    #[test]
    fn test_agent_config_round_trip() {
        let cfg = sample();
        let agent = cfg.to_agent_config();
        let back = ConfigFile::from_agent_config(&agent);
        assert_eq!(cfg, back);
    }
}
