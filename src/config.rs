use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::gateway::{parse_subnet, OneArm};
use crate::retry::{RetryConfig, DEFAULT_CONFLICT_ATTEMPTS, DEFAULT_PENDING_ATTEMPTS};

/// Environment variable read for the API token when none is configured
pub const DEFAULT_TOKEN_ENV: &str = "EDGELB_API_TOKEN";

const DEFAULT_PENDING_DELAY_MS: u64 = 500;

/// Default config file location: ~/.edgelb/config.yaml
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".edgelb")
        .join("config.yaml")
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Invalid config: {0}")]
    Invalid(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Where and how to reach the cloud API
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayEndpoint {
    #[serde(default)]
    pub url: String,
    /// Name of the environment variable holding the bearer token
    #[serde(default = "default_token_env")]
    pub token_env: String,
}

impl Default for GatewayEndpoint {
    fn default() -> Self {
        Self {
            url: String::new(),
            token_env: default_token_env(),
        }
    }
}

fn default_token_env() -> String {
    DEFAULT_TOKEN_ENV.to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerConfig {
    /// VDC network used to find the edge gateway
    #[serde(default)]
    pub network: String,
    /// CIDR external addresses are allocated from; empty means unrestricted
    #[serde(default)]
    pub vip_subnet: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_alias: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub one_arm: Option<OneArm>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrySettings {
    #[serde(default = "default_pending_attempts")]
    pub pending_attempts: u32,
    #[serde(default = "default_pending_delay_ms")]
    pub pending_delay_ms: u64,
    #[serde(default = "default_conflict_attempts")]
    pub conflict_attempts: u32,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            pending_attempts: DEFAULT_PENDING_ATTEMPTS,
            pending_delay_ms: DEFAULT_PENDING_DELAY_MS,
            conflict_attempts: DEFAULT_CONFLICT_ATTEMPTS,
        }
    }
}

fn default_pending_attempts() -> u32 {
    DEFAULT_PENDING_ATTEMPTS
}

fn default_pending_delay_ms() -> u64 {
    DEFAULT_PENDING_DELAY_MS
}

fn default_conflict_attempts() -> u32 {
    DEFAULT_CONFLICT_ATTEMPTS
}

/// The complete configuration file structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayEndpoint,
    #[serde(default)]
    pub load_balancer: LoadBalancerConfig,
    /// Owner tag for created resources and id of the shared record
    #[serde(default)]
    pub cluster_id: String,
    #[serde(default)]
    pub retry: RetrySettings,
}

impl Config {
    /// Check everything that can be checked without talking to the API
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.load_balancer.network.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "loadBalancer.network must be set".to_string(),
            ));
        }
        parse_subnet(&self.load_balancer.vip_subnet)
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        if let Some(arm) = self.load_balancer.one_arm {
            if arm.start_ip > arm.end_ip {
                return Err(ConfigError::Invalid(format!(
                    "loadBalancer.oneArm range {} is empty",
                    arm.range()
                )));
            }
        }
        Ok(())
    }

    /// Like [`Config::validate`], plus the API endpoint must be usable
    pub fn validate_remote(&self) -> Result<(), ConfigError> {
        self.validate()?;
        if self.gateway.url.trim().is_empty() {
            return Err(ConfigError::Invalid("gateway.url must be set".to_string()));
        }
        Ok(())
    }

    pub fn pending_retry(&self) -> RetryConfig {
        RetryConfig::with_max_attempts(self.retry.pending_attempts)
            .with_initial_delay(Duration::from_millis(self.retry.pending_delay_ms))
    }

    pub fn conflict_retry(&self) -> RetryConfig {
        RetryConfig::with_max_attempts(self.retry.conflict_attempts)
            .with_initial_delay(Duration::from_millis(self.retry.pending_delay_ms))
    }

    /// Bearer token from the configured environment variable
    pub fn api_token(&self) -> Option<String> {
        std::env::var(&self.gateway.token_env)
            .ok()
            .filter(|t| !t.is_empty())
    }

    /// Certificate alias for HTTPS listeners: the configured one, else
    /// `<clusterId>-cert`
    pub fn certificate_alias(&self) -> String {
        match self.load_balancer.certificate_alias {
            Some(ref alias) if !alias.is_empty() => alias.clone(),
            _ => format!("{}-cert", self.cluster_id),
        }
    }
}

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

/// Parse config from YAML string
pub fn parse_config(content: &str) -> Result<Config, ConfigError> {
    serde_yaml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
}

// ============================================================================
// File I/O
// ============================================================================

/// Load config from the default location
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&default_config_path())
}

pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }
    let content = std::fs::read_to_string(path)?;
    parse_config(&content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::Ipv4Addr;

    const SAMPLE: &str = r#"
gateway:
  url: https://cloud.example.com
  tokenEnv: MY_TOKEN
loadBalancer:
  network: ovdc-network-1
  vipSubnet: 10.10.0.0/24
  oneArm:
    startIp: 192.168.8.2
    endIp: 192.168.8.100
clusterId: urn:cluster:1234
retry:
  pendingAttempts: 7
"#;

    #[test]
    fn test_parse_config() {
        let config = parse_config(SAMPLE).unwrap();
        assert_eq!(config.gateway.url, "https://cloud.example.com");
        assert_eq!(config.gateway.token_env, "MY_TOKEN");
        assert_eq!(config.load_balancer.network, "ovdc-network-1");
        assert_eq!(config.load_balancer.vip_subnet, "10.10.0.0/24");
        assert_eq!(
            config.load_balancer.one_arm.unwrap().start_ip,
            Ipv4Addr::new(192, 168, 8, 2)
        );
        assert_eq!(config.retry.pending_attempts, 7);
        assert_eq!(config.retry.conflict_attempts, DEFAULT_CONFLICT_ATTEMPTS);
        assert!(config.validate_remote().is_ok());
    }

    #[test]
    fn test_defaults() {
        let config = parse_config("loadBalancer:\n  network: net\n").unwrap();
        assert_eq!(config.gateway.token_env, DEFAULT_TOKEN_ENV);
        assert_eq!(config.pending_retry().max_attempts, DEFAULT_PENDING_ATTEMPTS);
        assert!(config.load_balancer.one_arm.is_none());
        assert!(config.validate().is_ok());
        assert!(config.validate_remote().is_err());
    }

    #[test]
    fn test_certificate_alias_default() {
        let mut config = parse_config("clusterId: c1\n").unwrap();
        assert_eq!(config.certificate_alias(), "c1-cert");
        config.load_balancer.certificate_alias = Some("custom".into());
        assert_eq!(config.certificate_alias(), "custom");
    }

    #[test]
    fn test_validate_rejects_bad_subnet() {
        let config = parse_config("loadBalancer:\n  network: net\n  vipSubnet: 1.1.1.1/24\n").unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_missing_network() {
        assert!(Config::default().validate().is_err());
    }

    #[test]
    fn test_parse_error() {
        assert!(matches!(
            parse_config("loadBalancer: [unterminated"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = load_config_from(file.path()).unwrap();
        assert_eq!(config.cluster_id, "urn:cluster:1234");

        let missing = file.path().with_extension("missing");
        assert!(matches!(
            load_config_from(&missing),
            Err(ConfigError::NotFound(_))
        ));
    }

    #[test]
    fn test_default_path() {
        let path = default_config_path();
        assert!(path.ends_with(".edgelb/config.yaml"));
    }
}
