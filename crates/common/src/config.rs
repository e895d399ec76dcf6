//! Arbor server configuration file model
//!
//! The harness renders this into `config.toml` inside its data directory and
//! the server reads it back with `serve --config <path>`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::{Error, Result};

/// Top-level server configuration, one field per TOML section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub server: ListenConfig,
    pub database: DatabaseConfig,
    pub auth: AuthConfig,
    pub instance: InstanceConfig,
    #[serde(default)]
    pub bot: BotConfig,
    #[serde(default)]
    pub federation: FederationConfig,
    #[serde(default)]
    pub llm: LlmConfig,
}

/// `[server]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenConfig {
    /// Listen address including port, e.g. `127.0.0.1:8443`
    pub listen: String,

    /// PEM certificate path; empty means generate a self-signed one
    #[serde(default)]
    pub cert_path: String,

    /// PEM private key path; empty means generate a self-signed one
    #[serde(default)]
    pub key_path: String,
}

/// `[database]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Nodes database
    pub path: PathBuf,
    pub flows_path: PathBuf,
    pub metrics_path: PathBuf,
}

/// `[auth]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub token_expiry_min: i64,
}

/// `[instance]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub id: String,
    pub name: String,
}

/// `[bot]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotConfig {
    pub handle: String,
    pub enabled: bool,
    pub credit_per_day: i64,
    pub default_provider: String,
    pub default_model: String,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            handle: "arbor-bot".to_string(),
            enabled: true,
            credit_per_day: 100,
            default_provider: "anthropic".to_string(),
            default_model: "claude-sonnet".to_string(),
        }
    }
}

/// `[federation]`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FederationConfig {
    pub enabled: bool,
    #[serde(default)]
    pub public_url: String,
    #[serde(default)]
    pub peers: Vec<String>,
}

/// `[llm]`. Empty keys disable the corresponding provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub anthropic_api_key: String,
    #[serde(default)]
    pub gemini_api_key: String,
}

impl LlmConfig {
    /// True when at least one provider key is set.
    pub fn has_provider(&self) -> bool {
        !self.anthropic_api_key.is_empty() || !self.gemini_api_key.is_empty()
    }
}

impl ServerConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = self.to_toml()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    fn validate(&self) -> Result<()> {
        if self.server.listen.is_empty() {
            return Err(Error::InvalidConfig("server.listen is empty".to_string()));
        }
        if self.auth.jwt_secret.is_empty() {
            return Err(Error::InvalidConfig("auth.jwt_secret is empty".to_string()));
        }
        if self.auth.token_expiry_min <= 0 {
            return Err(Error::InvalidConfig(format!(
                "auth.token_expiry_min must be positive, got {}",
                self.auth.token_expiry_min
            )));
        }
        if self.server.cert_path.is_empty() != self.server.key_path.is_empty() {
            return Err(Error::InvalidConfig(
                "server.cert_path and server.key_path must be set together".to_string(),
            ));
        }
        Ok(())
    }
}
