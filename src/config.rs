//! Configuration management for ReserveL

use crate::error::ReservationError;
use serde::Deserialize;
use std::fs;
use std::path::Path;

pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub settlement: SettlementConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    /// Base URL customers open confirmation links against.
    #[serde(default = "default_public_url")]
    pub public_url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            api_port: default_api_port(),
            public_url: default_public_url(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettlementMode {
    #[default]
    Disabled,
    /// In-process ledger, no network.
    Local,
    Rpc,
}

impl std::str::FromStr for SettlementMode {
    type Err = ReservationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "disabled" | "off" => Ok(SettlementMode::Disabled),
            "local" => Ok(SettlementMode::Local),
            "rpc" => Ok(SettlementMode::Rpc),
            other => Err(ReservationError::Config(format!(
                "Unknown settlement mode '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SettlementConfig {
    #[serde(default)]
    pub mode: SettlementMode,
    pub rpc_url: Option<String>,
    pub contract_id: Option<String>,
    #[serde(default = "default_network")]
    pub network: String,
    /// Hex secp256k1 secret used to sign gateway calls.
    pub signer_secret_key: Option<String>,
    /// Account receiving stablecoin payments; defaults to the signer.
    pub business_address: Option<String>,
    #[serde(default = "default_stablecoin_code")]
    pub stablecoin_code: String,
    #[serde(default = "default_loyalty_code")]
    pub loyalty_code: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            mode: SettlementMode::Disabled,
            rpc_url: None,
            contract_id: None,
            network: default_network(),
            signer_secret_key: None,
            business_address: None,
            stablecoin_code: default_stablecoin_code(),
            loyalty_code: default_loyalty_code(),
            timeout_secs: default_timeout(),
        }
    }
}

impl Config {
    /// Parse a TOML document; missing sections fall back to defaults.
    pub fn from_toml(source: &str) -> Result<Self, ReservationError> {
        toml::from_str(source)
            .map_err(|e| ReservationError::Config(format!("Invalid config: {}", e)))
    }

    /// Apply `PORT`, `DATABASE_PATH`, `PUBLIC_URL` and `SETTLEMENT_MODE`.
    pub fn apply_env_overrides(&mut self) -> Result<(), ReservationError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ReservationError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("PORT") {
            self.server.api_port = port
                .parse()
                .map_err(|_| ReservationError::Config(format!("Invalid PORT '{}'", port)))?;
        }
        if let Some(path) = lookup("DATABASE_PATH") {
            self.database.path = path;
        }
        if let Some(url) = lookup("PUBLIC_URL") {
            self.server.public_url = url;
        }
        if let Some(mode) = lookup("SETTLEMENT_MODE") {
            self.settlement.mode = mode.parse()?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ReservationError> {
        if self.database.path.is_empty() {
            return Err(ReservationError::Config(
                "database.path must be set in config.toml".to_string(),
            ));
        }
        if self.server.public_url.is_empty() {
            return Err(ReservationError::Config(
                "server.public_url must not be empty".to_string(),
            ));
        }
        if self.settlement.mode == SettlementMode::Rpc {
            let missing = [
                ("rpc_url", self.settlement.rpc_url.is_none()),
                ("contract_id", self.settlement.contract_id.is_none()),
                ("signer_secret_key", self.settlement.signer_secret_key.is_none()),
            ];
            if let Some((field, _)) = missing.iter().find(|(_, absent)| *absent) {
                return Err(ReservationError::Config(format!(
                    "settlement.{} must be set when settlement.mode = \"rpc\"",
                    field
                )));
            }
        }
        Ok(())
    }
}

/// Load `path` (defaults when absent), apply environment overrides, validate.
pub fn load_config_from(path: impl AsRef<Path>) -> Result<Config, ReservationError> {
    let path = path.as_ref();
    let mut config = if path.exists() {
        let source = fs::read_to_string(path)?;
        Config::from_toml(&source)?
    } else {
        tracing::info!(path = %path.display(), "config file not found, using defaults");
        Config::default()
    };
    config.apply_env_overrides()?;
    config.validate()?;
    Ok(config)
}

pub fn load_config() -> Result<Config, ReservationError> {
    load_config_from(DEFAULT_CONFIG_PATH)
}

fn default_api_port() -> u16 {
    3000
}

fn default_public_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_db_path() -> String {
    "./data/reservations.db".to_string()
}

fn default_network() -> String {
    "testnet".to_string()
}

fn default_stablecoin_code() -> String {
    "USDC".to_string()
}

fn default_loyalty_code() -> String {
    "LOYALTY".to_string()
}

fn default_timeout() -> u64 {
    30
}
