//! Configuration Loader
//!
//! Loads and validates the application config and instance definitions from TOML.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::strategy::InstanceConfig;

/// Main configuration structure matching config.toml
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineSection,
    pub solana: SolanaSection,
    #[serde(default)]
    pub jupiter: JupiterSection,
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub logging: LoggingSection,
    #[serde(default)]
    pub paper: PaperSection,
}

/// Engine-wide scheduling and service-factory settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    /// How often idle service containers are swept
    pub sweep_interval_secs: u64,
    /// Idle time after which a service container is evicted
    pub idle_threshold_secs: u64,
    /// Instance count that triggers a health warning
    pub max_instances_warning: usize,
    /// Idle time after which a container counts as stale in health reports
    pub stale_after_secs: u64,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 300,
            idle_threshold_secs: 3600,
            max_instances_warning: 50,
            stale_after_secs: 1800,
        }
    }
}

/// Solana RPC configuration section
#[derive(Debug, Clone, Deserialize)]
pub struct SolanaSection {
    /// RPC endpoint (use private RPC for production)
    pub rpc_url: String,
    /// Commitment level: "processed", "confirmed", "finalized"
    #[serde(default = "default_commitment")]
    pub commitment: String,
    /// Wallet keypair path (NEVER commit this file!)
    pub keypair_path: String,
}

fn default_commitment() -> String {
    "confirmed".to_string()
}

impl SolanaSection {
    /// Get RPC URL with environment variable override
    /// Checks SOLANA_RPC_URL env var first, falls back to config value
    pub fn get_rpc_url(&self) -> String {
        std::env::var("SOLANA_RPC_URL").unwrap_or_else(|_| self.rpc_url.clone())
    }

    /// Get keypair path with environment variable override, `~` expanded
    pub fn get_keypair_path(&self) -> PathBuf {
        let raw = std::env::var("SOLANA_KEYPAIR_PATH").unwrap_or_else(|_| self.keypair_path.clone());
        PathBuf::from(shellexpand::tilde(&raw).into_owned())
    }
}

/// Jupiter API configuration section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct JupiterSection {
    /// Jupiter swap API base URL
    pub api_url: String,
    /// Optional API key for higher rate limits
    pub api_key: Option<String>,
    /// Restrict intermediate tokens to high-liquidity paths
    pub restrict_intermediate_tokens: bool,
    /// Priority fee mode: "auto", "high", "veryHigh"
    pub priority_level: String,
    /// Maximum priority fee in lamports
    pub max_priority_fee_lamports: u64,
    /// Use dynamic compute unit limits
    pub dynamic_compute_units: bool,
}

impl Default for JupiterSection {
    fn default() -> Self {
        Self {
            api_url: "https://lite-api.jup.ag/swap/v1".to_string(),
            api_key: None,
            restrict_intermediate_tokens: true,
            priority_level: "high".to_string(),
            max_priority_fee_lamports: 5_000_000,
            dynamic_compute_units: true,
        }
    }
}

impl JupiterSection {
    /// Get API key with environment variable fallback
    /// Checks JUPITER_API_KEY env var if config value is empty/None
    pub fn get_api_key(&self) -> Option<String> {
        if let Some(ref key) = self.api_key {
            if !key.is_empty() {
                return Some(key.clone());
            }
        }
        std::env::var("JUPITER_API_KEY").ok()
    }
}

/// Instance persistence
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    /// Directory holding one JSON file per instance
    pub data_dir: String,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            data_dir: "data/instances".to_string(),
        }
    }
}

impl StorageSection {
    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.data_dir).into_owned())
    }
}

/// Logging configuration section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Log level: "trace", "debug", "info", "warn", "error"
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Simulated pool used by `run --paper`
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PaperSection {
    /// Starting price of token X in token Y
    pub initial_price: f64,
    /// Bin step in basis points
    pub bin_step: u16,
    /// Per-tick price volatility in basis points
    pub volatility_bps: f64,
    /// Fee accrued per read, in basis points of position value
    pub fee_rate_bps: f64,
    /// Random walk seed
    pub seed: u64,
    /// Starting token Y balance credited to the wallet (UI units)
    pub starting_balance: f64,
}

impl Default for PaperSection {
    fn default() -> Self {
        Self {
            initial_price: 150.0,
            bin_step: 10,
            volatility_bps: 15.0,
            fee_rate_bps: 0.5,
            seed: 42,
            starting_balance: 1_000.0,
        }
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Validation failed: {0}")]
    ValidationError(String),
}

/// Load configuration from a TOML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let config: Config = toml::from_str(&content)?;
    config.validate()?;
    Ok(config)
}

/// Load one instance definition (`type = "chain_position"` plus its fields)
pub fn load_instance_config<P: AsRef<Path>>(path: P) -> Result<InstanceConfig, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let config: InstanceConfig = toml::from_str(&content)?;
    config
        .validate()
        .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
    Ok(config)
}

impl Config {
    /// Validate all configuration parameters
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.sweep_interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "sweep_interval_secs must be > 0".to_string(),
            ));
        }

        if self.engine.idle_threshold_secs < self.engine.sweep_interval_secs {
            return Err(ConfigError::ValidationError(format!(
                "idle_threshold_secs ({}) must be >= sweep_interval_secs ({})",
                self.engine.idle_threshold_secs, self.engine.sweep_interval_secs
            )));
        }

        if self.solana.rpc_url.is_empty() {
            return Err(ConfigError::ValidationError(
                "rpc_url cannot be empty".to_string(),
            ));
        }

        if self.solana.keypair_path.is_empty() {
            return Err(ConfigError::ValidationError(
                "keypair_path cannot be empty".to_string(),
            ));
        }

        if !["processed", "confirmed", "finalized"].contains(&self.solana.commitment.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "commitment must be processed, confirmed or finalized, got {}",
                self.solana.commitment
            )));
        }

        if self.jupiter.api_url.is_empty() {
            return Err(ConfigError::ValidationError(
                "api_url cannot be empty".to_string(),
            ));
        }

        if self.storage.data_dir.is_empty() {
            return Err(ConfigError::ValidationError(
                "data_dir cannot be empty".to_string(),
            ));
        }

        if self.paper.initial_price <= 0.0 {
            return Err(ConfigError::ValidationError(format!(
                "paper.initial_price must be > 0, got {}",
                self.paper.initial_price
            )));
        }

        if self.paper.bin_step == 0 {
            return Err(ConfigError::ValidationError(
                "paper.bin_step must be > 0".to_string(),
            ));
        }

        if self.paper.volatility_bps <= 0.0 || self.paper.fee_rate_bps < 0.0 {
            return Err(ConfigError::ValidationError(
                "paper.volatility_bps must be > 0 and paper.fee_rate_bps >= 0".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_valid_config() -> String {
        r#"
[engine]
sweep_interval_secs = 60
idle_threshold_secs = 600

[solana]
rpc_url = "https://api.mainnet-beta.solana.com"
commitment = "confirmed"
keypair_path = "~/.config/solana/id.json"

[jupiter]
api_url = "https://lite-api.jup.ag/swap/v1"
priority_level = "high"

[storage]
data_dir = "data/instances"

[logging]
level = "debug"

[paper]
initial_price = 25.0
seed = 7
"#
        .to_string()
    }

    fn write(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_valid_config() {
        let file = write(&create_valid_config());
        let config = load_config(file.path()).unwrap();

        assert_eq!(config.engine.sweep_interval_secs, 60);
        assert_eq!(config.engine.max_instances_warning, 50);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.paper.initial_price, 25.0);
        assert_eq!(config.paper.bin_step, 10);
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let file = write(
            r#"
[solana]
rpc_url = "http://localhost:8899"
keypair_path = "id.json"
"#,
        );
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.solana.commitment, "confirmed");
        assert_eq!(config.storage.data_dir, "data/instances");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_load_missing_file() {
        let result = load_config("/nonexistent/path/config.toml");
        assert!(matches!(result.unwrap_err(), ConfigError::IoError(_)));
    }

    #[test]
    fn test_invalid_commitment() {
        let file = write(&create_valid_config().replace("\"confirmed\"", "\"eventually\""));
        assert!(matches!(
            load_config(file.path()).unwrap_err(),
            ConfigError::ValidationError(_)
        ));
    }

    #[test]
    fn test_idle_threshold_below_sweep_interval() {
        let file = write(&create_valid_config().replace("idle_threshold_secs = 600", "idle_threshold_secs = 10"));
        assert!(matches!(
            load_config(file.path()).unwrap_err(),
            ConfigError::ValidationError(_)
        ));
    }

    #[test]
    fn test_load_instance_config() {
        let file = write(
            r#"
type = "chain_position"
pool_address = "Pool111"
position_amount = "25"
bin_range = 40
"#,
        );
        let config = load_instance_config(file.path()).unwrap();
        let cp = config.as_chain_position().unwrap();
        assert_eq!(cp.bin_range, 40);
        assert_eq!(cp.out_of_range_timeout_secs, 300);
    }

    #[test]
    fn test_instance_config_validation() {
        let file = write(
            r#"
type = "chain_position"
pool_address = "Pool111"
bin_range = 90
"#,
        );
        assert!(matches!(
            load_instance_config(file.path()).unwrap_err(),
            ConfigError::ValidationError(_)
        ));
    }
}
