//! Configuration management for OrderChain

use crate::blockchain::{ChainSettings, GENESIS_DIFFICULTY, RETENTION_DEPTH};
use crate::error::ChainError;
use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub miner: MinerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub chain: ChainConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MinerConfig {
    /// Wallet credited with block rewards.
    #[serde(default = "default_miner_wallet")]
    pub wallet: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_genesis_difficulty")]
    pub genesis_difficulty: u32,
    /// Pause between mining rounds when the previous round produced nothing.
    #[serde(default = "default_idle_delay_ms")]
    pub idle_delay_ms: u64,
}

impl Default for MinerConfig {
    fn default() -> Self {
        Self {
            wallet: default_miner_wallet(),
            enabled: false,
            genesis_difficulty: default_genesis_difficulty(),
            idle_delay_ms: default_idle_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite file; empty or `:memory:` keeps blocks in memory only.
    #[serde(default = "default_database_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    #[serde(default = "default_retention_depth")]
    pub retention_depth: usize,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            retention_depth: default_retention_depth(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    pub fn chain_settings(&self) -> ChainSettings {
        ChainSettings {
            miner_wallet: self.miner.wallet.clone(),
            genesis_difficulty: self.miner.genesis_difficulty,
            retention_depth: self.chain.retention_depth,
        }
    }

    pub fn validate(&self) -> Result<(), ChainError> {
        if self.miner.wallet.is_empty() {
            return Err(ChainError::ConfigError("miner.wallet must be set".to_string()));
        }
        if self.miner.genesis_difficulty == 0 || self.miner.genesis_difficulty > 256 {
            return Err(ChainError::ConfigError(format!(
                "miner.genesis_difficulty must be within 1..=256, got {}",
                self.miner.genesis_difficulty
            )));
        }
        if self.chain.retention_depth < 20 {
            // Forks and retargeting look back 20 blocks.
            return Err(ChainError::ConfigError(format!(
                "chain.retention_depth must be at least 20, got {}",
                self.chain.retention_depth
            )));
        }
        Ok(())
    }
}

/// Loads `path`, falling back to defaults when the file does not exist.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ChainError> {
    let path = path.as_ref();
    let config = if path.exists() {
        let config_str = fs::read_to_string(path)?;
        parse_config(&config_str)?
    } else {
        Config::default()
    };
    config.validate()?;
    Ok(config)
}

pub fn parse_config(config_str: &str) -> Result<Config, ChainError> {
    toml::from_str(config_str).map_err(|e| ChainError::ConfigError(format!("Failed to parse config: {}", e)))
}

fn default_miner_wallet() -> String {
    "miner".to_string()
}

fn default_genesis_difficulty() -> u32 {
    GENESIS_DIFFICULTY
}

fn default_idle_delay_ms() -> u64 {
    1_000
}

fn default_database_path() -> String {
    "./data/orderchain.db".to_string()
}

fn default_retention_depth() -> usize {
    RETENTION_DEPTH
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_when_file_missing() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.miner.genesis_difficulty, 21);
        assert_eq!(config.chain.retention_depth, 39);
        assert_eq!(config.logging.level, "info");
        assert!(!config.miner.enabled);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[miner]\nwallet = \"alice\"\nenabled = true\n\n[database]\npath = \":memory:\"").unwrap();
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.miner.wallet, "alice");
        assert!(config.miner.enabled);
        assert_eq!(config.miner.idle_delay_ms, 1_000);
        assert_eq!(config.database.path, ":memory:");

        let settings = config.chain_settings();
        assert_eq!(settings.miner_wallet, "alice");
        assert_eq!(settings.retention_depth, 39);
    }

    #[test]
    fn test_rejects_invalid_values() {
        let config = parse_config("[miner]\nwallet = \"\"").unwrap();
        assert!(matches!(config.validate(), Err(ChainError::ConfigError(_))));

        let config = parse_config("[chain]\nretention_depth = 5").unwrap();
        assert!(config.validate().is_err());

        assert!(parse_config("[miner]\ngenesis_difficulty = \"hard\"").is_err());
    }
}
