//! Configuration Module
//!
//! Loads and validates configuration from TOML files.

pub mod loader;

pub use loader::{
    load_config, load_instance_config, Config, ConfigError, EngineSection, JupiterSection,
    LoggingSection, PaperSection, SolanaSection, StorageSection,
};
