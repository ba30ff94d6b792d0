//! Configuration management for Waltz applications
//!
//! This module handles loading, parsing, and validation of configuration files.

use crate::constants::{
    CONFIG_DIR_NAME, CONFIG_FILE_NAME, CONFIG_GENERATED, DEFAULT_APP_NAME, DEFAULT_APP_VERSION, DEFAULT_LOG_LEVEL,
};
use anyhow::{Context, Result};
use log::LevelFilter;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub app: AppConfig,
    pub bus: BusConfig,
    pub lifecycle: LifecycleConfig,
    pub logging: LoggingConfig,
}

/// Application identity
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub name: String,
    pub version: String,
}

/// Message bus configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct BusConfig {
    /// Log every routed envelope at trace level
    pub trace_messages: bool,
}

/// Controller lifecycle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Run a controller's `config` hook as soon as it is registered
    pub configure_on_register: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Write logs to a file in addition to the in-memory buffer
    pub enabled: bool,
    /// Minimum level: "off", "error", "warn", "info", "debug" or "trace"
    pub level: String,
    /// Log file location; defaults to the cache directory
    pub file: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_APP_NAME.to_string(),
            version: DEFAULT_APP_VERSION.to_string(),
        }
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            configure_on_register: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            level: DEFAULT_LOG_LEVEL.to_string(),
            file: None,
        }
    }
}

impl LoggingConfig {
    /// Parse the configured level
    pub fn level_filter(&self) -> Result<LevelFilter> {
        LevelFilter::from_str(&self.level).map_err(|_| anyhow::anyhow!("Invalid log level '{}'", self.level))
    }
}

impl Config {
    /// Load configuration from file or return defaults
    pub fn load() -> Result<Self> {
        let config_path = Self::find_config_file()?;

        if let Some(path) = config_path {
            Self::load_from_file(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Find configuration file in order of precedence
    fn find_config_file() -> Result<Option<PathBuf>> {
        // 1. Check current directory
        let current_dir_config = PathBuf::from(CONFIG_FILE_NAME);
        if current_dir_config.exists() {
            return Ok(Some(current_dir_config));
        }

        // 2. Check XDG config directory
        if let Ok(xdg_config) = Self::get_default_config_path() {
            if xdg_config.exists() {
                return Ok(Some(xdg_config));
            }
        }

        Ok(None)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.app.name.trim().is_empty() {
            anyhow::bail!("app.name cannot be empty");
        }

        if self.app.version.trim().is_empty() {
            anyhow::bail!("app.version cannot be empty");
        }

        self.logging.level_filter()?;

        if let Some(file) = &self.logging.file {
            if file.as_os_str().is_empty() {
                anyhow::bail!("logging.file cannot be an empty path");
            }
        }

        Ok(())
    }

    /// Generate default configuration file
    pub fn generate_default_config<P: AsRef<Path>>(path: P) -> Result<()> {
        let config = Self::default();
        let toml_content = toml::to_string_pretty(&config).context("Failed to serialize default config")?;

        // Add header comment
        let header = format!(
            "# Waltz Configuration File\n# Generated on {}\n\n",
            chrono::Local::now().format("%Y-%m-%d")
        );

        let full_content = header + &toml_content;

        // Ensure the parent directory exists
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
        }

        std::fs::write(&path, full_content)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;

        println!("{}: {}", CONFIG_GENERATED, path.as_ref().display());
        Ok(())
    }

    /// Get the XDG config directory path
    pub fn get_xdg_config_dir() -> Result<PathBuf> {
        dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))
            .map(|dir| dir.join(CONFIG_DIR_NAME))
    }

    /// Get the default config file path
    pub fn get_default_config_path() -> Result<PathBuf> {
        Ok(Self::get_xdg_config_dir()?.join("config.toml"))
    }
}
