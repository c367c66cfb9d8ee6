//! Configuration module for the measurement engine and daemon.
//!
//! Handles loading, saving, and validating the engine configuration.

use crate::error::ConfigError;
use crate::executor::{ShellExecutor, DEFAULT_COMMAND_TIMEOUT};
use crate::history::HISTORY_CAPACITY;
use crate::resolver::{DEFAULT_COUNTER_COMMAND, DEFAULT_SEARCH_ROOTS, WELL_KNOWN_COUNTER_PATHS};
use crate::sampler::DEFAULT_FRAME_REPORT_COMMAND;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

/// Monitor tick cadence when none is configured.
pub const DEFAULT_REFRESH_INTERVAL_MS: u64 = 1000;

/// Bounds on the monitor tick cadence.
pub const MIN_REFRESH_INTERVAL_MS: u64 = 16;
pub const MAX_REFRESH_INTERVAL_MS: u64 = 60_000;

/// Bounds on the per-command deadline of the shell session.
pub const MIN_COMMAND_TIMEOUT_MS: u64 = 100;
pub const MAX_COMMAND_TIMEOUT_MS: u64 = 60_000;

/// Nominal rate of the software vsync source.
pub const DEFAULT_SOFTWARE_VSYNC_HZ: u32 = 60;
pub const MAX_SOFTWARE_VSYNC_HZ: u32 = 1000;

pub const MAX_HISTORY_CAPACITY: usize = 10_000;

/// Engine configuration.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub refresh_interval_ms: u64,
    pub frame_report_command: String,
    pub counter_command: String,
    pub counter_paths: Vec<String>,
    pub search_roots: Vec<String>,
    pub shell: String,
    pub command_timeout_ms: u64,
    pub software_vsync_hz: u32,
    pub history_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            refresh_interval_ms: DEFAULT_REFRESH_INTERVAL_MS,
            frame_report_command: DEFAULT_FRAME_REPORT_COMMAND.to_string(),
            counter_command: DEFAULT_COUNTER_COMMAND.to_string(),
            counter_paths: WELL_KNOWN_COUNTER_PATHS.iter().map(|p| p.to_string()).collect(),
            search_roots: DEFAULT_SEARCH_ROOTS.iter().map(|p| p.to_string()).collect(),
            shell: ShellExecutor::default_shell().to_string(),
            command_timeout_ms: DEFAULT_COMMAND_TIMEOUT.as_millis() as u64,
            software_vsync_hz: DEFAULT_SOFTWARE_VSYNC_HZ,
            history_capacity: HISTORY_CAPACITY,
        }
    }
}

impl EngineConfig {
    /// Validate configuration values.
    /// Returns Ok(()) if valid, Err with descriptive message if invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_REFRESH_INTERVAL_MS..=MAX_REFRESH_INTERVAL_MS).contains(&self.refresh_interval_ms)
        {
            return Err(ConfigError::ValidationError(format!(
                "refresh_interval_ms ({}) must be within {}..={}",
                self.refresh_interval_ms, MIN_REFRESH_INTERVAL_MS, MAX_REFRESH_INTERVAL_MS
            )));
        }

        if self.counter_paths.is_empty() {
            return Err(ConfigError::ValidationError(
                "counter_paths must list at least one file".to_string(),
            ));
        }

        if let Some(path) = self
            .counter_paths
            .iter()
            .chain(self.search_roots.iter())
            .find(|p| !p.starts_with('/'))
        {
            return Err(ConfigError::ValidationError(format!(
                "path '{}' must be absolute",
                path
            )));
        }

        if self.frame_report_command.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "frame_report_command must not be empty".to_string(),
            ));
        }

        if self.shell.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "shell must not be empty".to_string(),
            ));
        }

        if !(MIN_COMMAND_TIMEOUT_MS..=MAX_COMMAND_TIMEOUT_MS).contains(&self.command_timeout_ms) {
            return Err(ConfigError::ValidationError(format!(
                "command_timeout_ms ({}) must be within {}..={}",
                self.command_timeout_ms, MIN_COMMAND_TIMEOUT_MS, MAX_COMMAND_TIMEOUT_MS
            )));
        }

        if self.software_vsync_hz == 0 || self.software_vsync_hz > MAX_SOFTWARE_VSYNC_HZ {
            return Err(ConfigError::ValidationError(format!(
                "software_vsync_hz ({}) must be within 1..={}",
                self.software_vsync_hz, MAX_SOFTWARE_VSYNC_HZ
            )));
        }

        if self.history_capacity == 0 || self.history_capacity > MAX_HISTORY_CAPACITY {
            return Err(ConfigError::ValidationError(format!(
                "history_capacity ({}) must be within 1..={}",
                self.history_capacity, MAX_HISTORY_CAPACITY
            )));
        }

        Ok(())
    }
}

/// Configuration manager with file I/O.
pub struct ConfigManager {
    config: RwLock<EngineConfig>,
    path: PathBuf,
}

impl ConfigManager {
    /// Load configuration from file or use defaults.
    /// If the file doesn't exist, returns a manager with default config.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        let config = if path.exists() {
            let contents = fs::read_to_string(path).map_err(|e| {
                ConfigError::ParseError(format!("Failed to read config file: {}", e))
            })?;

            let config: EngineConfig = serde_json::from_str(&contents)
                .map_err(|e| ConfigError::ParseError(format!("Invalid JSON: {}", e)))?;

            config.validate()?;
            config
        } else {
            EngineConfig::default()
        };

        Ok(Self {
            config: RwLock::new(config),
            path: path.to_path_buf(),
        })
    }

    /// Save configuration to file using atomic write.
    pub fn save(&self) -> Result<(), ConfigError> {
        let config = self.config.read().map_err(|_| {
            ConfigError::ValidationError("Failed to acquire read lock".to_string())
        })?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Write to a temp file, then rename over the real one
        let temp_path = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(&*config)
            .map_err(|e| ConfigError::ParseError(format!("Failed to serialize config: {}", e)))?;

        {
            let mut file = fs::File::create(&temp_path)?;
            file.write_all(json.as_bytes())?;
            file.sync_all()?;
        }

        fs::rename(&temp_path, &self.path)?;

        Ok(())
    }

    /// Get current configuration.
    pub fn get(&self) -> EngineConfig {
        self.config
            .read()
            .map(|c| c.clone())
            .unwrap_or_else(|_| EngineConfig::default())
    }

    /// Update configuration with validation, then persist it.
    pub fn update(&self, config: EngineConfig) -> Result<(), ConfigError> {
        config.validate()?;

        let mut current = self.config.write().map_err(|_| {
            ConfigError::ValidationError("Failed to acquire write lock".to_string())
        })?;
        *current = config;
        drop(current);

        self.save()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Default config path (`<config_dir>/fps-probe/config.json`).
    pub fn default_path() -> PathBuf {
        config_dir().join("config.json")
    }
}

fn config_dir() -> PathBuf {
    dirs::config_dir()
        .map(|dir| dir.join("fps-probe"))
        .unwrap_or_else(|| PathBuf::from("/tmp/fps-probe"))
}
