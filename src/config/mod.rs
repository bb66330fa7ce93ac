use std::path::{Path, PathBuf};

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

use crate::engine::{default_thread_count, EngineKind};
use crate::session::{GenerationParams, SamplerConfig, SamplingStrategy, SessionConfig};

/// Prefix for environment overrides, e.g. `LLAMABRIDGE_SESSION__CONTEXT_SIZE`
pub const ENV_PREFIX: &str = "LLAMABRIDGE";

/// Which model to load and with which engine
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ModelConfig {
    /// Model file; may also be given on the command line
    pub path: Option<PathBuf>,
    pub engine: EngineKind,
}

/// Decode context sizing
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SessionSettings {
    /// Token capacity of each session
    pub context_size: u32,
    /// Forward-pass threads; unset means hardware threads minus `thread_reserve`
    pub threads: Option<u32>,
    pub thread_reserve: u32,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GenerationConfig {
    /// Maximum number of tokens to generate per reply
    pub max_tokens: u32,
    pub add_bos: bool,
    pub system_prompt: String,
}

/// Configuration for application logging
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
    /// Optional log file path
    pub file: Option<PathBuf>,
}

/// Main settings struct that contains all configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    pub model: ModelConfig,
    pub session: SessionSettings,
    pub sampling: SamplerConfig,
    pub generation: GenerationConfig,
    pub logging: LoggingConfig,
}

impl Settings {
    /// Loads settings in the following order of precedence (highest first):
    /// 1. Environment variables prefixed with `LLAMABRIDGE_`, `__` between levels
    /// 2. `local.toml` in `config_dir`, if present
    /// 3. `default.toml` in `config_dir`, if present
    /// 4. Built-in defaults
    pub fn load(config_dir: &Path) -> Result<Self, ConfigError> {
        let default_config = config_dir.join("default.toml");
        let local_config = config_dir.join("local.toml");

        let settings = Self::defaults()?
            .add_source(File::from(default_config).required(false))
            .add_source(File::from(local_config).required(false))
            .add_source(Environment::with_prefix(ENV_PREFIX).prefix_separator("_").separator("__"))
            .build()?
            .try_deserialize::<Settings>()?;

        settings.validate()?;
        Ok(settings)
    }

    fn defaults() -> Result<config::ConfigBuilder<config::builder::DefaultState>, ConfigError> {
        Config::builder()
            .set_default("model.engine", "reference")?
            .set_default("session.context_size", 2048)?
            .set_default("session.thread_reserve", 2)?
            .set_default("sampling.strategy", "greedy")?
            .set_default("sampling.temperature", 0.8)?
            .set_default("sampling.top_k", 40)?
            .set_default("generation.max_tokens", 256)?
            .set_default("generation.add_bos", true)?
            .set_default("generation.system_prompt", "")?
            .set_default("logging.level", "info")
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session.context_size == 0 {
            return Err(ConfigError::Message("context_size must be greater than 0".to_string()));
        }

        if self.session.threads == Some(0) {
            return Err(ConfigError::Message("threads must be greater than 0 when set".to_string()));
        }

        if self.generation.max_tokens == 0 {
            return Err(ConfigError::Message("max_tokens must be greater than 0".to_string()));
        }

        if self.sampling.strategy == SamplingStrategy::Temperature
            && !(self.sampling.temperature > 0.0 && self.sampling.temperature <= 2.0)
        {
            return Err(ConfigError::Message(format!(
                "Temperature must be in (0.0, 2.0], got: {}",
                self.sampling.temperature
            )));
        }

        match self.logging.level.to_lowercase().as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => Ok(()),
            _ => Err(ConfigError::Message(format!(
                "Invalid logging level: {}. Must be one of: error, warn, info, debug, trace",
                self.logging.level
            ))),
        }?;

        // Create log file directory if configured and doesn't exist
        if let Some(log_file) = &self.logging.file {
            if let Some(parent) = log_file.parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        ConfigError::Message(format!("Failed to create log directory at {}: {}", parent.display(), e))
                    })?;
                }
            }
        }

        Ok(())
    }

    pub fn thread_count(&self) -> u32 {
        self.session
            .threads
            .unwrap_or_else(|| default_thread_count(self.session.thread_reserve))
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig::new(self.session.context_size, self.thread_count()).sampler(self.sampling.clone())
    }

    pub fn generation_params(&self) -> GenerationParams {
        GenerationParams {
            max_tokens: self.generation.max_tokens,
            add_bos: self.generation.add_bos,
        }
    }
}
