//! Configuration management

use anyhow::{Context, Result};
use classpulse_broadcaster::{LocalRelay, RedisRelay, Relay};
use classpulse_metrics::EngineConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Environment variable overriding the config file location
pub const CONFIG_ENV_VAR: &str = "CLASSPULSE_CONFIG";

/// Socket locations (None = platform default from classpulse-paths)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketConfig {
    pub control_socket: Option<PathBuf>,
    pub live_socket: Option<PathBuf>,
}

/// Storage locations (None = platform default from classpulse-paths)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub database_path: Option<PathBuf>,
    pub fallback_log_path: Option<PathBuf>,
}

/// Cross-instance relay for live rooms
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Redis server URL, e.g. `redis://127.0.0.1:6379/`. None keeps rooms
    /// inside this process.
    pub url: Option<String>,
}

impl RelayConfig {
    pub fn build(&self) -> Result<Arc<dyn Relay>> {
        match &self.url {
            None => Ok(Arc::new(LocalRelay::new())),
            Some(url) => {
                let relay = RedisRelay::new(url)
                    .with_context(|| format!("Invalid relay URL {}", url))?;
                Ok(Arc::new(relay))
            }
        }
    }
}

/// How capture processes are launched and stopped
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    /// Executable to launch per device
    pub program: String,

    /// Arguments placed before the generated capture flags
    pub args: Vec<String>,

    pub working_dir: Option<PathBuf>,

    /// Default video source when a request names none (camera index or URL)
    pub video_src: String,

    pub model_path: String,

    /// Minimum face-match confidence for identity assignment
    pub match_thresh: f64,

    /// Emit one record every N frames
    pub log_every: u32,

    /// Grace period after SIGTERM before SIGKILL
    pub stop_timeout_secs: f64,

    /// Bound on waiting for reader threads after process exit
    pub join_timeout_secs: f64,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            program: "python3".to_string(),
            args: vec!["-m".to_string(), "src.emotion_monitor".to_string()],
            working_dir: None,
            video_src: "0".to_string(),
            model_path: "models/emotion_model.pt".to_string(),
            match_thresh: 0.5,
            log_every: 5,
            stop_timeout_secs: 5.0,
            join_timeout_secs: 2.0,
        }
    }
}

impl CaptureSettings {
    /// Falls back to the default when the setting is not a usable duration
    pub fn stop_timeout(&self) -> Duration {
        seconds_or(self.stop_timeout_secs, Self::default().stop_timeout_secs)
    }

    pub fn join_timeout(&self) -> Duration {
        seconds_or(self.join_timeout_secs, Self::default().join_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, secs) in [
            ("stop_timeout_secs", self.stop_timeout_secs),
            ("join_timeout_secs", self.join_timeout_secs),
        ] {
            if Duration::try_from_secs_f64(secs).is_err() {
                anyhow::bail!("capture.{} must be a finite, non-negative number of seconds (got {})", name, secs);
            }
        }
        Ok(())
    }
}

fn seconds_or(secs: f64, default: f64) -> Duration {
    let secs = if secs.is_nan() { default } else { secs.max(0.0) };
    Duration::try_from_secs_f64(secs).unwrap_or_else(|_| Duration::from_secs_f64(default))
}

/// Background minute-aggregate and alert job
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub minutes_back: i64,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60,
            minutes_back: 5,
        }
    }
}

/// Daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Path to configuration file
    #[serde(skip)]
    pub config_path: PathBuf,

    pub sockets: SocketConfig,
    pub storage: StorageConfig,
    pub relay: RelayConfig,
    pub capture: CaptureSettings,
    pub engine: EngineConfig,
    pub aggregator: AggregatorConfig,
}

impl DaemonConfig {
    /// Load configuration from `$CLASSPULSE_CONFIG` or the default path,
    /// writing a default file when none exists
    pub fn load() -> Result<Self> {
        let config_path = std::env::var_os(CONFIG_ENV_VAR)
            .map(PathBuf::from)
            .unwrap_or_else(Self::default_config_path);
        Self::load_from(config_path)
    }

    pub fn load_from(config_path: impl AsRef<Path>) -> Result<Self> {
        let config_path = config_path.as_ref().to_path_buf();

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read config file {}", config_path.display()))?;

            let mut config: DaemonConfig =
                toml::from_str(&contents).context("Failed to parse config file")?;
            config
                .capture
                .validate()
                .with_context(|| format!("Invalid config file {}", config_path.display()))?;

            config.config_path = config_path;
            Ok(config)
        } else {
            let config = Self {
                config_path,
                ..Self::default()
            };
            config.save().context("Failed to save default config")?;
            Ok(config)
        }
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        std::fs::write(&self.config_path, contents).context("Failed to write config file")?;

        Ok(())
    }

    pub fn control_socket_path(&self) -> Result<PathBuf> {
        match &self.sockets.control_socket {
            Some(path) => Ok(path.clone()),
            None => classpulse_paths::get_control_socket_path(),
        }
    }

    pub fn live_socket_path(&self) -> Result<PathBuf> {
        match &self.sockets.live_socket {
            Some(path) => Ok(path.clone()),
            None => classpulse_paths::get_live_socket_path(),
        }
    }

    pub fn database_path(&self) -> Result<PathBuf> {
        match &self.storage.database_path {
            Some(path) => Ok(path.clone()),
            None => classpulse_paths::get_database_path(),
        }
    }

    pub fn fallback_log_path(&self) -> Result<PathBuf> {
        match &self.storage.fallback_log_path {
            Some(path) => Ok(path.clone()),
            None => classpulse_paths::get_fallback_log_path(),
        }
    }

    fn default_config_path() -> PathBuf {
        classpulse_paths::get_config_dir()
            .unwrap_or_else(|_| {
                dirs::config_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("classpulse")
            })
            .join("config.toml")
    }
}
