//! Configuration management for music-scrobbler

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::controller::ControllerConfig;
use crate::engine::{EngineConfig, ABSOLUTE_THRESHOLD};
use crate::error::{Error, Result};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Poll loop timing
    pub polling: PollingConfig,

    /// Scrobble thresholds
    pub scrobbling: ScrobblingConfig,

    /// Player filtering
    pub players: PlayerConfig,

    /// Where scrobbles go
    pub sinks: SinksConfig,
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,

    /// Data directory (default: ~/.local/share/music-scrobbler)
    pub data_dir: Option<PathBuf>,
}

/// Poll loop timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    /// Seconds between ticks
    pub interval_seconds: u64,

    /// Upper bound on a single player poll
    pub poll_timeout_seconds: u64,

    /// Seconds between player rediscovery
    pub rediscovery_interval_seconds: u64,
}

/// Scrobble decision settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScrobblingConfig {
    /// Percentage of a track (0-100) that must be watched
    pub threshold_percent: f64,

    /// Seconds before the same track may be scrobbled again on a player
    pub duplicate_window_seconds: u64,

    /// Largest gap between polls credited as watch time
    pub max_accrual_seconds: u64,

    /// How often in-progress watch time is written to disk
    pub progress_persist_seconds: u64,
}

/// Player filtering configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    /// Whitelist of player ids (empty = all players)
    pub whitelist: Vec<String>,

    /// Blacklist of player ids
    pub blacklist: Vec<String>,
}

/// Sink configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SinksConfig {
    /// Upper bound on one delivery to one sink
    pub delivery_timeout_seconds: u64,

    pub log: LogSinkConfig,
    pub lastfm: LastFmConfig,
    pub listenbrainz: ListenBrainzConfig,
}

/// Output format of the local scrobble log
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Jsonl,
    Text,
}

impl std::str::FromStr for LogFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "jsonl" | "json" => Ok(Self::Jsonl),
            "text" | "txt" => Ok(Self::Text),
            other => Err(Error::config(format!(
                "log format must be 'jsonl' or 'text', got '{other}'"
            ))),
        }
    }
}

/// Local append-only log
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSinkConfig {
    pub enabled: bool,

    /// Log file (default: <data_dir>/scribbles.jsonl)
    pub path: Option<PathBuf>,

    pub format: LogFormat,

    /// Also report each logged scrobble on the console
    pub stdout: bool,
}

/// Last.fm
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LastFmConfig {
    pub enabled: bool,
    pub api_key: String,
    pub api_secret: String,
    pub session_key: String,
}

/// ListenBrainz
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenBrainzConfig {
    pub enabled: bool,
    pub token: String,
    pub api_url: String,
}

// Default implementations

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            data_dir: None,
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 1,
            poll_timeout_seconds: 5,
            rediscovery_interval_seconds: 10,
        }
    }
}

impl Default for ScrobblingConfig {
    fn default() -> Self {
        Self {
            threshold_percent: 25.0,
            duplicate_window_seconds: 1800,
            max_accrual_seconds: 60,
            progress_persist_seconds: 15,
        }
    }
}

impl Default for SinksConfig {
    fn default() -> Self {
        Self {
            delivery_timeout_seconds: 10,
            log: LogSinkConfig::default(),
            lastfm: LastFmConfig::default(),
            listenbrainz: ListenBrainzConfig::default(),
        }
    }
}

impl Default for LogSinkConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
            format: LogFormat::Jsonl,
            stdout: true,
        }
    }
}

impl Default for ListenBrainzConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            token: String::new(),
            api_url: "https://api.listenbrainz.org".to_string(),
        }
    }
}

/// Values given on the command line or through the environment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigOverrides {
    pub interval_seconds: Option<u64>,
    pub threshold_percent: Option<f64>,
    pub rediscovery_interval_seconds: Option<u64>,
    pub log_format: Option<LogFormat>,
    pub log_path: Option<PathBuf>,
}

impl Config {
    /// Apply overrides on top of the file configuration.
    ///
    /// The threshold is clamped to 0-100 here; everything else is left to
    /// [`validate`](Self::validate).
    pub fn apply(&mut self, overrides: &ConfigOverrides) {
        if let Some(interval) = overrides.interval_seconds {
            self.polling.interval_seconds = interval;
        }
        if let Some(percent) = overrides.threshold_percent {
            self.scrobbling.threshold_percent = percent.clamp(0.0, 100.0);
        }
        if let Some(rediscovery) = overrides.rediscovery_interval_seconds {
            self.polling.rediscovery_interval_seconds = rediscovery;
        }
        if let Some(format) = overrides.log_format {
            self.sinks.log.format = format;
        }
        if let Some(ref path) = overrides.log_path {
            self.sinks.log.path = Some(path.clone());
        }
    }

    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path)?;
            let config: Self = toml::from_str(&contents)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to the default location
    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path()?;

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, contents)?;
        Ok(())
    }

    /// Get the configuration directory
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| Error::config("Could not determine config directory"))?;
        Ok(config_dir.join(crate::APP_NAME))
    }

    /// Get the default configuration file path
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Get the data directory
    pub fn data_dir(&self) -> Result<PathBuf> {
        if let Some(ref dir) = self.general.data_dir {
            Ok(dir.clone())
        } else {
            let data_dir = dirs::data_local_dir()
                .ok_or_else(|| Error::config("Could not determine data directory"))?;
            Ok(data_dir.join(crate::APP_NAME))
        }
    }

    /// Get the scrobble history path
    pub fn history_path(&self) -> Result<PathBuf> {
        Ok(self.data_dir()?.join("history.json"))
    }

    /// Get the local scrobble log path
    pub fn log_path(&self) -> Result<PathBuf> {
        if let Some(ref path) = self.sinks.log.path {
            return Ok(path.clone());
        }
        Ok(self.data_dir()?.join("scribbles.jsonl"))
    }

    /// Engine settings derived from this configuration.
    #[must_use]
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            threshold_percent: self.scrobbling.threshold_percent,
            absolute_threshold: ABSOLUTE_THRESHOLD,
            duplicate_window: Duration::from_secs(self.scrobbling.duplicate_window_seconds),
            max_accrual: Duration::from_secs(self.scrobbling.max_accrual_seconds),
        }
    }

    /// Poll loop settings derived from this configuration.
    #[must_use]
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            interval: Duration::from_secs(self.polling.interval_seconds),
            poll_timeout: Duration::from_secs(self.polling.poll_timeout_seconds),
            rediscovery_interval: Duration::from_secs(self.polling.rediscovery_interval_seconds),
            progress_persist_interval: Duration::from_secs(
                self.scrobbling.progress_persist_seconds,
            ),
        }
    }

    /// Validate configuration values.
    ///
    /// Call this after loading (and after applying CLI overrides); any error
    /// here is fatal at startup.
    pub fn validate(&self) -> Result<()> {
        if self.polling.interval_seconds == 0 {
            return Err(Error::config("polling.interval_seconds must be greater than 0"));
        }

        if self.polling.poll_timeout_seconds == 0 {
            return Err(Error::config(
                "polling.poll_timeout_seconds must be greater than 0",
            ));
        }

        if !(0.0..=100.0).contains(&self.scrobbling.threshold_percent) {
            return Err(Error::config(format!(
                "scrobbling.threshold_percent must be between 0 and 100, got {}",
                self.scrobbling.threshold_percent
            )));
        }

        // A tick can start up to one poll timeout late; that gap is still play.
        let longest_gap = self
            .polling
            .interval_seconds
            .saturating_add(self.polling.poll_timeout_seconds);
        if self.scrobbling.max_accrual_seconds < longest_gap {
            return Err(Error::config(format!(
                "scrobbling.max_accrual_seconds must be at least interval_seconds + \
                 poll_timeout_seconds ({longest_gap}), got {}",
                self.scrobbling.max_accrual_seconds
            )));
        }

        if self.sinks.delivery_timeout_seconds == 0 {
            return Err(Error::config(
                "sinks.delivery_timeout_seconds must be greater than 0",
            ));
        }

        let lastfm = &self.sinks.lastfm;
        if lastfm.enabled {
            for (field, value) in [
                ("api_key", &lastfm.api_key),
                ("api_secret", &lastfm.api_secret),
                ("session_key", &lastfm.session_key),
            ] {
                if value.is_empty() {
                    return Err(Error::config(format!(
                        "sinks.lastfm.{field} is required when Last.fm is enabled"
                    )));
                }
            }
        }

        let lb = &self.sinks.listenbrainz;
        if lb.enabled {
            if lb.token.is_empty() {
                return Err(Error::config(
                    "sinks.listenbrainz.token is required when ListenBrainz is enabled",
                ));
            }
            if lb.api_url.is_empty() {
                return Err(Error::config("sinks.listenbrainz.api_url is required"));
            }
        }

        // Validate log_level is a known level
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.general.log_level.to_lowercase().as_str()) {
            return Err(Error::config(format!(
                "log_level must be one of {:?}, got '{}'",
                valid_levels, self.general.log_level
            )));
        }

        Ok(())
    }
}
