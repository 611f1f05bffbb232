//! Error types for music-scrobbler

use thiserror::Error;

/// Main error type for the application
#[derive(Error, Debug)]
pub enum Error {
    /// History could not be written or read. This is the one class that is
    /// allowed to stop the scrobbler, since losing it breaks deduplication.
    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("D-Bus error: {0}")]
    DBus(#[from] zbus::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

/// Failure to obtain a snapshot from one player. Transient and per-player.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PollError {
    #[error("poll timed out")]
    Timeout,

    #[error("player unreachable: {0}")]
    Unreachable(String),

    #[error("unexpected player response: {0}")]
    Protocol(String),
}

/// Failure of a single sink to accept a scrobble.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    #[error("delivery timed out")]
    Timeout,

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("rejected by service: {0}")]
    Rejected(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("serialization error: {0}")]
    Serialize(String),
}

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a persistence error
    pub fn persistence(msg: impl Into<String>) -> Self {
        Self::Persistence(msg.into())
    }

    /// Whether this error must stop the poll loop.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Persistence(_) | Self::Config(_))
    }
}

impl From<reqwest::Error> for SinkError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else {
            Self::Http(e.to_string())
        }
    }
}

impl From<std::io::Error> for SinkError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<zbus::Error> for PollError {
    fn from(e: zbus::Error) -> Self {
        Self::Unreachable(e.to_string())
    }
}

impl From<zbus::fdo::Error> for PollError {
    fn from(e: zbus::fdo::Error) -> Self {
        Self::Unreachable(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_persistence_and_config_are_fatal() {
        assert!(Error::persistence("disk full").is_fatal());
        assert!(Error::config("bad").is_fatal());
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        assert!(!Error::from(io).is_fatal());
    }

    #[test]
    fn test_fdo_errors_map_to_unreachable() {
        let err = PollError::from(zbus::fdo::Error::ServiceUnknown("org.mpris.x".into()));
        assert!(matches!(err, PollError::Unreachable(_)), "{err}");
    }
}
